//! Typed device options.
//!
//! A SANE backend describes its options at runtime: each slot in the option
//! table has a value type, a unit, a byte size, capability flags and an
//! optional constraint. This module reflects those descriptors into a closed
//! [`DeviceOption`] enum so the rest of the crate can match on the kind of
//! option instead of poking at raw words.
//!
//! Values travel to and from the backend through the explicit binary codec in
//! [`codec`]. The well-known option identifiers and their "best for preview"
//! values live in [`standard`].

pub mod codec;
pub mod standard;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::{OptionDescriptor, RawConstraint};
use crate::error::{Result, SaneError};

pub use codec::{fixed_to_f64, f64_to_fixed, WireValue, WORD_SIZE};
pub use standard::StandardOption;

// =============================================================================
// Capabilities, units and value types
// =============================================================================

/// Capability bit set of an option (`SANE_CAP_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const SOFT_SELECT: u32 = 1 << 0;
    pub const HARD_SELECT: u32 = 1 << 1;
    pub const SOFT_DETECT: u32 = 1 << 2;
    pub const EMULATED: u32 = 1 << 3;
    pub const AUTOMATIC: u32 = 1 << 4;
    pub const INACTIVE: u32 = 1 << 5;
    pub const ADVANCED: u32 = 1 << 6;

    fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// Settable from software.
    pub fn is_settable(&self) -> bool {
        self.has(Self::SOFT_SELECT)
    }

    /// Only settable with a physical switch on the device.
    pub fn is_hardware_settable(&self) -> bool {
        self.has(Self::HARD_SELECT)
    }

    /// The current value can be read.
    pub fn is_readable(&self) -> bool {
        self.has(Self::SOFT_DETECT)
    }

    pub fn is_emulated(&self) -> bool {
        self.has(Self::EMULATED)
    }

    /// The backend can pick a value on its own (the "auto" pseudo-value).
    pub fn supports_auto(&self) -> bool {
        self.has(Self::AUTOMATIC)
    }

    pub fn is_active(&self) -> bool {
        !self.has(Self::INACTIVE)
    }

    pub fn is_advanced(&self) -> bool {
        self.has(Self::ADVANCED)
    }
}

/// Physical unit of an option value (`SANE_Unit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    None,
    Pixel,
    Bit,
    Millimeter,
    Dpi,
    Percent,
    Microsecond,
}

impl Unit {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Unit::Pixel,
            2 => Unit::Bit,
            3 => Unit::Millimeter,
            4 => Unit::Dpi,
            5 => Unit::Percent,
            6 => Unit::Microsecond,
            _ => Unit::None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Unit::None => 0,
            Unit::Pixel => 1,
            Unit::Bit => 2,
            Unit::Millimeter => 3,
            Unit::Dpi => 4,
            Unit::Percent => 5,
            Unit::Microsecond => 6,
        }
    }

    /// Suffix used when rendering a value, empty for unitless options.
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Pixel => "px",
            Unit::Bit => "bit",
            Unit::Millimeter => "mm",
            Unit::Dpi => "dpi",
            Unit::Percent => "%",
            Unit::Microsecond => "µs",
        }
    }
}

/// Value type of an option slot (`SANE_Value_Type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Int,
    Fixed,
    String,
    Button,
    Group,
}

impl ValueType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ValueType::Bool),
            1 => Some(ValueType::Int),
            2 => Some(ValueType::Fixed),
            3 => Some(ValueType::String),
            4 => Some(ValueType::Button),
            5 => Some(ValueType::Group),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ValueType::Bool => 0,
            ValueType::Int => 1,
            ValueType::Fixed => 2,
            ValueType::String => 3,
            ValueType::Button => 4,
            ValueType::Group => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Fixed => "fixed",
            ValueType::String => "string",
            ValueType::Button => "button",
            ValueType::Group => "group",
        }
    }
}

// =============================================================================
// Constraints
// =============================================================================

/// Allowed values of an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint<T> {
    None,
    Range { min: T, max: T },
    SteppedRange { min: T, max: T, step: T },
    List(Vec<T>),
}

impl<T: PartialEq> Constraint<T> {
    /// True when the constraint admits exactly one value, which makes the
    /// option effectively read-only even if it is flagged settable.
    pub fn has_single_value(&self) -> bool {
        match self {
            Constraint::None => false,
            Constraint::Range { min, max } | Constraint::SteppedRange { min, max, .. } => {
                min == max
            }
            Constraint::List(values) => values.len() == 1,
        }
    }
}

impl<T: fmt::Display> Constraint<T> {
    /// Short human description such as `"1..600 (step 1)"` or `"Color, Gray"`.
    pub fn describe(&self, unit: Unit) -> Option<String> {
        let suffix = match unit {
            Unit::None => String::new(),
            unit => format!(" {}", unit.suffix()),
        };
        match self {
            Constraint::None => None,
            Constraint::Range { min, max } => Some(format!("{}..{}{}", min, max, suffix)),
            Constraint::SteppedRange { min, max, step } => {
                Some(format!("{}..{}{} (step {})", min, max, suffix, step))
            }
            Constraint::List(values) => Some(
                values
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        }
    }
}

impl Constraint<i32> {
    fn from_raw(raw: &RawConstraint) -> Self {
        match raw {
            RawConstraint::Range { min, max, quant } if *quant > 0 => Constraint::SteppedRange {
                min: *min,
                max: *max,
                step: *quant,
            },
            RawConstraint::Range { min, max, .. } => Constraint::Range {
                min: *min,
                max: *max,
            },
            RawConstraint::WordList(words) => Constraint::List(words.clone()),
            _ => Constraint::None,
        }
    }

    /// Value allowed by the constraint that is closest to `target`.
    pub fn closest(&self, target: i32) -> i32 {
        match self {
            Constraint::None => target,
            Constraint::Range { min, max } => target.clamp(*min, (*max).max(*min)),
            Constraint::SteppedRange { min, max, step } => {
                let clamped = target.clamp(*min, (*max).max(*min));
                if *step <= 0 {
                    return clamped;
                }
                let steps = (clamped - min + step / 2) / step;
                (min + steps * step).min(*max)
            }
            Constraint::List(values) => values
                .iter()
                .copied()
                .min_by_key(|v| (i64::from(*v) - i64::from(target)).abs())
                .unwrap_or(target),
        }
    }

    pub fn min(&self) -> Option<i32> {
        match self {
            Constraint::None => None,
            Constraint::Range { min, .. } | Constraint::SteppedRange { min, .. } => Some(*min),
            Constraint::List(values) => values.iter().copied().min(),
        }
    }

    pub fn max(&self) -> Option<i32> {
        match self {
            Constraint::None => None,
            Constraint::Range { max, .. } | Constraint::SteppedRange { max, .. } => Some(*max),
            Constraint::List(values) => values.iter().copied().max(),
        }
    }
}

impl Constraint<f64> {
    fn from_raw(raw: &RawConstraint) -> Self {
        match raw {
            RawConstraint::Range { min, max, quant } if *quant > 0 => Constraint::SteppedRange {
                min: fixed_to_f64(*min),
                max: fixed_to_f64(*max),
                step: fixed_to_f64(*quant),
            },
            RawConstraint::Range { min, max, .. } => Constraint::Range {
                min: fixed_to_f64(*min),
                max: fixed_to_f64(*max),
            },
            RawConstraint::WordList(words) => {
                Constraint::List(words.iter().copied().map(fixed_to_f64).collect())
            }
            _ => Constraint::None,
        }
    }

    pub fn closest(&self, target: f64) -> f64 {
        match self {
            Constraint::None => target,
            Constraint::Range { min, max } => target.clamp(*min, max.max(*min)),
            Constraint::SteppedRange { min, max, step } => {
                let clamped = target.clamp(*min, max.max(*min));
                if *step <= 0.0 {
                    return clamped;
                }
                let steps = ((clamped - min) / step).round();
                (min + steps * step).min(*max)
            }
            Constraint::List(values) => values
                .iter()
                .copied()
                .min_by(|a, b| (a - target).abs().total_cmp(&(b - target).abs()))
                .unwrap_or(target),
        }
    }

    pub fn min(&self) -> Option<f64> {
        match self {
            Constraint::None => None,
            Constraint::Range { min, .. } | Constraint::SteppedRange { min, .. } => Some(*min),
            Constraint::List(values) => values.iter().copied().min_by(f64::total_cmp),
        }
    }

    pub fn max(&self) -> Option<f64> {
        match self {
            Constraint::None => None,
            Constraint::Range { max, .. } | Constraint::SteppedRange { max, .. } => Some(*max),
            Constraint::List(values) => values.iter().copied().max_by(f64::total_cmp),
        }
    }
}

impl Constraint<String> {
    fn from_raw(raw: &RawConstraint) -> Self {
        match raw {
            RawConstraint::StringList(values) => Constraint::List(values.clone()),
            _ => Constraint::None,
        }
    }
}

// =============================================================================
// Option variants
// =============================================================================

/// Fields shared by every option kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionInfo {
    /// Position in the device's option table. Slot 0 holds the option count.
    pub index: usize,
    /// Stable key such as `"resolution"`; group options usually have none.
    pub identifier: Option<String>,
    pub title: String,
    pub description: String,
    pub capabilities: Capabilities,
    pub unit: Unit,
    /// Declared byte width of the value buffer.
    pub size: usize,
}

/// An option that carries a value of type `T`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedOption<T> {
    pub info: OptionInfo,
    pub value: T,
    pub constraint: Constraint<T>,
}

/// One entry of a device's option table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceOption {
    Bool(TypedOption<bool>),
    Int(TypedOption<i32>),
    Fixed(TypedOption<f64>),
    String(TypedOption<String>),
    Button(OptionInfo),
    Group(OptionInfo),
}

/// A concrete value read from or written to an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptionValue {
    Bool(bool),
    Int(i32),
    Fixed(f64),
    String(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{}", if *v { "yes" } else { "no" }),
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Fixed(v) => write!(f, "{:.2}", v),
            OptionValue::String(v) => f.write_str(v),
        }
    }
}

impl OptionValue {
    /// Parse user input (CLI) against the option it is meant for.
    pub fn parse_for(option: &DeviceOption, input: &str) -> Result<Self> {
        let invalid = || SaneError::InvalidValue(format!("cannot parse {:?}", input));
        match option {
            DeviceOption::Bool(_) => match input.to_ascii_lowercase().as_str() {
                "1" | "yes" | "true" | "on" => Ok(OptionValue::Bool(true)),
                "0" | "no" | "false" | "off" => Ok(OptionValue::Bool(false)),
                _ => Err(invalid()),
            },
            DeviceOption::Int(_) => input
                .trim()
                .parse()
                .map(OptionValue::Int)
                .map_err(|_| invalid()),
            DeviceOption::Fixed(_) => input
                .trim()
                .parse()
                .map(OptionValue::Fixed)
                .map_err(|_| invalid()),
            DeviceOption::String(_) => Ok(OptionValue::String(input.to_string())),
            DeviceOption::Button(_) | DeviceOption::Group(_) => Err(invalid()),
        }
    }

    /// Numeric view used for crop geometry.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Int(v) => Some(f64::from(*v)),
            OptionValue::Fixed(v) => Some(*v),
            _ => None,
        }
    }
}

/// What to write into an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NewValue {
    Value(OptionValue),
    /// Let the backend choose (`SANE_ACTION_SET_AUTO`).
    Auto,
}

impl From<OptionValue> for NewValue {
    fn from(value: OptionValue) -> Self {
        NewValue::Value(value)
    }
}

impl DeviceOption {
    /// Build a typed option from a backend descriptor.
    ///
    /// Values start at their type's default and are filled in by the
    /// session when it refreshes the option list. Returns `None` for a value
    /// type this crate does not know.
    pub fn from_descriptor(index: usize, descriptor: &OptionDescriptor) -> Option<Self> {
        let info = OptionInfo {
            index,
            identifier: descriptor
                .name
                .as_ref()
                .filter(|name| !name.is_empty())
                .cloned(),
            title: descriptor.title.clone().unwrap_or_default(),
            description: descriptor.description.clone().unwrap_or_default(),
            capabilities: Capabilities(descriptor.capabilities),
            unit: Unit::from_code(descriptor.unit),
            size: descriptor.size.max(0) as usize,
        };

        let option = match ValueType::from_code(descriptor.value_type)? {
            ValueType::Bool => DeviceOption::Bool(TypedOption {
                info,
                value: false,
                constraint: Constraint::None,
            }),
            ValueType::Int => DeviceOption::Int(TypedOption {
                info,
                value: 0,
                constraint: Constraint::<i32>::from_raw(&descriptor.constraint),
            }),
            ValueType::Fixed => DeviceOption::Fixed(TypedOption {
                info,
                value: 0.0,
                constraint: Constraint::<f64>::from_raw(&descriptor.constraint),
            }),
            ValueType::String => DeviceOption::String(TypedOption {
                info,
                value: String::new(),
                constraint: Constraint::<String>::from_raw(&descriptor.constraint),
            }),
            ValueType::Button => DeviceOption::Button(info),
            ValueType::Group => DeviceOption::Group(info),
        };
        Some(option)
    }

    pub fn info(&self) -> &OptionInfo {
        match self {
            DeviceOption::Bool(o) => &o.info,
            DeviceOption::Int(o) => &o.info,
            DeviceOption::Fixed(o) => &o.info,
            DeviceOption::String(o) => &o.info,
            DeviceOption::Button(info) | DeviceOption::Group(info) => info,
        }
    }

    pub fn index(&self) -> usize {
        self.info().index
    }

    pub fn identifier(&self) -> Option<&str> {
        self.info().identifier.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.info().title
    }

    pub fn capabilities(&self) -> Capabilities {
        self.info().capabilities
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            DeviceOption::Bool(_) => ValueType::Bool,
            DeviceOption::Int(_) => ValueType::Int,
            DeviceOption::Fixed(_) => ValueType::Fixed,
            DeviceOption::String(_) => ValueType::String,
            DeviceOption::Button(_) => ValueType::Button,
            DeviceOption::Group(_) => ValueType::Group,
        }
    }

    /// Does this option match a well-known identifier.
    pub fn is(&self, standard: StandardOption) -> bool {
        self.identifier() == Some(standard.identifier())
    }

    /// Current cached value; `None` for buttons and groups.
    pub fn value(&self) -> Option<OptionValue> {
        match self {
            DeviceOption::Bool(o) => Some(OptionValue::Bool(o.value)),
            DeviceOption::Int(o) => Some(OptionValue::Int(o.value)),
            DeviceOption::Fixed(o) => Some(OptionValue::Fixed(o.value)),
            DeviceOption::String(o) => Some(OptionValue::String(o.value.clone())),
            DeviceOption::Button(_) | DeviceOption::Group(_) => None,
        }
    }

    /// Replace the cached value. The variant must match the option kind.
    pub fn set_cached_value(&mut self, value: OptionValue) -> Result<()> {
        match (self, value) {
            (DeviceOption::Bool(o), OptionValue::Bool(v)) => o.value = v,
            (DeviceOption::Int(o), OptionValue::Int(v)) => o.value = v,
            (DeviceOption::Fixed(o), OptionValue::Fixed(v)) => o.value = v,
            (DeviceOption::String(o), OptionValue::String(v)) => o.value = v,
            (option, value) => {
                return Err(SaneError::InvalidValue(format!(
                    "{:?} does not fit a {} option",
                    value,
                    option.value_type().as_str()
                )))
            }
        }
        Ok(())
    }

    /// Settable, active and not pinned to a single allowed value.
    pub fn is_editable(&self) -> bool {
        let caps = self.capabilities();
        if !caps.is_settable() || !caps.is_active() {
            return false;
        }
        match self {
            DeviceOption::Int(o) => !o.constraint.has_single_value(),
            DeviceOption::Fixed(o) => !o.constraint.has_single_value(),
            DeviceOption::String(o) => !o.constraint.has_single_value(),
            DeviceOption::Group(_) => false,
            _ => true,
        }
    }

    /// Encode `value` into a buffer of exactly the declared option size.
    pub fn encode_value(&self, value: &OptionValue) -> Result<Vec<u8>> {
        let size = self.info().size;
        match (self, value) {
            (DeviceOption::Bool(_), OptionValue::Bool(v)) => v.encode(size),
            (DeviceOption::Int(_), OptionValue::Int(v)) => v.encode(size),
            (DeviceOption::Fixed(_), OptionValue::Fixed(v)) => v.encode(size),
            // Integers are accepted for fixed options and widened.
            (DeviceOption::Fixed(_), OptionValue::Int(v)) => f64::from(*v).encode(size),
            (DeviceOption::String(_), OptionValue::String(v)) => v.encode(size),
            (option, value) => Err(SaneError::InvalidValue(format!(
                "{:?} does not fit a {} option",
                value,
                option.value_type().as_str()
            ))),
        }
    }

    /// Decode a value buffer read from the backend.
    pub fn decode_value(&self, bytes: &[u8]) -> Result<OptionValue> {
        match self {
            DeviceOption::Bool(_) => bool::decode(bytes).map(OptionValue::Bool),
            DeviceOption::Int(_) => i32::decode(bytes).map(OptionValue::Int),
            DeviceOption::Fixed(_) => f64::decode(bytes).map(OptionValue::Fixed),
            DeviceOption::String(_) => String::decode(bytes).map(OptionValue::String),
            DeviceOption::Button(_) => Err(SaneError::InvalidOperationForOptionKind {
                action: "read",
                kind: "button",
            }),
            DeviceOption::Group(_) => Err(SaneError::InvalidOperationForOptionKind {
                action: "read",
                kind: "group",
            }),
        }
    }

    /// Value rendered with its unit, e.g. `"300 dpi"`.
    pub fn localized_value(&self) -> String {
        let value = match self.value() {
            Some(value) => value.to_string(),
            None => return String::new(),
        };
        match self.info().unit {
            Unit::None => value,
            Unit::Percent => format!("{}%", value),
            unit => format!("{} {}", value, unit.suffix()),
        }
    }

    /// Human description of the allowed values, if constrained.
    pub fn constraint_description(&self) -> Option<String> {
        let unit = self.info().unit;
        match self {
            DeviceOption::Int(o) => o.constraint.describe(unit),
            DeviceOption::Fixed(o) => o.constraint.describe(unit),
            DeviceOption::String(o) => o.constraint.describe(Unit::None),
            _ => None,
        }
    }
}

/// A group option with the options that follow it in the table.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionGroup {
    /// `None` for options that appear before the first group.
    pub group: Option<OptionInfo>,
    pub options: Vec<DeviceOption>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn descriptor(value_type: ValueType, constraint: RawConstraint) -> OptionDescriptor {
        OptionDescriptor {
            name: Some("resolution".to_string()),
            title: Some("Scan resolution".to_string()),
            description: Some("Sets the resolution of the scanned image.".to_string()),
            value_type: value_type.code(),
            unit: Unit::Dpi.code(),
            size: 4,
            capabilities: Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT,
            constraint,
        }
    }

    #[test]
    fn test_int_descriptor_with_quant_becomes_stepped_range() {
        let option = DeviceOption::from_descriptor(
            3,
            &descriptor(
                ValueType::Int,
                RawConstraint::Range {
                    min: 50,
                    max: 1200,
                    quant: 25,
                },
            ),
        )
        .unwrap();

        match &option {
            DeviceOption::Int(o) => {
                assert_eq!(
                    o.constraint,
                    Constraint::SteppedRange {
                        min: 50,
                        max: 1200,
                        step: 25
                    }
                );
                assert_eq!(o.info.index, 3);
                assert_eq!(o.info.unit, Unit::Dpi);
            }
            other => panic!("unexpected option {:?}", other),
        }
        assert!(option.is(StandardOption::Resolution));
        assert!(option.is_editable());
    }

    #[test]
    fn test_fixed_descriptor_converts_range_words() {
        let option = DeviceOption::from_descriptor(
            1,
            &descriptor(
                ValueType::Fixed,
                RawConstraint::Range {
                    min: 0,
                    max: f64_to_fixed(215.9),
                    quant: 0,
                },
            ),
        )
        .unwrap();
        match option {
            DeviceOption::Fixed(o) => match o.constraint {
                Constraint::Range { min, max } => {
                    assert_eq!(min, 0.0);
                    assert!((max - 215.9).abs() < 0.001);
                }
                other => panic!("unexpected constraint {:?}", other),
            },
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn test_unknown_value_type_is_skipped() {
        let mut desc = descriptor(ValueType::Int, RawConstraint::None);
        desc.value_type = 42;
        assert!(DeviceOption::from_descriptor(1, &desc).is_none());
    }

    #[test]
    fn test_single_value_constraint_is_not_editable() {
        let option = DeviceOption::Int(TypedOption {
            info: OptionInfo {
                index: 1,
                identifier: Some("depth".into()),
                title: "Depth".into(),
                description: String::new(),
                capabilities: Capabilities(Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT),
                unit: Unit::Bit,
                size: 4,
            },
            value: 8,
            constraint: Constraint::List(vec![8]),
        });
        assert!(!option.is_editable());
        assert_eq!(option.localized_value(), "8 bit");
    }

    #[test]
    fn test_closest_value_in_constraints() {
        assert_eq!(Constraint::List(vec![75, 100, 300, 600]).closest(150), 100);
        assert_eq!(Constraint::Range { min: 200, max: 600 }.closest(150), 200);
        assert_eq!(
            Constraint::SteppedRange {
                min: 0,
                max: 100,
                step: 30
            }
            .closest(50),
            60
        );
        assert_eq!(
            Constraint::Range {
                min: 10.0,
                max: 20.0
            }
            .closest(150.0),
            20.0
        );
    }

    #[test]
    fn test_set_cached_value_rejects_mismatched_kind() {
        let mut option = DeviceOption::Bool(TypedOption {
            info: OptionInfo {
                index: 1,
                identifier: Some("preview".into()),
                title: "Preview".into(),
                description: String::new(),
                capabilities: Capabilities::default(),
                unit: Unit::None,
                size: 4,
            },
            value: false,
            constraint: Constraint::None,
        });
        assert!(option.set_cached_value(OptionValue::Bool(true)).is_ok());
        assert_eq!(option.value(), Some(OptionValue::Bool(true)));
        assert!(matches!(
            option.set_cached_value(OptionValue::Int(1)),
            Err(SaneError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_constraint_description() {
        let c = Constraint::SteppedRange {
            min: 1,
            max: 600,
            step: 1,
        };
        assert_eq!(
            c.describe(Unit::Dpi).as_deref(),
            Some("1..600 dpi (step 1)")
        );
        let c = Constraint::List(vec!["Color".to_string(), "Gray".to_string()]);
        assert_eq!(c.describe(Unit::None).as_deref(), Some("Color, Gray"));
    }
}
