//! Well-known option identifiers.
//!
//! Most backends share a handful of option names (see the SANE standard,
//! section "Well-Known Options"). The session relies on them to prepare
//! previews, to derive the crop area and to guess whether a document feeder
//! is in use.

use super::{DeviceOption, NewValue, OptionValue};

/// Resolution used for previews, clamped or rounded to what the device allows.
pub const PREVIEW_RESOLUTION: i32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardOption {
    Preview,
    Resolution,
    XResolution,
    YResolution,
    Mode,
    Source,
    TopLeftX,
    TopLeftY,
    BottomRightX,
    BottomRightY,
}

impl StandardOption {
    pub const ALL: [StandardOption; 10] = [
        StandardOption::Preview,
        StandardOption::Resolution,
        StandardOption::XResolution,
        StandardOption::YResolution,
        StandardOption::Mode,
        StandardOption::Source,
        StandardOption::TopLeftX,
        StandardOption::TopLeftY,
        StandardOption::BottomRightX,
        StandardOption::BottomRightY,
    ];

    /// The four options that make up the scan area.
    pub const CROP: [StandardOption; 4] = [
        StandardOption::TopLeftX,
        StandardOption::TopLeftY,
        StandardOption::BottomRightX,
        StandardOption::BottomRightY,
    ];

    pub fn identifier(&self) -> &'static str {
        match self {
            StandardOption::Preview => "preview",
            StandardOption::Resolution => "resolution",
            StandardOption::XResolution => "x-resolution",
            StandardOption::YResolution => "y-resolution",
            StandardOption::Mode => "mode",
            StandardOption::Source => "source",
            StandardOption::TopLeftX => "tl-x",
            StandardOption::TopLeftY => "tl-y",
            StandardOption::BottomRightX => "br-x",
            StandardOption::BottomRightY => "br-y",
        }
    }

    pub fn from_identifier(identifier: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|o| o.identifier() == identifier)
    }

    pub fn is_crop(&self) -> bool {
        Self::CROP.contains(self)
    }

    /// Options overridden while previewing on devices without a native
    /// preview toggle. Mode is only included on request.
    pub fn preview_overrides(include_mode: bool) -> Vec<StandardOption> {
        let mut list = vec![
            StandardOption::Resolution,
            StandardOption::XResolution,
            StandardOption::YResolution,
            StandardOption::TopLeftX,
            StandardOption::TopLeftY,
            StandardOption::BottomRightX,
            StandardOption::BottomRightY,
        ];
        if include_mode {
            list.push(StandardOption::Mode);
        }
        list
    }

    /// Value this option should hold while acquiring a preview.
    ///
    /// `None` means "leave the current value alone": either there is no
    /// sensible preview value or it requires an automatic mode the option
    /// does not offer.
    pub fn best_preview_value(&self, option: &DeviceOption) -> Option<NewValue> {
        match (self, option) {
            (StandardOption::Preview, DeviceOption::Bool(_)) => {
                Some(NewValue::Value(OptionValue::Bool(true)))
            }
            (
                StandardOption::Resolution
                | StandardOption::XResolution
                | StandardOption::YResolution,
                DeviceOption::Int(o),
            ) => Some(NewValue::Value(OptionValue::Int(
                o.constraint.closest(PREVIEW_RESOLUTION),
            ))),
            (
                StandardOption::Resolution
                | StandardOption::XResolution
                | StandardOption::YResolution,
                DeviceOption::Fixed(o),
            ) => Some(NewValue::Value(OptionValue::Fixed(
                o.constraint.closest(f64::from(PREVIEW_RESOLUTION)),
            ))),
            (StandardOption::Mode, _) if option.capabilities().supports_auto() => {
                Some(NewValue::Auto)
            }
            (StandardOption::TopLeftX | StandardOption::TopLeftY, DeviceOption::Int(o)) => {
                o.constraint.min().map(|v| NewValue::Value(OptionValue::Int(v)))
            }
            (StandardOption::TopLeftX | StandardOption::TopLeftY, DeviceOption::Fixed(o)) => {
                o.constraint
                    .min()
                    .map(|v| NewValue::Value(OptionValue::Fixed(v)))
            }
            (
                StandardOption::BottomRightX | StandardOption::BottomRightY,
                DeviceOption::Int(o),
            ) => o.constraint.max().map(|v| NewValue::Value(OptionValue::Int(v))),
            (
                StandardOption::BottomRightX | StandardOption::BottomRightY,
                DeviceOption::Fixed(o),
            ) => o
                .constraint
                .max()
                .map(|v| NewValue::Value(OptionValue::Fixed(v))),
            _ => None,
        }
    }
}
