//! Encoding primitives of the SANE network protocol.
//!
//! # Wire Format
//!
//! ```text
//! word     4 bytes, big-endian
//! char     1 byte
//! string   word length (strlen + 1, 0 for NULL), then the bytes incl. NUL
//! pointer  word is-null flag, then the value when non-null
//! array    word length, then that many elements
//! ```
//!
//! Requests are built in memory with [`WireWriter`] and written in one go;
//! replies are decoded incrementally with [`WireReader`].

use std::io::Read;

use crate::backend::{OptionDescriptor, RawConstraint, RawDevice};
use crate::error::{Result, SaneError, Status};

/// Strings and arrays longer than this are treated as corrupt.
const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

const CONSTRAINT_NONE: i32 = 0;
const CONSTRAINT_RANGE: i32 = 1;
const CONSTRAINT_WORD_LIST: i32 = 2;
const CONSTRAINT_STRING_LIST: i32 = 3;

/// Builds one request.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn word(mut self, word: i32) -> Self {
        self.buf.extend_from_slice(&word.to_be_bytes());
        self
    }

    pub fn string(mut self, value: Option<&str>) -> Self {
        match value {
            Some(s) => {
                self.buf
                    .extend_from_slice(&((s.len() + 1) as i32).to_be_bytes());
                self.buf.extend_from_slice(s.as_bytes());
                self.buf.push(0);
            }
            None => self.buf.extend_from_slice(&0i32.to_be_bytes()),
        }
        self
    }

    /// Array of words.
    pub fn words(mut self, words: &[i32]) -> Self {
        self = self.word(words.len() as i32);
        for word in words {
            self = self.word(*word);
        }
        self
    }

    /// Array of chars.
    pub fn chars(mut self, bytes: &[u8]) -> Self {
        self = self.word(bytes.len() as i32);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Decodes replies from a byte stream.
pub struct WireReader<R> {
    inner: R,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn word(&mut self) -> Result<i32> {
        let mut bytes = [0u8; 4];
        self.inner.read_exact(&mut bytes)?;
        Ok(i32::from_be_bytes(bytes))
    }

    pub fn status(&mut self) -> Result<Status> {
        self.word().map(Status::from_code)
    }

    fn length(&mut self) -> Result<usize> {
        let len = self.word()?;
        if len < 0 || len as usize > MAX_ARRAY_LEN {
            return Err(SaneError::Protocol(format!("invalid array length {}", len)));
        }
        Ok(len as usize)
    }

    pub fn string(&mut self) -> Result<Option<String>> {
        let len = self.length()?;
        if len == 0 {
            return Ok(None);
        }
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes)?;
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Ok(Some(String::from_utf8_lossy(&bytes[..end]).into_owned()))
    }

    /// Reads a pointer flag; `true` when a value follows.
    pub fn pointer(&mut self) -> Result<bool> {
        Ok(self.word()? == 0)
    }

    pub fn words(&mut self) -> Result<Vec<i32>> {
        let len = self.length()?;
        (0..len).map(|_| self.word()).collect()
    }

    pub fn chars(&mut self) -> Result<Vec<u8>> {
        let len = self.length()?;
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// `GET_DEVICES` device list, without the trailing NULL entry.
    pub fn devices(&mut self) -> Result<Vec<RawDevice>> {
        let len = self.length()?;
        let mut devices = Vec::with_capacity(len);
        for _ in 0..len {
            if !self.pointer()? {
                continue;
            }
            devices.push(RawDevice {
                name: self.string()?.unwrap_or_default(),
                vendor: self.string()?.unwrap_or_default(),
                model: self.string()?.unwrap_or_default(),
                kind: self.string()?.unwrap_or_default(),
            });
        }
        Ok(devices)
    }

    /// `GET_OPTION_DESCRIPTORS` table, indexed by option number.
    pub fn option_descriptors(&mut self) -> Result<Vec<OptionDescriptor>> {
        let len = self.length()?;
        let mut descriptors = Vec::with_capacity(len);
        for index in 0..len {
            if !self.pointer()? {
                return Err(SaneError::Protocol(format!(
                    "missing descriptor for option {}",
                    index
                )));
            }
            descriptors.push(self.option_descriptor()?);
        }
        Ok(descriptors)
    }

    fn option_descriptor(&mut self) -> Result<OptionDescriptor> {
        let name = self.string()?;
        let title = self.string()?;
        let description = self.string()?;
        let value_type = self.word()?;
        let unit = self.word()?;
        let size = self.word()?;
        let capabilities = self.word()? as u32;
        let constraint = match self.word()? {
            CONSTRAINT_NONE => RawConstraint::None,
            CONSTRAINT_RANGE => {
                if self.pointer()? {
                    RawConstraint::Range {
                        min: self.word()?,
                        max: self.word()?,
                        quant: self.word()?,
                    }
                } else {
                    RawConstraint::None
                }
            }
            CONSTRAINT_WORD_LIST => {
                // First element is the count of the values that follow.
                let words = self.words()?;
                RawConstraint::WordList(words.into_iter().skip(1).collect())
            }
            CONSTRAINT_STRING_LIST => {
                let len = self.length()?;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    if let Some(value) = self.string()? {
                        values.push(value);
                    }
                }
                RawConstraint::StringList(values)
            }
            other => {
                return Err(SaneError::Protocol(format!(
                    "unknown constraint type {}",
                    other
                )))
            }
        };
        Ok(OptionDescriptor {
            name,
            title,
            description,
            value_type,
            unit,
            size,
            capabilities,
            constraint,
        })
    }
}

/// Encode an option descriptor, the way `saned` does. Used by tests that
/// stand in for a server.
pub fn encode_option_descriptor(writer: WireWriter, descriptor: &OptionDescriptor) -> WireWriter {
    let writer = writer
        .word(0)
        .string(descriptor.name.as_deref())
        .string(descriptor.title.as_deref())
        .string(descriptor.description.as_deref())
        .word(descriptor.value_type)
        .word(descriptor.unit)
        .word(descriptor.size)
        .word(descriptor.capabilities as i32);
    match &descriptor.constraint {
        RawConstraint::None => writer.word(CONSTRAINT_NONE),
        RawConstraint::Range { min, max, quant } => writer
            .word(CONSTRAINT_RANGE)
            .word(0)
            .word(*min)
            .word(*max)
            .word(*quant),
        RawConstraint::WordList(words) => {
            let mut list = vec![words.len() as i32];
            list.extend_from_slice(words);
            writer.word(CONSTRAINT_WORD_LIST).words(&list)
        }
        RawConstraint::StringList(values) => {
            let mut writer = writer
                .word(CONSTRAINT_STRING_LIST)
                .word(values.len() as i32 + 1);
            for value in values {
                writer = writer.string(Some(value));
            }
            writer.string(None)
        }
    }
}
