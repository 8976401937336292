//! OLE property set streams.
//!
//! A property set holds one or more sections, each a table of
//! `(property id, offset)` pairs followed by typed values. FlashPix keeps its
//! image description in the first section of the `Image Contents` stream.

use std::collections::HashMap;

use crate::error::ImageError;
use crate::format::decoder::invalid_header;
use crate::io::{read_u16_le, read_u32_le};

use super::FORMAT;

const VT_I4: u32 = 3;
const VT_UI4: u32 = 19;
const VT_BLOB: u32 = 65;

/// Byte offset of the first section's FMTID/offset pair
const FIRST_SECTION_POINTER: usize = 28;

/// A decoded property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Int(i32),
    UInt(u32),
    Blob(Vec<u8>),
    /// A type the reader does not interpret
    Other(u32),
}

/// First section of a property set, keyed by property id.
#[derive(Debug, Default)]
pub struct PropertySet {
    values: HashMap<u32, PropertyValue>,
}

impl PropertySet {
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let field = |offset: usize, len: usize| {
            bytes
                .get(offset..offset + len)
                .ok_or_else(|| invalid_header(FORMAT, "property set truncated"))
        };

        if read_u16_le(field(0, 2)?) != 0xFFFE {
            return Err(invalid_header(FORMAT, "property set byte order"));
        }
        if read_u32_le(field(24, 4)?) == 0 {
            return Err(invalid_header(FORMAT, "property set has no sections"));
        }

        let section = read_u32_le(field(FIRST_SECTION_POINTER + 16, 4)?) as usize;
        let count = read_u32_le(field(section + 4, 4)?) as usize;

        let mut values = HashMap::with_capacity(count.min(1024));
        for i in 0..count {
            let pair = field(section + 8 + i * 8, 8)?;
            let id = read_u32_le(&pair[0..4]);
            let at = section + read_u32_le(&pair[4..8]) as usize;

            let vt = read_u32_le(field(at, 4)?) & 0xFFFF;
            let value = match vt {
                VT_I4 => PropertyValue::Int(read_u32_le(field(at + 4, 4)?) as i32),
                VT_UI4 => PropertyValue::UInt(read_u32_le(field(at + 4, 4)?)),
                VT_BLOB => {
                    let len = read_u32_le(field(at + 4, 4)?) as usize;
                    PropertyValue::Blob(field(at + 8, len)?.to_vec())
                }
                other => PropertyValue::Other(other),
            };
            values.insert(id, value);
        }

        Ok(Self { values })
    }

    pub fn get(&self, id: u32) -> Option<&PropertyValue> {
        self.values.get(&id)
    }

    /// Unsigned integer property, accepting either integer type.
    pub fn get_u32(&self, id: u32) -> Option<u32> {
        match self.values.get(&id)? {
            PropertyValue::UInt(v) => Some(*v),
            PropertyValue::Int(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_blob(&self, id: u32) -> Option<&[u8]> {
        match self.values.get(&id)? {
            PropertyValue::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// Serialize a single-section property set.
#[cfg(test)]
pub(crate) fn build_test_set(properties: &[(u32, PropertyValue)]) -> Vec<u8> {
    let mut values = Vec::new();
    let mut table = Vec::new();
    let header_len = 8 + properties.len() * 8;

    for (id, value) in properties {
        table.push((*id, (header_len + values.len()) as u32));
        match value {
            PropertyValue::Int(v) => {
                values.extend_from_slice(&VT_I4.to_le_bytes());
                values.extend_from_slice(&v.to_le_bytes());
            }
            PropertyValue::UInt(v) => {
                values.extend_from_slice(&VT_UI4.to_le_bytes());
                values.extend_from_slice(&v.to_le_bytes());
            }
            PropertyValue::Blob(b) => {
                values.extend_from_slice(&VT_BLOB.to_le_bytes());
                values.extend_from_slice(&(b.len() as u32).to_le_bytes());
                values.extend_from_slice(b);
                values.resize(values.len().next_multiple_of(4), 0);
            }
            PropertyValue::Other(vt) => values.extend_from_slice(&vt.to_le_bytes()),
        }
    }

    let mut out = vec![0u8; 48];
    out[0..2].copy_from_slice(&0xFFFEu16.to_le_bytes());
    out[24..28].copy_from_slice(&1u32.to_le_bytes());
    out[44..48].copy_from_slice(&48u32.to_le_bytes());

    out.extend_from_slice(&((header_len + values.len()) as u32).to_le_bytes());
    out.extend_from_slice(&(properties.len() as u32).to_le_bytes());
    for (id, offset) in table {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
    }
    out.extend(values);
    out
}
