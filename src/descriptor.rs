//! USB string descriptors: `bLength`, `bDescriptorType`, then UTF-16LE text.

use thiserror::Error;

pub const STRING_DESCRIPTOR_TYPE: u8 = 0x03;

/// Product name reported after the patch.
pub const SPOOFED_PRODUCT_NAME: &str = "PWN DFU";

/// `"PWN DFU"` as a prebuilt string descriptor.
pub const PWN_DFU_DESCRIPTOR: [u8; 16] = [
    0x10, 0x03, // bLength, bDescriptorType
    b'P', 0x00, b'W', 0x00, b'N', 0x00, b' ', 0x00, b'D', 0x00, b'F', 0x00, b'U', 0x00,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor is {0} bytes, need at least 2")]
    Truncated(usize),
    #[error("descriptor type {0:#04x} is not a string descriptor")]
    WrongType(u8),
    #[error("bLength {length} is odd or exceeds the {available} bytes available")]
    BadLength { length: u8, available: usize },
    #[error("string does not fit in a single descriptor")]
    TooLong,
    #[error("descriptor body is not valid UTF-16")]
    InvalidUtf16,
}

pub fn encode(text: &str) -> Result<Vec<u8>, DescriptorError> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let length = u8::try_from(2 + units.len() * 2).map_err(|_| DescriptorError::TooLong)?;
    let mut out = Vec::with_capacity(length as usize);
    out.push(length);
    out.push(STRING_DESCRIPTOR_TYPE);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(out)
}

/// Decodes a string descriptor, honouring `bLength` and ignoring trailing bytes.
pub fn decode(bytes: &[u8]) -> Result<String, DescriptorError> {
    let &[length, kind, ..] = bytes else {
        return Err(DescriptorError::Truncated(bytes.len()));
    };
    if kind != STRING_DESCRIPTOR_TYPE {
        return Err(DescriptorError::WrongType(kind));
    }
    if length < 2 || length % 2 != 0 || length as usize > bytes.len() {
        return Err(DescriptorError::BadLength {
            length,
            available: bytes.len(),
        });
    }
    let units: Vec<u16> = bytes[2..length as usize]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| DescriptorError::InvalidUtf16)
}
