//! IMG1 container used by the S5L8740 bootrom for DFU uploads.

use std::iter;

use thiserror::Error;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

pub const HEADER_SIZE: usize = 0x400;
pub const MAGIC: [u8; 4] = *b"8740";
pub const VERSION: [u8; 3] = *b"2.0";
/// Unencrypted, signed.
pub const FORMAT_SIGNED: u8 = 4;
pub const SIGNATURE_LEN: u32 = 0x80;
pub const CERTIFICATES_LEN: u32 = 0x300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImgError {
    #[error("body of {0:#x} bytes does not fit the 32-bit IMG1 length fields")]
    TooLarge(usize),
}

#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ImgHeader {
    pub magic: [u8; 4],
    pub version: [u8; 3],
    pub format: u8,
    pub entrypoint: U32,
    pub body_length: U32,
    pub data_length: U32,
    pub cert_offset: U32,
    pub cert_length: U32,
    padding: [u8; 0x3E4],
}

impl ImgHeader {
    /// `None` if the signature and certificate areas would push the data
    /// length past `u32::MAX`.
    pub fn for_body(body_length: u32) -> Option<Self> {
        let cert_offset = body_length.checked_add(SIGNATURE_LEN)?;
        let data_length = cert_offset.checked_add(CERTIFICATES_LEN)?;
        let mut header = Self::new_zeroed();
        header.magic = MAGIC;
        header.version = VERSION;
        header.format = FORMAT_SIGNED;
        header.body_length = U32::new(body_length);
        header.data_length = U32::new(data_length);
        header.cert_offset = U32::new(cert_offset);
        header.cert_length = U32::new(CERTIFICATES_LEN);
        Some(header)
    }

    pub fn parse(bytes: &[u8]) -> Option<&Self> {
        Self::ref_from_prefix(bytes).ok().map(|(header, _)| header)
    }

    /// Structural checks only; says nothing about the signature.
    pub fn is_well_formed(&self, image_len: usize) -> bool {
        let body = self.body_length.get() as u64;
        let cert_offset = self.cert_offset.get() as u64;
        let cert_end = cert_offset + self.cert_length.get() as u64;
        self.magic == MAGIC
            && self.version == VERSION
            && cert_offset == body + SIGNATURE_LEN as u64
            && cert_end == self.data_length.get() as u64
            && HEADER_SIZE as u64 + cert_end <= image_len as u64
    }

    /// Certificate area of `image`, if the header's bounds fit.
    pub fn certificates<'i>(&self, image: &'i [u8]) -> Option<&'i [u8]> {
        let start = HEADER_SIZE + self.cert_offset.get() as usize;
        let end = start.checked_add(self.cert_length.get() as usize)?;
        image.get(start..end)
    }
}

/// Prepends an IMG1 header to a raw body. The body is zero-padded to a 16-byte
/// boundary (a full extra block when already aligned) and followed by dummy
/// signature and certificate areas.
pub fn wrap_image(body: &[u8]) -> Result<Vec<u8>, ImgError> {
    let alignment_padding = 0x10 - (body.len() & 0xF);
    let header = padded_body_length(body.len())
        .and_then(ImgHeader::for_body)
        .ok_or(ImgError::TooLarge(body.len()))?;

    let mut image = Vec::from(header.as_bytes());
    image.extend_from_slice(body);
    image.extend(iter::repeat_n(0, alignment_padding));
    image.extend(iter::repeat_n(b'S', SIGNATURE_LEN as usize));
    image.extend(iter::repeat_n(b'C', CERTIFICATES_LEN as usize));
    Ok(image)
}

fn padded_body_length(len: usize) -> Option<u32> {
    let padded = len.checked_add(0x10 - (len & 0xF))?;
    u32::try_from(padded).ok()
}

/// Whether `bytes` already start with an IMG1 header.
pub fn is_wrapped(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_SIZE && bytes[..4] == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_one_kilobyte() {
        assert_eq!(core::mem::size_of::<ImgHeader>(), HEADER_SIZE);
    }

    #[test]
    fn wrapped_image_is_well_formed() {
        let image = wrap_image(&[0xAB; 0x123]).unwrap();
        let header = ImgHeader::parse(&image).unwrap();
        assert_eq!(header.body_length.get(), 0x130);
        assert_eq!(header.cert_offset.get(), 0x1B0);
        assert_eq!(header.data_length.get(), 0x4B0);
        assert_eq!(image.len(), HEADER_SIZE + 0x4B0);
        assert!(header.is_well_formed(image.len()));
        assert!(is_wrapped(&image));
    }

    #[test]
    fn aligned_body_still_gets_a_padding_block() {
        let image = wrap_image(&[0u8; 0x20]).unwrap();
        assert_eq!(ImgHeader::parse(&image).unwrap().body_length.get(), 0x30);
    }

    #[test]
    fn certificate_area_is_the_dummy_fill() {
        let image = wrap_image(b"payload").unwrap();
        let header = ImgHeader::parse(&image).unwrap();
        let certs = header.certificates(&image).unwrap();
        assert_eq!(certs.len(), CERTIFICATES_LEN as usize);
        assert!(certs.iter().all(|&b| b == b'C'));
    }

    #[test]
    fn truncated_or_corrupt_headers_are_rejected() {
        let mut image = wrap_image(b"payload").unwrap();
        assert!(ImgHeader::parse(&image[..0x100]).is_none());
        assert!(!ImgHeader::parse(&image).unwrap().is_well_formed(image.len() - 1));
        image[0] = b'X';
        assert!(!ImgHeader::parse(&image).unwrap().is_well_formed(image.len()));
        assert!(!is_wrapped(&image));
    }

    #[test]
    fn oversized_bodies_are_rejected_instead_of_truncated() {
        assert_eq!(padded_body_length(0x123), Some(0x130));
        assert_eq!(padded_body_length(u32::MAX as usize), None);
        assert_eq!(padded_body_length(usize::MAX), None);
        assert_eq!(padded_body_length(0xFFFF_FFEF), Some(0xFFFF_FFF0));
    }

    #[test]
    fn header_lengths_that_would_wrap_are_rejected() {
        assert!(ImgHeader::for_body(0xFFFF_FFF0).is_none());
        assert!(ImgHeader::for_body(u32::MAX - SIGNATURE_LEN - CERTIFICATES_LEN + 1).is_none());
        let header = ImgHeader::for_body(u32::MAX - SIGNATURE_LEN - CERTIFICATES_LEN).unwrap();
        assert_eq!(header.data_length.get(), u32::MAX);
    }
}
