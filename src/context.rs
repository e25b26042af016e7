//! Overlay for the firmware's verification context.

use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::layout::CONTEXT_SIZE;
use crate::memory::{AddressSpace, MemoryError};

const WORDS: usize = CONTEXT_SIZE as usize / 4;

/// 112 opaque bytes. Only the two verifier slots have a known meaning; their
/// offsets come from the layout.
#[derive(Debug, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VerificationContext {
    words: [U32; WORDS],
}

impl VerificationContext {
    pub fn load<M: AddressSpace + ?Sized>(mem: &M, addr: u32) -> Result<Self, MemoryError> {
        let mut ctx = Self::new_zeroed();
        mem.read(addr, ctx.as_mut_bytes())?;
        Ok(ctx)
    }

    pub fn from_words(words: [u32; WORDS]) -> Self {
        Self {
            words: words.map(U32::new),
        }
    }

    /// Word at a byte offset. `None` if unaligned or past the end.
    pub fn slot(&self, offset: u32) -> Option<u32> {
        if offset % 4 != 0 {
            return None;
        }
        self.words.get(offset as usize / 4).map(|w| w.get())
    }

    pub fn set_slot(&mut self, offset: u32, value: u32) -> Option<()> {
        if offset % 4 != 0 {
            return None;
        }
        self.words.get_mut(offset as usize / 4)?.set(value);
        Some(())
    }

    /// Byte offsets of the words that differ between two contexts.
    pub fn differing_offsets(&self, other: &Self) -> Vec<u32> {
        self.words
            .iter()
            .zip(other.words.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| (i * 4) as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered() -> VerificationContext {
        let mut words = [0u32; WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = 0x2000_0000 + i as u32;
        }
        VerificationContext::from_words(words)
    }

    #[test]
    fn overlay_is_exactly_112_bytes() {
        assert_eq!(core::mem::size_of::<VerificationContext>(), 112);
        assert_eq!(numbered().as_bytes().len(), CONTEXT_SIZE as usize);
    }

    #[test]
    fn slots_are_little_endian_words() {
        let ctx = numbered();
        assert_eq!(ctx.slot(0x14), Some(0x2000_0005));
        assert_eq!(&ctx.as_bytes()[0x14..0x18], &[0x05, 0x00, 0x00, 0x20]);
    }

    #[test]
    fn rejects_unaligned_or_out_of_range_slots() {
        let mut ctx = numbered();
        assert_eq!(ctx.slot(0x15), None);
        assert_eq!(ctx.slot(0x70), None);
        assert_eq!(ctx.set_slot(0x6E, 1), None);
        assert_eq!(ctx.set_slot(0x6C, 1), Some(()));
    }

    #[test]
    fn differing_offsets_reports_only_changed_words() {
        let template = numbered();
        let mut patched = template.clone();
        patched.set_slot(0x14, 0xDEAD_BEEF);
        patched.set_slot(0x1C, 0xDEAD_BEEF);
        assert_eq!(template.differing_offsets(&patched), vec![0x14, 0x1C]);
        assert!(template.differing_offsets(&template).is_empty());
    }
}
