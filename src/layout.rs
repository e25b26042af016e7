//! Memory-layout descriptor for the patched firmware build.
//!
//! Every absolute address and field offset the patch touches lives here, so the
//! patch sequence itself never hard-codes a location.

use crate::memory::{self, MemoryError};

/// Size of a verification context, copied verbatim from the template.
pub const CONTEXT_SIZE: u32 = 0x70;

/// Byte offsets of the fields of the global device state block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateOffsets {
    pub transferred_bytes: u32,
    pub pending_size: u32,
    pub upload_complete: u32,
    pub verification_context: u32,
    pub string_descriptors: u32,
}

/// Byte offsets of the function-pointer slots inside a verification context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOffsets {
    pub verify_header: u32,
    pub verify_certificate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Global device state block.
    pub device_state: u32,
    pub state: StateOffsets,
    /// Read-only template verification context.
    pub context_template: u32,
    pub context: ContextOffsets,
    /// Host routine returning true for any arguments.
    pub always_true: u32,
    /// Slot of the product name in the string descriptor table.
    pub product_string_index: u32,
    /// Where the spoofed descriptor block is written.
    pub descriptor_block: u32,
    /// Word the firmware dereferences to find its current state.
    pub published_state: u32,
    pub heap: u32,
}

impl MemoryLayout {
    /// iPod nano 7G bootrom (S5L8740) in DFU mode.
    pub const NANO7G_DFU: MemoryLayout = MemoryLayout {
        device_state: 0x2202_BA3C,
        state: StateOffsets {
            transferred_bytes: 0x08,
            pending_size: 0x0C,
            upload_complete: 0x10,
            verification_context: 0x24,
            string_descriptors: 0x80,
        },
        context_template: 0x2000_0020,
        context: ContextOffsets {
            verify_header: 0x14,
            verify_certificate: 0x1C,
        },
        always_true: 0x2000_11E0,
        product_string_index: 2,
        descriptor_block: 0x2202_FFC0,
        published_state: 0x2202_FFF8,
        heap: 0x2202_D900,
    };

    pub fn state_field(&self, offset: u32) -> u32 {
        self.device_state + offset
    }

    /// Address of the product-name entry inside a descriptor table at `table`.
    pub fn product_slot(&self, table: u32) -> Result<u32, MemoryError> {
        memory::table_entry(table, self.product_string_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nano7g_offsets_fit_inside_context() {
        let layout = MemoryLayout::NANO7G_DFU;
        assert!(layout.context.verify_header + 4 <= CONTEXT_SIZE);
        assert!(layout.context.verify_certificate + 4 <= CONTEXT_SIZE);
        assert_ne!(layout.context.verify_header, layout.context.verify_certificate);
    }

    #[test]
    fn product_slot_is_word_indexed() {
        let layout = MemoryLayout::NANO7G_DFU;
        assert_eq!(layout.product_slot(0x2202_0000), Ok(0x2202_0008));
        assert_eq!(
            layout.product_slot(0xFFFF_FFFC),
            Err(MemoryError::Overflow { addr: 0xFFFF_FFFC, len: 8 })
        );
        assert_eq!(layout.state_field(layout.state.verification_context), 0x2202_BA60);
    }

    #[test]
    fn descriptor_block_does_not_overlap_published_slot() {
        let layout = MemoryLayout::NANO7G_DFU;
        assert!(layout.descriptor_block + 16 <= layout.published_state);
    }
}
