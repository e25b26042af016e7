//! Typed accessors over the live global device state block.

use crate::layout::MemoryLayout;
use crate::memory::{AddressSpace, MemoryError};

pub struct DeviceState<'a, M: ?Sized> {
    mem: &'a mut M,
    layout: &'a MemoryLayout,
}

impl<'a, M: AddressSpace + ?Sized> DeviceState<'a, M> {
    pub fn new(mem: &'a mut M, layout: &'a MemoryLayout) -> Self {
        Self { mem, layout }
    }

    fn get(&self, offset: u32) -> Result<u32, MemoryError> {
        self.mem.read_u32(self.layout.state_field(offset))
    }

    fn set(&mut self, offset: u32, value: u32) -> Result<(), MemoryError> {
        self.mem.write_u32(self.layout.state_field(offset), value)
    }

    pub fn transferred_bytes(&self) -> Result<u32, MemoryError> {
        self.get(self.layout.state.transferred_bytes)
    }

    pub fn set_transferred_bytes(&mut self, value: u32) -> Result<(), MemoryError> {
        self.set(self.layout.state.transferred_bytes, value)
    }

    pub fn pending_size(&self) -> Result<u32, MemoryError> {
        self.get(self.layout.state.pending_size)
    }

    pub fn set_pending_size(&mut self, value: u32) -> Result<(), MemoryError> {
        self.set(self.layout.state.pending_size, value)
    }

    /// The flag is one byte; the three bytes after it are padding.
    pub fn upload_complete(&self) -> Result<bool, MemoryError> {
        let mut flag = [0u8];
        self.mem
            .read(self.layout.state_field(self.layout.state.upload_complete), &mut flag)?;
        Ok(flag[0] != 0)
    }

    /// Writes the whole word, clearing the padding along with the flag.
    pub fn set_upload_complete(&mut self, value: bool) -> Result<(), MemoryError> {
        self.set(self.layout.state.upload_complete, value as u32)
    }

    pub fn verification_context(&self) -> Result<u32, MemoryError> {
        self.get(self.layout.state.verification_context)
    }

    pub fn set_verification_context(&mut self, addr: u32) -> Result<(), MemoryError> {
        self.set(self.layout.state.verification_context, addr)
    }

    pub fn string_descriptors(&self) -> Result<u32, MemoryError> {
        self.get(self.layout.state.string_descriptors)
    }
}
