//! Capabilities the host firmware lends to the patch: its address space, its
//! allocator and its byte-copy routine.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("range {addr:#010x}+{len:#x} is not mapped")]
    Unmapped { addr: u32, len: u32 },
    #[error("address {addr:#010x}+{len:#x} overflows the address space")]
    Overflow { addr: u32, len: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("host allocator returned null for {size:#x} bytes")]
    Null { size: u32 },
    #[error("host heap exhausted: requested {requested:#x} bytes, {available:#x} left")]
    Exhausted { requested: u32, available: u32 },
}

/// `base + offset`, or `Overflow` when that leaves the 32-bit address space.
/// Used for every address derived from a pointer read out of the target.
pub fn offset_addr(base: u32, offset: u32) -> Result<u32, MemoryError> {
    base.checked_add(offset)
        .ok_or(MemoryError::Overflow { addr: base, len: offset })
}

/// Address of entry `index` in a table of 32-bit pointers at `table`.
pub fn table_entry(table: u32, index: u32) -> Result<u32, MemoryError> {
    let offset = index
        .checked_mul(4)
        .ok_or(MemoryError::Overflow { addr: table, len: u32::MAX })?;
    offset_addr(table, offset)
}

/// Bounds-checked view of the target's memory.
pub trait AddressSpace {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError>;

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError>;

    fn read_u32(&self, addr: u32) -> Result<u32, MemoryError> {
        let mut word = [0u8; 4];
        self.read(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// The injected `allocate` and `copy` primitives.
pub trait HostServices: AddressSpace {
    fn allocate(&mut self, size: u32) -> Result<u32, AllocationError>;

    fn copy(&mut self, dst: u32, src: u32, len: u32) -> Result<(), MemoryError> {
        let mut scratch = vec![0u8; len as usize];
        self.read(src, &mut scratch)?;
        self.write(dst, &scratch)
    }
}
