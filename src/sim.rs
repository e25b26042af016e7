//! A simulated target: mapped regions standing in for the firmware's memory,
//! a bump heap, and host routines callable through addresses read from memory.

use std::collections::BTreeMap;

use log::trace;
use thiserror::Error;

use crate::descriptor::{self, DescriptorError};
use crate::img::ImgHeader;
use crate::layout::{MemoryLayout, CONTEXT_SIZE};
use crate::memory::{self, AddressSpace, AllocationError, HostServices, MemoryError};

/// A host routine reachable through a function pointer in simulated memory.
pub type HostRoutine = fn(&[u8]) -> bool;

pub const ROM_BASE: u32 = 0x2000_0000;
pub const ROM_SIZE: u32 = 0x1_0000;
pub const SRAM_BASE: u32 = 0x2200_0000;
pub const SRAM_SIZE: u32 = 0x3_0000;

/// Routines of the simulated bootrom.
pub const ROM_VERIFY_HEADER: u32 = 0x2000_4A10;
pub const ROM_VERIFY_CERTIFICATE: u32 = 0x2000_4C58;

/// Common name the simulated certificate check insists on.
pub const TRUSTED_ROOT: &[u8] = b"S5L8740 Secure Boot";

const STRING_TABLE: u32 = 0x2202_C400;
const STRING_BLOCKS: u32 = 0x2202_C420;
const STALE_STATE: u32 = 0x2202_E380;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("no host routine at {0:#010x}")]
    UnknownRoutine(u32),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

struct Region {
    base: u32,
    bytes: Vec<u8>,
}

impl Region {
    fn range(&self, addr: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = addr.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }
}

struct Heap {
    next: u32,
    end: u32,
}

#[derive(Default)]
pub struct SimulatedTarget {
    regions: Vec<Region>,
    heap: Option<Heap>,
    routines: BTreeMap<u32, HostRoutine>,
    allocations: Vec<u32>,
}

impl SimulatedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, base: u32, bytes: Vec<u8>) -> &mut Self {
        self.regions.push(Region { base, bytes });
        self
    }

    pub fn map_zeroed(&mut self, base: u32, len: u32) -> &mut Self {
        self.map(base, vec![0; len as usize])
    }

    /// Serves allocations from `[base, base + len)`, which must already be
    /// mapped. The end is clamped to the top of the address space.
    pub fn set_heap(&mut self, base: u32, len: u32) -> &mut Self {
        self.heap = Some(Heap {
            next: base,
            end: base.saturating_add(len),
        });
        self
    }

    pub fn register(&mut self, addr: u32, routine: HostRoutine) -> &mut Self {
        self.routines.insert(addr, routine);
        self
    }

    /// Bytes of the region mapped at exactly `base`.
    pub fn region(&self, base: u32) -> Option<&[u8]> {
        self.regions
            .iter()
            .find(|r| r.base == base)
            .map(|r| r.bytes.as_slice())
    }

    /// Addresses handed out by `allocate`, oldest first.
    pub fn allocations(&self) -> &[u32] {
        &self.allocations
    }

    pub fn call(&self, addr: u32, input: &[u8]) -> Result<bool, FirmwareError> {
        let routine = self
            .routines
            .get(&addr)
            .ok_or(FirmwareError::UnknownRoutine(addr))?;
        Ok(routine(input))
    }

    fn active_verifier(&self, layout: &MemoryLayout, slot: u32) -> Result<u32, FirmwareError> {
        let context = self.read_u32(layout.state_field(layout.state.verification_context))?;
        Ok(self.read_u32(memory::offset_addr(context, slot)?)?)
    }

    /// Dispatches the header check the way the firmware does: through the
    /// context the device state currently points at.
    pub fn verify_header(&self, layout: &MemoryLayout, image: &[u8]) -> Result<bool, FirmwareError> {
        let routine = self.active_verifier(layout, layout.context.verify_header)?;
        self.call(routine, image)
    }

    pub fn verify_certificate(
        &self,
        layout: &MemoryLayout,
        image: &[u8],
    ) -> Result<bool, FirmwareError> {
        let routine = self.active_verifier(layout, layout.context.verify_certificate)?;
        self.call(routine, image)
    }

    /// Raw descriptor block referenced by table slot `index`.
    pub fn string_descriptor(&self, layout: &MemoryLayout, index: u32) -> Result<Vec<u8>, FirmwareError> {
        let table = self.read_u32(layout.state_field(layout.state.string_descriptors))?;
        let block = self.read_u32(memory::table_entry(table, index)?)?;
        let mut length = [0u8];
        self.read(block, &mut length)?;
        let mut bytes = vec![0u8; length[0] as usize];
        self.read(block, &mut bytes)?;
        Ok(bytes)
    }

    /// What a USB host would read as the product name during enumeration.
    pub fn product_name(&self, layout: &MemoryLayout) -> Result<String, FirmwareError> {
        let bytes = self.string_descriptor(layout, layout.product_string_index)?;
        Ok(descriptor::decode(&bytes)?)
    }

    /// A target shaped like the nano 7G bootrom in DFU mode, caught mid-upload.
    pub fn nano7g() -> Self {
        let layout = MemoryLayout::NANO7G_DFU;
        let mut rom = vec![0u8; ROM_SIZE as usize];
        let mut sram = vec![0u8; SRAM_SIZE as usize];

        let template = (layout.context_template - ROM_BASE) as usize;
        for (i, word) in rom[template..template + CONTEXT_SIZE as usize]
            .chunks_exact_mut(4)
            .enumerate()
        {
            word.copy_from_slice(&(ROM_BASE + 0x3000 + i as u32 * 0x40 + 1).to_le_bytes());
        }
        put(&mut rom, ROM_BASE, layout.context_template + layout.context.verify_header, ROM_VERIFY_HEADER);
        put(
            &mut rom,
            ROM_BASE,
            layout.context_template + layout.context.verify_certificate,
            ROM_VERIFY_CERTIFICATE,
        );

        let state = layout.device_state;
        put(&mut sram, SRAM_BASE, state, layout.heap + 0x200);
        put(&mut sram, SRAM_BASE, state + 0x04, 0x800);
        put(&mut sram, SRAM_BASE, state + layout.state.transferred_bytes, 0x640);
        put(&mut sram, SRAM_BASE, state + layout.state.pending_size, 0x40);
        put(&mut sram, SRAM_BASE, state + layout.state.upload_complete, 0xA5A5_A501);
        put(&mut sram, SRAM_BASE, state + layout.state.verification_context, layout.context_template);
        put(&mut sram, SRAM_BASE, state + layout.state.string_descriptors, STRING_TABLE);

        let strings = ["\u{0409}", "Apple Inc.", "Apple Mobile Device (DFU Mode)", "CPID:8740"];
        let mut block = STRING_BLOCKS;
        for (i, text) in strings.iter().enumerate() {
            let encoded = descriptor::encode(text).unwrap_or_default();
            let at = (block - SRAM_BASE) as usize;
            sram[at..at + encoded.len()].copy_from_slice(&encoded);
            put(&mut sram, SRAM_BASE, STRING_TABLE + i as u32 * 4, block);
            block += (encoded.len() as u32 + 3) & !3;
        }
        put(&mut sram, SRAM_BASE, layout.published_state, STALE_STATE);

        let mut target = Self::new();
        target
            .map(ROM_BASE, rom)
            .map(SRAM_BASE, sram)
            .set_heap(layout.heap, 0x200)
            .register(layout.always_true, |_| true)
            .register(ROM_VERIFY_HEADER, rom_verify_header)
            .register(ROM_VERIFY_CERTIFICATE, rom_verify_certificate);
        target
    }

    fn locate(&self, addr: u32, len: usize) -> Result<(usize, std::ops::Range<usize>), MemoryError> {
        let len32 = u32::try_from(len).map_err(|_| MemoryError::Overflow { addr, len: u32::MAX })?;
        if addr.checked_add(len32).is_none() {
            return Err(MemoryError::Overflow { addr, len: len32 });
        }
        self.regions
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.range(addr, len).map(|range| (i, range)))
            .ok_or(MemoryError::Unmapped { addr, len: len32 })
    }
}

impl AddressSpace for SimulatedTarget {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let (region, range) = self.locate(addr, buf.len())?;
        buf.copy_from_slice(&self.regions[region].bytes[range]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let (region, range) = self.locate(addr, data.len())?;
        trace!("write {:#010x} {:02x?}", addr, data);
        self.regions[region].bytes[range].copy_from_slice(data);
        Ok(())
    }
}

impl HostServices for SimulatedTarget {
    fn allocate(&mut self, size: u32) -> Result<u32, AllocationError> {
        let heap = self.heap.as_mut().ok_or(AllocationError::Null { size })?;
        let available = heap.end.saturating_sub(heap.next);
        let rounded = size.checked_add(3).map(|s| s & !3).unwrap_or(u32::MAX);
        if rounded > available {
            return Err(AllocationError::Exhausted {
                requested: size,
                available,
            });
        }
        let addr = heap.next;
        heap.next += rounded;
        self.allocations.push(addr);
        Ok(addr)
    }
}

fn put(mem: &mut [u8], base: u32, addr: u32, value: u32) {
    let at = (addr - base) as usize;
    mem[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn rom_verify_header(image: &[u8]) -> bool {
    ImgHeader::parse(image).is_some_and(|header| header.is_well_formed(image.len()))
}

fn rom_verify_certificate(image: &[u8]) -> bool {
    let Some(header) = ImgHeader::parse(image) else {
        return false;
    };
    header
        .certificates(image)
        .is_some_and(|certs| certs.windows(TRUSTED_ROOT.len()).any(|w| w == TRUSTED_ROOT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::img::{wrap_image, HEADER_SIZE};

    #[test]
    fn reads_and_writes_stay_inside_regions() {
        let mut target = SimulatedTarget::new();
        target.map_zeroed(0x1000, 0x10);
        target.write_u32(0x100C, 0xCAFE_F00D).unwrap();
        assert_eq!(target.read_u32(0x100C).unwrap(), 0xCAFE_F00D);
        assert_eq!(
            target.write_u32(0x100E, 1),
            Err(MemoryError::Unmapped { addr: 0x100E, len: 4 })
        );
        assert_eq!(
            target.read_u32(0x0FFE),
            Err(MemoryError::Unmapped { addr: 0x0FFE, len: 4 })
        );
        assert_eq!(
            target.read_u32(u32::MAX - 1),
            Err(MemoryError::Overflow { addr: u32::MAX - 1, len: 4 })
        );
    }

    #[test]
    fn heap_is_bump_allocated_and_bounded() {
        let mut target = SimulatedTarget::new();
        target.map_zeroed(0x4000, 0x100).set_heap(0x4000, 0x100);
        assert_eq!(target.allocate(0x70), Ok(0x4000));
        assert_eq!(target.allocate(0x3), Ok(0x4070));
        assert_eq!(
            target.allocate(0x100),
            Err(AllocationError::Exhausted { requested: 0x100, available: 0x8C })
        );
        assert_eq!(target.allocations(), &[0x4000u32, 0x4070]);
    }

    #[test]
    fn heap_at_top_of_memory_is_clamped() {
        let mut target = SimulatedTarget::new();
        target.map_zeroed(0xFFFF_FF80, 0x7F).set_heap(0xFFFF_FF80, 0x100);
        assert_eq!(target.allocate(0x70), Ok(0xFFFF_FF80));
        assert_eq!(
            target.allocate(0x10),
            Err(AllocationError::Exhausted { requested: 0x10, available: 0xF })
        );
    }

    #[test]
    fn allocating_without_a_heap_returns_null() {
        let mut target = SimulatedTarget::new();
        assert_eq!(target.allocate(0x70), Err(AllocationError::Null { size: 0x70 }));
    }

    #[test]
    fn copy_moves_bytes_between_regions() {
        let mut target = SimulatedTarget::new();
        target.map(0x100, vec![1, 2, 3, 4]).map_zeroed(0x200, 4);
        target.copy(0x200, 0x100, 4).unwrap();
        assert_eq!(target.region(0x200).unwrap(), &[1u8, 2, 3, 4]);
    }

    #[test]
    fn unregistered_routine_is_an_error() {
        let target = SimulatedTarget::new();
        assert!(matches!(
            target.call(0x2000_0000, &[]),
            Err(FirmwareError::UnknownRoutine(0x2000_0000))
        ));
    }

    #[test]
    fn stock_nano7g_enumerates_as_dfu_and_enforces_verification() {
        let layout = MemoryLayout::NANO7G_DFU;
        let target = SimulatedTarget::nano7g();
        assert_eq!(target.product_name(&layout).unwrap(), "Apple Mobile Device (DFU Mode)");

        let unsigned = wrap_image(b"payload").unwrap();
        assert!(target.verify_header(&layout, &unsigned).unwrap());
        assert!(!target.verify_certificate(&layout, &unsigned).unwrap());
        assert!(!target.verify_header(&layout, b"garbage").unwrap());

        let mut signed = unsigned.clone();
        let header = ImgHeader::parse(&signed).unwrap();
        let certs = HEADER_SIZE + header.cert_offset.get() as usize;
        signed[certs..certs + TRUSTED_ROOT.len()].copy_from_slice(TRUSTED_ROOT);
        assert!(target.verify_certificate(&layout, &signed).unwrap());
    }
}
