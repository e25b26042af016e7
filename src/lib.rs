//! In-memory patcher for the S5L8740 (iPod nano 7G) DFU bootrom.
//!
//! Runs against the live memory of the bootrom and, in order: resets the DFU
//! transfer bookkeeping, swaps the image verification context for a copy whose
//! header and certificate checks always pass, and renames the device to
//! `PWN DFU` before publishing the state pointer.
//!
//! The host's memory, allocator and copy routine come in through
//! [`memory::HostServices`]; [`sim::SimulatedTarget`] implements it over
//! plain byte buffers.

pub mod context;
pub mod descriptor;
pub mod img;
pub mod layout;
pub mod memory;
pub mod patch;
pub mod sim;
pub mod state;

pub use layout::MemoryLayout;
pub use memory::{AddressSpace, AllocationError, HostServices, MemoryError};
pub use patch::{apply, PatchError, PatchReport, Patcher};
