//! STMicroelectronics DfuSe extension.
//!
//! DfuSe reuses the DFU state machine but gives block numbers a meaning:
//!
//! * block 0 carries a command (`SET_ADDRESS_POINTER`, `ERASE`) on download
//!   and the supported command list on upload,
//! * block 1 is reserved,
//! * block `n ≥ 2` maps to `address_pointer + (n - 2) * TRANSFER_SIZE`.
//!
//! See AN3156 for the wire format.

use core::cmp::min;

use usb_device::prelude::UsbDeviceState;

use crate::class::{functional_descriptor, DfuClass, DfuState, DfuStatus, DfuStatusCode};
use crate::class::{DFU_DNLOAD, DFU_UPLOAD};
use crate::dispatch::RequestHandler;
use crate::error::Stall;
use crate::flash::FlashProgrammer;
use crate::setup::SetupRequest;

const CMD_GET_COMMANDS: u8 = 0x00;
const CMD_SET_ADDRESS_POINTER: u8 = 0x21;
const CMD_ERASE: u8 = 0x41;

const SUPPORTED_COMMANDS: [u8; 3] = [CMD_GET_COMMANDS, CMD_SET_ADDRESS_POINTER, CMD_ERASE];

/// DfuSe class, DFU 1.1a with STMicroelectronics extensions.
///
/// The command opcode is part of the `DFU_DNLOAD` data stage, so it is only
/// looked at after the status stage was acknowledged. An unknown or
/// malformed command therefore does not stall the download request itself:
/// it moves the class to `dfuERROR` with `errSTALLEDPKT` and the host sees
/// it in the next `DFU_GETSTATUS`. Commands with a length other than 1 or 5
/// bytes are stalled right away.
pub struct DfuSeClass<F: FlashProgrammer> {
    dfu: DfuClass<F>,
}

impl<F: FlashProgrammer> DfuSeClass<F> {
    /// Creates a DfuSe class for interface number `if_num`.
    pub fn new(flash: F, if_num: u8) -> Self {
        Self {
            dfu: DfuClass::new(flash, if_num),
        }
    }

    /// Consumes the class and returns the flash programmer.
    pub fn release(self) -> F {
        self.dfu.release()
    }

    /// Underlying DFU state machine.
    pub fn dfu(&self) -> &DfuClass<F> {
        &self.dfu
    }

    /// Underlying DFU state machine.
    pub fn dfu_mut(&mut self) -> &mut DfuClass<F> {
        &mut self.dfu
    }

    /// Current state.
    pub fn state(&self) -> DfuState {
        self.dfu.state()
    }

    /// Current status.
    pub fn status(&self) -> DfuStatus {
        self.dfu.status()
    }

    /// Current Address Pointer value.
    pub fn address_pointer(&self) -> u32 {
        self.dfu.address_pointer()
    }

    /// DFU functional descriptor, advertising DFU 1.1a.
    pub fn functional_descriptor() -> [u8; 9] {
        functional_descriptor::<F>(0x011a)
    }

    fn block_address(&self, block_num: u16) -> Option<u32> {
        let offset = (block_num as u32)
            .checked_sub(2)?
            .checked_mul(F::TRANSFER_SIZE as u32)?;
        self.dfu.address_pointer().checked_add(offset)
    }

    /// Executes a block 0 command. Erase runs right away, not in the busy phase.
    fn command(&mut self, data: &[u8]) -> Result<(), Stall> {
        let argument = match data {
            [_, a, b, c, d] => Some(u32::from_le_bytes([*a, *b, *c, *d])),
            _ => None,
        };

        match (data[0], argument) {
            (CMD_SET_ADDRESS_POINTER, Some(address)) => {
                debug!("dfuse address pointer {=u32:#x}", address);
                self.dfu.set_address_pointer(address);
            }
            (CMD_ERASE, Some(address)) => {
                if !self.dfu.flash().address_in_range(address) {
                    self.dfu.fail(DfuStatusCode::ErrAddress);
                    return Ok(());
                }
                let page = address - address % F::PAGE_SIZE;
                debug!("dfuse erase page {=u32:#x}", page);
                if let Err(e) = self.dfu.flash_mut().erase_page(page) {
                    self.dfu.fail(e.into());
                    return Ok(());
                }
            }
            (CMD_ERASE, None) if data.len() == 1 => {
                debug!("dfuse mass erase");
                if let Err(e) = self.dfu.flash_mut().erase_all() {
                    self.dfu.fail(e.into());
                    return Ok(());
                }
            }
            _ => return self.dfu.reject(),
        }

        self.dfu.set_state(DfuState::DnloadSync);
        Ok(())
    }

    fn upload(&mut self, req: &SetupRequest, buf: &mut [u8]) -> Result<usize, Stall> {
        if req.value == 0 {
            buf[..SUPPORTED_COMMANDS.len()].copy_from_slice(&SUPPORTED_COMMANDS);
            self.dfu.set_state(DfuState::Idle);
            return Ok(SUPPORTED_COMMANDS.len());
        }

        match self.block_address(req.value) {
            Some(address) if self.dfu.flash().address_in_range(address) => {
                let length = min(req.length, F::TRANSFER_SIZE) as usize;
                self.dfu.read_block(address, length, buf)
            }
            Some(_) => {
                self.dfu.set_state(DfuState::Idle);
                Ok(0)
            }
            None => {
                self.dfu.fail(DfuStatusCode::ErrAddress);
                Err(Stall)
            }
        }
    }
}

impl<F: FlashProgrammer> RequestHandler for DfuSeClass<F> {
    fn validate(&mut self, req: &SetupRequest, state: UsbDeviceState) -> Result<(), Stall> {
        self.dfu.validate_common(req, state)?;

        match (req.request, req.value, req.length) {
            // reserved block
            (DFU_DNLOAD, 1, 1..) | (DFU_UPLOAD, 1, _) => self.dfu.reject(),
            // commands are one opcode plus an optional 32-bit argument
            (DFU_DNLOAD, 0, len) if len != 0 && len != 1 && len != 5 => self.dfu.reject(),
            (DFU_UPLOAD, 0, len) if (len as usize) < SUPPORTED_COMMANDS.len() => self.dfu.reject(),
            _ => Ok(()),
        }
    }

    fn execute_get(&mut self, req: &SetupRequest, buf: &mut [u8]) -> Result<usize, Stall> {
        match req.request {
            DFU_UPLOAD => self.upload(req, buf),
            _ => self.dfu.execute_get(req, buf),
        }
    }

    fn execute_set(&mut self, req: &SetupRequest, data: &[u8]) -> Result<(), Stall> {
        match req.request {
            DFU_DNLOAD if data.is_empty() => self.dfu.execute_set(req, data),
            DFU_DNLOAD if req.value == 0 => self.command(data),
            DFU_DNLOAD if req.value == 1 => self.dfu.reject(),
            DFU_DNLOAD => {
                let target = self.block_address(req.value);
                self.dfu.capture_block(req.value, data, target, None);
                Ok(())
            }
            _ => self.dfu.execute_set(req, data),
        }
    }

    fn complete_get(&mut self, req: &SetupRequest) {
        self.dfu.complete_get(req)
    }

    fn reset(&mut self) {
        self.dfu.reset()
    }
}
