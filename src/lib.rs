#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! Endpoint 0 control transfer engine and USB DFU 1.1 / DfuSe class
//! state machines for bootloaders.
//!
//! ## About
//!
//! The crate is split along the same lines as a USB device stack:
//!
//! * [`ControlPipe`] owns the endpoint 0 transfer state machine. It decodes
//!   SETUP packets, runs the IN/OUT data and status stages and stalls the
//!   endpoint on any protocol error.
//! * [`Dispatcher`] routes each request to a [`RequestHandler`] by
//!   category: [`StandardRequests`] for Chapter 9 requests, a class handler
//!   ([`DfuClass`] or [`DfuSeClass`]) and an optional vendor handler.
//! * [`DfuClass`] implements the DFU mode state machine, [`DfuSeClass`]
//!   layers STMicroelectronics' address pointer and erase commands on top.
//!
//! The packet memory and the flash controller are provided by the user
//! through the [`Transceiver`] and [`FlashProgrammer`] traits.
//!
//! ### Download sequence
//!
//! Blocks are not programmed when `DFU_DNLOAD` arrives. The block is copied
//! into the class' buffer and the state becomes `dfuDNLOAD-SYNC`. The
//! following `DFU_GETSTATUS` reports `dfuDNBUSY` with a poll timeout, and
//! once the host has acknowledged that reply the block is erased (if
//! needed), programmed and verified. The next `DFU_GETSTATUS` reports
//! `dfuDNLOAD-IDLE`, or `dfuERROR` with the failing status code.
//!
//! ### Limitations
//!
//! * Blocks are limited to [`MAX_TRANSFER_SIZE`] bytes.
//! * `DFU_DETACH` is not supported, the device is expected to already run
//!   in DFU mode.
//! * Only alternate setting 0 is supported.
//!
//! ## Example
//!
//! ```no_run
//! use usbd_dfu_ctrl::*;
//! # use usbd_dfu_ctrl::usb_device::endpoint::EndpointAddress;
//! #
//! # struct MyUsb;
//! # impl Transceiver for MyUsb {
//! #     fn read_setup(&mut self, _: &mut [u8]) -> usb_device::Result<usize> { Ok(8) }
//! #     fn read_out(&mut self, _: EndpointAddress, _: &mut [u8]) -> usb_device::Result<usize> { Ok(0) }
//! #     fn write_in(&mut self, _: EndpointAddress, b: &[u8]) -> usb_device::Result<usize> { Ok(b.len()) }
//! #     fn set_stall(&mut self, _: EndpointAddress) {}
//! #     fn set_device_address(&mut self, _: u8) {}
//! # }
//! # fn next_event() -> Transaction { Transaction::Reset }
//!
//! struct MyFlash {
//!     memory: [u8; 4096],
//! }
//!
//! impl FlashProgrammer for MyFlash {
//!     const INITIAL_ADDRESS_POINTER: u32 = 0x0800_4000;
//!     const PAGE_SIZE: u32 = 1024;
//!
//!     fn address_in_range(&self, address: u32) -> bool {
//!         (0x0800_4000..0x0800_5000).contains(&address)
//!     }
//!
//!     fn is_erased(&mut self, address: u32, word_count: usize) -> bool {
//!         let offset = (address - 0x0800_4000) as usize;
//!         self.memory[offset..offset + word_count * 4].iter().all(|b| *b == 0xff)
//!     }
//!
//!     fn erase_page(&mut self, address: u32) -> Result<(), DfuMemoryError> {
//!         let offset = (address - 0x0800_4000) as usize;
//!         self.memory[offset..offset + 1024].fill(0xff);
//!         Ok(())
//!     }
//!
//!     fn program(&mut self, address: u32, words: &[u32]) -> Result<(), DfuMemoryError> {
//!         let offset = (address - 0x0800_4000) as usize;
//!         for (i, w) in words.iter().enumerate() {
//!             self.memory[offset + i * 4..offset + i * 4 + 4].copy_from_slice(&w.to_le_bytes());
//!         }
//!         Ok(())
//!     }
//!
//!     fn read(&mut self, address: u32, length: usize) -> Result<&[u8], DfuMemoryError> {
//!         let offset = (address - 0x0800_4000) as usize;
//!         let end = (offset + length).min(self.memory.len());
//!         Ok(&self.memory[offset..end])
//!     }
//!
//!     fn estimate_program_time_ms(&self, word_count: usize) -> u32 {
//!         1 + word_count as u32 / 16
//!     }
//! }
//!
//! static DEVICE: [u8; 18] = [18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x83, 0x04, 0x11, 0xdf, 0, 0x22, 0, 0, 0, 1];
//! static CONFIG: [u8; 27] = [
//!     9, 2, 27, 0, 1, 1, 0, 0x80, 50,
//!     9, 4, 0, 0, 0, 0xfe, 0x01, 0x02, 0,
//!     9, 0x21, 0x0b, 250, 0, 128, 0, 0x10, 0x01,
//! ];
//!
//! let flash = MyFlash { memory: [0xff; 4096] };
//! let mut dispatcher = Dispatcher::new(
//!     StandardRequests::new(Descriptors {
//!         device: &DEVICE,
//!         configuration: &CONFIG,
//!         strings: &[],
//!     }),
//!     DfuClass::new(flash, 0),
//! );
//! let mut pipe = ControlPipe::new(MyUsb, 64);
//!
//! // From the USB interrupt handler:
//! pipe.handle(&mut dispatcher, next_event()).ok();
//! ```

#[macro_use]
mod fmt;

pub mod error;
pub mod setup;
pub mod transceiver;
pub mod flash;
pub mod control;
pub mod dispatch;
pub mod standard;

/// DFU protocol module
pub mod class;
pub mod dfuse;

#[cfg(test)]
mod testing;

#[doc(inline)]
pub use crate::class::{DfuClass, DfuState, DfuStatus, DfuStatusCode, MAX_TRANSFER_SIZE};
#[doc(inline)]
pub use crate::control::{ControlPipe, ControlState, CONTROL_BUFFER_SIZE};
#[doc(inline)]
pub use crate::dfuse::DfuSeClass;
#[doc(inline)]
pub use crate::dispatch::{Dispatcher, RequestHandler, Unsupported};
#[doc(inline)]
pub use crate::error::Stall;
#[doc(inline)]
pub use crate::flash::{DfuManifestationError, DfuMemoryError, FlashProgrammer};
#[doc(inline)]
pub use crate::setup::SetupRequest;
#[doc(inline)]
pub use crate::standard::{Descriptors, StandardRequests};
#[doc(inline)]
pub use crate::transceiver::{Transaction, Transceiver};

pub use usb_device;
