//! Chapter 9 standard requests

use core::cmp::min;

use usb_device::control::{Recipient, Request};
use usb_device::prelude::UsbDeviceState;

use crate::dispatch::RequestHandler;
use crate::error::Stall;
use crate::setup::SetupRequest;

const DESC_DEVICE: u8 = 0x01;
const DESC_CONFIGURATION: u8 = 0x02;
const DESC_STRING: u8 = 0x03;

// bmAttributes of the configuration descriptor
const CONFIG_SELF_POWERED: u8 = 0x40;

/// Pre-encoded descriptor tables.
///
/// Each entry is the complete descriptor as sent on the wire, including
/// `bLength` and `bDescriptorType`.
#[derive(Debug, Clone, Copy)]
pub struct Descriptors<'a> {
    /// Device descriptor.
    pub device: &'a [u8],
    /// Configuration descriptor followed by its interface and functional descriptors.
    pub configuration: &'a [u8],
    /// String descriptors, index 0 is the language ID table.
    pub strings: &'a [&'a [u8]],
}

/// Standard device requests and device state tracking.
pub struct StandardRequests<'a> {
    descriptors: Descriptors<'a>,
    state: UsbDeviceState,
    pending_address: Option<u8>,
    address: u8,
    configuration: u8,
    remote_wakeup: bool,
}

impl<'a> StandardRequests<'a> {
    /// Creates a handler serving `descriptors`.
    pub fn new(descriptors: Descriptors<'a>) -> Self {
        Self {
            descriptors,
            state: UsbDeviceState::Default,
            pending_address: None,
            address: 0,
            configuration: 0,
            remote_wakeup: false,
        }
    }

    /// Current device state.
    pub fn device_state(&self) -> UsbDeviceState {
        self.state
    }

    /// Bus address assigned by the host.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Selected configuration value, `0` when not configured.
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Returns `true` if the host enabled remote wakeup.
    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup
    }

    pub(crate) fn take_pending_address(&mut self) -> Option<u8> {
        self.pending_address.take()
    }

    fn configuration_value(&self) -> u8 {
        self.descriptors.configuration.get(5).copied().unwrap_or(1)
    }

    fn self_powered(&self) -> bool {
        self.descriptors
            .configuration
            .get(7)
            .map_or(false, |attr| attr & CONFIG_SELF_POWERED != 0)
    }

    fn descriptor(&self, req: &SetupRequest) -> Option<&'a [u8]> {
        match req.value_hi() {
            DESC_DEVICE => Some(self.descriptors.device),
            DESC_CONFIGURATION if req.value_lo() == 0 => Some(self.descriptors.configuration),
            DESC_STRING => self.descriptors.strings.get(req.value_lo() as usize).copied(),
            _ => None,
        }
    }
}

fn check(cond: bool) -> Result<(), Stall> {
    if cond {
        Ok(())
    } else {
        Err(Stall)
    }
}

impl RequestHandler for StandardRequests<'_> {
    fn validate(&mut self, req: &SetupRequest, _state: UsbDeviceState) -> Result<(), Stall> {
        let configured = self.state == UsbDeviceState::Configured;
        let addressed = configured || self.state == UsbDeviceState::Addressed;

        match (req.is_in(), req.request) {
            (true, Request::GET_STATUS) => check(req.length >= 2),
            (true, Request::GET_DESCRIPTOR) => check(self.descriptor(req).is_some()),
            (true, Request::GET_CONFIGURATION) => check(addressed && req.length >= 1),
            (true, Request::GET_INTERFACE) => check(configured && req.length >= 1),
            (false, Request::CLEAR_FEATURE) | (false, Request::SET_FEATURE) => {
                match (req.recipient, req.value) {
                    (Recipient::Device, Request::FEATURE_DEVICE_REMOTE_WAKEUP) => Ok(()),
                    (Recipient::Endpoint, Request::FEATURE_ENDPOINT_HALT) => {
                        // only endpoint 0 exists
                        check(req.index & 0x0f == 0)
                    }
                    _ => Err(Stall),
                }
            }
            (false, Request::SET_ADDRESS) => check(
                req.recipient == Recipient::Device
                    && req.value <= 127
                    && req.index == 0
                    && req.length == 0
                    && !configured,
            ),
            (false, Request::SET_CONFIGURATION) => {
                let value = req.value_lo();
                check(addressed && (value == 0 || value == self.configuration_value()))
            }
            (false, Request::SET_INTERFACE) => check(configured && req.value == 0),
            _ => Err(Stall),
        }
    }

    fn execute_get(&mut self, req: &SetupRequest, buf: &mut [u8]) -> Result<usize, Stall> {
        match req.request {
            Request::GET_STATUS => {
                let status = match req.recipient {
                    Recipient::Device => {
                        (self.self_powered() as u16) | ((self.remote_wakeup as u16) << 1)
                    }
                    _ => 0,
                };
                buf[..2].copy_from_slice(&status.to_le_bytes());
                Ok(2)
            }
            Request::GET_DESCRIPTOR => {
                let desc = self.descriptor(req).ok_or(Stall)?;
                let n = min(desc.len(), buf.len());
                buf[..n].copy_from_slice(&desc[..n]);
                Ok(n)
            }
            Request::GET_CONFIGURATION => {
                buf[0] = self.configuration;
                Ok(1)
            }
            Request::GET_INTERFACE => {
                buf[0] = 0;
                Ok(1)
            }
            _ => Err(Stall),
        }
    }

    fn execute_set(&mut self, req: &SetupRequest, _data: &[u8]) -> Result<(), Stall> {
        match req.request {
            Request::SET_ADDRESS => {
                self.address = req.value as u8;
                self.pending_address = Some(self.address);
                self.state = if self.address == 0 {
                    UsbDeviceState::Default
                } else {
                    UsbDeviceState::Addressed
                };
                debug!("address {}", self.address);
            }
            Request::SET_CONFIGURATION => {
                self.configuration = req.value_lo();
                self.state = if self.configuration == 0 {
                    UsbDeviceState::Addressed
                } else {
                    UsbDeviceState::Configured
                };
                debug!("configuration {}", self.configuration);
            }
            Request::SET_FEATURE | Request::CLEAR_FEATURE => {
                if req.recipient == Recipient::Device {
                    self.remote_wakeup = req.request == Request::SET_FEATURE;
                }
            }
            Request::SET_INTERFACE => {}
            _ => return Err(Stall),
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.state = UsbDeviceState::Default;
        self.pending_address = None;
        self.address = 0;
        self.configuration = 0;
        self.remote_wakeup = false;
    }
}
