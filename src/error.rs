//! Control pipe error

use usb_device::UsbError;

/// Request was rejected and endpoint 0 must be stalled.
///
/// Stalling is fatal for the current control transfer only. The host is
/// expected to start over with a fresh SETUP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Stall;

impl From<UsbError> for Stall {
    fn from(_: UsbError) -> Self {
        Stall
    }
}
