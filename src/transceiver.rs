//! Packet memory access for endpoint 0

use usb_device::endpoint::EndpointAddress;
use usb_device::{Result, UsbDirection};

/// Transaction-complete signal reported by the USB peripheral for endpoint 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Transaction {
    /// A SETUP packet was received and can be read with [`Transceiver::read_setup`].
    Setup,
    /// An IN packet previously queued with [`Transceiver::write_in`] was sent.
    InComplete,
    /// An OUT packet was received and can be read with [`Transceiver::read_out`].
    OutComplete,
    /// USB bus reset was detected.
    Reset,
}

/// Raw endpoint buffer access provided by the USB peripheral driver.
///
/// Implementations only move bytes between packet memory and RAM, all
/// protocol decisions are taken by [`ControlPipe`](crate::control::ControlPipe).
pub trait Transceiver {
    /// Copies the last received SETUP packet into `buf` and returns its length.
    fn read_setup(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Copies the last received OUT packet for `ep` into `buf`.
    ///
    /// Must return [`UsbError::BufferOverflow`](usb_device::UsbError::BufferOverflow)
    /// if the packet does not fit.
    fn read_out(&mut self, ep: EndpointAddress, buf: &mut [u8]) -> Result<usize>;

    /// Queues `buf` for transmission on `ep`.
    fn write_in(&mut self, ep: EndpointAddress, buf: &[u8]) -> Result<usize>;

    /// Queues a zero-length packet on `ep`.
    fn send_zero_length(&mut self, ep: EndpointAddress) -> Result<()> {
        self.write_in(ep, &[]).map(|_| ())
    }

    /// Answers the next token on `ep` with STALL.
    fn set_stall(&mut self, ep: EndpointAddress);

    /// Switches the device to a new bus address.
    fn set_device_address(&mut self, addr: u8);
}

/// Endpoint 0, host-to-device.
pub fn ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// Endpoint 0, device-to-host.
pub fn ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}
