//! SETUP packet decoding

use usb_device::control::{Recipient, RequestType};
use usb_device::{UsbDirection, UsbError};

/// A decoded 8-byte SETUP packet.
///
/// Created once per control transfer and never modified afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupRequest {
    /// Data stage direction (bit 7 of `bmRequestType`).
    pub direction: UsbDirection,
    /// Standard, class or vendor request (bits 5..6 of `bmRequestType`).
    pub category: RequestType,
    /// Addressed entity (bits 0..4 of `bmRequestType`).
    pub recipient: Recipient,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`, the maximum number of bytes in the data stage.
    pub length: u16,
}

impl SetupRequest {
    /// Size of a SETUP packet on the wire.
    pub const SIZE: usize = 8;

    /// Decodes a SETUP packet. Anything but exactly 8 bytes is rejected.
    pub fn parse(buf: &[u8]) -> Result<Self, UsbError> {
        if buf.len() != Self::SIZE {
            return Err(UsbError::ParseError);
        }

        let rt = buf[0];

        let direction = if rt & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        };

        let category = match (rt >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        };

        let recipient = match rt & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        };

        Ok(Self {
            direction,
            category,
            recipient,
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    /// Encodes the request back into its wire form.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let direction = match self.direction {
            UsbDirection::In => 0x80,
            UsbDirection::Out => 0x00,
        };
        let category = match self.category {
            RequestType::Standard => 0,
            RequestType::Class => 1,
            RequestType::Vendor => 2,
            RequestType::Reserved => 3,
        };
        let recipient = match self.recipient {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
            Recipient::Reserved => 0x1f,
        };
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();

        [
            direction | (category << 5) | recipient,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// `true` for device-to-host transfers.
    pub fn is_in(&self) -> bool {
        self.direction == UsbDirection::In
    }

    /// Low byte of `wValue`.
    pub fn value_lo(&self) -> u8 {
        (self.value & 0xff) as u8
    }

    /// High byte of `wValue`.
    pub fn value_hi(&self) -> u8 {
        (self.value >> 8) as u8
    }
}
