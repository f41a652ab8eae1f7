#![allow(dead_code)]

use std::collections::VecDeque;

use usbd_dfu_ctrl::usb_device::endpoint::EndpointAddress;
use usbd_dfu_ctrl::usb_device::{UsbDirection, UsbError};
use usbd_dfu_ctrl::*;

pub const BASE: u32 = 0x0800_8000;
pub const PAGE: u32 = 2048;
pub const SIZE: u32 = 8 * PAGE;

pub static DEVICE: [u8; 18] = [
    18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x83, 0x04, 0x11, 0xdf, 0x00, 0x22, 0, 0, 0, 1,
];

pub static CONFIG: [u8; 27] = [
    9, 2, 27, 0, 1, 1, 0, 0x80, 50, //
    9, 4, 0, 0, 0, 0xfe, 0x01, 0x02, 0, //
    9, 0x21, 0x0b, 250, 0, 128, 0, 0x10, 0x01,
];

pub static LANG: [u8; 4] = [4, 3, 0x09, 0x04];

/// 64-byte string descriptor, a multiple of the packet size.
pub static PRODUCT: [u8; 64] = {
    let mut s = [0u8; 64];
    s[0] = 64;
    s[1] = 3;
    let mut i = 2;
    while i < 64 {
        s[i] = if i % 2 == 0 { b'a' } else { 0 };
        i += 1;
    }
    s
};

pub static STRINGS: [&[u8]; 2] = [&LANG, &PRODUCT];

pub fn descriptors() -> Descriptors<'static> {
    Descriptors {
        device: &DEVICE,
        configuration: &CONFIG,
        strings: &STRINGS,
    }
}

/// Something the engine did to the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    In(Vec<u8>),
    Stall(UsbDirection),
    Address(u8),
}

/// Records everything written to endpoint 0 and replays queued packets.
#[derive(Default)]
pub struct MockUsb {
    pub setup: Option<Vec<u8>>,
    pub out: VecDeque<Vec<u8>>,
    pub events: Vec<Event>,
}

impl MockUsb {
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn stalled(&self) -> bool {
        self.events.iter().any(|e| matches!(e, Event::Stall(_)))
    }

    pub fn in_packets(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::In(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Transceiver for MockUsb {
    fn read_setup(&mut self, buf: &mut [u8]) -> usb_device::Result<usize> {
        let packet = self.setup.take().ok_or(UsbError::WouldBlock)?;
        if packet.len() > buf.len() {
            return Err(UsbError::BufferOverflow);
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn read_out(&mut self, ep: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        assert_eq!(ep.index(), 0);
        let packet = self.out.pop_front().unwrap_or_default();
        if packet.len() > buf.len() {
            return Err(UsbError::BufferOverflow);
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn write_in(&mut self, ep: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        assert_eq!(ep.index(), 0);
        self.events.push(Event::In(buf.to_vec()));
        Ok(buf.len())
    }

    fn set_stall(&mut self, ep: EndpointAddress) {
        self.events.push(Event::Stall(ep.direction()));
    }

    fn set_device_address(&mut self, addr: u8) {
        self.events.push(Event::Address(addr));
    }
}

/// RAM-backed flash, starts erased.
pub struct RamFlash {
    pub mem: Vec<u8>,
    pub erased_pages: Vec<u32>,
    pub manifested: bool,
    pub resets: usize,
}

impl RamFlash {
    pub fn new() -> Self {
        Self {
            mem: vec![0xff; SIZE as usize],
            erased_pages: Vec::new(),
            manifested: false,
            resets: 0,
        }
    }

    pub fn at(&self, address: u32, length: usize) -> &[u8] {
        let offset = (address - BASE) as usize;
        &self.mem[offset..offset + length]
    }
}

impl FlashProgrammer for RamFlash {
    const INITIAL_ADDRESS_POINTER: u32 = BASE;
    const PAGE_SIZE: u32 = PAGE;

    fn address_in_range(&self, address: u32) -> bool {
        (BASE..BASE + SIZE).contains(&address)
    }

    fn is_erased(&mut self, address: u32, word_count: usize) -> bool {
        let offset = (address - BASE) as usize;
        let end = (offset + word_count * 4).min(self.mem.len());
        self.mem[offset..end].iter().all(|b| *b == 0xff)
    }

    fn erase_page(&mut self, address: u32) -> Result<(), DfuMemoryError> {
        self.erased_pages.push(address);
        let offset = (address - BASE) as usize;
        self.mem[offset..offset + PAGE as usize].fill(0xff);
        Ok(())
    }

    fn program(&mut self, address: u32, words: &[u32]) -> Result<(), DfuMemoryError> {
        let offset = (address - BASE) as usize;
        for (i, word) in words.iter().enumerate() {
            let at = offset + i * 4;
            // NOR flash only clears bits
            for (b, w) in self.mem[at..at + 4].iter_mut().zip(word.to_le_bytes()) {
                *b &= w;
            }
        }
        Ok(())
    }

    fn read(&mut self, address: u32, length: usize) -> Result<&[u8], DfuMemoryError> {
        let offset = (address - BASE) as usize;
        let end = (offset + length).min(self.mem.len());
        Ok(&self.mem[offset..end])
    }

    fn estimate_program_time_ms(&self, word_count: usize) -> u32 {
        2 + word_count as u32 / 8
    }

    fn manifestation(&mut self) -> Result<(), DfuManifestationError> {
        self.manifested = true;
        Ok(())
    }

    fn usb_reset(&mut self) {
        self.resets += 1;
    }
}

pub fn setup_bytes(bm_request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Vec<u8> {
    let v = value.to_le_bytes();
    let i = index.to_le_bytes();
    let l = length.to_le_bytes();
    vec![bm_request_type, request, v[0], v[1], i[0], i[1], l[0], l[1]]
}

/// Host side of endpoint 0.
pub struct Host<'a, C: RequestHandler> {
    pub pipe: ControlPipe<MockUsb>,
    pub dispatcher: Dispatcher<'a, C>,
}

impl<C: RequestHandler> Host<'static, C> {
    pub fn new(class: C) -> Self {
        Self {
            pipe: ControlPipe::new(MockUsb::default(), 64),
            dispatcher: Dispatcher::new(StandardRequests::new(descriptors()), class),
        }
    }
}

impl<C: RequestHandler> Host<'_, C> {
    pub fn usb(&mut self) -> &mut MockUsb {
        self.pipe.transceiver_mut()
    }

    pub fn send_setup(&mut self, packet: Vec<u8>) -> Result<(), Stall> {
        self.usb().setup = Some(packet);
        self.pipe.handle(&mut self.dispatcher, Transaction::Setup)
    }

    /// Runs a complete device-to-host transfer and returns the data.
    pub fn control_in(
        &mut self,
        bm_request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, Stall> {
        self.usb().take_events();
        self.send_setup(setup_bytes(bm_request_type, request, value, index, length))?;

        let mut data = Vec::new();
        loop {
            let events = self.usb().take_events();
            let mut sent = false;
            for event in events {
                match event {
                    Event::In(packet) => {
                        data.extend_from_slice(&packet);
                        sent = true;
                    }
                    Event::Stall(_) => return Err(Stall),
                    Event::Address(_) => {}
                }
            }
            if !sent {
                break;
            }
            self.pipe.handle(&mut self.dispatcher, Transaction::InComplete)?;
            if self.pipe.state() == ControlState::StatusOut {
                break;
            }
        }

        // status stage
        self.usb().out.push_back(Vec::new());
        self.pipe.handle(&mut self.dispatcher, Transaction::OutComplete)?;
        Ok(data)
    }

    /// Runs a complete host-to-device transfer.
    pub fn control_out(
        &mut self,
        bm_request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), Stall> {
        self.usb().take_events();
        self.send_setup(setup_bytes(
            bm_request_type,
            request,
            value,
            index,
            data.len() as u16,
        ))?;

        for chunk in data.chunks(64) {
            self.usb().out.push_back(chunk.to_vec());
            self.pipe.handle(&mut self.dispatcher, Transaction::OutComplete)?;
        }

        // status stage queued, completes when the host reads it
        assert_eq!(self.pipe.state(), ControlState::StatusIn);
        assert_eq!(self.usb().take_events().last(), Some(&Event::In(Vec::new())));
        self.pipe.handle(&mut self.dispatcher, Transaction::InComplete)
    }

    pub fn enumerate(&mut self, address: u8) {
        self.control_out(0x00, 0x05, address as u16, 0, &[]).unwrap();
        self.control_out(0x00, 0x09, 1, 0, &[]).unwrap();
    }

    pub fn bus_reset(&mut self) {
        self.pipe
            .handle(&mut self.dispatcher, Transaction::Reset)
            .unwrap();
    }
}

pub const DFU_DNLOAD: u8 = 0x01;
pub const DFU_UPLOAD: u8 = 0x02;
pub const DFU_GETSTATUS: u8 = 0x03;
pub const DFU_CLRSTATUS: u8 = 0x04;
pub const DFU_GETSTATE: u8 = 0x05;
pub const DFU_ABORT: u8 = 0x06;

/// `(bStatus, bwPollTimeout, bState)`
pub fn get_status<C: RequestHandler>(host: &mut Host<'_, C>) -> Result<(u8, u32, u8), Stall> {
    let reply = host.control_in(0xa1, DFU_GETSTATUS, 0, 0, 6)?;
    assert_eq!(reply.len(), 6);
    Ok((
        reply[0],
        u32::from_le_bytes([reply[1], reply[2], reply[3], 0]),
        reply[4],
    ))
}

pub fn dnload<C: RequestHandler>(host: &mut Host<'_, C>, block: u16, data: &[u8]) -> Result<(), Stall> {
    host.control_out(0x21, DFU_DNLOAD, block, 0, data)
}
