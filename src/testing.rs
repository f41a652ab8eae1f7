//! RAM-backed flash and request builders for unit tests.

use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

use crate::flash::{DfuManifestationError, DfuMemoryError, FlashProgrammer};
use crate::setup::SetupRequest;

pub const BASE: u32 = 0x0800_4000;
pub const PAGE: u32 = 1024;
pub const SIZE: u32 = 16 * PAGE;

/// Instrumented flash. Starts out programmed with zeros.
pub struct TestFlash {
    mem: Vec<u8>,
    pub erase_calls: usize,
    pub erased_pages: Vec<u32>,
    pub program_calls: usize,
    pub programmed: Vec<u32>,
    pub manifest_calls: usize,
    pub reset_calls: usize,
    pub fail_erase_check: bool,
    pub fail_program: bool,
    pub corrupt_program: bool,
    pub fail_manifestation: bool,
}

impl TestFlash {
    pub fn new() -> Self {
        Self {
            mem: vec![0; SIZE as usize],
            erase_calls: 0,
            erased_pages: Vec::new(),
            program_calls: 0,
            programmed: Vec::new(),
            manifest_calls: 0,
            reset_calls: 0,
            fail_erase_check: false,
            fail_program: false,
            corrupt_program: false,
            fail_manifestation: false,
        }
    }

    pub fn erase_everything(&mut self) {
        self.mem.fill(0xff);
    }

    pub fn fill(&mut self, address: u32, data: &[u8]) {
        let offset = (address - BASE) as usize;
        self.mem[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn contents(&self, address: u32, length: usize) -> &[u8] {
        let offset = (address - BASE) as usize;
        &self.mem[offset..offset + length]
    }
}

impl FlashProgrammer for TestFlash {
    const INITIAL_ADDRESS_POINTER: u32 = BASE;
    const PAGE_SIZE: u32 = PAGE;

    fn address_in_range(&self, address: u32) -> bool {
        (BASE..BASE + SIZE).contains(&address)
    }

    fn is_erased(&mut self, address: u32, word_count: usize) -> bool {
        if self.fail_erase_check {
            return false;
        }
        let offset = (address - BASE) as usize;
        let end = (offset + word_count * 4).min(self.mem.len());
        self.mem[offset..end].iter().all(|b| *b == 0xff)
    }

    fn erase_page(&mut self, address: u32) -> Result<(), DfuMemoryError> {
        if !self.address_in_range(address) || address % PAGE != 0 {
            return Err(DfuMemoryError::Address);
        }
        self.erase_calls += 1;
        self.erased_pages.push(address);
        let offset = (address - BASE) as usize;
        self.mem[offset..offset + PAGE as usize].fill(0xff);
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), DfuMemoryError> {
        self.erase_calls += 1;
        self.erase_everything();
        Ok(())
    }

    fn program(&mut self, address: u32, words: &[u32]) -> Result<(), DfuMemoryError> {
        self.program_calls += 1;
        self.programmed.push(address);
        if self.fail_program {
            return Err(DfuMemoryError::Prog);
        }
        let offset = (address - BASE) as usize;
        for (i, word) in words.iter().enumerate() {
            let at = offset + i * 4;
            let end = (at + 4).min(self.mem.len());
            self.mem[at..end].copy_from_slice(&word.to_le_bytes()[..end - at]);
        }
        if self.corrupt_program {
            self.mem[offset] ^= 0x01;
        }
        Ok(())
    }

    fn read(&mut self, address: u32, length: usize) -> Result<&[u8], DfuMemoryError> {
        if !self.address_in_range(address) {
            return Err(DfuMemoryError::Address);
        }
        let offset = (address - BASE) as usize;
        let end = (offset + length).min(self.mem.len());
        Ok(&self.mem[offset..end])
    }

    fn estimate_program_time_ms(&self, word_count: usize) -> u32 {
        // ~70us per word
        (word_count as u32 * 70 + 999) / 1000
    }

    fn manifestation(&mut self) -> Result<(), DfuManifestationError> {
        self.manifest_calls += 1;
        if self.fail_manifestation {
            Err(DfuManifestationError::Firmware)
        } else {
            Ok(())
        }
    }

    fn usb_reset(&mut self) {
        self.reset_calls += 1;
    }
}

/// Class request addressed to interface 0.
pub fn class_req(is_in: bool, request: u8, value: u16, length: u16) -> SetupRequest {
    SetupRequest {
        direction: if is_in {
            UsbDirection::In
        } else {
            UsbDirection::Out
        },
        category: RequestType::Class,
        recipient: Recipient::Interface,
        request,
        value,
        index: 0,
        length,
    }
}
