use core::cmp::min;

use usb_device::control::Recipient;
use usb_device::prelude::UsbDeviceState;

use crate::dispatch::RequestHandler;
use crate::error::Stall;
use crate::flash::{DfuManifestationError, DfuMemoryError, FlashProgrammer};
use crate::setup::SetupRequest;

/// `DFU_DETACH` request code.
pub const DFU_DETACH: u8 = 0x00;
/// `DFU_DNLOAD` request code.
pub const DFU_DNLOAD: u8 = 0x01;
/// `DFU_UPLOAD` request code.
pub const DFU_UPLOAD: u8 = 0x02;
/// `DFU_GETSTATUS` request code.
pub const DFU_GETSTATUS: u8 = 0x03;
/// `DFU_CLRSTATUS` request code.
pub const DFU_CLRSTATUS: u8 = 0x04;
/// `DFU_GETSTATE` request code.
pub const DFU_GETSTATE: u8 = 0x05;
/// `DFU_ABORT` request code.
pub const DFU_ABORT: u8 = 0x06;

const DESC_DESCTYPE_DFU: u8 = 0x21;

/// Largest supported block, bounded by the control pipe buffer.
pub const MAX_TRANSFER_SIZE: usize = crate::control::CONTROL_BUFFER_SIZE;

/// Size of the `DFU_GETSTATUS` reply.
pub const STATUS_SIZE: usize = 6;

// bwPollTimeout is a 24-bit field
const MAX_POLL_TIMEOUT: u32 = 0x00ff_ffff;

/// DFU mode state, encoded as `bState`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuState {
    /// Device is operating in the DFU mode and is waiting for requests.
    Idle = 2,
    /// Device has received a block and is waiting for the host to solicit the status via DFU_GETSTATUS.
    DnloadSync = 3,
    /// Device is programming a control-write block into its nonvolatile memories.
    DnBusy = 4,
    /// Device is processing a download operation. Expecting DFU_DNLOAD requests.
    DnloadIdle = 5,
    /// Device has received the final block of firmware from the host and is waiting for
    /// receipt of DFU_GETSTATUS to begin the Manifestation phase; or device has completed
    /// the Manifestation phase and is waiting for receipt of DFU_GETSTATUS.
    ManifestSync = 6,
    /// Device is in the Manifestation phase.
    Manifest = 7,
    /// Device has programmed its memories and is waiting for a USB reset or a power on reset.
    ManifestWaitReset = 8,
    /// The device is processing an upload operation. Expecting DFU_UPLOAD requests.
    UploadIdle = 9,
    /// An error has occurred. Awaiting the DFU_CLRSTATUS request.
    Error = 10,
}

impl DfuState {
    /// Every DFU mode state.
    pub const ALL: [DfuState; 9] = [
        DfuState::Idle,
        DfuState::DnloadSync,
        DfuState::DnBusy,
        DfuState::DnloadIdle,
        DfuState::ManifestSync,
        DfuState::Manifest,
        DfuState::ManifestWaitReset,
        DfuState::UploadIdle,
        DfuState::Error,
    ];
}

/// `bStatus` codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuStatusCode {
    /// No error condition is present.
    Ok = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File is for this device but fails some vendor-specific verification test.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase function failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    ErrCheckErased = 0x05,
    /// Program memory function failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Cannot program memory due to received address that is out of range.
    ErrAddress = 0x08,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    ErrNotdone = 0x09,
    /// Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    ErrFirmware = 0x0A,
    /// iString indicates a vendor-specific error.
    ErrVendor = 0x0B,
    /// Device detected unexpected USB reset signaling.
    ErrUsbr = 0x0C,
    /// Device detected unexpected power on reset.
    ErrPOR = 0x0D,
    /// Something went wrong, but the device does not know what it was.
    ErrUnknown = 0x0E,
    /// Device stalled an unexpected request.
    ErrStalledPkt = 0x0F,
}

impl From<DfuMemoryError> for DfuStatusCode {
    fn from(e: DfuMemoryError) -> Self {
        match e {
            DfuMemoryError::Target => DfuStatusCode::ErrTarget,
            DfuMemoryError::File => DfuStatusCode::ErrFile,
            DfuMemoryError::Write => DfuStatusCode::ErrWrite,
            DfuMemoryError::Erase => DfuStatusCode::ErrErase,
            DfuMemoryError::CheckErased => DfuStatusCode::ErrCheckErased,
            DfuMemoryError::Prog => DfuStatusCode::ErrProg,
            DfuMemoryError::Verify => DfuStatusCode::ErrVerify,
            DfuMemoryError::Address => DfuStatusCode::ErrAddress,
            DfuMemoryError::Vendor => DfuStatusCode::ErrVendor,
            DfuMemoryError::Unknown => DfuStatusCode::ErrUnknown,
        }
    }
}

impl From<DfuManifestationError> for DfuStatusCode {
    fn from(e: DfuManifestationError) -> Self {
        match e {
            DfuManifestationError::Target => DfuStatusCode::ErrTarget,
            DfuManifestationError::File => DfuStatusCode::ErrFile,
            DfuManifestationError::NotDone => DfuStatusCode::ErrNotdone,
            DfuManifestationError::Firmware => DfuStatusCode::ErrFirmware,
            DfuManifestationError::Vendor => DfuStatusCode::ErrVendor,
            DfuManifestationError::Unknown => DfuStatusCode::ErrUnknown,
        }
    }
}

/// Snapshot returned by `DFU_GETSTATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct DfuStatus {
    /// `bStatus`, sticky until `DFU_CLRSTATUS` or bus reset.
    pub status_code: DfuStatusCode,
    /// `bwPollTimeout`, nonzero only while the state is [`DfuState::DnBusy`].
    pub poll_timeout_ms: u32,
    /// `bState`
    pub state: DfuState,
    /// `iString`
    pub string_index: u8,
}

impl From<DfuStatus> for [u8; STATUS_SIZE] {
    fn from(dfu: DfuStatus) -> Self {
        let timeout = dfu.poll_timeout_ms.to_le_bytes();
        [
            // bStatus
            dfu.status_code as u8,
            // bwPollTimeout
            timeout[0],
            timeout[1],
            timeout[2],
            // bState
            dfu.state as u8,
            // iString
            dfu.string_index,
        ]
    }
}

/// Block received by `DFU_DNLOAD`, waiting to be programmed.
///
/// The data lives in the class' block buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingBlock {
    pub block_num: u16,
    pub length: u16,
    /// `None` if the address computation overflowed.
    pub target: Option<u32>,
    /// Address pointer value to adopt after the block was programmed.
    pub next_pointer: Option<u32>,
}

/// Returns `true` if `request` may be issued in `state`.
pub fn request_allowed(request: u8, state: DfuState) -> bool {
    use DfuState::*;

    match request {
        DFU_DNLOAD => matches!(state, Idle | DnloadIdle),
        DFU_UPLOAD => matches!(state, Idle | UploadIdle),
        DFU_GETSTATUS | DFU_GETSTATE => !matches!(state, DnBusy | Manifest | ManifestWaitReset),
        DFU_CLRSTATUS => state == Error,
        DFU_ABORT => matches!(state, Idle | DnloadSync | DnloadIdle | ManifestSync | UploadIdle),
        // DFU_DETACH is a run-time request
        _ => false,
    }
}

/// Plain DFU 1.1 class.
///
/// Blocks are written sequentially starting at
/// [`INITIAL_ADDRESS_POINTER`](FlashProgrammer::INITIAL_ADDRESS_POINTER); the
/// block number is not used for addressing.
pub struct DfuClass<F: FlashProgrammer> {
    if_num: u8,
    status: DfuStatus,
    address_pointer: u32,
    block: Option<PendingBlock>,
    manifest_pending: bool,
    /// Pages starting below this address hold data of the current session
    /// and are never erased again.
    erase_mark: Option<u32>,
    buffer: [u8; MAX_TRANSFER_SIZE],
    flash: F,
}

impl<F: FlashProgrammer> DfuClass<F> {
    const CONFIG_OK: () = assert!(
        F::TRANSFER_SIZE as usize <= MAX_TRANSFER_SIZE && F::TRANSFER_SIZE > 0 && F::PAGE_SIZE > 0,
        "TRANSFER_SIZE must fit the control buffer and PAGE_SIZE must not be zero"
    );

    /// Creates a DFU class for interface number `if_num`, using `flash` for
    /// all memory operations.
    ///
    /// Fails to build if [`TRANSFER_SIZE`](FlashProgrammer::TRANSFER_SIZE)
    /// exceeds [`MAX_TRANSFER_SIZE`] or [`PAGE_SIZE`](FlashProgrammer::PAGE_SIZE)
    /// is zero:
    ///
    /// ```compile_fail
    /// # use usbd_dfu_ctrl::*;
    /// struct NoPages;
    ///
    /// impl FlashProgrammer for NoPages {
    ///     const INITIAL_ADDRESS_POINTER: u32 = 0x0800_0000;
    ///     const PAGE_SIZE: u32 = 0;
    /// #   fn address_in_range(&self, _: u32) -> bool { false }
    /// #   fn is_erased(&mut self, _: u32, _: usize) -> bool { true }
    /// #   fn erase_page(&mut self, _: u32) -> Result<(), DfuMemoryError> { Ok(()) }
    /// #   fn program(&mut self, _: u32, _: &[u32]) -> Result<(), DfuMemoryError> { Ok(()) }
    /// #   fn read(&mut self, _: u32, _: usize) -> Result<&[u8], DfuMemoryError> { Ok(&[]) }
    /// #   fn estimate_program_time_ms(&self, _: usize) -> u32 { 1 }
    /// }
    ///
    /// let _ = DfuClass::new(NoPages, 0);
    /// ```
    pub fn new(flash: F, if_num: u8) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CONFIG_OK;

        Self {
            if_num,
            status: DfuStatus {
                status_code: DfuStatusCode::Ok,
                poll_timeout_ms: 0,
                state: DfuState::Idle,
                string_index: 0,
            },
            address_pointer: F::INITIAL_ADDRESS_POINTER,
            block: None,
            manifest_pending: false,
            erase_mark: None,
            buffer: [0; MAX_TRANSFER_SIZE],
            flash,
        }
    }

    /// Consumes the class and returns the flash programmer.
    pub fn release(self) -> F {
        self.flash
    }

    /// Flash programmer.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Flash programmer.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Current state.
    pub fn state(&self) -> DfuState {
        self.status.state
    }

    /// Current status, as the next `DFU_GETSTATUS` would see it before any
    /// transition.
    pub fn status(&self) -> DfuStatus {
        self.status
    }

    /// Current address pointer.
    pub fn address_pointer(&self) -> u32 {
        self.address_pointer
    }

    /// Interface number this class answers to.
    pub fn interface_number(&self) -> u8 {
        self.if_num
    }

    /// May be called just after [`DfuClass::new()`] to start in `dfuERROR`
    /// with "Device detected unexpected power on reset".
    pub fn set_unexpected_reset_state(&mut self) {
        self.fail(DfuStatusCode::ErrPOR);
    }

    /// May be called just after [`DfuClass::new()`] to start in `dfuERROR`
    /// with "Device's firmware is corrupt".
    pub fn set_firmware_corrupted_state(&mut self) {
        self.fail(DfuStatusCode::ErrFirmware);
    }

    /// DFU functional descriptor for the configuration descriptor.
    pub fn functional_descriptor() -> [u8; 9] {
        functional_descriptor::<F>(0x0110)
    }

    pub(crate) fn set_state(&mut self, state: DfuState) {
        if self.status.state != state {
            trace!("dfu {} -> {}", self.status.state, state);
        }
        self.status.state = state;
    }

    pub(crate) fn fail(&mut self, code: DfuStatusCode) {
        warn!("dfu error {} in {}", code, self.status.state);
        self.status.status_code = code;
        self.status.poll_timeout_ms = 0;
        self.block = None;
        self.manifest_pending = false;
        self.set_state(DfuState::Error);
    }

    /// Protocol violation: the request is stalled and the class enters `dfuERROR`.
    pub(crate) fn reject(&mut self) -> Result<(), Stall> {
        self.fail(DfuStatusCode::ErrStalledPkt);
        Err(Stall)
    }

    pub(crate) fn set_address_pointer(&mut self, address: u32) {
        self.address_pointer = address;
    }

    fn return_to_idle(&mut self) {
        self.block = None;
        self.manifest_pending = false;
        self.erase_mark = None;
        self.address_pointer = F::INITIAL_ADDRESS_POINTER;
        self.status.poll_timeout_ms = 0;
        self.set_state(DfuState::Idle);
    }

    /// Checks recipient, interface, device state and the request legality table.
    pub(crate) fn validate_common(
        &mut self,
        req: &SetupRequest,
        state: UsbDeviceState,
    ) -> Result<(), Stall> {
        if req.recipient != Recipient::Interface
            || req.index != self.if_num as u16
            || state != UsbDeviceState::Configured
        {
            // not for us, leave the DFU state alone
            return Err(Stall);
        }

        let direction_ok = match req.request {
            DFU_UPLOAD | DFU_GETSTATUS | DFU_GETSTATE => req.is_in(),
            _ => !req.is_in(),
        };

        let params_ok = match req.request {
            DFU_DNLOAD => F::HAS_DOWNLOAD && req.length <= F::TRANSFER_SIZE,
            DFU_UPLOAD => F::HAS_UPLOAD,
            DFU_GETSTATUS => req.length as usize >= STATUS_SIZE,
            DFU_GETSTATE => req.length >= 1,
            _ => true,
        };

        if direction_ok && params_ok && request_allowed(req.request, self.status.state) {
            Ok(())
        } else {
            debug!("dfu request {} rejected in {}", req.request, self.status.state);
            self.reject()
        }
    }

    /// Copies `data` into the block buffer and enters `dfuDNLOAD-SYNC`.
    pub(crate) fn capture_block(
        &mut self,
        block_num: u16,
        data: &[u8],
        target: Option<u32>,
        next_pointer: Option<u32>,
    ) {
        let length = min(data.len(), self.buffer.len());
        self.buffer[..length].copy_from_slice(&data[..length]);
        self.block = Some(PendingBlock {
            block_num,
            length: length as u16,
            target,
            next_pointer,
        });
        self.set_state(DfuState::DnloadSync);
    }

    /// Zero-length `DFU_DNLOAD`, end of the image.
    pub(crate) fn begin_manifestation(&mut self) {
        self.block = None;
        self.manifest_pending = true;
        self.set_state(DfuState::ManifestSync);
    }

    fn region_contains(&self, address: u32, length: usize) -> bool {
        let last = match length.checked_sub(1) {
            Some(offset) => address.checked_add(offset as u32),
            None => Some(address),
        };
        match last {
            Some(last) => self.flash.address_in_range(address) && self.flash.address_in_range(last),
            None => false,
        }
    }

    /// Erases, programs and verifies the pending block.
    fn program_block(&mut self) {
        let Some(block) = self.block.take() else {
            self.set_state(DfuState::DnloadSync);
            return;
        };

        let length = block.length as usize;
        let word_count = (length + 3) / 4;

        let target = match block.target {
            Some(target) if self.region_contains(target, length) => target,
            _ => {
                warn!("block {} outside programmable region", block.block_num);
                self.fail(DfuStatusCode::ErrAddress);
                return;
            }
        };

        if !self.flash.is_erased(target, word_count) {
            let end = target as u64 + length as u64;
            let mut page = (target - target % F::PAGE_SIZE) as u64;
            while page < end {
                let start = page as u32;
                let written = self.erase_mark.map_or(false, |mark| start < mark);
                // a page shared with earlier blocks or starting outside the
                // region is left alone, the erase check below catches it
                if !written && self.flash.address_in_range(start) {
                    trace!("erase page {=u32:#x}", start);
                    if let Err(e) = self.flash.erase_page(start) {
                        self.fail(e.into());
                        return;
                    }
                    self.erase_mark = Some(start.saturating_add(F::PAGE_SIZE));
                }
                page += F::PAGE_SIZE as u64;
            }

            if !self.flash.is_erased(target, word_count) {
                self.fail(DfuStatusCode::ErrCheckErased);
                return;
            }
        }

        let mut words = [u32::MAX; MAX_TRANSFER_SIZE / 4];
        for (word, chunk) in words.iter_mut().zip(self.buffer[..length].chunks(4)) {
            let mut bytes = [0xff; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            *word = u32::from_le_bytes(bytes);
        }

        if let Err(e) = self.flash.program(target, &words[..word_count]) {
            self.fail(e.into());
            return;
        }

        let verified = match self.flash.read(target, length) {
            Ok(written) => written == &self.buffer[..length],
            Err(_) => false,
        };
        if !verified {
            self.fail(DfuStatusCode::ErrVerify);
            return;
        }

        debug!("block {} programmed at {=u32:#x}", block.block_num, target);

        let written_end = target.saturating_add(length as u32);
        self.erase_mark = Some(self.erase_mark.map_or(written_end, |mark| mark.max(written_end)));

        if let Some(next) = block.next_pointer {
            self.address_pointer = next;
        }
        self.status.poll_timeout_ms = 0;
        self.set_state(DfuState::DnloadSync);
    }

    fn manifest(&mut self) {
        match self.flash.manifestation() {
            Ok(()) => {
                self.manifest_pending = false;
                self.set_state(DfuState::ManifestSync);
            }
            Err(e) => self.fail(e.into()),
        }
    }

    /// Handles `DFU_GETSTATUS`, advancing the sync states.
    fn get_status(&mut self, buf: &mut [u8]) -> usize {
        match self.status.state {
            DfuState::DnloadSync => match self.block {
                Some(block) => {
                    let word_count = (block.length as usize + 3) / 4;
                    self.status.poll_timeout_ms = self
                        .flash
                        .estimate_program_time_ms(word_count)
                        .clamp(1, MAX_POLL_TIMEOUT);
                    self.set_state(DfuState::DnBusy);
                }
                None => {
                    self.status.poll_timeout_ms = 0;
                    self.set_state(DfuState::DnloadIdle);
                }
            },
            DfuState::ManifestSync => {
                self.status.poll_timeout_ms = 0;
                if self.manifest_pending {
                    self.set_state(DfuState::Manifest);
                } else if F::MANIFESTATION_TOLERANT {
                    self.erase_mark = None;
                    self.set_state(DfuState::Idle);
                } else {
                    self.set_state(DfuState::ManifestWaitReset);
                }
            }
            _ => self.status.poll_timeout_ms = 0,
        }

        let reply: [u8; STATUS_SIZE] = self.status.into();
        buf[..STATUS_SIZE].copy_from_slice(&reply);
        STATUS_SIZE
    }

    /// Sequential upload from the address pointer.
    fn upload(&mut self, req: &SetupRequest, buf: &mut [u8]) -> Result<usize, Stall> {
        let address = self.address_pointer;
        if !self.flash.address_in_range(address) {
            // nothing left, a zero-length reply ends the upload
            self.set_state(DfuState::Idle);
            return Ok(0);
        }
        let length = min(req.length, F::TRANSFER_SIZE) as usize;
        self.read_block(address, length, buf).map(|n| {
            self.address_pointer = address.wrapping_add(F::TRANSFER_SIZE as u32);
            n
        })
    }

    /// Reads one upload block; a short block ends the upload.
    pub(crate) fn read_block(
        &mut self,
        address: u32,
        length: usize,
        buf: &mut [u8],
    ) -> Result<usize, Stall> {
        match self.flash.read(address, length) {
            Ok(data) => {
                let n = min(data.len(), buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < length {
                    self.set_state(DfuState::Idle);
                } else {
                    self.set_state(DfuState::UploadIdle);
                }
                Ok(n)
            }
            Err(e) => {
                self.fail(e.into());
                Err(Stall)
            }
        }
    }
}

/// Builds the 9-byte DFU functional descriptor.
pub(crate) fn functional_descriptor<F: FlashProgrammer>(bcd_version: u16) -> [u8; 9] {
    let detach = F::DETACH_TIMEOUT.to_le_bytes();
    let transfer = F::TRANSFER_SIZE.to_le_bytes();
    let version = bcd_version.to_le_bytes();
    [
        9,
        DESC_DESCTYPE_DFU,
        // bmAttributes
        // Bit 3: bitWillDetach
        (if F::WILL_DETACH { 0x8 } else { 0 })
            // Bit 2: bitManifestationTolerant
            | (if F::MANIFESTATION_TOLERANT { 0x4 } else { 0 })
            // Bit 1: bitCanUpload
            | (if F::HAS_UPLOAD { 0x2 } else { 0 })
            // Bit 0: bitCanDnload
            | (if F::HAS_DOWNLOAD { 0x1 } else { 0 }),
        // wDetachTimeOut
        detach[0],
        detach[1],
        // wTransferSize
        transfer[0],
        transfer[1],
        // bcdDFUVersion
        version[0],
        version[1],
    ]
}

impl<F: FlashProgrammer> RequestHandler for DfuClass<F> {
    fn validate(&mut self, req: &SetupRequest, state: UsbDeviceState) -> Result<(), Stall> {
        self.validate_common(req, state)
    }

    fn execute_get(&mut self, req: &SetupRequest, buf: &mut [u8]) -> Result<usize, Stall> {
        match req.request {
            DFU_GETSTATUS => Ok(self.get_status(buf)),
            DFU_GETSTATE => {
                buf[0] = self.status.state as u8;
                Ok(1)
            }
            DFU_UPLOAD => self.upload(req, buf),
            _ => self.reject().map(|_| 0),
        }
    }

    fn execute_set(&mut self, req: &SetupRequest, data: &[u8]) -> Result<(), Stall> {
        match req.request {
            DFU_DNLOAD if data.is_empty() => {
                self.begin_manifestation();
                Ok(())
            }
            DFU_DNLOAD => {
                let target = self.address_pointer;
                let next = target.checked_add(F::TRANSFER_SIZE as u32);
                self.capture_block(req.value, data, Some(target), next);
                Ok(())
            }
            DFU_CLRSTATUS => {
                self.status.status_code = DfuStatusCode::Ok;
                self.return_to_idle();
                Ok(())
            }
            DFU_ABORT => {
                self.return_to_idle();
                Ok(())
            }
            _ => self.reject(),
        }
    }

    fn complete_get(&mut self, req: &SetupRequest) {
        if req.request != DFU_GETSTATUS {
            return;
        }
        match self.status.state {
            DfuState::DnBusy => self.program_block(),
            DfuState::Manifest => self.manifest(),
            _ => {}
        }
    }

    fn reset(&mut self) {
        // may not return
        self.flash.usb_reset();

        self.status.status_code = DfuStatusCode::Ok;
        self.return_to_idle();
    }
}
