//! Flash programmer capability

/// Errors that may happen when working with the memory
/// (reading, erasing, programming). These are translated
/// to the corresponding `bStatus` codes in the DFU protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuMemoryError {
    /// File is not targeted for use by this device.
    Target = 0x01,
    /// File is for this device but fails some vendor-specific verification test.
    File = 0x02,
    /// Device is unable to write memory.
    Write = 0x03,
    /// Memory erase function failed.
    Erase = 0x04,
    /// Memory erase check failed.
    CheckErased = 0x05,
    /// Program memory function failed.
    Prog = 0x06,
    /// Programmed memory failed verification.
    Verify = 0x07,
    /// Cannot program memory due to received address that is out of range.
    Address = 0x08,
    /// A vendor-specific error.
    Vendor = 0x0B,
    /// Something went wrong, but the device does not know what it was.
    Unknown = 0x0E,
}

/// Errors that may happen when the device enters the Manifestation phase.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuManifestationError {
    /// File is not targeted for use by this device.
    Target = 0x01,
    /// File is for this device but fails some vendor-specific verification test.
    File = 0x02,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    NotDone = 0x09,
    /// Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    Firmware = 0x0A,
    /// A vendor-specific error.
    Vendor = 0x0B,
    /// Something went wrong, but the device does not know what it was.
    Unknown = 0x0E,
}

/// Access to the device's programmable memory.
///
/// The DFU classes call these functions from the USB interrupt context while
/// a control transfer is being processed, so every call must run to
/// completion without waiting on the bus.
///
/// "Page" is the smallest erasable unit, "word" is the 32-bit programming
/// unit and "block" is one DFU transfer of up to
/// [`TRANSFER_SIZE`](FlashProgrammer::TRANSFER_SIZE) bytes.
pub trait FlashProgrammer {
    /// Start of the application image. The address pointer returns here
    /// after `DFU_ABORT`, `DFU_CLRSTATUS` and bus reset.
    const INITIAL_ADDRESS_POINTER: u32;

    /// Size of an erasable page in bytes.
    const PAGE_SIZE: u32;

    /// Maximum block size. Default value: `128` bytes.
    ///
    /// Sets `wTransferSize` in the DFU functional descriptor and the stride
    /// between consecutive blocks. Must not exceed
    /// [`MAX_TRANSFER_SIZE`](crate::class::MAX_TRANSFER_SIZE).
    const TRANSFER_SIZE: u16 = 128;

    /// *bitCanDnload*. Default is `true`.
    const HAS_DOWNLOAD: bool = true;

    /// *bitCanUpload*. `DFU_UPLOAD` is rejected when unset. Default is `true`.
    const HAS_UPLOAD: bool = true;

    /// *bitManifestationTolerant*. Default is `false`.
    ///
    /// A tolerant device returns to `dfuIDLE` after manifestation, otherwise
    /// it parks in `dfuMANIFEST-WAIT-RESET` until the host resets the bus.
    const MANIFESTATION_TOLERANT: bool = false;

    /// *bitWillDetach*. Default is `true`.
    const WILL_DETACH: bool = true;

    /// `wDetachTimeOut` in milliseconds. Default value: `250` ms.
    const DETACH_TIMEOUT: u16 = 250;

    /// Returns `true` if `address` lies in the programmable region.
    fn address_in_range(&self, address: u32) -> bool;

    /// Returns `true` if `word_count` words starting at `address` read as erased.
    fn is_erased(&mut self, address: u32, word_count: usize) -> bool;

    /// Erases the page starting at `address`.
    fn erase_page(&mut self, address: u32) -> Result<(), DfuMemoryError>;

    /// Erases the whole programmable region.
    fn erase_all(&mut self) -> Result<(), DfuMemoryError> {
        Err(DfuMemoryError::Erase)
    }

    /// Programs `words` starting at `address`.
    fn program(&mut self, address: u32, words: &[u32]) -> Result<(), DfuMemoryError>;

    /// Reads up to `length` bytes starting at `address`.
    ///
    /// A slice shorter than `length` means the end of readable memory was
    /// reached.
    fn read(&mut self, address: u32, length: usize) -> Result<&[u8], DfuMemoryError>;

    /// Time in milliseconds needed to erase (if needed) and program `word_count` words.
    ///
    /// Reported to the host as `bwPollTimeout`.
    fn estimate_program_time_ms(&self, word_count: usize) -> u32;

    /// Finish writing firmware and optionally activate it.
    ///
    /// Called once per download session after the final zero-length block.
    fn manifestation(&mut self) -> Result<(), DfuManifestationError> {
        Ok(())
    }

    /// Called on every USB bus reset.
    ///
    /// After a completed download the implementation may jump to the new
    /// firmware and never return.
    fn usb_reset(&mut self) {}
}
