//! Endpoint 0 control transfer engine

use core::cmp::min;

use crate::dispatch::{Dispatcher, RequestHandler};
use crate::error::Stall;
use crate::setup::SetupRequest;
use crate::transceiver::{ep0_in, ep0_out, Transaction, Transceiver};

/// Size of the data stage buffer. Longer OUT transfers are stalled and
/// longer IN replies are truncated.
pub const CONTROL_BUFFER_SIZE: usize = 256;

/// Control transfer phase of endpoint 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ControlState {
    /// Waiting for a SETUP packet, either idle or after a protocol error.
    Stalled,
    /// Sending IN data, more packets follow.
    DataIn,
    /// The last IN data packet is queued.
    LastDataIn,
    /// Waiting for the host's zero-length OUT status packet.
    StatusOut,
    /// Receiving OUT data, more than one packet left.
    DataOut,
    /// Receiving the last OUT data packet.
    LastDataOut,
    /// Zero-length IN status packet queued, the request runs once it is sent.
    StatusIn,
}

/// Control transfer state machine for endpoint 0.
///
/// All entry points run to completion from the USB interrupt and must not be
/// re-entered. A SETUP packet always abandons whatever transfer was in flight.
pub struct ControlPipe<T: Transceiver> {
    transceiver: T,
    state: ControlState,
    request: Option<SetupRequest>,
    max_packet_size: usize,
    buf: [u8; CONTROL_BUFFER_SIZE],
    len: usize,
    pos: usize,
    zlp: bool,
}

impl<T: Transceiver> ControlPipe<T> {
    /// Creates an engine for an endpoint 0 of `max_packet_size` bytes (8, 16, 32 or 64).
    pub fn new(transceiver: T, max_packet_size: u8) -> Self {
        Self {
            transceiver,
            state: ControlState::Stalled,
            request: None,
            max_packet_size: max_packet_size.max(8) as usize,
            buf: [0; CONTROL_BUFFER_SIZE],
            len: 0,
            pos: 0,
            zlp: false,
        }
    }

    /// Current phase.
    pub fn state(&self) -> ControlState {
        self.state
    }

    /// Request of the transfer in flight.
    pub fn request(&self) -> Option<&SetupRequest> {
        self.request.as_ref()
    }

    /// Transceiver.
    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    /// Transceiver.
    pub fn transceiver_mut(&mut self) -> &mut T {
        &mut self.transceiver
    }

    /// Consumes the engine and returns the transceiver.
    pub fn release(self) -> T {
        self.transceiver
    }

    /// Dispatches a transaction-complete signal from the peripheral.
    ///
    /// For [`Transaction::Setup`] the packet is fetched with
    /// [`Transceiver::read_setup`].
    pub fn handle<C, V>(
        &mut self,
        dispatcher: &mut Dispatcher<'_, C, V>,
        event: Transaction,
    ) -> Result<(), Stall>
    where
        C: RequestHandler,
        V: RequestHandler,
    {
        match event {
            Transaction::Setup => {
                let mut setup = [0u8; SetupRequest::SIZE + 1];
                match self.transceiver.read_setup(&mut setup) {
                    Ok(n) => self.on_setup(dispatcher, &setup[..n]),
                    Err(_) => self.stall(),
                }
            }
            Transaction::InComplete => self.on_in_complete(dispatcher),
            Transaction::OutComplete => self.on_out_complete(dispatcher),
            Transaction::Reset => {
                self.on_reset(dispatcher);
                Ok(())
            }
        }
    }

    /// Starts a new control transfer.
    ///
    /// Packets that are not exactly 8 bytes long, and requests the
    /// dispatcher refuses, stall endpoint 0.
    pub fn on_setup<C, V>(
        &mut self,
        dispatcher: &mut Dispatcher<'_, C, V>,
        bytes: &[u8],
    ) -> Result<(), Stall>
    where
        C: RequestHandler,
        V: RequestHandler,
    {
        self.request = None;
        self.len = 0;
        self.pos = 0;
        self.zlp = false;

        let req = match SetupRequest::parse(bytes) {
            Ok(req) => req,
            Err(_) => {
                warn!("malformed setup packet, {} bytes", bytes.len());
                return self.stall();
            }
        };

        trace!(
            "setup {=u8:#x} {=u8} value={=u16:#x} index={=u16} length={=u16}",
            bytes[0],
            req.request,
            req.value,
            req.index,
            req.length
        );

        if dispatcher.validate(&req).is_err() {
            debug!("request {=u8} refused", req.request);
            return self.stall();
        }

        self.request = Some(req);

        if req.is_in() {
            let n = match dispatcher.execute_get(&req, &mut self.buf) {
                Ok(n) => n,
                Err(_) => return self.stall(),
            };
            self.len = min(n, req.length as usize);
            // a short reply that ends on a packet boundary needs a ZLP
            self.zlp = self.len < req.length as usize;
            self.write_next()
        } else {
            self.len = req.length as usize;
            if self.len > self.buf.len() {
                warn!("OUT data stage of {} bytes does not fit", self.len);
                return self.stall();
            }
            if self.len == 0 {
                self.send_status()
            } else {
                self.state = self.out_phase();
                Ok(())
            }
        }
    }

    /// Handles completion of an IN packet.
    pub fn on_in_complete<C, V>(&mut self, dispatcher: &mut Dispatcher<'_, C, V>) -> Result<(), Stall>
    where
        C: RequestHandler,
        V: RequestHandler,
    {
        match self.state {
            ControlState::DataIn => self.write_next(),
            ControlState::LastDataIn => {
                self.state = ControlState::StatusOut;
                Ok(())
            }
            ControlState::StatusIn => {
                let Some(req) = self.request.take() else {
                    return self.stall();
                };
                let result = dispatcher.execute_set(&req, &self.buf[..self.len]);
                if let Some(addr) = dispatcher.take_device_address() {
                    self.transceiver.set_device_address(addr);
                }
                if result.is_err() {
                    return self.stall();
                }
                self.state = ControlState::Stalled;
                Ok(())
            }
            _ => self.stall(),
        }
    }

    /// Handles reception of an OUT packet.
    pub fn on_out_complete<C, V>(&mut self, dispatcher: &mut Dispatcher<'_, C, V>) -> Result<(), Stall>
    where
        C: RequestHandler,
        V: RequestHandler,
    {
        match self.state {
            ControlState::DataOut | ControlState::LastDataOut => {
                let n = match self
                    .transceiver
                    .read_out(ep0_out(), &mut self.buf[self.pos..self.len])
                {
                    Ok(n) => n,
                    Err(_) => return self.stall(),
                };
                self.pos += n;

                if self.pos >= self.len || n < self.max_packet_size {
                    // a short packet ends the data stage early
                    self.len = self.pos;
                    self.send_status()
                } else {
                    self.state = self.out_phase();
                    Ok(())
                }
            }
            // an OUT token during the data stage is an early status stage
            ControlState::DataIn | ControlState::LastDataIn | ControlState::StatusOut => {
                self.transceiver.read_out(ep0_out(), &mut []).ok();
                if let Some(req) = self.request.take() {
                    dispatcher.complete_get(&req);
                }
                self.state = ControlState::Stalled;
                Ok(())
            }
            _ => self.stall(),
        }
    }

    /// Handles USB bus reset.
    pub fn on_reset<C, V>(&mut self, dispatcher: &mut Dispatcher<'_, C, V>)
    where
        C: RequestHandler,
        V: RequestHandler,
    {
        debug!("bus reset");
        self.state = ControlState::Stalled;
        self.request = None;
        self.len = 0;
        self.pos = 0;
        self.zlp = false;
        dispatcher.reset();
    }

    fn out_phase(&self) -> ControlState {
        if self.len - self.pos <= self.max_packet_size {
            ControlState::LastDataOut
        } else {
            ControlState::DataOut
        }
    }

    fn write_next(&mut self) -> Result<(), Stall> {
        let count = min(self.max_packet_size, self.len - self.pos);
        if self
            .transceiver
            .write_in(ep0_in(), &self.buf[self.pos..self.pos + count])
            .is_err()
        {
            return self.stall();
        }
        self.pos += count;

        let more = self.pos < self.len || (self.zlp && count == self.max_packet_size);
        self.state = if more {
            ControlState::DataIn
        } else {
            ControlState::LastDataIn
        };
        Ok(())
    }

    fn send_status(&mut self) -> Result<(), Stall> {
        if self.transceiver.send_zero_length(ep0_in()).is_err() {
            return self.stall();
        }
        self.state = ControlState::StatusIn;
        Ok(())
    }

    fn stall(&mut self) -> Result<(), Stall> {
        self.transceiver.set_stall(ep0_in());
        self.transceiver.set_stall(ep0_out());
        self.state = ControlState::Stalled;
        self.request = None;
        Err(Stall)
    }
}
