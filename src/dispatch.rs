//! Request routing

use usb_device::control::RequestType;
use usb_device::prelude::UsbDeviceState;

use crate::error::Stall;
use crate::setup::SetupRequest;
use crate::standard::StandardRequests;

/// Handler for one category of control requests.
///
/// The control pipe calls [`validate`](RequestHandler::validate) for every
/// SETUP packet, then either [`execute_get`](RequestHandler::execute_get)
/// right away (device-to-host) or [`execute_set`](RequestHandler::execute_set)
/// once the status stage has been sent (host-to-device).
pub trait RequestHandler {
    /// Checks that `req` is acceptable in the current state.
    fn validate(&mut self, req: &SetupRequest, state: UsbDeviceState) -> Result<(), Stall>;

    /// Writes the data stage of a device-to-host request into `buf` and
    /// returns the number of bytes produced.
    fn execute_get(&mut self, req: &SetupRequest, buf: &mut [u8]) -> Result<usize, Stall>;

    /// Performs a host-to-device request. `data` holds the received data stage.
    fn execute_set(&mut self, req: &SetupRequest, data: &[u8]) -> Result<(), Stall>;

    /// Called when the host acknowledged the data of a device-to-host request.
    fn complete_get(&mut self, _req: &SetupRequest) {}

    /// Called on USB bus reset.
    fn reset(&mut self);
}

/// Handler that stalls every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

impl RequestHandler for Unsupported {
    fn validate(&mut self, _req: &SetupRequest, _state: UsbDeviceState) -> Result<(), Stall> {
        Err(Stall)
    }

    fn execute_get(&mut self, _req: &SetupRequest, _buf: &mut [u8]) -> Result<usize, Stall> {
        Err(Stall)
    }

    fn execute_set(&mut self, _req: &SetupRequest, _data: &[u8]) -> Result<(), Stall> {
        Err(Stall)
    }

    fn reset(&mut self) {}
}

/// Routes requests to the standard, class or vendor handler.
///
/// The routing key is the request category, the handlers receive the current
/// device state tracked by the standard handler.
pub struct Dispatcher<'a, C, V = Unsupported> {
    standard: StandardRequests<'a>,
    class: C,
    vendor: V,
}

impl<'a, C: RequestHandler> Dispatcher<'a, C, Unsupported> {
    /// Creates a dispatcher without vendor requests.
    pub fn new(standard: StandardRequests<'a>, class: C) -> Self {
        Self::with_vendor(standard, class, Unsupported)
    }
}

impl<'a, C: RequestHandler, V: RequestHandler> Dispatcher<'a, C, V> {
    /// Creates a dispatcher with a vendor request handler.
    pub fn with_vendor(standard: StandardRequests<'a>, class: C, vendor: V) -> Self {
        Self {
            standard,
            class,
            vendor,
        }
    }

    /// Current device state.
    pub fn device_state(&self) -> UsbDeviceState {
        self.standard.device_state()
    }

    /// Standard request handler.
    pub fn standard(&self) -> &StandardRequests<'a> {
        &self.standard
    }

    /// Class request handler.
    pub fn class(&self) -> &C {
        &self.class
    }

    /// Class request handler.
    pub fn class_mut(&mut self) -> &mut C {
        &mut self.class
    }

    /// Vendor request handler.
    pub fn vendor_mut(&mut self) -> &mut V {
        &mut self.vendor
    }

    /// Consumes the dispatcher and returns the class handler.
    pub fn release(self) -> C {
        self.class
    }

    fn route(&mut self, req: &SetupRequest) -> Option<&mut dyn RequestHandler> {
        match req.category {
            RequestType::Standard => Some(&mut self.standard),
            RequestType::Class => Some(&mut self.class),
            RequestType::Vendor => Some(&mut self.vendor),
            RequestType::Reserved => None,
        }
    }

    /// Validates `req` with the handler of its category.
    pub fn validate(&mut self, req: &SetupRequest) -> Result<(), Stall> {
        let state = self.device_state();
        self.route(req).ok_or(Stall)?.validate(req, state)
    }

    /// Produces the data stage of a device-to-host request.
    pub fn execute_get(&mut self, req: &SetupRequest, buf: &mut [u8]) -> Result<usize, Stall> {
        self.route(req).ok_or(Stall)?.execute_get(req, buf)
    }

    /// Performs a host-to-device request.
    pub fn execute_set(&mut self, req: &SetupRequest, data: &[u8]) -> Result<(), Stall> {
        self.route(req).ok_or(Stall)?.execute_set(req, data)
    }

    /// Signals the end of a device-to-host transfer.
    pub fn complete_get(&mut self, req: &SetupRequest) {
        if let Some(handler) = self.route(req) {
            handler.complete_get(req);
        }
    }

    /// Resets all handlers after a bus reset.
    pub fn reset(&mut self) {
        self.standard.reset();
        self.class.reset();
        self.vendor.reset();
    }

    /// Takes the bus address accepted by the last `SET_ADDRESS`.
    pub(crate) fn take_device_address(&mut self) -> Option<u8> {
        self.standard.take_pending_address()
    }
}
