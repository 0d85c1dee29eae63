//! Control transfer state machine
//!
//! Endpoint 0 moves through `Idle → SetupReceived → (Data) → Status → Idle`.
//! A SETUP packet is authoritative: it restarts the machine from any stage,
//! and whatever endpoint 0 was doing is dropped without a completion.
//!
//! The upper layer decodes the request. It answers with a data stage
//! ([`Device::control_xfer`](crate::Device::control_xfer)), a bare status
//! stage, or a stall. After a data stage, the status stage is queued
//! automatically.

use crate::{
    buffer::XferBuffer,
    endpoint::Completion,
    error::{Error, XferResult},
    hw::DeviceHardware,
    setup::SetupPacket,
    state::EndpointTable,
    wait::{Clock, Wait},
    DataToggle,
};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// Control transfer stage
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Stage {
    #[default]
    Idle,
    /// A SETUP packet arrived, and the upper layer hasn't answered yet.
    SetupReceived,
    Data,
    Status,
}

fn ep0(direction: UsbDirection) -> EndpointAddress {
    EndpointAddress::from_parts(0, direction)
}

/// Decide if a control IN data stage needs a trailing ZLP.
///
/// The host expects `requested` bytes. If the device sends less, and the last
/// packet is full, the host can't tell that the data stage ended.
pub fn needs_zlp(len: usize, requested: usize, max_packet_size: usize) -> bool {
    len < requested && len > 0 && max_packet_size > 0 && len % max_packet_size == 0
}

/// The control endpoint pair's request context
#[derive(Debug, Default)]
pub struct Control {
    stage: Stage,
    setup: SetupPacket,
    pending_address: Option<u8>,
}

impl Control {
    pub const fn new() -> Self {
        Control {
            stage: Stage::Idle,
            setup: SetupPacket::from_bytes([0; 8]),
            pending_address: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Returns the request being served, if any.
    pub fn setup(&self) -> Option<&SetupPacket> {
        (self.stage != Stage::Idle).then_some(&self.setup)
    }

    /// Returns the address that will be programmed once the status stage
    /// completes.
    pub fn pending_address(&self) -> Option<u8> {
        self.pending_address
    }

    /// Forget the current request.
    pub(crate) fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.pending_address = None;
    }

    /// Start a new request.
    ///
    /// Drops any endpoint 0 transfer, clears endpoint 0 stalls, and prepares
    /// both directions for DATA1.
    pub(crate) fn on_setup<H: DeviceHardware>(
        &mut self,
        hw: &mut H,
        table: &mut EndpointTable,
        setup: SetupPacket,
    ) {
        if self.stage != Stage::Idle {
            debug!("CONTROL SETUP INTERRUPTS {:?}", self.stage);
        }
        for direction in [UsbDirection::Out, UsbDirection::In] {
            if let Some(ep) = table.endpoint_mut(ep0(direction)) {
                ep.abort(hw);
                ep.clear_stall(hw);
                ep.set_toggle(hw, DataToggle::Data1);
            }
        }
        self.setup = setup;
        self.pending_address = None;
        self.stage = Stage::SetupReceived;
    }

    /// Start the data stage of the current request.
    ///
    /// The transfer is capped at `wLength`. A request without a data stage
    /// gets its status stage instead.
    pub(crate) fn data<H: DeviceHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
        table: &mut EndpointTable,
        mut buffer: XferBuffer,
        report: &mut impl FnMut(EndpointAddress, Completion),
    ) -> Result<(), Error> {
        if self.stage != Stage::SetupReceived {
            return Err(Error::InvalidState);
        }
        let requested = self.setup.length() as usize;
        if requested == 0 {
            return self.status(hw, wait, table, report);
        }

        let addr = ep0(self.setup.direction());
        let ep = table.endpoint_mut(addr).ok_or(Error::InvalidState)?;
        buffer.truncate(requested);
        let zlp = addr.direction() == UsbDirection::In
            && needs_zlp(buffer.len(), requested, ep.max_packet_size() as usize);
        trace!("CONTROL DATA {:?} {} BYTES", addr.direction(), buffer.len());

        match ep.submit_with(hw, wait, buffer, zlp)? {
            Some(done) => {
                self.stage = Stage::Idle;
                report(addr, done);
            }
            None => self.stage = Stage::Data,
        }
        Ok(())
    }

    /// Start the status stage of the current request.
    ///
    /// Only valid before a data stage was started. For requests without a
    /// data stage, this is a zero-length IN.
    pub(crate) fn status<H: DeviceHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
        table: &mut EndpointTable,
        report: &mut impl FnMut(EndpointAddress, Completion),
    ) -> Result<(), Error> {
        if self.stage != Stage::SetupReceived {
            return Err(Error::InvalidState);
        }
        self.start_status(hw, wait, table, report)
    }

    fn start_status<H: DeviceHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
        table: &mut EndpointTable,
        report: &mut impl FnMut(EndpointAddress, Completion),
    ) -> Result<(), Error> {
        let addr = ep0(self.setup.status_direction());
        let ep = table.endpoint_mut(addr).ok_or(Error::InvalidState)?;
        ep.set_toggle(hw, DataToggle::Data1);
        trace!("CONTROL STATUS {:?}", addr.direction());

        match ep.submit_with(hw, wait, XferBuffer::empty(), false)? {
            Some(done) => {
                self.reset();
                report(addr, done);
            }
            None => self.stage = Stage::Status,
        }
        Ok(())
    }

    /// Latch an address for the end of the status stage.
    pub(crate) fn set_pending_address(&mut self, address: u8) {
        self.pending_address = Some(address);
    }

    /// Stall both endpoint 0 directions, and end the request.
    pub(crate) fn stall<H: DeviceHardware>(
        &mut self,
        hw: &mut H,
        table: &mut EndpointTable,
        report: &mut impl FnMut(EndpointAddress, Completion),
    ) {
        for direction in [UsbDirection::Out, UsbDirection::In] {
            let addr = ep0(direction);
            if let Some(done) = table.endpoint_mut(addr).and_then(|ep| ep.stall(hw)) {
                report(addr, done);
            }
        }
        debug!("CONTROL STALL");
        self.stage = Stage::Idle;
        self.pending_address = None;
    }

    /// An endpoint 0 transfer finished, and has been reported.
    ///
    /// Advances the stage. Returns an address that's now programmed into the
    /// hardware, if the status stage finished a `SET_ADDRESS`.
    pub(crate) fn on_complete<H: DeviceHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
        table: &mut EndpointTable,
        addr: EndpointAddress,
        done: Completion,
        report: &mut impl FnMut(EndpointAddress, Completion),
    ) -> Option<u8> {
        match self.stage {
            Stage::Data if addr.direction() == self.setup.direction() => {
                if done.result == XferResult::Success {
                    if self.start_status(hw, wait, table, report).is_err() {
                        warn!("CONTROL STATUS NOT QUEUED");
                        self.reset();
                    }
                } else {
                    self.reset();
                }
                None
            }
            Stage::Status if addr.direction() == self.setup.status_direction() => {
                self.stage = Stage::Idle;
                let address = self.pending_address.take()?;
                if done.result != XferResult::Success {
                    return None;
                }
                hw.set_address(address);
                debug!("ADDRESS {}", address);
                Some(address)
            }
            _ => {
                trace!("CONTROL {:?} IGNORES EP0 {:?}", self.stage, addr.direction());
                None
            }
        }
    }
}
