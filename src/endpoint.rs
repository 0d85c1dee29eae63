//! Device endpoint transfer engine
//!
//! An [`Endpoint`] is one direction of one endpoint number. It owns at most
//! one transfer, and moves it through the hardware one packet at a time:
//!
//! - IN transfers stage a packet, wait for the host to acknowledge it, then
//!   stage the next. A transfer of zero bytes sends exactly one zero-length
//!   packet.
//! - OUT transfers arm the endpoint for one max-sized packet, copy it out,
//!   and re-arm until the buffer fills or the host sends a short packet.
//!
//! The engine never touches the event queue. Methods that can finish a
//! transfer return a [`Completion`], and the caller reports it.

use crate::{
    buffer::XferBuffer,
    error::{Error, XferResult},
    hw::DeviceHardware,
    transfer::Transfer,
    wait::{Clock, Wait},
    DataToggle, EndpointConfig, TransferType,
};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// A finished transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Completion {
    /// Bytes moved before the transfer finished.
    pub len: usize,
    /// How it finished.
    pub result: XferResult,
}

/// A USB endpoint
#[derive(Debug)]
pub struct Endpoint {
    address: EndpointAddress,
    kind: TransferType,
    max_packet_size: u16,
    interval: u8,
    toggle: DataToggle,
    stalled: bool,
    zlt: bool,
    resource: u8,
    xfer: Option<Transfer>,
}

impl Endpoint {
    /// Track an endpoint that's been opened on hardware `resource`.
    pub(crate) fn new(config: &EndpointConfig, resource: u8) -> Self {
        Endpoint {
            address: config.address,
            kind: config.kind,
            max_packet_size: config.max_packet_size,
            interval: config.interval,
            toggle: DataToggle::Data0,
            stalled: false,
            zlt: false,
            resource,
            xfer: None,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn kind(&self) -> TransferType {
        self.kind
    }

    /// Returns the maximum packet length supported by this endpoint
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }

    /// Returns the toggle expected on the next packet.
    pub fn toggle(&self) -> DataToggle {
        self.toggle
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Indicates if a transfer is in progress.
    pub fn is_busy(&self) -> bool {
        self.xfer.is_some()
    }

    /// Returns the bytes moved so far by the active transfer.
    pub fn transferred(&self) -> Option<usize> {
        self.xfer.as_ref().map(Transfer::transferred)
    }

    pub(crate) fn resource(&self) -> u8 {
        self.resource
    }

    /// Enable or disable zero-length termination on IN transfers.
    ///
    /// Takes effect on the next submitted transfer.
    pub fn set_zlt(&mut self, zlt: bool) {
        self.zlt = zlt;
    }

    pub fn zlt(&self) -> bool {
        self.zlt
    }

    fn mps(&self) -> usize {
        self.max_packet_size as usize
    }

    /// Start a transfer on an idle endpoint.
    ///
    /// OUT transfers need a writable buffer. Returns a completion if the
    /// transfer failed before it reached the bus.
    pub(crate) fn submit<H: DeviceHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
        buffer: XferBuffer,
    ) -> Result<Option<Completion>, Error> {
        let zlt = self.zlt;
        self.submit_with(hw, wait, buffer, zlt)
    }

    /// Like [`submit`](Endpoint::submit), with an explicit ZLP decision.
    pub(crate) fn submit_with<H: DeviceHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
        buffer: XferBuffer,
        zlp: bool,
    ) -> Result<Option<Completion>, Error> {
        if self.xfer.is_some() {
            return Err(Error::InvalidState);
        }
        let direction = self.address.direction();
        if direction == UsbDirection::Out && !buffer.is_writable() {
            return Err(Error::InvalidState);
        }

        debug!(
            "EP{} {:?} SUBMIT {} BYTES",
            self.address.index(),
            direction,
            buffer.len()
        );
        self.xfer = Some(Transfer::new(buffer, zlp));
        match direction {
            UsbDirection::In => Ok(self.send(hw, wait)),
            UsbDirection::Out => {
                hw.arm_rx(self.address, self.mps());
                Ok(None)
            }
        }
    }

    /// Push the next IN packet into the hardware.
    fn send<H: DeviceHardware, C: Clock>(&mut self, hw: &mut H, wait: &Wait<C>) -> Option<Completion> {
        let address = self.address;
        let mps = self.mps();
        let xfer = self.xfer.as_mut()?;
        if wait.until(|| hw.tx_ready(address)).is_err() {
            warn!("EP{} IN FIFO NEVER READY", address.index());
            return self.finish(XferResult::Failed);
        }
        let packet = xfer.next_tx(mps);
        hw.arm_tx(address, packet);
        None
    }

    fn finish(&mut self, result: XferResult) -> Option<Completion> {
        let xfer = self.xfer.take()?;
        Some(Completion {
            len: xfer.transferred(),
            result,
        })
    }

    /// The hardware moved one packet on this endpoint.
    pub(crate) fn on_packet<H: DeviceHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
    ) -> Option<Completion> {
        if self.xfer.is_none() {
            trace!("EP{} SPURIOUS COMPLETION", self.address.index());
            return None;
        }

        if self.kind != TransferType::Isochronous {
            self.toggle = self.toggle.flip();
            let actual = hw.toggle(self.address);
            if actual != self.toggle {
                warn!(
                    "EP{} {:?} TOGGLE MISMATCH: TRACKED {:?} HARDWARE {:?}",
                    self.address.index(),
                    self.address.direction(),
                    self.toggle,
                    actual
                );
            }
        }

        match self.address.direction() {
            UsbDirection::In => self.on_in_ack(hw, wait),
            UsbDirection::Out => self.on_out_packet(hw),
        }
    }

    fn on_in_ack<H: DeviceHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
    ) -> Option<Completion> {
        let mps = self.mps();
        let done = self.xfer.as_mut()?.tx_done(mps);
        if done {
            self.finish(XferResult::Success)
        } else {
            self.send(hw, wait)
        }
    }

    fn on_out_packet<H: DeviceHardware>(&mut self, hw: &mut H) -> Option<Completion> {
        let address = self.address;
        let mps = self.mps();
        let xfer = self.xfer.as_mut()?;
        let available = hw.bytes_available(address);
        let copied = match xfer.rx_window(available, mps) {
            Ok(window) => hw.read_packet(address, window),
            Err(_) => {
                warn!("EP{} OUT PACKET OF {} BYTES EXCEEDS MPS", address.index(), available);
                return self.finish(XferResult::Failed);
            }
        };
        if xfer.rx_done(copied, available, mps) {
            self.finish(XferResult::Success)
        } else {
            hw.arm_rx(address, mps);
            None
        }
    }

    /// The hardware gave up on this endpoint's packet.
    pub(crate) fn on_error(&mut self, _code: u32) -> Option<Completion> {
        warn!("EP{} ERROR {:#X}", self.address.index(), _code);
        self.finish(XferResult::Failed)
    }

    /// Stall the endpoint, terminating any active transfer.
    pub(crate) fn stall<H: DeviceHardware>(&mut self, hw: &mut H) -> Option<Completion> {
        hw.set_stall(self.address);
        self.stalled = true;
        self.finish(XferResult::Stalled)
    }

    /// Clear a stall, resetting the toggle to DATA0.
    pub(crate) fn clear_stall<H: DeviceHardware>(&mut self, hw: &mut H) {
        hw.clear_stall(self.address);
        self.stalled = false;
        self.set_toggle(hw, DataToggle::Data0);
    }

    pub(crate) fn set_toggle<H: DeviceHardware>(&mut self, hw: &mut H, toggle: DataToggle) {
        hw.set_toggle(self.address, toggle);
        self.toggle = toggle;
    }

    /// Disarm the hardware, and silently drop any active transfer.
    ///
    /// Returns `true` if there was a transfer to drop.
    pub(crate) fn abort<H: DeviceHardware>(&mut self, hw: &mut H) -> bool {
        hw.abort(self.address);
        self.xfer.take().is_some()
    }
}
