//! Host pipes
//!
//! A [`Pipe`] binds a device address and endpoint to one hardware channel.
//! It runs one transfer at a time, transaction by transaction. A control
//! pipe serves both directions of endpoint 0, and runs the SETUP, DATA, and
//! STATUS stages of a request as a single transfer.
//!
//! The [`PipeTable`] hands out pipes, and routes `(address, endpoint)` to a
//! pipe in O(1). Handles carry a generation, so a handle that outlived its
//! pipe is detected instead of aliasing the pipe's next user.

use crate::{
    buffer::XferBuffer,
    endpoint::Completion,
    error::{Error, XferResult},
    host::HostHardware,
    setup::SetupPacket,
    transfer::Transfer,
    wait::{Clock, Wait},
    DataToggle, EndpointConfig, TransferType,
};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// The maximum number of addressable devices, including address 0.
pub const MAX_DEVICES: usize = 8;

/// The maximum number of pipes.
pub const MAX_PIPES: usize = 16;

/// Consecutive NAKs retried within one frame.
///
/// Past this, a control or bulk pipe waits for the next frame before asking
/// again.
pub const NAK_RETRY_LIMIT: u8 = 8;

const NO_PIPE: u8 = u8::MAX;

/// Endpoint numbers above 15 have no route.
fn route(ep: EndpointAddress) -> Option<usize> {
    let slot = (ep.index() * 2) + (UsbDirection::In == ep.direction()) as usize;
    (slot < 32).then_some(slot)
}

/// Frame `now` is at, or past, frame `at`.
fn reached(now: u16, at: u16) -> bool {
    (now.wrapping_sub(at) as i16) >= 0
}

/// Identifies an open pipe
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct PipeHandle {
    index: u8,
    generation: u8,
}

impl PipeHandle {
    /// The hardware pipe behind this handle.
    pub fn index(&self) -> u8 {
        self.index
    }
}

/// Stage of a control transfer
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum ControlStage {
    Setup,
    Data,
    Status,
}

/// One hardware channel, bound to a device endpoint
#[derive(Debug)]
pub struct Pipe {
    index: u8,
    dev_addr: u8,
    number: u8,
    kind: TransferType,
    max_packet_size: u16,
    interval: u8,
    /// Direction of the current, or last, transfer.
    direction: UsbDirection,
    toggle: DataToggle,
    stalled: bool,
    xfer: Option<Transfer>,
    /// Set while a control transfer is active.
    stage: Option<ControlStage>,
    setup: SetupPacket,
    naks: u8,
    retry_at: Option<u16>,
}

impl Pipe {
    fn new(index: u8, dev_addr: u8, config: &EndpointConfig) -> Self {
        Pipe {
            index,
            dev_addr,
            number: config.address.index() as u8,
            kind: config.kind,
            max_packet_size: config.max_packet_size,
            interval: config.interval,
            direction: config.address.direction(),
            toggle: DataToggle::Data0,
            stalled: false,
            xfer: None,
            stage: None,
            setup: SetupPacket::default(),
            naks: 0,
            retry_at: None,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn dev_addr(&self) -> u8 {
        self.dev_addr
    }

    /// The endpoint address, in the direction of the current transfer.
    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::from_parts(self.number as usize, self.direction)
    }

    pub fn kind(&self) -> TransferType {
        self.kind
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }

    pub fn toggle(&self) -> DataToggle {
        self.toggle
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn is_busy(&self) -> bool {
        self.xfer.is_some()
    }

    /// Returns the control stage, while a control transfer is active.
    pub fn stage(&self) -> Option<ControlStage> {
        self.stage
    }

    /// Indicates if the pipe is waiting out a NAK.
    pub fn is_deferred(&self) -> bool {
        self.retry_at.is_some()
    }

    fn mps(&self) -> usize {
        self.max_packet_size as usize
    }

    fn set_toggle<H: HostHardware>(&mut self, hw: &mut H, toggle: DataToggle) {
        hw.set_toggle(self.index, toggle);
        self.toggle = toggle;
    }

    /// Start a transfer. Control pipes need a `setup` packet; other pipes
    /// must not have one.
    ///
    /// A SETUP clears a control pipe's stall.
    pub(crate) fn start<H: HostHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
        mut buffer: XferBuffer,
        setup: Option<SetupPacket>,
    ) -> Result<Option<Completion>, Error> {
        if self.xfer.is_some() || (self.stalled && setup.is_none()) {
            return Err(Error::InvalidState);
        }
        match (self.kind, setup) {
            (TransferType::Control, Some(setup)) => {
                buffer.truncate(setup.length() as usize);
                self.direction = setup.direction();
                self.setup = setup;
            }
            (TransferType::Control, None) | (_, Some(_)) => return Err(Error::InvalidState),
            (_, None) => {}
        }
        if self.direction == UsbDirection::In && !buffer.is_empty() && !buffer.is_writable() {
            return Err(Error::InvalidState);
        }

        debug!(
            "PIPE{} DEV{} EP{} {:?} START {} BYTES",
            self.index,
            self.dev_addr,
            self.number,
            self.direction,
            buffer.len()
        );
        self.xfer = Some(Transfer::new(buffer, false));
        self.naks = 0;
        self.retry_at = None;
        if setup.is_some() {
            self.stage = Some(ControlStage::Setup);
            self.stalled = false;
            self.set_toggle(hw, DataToggle::Data0);
        }
        Ok(self.issue(hw, wait))
    }

    /// Put the current transaction on the bus.
    fn issue<H: HostHardware, C: Clock>(&mut self, hw: &mut H, wait: &Wait<C>) -> Option<Completion> {
        let index = self.index;
        let mps = self.mps();
        let (direction, data) = match self.stage {
            Some(ControlStage::Setup) => {
                hw.send_setup(index, self.setup.as_bytes());
                return None;
            }
            Some(ControlStage::Status) => (self.setup.status_direction(), false),
            _ => (self.direction, true),
        };
        match direction {
            UsbDirection::In => {
                hw.request_in(index, mps);
                None
            }
            UsbDirection::Out => {
                if wait.until(|| hw.tx_ready(index)).is_err() {
                    warn!("PIPE{} OUT FIFO NEVER READY", index);
                    return self.finish(XferResult::Failed);
                }
                let xfer = self.xfer.as_mut()?;
                let packet = if data { xfer.next_tx(mps) } else { &[] };
                hw.send_out(index, packet);
                None
            }
        }
    }

    fn finish(&mut self, result: XferResult) -> Option<Completion> {
        self.stage = None;
        self.retry_at = None;
        self.naks = 0;
        let xfer = self.xfer.take()?;
        Some(Completion {
            len: xfer.transferred(),
            result,
        })
    }

    /// The device acknowledged the last transaction.
    pub(crate) fn on_ack<H: HostHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
    ) -> Option<Completion> {
        self.naks = 0;
        if self.xfer.is_none() {
            trace!("PIPE{} SPURIOUS ACK", self.index);
            return None;
        }

        match self.stage {
            Some(ControlStage::Setup) => {
                self.set_toggle(hw, DataToggle::Data1);
                self.stage = Some(if self.setup.length() == 0 {
                    ControlStage::Status
                } else {
                    ControlStage::Data
                });
                self.issue(hw, wait)
            }
            Some(ControlStage::Status) => {
                if self.setup.status_direction() == UsbDirection::In {
                    hw.read_packet(self.index, &mut []);
                }
                self.finish(XferResult::Success)
            }
            _ => self.on_data_ack(hw, wait),
        }
    }

    fn on_data_ack<H: HostHardware, C: Clock>(
        &mut self,
        hw: &mut H,
        wait: &Wait<C>,
    ) -> Option<Completion> {
        let index = self.index;
        let mps = self.mps();
        if self.kind != TransferType::Isochronous {
            self.toggle = self.toggle.flip();
            let actual = hw.toggle(index);
            if actual != self.toggle {
                warn!(
                    "PIPE{} TOGGLE MISMATCH: TRACKED {:?} HARDWARE {:?}",
                    index, self.toggle, actual
                );
            }
        }

        let xfer = self.xfer.as_mut()?;
        let done = match self.direction {
            UsbDirection::Out => xfer.tx_done(mps),
            UsbDirection::In => {
                let available = hw.bytes_available(index);
                let copied = match xfer.rx_window(available, mps) {
                    Ok(window) => hw.read_packet(index, window),
                    Err(_) => {
                        warn!("PIPE{} BABBLE, {} BYTES", index, available);
                        return self.finish(XferResult::Failed);
                    }
                };
                xfer.rx_done(copied, available, mps)
            }
        };

        if !done {
            self.issue(hw, wait)
        } else if self.stage.is_some() {
            self.stage = Some(ControlStage::Status);
            self.set_toggle(hw, DataToggle::Data1);
            self.issue(hw, wait)
        } else {
            self.finish(XferResult::Success)
        }
    }

    /// The device wasn't ready.
    ///
    /// Interrupt pipes poll again after their interval. Everything else
    /// retries right away, until it has seen [`NAK_RETRY_LIMIT`] NAKs in a
    /// row; then it waits for the next frame.
    pub(crate) fn on_nak<H: HostHardware, C: Clock>(
        &mut self,
        frame: u16,
        hw: &mut H,
        wait: &Wait<C>,
    ) -> Option<Completion> {
        if self.xfer.is_none() {
            return None;
        }
        if self.kind == TransferType::Interrupt {
            self.retry_at = Some(frame.wrapping_add(self.interval.max(1) as u16));
            return None;
        }
        self.naks += 1;
        if self.naks < NAK_RETRY_LIMIT {
            self.issue(hw, wait)
        } else {
            trace!("PIPE{} DEFERRED", self.index);
            self.naks = 0;
            self.retry_at = Some(frame.wrapping_add(1));
            None
        }
    }

    /// A frame started. Retries a deferred transaction that's due.
    pub(crate) fn on_frame<H: HostHardware, C: Clock>(
        &mut self,
        frame: u16,
        hw: &mut H,
        wait: &Wait<C>,
    ) -> Option<Completion> {
        match self.retry_at {
            Some(at) if reached(frame, at) => {
                self.retry_at = None;
                self.issue(hw, wait)
            }
            _ => None,
        }
    }

    /// The device responded with STALL.
    pub(crate) fn on_stall<H: HostHardware>(&mut self, hw: &mut H) -> Option<Completion> {
        hw.halt(self.index);
        if self.xfer.is_none() {
            return None;
        }
        self.stalled = true;
        self.finish(XferResult::Stalled)
    }

    /// The transaction failed on the bus.
    pub(crate) fn on_error(&mut self, _code: u32) -> Option<Completion> {
        warn!("PIPE{} ERROR {:#X}", self.index, _code);
        self.finish(XferResult::Failed)
    }

    /// Halt the pipe, and silently drop any active transfer.
    pub(crate) fn abort<H: HostHardware>(&mut self, hw: &mut H) -> bool {
        hw.halt(self.index);
        let active = self.xfer.is_some();
        self.finish(XferResult::Failed);
        active
    }

    /// Forget a stall. The next transaction is DATA0.
    pub(crate) fn clear_stall<H: HostHardware>(&mut self, hw: &mut H) {
        self.stalled = false;
        self.set_toggle(hw, DataToggle::Data0);
    }

    /// Return to the state after open.
    pub(crate) fn reset<H: HostHardware>(&mut self, hw: &mut H) {
        self.abort(hw);
        self.clear_stall(hw);
    }
}

/// Open pipes, and the routes to them
#[derive(Debug)]
pub struct PipeTable {
    pipes: [Option<Pipe>; MAX_PIPES],
    generations: [u8; MAX_PIPES],
    /// Pipe index for every device address, and endpoint address.
    routes: [[u8; 32]; MAX_DEVICES],
    capacity: usize,
}

impl PipeTable {
    /// A table for `capacity` hardware pipes.
    pub fn new(capacity: usize) -> Self {
        const PIPE: Option<Pipe> = None;
        PipeTable {
            pipes: [PIPE; MAX_PIPES],
            generations: [0; MAX_PIPES],
            routes: [[NO_PIPE; 32]; MAX_DEVICES],
            capacity: capacity.min(MAX_PIPES),
        }
    }

    /// Returns the number of pipes that can be open at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of open pipes.
    pub fn len(&self) -> usize {
        self.pipes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a pipe for endpoint `config` of device `dev_addr`.
    ///
    /// A control pipe is routed from both directions of its endpoint.
    pub fn open(&mut self, dev_addr: u8, config: &EndpointConfig) -> Result<PipeHandle, Error> {
        let routes = self
            .routes
            .get(dev_addr as usize)
            .ok_or(Error::InvalidState)?;
        let number = config.address.index();
        let slots = if config.kind == TransferType::Control {
            [
                route(EndpointAddress::from_parts(number, UsbDirection::Out)),
                route(EndpointAddress::from_parts(number, UsbDirection::In)),
            ]
        } else {
            let slot = route(config.address);
            [slot, slot]
        };
        let [Some(first), Some(second)] = slots else {
            warn!("EP{} HAS NO ROUTE", number);
            return Err(Error::InvalidState);
        };
        let slots = [first, second];
        if slots.iter().any(|&slot| routes[slot] != NO_PIPE) {
            return Err(Error::InvalidState);
        }

        let index = self.pipes[..self.capacity]
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoResource)?;
        self.pipes[index] = Some(Pipe::new(index as u8, dev_addr, config));
        for slot in slots {
            self.routes[dev_addr as usize][slot] = index as u8;
        }
        Ok(PipeHandle {
            index: index as u8,
            generation: self.generations[index],
        })
    }

    /// Returns the handle of the pipe at `index`, if it's open.
    pub fn handle_at(&self, index: u8) -> Option<PipeHandle> {
        let index = index as usize;
        self.pipes.get(index)?.as_ref()?;
        Some(PipeHandle {
            index: index as u8,
            generation: self.generations[index],
        })
    }

    /// Find the pipe for an endpoint of a device.
    pub fn lookup(&self, dev_addr: u8, ep: EndpointAddress) -> Option<PipeHandle> {
        let index = *self.routes.get(dev_addr as usize)?.get(route(ep)?)?;
        if index == NO_PIPE {
            return None;
        }
        self.handle_at(index)
    }

    fn check(&self, handle: PipeHandle) -> Result<usize, Error> {
        let index = handle.index as usize;
        let open = self.pipes.get(index).is_some_and(Option::is_some);
        if open && self.generations[index] == handle.generation {
            Ok(index)
        } else {
            Err(Error::InvalidState)
        }
    }

    /// Fails with [`Error::InvalidState`] if the handle is stale.
    pub fn get(&self, handle: PipeHandle) -> Result<&Pipe, Error> {
        let index = self.check(handle)?;
        self.pipes[index].as_ref().ok_or(Error::InvalidState)
    }

    /// Fails with [`Error::InvalidState`] if the handle is stale.
    pub fn get_mut(&mut self, handle: PipeHandle) -> Result<&mut Pipe, Error> {
        let index = self.check(handle)?;
        self.pipes[index].as_mut().ok_or(Error::InvalidState)
    }

    pub(crate) fn by_index_mut(&mut self, index: u8) -> Option<&mut Pipe> {
        self.pipes.get_mut(index as usize)?.as_mut()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pipe> {
        self.pipes.iter_mut().flatten()
    }

    /// Release a pipe. Its handles go stale.
    pub fn remove(&mut self, handle: PipeHandle) -> Result<Pipe, Error> {
        let index = self.check(handle)?;
        let pipe = self.pipes[index].take().ok_or(Error::InvalidState)?;
        self.generations[index] = self.generations[index].wrapping_add(1);
        for slot in self.routes[pipe.dev_addr as usize].iter_mut() {
            if *slot == index as u8 {
                *slot = NO_PIPE;
            }
        }
        Ok(pipe)
    }
}
