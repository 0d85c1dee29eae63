//! The USB host driver

use super::{
    pipe::{Pipe, PipeHandle, PipeTable, MAX_PIPES},
    Handshake, HostHardware, HostInterrupts,
};
use crate::{
    buffer::XferBuffer,
    endpoint::Completion,
    error::{Error, XferResult},
    event::{Producer, QueuedEvent, EVENT_QUEUE_DEPTH},
    setup::SetupPacket,
    wait::{Clock, SpinClock, Wait, DEFAULT_READY_TIMEOUT_US},
    EndpointConfig, Speed, TransferType,
};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// Something the upper layer should know about
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Event {
    /// A device attached to the root port. It answers on address 0 after a
    /// [`port_reset`](Host::port_reset).
    DeviceAttach { speed: Speed },
    /// The device detached. Every pipe is closed.
    DeviceRemove,
    /// A transfer finished.
    ///
    /// For a control transfer, `ep` carries the direction of the data stage,
    /// and `len` counts the data stage bytes.
    XferComplete {
        dev_addr: u8,
        ep: EndpointAddress,
        len: usize,
        result: XferResult,
    },
}

impl QueuedEvent for Event {
    fn is_sof(&self) -> bool {
        false
    }
}

/// A USB host, on one root port
pub struct Host<'q, H, C = SpinClock, const Q: usize = EVENT_QUEUE_DEPTH> {
    hw: H,
    wait: Wait<C>,
    pipes: PipeTable,
    events: Producer<'q, Event, Q>,
    dropped: u32,
    frame: u16,
    attached: bool,
    speed: Speed,
}

impl<'q, H: HostHardware, const Q: usize> Host<'q, H, SpinClock, Q> {
    /// Create a host that reports events to `events`.
    pub fn new(hw: H, events: Producer<'q, Event, Q>) -> Self {
        Self::with_clock(hw, events, SpinClock::new())
    }
}

impl<'q, H: HostHardware, C: Clock, const Q: usize> Host<'q, H, C, Q> {
    /// Create a host that bounds hardware waits with `clock`.
    pub fn with_clock(hw: H, events: Producer<'q, Event, Q>, clock: C) -> Self {
        Host {
            hw,
            wait: Wait::new(clock, DEFAULT_READY_TIMEOUT_US),
            pipes: PipeTable::new(H::PIPES),
            events,
            dropped: 0,
            frame: 0,
            attached: false,
            speed: Speed::Full,
        }
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Bound every wait on hardware readiness by `timeout_us`.
    pub fn set_ready_timeout(&mut self, timeout_us: u32) {
        self.wait.set_timeout_us(timeout_us);
    }

    /// Returns the number of frames seen since [`init`](Host::init).
    pub fn frame_number(&self) -> u16 {
        self.frame
    }

    /// Returns the number of events lost to a full queue.
    pub fn dropped_events(&self) -> u32 {
        self.dropped
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Returns the speed of the attached device.
    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Initialize the controller.
    pub fn init(&mut self) {
        self.hw.init();
        self.frame = 0;
        debug!("HOST INIT");
    }

    fn push(&mut self, event: Event) {
        if self.events.enqueue(event).is_err() {
            warn!("EVENT QUEUE FULL, DROPPED {:?}", event);
            self.dropped = self.dropped.wrapping_add(1);
        }
    }

    fn complete(&mut self, dev_addr: u8, ep: EndpointAddress, done: Completion) {
        trace!("DEV{} EP{} {:?} COMPLETE {:?}", dev_addr, ep.index(), ep.direction(), done);
        self.push(Event::XferComplete {
            dev_addr,
            ep,
            len: done.len,
            result: done.result,
        });
    }

    /// Reset the root port.
    ///
    /// Every non-control pipe closes. Control pipes stay open, but lose their
    /// transfers, their stall, and their toggle.
    pub fn port_reset(&mut self) {
        self.hw.port_reset();
        for index in 0..MAX_PIPES as u8 {
            let Some(handle) = self.pipes.handle_at(index) else {
                continue;
            };
            let control = self
                .pipes
                .get(handle)
                .is_ok_and(|pipe| pipe.kind() == TransferType::Control);
            if control {
                if let Ok(pipe) = self.pipes.get_mut(handle) {
                    pipe.reset(&mut self.hw);
                }
            } else {
                let _ = self.close(handle);
            }
        }
        debug!("PORT RESET");
    }

    /// Open a pipe to an endpoint of device `dev_addr`.
    ///
    /// Fails with [`Error::InvalidState`] if the configuration is invalid, or
    /// the endpoint already has a pipe, and with [`Error::NoResource`] if no
    /// pipe is free.
    pub fn open(&mut self, dev_addr: u8, config: &EndpointConfig) -> Result<PipeHandle, Error> {
        if config.max_packet_size == 0
            || config.max_packet_size > config.kind.max_packet_limit(self.speed)
        {
            return Err(Error::InvalidState);
        }
        let handle = self.pipes.open(dev_addr, config)?;
        if let Err(err) = self.hw.open_pipe(handle.index(), dev_addr, config) {
            let _ = self.pipes.remove(handle);
            return Err(err);
        }
        debug!(
            "PIPE{} OPEN DEV{} EP{} {:?}",
            handle.index(),
            dev_addr,
            config.address.index(),
            config.kind
        );
        Ok(handle)
    }

    /// Open the default control pipe of device `dev_addr`.
    pub fn open_control(&mut self, dev_addr: u8, max_packet_size: u16) -> Result<PipeHandle, Error> {
        self.open(
            dev_addr,
            &EndpointConfig::control(UsbDirection::Out, max_packet_size),
        )
    }

    /// Find the pipe for an endpoint of a device.
    pub fn pipe(&self, dev_addr: u8, ep: EndpointAddress) -> Option<PipeHandle> {
        self.pipes.lookup(dev_addr, ep)
    }

    /// Inspect an open pipe.
    pub fn pipe_info(&self, handle: PipeHandle) -> Result<&Pipe, Error> {
        self.pipes.get(handle)
    }

    /// Close a pipe. An active transfer is dropped, and never completes.
    pub fn close(&mut self, handle: PipeHandle) -> Result<(), Error> {
        let pipe = self.pipes.get_mut(handle)?;
        pipe.abort(&mut self.hw);
        self.hw.close_pipe(handle.index());
        self.pipes.remove(handle)?;
        debug!("PIPE{} CLOSED", handle.index());
        Ok(())
    }

    /// Close every pipe of device `dev_addr`.
    pub fn close_all(&mut self, dev_addr: u8) {
        for index in 0..MAX_PIPES as u8 {
            let Some(handle) = self.pipes.handle_at(index) else {
                continue;
            };
            if self.pipes.get(handle).is_ok_and(|pipe| pipe.dev_addr() == dev_addr) {
                let _ = self.close(handle);
            }
        }
    }

    fn close_everything(&mut self) {
        for index in 0..MAX_PIPES as u8 {
            if let Some(handle) = self.pipes.handle_at(index) {
                let _ = self.close(handle);
            }
        }
    }

    /// Start a transfer on a non-control pipe.
    ///
    /// Completion arrives as [`Event::XferComplete`].
    pub fn xfer(&mut self, handle: PipeHandle, buffer: XferBuffer) -> Result<(), Error> {
        self.start(handle, buffer, None)
    }

    /// Run a control request on a control pipe.
    ///
    /// At most `wLength` bytes move in the data stage. The SETUP, DATA, and
    /// STATUS stages complete as one transfer.
    pub fn control_xfer(
        &mut self,
        handle: PipeHandle,
        setup: SetupPacket,
        buffer: XferBuffer,
    ) -> Result<(), Error> {
        self.start(handle, buffer, Some(setup))
    }

    fn start(
        &mut self,
        handle: PipeHandle,
        buffer: XferBuffer,
        setup: Option<SetupPacket>,
    ) -> Result<(), Error> {
        let pipe = self.pipes.get_mut(handle)?;
        if let Some(done) = pipe.start(&mut self.hw, &self.wait, buffer, setup)? {
            let (dev_addr, ep) = (pipe.dev_addr(), pipe.address());
            self.complete(dev_addr, ep, done);
        }
        Ok(())
    }

    /// Drop the active transfer, if any, without a completion.
    pub fn abort(&mut self, handle: PipeHandle) -> Result<(), Error> {
        let pipe = self.pipes.get_mut(handle)?;
        if pipe.abort(&mut self.hw) {
            debug!("PIPE{} ABORTED", handle.index());
        }
        Ok(())
    }

    /// Forget a stall, after the device's halt was cleared.
    ///
    /// The next transaction is DATA0.
    pub fn clear_stall(&mut self, handle: PipeHandle) -> Result<(), Error> {
        let pipe = self.pipes.get_mut(handle)?;
        pipe.clear_stall(&mut self.hw);
        Ok(())
    }

    /// Indicates if the pipe's endpoint stalled.
    ///
    /// Returns `false` for a stale handle.
    pub fn is_stalled(&self, handle: PipeHandle) -> bool {
        self.pipes.get(handle).is_ok_and(Pipe::is_stalled)
    }

    /// Handle the USB interrupt
    pub fn on_interrupt(&mut self) {
        let status = self.hw.read_status();

        if status.contains(HostInterrupts::DISCONNECT) {
            self.hw.clear_status(HostInterrupts::DISCONNECT);
            self.close_everything();
            if self.attached {
                self.attached = false;
                debug!("DEVICE REMOVED");
                self.push(Event::DeviceRemove);
            }
        }

        if status.contains(HostInterrupts::CONNECT) {
            self.hw.clear_status(HostInterrupts::CONNECT);
            self.attached = true;
            self.speed = self.hw.speed();
            debug!("DEVICE ATTACHED {:?}", self.speed);
            self.push(Event::DeviceAttach { speed: self.speed });
        }

        if status.contains(HostInterrupts::TRANSFER) {
            while let Some((index, handshake)) = self.hw.next_result() {
                self.on_result(index, handshake);
            }
            self.hw.clear_status(HostInterrupts::TRANSFER);
        }

        if status.contains(HostInterrupts::FRAME) {
            self.hw.clear_status(HostInterrupts::FRAME);
            self.frame = self.frame.wrapping_add(1);
            self.on_frame();
        }
    }

    fn on_result(&mut self, index: u8, handshake: Handshake) {
        let frame = self.frame;
        let Some(pipe) = self.pipes.by_index_mut(index) else {
            trace!("PIPE{} NOT OPEN", index);
            return;
        };
        let done = match handshake {
            Handshake::Ack => pipe.on_ack(&mut self.hw, &self.wait),
            Handshake::Nak => pipe.on_nak(frame, &mut self.hw, &self.wait),
            Handshake::Stall => pipe.on_stall(&mut self.hw),
            Handshake::Error(code) => pipe.on_error(code),
        };
        let Some(done) = done else {
            return;
        };
        let (dev_addr, ep) = (pipe.dev_addr(), pipe.address());
        self.complete(dev_addr, ep, done);
    }

    fn on_frame(&mut self) {
        let frame = self.frame;
        for pipe in self.pipes.iter_mut() {
            if let Some(done) = pipe.on_frame(frame, &mut self.hw, &self.wait) {
                let event = Event::XferComplete {
                    dev_addr: pipe.dev_addr(),
                    ep: pipe.address(),
                    len: done.len,
                    result: done.result,
                };
                if self.events.enqueue(event).is_err() {
                    warn!("EVENT QUEUE FULL, DROPPED {:?}", event);
                    self.dropped = self.dropped.wrapping_add(1);
                }
            }
        }
    }
}
