//! The USB device driver
//!
//! [`Device`] owns a [`DeviceHardware`] adapter, the endpoint table, and the
//! control state machine. Call [`on_interrupt`](Device::on_interrupt) from the
//! USB interrupt handler; it turns hardware activity into [`Event`]s on the
//! queue. Everything else is the upper layer's API: open endpoints, submit
//! transfers, answer control requests.

use crate::{
    buffer::XferBuffer,
    control::{Control, Stage},
    endpoint::{Completion, Endpoint},
    error::{Error, XferResult},
    event::{Producer, QueuedEvent, EVENT_QUEUE_DEPTH},
    hw::{DeviceHardware, EndpointEvent, Interrupts},
    setup::SetupPacket,
    state::EndpointTable,
    wait::{Clock, SpinClock, Wait, DEFAULT_READY_TIMEOUT_US},
    DataToggle, EndpointConfig, Speed, TransferType,
};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// Direct index to the OUT control endpoint
fn ctrl_ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// Direct index to the IN control endpoint
fn ctrl_ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

/// Acquire an open, non-control endpoint.
fn data_endpoint(table: &mut EndpointTable, ep: EndpointAddress) -> Result<&mut Endpoint, Error> {
    if ep.index() == 0 {
        return Err(Error::InvalidState);
    }
    table.endpoint_mut(ep).ok_or(Error::InvalidState)
}

/// Default max packet size for endpoint 0.
pub const CONTROL_MAX_PACKET_SIZE: u16 = 64;

/// Something the upper layer should know about
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Event {
    /// The host reset the bus. Every non-control endpoint is closed.
    BusReset { speed: Speed },
    /// VBUS went away. Every non-control endpoint is closed.
    Unplugged,
    Suspend,
    Resume,
    /// Start of frame. Only produced while enabled.
    Sof { frame: u16 },
    /// A control request arrived on endpoint 0.
    ///
    /// Answer with [`Device::control_xfer`], [`Device::control_status`],
    /// [`Device::set_address`], or [`Device::control_stall`].
    SetupReceived(SetupPacket),
    /// A transfer finished.
    XferComplete {
        ep: EndpointAddress,
        len: usize,
        result: XferResult,
    },
}

impl QueuedEvent for Event {
    fn is_sof(&self) -> bool {
        matches!(self, Event::Sof { .. })
    }
}

/// The producer side of the event queue, and the count of lost events.
struct Notifier<'q, const Q: usize> {
    events: Producer<'q, Event, Q>,
    dropped: u32,
}

impl<const Q: usize> Notifier<'_, Q> {
    fn push(&mut self, event: Event) {
        if self.events.enqueue(event).is_err() {
            warn!("EVENT QUEUE FULL, DROPPED {:?}", event);
            self.dropped = self.dropped.wrapping_add(1);
        }
    }

    fn completion(&mut self, ep: EndpointAddress, done: Completion) {
        trace!("EP{} {:?} COMPLETE {:?}", ep.index(), ep.direction(), done);
        self.push(Event::XferComplete {
            ep,
            len: done.len,
            result: done.result,
        });
    }
}

/// A USB device
///
/// `Q` is the depth of the event queue. `C` bounds the driver's waits on
/// hardware; see [`wait`](crate::wait).
pub struct Device<'q, H, C = SpinClock, const Q: usize = EVENT_QUEUE_DEPTH> {
    hw: H,
    wait: Wait<C>,
    table: EndpointTable,
    control: Control,
    notify: Notifier<'q, Q>,
    address: u8,
    speed: Speed,
    suspended: bool,
    sof_enabled: bool,
    ep0_size: u16,
}

impl<'q, H: DeviceHardware, const Q: usize> Device<'q, H, SpinClock, Q> {
    /// Create a device that reports events to `events`.
    ///
    /// Hardware waits are bounded by a [`SpinClock`].
    pub fn new(hw: H, events: Producer<'q, Event, Q>) -> Self {
        Self::with_clock(hw, events, SpinClock::new())
    }
}

impl<'q, H: DeviceHardware, C: Clock, const Q: usize> Device<'q, H, C, Q> {
    /// Create a device that bounds hardware waits with `clock`.
    pub fn with_clock(hw: H, events: Producer<'q, Event, Q>, clock: C) -> Self {
        Device {
            hw,
            wait: Wait::new(clock, DEFAULT_READY_TIMEOUT_US),
            table: EndpointTable::for_hardware::<H>(),
            control: Control::new(),
            notify: Notifier { events, dropped: 0 },
            address: 0,
            speed: Speed::Full,
            suspended: false,
            sof_enabled: false,
            ep0_size: CONTROL_MAX_PACKET_SIZE,
        }
    }

    /// Access the hardware adapter.
    pub fn hw(&self) -> &H {
        &self.hw
    }

    /// Mutably access the hardware adapter.
    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Bound every wait on hardware readiness by `timeout_us`.
    pub fn set_ready_timeout(&mut self, timeout_us: u32) {
        self.wait.set_timeout_us(timeout_us);
    }

    /// Set the endpoint 0 max packet size.
    ///
    /// Takes effect at the next [`init`](Device::init) or bus reset. The
    /// default is [`CONTROL_MAX_PACKET_SIZE`].
    pub fn set_ep0_size(&mut self, max_packet_size: u16) {
        self.ep0_size = max_packet_size;
    }

    /// Initialize the controller, and open endpoint 0.
    ///
    /// The device stays detached until [`connect`](Device::connect).
    pub fn init(&mut self) {
        self.hw.init();
        self.table.reset();
        self.control.reset();
        self.open_control();
        debug!("INIT");
    }

    fn open_control(&mut self) {
        for direction in [UsbDirection::Out, UsbDirection::In] {
            let config = EndpointConfig::control(direction, self.ep0_size);
            match self.table.open(&mut self.hw, &config) {
                Ok(ep) => ep.set_toggle(&mut self.hw, DataToggle::Data0),
                Err(_err) => {
                    warn!("EP0 {:?} NOT OPENED {:?}", direction, _err);
                }
            }
        }
    }

    /// Attach to the bus.
    pub fn connect(&mut self) {
        self.hw.connect();
    }

    /// Detach from the bus.
    pub fn disconnect(&mut self) {
        self.hw.disconnect();
    }

    /// Returns the device address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Returns the speed negotiated at the last bus reset.
    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn frame_number(&self) -> u16 {
        self.hw.frame_number()
    }

    /// Returns the number of events lost to a full queue.
    ///
    /// Dropped start-of-frame events aren't counted.
    pub fn dropped_events(&self) -> u32 {
        self.notify.dropped
    }

    /// Returns the control transfer stage.
    pub fn control_stage(&self) -> Stage {
        self.control.stage()
    }

    /// Acquire an open endpoint.
    pub fn endpoint(&self, ep: EndpointAddress) -> Option<&Endpoint> {
        self.table.endpoint(ep)
    }

    /// Open a non-control endpoint.
    ///
    /// Fails with [`Error::InvalidState`] if the configuration is invalid, or
    /// the endpoint is already open, and with [`Error::NoResource`] if the
    /// hardware has no endpoint left.
    pub fn edpt_open(&mut self, config: &EndpointConfig) -> Result<(), Error> {
        let number = config.address.index();
        if number == 0 || number > 15 || config.kind == TransferType::Control {
            return Err(Error::InvalidState);
        }
        if config.max_packet_size == 0
            || config.max_packet_size > config.kind.max_packet_limit(self.speed)
        {
            return Err(Error::InvalidState);
        }
        self.table.open(&mut self.hw, config).map(|_| ())
    }

    /// Open an endpoint from its raw descriptor.
    pub fn edpt_open_descriptor(&mut self, descriptor: &[u8]) -> Result<(), Error> {
        self.edpt_open(&EndpointConfig::from_descriptor(descriptor)?)
    }

    /// Close a non-control endpoint.
    ///
    /// An active transfer is dropped, and never completes.
    pub fn edpt_close(&mut self, ep: EndpointAddress) -> Result<(), Error> {
        if ep.index() == 0 {
            return Err(Error::InvalidState);
        }
        self.table.close(&mut self.hw, ep)
    }

    /// Close every non-control endpoint.
    pub fn edpt_close_all(&mut self) {
        self.table.close_all(&mut self.hw);
    }

    /// Start a transfer on an open, idle, non-control endpoint.
    ///
    /// For IN endpoints, the whole buffer is sent. For OUT endpoints, the
    /// transfer ends when the buffer is full, or the host sends a short
    /// packet. Completion arrives as [`Event::XferComplete`].
    pub fn edpt_xfer(&mut self, ep: EndpointAddress, buffer: XferBuffer) -> Result<(), Error> {
        let endpoint = data_endpoint(&mut self.table, ep)?;
        if endpoint.is_stalled() {
            return Err(Error::InvalidState);
        }
        if let Some(done) = endpoint.submit(&mut self.hw, &self.wait, buffer)? {
            self.notify.completion(ep, done);
        }
        Ok(())
    }

    /// Respond to the host with STALL.
    ///
    /// An active transfer completes with [`XferResult::Stalled`]. Stalling
    /// endpoint 0 stalls the control request.
    pub fn edpt_stall(&mut self, ep: EndpointAddress) -> Result<(), Error> {
        if ep.index() == 0 {
            return self.control_stall();
        }
        let endpoint = data_endpoint(&mut self.table, ep)?;
        if let Some(done) = endpoint.stall(&mut self.hw) {
            self.notify.completion(ep, done);
        }
        Ok(())
    }

    /// Clear a stall. The next packet is DATA0.
    pub fn edpt_clear_stall(&mut self, ep: EndpointAddress) -> Result<(), Error> {
        let endpoint = self
            .table
            .endpoint_mut(ep)
            .ok_or(Error::InvalidState)?;
        endpoint.clear_stall(&mut self.hw);
        Ok(())
    }

    /// Indicates if the endpoint is stalled.
    ///
    /// Returns `false` for a closed endpoint.
    pub fn edpt_stalled(&self, ep: EndpointAddress) -> bool {
        self.table.endpoint(ep).is_some_and(Endpoint::is_stalled)
    }

    /// Indicates if the endpoint has an active transfer.
    pub fn edpt_busy(&self, ep: EndpointAddress) -> bool {
        self.table.endpoint(ep).is_some_and(Endpoint::is_busy)
    }

    /// Drop the active transfer, if any, without a completion.
    pub fn edpt_abort(&mut self, ep: EndpointAddress) -> Result<(), Error> {
        let endpoint = data_endpoint(&mut self.table, ep)?;
        if endpoint.abort(&mut self.hw) {
            debug!("EP{} {:?} ABORTED", ep.index(), ep.direction());
        }
        Ok(())
    }

    /// Enable zero length termination (ZLT) for the given endpoint
    ///
    /// When ZLT is enabled, an IN transfer that ends on a full packet is
    /// followed by a zero-length packet. ZLT is disabled by default.
    pub fn enable_zlt(&mut self, ep: EndpointAddress) -> Result<(), Error> {
        let endpoint = data_endpoint(&mut self.table, ep)?;
        endpoint.set_zlt(true);
        Ok(())
    }

    /// Answer the current control request with a data stage.
    ///
    /// The direction comes from the request. At most `wLength` bytes move.
    /// Once the data stage completes, the status stage follows automatically.
    /// A request without a data stage gets its status stage.
    pub fn control_xfer(&mut self, buffer: XferBuffer) -> Result<(), Error> {
        let Device {
            hw,
            wait,
            table,
            control,
            notify,
            ..
        } = self;
        control.data(hw, wait, table, buffer, &mut |ep, done| {
            notify.completion(ep, done)
        })
    }

    /// Answer the current control request with just a status stage.
    pub fn control_status(&mut self) -> Result<(), Error> {
        let Device {
            hw,
            wait,
            table,
            control,
            notify,
            ..
        } = self;
        control.status(hw, wait, table, &mut |ep, done| notify.completion(ep, done))
    }

    /// Reject the current control request.
    pub fn control_stall(&mut self) -> Result<(), Error> {
        let Device {
            hw,
            table,
            control,
            notify,
            ..
        } = self;
        control.stall(hw, table, &mut |ep, done| notify.completion(ep, done));
        Ok(())
    }

    /// Answer a `SET_ADDRESS` request.
    ///
    /// Queues the status stage. The hardware takes the new address once the
    /// status stage completes, never before.
    pub fn set_address(&mut self, address: u8) -> Result<(), Error> {
        if address > 127 || self.control.stage() != Stage::SetupReceived {
            return Err(Error::InvalidState);
        }
        self.control.set_pending_address(address);
        self.control_status()
    }

    /// Signal resume to the host.
    ///
    /// Only valid while suspended.
    pub fn remote_wakeup(&mut self) -> Result<(), Error> {
        if !self.suspended {
            return Err(Error::InvalidState);
        }
        self.hw.remote_wakeup();
        Ok(())
    }

    /// Enable or disable [`Event::Sof`]. Disabled by default.
    pub fn set_sof_enabled(&mut self, enabled: bool) {
        self.sof_enabled = enabled;
        self.hw.set_sof_enabled(enabled);
    }

    /// Handle the USB interrupt
    pub fn on_interrupt(&mut self) {
        let status = self.hw.read_status();

        if status.contains(Interrupts::UNPLUGGED) {
            self.hw.clear_status(Interrupts::UNPLUGGED);
            self.unplugged();
        }

        if status.contains(Interrupts::BUS_RESET) {
            self.hw.clear_status(Interrupts::BUS_RESET);
            self.bus_reset();
        }

        // Completions that happened before the SETUP must be seen first.
        if status.contains(Interrupts::ENDPOINT) {
            while let Some(event) = self.hw.next_endpoint_event() {
                self.on_endpoint_event(event);
            }
            self.hw.clear_status(Interrupts::ENDPOINT);
        }

        if status.contains(Interrupts::SETUP) {
            let setup = SetupPacket::from(self.hw.read_setup());
            self.hw.clear_status(Interrupts::SETUP);
            trace!("SETUP {:?}", setup);
            self.control.on_setup(&mut self.hw, &mut self.table, setup);
            self.notify.push(Event::SetupReceived(setup));
        }

        if status.contains(Interrupts::SUSPEND) {
            self.hw.clear_status(Interrupts::SUSPEND);
            if !self.suspended {
                self.suspended = true;
                debug!("SUSPEND");
                self.notify.push(Event::Suspend);
            }
        }

        if status.contains(Interrupts::RESUME) {
            self.hw.clear_status(Interrupts::RESUME);
            self.resume();
        }

        if status.contains(Interrupts::SOF) {
            self.hw.clear_status(Interrupts::SOF);
            // The host is clearly sending frames again.
            self.resume();
            if self.sof_enabled {
                let frame = self.hw.frame_number();
                self.notify.push(Event::Sof { frame });
            }
        }
    }

    fn resume(&mut self) {
        if self.suspended {
            self.suspended = false;
            debug!("RESUME");
            self.notify.push(Event::Resume);
        }
    }

    fn bus_reset(&mut self) {
        self.hw.bus_reset();
        self.table.reset();
        self.control.reset();
        self.address = 0;
        self.suspended = false;
        self.speed = self.hw.speed();
        self.open_control();
        debug!("RESET {:?}", self.speed);
        self.notify.push(Event::BusReset { speed: self.speed });
    }

    fn unplugged(&mut self) {
        self.table.close_all(&mut self.hw);
        for ep in [ctrl_ep0_out(), ctrl_ep0_in()] {
            if let Some(endpoint) = self.table.endpoint_mut(ep) {
                endpoint.abort(&mut self.hw);
            }
        }
        self.control.reset();
        self.address = 0;
        self.suspended = false;
        debug!("UNPLUGGED");
        self.notify.push(Event::Unplugged);
    }

    fn on_endpoint_event(&mut self, event: EndpointEvent) {
        let (ep, done) = match event {
            EndpointEvent::Complete(ep) => {
                let Some(endpoint) = self.table.endpoint_mut(ep) else {
                    trace!("EP{} {:?} NOT OPEN", ep.index(), ep.direction());
                    return;
                };
                (ep, endpoint.on_packet(&mut self.hw, &self.wait))
            }
            EndpointEvent::Error(ep, code) => {
                let Some(endpoint) = self.table.endpoint_mut(ep) else {
                    return;
                };
                (ep, endpoint.on_error(code))
            }
        };
        let Some(done) = done else {
            return;
        };

        self.notify.completion(ep, done);
        if ep.index() == 0 {
            let Device {
                hw,
                wait,
                table,
                control,
                notify,
                ..
            } = self;
            let latched = control.on_complete(hw, wait, table, ep, done, &mut |ep, done| {
                notify.completion(ep, done)
            });
            if let Some(address) = latched {
                self.address = address;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::{ctrl_ep0_in, ctrl_ep0_out, Device, Event};
    use crate::{
        buffer::XferBuffer,
        control::Stage,
        error::{Error, XferResult},
        event::{Consumer, EventQueue},
        hw::{DeviceHardware, Interrupts},
        mock::MockDevice,
        setup::SetupPacket,
        wait::SpinClock,
        DataToggle, EndpointConfig, Speed, TransferType,
    };
    use std::vec::Vec;
    use usb_device::{control::Request, endpoint::EndpointAddress};

    const EP1_OUT: u8 = 0x01;
    const EP1_IN: u8 = 0x81;

    fn addr(address: u8) -> EndpointAddress {
        EndpointAddress::from(address)
    }

    fn bulk(address: u8) -> EndpointConfig {
        EndpointConfig {
            address: addr(address),
            kind: TransferType::Bulk,
            max_packet_size: 64,
            interval: 0,
        }
    }

    fn buffer(memory: &mut [u8]) -> XferBuffer {
        unsafe { XferBuffer::from_raw_parts(memory.as_mut_ptr(), memory.len()) }
    }

    fn device<const Q: usize>(
        queue: &mut EventQueue<Event, Q>,
    ) -> (Device<'_, MockDevice, SpinClock, Q>, Consumer<'_, Event, Q>) {
        let (producer, consumer) = queue.split();
        let mut device = Device::new(MockDevice::new(), producer);
        device.init();
        device.connect();
        (device, consumer)
    }

    fn drain<const Q: usize>(consumer: &mut Consumer<'_, Event, Q>) -> Vec<Event> {
        consumer.by_ref().collect()
    }

    fn complete(ep: u8, len: usize, result: XferResult) -> Event {
        Event::XferComplete {
            ep: addr(ep),
            len,
            result,
        }
    }

    fn setup(device: &mut Device<'_, MockDevice>, packet: SetupPacket) {
        device.hw_mut().setup(packet);
        device.on_interrupt();
    }

    #[test]
    fn init_opens_control() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (device, _) = device(&mut queue);
        assert!(device.hw().is_open(ctrl_ep0_out()));
        assert!(device.hw().is_open(ctrl_ep0_in()));
        assert!(device.hw().is_connected());
        assert_eq!(device.control_stage(), Stage::Idle);
    }

    #[test]
    fn bulk_out_short_packet() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.edpt_open(&bulk(EP1_OUT)).unwrap();

        let mut memory = [0u8; 200];
        device.edpt_xfer(addr(EP1_OUT), buffer(&mut memory)).unwrap();
        for size in [64, 64] {
            device.hw_mut().receive(addr(EP1_OUT), &[0xEE; 64][..size]);
            device.on_interrupt();
            assert!(drain(&mut events).is_empty());
        }
        device.hw_mut().receive(addr(EP1_OUT), &[0xEE; 32]);
        device.on_interrupt();

        assert_eq!(
            drain(&mut events),
            [complete(EP1_OUT, 160, XferResult::Success)]
        );
        assert!(!device.edpt_busy(addr(EP1_OUT)));
    }

    #[test]
    fn zero_length_in() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.edpt_open(&bulk(EP1_IN)).unwrap();
        device.edpt_xfer(addr(EP1_IN), XferBuffer::empty()).unwrap();
        device.hw_mut().ack_in(addr(EP1_IN));
        device.on_interrupt();

        assert_eq!(device.hw().sent(addr(EP1_IN)), [0]);
        assert_eq!(drain(&mut events), [complete(EP1_IN, 0, XferResult::Success)]);
    }

    #[test]
    fn single_outstanding_transfer() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.edpt_open(&bulk(EP1_IN)).unwrap();
        static FIRST: [u8; 100] = [1; 100];
        static SECOND: [u8; 10] = [2; 10];
        device
            .edpt_xfer(addr(EP1_IN), XferBuffer::from_static(&FIRST))
            .unwrap();
        assert_eq!(
            device.edpt_xfer(addr(EP1_IN), XferBuffer::from_static(&SECOND)),
            Err(Error::InvalidState)
        );
        for _ in 0..2 {
            device.hw_mut().ack_in(addr(EP1_IN));
            device.on_interrupt();
        }
        assert_eq!(device.hw().sent(addr(EP1_IN)), [64, 36]);
        assert_eq!(
            drain(&mut events),
            [complete(EP1_IN, 100, XferResult::Success)]
        );
    }

    #[test]
    fn endpoint_number_out_of_range() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, _) = device(&mut queue);
        for ep in [0x10, 0x90, 0xFF] {
            let ep = addr(ep);
            assert_eq!(device.edpt_xfer(ep, XferBuffer::empty()), Err(Error::InvalidState));
            assert_eq!(device.edpt_stall(ep), Err(Error::InvalidState));
            assert_eq!(device.edpt_clear_stall(ep), Err(Error::InvalidState));
            assert_eq!(device.edpt_abort(ep), Err(Error::InvalidState));
            assert_eq!(device.edpt_close(ep), Err(Error::InvalidState));
            assert!(!device.edpt_stalled(ep));
            assert!(!device.edpt_busy(ep));
            assert!(device.endpoint(ep).is_none());
        }
        assert_eq!(device.edpt_open(&bulk(0x90)), Err(Error::InvalidState));
    }

    #[test]
    fn get_descriptor_request() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        let request = SetupPacket::new(0x80, Request::GET_DESCRIPTOR, 0x0100, 0, 18);
        setup(&mut device, request);
        assert_eq!(drain(&mut events), [Event::SetupReceived(request)]);
        assert_eq!(device.control_stage(), Stage::SetupReceived);

        // The upper layer offers more than requested.
        static DESCRIPTOR: [u8; 64] = [0x12; 64];
        device
            .control_xfer(XferBuffer::from_static(&DESCRIPTOR))
            .unwrap();
        assert_eq!(device.control_stage(), Stage::Data);
        assert_eq!(device.hw().sent(ctrl_ep0_in()), [18]);

        device.hw_mut().ack_in(ctrl_ep0_in());
        device.on_interrupt();
        assert_eq!(device.control_stage(), Stage::Status);
        assert_eq!(device.hw().armed_rx(ctrl_ep0_out()), Some(64));
        assert_eq!(drain(&mut events), [complete(0x80, 18, XferResult::Success)]);

        device.hw_mut().receive(ctrl_ep0_out(), &[]);
        device.on_interrupt();
        assert_eq!(device.control_stage(), Stage::Idle);
        assert_eq!(drain(&mut events), [complete(0x00, 0, XferResult::Success)]);
    }

    #[test]
    fn control_in_short_of_request_ends_with_zlp() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        setup(
            &mut device,
            SetupPacket::new(0x80, Request::GET_DESCRIPTOR, 0x0200, 0, 255),
        );
        static CONFIGURATION: [u8; 64] = [0x09; 64];
        device
            .control_xfer(XferBuffer::from_static(&CONFIGURATION))
            .unwrap();
        for _ in 0..2 {
            device.hw_mut().ack_in(ctrl_ep0_in());
            device.on_interrupt();
        }
        assert_eq!(device.hw().sent(ctrl_ep0_in()), [64, 0]);
        assert_eq!(device.control_stage(), Stage::Status);
        let events = drain(&mut events);
        assert_eq!(events[1..], [complete(0x80, 64, XferResult::Success)]);
    }

    #[test]
    fn control_out_data_stage() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        // CDC SET_LINE_CODING
        setup(&mut device, SetupPacket::new(0x21, 0x20, 0, 0, 7));
        let mut line_coding = [0u8; 16];
        device.control_xfer(buffer(&mut line_coding)).unwrap();
        assert_eq!(device.hw().armed_rx(ctrl_ep0_out()), Some(64));

        device
            .hw_mut()
            .receive(ctrl_ep0_out(), &[0x80, 0x25, 0, 0, 0, 0, 8]);
        device.on_interrupt();
        assert_eq!(device.control_stage(), Stage::Status);
        assert_eq!(device.hw().sent(ctrl_ep0_in()), [0]);

        device.hw_mut().ack_in(ctrl_ep0_in());
        device.on_interrupt();
        assert_eq!(device.control_stage(), Stage::Idle);
        assert_eq!(
            drain(&mut events)[1..],
            [
                complete(0x00, 7, XferResult::Success),
                complete(0x80, 0, XferResult::Success)
            ]
        );
        assert_eq!(line_coding[..8], [0x80, 0x25, 0, 0, 0, 0, 8, 0]);
    }

    #[test]
    fn setup_interrupts_data_stage() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        setup(&mut device, SetupPacket::new(0x21, 0x20, 0, 0, 7));
        let mut stale = [0u8; 7];
        device.control_xfer(buffer(&mut stale)).unwrap();
        assert_eq!(device.control_stage(), Stage::Data);

        // The host gives up, and starts over.
        let request = SetupPacket::new(0x80, Request::GET_STATUS, 0, 0, 2);
        setup(&mut device, request);
        assert_eq!(device.control_stage(), Stage::SetupReceived);
        assert_eq!(device.hw().toggle_of(ctrl_ep0_out()), DataToggle::Data1);
        assert_eq!(device.hw().toggle_of(ctrl_ep0_in()), DataToggle::Data1);

        // A late OUT packet belongs to nothing.
        device.hw_mut().receive(ctrl_ep0_out(), &[1; 7]);
        device.on_interrupt();
        assert_eq!(stale, [0; 7]);

        let events = drain(&mut events);
        assert_eq!(events.last(), Some(&Event::SetupReceived(request)));
        assert!(!events
            .iter()
            .any(|event| matches!(event, Event::XferComplete { .. })));
    }

    #[test]
    fn set_address_waits_for_status() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        setup(&mut device, SetupPacket::new(0, Request::SET_ADDRESS, 9, 0, 0));
        device.set_address(9).unwrap();
        assert_eq!(device.hw().address(), 0);
        assert_eq!(device.address(), 0);
        assert_eq!(device.hw().sent(ctrl_ep0_in()), [0]);

        device.hw_mut().ack_in(ctrl_ep0_in());
        device.on_interrupt();
        assert_eq!(device.hw().address(), 9);
        assert_eq!(device.address(), 9);
        assert_eq!(device.control_stage(), Stage::Idle);
        assert_eq!(drain(&mut events)[1..], [complete(0x80, 0, XferResult::Success)]);
    }

    #[test]
    fn set_address_outside_request() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, _) = device(&mut queue);
        assert_eq!(device.set_address(9), Err(Error::InvalidState));
        setup(&mut device, SetupPacket::new(0, Request::SET_ADDRESS, 200, 0, 0));
        assert_eq!(device.set_address(200), Err(Error::InvalidState));
        assert_eq!(device.control_status(), Ok(()));
    }

    #[test]
    fn control_stall_then_setup_clears() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, _) = device(&mut queue);
        setup(&mut device, SetupPacket::new(0xC0, 0x99, 0, 0, 4));
        device.control_stall().unwrap();
        assert!(device.hw().is_stalled(ctrl_ep0_out()));
        assert!(device.hw().is_stalled(ctrl_ep0_in()));
        assert!(device.edpt_stalled(ctrl_ep0_in()));
        assert_eq!(device.control_stage(), Stage::Idle);
        assert_eq!(device.control_xfer(XferBuffer::empty()), Err(Error::InvalidState));

        setup(&mut device, SetupPacket::new(0x80, Request::GET_STATUS, 0, 0, 2));
        assert!(!device.hw().is_stalled(ctrl_ep0_out()));
        assert!(!device.hw().is_stalled(ctrl_ep0_in()));
        assert!(!device.edpt_stalled(ctrl_ep0_in()));
    }

    #[test]
    fn bus_reset_closes_endpoints() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.edpt_open(&bulk(EP1_OUT)).unwrap();
        device.edpt_open(&bulk(EP1_IN)).unwrap();
        let mut memory = [0u8; 64];
        device.edpt_xfer(addr(EP1_OUT), buffer(&mut memory)).unwrap();
        setup(&mut device, SetupPacket::new(0, Request::SET_ADDRESS, 3, 0, 0));
        device.set_address(3).unwrap();
        device.hw_mut().ack_in(ctrl_ep0_in());
        device.on_interrupt();
        assert_eq!(device.address(), 3);
        drain(&mut events);

        device.hw_mut().raise(Interrupts::BUS_RESET);
        device.on_interrupt();
        assert_eq!(drain(&mut events), [Event::BusReset { speed: Speed::Full }]);
        assert_eq!(device.hw().resets(), 1);
        assert_eq!(device.address(), 0);

        assert_eq!(
            device.edpt_xfer(addr(EP1_OUT), XferBuffer::empty()),
            Err(Error::InvalidState)
        );
        assert_eq!(device.edpt_stall(addr(EP1_IN)), Err(Error::InvalidState));
        assert_eq!(device.edpt_close(addr(EP1_IN)), Err(Error::InvalidState));
        for ep in [ctrl_ep0_out(), ctrl_ep0_in()] {
            assert_eq!(device.endpoint(ep).map(|ep| ep.toggle()), Some(DataToggle::Data0));
            assert_eq!(device.hw().toggle_of(ep), DataToggle::Data0);
        }

        // The data that was in flight never completes.
        device.hw_mut().receive(addr(EP1_OUT), &[1; 8]);
        device.on_interrupt();
        assert!(drain(&mut events).is_empty());

        // Endpoints can be opened again.
        device.edpt_open(&bulk(EP1_OUT)).unwrap();
    }

    #[test]
    fn stall_and_clear() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.edpt_open(&bulk(EP1_IN)).unwrap();
        static DATA: [u8; 256] = [3; 256];
        device
            .edpt_xfer(addr(EP1_IN), XferBuffer::from_static(&DATA))
            .unwrap();
        device.hw_mut().ack_in(addr(EP1_IN));
        device.on_interrupt();
        assert_eq!(device.endpoint(addr(EP1_IN)).map(|ep| ep.toggle()), Some(DataToggle::Data1));

        device.edpt_stall(addr(EP1_IN)).unwrap();
        assert_eq!(drain(&mut events), [complete(EP1_IN, 64, XferResult::Stalled)]);
        assert!(device.edpt_stalled(addr(EP1_IN)));
        assert_eq!(
            device.edpt_xfer(addr(EP1_IN), XferBuffer::from_static(&DATA)),
            Err(Error::InvalidState)
        );

        device.edpt_clear_stall(addr(EP1_IN)).unwrap();
        assert!(!device.edpt_stalled(addr(EP1_IN)));
        assert_eq!(device.endpoint(addr(EP1_IN)).map(|ep| ep.toggle()), Some(DataToggle::Data0));
        device
            .edpt_xfer(addr(EP1_IN), XferBuffer::from_static(&DATA))
            .unwrap();
    }

    #[test]
    fn open_validation() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, _) = device(&mut queue);
        assert_eq!(device.edpt_open(&bulk(0x00)), Err(Error::InvalidState));
        assert_eq!(
            device.edpt_open(&EndpointConfig {
                max_packet_size: 65,
                ..bulk(EP1_IN)
            }),
            Err(Error::InvalidState)
        );
        assert_eq!(
            device.edpt_open(&EndpointConfig {
                kind: TransferType::Isochronous,
                max_packet_size: 1023,
                ..bulk(EP1_IN)
            }),
            Ok(())
        );
        assert_eq!(device.edpt_open(&bulk(EP1_IN)), Err(Error::InvalidState));
        assert_eq!(
            device.edpt_open_descriptor(&[7, 5, 0x83, 0x03, 8, 0, 1]),
            Ok(())
        );
    }

    #[test]
    fn out_of_endpoints() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, _) = device(&mut queue);
        // Resource 0 serves endpoint 0.
        let capacity = <MockDevice as DeviceHardware>::ENDPOINTS - 1;
        for n in 0..capacity {
            device.edpt_open(&bulk(1 + n as u8)).unwrap();
        }
        assert_eq!(device.edpt_open(&bulk(0x8F)), Err(Error::NoResource));
        device.edpt_close(addr(0x01)).unwrap();
        device.edpt_open(&bulk(0x8F)).unwrap();
    }

    #[test]
    fn close_drops_transfer() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.edpt_open(&bulk(EP1_OUT)).unwrap();
        let mut memory = [0u8; 64];
        device.edpt_xfer(addr(EP1_OUT), buffer(&mut memory)).unwrap();
        device.edpt_close(addr(EP1_OUT)).unwrap();
        assert!(!device.hw().is_open(addr(EP1_OUT)));

        device.hw_mut().receive(addr(EP1_OUT), &[1; 64]);
        device.on_interrupt();
        assert!(drain(&mut events).is_empty());
        assert_eq!(memory[0], 0);
    }

    #[test]
    fn abort_then_resubmit() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.edpt_open(&bulk(EP1_OUT)).unwrap();
        let mut first = [0u8; 64];
        let mut second = [0u8; 64];
        device.edpt_xfer(addr(EP1_OUT), buffer(&mut first)).unwrap();
        device.edpt_abort(addr(EP1_OUT)).unwrap();
        assert!(!device.edpt_busy(addr(EP1_OUT)));
        device.edpt_xfer(addr(EP1_OUT), buffer(&mut second)).unwrap();
        device.hw_mut().receive(addr(EP1_OUT), &[4; 10]);
        device.on_interrupt();
        assert_eq!(drain(&mut events), [complete(EP1_OUT, 10, XferResult::Success)]);
        assert_eq!(first[0], 0);
        assert_eq!(second[0], 4);
    }

    #[test]
    fn endpoint_error_fails_transfer() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.edpt_open(&bulk(EP1_IN)).unwrap();
        device.edpt_xfer(addr(EP1_IN), XferBuffer::empty()).unwrap();
        device.hw_mut().fail(addr(EP1_IN), 0x5);
        device.on_interrupt();
        assert_eq!(drain(&mut events), [complete(EP1_IN, 0, XferResult::Failed)]);
    }

    #[test]
    fn suspend_and_resume() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        assert_eq!(device.remote_wakeup(), Err(Error::InvalidState));

        device.hw_mut().raise(Interrupts::SUSPEND);
        device.on_interrupt();
        assert!(device.is_suspended());
        device.remote_wakeup().unwrap();
        assert_eq!(device.hw().wakeups(), 1);

        device.hw_mut().raise(Interrupts::RESUME);
        device.on_interrupt();
        assert!(!device.is_suspended());
        assert_eq!(drain(&mut events), [Event::Suspend, Event::Resume]);
    }

    #[test]
    fn sof_while_suspended_is_resume() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.hw_mut().raise(Interrupts::SUSPEND);
        device.on_interrupt();
        device.hw_mut().raise(Interrupts::SOF);
        device.on_interrupt();
        assert!(!device.is_suspended());
        // SOF events are off by default.
        assert_eq!(drain(&mut events), [Event::Suspend, Event::Resume]);

        device.set_sof_enabled(true);
        assert!(device.hw().sof_enabled());
        device.hw_mut().set_frame(42);
        device.hw_mut().raise(Interrupts::SOF);
        device.on_interrupt();
        assert_eq!(drain(&mut events), [Event::Sof { frame: 42 }]);
    }

    #[test]
    fn unplugged_closes_endpoints() {
        let mut queue: EventQueue<Event> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        device.edpt_open(&bulk(EP1_IN)).unwrap();
        device.edpt_xfer(addr(EP1_IN), XferBuffer::empty()).unwrap();
        device.hw_mut().raise(Interrupts::UNPLUGGED);
        device.on_interrupt();
        assert_eq!(drain(&mut events), [Event::Unplugged]);
        assert!(device.endpoint(addr(EP1_IN)).is_none());
        assert!(device.endpoint(ctrl_ep0_in()).is_some());
    }

    #[test]
    fn full_queue_counts_dropped_events() {
        let mut queue: EventQueue<Event, 4> = EventQueue::new();
        let (mut device, mut events) = device(&mut queue);
        for _ in 0..5 {
            device.hw_mut().raise(Interrupts::SUSPEND);
            device.on_interrupt();
            device.hw_mut().raise(Interrupts::RESUME);
            device.on_interrupt();
        }
        assert_eq!(device.dropped_events(), 7);
        assert_eq!(drain(&mut events).len(), 3);
    }
}
