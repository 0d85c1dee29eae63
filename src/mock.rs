//! Adapter doubles for unit tests
//!
//! The mocks record what the core asked of the hardware, and let tests
//! inject bus activity.

extern crate std;

use crate::{
    error::Error,
    host::{Handshake, HostHardware, HostInterrupts, MAX_PIPES},
    hw::{DeviceHardware, EndpointEvent, Interrupts},
    DataToggle, EndpointConfig, Speed,
};
use std::{collections::VecDeque, vec::Vec};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

fn index(ep: EndpointAddress) -> usize {
    ep.index() * 2 + (ep.direction() == UsbDirection::In) as usize
}

#[derive(Default, Clone)]
struct MockEndpoint {
    open: bool,
    stalled: bool,
    toggle: DataToggle,
    armed_rx: Option<usize>,
    rx: Vec<u8>,
    sent: Vec<Vec<u8>>,
}

/// A device controller that does whatever it's told.
pub struct MockDevice {
    status: Interrupts,
    setup: [u8; 8],
    events: VecDeque<EndpointEvent>,
    endpoints: Vec<MockEndpoint>,
    address: u8,
    connected: bool,
    tx_ready: bool,
    fail_open: bool,
    sof_enabled: bool,
    frame: u16,
    wakeups: usize,
    resets: usize,
}

impl MockDevice {
    pub fn new() -> Self {
        MockDevice {
            status: Interrupts::empty(),
            setup: [0; 8],
            events: VecDeque::new(),
            endpoints: std::vec![MockEndpoint::default(); 32],
            address: 0,
            connected: false,
            tx_ready: true,
            fail_open: false,
            sof_enabled: false,
            frame: 0,
            wakeups: 0,
            resets: 0,
        }
    }

    fn ep(&self, ep: EndpointAddress) -> &MockEndpoint {
        &self.endpoints[index(ep)]
    }

    fn ep_mut(&mut self, ep: EndpointAddress) -> &mut MockEndpoint {
        &mut self.endpoints[index(ep)]
    }

    /// Open an endpoint without going through the core.
    pub fn open_endpoint(&mut self, config: &EndpointConfig) {
        let ep = self.ep_mut(config.address);
        ep.open = true;
        ep.toggle = DataToggle::Data0;
    }

    /// Latch a SETUP packet.
    pub fn setup(&mut self, setup: crate::setup::SetupPacket) {
        self.setup = *setup.as_bytes();
        self.status |= Interrupts::SETUP;
    }

    /// The host sends an OUT packet.
    pub fn receive(&mut self, ep: EndpointAddress, data: &[u8]) {
        let endpoint = self.ep_mut(ep);
        endpoint.rx = data.to_vec();
        endpoint.armed_rx = None;
        endpoint.toggle = endpoint.toggle.flip();
        self.events.push_back(EndpointEvent::Complete(ep));
        self.status |= Interrupts::ENDPOINT;
    }

    /// The host acknowledges the staged IN packet.
    pub fn ack_in(&mut self, ep: EndpointAddress) {
        let endpoint = self.ep_mut(ep);
        endpoint.toggle = endpoint.toggle.flip();
        self.events.push_back(EndpointEvent::Complete(ep));
        self.status |= Interrupts::ENDPOINT;
    }

    /// The endpoint's packet fails with `code`.
    pub fn fail(&mut self, ep: EndpointAddress, code: u32) {
        self.events.push_back(EndpointEvent::Error(ep, code));
        self.status |= Interrupts::ENDPOINT;
    }

    pub fn raise(&mut self, interrupts: Interrupts) {
        self.status |= interrupts;
    }

    pub fn set_tx_ready(&mut self, ready: bool) {
        self.tx_ready = ready;
    }

    pub fn set_frame(&mut self, frame: u16) {
        self.frame = frame;
    }

    pub fn fail_next_open(&mut self) {
        self.fail_open = true;
    }

    /// Sizes of every IN packet staged on `ep`.
    pub fn sent(&self, ep: EndpointAddress) -> Vec<usize> {
        self.ep(ep).sent.iter().map(Vec::len).collect()
    }

    pub fn armed_rx(&self, ep: EndpointAddress) -> Option<usize> {
        self.ep(ep).armed_rx
    }

    pub fn toggle_of(&self, ep: EndpointAddress) -> DataToggle {
        self.ep(ep).toggle
    }

    pub fn is_stalled(&self, ep: EndpointAddress) -> bool {
        self.ep(ep).stalled
    }

    pub fn is_open(&self, ep: EndpointAddress) -> bool {
        self.ep(ep).open
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn sof_enabled(&self) -> bool {
        self.sof_enabled
    }

    pub fn wakeups(&self) -> usize {
        self.wakeups
    }

    pub fn resets(&self) -> usize {
        self.resets
    }
}

impl DeviceHardware for MockDevice {
    const ENDPOINTS: usize = 8;
    const SHARED_DIRECTIONS: bool = false;

    fn init(&mut self) {
        self.connected = false;
    }

    fn connect(&mut self) {
        self.connected = true;
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn read_status(&mut self) -> Interrupts {
        self.status
    }

    fn clear_status(&mut self, mask: Interrupts) {
        self.status.remove(mask);
    }

    fn next_endpoint_event(&mut self) -> Option<EndpointEvent> {
        self.events.pop_front()
    }

    fn read_setup(&mut self) -> [u8; 8] {
        self.setup
    }

    fn open(&mut self, config: &EndpointConfig, _: u8) -> Result<(), Error> {
        if core::mem::take(&mut self.fail_open) {
            return Err(Error::NoResource);
        }
        self.open_endpoint(config);
        Ok(())
    }

    fn close(&mut self, ep: EndpointAddress) {
        *self.ep_mut(ep) = MockEndpoint::default();
    }

    fn abort(&mut self, ep: EndpointAddress) {
        self.ep_mut(ep).armed_rx = None;
    }

    fn arm_rx(&mut self, ep: EndpointAddress, max_size: usize) {
        self.ep_mut(ep).armed_rx = Some(max_size);
    }

    fn arm_tx(&mut self, ep: EndpointAddress, data: &[u8]) {
        self.ep_mut(ep).sent.push(data.to_vec());
    }

    fn tx_ready(&self, _: EndpointAddress) -> bool {
        self.tx_ready
    }

    fn bytes_available(&self, ep: EndpointAddress) -> usize {
        self.ep(ep).rx.len()
    }

    fn read_packet(&mut self, ep: EndpointAddress, buffer: &mut [u8]) -> usize {
        let rx = core::mem::take(&mut self.ep_mut(ep).rx);
        let len = rx.len().min(buffer.len());
        buffer[..len].copy_from_slice(&rx[..len]);
        len
    }

    fn set_stall(&mut self, ep: EndpointAddress) {
        self.ep_mut(ep).stalled = true;
    }

    fn clear_stall(&mut self, ep: EndpointAddress) {
        self.ep_mut(ep).stalled = false;
    }

    fn toggle(&self, ep: EndpointAddress) -> DataToggle {
        self.ep(ep).toggle
    }

    fn set_toggle(&mut self, ep: EndpointAddress, toggle: DataToggle) {
        self.ep_mut(ep).toggle = toggle;
    }

    fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    fn bus_reset(&mut self) {
        self.address = 0;
        self.resets += 1;
        for ep in self.endpoints.iter_mut() {
            *ep = MockEndpoint::default();
        }
    }

    fn frame_number(&self) -> u16 {
        self.frame
    }

    fn set_sof_enabled(&mut self, enabled: bool) {
        self.sof_enabled = enabled;
    }

    fn remote_wakeup(&mut self) {
        self.wakeups += 1;
    }
}

/// A transaction the host put on the bus
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Tx {
    Setup([u8; 8]),
    Out(Vec<u8>),
    /// An IN token, with the largest packet accepted.
    In(usize),
}

#[derive(Default, Clone)]
struct MockPipe {
    open: bool,
    toggle: DataToggle,
    rx: Vec<u8>,
    log: Vec<Tx>,
}

/// A host controller with a scripted device on its port.
pub struct MockHost {
    status: HostInterrupts,
    results: VecDeque<(u8, Handshake)>,
    pipes: Vec<MockPipe>,
    speed: Speed,
    port_resets: usize,
}

impl MockHost {
    pub fn new() -> Self {
        MockHost {
            status: HostInterrupts::empty(),
            results: VecDeque::new(),
            pipes: std::vec![MockPipe::default(); MAX_PIPES],
            speed: Speed::Full,
            port_resets: 0,
        }
    }

    pub fn attach(&mut self, speed: Speed) {
        self.speed = speed;
        self.status |= HostInterrupts::CONNECT;
    }

    pub fn detach(&mut self) {
        self.status |= HostInterrupts::DISCONNECT;
    }

    /// Start a frame.
    pub fn frame(&mut self) {
        self.status |= HostInterrupts::FRAME;
    }

    /// The device answers the pipe's last transaction.
    pub fn respond(&mut self, pipe: u8, handshake: Handshake) {
        self.results.push_back((pipe, handshake));
        self.status |= HostInterrupts::TRANSFER;
    }

    /// The device accepts a SETUP or OUT packet.
    pub fn ack(&mut self, pipe: u8) {
        let state = &mut self.pipes[pipe as usize];
        state.toggle = state.toggle.flip();
        self.respond(pipe, Handshake::Ack);
    }

    /// The device answers an IN token with `data`.
    pub fn ack_in(&mut self, pipe: u8, data: &[u8]) {
        self.pipes[pipe as usize].rx = data.to_vec();
        self.ack(pipe);
    }

    /// Every transaction issued on `pipe`, oldest first.
    pub fn transactions(&self, pipe: u8) -> Vec<Tx> {
        self.pipes[pipe as usize].log.clone()
    }

    pub fn last(&self, pipe: u8) -> Option<Tx> {
        self.pipes[pipe as usize].log.last().cloned()
    }

    pub fn toggle_of(&self, pipe: u8) -> DataToggle {
        self.pipes[pipe as usize].toggle
    }

    pub fn is_open(&self, pipe: u8) -> bool {
        self.pipes[pipe as usize].open
    }

    pub fn port_resets(&self) -> usize {
        self.port_resets
    }
}

impl HostHardware for MockHost {
    const PIPES: usize = 4;

    fn init(&mut self) {
        self.status = HostInterrupts::empty();
    }

    fn read_status(&mut self) -> HostInterrupts {
        self.status
    }

    fn clear_status(&mut self, mask: HostInterrupts) {
        self.status.remove(mask);
    }

    fn port_reset(&mut self) {
        self.port_resets += 1;
    }

    fn speed(&self) -> Speed {
        self.speed
    }

    fn open_pipe(&mut self, pipe: u8, _: u8, _: &EndpointConfig) -> Result<(), Error> {
        self.pipes[pipe as usize] = MockPipe {
            open: true,
            ..MockPipe::default()
        };
        Ok(())
    }

    fn close_pipe(&mut self, pipe: u8) {
        self.pipes[pipe as usize] = MockPipe::default();
    }

    fn send_setup(&mut self, pipe: u8, setup: &[u8; 8]) {
        self.pipes[pipe as usize].log.push(Tx::Setup(*setup));
    }

    fn send_out(&mut self, pipe: u8, data: &[u8]) {
        self.pipes[pipe as usize].log.push(Tx::Out(data.to_vec()));
    }

    fn request_in(&mut self, pipe: u8, max_size: usize) {
        self.pipes[pipe as usize].log.push(Tx::In(max_size));
    }

    fn next_result(&mut self) -> Option<(u8, Handshake)> {
        self.results.pop_front()
    }

    fn bytes_available(&self, pipe: u8) -> usize {
        self.pipes[pipe as usize].rx.len()
    }

    fn read_packet(&mut self, pipe: u8, buffer: &mut [u8]) -> usize {
        let rx = core::mem::take(&mut self.pipes[pipe as usize].rx);
        let len = rx.len().min(buffer.len());
        buffer[..len].copy_from_slice(&rx[..len]);
        len
    }

    fn toggle(&self, pipe: u8) -> DataToggle {
        self.pipes[pipe as usize].toggle
    }

    fn set_toggle(&mut self, pipe: u8, toggle: DataToggle) {
        self.pipes[pipe as usize].toggle = toggle;
    }

    fn halt(&mut self, pipe: u8) {
        self.pipes[pipe as usize].rx.clear();
    }
}
