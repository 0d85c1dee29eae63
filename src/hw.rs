//! The device controller adapter
//!
//! [`DeviceHardware`] is everything the transfer core needs from a USB
//! device controller: interrupt status, packet buffers, and a few endpoint
//! control bits. Implementations should be thin. They translate calls into
//! register accesses, and they don't track transfers; that's the core's job.
//!
//! The core calls the adapter from two contexts: the USB interrupt handler
//! (through [`Device::on_interrupt`](crate::Device::on_interrupt)), and task
//! code that opens endpoints or submits transfers. The core never calls from
//! both at once, provided the device is shared through a
//! [`BusAdapter`](crate::BusAdapter).

use crate::{error::Error, DataToggle, EndpointConfig, Speed};
use usb_device::endpoint::EndpointAddress;

bitflags::bitflags! {
    /// Controller-level interrupt status
    ///
    /// Endpoint-level activity is summarized by [`Interrupts::ENDPOINT`], and
    /// detailed by [`DeviceHardware::next_endpoint_event`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Interrupts : u32 {
        /// USB bus reset signaled by the host.
        const BUS_RESET = 1 << 0;
        /// The bus has been idle for 3ms.
        const SUSPEND = 1 << 1;
        /// Resume signaling after a suspend.
        const RESUME = 1 << 2;
        /// Start of frame.
        const SOF = 1 << 3;
        /// A SETUP packet is latched in the control endpoint.
        const SETUP = 1 << 4;
        /// One or more endpoints finished a packet.
        const ENDPOINT = 1 << 5;
        /// VBUS went away.
        const UNPLUGGED = 1 << 6;
    }
}

/// Endpoint-level activity reported by the controller
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum EndpointEvent {
    /// The endpoint moved one packet.
    ///
    /// For IN, the host acknowledged the last packet from
    /// [`arm_tx`](DeviceHardware::arm_tx). For OUT, a packet is waiting in the
    /// receive buffer; see [`bytes_available`](DeviceHardware::bytes_available).
    Complete(EndpointAddress),
    /// The controller gave up on the endpoint's current packet.
    ///
    /// The code is controller specific. It's logged, never interpreted.
    Error(EndpointAddress, u32),
}

/// A USB device controller
pub trait DeviceHardware {
    /// Number of hardware endpoint resources, including the one that serves
    /// the control endpoint.
    const ENDPOINTS: usize;

    /// `true` if both directions of an endpoint number share one resource.
    const SHARED_DIRECTIONS: bool;

    /// Bring the controller out of reset, with interrupts enabled and the
    /// device detached.
    fn init(&mut self);

    /// Attach to the bus (enable the D+ / D- pull-up).
    fn connect(&mut self);

    /// Detach from the bus.
    fn disconnect(&mut self);

    /// Returns all pending controller interrupts.
    fn read_status(&mut self) -> Interrupts;

    /// Acknowledge the interrupts in `mask`.
    ///
    /// Clearing [`Interrupts::SETUP`] releases the SETUP buffer; the core
    /// only does that after [`read_setup`](DeviceHardware::read_setup).
    fn clear_status(&mut self, mask: Interrupts);

    /// Returns (and acknowledges) the next endpoint event, if any.
    ///
    /// A SETUP on the control endpoint is not an endpoint event.
    fn next_endpoint_event(&mut self) -> Option<EndpointEvent>;

    /// Copy the latched SETUP packet.
    fn read_setup(&mut self) -> [u8; 8];

    /// Configure an endpoint on hardware resource `resource`.
    ///
    /// The endpoint should NAK until armed. Fails with
    /// [`Error::NoResource`] if there's no packet memory left.
    fn open(&mut self, config: &EndpointConfig, resource: u8) -> Result<(), Error>;

    /// Disable an endpoint.
    fn close(&mut self, ep: EndpointAddress);

    /// Disarm an endpoint, dropping anything not yet transferred.
    fn abort(&mut self, ep: EndpointAddress);

    /// Allow the endpoint to receive one packet of up to `max_size` bytes.
    fn arm_rx(&mut self, ep: EndpointAddress, max_size: usize);

    /// Load `data` into the transmit buffer, and allow the host to take it.
    ///
    /// `data` may be empty, for a zero-length packet.
    fn arm_tx(&mut self, ep: EndpointAddress, data: &[u8]);

    /// Indicates if the transmit buffer can accept another packet.
    fn tx_ready(&self, _ep: EndpointAddress) -> bool {
        true
    }

    /// Returns the size of the packet waiting in the receive buffer.
    fn bytes_available(&self, ep: EndpointAddress) -> usize;

    /// Copy the received packet into `buffer`, returning the bytes copied.
    ///
    /// Copies no more than `buffer.len()`. Anything left over is discarded.
    fn read_packet(&mut self, ep: EndpointAddress, buffer: &mut [u8]) -> usize;

    /// Respond to the host with STALL.
    fn set_stall(&mut self, ep: EndpointAddress);

    /// Stop responding with STALL.
    fn clear_stall(&mut self, ep: EndpointAddress);

    /// Returns the data toggle expected for the next packet.
    fn toggle(&self, ep: EndpointAddress) -> DataToggle;

    /// Set the data toggle expected for the next packet.
    fn set_toggle(&mut self, ep: EndpointAddress, toggle: DataToggle);

    /// Program the device address.
    fn set_address(&mut self, address: u8);

    /// Reinitialize after a bus reset.
    ///
    /// The controller should respond on address 0, with every endpoint
    /// disabled. The core re-opens the control endpoint afterwards.
    fn bus_reset(&mut self);

    /// Returns the negotiated bus speed.
    fn speed(&self) -> Speed {
        Speed::Full
    }

    /// Returns the last frame number.
    fn frame_number(&self) -> u16;

    /// Enable or disable the start-of-frame interrupt.
    fn set_sof_enabled(&mut self, enabled: bool);

    /// Signal resume to a suspended host.
    fn remote_wakeup(&mut self);
}
