//! USB host support
//!
//! [`Host`] drives one root port through a [`HostHardware`] adapter. Open a
//! pipe per device endpoint, then submit transfers on the pipe's handle.
//! NAKs are handled here, and never reach the upper layer: control and bulk
//! pipes retry right away a bounded number of times, then once per frame;
//! interrupt pipes poll at their interval.

mod driver;
pub mod pipe;

pub use driver::{Event, Host};
pub use pipe::{PipeHandle, MAX_DEVICES, MAX_PIPES, NAK_RETRY_LIMIT};

use crate::{error::Error, DataToggle, EndpointConfig, Speed};

bitflags::bitflags! {
    /// Host controller interrupt status
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct HostInterrupts : u32 {
        /// A device attached to the root port.
        const CONNECT = 1 << 0;
        /// The device detached from the root port.
        const DISCONNECT = 1 << 1;
        /// A frame (or microframe) started.
        const FRAME = 1 << 2;
        /// One or more pipes finished a transaction.
        const TRANSFER = 1 << 3;
    }
}

/// The device's response to a transaction
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Handshake {
    /// Data moved. For IN, the packet waits in the pipe's buffer.
    Ack,
    /// The device wasn't ready; ask again.
    Nak,
    Stall,
    /// The transaction failed on the bus: timeout, CRC, babble, ...
    ///
    /// The code is controller specific. It's logged, never interpreted.
    Error(u32),
}

/// A USB host controller
///
/// Pipes are numbered from zero. The adapter programs the pipe's device
/// address, endpoint, and type in [`open_pipe`](HostHardware::open_pipe);
/// each transaction only says which pipe, and which direction.
pub trait HostHardware {
    /// Number of hardware pipes.
    const PIPES: usize;

    /// Bring the controller out of reset, with the port powered.
    fn init(&mut self);

    /// Returns all pending controller interrupts.
    fn read_status(&mut self) -> HostInterrupts;

    /// Acknowledge the interrupts in `mask`.
    fn clear_status(&mut self, mask: HostInterrupts);

    /// Drive reset on the root port.
    fn port_reset(&mut self);

    /// Returns the speed of the attached device.
    fn speed(&self) -> Speed;

    /// Bind `pipe` to an endpoint of device `dev_addr`.
    fn open_pipe(&mut self, pipe: u8, dev_addr: u8, config: &EndpointConfig) -> Result<(), Error>;

    /// Release a pipe.
    fn close_pipe(&mut self, pipe: u8);

    /// Send a SETUP transaction.
    fn send_setup(&mut self, pipe: u8, setup: &[u8; 8]);

    /// Send an OUT transaction. `data` may be empty.
    fn send_out(&mut self, pipe: u8, data: &[u8]);

    /// Send an IN token, accepting up to `max_size` bytes.
    fn request_in(&mut self, pipe: u8, max_size: usize);

    /// Returns (and acknowledges) the next finished transaction.
    fn next_result(&mut self) -> Option<(u8, Handshake)>;

    /// Indicates if the pipe can accept another OUT packet.
    fn tx_ready(&self, _pipe: u8) -> bool {
        true
    }

    /// Returns the size of the packet received by the last IN transaction.
    fn bytes_available(&self, pipe: u8) -> usize;

    /// Copy the received packet into `buffer`, returning the bytes copied.
    fn read_packet(&mut self, pipe: u8, buffer: &mut [u8]) -> usize;

    /// Returns the data toggle for the pipe's next transaction.
    fn toggle(&self, pipe: u8) -> DataToggle;

    /// Set the data toggle for the pipe's next transaction.
    fn set_toggle(&mut self, pipe: u8, toggle: DataToggle);

    /// Stop any transaction on the pipe.
    fn halt(&mut self, pipe: u8);
}
