//! A hardware-independent USB transfer core
//!
//! `tusb-core` implements the USB control-transfer state machine and the
//! bulk / interrupt / isochronous transfer engine once, against a small
//! register / FIFO adapter trait. Each USB controller only needs to implement
//! that adapter; the state machines, data toggle tracking, short packet
//! detection, and stall handling live here.
//!
//! - The device side is [`Device`](driver::Device). Implement
//!   [`DeviceHardware`](hw::DeviceHardware) for your controller, then call
//!   [`on_interrupt()`](driver::Device::on_interrupt) from your USB ISR.
//! - The host side is [`Host`](host::Host). Implement
//!   [`HostHardware`](host::HostHardware) for your controller.
//! - Completions travel from interrupt context to your task through a bounded
//!   [`EventQueue`](event::EventQueue).
//! - [`fsdev`] is a ready-made adapter for the STM32 full-speed device
//!   peripheral.
//!
//! # Example
//!
//! ```no_run
//! use tusb_core::{
//!     driver::{Device, Event},
//!     event::EventQueue,
//!     fsdev::{FsDev, Peripherals},
//!     BusAdapter, XferBuffer,
//! };
//!
//! # struct Ps;
//! # unsafe impl Peripherals for Ps { fn usb(&self) -> *const () { panic!() } fn pma(&self) -> *const () { panic!() } }
//! let events = cortex_m::singleton!(: EventQueue<Event> = EventQueue::new()).unwrap();
//!
//! let (producer, mut consumer) = events.split();
//! let mut device = Device::new(FsDev::new(Ps), producer);
//! device.init();
//! device.connect();
//! let bus = BusAdapter::new(device);
//!
//! // From the USB interrupt handler...
//! bus.on_interrupt();
//!
//! // ...and from your task.
//! while let Some(event) = consumer.dequeue() {
//!     match event {
//!         Event::SetupReceived(setup) => {
//!             // Decode the request, then answer it.
//!             static DESCRIPTOR: [u8; 18] = [0; 18];
//!             bus.control_xfer(XferBuffer::from_static(&DESCRIPTOR)).ok();
//!         }
//!         Event::XferComplete { ep, len, result } => { /* hand to the class */ }
//!         _ => {}
//!     }
//! }
//! ```

#![no_std]

#[macro_use]
mod log;

mod transfer;

pub mod buffer;
pub mod bus;
pub mod control;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod fsdev;
pub mod host;
pub mod hw;
pub mod setup;
pub mod state;
pub mod wait;

#[cfg(test)]
mod mock;

pub use buffer::XferBuffer;
pub use bus::BusAdapter;
pub use driver::Device;
pub use error::{Error, XferResult};
pub use host::Host;
pub use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// USB low / full / high speed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Speed {
    /// 1.5 Mbit/s.
    Low,
    /// 12 Mbit/s.
    #[default]
    Full,
    /// 480 Mbit/s.
    High,
}

/// DATA0 / DATA1 packet identifier sequence bit.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum DataToggle {
    /// DATA0, the state after open, reset, or stall clear.
    #[default]
    Data0,
    /// DATA1.
    Data1,
}

impl DataToggle {
    /// Returns the opposite toggle.
    pub const fn flip(self) -> Self {
        match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        }
    }

    /// `true` for DATA1.
    pub const fn is_data1(self) -> bool {
        matches!(self, DataToggle::Data1)
    }
}

impl From<bool> for DataToggle {
    fn from(data1: bool) -> Self {
        if data1 {
            DataToggle::Data1
        } else {
            DataToggle::Data0
        }
    }
}

/// Endpoint transfer type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    /// Decode the low two bits of an endpoint descriptor's `bmAttributes`.
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0b11 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    /// The largest max packet size allowed for this type at `speed`.
    pub const fn max_packet_limit(self, speed: Speed) -> u16 {
        match (self, speed) {
            (TransferType::Control, Speed::Low) => 8,
            (TransferType::Control, _) => 64,
            (TransferType::Bulk, Speed::High) => 512,
            (TransferType::Bulk, _) => 64,
            (TransferType::Interrupt, Speed::Low) => 8,
            (TransferType::Interrupt, Speed::Full) => 64,
            (TransferType::Interrupt, Speed::High) => 1024,
            (TransferType::Isochronous, Speed::High) => 1024,
            (TransferType::Isochronous, _) => 1023,
        }
    }
}

impl From<usb_device::endpoint::EndpointType> for TransferType {
    fn from(kind: usb_device::endpoint::EndpointType) -> Self {
        use usb_device::endpoint::EndpointType;
        match kind {
            EndpointType::Control => TransferType::Control,
            EndpointType::Isochronous { .. } => TransferType::Isochronous,
            EndpointType::Bulk => TransferType::Bulk,
            EndpointType::Interrupt => TransferType::Interrupt,
        }
    }
}

/// Endpoint configuration, the driver-relevant part of an endpoint descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct EndpointConfig {
    /// Endpoint number and direction.
    pub address: EndpointAddress,
    /// Transfer type.
    pub kind: TransferType,
    /// Max packet size, in bytes.
    pub max_packet_size: u16,
    /// Polling interval, in frames (or microframe exponent at high speed).
    pub interval: u8,
}

impl EndpointConfig {
    /// Length of a standard endpoint descriptor.
    pub const DESCRIPTOR_LEN: usize = 7;
    /// `bDescriptorType` of an endpoint descriptor.
    pub const DESCRIPTOR_TYPE: u8 = 5;

    /// Parse a standard 7-byte endpoint descriptor.
    ///
    /// Returns [`Error::InvalidState`] if the buffer doesn't start with an
    /// endpoint descriptor.
    pub fn from_descriptor(desc: &[u8]) -> Result<Self, Error> {
        if desc.len() < Self::DESCRIPTOR_LEN
            || (desc[0] as usize) < Self::DESCRIPTOR_LEN
            || desc[1] != Self::DESCRIPTOR_TYPE
        {
            return Err(Error::InvalidState);
        }
        Ok(EndpointConfig {
            address: EndpointAddress::from(desc[2] & 0x8F),
            kind: TransferType::from_attributes(desc[3]),
            // Bits 12:11 are high-bandwidth transactions per microframe.
            max_packet_size: u16::from_le_bytes([desc[4], desc[5]]) & 0x7FF,
            interval: desc[6],
        })
    }

    /// The control endpoint configuration for one direction.
    pub fn control(direction: UsbDirection, max_packet_size: u16) -> Self {
        EndpointConfig {
            address: EndpointAddress::from_parts(0, direction),
            kind: TransferType::Control,
            max_packet_size,
            interval: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DataToggle, EndpointConfig, Error, Speed, TransferType, UsbDirection};

    #[test]
    fn toggle_flip() {
        assert_eq!(DataToggle::default(), DataToggle::Data0);
        assert_eq!(DataToggle::Data0.flip(), DataToggle::Data1);
        assert_eq!(DataToggle::Data1.flip(), DataToggle::Data0);
        assert!(DataToggle::from(true).is_data1());
    }

    #[test]
    fn parse_endpoint_descriptor() {
        // Bulk IN 0x81, 64 bytes
        let desc = [7, 5, 0x81, 0x02, 64, 0, 0];
        let config = EndpointConfig::from_descriptor(&desc).unwrap();
        assert_eq!(config.address.index(), 1);
        assert_eq!(config.address.direction(), UsbDirection::In);
        assert_eq!(config.kind, TransferType::Bulk);
        assert_eq!(config.max_packet_size, 64);

        // Interrupt OUT 0x02, 8 bytes, every 10 frames
        let desc = [7, 5, 0x02, 0x03, 8, 0, 10];
        let config = EndpointConfig::from_descriptor(&desc).unwrap();
        assert_eq!(config.address.direction(), UsbDirection::Out);
        assert_eq!(config.kind, TransferType::Interrupt);
        assert_eq!(config.interval, 10);
    }

    #[test]
    fn reject_non_endpoint_descriptor() {
        assert_eq!(
            EndpointConfig::from_descriptor(&[9, 4, 0, 0, 1, 3, 0]),
            Err(Error::InvalidState)
        );
        assert_eq!(
            EndpointConfig::from_descriptor(&[7, 5, 0x81]),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn max_packet_limits() {
        assert_eq!(TransferType::Control.max_packet_limit(Speed::Full), 64);
        assert_eq!(TransferType::Bulk.max_packet_limit(Speed::High), 512);
        assert_eq!(TransferType::Isochronous.max_packet_limit(Speed::Full), 1023);
        assert_eq!(TransferType::Interrupt.max_packet_limit(Speed::High), 1024);
    }
}
