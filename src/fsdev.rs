//! An adapter for the STM32 full-speed device peripheral (FSDEV)
//!
//! This is the USB peripheral found on STM32F0, L0, L4, G4, and similar
//! parts, with 1 KiB of packet memory. Each of its eight endpoint registers
//! serves both directions of one endpoint number, so the adapter sets
//! [`SHARED_DIRECTIONS`](DeviceHardware::SHARED_DIRECTIONS).
//!
//! Isochronous endpoints need the peripheral's double buffering, which this
//! adapter doesn't support. Opening one fails with [`Error::NoResource`].
//!
//! # Example
//!
//! Implement [`Peripherals`] on something that owns the USB registers and
//! the packet memory.
//!
//! ```
//! use tusb_core::fsdev::{FsDev, Peripherals};
//!
//! struct Usb;
//!
//! unsafe impl Peripherals for Usb {
//!     fn usb(&self) -> *const () {
//!         0x4000_5C00 as *const ()
//!     }
//!     fn pma(&self) -> *const () {
//!         0x4000_6000 as *const ()
//!     }
//! }
//!
//! let fsdev = FsDev::new(Usb);
//! ```

mod pma;
mod ral;

use crate::{
    error::Error,
    hw::{DeviceHardware, EndpointEvent, Interrupts},
    DataToggle, EndpointConfig, TransferType,
};
use pma::{Allocator, Pma};
use ral::endpoint::{self, EPR};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// A type that owns the FSDEV registers, and its packet memory
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the USB
/// register block, and the packet memory. The returned pointers are assumed
/// to be valid for as long as the object lives.
pub unsafe trait Peripherals {
    /// Returns the address of the USB registers.
    fn usb(&self) -> *const ();
    /// Returns the address of the packet memory.
    fn pma(&self) -> *const ();
}

/// Register reads after a power-up, standing in for the analog startup time.
const STARTUP_SPINS: u32 = 64;

/// ESOF periods to hold the resume signal (1 to 15 ms).
const RESUME_ESOFS: u8 = 4;

/// Interrupts that are always enabled.
const INTERRUPTS: u32 = ral::CNTR::CTRM::mask
    | ral::CNTR::RESETM::mask
    | ral::CNTR::SUSPM::mask
    | ral::CNTR::WKUPM::mask
    | ral::CNTR::ESOFM::mask;

/// The bits of one direction of an endpoint register.
struct Side {
    stat: u32,
    stat_offset: u32,
    dtog: u32,
    ctr: u32,
}

const TX: Side = Side {
    stat: EPR::STAT_TX::mask,
    stat_offset: EPR::STAT_TX::offset,
    dtog: EPR::DTOG_TX::mask,
    ctr: EPR::CTR_TX::mask,
};

const RX: Side = Side {
    stat: EPR::STAT_RX::mask,
    stat_offset: EPR::STAT_RX::offset,
    dtog: EPR::DTOG_RX::mask,
    ctr: EPR::CTR_RX::mask,
};

fn side(direction: UsbDirection) -> (&'static Side, usize) {
    match direction {
        UsbDirection::In => (&TX, 1),
        UsbDirection::Out => (&RX, 0),
    }
}

#[derive(Clone, Copy)]
struct PacketBuffer {
    addr: u16,
    size: u16,
}

/// An FSDEV device controller
pub struct FsDev<P> {
    usb: ral::Instance,
    pma: Pma,
    allocator: Allocator,
    /// Endpoint register for every endpoint number.
    slots: [Option<u8>; 16],
    /// Per endpoint register, OUT then IN.
    buffers: [[Option<PacketBuffer>; 2]; ral::ENDPOINTS],
    open: [[bool; 2]; ral::ENDPOINTS],
    resume: u8,
    _peripherals: P,
}

impl<P: Peripherals> FsDev<P> {
    /// Create an adapter that owns `peripherals`
    ///
    /// Nothing touches the hardware until [`init`](DeviceHardware::init).
    pub fn new(peripherals: P) -> Self {
        // Safety: Peripherals guarantees exclusive, valid pointers.
        let usb = unsafe { ral::Instance::new(peripherals.usb() as *const _) };
        let pma = unsafe { Pma::new(peripherals.pma() as *mut u16) };
        FsDev {
            usb,
            pma,
            allocator: Self::allocator(),
            slots: [None; 16],
            buffers: [[None; 2]; ral::ENDPOINTS],
            open: [[false; 2]; ral::ENDPOINTS],
            resume: 0,
            _peripherals: peripherals,
        }
    }
}

impl<P> FsDev<P> {
    fn allocator() -> Allocator {
        Allocator::new(pma::BTABLE_SIZE, ral::PMA_SIZE - pma::BTABLE_SIZE)
    }

    fn epr(&self, slot: usize) -> endpoint::Epr<'_> {
        endpoint::register(&self.usb, slot)
    }

    fn slot(&self, ep: EndpointAddress) -> Option<usize> {
        let slot = self.slots.get(ep.index()).copied().flatten();
        if slot.is_none() {
            warn!("EP{} {:?} HAS NO REGISTER", ep.index(), ep.direction());
        }
        slot.map(usize::from)
    }

    fn buffer(&self, ep: EndpointAddress) -> Option<(usize, PacketBuffer)> {
        let slot = self.slot(ep)?;
        let (_, dir) = side(ep.direction());
        self.buffers[slot][dir].map(|buffer| (slot, buffer))
    }

    /// Move one direction's STAT bits to `stat`.
    fn set_stat(&self, ep: EndpointAddress, stat: u32) {
        let Some(slot) = self.slot(ep) else { return };
        let (side, _) = side(ep.direction());
        let epr = self.epr(slot);
        let current = epr.EPR.read();
        epr.EPR
            .write(endpoint::toggle_to(current, side.stat, stat << side.stat_offset));
    }

    fn stat(&self, ep: EndpointAddress) -> Option<u32> {
        let slot = self.slot(ep)?;
        let (side, _) = side(ep.direction());
        Some((self.epr(slot).EPR.read() & side.stat) >> side.stat_offset)
    }

    fn forget_endpoints(&mut self) {
        self.allocator = Self::allocator();
        self.slots = [None; 16];
        self.buffers = [[None; 2]; ral::ENDPOINTS];
        self.open = [[false; 2]; ral::ENDPOINTS];
    }
}

fn ep_type(kind: TransferType) -> u32 {
    match kind {
        TransferType::Control => EPR::EP_TYPE::RW::CONTROL,
        TransferType::Bulk => EPR::EP_TYPE::RW::BULK,
        TransferType::Interrupt => EPR::EP_TYPE::RW::INTERRUPT,
        TransferType::Isochronous => EPR::EP_TYPE::RW::ISO,
    }
}

impl<P> DeviceHardware for FsDev<P> {
    const ENDPOINTS: usize = ral::ENDPOINTS;
    const SHARED_DIRECTIONS: bool = true;

    fn init(&mut self) {
        ral::write_reg!(ral, self.usb, CNTR, FRES: 1, PDWN: 0);
        for _ in 0..STARTUP_SPINS {
            ral::read_reg!(ral, self.usb, FNR);
        }
        ral::write_reg!(ral, self.usb, CNTR, 0);
        ral::write_reg!(ral, self.usb, ISTR, 0);
        ral::write_reg!(ral, self.usb, BTABLE, 0);
        ral::write_reg!(ral, self.usb, CNTR, INTERRUPTS);
        self.forget_endpoints();
        self.resume = 0;
        debug!("FSDEV INITIALIZED");
    }

    fn connect(&mut self) {
        ral::modify_reg!(ral, self.usb, BCDR, DPPU: 1);
    }

    fn disconnect(&mut self) {
        ral::modify_reg!(ral, self.usb, BCDR, DPPU: 0);
    }

    fn read_status(&mut self) -> Interrupts {
        let istr = ral::read_reg!(ral, self.usb, ISTR);

        if istr & ral::ISTR::ESOF::mask != 0 {
            ral::write_reg!(ral, self.usb, ISTR, !ral::ISTR::ESOF::mask);
            if self.resume > 0 {
                self.resume -= 1;
                if self.resume == 0 {
                    ral::modify_reg!(ral, self.usb, CNTR, RESUME: 0);
                }
            }
        }

        let mut status = Interrupts::empty();
        for (flag, interrupt) in [
            (ral::ISTR::RESET::mask, Interrupts::BUS_RESET),
            (ral::ISTR::SUSP::mask, Interrupts::SUSPEND),
            (ral::ISTR::WKUP::mask, Interrupts::RESUME),
            (ral::ISTR::SOF::mask, Interrupts::SOF),
        ] {
            if istr & flag != 0 {
                status |= interrupt;
            }
        }

        if istr & ral::ISTR::CTR::mask != 0 {
            for slot in 0..ral::ENDPOINTS {
                let epr = self.epr(slot).EPR.read();
                let setup = epr & EPR::SETUP::mask != 0;
                if setup && epr & EPR::CTR_RX::mask != 0 {
                    status |= Interrupts::SETUP;
                }
                if epr & EPR::CTR_TX::mask != 0 || (!setup && epr & EPR::CTR_RX::mask != 0) {
                    status |= Interrupts::ENDPOINT;
                }
            }
        }
        status
    }

    fn clear_status(&mut self, mask: Interrupts) {
        let mut flags = 0;
        for (interrupt, flag) in [
            (Interrupts::BUS_RESET, ral::ISTR::RESET::mask),
            (Interrupts::SUSPEND, ral::ISTR::SUSP::mask),
            (Interrupts::RESUME, ral::ISTR::WKUP::mask),
            (Interrupts::SOF, ral::ISTR::SOF::mask),
        ] {
            if mask.contains(interrupt) {
                flags |= flag;
            }
        }
        if flags != 0 {
            ral::write_reg!(ral, self.usb, ISTR, !flags);
        }

        if mask.contains(Interrupts::SETUP) {
            let epr = self.epr(0);
            let current = epr.EPR.read();
            epr.EPR.write(endpoint::clear_ctr(current, EPR::CTR_RX::mask));
        }
        if mask.contains(Interrupts::SUSPEND) {
            ral::modify_reg!(ral, self.usb, CNTR, FSUSP: 1, LP_MODE: 1);
        }
        if mask.contains(Interrupts::RESUME) {
            ral::modify_reg!(ral, self.usb, CNTR, FSUSP: 0, LP_MODE: 0);
        }
    }

    fn next_endpoint_event(&mut self) -> Option<EndpointEvent> {
        for slot in 0..ral::ENDPOINTS {
            let epr = self.epr(slot);
            let current = epr.EPR.read();
            let number = ral::read_reg!(endpoint, &epr, EPR, EA) as usize;
            if current & EPR::CTR_TX::mask != 0 {
                epr.EPR.write(endpoint::clear_ctr(current, TX.ctr));
                return Some(EndpointEvent::Complete(EndpointAddress::from_parts(
                    number,
                    UsbDirection::In,
                )));
            }
            if current & EPR::CTR_RX::mask != 0 && current & EPR::SETUP::mask == 0 {
                epr.EPR.write(endpoint::clear_ctr(current, RX.ctr));
                return Some(EndpointEvent::Complete(EndpointAddress::from_parts(
                    number,
                    UsbDirection::Out,
                )));
            }
        }
        None
    }

    fn read_setup(&mut self) -> [u8; 8] {
        let mut setup = [0; 8];
        match self.buffers[0][0] {
            Some(buffer) => self.pma.read(buffer.addr, &mut setup),
            None => {
                warn!("SETUP WITHOUT A CONTROL BUFFER");
            }
        }
        setup
    }

    fn open(&mut self, config: &EndpointConfig, resource: u8) -> Result<(), Error> {
        let slot = resource as usize;
        if config.kind == TransferType::Isochronous || slot >= ral::ENDPOINTS {
            return Err(Error::NoResource);
        }
        let number = config.address.index();
        let (side, dir) = side(config.address.direction());

        let (count, size) = match config.address.direction() {
            UsbDirection::Out => pma::rx_block(config.max_packet_size),
            UsbDirection::In => (0, config.max_packet_size),
        };
        let buffer = match self.buffers[slot][dir] {
            Some(buffer) if buffer.size >= size => buffer,
            _ => {
                let addr = self.allocator.allocate(size).ok_or(Error::NoResource)?;
                let buffer = PacketBuffer { addr, size };
                self.buffers[slot][dir] = Some(buffer);
                buffer
            }
        };
        match config.address.direction() {
            UsbDirection::Out => {
                self.pma.write_u16(pma::addr_rx(slot), buffer.addr);
                self.pma.write_u16(pma::count_rx(slot), count);
            }
            UsbDirection::In => {
                self.pma.write_u16(pma::addr_tx(slot), buffer.addr);
                self.pma.write_u16(pma::count_tx(slot), 0);
            }
        }

        let epr = self.epr(slot);
        let current = epr.EPR.read();
        let nak = EPR::STAT_TX::RW::NAK << side.stat_offset;
        epr.EPR.write(
            endpoint::configure(number as u32, ep_type(config.kind))
                | endpoint::toggle_bits(current, side.stat | side.dtog, nak),
        );
        self.slots[number] = Some(resource);
        self.open[slot][dir] = true;
        Ok(())
    }

    fn close(&mut self, ep: EndpointAddress) {
        let Some(slot) = self.slot(ep) else { return };
        self.set_stat(ep, EPR::STAT_TX::RW::DISABLED);
        let (_, dir) = side(ep.direction());
        self.open[slot][dir] = false;
        if self.open[slot] == [false; 2] {
            self.slots[ep.index()] = None;
        }
    }

    fn abort(&mut self, ep: EndpointAddress) {
        if self.stat(ep) == Some(EPR::STAT_TX::RW::VALID) {
            self.set_stat(ep, EPR::STAT_TX::RW::NAK);
        }
    }

    fn arm_rx(&mut self, ep: EndpointAddress, _: usize) {
        self.set_stat(ep, EPR::STAT_RX::RW::VALID);
    }

    fn arm_tx(&mut self, ep: EndpointAddress, data: &[u8]) {
        let Some((slot, buffer)) = self.buffer(ep) else { return };
        let len = data.len().min(buffer.size as usize);
        self.pma.write(buffer.addr, &data[..len]);
        self.pma.write_u16(pma::count_tx(slot), len as u16);
        self.set_stat(ep, EPR::STAT_TX::RW::VALID);
    }

    fn tx_ready(&self, ep: EndpointAddress) -> bool {
        self.stat(ep) != Some(EPR::STAT_TX::RW::VALID)
    }

    fn bytes_available(&self, ep: EndpointAddress) -> usize {
        self.slot(ep)
            .map(|slot| (self.pma.read_u16(pma::count_rx(slot)) & pma::COUNT_MASK) as usize)
            .unwrap_or(0)
    }

    fn read_packet(&mut self, ep: EndpointAddress, buffer: &mut [u8]) -> usize {
        let Some((slot, packet)) = self.buffer(ep) else { return 0 };
        let count = self.pma.read_u16(pma::count_rx(slot)) & pma::COUNT_MASK;
        let len = buffer.len().min(count.min(packet.size) as usize);
        self.pma.read(packet.addr, &mut buffer[..len]);
        len
    }

    fn set_stall(&mut self, ep: EndpointAddress) {
        self.set_stat(ep, EPR::STAT_TX::RW::STALL);
    }

    fn clear_stall(&mut self, ep: EndpointAddress) {
        let Some(slot) = self.slot(ep) else { return };
        let (side, _) = side(ep.direction());
        let epr = self.epr(slot);
        let current = epr.EPR.read();
        let nak = EPR::STAT_TX::RW::NAK << side.stat_offset;
        epr.EPR
            .write(endpoint::toggle_to(current, side.stat | side.dtog, nak));
    }

    fn toggle(&self, ep: EndpointAddress) -> DataToggle {
        let Some(slot) = self.slot(ep) else {
            return DataToggle::Data0;
        };
        let (side, _) = side(ep.direction());
        DataToggle::from(self.epr(slot).EPR.read() & side.dtog != 0)
    }

    fn set_toggle(&mut self, ep: EndpointAddress, toggle: DataToggle) {
        let Some(slot) = self.slot(ep) else { return };
        let (side, _) = side(ep.direction());
        let epr = self.epr(slot);
        let current = epr.EPR.read();
        let desired = if toggle.is_data1() { side.dtog } else { 0 };
        epr.EPR.write(endpoint::toggle_to(current, side.dtog, desired));
    }

    fn set_address(&mut self, address: u8) {
        ral::write_reg!(ral, self.usb, DADDR, EF: 1, ADD: address as u32);
        debug!("ADDRESS {}", address);
    }

    fn bus_reset(&mut self) {
        for slot in 0..ral::ENDPOINTS {
            let epr = self.epr(slot);
            // Zero every toggle bit, address, and flag.
            epr.EPR.write(epr.EPR.read() & endpoint::TOGGLES);
        }
        self.forget_endpoints();
        ral::write_reg!(ral, self.usb, DADDR, EF: 1, ADD: 0);
    }

    fn frame_number(&self) -> u16 {
        ral::read_reg!(ral, self.usb, FNR, FN) as u16
    }

    fn set_sof_enabled(&mut self, enabled: bool) {
        ral::modify_reg!(ral, self.usb, CNTR, SOFM: enabled as u32);
    }

    fn remote_wakeup(&mut self) {
        ral::modify_reg!(ral, self.usb, CNTR, FSUSP: 0, LP_MODE: 0, RESUME: 1);
        self.resume = RESUME_ESOFS;
    }
}
