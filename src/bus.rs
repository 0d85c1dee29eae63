//! Sharing a driver with the USB interrupt

use crate::{
    buffer::XferBuffer,
    driver::Device,
    error::Error,
    host::{Host, HostHardware, PipeHandle},
    hw::DeviceHardware,
    setup::SetupPacket,
    wait::Clock,
};
use core::cell::RefCell;
use critical_section::Mutex;
use usb_device::endpoint::EndpointAddress;

/// A driver that task code and the USB interrupt handler both use
///
/// `BusAdapter` wraps a [`Device`] or a [`Host`], and takes a critical
/// section for every access. Put it in a `static`, call
/// [`on_interrupt`](BusAdapter::on_interrupt) from the USB interrupt, and
/// submit transfers from anywhere.
///
/// The critical section comes from the `critical-section` crate. On a
/// single-core Cortex-M, enable this crate's `critical-section-single-core`
/// feature to use the one from `cortex-m`.
///
/// Completions don't need the critical section. Read them from the event
/// queue's consumer.
pub struct BusAdapter<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> BusAdapter<T> {
    /// Wrap a driver
    ///
    /// Make sure you've initialized the driver before sharing it.
    pub const fn new(inner: T) -> Self {
        BusAdapter {
            inner: Mutex::new(RefCell::new(inner)),
        }
    }
    /// Interrupt-safe, immutable access to the driver
    pub fn with<R>(&self, func: impl FnOnce(&T) -> R) -> R {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            func(&*inner)
        })
    }
    /// Interrupt-safe, mutable access to the driver
    pub fn with_mut<R>(&self, func: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            func(&mut *inner)
        })
    }
}

impl<'q, H: DeviceHardware, C: Clock, const Q: usize> BusAdapter<Device<'q, H, C, Q>> {
    /// Call from the USB interrupt handler.
    pub fn on_interrupt(&self) {
        self.with_mut(Device::on_interrupt);
    }

    pub fn edpt_xfer(&self, ep: EndpointAddress, buffer: XferBuffer) -> Result<(), Error> {
        self.with_mut(|device| {
            trace!("EP{} {:?} XFER {}", ep.index(), ep.direction(), buffer.len());
            device.edpt_xfer(ep, buffer)
        })
    }

    pub fn edpt_stall(&self, ep: EndpointAddress) -> Result<(), Error> {
        self.with_mut(|device| device.edpt_stall(ep))
    }

    pub fn edpt_clear_stall(&self, ep: EndpointAddress) -> Result<(), Error> {
        self.with_mut(|device| device.edpt_clear_stall(ep))
    }

    pub fn control_xfer(&self, buffer: XferBuffer) -> Result<(), Error> {
        self.with_mut(|device| device.control_xfer(buffer))
    }

    pub fn control_status(&self) -> Result<(), Error> {
        self.with_mut(Device::control_status)
    }

    pub fn control_stall(&self) -> Result<(), Error> {
        self.with_mut(Device::control_stall)
    }

    pub fn set_address(&self, address: u8) -> Result<(), Error> {
        self.with_mut(|device| {
            debug!("ADDRESS {} REQUESTED", address);
            device.set_address(address)
        })
    }
}

impl<'q, H: HostHardware, C: Clock, const Q: usize> BusAdapter<Host<'q, H, C, Q>> {
    /// Call from the USB interrupt handler.
    pub fn on_interrupt(&self) {
        self.with_mut(Host::on_interrupt);
    }

    pub fn xfer(&self, pipe: PipeHandle, buffer: XferBuffer) -> Result<(), Error> {
        self.with_mut(|host| host.xfer(pipe, buffer))
    }

    pub fn control_xfer(
        &self,
        pipe: PipeHandle,
        setup: SetupPacket,
        buffer: XferBuffer,
    ) -> Result<(), Error> {
        self.with_mut(|host| host.control_xfer(pipe, setup, buffer))
    }
}
