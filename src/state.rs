//! Device session state
//!
//! The [`EndpointTable`] tracks every open endpoint, and the hardware
//! resource behind it. Endpoints are addressed in O(1) by number and
//! direction. All even slots are OUT, and all odd slots are IN.

use crate::{endpoint::Endpoint, error::Error, hw::DeviceHardware, EndpointConfig};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// The maximum supported number of endpoints.
///
/// Sixteen endpoint numbers, in each direction.
pub const MAX_ENDPOINTS: usize = 16 * 2;

/// Produces an index into the endpoint table
///
/// Returns `None` for endpoint numbers above 15.
fn index(ep_addr: EndpointAddress) -> Option<usize> {
    let index = (ep_addr.index() * 2) + (UsbDirection::In == ep_addr.direction()) as usize;
    (index < MAX_ENDPOINTS).then_some(index)
}

/// The other direction of the same endpoint number.
fn sibling(ep_addr: EndpointAddress) -> EndpointAddress {
    let direction = match ep_addr.direction() {
        UsbDirection::In => UsbDirection::Out,
        UsbDirection::Out => UsbDirection::In,
    };
    EndpointAddress::from_parts(ep_addr.index(), direction)
}

/// Hardware endpoint resources
///
/// Resource 0 always serves the control endpoint. Bit `n` of the mask is set
/// when resource `n` is allocated.
#[derive(Debug)]
pub struct ResourcePool {
    alloc_mask: u32,
    capacity: u8,
}

impl ResourcePool {
    /// A pool of `capacity` resources, including the control resource.
    pub const fn new(capacity: usize) -> Self {
        ResourcePool {
            alloc_mask: 1,
            capacity: if capacity > 32 { 32 } else { capacity as u8 },
        }
    }

    /// Returns the number of resources for non-control endpoints.
    pub fn capacity(&self) -> usize {
        (self.capacity as usize).saturating_sub(1)
    }

    /// Returns the number of allocated non-control resources.
    pub fn in_use(&self) -> usize {
        (self.alloc_mask & !1).count_ones() as usize
    }

    /// Take the lowest free resource.
    pub fn allocate(&mut self) -> Option<u8> {
        let free = (1..self.capacity).find(|n| self.alloc_mask & (1 << n) == 0)?;
        self.alloc_mask |= 1 << free;
        Some(free)
    }

    /// Return a resource to the pool.
    ///
    /// Releasing the control resource has no effect.
    pub fn release(&mut self, resource: u8) {
        if resource != 0 && resource < self.capacity {
            self.alloc_mask &= !(1 << resource);
        }
    }

    /// Release everything but the control resource.
    pub fn reset(&mut self) {
        self.alloc_mask = 1;
    }
}

/// Open endpoints, keyed by address
#[derive(Debug)]
pub struct EndpointTable {
    endpoints: [Option<Endpoint>; MAX_ENDPOINTS],
    pool: ResourcePool,
    /// IN and OUT of one endpoint number share a resource.
    shared: bool,
}

impl EndpointTable {
    /// A table for `resources` hardware endpoint resources.
    pub fn new(resources: usize, shared: bool) -> Self {
        const EP: Option<Endpoint> = None;
        EndpointTable {
            endpoints: [EP; MAX_ENDPOINTS],
            pool: ResourcePool::new(resources),
            shared,
        }
    }

    /// A table sized for the hardware.
    pub fn for_hardware<H: DeviceHardware>() -> Self {
        Self::new(H::ENDPOINTS, H::SHARED_DIRECTIONS)
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Acquire the endpoint.
    ///
    /// Returns `None` if the endpoint isn't open.
    pub fn endpoint(&self, addr: EndpointAddress) -> Option<&Endpoint> {
        self.endpoints.get(index(addr)?)?.as_ref()
    }

    /// Acquire the mutable endpoint.
    ///
    /// Returns `None` if the endpoint isn't open.
    pub fn endpoint_mut(&mut self, addr: EndpointAddress) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(index(addr)?)?.as_mut()
    }

    /// Iterate over every open endpoint.
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().flatten()
    }

    /// Open the endpoint described by `config`.
    ///
    /// Fails with [`Error::InvalidState`] if the endpoint is already open, or
    /// has no slot, and with [`Error::NoResource`] if the hardware is out of
    /// endpoints. On failure, nothing changes.
    pub fn open<H: DeviceHardware>(
        &mut self,
        hw: &mut H,
        config: &EndpointConfig,
    ) -> Result<&mut Endpoint, Error> {
        let addr = config.address;
        let slot = index(addr).ok_or(Error::InvalidState)?;
        if self.endpoints[slot].is_some() {
            return Err(Error::InvalidState);
        }

        let shared = if addr.index() == 0 {
            Some(0)
        } else if self.shared {
            self.endpoint(sibling(addr)).map(Endpoint::resource)
        } else {
            None
        };
        let resource = match shared {
            Some(resource) => resource,
            None => self.pool.allocate().ok_or(Error::NoResource)?,
        };

        if let Err(err) = hw.open(config, resource) {
            if shared.is_none() {
                self.pool.release(resource);
            }
            return Err(err);
        }

        debug!(
            "EP{} {:?} OPEN ON RESOURCE {}",
            addr.index(),
            addr.direction(),
            resource
        );
        Ok(self.endpoints[slot].insert(Endpoint::new(config, resource)))
    }

    /// Close an endpoint, dropping any active transfer without a completion.
    ///
    /// Fails with [`Error::InvalidState`] if the endpoint isn't open.
    pub fn close<H: DeviceHardware>(&mut self, hw: &mut H, addr: EndpointAddress) -> Result<(), Error> {
        let slot = index(addr).ok_or(Error::InvalidState)?;
        let mut ep = self.endpoints[slot].take().ok_or(Error::InvalidState)?;
        ep.abort(hw);
        hw.close(addr);
        let sibling_open = self.shared && self.endpoint(sibling(addr)).is_some();
        if !sibling_open {
            self.pool.release(ep.resource());
        }
        debug!("EP{} {:?} CLOSED", addr.index(), addr.direction());
        Ok(())
    }

    /// Close every non-control endpoint.
    pub fn close_all<H: DeviceHardware>(&mut self, hw: &mut H) {
        for slot in 2..MAX_ENDPOINTS {
            if let Some(addr) = self.endpoints[slot].as_ref().map(Endpoint::address) {
                // Can't fail; the slot is occupied.
                let _ = self.close(hw, addr);
            }
        }
    }

    /// Forget every non-control endpoint, without touching hardware.
    ///
    /// Use this after the hardware has already disabled its endpoints. The
    /// control endpoints are dropped too; re-open them afterwards.
    pub fn reset(&mut self) {
        for slot in self.endpoints.iter_mut() {
            *slot = None;
        }
        self.pool.reset();
    }
}
