//! Packet memory
//!
//! The FSDEV peripheral keeps endpoint buffers, and the buffer descriptor
//! table, in a dedicated memory that the CPU reaches in 16-bit words.

use super::ral::ENDPOINTS;

/// Size of the buffer descriptor table, at the bottom of packet memory.
pub const BTABLE_SIZE: u16 = 8 * ENDPOINTS as u16;

pub fn addr_tx(slot: usize) -> u16 {
    slot as u16 * 8
}

pub fn count_tx(slot: usize) -> u16 {
    addr_tx(slot) + 2
}

pub fn addr_rx(slot: usize) -> u16 {
    addr_tx(slot) + 4
}

pub fn count_rx(slot: usize) -> u16 {
    addr_tx(slot) + 6
}

/// Bits of COUNT_RX holding the received byte count.
pub const COUNT_MASK: u16 = 0x3FF;

/// Encode a receive buffer size for COUNT_RX.
///
/// Returns the encoding, and the buffer size it describes. Up to 62 bytes
/// count in 2-byte blocks; larger buffers count in 32-byte blocks.
pub fn rx_block(size: u16) -> (u16, u16) {
    if size > 62 {
        let blocks = size.div_ceil(32);
        (1 << 15 | (blocks - 1) << 10, blocks * 32)
    } else {
        let blocks = size.div_ceil(2);
        (blocks << 10, blocks * 2)
    }
}

/// Packet memory buffer allocator
///
/// Hands out space from the top down, and never frees. Reset it on bus
/// reset.
pub struct Allocator {
    start: u16,
    ptr: u16,
}

impl Allocator {
    /// An allocator for `size` bytes of packet memory at `start`.
    pub fn new(start: u16, size: u16) -> Self {
        Allocator {
            start,
            ptr: start + size,
        }
    }
    /// Allocates a buffer of `size`
    ///
    /// Returns the buffer's packet memory offset. Sizes are rounded up to a
    /// whole word.
    pub fn allocate(&mut self, size: u16) -> Option<u16> {
        let size = size.checked_add(1)? & !1;
        let new_ptr = self.ptr.checked_sub(size)?;
        if new_ptr < self.start {
            None
        } else {
            self.ptr = new_ptr;
            Some(new_ptr)
        }
    }
}

/// Word access to packet memory
pub struct Pma {
    base: *mut u16,
}

impl Pma {
    /// # Safety
    ///
    /// `base` must point to [`PMA_SIZE`](super::ral::PMA_SIZE) bytes of
    /// packet memory that nothing else uses.
    pub const unsafe fn new(base: *mut u16) -> Self {
        Pma { base }
    }

    fn word(&self, offset: u16) -> *mut u16 {
        debug_assert!(offset < super::ral::PMA_SIZE);
        // Safety: offsets stay inside packet memory.
        unsafe { self.base.add(offset as usize / 2) }
    }

    pub fn read_u16(&self, offset: u16) -> u16 {
        // Safety: see word().
        unsafe { self.word(offset).read_volatile() }
    }

    pub fn write_u16(&self, offset: u16, value: u16) {
        // Safety: see word().
        unsafe { self.word(offset).write_volatile(value) }
    }

    /// Copy `data` into packet memory at `offset`.
    pub fn write(&self, offset: u16, data: &[u8]) {
        for (idx, pair) in data.chunks(2).enumerate() {
            let word = u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]);
            self.write_u16(offset + 2 * idx as u16, word);
        }
    }

    /// Fill `buffer` from packet memory at `offset`.
    pub fn read(&self, offset: u16, buffer: &mut [u8]) {
        for (idx, pair) in buffer.chunks_mut(2).enumerate() {
            let word = self.read_u16(offset + 2 * idx as u16).to_le_bytes();
            pair.copy_from_slice(&word[..pair.len()]);
        }
    }
}
