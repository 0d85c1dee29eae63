//! Active transfer bookkeeping
//!
//! Chunks a caller's buffer into packets, and decides when a transfer is
//! done. Device endpoints and host pipes share this; neither touches the
//! buffer offsets directly.

use crate::buffer::XferBuffer;

/// The received packet is larger than the max packet size.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Oversize;

/// One in-progress transfer.
#[derive(Debug)]
pub(crate) struct Transfer {
    buffer: XferBuffer,
    transferred: usize,
    /// Bytes of the staged IN packet, not yet acknowledged.
    in_flight: usize,
    /// Send one ZLP after a final, full packet.
    zlp: bool,
}

impl Transfer {
    pub fn new(buffer: XferBuffer, zlp: bool) -> Self {
        Transfer {
            buffer,
            transferred: 0,
            in_flight: 0,
            zlp,
        }
    }

    pub fn total(&self) -> usize {
        self.buffer.len()
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    fn remaining(&self) -> usize {
        self.total() - self.transferred
    }

    /// Stage the next IN packet, and return its bytes.
    ///
    /// Returns an empty slice when only a ZLP remains.
    pub fn next_tx(&mut self, mps: usize) -> &[u8] {
        self.in_flight = self.remaining().min(mps);
        let start = self.transferred;
        &self.buffer.as_slice()[start..start + self.in_flight]
    }

    /// The staged IN packet was acknowledged.
    ///
    /// Returns `true` when the transfer is complete.
    pub fn tx_done(&mut self, mps: usize) -> bool {
        let last = core::mem::take(&mut self.in_flight);
        self.transferred += last;
        if self.transferred < self.total() {
            return false;
        }
        if self.zlp && self.total() > 0 && last == mps {
            self.zlp = false;
            return false;
        }
        true
    }

    /// Returns the memory that should receive a packet of `available` bytes.
    ///
    /// The window may be shorter than the packet, if the buffer's nearly full.
    pub fn rx_window(&mut self, available: usize, mps: usize) -> Result<&mut [u8], Oversize> {
        if available > mps {
            return Err(Oversize);
        }
        let len = available.min(self.remaining());
        let start = self.transferred;
        Ok(&mut self.buffer.as_mut_slice()[start..start + len])
    }

    /// Account for a received packet.
    ///
    /// `copied` bytes landed in the buffer; the packet on the wire was
    /// `packet` bytes long. Returns `true` when the transfer is complete,
    /// either because the buffer is full or because the packet was short.
    pub fn rx_done(&mut self, copied: usize, packet: usize, mps: usize) -> bool {
        self.transferred = (self.transferred + copied).min(self.total());
        self.transferred == self.total() || packet < mps
    }
}
