//! Transfer buffers
//!
//! A transfer moves bytes into, or out of, memory that the caller owns. The
//! memory must stay put until the transfer completes, is aborted, or its
//! endpoint closes. [`XferBuffer`] carries that memory into the engine.

use core::ptr::NonNull;

/// Caller-owned memory for one transfer
///
/// IN transfers read from the buffer. OUT transfers write into the buffer,
/// so they require a buffer that was created from mutable memory.
pub struct XferBuffer {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
}

// Safety: the buffer is only accessed by the engine that owns it. The
// constructors require exclusive access for the lifetime of the transfer.
unsafe impl Send for XferBuffer {}

impl XferBuffer {
    /// A zero-length buffer
    ///
    /// Use this for zero-length packets and status stages.
    pub const fn empty() -> Self {
        XferBuffer {
            ptr: NonNull::dangling(),
            len: 0,
            writable: true,
        }
    }

    /// A buffer over static, mutable memory
    pub fn new(buffer: &'static mut [u8]) -> Self {
        // Safety: exclusive, 'static borrow.
        unsafe { Self::from_raw_parts(buffer.as_mut_ptr(), buffer.len()) }
    }

    /// A read-only buffer over static memory
    ///
    /// Only usable for IN transfers.
    pub fn from_static(buffer: &'static [u8]) -> Self {
        XferBuffer {
            ptr: NonNull::new(buffer.as_ptr().cast_mut()).unwrap_or(NonNull::dangling()),
            len: buffer.len(),
            writable: false,
        }
    }

    /// A buffer over `len` bytes starting at `ptr`
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that remain valid, and that no one else
    /// reads or writes, until the transfer using this buffer completes, is
    /// aborted, or its endpoint closes.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        XferBuffer {
            ptr: NonNull::new(ptr).unwrap_or(NonNull::dangling()),
            len: if ptr.is_null() { 0 } else { len },
            writable: true,
        }
    }

    /// Returns the buffer length, in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer holds no bytes.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Indicates if an OUT transfer may write into this buffer.
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Shortens the buffer to at most `len` bytes.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // Safety: constructor contract.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Panics
    ///
    /// Debug builds panic if the buffer came from read-only memory.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert!(self.writable, "OUT transfer into read-only buffer");
        // Safety: constructor contract, and writable memory. Callers check
        // is_writable() before accepting an OUT transfer.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Default for XferBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for XferBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("XferBuffer")
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish()
    }
}
