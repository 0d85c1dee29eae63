//! Error taxonomy
//!
//! [`Error`] is returned synchronously from API calls. [`XferResult`] is the
//! outcome of a transfer, reported later through the event queue. Hardware
//! specific causes never leave the adapter boundary; they're logged and
//! collapsed into [`XferResult::Failed`].

/// An API call could not be performed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Error {
    /// No hardware resource (endpoint, pipe, packet memory) is free.
    NoResource,
    /// The call doesn't fit the current state.
    ///
    /// Examples: a transfer on an unopened or busy endpoint, a control data
    /// stage outside of a control request, an invalid endpoint configuration,
    /// or a stale pipe handle.
    InvalidState,
}

/// The outcome of a transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum XferResult {
    /// All requested bytes moved, or the peer ended the transfer with a short packet.
    Success,
    /// Transport error: timeout, CRC, babble, oversized packet, ...
    Failed,
    /// The endpoint is, or the peer responded with, STALL.
    Stalled,
}

impl XferResult {
    /// `true` for [`XferResult::Success`].
    pub const fn is_success(self) -> bool {
        matches!(self, XferResult::Success)
    }
}
