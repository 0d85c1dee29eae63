//! Interrupt-to-task event queue
//!
//! The USB interrupt handler produces events; a single task consumes them.
//! The queue is a bounded, lock-free, single-producer / single-consumer ring,
//! built on [`heapless::spsc::Queue`]. The producer never blocks.
//! [`split()`](EventQueue::split) the queue once, and hand the halves to the
//! driver and your task:
//!
//! ```
//! use tusb_core::{driver::Event, event::EventQueue};
//!
//! let mut events: EventQueue<Event> = EventQueue::new();
//! let (producer, consumer) = events.split();
//! assert!(consumer.is_empty());
//! # drop(producer);
//! ```
//!
//! In firmware, give the queue a `'static` home first, for instance with
//! `cortex_m::singleton!`.
//!
//! Start-of-frame events are low value and high rate. They're only admitted
//! while at least [`SOF_HEADROOM`] slots are free, so they can never take the
//! place of a transfer completion.

use heapless::spsc;

/// Default queue depth
///
/// One completion per endpoint direction, plus bus events.
pub const EVENT_QUEUE_DEPTH: usize = 16 * 2 + 8;

/// Free slots required before a start-of-frame event is admitted.
pub const SOF_HEADROOM: usize = 4;

/// An event that travels through an [`EventQueue`]
pub trait QueuedEvent: Copy {
    /// `true` for start-of-frame events, the first to be dropped.
    fn is_sof(&self) -> bool;
}

/// The event didn't fit in the queue.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct QueueFull;

/// A bounded SPSC event queue
///
/// `N` is the number of slots. One slot always stays empty to tell "full"
/// from "empty", so the queue holds `N - 1` events.
pub struct EventQueue<T, const N: usize = EVENT_QUEUE_DEPTH> {
    inner: spsc::Queue<T, N>,
}

impl<T, const N: usize> EventQueue<T, N> {
    /// Allocate an empty queue.
    pub const fn new() -> Self {
        EventQueue {
            inner: spsc::Queue::new(),
        }
    }

    /// Returns the number of events the queue can hold.
    pub const fn capacity(&self) -> usize {
        N.saturating_sub(1)
    }

    /// Acquire the producer and consumer halves.
    ///
    /// The halves borrow the queue, so it can only be split once while
    /// they're alive.
    pub fn split(&mut self) -> (Producer<'_, T, N>, Consumer<'_, T, N>) {
        let (producer, consumer) = self.inner.split();
        (Producer { inner: producer }, Consumer { inner: consumer })
    }
}

impl<T, const N: usize> Default for EventQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The interrupt handler's half of an [`EventQueue`]
pub struct Producer<'a, T, const N: usize = EVENT_QUEUE_DEPTH> {
    inner: spsc::Producer<'a, T, N>,
}

impl<T: QueuedEvent, const N: usize> Producer<'_, T, N> {
    /// Append an event.
    ///
    /// Start-of-frame events are silently dropped when the queue is nearly
    /// full; that still returns `Ok`. Any other event that doesn't fit
    /// returns `QueueFull`.
    pub fn enqueue(&mut self, event: T) -> Result<(), QueueFull> {
        if event.is_sof() && self.free() < SOF_HEADROOM {
            trace!("SOF DROPPED");
            return Ok(());
        }
        self.inner.enqueue(event).map_err(|_| QueueFull)
    }

    /// Returns the number of free slots.
    pub fn free(&self) -> usize {
        self.inner.capacity() - self.inner.len()
    }
}

/// The task's half of an [`EventQueue`]
pub struct Consumer<'a, T, const N: usize = EVENT_QUEUE_DEPTH> {
    inner: spsc::Consumer<'a, T, N>,
}

impl<T: QueuedEvent, const N: usize> Consumer<'_, T, N> {
    /// Remove the oldest event.
    pub fn dequeue(&mut self) -> Option<T> {
        self.inner.dequeue()
    }

    /// Returns the number of queued events.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there's nothing to dequeue.
    pub fn is_empty(&self) -> bool {
        !self.inner.ready()
    }
}

impl<T: QueuedEvent, const N: usize> Iterator for Consumer<'_, T, N> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.dequeue()
    }
}
