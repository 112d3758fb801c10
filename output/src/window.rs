//! Adaptive send window
//!
//! The window caps how many events one protocol round puts in flight.
//! Slow start: begin small, grow by 1.5x while rounds fill the window and
//! succeed, halve on any failure.
//!
//! ```text
//!   size
//!    │        ┌──── max_ok (largest size that ever succeeded)
//!    │    ┌───┘
//!    │ ┌──┘   x fail       ┌──
//!    │─┘      └─ halve ┌───┘   regrow up to max_ok, then probe beyond
//!    └────────────────────────────► rounds
//! ```
//!
//! Only the send path mutates the window. The size lives in an atomic so
//! monitoring can read it concurrently through a [`WindowGauge`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Smallest window a failing connection shrinks to
pub const MIN_WINDOW_SIZE: usize = 1;

/// Default starting window
pub const DEFAULT_WINDOW_START: usize = 10;

/// Adaptive window owned by one protocol client
#[derive(Debug)]
pub struct Window {
    size: Arc<AtomicUsize>,
    max_ok: usize,
    max: usize,
}

impl Window {
    /// Create a window starting at `start`, bounded by `[1, max]`
    pub fn new(start: usize, max: usize) -> Self {
        let max = max.max(MIN_WINDOW_SIZE);
        let start = start.clamp(MIN_WINDOW_SIZE, max);
        Self {
            size: Arc::new(AtomicUsize::new(start)),
            max_ok: 0,
            max,
        }
    }

    /// Current window size
    pub fn get(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Largest size that completed a round so far
    pub fn max_ok(&self) -> usize {
        self.max_ok
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Read-only view for monitoring
    pub fn gauge(&self) -> WindowGauge {
        WindowGauge {
            size: Arc::clone(&self.size),
        }
    }

    /// Grow after a successful round that had `batch_size` events queued
    ///
    /// Nothing happens unless the window was the limiting factor
    /// (`window <= batch_size`).
    pub fn try_grow(&mut self, batch_size: usize) {
        let window = self.get();
        if window > batch_size {
            return;
        }

        if self.max_ok < window {
            // new high-water mark, probe beyond it
            self.max_ok = window;
            let mut next = grow(window);
            if batch_size < next {
                next = batch_size;
            }
            self.set(next.min(self.max));
        } else if window < self.max_ok {
            // recovering from a shrink
            self.set(grow(window).min(self.max_ok));
        }
    }

    /// Halve after a failed round, floored at [`MIN_WINDOW_SIZE`]
    pub fn shrink(&mut self) {
        let window = self.get();
        let next = (window / 2).max(MIN_WINDOW_SIZE);
        if next != window {
            self.set(next);
        }
    }

    fn set(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }
}

/// ceil(1.5 * size)
fn grow(size: usize) -> usize {
    size + size.div_ceil(2)
}

/// Shared read-only handle on a window's current size
#[derive(Debug, Clone)]
pub struct WindowGauge {
    size: Arc<AtomicUsize>,
}

impl WindowGauge {
    pub fn get(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }
}
