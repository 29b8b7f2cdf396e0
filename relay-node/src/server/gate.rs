//! Admission gate bounding the number of concurrently served sockets.
use std::time;

use crossbeam_channel as chan;

/// A counting gate. Slots are taken by holding a [`Permit`].
#[derive(Debug, Clone)]
pub struct Gate {
    slots: chan::Sender<()>,
    permits: chan::Receiver<()>,
}

/// A gate slot, released on drop.
#[derive(Debug)]
pub struct Permit {
    permits: chan::Receiver<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.permits.try_recv().ok();
    }
}

impl Gate {
    /// Create a gate admitting `capacity` holders at a time.
    pub fn new(capacity: usize) -> Self {
        let (slots, permits) = chan::bounded(capacity.max(1));

        Self { slots, permits }
    }

    /// Take a slot, waiting at most `timeout` for one to be released.
    pub fn acquire_timeout(&self, timeout: time::Duration) -> Option<Permit> {
        self.slots.send_timeout((), timeout).ok().map(|()| self.permit())
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.slots.try_send(()).ok().map(|()| self.permit())
    }

    /// Number of slots taken.
    pub fn in_use(&self) -> usize {
        self.slots.len()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.capacity().unwrap_or_default()
    }

    fn permit(&self) -> Permit {
        Permit {
            permits: self.permits.clone(),
        }
    }
}
