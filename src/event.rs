//! Log records produced by heap operations. A standalone [`crate::Heap`]
//! logs them right away. When the heap sits behind the lock of
//! [`crate::SegAlloc`] they are buffered instead and emitted once the lock is
//! released, because a logger is free to allocate and that allocation would
//! need the same lock.

/// Records kept per operation. The worst case is an over-aligned allocation
/// on a fresh heap: creation, two growths and two allocation records.
const CAPACITY: usize = 8;

/// Something worth logging. Addresses are plain numbers so that the event
/// can outlive the heap borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Created { origin: usize },
    Grown { by: usize, total: usize },
    GrowthFailed { requested: usize, reason: &'static str },
    Rejected { address: usize, reason: &'static str },
    Allocated { size: usize, address: usize },
    AllocatedAligned { size: usize, align: usize, address: usize },
    Deallocated { address: usize },
    Reallocated { address: usize, size: usize, new_address: usize },
}

impl Event {
    pub fn log(self) {
        match self {
            Self::Created { origin } => log::debug!("heap created at {origin:#x}"),
            Self::Grown { by, total } => log::debug!("heap grown by {by} bytes, total {total}"),
            Self::GrowthFailed { requested, reason } => {
                log::warn!("cannot grow heap by {requested} bytes, {reason}")
            }
            Self::Rejected { address, reason } => log::warn!("free({address:#x}): {reason}"),
            Self::Allocated { size, address } => log::trace!("allocate({size}) -> {address:#x}"),
            Self::AllocatedAligned {
                size,
                align,
                address,
            } => log::trace!("allocate_aligned({size}, {align}) -> {address:#x}"),
            Self::Deallocated { address } => log::trace!("deallocate({address:#x})"),
            Self::Reallocated {
                address,
                size,
                new_address,
            } => log::trace!("reallocate({address:#x}, {size}) -> {new_address:#x}"),
        }
    }
}

/// Where [`Event`]s go.
#[derive(Debug)]
pub(crate) struct Events {
    deferred: bool,
    pending: [Option<Event>; CAPACITY],
    len: usize,
    dropped: usize,
}

impl Events {
    /// Every event is logged as soon as it's recorded.
    pub const fn direct() -> Self {
        Self {
            deferred: false,
            pending: [None; CAPACITY],
            len: 0,
            dropped: 0,
        }
    }

    /// Events are kept until [`Events::take`].
    pub const fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::direct()
        }
    }

    pub fn record(&mut self, event: Event) {
        if !self.deferred {
            event.log();
        } else if self.len < CAPACITY {
            self.pending[self.len] = Some(event);
            self.len += 1;
        } else {
            self.dropped += 1;
        }
    }

    /// Moves the buffered events out, leaving the buffer empty.
    pub fn take(&mut self) -> Pending {
        let pending = Pending {
            events: self.pending,
            dropped: self.dropped,
        };

        self.pending = [None; CAPACITY];
        self.len = 0;
        self.dropped = 0;

        pending
    }
}

/// Events taken out of a deferred buffer, ready to be logged.
#[derive(Debug)]
pub(crate) struct Pending {
    events: [Option<Event>; CAPACITY],
    dropped: usize,
}

impl Pending {
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().flatten()
    }

    pub fn log(self) {
        for event in self.events.into_iter().flatten() {
            event.log();
        }

        if self.dropped > 0 {
            log::warn!("{} heap log records dropped", self.dropped);
        }
    }
}
