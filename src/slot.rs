use std::sync::Mutex;

/// Free-slot recycler with reuse-detecting instance tags, one per loop.
///
/// Claims may come from any thread (a session handle is returned to the
/// caller before the registration task reaches the loop), so the state sits
/// behind a mutex. Reclaims happen on the loop thread only, after the
/// occupant's teardown has completed. Every claim, fresh or recycled, gets a
/// new instance tag, so a handle minted for a previous occupant can never
/// validate against the next one.
pub(crate) struct SlotAllocator {
    inner: Mutex<Inner>,
}

struct Inner {
    free: Vec<u16>,
    next_fresh: u32,
    capacity: u32,
    next_instance: u32,
}

impl SlotAllocator {
    pub fn new(capacity: u32) -> Self {
        debug_assert!(capacity <= (u16::MAX as u32) + 1);
        SlotAllocator {
            inner: Mutex::new(Inner {
                free: Vec::new(),
                next_fresh: 0,
                capacity,
                next_instance: 1,
            }),
        }
    }

    /// Claim a slot, returning `(slot, instance)`, or `None` when the slot
    /// space is exhausted.
    pub fn claim(&self) -> Option<(u16, u32)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None => {
                if inner.next_fresh >= inner.capacity {
                    return None;
                }
                let slot = inner.next_fresh as u16;
                inner.next_fresh += 1;
                slot
            }
        };
        let instance = inner.next_instance;
        inner.next_instance = inner.next_instance.wrapping_add(1);
        Some((slot, instance))
    }

    /// Return a slot to the free list. Only called once the slot's entry in
    /// the connection table has been removed.
    pub fn reclaim(&self, slot: u16) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(!inner.free.contains(&slot));
        inner.free.push(slot);
    }
}
