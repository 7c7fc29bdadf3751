//! Global exclusive monitor
//!
//! Tracks per-processor load-exclusive reservations. Shared across JIT
//! instances in multi-core configurations; every operation serializes on a
//! single test-and-set spinlock, which is cheap at the frequency exclusives
//! occur and keeps the structure trivially correct.
//!
//! A reservation is lost when any other processor writes to the reserved
//! granule: exclusive stores clear all matching reservations while holding
//! the lock, and the engine's plain-store path calls `clear_by_address`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Address bits compared when matching reservations. All-ones means the
/// granule is a single address word; widening toward the architectural
/// 8-byte minimum is a mask change here.
pub const RESERVATION_GRANULE_MASK: u64 = !0u64;

#[derive(Debug, Clone, Copy)]
struct Reservation {
    address: u64,
    /// Value observed by the load-exclusive; kept for diagnostics.
    #[allow(dead_code)]
    value: u64,
}

pub struct ExclusiveMonitor {
    lock: AtomicBool,
    reservations: UnsafeCell<Vec<Option<Reservation>>>,
}

// Safety: `reservations` is only touched between lock()/unlock(), which
// form an acquire/release pair on the spinlock flag.
unsafe impl Send for ExclusiveMonitor {}
unsafe impl Sync for ExclusiveMonitor {}

impl ExclusiveMonitor {
    pub fn new(processor_count: usize) -> ExclusiveMonitor {
        ExclusiveMonitor {
            lock: AtomicBool::new(false),
            reservations: UnsafeCell::new(vec![None; processor_count]),
        }
    }

    pub fn processor_count(&self) -> usize {
        self.lock();
        // Safety: lock held
        let n = unsafe { (*self.reservations.get()).len() };
        self.unlock();
        n
    }

    fn lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Perform the read under the lock and take a reservation for it.
    pub fn read_and_mark(&self, processor_id: usize, address: u64, read: impl FnOnce() -> u64) -> u64 {
        self.lock();
        let value = read();
        // Safety: lock held
        unsafe {
            (&mut *self.reservations.get())[processor_id] = Some(Reservation {
                address: address & RESERVATION_GRANULE_MASK,
                value,
            });
        }
        self.unlock();
        value
    }

    /// Attempt the exclusive store: runs `write` and returns true only if
    /// the processor still holds a reservation for `address`. On success
    /// every other processor's reservation for the granule is cleared.
    pub fn do_exclusive_operation(
        &self,
        processor_id: usize,
        address: u64,
        write: impl FnOnce(),
    ) -> bool {
        let masked = address & RESERVATION_GRANULE_MASK;
        self.lock();
        // Safety: lock held
        let ok = unsafe {
            let res = &mut *self.reservations.get();
            match res[processor_id] {
                Some(r) if r.address == masked => {
                    for slot in res.iter_mut() {
                        if matches!(slot, Some(r) if r.address == masked) {
                            *slot = None;
                        }
                    }
                    true
                }
                _ => {
                    res[processor_id] = None;
                    false
                }
            }
        };
        if ok {
            write();
        }
        self.unlock();
        ok
    }

    /// Drop one processor's reservation (CLREX).
    pub fn clear_processor(&self, processor_id: usize) {
        self.lock();
        // Safety: lock held
        unsafe {
            (&mut *self.reservations.get())[processor_id] = None;
        }
        self.unlock();
    }

    /// A non-exclusive write to `address` occurred: lose every matching
    /// reservation.
    pub fn clear_by_address(&self, address: u64) {
        let masked = address & RESERVATION_GRANULE_MASK;
        self.lock();
        // Safety: lock held
        unsafe {
            for slot in (*self.reservations.get()).iter_mut() {
                if matches!(slot, Some(r) if r.address == masked) {
                    *slot = None;
                }
            }
        }
        self.unlock();
    }

    pub fn clear_all(&self) {
        self.lock();
        // Safety: lock held
        unsafe {
            for slot in (*self.reservations.get()).iter_mut() {
                *slot = None;
            }
        }
        self.unlock();
    }
}
