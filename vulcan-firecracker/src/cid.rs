//! VM context ID (CID) allocation for vsock. CIDs 0-2 are reserved by the
//! vsock convention (hypervisor, host, and a reserved value), so allocation
//! starts at `min_cid` (3 by default).

use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{FirecrackerError, Result};

/// Scans a fixed-size window from a moving cursor rather than the full CID
/// space, so allocation cost stays bounded regardless of how large the CID
/// space is.
pub struct CidPool {
    min_cid: u32,
    window: u32,
    cursor: Mutex<CursorState>,
}

struct CursorState {
    next: u32,
    in_use: HashSet<u32>,
}

impl CidPool {
    #[must_use]
    pub fn new(min_cid: u32, max_concurrent: u32) -> Self {
        Self {
            min_cid,
            window: max_concurrent + 10,
            cursor: Mutex::new(CursorState {
                next: min_cid,
                in_use: HashSet::new(),
            }),
        }
    }

    /// Allocate the first free CID in a scan window starting at the
    /// internal cursor, wrapping back to `min_cid` at the window's end.
    ///
    /// # Errors
    ///
    /// `FirecrackerError::CidPoolExhausted` if every CID in the window is
    /// currently in use.
    pub fn allocate(&self) -> Result<u32> {
        let mut state = self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = state.next;
        for offset in 0..self.window {
            let candidate = self.min_cid + (start - self.min_cid + offset) % self.window;
            if !state.in_use.contains(&candidate) {
                state.in_use.insert(candidate);
                state.next = candidate + 1;
                if state.next >= self.min_cid + self.window {
                    state.next = self.min_cid;
                }
                return Ok(candidate);
            }
        }
        Err(FirecrackerError::CidPoolExhausted {
            scanned: self.window,
            cursor: start,
        })
    }

    /// Release `cid` back to the pool. A no-op if it was not allocated.
    pub fn release(&self, cid: u32) {
        let mut state = self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.in_use.remove(&cid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_starting_at_min_cid() {
        let pool = CidPool::new(3, 5);
        assert_eq!(pool.allocate().unwrap(), 3);
        assert_eq!(pool.allocate().unwrap(), 4);
    }

    #[test]
    fn release_frees_the_cid_for_reuse() {
        let pool = CidPool::new(3, 1);
        let cid = pool.allocate().unwrap();
        pool.release(cid);
        let reused = pool.allocate().unwrap();
        // window is tiny (1 + 10 = 11), so reuse happens well before wraparound
        assert!(reused >= 3);
    }

    #[test]
    fn exhausted_window_fails_with_resource_exhaustion() {
        let pool = CidPool::new(3, 0); // window = 10
        for _ in 0..10 {
            pool.allocate().unwrap();
        }
        let err = pool.allocate().unwrap_err();
        assert!(matches!(err, FirecrackerError::CidPoolExhausted { .. }));
    }

    #[test]
    fn released_cid_is_immediately_allocatable_again() {
        let pool = CidPool::new(3, 0);
        let mut allocated = Vec::new();
        for _ in 0..10 {
            allocated.push(pool.allocate().unwrap());
        }
        pool.allocate().unwrap_err();
        pool.release(allocated[0]);
        assert_eq!(pool.allocate().unwrap(), allocated[0]);
    }

    proptest::proptest! {
        /// For any release pattern interleaved with allocation, every CID
        /// held concurrently is distinct and falls within the pool's window.
        #[test]
        fn allocations_are_always_unique_and_in_window(
            max_concurrency in 0u32..20,
            release_every in 1usize..5,
        ) {
            let pool = CidPool::new(3, max_concurrency);
            let window = max_concurrency + 10;
            let mut held = Vec::new();
            for i in 0..window {
                let cid = pool.allocate().unwrap();
                proptest::prop_assert!(cid >= 3 && cid < 3 + window);
                proptest::prop_assert!(!held.contains(&cid));
                held.push(cid);
                if (i as usize + 1) % release_every == 0 {
                    let freed = held.remove(0);
                    pool.release(freed);
                }
            }
        }
    }
}
