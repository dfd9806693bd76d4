//! Workload identifier generation.
//!
//! Produces a 26-character, lexicographically sortable, time-ordered
//! identifier (ULID layout: 48-bit millisecond timestamp + 80-bit
//! randomness, Crockford base32 encoded). Monotonicity within the same
//! millisecond is guaranteed by incrementing the random component from a
//! process-wide counter instead of re-rolling it, so two ids minted in the
//! same tick still sort in mint order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

struct Cursor {
    last_ms: u64,
    /// Low 80 bits of randomness, kept as two u64 halves for simplicity.
    entropy: u128,
}

static CURSOR: Mutex<Option<Cursor>> = Mutex::new(None);
static SEED: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

fn next_entropy() -> u128 {
    // A cheap process-local PRNG seed; entropy only needs to avoid
    // collisions within a process, not to be cryptographically strong.
    let mixed = SEED.fetch_add(0xA24B_AED4_963E_E407, Ordering::Relaxed);
    let hi = mixed.wrapping_mul(0xD6E8_FEB8_6659_FD93);
    let lo = mixed.rotate_left(31).wrapping_mul(0x2545_F491_4F6C_DD1D);
    (u128::from(hi) << 64) | u128::from(lo)
}

/// Generate a new time-ordered workload identifier.
#[must_use]
pub fn generate_workload_id() -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut guard = CURSOR.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let entropy = match guard.as_mut() {
        Some(cursor) if cursor.last_ms == now_ms => {
            cursor.entropy = cursor.entropy.wrapping_add(1);
            cursor.entropy
        }
        _ => {
            let fresh = next_entropy() & ((1u128 << 80) - 1);
            *guard = Some(Cursor {
                last_ms: now_ms,
                entropy: fresh,
            });
            fresh
        }
    };
    drop(guard);

    encode(now_ms, entropy)
}

fn encode(timestamp_ms: u64, entropy: u128) -> String {
    let mut out = String::with_capacity(26);

    // 48-bit timestamp -> 10 base32 chars.
    for i in (0..10).rev() {
        let shift = i * 5;
        let idx = ((timestamp_ms >> shift) & 0x1F) as usize;
        out.push(CROCKFORD[idx] as char);
    }
    // 80-bit entropy -> 16 base32 chars.
    for i in (0..16).rev() {
        let shift = i * 5;
        let idx = ((entropy >> shift) & 0x1F) as usize;
        out.push(CROCKFORD[idx] as char);
    }
    out
}
