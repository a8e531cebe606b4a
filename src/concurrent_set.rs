//! Common face of the set-shaped structures plus the shared concurrent
//! smoke-test harness.

use crossbeam_epoch::Guard;

/// A concurrent set of `i64` keys.
///
/// `add` threads the caller-owned xorshift seed through so the skip-list
/// family can draw tower heights; structures that need no randomness ignore
/// it. Constructors that take sizing parameters pick a default here.
pub trait ConcurrentSet {
    fn new() -> Self;
    fn contains(&self, key: i64, guard: &Guard) -> bool;
    fn add(&self, seed: &mut u64, key: i64, guard: &Guard) -> bool;
    fn remove(&self, key: i64, guard: &Guard) -> bool;
}
