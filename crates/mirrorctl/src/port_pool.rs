//! Fixed 21-port allocator for remote server bring-ups (spec.md §4.8),
//! generalized from the teacher's `DisplayPool` (`server::session`): same
//! `next free / released set` shape, but over a closed range with device-id
//! stickiness instead of an auto-incrementing display number.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub const PORT_RANGE_START: u16 = 8080;
pub const PORT_RANGE_END: u16 = 8100; // inclusive: 21 ports
/// Sentinel returned by `allocate` when the pool is exhausted.
pub const NO_PORT: u16 = 0;

struct PoolState {
    free: HashSet<u16>,
    bound: HashMap<String, u16>,
}

pub struct PortPool {
    state: Mutex<PoolState>,
}

impl PortPool {
    pub fn new() -> Self {
        let free = (PORT_RANGE_START..=PORT_RANGE_END).collect();
        Self { state: Mutex::new(PoolState { free, bound: HashMap::new() }) }
    }

    /// Returns the device's existing binding if any, otherwise the
    /// numerically smallest free port, binds it, and returns it.
    /// Returns [`NO_PORT`] without mutating state when the pool is empty.
    pub fn allocate(&self, device_id: &str) -> u16 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&port) = state.bound.get(device_id) {
            return port;
        }
        let Some(&port) = state.free.iter().min() else {
            return NO_PORT;
        };
        state.free.remove(&port);
        state.bound.insert(device_id.to_string(), port);
        port
    }

    /// No-op if `device_id` holds no binding.
    pub fn release(&self, device_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(port) = state.bound.remove(device_id) {
            state.free.insert(port);
        }
    }

    pub fn binding_for(&self, device_id: &str) -> Option<u16> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).bound.get(device_id).copied()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).free.len()
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_allocation_and_release_scenario() {
        let pool = PortPool::new();
        assert_eq!(pool.allocate("A"), 8080);
        assert_eq!(pool.allocate("B"), 8081);
        assert_eq!(pool.allocate("C"), 8082);
        pool.release("B");
        assert_eq!(pool.allocate("D"), 8081);
    }

    #[test]
    fn repeated_allocate_for_same_device_is_sticky() {
        let pool = PortPool::new();
        let first = pool.allocate("A");
        let second = pool.allocate("A");
        assert_eq!(first, second);
        assert_eq!(pool.free_count(), 20);
    }

    #[test]
    fn release_of_unbound_device_is_a_no_op() {
        let pool = PortPool::new();
        let before = pool.free_count();
        pool.release("never-allocated");
        assert_eq!(pool.free_count(), before);
    }

    #[test]
    fn exhaustion_returns_sentinel_without_mutating_state() {
        let pool = PortPool::new();
        for i in 0..21 {
            assert_ne!(pool.allocate(&format!("dev{i}")), NO_PORT);
        }
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.allocate("overflow"), NO_PORT);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn invariant_free_and_bound_partition_the_range() {
        let pool = PortPool::new();
        pool.allocate("A");
        pool.allocate("B");
        pool.release("A");
        let state = pool.state.lock().unwrap();
        let mut all: Vec<u16> = state.free.iter().copied().chain(state.bound.values().copied()).collect();
        all.sort_unstable();
        let expected: Vec<u16> = (PORT_RANGE_START..=PORT_RANGE_END).collect();
        assert_eq!(all, expected);
    }
}
