//! Mutable state shared between a module's main body, its heartbeat loop,
//! link observers and the agent's monitor.
//!
//! Locks are held for field reads/writes only, never across an `.await`.

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Copie de l'état courant, pour les lecteurs qui ne doivent pas garder le verrou
pub fn snapshot<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_detached() {
        let state = new_state(vec![1, 2]);
        let copy = snapshot(&state);
        state.lock().push(3);
        assert_eq!(copy, vec![1, 2]);
        assert_eq!(snapshot(&state).len(), 3);
    }
}
