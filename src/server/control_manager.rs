//! Registry of logged-in control sessions keyed by run id, with the
//! `Replace()` semantics spec §4.5 requires: a second login with the same
//! run id swaps in the new session and tells the old one to close, but
//! the old session's own cleanup must not evict the new one if it races
//! past the old one's shutdown. Grounded on
//! `examples/original_source/server/control.go`'s control-session registry
//! and its `Replace` handling.

use super::control::Control;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ControlManager {
    sessions: DashMap<String, Arc<Control>>,
}

impl ControlManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `control` under its run id, returning whichever session
    /// previously held that slot (if any) so the caller can tell it to
    /// close.
    pub fn register(&self, control: Arc<Control>) -> Option<Arc<Control>> {
        self.sessions.insert(control.run_id().to_string(), control)
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<Control>> {
        self.sessions.get(run_id).map(|v| v.clone())
    }

    /// Removes `run_id`'s entry only if it still points at `control` —
    /// guards against a session's own shutdown path evicting a newer
    /// session that already replaced it.
    pub fn remove_if_current(&self, run_id: &str, control: &Arc<Control>) {
        if let Some(entry) = self.sessions.get(run_id) {
            if Arc::ptr_eq(entry.value(), control) {
                drop(entry);
                self.sessions.remove(run_id);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenAuthVerifier;
    use crate::server::control::Control;

    fn dummy_control(run_id: &str) -> Arc<Control> {
        Arc::new(Control::new_for_test(
            run_id.to_string(),
            TokenAuthVerifier::new("t", 900),
        ))
    }

    #[test]
    fn register_returns_previous_occupant_of_the_slot() {
        let manager = ControlManager::new();
        let first = dummy_control("run-1");
        assert!(manager.register(first.clone()).is_none());

        let second = dummy_control("run-1");
        let replaced = manager.register(second.clone());
        assert!(Arc::ptr_eq(&replaced.unwrap(), &first));
        assert!(Arc::ptr_eq(&manager.get("run-1").unwrap(), &second));
    }

    #[test]
    fn remove_if_current_is_a_noop_once_replaced() {
        let manager = ControlManager::new();
        let first = dummy_control("run-1");
        manager.register(first.clone());
        let second = dummy_control("run-1");
        manager.register(second.clone());

        manager.remove_if_current("run-1", &first);
        assert!(manager.get("run-1").is_some());

        manager.remove_if_current("run-1", &second);
        assert!(manager.get("run-1").is_none());
    }
}
