use risk_profile::RiskProfileName;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// The two operator-facing capability values the engine reads every tick.
/// Both are cheap, `Send + Sync` handles owned by whatever external
/// listener wires them up (interactive pairing, messaging) — the engine
/// has no opinion on how they're produced.
#[derive(Clone)]
pub struct ControlInputs {
    panic: Arc<AtomicBool>,
    emergency_stop: Arc<AtomicBool>,
    profile: Arc<RwLock<String>>,
}

impl ControlInputs {
    pub fn new(initial_profile: String) -> Self {
        Self {
            panic: Arc::new(AtomicBool::new(false)),
            emergency_stop: Arc::new(AtomicBool::new(false)),
            profile: Arc::new(RwLock::new(initial_profile)),
        }
    }

    pub fn get_panic(&self) -> bool {
        self.panic.load(Ordering::Relaxed) || self.emergency_stop.load(Ordering::Relaxed)
    }

    pub fn set_panic(&self, value: bool) {
        self.panic.store(value, Ordering::Relaxed);
    }

    /// Set by the external messaging listener; distinct from `panic` so
    /// the two sources can be told apart in logs, but both gate identically.
    pub fn set_emergency_stop(&self, value: bool) {
        self.emergency_stop.store(value, Ordering::Relaxed);
    }

    pub fn get_profile(&self) -> RiskProfileName {
        RiskProfileName::parse(&self.profile.read().unwrap())
    }

    pub fn set_profile(&self, name: String) {
        *self.profile.write().unwrap() = name;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_and_emergency_stop_both_gate_get_panic() {
        let ci = ControlInputs::new("balanced".to_string());
        assert!(!ci.get_panic());
        ci.set_emergency_stop(true);
        assert!(ci.get_panic());
        ci.set_emergency_stop(false);
        ci.set_panic(true);
        assert!(ci.get_panic());
    }

    #[test]
    fn unknown_profile_name_resolves_to_balanced() {
        let ci = ControlInputs::new("nonsense".to_string());
        assert_eq!(ci.get_profile(), RiskProfileName::Balanced);
    }
}
