use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Daily-baseline tracker for drawdown gating: reset whenever the UTC
/// calendar date changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayBaseline {
    #[serde(default)]
    pub day_id: Option<String>,
    #[serde(default)]
    pub equity_start: Option<f64>,
}

/// Telemetry overwritten every tick; purely observational, never read
/// back into decision logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthTelemetry {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub last_tick_ms: Option<i64>,
    #[serde(default)]
    pub push_ok: Option<bool>,
    #[serde(default)]
    pub signal_last_ms: Option<i64>,
    #[serde(default)]
    pub signal_age_s: Option<i64>,
    #[serde(default)]
    pub market_open: Option<bool>,
    #[serde(default)]
    pub day_drawdown: Option<f64>,
    #[serde(default)]
    pub positions: Option<Vec<String>>,
    #[serde(default)]
    pub saved_at_ms: Option<i64>,
}

/// Throttling sub-state for graceful reduction under a stale signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafeSignalState {
    #[serde(default)]
    pub last_reduce_ms: Option<i64>,
}

/// The full on-disk document. Every field is `#[serde(default)]` so a
/// reader never fails on an unfamiliar shape — unknown fields are simply
/// dropped, new fields default to empty, matching the flat
/// forward-compatible layout the reference implementation uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default = "default_version")]
    pub v: i64,
    #[serde(default)]
    pub cooldowns: HashMap<String, i64>,
    #[serde(default)]
    pub opened_at_ms: HashMap<String, i64>,
    #[serde(default)]
    pub above_since: HashMap<String, i64>,
    #[serde(default)]
    pub below_since: HashMap<String, i64>,
    #[serde(default)]
    pub missing_since: HashMap<String, i64>,
    #[serde(default)]
    pub day: DayBaseline,
    #[serde(default)]
    pub health: HealthTelemetry,
    #[serde(default)]
    pub safe_signal: SafeSignalState,
}

fn default_version() -> i64 {
    1
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            v: 1,
            cooldowns: HashMap::new(),
            opened_at_ms: HashMap::new(),
            above_since: HashMap::new(),
            below_since: HashMap::new(),
            missing_since: HashMap::new(),
            day: DayBaseline::default(),
            health: HealthTelemetry::default(),
            safe_signal: SafeSignalState::default(),
        }
    }
}

/// Atomically-replaced JSON document on disk with a 3-deep backup
/// rotation and restricted permissions. Grounded in the reference
/// implementation's save/load algorithm: write to `.tmp`, rotate the
/// previous file into `.bak1` (shifting older backups first so nothing
/// is clobbered), rename the temp file over the target, then chmod it to
/// owner-only. A missing or unparseable file yields a fresh document
/// rather than an error.
pub struct PersistentStateStore {
    path: PathBuf,
}

impl PersistentStateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self {
            path: state_dir.as_ref().join("runtime_state.json"),
        })
    }

    pub fn load(&self) -> RuntimeState {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return RuntimeState::default();
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!("runtime state corrupt, starting fresh: {}", e);
            RuntimeState::default()
        })
    }

    pub fn save(&self, state: &mut RuntimeState, now_ms: i64) -> anyhow::Result<()> {
        state.health.saved_at_ms = Some(now_ms);

        if self.path.exists() {
            self.rotate_backups()?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let body = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &self.path)?;
        self.restrict_permissions()?;
        Ok(())
    }

    fn rotate_backups(&self) -> anyhow::Result<()> {
        for i in (1..=2).rev() {
            let older = self.backup_path(i);
            let newer = self.backup_path(i + 1);
            if older.exists() {
                std::fs::rename(&older, &newer)?;
            }
        }
        std::fs::rename(&self.path, self.backup_path(1))?;
        Ok(())
    }

    fn backup_path(&self, n: u8) -> PathBuf {
        self.path.with_extension(format!("bak{}.json", n))
    }

    #[cfg(unix)]
    fn restrict_permissions(&self) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
    }

    #[cfg(not(unix))]
    fn restrict_permissions(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_fresh_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let state = store.load();
        assert_eq!(state.v, 1);
        assert!(state.cooldowns.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let mut state = RuntimeState::default();
        state.cooldowns.insert("AAA".to_string(), 12345);
        store.save(&mut state, 1000).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.cooldowns.get("AAA"), Some(&12345));
    }

    #[test]
    fn corrupt_file_falls_back_to_fresh_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("runtime_state.json"), "{not json").unwrap();
        let state = store.load();
        assert_eq!(state.v, 1);
    }

    #[test]
    fn save_rotates_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let mut state = RuntimeState::default();

        store.save(&mut state, 1).unwrap();
        store.save(&mut state, 2).unwrap();
        store.save(&mut state, 3).unwrap();

        assert!(dir.path().join("runtime_state.json").exists());
        assert!(dir.path().join("runtime_state.bak1.json").exists());
        assert!(dir.path().join("runtime_state.bak2.json").exists());
    }
}
