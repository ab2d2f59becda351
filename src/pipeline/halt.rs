use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

pub const STOP_FILENAME: &str = "STOP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltCause {
    BudgetHardStop,
    FatalConfig,
    RunError,
    External,
}

/// Cooperative stop flag shared by all workers. Checked before every item
/// and every stage; calls already in flight are never interrupted.
#[derive(Debug, Default)]
pub struct HaltSignal {
    halted: AtomicBool,
    reason: Mutex<Option<(HaltCause, String)>>,
    stop_file: Option<PathBuf>,
}

impl HaltSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_file(path: &Path) -> Self {
        Self {
            stop_file: Some(path.to_path_buf()),
            ..Self::default()
        }
    }

    /// First trigger wins; later causes are ignored.
    pub fn trigger(&self, cause: HaltCause, reason: &str) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            warn!(cause = ?cause, reason, "halt requested");
            *slot = Some((cause, reason.to_string()));
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Halts when the stop file exists. Called between items.
    pub fn poll_stop_file(&self) -> bool {
        if let Some(path) = &self.stop_file {
            if !self.is_halted() && path.exists() {
                self.trigger(
                    HaltCause::External,
                    &format!("stop file present: {}", path.display()),
                );
            }
        }
        self.is_halted()
    }

    pub fn cause(&self) -> Option<HaltCause> {
        self.reason.lock().as_ref().map(|(cause, _)| *cause)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().as_ref().map(|(_, reason)| reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn first_trigger_wins() {
        let halt = HaltSignal::new();
        assert!(!halt.is_halted());
        halt.trigger(HaltCause::BudgetHardStop, "run cap reached");
        halt.trigger(HaltCause::External, "operator");
        assert!(halt.is_halted());
        assert_eq!(halt.cause(), Some(HaltCause::BudgetHardStop));
        assert_eq!(halt.reason().as_deref(), Some("run cap reached"));
    }

    #[test]
    fn stop_file_triggers_external_halt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stop = dir.path().join(STOP_FILENAME);
        let halt = HaltSignal::with_stop_file(&stop);
        assert!(!halt.poll_stop_file());
        fs::write(&stop, b"").expect("create stop file");
        assert!(halt.poll_stop_file());
        assert_eq!(halt.cause(), Some(HaltCause::External));
    }
}
