//! Process restart requests
//!
//! New module trees are picked up by restarting the operator process.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::error::{ControllerError, Result};

pub trait Restarter: Send + Sync {
    fn restart(&self, reason: &str) -> Result<()>;
}

/// Sends `SIGUSR2` to a process, PID 1 by default
#[derive(Debug, Clone, Copy)]
pub struct SignalRestarter {
    pid: Pid,
}

impl SignalRestarter {
    pub fn new() -> Self {
        Self {
            pid: Pid::from_raw(1),
        }
    }

    pub fn with_pid(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }
}

impl Default for SignalRestarter {
    fn default() -> Self {
        Self::new()
    }
}

impl Restarter for SignalRestarter {
    fn restart(&self, reason: &str) -> Result<()> {
        tracing::info!(pid = %self.pid, reason = %reason, "requesting restart");
        kill(self.pid, Signal::SIGUSR2).map_err(|e| ControllerError::Restart(e.to_string()))
    }
}

/// Records restart requests instead of signalling
#[derive(Debug, Default)]
pub struct RecordingRestarter {
    reasons: Mutex<Vec<String>>,
}

impl RecordingRestarter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.reasons.lock().len()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

impl Restarter for RecordingRestarter {
    fn restart(&self, reason: &str) -> Result<()> {
        self.reasons.lock().push(reason.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_restarter() {
        let restarter = RecordingRestarter::new();
        restarter.restart("echo deployed").unwrap();
        assert_eq!(restarter.count(), 1);
        assert_eq!(restarter.reasons(), vec!["echo deployed"]);
    }

    #[test]
    fn test_signal_to_missing_process_fails() {
        let restarter = SignalRestarter::with_pid(i32::MAX);
        assert!(matches!(
            restarter.restart("test"),
            Err(ControllerError::Restart(_))
        ));
    }
}
