//! 扫描会话句柄
//! 一个或多个扫描周期的取消与进度，显式传给需要的调用方

use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    Idle,
    Scanning,
    Finished,
    Cancelled,
}

impl ScanPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ScanPhase::Scanning,
            2 => ScanPhase::Finished,
            3 => ScanPhase::Cancelled,
            _ => ScanPhase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ScanPhase::Idle => 0,
            ScanPhase::Scanning => 1,
            ScanPhase::Finished => 2,
            ScanPhase::Cancelled => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub phase: ScanPhase,
    pub hosts_total: usize,
    pub hosts_finished: usize,
}

#[derive(Debug, Default)]
struct Counters {
    phase: AtomicU8,
    total: AtomicUsize,
    finished: AtomicUsize,
}

/// Cheap to clone; every clone observes the same token and counters.
#[derive(Debug, Clone, Default)]
pub struct ScanSession {
    token: CancellationToken,
    counters: Arc<Counters>,
}

impl ScanSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn progress(&self) -> Progress {
        Progress {
            phase: ScanPhase::from_u8(self.counters.phase.load(Ordering::Acquire)),
            hosts_total: self.counters.total.load(Ordering::Acquire),
            hosts_finished: self.counters.finished.load(Ordering::Acquire),
        }
    }

    pub(crate) fn begin(&self, hosts_total: usize) {
        self.counters.total.store(hosts_total, Ordering::Release);
        self.counters.finished.store(0, Ordering::Release);
        self.set_phase(ScanPhase::Scanning);
    }

    pub(crate) fn host_finished(&self) {
        self.counters.finished.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish(&self) {
        let phase = if self.is_cancelled() { ScanPhase::Cancelled } else { ScanPhase::Finished };
        self.set_phase(phase);
    }

    fn set_phase(&self, phase: ScanPhase) {
        self.counters.phase.store(phase.as_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_progress_and_cancellation() {
        let session = ScanSession::new();
        let observer = session.clone();
        assert_eq!(observer.progress().phase, ScanPhase::Idle);

        session.begin(3);
        session.host_finished();
        assert_eq!(
            observer.progress(),
            Progress { phase: ScanPhase::Scanning, hosts_total: 3, hosts_finished: 1 }
        );

        observer.cancel();
        session.finish();
        assert!(session.is_cancelled());
        assert_eq!(observer.progress().phase, ScanPhase::Cancelled);
    }
}
