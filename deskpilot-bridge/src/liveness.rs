//! Heartbeat freshness tracking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connected only while a socket is up *and* a heartbeat arrived within
/// `timeout`. A half-open socket goes stale and reads as disconnected.
#[derive(Debug)]
pub struct Liveness {
    epoch: Instant,
    last_beat_ms: AtomicU64,
    socket_up: AtomicBool,
    timeout: Duration,
}

impl Liveness {
    pub fn new(timeout: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_beat_ms: AtomicU64::new(0),
            socket_up: AtomicBool::new(false),
            timeout,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn mark_connected(&self) {
        self.beat();
        self.socket_up.store(true, Ordering::SeqCst);
    }

    pub fn mark_disconnected(&self) {
        self.socket_up.store(false, Ordering::SeqCst);
    }

    pub fn beat(&self) {
        self.last_beat_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    pub fn since_last_beat(&self) -> Duration {
        Duration::from_millis(
            self.now_ms()
                .saturating_sub(self.last_beat_ms.load(Ordering::SeqCst)),
        )
    }

    pub fn is_fresh(&self) -> bool {
        self.socket_up.load(Ordering::SeqCst) && self.since_last_beat() <= self.timeout
    }

    pub fn socket_up(&self) -> bool {
        self.socket_up.load(Ordering::SeqCst)
    }
}
