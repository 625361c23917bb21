//! Completion-callback frame pacing
//!
//! The compositor tells us when it is a good time to draw the next frame by
//! firing the `wl_surface.frame` callback requested with the previous
//! commit. Until that happens, any new frame is dropped rather than queued.
//!
//! # Features
//!
//! - **Single outstanding callback**: `Idle` → `CallbackPending` only once
//!   the request is issued, back to `Idle` only for the matching callback
//! - **Stale/duplicate detection**: callbacks that do not match the pending
//!   one are counted and ignored
//! - **Statistics**: submitted, completed and dropped frames per reason,
//!   plus callback latency
//!
//! # Usage
//!
//! ```no_run
//! use wlsink::protocol::CallbackId;
//! use wlsink::sink::pacer::FramePacer;
//!
//! let mut pacer = FramePacer::new();
//! assert!(!pacer.is_pending());
//! pacer.callback_requested(CallbackId(7));
//! assert!(pacer.on_frame_done(CallbackId(7)));
//! assert!(!pacer.on_frame_done(CallbackId(7)));
//! ```

use crate::protocol::CallbackId;
use log::{debug, trace};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of callback latencies kept for the statistics
const LATENCY_HISTORY_SIZE: usize = 120;

/// Why a frame was not shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The previous frame's completion callback has not fired yet
    CallbackPending,
    /// The window has no render rectangle yet
    NoWindowSize,
    /// The host deferred window creation
    WindowDeferred,
    /// The frame's buffer is already on screen
    AlreadyShown,
}

impl DropReason {
    pub const ALL: [DropReason; 4] = [
        DropReason::CallbackPending,
        DropReason::NoWindowSize,
        DropReason::WindowDeferred,
        DropReason::AlreadyShown,
    ];

    fn index(self) -> usize {
        match self {
            DropReason::CallbackPending => 0,
            DropReason::NoWindowSize => 1,
            DropReason::WindowDeferred => 2,
            DropReason::AlreadyShown => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    Idle,
    CallbackPending { callback: CallbackId, since: Instant },
}

/// Pacing statistics of one sink
#[derive(Debug, Clone, PartialEq)]
pub struct PacerStats {
    /// Frames committed to the compositor
    pub submitted: u64,
    /// Completion callbacks that released the pacer
    pub completed: u64,
    /// Callbacks that matched no pending request
    pub stale_callbacks: u64,
    dropped: [u64; 4],
    /// Average time from commit to completion callback
    pub avg_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl Default for PacerStats {
    fn default() -> Self {
        Self {
            submitted: 0,
            completed: 0,
            stale_callbacks: 0,
            dropped: [0; 4],
            avg_latency: Duration::ZERO,
            min_latency: Duration::MAX,
            max_latency: Duration::ZERO,
        }
    }
}

impl PacerStats {
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped[reason.index()]
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.iter().sum()
    }

    /// Percentage of offered frames that were dropped
    pub fn drop_rate(&self) -> f32 {
        let offered = self.submitted + self.total_dropped();
        if offered == 0 {
            return 0.0;
        }
        self.total_dropped() as f32 / offered as f32 * 100.0
    }
}

#[derive(Debug)]
pub struct FramePacer {
    state: PacerState,
    stats: PacerStats,
    latencies: VecDeque<Duration>,
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePacer {
    pub fn new() -> Self {
        Self {
            state: PacerState::Idle,
            stats: PacerStats::default(),
            latencies: VecDeque::with_capacity(LATENCY_HISTORY_SIZE),
        }
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, PacerState::CallbackPending { .. })
    }

    pub fn pending_callback(&self) -> Option<CallbackId> {
        match self.state {
            PacerState::CallbackPending { callback, .. } => Some(callback),
            PacerState::Idle => None,
        }
    }

    /// A completion callback was requested for the frame being committed
    pub fn callback_requested(&mut self, callback: CallbackId) {
        if let PacerState::CallbackPending { callback: previous, .. } = self.state {
            debug!("{} replaces pending {}", callback, previous);
        }
        self.state = PacerState::CallbackPending {
            callback,
            since: Instant::now(),
        };
        self.stats.submitted += 1;
    }

    /// Handles a completion callback; true if it released the pacer
    pub fn on_frame_done(&mut self, callback: CallbackId) -> bool {
        match self.state {
            PacerState::CallbackPending { callback: pending, since } if pending == callback => {
                self.state = PacerState::Idle;
                self.stats.completed += 1;
                self.record_latency(since.elapsed());
                trace!("✅ {} done", callback);
                true
            }
            _ => {
                self.stats.stale_callbacks += 1;
                trace!("Ignoring stale {}", callback);
                false
            }
        }
    }

    pub fn record_drop(&mut self, reason: DropReason) {
        self.stats.dropped[reason.index()] += 1;
    }

    /// Forgets the pending callback, e.g. when the window goes away
    pub fn reset(&mut self) {
        self.state = PacerState::Idle;
    }

    pub fn stats(&self) -> &PacerStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = PacerStats::default();
        self.latencies.clear();
        debug!("📊 Pacing statistics reset");
    }

    fn record_latency(&mut self, latency: Duration) {
        self.latencies.push_back(latency);
        if self.latencies.len() > LATENCY_HISTORY_SIZE {
            self.latencies.pop_front();
        }

        let total: Duration = self.latencies.iter().sum();
        self.stats.avg_latency = total / self.latencies.len() as u32;
        self.stats.min_latency = self.stats.min_latency.min(latency);
        self.stats.max_latency = self.stats.max_latency.max(latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_callback_releases_once() {
        let mut pacer = FramePacer::new();
        pacer.callback_requested(CallbackId(1));
        assert!(pacer.is_pending());

        assert!(pacer.on_frame_done(CallbackId(1)));
        assert!(!pacer.is_pending());
        assert!(!pacer.on_frame_done(CallbackId(1)));

        let stats = pacer.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.stale_callbacks, 1);
    }

    #[test]
    fn test_stale_callback_keeps_pending() {
        let mut pacer = FramePacer::new();
        pacer.callback_requested(CallbackId(1));
        pacer.reset();
        pacer.callback_requested(CallbackId(2));

        assert!(!pacer.on_frame_done(CallbackId(1)));
        assert_eq!(pacer.pending_callback(), Some(CallbackId(2)));
        assert!(pacer.on_frame_done(CallbackId(2)));
    }

    #[test]
    fn test_drop_counters() {
        let mut pacer = FramePacer::new();
        pacer.record_drop(DropReason::CallbackPending);
        pacer.record_drop(DropReason::CallbackPending);
        pacer.record_drop(DropReason::NoWindowSize);
        pacer.callback_requested(CallbackId(3));

        let stats = pacer.stats();
        assert_eq!(stats.dropped(DropReason::CallbackPending), 2);
        assert_eq!(stats.dropped(DropReason::NoWindowSize), 1);
        assert_eq!(stats.dropped(DropReason::AlreadyShown), 0);
        assert_eq!(stats.total_dropped(), 3);
        assert!((stats.drop_rate() - 75.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_latency_is_recorded() {
        let mut pacer = FramePacer::new();
        pacer.callback_requested(CallbackId(1));
        std::thread::sleep(Duration::from_millis(2));
        pacer.on_frame_done(CallbackId(1));

        let stats = pacer.stats();
        assert!(stats.avg_latency >= Duration::from_millis(2));
        assert_eq!(stats.min_latency, stats.max_latency);

        pacer.reset_stats();
        assert_eq!(pacer.stats(), &PacerStats::default());
    }
}
