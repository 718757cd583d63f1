use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Serialize, Deserialize};

/// Lifecycle of the download attempt owned by a room session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AttemptState {
    /// No attempt running
    Idle = 0,
    /// Attempt launched, resolving and connecting
    Starting = 1,
    /// Body is being read
    Streaming = 2,
    /// Cancellation requested, waiting for the attempt to finish
    Stopping = 3,
}

impl AttemptState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AttemptState::Starting,
            2 => AttemptState::Streaming,
            3 => AttemptState::Stopping,
            _ => AttemptState::Idle,
        }
    }
}

/// Atomic holder for [`AttemptState`]; transitions are compare-and-swap
#[derive(Debug)]
pub struct AttemptStateCell(AtomicU8);

impl AttemptStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(AttemptState::Idle as u8))
    }

    pub fn get(&self) -> AttemptState {
        AttemptState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from` -> `to`; fails if the current state is not `from`
    pub fn transition(&self, from: AttemptState, to: AttemptState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark a running attempt as stopping. Returns false if nothing was running.
    pub fn begin_stop(&self) -> bool {
        self.transition(AttemptState::Starting, AttemptState::Stopping)
            || self.transition(AttemptState::Streaming, AttemptState::Stopping)
            || self.get() == AttemptState::Stopping
    }

    pub fn reset(&self) {
        self.0.store(AttemptState::Idle as u8, Ordering::Release);
    }
}

impl Default for AttemptStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// How an attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Server closed the stream (zero-byte read)
    RemoteClosed,
    /// Cancellation observed at a read boundary
    StoppedLocally,
    /// Stream force-closed or connect aborted after a stop request
    Cancelled,
    /// URL resolution or response headers exceeded the connect timeout
    ConnectTimeout,
    /// Server answered with a status other than 200 or a redirect
    HttpStatus(u16),
    TooManyRedirects,
    /// Resolution, connection or processor setup failed
    StartFailed(String),
    /// Read or write failed mid-stream
    StreamFailed(String),
    /// The attempt task panicked
    Crashed(String),
}

impl AttemptOutcome {
    /// Outcomes that never schedule a recheck
    pub fn is_expected_cancellation(&self) -> bool {
        matches!(self, AttemptOutcome::Cancelled)
    }
}

/// Point-in-time view of a room session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: u64,
    pub short_room_id: u64,
    pub streamer_name: String,
    pub title: String,
    pub is_monitoring: bool,
    pub is_recording: bool,
    pub attempt: AttemptState,
    pub has_processor: bool,
    pub retry_enabled: bool,
    pub download_speed_mbps: f64,
    pub download_percentage: f64,
}
