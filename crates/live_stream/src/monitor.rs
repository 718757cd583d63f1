use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::broadcast;

use crate::{MonitorEvent, TriggerType};

/// Liveness monitor for a single room.
///
/// Implementations poll the platform (or listen on a push channel) and
/// broadcast [`MonitorEvent`]s. All methods are non-blocking: anything that
/// needs the network is scheduled onto the implementation's own tasks.
pub trait StreamMonitor: Send + Sync {
    /// Subscribe to room-info and stream-started events
    fn subscribe(&self) -> broadcast::Receiver<MonitorEvent>;

    /// Begin polling. Returns false if polling could not be started.
    fn start(&self) -> bool;

    /// Stop polling
    fn stop(&self);

    fn is_monitoring(&self) -> bool;

    /// Tell the monitor whether a recording is currently being written
    fn set_recording(&self, recording: bool);

    /// Path of the file currently being written, once the processor commits it
    fn set_recording_path(&self, path: PathBuf);

    /// Local time at which the current recording connected to the stream
    fn set_stream_start_time(&self, started_at: DateTime<Local>);

    fn set_streamer_name(&self, name: &str);

    fn set_title(&self, title: &str);

    /// Re-check liveness, optionally after a delay
    fn check(&self, trigger: TriggerType, delay: Option<Duration>);

    /// Refetch room metadata; the result arrives as `MonitorEvent::RoomInfoUpdated`
    fn fetch_room_info(&self);
}
