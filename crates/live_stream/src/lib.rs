pub mod monitor;
pub mod resolver;
pub mod room;

use thiserror::Error;
use serde::{Serialize, Deserialize};

// Re-export main types
pub use monitor::StreamMonitor;
pub use resolver::{BiliPlayUrlResolver, PlayUrlResolver};
pub use room::RoomInfo;

/// Web origin every stream request is pinned to.
pub const PLATFORM_ORIGIN: &str = "https://live.bilibili.com";

/// User agent sent with API and stream requests.
pub const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 LiveRecorder/",
    env!("CARGO_PKG_VERSION")
);

#[derive(Error, Debug)]
pub enum LiveStreamError {
    #[error("NetworkError: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("ParseError: {0}")]
    ParseError(String),
    #[error("ApiError: code {code}: {message}")]
    ApiError { code: i64, message: String },
    #[error("StreamOffline")]
    StreamOffline,
}

/// Why the monitor is being asked to re-evaluate liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    /// Danmaku server pushed a live notification
    Danmaku,
    /// Periodic status poll
    HttpApi,
    /// Recheck scheduled after an attempt ended or failed
    HttpApiRecheck,
    /// Requested by the user
    Manual,
}

/// Events pushed by a stream monitor (pure metadata, no data)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MonitorEvent {
    /// Room metadata refreshed
    RoomInfoUpdated(RoomInfo),
    /// Room went live, or a check confirmed it is live
    StreamStarted { trigger: TriggerType },
}
