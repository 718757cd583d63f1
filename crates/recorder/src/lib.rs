pub mod connection;
pub mod path;
pub mod processor;
pub mod retry;
pub mod room;
pub mod speed;
pub mod state;
pub mod stream_loop;

use thiserror::Error;
use serde::{Serialize, Deserialize};

use live_stream::LiveStreamError;

// Re-export main types
pub use connection::{Connected, StreamConnector};
pub use path::PathResolver;
pub use processor::{
    ClipOptions, PassthroughFactory, PathCommit, ProcessorFactory, ProcessorInit,
    StreamProcessor,
};
pub use retry::RetryScheduler;
pub use room::RoomSession;
pub use speed::{SpeedSample, SpeedTracker};
pub use state::{AttemptOutcome, AttemptState, RoomSnapshot};
pub use stream_loop::{LoopExit, StreamingLoop};

/// Version written into recording metadata, with the build's git revision when known
pub fn version_string() -> String {
    format!(
        "{}-{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("RECORDER_GIT_SHA").unwrap_or("dev")
    )
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("NetworkError: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("IOError: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ResolveError: {0}")]
    ResolveError(#[from] LiveStreamError),
    #[error("ConnectTimeout: {0}")]
    ConnectTimeout(String),
    #[error("HttpStatus: {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("TooManyRedirects: gave up after {0} redirects")]
    TooManyRedirects(usize),
    #[error("InvalidUrl: {0}")]
    InvalidUrl(String),
    #[error("RedirectError: {0}")]
    RedirectError(String),
    #[error("ProcessorError: {0}")]
    ProcessorError(String),
    #[error("ConfigError: {0}")]
    ConfigError(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Disposed: room session has been shut down")]
    Disposed,
}

/// Recording events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecorderEvent {
    /// Room state or telemetry changed
    StateChanged(RoomSnapshot),
    /// Connection established and the body is being read
    AttemptConnected {
        room_id: u64,
        host: String,
    },
    /// An attempt reached a terminal condition and was cleaned up
    AttemptFinished {
        room_id: u64,
        outcome: AttemptOutcome,
    },
}

/// Which outputs the processor should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnabledFeature {
    RecordAndClip,
    RecordOnly,
    ClipOnly,
}

/// How the processor splits long recordings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CuttingMode {
    Disabled,
    /// Split every `cutting_number` minutes
    ByTime,
    /// Split every `cutting_number` MiB
    BySize,
}

/// Recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Root directory every output file must stay inside
    pub work_dir: String,
    /// Filename template for recordings, relative to `work_dir`
    pub record_filename_format: String,
    /// Filename template for clips, relative to `work_dir`
    pub clip_filename_format: String,
    /// Timeout for URL resolution and for receiving response headers
    pub stream_connect_timeout_ms: u64,
    /// Delay before asking the monitor to recheck after an attempt ends
    pub stream_retry_ms: u64,
    /// How long a manual stop waits before force-closing the connection
    pub stop_grace_ms: u64,
    /// Stall guard for body reads on keep-alive connections
    pub read_timeout_ms: u64,
    /// Maximum number of 301/302 hops followed per attempt
    pub max_redirects: usize,
    pub enabled_feature: EnabledFeature,
    pub cutting_mode: CuttingMode,
    pub cutting_number: u32,
    /// Seconds kept before the clip point
    pub clip_length_past: u32,
    /// Seconds recorded after the clip point
    pub clip_length_future: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            work_dir: "recordings".to_string(),
            record_filename_format: "{roomid}-{name}/record-{roomid}-{date}-{time}-{title}.flv"
                .to_string(),
            clip_filename_format: "{roomid}-{name}/clip-{roomid}-{date}-{time}-{title}.flv"
                .to_string(),
            stream_connect_timeout_ms: 5000,
            stream_retry_ms: 6000,
            stop_grace_ms: 2000,
            read_timeout_ms: 3000,
            max_redirects: 5,
            enabled_feature: EnabledFeature::RecordAndClip,
            cutting_mode: CuttingMode::Disabled,
            cutting_number: 10,
            clip_length_past: 20,
            clip_length_future: 10,
        }
    }
}

impl RecorderConfig {
    /// Parse a config from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, RecorderError> {
        serde_json::from_str(json).map_err(|e| RecorderError::ConfigError(e.to_string()))
    }
}
