//! Boundary to the container processor.
//!
//! The session hands raw body bytes to a [`StreamProcessor`] created per
//! attempt by a [`ProcessorFactory`]. Demuxing, cutting and clipping are the
//! processor's job; [`PassthroughProcessor`] is the minimal implementation
//! that writes the byte stream to disk unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{oneshot, Mutex};

use crate::{CuttingMode, EnabledFeature, RecorderError};

/// Produces a fresh output path each time it is called
pub type PathSource = Arc<dyn Fn() -> PathBuf + Send + Sync>;

/// Processor shared between the read loop and `clip()` callers
pub type SharedProcessor = Arc<Mutex<Box<dyn StreamProcessor>>>;

/// Fills the vendor block of the container's metadata
pub type MetadataHook = Box<dyn Fn(&mut Map<String, Value>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipOptions {
    /// Seconds kept before the clip point
    pub length_past: u32,
    /// Seconds recorded after the clip point
    pub length_future: u32,
    pub cutting_number: u32,
}

/// One-shot signal fulfilled when the processor opens its recording file
pub struct PathCommit(Option<oneshot::Sender<PathBuf>>);

impl PathCommit {
    pub fn channel() -> (Self, oneshot::Receiver<PathBuf>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Publish the committed path. Only the first call has an effect.
    pub fn commit(&mut self, path: PathBuf) -> bool {
        match self.0.take() {
            Some(tx) => tx.send(path).is_ok(),
            None => false,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.0.is_none()
    }
}

/// Everything a processor needs from the session at creation time
pub struct ProcessorInit {
    pub room_id: u64,
    pub record_path: PathSource,
    pub clip_path: PathSource,
    pub enabled_feature: EnabledFeature,
    pub cutting_mode: CuttingMode,
    pub path_commit: PathCommit,
}

#[async_trait]
pub trait StreamProcessor: Send {
    /// Consume the next bytes of the container stream
    async fn add_bytes(&mut self, data: &[u8]) -> Result<(), RecorderError>;

    /// Install the hook that decorates the container metadata; called once per attempt
    fn set_metadata_hook(&mut self, hook: MetadataHook);

    fn set_clip_options(&mut self, options: ClipOptions);

    /// Save a clip around the current position
    async fn clip(&mut self) -> Result<(), RecorderError>;

    /// Highest media timestamp written so far, in milliseconds
    fn total_max_timestamp(&self) -> i64;

    /// Flush and close every open output
    async fn finalize(&mut self) -> Result<(), RecorderError>;
}

pub trait ProcessorFactory: Send + Sync {
    fn create(&self, init: ProcessorInit) -> Result<Box<dyn StreamProcessor>, RecorderError>;
}

/// Wrap a processor for sharing between the read loop and clip requests
pub fn shared(processor: Box<dyn StreamProcessor>) -> SharedProcessor {
    Arc::new(Mutex::new(processor))
}

/// Factory for [`PassthroughProcessor`]
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughFactory;

impl ProcessorFactory for PassthroughFactory {
    fn create(&self, init: ProcessorInit) -> Result<Box<dyn StreamProcessor>, RecorderError> {
        Ok(Box::new(PassthroughProcessor::new(init)))
    }
}

/// Writes the raw stream to the record path without parsing it.
///
/// Metadata goes to a `<file>.meta.json` sidecar. Clipping and cutting need
/// tag-level parsing and are not supported.
pub struct PassthroughProcessor {
    init: ProcessorInit,
    metadata_hook: Option<MetadataHook>,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl PassthroughProcessor {
    pub fn new(init: ProcessorInit) -> Self {
        if init.cutting_mode != CuttingMode::Disabled {
            log::debug!(
                "[room {}] passthrough processor ignores cutting mode {:?}",
                init.room_id,
                init.cutting_mode
            );
        }
        Self {
            init,
            metadata_hook: None,
            writer: None,
            bytes_written: 0,
        }
    }

    async fn open(&mut self) -> Result<&mut BufWriter<File>, RecorderError> {
        if self.writer.is_none() {
            let path = (self.init.record_path)();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = File::create(&path).await?;
            if let Some(json) = self.sidecar_json()? {
                fs::write(sidecar_path(&path), json).await?;
            }
            log::info!("[room {}] writing recording to {:?}", self.init.room_id, path);
            self.init.path_commit.commit(path);
            self.writer = Some(BufWriter::new(file));
        }

        self.writer
            .as_mut()
            .ok_or_else(|| RecorderError::ProcessorError("output not open".to_string()))
    }

    /// Sidecar contents, or `None` when no metadata hook is installed
    fn sidecar_json(&self) -> Result<Option<Vec<u8>>, RecorderError> {
        let Some(hook) = self.metadata_hook.as_ref() else {
            return Ok(None);
        };

        let mut metadata = Map::new();
        hook(&mut metadata);
        serde_json::to_vec_pretty(&Value::Object(metadata))
            .map(Some)
            .map_err(|e| RecorderError::ProcessorError(e.to_string()))
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".meta.json");
    PathBuf::from(sidecar)
}

#[async_trait]
impl StreamProcessor for PassthroughProcessor {
    async fn add_bytes(&mut self, data: &[u8]) -> Result<(), RecorderError> {
        if self.init.enabled_feature == EnabledFeature::ClipOnly {
            return Ok(());
        }
        self.open().await?.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn set_metadata_hook(&mut self, hook: MetadataHook) {
        self.metadata_hook = Some(hook);
    }

    fn set_clip_options(&mut self, _options: ClipOptions) {}

    async fn clip(&mut self) -> Result<(), RecorderError> {
        log::warn!(
            "[room {}] clip requested but the passthrough processor cannot cut clips",
            self.init.room_id
        );
        Ok(())
    }

    fn total_max_timestamp(&self) -> i64 {
        0
    }

    async fn finalize(&mut self) -> Result<(), RecorderError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            log::info!(
                "[room {}] recording finalized ({} bytes)",
                self.init.room_id,
                self.bytes_written
            );
        }
        Ok(())
    }
}
