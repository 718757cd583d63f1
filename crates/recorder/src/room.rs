use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use live_stream::{MonitorEvent, PlayUrlResolver, RoomInfo, StreamMonitor, TriggerType};

use crate::path::{FileNameContext, PathResolver};
use crate::processor::{
    shared, ClipOptions, MetadataHook, PathCommit, PathSource, ProcessorFactory, ProcessorInit,
    SharedProcessor,
};
use crate::speed::SpeedSample;
use crate::state::{AttemptOutcome, AttemptState, AttemptStateCell, RoomSnapshot};
use crate::stream_loop::{LoopExit, StreamingLoop};
use crate::{
    EnabledFeature, RecorderConfig, RecorderError, RecorderEvent, RetryScheduler,
    StreamConnector,
};

/// Key of the vendor block added to every recording's metadata
pub const METADATA_KEY: &str = "LiveRecorder";

const EVENT_CAPACITY: usize = 256;

/// Handle to the running attempt, shared with stop requests
#[derive(Clone)]
struct AttemptHandle {
    id: u64,
    cancel: CancellationToken,
    force_close: CancellationToken,
    done: watch::Receiver<Option<AttemptOutcome>>,
}

impl AttemptHandle {
    fn new(id: u64) -> (Self, watch::Sender<Option<AttemptOutcome>>) {
        let (done_tx, done) = watch::channel(None);
        let handle = Self {
            id,
            cancel: CancellationToken::new(),
            force_close: CancellationToken::new(),
            done,
        };
        (handle, done_tx)
    }
}

/// Re-enables retries when a stop request finishes, on every exit path
struct RetryGuard<'a>(&'a AtomicBool);

impl Drop for RetryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Records one live room.
///
/// The session listens to its [`StreamMonitor`] and, whenever the room goes
/// live, runs a single download attempt: resolve the stream URL, connect,
/// and pump the body into a fresh processor until the stream ends. Only one
/// attempt exists at a time; stream-started notifications that arrive while
/// one is pending or running are dropped.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct RoomSession {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    config: RecorderConfig,
    monitor: Arc<dyn StreamMonitor>,
    resolver: Arc<dyn PlayUrlResolver>,
    processors: Arc<dyn ProcessorFactory>,
    connector: StreamConnector,
    paths: PathResolver,
    retry_scheduler: RetryScheduler,
    /// Latest room metadata from the monitor
    info: Arc<RwLock<RoomInfo>>,
    /// Attempt lifecycle token
    state: AttemptStateCell,
    /// Whether bytes are currently being written
    recording: AtomicBool,
    /// Whether a finished attempt asks the monitor for a recheck
    retry: AtomicBool,
    disposed: AtomicBool,
    /// Processor of the running attempt, shared with `clip()`
    processor: Mutex<Option<SharedProcessor>>,
    /// Running attempt; cleared together with the state token
    attempt: Mutex<Option<AttemptHandle>>,
    next_attempt_id: AtomicU64,
    speed: Mutex<SpeedSample>,
    /// Event sender for recorder events
    event_tx: broadcast::Sender<RecorderEvent>,
    /// Task forwarding monitor events into the session
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    pub fn new(
        room_id: u64,
        config: RecorderConfig,
        monitor: Arc<dyn StreamMonitor>,
        resolver: Arc<dyn PlayUrlResolver>,
        processors: Arc<dyn ProcessorFactory>,
    ) -> Result<Self, RecorderError> {
        let connector = StreamConnector::new(&config)?;
        let paths = PathResolver::new(&config.work_dir)?;
        let retry_scheduler = RetryScheduler::new(
            monitor.clone(),
            Duration::from_millis(config.stream_retry_ms),
        );
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(RoomInner {
            config,
            monitor,
            resolver,
            processors,
            connector,
            paths,
            retry_scheduler,
            info: Arc::new(RwLock::new(RoomInfo::new(room_id))),
            state: AttemptStateCell::new(),
            recording: AtomicBool::new(false),
            retry: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            processor: Mutex::new(None),
            attempt: Mutex::new(None),
            next_attempt_id: AtomicU64::new(1),
            speed: Mutex::new(SpeedSample::default()),
            event_tx,
            pump: Mutex::new(None),
        });

        let pump = spawn_event_pump(&inner);
        *inner.pump.lock() = Some(pump);
        inner.monitor.fetch_room_info();

        Ok(Self { inner })
    }

    /// Start monitoring the room
    pub fn start(&self) -> Result<bool, RecorderError> {
        self.inner.ensure_alive()?;
        let started = self.inner.monitor.start();
        self.inner.emit_snapshot();
        Ok(started)
    }

    /// Stop monitoring the room. A running recording is left alone.
    pub fn stop(&self) -> Result<(), RecorderError> {
        self.inner.ensure_alive()?;
        self.inner.monitor.stop();
        self.inner.monitor.set_recording(false);
        self.inner.emit_snapshot();
        Ok(())
    }

    pub fn refresh_room_info(&self) -> Result<(), RecorderError> {
        self.inner.ensure_alive()?;
        self.inner.monitor.fetch_room_info();
        Ok(())
    }

    /// Ask the monitor for an immediate liveness check. Recording starts
    /// when the monitor confirms the room is live.
    pub fn start_record(&self) -> Result<(), RecorderError> {
        self.inner.ensure_alive()?;
        self.inner.retry_scheduler.check_now(TriggerType::Manual);
        Ok(())
    }

    /// Stop the current recording without scheduling a retry
    pub async fn stop_record(&self) -> Result<(), RecorderError> {
        self.inner.ensure_alive()?;
        self.inner.stop_attempt().await;
        Ok(())
    }

    /// Save a clip around the current position; no-op when not recording
    pub async fn clip(&self) -> Result<(), RecorderError> {
        self.inner.ensure_alive()?;
        let processor = self.inner.processor.lock().clone();
        match processor {
            Some(processor) => processor.lock().await.clip().await,
            None => Ok(()),
        }
    }

    /// Stop monitoring and recording and release every resource.
    ///
    /// Repeated calls are no-ops. Afterwards every control operation fails
    /// with [`RecorderError::Disposed`].
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.monitor.stop();
        inner.monitor.set_recording(false);
        inner.stop_attempt().await;
        inner.release_processor().await;
        if let Some(pump) = inner.pump.lock().take() {
            pump.abort();
        }
        inner.emit_snapshot();
        log::info!("[room {}] session shut down", inner.room_id());
    }

    /// Wait for the current attempt, if any, to finish and be cleaned up
    pub async fn wait_for_attempt(&self) -> Option<AttemptOutcome> {
        let handle = self.inner.attempt.lock().clone();
        match handle {
            Some(handle) => wait_done(&mut handle.done.clone()).await,
            None => None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.inner.snapshot()
    }

    pub fn room_id(&self) -> u64 {
        self.inner.room_id()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

fn spawn_event_pump(inner: &Arc<RoomInner>) -> JoinHandle<()> {
    let mut events = inner.monitor.subscribe();
    let weak = Arc::downgrade(inner);

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.handle_monitor_event(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("monitor event pump lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn wait_done(done: &mut watch::Receiver<Option<AttemptOutcome>>) -> Option<AttemptOutcome> {
    match done.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone(),
        // Sender dropped: the supervisor is gone, nothing left to wait for
        Err(_) => None,
    }
}

impl RoomInner {
    fn ensure_alive(&self) -> Result<(), RecorderError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RecorderError::Disposed);
        }
        Ok(())
    }

    fn room_id(&self) -> u64 {
        self.info.read().room_id
    }

    fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    /// Ask the monitor for a delayed recheck unless the session is disposed.
    /// Without `always`, only while retries are enabled.
    fn schedule_recheck(&self, always: bool) {
        if self.disposed.load(Ordering::SeqCst) {
            log::debug!("[room {}] session disposed, no recheck", self.room_id());
            return;
        }
        if always || self.retry_enabled() {
            self.retry_scheduler.schedule_recheck();
        }
    }

    fn retry_suffix(&self) -> String {
        if self.retry_enabled() {
            format!(", will retry in {:?}", self.retry_scheduler.delay())
        } else {
            String::new()
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        let info = self.info.read().clone();
        let speed = *self.speed.lock();
        RoomSnapshot {
            room_id: info.room_id,
            short_room_id: info.short_room_id,
            streamer_name: info.user_name,
            title: info.title,
            is_monitoring: self.monitor.is_monitoring(),
            is_recording: self.recording.load(Ordering::SeqCst),
            attempt: self.state.get(),
            has_processor: self.processor.lock().is_some(),
            retry_enabled: self.retry_enabled(),
            download_speed_mbps: speed.mbps,
            download_percentage: speed.percentage,
        }
    }

    fn emit_snapshot(&self) {
        let _ = self.event_tx.send(RecorderEvent::StateChanged(self.snapshot()));
    }

    fn handle_monitor_event(self: &Arc<Self>, event: MonitorEvent) {
        match event {
            MonitorEvent::RoomInfoUpdated(info) => {
                log::debug!(
                    "[room {}] room info updated: {} / {}",
                    info.display_id(),
                    info.user_name,
                    info.title
                );
                self.monitor.set_streamer_name(&info.user_name);
                self.monitor.set_title(&info.title);
                *self.info.write() = info;
                self.emit_snapshot();
            }
            MonitorEvent::StreamStarted { trigger } => self.on_stream_started(trigger),
        }
    }

    fn on_stream_started(self: &Arc<Self>, trigger: TriggerType) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst);
        let (handle, done_tx) = AttemptHandle::new(id);
        let cancel = handle.cancel.clone();
        let force_close = handle.force_close.clone();
        {
            let mut slot = self.attempt.lock();
            if !self.state.transition(AttemptState::Idle, AttemptState::Starting) {
                log::debug!(
                    "[room {}] stream started ({:?}) but an attempt is already active",
                    self.room_id(),
                    trigger
                );
                return;
            }
            *slot = Some(handle);
        }

        // Shutdown may have raced past the first check
        if self.disposed.load(Ordering::SeqCst) {
            cancel.cancel();
        }

        log::debug!("[room {}] launching attempt #{} ({:?})", self.room_id(), id, trigger);
        self.emit_snapshot();

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let worker = tokio::spawn(Arc::clone(&inner).run_attempt(cancel, force_close));
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("[room {}] attempt task crashed: {}", inner.room_id(), e);
                    AttemptOutcome::Crashed(e.to_string())
                }
            };
            inner.finish_attempt(outcome, done_tx).await;
        });
    }

    async fn run_attempt(
        self: Arc<Self>,
        cancel: CancellationToken,
        force_close: CancellationToken,
    ) -> AttemptOutcome {
        let room_id = self.room_id();

        let connected = match self
            .connector
            .establish(self.resolver.as_ref(), room_id, &cancel)
            .await
        {
            Ok(connected) => connected,
            Err(e) => return self.start_failed(room_id, e),
        };

        if cancel.is_cancelled()
            || !self.state.transition(AttemptState::Starting, AttemptState::Streaming)
        {
            log::debug!("[room {}] stop requested while connecting", room_id);
            return AttemptOutcome::Cancelled;
        }
        self.monitor.set_stream_start_time(Local::now());

        let (path_commit, committed_path) = PathCommit::channel();
        let processor = match self.create_processor(room_id, path_commit) {
            Ok(processor) => processor,
            Err(e) => return self.start_failed(room_id, e),
        };
        *self.processor.lock() = Some(processor.clone());
        self.recording.store(true, Ordering::SeqCst);

        let host = connected.host();
        let _ = self.event_tx.send(RecorderEvent::AttemptConnected { room_id, host });
        self.emit_snapshot();

        let path_watch = self.spawn_path_watch(committed_path);
        let stall_guard = connected.stall_guard();
        let exit = StreamingLoop::new(connected.into_reader(), processor, cancel, force_close)
            .with_stall_guard(stall_guard)
            .run(|sample| self.record_speed(sample))
            .await;
        path_watch.abort();
        let _ = path_watch.await;

        self.recording.store(false, Ordering::SeqCst);
        self.monitor.set_recording(false);
        self.stream_finished(room_id, exit)
    }

    /// Disposition of a failure before the body was opened
    fn start_failed(&self, room_id: u64, error: RecorderError) -> AttemptOutcome {
        match error {
            RecorderError::Cancelled => {
                log::debug!("[room {}] connect aborted by stop request", room_id);
                AttemptOutcome::Cancelled
            }
            RecorderError::ConnectTimeout(what) => {
                log::warn!(
                    "[room {}] timed out connecting to the stream server ({})",
                    room_id,
                    what
                );
                self.schedule_recheck(true);
                AttemptOutcome::ConnectTimeout
            }
            RecorderError::HttpStatus { status, url } => {
                log::info!("[room {}] stream server returned {} for {}", room_id, status, url);
                self.schedule_recheck(true);
                AttemptOutcome::HttpStatus(status)
            }
            RecorderError::TooManyRedirects(limit) => {
                log::warn!(
                    "[room {}] stream server redirected more than {} times",
                    room_id,
                    limit
                );
                self.schedule_recheck(true);
                AttemptOutcome::TooManyRedirects
            }
            other => {
                log::warn!(
                    "[room {}] failed to start stream download: {}{}",
                    room_id,
                    other,
                    self.retry_suffix()
                );
                self.schedule_recheck(false);
                AttemptOutcome::StartFailed(other.to_string())
            }
        }
    }

    /// Disposition of a finished read loop
    fn stream_finished(&self, room_id: u64, exit: LoopExit) -> AttemptOutcome {
        let outcome = match exit {
            LoopExit::RemoteClosed => {
                log::info!(
                    "[room {}] server closed the stream, the broadcast may have ended{}",
                    room_id,
                    self.retry_suffix()
                );
                AttemptOutcome::RemoteClosed
            }
            LoopExit::StoppedLocally => {
                log::info!("[room {}] recording stopped locally{}", room_id, self.retry_suffix());
                AttemptOutcome::StoppedLocally
            }
            LoopExit::Cancelled => return AttemptOutcome::Cancelled,
            LoopExit::Failed(e) => {
                log::warn!("[room {}] recording failed: {}{}", room_id, e, self.retry_suffix());
                AttemptOutcome::StreamFailed(e.to_string())
            }
        };

        self.schedule_recheck(false);
        outcome
    }

    /// Release everything the attempt held and publish its outcome
    async fn finish_attempt(
        &self,
        outcome: AttemptOutcome,
        done_tx: watch::Sender<Option<AttemptOutcome>>,
    ) {
        self.release_processor().await;
        *self.speed.lock() = SpeedSample::default();
        self.recording.store(false, Ordering::SeqCst);
        self.monitor.set_recording(false);

        {
            let mut slot = self.attempt.lock();
            *slot = None;
            self.state.reset();
        }

        if outcome.is_expected_cancellation() {
            log::debug!("[room {}] attempt cancelled", self.room_id());
        } else {
            log::debug!("[room {}] attempt finished: {:?}", self.room_id(), outcome);
        }

        let _ = self.event_tx.send(RecorderEvent::AttemptFinished {
            room_id: self.room_id(),
            outcome: outcome.clone(),
        });
        self.emit_snapshot();
        let _ = done_tx.send(Some(outcome));
    }

    async fn release_processor(&self) {
        let processor = self.processor.lock().take();
        if let Some(processor) = processor {
            if let Err(e) = processor.lock().await.finalize().await {
                log::warn!("[room {}] failed to finalize recording: {}", self.room_id(), e);
            }
        }
    }

    fn record_speed(&self, sample: SpeedSample) {
        *self.speed.lock() = sample;
        self.emit_snapshot();
    }

    async fn stop_attempt(&self) {
        self.retry.store(false, Ordering::SeqCst);
        let _retry = RetryGuard(&self.retry);

        let handle = self.attempt.lock().clone();
        let Some(handle) = handle else {
            return;
        };
        if !self.request_stop(&handle) {
            return;
        }
        self.emit_snapshot();

        let mut done = handle.done.clone();
        let grace = Duration::from_millis(self.config.stop_grace_ms);
        if timeout(grace, wait_done(&mut done)).await.is_err() {
            log::warn!(
                "[room {}] stop timed out, force-closing the connection; check network stability",
                self.room_id()
            );
            handle.force_close.cancel();
            wait_done(&mut done).await;
        }
    }

    /// Flag `handle`'s attempt as stopping and cancel it. Returns false when
    /// that attempt is no longer the current one.
    fn request_stop(&self, handle: &AttemptHandle) -> bool {
        let slot = self.attempt.lock();
        if slot.as_ref().map(|current| current.id) != Some(handle.id) {
            return false;
        }
        self.state.begin_stop();
        handle.cancel.cancel();
        true
    }

    fn create_processor(
        &self,
        room_id: u64,
        path_commit: PathCommit,
    ) -> Result<SharedProcessor, RecorderError> {
        let init = ProcessorInit {
            room_id,
            record_path: self.path_source(self.config.record_filename_format.clone()),
            clip_path: self.path_source(self.config.clip_filename_format.clone()),
            enabled_feature: self.config.enabled_feature,
            cutting_mode: self.config.cutting_mode,
            path_commit,
        };

        let mut processor = self.processors.create(init)?;
        processor.set_clip_options(ClipOptions {
            length_past: self.config.clip_length_past,
            length_future: self.config.clip_length_future,
            cutting_number: self.config.cutting_number,
        });
        processor.set_metadata_hook(metadata_hook(self.info.clone()));

        Ok(shared(processor))
    }

    fn path_source(&self, template: String) -> PathSource {
        let paths = self.paths.clone();
        let info = self.info.clone();
        Arc::new(move || {
            let info = info.read();
            paths.resolve(
                &template,
                &FileNameContext {
                    room_id: info.room_id,
                    streamer_name: &info.user_name,
                    title: &info.title,
                },
            )
        })
    }

    /// Forward the committed output path to the monitor once the processor opens its file
    fn spawn_path_watch(&self, committed: oneshot::Receiver<PathBuf>) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let clip_only = self.config.enabled_feature == EnabledFeature::ClipOnly;

        tokio::spawn(async move {
            if clip_only {
                monitor.set_recording(false);
                return;
            }
            if let Ok(path) = committed.await {
                monitor.set_recording_path(path);
                monitor.set_recording(true);
            }
        })
    }
}

impl Drop for RoomInner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

fn metadata_hook(info: Arc<RwLock<RoomInfo>>) -> MetadataHook {
    Box::new(move |metadata: &mut Map<String, Value>| {
        let info = info.read();
        let mut block = Map::new();
        block.insert("starttime".to_string(), Value::from(Utc::now().to_rfc3339()));
        block.insert("version".to_string(), Value::from(crate::version_string()));
        block.insert("roomid".to_string(), Value::from(info.room_id.to_string()));
        block.insert("streamername".to_string(), Value::from(info.user_name.clone()));
        metadata.insert(METADATA_KEY.to_string(), Value::Object(block));
    })
}
