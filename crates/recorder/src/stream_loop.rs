use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::processor::SharedProcessor;
use crate::speed::{SpeedSample, SpeedTracker};
use crate::RecorderError;

/// Size of every body read
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Why the read loop stopped
#[derive(Debug)]
pub enum LoopExit {
    /// Zero-byte read without a stop request
    RemoteClosed,
    /// Stop request observed at a read boundary
    StoppedLocally,
    /// Read or write failed because the stream was force-closed after a stop request
    Cancelled,
    Failed(RecorderError),
}

/// Pumps a response body into the processor in fixed-size chunks
pub struct StreamingLoop<R> {
    reader: R,
    processor: SharedProcessor,
    cancel: CancellationToken,
    force_close: CancellationToken,
    stall_guard: Option<Duration>,
}

impl<R: AsyncRead + Unpin> StreamingLoop<R> {
    pub fn new(
        reader: R,
        processor: SharedProcessor,
        cancel: CancellationToken,
        force_close: CancellationToken,
    ) -> Self {
        Self {
            reader,
            processor,
            cancel,
            force_close,
            stall_guard: None,
        }
    }

    /// Fail a read that makes no progress for `limit`
    pub fn with_stall_guard(mut self, limit: Option<Duration>) -> Self {
        self.stall_guard = limit;
        self
    }

    /// Run until EOF, cancellation or error. `on_sample` receives throughput
    /// telemetry whenever the speed tracker emits.
    pub async fn run<F: FnMut(SpeedSample)>(self, mut on_sample: F) -> LoopExit {
        let StreamingLoop {
            mut reader,
            processor,
            cancel,
            force_close,
            stall_guard,
        } = self;

        let mut speed = SpeedTracker::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        let fail = |error: RecorderError| {
            if cancel.is_cancelled() {
                LoopExit::Cancelled
            } else {
                LoopExit::Failed(error)
            }
        };

        while !cancel.is_cancelled() {
            let read = tokio::select! {
                biased;
                _ = force_close.cancelled() => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "stream force-closed",
                )),
                r = read_chunk(&mut reader, &mut buffer, stall_guard) => r,
            };

            let bytes_read = match read {
                Ok(n) => n,
                Err(e) => return fail(e.into()),
            };

            let max_timestamp = processor.lock().await.total_max_timestamp();
            if let Some(sample) = speed.update(bytes_read, max_timestamp) {
                on_sample(sample);
            }

            if bytes_read == 0 {
                return if cancel.is_cancelled() {
                    LoopExit::StoppedLocally
                } else {
                    LoopExit::RemoteClosed
                };
            }

            if let Err(e) = processor.lock().await.add_bytes(&buffer[..bytes_read]).await {
                return fail(e);
            }
        }

        LoopExit::StoppedLocally
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut [u8],
    stall_guard: Option<Duration>,
) -> io::Result<usize> {
    match stall_guard {
        Some(limit) => timeout(limit, reader.read(buffer))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "stream read timed out"))?,
        None => reader.read(buffer).await,
    }
}
