use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use tokio::time::timeout;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use live_stream::{PlayUrlResolver, PLATFORM_ORIGIN, USER_AGENT};

use crate::{RecorderConfig, RecorderError};

/// Response body exposed as an `AsyncRead`
pub type BodyReader =
    StreamReader<Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>, Bytes>;

/// A 200 response whose body has not been touched yet
#[derive(Debug)]
pub struct Connected {
    response: reqwest::Response,
    url: Url,
    redirects: usize,
    stall_guard: Option<Duration>,
}

impl Connected {
    /// URL that finally answered 200
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> String {
        self.url.host_str().unwrap_or_default().to_string()
    }

    /// Number of redirects followed to get here
    pub fn redirects(&self) -> usize {
        self.redirects
    }

    /// Per-read timeout to apply to the body, unless the server said it will close
    pub fn stall_guard(&self) -> Option<Duration> {
        self.stall_guard
    }

    pub fn into_reader(self) -> BodyReader {
        let body: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>> =
            Box::pin(self.response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)));
        StreamReader::new(body)
    }
}

/// Opens the FLV stream for a room, following redirects by hand so the
/// platform headers survive every hop.
#[derive(Clone)]
pub struct StreamConnector {
    client: reqwest::Client,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_redirects: usize,
}

impl StreamConnector {
    pub fn new(config: &RecorderConfig) -> Result<Self, RecorderError> {
        let connect_timeout = Duration::from_millis(config.stream_connect_timeout_ms);

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(header::REFERER, HeaderValue::from_static(PLATFORM_ORIGIN));
        headers.insert(header::ORIGIN, HeaderValue::from_static(PLATFORM_ORIGIN));

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(RecorderError::NetworkError)?;

        Ok(Self {
            client,
            connect_timeout,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            max_redirects: config.max_redirects,
        })
    }

    /// Resolve the room's stream URL and connect to it
    pub async fn establish(
        &self,
        resolver: &dyn PlayUrlResolver,
        room_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Connected, RecorderError> {
        let resolved = tokio::select! {
            _ = cancel.cancelled() => return Err(RecorderError::Cancelled),
            r = timeout(self.connect_timeout, resolver.resolve(room_id)) => r,
        };
        let url = resolved
            .map_err(|_| RecorderError::ConnectTimeout("resolving stream url".to_string()))??;

        self.connect(&url, room_id, cancel).await
    }

    /// GET `url`, unwrapping up to `max_redirects` 301/302 responses.
    ///
    /// Only headers are awaited; redirect bodies are dropped unread.
    pub async fn connect(
        &self,
        url: &str,
        room_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Connected, RecorderError> {
        let mut url = Url::parse(url)
            .map_err(|e| RecorderError::InvalidUrl(format!("{}: {}", url, e)))?;
        let mut redirects = 0;

        loop {
            log::info!(
                "[room {}] connecting to stream server {}",
                room_id,
                url.host_str().unwrap_or_default()
            );
            log::debug!("[room {}] stream url: {}", room_id, url);

            let request = self.client.get(url.clone()).send();
            let sent = tokio::select! {
                _ = cancel.cancelled() => return Err(RecorderError::Cancelled),
                r = timeout(self.connect_timeout, request) => r,
            };
            let response = sent
                .map_err(|_| {
                    RecorderError::ConnectTimeout(format!("waiting for headers from {}", url))
                })?
                .map_err(|e| {
                    if e.is_timeout() {
                        RecorderError::ConnectTimeout(e.to_string())
                    } else {
                        RecorderError::NetworkError(e)
                    }
                })?;

            match response.status() {
                StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
                    redirects += 1;
                    if redirects > self.max_redirects {
                        return Err(RecorderError::TooManyRedirects(self.max_redirects));
                    }
                    let next = redirect_target(&url, response.headers())?;
                    log::debug!(
                        "[room {}] redirected ({}) to {}",
                        room_id,
                        response.status(),
                        next
                    );
                    url = next;
                }
                StatusCode::OK => {
                    let stall_guard = if declares_close(response.headers()) {
                        None
                    } else {
                        Some(self.read_timeout)
                    };
                    return Ok(Connected {
                        response,
                        url,
                        redirects,
                        stall_guard,
                    });
                }
                status => {
                    return Err(RecorderError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
            }
        }
    }
}

fn redirect_target(current: &Url, headers: &HeaderMap) -> Result<Url, RecorderError> {
    let location = headers
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            RecorderError::RedirectError("redirect without a Location header".to_string())
        })?;

    current
        .join(location)
        .map_err(|e| RecorderError::RedirectError(format!("bad Location {:?}: {}", location, e)))
}

fn declares_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}
