use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{LiveStreamError, PLATFORM_ORIGIN, USER_AGENT};

const DEFAULT_API_BASE: &str = "https://api.live.bilibili.com";

/// Resolves a room id to a playable FLV stream URL
#[async_trait]
pub trait PlayUrlResolver: Send + Sync {
    async fn resolve(&self, room_id: u64) -> Result<String, LiveStreamError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<PlayUrlData>,
}

#[derive(Debug, Deserialize)]
struct PlayUrlData {
    #[serde(default)]
    durl: Vec<PlayUrlEntry>,
}

#[derive(Debug, Deserialize)]
struct PlayUrlEntry {
    url: String,
}

/// Play-URL resolver backed by the live platform's room API
pub struct BiliPlayUrlResolver {
    client: reqwest::Client,
    api_base: String,
}

impl BiliPlayUrlResolver {
    pub fn new(timeout: Duration) -> Result<Self, LiveStreamError> {
        Self::with_api_base(DEFAULT_API_BASE, timeout)
    }

    /// Point the resolver at a different API host
    pub fn with_api_base(api_base: &str, timeout: Duration) -> Result<Self, LiveStreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PlayUrlResolver for BiliPlayUrlResolver {
    async fn resolve(&self, room_id: u64) -> Result<String, LiveStreamError> {
        let url = format!("{}/room/v1/Room/playUrl", self.api_base);
        let body = self
            .client
            .get(&url)
            .query(&[
                ("cid", room_id.to_string()),
                ("quality", "4".to_string()),
                ("platform", "web".to_string()),
            ])
            .header(reqwest::header::REFERER, PLATFORM_ORIGIN)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let play_url = parse_play_url(&body)?;
        log::debug!("[room {}] resolved play url {}", room_id, play_url);
        Ok(play_url)
    }
}

/// Extract the first stream URL from a playUrl API response body
pub fn parse_play_url(body: &str) -> Result<String, LiveStreamError> {
    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| LiveStreamError::ParseError(format!("playUrl response: {}", e)))?;

    if response.code != 0 {
        return Err(LiveStreamError::ApiError {
            code: response.code,
            message: response.message,
        });
    }

    response
        .data
        .and_then(|data| data.durl.into_iter().next())
        .map(|entry| entry.url)
        .ok_or(LiveStreamError::StreamOffline)
}
