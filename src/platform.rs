use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use reqwest::Method;
use serde_json::{Value, json};

use crate::error::PlatformError;

/// Visibility of a broadcast on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privacy {
    Public,
    Unlisted,
    Private,
}

impl Privacy {
    pub fn as_str(self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Unlisted => "unlisted",
            Privacy::Private => "private",
        }
    }
}

impl fmt::Display for Privacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Privacy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Privacy::Public),
            "unlisted" => Ok(Privacy::Unlisted),
            "private" => Ok(Privacy::Private),
            other => Err(format!(
                "expected public, unlisted or private, got '{}'",
                other
            )),
        }
    }
}

/// Whether the platform is receiving the encoder's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionStatus {
    /// Nothing is arriving yet.
    Inactive,
    /// Data is arriving and the stream can go live.
    Active,
    /// The platform rejected the incoming stream.
    Error,
}

/// A freshly created remote broadcast and where to send video for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastTicket {
    /// Broadcast identifier clients poll.
    pub id: String,
    /// Platform-side stream resource bound to the broadcast.
    pub stream_id: String,
    /// Full ingest URL including the stream key.
    pub ingest_address: String,
}

/// The remote broadcast platform's call surface.
///
/// Every call is privileged; implementations check authentication first and
/// fail with [`PlatformError::NotAuthenticated`] without touching the
/// network when no credentials are available.
pub trait BroadcastPlatform: Send + Sync {
    fn create_broadcast(
        &self,
        title: &str,
        privacy: Privacy,
    ) -> Result<BroadcastTicket, PlatformError>;

    fn ingestion_status(
        &self,
        ticket: &BroadcastTicket,
    ) -> Result<IngestionStatus, PlatformError>;

    fn transition_to_live(&self, id: &str) -> Result<(), PlatformError>;

    fn end_broadcast(&self, id: &str) -> Result<(), PlatformError>;

    fn get_privacy(&self, id: &str) -> Result<Privacy, PlatformError>;

    fn set_privacy(&self, id: &str, privacy: Privacy) -> Result<(), PlatformError>;
}

/// YouTube Live client using the YouTube Data API v3.
///
/// Token acquisition and refresh are handled elsewhere; this client only
/// attaches the bearer token it was given.
pub struct YouTubeClient {
    api_base: String,
    access_token: Option<String>,
    client: reqwest::blocking::Client,
}

impl YouTubeClient {
    pub const DEFAULT_API_BASE: &'static str = "https://www.googleapis.com/youtube/v3";

    pub fn new(access_token: Option<String>, timeout: Duration) -> Self {
        Self::with_api_base(Self::DEFAULT_API_BASE.to_string(), access_token, timeout)
    }

    pub fn with_api_base(
        api_base: String,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token,
            client,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    fn call(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value, PlatformError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or(PlatformError::NotAuthenticated)?;

        let mut request = self
            .client
            .request(method, format!("{}/{}", self.api_base, endpoint))
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .map_err(|e| PlatformError::Network(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        // Error pages from proxies are not JSON; only a success body must parse.
        let document: Value = match serde_json::from_str(&text) {
            Ok(document) => document,
            Err(e) if status.is_success() && !text.trim().is_empty() => {
                return Err(PlatformError::MalformedResponse(e.to_string()));
            }
            Err(_) => Value::Null,
        };

        if status.is_success() {
            debug!("YouTube {} -> HTTP {}", endpoint, status);
            return Ok(document);
        }

        let message = document["error"]["message"]
            .as_str()
            .unwrap_or("no error message")
            .to_string();
        let reason = document["error"]["errors"][0]["reason"]
            .as_str()
            .unwrap_or_default();

        Err(match (status.as_u16(), reason) {
            (401, _) => PlatformError::Authentication(message),
            (403, "quotaExceeded" | "rateLimitExceeded" | "userRateLimitExceeded") => {
                PlatformError::QuotaExceeded(message)
            }
            (code, _) => PlatformError::Api {
                endpoint: endpoint.to_string(),
                status: code,
                message,
            },
        })
    }

    fn transition(&self, id: &str, broadcast_status: &str) -> Result<(), PlatformError> {
        self.call(
            Method::POST,
            "liveBroadcasts/transition",
            &[
                ("broadcastStatus", broadcast_status),
                ("id", id),
                ("part", "status"),
            ],
            None,
        )?;
        Ok(())
    }
}

fn required_str<'a>(value: &'a Value, what: &str) -> Result<&'a str, PlatformError> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PlatformError::MalformedResponse(format!("missing {}", what)))
}

impl BroadcastPlatform for YouTubeClient {
    fn create_broadcast(
        &self,
        title: &str,
        privacy: Privacy,
    ) -> Result<BroadcastTicket, PlatformError> {
        let broadcast = self.call(
            Method::POST,
            "liveBroadcasts",
            &[("part", "snippet,status,contentDetails")],
            Some(json!({
                "snippet": {
                    "title": title,
                    "scheduledStartTime": Utc::now().to_rfc3339(),
                },
                "status": {
                    "privacyStatus": privacy.as_str(),
                    "selfDeclaredMadeForKids": false,
                },
                "contentDetails": {
                    "enableAutoStart": false,
                    "enableAutoStop": false,
                },
            })),
        )?;
        let id = required_str(&broadcast["id"], "broadcast id")?.to_string();

        let stream = self.call(
            Method::POST,
            "liveStreams",
            &[("part", "snippet,cdn,contentDetails")],
            Some(json!({
                "snippet": { "title": title },
                "cdn": {
                    "ingestionType": "rtmp",
                    "resolution": "variable",
                    "frameRate": "variable",
                },
            })),
        )?;
        let stream_id = required_str(&stream["id"], "stream id")?.to_string();
        let ingestion = &stream["cdn"]["ingestionInfo"];
        let address = required_str(&ingestion["ingestionAddress"], "ingestion address")?;
        let stream_name = required_str(&ingestion["streamName"], "stream name")?;

        self.call(
            Method::POST,
            "liveBroadcasts/bind",
            &[
                ("id", id.as_str()),
                ("part", "id,contentDetails"),
                ("streamId", stream_id.as_str()),
            ],
            None,
        )?;

        Ok(BroadcastTicket {
            id,
            stream_id,
            ingest_address: format!("{}/{}", address.trim_end_matches('/'), stream_name),
        })
    }

    fn ingestion_status(
        &self,
        ticket: &BroadcastTicket,
    ) -> Result<IngestionStatus, PlatformError> {
        let document = self.call(
            Method::GET,
            "liveStreams",
            &[("part", "status"), ("id", ticket.stream_id.as_str())],
            None,
        )?;

        Ok(
            match document["items"][0]["status"]["streamStatus"].as_str() {
                Some("active") => IngestionStatus::Active,
                Some("error") => IngestionStatus::Error,
                _ => IngestionStatus::Inactive,
            },
        )
    }

    fn transition_to_live(&self, id: &str) -> Result<(), PlatformError> {
        self.transition(id, "live")
    }

    fn end_broadcast(&self, id: &str) -> Result<(), PlatformError> {
        self.transition(id, "complete")
    }

    fn get_privacy(&self, id: &str) -> Result<Privacy, PlatformError> {
        let document = self.call(
            Method::GET,
            "videos",
            &[("part", "status"), ("id", id)],
            None,
        )?;

        required_str(&document["items"][0]["status"]["privacyStatus"], "privacy status")?
            .parse()
            .map_err(PlatformError::MalformedResponse)
    }

    fn set_privacy(&self, id: &str, privacy: Privacy) -> Result<(), PlatformError> {
        self.call(
            Method::PUT,
            "videos",
            &[("part", "status")],
            Some(json!({
                "id": id,
                "status": { "privacyStatus": privacy.as_str() },
            })),
        )?;
        Ok(())
    }
}
