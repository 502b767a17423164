//! HTTP client for the shared notes service.
//!
//! # Responsibility
//! - Map `fetch_note` to `GET {base}/notes/{title}` and `store_note` to
//!   `PUT {base}/notes/{title}` with body `{version, content}`.
//! - Normalize the transported version into an integer ordering key.
//!
//! # Invariants
//! - Titles are percent-encoded as a single path segment.
//! - `404` is "not found remotely", not a failure.
//! - Timestamp versions map to epoch milliseconds; only relative order matters.

use crate::model::note::{Note, NoteVersion};
use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use log::{debug, warn};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remote store backed by the notes REST API.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct NotePayload {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    version: Option<WireVersion>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireVersion {
    Number(i64),
    Text(String),
}

#[derive(Debug, Serialize)]
struct StoreNoteBody<'a> {
    version: NoteVersion,
    content: &'a str,
}

impl HttpRemoteStore {
    /// Builds a client for `base_url` with a per-request `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> RemoteResult<Self> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|err| RemoteError::InvalidEndpoint(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidEndpoint(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RemoteError::Unavailable(format!("failed to build client: {err}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn note_url(&self, title: &str) -> RemoteResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteError::InvalidEndpoint(self.base_url.to_string()))?
            .pop_if_empty()
            .push("notes")
            .push(title);
        Ok(url)
    }

    fn transport_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_note(&self, title: &str) -> RemoteResult<Option<Note>> {
        let url = self.note_url(title)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("event=remote_fetch module=remote status=not_found");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RemoteError::Unavailable(format!("GET returned {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| self.transport_error(err))?;
        decode_note(title, &body).map(Some)
    }

    async fn store_note(&self, note: &Note) -> RemoteResult<()> {
        let url = self.note_url(&note.title)?;
        let body = StoreNoteBody {
            version: note.version,
            content: note.content.as_str(),
        };
        let response = self
            .client
            .put(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Unavailable(format!("PUT returned {status}")));
        }
        Ok(())
    }
}

/// Decodes a service payload, falling back to the requested title when the
/// payload omits it.
fn decode_note(requested_title: &str, body: &[u8]) -> RemoteResult<Note> {
    let payload: NotePayload =
        serde_json::from_slice(body).map_err(|err| RemoteError::Malformed(err.to_string()))?;

    let title = payload
        .title
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| requested_title.to_string());
    if title != requested_title {
        warn!("event=remote_fetch module=remote status=title_mismatch");
        return Err(RemoteError::Malformed(format!(
            "expected note `{requested_title}`, got `{title}`"
        )));
    }

    let version = match (payload.version, payload.updated_at) {
        (Some(version), _) => normalize_version(version)?,
        (None, Some(updated_at)) => parse_timestamp(&updated_at)?,
        (None, None) => 0,
    };

    Ok(Note::with_version(
        title,
        payload.content.unwrap_or_default(),
        version,
    ))
}

fn normalize_version(version: WireVersion) -> RemoteResult<NoteVersion> {
    match version {
        WireVersion::Number(value) => Ok(clamp_non_negative(value)),
        WireVersion::Text(text) => match text.trim().parse::<i64>() {
            Ok(value) => Ok(clamp_non_negative(value)),
            Err(_) => parse_timestamp(&text),
        },
    }
}

fn parse_timestamp(text: &str) -> RemoteResult<NoteVersion> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(clamp_non_negative(parsed.timestamp_millis()));
    }
    // Zone-less timestamps are read as UTC.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|parsed| clamp_non_negative(parsed.and_utc().timestamp_millis()))
        .map_err(|err| RemoteError::Malformed(format!("unrecognized version `{text}`: {err}")))
}

fn clamp_non_negative(value: i64) -> NoteVersion {
    NoteVersion::try_from(value).unwrap_or(0)
}
