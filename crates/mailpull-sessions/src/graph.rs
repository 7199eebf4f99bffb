//! Mail REST API backend — `MailboxSession` over an Office-365-style HTTP API.
//!
//! Talks to `{api_base}/mailFolders/...` and `{api_base}/messages/...` with a
//! bearer token. Candidates are the API's opaque message ids. The API has no
//! expunge step: moves take effect immediately and `close` only drops the
//! HTTP client.

use std::collections::HashSet;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, error};

use mailpull_core::config::schema::GraphConfig;
use mailpull_core::utils::truncate_string;
use mailpull_core::{Candidate, MailboxSession, SessionError};

/// Longest error body carried into a `SessionError`.
const MAX_ERROR_BODY: usize = 512;

/// Most listing pages followed in one `list` call.
const MAX_PAGES: usize = 1000;

/// `$search` value matching `pattern` in the subject, as a quoted KQL term.
fn subject_search(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 10);
    out.push_str("\"subject:");
    for c in pattern.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

// ─────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────

/// One page of a message listing. Only ids are selected.
#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    value: Vec<MessageRef>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

// ─────────────────────────────────────────────
// GraphSession
// ─────────────────────────────────────────────

/// REST `MailboxSession`.
pub struct GraphSession {
    /// HTTP client, present between `connect` and `close`.
    client: Option<reqwest::Client>,
    /// API root (e.g. `"https://graph.microsoft.com/v1.0/me"`).
    api_base: String,
    /// OAuth2 bearer token.
    access_token: String,
    timeout: Duration,
}

impl std::fmt::Debug for GraphSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSession")
            .field("api_base", &self.api_base)
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl GraphSession {
    pub fn new(config: &GraphConfig) -> Self {
        Self {
            client: None,
            api_base: config.api_base.clone(),
            access_token: config.access_token.clone(),
            timeout: config.timeout(),
        }
    }

    fn client(&self) -> Result<&reqwest::Client, SessionError> {
        self.client.as_ref().ok_or(SessionError::NotConnected)
    }

    /// `api_base` with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, SessionError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| SessionError::backend(format!("invalid API base '{}': {}", self.api_base, e)))?;
        url.path_segments_mut()
            .map_err(|_| SessionError::backend(format!("invalid API base '{}'", self.api_base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Path of `url` relative to the API root, for error messages.
    fn rel_path(&self, url: &Url) -> String {
        let base = self.api_base.trim_end_matches('/');
        let full = url.as_str();
        full.strip_prefix(base).unwrap_or(full).to_string()
    }

    /// Send `req`; map transport failures and non-2xx statuses. A 404 becomes
    /// `missing`.
    async fn send(
        &self,
        req: RequestBuilder,
        method: &Method,
        path: &str,
        missing: SessionError,
    ) -> Result<Response, SessionError> {
        let response = req
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| self.transport_err(e, method, path))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            debug!(method = %method, path = %path, "resource not found");
            return Err(missing);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        error!(method = %method, path = %path, status = %status, body = %body, "API error");
        Err(SessionError::backend(format!(
            "{} {}: {} {}",
            method,
            path,
            status,
            truncate_string(body.trim(), MAX_ERROR_BODY)
        )))
    }

    fn transport_err(&self, e: reqwest::Error, method: &Method, path: &str) -> SessionError {
        if e.is_timeout() {
            SessionError::Timeout(self.timeout)
        } else {
            SessionError::backend(format!("{} {}: {}", method, path, e))
        }
    }
}

#[async_trait]
impl MailboxSession for GraphSession {
    fn describe(&self) -> String {
        self.api_base.clone()
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        if self.access_token.is_empty() {
            return Err(SessionError::backend("no access token configured"));
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| SessionError::backend(format!("HTTP client: {}", e)))?;
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self, _expunge: bool) -> Result<(), SessionError> {
        self.client = None;
        Ok(())
    }

    async fn list(
        &mut self,
        mailbox: &str,
        pattern: &str,
        include_seen: bool,
    ) -> Result<Vec<Candidate>, SessionError> {
        let client = self.client()?;

        let mut url = self.url(&["mailFolders", mailbox, "messages"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("$select", "id");
            if !include_seen {
                query.append_pair("$filter", "isRead eq false");
            }
            if !pattern.is_empty() {
                query.append_pair("$search", &subject_search(pattern));
            }
        }

        let mut ids = Vec::new();
        let mut seen_pages = HashSet::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let path = self.rel_path(&url);
            if !seen_pages.insert(url.as_str().to_string()) {
                return Err(SessionError::backend(format!("GET {}: listing page repeats", path)));
            }
            if seen_pages.len() > MAX_PAGES {
                return Err(SessionError::backend(format!(
                    "GET {}: listing exceeds {} pages",
                    path, MAX_PAGES
                )));
            }
            let response = self
                .send(
                    client.get(url),
                    &Method::GET,
                    &path,
                    SessionError::NoMailbox(mailbox.to_string()),
                )
                .await?;
            let page: MessagePage = response
                .json()
                .await
                .map_err(|e| SessionError::backend(format!("GET {}: invalid listing: {}", path, e)))?;

            ids.extend(page.value.into_iter().map(|m| Candidate::new(m.id)));
            if let Some(link) = page.next_link {
                let url = Url::parse(&link)
                    .map_err(|e| SessionError::backend(format!("invalid next link '{}': {}", link, e)))?;
                next = Some(url);
            }
        }

        debug!(mailbox = mailbox, count = ids.len(), "REST list");
        Ok(ids)
    }

    async fn read_body(
        &mut self,
        id: &Candidate,
        dst: &mut (dyn Write + Send),
    ) -> Result<u64, SessionError> {
        let client = self.client()?;
        let url = self.url(&["messages", id.as_str(), "$value"])?;
        let path = self.rel_path(&url);
        let mut response = self
            .send(client.get(url), &Method::GET, &path, SessionError::NotFound(id.clone()))
            .await?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.transport_err(e, &Method::GET, &path))?
        {
            dst.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    async fn mark(&mut self, id: &Candidate, seen: bool) -> Result<(), SessionError> {
        let client = self.client()?;
        let url = self.url(&["messages", id.as_str()])?;
        let path = self.rel_path(&url);
        let req = client
            .patch(url)
            .json(&serde_json::json!({ "isRead": seen }));
        self.send(req, &Method::PATCH, &path, SessionError::NotFound(id.clone()))
            .await?;
        Ok(())
    }

    async fn move_to(&mut self, id: &Candidate, dest_mailbox: &str) -> Result<(), SessionError> {
        let client = self.client()?;
        let url = self.url(&["messages", id.as_str(), "move"])?;
        let path = self.rel_path(&url);
        let req = client
            .post(url)
            .json(&serde_json::json!({ "destinationId": dest_mailbox }));
        self.send(req, &Method::POST, &path, SessionError::NotFound(id.clone()))
            .await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
