//! HTTP/JSON remote store client.
//!
//! Wire contract:
//!
//! ```text
//! GET    {base}/programs?owner={user}        list owner's programs
//! GET    {base}/programs/{id}                fetch (404 = missing)
//! PUT    {base}/programs/{id}                create or replace
//! DELETE {base}/programs/{id}                soft delete
//! GET    {base}/sessions?owner={user}        list owner's sessions
//! GET    {base}/sessions?program={id}        list a program's sessions
//! ...    {base}/sessions/{id}                as for programs
//! POST   {base}/batch  {"writes": [...]}     atomic batch write
//! GET    {base}/health                       reachability
//! ```
//!
//! Requests carry `Authorization: Bearer <token>` when a token is configured.
//! Live watches are implemented by polling the owner query.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use liftlog_core::{Document, Program, Session, StorageError, StorageResult, UserId};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::config::MIN_TICK;
use crate::store::{DocumentStore, RemoteStore, Watch};

/// Errors raised while building an [`HttpRemote`].
#[derive(Debug, Error)]
pub enum HttpRemoteError {
    /// The base URL provided by configuration is invalid.
    #[error("invalid remote URL: {0}")]
    InvalidUrl(String),
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Connection settings for [`HttpRemote`].
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    /// Bearer token sent with every request.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Interval between polls of a watched query.
    pub poll_interval: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            token: None,
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    writes: &'a [Document],
}

/// Remote store reached over HTTP.
#[derive(Clone)]
pub struct HttpRemote {
    inner: Arc<InnerClient>,
}

struct InnerClient {
    http: Client,
    base: Url,
    token: Option<String>,
    poll_interval: Duration,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base", &self.inner.base.as_str())
            .field("authenticated", &self.inner.token.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    /// Create a client for the store rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpRemoteError::InvalidUrl`] if the URL is malformed or
    /// cannot carry a path, or [`HttpRemoteError::Client`] if the HTTP client
    /// fails to build.
    pub fn new(
        base_url: impl AsRef<str>,
        config: HttpRemoteConfig,
    ) -> Result<Self, HttpRemoteError> {
        let base = Url::parse(base_url.as_ref())
            .map_err(|e| HttpRemoteError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(HttpRemoteError::InvalidUrl(format!(
                "{base} cannot carry a path"
            )));
        }

        let http = Client::builder()
            .user_agent(concat!("liftlog-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(InnerClient {
                http,
                base,
                token: config.token,
                poll_interval: config.poll_interval,
            }),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> StorageResult<Url> {
        let mut url = self.inner.base.clone();
        url.path_segments_mut()
            .map_err(|()| StorageError::Rejected(format!("{} cannot carry a path", self.inner.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.inner.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> StorageResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url) -> StorageResult<Option<T>> {
        let response = self
            .authorize(self.inner.http.get(url))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        decode(response).await.map(Some)
    }

    async fn list<T: DeserializeOwned>(&self, url: Url) -> StorageResult<Vec<T>> {
        let response = self.send(self.inner.http.get(url)).await?;
        decode(response).await
    }

    async fn put<T: Serialize + Sync>(&self, url: Url, body: &T) -> StorageResult<()> {
        self.send(self.inner.http.put(url).json(body)).await?;
        Ok(())
    }

    async fn delete(&self, url: Url) -> StorageResult<()> {
        let response = self
            .authorize(self.inner.http.delete(url))
            .send()
            .await
            .map_err(transport_error)?;
        // Deleting a document that never existed is not an error.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    fn owner_query(&self, collection: &str, owner: &UserId) -> StorageResult<Url> {
        let mut url = self.endpoint(&[collection])?;
        url.query_pairs_mut().append_pair("owner", owner.as_str());
        Ok(url)
    }

    /// Poll `url` and forward each changed snapshot of non-deleted documents.
    fn spawn_poll<T, F>(&self, url: Url, is_deleted: F) -> Watch<T>
    where
        T: DeserializeOwned + PartialEq + Clone + Send + 'static,
        F: Fn(&T) -> bool + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let client = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.inner.poll_interval.max(MIN_TICK));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<Vec<T>> = None;

            loop {
                ticker.tick().await;
                match client.list::<T>(url.clone()).await {
                    Ok(mut snapshot) => {
                        snapshot.retain(|doc| !is_deleted(doc));
                        if last.as_ref() == Some(&snapshot) {
                            continue;
                        }
                        if tx.send(snapshot.clone()).await.is_err() {
                            break;
                        }
                        last = Some(snapshot);
                    }
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "Watch poll failed");
                    }
                }
            }
        });
        Watch::new(rx, task)
    }
}

fn transport_error(err: reqwest::Error) -> StorageError {
    StorageError::Unavailable(err.to_string())
}

/// Map non-success statuses: 5xx and 429 are transient, other 4xx are rejections.
async fn check_status(response: Response) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{status}: {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(StorageError::Unavailable(message))
    } else {
        Err(StorageError::Rejected(message))
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> StorageResult<T> {
    let bytes = response.bytes().await.map_err(transport_error)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl DocumentStore for HttpRemote {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn put_program(&self, program: &Program) -> StorageResult<()> {
        self.put(self.endpoint(&["programs", &program.id])?, program)
            .await
    }

    async fn get_program(&self, id: &str) -> StorageResult<Option<Program>> {
        self.fetch(self.endpoint(&["programs", id])?).await
    }

    async fn list_programs(&self) -> StorageResult<Vec<Program>> {
        self.list(self.endpoint(&["programs"])?).await
    }

    async fn delete_program(&self, id: &str) -> StorageResult<()> {
        self.delete(self.endpoint(&["programs", id])?).await
    }

    async fn put_session(&self, session: &Session) -> StorageResult<()> {
        self.put(self.endpoint(&["sessions", &session.id])?, session)
            .await
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        self.fetch(self.endpoint(&["sessions", id])?).await
    }

    async fn list_sessions(&self) -> StorageResult<Vec<Session>> {
        self.list(self.endpoint(&["sessions"])?).await
    }

    async fn list_sessions_by_program(&self, program_id: &str) -> StorageResult<Vec<Session>> {
        let mut url = self.endpoint(&["sessions"])?;
        url.query_pairs_mut().append_pair("program", program_id);
        self.list(url).await
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        self.delete(self.endpoint(&["sessions", id])?).await
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn list_programs_by_owner(&self, owner: &UserId) -> StorageResult<Vec<Program>> {
        self.list(self.owner_query("programs", owner)?).await
    }

    async fn list_sessions_by_owner(&self, owner: &UserId) -> StorageResult<Vec<Session>> {
        self.list(self.owner_query("sessions", owner)?).await
    }

    async fn watch_programs_by_owner(&self, owner: &UserId) -> StorageResult<Watch<Program>> {
        let url = self.owner_query("programs", owner)?;
        Ok(self.spawn_poll(url, |p: &Program| p.deleted))
    }

    async fn watch_sessions_by_owner(&self, owner: &UserId) -> StorageResult<Watch<Session>> {
        let url = self.owner_query("sessions", owner)?;
        Ok(self.spawn_poll(url, |s: &Session| s.deleted))
    }

    async fn commit(&self, writes: Vec<Document>) -> StorageResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(&["batch"])?;
        self.send(
            self.inner
                .http
                .post(url)
                .json(&BatchRequest { writes: &writes }),
        )
        .await?;
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        self.send(self.inner.http.get(self.endpoint(&["health"])?))
            .await?;
        Ok(())
    }
}
