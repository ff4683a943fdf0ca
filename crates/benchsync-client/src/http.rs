//! HTTP backend over the `/api` routes. ureq is blocking, so every request
//! runs on the blocking pool.

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use benchsync_core::{
    HeartbeatResponse, LogEntry, ModuleKind, NewLogEntry, PresenceEntry, SessionKey, SyncError,
    Versioned, WriteRequest,
};

use crate::backend::SyncBackend;

pub const SESSION_KEY_HEADER: &str = "x-session-key";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpBackend {
    agent: ureq::Agent,
    base_url: String,
    session_key: SessionKey,
    actor_id: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, session_key: SessionKey) -> Self {
        Self {
            agent: build_agent(DEFAULT_TIMEOUT),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            session_key,
            actor_id: None,
        }
    }

    /// Send `x-actor-id`; without it the server uses the session key.
    pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe `/healthz`.
    pub async fn health(&self) -> Result<(), SyncError> {
        let _: Value = self
            .send(Method::Get, "/healthz".to_owned(), None, None)
            .await
            .map_err(|f| SyncError::StoreUnavailable(f.to_string()))?;
        Ok(())
    }

    /// Accepted writes for a module, newest first. Without a limit the
    /// server's default applies.
    pub async fn history(
        &self,
        kind: ModuleKind,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, SyncError> {
        self.send(
            Method::Get,
            format!("/api/state/{kind}/history"),
            limit.map(|limit| ("limit", limit.to_string())),
            None,
        )
        .await
        .map_err(state_error)
    }

    async fn send<T: DeserializeOwned + Send + 'static>(
        &self,
        method: Method,
        path: String,
        query: Option<(&'static str, String)>,
        body: Option<Value>,
    ) -> Result<T, Failure> {
        let agent = self.agent.clone();
        let url = format!("{}{path}", self.base_url);
        let session = self.session_key.as_str().to_owned();
        let actor = self.actor_id.clone();

        tokio::task::spawn_blocking(move || {
            let mut request = agent
                .request(method.as_str(), &url)
                .set(SESSION_KEY_HEADER, &session);
            if let Some(actor) = &actor {
                request = request.set(ACTOR_ID_HEADER, actor);
            }
            if let Some((name, value)) = &query {
                request = request.query(name, value);
            }

            let result = match body {
                Some(body) => request.send_json(body),
                None => request.call(),
            };
            match result {
                Ok(response) => response
                    .into_json::<T>()
                    .map_err(|e| Failure::Decode(e.to_string())),
                Err(ureq::Error::Status(code, response)) => Err(Failure::Status {
                    code,
                    body: response.into_string().unwrap_or_default(),
                }),
                Err(ureq::Error::Transport(transport)) => {
                    Err(Failure::Transport(transport.to_string()))
                }
            }
        })
        .await
        .map_err(|e| Failure::Transport(format!("request task failed: {e}")))?
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .timeout_write(timeout)
        .build()
}

impl SyncBackend for HttpBackend {
    async fn load_state(&self, kind: ModuleKind) -> Result<Option<Versioned<Value>>, SyncError> {
        self.send(Method::Get, format!("/api/state/{kind}"), None, None)
            .await
            .map_err(state_error)
    }

    async fn write_state(
        &self,
        kind: ModuleKind,
        request: WriteRequest<Value>,
    ) -> Result<Versioned<Value>, SyncError> {
        let body = json!({
            "state": request.state,
            "expectedVersion": request.expected_version,
        });
        self.send(Method::Put, format!("/api/state/{kind}"), None, Some(body))
            .await
            .map_err(state_error)
    }

    async fn heartbeat(&self, stage_slug: &str) -> Result<HeartbeatResponse, SyncError> {
        let body = json!({ "stageSlug": stage_slug });
        self.send(
            Method::Post,
            "/api/presence/heartbeat".to_owned(),
            None,
            Some(body),
        )
        .await
        .map_err(presence_error)
    }

    async fn list_peers(&self, stage_slug: &str) -> Result<Vec<PresenceEntry>, SyncError> {
        self.send(
            Method::Get,
            "/api/presence".to_owned(),
            Some(("stageSlug", stage_slug.to_owned())),
            None,
        )
        .await
        .map_err(presence_error)
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry, SyncError> {
        let body =
            serde_json::to_value(&entry).map_err(|e| SyncError::Validation(e.to_string()))?;
        self.send(Method::Post, "/api/log".to_owned(), None, Some(body))
            .await
            .map_err(store_error)
    }

    async fn fetch_log(&self) -> Result<Vec<LogEntry>, SyncError> {
        self.send(Method::Get, "/api/log".to_owned(), None, None)
            .await
            .map_err(store_error)
    }
}

// ─── Failure mapping ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Put,
    Post,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug)]
enum Failure {
    Status { code: u16, body: String },
    Transport(String),
    Decode(String),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { code, body } => match error_message(body) {
                Some(message) => write!(f, "http {code}: {message}"),
                None => write!(f, "http {code}"),
            },
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::Decode(detail) => write!(f, "unexpected response body: {detail}"),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    expected_version: u64,
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error)
}

fn validation_from(body: &str) -> SyncError {
    SyncError::Validation(error_message(body).unwrap_or_else(|| body.to_owned()))
}

fn state_error(failure: Failure) -> SyncError {
    match &failure {
        Failure::Status { code: 409, body } => match serde_json::from_str::<ConflictBody>(body) {
            Ok(conflict) => SyncError::Conflict {
                expected_version: conflict.expected_version,
            },
            Err(_) => SyncError::StoreUnavailable(failure.to_string()),
        },
        Failure::Status { code: 400, body } => validation_from(body),
        _ => SyncError::StoreUnavailable(failure.to_string()),
    }
}

fn presence_error(failure: Failure) -> SyncError {
    match &failure {
        Failure::Status { code: 400, body } => validation_from(body),
        _ => SyncError::Presence(failure.to_string()),
    }
}

fn store_error(failure: Failure) -> SyncError {
    match &failure {
        Failure::Status { code: 400, body } => validation_from(body),
        _ => SyncError::StoreUnavailable(failure.to_string()),
    }
}
