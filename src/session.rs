//! Per-login Slack network client: owns the Web API token, the RTM
//! WebSocket, and the connection lifecycle state machine for one
//! `UserLogin` (one Matrix user x one Slack team x one Slack user).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock as SyncRwLock;
use reqwest::Client as HttpClient;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::db::ConnectionState;

const INITIAL_RECONNECT_SECONDS: u64 = 1;
const MAX_RECONNECT_SECONDS: u64 = 120;

/// What `rtm.connect` (or the boot call fronting it) reports about the
/// identity the token belongs to.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub team_id: String,
    pub user_id: String,
    pub team_domain: Option<String>,
    pub team_name: Option<String>,
}

/// A raw event pulled off the RTM socket, still Slack-shaped.
#[derive(Debug, Clone)]
pub struct RawRtmEvent {
    pub login_id: String,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("slack reported invalid auth")]
    InvalidAuth,
    #[error("boot identity mismatch: expected team={expected_team} user={expected_user}, got team={got_team} user={got_user}")]
    IdentityMismatch {
        expected_team: String,
        expected_user: String,
        got_team: String,
        got_user: String,
    },
    #[error("slack-rtm-error-{code}: {message}")]
    RtmError { code: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct SessionInner {
    login_id: String,
    expected_team_id: String,
    expected_user_id: String,
    token: String,
    cookie_token: Option<String>,
    http: HttpClient,
    state: SyncRwLock<ConnectionState>,
    socket_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// One live Slack session. Cheap to clone; the clones share the same
/// underlying task and state cell.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    events: mpsc::Sender<RawRtmEvent>,
}

impl Session {
    pub fn new(
        login_id: String,
        expected_team_id: String,
        expected_user_id: String,
        token: String,
        cookie_token: Option<String>,
        events: mpsc::Sender<RawRtmEvent>,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .user_agent("matrix-bridge-slack")
            .build()
            .context("failed to build per-login HTTP client")?;

        Ok(Self {
            inner: Arc::new(SessionInner {
                login_id,
                expected_team_id,
                expected_user_id,
                token,
                cookie_token,
                http,
                state: SyncRwLock::new(ConnectionState::Disconnected),
                socket_task: tokio::sync::Mutex::new(None),
            }),
            events,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.write() = state;
    }

    pub fn is_logged_in(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected)
    }

    /// Performs the boot call, validates identity, and starts the RTM
    /// read loop in a background task. Returns once the first Connected
    /// transition has been observed (or an error on boot failure).
    pub async fn connect(&self) -> Result<BootInfo, SessionError> {
        self.set_state(ConnectionState::Connecting);

        let boot = self.rtm_connect().await.map_err(|e| {
            self.set_state(ConnectionState::UnknownError);
            SessionError::Other(e)
        })?;

        if boot.team_id != self.inner.expected_team_id || boot.user_id != self.inner.expected_user_id {
            self.set_state(ConnectionState::UnknownError);
            return Err(SessionError::IdentityMismatch {
                expected_team: self.inner.expected_team_id.clone(),
                expected_user: self.inner.expected_user_id.clone(),
                got_team: boot.team_id,
                got_user: boot.user_id,
            });
        }

        let url = self
            .open_rtm_url()
            .await
            .map_err(SessionError::Other)?;

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.socket_loop(url).await;
        });
        *self.inner.socket_task.lock().await = Some(task);

        self.set_state(ConnectionState::Connected);
        info!(
            login_id = %self.inner.login_id,
            team = %boot.team_id,
            "slack session connected"
        );
        Ok(boot)
    }

    /// Idempotent: closes the socket task and clears connected state.
    pub async fn disconnect(&self) {
        if let Some(task) = self.inner.socket_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Best-effort remote sign-out; never blocks teardown on failure.
    pub async fn logout_remote(&self) {
        let result = self
            .inner
            .http
            .post("https://slack.com/api/auth.logout")
            .bearer_auth(&self.inner.token)
            .send()
            .await;
        if let Err(err) = result {
            warn!(login_id = %self.inner.login_id, "logout_remote call failed: {}", err);
        }
    }

    async fn rtm_connect(&self) -> Result<BootInfo> {
        let mut req = self
            .inner
            .http
            .post("https://slack.com/api/rtm.connect")
            .bearer_auth(&self.inner.token);
        if let Some(cookie) = &self.inner.cookie_token {
            req = req.header("Cookie", format!("d={}", cookie));
        }

        let body: Value = req
            .send()
            .await
            .context("rtm.connect request failed")?
            .json()
            .await
            .context("rtm.connect returned invalid JSON")?;

        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = body.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
            if error == "invalid_auth" || error == "user_removed_from_team" {
                return Err(anyhow!(SessionError::InvalidAuth));
            }
            return Err(anyhow!("rtm.connect failed: {}", error));
        }

        let team_id = body
            .pointer("/team/id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("rtm.connect response missing team.id"))?
            .to_string();
        let user_id = body
            .pointer("/self/id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("rtm.connect response missing self.id"))?
            .to_string();

        Ok(BootInfo {
            team_id,
            user_id,
            team_domain: body.pointer("/team/domain").and_then(Value::as_str).map(str::to_string),
            team_name: body.pointer("/team/name").and_then(Value::as_str).map(str::to_string),
        })
    }

    async fn open_rtm_url(&self) -> Result<String> {
        let mut req = self
            .inner
            .http
            .post("https://slack.com/api/rtm.connect")
            .bearer_auth(&self.inner.token);
        if let Some(cookie) = &self.inner.cookie_token {
            req = req.header("Cookie", format!("d={}", cookie));
        }
        let body: Value = req.send().await?.json().await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("rtm.connect response missing url"))
    }

    async fn socket_loop(&self, mut url: String) {
        let mut retry_seconds = INITIAL_RECONNECT_SECONDS;
        loop {
            match connect_async(&url).await {
                Ok((mut stream, _)) => {
                    retry_seconds = INITIAL_RECONNECT_SECONDS;
                    debug!(login_id = %self.inner.login_id, "rtm socket connected");

                    loop {
                        match stream.next().await {
                            Some(Ok(WsMessage::Text(text))) => {
                                if let Err(err) = self.handle_frame(&text).await {
                                    warn!(login_id = %self.inner.login_id, "rtm frame handling error: {}", err);
                                    if matches!(err.downcast_ref::<SessionError>(), Some(SessionError::InvalidAuth)) {
                                        self.set_state(ConnectionState::BadCredentials);
                                        return;
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Ping(payload))) => {
                                let _ = stream.send(WsMessage::Pong(payload)).await;
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(login_id = %self.inner.login_id, "rtm socket error: {}", err);
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(login_id = %self.inner.login_id, "failed to connect rtm socket: {}", err);
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            tokio::time::sleep(Duration::from_secs(retry_seconds)).await;
            retry_seconds = (retry_seconds * 2).min(MAX_RECONNECT_SECONDS);

            match self.open_rtm_url().await {
                Ok(fresh) => url = fresh,
                Err(err) => {
                    error!(login_id = %self.inner.login_id, "failed to re-open rtm url: {}", err);
                    continue;
                }
            }
            self.set_state(ConnectionState::Connected);
        }
    }

    async fn handle_frame(&self, text: &str) -> Result<()> {
        let payload: Value = serde_json::from_str(text).context("invalid rtm frame JSON")?;

        match payload.get("type").and_then(Value::as_str) {
            Some("error") => {
                let code = payload
                    .pointer("/error/code")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "0".to_string());
                let msg = payload
                    .pointer("/error/msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown rtm error")
                    .to_string();
                self.set_state(ConnectionState::UnknownError);
                return Err(SessionError::RtmError { code, message: msg }.into());
            }
            Some("goodbye") => {
                return Err(anyhow!("server requested reconnect"));
            }
            _ => {}
        }

        let event = RawRtmEvent {
            login_id: self.inner.login_id.clone(),
            payload,
        };
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("event pipeline channel closed"))?;
        Ok(())
    }
}

/// Seam the Event Pipeline and Resolver build on instead of talking to
/// `Session` directly, so their derivation logic can be tested against a
/// fake Slack.
#[async_trait]
pub trait SlackWebApi: Send + Sync {
    async fn call(&self, method: &str, body: Value) -> Result<Value>;
}

#[async_trait]
impl SlackWebApi for Session {
    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let mut req = self
            .inner
            .http
            .post(format!("https://slack.com/api/{}", method))
            .bearer_auth(&self.inner.token);
        if let Some(cookie) = &self.inner.cookie_token {
            req = req.header("Cookie", format!("d={}", cookie));
        }
        let resp: Value = req.json(&body).send().await?.json().await?;
        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = resp.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
            return Err(anyhow!("{} failed: {}", method, error));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let (tx, _rx) = mpsc::channel(8);
        Session::new(
            "T1-U1".to_string(),
            "T1".to_string(),
            "U1".to_string(),
            "xoxp-token".to_string(),
            None,
            tx,
        )
        .unwrap()
    }

    #[test]
    fn starts_disconnected() {
        let s = session();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert!(!s.is_logged_in());
    }

    #[test]
    fn is_logged_in_only_when_connected() {
        let s = session();
        s.set_state(ConnectionState::Connecting);
        assert!(!s.is_logged_in());
        s.set_state(ConnectionState::Connected);
        assert!(s.is_logged_in());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_with_no_task() {
        let s = session();
        s.disconnect().await;
        s.disconnect().await;
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }
}
