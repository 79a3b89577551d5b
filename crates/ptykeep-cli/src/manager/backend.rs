//! Runtime backends behind the session manager.
//!
//! `Daemon` talks to the long-lived daemon over its socket; `Local`
//! wraps an in-process [`SessionRegistry`], used when no daemon can be
//! reached. Both expose the same operations and the same event stream
//! shape, so the manager above them is backend-agnostic. Sessions on the
//! local backend die with the process; that is the accepted cost of the
//! fallback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use ptykeep_core::error::ApiError;
use ptykeep_core::protocol::{Command, Response, ResponseData, SessionInfo, SessionSpec};

use crate::daemon::registry::AttachOutcome;
use crate::daemon::{ClientNotice, DaemonClient, SessionRegistry};

/// Where a workspace's sessions actually live.
pub enum RuntimeBackend {
    Daemon(DaemonClient),
    Local(LocalBackend),
}

impl RuntimeBackend {
    pub fn is_daemon(&self) -> bool {
        matches!(self, RuntimeBackend::Daemon(_))
    }

    /// Whether operations can currently reach the backend.
    pub fn is_connected(&self) -> bool {
        match self {
            RuntimeBackend::Daemon(client) => client.is_connected(),
            RuntimeBackend::Local(_) => true,
        }
    }

    pub async fn create_or_attach(&self, spec: &SessionSpec) -> Result<AttachOutcome, ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client
                    .request(Command::CreateOrAttach(spec.clone()))
                    .await?;
                match expect_success(response)? {
                    Some(ResponseData::Attached {
                        session_id,
                        is_new,
                        was_recovered,
                        scrollback,
                    }) => Ok(AttachOutcome {
                        session_id,
                        is_new,
                        was_recovered,
                        scrollback,
                    }),
                    other => Err(unexpected_payload("create_or_attach", other)),
                }
            }
            RuntimeBackend::Local(local) => local.registry.create_or_attach(spec).await,
        }
    }

    /// Subscribe to a session's events. Events flow on the backend's
    /// notice stream; the returned string is the scrollback snapshot
    /// taken atomically with the subscription.
    pub async fn subscribe(&self, session_id: &str) -> Result<String, ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client
                    .request(Command::Subscribe {
                        session_id: session_id.to_string(),
                    })
                    .await?;
                match expect_success(response)? {
                    Some(ResponseData::Subscribed { scrollback, .. }) => Ok(scrollback),
                    other => Err(unexpected_payload("subscribe", other)),
                }
            }
            RuntimeBackend::Local(local) => local.subscribe(session_id).await,
        }
    }

    pub async fn unsubscribe(&self, session_id: &str) -> Result<(), ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client
                    .request(Command::Unsubscribe {
                        session_id: session_id.to_string(),
                    })
                    .await?;
                expect_success(response)?;
                Ok(())
            }
            RuntimeBackend::Local(local) => {
                local.unsubscribe(session_id).await;
                Ok(())
            }
        }
    }

    pub async fn write(&self, session_id: &str, data: &str) -> Result<(), ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client
                    .request(Command::Write {
                        session_id: session_id.to_string(),
                        data: data.to_string(),
                    })
                    .await?;
                expect_success(response)?;
                Ok(())
            }
            RuntimeBackend::Local(local) => local.registry.write(session_id, data).await,
        }
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client
                    .request(Command::Resize {
                        session_id: session_id.to_string(),
                        cols,
                        rows,
                    })
                    .await?;
                expect_success(response)?;
                Ok(())
            }
            RuntimeBackend::Local(local) => local.registry.resize(session_id, cols, rows).await,
        }
    }

    pub async fn signal(&self, session_id: &str, signal: Option<&str>) -> Result<(), ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client
                    .request(Command::Signal {
                        session_id: session_id.to_string(),
                        signal: signal.map(|s| s.to_string()),
                    })
                    .await?;
                expect_success(response)?;
                Ok(())
            }
            RuntimeBackend::Local(local) => local.registry.signal(session_id, signal).await,
        }
    }

    pub async fn kill(&self, session_id: &str, delete_history: bool) -> Result<(), ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client
                    .request(Command::Kill {
                        session_id: session_id.to_string(),
                        delete_history,
                    })
                    .await?;
                expect_success(response)?;
                Ok(())
            }
            RuntimeBackend::Local(local) => {
                local.unsubscribe(session_id).await;
                local.registry.kill(session_id, delete_history).await
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<SessionInfo>, ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client.request(Command::List).await?;
                match expect_success(response)? {
                    Some(ResponseData::Sessions { sessions }) => Ok(sessions),
                    other => Err(unexpected_payload("list", other)),
                }
            }
            RuntimeBackend::Local(local) => Ok(local.registry.list().await),
        }
    }

    pub async fn kill_all(&self) -> Result<usize, ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client.request(Command::KillAll).await?;
                match expect_success(response)? {
                    Some(ResponseData::Killed { count }) => Ok(count),
                    other => Err(unexpected_payload("kill_all", other)),
                }
            }
            RuntimeBackend::Local(local) => Ok(local.registry.kill_all().await),
        }
    }

    pub async fn kill_for_workspace(&self, workspace_id: &str) -> Result<usize, ApiError> {
        match self {
            RuntimeBackend::Daemon(client) => {
                let response = client
                    .request(Command::KillForWorkspace {
                        workspace_id: workspace_id.to_string(),
                    })
                    .await?;
                match expect_success(response)? {
                    Some(ResponseData::Killed { count }) => Ok(count),
                    other => Err(unexpected_payload("kill_for_workspace", other)),
                }
            }
            RuntimeBackend::Local(local) => {
                Ok(local.registry.kill_for_workspace(workspace_id).await)
            }
        }
    }
}

fn expect_success(response: Response) -> Result<Option<ResponseData>, ApiError> {
    if response.success {
        Ok(response.data)
    } else {
        Err(response
            .error
            .unwrap_or_else(|| ApiError::internal("Daemon reported failure without an error")))
    }
}

fn unexpected_payload(operation: &str, data: Option<ResponseData>) -> ApiError {
    ApiError::internal(format!(
        "Unexpected daemon payload for {}: {:?}",
        operation, data
    ))
}

struct LocalTap {
    tap_id: u64,
    forwarder: JoinHandle<()>,
}

/// In-process registry presented through the backend interface.
///
/// Taps the registry per subscribed session and rewraps events as
/// [`ClientNotice`]s, so the manager consumes the same stream shape it
/// gets from a daemon connection.
pub struct LocalBackend {
    registry: Arc<SessionRegistry>,
    notice_tx: mpsc::UnboundedSender<ClientNotice>,
    taps: Mutex<HashMap<String, LocalTap>>,
}

impl LocalBackend {
    pub fn new(
        registry: Arc<SessionRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientNotice>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                notice_tx,
                taps: Mutex::new(HashMap::new()),
            },
            notice_rx,
        )
    }

    async fn subscribe(&self, session_id: &str) -> Result<String, ApiError> {
        // Replace any existing tap, matching the daemon's re-subscribe
        // behavior.
        self.unsubscribe(session_id).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (tap_id, snapshot) = self.registry.subscribe(session_id, tx).await?;

        let notice_tx = self.notice_tx.clone();
        let event_session = session_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let notice = ClientNotice::Event {
                    session_id: event_session.clone(),
                    event,
                };
                if notice_tx.send(notice).is_err() {
                    break;
                }
            }
        });

        let mut taps = self.taps.lock().unwrap_or_else(|e| e.into_inner());
        taps.insert(session_id.to_string(), LocalTap { tap_id, forwarder });
        Ok(snapshot)
    }

    async fn unsubscribe(&self, session_id: &str) {
        let tap = {
            let mut taps = self.taps.lock().unwrap_or_else(|e| e.into_inner());
            taps.remove(session_id)
        };
        if let Some(tap) = tap {
            self.registry.unsubscribe(session_id, tap.tap_id).await;
            tap.forwarder.abort();
            debug!("Removed local tap for session {}", session_id);
        }
    }
}
