//! Application-side session management.
//!
//! The [`SessionManager`] is the embedder's single entry point. Each
//! workspace is bound once to a runtime backend: the daemon when it can
//! be reached (sessions survive an application restart), otherwise an
//! in-process registry with identical semantics. Session events from
//! either backend funnel through one [`EventBus`], which fans them out
//! to any number of subscribers per session.
//!
//! When a daemon connection drops, affected sessions move to the
//! `Disconnected` state and subscribers get a `Disconnect` event; a
//! background loop then reconnects, re-subscribes the sessions that
//! survived and reports the ones that vanished as exited. Neither
//! disconnection nor exit ends a subscription.

pub mod backend;
pub mod bus;
pub mod dispatch;
pub mod workspace;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use ptykeep_core::error::ApiError;
use ptykeep_core::protocol::{SessionEvent, SessionInfo, SessionSpec};

use crate::daemon::{AttachOutcome, ClientNotice, DaemonClient, RegistryConfig, SessionRegistry};

use backend::{LocalBackend, RuntimeBackend};
pub use bus::{EventBus, Subscription};
pub use workspace::{NullResolver, StaticResolver, WorkspaceContext, WorkspaceResolver};

/// Fixed interval between reconnection attempts after a daemon drop.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Client-visible lifecycle of a managed session.
///
/// `Disconnected` means the daemon link is down while the process may
/// well still be running; it resolves to `Running` or `Exited` on
/// reconnect. `Killed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSessionState {
    Starting,
    Running,
    Disconnected,
    Exited { exit_code: Option<i32> },
    Killed,
}

/// Parameters for creating or attaching to a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session_id: String,
    pub workspace_id: String,
    pub tab_id: String,
    /// When `None`, the workspace resolver is consulted.
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    /// Empty means the default shell.
    pub command: Vec<String>,
}

/// Snapshot of one managed session's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub session_id: String,
    pub workspace_id: String,
    pub tab_id: String,
    pub state: ClientSessionState,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<String>,
}

struct ManagedSession {
    spec: SessionSpec,
    state: ClientSessionState,
}

struct ManagerInner {
    /// Backend chosen once per workspace and reused for all its sessions.
    bindings: Mutex<HashMap<String, Arc<RuntimeBackend>>>,
    sessions: Mutex<HashMap<String, ManagedSession>>,
    bus: Arc<EventBus>,
    resolver: Box<dyn WorkspaceResolver>,
    /// Shared registry behind every local-fallback binding, so bulk
    /// operations see all locally spawned sessions.
    local_registry: Mutex<Option<Arc<SessionRegistry>>>,
    force_local: bool,
}

/// Facade over daemon-backed and in-process terminal sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_resolver(Box::new(NullResolver))
    }

    pub fn with_resolver(resolver: Box<dyn WorkspaceResolver>) -> Self {
        Self::build(resolver, false)
    }

    /// A manager that never contacts a daemon. Sessions live and die
    /// with this process.
    pub fn local_only(resolver: Box<dyn WorkspaceResolver>) -> Self {
        Self::build(resolver, true)
    }

    fn build(resolver: Box<dyn WorkspaceResolver>, force_local: bool) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                bindings: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                bus: Arc::new(EventBus::new()),
                resolver,
                local_registry: Mutex::new(None),
                force_local,
            }),
        }
    }

    /// Attach to a live session or spawn a process under this id.
    ///
    /// On success the manager holds the single upstream subscription for
    /// the session and the event bus channel is seeded with its
    /// scrollback; call [`stream`](Self::stream) to start consuming.
    pub async fn create_or_attach(
        &self,
        request: SessionRequest,
    ) -> Result<AttachOutcome, ApiError> {
        let cwd = match request.cwd {
            Some(cwd) => Some(cwd),
            None => self.inner.resolver.resolve(&request.workspace_id).cwd,
        };
        let spec = SessionSpec {
            session_id: request.session_id.clone(),
            workspace_id: request.workspace_id.clone(),
            tab_id: request.tab_id,
            cwd,
            cols: request.cols,
            rows: request.rows,
            command: request.command,
        };

        let backend = self.inner.binding_for(&request.workspace_id).await;

        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.insert(
                spec.session_id.clone(),
                ManagedSession {
                    spec: spec.clone(),
                    state: ClientSessionState::Starting,
                },
            );
        }

        // Channel first: events racing ahead of the seed accumulate in
        // the replay instead of being dropped.
        self.inner.bus.open_channel(&spec.session_id);

        let attach = async {
            let outcome = backend.create_or_attach(&spec).await?;
            let snapshot = backend.subscribe(&spec.session_id).await?;
            Ok::<_, ApiError>((outcome, snapshot))
        }
        .await;

        match attach {
            Ok((outcome, snapshot)) => {
                self.inner.bus.seed(&spec.session_id, &snapshot);
                let mut sessions = self.inner.sessions.lock().await;
                if let Some(session) = sessions.get_mut(&spec.session_id) {
                    session.state = ClientSessionState::Running;
                }
                Ok(outcome)
            }
            Err(e) => {
                let mut sessions = self.inner.sessions.lock().await;
                sessions.remove(&spec.session_id);
                drop(sessions);
                self.inner.bus.remove_channel(&spec.session_id);
                Err(e)
            }
        }
    }

    /// Subscribe to a session's output: the scrollback snapshot plus a
    /// live event stream starting exactly after it.
    pub async fn stream(
        &self,
        session_id: &str,
    ) -> Result<(String, Subscription), ApiError> {
        {
            let sessions = self.inner.sessions.lock().await;
            if !sessions.contains_key(session_id) {
                return Err(ApiError::session_not_found(session_id));
            }
        }
        self.inner
            .bus
            .subscribe(session_id)
            .ok_or_else(|| ApiError::session_not_found(session_id))
    }

    pub async fn write(&self, session_id: &str, data: &str) -> Result<(), ApiError> {
        let backend = self.backend_for_session(session_id).await?;
        backend.write(session_id, data).await
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ApiError> {
        let backend = self.backend_for_session(session_id).await?;
        backend.resize(session_id, cols, rows).await?;
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.spec.cols = cols;
            session.spec.rows = rows;
        }
        Ok(())
    }

    pub async fn signal(&self, session_id: &str, signal: Option<&str>) -> Result<(), ApiError> {
        let backend = self.backend_for_session(session_id).await?;
        backend.signal(session_id, signal).await
    }

    /// Terminate the session's process and forget the session. Ends
    /// subscriber streams once their backlog drains.
    pub async fn kill(&self, session_id: &str, delete_history: bool) -> Result<(), ApiError> {
        let backend = self.backend_for_session(session_id).await?;
        backend.kill(session_id, delete_history).await?;
        let mut sessions = self.inner.sessions.lock().await;
        sessions.remove(session_id);
        drop(sessions);
        self.inner.bus.remove_channel(session_id);
        Ok(())
    }

    /// Stop tracking a session without touching its process. The daemon
    /// keeps running it; a later create-or-attach picks it back up.
    pub async fn detach(&self, session_id: &str) -> Result<(), ApiError> {
        let backend = self.backend_for_session(session_id).await?;
        if let Err(e) = backend.unsubscribe(session_id).await {
            debug!("Unsubscribe during detach failed: {}", e);
        }
        let mut sessions = self.inner.sessions.lock().await;
        sessions.remove(session_id);
        drop(sessions);
        self.inner.bus.remove_channel(session_id);
        info!("Detached from session {}", session_id);
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionView> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(session_id).map(|session| SessionView {
            session_id: session_id.to_string(),
            workspace_id: session.spec.workspace_id.clone(),
            tab_id: session.spec.tab_id.clone(),
            state: session.state,
            cols: session.spec.cols,
            rows: session.spec.rows,
            cwd: session.spec.cwd.clone(),
        })
    }

    /// Whether the workspace's sessions are held by a daemon rather
    /// than this process.
    pub async fn workspace_uses_daemon(&self, workspace_id: &str) -> bool {
        let bindings = self.inner.bindings.lock().await;
        bindings
            .get(workspace_id)
            .map(|b| b.is_daemon())
            .unwrap_or(false)
    }

    /// All sessions registered on the workspace's backend, including
    /// ones created by other clients.
    pub async fn list_daemon_sessions(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<SessionInfo>, ApiError> {
        let backend = self.inner.binding_for(workspace_id).await;
        backend.list().await
    }

    /// Kill every session on the workspace's backend, whichever
    /// workspace they belong to. Returns the count killed.
    pub async fn kill_all_daemon_sessions(&self, workspace_id: &str) -> Result<usize, ApiError> {
        let backend = self.inner.binding_for(workspace_id).await;
        let count = backend.kill_all().await?;
        self.forget_sessions_on(&backend).await;
        Ok(count)
    }

    /// Kill the workspace's sessions on its backend.
    pub async fn kill_daemon_sessions_for_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<usize, ApiError> {
        let backend = self.inner.binding_for(workspace_id).await;
        let count = backend.kill_for_workspace(workspace_id).await?;
        let removed: Vec<String> = {
            let mut sessions = self.inner.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.spec.workspace_id == workspace_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                sessions.remove(id);
            }
            ids
        };
        for id in removed {
            self.inner.bus.remove_channel(&id);
        }
        Ok(count)
    }

    async fn backend_for_session(
        &self,
        session_id: &str,
    ) -> Result<Arc<RuntimeBackend>, ApiError> {
        let workspace_id = {
            let sessions = self.inner.sessions.lock().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| ApiError::session_not_found(session_id))?;
            session.spec.workspace_id.clone()
        };
        Ok(self.inner.binding_for(&workspace_id).await)
    }

    /// Drop every managed session bound to this backend after a bulk
    /// kill.
    async fn forget_sessions_on(&self, backend: &Arc<RuntimeBackend>) {
        let bindings = self.inner.bindings.lock().await;
        let workspaces: Vec<String> = bindings
            .iter()
            .filter(|(_, b)| Arc::ptr_eq(b, backend))
            .map(|(ws, _)| ws.clone())
            .collect();
        drop(bindings);

        let removed: Vec<String> = {
            let mut sessions = self.inner.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| workspaces.contains(&s.spec.workspace_id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                sessions.remove(id);
            }
            ids
        };
        for id in removed {
            self.inner.bus.remove_channel(&id);
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerInner {
    /// Get or create the workspace's backend binding.
    async fn binding_for(self: &Arc<Self>, workspace_id: &str) -> Arc<RuntimeBackend> {
        {
            let bindings = self.bindings.lock().await;
            if let Some(backend) = bindings.get(workspace_id) {
                return backend.clone();
            }
        }

        // Connect without holding the bindings lock: auto-starting a
        // daemon can take seconds, and sessions on already-bound
        // workspaces must keep working meanwhile.
        let (backend, notice_rx) = if self.force_local {
            self.local_binding().await
        } else {
            match DaemonClient::connect().await {
                Ok((client, rx)) => {
                    info!("Workspace {} bound to daemon backend", workspace_id);
                    (RuntimeBackend::Daemon(client), rx)
                }
                Err(e) => {
                    warn!(
                        "Daemon unavailable for workspace {} ({}); falling back to local sessions",
                        workspace_id, e
                    );
                    self.local_binding().await
                }
            }
        };

        let backend = Arc::new(backend);
        let mut bindings = self.bindings.lock().await;
        if let Some(existing) = bindings.get(workspace_id) {
            // Another caller bound the workspace while we were
            // connecting; keep theirs.
            if let RuntimeBackend::Daemon(client) = backend.as_ref() {
                client.dispose();
            }
            return existing.clone();
        }
        bindings.insert(workspace_id.to_string(), backend.clone());
        spawn_notice_pump(Arc::downgrade(self), workspace_id.to_string(), notice_rx);
        backend
    }

    async fn local_binding(
        &self,
    ) -> (RuntimeBackend, mpsc::UnboundedReceiver<ClientNotice>) {
        let registry = {
            let mut local = self.local_registry.lock().await;
            local
                .get_or_insert_with(|| {
                    let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
                    registry.spawn_cleaner();
                    registry
                })
                .clone()
        };
        let (local, rx) = LocalBackend::new(registry);
        (RuntimeBackend::Local(local), rx)
    }

    /// Apply one pushed event to the state machine, then fan it out.
    async fn handle_event(&self, session_id: &str, event: SessionEvent) {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(session_id) {
                match &event {
                    SessionEvent::Data { .. } => {
                        if matches!(
                            session.state,
                            ClientSessionState::Starting | ClientSessionState::Disconnected
                        ) {
                            session.state = ClientSessionState::Running;
                        }
                    }
                    SessionEvent::Exit { exit_code, .. } => {
                        session.state = ClientSessionState::Exited {
                            exit_code: *exit_code,
                        };
                    }
                    SessionEvent::Disconnect { .. } | SessionEvent::Error { .. } => {}
                }
            }
        }
        self.bus.emit(session_id, event);
    }

    /// Mark the workspace's live sessions disconnected and tell their
    /// subscribers. The sessions themselves keep running in the daemon.
    async fn handle_disconnect(&self, workspace_id: &str, reason: &str) {
        warn!(
            "Daemon connection for workspace {} lost: {}",
            workspace_id, reason
        );
        let affected: Vec<String> = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .iter_mut()
                .filter(|(_, s)| {
                    s.spec.workspace_id == workspace_id
                        && matches!(
                            s.state,
                            ClientSessionState::Starting | ClientSessionState::Running
                        )
                })
                .map(|(id, s)| {
                    s.state = ClientSessionState::Disconnected;
                    id.clone()
                })
                .collect()
        };
        for id in affected {
            self.bus.emit(
                &id,
                SessionEvent::Disconnect {
                    reason: reason.to_string(),
                },
            );
        }
    }

    /// Reconnect the workspace to a daemon, retrying at a fixed
    /// interval. Returns the new notice stream, or `None` if the manager
    /// went away.
    async fn reconnect(
        self: &Arc<Self>,
        workspace_id: &str,
    ) -> Option<mpsc::UnboundedReceiver<ClientNotice>> {
        loop {
            tokio::time::sleep(RECONNECT_INTERVAL).await;

            let (client, notice_rx) = match DaemonClient::connect().await {
                Ok(connected) => connected,
                Err(e) => {
                    debug!("Reconnect attempt for {} failed: {}", workspace_id, e);
                    continue;
                }
            };
            info!("Reconnected workspace {} to daemon", workspace_id);

            let backend = Arc::new(RuntimeBackend::Daemon(client));
            {
                let mut bindings = self.bindings.lock().await;
                bindings.insert(workspace_id.to_string(), backend.clone());
            }

            self.resync_after_reconnect(workspace_id, &backend).await;
            return Some(notice_rx);
        }
    }

    /// Re-subscribe the workspace's disconnected sessions on the fresh
    /// connection; report sessions the daemon no longer knows as exited.
    ///
    /// Output produced during the disconnect window is carried by the
    /// reseeded snapshot: subscribers attaching after the reconnect see
    /// it, while subscribers that stayed attached resume with live
    /// events only. The bus keeps no per-subscriber delivery cursor, so
    /// the missed window is not replayed to them.
    async fn resync_after_reconnect(&self, workspace_id: &str, backend: &RuntimeBackend) {
        let listed: HashMap<String, SessionInfo> = match backend.list().await {
            Ok(sessions) => sessions
                .into_iter()
                .map(|info| (info.session_id.clone(), info))
                .collect(),
            Err(e) => {
                warn!("Listing sessions after reconnect failed: {}", e);
                HashMap::new()
            }
        };

        let candidates: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, s)| {
                    s.spec.workspace_id == workspace_id
                        && s.state == ClientSessionState::Disconnected
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for session_id in candidates {
            let survived = listed
                .get(&session_id)
                .map(|info| info.is_alive)
                .unwrap_or(false);

            if survived {
                self.bus.open_channel(&session_id);
                match backend.subscribe(&session_id).await {
                    Ok(snapshot) => {
                        self.bus.seed(&session_id, &snapshot);
                        let mut sessions = self.sessions.lock().await;
                        if let Some(session) = sessions.get_mut(&session_id) {
                            session.state = ClientSessionState::Running;
                        }
                        debug!("Re-subscribed session {} after reconnect", session_id);
                        continue;
                    }
                    Err(e) => {
                        warn!("Re-subscribe of {} failed: {}", session_id, e);
                    }
                }
            }

            {
                let mut sessions = self.sessions.lock().await;
                if let Some(session) = sessions.get_mut(&session_id) {
                    session.state = ClientSessionState::Exited { exit_code: None };
                }
            }
            self.bus.emit(
                &session_id,
                SessionEvent::Exit {
                    exit_code: None,
                    signal: None,
                },
            );
        }
    }
}

/// Drive one binding's notice stream into the manager.
///
/// Holds only a weak reference so a dropped manager ends the task. For
/// daemon bindings the task survives disconnects: it reconnects and
/// continues with the fresh stream.
fn spawn_notice_pump(
    inner: Weak<ManagerInner>,
    workspace_id: String,
    mut notice_rx: mpsc::UnboundedReceiver<ClientNotice>,
) {
    tokio::spawn(async move {
        loop {
            let mut disconnect_reason: Option<String> = None;

            while let Some(notice) = notice_rx.recv().await {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match notice {
                    ClientNotice::Event { session_id, event } => {
                        inner.handle_event(&session_id, event).await;
                    }
                    ClientNotice::Disconnected { reason } => {
                        inner.handle_disconnect(&workspace_id, &reason).await;
                        disconnect_reason = Some(reason);
                        break;
                    }
                }
            }

            let Some(inner) = inner.upgrade() else {
                return;
            };
            if disconnect_reason.is_none() {
                // Stream closed without a disconnect: local binding (or
                // the client was disposed). Nothing to resume.
                debug!("Notice stream for workspace {} ended", workspace_id);
                return;
            }

            match inner.reconnect(&workspace_id).await {
                Some(rx) => notice_rx = rx,
                None => return,
            }
        }
    });
}
