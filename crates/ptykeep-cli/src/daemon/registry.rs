//! Session registry: the daemon-owned map from stable session ids to
//! live PTY processes, scrollback, and metadata.
//!
//! A session id names the logical terminal, not the OS process. The
//! process behind it may exit and be respawned by an explicit
//! create-or-attach; the id and its scrollback persist across that.
//! Exited sessions stay registered as reattachable epitaphs until an
//! explicit kill, unless [`RegistryConfig::evict_exited_after`] is set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use ptykeep_core::error::ApiError;
use ptykeep_core::protocol::{ProcessState, SessionEvent, SessionInfo, SessionSpec};
use ptykeep_core::scrollback::{ScrollbackBuffer, DEFAULT_MAX_BYTES};

use crate::daemon::pty::{signal_by_name, AsyncPtyHandle, PtyProcess, TermSize};

/// Registry behavior knobs with documented defaults.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Hard cap on concurrently registered sessions.
    pub max_sessions: usize,
    /// Scrollback retention per session, in bytes.
    pub max_scrollback_bytes: usize,
    /// When set, exited sessions are evicted this long after exit.
    /// When `None` (the default) they remain until explicit kill.
    pub evict_exited_after: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            max_scrollback_bytes: DEFAULT_MAX_BYTES,
            evict_exited_after: None,
        }
    }
}

/// Outcome of create-or-attach.
#[derive(Debug, Clone)]
pub struct AttachOutcome {
    pub session_id: String,
    pub is_new: bool,
    pub was_recovered: bool,
    pub scrollback: String,
}

/// Everything the registry tracks for one session id.
struct SessionSlot {
    workspace_id: String,
    tab_id: String,
    cwd: Option<String>,
    /// Seeded from the caller's config; flips once the process reports
    /// its real cwd (resolution is an external collaborator's job).
    cwd_confirmed: bool,
    size: TermSize,
    state: ProcessState,
    created_at: DateTime<Utc>,
    scrollback: ScrollbackBuffer,
    taps: Vec<(u64, mpsc::UnboundedSender<SessionEvent>)>,
    pty: Option<Arc<AsyncPtyHandle>>,
    /// Bumped on every respawn so a stale pump can't feed a new process's
    /// slot.
    generation: u64,
    exited_at: Option<Instant>,
}

impl SessionSlot {
    fn is_alive(&self) -> bool {
        matches!(self.state, ProcessState::Starting | ProcessState::Running)
            && self.pty.as_ref().map(|p| !p.has_exited()).unwrap_or(false)
    }

    fn info(&self, session_id: &str) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            workspace_id: self.workspace_id.clone(),
            tab_id: self.tab_id.clone(),
            is_alive: self.is_alive(),
            process_state: self.state,
            cols: self.size.cols,
            rows: self.size.rows,
            cwd: self.cwd.clone(),
            cwd_confirmed: self.cwd_confirmed,
            created_at: self.created_at.to_rfc3339(),
        }
    }

    fn fan_out(&mut self, event: &SessionEvent) {
        self.taps.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

/// Manages PTY sessions. Thread-safe via interior mutability.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionSlot>>,
    config: RegistryConfig,
    tap_counter: AtomicU64,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            tap_counter: AtomicU64::new(1),
        }
    }

    /// Attach to a live session, or spawn a process under this id.
    ///
    /// Spawning fails with a caller-visible error; once a session is
    /// running, its exit is only ever an event.
    pub async fn create_or_attach(
        self: &Arc<Self>,
        spec: &SessionSpec,
    ) -> Result<AttachOutcome, ApiError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(slot) = sessions.get_mut(&spec.session_id) {
            if slot.is_alive() {
                debug!("Attaching to live session {}", spec.session_id);
                return Ok(AttachOutcome {
                    session_id: spec.session_id.clone(),
                    is_new: false,
                    was_recovered: true,
                    scrollback: slot.scrollback.snapshot(),
                });
            }

            // Explicit reattach to an exited id: respawn with the
            // caller-supplied cwd and dimensions, keep the history.
            let (pty, output) = spawn_pty(spec)?;
            slot.generation += 1;
            slot.pty = Some(Arc::new(pty));
            slot.state = ProcessState::Running;
            slot.size = TermSize {
                cols: spec.cols,
                rows: spec.rows,
            };
            slot.cwd = spec.cwd.clone();
            slot.cwd_confirmed = false;
            slot.exited_at = None;
            let scrollback = slot.scrollback.snapshot();
            let generation = slot.generation;
            drop(sessions);

            info!("Respawned session {}", spec.session_id);
            self.spawn_pump(spec.session_id.clone(), generation, output);
            return Ok(AttachOutcome {
                session_id: spec.session_id.clone(),
                is_new: true,
                was_recovered: false,
                scrollback,
            });
        }

        if sessions.len() >= self.config.max_sessions {
            return Err(ApiError::session_limit_reached(self.config.max_sessions));
        }

        let (pty, output) = spawn_pty(spec)?;
        let slot = SessionSlot {
            workspace_id: spec.workspace_id.clone(),
            tab_id: spec.tab_id.clone(),
            cwd: spec.cwd.clone(),
            cwd_confirmed: false,
            size: TermSize {
                cols: spec.cols,
                rows: spec.rows,
            },
            state: ProcessState::Running,
            created_at: Utc::now(),
            scrollback: ScrollbackBuffer::new(self.config.max_scrollback_bytes),
            taps: Vec::new(),
            pty: Some(Arc::new(pty)),
            generation: 0,
            exited_at: None,
        };
        sessions.insert(spec.session_id.clone(), slot);
        drop(sessions);

        info!("Created session {}", spec.session_id);
        self.spawn_pump(spec.session_id.clone(), 0, output);
        Ok(AttachOutcome {
            session_id: spec.session_id.clone(),
            is_new: true,
            was_recovered: false,
            scrollback: String::new(),
        })
    }

    /// Send input to a session. A missing or dead session is a no-op:
    /// writes racing an exit are expected, not caller bugs.
    pub async fn write(&self, session_id: &str, data: &str) -> Result<(), ApiError> {
        let pty = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(slot) => slot.pty.clone(),
                None => return Ok(()),
            }
        };
        if let Some(pty) = pty {
            if let Err(e) = pty.write(data.as_bytes()).await {
                debug!("Write to session {} dropped: {}", session_id, e);
            }
        }
        Ok(())
    }

    /// Resize a session's terminal. No-op if the session is gone.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ApiError> {
        let mut sessions = self.sessions.lock().await;
        let Some(slot) = sessions.get_mut(session_id) else {
            return Ok(());
        };
        let size = TermSize { cols, rows };
        slot.size = size;
        if let Some(pty) = &slot.pty {
            if let Err(e) = pty.resize(size) {
                warn!("Resize of session {} failed: {}", session_id, e);
            }
        }
        Ok(())
    }

    /// Deliver a signal (default SIGTERM) to a session's process.
    /// Missing session or already-exited process is a no-op.
    pub async fn signal(&self, session_id: &str, signal: Option<&str>) -> Result<(), ApiError> {
        let name = signal.unwrap_or("TERM");
        let signo = signal_by_name(name)
            .ok_or_else(|| ApiError::invalid_input(format!("Unknown signal '{}'", name)))?;

        let pty = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(slot) => slot.pty.clone(),
                None => return Ok(()),
            }
        };
        if let Some(pty) = pty {
            if let Err(e) = pty.send_signal(signo) {
                debug!("Signal to session {} dropped: {}", session_id, e);
            }
        }
        Ok(())
    }

    /// Terminate the process and remove the session. Idempotent.
    pub async fn kill(&self, session_id: &str, delete_history: bool) -> Result<(), ApiError> {
        let slot = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id)
        };
        if let Some(mut slot) = slot {
            if delete_history {
                slot.scrollback.clear();
            }
            slot.state = ProcessState::Killed;
            if let Some(pty) = slot.pty.take() {
                pty.shutdown();
            }
            info!("Killed session {}", session_id);
        }
        Ok(())
    }

    /// Current registry truth, computed at call time.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions.iter().map(|(id, slot)| slot.info(id)).collect()
    }

    /// Kill every session alive at the start of the call.
    ///
    /// Re-checks the registry per session while acting; a session that
    /// exits concurrently still counts as killed.
    pub async fn kill_all(&self) -> usize {
        self.kill_matching(|_| true).await
    }

    /// Kill every session belonging to a workspace.
    pub async fn kill_for_workspace(&self, workspace_id: &str) -> usize {
        self.kill_matching(|slot| slot.workspace_id == workspace_id)
            .await
    }

    async fn kill_matching<F>(&self, pred: F) -> usize
    where
        F: Fn(&SessionSlot) -> bool,
    {
        let targets: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, slot)| slot.is_alive() && pred(slot))
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut killed = 0;
        for id in targets {
            // Re-enumerate per session: it may already be gone.
            let slot = {
                let mut sessions = self.sessions.lock().await;
                sessions.remove(&id)
            };
            if let Some(mut slot) = slot {
                if let Some(pty) = slot.pty.take() {
                    pty.shutdown();
                }
                killed += 1;
            }
        }
        killed
    }

    /// Register an event tap and snapshot the scrollback atomically, so
    /// the subscriber sees snapshot-then-live with no gap or duplicate.
    pub async fn subscribe(
        &self,
        session_id: &str,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(u64, String), ApiError> {
        let mut sessions = self.sessions.lock().await;
        let slot = sessions
            .get_mut(session_id)
            .ok_or_else(|| ApiError::session_not_found(session_id))?;
        let tap_id = self.tap_counter.fetch_add(1, Ordering::Relaxed);
        let snapshot = slot.scrollback.snapshot();
        slot.taps.push((tap_id, tx));
        Ok((tap_id, snapshot))
    }

    /// Remove one tap; other taps on the same session are untouched.
    pub async fn unsubscribe(&self, session_id: &str, tap_id: u64) {
        let mut sessions = self.sessions.lock().await;
        if let Some(slot) = sessions.get_mut(session_id) {
            slot.taps.retain(|(id, _)| *id != tap_id);
        }
    }

    pub async fn tap_count(&self, session_id: &str) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|slot| slot.taps.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Snapshot a session's state, if registered.
    pub async fn get_info(&self, session_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(|slot| slot.info(session_id))
    }

    /// Pump task: the single consumer of one process's output channel.
    ///
    /// Scrollback append (with any truncation) and tap fan-out happen
    /// under the registry lock, so no reader observes a half-truncated
    /// buffer. Tap sends are unbounded and never block the pump.
    fn spawn_pump(
        self: &Arc<Self>,
        session_id: String,
        generation: u64,
        mut output: mpsc::Receiver<Vec<u8>>,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(bytes) = output.recv().await {
                let chunk = String::from_utf8_lossy(&bytes).into_owned();
                let mut sessions = registry.sessions.lock().await;
                let Some(slot) = sessions.get_mut(&session_id) else {
                    return;
                };
                if slot.generation != generation {
                    return;
                }
                slot.state = ProcessState::Running;
                slot.scrollback.push(&chunk);
                slot.fan_out(&SessionEvent::Data { data: chunk });
            }

            // EOF: the process is gone or closed its terminal. Grab the
            // handle, collect the exit code outside the lock, then
            // finalize.
            let pty = {
                let sessions = registry.sessions.lock().await;
                match sessions.get(&session_id) {
                    Some(slot) if slot.generation == generation => slot.pty.clone(),
                    _ => return,
                }
            };

            let mut exit_code = None;
            if let Some(pty) = &pty {
                // The exit status can lag the PTY EOF by a moment.
                for _ in 0..20 {
                    if let Some(code) = pty.exit_code() {
                        exit_code = Some(code);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }

            let mut sessions = registry.sessions.lock().await;
            let Some(slot) = sessions.get_mut(&session_id) else {
                return;
            };
            if slot.generation != generation || slot.state == ProcessState::Killed {
                return;
            }
            slot.state = ProcessState::Exited;
            slot.exited_at = Some(Instant::now());
            slot.pty = None;
            info!(
                "Session {} exited with code {:?}",
                session_id, exit_code
            );
            slot.fan_out(&SessionEvent::Exit {
                exit_code,
                signal: None,
            });
        });
    }

    /// Background eviction of exited sessions, when configured.
    ///
    /// Runs until the registry is dropped (weak reference upgrade fails).
    pub fn spawn_cleaner(self: &Arc<Self>) {
        let Some(ttl) = self.config.evict_exited_after else {
            return;
        };
        let weak_self = Arc::downgrade(self);

        tokio::spawn(async move {
            const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

            loop {
                tokio::time::sleep(CLEANUP_INTERVAL).await;

                let Some(registry) = weak_self.upgrade() else {
                    debug!("SessionRegistry dropped, cleaner exiting");
                    break;
                };

                let mut sessions = registry.sessions.lock().await;
                sessions.retain(|id, slot| {
                    let expired = slot
                        .exited_at
                        .map(|at| at.elapsed() >= ttl)
                        .unwrap_or(false);
                    if expired {
                        info!("Evicting exited session {}", id);
                    }
                    !expired
                });
            }
        });
    }
}

fn spawn_pty(
    spec: &SessionSpec,
) -> Result<(AsyncPtyHandle, mpsc::Receiver<Vec<u8>>), ApiError> {
    let size = TermSize {
        cols: spec.cols,
        rows: spec.rows,
    };
    let process = PtyProcess::spawn(&spec.command, size, spec.cwd.as_deref())
        .map_err(|e| ApiError::spawn_failed(&spec.command, &e.to_string()))?;
    AsyncPtyHandle::new(process).map_err(|e| ApiError::spawn_failed(&spec.command, &e.to_string()))
}
