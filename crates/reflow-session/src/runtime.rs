//! Runtime owning the active sessions.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use reflow_core::{BackMsg, EventLoop, ForwardMsg, LoopHandle, SessionId, UserInfo};
use tokio::{
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{AppSession, SessionServices};

/// Runtime error.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Session already exists: {0}")]
    SessionExists(SessionId),
}

/// A session's loop handle and the task driving it.
struct ActiveSession {
    handle: LoopHandle<AppSession>,
    task: JoinHandle<()>,
}

type Sessions = Arc<RwLock<HashMap<SessionId, ActiveSession>>>;

/// Owns every connected session.
///
/// Each session runs on its own [`EventLoop`], driven by a tokio task that
/// flushes the session's queued messages to its client after every batch
/// of callbacks.
pub struct Runtime {
    services: SessionServices,
    sessions: Sessions,
}

impl Runtime {
    #[must_use]
    pub fn new(services: SessionServices) -> Self {
        Self {
            services,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub const fn services(&self) -> &SessionServices {
        &self.services
    }

    /// Create a session for `main_script_path` and start driving it.
    ///
    /// Messages for the client are sent on `client`. When the client side
    /// goes away the session shuts itself down.
    ///
    /// # Errors
    /// Returns error if a session with the overriding id already exists.
    pub async fn connect_session(
        &self,
        main_script_path: impl Into<PathBuf>,
        user_info: UserInfo,
        client: mpsc::UnboundedSender<ForwardMsg>,
        session_id_override: Option<SessionId>,
    ) -> Result<SessionId, RuntimeError> {
        let mut sessions = self.sessions.write().await;
        if let Some(id) = &session_id_override {
            if sessions.contains_key(id) {
                return Err(RuntimeError::SessionExists(id.clone()));
            }
        }

        let (session, event_loop) = AppSession::with_event_loop(
            self.services.clone(),
            main_script_path,
            user_info,
            session_id_override,
        );
        let session_id = session.id().to_string();
        let handle = event_loop.handle();
        let task = tokio::spawn(drive_session(
            session,
            event_loop,
            client,
            Arc::clone(&self.sessions),
        ));

        sessions.insert(session_id.clone(), ActiveSession { handle, task });
        info!(session_id = %session_id, "Session connected");
        Ok(session_id)
    }

    /// Post a client message onto the session's loop.
    ///
    /// # Errors
    /// Returns error if the session is not connected.
    pub async fn handle_backmsg(&self, session_id: &str, msg: BackMsg) -> Result<(), RuntimeError> {
        self.post(session_id, move |session| session.handle_backmsg(msg))
            .await
    }

    /// Shut a session down. Its task exits once the runner has stopped.
    ///
    /// # Errors
    /// Returns error if the session is not connected.
    pub async fn close_session(&self, session_id: &str) -> Result<(), RuntimeError> {
        self.post(session_id, AppSession::shutdown).await
    }

    async fn post<F>(&self, session_id: &str, callback: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&mut AppSession) + Send + 'static,
    {
        let sessions = self.sessions.read().await;
        let active = sessions
            .get(session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.to_string()))?;
        active
            .handle
            .call_soon_threadsafe(move |session: &mut AppSession, _| callback(session));
        Ok(())
    }

    /// Whether `session_id` is connected.
    pub async fn is_active_session(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Shut every session down and wait for their tasks to finish.
    pub async fn stop(&self) {
        let active: Vec<(SessionId, ActiveSession)> =
            self.sessions.write().await.drain().collect();
        debug!(count = active.len(), "Stopping runtime");

        let tasks = active.into_iter().map(|(session_id, active)| {
            active
                .handle
                .call_soon_threadsafe(|session: &mut AppSession, _| session.shutdown());
            async move {
                if let Err(e) = active.task.await {
                    warn!(session_id = %session_id, error = %e, "Session task failed");
                }
            }
        });
        futures::future::join_all(tasks).await;
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

/// Run a session's loop until it has shut down.
async fn drive_session(
    mut session: AppSession,
    mut event_loop: EventLoop<AppSession>,
    client: mpsc::UnboundedSender<ForwardMsg>,
    sessions: Sessions,
) {
    loop {
        event_loop.run_once(&mut session).await;

        for msg in session.flush_browser_queue() {
            if client.send(msg).is_err() {
                debug!(session_id = %session.id(), "Client disconnected");
                session.shutdown();
                break;
            }
        }

        if session.is_finished() {
            break;
        }
    }

    sessions.write().await.remove(session.id());
    info!(session_id = %session.id(), "Session closed");
}
