//! The per-connection app session.
//!
//! An [`AppSession`] lives on a single-threaded [`EventLoop`]. Script
//! runners, file watchers and change signals report from other threads by
//! posting callbacks through the session's [`LoopHandle`]; none of them
//! owns the session.

mod messages;

use std::{
    path::{Path, PathBuf},
    sync::{Arc, PoisonError},
};

use reflow_core::{
    BackMsg, BackMsgKind, CacheError, ClientState, Connection, EventLoop, ForwardMsg,
    ForwardMsgQueue, LoopHandle, LoopId, RerunData, SessionId, SessionState,
    SharedSessionState, UserInfo,
    protocol::{
        FileUrlsRequest, FileUrlsResponse, ForwardMsgKind, ScriptFinishedStatus, SessionEventKind,
    },
};
use reflow_pages::{FileChangeCallback, PagesManager, SourceWatcher};
use reflow_runner::{
    EventListener, FragmentStorage, MemoryFragmentStorage, RunnerError, ScriptRunnerControl,
    ScriptRunnerEvent, ScriptRunnerParams,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::SessionServices;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSessionState {
    AppNotRunning,
    AppIsRunning,
    /// Terminal.
    ShutdownRequested,
}

/// Failure while handling a client message.
#[derive(Debug, thiserror::Error)]
pub enum BackMsgError {
    #[error("Failed to clear caches: {0}")]
    Cache(#[from] CacheError),
    #[error("Failed to start script runner: {0}")]
    Runner(#[from] RunnerError),
}

impl BackMsgError {
    /// Exception type shown to the client.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Cache(_) => "CacheError",
            Self::Runner(_) => "RunnerError",
        }
    }
}

type RunnerRef = Arc<dyn ScriptRunnerControl>;

/// Server-side state of one client connection.
pub struct AppSession {
    id: SessionId,
    services: SessionServices,
    main_script_path: PathBuf,
    user_info: UserInfo,
    state: AppSessionState,
    loop_handle: LoopHandle<Self>,
    loop_id: LoopId,

    client_state: ClientState,
    scriptrunner: Option<RunnerRef>,
    browser_queue: ForwardMsgQueue,
    session_state: SharedSessionState,
    fragment_storage: Arc<MemoryFragmentStorage>,
    pages_manager: Arc<PagesManager>,
    run_on_save: bool,
    debug_last_backmsg_id: Option<String>,

    local_sources_watcher: Option<Box<dyn SourceWatcher>>,
    stop_sources_listener: Option<Connection>,
    stop_config_listener: Option<Connection>,
    stop_pages_listener: Option<Connection>,
    stop_secrets_listener: Option<Connection>,
}

impl AppSession {
    /// Create a session bound to the loop behind `loop_handle`.
    ///
    /// File watchers are registered unless file watching is disabled. No
    /// script runs until the first rerun request.
    #[must_use]
    pub fn new(
        services: SessionServices,
        main_script_path: impl Into<PathBuf>,
        user_info: UserInfo,
        session_id_override: Option<SessionId>,
        loop_handle: LoopHandle<Self>,
    ) -> Self {
        let main_script_path = main_script_path.into();
        let watcher_type = services.config.server.file_watcher_type;
        let pages_manager = Arc::new(PagesManager::new(&main_script_path, watcher_type));

        let mut session = Self {
            id: session_id_override.unwrap_or_else(|| Uuid::new_v4().to_string()),
            run_on_save: services.config.server.run_on_save,
            services,
            main_script_path,
            user_info,
            state: AppSessionState::AppNotRunning,
            loop_id: loop_handle.loop_id(),
            loop_handle,
            client_state: ClientState::default(),
            scriptrunner: None,
            browser_queue: ForwardMsgQueue::new(),
            session_state: SessionState::shared(),
            fragment_storage: Arc::new(MemoryFragmentStorage::new()),
            pages_manager,
            debug_last_backmsg_id: None,
            local_sources_watcher: None,
            stop_sources_listener: None,
            stop_config_listener: None,
            stop_pages_listener: None,
            stop_secrets_listener: None,
        };

        if watcher_type != reflow_core::FileWatcherType::None {
            session.register_file_watchers();
        }
        debug!(session_id = %session.id, "Session created");
        session
    }

    /// Create a session together with the loop that drives it.
    #[must_use]
    pub fn with_event_loop(
        services: SessionServices,
        main_script_path: impl Into<PathBuf>,
        user_info: UserInfo,
        session_id_override: Option<SessionId>,
    ) -> (Self, EventLoop<Self>) {
        let event_loop = EventLoop::new();
        let session = Self::new(
            services,
            main_script_path,
            user_info,
            session_id_override,
            event_loop.handle(),
        );
        (session, event_loop)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn state(&self) -> AppSessionState {
        self.state
    }

    #[must_use]
    pub const fn client_state(&self) -> &ClientState {
        &self.client_state
    }

    #[must_use]
    pub const fn run_on_save(&self) -> bool {
        self.run_on_save
    }

    #[must_use]
    pub const fn session_state(&self) -> &SharedSessionState {
        &self.session_state
    }

    #[must_use]
    pub fn fragment_storage(&self) -> &Arc<MemoryFragmentStorage> {
        &self.fragment_storage
    }

    #[must_use]
    pub const fn pages_manager(&self) -> &Arc<PagesManager> {
        &self.pages_manager
    }

    #[must_use]
    pub fn debug_last_backmsg_id(&self) -> Option<&str> {
        self.debug_last_backmsg_id.as_deref()
    }

    /// Whether a runner is registered.
    #[must_use]
    pub const fn has_scriptrunner(&self) -> bool {
        self.scriptrunner.is_some()
    }

    /// Whether the session is shut down and its runner has exited.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self.state, AppSessionState::ShutdownRequested) && self.scriptrunner.is_none()
    }

    /// Messages waiting to be sent, in order.
    #[must_use]
    pub fn queued_messages(&self) -> &[ForwardMsg] {
        self.browser_queue.messages()
    }

    /// Take every queued message for delivery to the client.
    pub fn flush_browser_queue(&mut self) -> Vec<ForwardMsg> {
        self.browser_queue.flush()
    }

    /// Shut the session down. Later calls do nothing.
    ///
    /// Stops the runner, releases the session's uploaded and media files
    /// and disconnects every watcher so nothing keeps posting to the loop.
    pub fn shutdown(&mut self) {
        if self.state == AppSessionState::ShutdownRequested {
            return;
        }
        debug!(session_id = %self.id, "Shutting down");

        self.services.uploaded_file_mgr.remove_session_files(&self.id);
        self.services.media_file_mgr.clear_session_refs(&self.id);
        self.services.media_file_mgr.remove_orphaned_files();

        // Must happen before the state changes.
        self.request_script_stop();
        self.state = AppSessionState::ShutdownRequested;

        self.disconnect_file_watchers();
    }

    /// Handle a message from the client.
    ///
    /// Failures are reported to the client through
    /// [`Self::handle_backmsg_exception`].
    pub fn handle_backmsg(&mut self, msg: BackMsg) {
        if let Err(e) = self.dispatch_backmsg(msg) {
            error!(session_id = %self.id, error = %e, "Error handling back message");
            self.handle_backmsg_exception(&e);
        }
    }

    fn dispatch_backmsg(&mut self, msg: BackMsg) -> Result<(), BackMsgError> {
        match msg.kind {
            BackMsgKind::RerunScript(client_state) => {
                if let Some(id) = msg.debug_last_backmsg_id {
                    self.debug_last_backmsg_id = Some(id);
                }
                self.request_rerun(Some(client_state))?;
            }
            BackMsgKind::ClearCache => self.handle_clear_cache_request()?,
            BackMsgKind::SetRunOnSave { value } => self.handle_set_run_on_save_request(value),
            BackMsgKind::StopScript => self.request_script_stop(),
            BackMsgKind::FileUrlsRequest(request) => self.handle_file_urls_request(request),
            BackMsgKind::AppHeartbeat => {}
        }
        Ok(())
    }

    /// Put the client back into a consistent, stopped state after a failed
    /// client message and show the error.
    ///
    /// Everything is enqueued from loop callbacks, after any runner events
    /// already posted.
    pub fn handle_backmsg_exception(&self, error: &BackMsgError) {
        let sender = self.scriptrunner.clone();
        self.post_scriptrunner_event(sender.clone(), ScriptRunnerEvent::ScriptStoppedWithSuccess);
        self.post_scriptrunner_event(
            sender.clone(),
            ScriptRunnerEvent::ScriptStarted {
                page_script_hash: String::new(),
                fragment_ids_this_run: None,
            },
        );
        self.post_scriptrunner_event(sender, ScriptRunnerEvent::ScriptStoppedWithSuccess);

        let info = reflow_core::protocol::ExceptionInfo::from_error(error.type_name(), error);
        self.loop_handle.call_soon_threadsafe(move |session: &mut Self, _| {
            session.enqueue_forward_msg(ForwardMsg::exception(info));
        });
    }

    /// Rerun the script with the given client state, or a plain full rerun.
    ///
    /// With fast reruns a full rerun always replaces the active runner;
    /// otherwise the active runner is asked to take the rerun first.
    ///
    /// # Errors
    /// Returns error if a new runner cannot be started.
    pub fn request_rerun(&mut self, client_state: Option<ClientState>) -> Result<(), RunnerError> {
        if self.state == AppSessionState::ShutdownRequested {
            warn!(session_id = %self.id, "Discarding rerun request after shutdown");
            return Ok(());
        }

        let rerun_data = match client_state {
            Some(client_state) => {
                if let Some(fragment_id) = client_state.fragment_id.as_deref() {
                    if !self.fragment_storage.contains(fragment_id) {
                        info!(
                            session_id = %self.id,
                            fragment_id,
                            "The fragment no longer exists, probably removed by a full app \
                             rerun. Ignoring the rerun request."
                        );
                        return Ok(());
                    }
                }
                RerunData::from_client_state(&client_state)
            }
            None => RerunData::default(),
        };

        if let Some(runner) = self.scriptrunner.take() {
            if self.services.config.runner.fast_reruns && !rerun_data.is_fragment_run() {
                runner.request_stop();
            } else if runner.request_rerun(rerun_data.clone()) {
                self.scriptrunner = Some(runner);
                return Ok(());
            }
        }

        self.create_scriptrunner(rerun_data)
    }

    /// Ask the active runner, if any, to stop.
    pub fn request_script_stop(&self) {
        if let Some(runner) = &self.scriptrunner {
            runner.request_stop();
        }
    }

    /// Create, register and start a runner for `initial_rerun_data`.
    ///
    /// The runner is registered before it starts so its first event is
    /// recognised as current.
    fn create_scriptrunner(&mut self, initial_rerun_data: RerunData) -> Result<(), RunnerError> {
        let params = ScriptRunnerParams {
            session_id: self.id.clone(),
            main_script_path: self.main_script_path.clone(),
            session_state: Arc::clone(&self.session_state),
            uploaded_file_mgr: Arc::clone(&self.services.uploaded_file_mgr),
            media_file_mgr: Arc::clone(&self.services.media_file_mgr),
            script_cache: Arc::clone(&self.services.script_cache),
            initial_rerun_data,
            user_info: self.user_info.clone(),
            fragment_storage: Arc::clone(&self.fragment_storage) as Arc<dyn FragmentStorage>,
            pages_manager: Arc::clone(&self.pages_manager),
        };

        let runner = self
            .services
            .runner_factory
            .create(params, self.scriptrunner_listener());
        self.scriptrunner = Some(Arc::clone(&runner));

        if let Err(e) = runner.start() {
            self.scriptrunner = None;
            return Err(e);
        }
        Ok(())
    }

    fn scriptrunner_listener(&self) -> EventListener {
        let handle = self.loop_handle.clone();
        Arc::new(move |sender: RunnerRef, event: ScriptRunnerEvent| {
            handle.call_soon_threadsafe(move |session: &mut Self, loop_id| {
                session.handle_scriptrunner_event_on_event_loop(loop_id, Some(&sender), event);
            });
        })
    }

    fn post_scriptrunner_event(&self, sender: Option<RunnerRef>, event: ScriptRunnerEvent) {
        self.loop_handle.call_soon_threadsafe(move |session: &mut Self, loop_id| {
            session.handle_scriptrunner_event_on_event_loop(loop_id, sender.as_ref(), event);
        });
    }

    fn is_current_scriptrunner(&self, sender: Option<&RunnerRef>) -> bool {
        match (sender, &self.scriptrunner) {
            (Some(sender), Some(current)) => {
                std::ptr::addr_eq(Arc::as_ptr(sender), Arc::as_ptr(current))
            }
            (None, None) => true,
            _ => false,
        }
    }

    /// Apply a runner event. Must run on the session's own loop.
    ///
    /// # Panics
    /// Panics if `loop_id` is not the loop the session was created on.
    pub(crate) fn handle_scriptrunner_event_on_event_loop(
        &mut self,
        loop_id: LoopId,
        sender: Option<&RunnerRef>,
        event: ScriptRunnerEvent,
    ) {
        assert_eq!(
            loop_id, self.loop_id,
            "script runner event handled off the session's event loop"
        );

        if !self.is_current_scriptrunner(sender) {
            debug!(
                session_id = %self.id,
                event = event.name(),
                "Ignoring event from non-current ScriptRunner"
            );
            return;
        }

        let was_running = self.state == AppSessionState::AppIsRunning;

        match event {
            ScriptRunnerEvent::ScriptStarted {
                page_script_hash,
                fragment_ids_this_run,
            } => {
                self.set_state(AppSessionState::AppIsRunning);
                self.debug_last_backmsg_id = None;
                if page_script_hash != self.client_state.page_script_hash {
                    self.client_state.page_script_hash.clone_from(&page_script_hash);
                }
                self.clear_queue(fragment_ids_this_run.as_deref());
                let msg = self.create_new_session_message(
                    &page_script_hash,
                    fragment_ids_this_run.unwrap_or_default(),
                );
                self.enqueue_forward_msg(msg);
            }
            ScriptRunnerEvent::ScriptStoppedWithSuccess => {
                self.on_script_stopped(ScriptFinishedStatus::FinishedSuccessfully);
            }
            ScriptRunnerEvent::FragmentStoppedWithSuccess => {
                self.on_script_stopped(ScriptFinishedStatus::FinishedFragmentRunSuccessfully);
            }
            ScriptRunnerEvent::ScriptStoppedWithCompileError { error } => {
                self.on_script_stopped(ScriptFinishedStatus::FinishedWithCompileError);
                self.enqueue_forward_msg(ForwardMsg::session_event(
                    SessionEventKind::ScriptCompilationException(error),
                ));
            }
            ScriptRunnerEvent::ScriptStoppedForRerun => {
                self.set_state(AppSessionState::AppNotRunning);
                self.enqueue_forward_msg(ForwardMsg::script_finished(
                    ScriptFinishedStatus::FinishedEarlyForRerun,
                ));
            }
            ScriptRunnerEvent::Shutdown { client_state } => {
                if self.state == AppSessionState::ShutdownRequested {
                    // Media refs are only safe to drop once the script is done.
                    self.services.media_file_mgr.clear_session_refs(&self.id);
                }
                self.client_state = client_state;
                self.scriptrunner = None;
            }
            ScriptRunnerEvent::EnqueueForwardMsg(msg) => self.enqueue_forward_msg(msg),
        }

        let is_running = self.state == AppSessionState::AppIsRunning;
        if is_running != was_running {
            let msg = self.create_session_status_changed_message();
            self.enqueue_forward_msg(msg);
        }
    }

    fn on_script_stopped(&mut self, status: ScriptFinishedStatus) {
        self.set_state(AppSessionState::AppNotRunning);
        self.enqueue_forward_msg(ForwardMsg::script_finished(status));
        self.debug_last_backmsg_id = None;
    }

    /// Change state unless shutdown was requested.
    fn set_state(&mut self, state: AppSessionState) {
        if self.state != AppSessionState::ShutdownRequested {
            self.state = state;
        }
    }

    fn clear_queue(&mut self, fragment_ids_this_run: Option<&[String]>) {
        self.browser_queue.clear(true, fragment_ids_this_run);
    }

    /// Queue a message for the client, tagged with the last back message id.
    pub(crate) fn enqueue_forward_msg(&mut self, mut msg: ForwardMsg) {
        if let Some(id) = &self.debug_last_backmsg_id {
            msg.debug_last_backmsg_id = Some(id.clone());
        }
        self.browser_queue.enqueue(msg);
    }

    fn handle_clear_cache_request(&mut self) -> Result<(), BackMsgError> {
        self.services.cache_storage_mgr.clear_all()?;
        self.session_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn handle_set_run_on_save_request(&mut self, value: bool) {
        self.run_on_save = value;
        let msg = self.create_session_status_changed_message();
        self.enqueue_forward_msg(msg);
    }

    fn handle_file_urls_request(&mut self, request: FileUrlsRequest) {
        let file_urls = self
            .services
            .uploaded_file_mgr
            .get_upload_urls(&self.id, &request.file_names)
            .into_iter()
            .map(Into::into)
            .collect();
        self.enqueue_forward_msg(ForwardMsg::new(ForwardMsgKind::FileUrlsResponse(
            FileUrlsResponse {
                response_id: request.request_id,
                file_urls,
                error_msg: None,
            },
        )));
    }

    /// Connect the source watcher and the config, pages and secrets
    /// listeners. Every callback posts onto the session's loop.
    ///
    /// A missing source watcher is recreated.
    pub fn register_file_watchers(&mut self) {
        if self.local_sources_watcher.is_none() {
            match self.services.watcher_factory.create(&self.pages_manager) {
                Ok(watcher) => self.local_sources_watcher = Some(watcher),
                Err(e) => warn!(session_id = %self.id, error = %e, "Source files will not be watched"),
            }
        }

        if let Some(watcher) = self.local_sources_watcher.as_mut() {
            let handle = self.loop_handle.clone();
            let callback: FileChangeCallback = Box::new(move |path: &PathBuf| {
                let path = path.clone();
                handle.call_soon_threadsafe(move |session: &mut Self, _| {
                    session.on_source_file_changed(Some(&path));
                });
            });
            replace_connection(
                &mut self.stop_sources_listener,
                watcher.register_file_change_callback(callback),
            );
        }

        let handle = self.loop_handle.clone();
        replace_connection(
            &mut self.stop_config_listener,
            self.services.config_changed.connect(move |_: &()| {
                handle.call_soon_threadsafe(|session: &mut Self, _| session.on_source_file_changed(None));
            }),
        );

        let handle = self.loop_handle.clone();
        replace_connection(
            &mut self.stop_pages_listener,
            self.pages_manager.register_pages_changed_callback(move |_| {
                handle.call_soon_threadsafe(|session: &mut Self, _| session.on_pages_changed());
            }),
        );

        let handle = self.loop_handle.clone();
        replace_connection(
            &mut self.stop_secrets_listener,
            self.services.secrets_changed.connect(move |_| {
                handle.call_soon_threadsafe(|session: &mut Self, _| session.on_secrets_file_changed());
            }),
        );
    }

    /// Close the source watcher and disconnect every listener.
    pub fn disconnect_file_watchers(&mut self) {
        if let Some(mut watcher) = self.local_sources_watcher.take() {
            watcher.close();
        }
        for connection in [
            &mut self.stop_sources_listener,
            &mut self.stop_config_listener,
            &mut self.stop_pages_listener,
            &mut self.stop_secrets_listener,
        ] {
            if let Some(mut connection) = connection.take() {
                connection.disconnect();
            }
        }
    }

    /// Whether a watcher is registered.
    #[must_use]
    pub fn has_local_sources_watcher(&self) -> bool {
        self.local_sources_watcher.is_some()
    }

    /// React to a changed source file, or to a changed config when `path`
    /// is `None`.
    pub fn on_source_file_changed(&mut self, path: Option<&Path>) {
        self.services.script_cache.clear();

        if let Some(path) = path {
            if !self.should_rerun_on_file_change(path) {
                return;
            }
        }

        if self.run_on_save {
            if let Err(e) = self.request_rerun(Some(self.client_state.clone())) {
                error!(session_id = %self.id, error = %e, "Failed to rerun after file change");
            }
        } else {
            self.enqueue_forward_msg(ForwardMsg::session_event(
                SessionEventKind::ScriptChangedOnDisk,
            ));
        }
    }

    fn on_secrets_file_changed(&mut self) {
        self.on_source_file_changed(None);
    }

    /// A change to a page other than the client's current one does not
    /// rerun. Files that are not pages always do.
    fn should_rerun_on_file_change(&self, path: &Path) -> bool {
        self.pages_manager
            .get_pages()
            .into_iter()
            .find(|page| page.script_path == path)
            .is_none_or(|page| page.page_script_hash == self.client_state.page_script_hash)
    }

    fn on_pages_changed(&mut self) {
        let msg = self.create_pages_changed_message();
        self.enqueue_forward_msg(msg);
        if let Some(watcher) = self.local_sources_watcher.as_mut() {
            watcher.update_watched_pages();
        }
    }
}

fn replace_connection(slot: &mut Option<Connection>, connection: Connection) {
    if let Some(mut old) = slot.replace(connection) {
        old.disconnect();
    }
}

impl std::fmt::Debug for AppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("loop_id", &self.loop_id)
            .field("has_scriptrunner", &self.scriptrunner.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
