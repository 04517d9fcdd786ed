//! Script runner: executes a session's script on its own thread.

use std::{
    any::Any,
    collections::HashSet,
    fmt,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use reflow_core::{
    ClientState, ForwardMsg, ForwardMsgKind, MediaFileManager, PageInfo, RerunData, SessionId,
    SharedSessionState, UploadedFileManager, UserInfo, protocol::ExceptionInfo,
};
use reflow_pages::PagesManager;
use tracing::{debug, warn};

use crate::{
    FragmentStorage, RunnerError, ScriptCache, ScriptError,
    context::ScriptRunContext,
    event::ScriptRunnerEvent,
    requests::{ScriptRequest, ScriptRequests},
};

/// Receives runner events together with the runner that sent them.
pub type EventListener = Arc<dyn Fn(Arc<dyn ScriptRunnerControl>, ScriptRunnerEvent) + Send + Sync>;

/// The handle a session holds on a runner.
pub trait ScriptRunnerControl: Send + Sync {
    /// Hand a rerun to the running script.
    ///
    /// Returns `false` if the runner is stopping and a new one is needed.
    fn request_rerun(&self, rerun_data: RerunData) -> bool;

    /// Ask the runner to stop. Idempotent; the runner reports `Shutdown`
    /// once it has actually stopped.
    fn request_stop(&self);

    /// Start the runner's thread.
    ///
    /// # Errors
    /// Returns error if the runner was already started or the thread
    /// cannot be spawned.
    fn start(self: Arc<Self>) -> Result<(), RunnerError>;
}

/// Creates runners for a session.
pub trait ScriptRunnerFactory: Send + Sync {
    fn create(&self, params: ScriptRunnerParams, listener: EventListener) -> Arc<dyn ScriptRunnerControl>;
}

/// Everything a runner borrows from its session.
pub struct ScriptRunnerParams {
    pub session_id: SessionId,
    pub main_script_path: PathBuf,
    pub session_state: SharedSessionState,
    pub uploaded_file_mgr: Arc<dyn UploadedFileManager>,
    pub media_file_mgr: Arc<dyn MediaFileManager>,
    pub script_cache: Arc<ScriptCache>,
    pub initial_rerun_data: RerunData,
    pub user_info: UserInfo,
    pub fragment_storage: Arc<dyn FragmentStorage>,
    pub pages_manager: Arc<PagesManager>,
}

impl fmt::Debug for ScriptRunnerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRunnerParams")
            .field("session_id", &self.session_id)
            .field("main_script_path", &self.main_script_path)
            .field("initial_rerun_data", &self.initial_rerun_data)
            .finish_non_exhaustive()
    }
}

/// Runs one session's script on a dedicated OS thread until stopped.
pub struct ScriptRunner {
    session_id: SessionId,
    main_script_path: PathBuf,
    session_state: SharedSessionState,
    uploaded_file_mgr: Arc<dyn UploadedFileManager>,
    media_file_mgr: Arc<dyn MediaFileManager>,
    script_cache: Arc<ScriptCache>,
    user_info: UserInfo,
    fragment_storage: Arc<dyn FragmentStorage>,
    pages_manager: Arc<PagesManager>,
    requests: Arc<ScriptRequests>,
    listener: EventListener,
    started: AtomicBool,
    client_state: Mutex<ClientState>,
}

/// How a single run ended.
enum RunOutcome {
    Finished,
    Stopped,
    Rerun(RerunData),
    Exception(ExceptionInfo),
}

impl ScriptRunner {
    /// Create a runner. It does nothing until [`ScriptRunnerControl::start`].
    #[must_use]
    pub fn new(params: ScriptRunnerParams, listener: EventListener) -> Self {
        let requests = Arc::new(ScriptRequests::new());
        requests.request_rerun(params.initial_rerun_data);

        Self {
            session_id: params.session_id,
            main_script_path: params.main_script_path,
            session_state: params.session_state,
            uploaded_file_mgr: params.uploaded_file_mgr,
            media_file_mgr: params.media_file_mgr,
            script_cache: params.script_cache,
            user_info: params.user_info,
            fragment_storage: params.fragment_storage,
            pages_manager: params.pages_manager,
            requests,
            listener,
            started: AtomicBool::new(false),
            client_state: Mutex::new(ClientState::default()),
        }
    }

    fn emit(self: &Arc<Self>, event: ScriptRunnerEvent) {
        let sender: Arc<dyn ScriptRunnerControl> = Arc::clone(self) as Arc<dyn ScriptRunnerControl>;
        (self.listener)(sender, event);
    }

    fn run_script_thread(self: Arc<Self>) {
        debug!(session_id = %self.session_id, "Script thread started");

        let mut request = self.requests.on_scriptrunner_ready();
        while let ScriptRequest::Rerun(rerun_data) = request {
            request = self.run_script(rerun_data);
        }

        let client_state = self
            .client_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        debug!(session_id = %self.session_id, "Script thread exiting");
        self.emit(ScriptRunnerEvent::Shutdown { client_state });
    }

    /// Run once and return what to do next.
    fn run_script(self: &Arc<Self>, rerun_data: RerunData) -> ScriptRequest {
        debug!(
            session_id = %self.session_id,
            fragments = ?rerun_data.fragment_id_queue,
            "Running script"
        );

        if let Some(widget_states) = &rerun_data.widget_states {
            self.session_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_script_will_rerun(widget_states);
        }

        let fragment_ids_this_run = rerun_data
            .is_fragment_run()
            .then(|| rerun_data.fragment_id_queue.clone());
        let (page, page_not_found) = self.resolve_page(&rerun_data);
        self.pages_manager
            .set_current_page_script_hash(page.page_script_hash.clone());
        self.record_client_state(&rerun_data, &page);

        self.emit(ScriptRunnerEvent::ScriptStarted {
            page_script_hash: page.page_script_hash.clone(),
            fragment_ids_this_run: fragment_ids_this_run.clone(),
        });

        let mut ctx = self.new_context(&rerun_data, &page, fragment_ids_this_run.clone());
        if let Some(page_name) = page_not_found {
            ctx.enqueue_unchecked(ForwardMsg::new(ForwardMsgKind::PageNotFound { page_name }));
        }

        let script = match self.script_cache.get_or_load(&page.script_path) {
            Ok(script) => script,
            Err(e) => {
                warn!(path = %page.script_path.display(), error = %e, "Failed to load script");
                self.emit(ScriptRunnerEvent::ScriptStoppedWithCompileError {
                    error: e.to_exception_info(),
                });
                return self.requests.on_scriptrunner_ready();
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| match &fragment_ids_this_run {
            Some(fragment_ids) => self.run_fragments(&mut ctx, fragment_ids),
            None => script.run(&mut ctx),
        }));

        let outcome = match result {
            Ok(Ok(())) => RunOutcome::Finished,
            Ok(Err(ScriptError::Stop)) => RunOutcome::Stopped,
            Ok(Err(ScriptError::Rerun(data))) => RunOutcome::Rerun(*data),
            Ok(Err(e)) => RunOutcome::Exception(e.to_exception_info()),
            Err(payload) => RunOutcome::Exception(ExceptionInfo::new("Panic", panic_message(&*payload))),
        };

        match outcome {
            RunOutcome::Rerun(next) => {
                self.emit(ScriptRunnerEvent::ScriptStoppedForRerun);
                return ScriptRequest::Rerun(next);
            }
            RunOutcome::Stopped => {
                self.emit(ScriptRunnerEvent::ScriptStoppedWithSuccess);
            }
            RunOutcome::Exception(info) => {
                debug!(session_id = %self.session_id, error = %info, "Script raised an exception");
                ctx.enqueue_exception(info);
                self.on_script_finished(&ctx);
            }
            RunOutcome::Finished => self.on_script_finished(&ctx),
        }

        self.requests.on_scriptrunner_ready()
    }

    fn run_fragments(&self, ctx: &mut ScriptRunContext, fragment_ids: &[String]) -> Result<(), ScriptError> {
        for fragment_id in fragment_ids {
            match self.fragment_storage.get(fragment_id) {
                Some(fragment) => ctx.run_fragment(fragment_id, fragment.as_ref())?,
                None => warn!(
                    fragment_id = %fragment_id,
                    "Couldn't find fragment. This can happen if the fragment does not exist \
                     anymore after a full app rerun."
                ),
            }
        }
        Ok(())
    }

    /// Clean up after a run that reached its end.
    fn on_script_finished(self: &Arc<Self>, ctx: &ScriptRunContext) {
        let is_fragment_run = ctx.fragment_ids_this_run.is_some();
        {
            let mut session_state = self.session_state.lock().unwrap_or_else(PoisonError::into_inner);
            if is_fragment_run {
                session_state.reset_triggers();
            } else {
                session_state.on_script_finished(&ctx.widget_ids_this_run);
            }
        }

        if is_fragment_run {
            self.emit(ScriptRunnerEvent::FragmentStoppedWithSuccess);
        } else {
            self.fragment_storage.retain_only(&ctx.new_fragment_ids);
            self.emit(ScriptRunnerEvent::ScriptStoppedWithSuccess);
        }
    }

    /// Pick the page to run.
    ///
    /// Fragment runs stay on the current page. A page that cannot be found
    /// falls back to the main page; the returned name is reported to the
    /// client when pages exist to choose from.
    fn resolve_page(&self, rerun_data: &RerunData) -> (PageInfo, Option<String>) {
        let main_page = || self.pages_manager.get_main_page();

        if rerun_data.is_fragment_run() {
            let current = self.pages_manager.current_page_script_hash();
            let page = self
                .pages_manager
                .get_page_script_by_hash(&current)
                .unwrap_or_else(main_page);
            return (page, None);
        }

        if let Some(page) = self.pages_manager.find_page_info(
            &rerun_data.page_script_hash,
            rerun_data.page_name.as_deref(),
            None,
        ) {
            return (page, None);
        }

        let requested = !rerun_data.page_script_hash.is_empty()
            || rerun_data.page_name.as_deref().is_some_and(|n| !n.is_empty());
        let not_found = (requested && !self.pages_manager.get_pages().is_empty())
            .then(|| rerun_data.page_name.clone().unwrap_or_default());
        (main_page(), not_found)
    }

    fn record_client_state(&self, rerun_data: &RerunData, page: &PageInfo) {
        let widget_states = self
            .session_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_widget_states();
        let mut client_state = self.client_state.lock().unwrap_or_else(PoisonError::into_inner);
        client_state.query_string.clone_from(&rerun_data.query_string);
        client_state.page_script_hash.clone_from(&page.page_script_hash);
        client_state.widget_states = Some(widget_states);
    }

    fn new_context(
        self: &Arc<Self>,
        rerun_data: &RerunData,
        page: &PageInfo,
        fragment_ids_this_run: Option<Vec<String>>,
    ) -> ScriptRunContext {
        let this = Arc::clone(self);
        ScriptRunContext {
            session_id: self.session_id.clone(),
            page_script_hash: page.page_script_hash.clone(),
            query_string: rerun_data.query_string.clone(),
            user_info: self.user_info.clone(),
            fragment_ids_this_run,
            current_fragment_id: None,
            requests: Arc::clone(&self.requests),
            session_state: Arc::clone(&self.session_state),
            fragment_storage: Arc::clone(&self.fragment_storage),
            pages_manager: Arc::clone(&self.pages_manager),
            uploaded_file_mgr: Arc::clone(&self.uploaded_file_mgr),
            media_file_mgr: Arc::clone(&self.media_file_mgr),
            sink: Box::new(move |msg| this.emit(ScriptRunnerEvent::EnqueueForwardMsg(msg))),
            cursor: 0,
            widget_ids_this_run: HashSet::new(),
            new_fragment_ids: HashSet::new(),
        }
    }

    /// The main script this runner was created for.
    #[must_use]
    pub fn main_script_path(&self) -> &std::path::Path {
        &self.main_script_path
    }
}

impl ScriptRunnerControl for ScriptRunner {
    fn request_rerun(&self, rerun_data: RerunData) -> bool {
        self.requests.request_rerun(rerun_data)
    }

    fn request_stop(&self) {
        self.requests.request_stop();
    }

    fn start(self: Arc<Self>) -> Result<(), RunnerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyStarted);
        }
        std::thread::Builder::new()
            .name(format!("script-runner-{}", self.session_id))
            .spawn(move || self.run_script_thread())?;
        Ok(())
    }
}

impl fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("session_id", &self.session_id)
            .field("main_script_path", &self.main_script_path)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "script panicked".to_string())
}

/// Creates [`ScriptRunner`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadedRunnerFactory;

impl ScriptRunnerFactory for ThreadedRunnerFactory {
    fn create(&self, params: ScriptRunnerParams, listener: EventListener) -> Arc<dyn ScriptRunnerControl> {
        Arc::new(ScriptRunner::new(params, listener))
    }
}
