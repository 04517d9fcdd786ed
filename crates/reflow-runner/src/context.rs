//! The API a running script sees.

use std::{collections::HashSet, fmt, sync::Arc};

use reflow_core::{
    ForwardMsg, MediaFileManager, PageHash, PageInfo, RerunData, SessionId, SharedSessionState,
    UploadedFileManager, UserInfo,
    protocol::{Delta, ExceptionInfo, ForwardMsgKind, WidgetValue},
};
use reflow_pages::PagesManager;
use serde_json::Value;

use crate::{
    Fragment, FragmentStorage, ScriptError,
    requests::{ScriptRequest, ScriptRequests},
};

/// Delivers a message produced by the script to the session.
pub type MessageSink = Box<dyn Fn(ForwardMsg) + Send>;

impl From<ScriptRequest> for ScriptError {
    fn from(request: ScriptRequest) -> Self {
        match request {
            ScriptRequest::Rerun(data) => Self::Rerun(Box::new(data)),
            ScriptRequest::Stop => Self::Stop,
        }
    }
}

/// Per-run context handed to scripts and fragments.
///
/// Every call that produces output is a checkpoint: a pending stop or
/// rerun surfaces there as an error the script propagates with `?`.
pub struct ScriptRunContext {
    pub(crate) session_id: SessionId,
    pub(crate) page_script_hash: PageHash,
    pub(crate) query_string: String,
    pub(crate) user_info: UserInfo,
    pub(crate) fragment_ids_this_run: Option<Vec<String>>,
    pub(crate) current_fragment_id: Option<String>,
    pub(crate) requests: Arc<ScriptRequests>,
    pub(crate) session_state: SharedSessionState,
    pub(crate) fragment_storage: Arc<dyn FragmentStorage>,
    pub(crate) pages_manager: Arc<PagesManager>,
    pub(crate) uploaded_file_mgr: Arc<dyn UploadedFileManager>,
    pub(crate) media_file_mgr: Arc<dyn MediaFileManager>,
    pub(crate) sink: MessageSink,
    pub(crate) cursor: u32,
    pub(crate) widget_ids_this_run: HashSet<String>,
    pub(crate) new_fragment_ids: HashSet<String>,
}

impl ScriptRunContext {
    /// Yield to the runner.
    ///
    /// # Errors
    /// Returns `Stop` or `Rerun` if the run must end here.
    pub fn checkpoint(&self) -> Result<(), ScriptError> {
        match self.requests.on_scriptrunner_yield() {
            Some(request) => Err(request.into()),
            None => Ok(()),
        }
    }

    /// Send a message to the client.
    ///
    /// Deltas produced inside a fragment are tagged with its id.
    ///
    /// # Errors
    /// Returns `Stop` or `Rerun` if the run must end here.
    pub fn enqueue(&mut self, mut msg: ForwardMsg) -> Result<(), ScriptError> {
        self.checkpoint()?;
        if let (ForwardMsgKind::Delta(delta), Some(fragment_id)) =
            (&mut msg.kind, &self.current_fragment_id)
        {
            delta.fragment_id.get_or_insert_with(|| fragment_id.clone());
        }
        (self.sink)(msg);
        Ok(())
    }

    /// Append an element to the main container.
    ///
    /// # Errors
    /// Returns `Stop` or `Rerun` if the run must end here.
    pub fn new_element(&mut self, element: Value) -> Result<(), ScriptError> {
        let path = self.next_delta_path();
        self.enqueue(ForwardMsg::delta(path, Delta::new_element(element)))
    }

    /// Append a block to the main container.
    ///
    /// # Errors
    /// Returns `Stop` or `Rerun` if the run must end here.
    pub fn add_block(&mut self, block: Value) -> Result<(), ScriptError> {
        let path = self.next_delta_path();
        self.enqueue(ForwardMsg::delta(path, Delta::add_block(block)))
    }

    fn next_delta_path(&mut self) -> Vec<u32> {
        let path = vec![0, self.cursor];
        self.cursor += 1;
        path
    }

    /// Render an uncaught exception at the current position.
    ///
    /// Not a checkpoint: the run is already ending.
    pub(crate) fn enqueue_exception(&mut self, info: ExceptionInfo) {
        let mut msg = ForwardMsg::exception(info);
        msg.metadata.delta_path = self.next_delta_path();
        (self.sink)(msg);
    }

    /// Send a message without consulting pending requests.
    pub(crate) fn enqueue_unchecked(&self, msg: ForwardMsg) {
        (self.sink)(msg);
    }

    /// Read a widget's value, marking the widget as live in this run.
    pub fn widget_value(&mut self, widget_id: &str) -> Option<WidgetValue> {
        self.widget_ids_this_run.insert(widget_id.to_string());
        self.session_state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .widget_value(widget_id)
            .cloned()
    }

    /// Whether a trigger widget fired for this run.
    pub fn is_triggered(&mut self, widget_id: &str) -> bool {
        self.widget_value(widget_id)
            .is_some_and(|value| value.is_set_trigger())
    }

    /// The session's widget and user state.
    #[must_use]
    pub const fn session_state(&self) -> &SharedSessionState {
        &self.session_state
    }

    /// Register a fragment and run it as part of this run.
    ///
    /// # Errors
    /// Returns whatever the fragment returns.
    pub fn fragment<F>(&mut self, fragment_id: &str, fragment: F) -> Result<(), ScriptError>
    where
        F: Fn(&mut Self) -> Result<(), ScriptError> + Send + Sync + 'static,
    {
        let fragment: Arc<dyn Fragment> = Arc::new(fragment);
        self.fragment_storage.set(fragment_id, Arc::clone(&fragment));
        self.new_fragment_ids.insert(fragment_id.to_string());
        self.run_fragment(fragment_id, fragment.as_ref())
    }

    pub(crate) fn run_fragment(
        &mut self,
        fragment_id: &str,
        fragment: &dyn Fragment,
    ) -> Result<(), ScriptError> {
        let outer = self.current_fragment_id.replace(fragment_id.to_string());
        let result = fragment.run(self);
        self.current_fragment_id = outer;
        result
    }

    /// Request a full rerun of the current page and end this run.
    ///
    /// # Errors
    /// Always returns `Rerun`, or `Stop` if the runner is stopping.
    pub fn rerun(&self) -> Result<(), ScriptError> {
        self.requests.request_rerun(RerunData {
            query_string: self.query_string.clone(),
            page_script_hash: self.page_script_hash.clone(),
            ..RerunData::default()
        });
        Err(self
            .requests
            .on_scriptrunner_yield()
            .map_or(ScriptError::Stop, ScriptError::from))
    }

    /// Stop the script.
    ///
    /// # Errors
    /// Always returns `Stop`.
    pub fn stop(&self) -> Result<(), ScriptError> {
        self.requests.request_stop();
        Err(ScriptError::Stop)
    }

    /// Declare the app's pages.
    ///
    /// # Errors
    /// Returns an exception if two pages share a hash.
    pub fn set_pages(&self, pages: Vec<PageInfo>) -> Result<(), ScriptError> {
        self.pages_manager
            .set_pages(pages)
            .map_err(|e| ScriptError::exception("PagesError", e.to_string()))
    }

    /// Store media for this session and return its file id.
    ///
    /// The file stays referenced until the session shuts down.
    ///
    /// # Errors
    /// Returns `Stop` or `Rerun` if the run must end here.
    pub fn add_media(&self, data: Vec<u8>, mime_type: &str) -> Result<String, ScriptError> {
        self.checkpoint()?;
        Ok(self.media_file_mgr.add(&self.session_id, data, mime_type))
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn page_script_hash(&self) -> &str {
        &self.page_script_hash
    }

    #[must_use]
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    #[must_use]
    pub const fn user_info(&self) -> &UserInfo {
        &self.user_info
    }

    /// Fragments being rerun, or `None` for a full run.
    #[must_use]
    pub fn fragment_ids_this_run(&self) -> Option<&[String]> {
        self.fragment_ids_this_run.as_deref()
    }

    /// The fragment currently executing, if any.
    #[must_use]
    pub fn current_fragment_id(&self) -> Option<&str> {
        self.current_fragment_id.as_deref()
    }

    #[must_use]
    pub fn pages_manager(&self) -> &Arc<PagesManager> {
        &self.pages_manager
    }

    #[must_use]
    pub fn uploaded_file_mgr(&self) -> &Arc<dyn UploadedFileManager> {
        &self.uploaded_file_mgr
    }
}

impl fmt::Debug for ScriptRunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRunContext")
            .field("session_id", &self.session_id)
            .field("page_script_hash", &self.page_script_hash)
            .field("fragment_ids_this_run", &self.fragment_ids_this_run)
            .field("current_fragment_id", &self.current_fragment_id)
            .finish_non_exhaustive()
    }
}
