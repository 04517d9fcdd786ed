use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use reflow_core::{
    BackMsg, BackMsgKind, CacheError, CacheStorageManager, ClientState, Connection, EventLoop,
    FileWatcherType, ForwardMsg, MediaFileManager, PageInfo, RerunData, RuntimeConfig, Signal,
    UploadFileUrlInfo, UploadedFileManager,
    config::ThemeConfig,
    protocol::{
        Delta, ExceptionInfo, FileUrlsRequest, ForwardMsgKind, ScriptFinishedStatus,
        SessionEventKind, SessionStatus,
    },
};
use reflow_pages::{FileChangeCallback, PagesError, PagesManager, SourceWatcher, SourceWatcherFactory};
use reflow_runner::{
    EventListener, FragmentStorage, RunnerError, ScriptCache, ScriptRegistry, ScriptRunnerControl,
    ScriptRunnerEvent, ScriptRunnerFactory, ScriptRunnerParams,
};
use serde_json::json;

use super::*;

// Fakes

struct FakeRunner {
    listener: EventListener,
    initial_rerun_data: RerunData,
    accept_rerun: AtomicBool,
    reruns: Mutex<Vec<RerunData>>,
    stops: AtomicUsize,
    starts: AtomicUsize,
}

impl FakeRunner {
    /// Report an event the way a runner thread does.
    fn emit(self: &Arc<Self>, event: ScriptRunnerEvent) {
        (self.listener)(Arc::clone(self) as Arc<dyn ScriptRunnerControl>, event);
    }

    fn rerun_calls(&self) -> Vec<RerunData> {
        self.reruns.lock().unwrap().clone()
    }

    fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ScriptRunnerControl for FakeRunner {
    fn request_rerun(&self, rerun_data: RerunData) -> bool {
        self.reruns.lock().unwrap().push(rerun_data);
        self.accept_rerun.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn start(self: Arc<Self>) -> Result<(), RunnerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeRunnerFactory {
    created: Mutex<Vec<Arc<FakeRunner>>>,
    accept_rerun: AtomicBool,
}

impl FakeRunnerFactory {
    fn runners(&self) -> Vec<Arc<FakeRunner>> {
        self.created.lock().unwrap().clone()
    }

    fn latest(&self) -> Arc<FakeRunner> {
        self.runners().last().cloned().unwrap()
    }

    fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl ScriptRunnerFactory for FakeRunnerFactory {
    fn create(&self, params: ScriptRunnerParams, listener: EventListener) -> Arc<dyn ScriptRunnerControl> {
        let runner = Arc::new(FakeRunner {
            listener,
            initial_rerun_data: params.initial_rerun_data,
            accept_rerun: AtomicBool::new(self.accept_rerun.load(Ordering::SeqCst)),
            reruns: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        });
        self.created.lock().unwrap().push(Arc::clone(&runner));
        runner
    }
}

struct FakeWatcher {
    changed: Signal<PathBuf>,
    closed: Arc<AtomicBool>,
    updates: Arc<AtomicUsize>,
}

impl SourceWatcher for FakeWatcher {
    fn register_file_change_callback(&mut self, callback: FileChangeCallback) -> Connection {
        self.changed.connect(move |path| callback(path))
    }

    fn update_watched_pages(&mut self) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeWatcherFactory {
    changed: Signal<PathBuf>,
    closed: Arc<AtomicBool>,
    updates: Arc<AtomicUsize>,
    created: AtomicUsize,
}

impl SourceWatcherFactory for FakeWatcherFactory {
    fn create(&self, _pages_manager: &Arc<PagesManager>) -> Result<Box<dyn SourceWatcher>, PagesError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(Box::new(FakeWatcher {
            changed: self.changed.clone(),
            closed: Arc::clone(&self.closed),
            updates: Arc::clone(&self.updates),
        }))
    }
}

#[derive(Default)]
struct RecordingUploads {
    removed: Mutex<Vec<String>>,
    requested: Mutex<Vec<(String, Vec<String>)>>,
}

impl UploadedFileManager for RecordingUploads {
    fn get_upload_urls(&self, session_id: &str, file_names: &[String]) -> Vec<UploadFileUrlInfo> {
        self.requested
            .lock()
            .unwrap()
            .push((session_id.to_string(), file_names.to_vec()));
        (1..=file_names.len())
            .map(|i| UploadFileUrlInfo {
                file_id: format!("file_{i}"),
                upload_url: format!("upload_file_url_{i}"),
                delete_url: format!("delete_file_url_{i}"),
            })
            .collect()
    }

    fn remove_session_files(&self, session_id: &str) {
        self.removed.lock().unwrap().push(session_id.to_string());
    }
}

#[derive(Default)]
struct RecordingMedia {
    cleared: Mutex<Vec<String>>,
    sweeps: AtomicUsize,
}

impl MediaFileManager for RecordingMedia {
    fn add(&self, _session_id: &str, _data: Vec<u8>, mime_type: &str) -> String {
        mime_type.to_string()
    }

    fn clear_session_refs(&self, session_id: &str) {
        self.cleared.lock().unwrap().push(session_id.to_string());
    }

    fn remove_orphaned_files(&self) {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeCaches {
    fail: AtomicBool,
    clears: AtomicUsize,
}

impl CacheStorageManager for FakeCaches {
    fn clear_all(&self) -> Result<(), CacheError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Storage("explode!".to_string()));
        }
        Ok(())
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    main_script_path: PathBuf,
    registry: Arc<ScriptRegistry>,
    runners: Arc<FakeRunnerFactory>,
    watchers: Arc<FakeWatcherFactory>,
    uploads: Arc<RecordingUploads>,
    media: Arc<RecordingMedia>,
    caches: Arc<FakeCaches>,
    services: SessionServices,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(configure: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let main_script_path = dir.path().join("app.py");
        std::fs::write(&main_script_path, "").unwrap();

        let mut config = RuntimeConfig::default();
        config.server.file_watcher_type = FileWatcherType::Poll;
        configure(&mut config);

        let registry = Arc::new(ScriptRegistry::new());
        let runners = Arc::new(FakeRunnerFactory::default());
        let watchers = Arc::new(FakeWatcherFactory::default());
        let uploads = Arc::new(RecordingUploads::default());
        let media = Arc::new(RecordingMedia::default());
        let caches = Arc::new(FakeCaches::default());

        let services = SessionServices {
            config: Arc::new(config),
            uploaded_file_mgr: Arc::clone(&uploads) as Arc<dyn UploadedFileManager>,
            media_file_mgr: Arc::clone(&media) as Arc<dyn MediaFileManager>,
            cache_storage_mgr: Arc::clone(&caches) as Arc<dyn CacheStorageManager>,
            script_cache: Arc::new(ScriptCache::new(
                Arc::clone(&registry) as Arc<dyn reflow_runner::ScriptLoader>,
            )),
            runner_factory: Arc::clone(&runners) as Arc<dyn ScriptRunnerFactory>,
            watcher_factory: Arc::clone(&watchers) as Arc<dyn SourceWatcherFactory>,
            secrets_changed: Signal::new(),
            config_changed: Signal::new(),
        };

        Self {
            dir,
            main_script_path,
            registry,
            runners,
            watchers,
            uploads,
            media,
            caches,
            services,
        }
    }

    fn session(&self) -> (AppSession, EventLoop<AppSession>) {
        let mut user_info = serde_json::Map::new();
        user_info.insert("email".to_string(), json!("test@example.com"));
        AppSession::with_event_loop(self.services.clone(), &self.main_script_path, user_info, None)
    }
}

fn kinds(session: &AppSession) -> Vec<&'static str> {
    session.queued_messages().iter().map(ForwardMsg::type_name).collect()
}

fn delta_msg() -> ForwardMsg {
    ForwardMsg::delta(vec![0, 0], Delta::new_element(json!("stale")))
}

fn status(run_on_save: bool, script_is_running: bool) -> ForwardMsgKind {
    ForwardMsgKind::SessionStatusChanged(SessionStatus {
        run_on_save,
        script_is_running,
    })
}

fn finished(status: ScriptFinishedStatus) -> ForwardMsgKind {
    ForwardMsgKind::ScriptFinished { status }
}

fn fragment_state(fragment_id: &str) -> ClientState {
    ClientState {
        fragment_id: Some(fragment_id.to_string()),
        ..ClientState::default()
    }
}

#[allow(clippy::unnecessary_wraps)]
fn noop_fragment(_ctx: &mut reflow_runner::ScriptRunContext) -> Result<(), reflow_runner::ScriptError> {
    Ok(())
}

fn started(page_script_hash: &str) -> ScriptRunnerEvent {
    ScriptRunnerEvent::ScriptStarted {
        page_script_hash: page_script_hash.to_string(),
        fragment_ids_this_run: None,
    }
}

// Identity and lifecycle

#[test]
fn test_session_ids() {
    let fixture = Fixture::new();
    let (first, _loop1) = fixture.session();
    let (second, _loop2) = fixture.session();
    assert_ne!(first.id(), second.id());
    assert_eq!(first.id().len(), 36);

    let event_loop = EventLoop::new();
    let custom = AppSession::new(
        fixture.services.clone(),
        &fixture.main_script_path,
        serde_json::Map::new(),
        Some("some_custom_session_id".to_string()),
        event_loop.handle(),
    );
    assert_eq!(custom.id(), "some_custom_session_id");
    assert_eq!(custom.state(), AppSessionState::AppNotRunning);
}

#[test]
fn test_shutdown_is_idempotent() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();

    session.shutdown();
    assert_eq!(session.state(), AppSessionState::ShutdownRequested);
    session.shutdown();
    assert_eq!(session.state(), AppSessionState::ShutdownRequested);

    assert_eq!(*fixture.uploads.removed.lock().unwrap(), vec![session.id().to_string()]);
    assert_eq!(*fixture.media.cleared.lock().unwrap(), vec![session.id().to_string()]);
    assert_eq!(fixture.media.sweeps.load(Ordering::SeqCst), 1);
    assert!(session.is_finished());
}

#[test]
fn test_shutdown_stops_running_scriptrunner_once() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    let runner = fixture.runners.latest();

    session.shutdown();
    session.shutdown();

    assert_eq!(runner.stop_calls(), 1);
    assert!(!session.is_finished());
}

#[test]
fn test_shutdown_releases_every_loop_handle() {
    let fixture = Fixture::new();
    let (mut session, event_loop) = fixture.session();

    // The session's own handle is the baseline.
    assert!(event_loop.handle_count() > 1);
    assert_eq!(fixture.services.secrets_changed.receiver_count(), 1);
    assert_eq!(fixture.services.config_changed.receiver_count(), 1);
    assert_eq!(fixture.watchers.changed.receiver_count(), 1);

    session.shutdown();

    assert_eq!(event_loop.handle_count(), 1);
    assert_eq!(fixture.services.secrets_changed.receiver_count(), 0);
    assert_eq!(fixture.services.config_changed.receiver_count(), 0);
    assert_eq!(fixture.watchers.changed.receiver_count(), 0);
    assert!(fixture.watchers.closed.load(Ordering::SeqCst));
    assert!(!session.has_local_sources_watcher());

    session.shutdown();
    assert_eq!(event_loop.handle_count(), 1);
}

#[test]
fn test_request_script_stop() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();

    // No runner: nothing to stop.
    session.request_script_stop();

    session.request_rerun(None).unwrap();
    session.request_script_stop();
    assert_eq!(fixture.runners.latest().stop_calls(), 1);
}

// Rerun decisions

#[test]
fn test_rerun_with_no_scriptrunner() {
    let fixture = Fixture::with_config(|c| c.runner.fast_reruns = false);
    let (mut session, _event_loop) = fixture.session();

    session.request_rerun(None).unwrap();

    assert_eq!(fixture.runners.count(), 1);
    let runner = fixture.runners.latest();
    assert_eq!(runner.initial_rerun_data, RerunData::default());
    assert_eq!(runner.starts.load(Ordering::SeqCst), 1);
    assert!(session.has_scriptrunner());
}

#[test]
fn test_rerun_with_active_scriptrunner() {
    let fixture = Fixture::with_config(|c| c.runner.fast_reruns = false);
    fixture.runners.accept_rerun.store(true, Ordering::SeqCst);
    let (mut session, _event_loop) = fixture.session();
    session.request_rerun(None).unwrap();

    session.request_rerun(None).unwrap();

    assert_eq!(fixture.runners.count(), 1);
    assert_eq!(fixture.runners.latest().rerun_calls(), vec![RerunData::default()]);
}

#[test]
fn test_rerun_with_stopped_scriptrunner() {
    let fixture = Fixture::with_config(|c| c.runner.fast_reruns = false);
    let (mut session, _event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    let stopped = fixture.runners.latest();

    session.request_rerun(None).unwrap();

    assert_eq!(stopped.rerun_calls(), vec![RerunData::default()]);
    assert_eq!(fixture.runners.count(), 2);
    assert_eq!(fixture.runners.latest().initial_rerun_data, RerunData::default());
}

#[test]
fn test_fast_rerun_replaces_scriptrunner() {
    let fixture = Fixture::new();
    fixture.runners.accept_rerun.store(true, Ordering::SeqCst);
    let (mut session, _event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    let old = fixture.runners.latest();

    session.request_rerun(None).unwrap();

    assert!(old.rerun_calls().is_empty());
    assert_eq!(old.stop_calls(), 1);
    assert_eq!(fixture.runners.count(), 2);
}

#[test]
fn test_rerun_fragment_requests_existing_scriptrunner() {
    let fixture = Fixture::new();
    fixture.runners.accept_rerun.store(true, Ordering::SeqCst);
    let (mut session, _event_loop) = fixture.session();
    session
        .fragment_storage()
        .set("my_fragment_id", Arc::new(noop_fragment));
    session.request_rerun(None).unwrap();
    let active = fixture.runners.latest();

    session.request_rerun(Some(fragment_state("my_fragment_id"))).unwrap();

    let calls = active.rerun_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].fragment_id_queue, vec!["my_fragment_id".to_string()]);
    assert_eq!(active.stop_calls(), 0);
    assert_eq!(fixture.runners.count(), 1);
}

#[test]
fn test_rerun_for_missing_fragment_is_ignored() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    let active = fixture.runners.latest();

    session.request_rerun(Some(fragment_state("my_fragment_id"))).unwrap();

    assert!(active.rerun_calls().is_empty());
    assert_eq!(active.stop_calls(), 0);
    assert_eq!(fixture.runners.count(), 1);
}

#[test]
fn test_rerun_after_shutdown_is_discarded() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();
    session.shutdown();

    session.request_rerun(None).unwrap();
    assert_eq!(fixture.runners.count(), 0);
}

// Runner events

#[test]
fn test_script_started_clears_queue_and_announces_session() {
    let fixture = Fixture::new();
    let (mut session, mut event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    session.enqueue_forward_msg(delta_msg());

    fixture.runners.latest().emit(started(""));
    assert_eq!(kinds(&session), vec!["delta"]);

    event_loop.run_pending(&mut session);

    assert_eq!(kinds(&session), vec!["new_session", "session_status_changed"]);
    assert_eq!(session.queued_messages()[1].kind, status(false, true));
    assert_eq!(session.state(), AppSessionState::AppIsRunning);
}

#[test]
fn test_new_session_message_contents() {
    let fixture = Fixture::with_config(|c| {
        c.theme = Some(ThemeConfig {
            text_color: Some("black".to_string()),
            ..ThemeConfig::default()
        });
    });
    let (mut session, mut event_loop) = fixture.session();
    let main_hash = session.pages_manager().main_script_hash().to_string();
    session
        .pages_manager()
        .set_pages(vec![
            PageInfo {
                page_script_hash: main_hash.clone(),
                page_name: "page_1".to_string(),
                icon: String::new(),
                script_path: fixture.main_script_path.clone(),
                url_pathname: String::new(),
            },
            PageInfo {
                page_script_hash: "hash2".to_string(),
                page_name: "page_2".to_string(),
                icon: "🎉".to_string(),
                script_path: fixture.dir.path().join("page_2.py"),
                url_pathname: "page_2".to_string(),
            },
        ])
        .unwrap();
    session.request_rerun(None).unwrap();

    fixture.runners.latest().emit(ScriptRunnerEvent::ScriptStarted {
        page_script_hash: "hash2".to_string(),
        fragment_ids_this_run: Some(vec!["my_fragment_id".to_string()]),
    });
    event_loop.run_pending(&mut session);

    let ForwardMsgKind::NewSession(new_session) = &session.queued_messages()[0].kind else {
        panic!("expected new session");
    };
    assert_eq!(new_session.name, "app");
    assert_eq!(new_session.page_script_hash, "hash2");
    assert_eq!(new_session.main_script_hash, main_hash);
    assert_eq!(new_session.fragment_ids_this_run, vec!["my_fragment_id".to_string()]);
    assert!(new_session.config.allow_run_on_save);
    assert_eq!(new_session.config.max_cached_message_age, 2);
    assert_eq!(
        new_session.custom_theme.as_ref().unwrap().text_color.as_deref(),
        Some("black")
    );
    assert_eq!(new_session.initialize.user_info["email"], json!("test@example.com"));
    assert_eq!(new_session.initialize.session_id, session.id());

    let pages: Vec<(&str, &str, bool)> = new_session
        .app_pages
        .iter()
        .map(|p| (p.page_name.as_str(), p.icon.as_str(), p.is_default))
        .collect();
    assert_eq!(pages, vec![("page 1", "", true), ("page 2", "🎉", false)]);

    assert_eq!(session.client_state().page_script_hash, "hash2");
}

#[test]
fn test_events_are_handled_on_the_loop_only() {
    let fixture = Fixture::new();
    let (mut session, mut event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    let runner = fixture.runners.latest();

    std::thread::spawn(move || runner.emit(started("")))
        .join()
        .unwrap();

    assert!(session.queued_messages().is_empty());
    assert_eq!(event_loop.run_pending(&mut session), 1);
    assert_eq!(session.queued_messages().len(), 2);
}

#[test]
#[should_panic(expected = "off the session's event loop")]
fn test_event_handler_asserts_off_event_loop() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();
    let other: EventLoop<AppSession> = EventLoop::new();

    session.handle_scriptrunner_event_on_event_loop(other.id(), None, started(""));
}

#[test]
fn test_ignore_events_from_noncurrent_scriptrunner() {
    let fixture = Fixture::new();
    let (mut session, mut event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    let stale = fixture.runners.latest();
    session.request_rerun(None).unwrap();
    let current = fixture.runners.latest();

    stale.emit(ScriptRunnerEvent::EnqueueForwardMsg(delta_msg()));
    stale.emit(started(""));
    event_loop.run_pending(&mut session);
    assert!(session.queued_messages().is_empty());
    assert_eq!(session.state(), AppSessionState::AppNotRunning);

    current.emit(ScriptRunnerEvent::EnqueueForwardMsg(delta_msg()));
    event_loop.run_pending(&mut session);
    assert_eq!(kinds(&session), vec!["delta"]);
}

#[test]
fn test_stopped_events_finish_the_run() {
    let fixture = Fixture::new();
    let (mut session, mut event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    let runner = fixture.runners.latest();

    runner.emit(started(""));
    runner.emit(ScriptRunnerEvent::ScriptStoppedForRerun);
    event_loop.run_pending(&mut session);
    assert_eq!(session.state(), AppSessionState::AppNotRunning);

    let tail: Vec<ForwardMsgKind> = session.flush_browser_queue()[2..]
        .iter()
        .map(|m| m.kind.clone())
        .collect();
    assert_eq!(
        tail,
        vec![
            finished(ScriptFinishedStatus::FinishedEarlyForRerun),
            status(false, false),
        ]
    );

    runner.emit(started(""));
    runner.emit(ScriptRunnerEvent::FragmentStoppedWithSuccess);
    event_loop.run_pending(&mut session);
    assert_eq!(
        session.queued_messages()[2].kind,
        finished(ScriptFinishedStatus::FinishedFragmentRunSuccessfully)
    );
}

#[test]
fn test_compile_error_reports_exception_event() {
    let fixture = Fixture::new();
    let (mut session, mut event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    let runner = fixture.runners.latest();
    let error = ExceptionInfo::new("CompileError", "bad syntax");

    runner.emit(started(""));
    runner.emit(ScriptRunnerEvent::ScriptStoppedWithCompileError { error: error.clone() });
    event_loop.run_pending(&mut session);

    let tail: Vec<ForwardMsgKind> = session.queued_messages()[2..]
        .iter()
        .map(|m| m.kind.clone())
        .collect();
    assert_eq!(
        tail,
        vec![
            finished(ScriptFinishedStatus::FinishedWithCompileError),
            ForwardMsgKind::SessionEvent {
                event: SessionEventKind::ScriptCompilationException(error),
            },
            status(false, false),
        ]
    );
}

#[test]
fn test_shutdown_event_adopts_client_state() {
    let fixture = Fixture::new();
    let (mut session, mut event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    let runner = fixture.runners.latest();
    let client_state = ClientState {
        query_string: "foo=bar".to_string(),
        ..ClientState::default()
    };

    session.shutdown();
    fixture.media.cleared.lock().unwrap().clear();
    runner.emit(ScriptRunnerEvent::Shutdown {
        client_state: client_state.clone(),
    });
    event_loop.run_pending(&mut session);

    assert_eq!(session.client_state(), &client_state);
    assert!(!session.has_scriptrunner());
    assert!(session.is_finished());
    assert_eq!(*fixture.media.cleared.lock().unwrap(), vec![session.id().to_string()]);
}

// Back messages

#[test]
fn test_handle_backmsg_exception() {
    let fixture = Fixture::new();
    fixture.caches.fail.store(true, Ordering::SeqCst);
    let (mut session, mut event_loop) = fixture.session();
    session.enqueue_forward_msg(delta_msg());

    session.handle_backmsg(BackMsg::new(BackMsgKind::ClearCache));

    // Nothing happens until the loop runs.
    assert_eq!(kinds(&session), vec!["delta"]);
    event_loop.run_pending(&mut session);

    let queued: Vec<ForwardMsgKind> = session.queued_messages().iter().map(|m| m.kind.clone()).collect();
    assert_eq!(queued.len(), 6);
    assert_eq!(queued[0], finished(ScriptFinishedStatus::FinishedSuccessfully));
    let ForwardMsgKind::NewSession(new_session) = &queued[1] else {
        panic!("expected new session, got {:?}", queued[1]);
    };
    assert_eq!(new_session.page_script_hash, "");
    assert_eq!(queued[2], status(false, true));
    assert_eq!(queued[3], finished(ScriptFinishedStatus::FinishedSuccessfully));
    assert_eq!(queued[4], status(false, false));
    let ForwardMsgKind::Exception(info) = &queued[5] else {
        panic!("expected exception, got {:?}", queued[5]);
    };
    assert_eq!(info.type_name, "CacheError");
    assert!(info.message.contains("explode!"));
    assert_eq!(session.state(), AppSessionState::AppNotRunning);
}

#[test]
fn test_handle_backmsg_exception_while_running() {
    let fixture = Fixture::new();
    fixture.caches.fail.store(true, Ordering::SeqCst);
    let (mut session, mut event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    fixture.runners.latest().emit(started(""));
    event_loop.run_pending(&mut session);
    session.flush_browser_queue();
    assert_eq!(session.state(), AppSessionState::AppIsRunning);

    session.handle_backmsg(BackMsg::new(BackMsgKind::ClearCache));
    event_loop.run_pending(&mut session);

    assert_eq!(
        kinds(&session),
        vec![
            "script_finished",
            "session_status_changed",
            "new_session",
            "session_status_changed",
            "script_finished",
            "session_status_changed",
            "exception",
        ]
    );
    assert_eq!(session.queued_messages()[1].kind, status(false, false));
    assert_eq!(session.queued_messages()[3].kind, status(false, true));
    assert_eq!(session.state(), AppSessionState::AppNotRunning);
    assert!(session.has_scriptrunner());
}

#[test]
fn test_clear_cache_resets_session_state() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();
    session.session_state().lock().unwrap().set("foo", json!("bar"));

    session.handle_backmsg(BackMsg::new(BackMsgKind::ClearCache));

    assert_eq!(fixture.caches.clears.load(Ordering::SeqCst), 1);
    assert!(session.session_state().lock().unwrap().get("foo").is_none());
}

#[test]
fn test_handle_backmsg_records_debug_id() {
    let fixture = Fixture::new();
    let (mut session, mut event_loop) = fixture.session();

    session.handle_backmsg(
        BackMsg::new(BackMsgKind::RerunScript(ClientState::default())).with_debug_id("some backmsg"),
    );
    assert_eq!(session.debug_last_backmsg_id(), Some("some backmsg"));

    session.enqueue_forward_msg(delta_msg());
    assert_eq!(
        session.queued_messages()[0].debug_last_backmsg_id.as_deref(),
        Some("some backmsg")
    );

    fixture.runners.latest().emit(ScriptRunnerEvent::ScriptStoppedForRerun);
    event_loop.run_pending(&mut session);
    assert_eq!(session.debug_last_backmsg_id(), Some("some backmsg"));

    fixture.runners.latest().emit(ScriptRunnerEvent::ScriptStoppedWithSuccess);
    event_loop.run_pending(&mut session);
    assert_eq!(session.debug_last_backmsg_id(), None);
}

#[test]
fn test_set_run_on_save() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();

    session.handle_backmsg(BackMsg::new(BackMsgKind::SetRunOnSave { value: true }));

    assert!(session.run_on_save());
    assert_eq!(session.queued_messages()[0].kind, status(true, false));
}

#[test]
fn test_stop_script_and_heartbeat() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();
    session.request_rerun(None).unwrap();

    session.handle_backmsg(BackMsg::new(BackMsgKind::AppHeartbeat));
    assert!(session.queued_messages().is_empty());
    assert_eq!(fixture.runners.latest().stop_calls(), 0);

    session.handle_backmsg(BackMsg::new(BackMsgKind::StopScript));
    assert_eq!(fixture.runners.latest().stop_calls(), 1);
}

#[test]
fn test_handle_file_urls_request() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();
    let file_names: Vec<String> = ["file_1", "file_2", "file_3"].map(String::from).to_vec();

    session.handle_backmsg(BackMsg::new(BackMsgKind::FileUrlsRequest(FileUrlsRequest {
        request_id: "my_id".to_string(),
        file_names: file_names.clone(),
        session_id: session.id().to_string(),
    })));

    assert_eq!(
        *fixture.uploads.requested.lock().unwrap(),
        vec![(session.id().to_string(), file_names)]
    );
    let ForwardMsgKind::FileUrlsResponse(response) = &session.queued_messages()[0].kind else {
        panic!("expected file urls response");
    };
    assert_eq!(response.response_id, "my_id");
    assert_eq!(response.file_urls.len(), 3);
    assert_eq!(response.file_urls[2].file_id, "file_3");
    assert_eq!(response.file_urls[2].upload_url, "upload_file_url_3");
    assert_eq!(response.file_urls[2].delete_url, "delete_file_url_3");
}

// File watching

#[test]
fn test_source_change_without_run_on_save_notifies_client() {
    let fixture = Fixture::new();
    let (mut session, mut event_loop) = fixture.session();
    fixture.registry.register_fn(&fixture.main_script_path, |_| Ok(()));
    fixture
        .services
        .script_cache
        .get_or_load(&fixture.main_script_path)
        .unwrap();

    fixture.watchers.changed.emit(&fixture.main_script_path);
    event_loop.run_pending(&mut session);

    assert!(fixture.services.script_cache.is_empty());
    assert_eq!(
        session.queued_messages()[0].kind,
        ForwardMsgKind::SessionEvent {
            event: SessionEventKind::ScriptChangedOnDisk,
        }
    );
    assert_eq!(fixture.runners.count(), 0);
}

#[test]
fn test_run_on_save_reruns_with_client_state() {
    let fixture = Fixture::with_config(|c| c.server.run_on_save = true);
    let (mut session, mut event_loop) = fixture.session();
    session.request_rerun(None).unwrap();
    fixture.runners.latest().emit(ScriptRunnerEvent::Shutdown {
        client_state: ClientState {
            query_string: "q=1".to_string(),
            ..ClientState::default()
        },
    });
    event_loop.run_pending(&mut session);

    fixture.services.config_changed.emit(&());
    event_loop.run_pending(&mut session);

    assert_eq!(fixture.runners.count(), 2);
    assert_eq!(fixture.runners.latest().initial_rerun_data.query_string, "q=1");
}

#[test]
fn test_secrets_change_is_treated_as_source_change() {
    let fixture = Fixture::new();
    let (mut session, mut event_loop) = fixture.session();

    fixture
        .services
        .secrets_changed
        .emit(&fixture.dir.path().join("secrets.toml"));
    event_loop.run_pending(&mut session);

    assert_eq!(kinds(&session), vec!["session_event"]);
}

#[test]
fn test_only_current_page_changes_rerun() {
    let fixture = Fixture::with_config(|c| c.server.run_on_save = true);
    let (mut session, mut event_loop) = fixture.session();
    let page1 = fixture.dir.path().join("page1.py");
    let page2 = fixture.dir.path().join("page2.py");
    session
        .pages_manager()
        .set_pages(vec![
            PageInfo {
                page_script_hash: "hash1".to_string(),
                page_name: "page1".to_string(),
                icon: String::new(),
                script_path: page1.clone(),
                url_pathname: String::new(),
            },
            PageInfo {
                page_script_hash: "hash2".to_string(),
                page_name: "page2".to_string(),
                icon: String::new(),
                script_path: page2.clone(),
                url_pathname: "page2".to_string(),
            },
        ])
        .unwrap();
    session.request_rerun(None).unwrap();
    fixture.runners.latest().emit(started("hash2"));
    event_loop.run_pending(&mut session);
    fixture.runners.accept_rerun.store(true, Ordering::SeqCst);

    session.on_source_file_changed(Some(&page1));
    assert_eq!(fixture.runners.count(), 1);

    session.on_source_file_changed(Some(&page2));
    assert_eq!(fixture.runners.count(), 2);

    session.on_source_file_changed(Some(&fixture.dir.path().join("utils.py")));
    assert_eq!(fixture.runners.count(), 3);
}

#[test]
fn test_pages_changed_notifies_client_and_watcher() {
    let fixture = Fixture::new();
    std::fs::create_dir(fixture.dir.path().join("pages")).unwrap();
    std::fs::write(fixture.dir.path().join("pages").join("page_1.py"), "").unwrap();
    let (mut session, mut event_loop) = fixture.session();

    session
        .pages_manager()
        .on_pages_changed(&fixture.dir.path().join("pages").join("page_1.py"));
    event_loop.run_pending(&mut session);

    let ForwardMsgKind::PagesChanged { app_pages } = &session.queued_messages()[0].kind else {
        panic!("expected pages changed");
    };
    assert_eq!(app_pages.len(), 2);
    assert!(app_pages[0].is_default);
    assert_eq!(app_pages[1].page_name, "page 1");
    assert_eq!(fixture.watchers.updates.load(Ordering::SeqCst), 1);
}

#[test]
fn test_register_file_watchers_recreates_watcher() {
    let fixture = Fixture::new();
    let (mut session, _event_loop) = fixture.session();
    assert!(session.has_local_sources_watcher());

    session.disconnect_file_watchers();
    assert!(!session.has_local_sources_watcher());

    session.register_file_watchers();
    assert!(session.has_local_sources_watcher());
    assert_eq!(fixture.watchers.created.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.watchers.changed.receiver_count(), 1);
    assert_eq!(fixture.services.secrets_changed.receiver_count(), 1);
}

#[test]
fn test_no_watchers_when_file_watching_disabled() {
    let fixture = Fixture::with_config(|c| c.server.file_watcher_type = FileWatcherType::None);
    let (session, event_loop) = fixture.session();

    assert!(!session.has_local_sources_watcher());
    assert_eq!(fixture.watchers.created.load(Ordering::SeqCst), 0);
    assert_eq!(event_loop.handle_count(), 1);
}
