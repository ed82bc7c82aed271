#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crossbeam_channel::Receiver;
use scrobble_suite::{
    ClientInfo, ItemMetadata, JsonSessionStore, LiveSession, MediaServerGateway, MediaType,
    MetadataError, MetadataGateway, PlaybackState, PlayerInfo, ProgressResolver, ScrobbleAction,
    ScrobbleActionResolver, ScrobbleConfig, ScrobbleError, ScrobblePreferences, ServerInfo,
    Services, SessionChange, SessionReconciler, SessionStore, UpdateOutcome, UserInfo,
    WatchSession,
};

pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .is_test(true)
        .try_init();
}

pub fn movie(title: &str, duration: i64) -> ItemMetadata {
    ItemMetadata {
        title: Some(title.to_string()),
        media_type: Some(MediaType::Movie),
        duration,
        section: Some("Movies".to_string()),
    }
}

pub fn track(title: &str, duration: i64) -> ItemMetadata {
    ItemMetadata {
        title: Some(title.to_string()),
        media_type: Some(MediaType::Track),
        duration,
        section: Some("Music".to_string()),
    }
}

/// 内存中的媒体服务器。
#[derive(Default)]
pub struct FakeServer {
    sessions: Mutex<HashMap<String, LiveSession>>,
    clients: Mutex<HashMap<String, ClientInfo>>,
    multiuser: AtomicBool,
    failing: AtomicBool,
    pub session_lookups: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        let server = Self::default();
        server.multiuser.store(true, Ordering::SeqCst);
        Arc::new(server)
    }

    /// 让服务器报告 `session_key` 正在 `player` 上播放 `item_key`。
    pub fn play(&self, session_key: &str, item_key: &str, player: &str, user: &str) {
        let live = LiveSession {
            session_key: session_key.to_string(),
            item_key: item_key.to_string(),
            player: Some(PlayerInfo {
                machine_identifier: player.to_string(),
                title: Some(format!("{player} (player)")),
            }),
            user: Some(UserInfo {
                id: None,
                title: user.to_string(),
            }),
            view_offset: None,
        };
        self.sessions
            .lock()
            .unwrap()
            .insert(session_key.to_string(), live);
    }

    pub fn end(&self, session_key: &str) {
        self.sessions.lock().unwrap().remove(session_key);
    }

    pub fn add_client(&self, machine_identifier: &str, name: &str) {
        self.clients.lock().unwrap().insert(
            machine_identifier.to_string(),
            ClientInfo {
                machine_identifier: machine_identifier.to_string(),
                name: Some(name.to_string()),
                platform: Some("Android".to_string()),
            },
        );
    }

    pub fn set_multiuser(&self, multiuser: bool) {
        self.multiuser.store(multiuser, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> scrobble_suite::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ScrobbleError::Gateway("connection refused".to_string()));
        }
        Ok(())
    }
}

impl MediaServerGateway for FakeServer {
    fn get_session(&self, session_key: &str) -> scrobble_suite::Result<Option<LiveSession>> {
        self.session_lookups.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self.sessions.lock().unwrap().get(session_key).cloned())
    }

    fn get_sessions(&self) -> scrobble_suite::Result<Option<Vec<LiveSession>>> {
        self.check_failing()?;
        Ok(Some(self.sessions.lock().unwrap().values().cloned().collect()))
    }

    fn get_client(&self, machine_identifier: &str) -> scrobble_suite::Result<Option<ClientInfo>> {
        self.check_failing()?;
        Ok(self.clients.lock().unwrap().get(machine_identifier).cloned())
    }

    fn get_info(&self) -> scrobble_suite::Result<Option<ServerInfo>> {
        self.check_failing()?;
        Ok(Some(ServerInfo {
            multiuser: self.multiuser.load(Ordering::SeqCst),
            version: Some("1.40.2".to_string()),
        }))
    }
}

#[derive(Debug, Clone)]
pub enum MetadataEntry {
    Found(ItemMetadata),
    NotSupported,
    Failed,
}

/// 内存中的元数据服务。
#[derive(Default)]
pub struct FakeMetadata {
    items: Mutex<HashMap<String, MetadataEntry>>,
    pub lookups: AtomicUsize,
}

impl FakeMetadata {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, item_key: &str, entry: MetadataEntry) {
        self.items
            .lock()
            .unwrap()
            .insert(item_key.to_string(), entry);
    }
}

impl MetadataGateway for FakeMetadata {
    fn get_metadata(&self, item_key: &str) -> Result<Option<ItemMetadata>, MetadataError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        match self.items.lock().unwrap().get(item_key).cloned() {
            Some(MetadataEntry::Found(metadata)) => Ok(Some(metadata)),
            Some(MetadataEntry::NotSupported) => Err(MetadataError::NotSupported(format!(
                "条目 {item_key} 是音乐"
            ))),
            Some(MetadataEntry::Failed) => Err(MetadataError::Failed("timeout".to_string())),
            None => Ok(None),
        }
    }
}

/// 包装 [`ProgressResolver`]，记录每一次调用。
pub struct RecordingResolver {
    inner: ProgressResolver,
    fail_progress: AtomicBool,
    pub progress_calls: AtomicUsize,
    pub resolve_calls: AtomicUsize,
    pub actions: Mutex<Vec<ScrobbleAction>>,
}

impl RecordingResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ProgressResolver::default(),
            fail_progress: AtomicBool::new(false),
            progress_calls: AtomicUsize::new(0),
            resolve_calls: AtomicUsize::new(0),
            actions: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail_progress(&self, fail: bool) {
        self.fail_progress.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.progress_calls.load(Ordering::SeqCst) + self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> Vec<ScrobbleAction> {
        self.actions.lock().unwrap().clone()
    }
}

impl ScrobbleActionResolver for RecordingResolver {
    fn update_progress(&self, session: &mut WatchSession, view_offset: u64) -> bool {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_progress.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.update_progress(session, view_offset)
    }

    fn resolve_action(&self, session: &WatchSession, state: PlaybackState) -> Option<ScrobbleAction> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve_action(session, state)
    }

    fn handle_action(
        &self,
        session: &mut WatchSession,
        media_type: &MediaType,
        action: ScrobbleAction,
        state: PlaybackState,
    ) {
        self.actions.lock().unwrap().push(action);
        self.inner.handle_action(session, media_type, action, state);
    }

    fn handle_state_transition(&self, session: &mut WatchSession, state: PlaybackState) -> bool {
        self.inner.handle_state_transition(session, state)
    }
}

/// 一个连接了所有假协作者的协调器。
pub struct Harness {
    pub server: Arc<FakeServer>,
    pub metadata: Arc<FakeMetadata>,
    pub store: Arc<JsonSessionStore>,
    pub resolver: Arc<RecordingResolver>,
    pub config: Arc<RwLock<ScrobbleConfig>>,
    pub reconciler: Arc<SessionReconciler>,
    changes: Receiver<SessionChange>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ScrobbleConfig::default())
    }

    pub fn with_config(config: ScrobbleConfig) -> Self {
        init_logger();

        let server = FakeServer::new();
        let metadata = FakeMetadata::new();
        let store = Arc::new(JsonSessionStore::in_memory());
        let resolver = RecordingResolver::new();
        let config = Arc::new(RwLock::new(config));

        let services = Services {
            store: store.clone(),
            server: server.clone(),
            metadata: metadata.clone(),
            resolver: resolver.clone(),
        };
        let preferences: Arc<dyn ScrobblePreferences> = config.clone();
        let (change_tx, changes) = crossbeam_channel::unbounded();
        let reconciler =
            Arc::new(SessionReconciler::new(services, preferences).with_changes(change_tx));

        Self {
            server,
            metadata,
            store,
            resolver,
            config,
            reconciler,
            changes,
        }
    }

    /// 让服务器开始在 `living-room` 上为 `alice` 播放一部电影。
    pub fn start_movie(&self, session_key: &str, item_key: &str, duration: i64) {
        self.metadata
            .insert(item_key, MetadataEntry::Found(movie("Alien", duration)));
        self.server.play(session_key, item_key, "living-room", "alice");
    }

    pub fn update(&self, session_key: &str, state: PlaybackState, view_offset: u64) -> UpdateOutcome {
        self.reconciler.update(session_key, state, view_offset)
    }

    pub fn stored(&self, session_key: &str) -> Option<WatchSession> {
        self.store.load(session_key).unwrap()
    }

    pub fn changes(&self) -> Vec<SessionChange> {
        self.changes.try_iter().collect()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.config.write().unwrap().scrobbling_enabled = enabled;
    }
}
