#![warn(missing_docs)]

//! 一个用于跟踪媒体服务器播放会话、并据此驱动 scrobble 上报的 Rust 库。
//!
//! `scrobble-suite` 接收媒体服务器发出的播放事件（可能重复、乱序或相互竞争），
//! 对照服务器上的实时状态把它们整理成持久化的观看会话记录，判断会话是否有效、
//! 是否过期、是否应当丢弃，并把通过检查的会话交给动作解析器决定何时上报
//! 开始、暂停、停止和看完。
//!
//! ## 核心功能
//!
//! * **会话协调**: [`SessionReconciler`] 处理跳转、中途换片、元数据缺失、
//!   被过滤的客户端等所有边界情况，每条事件都只会落入“没有会话”、
//!   “会话被忽略”、“正常处理”三种结果之一，从不以错误的形式失败。
//! * **一次性任务**: [`Task`] 提供最多执行一次、可取消、可被多个调用方等待的
//!   后台任务原语。
//! * **多种事件来源**: 推送通知 ([`WebSocketScrobbler`]) 和服务器日志
//!   ([`LoggingScrobbler`]) 两种方式共享同一套协调逻辑。
//! * **异步事件驱动**: 所有处理都在一个独立的后台工作线程中进行，
//!   通过通道与主应用通信，不会阻塞你的应用主线程。
//!
//! ## 使用方法
//!
//! 与后台服务交互的入口是 [`ScrobblerManager::start()`] 函数。
//!
//! 1.  实现 [`MediaServerGateway`] 和 [`MetadataGateway`]，把它们连同
//!     [`ScrobbleConfig`] 一起交给 `ScrobblerManager::start()`。
//! 2.  它会返回一个元组 `(ScrobbleController, mpsc::Receiver<ScrobbleUpdate>)`。
//! 3.  [`ScrobbleController`] 是你向后台服务发送指令的句柄。它包含一个 `command_tx`
//!     字段，用于发送 [`ScrobbleCommand`]。
//! 4.  `mpsc::Receiver<ScrobbleUpdate>` 是你接收所有来自后台的状态更新和事件的通道。
//! 5.  当你的应用退出时，务必调用 [`ScrobbleController::shutdown()`] 来优雅地关闭后台线程，
//!     会话记录会在退出前落盘。
//!
//! ## 示例
//!
//! ```no_run
//! use std::sync::Arc;
//! use scrobble_suite::{
//!     ClientInfo, ItemMetadata, LiveSession, MediaServerGateway, MetadataError,
//!     MetadataGateway, PlaybackEvent, PlaybackState, ScrobbleConfig, ScrobbleUpdate,
//!     ScrobblerManager, ServerInfo,
//! };
//!
//! struct MyServer;
//!
//! impl MediaServerGateway for MyServer {
//!     fn get_session(&self, _key: &str) -> scrobble_suite::Result<Option<LiveSession>> {
//!         Ok(None)
//!     }
//!     fn get_sessions(&self) -> scrobble_suite::Result<Option<Vec<LiveSession>>> {
//!         Ok(Some(Vec::new()))
//!     }
//!     fn get_client(&self, _id: &str) -> scrobble_suite::Result<Option<ClientInfo>> {
//!         Ok(None)
//!     }
//!     fn get_info(&self) -> scrobble_suite::Result<Option<ServerInfo>> {
//!         Ok(None)
//!     }
//! }
//!
//! impl MetadataGateway for MyServer {
//!     fn get_metadata(&self, _item: &str) -> Result<Option<ItemMetadata>, MetadataError> {
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Arc::new(MyServer);
//!     let (controller, mut update_rx) =
//!         ScrobblerManager::start(ScrobbleConfig::default(), server.clone(), server)?;
//!
//!     let update_task = tokio::spawn(async move {
//!         while let Some(update) = update_rx.recv().await {
//!             match update {
//!                 ScrobbleUpdate::Action { session_key, action, progress } => {
//!                     println!("会话 {session_key}: {action:?} ({progress:?})");
//!                 }
//!                 ScrobbleUpdate::Error(e) => eprintln!("错误: {e}"),
//!                 _ => { /* 处理其他更新 */ }
//!             }
//!         }
//!     });
//!
//!     controller
//!         .send_event(PlaybackEvent::new("12", PlaybackState::Playing, 30_000))
//!         .await?;
//!
//!     controller.shutdown().await?;
//!     update_task.await?;
//!     Ok(())
//! }
//! ```

mod api;
mod config;
mod error;
mod gateway;
mod method;
mod reconciler;
mod resolver;
mod session;
mod store;
mod tasks;
mod worker;

pub use api::{
    DeletionReason, DiagnosticInfo, DiagnosticLevel, MethodKind, PlaybackEvent, PlaybackState,
    ScrobbleAction, ScrobbleCommand, ScrobbleController, ScrobbleUpdate, SessionChange,
    UpdateOutcome,
};
pub use config::{AllowList, FilterConfig, ScrobbleConfig, ScrobblePreferences};
pub use error::{Result, ScrobbleError, TaskError};
pub use gateway::{
    ClientInfo, ItemMetadata, LiveSession, MediaServerGateway, MediaType, MetadataError,
    MetadataGateway, PlayerInfo, ServerInfo, UserInfo,
};
pub use method::{LoggingScrobbler, ScrobbleMethod, WebSocketScrobbler, create_method};
pub use reconciler::{Services, SessionReconciler};
pub use resolver::{ActionReport, ProgressResolver, ScrobbleActionResolver};
pub use session::{FilterKind, SessionStatus, SkipReason, WatchSession};
pub use store::{JsonSessionStore, SessionStore};
pub use tasks::{Task, TaskResult, TaskStatus};

use std::sync::{Arc, LazyLock, Mutex, RwLock};
use tokio::sync::mpsc;

use worker::WorkerParts;

static WORKER_TASK: LazyLock<Mutex<Option<Arc<Task<()>>>>> = LazyLock::new(|| Mutex::new(None));

/// `ScrobblerManager` 是后台服务的静态入口点。
pub struct ScrobblerManager;

impl ScrobblerManager {
    /// 启动后台服务，并返回一个控制器和事件接收器。
    ///
    /// 根据 `config` 创建会话记录存储（配置了 `store_path` 时使用 JSON 文件，否则只在内存中）、
    /// 默认的 [`ProgressResolver`] 和 `config.method` 指定的 scrobble 方式。
    ///
    /// # 返回
    /// - `Ok((controller, update_rx))`: 成功启动后，返回一个元组：
    ///   - `controller`: 一个 [`ScrobbleController`]，用于向后台服务发送命令。
    ///   - `update_rx`: 一个 `mpsc::Receiver<ScrobbleUpdate>`，用于接收所有事件和状态更新。
    /// - `Err(ScrobbleError)`: 如果会话记录无法载入、线程无法启动，或服务已在运行。
    pub fn start(
        config: ScrobbleConfig,
        server: Arc<dyn MediaServerGateway>,
        metadata: Arc<dyn MetadataGateway>,
    ) -> Result<(ScrobbleController, mpsc::Receiver<ScrobbleUpdate>)> {
        Self::ensure_not_running()?;

        let store: Arc<dyn SessionStore> = match &config.store_path {
            Some(path) => Arc::new(JsonSessionStore::open(path)?),
            None => Arc::new(JsonSessionStore::in_memory()),
        };
        let (report_tx, report_rx) = crossbeam_channel::unbounded();
        let resolver = ProgressResolver::new(config.scrobble_threshold).with_reports(report_tx);

        let services = Services {
            store,
            server,
            metadata,
            resolver: Arc::new(resolver),
        };
        Self::launch(config, services, report_rx)
    }

    /// 使用调用方提供的协作者启动后台服务。
    ///
    /// 与 [`ScrobblerManager::start()`] 不同，动作由 `services.resolver` 自行处理，
    /// 更新通道中不会出现 [`ScrobbleUpdate::Action`]。
    pub fn start_with(
        config: ScrobbleConfig,
        services: Services,
    ) -> Result<(ScrobbleController, mpsc::Receiver<ScrobbleUpdate>)> {
        Self::ensure_not_running()?;
        let (_, report_rx) = crossbeam_channel::unbounded();
        Self::launch(config, services, report_rx)
    }

    fn ensure_not_running() -> Result<()> {
        let task_guard = WORKER_TASK.lock()?;
        if let Some(task) = task_guard.as_ref()
            && !task.is_complete()
        {
            return Err(ScrobbleError::AlreadyRunning);
        }
        Ok(())
    }

    fn launch(
        config: ScrobbleConfig,
        services: Services,
        report_rx: crossbeam_channel::Receiver<ActionReport>,
    ) -> Result<(ScrobbleController, mpsc::Receiver<ScrobbleUpdate>)> {
        let buffer = config.command_buffer.max(1);
        let method_kind = config.method;
        let shared_config = Arc::new(RwLock::new(config));

        let (change_tx, change_rx) = crossbeam_channel::unbounded();
        let preferences: Arc<dyn ScrobblePreferences> = shared_config.clone();
        let reconciler = Arc::new(SessionReconciler::new(services, preferences).with_changes(change_tx));

        let method = {
            let config_guard = shared_config.read()?;
            create_method(method_kind, reconciler, &config_guard)
        };

        let (command_tx, command_rx) = mpsc::channel::<ScrobbleCommand>(buffer);
        let (update_tx, update_rx) = mpsc::channel::<ScrobbleUpdate>(buffer);

        let mut task_guard = WORKER_TASK.lock()?;
        if let Some(task) = task_guard.as_ref()
            && !task.is_complete()
        {
            return Err(ScrobbleError::AlreadyRunning);
        }

        let task = worker::start_scrobble_worker_thread(WorkerParts {
            command_rx,
            update_tx,
            method,
            config: shared_config,
            change_rx,
            report_rx,
        })?;
        *task_guard = Some(Arc::clone(&task));

        Ok((
            ScrobbleController {
                command_tx,
                worker: task,
            },
            update_rx,
        ))
    }
}
