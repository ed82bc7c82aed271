use std::sync::{Arc, RwLock};

use crossbeam_channel::Receiver as CrossbeamReceiver;
use tokio::{
    runtime::Runtime,
    sync::mpsc::{Receiver as TokioReceiver, Sender as TokioSender, error::TrySendError},
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{DiagnosticInfo, ScrobbleCommand, ScrobbleUpdate, SessionChange, UpdateOutcome},
    config::ScrobbleConfig,
    error::{Result, TaskError},
    method::ScrobbleMethod,
    resolver::ActionReport,
    tasks::{Task, TaskResult},
};

/// 主事件循环退出的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// 收到 `Shutdown` 命令，或命令通道已关闭。
    Shutdown,
    /// 任务被取消。
    Cancelled,
}

/// 启动 worker 所需的全部部件，由 `ScrobblerManager` 组装。
pub(crate) struct WorkerParts {
    pub(crate) command_rx: TokioReceiver<ScrobbleCommand>,
    pub(crate) update_tx: TokioSender<ScrobbleUpdate>,
    pub(crate) method: Box<dyn ScrobbleMethod>,
    pub(crate) config: Arc<RwLock<ScrobbleConfig>>,
    pub(crate) change_rx: CrossbeamReceiver<SessionChange>,
    pub(crate) report_rx: CrossbeamReceiver<ActionReport>,
}

/// `ScrobbleWorker` 是后台服务的核心。
///
/// 它在一个专用的后台线程中运行，负责：
/// 1.  **命令分发**: 接收来自 `ScrobbleController` 的命令，交给当前的 scrobble 方式处理。
/// 2.  **运行时配置**: 根据命令修改共享的 [`ScrobbleConfig`]，协调器每次处理事件时都会读取它。
/// 3.  **状态聚合与通知**: 收集协调器和动作解析器产生的变化，转换为公共的
///     `ScrobbleUpdate` 事件发送给调用方。
pub(crate) struct ScrobbleWorker {
    command_rx: TokioReceiver<ScrobbleCommand>,
    update_tx: TokioSender<ScrobbleUpdate>,
    method: Box<dyn ScrobbleMethod>,
    config: Arc<RwLock<ScrobbleConfig>>,
    /// 协调器对会话记录所做的修改。
    change_rx: CrossbeamReceiver<SessionChange>,
    /// 动作解析器执行的动作。
    report_rx: CrossbeamReceiver<ActionReport>,
}

impl ScrobbleWorker {
    fn new(parts: WorkerParts) -> Self {
        Self {
            command_rx: parts.command_rx,
            update_tx: parts.update_tx,
            method: parts.method,
            config: parts.config,
            change_rx: parts.change_rx,
            report_rx: parts.report_rx,
        }
    }

    /// `ScrobbleWorker` 线程的入口点。
    ///
    /// 创建 Tokio 运行时并驱动主事件循环，直到收到关闭命令或被取消。
    /// 退出前总会把会话记录落盘。
    fn run(mut self, cancel_token: &CancellationToken) -> TaskResult<()> {
        log::info!(
            "[ScrobbleWorker] Worker 正在启动 (方式: {:?})...",
            self.method.kind()
        );

        let runtime = Runtime::new().map_err(TaskError::failed)?;
        let token = cancel_token.clone();

        let exit = runtime.block_on(async {
            self.announce_probe().await;
            log::debug!("[ScrobbleWorker] 初始化完成，即将进入核心异步事件循环。");
            let exit = self.main_event_loop(&token).await;

            log::trace!("[ScrobbleWorker] 核心事件循环已退出，正在执行清理...");
            self.flush_store().await;
            exit
        });

        log::info!("[ScrobbleWorker] Worker 已停止。");
        match exit {
            LoopExit::Shutdown => Ok(()),
            LoopExit::Cancelled => Err(TaskError::Cancelled),
        }
    }

    /// 核心异步事件循环。
    async fn main_event_loop(&mut self, cancel_token: &CancellationToken) -> LoopExit {
        loop {
            tokio::select! {
                biased;

                () = cancel_token.cancelled() => {
                    log::debug!("[ScrobbleWorker] 任务被取消，准备退出...");
                    return LoopExit::Cancelled;
                }

                maybe_command = self.command_rx.recv() => {
                    let Some(command) = maybe_command else {
                        log::debug!("[ScrobbleWorker] 命令通道已关闭，准备退出...");
                        return LoopExit::Shutdown;
                    };
                    log::trace!("[ScrobbleWorker] 收到外部命令: {command:?}");
                    if let ScrobbleCommand::Shutdown = command {
                        log::debug!("[ScrobbleWorker] 收到外部关闭命令，准备退出...");
                        return LoopExit::Shutdown;
                    }
                    self.handle_command(command).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: ScrobbleCommand) {
        match command {
            ScrobbleCommand::Playback(event) => {
                let outcome = self
                    .method
                    .update(&event.session_key, event.state, event.view_offset);
                self.publish_outcome(event.session_key, outcome).await;
            }
            ScrobbleCommand::Notification(raw) => {
                for (event, outcome) in self.method.ingest(&raw) {
                    self.publish_outcome(event.session_key, outcome).await;
                }
            }
            ScrobbleCommand::SetScrobblingEnabled(enabled) => {
                log::info!("[ScrobbleWorker] Scrobble 已{}。", if enabled { "开启" } else { "关闭" });
                self.edit_config(|config| config.scrobbling_enabled = enabled)
                    .await;
            }
            ScrobbleCommand::SetFilters(filters) => {
                log::debug!("[ScrobbleWorker] 更新过滤器: {filters:?}");
                self.edit_config(|config| config.filters = filters).await;
            }
            ScrobbleCommand::Flush => self.flush_store().await,
            ScrobbleCommand::RequestProbe => self.announce_probe().await,
            ScrobbleCommand::Shutdown => {
                // 已在主循环中优先处理
            }
        }
    }

    /// 先发送事件处理过程中产生的会话变化和动作，再发送处理结果。
    async fn publish_outcome(&self, session_key: String, outcome: UpdateOutcome) {
        let changes: Vec<_> = self.change_rx.try_iter().collect();
        for change in changes {
            self.send_update(ScrobbleUpdate::Session(change)).await;
        }

        let reports: Vec<_> = self.report_rx.try_iter().collect();
        for report in reports {
            self.send_update(ScrobbleUpdate::Action {
                session_key: report.session_key,
                action: report.action,
                progress: report.progress,
            })
            .await;
        }

        self.send_update(ScrobbleUpdate::Outcome {
            session_key,
            outcome,
        })
        .await;
    }

    async fn edit_config(&self, edit: impl FnOnce(&mut ScrobbleConfig)) {
        let poisoned = match self.config.write() {
            Ok(mut config) => {
                edit(&mut config);
                None
            }
            Err(e) => Some(e.to_string()),
        };

        if let Some(message) = poisoned {
            log::error!("[ScrobbleWorker] 修改配置失败: {message}");
            self.send_update(ScrobbleUpdate::Diagnostic(DiagnosticInfo::warning(format!(
                "配置锁已损坏，修改被丢弃: {message}"
            ))))
            .await;
        }
    }

    async fn flush_store(&self) {
        if let Err(e) = self.method.reconciler().flush() {
            log::error!("[ScrobbleWorker] 会话记录落盘失败: {e}");
            self.send_update(ScrobbleUpdate::Error(format!("会话记录落盘失败: {e}")))
                .await;
        }
    }

    async fn announce_probe(&self) {
        let method = self.method.kind();
        let available = self.method.test();
        if available {
            log::info!("[ScrobbleWorker] {method:?} 方式可用。");
        } else {
            log::warn!("[ScrobbleWorker] {method:?} 方式不可用。");
        }
        self.send_update(ScrobbleUpdate::Probe { method, available })
            .await;
    }

    /// 更新通道满了就丢弃更新，worker 从不等待调用方读取。
    async fn send_update(&self, update: ScrobbleUpdate) {
        match self.update_tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                log::warn!("[ScrobbleWorker] 更新通道已满，丢弃更新: {update:?}");
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!("[ScrobbleWorker] 更新接收端已关闭，丢弃更新。");
            }
        }
    }
}

/// 启动 `ScrobbleWorker` 后台线程。
///
/// # 返回
/// - `Ok(task)`: 成功启动后，返回包装了 worker 的任务，可用于等待或取消。
/// - `Err(ScrobbleError)`: 如果创建线程失败。
pub(crate) fn start_scrobble_worker_thread(parts: WorkerParts) -> Result<Arc<Task<()>>> {
    let worker = ScrobbleWorker::new(parts);
    let task = Task::new("scrobble_worker", move |token| worker.run(token));
    task.spawn("scrobble_worker_thread")?;
    Ok(task)
}
