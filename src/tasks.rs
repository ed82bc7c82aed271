//! 一次性、可取消的后台任务。
//!
//! [`Task`] 把一个工作单元包装成“最多执行一次”的任务：
//!
//! * `spawn(name)` 在一个带名字的后台线程中执行任务，立即返回；
//! * `run()` 是幂等的入口，无论被多少个调用方并发调用，目标函数都只执行一次；
//! * `wait()` 阻塞直到任务完成，然后返回结果或重新抛出捕获到的失败；
//! * `cancel()` 触发协作式取消，目标函数需要自己观察 [`CancellationToken`]
//!   并返回 [`TaskError::Cancelled`]。
//!
//! 完成信号是一个只有单个发送端的 crossbeam 通道：任务结束时发送端被丢弃，
//! 所有阻塞在 `recv()` 上的等待者会同时被唤醒。结果本身写入一个 `OnceLock`，
//! 只会被写入一次。

use std::{
    any::Any,
    backtrace::Backtrace,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver as CrossbeamReceiver, Sender as CrossbeamSender};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScrobbleError, TaskError};

/// 目标函数的返回类型。
pub type TaskResult<T> = std::result::Result<T, TaskError>;

type Target<T> = Box<dyn FnOnce(&CancellationToken) -> TaskResult<T> + Send>;

/// 尚未被领取的工作：目标函数，以及完成信号的唯一发送端。
struct Job<T> {
    target: Target<T>,
    done_tx: CrossbeamSender<()>,
}

/// 任务当前所处的阶段，供外部（例如同步状态菜单）轮询。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// 还没有任何调用方启动过该任务。
    NotStarted,
    /// 已启动，尚未完成。
    Running,
    /// 目标函数正常返回。
    Completed,
    /// 目标函数因取消而退出。
    Cancelled,
    /// 目标函数返回错误或发生 panic。
    Failed,
}

/// 一次性的后台任务。
///
/// 通过 [`Task::new`] 创建，返回 `Arc<Task<T>>`，便于在多个线程之间共享。
pub struct Task<T> {
    label: String,
    job_rx: CrossbeamReceiver<Job<T>>,
    done_rx: CrossbeamReceiver<()>,
    outcome: OnceLock<TaskResult<T>>,
    started: AtomicBool,
    cancel_token: CancellationToken,
}

impl<T: Send + Sync + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    /// 创建一个新任务。`label` 用于日志中标识目标函数。
    pub fn new<F>(label: impl Into<String>, target: F) -> Arc<Self>
    where
        F: FnOnce(&CancellationToken) -> TaskResult<T> + Send + 'static,
    {
        let (job_tx, job_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(0);

        // 容量为 1 的新通道一定能放下这唯一的一份工作，且接收端仍然存活。
        let _ = job_tx.send(Job {
            target: Box::new(target),
            done_tx,
        });

        Arc::new(Self {
            label: label.into(),
            job_rx,
            done_rx,
            outcome: OnceLock::new(),
            started: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        })
    }

    /// 在一个名为 `name` 的后台线程中执行任务，立即返回。
    ///
    /// 如果任务已经启动过，本调用什么也不做。
    ///
    /// # 返回
    /// - `Ok(())`: 任务已交给后台线程（或此前已经启动）。
    /// - `Err(ScrobbleError::WorkerThread)`: 无法创建线程。此时任务被标记为失败，
    ///   等待者会收到同样的失败。
    pub fn spawn(self: &Arc<Self>, name: &str) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            log::debug!("[Task] '{}' 已经启动，忽略重复的 spawn。", self.label);
            return Ok(());
        }

        let task = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || task.execute());

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                let message = e.to_string();
                log::error!("[Task] 无法为 '{}' 创建线程 '{name}': {message}", self.label);
                self.abandon(TaskError::Failed {
                    kind: "spawn".to_string(),
                    message: message.clone(),
                });
                Err(ScrobbleError::WorkerThread(message))
            }
        }
    }

    /// 在当前线程中执行任务。
    ///
    /// 幂等：如果任务已经启动（无论是被 `spawn` 还是另一个 `run` 调用），立即返回。
    pub fn run(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            log::trace!("[Task] '{}' 已经启动，跳过。", self.label);
            return;
        }
        self.execute();
    }

    /// 阻塞直到任务完成。
    ///
    /// # 返回
    /// - `Ok(None)`: 任务从未启动，不会阻塞。
    /// - `Ok(Some(value))`: 任务正常完成。
    /// - `Err(TaskError)`: 任务被取消或失败，返回捕获到的原始失败。
    pub fn wait(&self) -> TaskResult<Option<&T>> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(None);
        }

        if self.outcome.get().is_none() {
            // 唯一的发送端在任务结束时被丢弃，recv 随即以断开错误返回。
            let _ = self.done_rx.recv();
        }

        match self.outcome.get() {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(err)) => Err(err.clone()),
            None => Err(TaskError::Failed {
                kind: "incomplete".to_string(),
                message: format!("任务 '{}' 结束时没有留下结果", self.label),
            }),
        }
    }

    /// 请求协作式取消。目标函数需要自行检查令牌。
    pub fn cancel(&self) {
        log::debug!("[Task] 请求取消 '{}'。", self.label);
        self.cancel_token.cancel();
    }

    /// 任务当前的状态。
    pub fn status(&self) -> TaskStatus {
        match self.outcome.get() {
            Some(Ok(_)) => TaskStatus::Completed,
            Some(Err(TaskError::Cancelled)) => TaskStatus::Cancelled,
            Some(Err(TaskError::Failed { .. })) => TaskStatus::Failed,
            None if self.started.load(Ordering::Acquire) => TaskStatus::Running,
            None => TaskStatus::NotStarted,
        }
    }

    /// 任务是否已经结束（无论成功与否）。
    pub fn is_complete(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// 任务的标签。
    pub fn label(&self) -> &str {
        &self.label
    }

    fn execute(&self) {
        let Ok(Job { target, done_tx }) = self.job_rx.try_recv() else {
            log::error!("[Task] '{}' 的工作已被领取，无法再次执行。", self.label);
            return;
        };

        let token = self.cancel_token.clone();
        let outcome = match catch_unwind(AssertUnwindSafe(move || target(&token))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Failed {
                kind: "panic".to_string(),
                message: panic_message(payload.as_ref()),
            }),
        };

        match &outcome {
            Ok(_) => log::trace!("[Task] '{}' 已完成。", self.label),
            Err(TaskError::Cancelled) => log::debug!("[Task] '{}' 已被取消。", self.label),
            Err(TaskError::Failed { kind, message }) => {
                log::warn!(
                    "[Task] 执行 '{}' 时出现异常 ({kind}) {message}:\n{}",
                    self.label,
                    Backtrace::force_capture()
                );
            }
        }

        let _ = self.outcome.set(outcome);
        drop(done_tx);
    }

    /// 在无法执行的情况下直接写入失败结果，并释放所有等待者。
    fn abandon(&self, err: TaskError) {
        if let Ok(Job { done_tx, .. }) = self.job_rx.try_recv() {
            let _ = self.outcome.set(Err(err));
            drop(done_tx);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知的 panic 负载".to_string()
    }
}
