use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

use crate::api::ScrobbleCommand;

/// 定义库的统一错误枚举。
#[derive(Debug, Error)]
pub enum ScrobbleError {
    /// 无法启动后台工作线程。
    ///
    /// 这通常发生在 `std::thread::Builder::spawn` 失败时。
    #[error("无法启动后台工作线程: {0}")]
    WorkerThread(String),

    /// 文件读写失败，或 Tokio 运行时创建失败。
    #[error("I/O 操作失败: {0}")]
    Io(#[from] std::io::Error),

    /// 会话记录或配置的 JSON 编解码失败。
    #[error("JSON 编解码失败: {0}")]
    Json(#[from] serde_json::Error),

    /// 媒体服务器查询失败。
    ///
    /// 由 [`MediaServerGateway`](crate::MediaServerGateway) 的实现返回。
    #[error("媒体服务器请求失败: {0}")]
    Gateway(String),

    /// 无法解析来自事件源或配置的输入。
    #[error("无法解析输入: {0}")]
    Parse(String),

    /// 会话存储报告的特定逻辑错误。
    #[error("会话存储失败: {0}")]
    Store(String),

    /// 向工作线程的命令通道发送外部命令时失败。
    ///
    /// 这通常意味着后台工作线程已经崩溃或关闭。
    #[error("向工作线程发送外部命令失败")]
    CommandSendError(#[from] SendError<ScrobbleCommand>),

    /// 后台工作任务以失败告终。
    #[error("后台任务失败: {0}")]
    Task(#[from] TaskError),

    /// 尝试启动一个已经启动的 scrobble 服务。
    #[error("Scrobble 服务已在运行，无法重复启动。")]
    AlreadyRunning,

    /// 锁已被毒化。
    #[error("锁已被毒化: {0}")]
    MutexPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for ScrobbleError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ScrobbleError::MutexPoisoned(err.to_string())
    }
}

/// 本库统一的 `Result` 类型别名。
pub type Result<T> = std::result::Result<T, ScrobbleError>;

/// [`Task`](crate::Task) 目标函数的失败结果。
///
/// 取消是一种协作式的正常终止，与其他失败区分开，调用方通过模式匹配来判断。
/// 该类型可以被克隆，以便多个 `wait()` 调用方都能拿到同一个失败。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// 目标函数观察到取消令牌后主动退出。
    #[error("任务已被取消")]
    Cancelled,

    /// 目标函数返回了错误或发生了 panic。
    #[error("{kind}: {message}")]
    Failed {
        /// 失败的种类，通常是原始错误的类型名，panic 时为 `"panic"`。
        kind: String,
        /// 原始错误的描述。
        message: String,
    },
}

impl TaskError {
    /// 将任意错误包装为 [`TaskError::Failed`]，保留其类型名作为失败种类。
    pub fn failed<E: std::error::Error>(err: E) -> Self {
        Self::Failed {
            kind: short_type_name::<E>().to_string(),
            message: err.to_string(),
        }
    }

    /// 当前失败是否为取消。
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<ScrobbleError> for TaskError {
    fn from(err: ScrobbleError) -> Self {
        match err {
            ScrobbleError::Task(inner) => inner,
            other => Self::failed(other),
        }
    }
}

/// 去掉泛型参数后的最后一段路径，如 `Wrapper<io::Error>` 得到 `Wrapper`。
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
