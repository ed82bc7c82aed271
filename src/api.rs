use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    config::FilterConfig,
    error::{Result, ScrobbleError},
    session::SkipReason,
    tasks::Task,
};

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    /// 已停止
    Stopped,
    /// 播放中
    Playing,
    /// 已暂停
    Paused,
    /// 缓冲中
    Buffering,
}

impl FromStr for PlaybackState {
    type Err = ScrobbleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "playing" => Ok(Self::Playing),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            "buffering" => Ok(Self::Buffering),
            other => Err(ScrobbleError::Parse(format!("未知的播放状态: {other}"))),
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Buffering => "buffering",
        };
        f.write_str(name)
    }
}

/// 一条播放事件：会话键、状态和当前播放位置（毫秒）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    /// 媒体服务器分配的会话键。
    pub session_key: String,
    /// 播放状态。
    pub state: PlaybackState,
    /// 播放位置（毫秒）。
    pub view_offset: u64,
}

impl PlaybackEvent {
    /// 便捷构造函数。
    pub fn new(session_key: impl Into<String>, state: PlaybackState, view_offset: u64) -> Self {
        Self {
            session_key: session_key.into(),
            state,
            view_offset,
        }
    }
}

/// 向远端跟踪服务上报的动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrobbleAction {
    /// 开始观看。
    Start,
    /// 暂停。
    Pause,
    /// 未看完就停止。
    Stop,
    /// 看完，记录一次观看。
    Scrobble,
}

/// 播放事件的来源方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MethodKind {
    /// 订阅服务器推送的播放通知。
    #[default]
    WebSocket,
    /// 解析服务器日志（旧方式）。
    Logging,
}

/// 会话被删除的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionReason {
    /// 服务器不再报告该会话。
    SessionVanished,
    /// 会话下的媒体条目已经变化。
    MediaChanged,
    /// 缺少元数据。
    MissingMetadata,
    /// 元数据中的时长无效。
    InvalidDuration,
    /// 上游播放已结束。
    PlaybackEnded,
}

/// 协调器对会话记录所做的一次修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SessionChange {
    /// 新建了会话。
    Created {
        /// 会话键。
        session_key: String,
        /// 媒体条目。
        item_key: String,
    },
    /// 会话已向服务器刷新。
    Refreshed {
        /// 会话键。
        session_key: String,
    },
    /// 会话被删除。
    Deleted {
        /// 会话键。
        session_key: String,
        /// 删除原因。
        reason: DeletionReason,
    },
    /// 会话被标记为忽略。
    Skipped {
        /// 会话键。
        session_key: String,
        /// 忽略原因。
        reason: SkipReason,
    },
}

/// 单条播放事件的处理结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    /// scrobble 功能已全局关闭，事件被丢弃。
    Disabled,
    /// 没有可用的会话（已删除、服务器不再报告等），事件被丢弃。
    NoSession,
    /// 会话被有意忽略。
    Skipped(SkipReason),
    /// 进度计算失败，会话将在下一条事件时刷新。
    RefreshQueued,
    /// 事件已交给动作解析器处理。
    Processed {
        /// 解析出的动作。
        action: Option<ScrobbleAction>,
        /// 播放是否已结束（会话已删除）。
        ended: bool,
    },
}

/// 发送给后台服务的命令。
#[derive(Debug, Clone)]
pub enum ScrobbleCommand {
    /// 处理一条已经解码的播放事件。
    Playback(PlaybackEvent),
    /// 由当前 scrobble 方式解码并处理一条原始输入（通知帧或日志行）。
    Notification(String),
    /// 全局开关 scrobble。
    SetScrobblingEnabled(bool),
    /// 替换过滤器配置。
    SetFilters(FilterConfig),
    /// 立即将会话记录落盘。
    Flush,
    /// 重新探测当前 scrobble 方式是否可用。
    RequestProbe,
    /// 请求关闭后台服务。
    Shutdown,
}

/// 从后台服务接收的事件和状态更新。
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ScrobbleUpdate {
    /// 会话记录发生了变化。
    Session(SessionChange),
    /// 一条播放事件处理完毕。
    Outcome {
        /// 会话键。
        session_key: String,
        /// 处理结果。
        outcome: UpdateOutcome,
    },
    /// 动作解析器执行了一个动作。
    Action {
        /// 会话键。
        session_key: String,
        /// 动作。
        action: ScrobbleAction,
        /// 触发动作时的进度。
        progress: Option<f32>,
    },
    /// 可用性探测结果。
    Probe {
        /// 被探测的方式。
        method: MethodKind,
        /// 是否可用。
        available: bool,
    },
    /// 报告一个非致命的运行时错误。
    Error(String),
    /// 报告一个非致命的运行时诊断信息。
    Diagnostic(DiagnosticInfo),
}

/// 与后台服务交互的控制器。
#[derive(Debug)]
pub struct ScrobbleController {
    /// 用于向后台服务发送 `ScrobbleCommand` 的通道发送端。
    pub command_tx: mpsc::Sender<ScrobbleCommand>,
    pub(crate) worker: Arc<Task<()>>,
}

impl ScrobbleController {
    /// 发送一条播放事件。
    pub async fn send_event(&self, event: PlaybackEvent) -> Result<()> {
        self.command_tx
            .send(ScrobbleCommand::Playback(event))
            .await
            .map_err(ScrobbleError::from)
    }

    /// 终止后台线程。
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(ScrobbleCommand::Shutdown)
            .await
            .map_err(ScrobbleError::from)
    }

    /// 阻塞直到后台线程退出，返回其运行结果。
    ///
    /// 不要在异步上下文中直接调用，请使用 `spawn_blocking`。
    pub fn join(&self) -> Result<()> {
        self.worker.wait().map(|_| ()).map_err(ScrobbleError::from)
    }

    /// 后台线程是否已经退出。
    pub fn is_finished(&self) -> bool {
        self.worker.is_complete()
    }
}

/// 诊断信息的严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    /// 警告，服务仍然正常运行。
    Warning,
    /// 错误，某项功能已经失效。
    Error,
}

/// 封装一条诊断信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticInfo {
    /// 严重级别。
    pub level: DiagnosticLevel,
    /// 描述。
    pub message: String,
    /// 产生的时间。
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticInfo {
    pub(crate) fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
