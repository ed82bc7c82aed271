//! 播放事件的来源方式。
//!
//! 不同的方式只在事件如何到达上有区别：推送通知或服务器日志。
//! 所有的协调逻辑都委托给同一个 [`SessionReconciler`]。

mod logging;
mod websocket;

use std::sync::Arc;

pub use logging::LoggingScrobbler;
pub use websocket::WebSocketScrobbler;

use crate::{
    api::{MethodKind, PlaybackEvent, PlaybackState, UpdateOutcome},
    config::ScrobbleConfig,
    reconciler::SessionReconciler,
};

/// 一种 scrobble 方式。
pub trait ScrobbleMethod: Send + Sync {
    /// 方式的种类。
    fn kind(&self) -> MethodKind;

    /// 探测媒体服务器是否支持这种方式。
    fn test(&self) -> bool;

    /// 处理事件的协调器。
    fn reconciler(&self) -> &SessionReconciler;

    /// 把一条原始输入解码为零或多条播放事件。
    fn decode(&self, raw: &str) -> Vec<PlaybackEvent>;

    /// 处理一条播放事件。
    fn update(&self, session_key: &str, state: PlaybackState, view_offset: u64) -> UpdateOutcome {
        self.reconciler().update(session_key, state, view_offset)
    }

    /// 解码并处理一条原始输入，返回每条事件的处理结果。
    fn ingest(&self, raw: &str) -> Vec<(PlaybackEvent, UpdateOutcome)> {
        self.decode(raw)
            .into_iter()
            .map(|event| {
                let outcome = self.update(&event.session_key, event.state, event.view_offset);
                (event, outcome)
            })
            .collect()
    }
}

/// 按种类创建 scrobble 方式。
pub fn create_method(
    kind: MethodKind,
    reconciler: Arc<SessionReconciler>,
    config: &ScrobbleConfig,
) -> Box<dyn ScrobbleMethod> {
    match kind {
        MethodKind::WebSocket => Box::new(WebSocketScrobbler::new(reconciler)),
        MethodKind::Logging => Box::new(LoggingScrobbler::new(reconciler, config.log_path.clone())),
    }
}
