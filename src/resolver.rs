use crossbeam_channel::Sender as CrossbeamSender;
use serde::Serialize;

use crate::{
    api::{PlaybackState, ScrobbleAction},
    gateway::MediaType,
    session::WatchSession,
};

/// 根据已验证的会话和新的播放状态决定 scrobble 动作。
///
/// 协调器只会把通过了所有检查、未被忽略的会话交给它。
pub trait ScrobbleActionResolver: Send + Sync {
    /// 根据播放位置更新会话的进度。返回 `false` 表示无法计算，
    /// 协调器会把会话标记为待刷新。
    fn update_progress(&self, session: &mut WatchSession, view_offset: u64) -> bool;

    /// 决定这一次要执行的动作。
    fn resolve_action(&self, session: &WatchSession, state: PlaybackState)
    -> Option<ScrobbleAction>;

    /// 执行动作，并记录到会话中。
    fn handle_action(
        &self,
        session: &mut WatchSession,
        media_type: &MediaType,
        action: ScrobbleAction,
        state: PlaybackState,
    );

    /// 记录状态转换。返回状态是否发生了变化。
    fn handle_state_transition(&self, session: &mut WatchSession, state: PlaybackState) -> bool;
}

/// 由 [`ProgressResolver`] 发出的一次动作。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionReport {
    /// 会话键。
    pub session_key: String,
    /// 媒体条目。
    pub item_key: String,
    /// 媒体类型。
    pub media_type: MediaType,
    /// 动作。
    pub action: ScrobbleAction,
    /// 触发动作时的播放状态。
    pub state: PlaybackState,
    /// 触发动作时的进度。
    pub progress: Option<f32>,
}

/// 基于进度百分比的默认策略。
///
/// * 开始播放（或第一次看到播放中的会话）时发出 `Start`；
/// * 播放中转为暂停时发出 `Pause`；
/// * 停止时进度达到阈值发出 `Scrobble`，否则对已开始的会话发出 `Stop`；
/// * 已经 scrobble 过的会话不再发出任何动作。
#[derive(Debug, Clone)]
pub struct ProgressResolver {
    threshold: f32,
    report_tx: Option<CrossbeamSender<ActionReport>>,
}

impl ProgressResolver {
    /// 创建一个以 `threshold`（百分比）为看完阈值的解析器。
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 100.0),
            report_tx: None,
        }
    }

    /// 把执行的动作发送到 `report_tx`。
    #[must_use]
    pub fn with_reports(mut self, report_tx: CrossbeamSender<ActionReport>) -> Self {
        self.report_tx = Some(report_tx);
        self
    }
}

impl Default for ProgressResolver {
    fn default() -> Self {
        Self::new(crate::config::ScrobbleConfig::default().scrobble_threshold)
    }
}

impl ScrobbleActionResolver for ProgressResolver {
    fn update_progress(&self, session: &mut WatchSession, view_offset: u64) -> bool {
        let Some(duration) = session.duration().filter(|d| *d > 0) else {
            return false;
        };

        let progress = (view_offset as f64 / duration as f64 * 100.0).clamp(0.0, 100.0);
        session.progress = Some(progress as f32);
        true
    }

    fn resolve_action(
        &self,
        session: &WatchSession,
        state: PlaybackState,
    ) -> Option<ScrobbleAction> {
        if session.last_action == Some(ScrobbleAction::Scrobble) {
            return None;
        }

        let started = matches!(
            session.last_action,
            Some(ScrobbleAction::Start | ScrobbleAction::Pause)
        );

        match state {
            PlaybackState::Playing => {
                let resumed = session.last_state != PlaybackState::Playing
                    && session.last_action != Some(ScrobbleAction::Start);
                (session.last_action.is_none() || resumed).then_some(ScrobbleAction::Start)
            }
            PlaybackState::Paused => {
                (session.last_action == Some(ScrobbleAction::Start)).then_some(ScrobbleAction::Pause)
            }
            PlaybackState::Stopped => {
                if session.progress.is_some_and(|p| p >= self.threshold) {
                    Some(ScrobbleAction::Scrobble)
                } else if started {
                    Some(ScrobbleAction::Stop)
                } else {
                    None
                }
            }
            PlaybackState::Buffering => None,
        }
    }

    fn handle_action(
        &self,
        session: &mut WatchSession,
        media_type: &MediaType,
        action: ScrobbleAction,
        state: PlaybackState,
    ) {
        log::info!(
            "[Resolver] {:?} '{}' (会话 {}, 进度 {:.1}%)",
            action,
            session.title(),
            session.session_key,
            session.progress.unwrap_or_default()
        );
        session.last_action = Some(action);

        if let Some(tx) = &self.report_tx {
            let report = ActionReport {
                session_key: session.session_key.clone(),
                item_key: session.item_key.clone(),
                media_type: media_type.clone(),
                action,
                state,
                progress: session.progress,
            };
            if tx.send(report).is_err() {
                log::warn!("[Resolver] 动作接收端已关闭，丢弃动作 {action:?}。");
            }
        }
    }

    fn handle_state_transition(&self, session: &mut WatchSession, state: PlaybackState) -> bool {
        if session.last_state == state {
            return false;
        }
        log::trace!(
            "[Resolver] 会话 {} 状态 {} -> {state}",
            session.session_key,
            session.last_state
        );
        session.last_state = state;
        true
    }
}
