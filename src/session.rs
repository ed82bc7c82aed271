use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    api::{PlaybackState, ScrobbleAction},
    gateway::{ClientInfo, ItemMetadata, LiveSession, MediaType, UserInfo},
};

/// 会话被有意忽略的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    /// 元数据网关不支持该条目的类型（例如音乐）。
    UnsupportedMetadata,
    /// 会话没有通过某个过滤器。
    Filtered(FilterKind),
    /// 条目的媒体类型既不是电影也不是剧集。
    UnknownMediaType,
}

/// 过滤器的种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    /// 用户允许列表。
    User,
    /// 客户端允许列表。
    Client,
    /// 媒体库分区允许列表。
    Section,
}

/// 会话在协调器眼中的状态。
///
/// `Skipped` 是粘性的：一旦进入，只有删除整条记录才能离开。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionStatus {
    /// 正常处理。
    #[default]
    Active,
    /// 下一次处理前需要先向媒体服务器刷新会话。
    RefreshRequired,
    /// 被有意忽略，不会被转发给动作解析器。
    Skipped(SkipReason),
}

/// 一个客户端上正在进行的一次播放。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSession {
    /// 媒体服务器为这次播放分配的会话键。
    pub session_key: String,
    /// 当前会话关联的媒体条目。创建后不会被原地修改。
    pub item_key: String,
    /// 条目的元数据；不支持的媒体类型没有元数据。
    pub metadata: Option<ItemMetadata>,
    /// 播放该条目的设备。
    pub client: Option<ClientInfo>,
    /// 播放该条目的用户。
    pub user: Option<UserInfo>,
    /// 最后一次已知的播放位置（毫秒）。
    pub last_view_offset: u64,
    /// 最后一次记录的播放状态。
    pub last_state: PlaybackState,
    /// 最近一次计算出的进度（0 - 100）。
    pub progress: Option<f32>,
    /// 最近一次执行的 scrobble 动作。
    pub last_action: Option<ScrobbleAction>,
    /// 会话状态。
    pub status: SessionStatus,
    /// 创建时间。
    pub created_at: DateTime<Utc>,
    /// 最近一次修改的时间。
    pub updated_at: DateTime<Utc>,
}

impl WatchSession {
    /// 从媒体服务器报告的实时会话创建一条新的记录。
    pub fn from_live(
        live: &LiveSession,
        state: PlaybackState,
        metadata: Option<ItemMetadata>,
        client: Option<ClientInfo>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_key: live.session_key.clone(),
            item_key: live.item_key.clone(),
            metadata,
            client,
            user: live.user.clone(),
            last_view_offset: 0,
            last_state: state,
            progress: None,
            last_action: None,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// 会话是否被标记为忽略。
    pub const fn is_skipped(&self) -> bool {
        matches!(self.status, SessionStatus::Skipped(_))
    }

    /// 会话是否需要刷新。
    pub const fn refresh_required(&self) -> bool {
        matches!(self.status, SessionStatus::RefreshRequired)
    }

    /// 忽略原因（如果有）。
    pub const fn skip_reason(&self) -> Option<SkipReason> {
        match self.status {
            SessionStatus::Skipped(reason) => Some(reason),
            _ => None,
        }
    }

    /// 将会话标记为忽略。已经被忽略的会话保留最初的原因。
    pub fn skip(&mut self, reason: SkipReason) {
        if !self.is_skipped() {
            self.status = SessionStatus::Skipped(reason);
        }
    }

    /// 要求下一次处理时刷新会话。对被忽略的会话无效。
    pub fn require_refresh(&mut self) {
        if !self.is_skipped() {
            self.status = SessionStatus::RefreshRequired;
        }
    }

    /// 刷新成功后清除待刷新标记。
    pub fn mark_refreshed(&mut self) {
        if self.refresh_required() {
            self.status = SessionStatus::Active;
        }
    }

    /// 可以被 scrobble 的媒体类型；未知类型返回 `None`。
    pub fn media_type(&self) -> Option<MediaType> {
        self.metadata
            .as_ref()
            .and_then(|m| m.media_type.clone())
            .filter(MediaType::is_scrobbleable)
    }

    /// 用于日志的标题。
    pub fn title(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|m| m.title.as_deref())
            .unwrap_or("<未知>")
    }

    /// 元数据中的时长（毫秒）。没有元数据时为 `None`。
    pub fn duration(&self) -> Option<i64> {
        self.metadata.as_ref().map(|m| m.duration)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live() -> LiveSession {
        LiveSession {
            session_key: "7".to_string(),
            item_key: "1001".to_string(),
            player: None,
            user: None,
            view_offset: None,
        }
    }

    #[test]
    fn skip_is_sticky_and_keeps_first_reason() {
        let mut session = WatchSession::from_live(&live(), PlaybackState::Playing, None, None);
        session.skip(SkipReason::UnsupportedMetadata);
        session.skip(SkipReason::Filtered(FilterKind::Client));
        session.require_refresh();
        session.mark_refreshed();

        assert_eq!(session.skip_reason(), Some(SkipReason::UnsupportedMetadata));
        assert!(!session.refresh_required());
    }

    #[test]
    fn refresh_flag_round_trip() {
        let mut session = WatchSession::from_live(&live(), PlaybackState::Playing, None, None);
        session.require_refresh();
        assert!(session.refresh_required());
        session.mark_refreshed();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn only_movies_and_episodes_are_scrobbleable() {
        let mut session = WatchSession::from_live(&live(), PlaybackState::Playing, None, None);
        assert_eq!(session.media_type(), None);

        session.metadata = Some(ItemMetadata {
            title: Some("Pilot".to_string()),
            media_type: Some(MediaType::Episode),
            duration: 1_800_000,
            section: None,
        });
        assert_eq!(session.media_type(), Some(MediaType::Episode));
        assert_eq!(session.title(), "Pilot");

        if let Some(metadata) = session.metadata.as_mut() {
            metadata.media_type = Some(MediaType::Track);
        }
        assert_eq!(session.media_type(), None);
    }
}
