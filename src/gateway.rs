//! 与媒体服务器交互的外部接口。
//!
//! 协调器只依赖这里的 trait，具体的 HTTP 客户端由调用方提供。
//! 测试中使用内存中的假实现即可驱动完整的状态机。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;

/// 媒体条目的类型。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// 电影。
    Movie,
    /// 剧集中的一集。
    Episode,
    /// 音乐曲目。
    Track,
    /// 其他任何类型（例如照片、预告片）。
    #[serde(untagged)]
    Other(String),
}

impl MediaType {
    /// 是否是可以被 scrobble 的类型。
    pub const fn is_scrobbleable(&self) -> bool {
        matches!(self, Self::Movie | Self::Episode)
    }
}

/// 条目的描述性元数据。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// 标题。
    pub title: Option<String>,
    /// 媒体类型。
    #[serde(rename = "type")]
    pub media_type: Option<MediaType>,
    /// 时长（毫秒）。保留有符号类型，以便识别服务器返回的异常值。
    pub duration: i64,
    /// 所属媒体库分区的标题。
    pub section: Option<String>,
}

/// 播放设备。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// 设备的唯一标识符。
    pub machine_identifier: String,
    /// 设备名称。
    pub name: Option<String>,
    /// 平台，例如 `"Android"`。
    pub platform: Option<String>,
}

/// 播放用户。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// 用户 ID。
    pub id: Option<String>,
    /// 用户名。
    pub title: String,
}

/// 会话中的播放器描述。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// 播放器所在设备的标识符。
    pub machine_identifier: String,
    /// 播放器标题。
    pub title: Option<String>,
}

/// 媒体服务器当前报告的一次播放。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSession {
    /// 会话键。
    pub session_key: String,
    /// 当前正在播放的条目（rating key）。
    pub item_key: String,
    /// 播放器。
    pub player: Option<PlayerInfo>,
    /// 用户。
    pub user: Option<UserInfo>,
    /// 服务器记录的播放位置（毫秒）。
    pub view_offset: Option<u64>,
}

/// 服务器信息，用于探测可用的 scrobble 方式。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// 服务器是否支持多用户（推送通知依赖这一功能）。
    pub multiuser: bool,
    /// 服务器版本。
    pub version: Option<String>,
}

/// 查询媒体服务器上的实时播放状态。
pub trait MediaServerGateway: Send + Sync {
    /// 按会话键查询实时会话。服务器不再报告该会话时返回 `Ok(None)`。
    fn get_session(&self, session_key: &str) -> Result<Option<LiveSession>>;

    /// 列出所有实时会话。服务器无法提供列表时返回 `Ok(None)`。
    fn get_sessions(&self) -> Result<Option<Vec<LiveSession>>>;

    /// 查询设备信息。
    fn get_client(&self, machine_identifier: &str) -> Result<Option<ClientInfo>>;

    /// 查询服务器信息。
    fn get_info(&self) -> Result<Option<ServerInfo>>;
}

/// 元数据查询的失败。
#[derive(Debug, Error)]
pub enum MetadataError {
    /// 不支持该类型条目的元数据，例如音乐。协调器会将会话标记为忽略。
    #[error("不支持的条目类型: {0}")]
    NotSupported(String),

    /// 其他任何失败。
    #[error("元数据查询失败: {0}")]
    Failed(String),
}

/// 按条目查询元数据。
pub trait MetadataGateway: Send + Sync {
    /// 查询条目的元数据。
    fn get_metadata(&self, item_key: &str) -> std::result::Result<Option<ItemMetadata>, MetadataError>;
}
