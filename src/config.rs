use std::{fs, path::Path, path::PathBuf, sync::RwLock};

use serde::{Deserialize, Serialize};

use crate::{
    api::MethodKind,
    error::Result,
    session::{FilterKind, WatchSession},
};

/// 默认的命令通道容量。
const DEFAULT_COMMAND_BUFFER: usize = 32;
/// 默认的 scrobble 阈值（百分比）。
const DEFAULT_SCROBBLE_THRESHOLD: f32 = 80.0;

/// 一个允许列表。
///
/// 条目不区分大小写；`*` 匹配任何值；以 `-` 开头的条目表示显式排除。
/// 只包含排除条目的列表允许其他所有值。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowList(Vec<String>);

impl AllowList {
    /// 从首选项中的逗号分隔字符串解析，例如 `"Living Room, -Phone"`。
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// 判断给定的候选值中是否有任意一个被允许。
    pub fn allows<'a>(&self, candidates: impl IntoIterator<Item = &'a str>) -> bool {
        let candidates: Vec<&str> = candidates.into_iter().collect();
        let matches = |entry: &str| candidates.iter().any(|c| c.eq_ignore_ascii_case(entry));

        let mut has_includes = false;
        let mut included = false;
        for entry in &self.0 {
            if let Some(excluded) = entry.strip_prefix('-') {
                if matches(excluded) {
                    return false;
                }
            } else {
                has_includes = true;
                included |= entry == "*" || matches(entry);
            }
        }

        !has_includes || included
    }
}

/// 用户 / 客户端 / 分区过滤器。`None` 表示不过滤。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// 允许的用户名。
    pub users: Option<AllowList>,
    /// 允许的客户端（名称或设备标识符）。
    pub clients: Option<AllowList>,
    /// 允许的媒体库分区标题。
    pub sections: Option<AllowList>,
}

impl FilterConfig {
    /// 返回第一个没有通过的过滤器。
    pub fn check(&self, session: &WatchSession) -> Option<FilterKind> {
        if !self.valid_user(session) {
            return Some(FilterKind::User);
        }
        if !self.valid_client(session) {
            return Some(FilterKind::Client);
        }
        if !self.valid_section(session) {
            return Some(FilterKind::Section);
        }
        None
    }

    fn valid_user(&self, session: &WatchSession) -> bool {
        let Some(filter) = &self.users else {
            return true;
        };
        filter.allows(session.user.as_ref().map(|u| u.title.as_str()))
    }

    fn valid_client(&self, session: &WatchSession) -> bool {
        let Some(filter) = &self.clients else {
            return true;
        };
        let Some(client) = &session.client else {
            return filter.allows([]);
        };
        filter.allows(
            std::iter::once(client.machine_identifier.as_str()).chain(client.name.as_deref()),
        )
    }

    fn valid_section(&self, session: &WatchSession) -> bool {
        let Some(filter) = &self.sections else {
            return true;
        };
        filter.allows(session.metadata.as_ref().and_then(|m| m.section.as_deref()))
    }
}

/// 库的配置。所有字段都有默认值，可以从 JSON 文件中部分覆盖。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrobbleConfig {
    /// 全局开关。
    pub scrobbling_enabled: bool,
    /// 过滤器。
    pub filters: FilterConfig,
    /// 会话记录文件；为 `None` 时只保存在内存中。
    pub store_path: Option<PathBuf>,
    /// 旧方式所读取的服务器日志文件。
    pub log_path: Option<PathBuf>,
    /// 播放事件的来源方式。
    pub method: MethodKind,
    /// 停止时进度达到该百分比即视为看完。
    pub scrobble_threshold: f32,
    /// 命令 / 更新通道的容量。更新通道满时，新的更新会被丢弃。
    pub command_buffer: usize,
}

impl Default for ScrobbleConfig {
    fn default() -> Self {
        Self {
            scrobbling_enabled: true,
            filters: FilterConfig::default(),
            store_path: None,
            log_path: None,
            method: MethodKind::default(),
            scrobble_threshold: DEFAULT_SCROBBLE_THRESHOLD,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

impl ScrobbleConfig {
    /// 从 JSON 字符串解析配置。
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// 从 JSON 文件载入配置。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&raw)?;
        log::debug!("[Config] 已从 {} 载入配置。", path.as_ref().display());
        Ok(config)
    }
}

/// 协调器所需的只读首选项。
pub trait ScrobblePreferences: Send + Sync {
    /// scrobble 是否全局开启。
    fn scrobbling_enabled(&self) -> bool;

    /// 返回会话第一个没有通过的过滤器；全部通过时返回 `None`。
    fn failed_filter(&self, session: &WatchSession) -> Option<FilterKind>;
}

impl ScrobblePreferences for ScrobbleConfig {
    fn scrobbling_enabled(&self) -> bool {
        self.scrobbling_enabled
    }

    fn failed_filter(&self, session: &WatchSession) -> Option<FilterKind> {
        self.filters.check(session)
    }
}

/// 运行时可修改的配置，由后台服务根据命令更新。
impl ScrobblePreferences for RwLock<ScrobbleConfig> {
    fn scrobbling_enabled(&self) -> bool {
        self.read().map(|c| c.scrobbling_enabled).unwrap_or(false)
    }

    fn failed_filter(&self, session: &WatchSession) -> Option<FilterKind> {
        match self.read() {
            Ok(config) => config.filters.check(session),
            Err(e) => {
                log::error!("[Config] 读取过滤器失败: {e}");
                None
            }
        }
    }
}
