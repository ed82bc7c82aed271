use std::{collections::HashMap, path::PathBuf, sync::Arc};

use url::form_urlencoded;

use crate::{
    api::{MethodKind, PlaybackEvent, PlaybackState},
    method::ScrobbleMethod,
    reconciler::SessionReconciler,
};

/// 服务器日志中记录播放进度的请求路径。
const TIMELINE_MARKERS: [&str; 2] = ["/:/timeline?", "/:/progress?"];

/// 解析服务器日志的旧 scrobble 方式。
///
/// 日志中的请求不带会话键，只带客户端标识符和条目，
/// 所以需要在服务器的实时会话列表里找到对应的会话。
#[derive(Debug)]
pub struct LoggingScrobbler {
    reconciler: Arc<SessionReconciler>,
    log_path: Option<PathBuf>,
}

/// 从一行日志中解析出的进度请求。
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimelineRequest {
    client_identifier: String,
    item_key: Option<String>,
    state: PlaybackState,
    time: u64,
}

impl LoggingScrobbler {
    /// 创建日志方式，`log_path` 是服务器日志文件。
    pub fn new(reconciler: Arc<SessionReconciler>, log_path: Option<PathBuf>) -> Self {
        Self {
            reconciler,
            log_path,
        }
    }

    fn resolve_session_key(&self, request: &TimelineRequest) -> Option<String> {
        let sessions = match self.reconciler.server().get_sessions() {
            Ok(Some(sessions)) => sessions,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("[Logging] 获取会话列表失败: {e}");
                return None;
            }
        };

        sessions
            .into_iter()
            .find(|live| {
                let same_client = live
                    .player
                    .as_ref()
                    .is_some_and(|p| p.machine_identifier == request.client_identifier);
                let same_item = request
                    .item_key
                    .as_ref()
                    .is_none_or(|item| *item == live.item_key);
                same_client && same_item
            })
            .map(|live| live.session_key)
    }
}

impl ScrobbleMethod for LoggingScrobbler {
    fn kind(&self) -> MethodKind {
        MethodKind::Logging
    }

    fn test(&self) -> bool {
        let Some(path) = self.log_path.as_ref() else {
            log::info!("[Logging] 没有配置服务器日志路径，日志方式不可用。");
            return false;
        };
        if !path.exists() {
            log::info!("[Logging] 找不到服务器日志 {}，日志方式不可用。", path.display());
            return false;
        }
        if !matches!(self.reconciler.server().get_sessions(), Ok(Some(_))) {
            log::info!("[Logging] 获取会话列表出错，日志方式不可用。");
            return false;
        }
        true
    }

    fn reconciler(&self) -> &SessionReconciler {
        &self.reconciler
    }

    fn decode(&self, raw: &str) -> Vec<PlaybackEvent> {
        let Some(request) = parse_timeline_line(raw) else {
            return Vec::new();
        };

        match self.resolve_session_key(&request) {
            Some(session_key) => vec![PlaybackEvent::new(session_key, request.state, request.time)],
            None => {
                log::debug!(
                    "[Logging] 找不到客户端 {} 对应的会话，忽略该行日志。",
                    request.client_identifier
                );
                Vec::new()
            }
        }
    }
}

fn parse_timeline_line(line: &str) -> Option<TimelineRequest> {
    let start = TIMELINE_MARKERS
        .iter()
        .find_map(|marker| line.find(marker).map(|i| i + marker.len()))?;
    let query = line[start..].split_whitespace().next()?;

    let params: HashMap<String, String> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    let state = params.get("state")?.parse::<PlaybackState>().ok()?;
    let time = params.get("time")?.parse::<f64>().ok()?.max(0.0) as u64;
    let client_identifier = params.get("X-Plex-Client-Identifier")?.clone();
    let item_key = params.get("ratingKey").cloned();

    Some(TimelineRequest {
        client_identifier,
        item_key,
        state,
        time,
    })
}
