use std::sync::Arc;

use serde::Deserialize;

use crate::{
    api::{MethodKind, PlaybackEvent, PlaybackState},
    method::ScrobbleMethod,
    reconciler::SessionReconciler,
};

/// 服务器推送的通知帧。
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "NotificationContainer")]
    container: NotificationContainer,
}

#[derive(Debug, Deserialize)]
struct NotificationContainer {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "PlaySessionStateNotification", default)]
    notifications: Vec<PlaySessionStateNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaySessionStateNotification {
    session_key: KeyValue,
    state: String,
    #[serde(default)]
    view_offset: Option<f64>,
}

/// 服务器有时以字符串、有时以数字发送会话键。
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyValue {
    Text(String),
    Number(u64),
}

impl KeyValue {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

/// 订阅服务器推送通知的 scrobble 方式。需要服务器支持多用户。
#[derive(Debug)]
pub struct WebSocketScrobbler {
    reconciler: Arc<SessionReconciler>,
}

impl WebSocketScrobbler {
    /// 创建推送通知方式。
    pub fn new(reconciler: Arc<SessionReconciler>) -> Self {
        Self { reconciler }
    }
}

impl ScrobbleMethod for WebSocketScrobbler {
    fn kind(&self) -> MethodKind {
        MethodKind::WebSocket
    }

    fn test(&self) -> bool {
        let server = self.reconciler.server();

        if !matches!(server.get_sessions(), Ok(Some(_))) {
            log::info!("[WebSocket] 获取会话列表出错，假定推送通知方式不可用。");
            return false;
        }

        match server.get_info() {
            Ok(Some(info)) if info.multiuser => true,
            Ok(Some(_)) => {
                log::info!("[WebSocket] 服务器不支持多用户，推送通知方式不可用。");
                false
            }
            Ok(None) | Err(_) => {
                log::info!("[WebSocket] 获取服务器信息出错，无法完成探测。");
                false
            }
        }
    }

    fn reconciler(&self) -> &SessionReconciler {
        &self.reconciler
    }

    fn decode(&self, raw: &str) -> Vec<PlaybackEvent> {
        decode_notification(raw)
    }
}

/// 解码一帧通知。只有 `playing` 类型的帧包含播放事件。
fn decode_notification(raw: &str) -> Vec<PlaybackEvent> {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::debug!("[WebSocket] 无法解析通知帧: {e}");
            return Vec::new();
        }
    };

    if envelope.container.kind != "playing" {
        return Vec::new();
    }

    envelope
        .container
        .notifications
        .into_iter()
        .filter_map(|n| {
            let state = match n.state.parse::<PlaybackState>() {
                Ok(state) => state,
                Err(e) => {
                    log::debug!("[WebSocket] 忽略通知: {e}");
                    return None;
                }
            };
            let view_offset = n.view_offset.unwrap_or_default().max(0.0) as u64;
            Some(PlaybackEvent::new(n.session_key.into_string(), state, view_offset))
        })
        .collect()
}
