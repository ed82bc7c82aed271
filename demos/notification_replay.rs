//! 把一组推送通知回放给 scrobble 服务，并打印服务发出的所有更新。
//!
//! 用法: `cargo run --example notification_replay [frames.jsonl]`
//!
//! 不带参数时回放一段内置的观看过程。文件中每行一帧通知。

use log::{info, warn};
use scrobble_suite::{
    ClientInfo, ItemMetadata, LiveSession, MediaServerGateway, MediaType, MetadataError,
    MetadataGateway, PlayerInfo, ScrobbleCommand, ScrobbleConfig, ScrobbleUpdate,
    ScrobblerManager, ServerInfo, UserInfo,
};
use std::{sync::Arc, time::Duration};

/// 只有一个会话、一部电影的媒体服务器。
struct DemoServer;

impl MediaServerGateway for DemoServer {
    fn get_session(&self, session_key: &str) -> scrobble_suite::Result<Option<LiveSession>> {
        Ok((session_key == "1").then(|| LiveSession {
            session_key: "1".to_string(),
            item_key: "2001".to_string(),
            player: Some(PlayerInfo {
                machine_identifier: "demo-player".to_string(),
                title: Some("Demo Player".to_string()),
            }),
            user: Some(UserInfo {
                id: Some("1".to_string()),
                title: "demo".to_string(),
            }),
            view_offset: None,
        }))
    }

    fn get_sessions(&self) -> scrobble_suite::Result<Option<Vec<LiveSession>>> {
        Ok(Some(self.get_session("1")?.into_iter().collect()))
    }

    fn get_client(&self, _machine_identifier: &str) -> scrobble_suite::Result<Option<ClientInfo>> {
        Ok(None)
    }

    fn get_info(&self) -> scrobble_suite::Result<Option<ServerInfo>> {
        Ok(Some(ServerInfo {
            multiuser: true,
            version: Some("demo".to_string()),
        }))
    }
}

impl MetadataGateway for DemoServer {
    fn get_metadata(&self, item_key: &str) -> Result<Option<ItemMetadata>, MetadataError> {
        Ok((item_key == "2001").then(|| ItemMetadata {
            title: Some("2001: A Space Odyssey".to_string()),
            media_type: Some(MediaType::Movie),
            duration: 8_940_000,
            section: Some("Movies".to_string()),
        }))
    }
}

fn builtin_frames() -> Vec<String> {
    [
        ("playing", 0),
        ("playing", 600_000),
        ("paused", 1_200_000),
        ("playing", 1_200_000),
        ("playing", 900_000),
        ("stopped", 8_000_000),
    ]
    .into_iter()
    .map(|(state, offset)| {
        format!(
            r#"{{"NotificationContainer":{{"type":"playing","size":1,"PlaySessionStateNotification":[{{"sessionKey":"1","state":"{state}","viewOffset":{offset}}}]}}}}"#
        )
    })
    .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let frames: Vec<String> = match std::env::args().nth(1) {
        Some(path) => {
            info!("正在从 {path} 读取通知...");
            std::fs::read_to_string(path)?
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()
        }
        None => builtin_frames(),
    };

    info!("正在启动 scrobble 服务...");
    let server = Arc::new(DemoServer);
    let (controller, mut update_rx) =
        ScrobblerManager::start(ScrobbleConfig::default(), server.clone(), server)?;

    let event_task = tokio::spawn(async move {
        while let Some(update) = update_rx.recv().await {
            match update {
                ScrobbleUpdate::Session(change) => info!("会话变化: {change:?}"),
                ScrobbleUpdate::Action {
                    session_key,
                    action,
                    progress,
                } => info!(
                    "会话 {session_key}: {action:?} (进度 {:.1}%)",
                    progress.unwrap_or_default()
                ),
                ScrobbleUpdate::Probe { method, available } => {
                    info!("{method:?} 方式可用: {available}");
                }
                ScrobbleUpdate::Error(e) => warn!("收到一个非致命错误: {e}"),
                other => log::debug!("{other:?}"),
            }
        }
        info!("更新通道已关闭，事件监听任务退出。");
    });

    for frame in frames {
        controller
            .command_tx
            .send(ScrobbleCommand::Notification(frame))
            .await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("回放结束，正在关闭服务...");
    controller.shutdown().await?;
    tokio::task::spawn_blocking(move || controller.join()).await??;
    event_task.await?;

    info!("程序已优雅退出。");
    Ok(())
}
