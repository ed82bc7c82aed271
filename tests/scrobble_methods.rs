mod common;

use std::{io::Write, path::PathBuf, sync::Arc};

use common::Harness;
use scrobble_suite::{
    LoggingScrobbler, MethodKind, PlaybackEvent, PlaybackState, ScrobbleAction, ScrobbleConfig,
    ScrobbleMethod, UpdateOutcome, WebSocketScrobbler, create_method,
};

fn playing_frame(session_key: &str, state: &str, view_offset: u64) -> String {
    format!(
        r#"{{"NotificationContainer":{{"type":"playing","size":1,"PlaySessionStateNotification":[{{"sessionKey":"{session_key}","clientIdentifier":"living-room","guid":"","ratingKey":"500","url":"","key":"/library/metadata/500","viewOffset":{view_offset},"state":"{state}"}}]}}}}"#
    )
}

fn timeline_line(client: &str, item: &str, state: &str, time: u64) -> String {
    format!(
        "Jan 05, 2015 21:14:08 [0x7f2d] DEBUG - Request: [192.168.1.20:51234] GET \
         /:/timeline?ratingKey={item}&key=%2Flibrary%2Fmetadata%2F{item}&state={state}&time={time}\
         &X-Plex-Client-Identifier={client} (12 live) GZIP Signed-in"
    )
}

#[test]
fn websocket_probe_requires_multiuser() {
    let harness = Harness::new();
    let method = WebSocketScrobbler::new(Arc::clone(&harness.reconciler));

    assert_eq!(method.kind(), MethodKind::WebSocket);
    assert!(method.test());

    harness.server.set_multiuser(false);
    assert!(!method.test());

    harness.server.set_multiuser(true);
    harness.server.set_failing(true);
    assert!(!method.test());
}

#[test]
fn websocket_notifications_drive_the_reconciler() {
    let harness = Harness::new();
    harness.start_movie("12", "500", 100_000);
    let method = WebSocketScrobbler::new(Arc::clone(&harness.reconciler));

    let results = method.ingest(&playing_frame("12", "playing", 1_000));
    assert_eq!(
        results,
        vec![(
            PlaybackEvent::new("12", PlaybackState::Playing, 1_000),
            UpdateOutcome::Processed {
                action: Some(ScrobbleAction::Start),
                ended: false
            }
        )]
    );

    let results = method.ingest(&playing_frame("12", "paused", 2_000));
    assert_eq!(
        results[0].1,
        UpdateOutcome::Processed {
            action: Some(ScrobbleAction::Pause),
            ended: false
        }
    );

    assert!(
        method
            .ingest(r#"{"NotificationContainer":{"type":"activity","size":1}}"#)
            .is_empty()
    );
    assert_eq!(harness.stored("12").unwrap().last_view_offset, 2_000);
}

#[test]
fn logging_probe_requires_log_file() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("Plex Media Server.log");

    let method = LoggingScrobbler::new(Arc::clone(&harness.reconciler), Some(log_path.clone()));
    assert_eq!(method.kind(), MethodKind::Logging);
    assert!(!method.test());

    std::fs::File::create(&log_path)
        .unwrap()
        .write_all(b"log start\n")
        .unwrap();
    assert!(method.test());

    let unconfigured = LoggingScrobbler::new(Arc::clone(&harness.reconciler), None);
    assert!(!unconfigured.test());
}

#[test]
fn logging_resolves_session_key_from_client() {
    let harness = Harness::new();
    harness.start_movie("7", "500", 100_000);
    harness.server.play("8", "501", "bedroom", "bob");
    let method = LoggingScrobbler::new(Arc::clone(&harness.reconciler), None::<PathBuf>);

    assert_eq!(
        method.decode(&timeline_line("living-room", "500", "playing", 5_000)),
        vec![PlaybackEvent::new("7", PlaybackState::Playing, 5_000)]
    );

    // 条目不符时不会误认会话
    assert!(
        method
            .decode(&timeline_line("living-room", "999", "playing", 5_000))
            .is_empty()
    );
    assert!(
        method
            .decode(&timeline_line("kitchen", "500", "playing", 5_000))
            .is_empty()
    );
    assert!(method.decode("DEBUG - Completed: GET /library/sections").is_empty());

    let results = method.ingest(&timeline_line("living-room", "500", "playing", 5_000));
    assert_eq!(
        results[0].1,
        UpdateOutcome::Processed {
            action: Some(ScrobbleAction::Start),
            ended: false
        }
    );
}

#[test]
fn create_method_follows_config() {
    let harness = Harness::new();
    let config = ScrobbleConfig {
        method: MethodKind::Logging,
        ..ScrobbleConfig::default()
    };

    let logging = create_method(config.method, Arc::clone(&harness.reconciler), &config);
    assert_eq!(logging.kind(), MethodKind::Logging);

    let websocket = create_method(
        MethodKind::WebSocket,
        Arc::clone(&harness.reconciler),
        &config,
    );
    assert_eq!(websocket.kind(), MethodKind::WebSocket);
}
