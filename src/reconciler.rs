//! 播放会话协调器。
//!
//! [`SessionReconciler`] 接收以会话键标识的播放事件（可能重复、乱序或相互竞争），
//! 对照媒体服务器上的实时状态维护会话记录，并把通过检查的会话交给
//! [`ScrobbleActionResolver`]。
//!
//! 每条事件最终只会落入三种结果之一：
//!
//! * 没有会话：事件被忽略，下一条事件会重新创建会话；
//! * 会话被忽略：记录会一直保留，直到被删除；
//! * 正常处理：事件被交给动作解析器。
//!
//! 任何失败都不会以错误的形式离开 [`SessionReconciler::update`]，而是被吸收为
//! 会话状态的变化或删除。
//!
//! 同一会话键上的事件被串行处理；不同会话键之间可以并行。

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use crossbeam_channel::Sender as CrossbeamSender;

use crate::{
    api::{DeletionReason, PlaybackState, SessionChange, UpdateOutcome},
    config::ScrobblePreferences,
    error::Result,
    gateway::{ClientInfo, LiveSession, MediaServerGateway, MetadataError, MetadataGateway},
    resolver::ScrobbleActionResolver,
    session::{SkipReason, WatchSession},
    store::SessionStore,
};

/// 协调器依赖的外部协作者。
#[derive(Clone)]
pub struct Services {
    /// 会话记录存储。
    pub store: Arc<dyn SessionStore>,
    /// 媒体服务器。
    pub server: Arc<dyn MediaServerGateway>,
    /// 元数据查询。
    pub metadata: Arc<dyn MetadataGateway>,
    /// 动作解析器。
    pub resolver: Arc<dyn ScrobbleActionResolver>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// `get_session` 的结果。
enum Lookup {
    Missing,
    Skipped(SkipReason),
    Ready(WatchSession),
}

/// 按会话键分配的互斥锁表。没有调用方持有时，条目会被移除。
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn with_key<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let held = HeldKey {
            locks: self,
            key,
            entry,
        };

        let _guard = held.entry.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

/// 某个键的锁条目，离开作用域时（包括 panic 展开时）清理锁表。
struct HeldKey<'a> {
    locks: &'a KeyedLocks,
    key: &'a str,
    entry: Arc<Mutex<()>>,
}

impl Drop for HeldKey<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // 只剩表本身和当前调用持有时，说明没有其他调用方在等待这个键。
        if Arc::strong_count(&self.entry) == 2 {
            locks.remove(self.key);
        }
    }
}

/// 播放会话协调器。
pub struct SessionReconciler {
    services: Services,
    preferences: Arc<dyn ScrobblePreferences>,
    locks: KeyedLocks,
    change_tx: Option<CrossbeamSender<SessionChange>>,
}

impl fmt::Debug for SessionReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionReconciler")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl SessionReconciler {
    /// 创建协调器。
    pub fn new(services: Services, preferences: Arc<dyn ScrobblePreferences>) -> Self {
        Self {
            services,
            preferences,
            locks: KeyedLocks::default(),
            change_tx: None,
        }
    }

    /// 把每一次会话记录的修改发送到 `change_tx`。
    #[must_use]
    pub fn with_changes(mut self, change_tx: CrossbeamSender<SessionChange>) -> Self {
        self.change_tx = Some(change_tx);
        self
    }

    /// 媒体服务器网关。
    pub fn server(&self) -> &Arc<dyn MediaServerGateway> {
        &self.services.server
    }

    /// 会话记录存储。
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.services.store
    }

    /// 将会话记录落盘。
    pub fn flush(&self) -> Result<()> {
        self.services.store.flush()
    }

    /// 处理一条播放事件。
    ///
    /// 该方法是全函数：所有失败都被吸收为会话状态的变化，只通过返回值报告结果。
    pub fn update(&self, session_key: &str, state: PlaybackState, view_offset: u64) -> UpdateOutcome {
        // scrobble 关闭时不触碰任何会话记录
        if !self.preferences.scrobbling_enabled() {
            log::trace!("[Reconciler] Scrobble 已关闭，忽略会话 {session_key} 的事件。");
            return UpdateOutcome::Disabled;
        }

        self.locks
            .with_key(session_key, || self.process(session_key, state, view_offset))
    }

    fn process(&self, session_key: &str, state: PlaybackState, view_offset: u64) -> UpdateOutcome {
        let mut session = match self.get_session(session_key, state, view_offset) {
            Lookup::Ready(session) => session,
            Lookup::Skipped(reason) => return UpdateOutcome::Skipped(reason),
            Lookup::Missing => {
                log::trace!("[Reconciler] 会话 {session_key} 无效或已被忽略，无需处理。");
                return UpdateOutcome::NoSession;
            }
        };

        if let Some(kind) = self.preferences.failed_filter(&session) {
            log::debug!(
                "[Reconciler] 会话 {session_key} 未通过 {kind:?} 过滤器，之后的事件都将被忽略。"
            );
            let reason = SkipReason::Filtered(kind);
            self.skip(&mut session, reason);
            return UpdateOutcome::Skipped(reason);
        }

        let Some(media_type) = session.media_type() else {
            log::info!(
                "[Reconciler] 正在播放未知类型的条目，不会被 scrobble: \"{}\"",
                session.title()
            );
            self.skip(&mut session, SkipReason::UnknownMediaType);
            return UpdateOutcome::Skipped(SkipReason::UnknownMediaType);
        };

        session.last_view_offset = view_offset;

        if !self
            .services
            .resolver
            .update_progress(&mut session, view_offset)
        {
            log::warn!("[Reconciler] 更新会话 {session_key} 的进度时出错，将在下一条事件时刷新会话。");
            session.require_refresh();
            session.touch();
            self.save(&session);
            return UpdateOutcome::RefreshQueued;
        }

        let resolver = &self.services.resolver;
        let action = resolver.resolve_action(&session, state);
        match action {
            Some(action) => resolver.handle_action(&mut session, &media_type, action, state),
            None => log::debug!(
                "[Reconciler] 这次 {} ({state}) 无需处理。",
                session.title()
            ),
        }

        let changed = resolver.handle_state_transition(&mut session, state);
        session.touch();

        if state == PlaybackState::Stopped {
            self.delete(&session, DeletionReason::PlaybackEnded);
            return UpdateOutcome::Processed {
                action,
                ended: true,
            };
        }

        self.save(&session);
        if changed || action.is_some() {
            self.flush_quietly();
        }

        UpdateOutcome::Processed {
            action,
            ended: false,
        }
    }

    /// 载入或创建会话，并根据服务器的实时状态校验它。
    fn get_session(&self, session_key: &str, state: PlaybackState, view_offset: u64) -> Lookup {
        let loaded = match self.services.store.load(session_key) {
            Ok(loaded) => loaded,
            Err(e) => {
                log::error!("[Reconciler] 读取会话 {session_key} 失败: {e}");
                None
            }
        };

        let mut session = match loaded {
            Some(session) => session,
            None => match self.create_session(session_key, state) {
                Some(session) => session,
                None => return Lookup::Missing,
            },
        };

        let mut refresh = false;

        // 播放位置后退（跳转或重新开始）时刷新会话
        if session.last_view_offset > view_offset {
            log::debug!(
                "[Reconciler] 播放位置后退了 (上次: {}, 当前: {view_offset})",
                session.last_view_offset
            );
            refresh = true;
        }

        // 被忽略且缺少元数据的会话每次都重新核对
        if session.metadata.is_none() && session.is_skipped() {
            refresh = true;
        }

        if refresh && !self.refresh_or_delete(&mut session, view_offset) {
            return Lookup::Missing;
        }

        if let Err(reason) = Self::session_valid(&session) {
            self.delete(&session, reason);
            return Lookup::Missing;
        }

        if let Some(reason) = session.skip_reason() {
            return Lookup::Skipped(reason);
        }

        if state == PlaybackState::Playing && session.refresh_required() {
            log::debug!("[Reconciler] 会话 {session_key} 需要更新，正在更新...");
            if !self.refresh_or_delete(&mut session, view_offset) {
                return Lookup::Missing;
            }
        }

        Lookup::Ready(session)
    }

    /// 为服务器上正在进行的播放创建会话记录。
    fn create_session(&self, session_key: &str, state: PlaybackState) -> Option<WatchSession> {
        log::debug!("[Reconciler] 正在为当前媒体创建会话 (会话键: {session_key})");

        let live = self.live_session(session_key)?;
        let client = self.resolve_client(&live);

        let mut skip = None;
        let metadata = match self.services.metadata.get_metadata(&live.item_key) {
            Ok(metadata) => metadata,
            Err(MetadataError::NotSupported(message)) => {
                log::debug!("[Reconciler] {message}，忽略该会话。");
                skip = Some(SkipReason::UnsupportedMetadata);
                None
            }
            Err(e) => {
                log::warn!("[Reconciler] 获取条目 {} 的元数据失败: {e}", live.item_key);
                None
            }
        };

        let mut session = WatchSession::from_live(&live, state, metadata, client);
        if let Some(reason) = skip {
            session.skip(reason);
        }

        self.save(&session);
        self.emit(SessionChange::Created {
            session_key: session.session_key.clone(),
            item_key: session.item_key.clone(),
        });
        if let Some(reason) = skip {
            self.emit(SessionChange::Skipped {
                session_key: session.session_key.clone(),
                reason,
            });
        }

        Some(session)
    }

    /// 向服务器核对会话。返回 `Err` 时会话应被删除。
    fn update_session(
        &self,
        session: &mut WatchSession,
        view_offset: u64,
    ) -> std::result::Result<(), DeletionReason> {
        log::debug!(
            "[Reconciler] 尝试更新当前会话 (会话键: {})",
            session.session_key
        );

        let Some(live) = self.live_session(&session.session_key) else {
            log::warn!(
                "[Reconciler] 媒体服务器上找不到会话 {}。",
                session.session_key
            );
            return Err(DeletionReason::SessionVanished);
        };

        log::debug!(
            "[Reconciler] 上次条目: {}, 当前条目: {}",
            session.item_key,
            live.item_key
        );

        if session.item_key != live.item_key {
            log::debug!("[Reconciler] 会话无效: 媒体已变化");
            return Err(DeletionReason::MediaChanged);
        }

        session.last_view_offset = view_offset;
        session.mark_refreshed();
        Ok(())
    }

    fn refresh_or_delete(&self, session: &mut WatchSession, view_offset: u64) -> bool {
        match self.update_session(session, view_offset) {
            Ok(()) => {
                session.touch();
                self.save(session);
                self.emit(SessionChange::Refreshed {
                    session_key: session.session_key.clone(),
                });
                true
            }
            Err(reason) => {
                log::debug!("[Reconciler] 媒体已变化，删除会话 {}。", session.session_key);
                self.delete(session, reason);
                false
            }
        }
    }

    /// 没有元数据的会话只有在被有意忽略时才有效；时长必须为正。
    fn session_valid(session: &WatchSession) -> std::result::Result<(), DeletionReason> {
        match &session.metadata {
            None if session.is_skipped() => Ok(()),
            None => {
                log::debug!("[Reconciler] 会话无效: 缺少元数据");
                Err(DeletionReason::MissingMetadata)
            }
            Some(metadata) if metadata.duration <= 0 => {
                log::debug!("[Reconciler] 会话无效: 时长无效 ({})", metadata.duration);
                Err(DeletionReason::InvalidDuration)
            }
            Some(_) => Ok(()),
        }
    }

    fn live_session(&self, session_key: &str) -> Option<LiveSession> {
        match self.services.server.get_session(session_key) {
            Ok(live) => live,
            Err(e) => {
                log::warn!("[Reconciler] 查询会话 {session_key} 失败: {e}");
                None
            }
        }
    }

    fn resolve_client(&self, live: &LiveSession) -> Option<ClientInfo> {
        let player = live.player.as_ref()?;
        let fallback = || ClientInfo {
            machine_identifier: player.machine_identifier.clone(),
            name: player.title.clone(),
            platform: None,
        };

        match self.services.server.get_client(&player.machine_identifier) {
            Ok(Some(client)) => Some(client),
            Ok(None) => Some(fallback()),
            Err(e) => {
                log::warn!(
                    "[Reconciler] 查询客户端 {} 失败: {e}",
                    player.machine_identifier
                );
                Some(fallback())
            }
        }
    }

    fn skip(&self, session: &mut WatchSession, reason: SkipReason) {
        session.skip(reason);
        session.touch();
        self.save(session);
        self.emit(SessionChange::Skipped {
            session_key: session.session_key.clone(),
            reason,
        });
    }

    fn save(&self, session: &WatchSession) {
        if let Err(e) = self.services.store.save(session) {
            log::error!("[Reconciler] 保存会话 {} 失败: {e}", session.session_key);
        }
    }

    fn delete(&self, session: &WatchSession, reason: DeletionReason) {
        if let Err(e) = self.services.store.delete(session) {
            log::error!("[Reconciler] 删除会话 {} 失败: {e}", session.session_key);
        }
        self.flush_quietly();
        self.emit(SessionChange::Deleted {
            session_key: session.session_key.clone(),
            reason,
        });
    }

    fn flush_quietly(&self) {
        if let Err(e) = self.services.store.flush() {
            log::error!("[Reconciler] 会话记录落盘失败: {e}");
        }
    }

    fn emit(&self, change: SessionChange) {
        if let Some(tx) = &self.change_tx
            && tx.send(change).is_err()
        {
            log::trace!("[Reconciler] 会话变化接收端已关闭。");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Barrier, thread, time::Duration};

    #[test]
    fn keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let active = Arc::new(Mutex::new(0_u32));
        let max_seen = Arc::new(Mutex::new(0_u32));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    locks.with_key("same", || {
                        let now = {
                            let mut a = active.lock().unwrap();
                            *a += 1;
                            *a
                        };
                        {
                            let mut m = max_seen.lock().unwrap();
                            *m = (*m).max(now);
                        }
                        thread::sleep(Duration::from_millis(10));
                        *active.lock().unwrap() -= 1;
                    });
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*max_seen.lock().unwrap(), 1);
        assert!(locks.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn keyed_locks_release_entry_when_closure_panics() {
        let locks = KeyedLocks::default();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            locks.with_key("boom", || panic!("resolver exploded"));
        }));
        assert!(result.is_err());
        assert!(locks.locks.lock().unwrap().is_empty());

        // 同一个键之后仍然可用
        assert_eq!(locks.with_key("boom", || 7), 7);
        assert!(locks.locks.lock().unwrap().is_empty());
    }
}
