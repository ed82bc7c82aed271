use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    error::{Result, ScrobbleError},
    session::WatchSession,
};

/// 会话记录的持久化存储。
///
/// 同一个会话键的读写由协调器串行化，存储本身只需要保证并发访问安全，
/// 同一键上以最后一次写入为准。
pub trait SessionStore: Send + Sync {
    /// 按会话键读取记录。
    fn load(&self, session_key: &str) -> Result<Option<WatchSession>>;

    /// 写入（或覆盖）一条记录。
    fn save(&self, session: &WatchSession) -> Result<()>;

    /// 删除一条记录。记录不存在时不视为错误。
    fn delete(&self, session: &WatchSession) -> Result<()>;

    /// 将内存中的修改落盘。
    fn flush(&self) -> Result<()>;
}

/// 基于 `HashMap` 的会话存储，可选地在 `flush` 时写入一个 JSON 文件。
#[derive(Debug, Default)]
pub struct JsonSessionStore {
    sessions: RwLock<HashMap<String, WatchSession>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl JsonSessionStore {
    /// 只存在于内存中的存储，`flush` 不做任何事。
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// 打开（或新建）位于 `path` 的存储文件。
    ///
    /// 文件不存在时从空存储开始，第一次 `flush` 时创建。
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let sessions = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            HashMap::new()
        };

        log::debug!(
            "[SessionStore] 已从 {} 载入 {} 条会话记录。",
            path.display(),
            sessions.len()
        );

        Ok(Self {
            sessions: RwLock::new(sessions),
            path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    /// 当前保存的记录数量。
    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// 存储是否为空。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 所有会话键的快照。
    pub fn keys(&self) -> Vec<String> {
        self.sessions
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl SessionStore for JsonSessionStore {
    fn load(&self, session_key: &str) -> Result<Option<WatchSession>> {
        let sessions = self.sessions.read()?;
        Ok(sessions.get(session_key).cloned())
    }

    fn save(&self, session: &WatchSession) -> Result<()> {
        let mut sessions = self.sessions.write()?;
        sessions.insert(session.session_key.clone(), session.clone());
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn delete(&self, session: &WatchSession) -> Result<()> {
        let mut sessions = self.sessions.write()?;
        if sessions.remove(&session.session_key).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let serialized = {
            let sessions = self.sessions.read()?;
            serde_json::to_string_pretty(&*sessions)?
        };

        // 先写临时文件再重命名，避免进程中途退出留下半个文件。
        let tmp_path = path.with_extension("json.tmp");
        let written = fs::write(&tmp_path, serialized).and_then(|()| fs::rename(&tmp_path, path));
        if let Err(e) = written {
            self.dirty.store(true, Ordering::Release);
            return Err(ScrobbleError::Store(format!(
                "无法写入 {}: {e}",
                path.display()
            )));
        }

        log::trace!("[SessionStore] 会话记录已写入 {}。", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::PlaybackState,
        gateway::LiveSession,
        session::{SessionStatus, SkipReason},
    };

    fn session(key: &str) -> WatchSession {
        let live = LiveSession {
            session_key: key.to_string(),
            item_key: format!("item-{key}"),
            player: None,
            user: None,
            view_offset: None,
        };
        WatchSession::from_live(&live, PlaybackState::Playing, None, None)
    }

    #[test]
    fn save_load_delete() {
        let store = JsonSessionStore::in_memory();
        let s = session("1");

        assert_eq!(store.load("1").unwrap(), None);
        store.save(&s).unwrap();
        assert_eq!(store.load("1").unwrap(), Some(s.clone()));
        assert_eq!(store.len(), 1);

        store.delete(&s).unwrap();
        store.delete(&s).unwrap();
        assert!(store.is_empty());
        store.flush().unwrap();
    }

    #[test]
    fn flush_persists_to_disk_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        {
            let store = JsonSessionStore::open(&path).unwrap();
            let mut s = session("42");
            s.status = SessionStatus::Skipped(SkipReason::UnsupportedMetadata);
            s.last_view_offset = 30_000;
            store.save(&s).unwrap();
            store.flush().unwrap();
        }

        let reopened = JsonSessionStore::open(&path).unwrap();
        let loaded = reopened.load("42").unwrap().expect("session should survive a reopen");
        assert_eq!(loaded.last_view_offset, 30_000);
        assert_eq!(
            loaded.status,
            SessionStatus::Skipped(SkipReason::UnsupportedMetadata)
        );
        assert_eq!(reopened.keys(), vec!["42".to_string()]);
    }
}
