//! Authorized-chats and whitelisted-users storage, each a lock-protected,
//! atomically-rewritten file.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::file_lock;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthorizedChatsFile {
    #[serde(default)]
    authorized_chat_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccessCounts {
    pub authorized_chats: usize,
    pub whitelisted_users: usize,
}

pub struct AccessStore {
    authorized_chats_file: PathBuf,
    whitelist_file: PathBuf,
    lock_file: PathBuf,
}

fn atomic_write(path: &std::path::Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_file_name(format!(
        "{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("access")
    ));
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

impl AccessStore {
    pub fn new(authorized_chats_file: PathBuf, whitelist_file: PathBuf, lock_file: PathBuf) -> Self {
        Self {
            authorized_chats_file,
            whitelist_file,
            lock_file,
        }
    }

    fn read_authorized_locked(&self) -> BTreeSet<i64> {
        let Ok(content) = std::fs::read_to_string(&self.authorized_chats_file) else {
            return BTreeSet::new();
        };
        let Ok(parsed) = serde_json::from_str::<AuthorizedChatsFile>(&content) else {
            return BTreeSet::new();
        };
        parsed.authorized_chat_ids.into_iter().collect()
    }

    fn write_authorized_locked(&self, chat_ids: &BTreeSet<i64>) -> anyhow::Result<()> {
        let payload = AuthorizedChatsFile {
            authorized_chat_ids: chat_ids.iter().copied().collect(),
        };
        let mut rendered = serde_json::to_string_pretty(&payload)?;
        rendered.push('\n');
        atomic_write(&self.authorized_chats_file, &rendered)
    }

    fn read_whitelist_locked(&self) -> BTreeSet<i64> {
        let Ok(content) = std::fs::read_to_string(&self.whitelist_file) else {
            return BTreeSet::new();
        };
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.parse::<i64>().ok())
            .collect()
    }

    fn write_whitelist_locked(&self, user_ids: &BTreeSet<i64>) -> anyhow::Result<()> {
        let mut rendered = user_ids.iter().map(i64::to_string).collect::<Vec<_>>().join("\n");
        if !user_ids.is_empty() {
            rendered.push('\n');
        }
        atomic_write(&self.whitelist_file, &rendered)
    }

    pub fn is_chat_authorized(&self, chat_id: i64) -> anyhow::Result<bool> {
        file_lock::with_lock(&self.lock_file, || Ok(self.read_authorized_locked().contains(&chat_id)))
    }

    /// Returns `true` if this call newly authorized the chat.
    pub fn authorize_chat(&self, chat_id: i64) -> anyhow::Result<bool> {
        file_lock::with_lock(&self.lock_file, || {
            let mut current = self.read_authorized_locked();
            if !current.insert(chat_id) {
                return Ok(false);
            }
            self.write_authorized_locked(&current)?;
            Ok(true)
        })
    }

    pub fn is_user_whitelisted(&self, user_id: i64) -> anyhow::Result<bool> {
        file_lock::with_lock(&self.lock_file, || Ok(self.read_whitelist_locked().contains(&user_id)))
    }

    /// Returns `true` if this call newly whitelisted the user.
    pub fn add_user_to_whitelist(&self, user_id: i64) -> anyhow::Result<bool> {
        file_lock::with_lock(&self.lock_file, || {
            let mut current = self.read_whitelist_locked();
            if !current.insert(user_id) {
                return Ok(false);
            }
            self.write_whitelist_locked(&current)?;
            Ok(true)
        })
    }

    /// Returns how many of `user_ids` were newly added.
    pub fn add_users_to_whitelist(&self, user_ids: &[i64]) -> anyhow::Result<usize> {
        file_lock::with_lock(&self.lock_file, || {
            let mut current = self.read_whitelist_locked();
            let before = current.len();
            for user_id in user_ids {
                current.insert(*user_id);
            }
            let added = current.len().saturating_sub(before);
            if added > 0 {
                self.write_whitelist_locked(&current)?;
            }
            Ok(added)
        })
    }

    pub fn snapshot_counts(&self) -> anyhow::Result<AccessCounts> {
        file_lock::with_lock(&self.lock_file, || {
            Ok(AccessCounts {
                authorized_chats: self.read_authorized_locked().len(),
                whitelisted_users: self.read_whitelist_locked().len(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &std::path::Path) -> AccessStore {
        AccessStore::new(
            dir.join("authorized_chats.json"),
            dir.join("whitelist.txt"),
            dir.join(".access.lock"),
        )
    }

    #[test]
    fn authorize_chat_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(!store.is_chat_authorized(42).unwrap());
        assert!(store.authorize_chat(42).unwrap());
        assert!(!store.authorize_chat(42).unwrap());
        assert!(store.is_chat_authorized(42).unwrap());
    }

    #[test]
    fn whitelist_roundtrips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(dir.path());
            assert!(store.add_user_to_whitelist(7).unwrap());
        }
        let reopened = store(dir.path());
        assert!(reopened.is_user_whitelisted(7).unwrap());
    }

    #[test]
    fn add_users_to_whitelist_counts_only_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.add_user_to_whitelist(1).unwrap();

        let added = store.add_users_to_whitelist(&[1, 2, 3]).unwrap();
        assert_eq!(added, 2);
    }

    #[test]
    fn whitelist_file_ignores_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whitelist.txt");
        std::fs::write(&path, "# comment\n\n123\n456\n").unwrap();
        let store = AccessStore::new(dir.path().join("authorized_chats.json"), path, dir.path().join(".lock"));
        assert!(store.is_user_whitelisted(123).unwrap());
        assert!(store.is_user_whitelisted(456).unwrap());
        assert_eq!(store.snapshot_counts().unwrap().whitelisted_users, 2);
    }

    #[test]
    fn snapshot_counts_reports_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.authorize_chat(1).unwrap();
        store.authorize_chat(2).unwrap();
        store.add_user_to_whitelist(99).unwrap();

        let counts = store.snapshot_counts().unwrap();
        assert_eq!(counts.authorized_chats, 2);
        assert_eq!(counts.whitelisted_users, 1);
    }
}
