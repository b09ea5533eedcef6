//! On-disk store backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<base64url(store name)>/<sha256(key)>.toml
//! ```
//!
//! Each entry file carries its own key, so a lookup can tell a digest
//! collision from a hit. Files are written to `<entry>.tmp` and renamed into
//! place, so readers never observe a half-written entry.
//!
//! Store names are limited to [`MAX_STORE_NAME_LEN`] bytes so the encoded
//! directory name stays within common filename limits.
//!
//! A bulk commit moves every entry it replaces to `<entry>.bak` first. If a
//! later rename fails, the placed entries are removed and the backups are
//! moved back, so the store ends up as it was before the call.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{CacheStorage, MAX_STORE_NAME_LEN};
use crate::error::{Error, Result};
use crate::request::RequestKey;
use crate::response::StoredResponse;

const ENTRY_EXT: &str = "toml";
const TMP_EXT: &str = "toml.tmp";
const BACKUP_EXT: &str = "toml.bak";

#[derive(Debug, Serialize, Deserialize)]
struct HeaderEntry {
    name: String,
    value: String,
}

/// Serialized form of one entry.
#[derive(Debug, Serialize, Deserialize)]
struct EntryFile {
    method: String,
    url: String,
    status: u16,
    stored_at: Option<DateTime<Utc>>,
    body: String,
    #[serde(default)]
    headers: Vec<HeaderEntry>,
}

impl EntryFile {
    fn encode(key: &RequestKey, response: &StoredResponse) -> Self {
        Self {
            method: key.method.clone(),
            url: key.url.clone(),
            status: response.status,
            stored_at: response.stored_at,
            body: BASE64.encode(&response.body),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| HeaderEntry {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    fn decode(self) -> Result<StoredResponse> {
        let body = BASE64
            .decode(&self.body)
            .map_err(|e| Error::Store(format!("corrupt body for {}: {e}", self.url)))?;
        Ok(StoredResponse {
            status: self.status,
            headers: self
                .headers
                .into_iter()
                .map(|h| (h.name, h.value))
                .collect(),
            body: Bytes::from(body),
            stored_at: self.stored_at,
        })
    }
}

/// One entry moved into place by a bulk commit.
#[derive(Debug)]
struct Committed {
    path: PathBuf,
    backup: Option<PathBuf>,
    placed: bool,
}

/// Stores persisted as directories of TOML entry files.
///
/// Writes are serialized through an internal lock; reads are not.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskStorage {
    /// Creates a storage rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, name: &str) -> Result<PathBuf> {
        if name.len() > MAX_STORE_NAME_LEN {
            return Err(Error::Store(format!(
                "store name is {} bytes, limit is {MAX_STORE_NAME_LEN}",
                name.len()
            )));
        }
        Ok(self.root.join(URL_SAFE_NO_PAD.encode(name)))
    }

    fn entry_file(dir: &Path, key: &RequestKey) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.method.as_bytes());
        hasher.update(b" ");
        hasher.update(key.url.as_bytes());
        dir.join(format!("{:x}.{ENTRY_EXT}", hasher.finalize()))
    }

    pub(crate) fn entry_path(&self, name: &str, key: &RequestKey) -> Result<PathBuf> {
        Ok(Self::entry_file(&self.store_dir(name)?, key))
    }

    async fn write_staged(path: &Path, key: &RequestKey, response: &StoredResponse) -> Result<PathBuf> {
        let contents = toml::to_string(&EntryFile::encode(key, response))
            .map_err(|e| Error::Store(format!("cannot encode {key}: {e}")))?;
        let tmp = path.with_extension(TMP_EXT);
        tokio::fs::write(&tmp, contents).await?;
        Ok(tmp)
    }

    async fn discard(staged: &[(PathBuf, PathBuf)]) {
        for (tmp, _) in staged {
            if let Err(e) = tokio::fs::remove_file(tmp).await {
                log::debug!("Cannot remove staged {}: {e}", tmp.display());
            }
        }
    }

    /// Moves `tmp` onto `path`, keeping any file it replaces as a backup.
    async fn commit_one(tmp: &Path, path: &Path, committed: &mut Vec<Committed>) -> Result<()> {
        let backup = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {
                let backup = path.with_extension(BACKUP_EXT);
                tokio::fs::rename(path, &backup).await?;
                Some(backup)
            }
            _ => None,
        };
        committed.push(Committed {
            path: path.to_path_buf(),
            backup,
            placed: false,
        });

        tokio::fs::rename(tmp, path).await?;
        if let Some(last) = committed.last_mut() {
            last.placed = true;
        }
        Ok(())
    }

    async fn roll_back(committed: Vec<Committed>) {
        for entry in committed.into_iter().rev() {
            if entry.placed {
                if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                    log::warn!("Rollback cannot remove {}: {e}", entry.path.display());
                }
            }
            if let Some(backup) = entry.backup {
                if let Err(e) = tokio::fs::rename(&backup, &entry.path).await {
                    log::warn!("Rollback cannot restore {}: {e}", entry.path.display());
                }
            }
        }
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, name: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.store_dir(name)?).await?;
        Ok(())
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let decoded = entry
                .file_name()
                .to_str()
                .and_then(|s| URL_SAFE_NO_PAD.decode(s).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded {
                Some(name) => names.push(name),
                None => log::debug!("Ignoring foreign directory {}", entry.path().display()),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let dir = self.store_dir(name)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
        let contents = match tokio::fs::read_to_string(self.entry_path(name, key)?).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: EntryFile = toml::from_str(&contents)
            .map_err(|e| Error::Store(format!("corrupt entry for {key}: {e}")))?;
        if file.key() != *key {
            return Ok(None);
        }
        file.decode().map(Some)
    }

    async fn put(&self, name: &str, key: RequestKey, response: StoredResponse) -> Result<()> {
        let dir = self.store_dir(name)?;
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&dir).await?;

        let path = Self::entry_file(&dir, &key);
        let tmp = Self::write_staged(&path, &key, &response.stamped()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<(RequestKey, StoredResponse)>) -> Result<()> {
        let dir = self.store_dir(name)?;
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&dir).await?;

        // One slot per entry file, in first-seen order; later duplicates replace earlier ones.
        let mut batch: Vec<(PathBuf, RequestKey, StoredResponse)> = Vec::with_capacity(entries.len());
        let mut slots: HashMap<PathBuf, usize> = HashMap::with_capacity(entries.len());
        for (key, response) in entries {
            let path = Self::entry_file(&dir, &key);
            if let Some(&slot) = slots.get(&path) {
                batch[slot] = (path, key, response);
            } else {
                slots.insert(path.clone(), batch.len());
                batch.push((path, key, response));
            }
        }

        let mut staged = Vec::with_capacity(batch.len());
        for (path, key, response) in batch {
            match Self::write_staged(&path, &key, &response.stamped()).await {
                Ok(tmp) => staged.push((tmp, path)),
                Err(e) => {
                    Self::discard(&staged).await;
                    return Err(e);
                }
            }
        }

        let mut committed = Vec::with_capacity(staged.len());
        for (index, (tmp, path)) in staged.iter().enumerate() {
            if let Err(e) = Self::commit_one(tmp, path, &mut committed).await {
                log::warn!("Commit to {name} failed, rolling back: {e}");
                Self::roll_back(committed).await;
                Self::discard(&staged[index..]).await;
                return Err(e);
            }
        }

        for backup in committed.into_iter().filter_map(|c| c.backup) {
            if let Err(e) = tokio::fs::remove_file(&backup).await {
                log::debug!("Cannot remove backup {}: {e}", backup.display());
            }
        }
        Ok(())
    }

    async fn len(&self, name: &str) -> Result<usize> {
        let mut read_dir = match tokio::fs::read_dir(self.store_dir(name)?).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == ENTRY_EXT)
                && entry.file_type().await?.is_file()
            {
                count += 1;
            }
        }
        Ok(count)
    }
}
