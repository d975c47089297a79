//! In-memory [`RemoteClient`] used by engine tests.

use std::collections::{BTreeMap, HashSet};
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::digest::now_unix;
use super::paths::{ancestors, is_under};
use super::remote::{EntryKind, Quota, RemoteClient, RemoteEntry, RemoteError};

#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub kind: EntryKind,
    pub data: Vec<u8>,
    pub modified: i64,
    pub mode: Option<u32>,
}

#[derive(Default)]
pub struct MemoryRemote {
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    calls: Mutex<Vec<String>>,
    failing_downloads: Mutex<HashSet<String>>,
    offline: AtomicBool,
    staging: Mutex<Option<PathBuf>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, path: &str, data: &[u8], modified: i64) {
        let mut objects = self.objects.lock().unwrap();
        for dir in ancestors(path) {
            objects.entry(dir).or_insert(MemoryObject {
                kind: EntryKind::Dir,
                data: Vec::new(),
                modified,
                mode: None,
            });
        }
        objects.insert(
            path.to_string(),
            MemoryObject {
                kind: EntryKind::File,
                data: data.to_vec(),
                modified,
                mode: None,
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<MemoryObject> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Mutating calls only; listing and quota reads are filtered out.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| {
                !call.starts_with("list") && !call.starts_with("info") && !call.starts_with("last")
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_download(&self, path: &str) {
        self.failing_downloads
            .lock()
            .unwrap()
            .insert(path.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Downloads are written under `dir` first and renamed into place, like
    /// the real transfer client does with the work directory.
    pub fn stage_downloads_in(&self, dir: PathBuf) {
        *self.staging.lock().unwrap() = Some(dir);
    }

    fn record(&self, call: String) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(call);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "offline",
            )));
        }
        Ok(())
    }

    fn entry(path: &str, object: &MemoryObject) -> RemoteEntry {
        RemoteEntry {
            path: path.to_string(),
            kind: object.kind,
            size: object.data.len() as u64,
            modified: object.modified,
            sha256: match object.kind {
                EntryKind::File => Some(format!("{:x}", Sha256::digest(&object.data))),
                EntryKind::Dir => None,
            },
            mode: object.mode,
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn info(&self) -> Result<Quota, RemoteError> {
        self.record("info".into())?;
        let used = self
            .objects
            .lock()
            .unwrap()
            .values()
            .map(|object| object.data.len() as u64)
            .sum();
        Ok(Quota {
            total: 1 << 30,
            used,
            trash: 0,
        })
    }

    async fn last_uploaded(&self, limit: u32) -> Result<Vec<String>, RemoteError> {
        self.record("last".into())?;
        let objects = self.objects.lock().unwrap();
        let mut files: Vec<(&String, &MemoryObject)> = objects
            .iter()
            .filter(|(_, object)| object.kind == EntryKind::File)
            .collect();
        files.sort_by(|a, b| b.1.modified.cmp(&a.1.modified).then(a.0.cmp(b.0)));
        Ok(files
            .into_iter()
            .take(limit as usize)
            .map(|(path, _)| path.clone())
            .collect())
    }

    async fn list(&self, page_size: u32, offset: u32) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.record(format!("list {offset}"))?;
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|(_, object)| object.kind == EntryKind::File)
            .skip(offset as usize)
            .take(page_size as usize)
            .map(|(path, object)| Self::entry(path, object))
            .collect())
    }

    async fn resource(&self, path: &str) -> Result<Option<RemoteEntry>, RemoteError> {
        self.record(format!("resource {path}"))?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(path)
            .map(|object| Self::entry(path, object)))
    }

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError> {
        self.record(format!("mkdir {path}"))?;
        self.objects
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert(MemoryObject {
                kind: EntryKind::Dir,
                data: Vec::new(),
                modified: now_unix(),
                mode: None,
            });
        Ok(())
    }

    async fn delete(&self, path: &str, _permanent: bool) -> Result<(), RemoteError> {
        self.record(format!("delete {path}"))?;
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        objects.retain(|key, _| !is_under(key, path));
        Ok(())
    }

    async fn move_to(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.record(format!("move {from} {to}"))?;
        let mut objects = self.objects.lock().unwrap();
        let moved: Vec<(String, MemoryObject)> = objects
            .iter()
            .filter(|(key, _)| is_under(key, from))
            .map(|(key, object)| (key.clone(), object.clone()))
            .collect();
        if moved.is_empty() {
            return Err(RemoteError::NotFound(from.to_string()));
        }
        for (key, object) in moved {
            objects.remove(&key);
            objects.insert(format!("{to}{}", &key[from.len()..]), object);
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.record(format!("copy {from} {to}"))?;
        let mut objects = self.objects.lock().unwrap();
        let copied: Vec<(String, MemoryObject)> = objects
            .iter()
            .filter(|(key, _)| is_under(key, from))
            .map(|(key, object)| (format!("{to}{}", &key[from.len()..]), object.clone()))
            .collect();
        if copied.is_empty() {
            return Err(RemoteError::NotFound(from.to_string()));
        }
        objects.extend(copied);
        Ok(())
    }

    async fn upload(&self, local: &Path, path: &str) -> Result<(), RemoteError> {
        self.record(format!("upload {path}"))?;
        let data = tokio::fs::read(local).await?;
        self.put_file(path, &data, now_unix());
        Ok(())
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<(), RemoteError> {
        self.record(format!("setmode {path} {mode:o}"))?;
        match self.objects.lock().unwrap().get_mut(path) {
            Some(object) => {
                object.mode = Some(mode);
                Ok(())
            }
            None => Err(RemoteError::NotFound(path.to_string())),
        }
    }

    async fn download(
        &self,
        path: &str,
        local: &Path,
        _expected_sha256: Option<&str>,
        mode: Option<u32>,
    ) -> Result<(), RemoteError> {
        self.record(format!("download {path}"))?;
        if self.failing_downloads.lock().unwrap().contains(path) {
            return Err(RemoteError::OperationFailed(format!("download {path}")));
        }
        let object = self
            .get(path)
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.staging.lock().unwrap().clone();
        match staging {
            Some(dir) => {
                tokio::fs::create_dir_all(&dir).await?;
                let name = format!("{:x}", Sha256::digest(path.as_bytes()));
                let partial = dir.join(format!("{name}.partial"));
                tokio::fs::write(&partial, &object.data).await?;
                if let Some(mode) = mode {
                    tokio::fs::set_permissions(&partial, Permissions::from_mode(mode)).await?;
                }
                tokio::fs::rename(&partial, local).await?;
            }
            None => {
                tokio::fs::write(local, &object.data).await?;
                if let Some(mode) = mode {
                    tokio::fs::set_permissions(local, Permissions::from_mode(mode)).await?;
                }
            }
        }
        Ok(())
    }

    async fn trash(&self) -> Result<(), RemoteError> {
        self.record("trash".into())?;
        Ok(())
    }
}
