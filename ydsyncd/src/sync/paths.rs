use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
    #[error("{0} is outside of the sync root")]
    OutsideRoot(PathBuf),
}

/// Maps a root-relative path ("/Docs/A.txt", also accepting "disk:/Docs/A.txt")
/// to its location under `root`.
pub fn local_path_for(root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    let normalized = normalize_remote(remote_path);
    if normalized.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path_for`]: "/Docs/A.txt" for `<root>/Docs/A.txt`.
pub fn remote_path_for(root: &Path, local: &Path) -> Result<String, PathError> {
    let relative = local
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;
    let mut out = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                out.push('/');
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => continue,
            _ => return Err(PathError::UnsupportedComponent),
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Strips the `disk:` scheme the service prefixes to absolute paths.
pub fn normalize_remote(path: &str) -> String {
    let rest = path.strip_prefix("disk:").unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}

/// Proper ancestors of a remote path, outermost first: "/a/b/c" -> ["/a", "/a/b"].
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    if !path.starts_with('/') {
        return out;
    }
    let mut idx = 0;
    while let Some(pos) = path[idx + 1..].find('/') {
        idx += pos + 1;
        out.push(path[..idx].to_string());
    }
    out
}

/// True when `path` equals `prefix` or lives beneath it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

pub fn is_excluded(path: &Path, exclusions: &[PathBuf]) -> bool {
    exclusions.iter().any(|prefix| path.starts_with(prefix))
}

/// Absolute path prefixes that are never watched nor synchronized. Clones
/// share the same set, so an exclusion added later is seen everywhere.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    prefixes: Arc<RwLock<Vec<PathBuf>>>,
}

impl ExclusionSet {
    pub fn new(prefixes: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            prefixes: Arc::new(RwLock::new(prefixes.into_iter().collect())),
        }
    }

    pub fn add(&self, prefix: PathBuf) {
        let mut prefixes = self
            .prefixes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        let prefixes = self
            .prefixes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        is_excluded(path, &prefixes)
    }

    pub fn to_vec(&self) -> Vec<PathBuf> {
        self.prefixes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
