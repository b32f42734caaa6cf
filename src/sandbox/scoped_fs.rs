//! Filesystem capabilities jailed to one working directory.
//!
//! Paths coming from the isolate are untrusted. Every path is normalized
//! lexically against the root, then the deepest existing ancestor is
//! canonicalized so a symlink cannot point the write outside the root.
//! Anything that would land outside the root is rejected.

use std::path::{Component, Path, PathBuf};

use crate::error::SandboxError;

/// Read and write operations scoped to a single directory.
#[derive(Debug, Clone)]
pub struct ScopedFs {
    root: PathBuf,
    max_file_bytes: usize,
}

impl ScopedFs {
    /// Creates a scoped view of `root`. The root must exist.
    pub async fn new(root: impl AsRef<Path>, max_file_bytes: usize) -> Result<Self, SandboxError> {
        let root = tokio::fs::canonicalize(root.as_ref()).await?;
        Ok(Self {
            root,
            max_file_bytes,
        })
    }

    /// Canonical root of the jail.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `content` to `path`, creating parent directories inside the root.
    ///
    /// Returns the number of bytes written.
    pub async fn write(&self, path: &str, content: &str) -> Result<usize, SandboxError> {
        if content.len() > self.max_file_bytes {
            return Err(SandboxError::FileTooLarge {
                limit: self.max_file_bytes,
            });
        }

        let target = self.resolve(path).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
            // The directories just created may have joined an existing symlink.
            self.ensure_contained(path, parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(content.len())
    }

    /// Reads `path` as UTF-8 text.
    pub async fn read(&self, path: &str) -> Result<String, SandboxError> {
        let target = self.resolve(path).await?;
        let metadata = tokio::fs::metadata(&target).await?;
        if metadata.len() > self.max_file_bytes as u64 {
            return Err(SandboxError::FileTooLarge {
                limit: self.max_file_bytes,
            });
        }
        Ok(tokio::fs::read_to_string(&target).await?)
    }

    /// Maps an untrusted relative path to an absolute path inside the root.
    pub async fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let relative = normalize(path)?;
        let target = self.root.join(relative);
        self.ensure_contained(path, &target).await?;
        Ok(target)
    }

    async fn ensure_contained(&self, requested: &str, target: &Path) -> Result<(), SandboxError> {
        let mut cursor = Some(target);
        while let Some(candidate) = cursor {
            match tokio::fs::canonicalize(candidate).await {
                Ok(real) => {
                    if real.starts_with(&self.root) {
                        return Ok(());
                    }
                    return Err(SandboxError::PathEscape {
                        path: requested.to_string(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    cursor = candidate.parent();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SandboxError::PathEscape {
            path: requested.to_string(),
        })
    }
}

/// Lexically normalizes a relative path, refusing anything that climbs
/// above its starting point or names an absolute location.
fn normalize(path: &str) -> Result<PathBuf, SandboxError> {
    if path.trim().is_empty() {
        return Err(SandboxError::InvalidPath {
            path: path.to_string(),
            reason: "path is empty".to_string(),
        });
    }
    if path.contains('\0') {
        return Err(SandboxError::InvalidPath {
            path: path.to_string(),
            reason: "path contains a NUL byte".to_string(),
        });
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SandboxError::PathEscape {
                        path: path.to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::PathEscape {
                    path: path.to_string(),
                });
            }
        }
    }

    if parts.is_empty() {
        return Err(SandboxError::InvalidPath {
            path: path.to_string(),
            reason: "path names the working directory itself".to_string(),
        });
    }

    Ok(parts.iter().collect())
}
