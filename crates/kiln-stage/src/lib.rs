//! Build workspace assembly: the per-build prefix and source staging.
//!
//! Every build owns one [`Prefix`], a nonce-suffixed directory holding the
//! source tree, install staging areas and build metadata. The nonce makes
//! workspace paths unique per build, so an absolute path baked into a built
//! binary is detectable later by auditing for it.

pub mod source;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_platform::Platform;
use thiserror::Error;
use tracing::debug;

/// Errors from workspace assembly
#[derive(Debug, Error)]
pub enum StageError {
    #[error("unknown archive format: {0}")]
    ArchiveFormatUnknown(Utf8PathBuf),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: Utf8PathBuf,
        expected: String,
        actual: String,
    },

    #[error("{command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("workspace root is not valid UTF-8: {0}")]
    NonUtf8Path(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// Result type for staging operations.
pub type Result<T> = std::result::Result<T, StageError>;

pub(crate) fn io_err(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> StageError {
    let path = path.into();
    move |source| StageError::Io { path, source }
}

/// Create a nonce-suffixed workspace directory under `parent`.
pub fn nonced_workspace(parent: &Utf8Path) -> Result<Utf8PathBuf> {
    let dir = parent.join(format!("{:016x}", nonce()));
    std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
    Ok(dir)
}

fn nonce() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_nanos() as u64 ^ std::process::id() as u64
}

/// A build's workspace prefix.
///
/// Layout:
/// ```text
/// <root>/srcdir/                    sources (and srcdir/patches/)
/// <root>/metadir/                   build metadata
/// <root>/<target-triplet>/destdir/  install staging
/// <root>/<host-triplet>/destdir/    host tool staging
/// <root>/destdir -> <target-triplet>/destdir
/// ```
///
/// The prefix is owned exclusively by one build and lives exactly as long
/// as it.
#[derive(Debug, Clone)]
pub struct Prefix {
    root: Utf8PathBuf,
    target_triplet: String,
    host_triplet: String,
}

impl Prefix {
    /// Create the prefix directory structure under `root`.
    pub fn create(root: &Utf8Path, target: &Platform, host: &Platform) -> Result<Prefix> {
        std::fs::create_dir_all(root).map_err(io_err(root))?;
        let canonical = root
            .canonicalize()
            .map_err(io_err(root))?;
        let root = Utf8PathBuf::from_path_buf(canonical)
            .map_err(|p| StageError::NonUtf8Path(p.display().to_string()))?;

        let prefix = Prefix {
            root,
            target_triplet: target.concrete().triplet(),
            host_triplet: host.concrete().triplet(),
        };

        std::fs::create_dir_all(prefix.srcdir()).map_err(io_err(prefix.srcdir()))?;
        std::fs::create_dir_all(prefix.metadir()).map_err(io_err(prefix.metadir()))?;
        std::fs::create_dir_all(prefix.target_destdir()).map_err(io_err(prefix.target_destdir()))?;
        std::fs::create_dir_all(prefix.host_destdir()).map_err(io_err(prefix.host_destdir()))?;

        let link = prefix.root.join("destdir");
        if !link.is_symlink() {
            symlink(
                Utf8Path::new(&prefix.target_triplet).join("destdir").as_str(),
                &link,
            )?;
        }

        debug!(root = %prefix.root, target = %prefix.target_triplet, "created build prefix");
        Ok(prefix)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn target_triplet(&self) -> &str {
        &self.target_triplet
    }

    pub fn host_triplet(&self) -> &str {
        &self.host_triplet
    }

    /// Where sources are staged
    pub fn srcdir(&self) -> Utf8PathBuf {
        self.root.join("srcdir")
    }

    /// Build metadata (toolchain files, install records)
    pub fn metadir(&self) -> Utf8PathBuf {
        self.root.join("metadir")
    }

    /// The install staging area for the build target
    pub fn target_destdir(&self) -> Utf8PathBuf {
        self.root.join(&self.target_triplet).join("destdir")
    }

    /// The install staging area for host tools
    pub fn host_destdir(&self) -> Utf8PathBuf {
        self.root.join(&self.host_triplet).join("destdir")
    }

    /// Per-build dependency artifact copies for a triplet
    pub fn artifacts_dir(&self, triplet: &str) -> Utf8PathBuf {
        self.root.join(triplet).join("artifacts")
    }

    /// The private package environment for a triplet
    pub fn project_dir(&self, triplet: &str) -> Utf8PathBuf {
        self.root.join(triplet).join(".project")
    }

    /// Squashfs mountpoints for this build
    pub fn mounts_dir(&self) -> Utf8PathBuf {
        self.root.join(".mounts")
    }

    /// Remove the whole prefix.
    pub fn cleanup(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.root).map_err(io_err(&self.root))
    }
}

#[cfg(unix)]
pub(crate) fn symlink(target: &str, link: &Utf8Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(io_err(link))
}

#[cfg(not(unix))]
pub(crate) fn symlink(_target: &str, link: &Utf8Path) -> Result<()> {
    Err(StageError::Io {
        path: link.to_owned(),
        source: std::io::Error::other("symlinks are not supported on this platform"),
    })
}
