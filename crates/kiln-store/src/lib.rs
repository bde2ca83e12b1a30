//! Content-addressed artifact storage for kiln.
//!
//! Artifacts are immutable directory trees identified by their git tree
//! hash. The store is shared read-only between concurrent builds; writes are
//! staged in a scratch directory and finalized with an atomic rename, so
//! concurrent producers of the same tree are harmless.

pub mod copy;
pub mod tree;

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact {0} is not installed in the store")]
    ArtifactMissing(TreeHash),

    #[error("no fetcher can produce artifact {0}")]
    NotFetchable(TreeHash),

    #[error("fetched artifact hashes to {actual}, expected {expected}")]
    HashMismatch { expected: TreeHash, actual: TreeHash },

    #[error("invalid tree hash {0:?}")]
    InvalidHash(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

pub(crate) fn io_err(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.into();
    move |source| StoreError::Io { path, source }
}

/// A git tree hash: the 160-bit content address of a directory tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeHash(pub [u8; 20]);

impl TreeHash {
    /// Render as lowercase hex
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(40);
        for byte in self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

    /// Parse a 40-character hex string
    pub fn from_hex(hex: &str) -> Result<TreeHash> {
        let invalid = || StoreError::InvalidHash(hex.to_string());
        if hex.len() != 40 || !hex.is_ascii() {
            return Err(invalid());
        }
        let mut bytes = [0u8; 20];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).map_err(|_| invalid())?;
        }
        Ok(TreeHash(bytes))
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({})", self.to_hex())
    }
}

/// Produces artifact contents on demand.
///
/// The network side of the build service (a content-addressed downloader) is
/// external to this crate; it plugs in here. `fetch` must populate `dest`
/// with the full tree for `hash`.
pub trait Fetcher {
    fn fetch(&self, hash: &TreeHash, dest: &Utf8Path) -> Result<()>;
}

/// A fetcher that cannot produce anything. Useful where every artifact is
/// expected to be installed already.
pub struct NullFetcher;

impl Fetcher for NullFetcher {
    fn fetch(&self, hash: &TreeHash, _dest: &Utf8Path) -> Result<()> {
        Err(StoreError::NotFetchable(*hash))
    }
}

/// The on-disk content-addressed store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: Utf8PathBuf,
}

impl ArtifactStore {
    /// Open (or lazily create) a store rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> ArtifactStore {
        ArtifactStore { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Where the artifact for `hash` lives (whether or not it is installed)
    pub fn artifact_path(&self, hash: &TreeHash) -> Utf8PathBuf {
        self.root.join("artifacts").join(hash.to_hex())
    }

    /// True when the artifact is installed
    pub fn contains(&self, hash: &TreeHash) -> bool {
        self.artifact_path(hash).is_dir()
    }

    /// Resolve an installed artifact's path, failing when absent.
    pub fn lookup(&self, hash: &TreeHash) -> Result<Utf8PathBuf> {
        let path = self.artifact_path(hash);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(StoreError::ArtifactMissing(*hash))
        }
    }

    /// Ensure the artifact for `hash` is installed, fetching it if missing.
    ///
    /// Idempotent, and tolerant of concurrent writers racing to produce the
    /// same tree: losing the finalizing rename to an identical artifact is
    /// success.
    pub fn ensure_installed(&self, hash: &TreeHash, fetcher: &dyn Fetcher) -> Result<Utf8PathBuf> {
        let dest = self.artifact_path(hash);
        if dest.is_dir() {
            return Ok(dest);
        }

        let scratch = self.scratch_dir(&format!("fetch-{hash}"))?;
        let result = self.fetch_into(hash, fetcher, &scratch, &dest);
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&scratch);
        }
        result?;
        Ok(dest)
    }

    fn fetch_into(
        &self,
        hash: &TreeHash,
        fetcher: &dyn Fetcher,
        scratch: &Utf8Path,
        dest: &Utf8Path,
    ) -> Result<()> {
        fetcher.fetch(hash, scratch)?;

        let actual = tree::tree_hash(scratch)?;
        if actual != *hash {
            return Err(StoreError::HashMismatch {
                expected: *hash,
                actual,
            });
        }

        self.finalize(scratch, dest)
    }

    /// Snapshot an external directory into the store, returning its tree
    /// hash. The source root's permission bits are preserved on the
    /// installed artifact root.
    pub fn install_tree(&self, src: &Utf8Path) -> Result<TreeHash> {
        let hash = tree::tree_hash(src)?;
        let dest = self.artifact_path(&hash);
        if dest.is_dir() {
            debug!(artifact = %hash, "tree already installed");
            return Ok(hash);
        }

        let scratch = self.scratch_dir(&format!("snapshot-{hash}"))?;
        copy::copy_tree(src, &scratch)?;

        let mode = std::fs::metadata(src)
            .map_err(io_err(src))?
            .permissions();
        std::fs::set_permissions(&scratch, mode).map_err(io_err(&scratch))?;

        self.finalize(&scratch, &dest)?;
        Ok(hash)
    }

    /// Atomically move a fully staged tree to its final location. A rename
    /// race against an identical artifact is absorbed.
    fn finalize(&self, scratch: &Utf8Path, dest: &Utf8Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        match std::fs::rename(scratch, dest) {
            Ok(()) => Ok(()),
            Err(_) if dest.is_dir() => {
                // Someone else installed the same tree first.
                let _ = std::fs::remove_dir_all(scratch);
                Ok(())
            }
            Err(source) => Err(StoreError::Io {
                path: dest.to_owned(),
                source,
            }),
        }
    }

    fn scratch_dir(&self, label: &str) -> Result<Utf8PathBuf> {
        let dir = self
            .root
            .join("tmp")
            .join(format!("{label}-{}", nonce()));
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(dir)
    }
}

/// A cheap unique-enough suffix for scratch paths
pub(crate) fn nonce() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_nanos() as u64 ^ std::process::id() as u64
}
