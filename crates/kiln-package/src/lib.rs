//! Packaging the install prefix as a content-addressed tarball.
//!
//! The prefix is snapshotted into the artifact store (yielding its git tree
//! hash), then archived deterministically: entries sorted, timestamps and
//! ownership fixed, symlinks preserved, gzip level 9. Packaging the same
//! prefix twice yields the same tree hash and the same archive digest.

use camino::{Utf8Path, Utf8PathBuf};
use kiln_platform::Platform;
use kiln_store::{ArtifactStore, StoreError, TreeHash};
use semver::Version;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use walkdir::WalkDir;

/// Errors from packaging
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("output {0} already exists (pass force to overwrite)")]
    OutputExists(Utf8PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("archive error at {path}: {source}")]
    Archive {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// Result type for packaging.
pub type Result<T> = std::result::Result<T, PackageError>;

fn io_err(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> PackageError {
    let path = path.into();
    move |source| PackageError::Io { path, source }
}

/// The three identifiers a packaged artifact carries
#[derive(Debug, Clone)]
pub struct PackageOutput {
    /// Where the tarball was written
    pub path: Utf8PathBuf,
    /// SHA-256 of the tarball, lowercase hex
    pub sha256: String,
    /// Git tree hash of the packaged prefix
    pub tree_hash: TreeHash,
}

/// Snapshot `prefix_dir` into the store and archive it.
///
/// The output lands at `<out_base>.v<version>.<triplet>.tar.gz`; an existing
/// output fails unless `force` is set.
pub fn package(
    store: &ArtifactStore,
    prefix_dir: &Utf8Path,
    out_base: &Utf8Path,
    version: &Version,
    platform: &Platform,
    force: bool,
) -> Result<PackageOutput> {
    let out_path = Utf8PathBuf::from(format!(
        "{out_base}.v{version}.{}.tar.gz",
        platform.triplet()
    ));
    if out_path.exists() && !force {
        return Err(PackageError::OutputExists(out_path));
    }

    // Snapshot first: the store copy is what gets archived, insulating the
    // archive from concurrent prefix mutation.
    let tree_hash = store.install_tree(prefix_dir)?;
    let snapshot = store.lookup(&tree_hash)?;

    let tarball = deterministic_tar(&snapshot)?;
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(9));
    std::io::Write::write_all(&mut encoder, &tarball).map_err(io_err(&out_path))?;
    let compressed = encoder.finish().map_err(io_err(&out_path))?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    std::fs::write(&out_path, &compressed).map_err(io_err(&out_path))?;

    let sha256 = format!("{:x}", Sha256::digest(&compressed));
    info!(path = %out_path, %tree_hash, "packaged prefix");

    Ok(PackageOutput {
        path: out_path,
        sha256,
        tree_hash,
    })
}

/// A reproducible uncompressed tarball of a directory tree: sorted entries,
/// zeroed mtime and ownership, real permission bits, symlinks as symlinks.
fn deterministic_tar(dir: &Utf8Path) -> Result<Vec<u8>> {
    let archive_err = |source: std::io::Error| PackageError::Archive {
        path: dir.to_owned(),
        source,
    };

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let mut entries: Vec<_> = WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in entries {
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walkdir yields paths under its root");
        let metadata = entry.metadata().map_err(|e| PackageError::Archive {
            path: dir.to_owned(),
            source: std::io::Error::other(e),
        })?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(mode_bits(&metadata));

        if metadata.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(archive_err)?;
            header.set_size(0);
            header.set_entry_type(tar::EntryType::Symlink);
            builder
                .append_link(&mut header, rel, &target)
                .map_err(archive_err)?;
        } else if metadata.is_dir() {
            header.set_size(0);
            header.set_entry_type(tar::EntryType::Directory);
            header.set_cksum();
            builder
                .append_data(&mut header, rel, std::io::empty())
                .map_err(archive_err)?;
        } else {
            let contents = std::fs::read(entry.path()).map_err(archive_err)?;
            header.set_size(contents.len() as u64);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder
                .append_data(&mut header, rel, contents.as_slice())
                .map_err(archive_err)?;
        }
    }

    builder.into_inner().map_err(archive_err)
}

#[cfg(unix)]
fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// Compression codecs for [`compress_dir`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Xz,
}

/// Compress every regular file directly under `dir` in place, appending
/// `ext` and deleting the originals. Symlinks and subdirectories are left
/// alone.
pub fn compress_dir(dir: &Utf8Path, codec: Codec, level: u32, ext: &str) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
            continue;
        };
        let metadata = std::fs::symlink_metadata(&path).map_err(io_err(&path))?;
        if !metadata.is_file() {
            continue;
        }

        let contents = std::fs::read(&path).map_err(io_err(&path))?;
        let compressed = match codec {
            Codec::Gzip => {
                let mut encoder = flate2::write::GzEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(level),
                );
                std::io::Write::write_all(&mut encoder, &contents).map_err(io_err(&path))?;
                encoder.finish().map_err(io_err(&path))?
            }
            Codec::Xz => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), level);
                std::io::Write::write_all(&mut encoder, &contents).map_err(io_err(&path))?;
                encoder.finish().map_err(io_err(&path))?
            }
        };

        let out = Utf8PathBuf::from(format!("{path}{ext}"));
        std::fs::write(&out, compressed).map_err(io_err(&out))?;
        std::fs::remove_file(&path).map_err(io_err(&path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
