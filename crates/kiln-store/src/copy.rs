//! Recursive tree copies.
//!
//! Dependencies are copied (never hardlinked) out of the global store into
//! each build prefix, so a misbehaving build script can only damage its own
//! copy. Symlinks are reproduced as symlinks; permission bits are carried
//! over best-effort.

use camino::Utf8Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::{Result, StoreError, io_err};

/// Copy the tree rooted at `src` into `dst` (created if missing).
pub fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(io_err(dst))?;

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| StoreError::Io {
            path: src.to_owned(),
            source: std::io::Error::other(e),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let rel = Utf8Path::from_path(rel).ok_or_else(|| StoreError::Io {
            path: dst.to_owned(),
            source: std::io::Error::other("non-UTF8 path in artifact tree"),
        })?;
        let target = &dst.join(rel);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path()).map_err(io_err(target))?;
            symlink(&link, target)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(target).map_err(io_err(target))?;
            copy_permissions(entry.path(), target);
        } else {
            std::fs::copy(entry.path(), target).map_err(io_err(target))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(link: &std::path::Path, target: &Utf8Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target).map_err(io_err(target))
}

#[cfg(not(unix))]
fn symlink(_link: &std::path::Path, target: &Utf8Path) -> Result<()> {
    Err(StoreError::Io {
        path: target.to_owned(),
        source: std::io::Error::other("symlinks are not supported on this platform"),
    })
}

/// Permission propagation is advisory: read-only stores and foreign
/// filesystems may refuse, which does not affect correctness.
fn copy_permissions(src: &std::path::Path, dst: &Utf8Path) {
    let Ok(meta) = std::fs::metadata(src) else {
        return;
    };
    if let Err(error) = std::fs::set_permissions(dst, meta.permissions()) {
        debug!(path = %dst, %error, "could not copy permissions");
    }
}
