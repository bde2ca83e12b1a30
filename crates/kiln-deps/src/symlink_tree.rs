//! Symlink-tree installation of per-build artifact copies into destdir.
//!
//! The directory structure is mirrored with real directories, regular files
//! become relative symlinks to the artifact copy, and symlinks in the
//! artifact are reproduced verbatim. Two artifacts may collide on a path:
//! identical content is skipped silently, diverging content is a warning
//! naming the artifact already occupying the path. Everything applied is
//! appended to the caller's [`InstallRecord`] so removal is a replay, not a
//! re-scan.

use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{DepError, InstallRecord, Result, io_err};

/// Symlink-tree one artifact copy into `destdir`.
pub fn install(
    artifact: &Utf8Path,
    destdir: &Utf8Path,
    prefix_root: &Utf8Path,
    record: &mut InstallRecord,
) -> Result<()> {
    for entry in WalkDir::new(artifact).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| DepError::Io {
            path: artifact.to_owned(),
            source: std::io::Error::other(e),
        })?;
        let rel = entry
            .path()
            .strip_prefix(artifact)
            .expect("walkdir yields paths under its root");
        let rel = Utf8Path::from_path(rel).ok_or_else(|| DepError::Io {
            path: artifact.to_owned(),
            source: std::io::Error::other("non-UTF8 path in artifact"),
        })?;
        let source = artifact.join(rel);
        let dest = destdir.join(rel);
        let recorded = dest
            .strip_prefix(prefix_root)
            .unwrap_or(&dest)
            .to_string();

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            // A symlink in the artifact (directory or file) is reproduced
            // as the same symlink.
            let target = std::fs::read_link(&source).map_err(io_err(&source))?;
            let target = target.to_string_lossy();
            if link_up_to_date(&dest, &target) {
                record.links.push(recorded);
                continue;
            }
            if dest.exists() || dest.is_symlink() {
                warn_conflict(&dest, &source);
                continue;
            }
            symlink(&target, &dest)?;
            record.links.push(recorded);
        } else if file_type.is_dir() {
            if !dest.is_dir() {
                std::fs::create_dir_all(&dest).map_err(io_err(&dest))?;
                record.dirs.push(recorded);
            }
        } else {
            let parent = dest.parent().unwrap_or(destdir);
            let target = relative_path(parent, &source);
            if link_up_to_date(&dest, target.as_str()) {
                record.links.push(recorded);
                continue;
            }
            if dest.exists() || dest.is_symlink() {
                if same_contents(&source, &dest)? {
                    debug!(path = %dest, "identical file already present, skipping");
                } else {
                    warn_conflict(&dest, &source);
                }
                continue;
            }
            symlink(target.as_str(), &dest)?;
            record.links.push(recorded);
        }
    }
    Ok(())
}

/// Replay an install record in reverse: drop the created symlinks, then the
/// created directories where they emptied out. Real directories stay.
pub fn remove(record: &InstallRecord, prefix_root: &Utf8Path) -> Result<()> {
    for link in &record.links {
        let path = prefix_root.join(link);
        if path.is_symlink() {
            std::fs::remove_file(&path).map_err(io_err(&path))?;
        }
    }
    for dir in record.dirs.iter().rev() {
        let path = prefix_root.join(dir);
        // only empty directories go; anything the build populated stays
        let _ = std::fs::remove_dir(&path);
    }
    Ok(())
}

/// True when `dest` is already a symlink with exactly this target.
fn link_up_to_date(dest: &Utf8Path, target: &str) -> bool {
    dest.is_symlink()
        && std::fs::read_link(dest)
            .map(|t| t.to_string_lossy() == target)
            .unwrap_or(false)
}

/// Size-then-hash equality of two files (following symlinks).
fn same_contents(a: &Utf8Path, b: &Utf8Path) -> Result<bool> {
    let meta_a = std::fs::metadata(a).map_err(io_err(a))?;
    let Ok(meta_b) = std::fs::metadata(b) else {
        // dangling symlink at the destination: not identical
        return Ok(false);
    };
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    Ok(sha256_file(a)? == sha256_file(b)?)
}

fn sha256_file(path: &Utf8Path) -> Result<[u8; 32]> {
    let file = std::fs::File::open(path).map_err(io_err(path))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer).map_err(io_err(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Name the artifact whose file already occupies a destination path, by
/// climbing the resolved path to the `artifacts/<hash>` ancestor.
fn warn_conflict(dest: &Utf8Path, source: &Utf8Path) {
    let occupant = owning_artifact(dest).unwrap_or_else(|| "an unmanaged file".to_string());
    warn!(
        path = %dest,
        %occupant,
        wanted = %source,
        "destination already occupied, leaving it in place"
    );
}

fn owning_artifact(path: &Utf8Path) -> Option<String> {
    let resolved = path.canonicalize().ok()?;
    let mut current = resolved.as_path();
    while let Some(parent) = current.parent() {
        if parent.file_name().is_some_and(|n| n == "artifacts") {
            return current.file_name().map(|n| n.to_string_lossy().into_owned());
        }
        current = parent;
    }
    None
}

/// The relative path from `from_dir` to `to` (both absolute).
fn relative_path(from_dir: &Utf8Path, to: &Utf8Path) -> Utf8PathBuf {
    let from: Vec<_> = from_dir.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = Utf8PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for component in &to[common..] {
        out.push(component.as_str());
    }
    out
}

#[cfg(unix)]
fn symlink(target: &str, link: &Utf8Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(io_err(link))
}

#[cfg(not(unix))]
fn symlink(_target: &str, link: &Utf8Path) -> Result<()> {
    Err(DepError::Io {
        path: link.to_owned(),
        source: std::io::Error::other("symlinks are not supported on this platform"),
    })
}
