//! Source variants and their staging behavior.
//!
//! Each source kind owns its own `stage` implementation, dispatched by
//! matching on the variant. Archives and single files are checksummed
//! before use; extraction shells out to the host `tar`/`unzip`, which beat
//! any in-process extractor on the multi-hundred-megabyte tarballs
//! toolchain builds start from.

use std::io::Read;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::{Result, StageError, io_err, symlink};

/// One source input of a build
#[derive(Debug, Clone)]
pub enum Source {
    /// A source archive, extracted into the source directory
    Archive { path: Utf8PathBuf, sha256: String },
    /// A single file, copied verbatim
    File { path: Utf8PathBuf, sha256: String },
    /// A local directory, copied recursively
    Directory {
        path: Utf8PathBuf,
        follow_symlinks: bool,
    },
    /// A git checkout pinned to a commit
    Git { path: Utf8PathBuf, commit: String },
    /// A patch carried inline, materialized under `srcdir/patches/`
    Patch { name: String, payload: Vec<u8> },
}

impl Source {
    /// Stage this source into `srcdir`.
    pub fn stage(&self, srcdir: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(srcdir).map_err(io_err(srcdir))?;
        match self {
            Source::Archive { path, sha256 } => {
                verify_sha256(path, sha256)?;
                extract_archive(path, srcdir)
            }
            Source::File { path, sha256 } => {
                verify_sha256(path, sha256)?;
                let dest = srcdir.join(file_name(path)?);
                std::fs::copy(path, &dest).map_err(io_err(&dest))?;
                Ok(())
            }
            Source::Directory {
                path,
                follow_symlinks,
            } => {
                let dest = srcdir.join(file_name(path)?);
                copy_dir(path, &dest, *follow_symlinks)
            }
            Source::Git { path, commit } => {
                let name = file_name(path)?;
                let dest = srcdir.join(name.strip_suffix(".git").unwrap_or(name));
                run(Command::new("git").args(["clone", path.as_str(), dest.as_str()]))?;
                run(Command::new("git")
                    .args(["checkout", commit])
                    .current_dir(&dest))?;
                debug!(%dest, %commit, "checked out source");
                Ok(())
            }
            Source::Patch { name, payload } => {
                let patches = srcdir.join("patches");
                std::fs::create_dir_all(&patches).map_err(io_err(&patches))?;
                let dest = patches.join(name);
                std::fs::write(&dest, payload).map_err(io_err(&dest))?;
                Ok(())
            }
        }
    }
}

fn file_name(path: &Utf8Path) -> Result<&str> {
    path.file_name().ok_or_else(|| StageError::Io {
        path: path.to_owned(),
        source: std::io::Error::other("path has no file name"),
    })
}

/// Extract an archive with the host tools, dispatching on the extension.
fn extract_archive(path: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    let name = file_name(path)?;
    if name.ends_with(".zip") {
        return run(Command::new("unzip").args(["-q", path.as_str(), "-d", dest.as_str()]));
    }
    let tar_like = [".tar", ".tar.gz", ".tgz", ".tar.xz", ".tar.bz2"]
        .iter()
        .any(|ext| name.ends_with(ext));
    if !tar_like {
        return Err(StageError::ArchiveFormatUnknown(path.to_owned()));
    }
    run(Command::new("tar").args(["-x", "-f", path.as_str(), "-C", dest.as_str()]))
}

fn run(command: &mut Command) -> Result<()> {
    let rendered = format!("{command:?}");
    let output = command.output().map_err(|e| StageError::CommandFailed {
        command: rendered.clone(),
        reason: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(StageError::CommandFailed {
            command: rendered,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Streaming SHA-256 check of a staged input.
fn verify_sha256(path: &Utf8Path, expected: &str) -> Result<()> {
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
    let actual = format!("{:x}", hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(StageError::ChecksumMismatch {
            path: path.to_owned(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Recursive directory copy. With `follow_symlinks`, links are resolved and
/// their contents copied; without, they are reproduced as links.
fn copy_dir(src: &Utf8Path, dst: &Utf8Path, follow_symlinks: bool) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(io_err(dst))?;

    for entry in WalkDir::new(src).follow_links(follow_symlinks).min_depth(1) {
        let entry = entry.map_err(|e| StageError::Io {
            path: src.to_owned(),
            source: std::io::Error::other(e),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let rel = Utf8Path::from_path(rel).ok_or_else(|| StageError::Io {
            path: src.to_owned(),
            source: std::io::Error::other("non-UTF8 path in source directory"),
        })?;
        let target = dst.join(rel);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path()).map_err(io_err(&target))?;
            symlink(&link.to_string_lossy(), &target)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(io_err(&target))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(io_err(&target))?;
        }
    }
    Ok(())
}
