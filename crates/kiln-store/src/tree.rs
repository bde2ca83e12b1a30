//! Git tree hashing.
//!
//! Computes the same identifier `git add` would assign to a directory tree:
//! blobs are hashed as `blob <len>\0<data>`, symlinks as blobs of their
//! target, and trees as sorted `<mode> <name>\0<raw-sha1>` entry lists.
//! Entry order follows git's rule that directory names sort as if suffixed
//! with `/`.

use camino::Utf8Path;
use sha1::{Digest, Sha1};

use crate::{Result, TreeHash, io_err};

const MODE_FILE: &str = "100644";
const MODE_EXECUTABLE: &str = "100755";
const MODE_SYMLINK: &str = "120000";
const MODE_TREE: &str = "40000";

/// Hash a directory tree.
pub fn tree_hash(dir: &Utf8Path) -> Result<TreeHash> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push(name);
    }

    // git compares directory names with a trailing slash appended
    let mut keyed: Vec<(Vec<u8>, String)> = entries
        .into_iter()
        .map(|name| {
            let path = dir.join(&name);
            let mut key = name.clone().into_bytes();
            if path.is_dir() && !path.is_symlink() {
                key.push(b'/');
            }
            (key, name)
        })
        .collect();
    keyed.sort();

    let mut payload = Vec::new();
    for (_, name) in keyed {
        let path = dir.join(&name);
        let meta = std::fs::symlink_metadata(&path).map_err(io_err(&path))?;

        let (mode, hash) = if meta.is_symlink() {
            let target = std::fs::read_link(&path).map_err(io_err(&path))?;
            let target = target.to_string_lossy();
            (MODE_SYMLINK, blob_hash(target.as_bytes()))
        } else if meta.is_dir() {
            (MODE_TREE, tree_hash(&path)?)
        } else {
            let data = std::fs::read(&path).map_err(io_err(&path))?;
            let mode = if is_executable(&meta) {
                MODE_EXECUTABLE
            } else {
                MODE_FILE
            };
            (mode, blob_hash(&data))
        };

        payload.extend_from_slice(mode.as_bytes());
        payload.push(b' ');
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&hash.0);
    }

    Ok(object_hash("tree", &payload))
}

/// Hash file contents as a git blob.
pub fn blob_hash(data: &[u8]) -> TreeHash {
    object_hash("blob", data)
}

fn object_hash(kind: &str, payload: &[u8]) -> TreeHash {
    let mut hasher = Sha1::new();
    hasher.update(kind.as_bytes());
    hasher.update(b" ");
    hasher.update(payload.len().to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    TreeHash(hasher.finalize().into())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}
