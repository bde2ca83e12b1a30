//! Shard materialization: composing a build's root filesystem.
//!
//! Squashfs shards are loop-mounted under the build root's `.mounts/`
//! directory; unpacked shards bind straight from the artifact store. The
//! sandbox driver receives an ordered list of `(source, sandbox path)`
//! mappings and layers them back-to-front over the root filesystem shard.

use std::process::Command;
use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_config::{Config, Runner};
use kiln_platform::Os;
use kiln_shards::{ArchiveKind, CompilerShard, ShardCatalog, ShardError, ShardName};
use kiln_store::ArtifactStore;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from mount operations
#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to mount {shard}: {reason}")]
    MountFailed { shard: String, reason: String },

    #[error("failed to unmount {path}: {reason}")]
    UnmountFailed { path: Utf8PathBuf, reason: String },

    #[error(
        "the Xcode EULA has not been accepted; set AUTOMATIC_APPLE=true or record acceptance"
    )]
    SdkNotAccepted,

    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error("io error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// Result type for mount operations.
pub type Result<T> = std::result::Result<T, MountError>;

fn io_err(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> MountError {
    let path = path.into();
    move |source| MountError::Io { path, source }
}

/// The in-sandbox path a shard appears at.
///
/// The root filesystem *is* the sandbox root. Rust cross toolchains are
/// co-located under their host prefix with a target suffix so rustc's
/// sysroot probing finds them; every other shard lives under the prefix of
/// the platform it serves.
pub fn map_target(shard: &CompilerShard) -> Utf8PathBuf {
    match shard.name {
        ShardName::Rootfs => Utf8PathBuf::from("/"),
        ShardName::RustToolchain => {
            let target = shard.target.as_ref().unwrap_or(&shard.host);
            Utf8PathBuf::from("/opt")
                .join(shard.host.aatriplet())
                .join(format!(
                    "{}-{}-{}",
                    shard.name,
                    shard.version,
                    target.aatriplet()
                ))
        }
        _ => Utf8PathBuf::from("/opt")
            .join(shard.target_or_host().aatriplet())
            .join(format!("{}-{}", shard.name, shard.version)),
    }
}

/// Materializes shards for one build and tears them down again.
pub struct Mounter<'a> {
    config: &'a Config,
    catalog: &'a ShardCatalog,
    store: &'a ArtifactStore,
}

impl<'a> Mounter<'a> {
    pub fn new(config: &'a Config, catalog: &'a ShardCatalog, store: &'a ArtifactStore) -> Self {
        Mounter {
            config,
            catalog,
            store,
        }
    }

    /// Where a shard is (or would be) materialized for this build root:
    /// squashfs images get a mountpoint under `.mounts/`, unpacked shards
    /// resolve to their artifact store directory.
    pub fn mount_path(&self, shard: &CompilerShard, build_root: &Utf8Path) -> Result<Utf8PathBuf> {
        match shard.archive {
            ArchiveKind::Squashfs => Ok(build_root.join(".mounts").join(shard.artifact_name())),
            ArchiveKind::Unpacked => Ok(self.catalog.path(shard, self.store)?),
        }
    }

    /// Materialize a shard, returning the path its contents are visible at.
    /// Idempotent: an already-mounted shard is left alone.
    pub fn mount(&self, shard: &CompilerShard, build_root: &Utf8Path) -> Result<Utf8PathBuf> {
        if shard.target_or_host().os() == Some(Os::MacOs) && !self.config.apple_eula_accepted() {
            return Err(MountError::SdkNotAccepted);
        }

        let dest = self.mount_path(shard, build_root)?;
        if !self.loop_mounts_enabled() || shard.archive == ArchiveKind::Unpacked {
            // Nothing to do: the sandbox driver binds the source directly.
            return Ok(dest);
        }

        if is_mounted(&dest) {
            debug!(mountpoint = %dest, "shard already mounted");
            return Ok(dest);
        }

        let image = self.image_path(shard)?;
        std::fs::create_dir_all(&dest).map_err(io_err(&dest))?;

        let output = escalated(&["mount", "-t", "squashfs", "-o", "ro,loop", image.as_str(), dest.as_str()])
            .output()
            .map_err(|e| MountError::MountFailed {
                shard: shard.artifact_name(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(MountError::MountFailed {
                shard: shard.artifact_name(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(shard = %shard, mountpoint = %dest, "mounted squashfs");
        Ok(dest)
    }

    /// Release a shard's mount. Idempotent. Failures are warned and
    /// swallowed unless `fail_on_error` is set, so a teardown sweep can
    /// always finish.
    pub fn unmount(
        &self,
        shard: &CompilerShard,
        build_root: &Utf8Path,
        fail_on_error: bool,
    ) -> Result<()> {
        if !self.loop_mounts_enabled() || shard.archive == ArchiveKind::Unpacked {
            return Ok(());
        }

        let dest = self.mount_path(shard, build_root)?;
        if is_mounted(&dest) {
            let output = escalated(&["umount", dest.as_str()])
                .output()
                .map(|o| {
                    if o.status.success() {
                        Ok(())
                    } else {
                        Err(String::from_utf8_lossy(&o.stderr).trim().to_string())
                    }
                })
                .unwrap_or_else(|e| Err(e.to_string()));

            if let Err(reason) = output {
                if fail_on_error {
                    return Err(MountError::UnmountFailed { path: dest, reason });
                }
                warn!(mountpoint = %dest, %reason, "unmount failed, continuing teardown");
                return Ok(());
            }
        }

        let _ = std::fs::remove_dir(&dest);
        // Drop the .mounts directory once the last mountpoint is gone
        let mounts_dir = build_root.join(".mounts");
        let _ = std::fs::remove_dir(&mounts_dir);
        Ok(())
    }

    /// Tear down every shard mount for a build, best-effort.
    pub fn unmount_all(&self, shards: &[CompilerShard], build_root: &Utf8Path) {
        for shard in shards {
            if let Err(error) = self.unmount(shard, build_root, false) {
                warn!(shard = %shard, %error, "teardown skipped a shard");
            }
        }
    }

    /// Ordered `(source, sandbox path)` pairs for the sandbox driver.
    ///
    /// The root filesystem shard is omitted (it is the sandbox root itself);
    /// the order is reversed from the input because the driver layers
    /// mappings back-to-front.
    pub fn shard_mappings(
        &self,
        shards: &[CompilerShard],
        build_root: &Utf8Path,
    ) -> Result<Vec<(Utf8PathBuf, Utf8PathBuf)>> {
        let mut mappings = Vec::new();
        for shard in shards {
            if shard.name == ShardName::Rootfs {
                continue;
            }
            mappings.push((self.mount_path(shard, build_root)?, map_target(shard)));
        }
        mappings.reverse();
        Ok(mappings)
    }

    /// Loop mounts only make sense on a Linux host, under the runners that
    /// consume host mountpoints.
    fn loop_mounts_enabled(&self) -> bool {
        cfg!(target_os = "linux")
            && self.config.use_squashfs
            && matches!(self.config.runner, Runner::UserNamespaces | Runner::Docker)
    }

    /// The squashfs image inside a shard's store artifact. When the caller
    /// is not root a per-UID copy is kept under the storage root so the
    /// image's ownership satisfies the kernel's loop-mount checks.
    fn image_path(&self, shard: &CompilerShard) -> Result<Utf8PathBuf> {
        let artifact = self.catalog.path(shard, self.store)?;
        let image = artifact.join(shard.artifact_name());
        self.reject_ecryptfs(&image)?;

        let uid = current_uid();
        if uid == 0 {
            return Ok(image);
        }

        let copy_dir = self.config.mounts_dir().join(format!("uid-{uid}"));
        let copy = copy_dir.join(shard.artifact_name());
        if !copy.exists() {
            std::fs::create_dir_all(&copy_dir).map_err(io_err(&copy_dir))?;
            std::fs::copy(&image, &copy).map_err(io_err(&copy))?;
            debug!(shard = %shard, %copy, "created per-uid squashfs copy");
        }
        Ok(copy)
    }

    /// The kernel refuses loop mounts of images living on ecryptfs unless
    /// the operator opted in.
    fn reject_ecryptfs(&self, image: &Utf8Path) -> Result<()> {
        if self.config.allow_ecryptfs || !on_ecryptfs(image) {
            Ok(())
        } else {
            Err(MountError::MountFailed {
                shard: image.to_string(),
                reason: "storage is on an encrypted filesystem (set ALLOW_ECRYPTFS=true)"
                    .to_string(),
            })
        }
    }
}

/// Wrap a command in the cached privilege-escalation prefix.
fn escalated(args: &[&str]) -> Command {
    let prefix = escalation_prefix();
    if prefix.is_empty() {
        let mut cmd = Command::new(args[0]);
        cmd.args(&args[1..]);
        cmd
    } else if prefix[0] == "sudo" {
        let mut cmd = Command::new("sudo");
        cmd.args(args);
        cmd
    } else {
        // `su root -c` takes the command as a single shell word
        let mut cmd = Command::new("su");
        cmd.arg("root").arg("-c").arg(args.join(" "));
        cmd
    }
}

/// Resolve how this process gains mount privileges, once.
fn escalation_prefix() -> &'static [String] {
    static PREFIX: OnceLock<Vec<String>> = OnceLock::new();
    PREFIX.get_or_init(|| {
        if current_uid() == 0 {
            return Vec::new();
        }
        let sudo_works = Command::new("sudo")
            .arg("-V")
            .output()
            .is_ok_and(|o| o.status.success());
        if sudo_works {
            vec!["sudo".to_string()]
        } else {
            vec!["su".to_string()]
        }
    })
}

#[cfg(unix)]
fn current_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .map(|m| m.uid())
        .unwrap_or(u32::MAX)
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    u32::MAX
}

/// Check `/proc/mounts` for an active mount at `path`.
fn is_mounted(path: &Utf8Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mountpoint| mountpoint == path.as_str())
}

/// Whether `path` lives under an ecryptfs mount.
fn on_ecryptfs(path: &Utf8Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let mountpoint = fields.nth(1);
        let fstype = fields.next();
        matches!((mountpoint, fstype), (Some(mp), Some("ecryptfs")) if path.as_str().starts_with(mp))
    })
}
