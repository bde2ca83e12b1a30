//! The build orchestrator: one call that takes a platform, sources and
//! dependencies through shard selection, sandbox assembly, the external
//! runner, and packaging.
//!
//! The orchestrator itself is single-threaded per build; concurrency comes
//! from running multiple builds in separate processes, each owning a
//! nonce-suffixed workspace. Everything acquired during a build (mounts,
//! symlink installs, the workspace) is released on every exit path through
//! drop guards.

pub mod process;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_buildenv::{BuildEnv, BuildEnvError};
use kiln_config::Config;
use kiln_deps::{DepError, DepInstaller, PackageResolver, PackageSpec};
use kiln_mount::{MountError, Mounter};
use kiln_package::{PackageError, PackageOutput};
use kiln_platform::Platform;
use kiln_shards::select::{
    Compiler, ShardPreferences, available_gcc_builds, select_gcc_version, select_shards,
};
use kiln_shards::{ArchiveKind, CompilerShard, ShardCatalog, ShardError};
use kiln_stage::source::Source;
use kiln_stage::{Prefix, StageError, nonced_workspace};
use kiln_store::{ArtifactStore, Fetcher, StoreError};
use semver::Version;
use thiserror::Error;
use tracing::{info, warn};

pub use process::CancelToken;

/// Errors from build orchestration
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build was cancelled")]
    Cancelled,

    #[error("build script exited with status {code}")]
    ScriptFailed { code: i32 },

    #[error("runner failed: {0}")]
    Runner(std::io::Error),

    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Dep(#[from] DepError),

    #[error(transparent)]
    BuildEnv(#[from] BuildEnvError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for orchestration.
pub type Result<T> = std::result::Result<T, BuildError>;

/// A command for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// `(source on host, path in sandbox)` pairs, already ordered for
    /// back-to-front layering
    pub mounts: Vec<(Utf8PathBuf, Utf8PathBuf)>,
}

/// The sandbox executor contract. The concrete runner (user namespaces,
/// privileged, Docker) lives outside this system; it must honor the cancel
/// token by terminating the active child (SIGTERM, then SIGKILL).
pub trait Runner {
    fn run(&self, command: &SandboxCommand, cancel: &CancelToken) -> std::io::Result<i32>;
}

/// Everything one build needs.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// The platform to build for (`Any` builds for the musl host)
    pub platform: Platform,
    /// Source inputs, staged into `srcdir` in order
    pub sources: Vec<Source>,
    /// Binary artifact dependencies
    pub deps: Vec<PackageSpec>,
    /// The build command to run inside the sandbox
    pub script: Vec<String>,
    /// Compilers the build needs toolchains for
    pub compilers: Vec<Compiler>,
    /// Shard selection preferences
    pub prefs: ShardPreferences,
    /// Bind clang to lld instead of binutils ld
    pub clang_use_lld: bool,
    /// Output tarball base path (`<out_base>.v<version>.<triplet>.tar.gz`)
    pub out_base: Utf8PathBuf,
    /// Version stamped into the output name
    pub version: Version,
    /// Overwrite an existing output tarball
    pub force: bool,
}

/// Drives builds end to end.
pub struct Orchestrator<'a> {
    config: &'a Config,
    catalog: &'a ShardCatalog,
    store: &'a ArtifactStore,
    resolver: &'a dyn PackageResolver,
    fetcher: &'a dyn Fetcher,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a Config,
        catalog: &'a ShardCatalog,
        store: &'a ArtifactStore,
        resolver: &'a dyn PackageResolver,
        fetcher: &'a dyn Fetcher,
    ) -> Self {
        Orchestrator {
            config,
            catalog,
            store,
            resolver,
            fetcher,
        }
    }

    /// Run one build. On success the workspace is removed; on failure it is
    /// kept for inspection. Mounts and dependency symlinks are released on
    /// every exit path.
    pub fn build(
        &self,
        request: &BuildRequest,
        runner: &dyn Runner,
        cancel: &CancelToken,
    ) -> Result<PackageOutput> {
        let target = request.platform.concrete();
        let host = kiln_shards::select::build_host();

        let shards = select_shards(self.catalog, &target, &request.compilers, &request.prefs)?;

        let workspace = nonced_workspace(&self.config.storage_root.join("builds"))?;
        info!(workspace = %workspace, target = %target, "starting build");

        let result = self.run_stages(request, runner, cancel, &target, &host, &shards, &workspace);

        match &result {
            Ok(_) => {
                if let Err(error) = std::fs::remove_dir_all(&workspace) {
                    warn!(workspace = %workspace, %error, "could not remove workspace");
                }
            }
            Err(error) => {
                warn!(workspace = %workspace, %error, "build failed, keeping workspace");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stages(
        &self,
        request: &BuildRequest,
        runner: &dyn Runner,
        cancel: &CancelToken,
        target: &Platform,
        host: &Platform,
        shards: &[CompilerShard],
        workspace: &Utf8Path,
    ) -> Result<PackageOutput> {
        let mounter = Mounter::new(self.config, self.catalog, self.store);

        check_cancelled(cancel)?;
        // The guard goes up first so a failure partway through mounting
        // still unwinds the shards that did mount.
        let _mount_guard = MountGuard {
            mounter: &mounter,
            shards,
            build_root: workspace.to_owned(),
        };
        for shard in shards {
            mounter.mount(shard, workspace)?;
        }

        check_cancelled(cancel)?;
        let prefix = Prefix::create(workspace, target, host)?;
        for source in &request.sources {
            source.stage(&prefix.srcdir())?;
        }

        check_cancelled(cancel)?;
        let installer = DepInstaller::new(
            &prefix,
            target,
            self.store,
            self.resolver,
            self.fetcher,
        );
        installer.install(&request.deps)?;
        let deps_guard = DepsGuard {
            installer: &installer,
        };

        check_cancelled(cancel)?;
        let gcc_version = self.selected_gcc_version(request, target)?;
        let mut buildenv = BuildEnv::new(target, host, gcc_version);
        buildenv.clang_use_lld = request.clang_use_lld;
        buildenv.use_ccache = self.config.use_ccache;
        buildenv.emit(&prefix.metadir())?;

        check_cancelled(cancel)?;
        let command = SandboxCommand {
            argv: request.script.clone(),
            env: sandbox_env(&prefix, target, host),
            mounts: mounter.shard_mappings(shards, workspace)?,
        };
        let code = runner.run(&command, cancel).map_err(BuildError::Runner)?;
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        if code != 0 {
            return Err(BuildError::ScriptFailed { code });
        }

        // Package first, then release the dependency symlinks and mounts.
        let output = kiln_package::package(
            self.store,
            &prefix.target_destdir(),
            &request.out_base,
            &request.version,
            &request.platform.concrete(),
            request.force,
        )?;

        drop(deps_guard);
        Ok(output)
    }

    /// The GCC version the emitted toolchain files should reference.
    ///
    /// Always the catalog- and ABI-filtered choice: with a C toolchain this
    /// mirrors what shard selection mounted; without one (and without an
    /// explicit preference) the preference is steered to the newest table
    /// entry so the newest registered survivor wins.
    fn selected_gcc_version(&self, request: &BuildRequest, target: &Platform) -> Result<Version> {
        let archive = request.prefs.archive.unwrap_or(ArchiveKind::Squashfs);
        let preferred = request.prefs.gcc.clone().or_else(|| {
            if request.compilers.contains(&Compiler::C) {
                None
            } else {
                available_gcc_builds().last().map(|b| b.version.clone())
            }
        });
        let build = select_gcc_version(self.catalog, target, preferred.as_ref(), archive)?;
        Ok(build.version.clone())
    }
}

fn check_cancelled(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(BuildError::Cancelled)
    } else {
        Ok(())
    }
}

/// The environment handed to the sandboxed build script.
fn sandbox_env(prefix: &Prefix, target: &Platform, host: &Platform) -> Vec<(String, String)> {
    let target_triplet = target.triplet();
    vec![
        (
            "PATH".to_string(),
            format!("/opt/bin/{target_triplet}:/usr/bin:/bin"),
        ),
        ("prefix".to_string(), "/workspace/destdir".to_string()),
        ("SRC_DIR".to_string(), "/workspace/srcdir".to_string()),
        ("target".to_string(), target_triplet),
        ("MACHTYPE".to_string(), host.triplet()),
        ("WORKSPACE".to_string(), prefix.root().to_string()),
    ]
}

/// Releases dependency symlinks when the build unwinds.
struct DepsGuard<'a> {
    installer: &'a DepInstaller<'a>,
}

impl Drop for DepsGuard<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.installer.cleanup() {
            warn!(%error, "dependency cleanup failed during teardown");
        }
    }
}

/// Releases shard mounts when the build unwinds.
struct MountGuard<'a> {
    mounter: &'a Mounter<'a>,
    shards: &'a [CompilerShard],
    build_root: Utf8PathBuf,
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        self.mounter.unmount_all(self.shards, &self.build_root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_round_trip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(check_cancelled(&token).is_err());
    }

    #[test]
    fn sandbox_env_names_the_target() {
        let prefix_dir = tempfile::tempdir().unwrap();
        let target = Platform::parse("aarch64-linux-gnu").unwrap();
        let host = Platform::parse("x86_64-linux-musl").unwrap();
        let prefix = Prefix::create(
            Utf8Path::new(prefix_dir.path().to_str().unwrap()),
            &target,
            &host,
        )
        .unwrap();

        let env = sandbox_env(&prefix, &target, &host);
        let lookup = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(lookup("target"), "aarch64-linux-gnu");
        assert_eq!(lookup("MACHTYPE"), "x86_64-linux-musl");
        assert!(lookup("PATH").starts_with("/opt/bin/aarch64-linux-gnu:"));
        assert_eq!(lookup("prefix"), "/workspace/destdir");
    }
}
