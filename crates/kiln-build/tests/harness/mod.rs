//! Test harness for kiln-build integration tests.
//!
//! Builds an isolated environment in a temp directory: a populated artifact
//! store, a shard catalog registered against it (unpacked shards, so no
//! privileges are needed), a table-driven package resolver, and a recording
//! runner standing in for the external sandbox executor.

use std::collections::HashMap;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_build::{CancelToken, Runner, SandboxCommand};
use kiln_config::Config;
use kiln_deps::{ArtifactEntry, DepError, PackageResolver, PackageSpec, ResolvedPackage};
use kiln_platform::Platform;
use kiln_shards::ShardCatalog;
use kiln_store::{ArtifactStore, Fetcher, StoreError, TreeHash};
use semver::Version;

pub struct TestEnv {
    pub _guard: tempfile::TempDir,
    pub root: Utf8PathBuf,
    pub config: Config,
    pub store: ArtifactStore,
    pub catalog: ShardCatalog,
    pub resolver: TableResolver,
}

impl TestEnv {
    /// An environment whose catalog covers the given shard names, each
    /// installed in the store as a small unpacked artifact.
    pub fn with_shards(shard_names: &[&str]) -> TestEnv {
        let guard = tempfile::tempdir().expect("failed to create temp dir");
        let root = Utf8PathBuf::from(guard.path().to_str().unwrap());
        let store = ArtifactStore::new(root.join("store"));

        let mut toml = String::new();
        for name in shard_names {
            let staging = root.join("staging").join(name);
            std::fs::create_dir_all(staging.join("bin")).unwrap();
            std::fs::write(staging.join("bin/marker"), name).unwrap();
            let hash = store.install_tree(&staging).unwrap();
            toml.push_str(&format!(
                "[shards.\"{name}\"]\ngit-tree-sha1 = \"{hash}\"\n"
            ));
        }

        TestEnv {
            config: Config::with_storage_root(root.join("storage")),
            catalog: ShardCatalog::from_toml(&toml).unwrap(),
            store,
            resolver: TableResolver::default(),
            root,
            _guard: guard,
        }
    }

    /// Install an artifact tree into the store and register a package for it.
    pub fn add_package(&mut self, name: &str, files: &[(&str, &str)]) -> TreeHash {
        let staging = self.root.join("pkg-staging").join(name);
        for (rel, contents) in files {
            let path = staging.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        let hash = self.store.install_tree(&staging).unwrap();
        self.resolver.packages.insert(
            name.to_string(),
            ResolvedPackage {
                name: name.to_string(),
                version: Version::new(1, 0, 0),
                tree_hash: Some(hash),
                dependencies: vec![],
                artifacts: vec![ArtifactEntry {
                    name: name.to_string(),
                    platform: Platform::Any,
                    tree_hash: hash,
                }],
            },
        );
        hash
    }

    pub fn builds_dir(&self) -> Utf8PathBuf {
        self.config.storage_root.join("builds")
    }

    /// Workspaces left behind (failed builds keep theirs for inspection)
    pub fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.builds_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Resolver backed by an in-memory table.
#[derive(Default)]
pub struct TableResolver {
    pub packages: HashMap<String, ResolvedPackage>,
}

impl PackageResolver for TableResolver {
    fn resolve(&self, spec: &PackageSpec) -> Result<ResolvedPackage, DepError> {
        self.packages
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| DepError::ResolutionFailed {
                package: spec.name.clone(),
                reason: "not in registry".to_string(),
            })
    }

    fn stdlib_version(&self, _name: &str, _julia_version: Option<&Version>) -> Option<Version> {
        None
    }

    fn stdlib_tree_hash(&self, _name: &str, _version: &Version) -> Option<TreeHash> {
        None
    }
}

/// A fetcher for tests where everything is pre-installed.
pub struct NoFetcher;

impl Fetcher for NoFetcher {
    fn fetch(&self, hash: &TreeHash, _dest: &Utf8Path) -> Result<(), StoreError> {
        Err(StoreError::NotFetchable(*hash))
    }
}

/// A runner that records what it was asked to do and simulates the build by
/// writing install outputs through the workspace's `destdir` symlink.
pub struct RecordingRunner {
    pub exit_code: i32,
    pub install: Vec<(String, String)>,
    pub commands: Mutex<Vec<SandboxCommand>>,
}

impl RecordingRunner {
    pub fn succeeding(install: &[(&str, &str)]) -> RecordingRunner {
        RecordingRunner {
            exit_code: 0,
            install: install
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(exit_code: i32) -> RecordingRunner {
        RecordingRunner {
            exit_code,
            install: Vec::new(),
            commands: Mutex::new(Vec::new()),
        }
    }

    fn workspace(command: &SandboxCommand) -> Option<Utf8PathBuf> {
        command
            .env
            .iter()
            .find(|(key, _)| key == "WORKSPACE")
            .map(|(_, value)| Utf8PathBuf::from(value))
    }
}

impl Runner for RecordingRunner {
    fn run(&self, command: &SandboxCommand, _cancel: &CancelToken) -> std::io::Result<i32> {
        if let Some(workspace) = Self::workspace(command) {
            let destdir = workspace.join("destdir");
            for (rel, contents) in &self.install {
                let path = destdir.join(rel);
                std::fs::create_dir_all(path.parent().unwrap())?;
                std::fs::write(path, contents)?;
            }
        }
        self.commands.lock().unwrap().push(command.clone());
        Ok(self.exit_code)
    }
}
