//! Binary-artifact dependency installation.
//!
//! Dependencies arrive as package specs following the `_jll` naming
//! convention; a registry-backed resolver (external to this crate) maps them
//! to versions, transitive dependencies and per-platform artifact tree
//! hashes. Installation copies each artifact out of the global store into
//! the build prefix, then symlink-trees the copies into the install staging
//! area. The applied symlink diff is recorded under `metadir` so cleanup
//! can reverse it without re-scanning.

pub mod symlink_tree;

use camino::Utf8PathBuf;
use facet::Facet;
use kiln_platform::{Arch, Libc, Platform};
use kiln_stage::Prefix;
use kiln_store::{ArtifactStore, Fetcher, StoreError, TreeHash};
use semver::Version;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from dependency resolution and installation
#[derive(Debug, Error)]
pub enum DepError {
    #[error("failed to resolve {package}: {reason}")]
    ResolutionFailed { package: String, reason: String },

    #[error("failed to resolve stdlib {package} to a tree hash")]
    StdlibResolutionFailed { package: String },

    #[error("install record at {path} is corrupt: {reason}")]
    BadRecord { path: Utf8PathBuf, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// Result type for dependency operations.
pub type Result<T> = std::result::Result<T, DepError>;

pub(crate) fn io_err(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> DepError {
    let path = path.into();
    move |source| DepError::Io { path, source }
}

/// A requested dependency.
///
/// A spec may pin a version, a tree hash, or both; when both are present
/// the tree hash wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    pub version: Option<Version>,
    pub tree_hash: Option<TreeHash>,
}

impl PackageSpec {
    pub fn by_name(name: impl Into<String>) -> PackageSpec {
        PackageSpec {
            name: name.into(),
            version: None,
            tree_hash: None,
        }
    }

    pub fn versioned(name: impl Into<String>, version: Version) -> PackageSpec {
        PackageSpec {
            name: name.into(),
            version: Some(version),
            tree_hash: None,
        }
    }

    pub fn pinned(name: impl Into<String>, tree_hash: TreeHash) -> PackageSpec {
        PackageSpec {
            name: name.into(),
            version: None,
            tree_hash: Some(tree_hash),
        }
    }

    /// Tree hash wins over version when both are given.
    fn collapsed(mut self) -> PackageSpec {
        if self.tree_hash.is_some() {
            self.version = None;
        }
        self
    }

    /// Whether this package follows the artifact-package naming convention
    pub fn is_artifact_package(&self) -> bool {
        self.name.ends_with("_jll")
    }
}

/// One artifact a package provides, keyed by a platform selector.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub name: String,
    pub platform: Platform,
    pub tree_hash: TreeHash,
}

/// A package as the resolver sees it.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: Version,
    /// `None` when the package came in as a stdlib (no registry tree hash)
    pub tree_hash: Option<TreeHash>,
    /// Names of direct dependencies
    pub dependencies: Vec<String>,
    /// Artifacts declared by the package, with platform selectors
    pub artifacts: Vec<ArtifactEntry>,
}

/// The seam to the registry client, which is outside this system.
pub trait PackageResolver {
    /// Resolve one spec to a concrete package.
    fn resolve(&self, spec: &PackageSpec) -> Result<ResolvedPackage>;

    /// The stdlib version of `name` shipped with a given julia version.
    fn stdlib_version(&self, name: &str, julia_version: Option<&Version>) -> Option<Version>;

    /// Resolve a stdlib package version directly to its tree hash,
    /// bypassing the registry resolver (which would collapse distinct
    /// `+buildN` suffixes).
    fn stdlib_tree_hash(&self, name: &str, version: &Version) -> Option<TreeHash>;
}

/// What an installation did, as recorded under `metadir`.
#[derive(Facet, Debug, Clone, Default)]
pub struct InstallRecord {
    /// When the install ran
    pub installed_at: String,
    /// Artifact hashes copied into the prefix
    pub artifacts: Vec<String>,
    /// Symlinks created in destdir, prefix-relative
    pub links: Vec<String>,
    /// Directories created in destdir, prefix-relative, in creation order
    pub dirs: Vec<String>,
}

/// Installs a dependency set into a build prefix.
pub struct DepInstaller<'a> {
    prefix: &'a Prefix,
    platform: Platform,
    store: &'a ArtifactStore,
    resolver: &'a dyn PackageResolver,
    fetcher: &'a dyn Fetcher,
}

impl<'a> DepInstaller<'a> {
    pub fn new(
        prefix: &'a Prefix,
        platform: &Platform,
        store: &'a ArtifactStore,
        resolver: &'a dyn PackageResolver,
        fetcher: &'a dyn Fetcher,
    ) -> Self {
        DepInstaller {
            prefix,
            platform: platform.concrete(),
            store,
            resolver,
            fetcher,
        }
    }

    /// Resolve the dependency closure and install it into the prefix.
    pub fn install(&self, specs: &[PackageSpec]) -> Result<Vec<ResolvedPackage>> {
        let packages = self.resolve_closure(specs)?;

        // Stdlib entries force artifact selection to ignore the julia
        // version pin, since their hashes were resolved out-of-band.
        let had_stdlibs = packages.iter().any(|p| p.tree_hash.is_none());
        let selector = if had_stdlibs {
            without_julia_version(&self.platform)
        } else {
            self.platform.clone()
        };

        self.write_project_env(&packages)?;

        // Merge into any existing record: a re-install must not forget the
        // directories the first install created.
        let mut record = self.load_record()?.unwrap_or_default();
        record.installed_at = jiff::Timestamp::now().to_string();

        // Persist the record even when installation fails partway, so
        // cleanup can reverse whatever was applied.
        let result = self.install_artifacts(&packages, &selector, &mut record);
        self.write_record(&record)?;
        result?;

        info!(
            packages = packages.len(),
            links = record.links.len(),
            "installed dependency artifacts"
        );
        Ok(packages)
    }

    fn install_artifacts(
        &self,
        packages: &[ResolvedPackage],
        selector: &Platform,
        record: &mut InstallRecord,
    ) -> Result<()> {
        let triplet = self.prefix.target_triplet().to_string();
        let destdir = self.prefix.target_destdir();
        for package in packages {
            for artifact in self.artifacts_for(package, selector) {
                // Global store first, then the per-build copy
                let source = self
                    .store
                    .ensure_installed(&artifact.tree_hash, self.fetcher)?;
                let copy = self
                    .prefix
                    .artifacts_dir(&triplet)
                    .join(artifact.tree_hash.to_hex());
                if !copy.is_dir() {
                    kiln_store::copy::copy_tree(&source, &copy)?;
                }
                record.artifacts.push(artifact.tree_hash.to_hex());

                symlink_tree::install(&copy, &destdir, self.prefix.root(), record)?;
            }
        }
        Ok(())
    }

    /// Reverse the symlink install recorded in `metadir`. Idempotent; real
    /// directories (and anything the build itself installed) are left for
    /// the audit step.
    pub fn cleanup(&self) -> Result<()> {
        let Some(record) = self.load_record()? else {
            debug!(record = %self.record_path(), "no install record, nothing to clean up");
            return Ok(());
        };

        symlink_tree::remove(&record, self.prefix.root())?;
        let path = self.record_path();
        std::fs::remove_file(&path).map_err(io_err(&path))?;
        Ok(())
    }

    /// Resolve specs to the full dependency closure: any dependency that is
    /// itself an artifact package joins the set, to fixpoint.
    fn resolve_closure(&self, specs: &[PackageSpec]) -> Result<Vec<ResolvedPackage>> {
        let mut worklist: Vec<PackageSpec> =
            specs.iter().cloned().map(PackageSpec::collapsed).collect();
        let mut seen: Vec<String> = worklist.iter().map(|s| s.name.clone()).collect();
        let mut packages = Vec::new();

        while let Some(spec) = worklist.pop() {
            let mut package = self.resolver.resolve(&spec)?;

            if package.tree_hash.is_none() {
                self.resolve_stdlib(&mut package)?;
            }

            for dep in &package.dependencies {
                if dep.ends_with("_jll") && !seen.contains(dep) {
                    seen.push(dep.clone());
                    worklist.push(PackageSpec::by_name(dep.clone()));
                }
            }
            packages.push(package);
        }

        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packages)
    }

    /// A stdlib dependency carries no registry tree hash; pin its version
    /// through the target's julia version and resolve the hash directly.
    fn resolve_stdlib(&self, package: &mut ResolvedPackage) -> Result<()> {
        let julia_version = self
            .platform
            .tag("julia_version")
            .and_then(|v| Version::parse(v).ok());
        let version = self
            .resolver
            .stdlib_version(&package.name, julia_version.as_ref())
            .ok_or_else(|| DepError::StdlibResolutionFailed {
                package: package.name.clone(),
            })?;
        let hash = self
            .resolver
            .stdlib_tree_hash(&package.name, &version)
            .ok_or_else(|| DepError::StdlibResolutionFailed {
                package: package.name.clone(),
            })?;

        debug!(package = %package.name, %version, "resolved stdlib dependency");
        package.version = version;
        package.tree_hash = Some(hash);
        Ok(())
    }

    /// Artifacts of a package that apply to the selector platform. A
    /// package resolved to a bare tree hash (stdlib path) contributes that
    /// hash as its sole artifact.
    fn artifacts_for(&self, package: &ResolvedPackage, selector: &Platform) -> Vec<ArtifactEntry> {
        if package.artifacts.is_empty() {
            return package
                .tree_hash
                .map(|tree_hash| ArtifactEntry {
                    name: package.name.clone(),
                    platform: Platform::Any,
                    tree_hash,
                })
                .into_iter()
                .collect();
        }
        package
            .artifacts
            .iter()
            .filter(|a| {
                // host-platform artifacts are installed too, for both build
                // host flavors
                a.platform.matches(selector)
                    || build_hosts().iter().any(|h| a.platform.matches(h))
            })
            .cloned()
            .collect()
    }

    /// The private package environment for this build.
    fn write_project_env(&self, packages: &[ResolvedPackage]) -> Result<()> {
        #[derive(Facet)]
        struct EnvEntry {
            name: String,
            version: String,
            tree_hash: Option<String>,
        }
        #[derive(Facet)]
        struct Env {
            packages: Vec<EnvEntry>,
        }

        let env = Env {
            packages: packages
                .iter()
                .map(|p| EnvEntry {
                    name: p.name.clone(),
                    version: p.version.to_string(),
                    tree_hash: p.tree_hash.map(|h| h.to_hex()),
                })
                .collect(),
        };

        let dir = self.prefix.project_dir(self.prefix.target_triplet());
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join("env.json");
        let contents = facet_json::to_string(&env).expect("serializing Env to json");
        std::fs::write(&path, contents).map_err(io_err(&path))?;
        Ok(())
    }

    fn record_path(&self) -> Utf8PathBuf {
        self.prefix
            .metadir()
            .join(format!("deps-{}.json", self.prefix.target_triplet()))
    }

    fn load_record(&self) -> Result<Option<InstallRecord>> {
        let path = self.record_path();
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).map_err(io_err(&path))?;
        let record = facet_json::from_str(&contents).map_err(|e| DepError::BadRecord {
            path,
            reason: e.to_string(),
        })?;
        Ok(Some(record))
    }

    fn write_record(&self, record: &InstallRecord) -> Result<()> {
        let mut record = record.clone();
        dedup_preserving_order(&mut record.artifacts);
        dedup_preserving_order(&mut record.links);
        dedup_preserving_order(&mut record.dirs);

        let path = self.record_path();
        let contents = facet_json::to_string(&record).expect("serializing InstallRecord to json");
        std::fs::write(&path, contents).map_err(io_err(&path))?;
        Ok(())
    }
}

/// Both platforms host tools may be built for: the musl build host and the
/// glibc host the Rust toolchain requires.
fn build_hosts() -> [Platform; 2] {
    [
        Platform::linux(Arch::X86_64, Libc::Musl),
        Platform::linux(Arch::X86_64, Libc::Glibc),
    ]
}

fn dedup_preserving_order(values: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    values.retain(|value| seen.insert(value.clone()));
}

/// Strip the julia version pin from a platform's extension tags.
fn without_julia_version(p: &Platform) -> Platform {
    match p {
        Platform::Base(base) => {
            let mut base = base.clone();
            base.extensions.remove("julia_version");
            Platform::Base(base)
        }
        Platform::Any => Platform::Any,
    }
}
