//! Compiler shard catalog for kiln.
//!
//! A *shard* is a toolchain fragment (rootfs, sysroot, compiler) packaged as
//! a content-addressed artifact. The catalog is a static TOML manifest
//! mapping shard artifact names to git tree hashes; this crate decodes it,
//! caches it process-wide, and resolves shards to their storage paths.
//! Shard *selection* (which shards a given build needs) lives in [`select`].

pub mod select;

use std::fmt;
use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};
use facet::Facet;
use facet_value::Value;
use kiln_platform::Platform;
use kiln_store::{ArtifactStore, StoreError, TreeHash};
use semver::Version;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from catalog and selection operations
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("failed to read shard manifest {path}: {source}")]
    ManifestRead {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse shard manifest: {0}")]
    ManifestParse(String),

    #[error("shard {0} is not registered in the catalog")]
    ShardUnregistered(String),

    #[error("artifact for shard {shard} is not installed: {source}")]
    ShardArtifactMissing {
        shard: String,
        source: StoreError,
    },

    #[error("no compiler build can satisfy the ABI of {triplet}")]
    ImpossibleAbi { triplet: String },
}

/// Result type for shard operations.
pub type Result<T> = std::result::Result<T, ShardError>;

/// The closed vocabulary of shard kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardName {
    Rootfs,
    PlatformSupport,
    GccBootstrap,
    LlvmBootstrap,
    RustBase,
    RustToolchain,
    Go,
}

impl ShardName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardName::Rootfs => "Rootfs",
            ShardName::PlatformSupport => "PlatformSupport",
            ShardName::GccBootstrap => "GCCBootstrap",
            ShardName::LlvmBootstrap => "LLVMBootstrap",
            ShardName::RustBase => "RustBase",
            ShardName::RustToolchain => "RustToolchain",
            ShardName::Go => "Go",
        }
    }

    pub fn parse(s: &str) -> Option<ShardName> {
        match s {
            "Rootfs" => Some(ShardName::Rootfs),
            "PlatformSupport" => Some(ShardName::PlatformSupport),
            "GCCBootstrap" => Some(ShardName::GccBootstrap),
            "LLVMBootstrap" => Some(ShardName::LlvmBootstrap),
            "RustBase" => Some(ShardName::RustBase),
            "RustToolchain" => Some(ShardName::RustToolchain),
            "Go" => Some(ShardName::Go),
            _ => None,
        }
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a shard artifact is materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    /// An already-extracted directory in the store, bind-mounted as is
    Unpacked,
    /// A squashfs image, loop-mounted at build time
    Squashfs,
}

impl ArchiveKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::Unpacked => "unpacked",
            ArchiveKind::Squashfs => "squashfs",
        }
    }

    pub fn parse(s: &str) -> Option<ArchiveKind> {
        match s {
            "unpacked" => Some(ArchiveKind::Unpacked),
            "squashfs" => Some(ArchiveKind::Squashfs),
            _ => None,
        }
    }
}

/// One toolchain fragment.
///
/// Host and target are stored in ABI-agnostic form; ABI decisions are made
/// at selection time, not in the shard identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerShard {
    pub name: ShardName,
    pub version: Version,
    /// Platform the shard's binaries run on
    pub host: Platform,
    /// Platform the shard's tools produce code for, when target-specific
    pub target: Option<Platform>,
    pub archive: ArchiveKind,
}

impl CompilerShard {
    /// The artifact name this shard is registered under,
    /// e.g. `GCCBootstrap-aarch64-linux-gnu.v9.1.0.x86_64-linux-musl.squashfs`.
    pub fn artifact_name(&self) -> String {
        let mut s = self.name.as_str().to_string();
        if let Some(target) = &self.target {
            s.push('-');
            s.push_str(&target.aatriplet());
        }
        s.push_str(&format!(
            ".v{}.{}.{}",
            self.version,
            self.host.aatriplet(),
            self.archive.extension()
        ));
        s
    }

    /// Parse an artifact name back into a shard. Returns `None` for names
    /// outside the manifest grammar or the shard vocabulary.
    pub fn parse_artifact_name(input: &str) -> Option<CompilerShard> {
        let segments: Vec<&str> = input.split('.').collect();
        if segments.len() < 4 {
            return None;
        }

        let ext = segments[segments.len() - 1];
        let host = segments[segments.len() - 2];
        if !ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        // The host triplet begins with a non-digit and contains a dash
        if host.starts_with(|c: char| c.is_ascii_digit()) || !host.contains('-') {
            return None;
        }

        // Version: a `v<digit>`-led segment followed by digit-led segments,
        // ending right before the host
        let version_start = segments.iter().position(|s| {
            s.len() >= 2 && s.starts_with('v') && s.as_bytes()[1].is_ascii_digit()
        })?;
        if version_start == 0 || version_start > segments.len() - 3 {
            return None;
        }
        let version_segments = &segments[version_start..segments.len() - 2];
        if !version_segments[1..]
            .iter()
            .all(|s| s.starts_with(|c: char| c.is_ascii_digit()))
        {
            return None;
        }
        let version_str = version_segments.join(".");
        let version = parse_shard_version(version_str.strip_prefix('v')?)?;

        let name_part = segments[..version_start].join(".");
        let (name, target) = match name_part.split_once('-') {
            Some((name, target)) => (name, Some(target)),
            None => (name_part.as_str(), None),
        };

        Some(CompilerShard {
            name: ShardName::parse(name)?,
            version,
            host: Platform::parse(host).ok()?.abi_agnostic(),
            target: match target {
                Some(t) => Some(Platform::parse(t).ok()?.abi_agnostic()),
                None => None,
            },
            archive: ArchiveKind::parse(ext)?,
        })
    }

    /// The platform whose triplet prefixes this shard's mount location:
    /// the target when the shard is target-specific, the host otherwise.
    pub fn target_or_host(&self) -> &Platform {
        self.target.as_ref().unwrap_or(&self.host)
    }
}

impl fmt::Display for CompilerShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.artifact_name())
    }
}

/// Versions like `2021.8.28` have no patch segment spelled when zero;
/// accept 1-3 numeric components plus an optional pre-release suffix.
fn parse_shard_version(s: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }
    let (numbers, pre) = match s.split_once('-') {
        Some((n, p)) => (n, Some(p)),
        None => (s, None),
    };
    let mut parts = numbers.split('.');
    let major: u64 = parts.next()?.parse().ok()?;
    let minor: u64 = parts.next().unwrap_or("0").parse().ok()?;
    let patch: u64 = parts.next().unwrap_or("0").parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let mut version = Version::new(major, minor, patch);
    if let Some(pre) = pre {
        version.pre = semver::Prerelease::new(pre).ok()?;
    }
    Some(version)
}

// =============================================================================
// RAW TOML STRUCTURES (for facet-toml parsing)
// =============================================================================

/// Top level of the shard manifest
#[derive(Facet, Debug)]
struct RawManifest {
    /// Table keyed by artifact name
    shards: Option<Value>,
}

/// A single manifest entry
#[derive(Facet, Debug)]
#[facet(rename_all = "kebab-case")]
struct RawShardEntry {
    git_tree_sha1: Option<String>,
}

/// The decoded shard catalog.
#[derive(Debug, Default)]
pub struct ShardCatalog {
    shards: Vec<(CompilerShard, TreeHash)>,
}

impl ShardCatalog {
    /// Decode a manifest from TOML text. Entries whose names do not parse
    /// are skipped.
    pub fn from_toml(contents: &str) -> Result<ShardCatalog> {
        let raw: RawManifest = facet_toml::from_str(contents)
            .map_err(|e| ShardError::ManifestParse(e.to_string()))?;

        let mut shards = Vec::new();
        let Some(table) = raw.shards else {
            return Ok(ShardCatalog { shards });
        };
        let Some(entries) = table.as_object() else {
            return Err(ShardError::ManifestParse(
                "`shards` is not a table".to_string(),
            ));
        };

        for (name, value) in entries.iter() {
            let Some(shard) = CompilerShard::parse_artifact_name(name) else {
                debug!(entry = %name, "skipping unrecognized shard entry");
                continue;
            };

            let entry: RawShardEntry = facet_value::from_value(value.clone())
                .map_err(|e| ShardError::ManifestParse(format!("entry {name}: {e}")))?;
            let Some(hex) = entry.git_tree_sha1 else {
                debug!(entry = %name, "skipping shard entry without a tree hash");
                continue;
            };
            let hash = TreeHash::from_hex(&hex)
                .map_err(|e| ShardError::ManifestParse(format!("entry {name}: {e}")))?;

            shards.push((shard, hash));
        }

        Ok(ShardCatalog { shards })
    }

    /// Load a manifest from disk.
    pub fn load(path: &Utf8Path) -> Result<ShardCatalog> {
        let contents = std::fs::read_to_string(path).map_err(|source| ShardError::ManifestRead {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// The process-wide catalog, loaded once from `KILN_SHARD_MANIFEST`.
    ///
    /// A missing or unreadable manifest yields an empty catalog (with a
    /// warning); embedders that construct catalogs explicitly never hit this.
    pub fn global() -> &'static ShardCatalog {
        static CATALOG: OnceLock<ShardCatalog> = OnceLock::new();
        CATALOG.get_or_init(|| {
            let Ok(path) = std::env::var("KILN_SHARD_MANIFEST") else {
                warn!("KILN_SHARD_MANIFEST is not set, using an empty shard catalog");
                return ShardCatalog::default();
            };
            match Self::load(Utf8Path::new(&path)) {
                Ok(catalog) => catalog,
                Err(error) => {
                    warn!(%path, %error, "failed to load shard manifest, using an empty catalog");
                    ShardCatalog::default()
                }
            }
        })
    }

    /// Every registered shard
    pub fn all(&self) -> impl Iterator<Item = &CompilerShard> {
        self.shards.iter().map(|(shard, _)| shard)
    }

    /// The tree hash a shard is registered under
    pub fn tree_hash(&self, shard: &CompilerShard) -> Result<TreeHash> {
        self.shards
            .iter()
            .find(|(s, _)| s == shard)
            .map(|(_, hash)| *hash)
            .ok_or_else(|| ShardError::ShardUnregistered(shard.artifact_name()))
    }

    /// Resolve a shard to its path in the artifact store.
    pub fn path(&self, shard: &CompilerShard, store: &ArtifactStore) -> Result<Utf8PathBuf> {
        let hash = self.tree_hash(shard)?;
        store
            .lookup(&hash)
            .map_err(|source| ShardError::ShardArtifactMissing {
                shard: shard.artifact_name(),
                source,
            })
    }

    /// Registered shards with the given name, target and archive kind.
    /// The target is compared on aatriplets.
    pub fn candidates<'a>(
        &'a self,
        name: ShardName,
        target: Option<&'a Platform>,
        archive: ArchiveKind,
    ) -> impl Iterator<Item = &'a CompilerShard> {
        let target_aat = target.map(|t| t.aatriplet());
        self.all().filter(move |shard| {
            shard.name == name
                && shard.archive == archive
                && shard.target.as_ref().map(|t| t.aatriplet()) == target_aat
        })
    }

    /// The newest registered shard for a name/target/archive combination.
    pub fn newest<'a>(
        &'a self,
        name: ShardName,
        target: Option<&'a Platform>,
        archive: ArchiveKind,
    ) -> Option<&'a CompilerShard> {
        self.candidates(name, target, archive)
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Whether a specific shard version is registered.
    pub fn has_version(
        &self,
        name: ShardName,
        version: &Version,
        target: Option<&Platform>,
        archive: ArchiveKind,
    ) -> bool {
        self.candidates(name, target, archive)
            .any(|shard| shard.version == *version)
    }
}

#[cfg(test)]
mod tests;
