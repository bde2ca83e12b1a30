//! Shard selection: which toolchain fragments a build needs.
//!
//! Given a target platform and the set of requested compilers, selection
//! produces the minimal shard set to materialize. GCC versions are chosen
//! from a static table describing the ABI each GCC produces, filtered by the
//! target's ABI constraints and by catalog availability.

use std::sync::OnceLock;

use kiln_platform::{Arch, CompilerAbi, CxxStringAbi, Libc, Platform};
use semver::Version;
use tracing::debug;

use crate::{ArchiveKind, CompilerShard, Result, ShardCatalog, ShardError, ShardName};

/// Compilers a build can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compiler {
    C,
    Rust,
    Go,
}

/// Selection preferences
#[derive(Debug, Clone, Default)]
pub struct ShardPreferences {
    /// Preferred GCC version; the nearest surviving build is chosen
    pub gcc: Option<Version>,
    /// Preferred LLVM version; the nearest registered build is chosen
    pub llvm: Option<Version>,
    /// Squashfs images or unpacked directories
    pub archive: Option<ArchiveKind>,
    /// Bootstrap mode: build these shard kinds themselves instead of a
    /// normal toolchain set
    pub bootstrap: Vec<ShardName>,
}

impl ShardPreferences {
    fn archive(&self) -> ArchiveKind {
        self.archive.unwrap_or(ArchiveKind::Squashfs)
    }
}

/// A GCC release and the ABI its output carries
#[derive(Debug, Clone)]
pub struct GccBuild {
    pub version: Version,
    pub abi: CompilerAbi,
}

/// The GCC builds this service ships, oldest first, with the libgfortran /
/// libstdc++ / C++ string ABI each produces. This table is the source of
/// truth for mapping ABI constraints to toolchains.
pub fn available_gcc_builds() -> &'static [GccBuild] {
    static BUILDS: OnceLock<Vec<GccBuild>> = OnceLock::new();
    BUILDS.get_or_init(|| {
        let build = |version: (u64, u64, u64), gfortran, stdcxx_patch, strabi| GccBuild {
            version: Version::new(version.0, version.1, version.2),
            abi: CompilerAbi {
                libgfortran_version: Some(gfortran),
                libstdcxx_version: Some(Version::new(3, 4, stdcxx_patch)),
                cxxstring_abi: Some(strabi),
            },
        };
        vec![
            build((4, 8, 5), 3, 19, CxxStringAbi::Cxx03),
            build((5, 2, 0), 3, 21, CxxStringAbi::Cxx11),
            build((6, 1, 0), 3, 22, CxxStringAbi::Cxx11),
            build((7, 1, 0), 4, 23, CxxStringAbi::Cxx11),
            build((8, 1, 0), 5, 25, CxxStringAbi::Cxx11),
            build((9, 1, 0), 5, 26, CxxStringAbi::Cxx11),
            build((10, 2, 0), 5, 28, CxxStringAbi::Cxx11),
            build((11, 1, 0), 5, 29, CxxStringAbi::Cxx11),
        ]
    })
}

/// The build host every shard set is rooted on.
pub fn build_host() -> Platform {
    Platform::linux(Arch::X86_64, Libc::Musl)
}

/// Rust shards are hosted on glibc: Rust is broken on musl. Do not change
/// without evidence.
pub fn rust_host() -> Platform {
    Platform::linux(Arch::X86_64, Libc::Glibc)
}

/// Choose the shard set for a build.
///
/// With no compilers, this is exactly the root filesystem plus the target's
/// platform support; each requested compiler adds shards and never removes
/// any.
pub fn select_shards(
    catalog: &ShardCatalog,
    target: &Platform,
    compilers: &[Compiler],
    prefs: &ShardPreferences,
) -> Result<Vec<CompilerShard>> {
    if !prefs.bootstrap.is_empty() {
        return select_bootstrap_shards(catalog, prefs);
    }

    let archive = prefs.archive();
    let host = build_host();
    // ABI constraints steer GCC selection; shard identities are ABI-agnostic.
    let full_target = target.concrete();
    let target = full_target.abi_agnostic();
    let cross = target.aatriplet() != host.aatriplet();

    let mut shards = Vec::new();
    let mut push = |shard: CompilerShard| {
        if !shards.contains(&shard) {
            shards.push(shard);
        }
    };

    push(required(catalog, ShardName::Rootfs, None, archive)?);
    push(required(catalog, ShardName::PlatformSupport, Some(&target), archive)?);

    if compilers.contains(&Compiler::C) {
        let gcc = select_gcc_version(catalog, &full_target, prefs.gcc.as_ref(), archive)?;
        let llvm = select_llvm_version(catalog, prefs.llvm.as_ref(), archive)?;
        push(versioned(catalog, ShardName::GccBootstrap, &gcc.version, Some(&target), archive)?);
        push(versioned(catalog, ShardName::LlvmBootstrap, &llvm, None, archive)?);

        if cross {
            // Host tools so the build can run code generators locally
            let host_gcc = select_gcc_version(catalog, &host, prefs.gcc.as_ref(), archive)?;
            push(required(catalog, ShardName::PlatformSupport, Some(&host), archive)?);
            push(versioned(catalog, ShardName::GccBootstrap, &host_gcc.version, Some(&host), archive)?);
        }
    }

    if compilers.contains(&Compiler::Rust) {
        let rust_host = rust_host();
        push(required(catalog, ShardName::RustBase, None, archive)?);
        push(required(catalog, ShardName::RustToolchain, Some(&target), archive)?);

        if target.aatriplet() != rust_host.aatriplet() {
            let rust_gcc = select_gcc_version(catalog, &rust_host, prefs.gcc.as_ref(), archive)?;
            push(required(catalog, ShardName::RustToolchain, Some(&rust_host), archive)?);
            push(required(catalog, ShardName::PlatformSupport, Some(&rust_host), archive)?);
            push(versioned(catalog, ShardName::GccBootstrap, &rust_gcc.version, Some(&rust_host), archive)?);
        }
        if cross {
            push(required(catalog, ShardName::RustToolchain, Some(&host), archive)?);
        }
    }

    if compilers.contains(&Compiler::Go) {
        push(required(catalog, ShardName::Go, None, archive)?);
    }

    debug!(target = %target, count = shards.len(), "selected shards");
    Ok(shards)
}

/// Bootstrap mode: for building the shards themselves, emit the newest
/// registered version of each requested kind for every target it exists for.
fn select_bootstrap_shards(
    catalog: &ShardCatalog,
    prefs: &ShardPreferences,
) -> Result<Vec<CompilerShard>> {
    let archive = prefs.archive();
    let mut shards: Vec<CompilerShard> = Vec::new();

    for name in &prefs.bootstrap {
        let mut targets: Vec<Option<String>> = catalog
            .all()
            .filter(|s| s.name == *name && s.archive == archive)
            .map(|s| s.target.as_ref().map(|t| t.aatriplet()))
            .collect();
        targets.sort();
        targets.dedup();
        if targets.is_empty() {
            return Err(ShardError::ShardUnregistered(name.as_str().to_string()));
        }

        for target in targets {
            let target = match target {
                Some(aat) => Some(
                    Platform::parse(&aat)
                        .expect("catalog aatriplets always re-parse"),
                ),
                None => None,
            };
            let newest = catalog
                .newest(*name, target.as_ref(), archive)
                .expect("target list came from the catalog");
            if !shards.contains(newest) {
                shards.push(newest.clone());
            }
        }
    }

    Ok(shards)
}

fn required(
    catalog: &ShardCatalog,
    name: ShardName,
    target: Option<&Platform>,
    archive: ArchiveKind,
) -> Result<CompilerShard> {
    catalog.newest(name, target, archive).cloned().ok_or_else(|| {
        ShardError::ShardUnregistered(describe(name, target, archive))
    })
}

fn versioned(
    catalog: &ShardCatalog,
    name: ShardName,
    version: &Version,
    target: Option<&Platform>,
    archive: ArchiveKind,
) -> Result<CompilerShard> {
    catalog
        .candidates(name, target, archive)
        .find(|s| s.version == *version)
        .cloned()
        .ok_or_else(|| ShardError::ShardUnregistered(describe(name, target, archive)))
}

fn describe(name: ShardName, target: Option<&Platform>, archive: ArchiveKind) -> String {
    match target {
        Some(t) => format!("{name}-{}.{}", t.aatriplet(), archive.extension()),
        None => format!("{name}.{}", archive.extension()),
    }
}

/// Choose the GCC build for a target.
///
/// Builds survive when they are registered in the catalog for both the
/// target and the build host, and when their ABI is compatible with the
/// target's constraints:
/// - `libgfortran_version` must match exactly;
/// - `libstdcxx_version` rounds *down* (a binary built against an older
///   libstdc++ runs against a newer one, not vice versa);
/// - the C++ string ABI must match when pinned;
/// - a pinned `march` imposes the minimum GCC that introduced it.
///
/// Of the survivors, the one closest to `preferred` (L1 distance over the
/// version triple) wins; without a preference the oldest survivor wins, as
/// the most compatible.
pub fn select_gcc_version(
    catalog: &ShardCatalog,
    target: &Platform,
    preferred: Option<&Version>,
    archive: ArchiveKind,
) -> Result<&'static GccBuild> {
    let host = build_host();
    let target = target.concrete();
    let empty_abi = CompilerAbi::default();
    let abi = target.abi().unwrap_or(&empty_abi);

    let march_floor = target.march().and_then(march_minimum_gcc);

    let survivors: Vec<&GccBuild> = available_gcc_builds()
        .iter()
        .filter(|build| {
            catalog.has_version(ShardName::GccBootstrap, &build.version, Some(&target), archive)
                && catalog.has_version(ShardName::GccBootstrap, &build.version, Some(&host), archive)
        })
        .filter(|build| abi_compatible(build, abi))
        .filter(|build| match &march_floor {
            Some(floor) => build.version >= *floor,
            None => true,
        })
        .collect();

    let chosen = match preferred {
        Some(preferred) => survivors
            .iter()
            .min_by_key(|build| version_distance(&build.version, preferred))
            .copied(),
        None => survivors.first().copied(),
    };

    chosen.ok_or_else(|| ShardError::ImpossibleAbi {
        triplet: target.triplet(),
    })
}

fn abi_compatible(build: &GccBuild, target: &CompilerAbi) -> bool {
    if let Some(wanted) = target.libgfortran_version {
        if build.abi.libgfortran_version != Some(wanted) {
            return false;
        }
    }
    if let Some(wanted) = &target.libstdcxx_version {
        match &build.abi.libstdcxx_version {
            Some(produced) if produced <= wanted => {}
            _ => return false,
        }
    }
    if let Some(wanted) = target.cxxstring_abi {
        if build.abi.cxxstring_abi != Some(wanted) {
            return false;
        }
    }
    true
}

/// Minimum GCC version required to compile for a microarchitecture
fn march_minimum_gcc(march: &str) -> Option<Version> {
    match march {
        "avx" | "avx2" => Some(Version::new(4, 9, 0)),
        "avx512" => Some(Version::new(6, 1, 0)),
        "thunderx2" => Some(Version::new(7, 1, 0)),
        "neon" | "vfp4" | "carmel" => Some(Version::new(8, 1, 0)),
        _ => None,
    }
}

fn version_distance(a: &Version, b: &Version) -> u64 {
    a.major.abs_diff(b.major) + a.minor.abs_diff(b.minor) + a.patch.abs_diff(b.patch)
}

/// Choose the LLVM bootstrap shard version: nearest to the preference,
/// newest when unspecified.
pub fn select_llvm_version(
    catalog: &ShardCatalog,
    preferred: Option<&Version>,
    archive: ArchiveKind,
) -> Result<Version> {
    let mut versions: Vec<Version> = catalog
        .candidates(ShardName::LlvmBootstrap, None, archive)
        .map(|s| s.version.clone())
        .collect();
    versions.sort();

    let chosen = match preferred {
        Some(preferred) => versions
            .iter()
            .min_by_key(|v| version_distance(v, preferred))
            .cloned(),
        None => versions.last().cloned(),
    };

    chosen.ok_or_else(|| ShardError::ShardUnregistered("LLVMBootstrap".to_string()))
}
