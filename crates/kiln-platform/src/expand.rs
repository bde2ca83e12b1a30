//! Platform expansion: turning an underspecified platform into the set of
//! concrete platforms a binary could be built for.

use crate::{Arch, CxxStringAbi, Os, Platform};

/// libgfortran major versions with distinct ABIs
pub const LIBGFORTRAN_VERSIONS: [u32; 3] = [3, 4, 5];

/// Expand a platform along the libgfortran axis.
///
/// A platform that already pins `libgfortran_version` expands to itself;
/// otherwise one variant per supported major version is produced.
pub fn expand_gfortran_versions(p: &Platform) -> Vec<Platform> {
    match p.abi() {
        Some(abi) if abi.libgfortran_version.is_none() => LIBGFORTRAN_VERSIONS
            .iter()
            .map(|v| p.with_libgfortran_version(*v))
            .collect(),
        _ => vec![p.clone()],
    }
}

/// Expand a platform along the C++ string ABI axis.
///
/// FreeBSD and macOS ship libc++ rather than libstdc++, so they are skipped
/// and expand to themselves.
pub fn expand_cxxstring_abis(p: &Platform) -> Vec<Platform> {
    if matches!(p.os(), Some(Os::FreeBsd) | Some(Os::MacOs)) {
        return vec![p.clone()];
    }
    match p.abi() {
        Some(abi) if abi.cxxstring_abi.is_none() => {
            [CxxStringAbi::Cxx03, CxxStringAbi::Cxx11]
                .iter()
                .map(|abi| p.with_cxxstring_abi(*abi))
                .collect()
        }
        _ => vec![p.clone()],
    }
}

/// Expand a platform along the microarchitecture axis.
///
/// A platform already carrying `march` expands to itself; an architecture
/// with no microarchitecture table likewise. Otherwise one variant per
/// supported march is produced, each sharing the input's base platform.
pub fn expand_microarchitectures(p: &Platform) -> Vec<Platform> {
    if p.march().is_some() {
        return vec![p.clone()];
    }
    let Some(arch) = p.arch() else {
        return vec![p.clone()];
    };
    let marches = arch.microarchitectures();
    if marches.is_empty() {
        return vec![p.clone()];
    }
    marches
        .iter()
        .map(|march| {
            p.with_tag("march", march)
                .expect("table marches are always valid for their arch")
        })
        .collect()
}

/// Classify a host CPU feature set into the coarsest microarchitecture that
/// still fits, and return the platform extended with that `march`.
///
/// Only x86_64 is classified; every other architecture is returned
/// unextended. Feature names are compared case-insensitively.
pub fn extend_with_cpu_features<I, S>(p: &Platform, features: I) -> Platform
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if p.arch() != Some(Arch::X86_64) || p.march().is_some() {
        return p.clone();
    }

    let mut has_avx = false;
    let mut has_avx2 = false;
    let mut has_avx512 = false;
    for feature in features {
        match feature.as_ref().to_ascii_lowercase().as_str() {
            "avx" => has_avx = true,
            "avx2" => has_avx2 = true,
            "avx512f" => has_avx512 = true,
            _ => {}
        }
    }

    let march = if has_avx512 {
        "avx512"
    } else if has_avx2 {
        "avx2"
    } else if has_avx {
        "avx"
    } else {
        "x86_64"
    };

    p.with_tag("march", march)
        .expect("x86_64 classification marches are always valid")
}
