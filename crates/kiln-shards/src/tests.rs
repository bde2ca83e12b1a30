use super::*;
use crate::select::{
    Compiler, ShardPreferences, available_gcc_builds, select_gcc_version, select_llvm_version,
    select_shards,
};

use kiln_platform::{Arch, CxxStringAbi, Libc};
use kiln_store::tree::blob_hash;

const GCC_VERSIONS: [&str; 8] = [
    "4.8.5", "5.2.0", "6.1.0", "7.1.0", "8.1.0", "9.1.0", "10.2.0", "11.1.0",
];

/// A catalog covering the full GCC table for a handful of targets
fn fixture_catalog() -> ShardCatalog {
    let mut toml = String::new();
    let mut entry = |name: String| {
        let hash = blob_hash(name.as_bytes()).to_hex();
        toml.push_str(&format!(
            "[shards.\"{name}\"]\ngit-tree-sha1 = \"{hash}\"\n"
        ));
    };

    entry("Rootfs.v2021.8.28.x86_64-linux-musl.squashfs".to_string());
    for target in [
        "x86_64-linux-gnu",
        "x86_64-linux-musl",
        "i686-linux-gnu",
        "aarch64-linux-gnu",
        "arm-linux-gnueabihf",
        "x86_64-macos",
        "x86_64-freebsd",
        "x86_64-windows",
    ] {
        entry(format!(
            "PlatformSupport-{target}.v2021.8.28.x86_64-linux-musl.squashfs"
        ));
    }
    for target in [
        "x86_64-linux-gnu",
        "x86_64-linux-musl",
        "aarch64-linux-gnu",
        "x86_64-macos",
    ] {
        for version in GCC_VERSIONS {
            entry(format!(
                "GCCBootstrap-{target}.v{version}.x86_64-linux-musl.squashfs"
            ));
        }
    }
    for version in ["9.0.1", "11.0.1", "13.0.1"] {
        entry(format!("LLVMBootstrap.v{version}.x86_64-linux-musl.squashfs"));
    }
    entry("RustBase.v1.57.0.x86_64-linux-gnu.squashfs".to_string());
    for target in ["x86_64-linux-gnu", "x86_64-linux-musl", "aarch64-linux-gnu"] {
        entry(format!(
            "RustToolchain-{target}.v1.57.0.x86_64-linux-gnu.squashfs"
        ));
    }
    entry("Go.v1.17.2.x86_64-linux-musl.squashfs".to_string());

    // entries the name grammar rejects are skipped, not fatal
    entry("README".to_string());
    entry("NotAShard-x86_64-linux-gnu.v1.0.0.x86_64-linux-musl.squashfs".to_string());

    ShardCatalog::from_toml(&toml).unwrap()
}

fn linux_gnu() -> Platform {
    Platform::linux(Arch::X86_64, Libc::Glibc)
}

fn names(shards: &[CompilerShard]) -> Vec<String> {
    shards.iter().map(|s| s.artifact_name()).collect()
}

#[test]
fn artifact_name_round_trip() {
    let cases = [
        "Rootfs.v2021.8.28.x86_64-linux-musl.squashfs",
        "PlatformSupport-aarch64-linux-gnu.v2021.8.28.x86_64-linux-musl.squashfs",
        "GCCBootstrap-arm-linux-gnueabihf.v9.1.0.x86_64-linux-musl.unpacked",
        "RustToolchain-x86_64-linux-musl.v1.57.0.x86_64-linux-gnu.squashfs",
        "LLVMBootstrap.v13.0.1-rc1.x86_64-linux-musl.squashfs",
    ];
    for case in cases {
        let shard = CompilerShard::parse_artifact_name(case).unwrap();
        assert_eq!(shard.artifact_name(), case, "round trip failed for {case}");
    }
}

#[test]
fn artifact_name_rejects_garbage() {
    for bad in [
        "",
        "README",
        "Rootfs",
        "Rootfs.x86_64-linux-musl.squashfs",              // no version
        "Rootfs.v2021.8.28.x86_64-linux-musl",            // no extension
        "NotAShard.v1.0.0.x86_64-linux-musl.squashfs",    // unknown kind
        "GCCBootstrap.v9.1.0.x86_64-linux-musl.elf.gz",   // bad extension position
    ] {
        assert!(
            CompilerShard::parse_artifact_name(bad).is_none(),
            "accepted {bad:?}"
        );
    }
}

#[test]
fn catalog_skips_unparseable_entries() {
    let catalog = fixture_catalog();
    assert!(catalog.all().all(|s| s.name != ShardName::Rootfs || s.target.is_none()));
    // README and NotAShard were dropped
    assert!(!catalog.all().any(|s| s.artifact_name().contains("NotAShard")));
}

#[test]
fn catalog_lookup_and_missing() {
    let catalog = fixture_catalog();
    let rootfs = catalog
        .newest(ShardName::Rootfs, None, ArchiveKind::Squashfs)
        .unwrap()
        .clone();
    catalog.tree_hash(&rootfs).unwrap();

    let unregistered = CompilerShard {
        name: ShardName::Go,
        version: semver::Version::new(9, 9, 9),
        host: Platform::linux(Arch::X86_64, Libc::Musl),
        target: None,
        archive: ArchiveKind::Squashfs,
    };
    assert!(matches!(
        catalog.tree_hash(&unregistered),
        Err(ShardError::ShardUnregistered(_))
    ));

    // registered but not installed in the store
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path().to_str().unwrap());
    assert!(matches!(
        catalog.path(&rootfs, &store),
        Err(ShardError::ShardArtifactMissing { .. })
    ));
}

#[test]
fn empty_compiler_set_selects_rootfs_and_platform_support() {
    let catalog = fixture_catalog();
    let shards = select_shards(
        &catalog,
        &linux_gnu(),
        &[],
        &ShardPreferences::default(),
    )
    .unwrap();

    assert_eq!(
        names(&shards),
        [
            "Rootfs.v2021.8.28.x86_64-linux-musl.squashfs",
            "PlatformSupport-x86_64-linux-gnu.v2021.8.28.x86_64-linux-musl.squashfs",
        ]
    );
}

#[test]
fn adding_compilers_never_removes_shards() {
    let catalog = fixture_catalog();
    let prefs = ShardPreferences::default();
    let target = linux_gnu();

    let base = select_shards(&catalog, &target, &[], &prefs).unwrap();
    let with_c = select_shards(&catalog, &target, &[Compiler::C], &prefs).unwrap();
    let with_all = select_shards(
        &catalog,
        &target,
        &[Compiler::C, Compiler::Rust, Compiler::Go],
        &prefs,
    )
    .unwrap();

    for shard in &base {
        assert!(with_c.contains(shard), "C dropped {shard}");
    }
    for shard in &with_c {
        assert!(with_all.contains(shard), "Rust+Go dropped {shard}");
    }
}

#[test]
fn c_selection_adds_host_tools_when_cross() {
    let catalog = fixture_catalog();
    let shards = select_shards(
        &catalog,
        &Platform::linux(Arch::Aarch64, Libc::Glibc),
        &[Compiler::C],
        &ShardPreferences::default(),
    )
    .unwrap();
    let names = names(&shards);

    assert!(names.iter().any(|n| n.starts_with("GCCBootstrap-aarch64-linux-gnu.")));
    assert!(names.iter().any(|n| n.starts_with("GCCBootstrap-x86_64-linux-musl.")));
    assert!(names.iter().any(|n| n.starts_with("PlatformSupport-x86_64-linux-musl.")));
    assert!(names.iter().any(|n| n.starts_with("LLVMBootstrap.")));
}

#[test]
fn rust_selection_is_glibc_hosted() {
    let catalog = fixture_catalog();
    let shards = select_shards(
        &catalog,
        &Platform::linux(Arch::Aarch64, Libc::Glibc),
        &[Compiler::Rust],
        &ShardPreferences::default(),
    )
    .unwrap();
    let names = names(&shards);

    assert!(names.contains(&"RustBase.v1.57.0.x86_64-linux-gnu.squashfs".to_string()));
    // the cross toolchain, the self-hosted toolchain, and the musl-host one
    assert!(names.contains(
        &"RustToolchain-aarch64-linux-gnu.v1.57.0.x86_64-linux-gnu.squashfs".to_string()
    ));
    assert!(names.contains(
        &"RustToolchain-x86_64-linux-gnu.v1.57.0.x86_64-linux-gnu.squashfs".to_string()
    ));
    assert!(names.contains(
        &"RustToolchain-x86_64-linux-musl.v1.57.0.x86_64-linux-gnu.squashfs".to_string()
    ));
    // host tools for the glibc rust host
    assert!(names.iter().any(|n| n.starts_with("PlatformSupport-x86_64-linux-gnu.")));
    assert!(names.iter().any(|n| n.starts_with("GCCBootstrap-x86_64-linux-gnu.")));
}

#[test]
fn gcc_nearest_with_libgfortran_pin() {
    // libgfortran3 narrows to {4.8.5, 5.2.0, 6.1.0}; nearest to v8 is 6.1.0
    let catalog = fixture_catalog();
    let target = linux_gnu().with_libgfortran_version(3);
    let build = select_gcc_version(
        &catalog,
        &target,
        Some(&semver::Version::new(8, 0, 0)),
        ArchiveKind::Squashfs,
    )
    .unwrap();
    assert_eq!(build.version, semver::Version::new(6, 1, 0));
}

#[test]
fn gcc_march_floor() {
    // carmel needs GCC >= 8.1; preferring v5 still lands on 8.1.0
    let catalog = fixture_catalog();
    let target = Platform::linux(Arch::Aarch64, Libc::Glibc)
        .with_tag("march", "carmel")
        .unwrap();
    let build = select_gcc_version(
        &catalog,
        &target,
        Some(&semver::Version::new(5, 0, 0)),
        ArchiveKind::Squashfs,
    )
    .unwrap();
    assert_eq!(build.version, semver::Version::new(8, 1, 0));
}

#[test]
fn gcc_libstdcxx_rounds_down() {
    let catalog = fixture_catalog();
    let target = linux_gnu().with_libstdcxx_version(semver::Version::new(3, 4, 24));
    let build = select_gcc_version(
        &catalog,
        &target,
        Some(&semver::Version::new(9, 0, 0)),
        ArchiveKind::Squashfs,
    )
    .unwrap();
    // newest build whose libstdc++ is <= 3.4.24 is 7.1.0 (3.4.23)
    assert_eq!(build.version, semver::Version::new(7, 1, 0));
    assert!(
        build.abi.libstdcxx_version.as_ref().unwrap() <= &semver::Version::new(3, 4, 24)
    );
}

#[test]
fn gcc_cxx11_needs_v5() {
    let catalog = fixture_catalog();
    let target = linux_gnu().with_cxxstring_abi(CxxStringAbi::Cxx11);
    let build = select_gcc_version(
        &catalog,
        &target,
        Some(&semver::Version::new(4, 0, 0)),
        ArchiveKind::Squashfs,
    )
    .unwrap();
    assert!(build.version >= semver::Version::new(5, 0, 0));

    // and cxx03 can only come from the pre-cxx11 compiler
    let target = linux_gnu().with_cxxstring_abi(CxxStringAbi::Cxx03);
    let build = select_gcc_version(&catalog, &target, None, ArchiveKind::Squashfs).unwrap();
    assert_eq!(build.version, semver::Version::new(4, 8, 5));
}

#[test]
fn gcc_impossible_abi() {
    // libgfortran3 caps at 6.1.0, carmel needs 8.1: unsatisfiable
    let catalog = fixture_catalog();
    let target = Platform::linux(Arch::Aarch64, Libc::Glibc)
        .with_libgfortran_version(3)
        .with_tag("march", "carmel")
        .unwrap();
    assert!(matches!(
        select_gcc_version(&catalog, &target, None, ArchiveKind::Squashfs),
        Err(ShardError::ImpossibleAbi { .. })
    ));
}

#[test]
fn gcc_selected_abi_satisfies_target() {
    // spot-check the filter law across the whole table
    let catalog = fixture_catalog();
    for gfortran in [3, 4, 5] {
        let target = linux_gnu().with_libgfortran_version(gfortran);
        let build =
            select_gcc_version(&catalog, &target, None, ArchiveKind::Squashfs).unwrap();
        assert_eq!(build.abi.libgfortran_version, Some(gfortran));
    }
    assert_eq!(available_gcc_builds().len(), 8);
}

#[test]
fn llvm_preference_is_nearest() {
    let catalog = fixture_catalog();
    let v = select_llvm_version(
        &catalog,
        Some(&semver::Version::new(9, 0, 0)),
        ArchiveKind::Squashfs,
    )
    .unwrap();
    assert_eq!(v, semver::Version::new(9, 0, 1));

    // no preference: newest
    let v = select_llvm_version(&catalog, None, ArchiveKind::Squashfs).unwrap();
    assert_eq!(v, semver::Version::new(13, 0, 1));
}

#[test]
fn bootstrap_mode_emits_newest_per_target() {
    let catalog = fixture_catalog();
    let prefs = ShardPreferences {
        bootstrap: vec![ShardName::GccBootstrap],
        ..Default::default()
    };
    let shards = select_shards(&catalog, &linux_gnu(), &[Compiler::C], &prefs).unwrap();

    // one newest GCC per registered target, nothing else
    assert_eq!(shards.len(), 4);
    for shard in &shards {
        assert_eq!(shard.name, ShardName::GccBootstrap);
        assert_eq!(shard.version, semver::Version::new(11, 1, 0));
    }
}

#[test]
fn any_platform_selects_like_the_musl_host() {
    let catalog = fixture_catalog();
    let prefs = ShardPreferences::default();
    let any = select_shards(&catalog, &Platform::Any, &[Compiler::C], &prefs).unwrap();
    let musl = select_shards(
        &catalog,
        &Platform::linux(Arch::X86_64, Libc::Musl),
        &[Compiler::C],
        &prefs,
    )
    .unwrap();
    assert_eq!(any, musl);
}
