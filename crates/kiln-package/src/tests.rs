use super::*;

use std::io::Read;

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from(dir.path().to_str().unwrap());
    (dir, path)
}

fn write(root: &Utf8Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn sample_prefix(root: &Utf8Path) -> Utf8PathBuf {
    let prefix = root.join("prefix");
    write(root, "prefix/destdir/include/foo.h", "#pragma once\n");
    write(root, "prefix/destdir/lib/libfoo.so.1.0", "elf bytes");
    #[cfg(unix)]
    std::os::unix::fs::symlink("libfoo.so.1.0", prefix.join("destdir/lib/libfoo.so")).unwrap();
    prefix
}

fn platform() -> Platform {
    Platform::parse("aarch64-linux-gnu").unwrap()
}

#[test]
fn package_names_and_identifiers() {
    let (_guard, root) = temp_root();
    let store = ArtifactStore::new(root.join("store"));
    let prefix = sample_prefix(&root);

    let out = package(
        &store,
        &prefix,
        &root.join("products/Foo"),
        &Version::new(1, 2, 3),
        &platform(),
        false,
    )
    .unwrap();

    assert_eq!(
        out.path,
        root.join("products/Foo.v1.2.3.aarch64-linux-gnu.tar.gz")
    );
    assert!(out.path.is_file());
    assert_eq!(out.sha256.len(), 64);
    // the snapshot landed in the store under its tree hash
    assert!(store.contains(&out.tree_hash));
}

#[test]
fn package_refuses_to_overwrite_without_force() {
    let (_guard, root) = temp_root();
    let store = ArtifactStore::new(root.join("store"));
    let prefix = sample_prefix(&root);
    let base = root.join("products/Foo");
    let version = Version::new(1, 2, 3);

    package(&store, &prefix, &base, &version, &platform(), false).unwrap();
    let again = package(&store, &prefix, &base, &version, &platform(), false);
    assert!(matches!(again, Err(PackageError::OutputExists(_))));

    // force replaces it
    package(&store, &prefix, &base, &version, &platform(), true).unwrap();
}

#[test]
fn packaging_is_deterministic() {
    let (_guard, root) = temp_root();
    let store = ArtifactStore::new(root.join("store"));
    let prefix = sample_prefix(&root);

    let first = package(
        &store,
        &prefix,
        &root.join("a/Foo"),
        &Version::new(1, 0, 0),
        &platform(),
        false,
    )
    .unwrap();
    let second = package(
        &store,
        &prefix,
        &root.join("b/Foo"),
        &Version::new(1, 0, 0),
        &platform(),
        false,
    )
    .unwrap();

    assert_eq!(first.tree_hash, second.tree_hash);
    assert_eq!(first.sha256, second.sha256);

    // touching content changes both identifiers
    write(&root, "prefix/destdir/include/foo.h", "#pragma twice\n");
    let third = package(
        &store,
        &prefix,
        &root.join("c/Foo"),
        &Version::new(1, 0, 0),
        &platform(),
        false,
    )
    .unwrap();
    assert_ne!(first.tree_hash, third.tree_hash);
    assert_ne!(first.sha256, third.sha256);
}

#[cfg(unix)]
#[test]
fn archive_preserves_symlinks_and_contents() {
    let (_guard, root) = temp_root();
    let store = ArtifactStore::new(root.join("store"));
    let prefix = sample_prefix(&root);

    let out = package(
        &store,
        &prefix,
        &root.join("Foo"),
        &Version::new(2, 0, 0),
        &platform(),
        false,
    )
    .unwrap();

    let file = std::fs::File::open(&out.path).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut seen_symlink = false;
    let mut seen_header = false;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        if path == "destdir/lib/libfoo.so" {
            assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
            assert_eq!(
                entry.link_name().unwrap().unwrap().to_str().unwrap(),
                "libfoo.so.1.0"
            );
            seen_symlink = true;
        }
        if path == "destdir/include/foo.h" {
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            assert_eq!(contents, "#pragma once\n");
            seen_header = true;
        }
    }
    assert!(seen_symlink && seen_header);
}

#[test]
fn compress_dir_skips_links_and_subdirs() {
    let (_guard, root) = temp_root();
    let dir = root.join("logs");
    write(&root, "logs/build.log", "lots of output");
    write(&root, "logs/nested/other.log", "untouched");
    #[cfg(unix)]
    std::os::unix::fs::symlink("build.log", dir.join("latest.log")).unwrap();

    compress_dir(&dir, Codec::Gzip, 9, ".gz").unwrap();

    assert!(!dir.join("build.log").exists());
    assert!(dir.join("build.log.gz").is_file());
    // subdirectory contents untouched
    assert!(dir.join("nested/other.log").is_file());
    #[cfg(unix)]
    {
        assert!(dir.join("latest.log").is_symlink());
        assert!(!dir.join("latest.log.gz").exists());
    }

    // the compressed payload round-trips
    let file = std::fs::File::open(dir.join("build.log.gz")).unwrap();
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut contents = String::new();
    std::io::Read::read_to_string(&mut decoder, &mut contents).unwrap();
    assert_eq!(contents, "lots of output");
}

#[test]
fn compress_dir_xz_round_trip() {
    let (_guard, root) = temp_root();
    let dir = root.join("logs");
    write(&root, "logs/build.log", "xz payload");

    compress_dir(&dir, Codec::Xz, 6, ".xz").unwrap();
    let file = std::fs::File::open(dir.join("build.log.xz")).unwrap();
    let mut decoder = xz2::read::XzDecoder::new(file);
    let mut contents = String::new();
    std::io::Read::read_to_string(&mut decoder, &mut contents).unwrap();
    assert_eq!(contents, "xz payload");
}
