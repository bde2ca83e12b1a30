//! End-to-end pipeline tests with a mock sandbox executor.

mod harness;

use std::io::Read;

use camino::Utf8PathBuf;
use harness::{NoFetcher, RecordingRunner, TestEnv};
use kiln_build::{BuildError, BuildRequest, CancelToken, Orchestrator};
use kiln_deps::PackageSpec;
use kiln_platform::Platform;
use kiln_shards::select::{Compiler, ShardPreferences};
use kiln_stage::source::Source;
use semver::Version;
use sha2::Digest;

const BASE_SHARDS: &[&str] = &[
    "Rootfs.v2021.8.28.x86_64-linux-musl.unpacked",
    "PlatformSupport-aarch64-linux-gnu.v2021.8.28.x86_64-linux-musl.unpacked",
    "PlatformSupport-x86_64-linux-musl.v2021.8.28.x86_64-linux-musl.unpacked",
    // toolchain file emission validates its GCC version against the catalog
    // even when no C toolchain is mounted
    "GCCBootstrap-aarch64-linux-gnu.v9.1.0.x86_64-linux-musl.unpacked",
    "GCCBootstrap-x86_64-linux-musl.v9.1.0.x86_64-linux-musl.unpacked",
];

fn request(env: &TestEnv, deps: Vec<PackageSpec>, sources: Vec<Source>) -> BuildRequest {
    BuildRequest {
        platform: Platform::parse("aarch64-linux-gnu").unwrap(),
        sources,
        deps,
        script: vec!["/bin/sh".to_string(), "-c".to_string(), "make install".to_string()],
        compilers: vec![],
        prefs: ShardPreferences {
            archive: Some(kiln_shards::ArchiveKind::Unpacked),
            ..Default::default()
        },
        clang_use_lld: false,
        out_base: env.root.join("products/Hello"),
        version: Version::new(1, 0, 0),
        force: false,
    }
}

#[test]
fn happy_path_builds_and_packages() {
    let mut env = TestEnv::with_shards(BASE_SHARDS);
    env.add_package("Zlib_jll", &[("lib/libz.so.1", "zlib bytes")]);

    let source_file = env.root.join("inputs/hello.c");
    std::fs::create_dir_all(source_file.parent().unwrap()).unwrap();
    std::fs::write(&source_file, "int main(void) {}\n").unwrap();
    let sha256 = format!("{:x}", sha2::Sha256::digest(b"int main(void) {}\n"));

    let runner = RecordingRunner::succeeding(&[("bin/hello", "ELF hello")]);
    let orchestrator = Orchestrator::new(
        &env.config,
        &env.catalog,
        &env.store,
        &env.resolver,
        &NoFetcher,
    );
    let output = orchestrator
        .build(
            &request(
                &env,
                vec![PackageSpec::by_name("Zlib_jll")],
                vec![Source::File {
                    path: source_file,
                    sha256,
                }],
            ),
            &runner,
            &CancelToken::new(),
        )
        .unwrap();

    // the tarball exists under the spec'd name and its snapshot is stored
    assert_eq!(
        output.path,
        env.root.join("products/Hello.v1.0.0.aarch64-linux-gnu.tar.gz")
    );
    assert!(output.path.is_file());
    assert!(env.store.contains(&output.tree_hash));
    assert_eq!(output.sha256.len(), 64);

    // the runner saw the build script, the env, and the reversed mappings
    let commands = runner.commands.lock().unwrap();
    let command = &commands[0];
    assert_eq!(command.argv[0], "/bin/sh");
    assert!(command.env.iter().any(|(k, v)| k == "target" && v == "aarch64-linux-gnu"));
    // with no compilers the selection is rootfs + platform support, and only
    // the latter appears in the mappings
    assert_eq!(command.mounts.len(), 1);
    assert!(command.mounts[0].1.as_str().contains("aarch64-linux-gnu/PlatformSupport"));

    // the install output made it into the tarball
    let file = std::fs::File::open(&output.path).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut names = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        if path == "bin/hello" {
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            assert_eq!(contents, "ELF hello");
        }
        names.push(path);
    }
    assert!(names.contains(&"bin/hello".to_string()));

    // success removes the workspace
    assert_eq!(env.leftover_workspaces(), 0);
}

#[test]
fn failing_script_keeps_workspace_but_releases_deps() {
    let mut env = TestEnv::with_shards(BASE_SHARDS);
    env.add_package("Zlib_jll", &[("lib/libz.so.1", "zlib bytes")]);

    let runner = RecordingRunner::failing(7);
    let orchestrator = Orchestrator::new(
        &env.config,
        &env.catalog,
        &env.store,
        &env.resolver,
        &NoFetcher,
    );
    let result = orchestrator.build(
        &request(&env, vec![PackageSpec::by_name("Zlib_jll")], vec![]),
        &runner,
        &CancelToken::new(),
    );

    assert!(matches!(result, Err(BuildError::ScriptFailed { code: 7 })));

    // the workspace survives for inspection, but the dependency symlinks
    // were unwound by the teardown guard
    assert_eq!(env.leftover_workspaces(), 1);
    let builds = env.builds_dir();
    let workspace = std::fs::read_dir(&builds)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let workspace = Utf8PathBuf::from(workspace.to_str().unwrap());
    let destdir = workspace.join("aarch64-linux-gnu/destdir");
    assert!(destdir.is_dir());
    assert!(
        !destdir.join("lib/libz.so.1").exists(),
        "dependency symlink survived teardown"
    );
}

#[test]
fn cancelled_build_never_reaches_the_runner() {
    let mut env = TestEnv::with_shards(BASE_SHARDS);
    env.add_package("Zlib_jll", &[("lib/libz.so.1", "zlib bytes")]);

    let cancel = CancelToken::new();
    cancel.cancel();

    let runner = RecordingRunner::succeeding(&[]);
    let orchestrator = Orchestrator::new(
        &env.config,
        &env.catalog,
        &env.store,
        &env.resolver,
        &NoFetcher,
    );
    let result = orchestrator.build(
        &request(&env, vec![PackageSpec::by_name("Zlib_jll")], vec![]),
        &runner,
        &cancel,
    );

    assert!(matches!(result, Err(BuildError::Cancelled)));
    assert!(runner.commands.lock().unwrap().is_empty());
}

#[test]
fn missing_shards_fail_before_any_work() {
    let env = TestEnv::with_shards(&["Rootfs.v2021.8.28.x86_64-linux-musl.unpacked"]);

    let runner = RecordingRunner::succeeding(&[]);
    let orchestrator = Orchestrator::new(
        &env.config,
        &env.catalog,
        &env.store,
        &env.resolver,
        &NoFetcher,
    );
    let result = orchestrator.build(&request(&env, vec![], vec![]), &runner, &CancelToken::new());

    assert!(matches!(result, Err(BuildError::Shard(_))));
    assert!(runner.commands.lock().unwrap().is_empty());
    assert_eq!(env.leftover_workspaces(), 0);
}

#[test]
fn c_toolchain_emission_references_the_selected_gcc() {
    // BASE_SHARDS already registers GCC 9.1.0; add an older alternative so
    // the preference has something to beat
    let mut shards: Vec<String> = BASE_SHARDS.iter().map(|s| s.to_string()).collect();
    for target in ["aarch64-linux-gnu", "x86_64-linux-musl"] {
        shards.push(format!(
            "GCCBootstrap-{target}.v4.8.5.x86_64-linux-musl.unpacked"
        ));
    }
    shards.push("LLVMBootstrap.v13.0.1.x86_64-linux-musl.unpacked".into());
    let shard_refs: Vec<&str> = shards.iter().map(|s| s.as_str()).collect();

    let env = TestEnv::with_shards(&shard_refs);
    let runner = RecordingRunner::failing(1); // stop after emission
    let orchestrator = Orchestrator::new(
        &env.config,
        &env.catalog,
        &env.store,
        &env.resolver,
        &NoFetcher,
    );
    let mut req = request(&env, vec![], vec![]);
    req.compilers = vec![Compiler::C];
    req.prefs.gcc = Some(Version::new(9, 0, 0));

    let result = orchestrator.build(&req, &runner, &CancelToken::new());
    assert!(matches!(result, Err(BuildError::ScriptFailed { .. })));

    // the failed workspace still holds the emitted toolchain files
    let builds = env.builds_dir();
    let workspace = std::fs::read_dir(&builds)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let metadir = Utf8PathBuf::from(workspace.to_str().unwrap()).join("metadir");
    let bzl = metadir.join("target_aarch64-linux-gnu_gcc.bzl");
    let contents = std::fs::read_to_string(&bzl).unwrap();
    assert!(
        contents.contains("include/c++/9.1.0"),
        "expected the selected GCC 9.1.0 in {bzl}"
    );
    assert!(metadir.join("target_aarch64-linux-gnu.cmake").is_symlink());
    assert!(metadir.join("config.toml").is_file());
}
