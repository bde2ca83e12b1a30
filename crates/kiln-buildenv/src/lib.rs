//! Build-system toolchain files.
//!
//! Emits the CMake toolchain files, Meson machine files, Bazel toolchain
//! definitions and the Cargo config that make the wrapped cross-compilers
//! under `/opt/bin/<triplet>/` look native to each build system. One file is
//! produced per (platform, role, frontend, compiler flavor); a stable
//! `host_<aat>.<ext>` / `target_<aat>.<ext>` symlink points at the flavor
//! preferred for the platform.

use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_platform::{Arch, Libc, Os, Platform};
use semver::Version;
use thiserror::Error;
use tracing::debug;

/// Errors from toolchain file emission
#[derive(Debug, Error)]
pub enum BuildEnvError {
    #[error("io error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// Result type for emission.
pub type Result<T> = std::result::Result<T, BuildEnvError>;

fn io_err(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> BuildEnvError {
    let path = path.into();
    move |source| BuildEnvError::Io { path, source }
}

/// Whether a file describes the build host or the cross target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Target,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Target => "target",
        }
    }
}

/// Which compiler family a file binds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerFlavor {
    Gcc,
    Clang,
}

impl CompilerFlavor {
    fn as_str(&self) -> &'static str {
        match self {
            CompilerFlavor::Gcc => "gcc",
            CompilerFlavor::Clang => "clang",
        }
    }

    /// FreeBSD and macOS builds default to clang, everything else to GCC.
    pub fn preferred_for(platform: &Platform) -> CompilerFlavor {
        match platform.os() {
            Some(Os::FreeBsd) | Some(Os::MacOs) => CompilerFlavor::Clang,
            _ => CompilerFlavor::Gcc,
        }
    }
}

/// Everything emission needs to know about one build.
#[derive(Debug, Clone)]
pub struct BuildEnv {
    /// The cross target
    pub target: Platform,
    /// The build host
    pub host: Platform,
    /// GCC version of the selected toolchain (steers libstdc++ include dirs)
    pub gcc_version: Version,
    /// Use lld when binding clang
    pub clang_use_lld: bool,
    /// Route compilations through ccache
    pub use_ccache: bool,
    /// Host kernel version, as reported by `uname -r`
    pub kernel_version: String,
}

impl BuildEnv {
    pub fn new(target: &Platform, host: &Platform, gcc_version: Version) -> BuildEnv {
        BuildEnv {
            target: target.concrete(),
            host: host.concrete(),
            gcc_version,
            clang_use_lld: false,
            use_ccache: false,
            kernel_version: host_kernel_version(),
        }
    }

    /// Emit the full set of toolchain files into `dir`.
    pub fn emit(&self, dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        let mut written = Vec::new();

        for (role, platform) in [(Role::Host, &self.host), (Role::Target, &self.target)] {
            let aat = platform.aatriplet();
            for flavor in [CompilerFlavor::Gcc, CompilerFlavor::Clang] {
                let f = flavor.as_str();
                let r = role.as_str();
                written.push(write_file(
                    &dir.join(format!("{r}_{aat}_{f}.cmake")),
                    &self.cmake_file(platform, role, flavor),
                )?);
                written.push(write_file(
                    &dir.join(format!("{r}_{aat}_{f}.meson")),
                    &self.meson_file(platform, role, flavor),
                )?);
                written.push(write_file(
                    &dir.join(format!("{r}_{aat}_{f}.bzl")),
                    &self.bazel_file(platform, flavor),
                )?);
            }

            // The stable entry points pick the preferred flavor
            let preferred = CompilerFlavor::preferred_for(platform).as_str();
            for ext in ["cmake", "meson", "bzl"] {
                let link = dir.join(format!("{}_{aat}.{ext}", role.as_str()));
                let target = format!("{}_{aat}_{preferred}.{ext}", role.as_str());
                if !link.is_symlink() {
                    symlink(&target, &link)?;
                }
                written.push(link);
            }
        }

        written.push(write_file(
            &dir.join("config.toml"),
            &self.cargo_config(),
        )?);

        debug!(dir = %dir, files = written.len(), "emitted toolchain files");
        Ok(written)
    }

    /// The CMake toolchain file for one platform/role/flavor.
    fn cmake_file(&self, platform: &Platform, role: Role, flavor: CompilerFlavor) -> String {
        let aat = platform.aatriplet();
        let triplet = platform.triplet();
        let host = &self.host;
        let mut out = String::new();

        writeln!(out, "# CMake toolchain file for {triplet} ({})", flavor.as_str()).unwrap();
        writeln!(
            out,
            "set(CMAKE_HOST_SYSTEM_NAME {})",
            host.os().map(|os| os.cmake_system_name()).unwrap_or("Linux")
        )
        .unwrap();
        writeln!(
            out,
            "set(CMAKE_HOST_SYSTEM_PROCESSOR {})",
            host.arch().map(|a| a.cmake_processor()).unwrap_or("x86_64")
        )
        .unwrap();
        writeln!(out, "set(CMAKE_HOST_SYSTEM_VERSION {})", self.kernel_version).unwrap();

        if role == Role::Target {
            // Setting CMAKE_SYSTEM_NAME is CMake's signal that this is a
            // cross build; host files leave it untouched.
            let os = platform.os().expect("concrete platforms carry an os");
            writeln!(out, "set(CMAKE_SYSTEM_NAME {})", os.cmake_system_name()).unwrap();
            writeln!(
                out,
                "set(CMAKE_SYSTEM_PROCESSOR {})",
                platform.arch().expect("concrete platforms carry an arch").cmake_processor()
            )
            .unwrap();
        }

        writeln!(out, "set(CMAKE_SYSROOT /opt/{aat}/{aat}/sys-root)").unwrap();
        if platform.os() == Some(Os::MacOs) {
            writeln!(out, "set(CMAKE_SYSTEM_FRAMEWORK_PATH").unwrap();
            writeln!(out, "    ${{CMAKE_SYSROOT}}/System/Library/Frameworks").unwrap();
            writeln!(out, "    ${{CMAKE_SYSROOT}}/System/Library/PrivateFrameworks").unwrap();
            writeln!(out, ")").unwrap();
            writeln!(out, "set(DARWIN_MAJOR_VERSION {DARWIN_MAJOR_VERSION})").unwrap();
            writeln!(out, "set(DARWIN_MINOR_VERSION {DARWIN_MINOR_VERSION})").unwrap();
        }

        let bin = format!("/opt/bin/{triplet}");
        let (cc, cxx) = match flavor {
            CompilerFlavor::Gcc => ("gcc", "g++"),
            CompilerFlavor::Clang => ("clang", "clang++"),
        };
        writeln!(out, "set(CMAKE_C_COMPILER {bin}/{aat}-{cc})").unwrap();
        writeln!(out, "set(CMAKE_CXX_COMPILER {bin}/{aat}-{cxx})").unwrap();
        writeln!(out, "set(CMAKE_Fortran_COMPILER {bin}/{aat}-gfortran)").unwrap();
        writeln!(out, "set(CMAKE_LINKER {})", self.linker(platform, flavor)).unwrap();
        for (var, tool) in [
            ("CMAKE_AR", "ar"),
            ("CMAKE_NM", "nm"),
            ("CMAKE_RANLIB", "ranlib"),
            ("CMAKE_OBJCOPY", "objcopy"),
        ] {
            writeln!(out, "set({var} {bin}/{aat}-{tool})").unwrap();
        }

        if self.ccache_enabled() {
            writeln!(out, "set(CMAKE_C_COMPILER_LAUNCHER ccache)").unwrap();
            writeln!(out, "set(CMAKE_CXX_COMPILER_LAUNCHER ccache)").unwrap();
        }

        out
    }

    /// The Meson machine file for one platform/role/flavor.
    fn meson_file(&self, platform: &Platform, role: Role, flavor: CompilerFlavor) -> String {
        let aat = platform.aatriplet();
        let triplet = platform.triplet();
        let bin = format!("/opt/bin/{triplet}");
        let (cc, cxx) = match flavor {
            CompilerFlavor::Gcc => ("gcc", "g++"),
            CompilerFlavor::Clang => ("clang", "clang++"),
        };

        let needs_wrapper = match role {
            Role::Host => false,
            Role::Target => !runnable_on_build_host(platform),
        };

        let host_os = self.host.os().unwrap_or(Os::Linux);
        let host_arch = self.host.arch().unwrap_or(Arch::X86_64);
        let os = platform.os().unwrap_or(Os::Linux);
        let arch = platform.arch().unwrap_or(Arch::X86_64);

        let mut out = String::new();
        writeln!(out, "[binaries]").unwrap();
        writeln!(out, "c = '{bin}/{aat}-{cc}'").unwrap();
        writeln!(out, "cpp = '{bin}/{aat}-{cxx}'").unwrap();
        writeln!(out, "fortran = '{bin}/{aat}-gfortran'").unwrap();
        writeln!(out, "ar = '{bin}/{aat}-ar'").unwrap();
        writeln!(out, "nm = '{bin}/{aat}-nm'").unwrap();
        writeln!(out, "strip = '{bin}/{aat}-strip'").unwrap();
        writeln!(out, "pkgconfig = '{bin}/{aat}-pkg-config'").unwrap();
        writeln!(out).unwrap();
        writeln!(out, "[built-in options]").unwrap();
        writeln!(out, "wrap_mode = 'nodownload'").unwrap();
        writeln!(out).unwrap();
        writeln!(out, "[properties]").unwrap();
        writeln!(out, "needs_exe_wrapper = {needs_wrapper}").unwrap();
        writeln!(out).unwrap();
        writeln!(out, "[build_machine]").unwrap();
        writeln!(out, "system = '{}'", host_os.meson_system()).unwrap();
        writeln!(out, "cpu_family = '{}'", host_arch.meson_cpu_family()).unwrap();
        writeln!(out, "cpu = '{host_arch}'").unwrap();
        writeln!(out, "endian = 'little'").unwrap();
        writeln!(out).unwrap();
        writeln!(out, "[host_machine]").unwrap();
        writeln!(out, "system = '{}'", os.meson_system()).unwrap();
        writeln!(out, "cpu_family = '{}'", arch.meson_cpu_family()).unwrap();
        writeln!(out, "cpu = '{arch}'").unwrap();
        writeln!(out, "endian = 'little'").unwrap();

        out
    }

    /// The Bazel toolchain definition for one platform/flavor.
    fn bazel_file(&self, platform: &Platform, flavor: CompilerFlavor) -> String {
        let aat = platform.aatriplet();
        let triplet = platform.triplet();
        let bin = format!("/opt/bin/{triplet}");
        let gcc = &self.gcc_version;
        let cc = match flavor {
            CompilerFlavor::Gcc => "gcc",
            CompilerFlavor::Clang => "clang",
        };

        let mut out = String::new();
        writeln!(
            out,
            "load(\"@bazel_tools//tools/cpp:cc_toolchain_config_lib.bzl\", \"tool_path\")"
        )
        .unwrap();
        writeln!(out).unwrap();
        writeln!(out, "def tool_paths():").unwrap();
        writeln!(out, "    return [").unwrap();
        for (name, tool) in [
            ("gcc", cc),
            ("cpp", "cpp"),
            ("ld", "ld"),
            ("ar", "ar"),
            ("nm", "nm"),
            ("objcopy", "objcopy"),
            ("objdump", "objdump"),
            ("strip", "strip"),
        ] {
            writeln!(
                out,
                "        tool_path(name = \"{name}\", path = \"{bin}/{aat}-{tool}\"),"
            )
            .unwrap();
        }
        writeln!(out, "    ]").unwrap();
        writeln!(out).unwrap();
        writeln!(out, "def cxx_builtin_include_directories():").unwrap();
        writeln!(out, "    return [").unwrap();
        writeln!(out, "        \"/opt/{aat}/{aat}/sys-root/usr/include\",").unwrap();
        writeln!(out, "        \"/opt/{aat}/{aat}/include/c++/{gcc}\",").unwrap();
        writeln!(out, "        \"/opt/{aat}/{aat}/include/c++/{gcc}/{aat}\",").unwrap();
        writeln!(out, "        \"/opt/{aat}/lib/gcc/{aat}/{gcc}/include\",").unwrap();
        writeln!(out, "    ]").unwrap();

        out
    }

    /// The Cargo config pinning linkers per Rust target triple.
    fn cargo_config(&self) -> String {
        let mut out = String::new();
        let mut platforms = vec![&self.target];
        if self.host.aatriplet() != self.target.aatriplet() {
            platforms.push(&self.host);
        }
        for platform in platforms {
            let aat = platform.aatriplet();
            writeln!(out, "[target.{}]", rust_target_triple(platform)).unwrap();
            writeln!(out, "linker = \"{aat}-cc\"").unwrap();
            writeln!(out).unwrap();
        }
        out
    }

    /// Linker choice: GCC links through the wrapped binutils ld; clang does
    /// too, unless lld is requested.
    fn linker(&self, platform: &Platform, flavor: CompilerFlavor) -> String {
        let aat = platform.aatriplet();
        match flavor {
            CompilerFlavor::Gcc => format!("/opt/bin/{}/{aat}-ld", platform.triplet()),
            CompilerFlavor::Clang if self.clang_use_lld => {
                if platform.os() == Some(Os::MacOs) {
                    "ld64.lld".to_string()
                } else {
                    "ld.lld".to_string()
                }
            }
            CompilerFlavor::Clang => format!("/opt/bin/{}/{aat}-ld", platform.triplet()),
        }
    }

    fn ccache_enabled(&self) -> bool {
        self.use_ccache || std::env::var("CC").is_ok_and(|cc| cc.contains("ccache"))
    }
}

/// Kernel version of the darwin sysroot the macOS shards target.
const DARWIN_MAJOR_VERSION: u32 = 14;
const DARWIN_MINOR_VERSION: u32 = 5;

/// Platforms the musl x86_64 build host can execute directly.
pub fn runnable_on_build_host(platform: &Platform) -> bool {
    matches!(
        platform.aatriplet().as_str(),
        "i686-linux-gnu" | "x86_64-linux-gnu" | "x86_64-linux-musl"
    )
}

/// The Rust target triple for an ABI-agnostic platform.
pub fn rust_target_triple(platform: &Platform) -> String {
    let platform = platform.concrete();
    let (os, arch, libc) = (
        platform.os().expect("concrete platforms carry an os"),
        platform.arch().expect("concrete platforms carry an arch"),
        platform.libc(),
    );

    let arch_part = match arch {
        Arch::Armv7l => "armv7",
        other => other.as_str(),
    };
    match os {
        Os::Linux => {
            let env = match (libc, arch) {
                (Some(Libc::Musl), Arch::Armv7l) => "musleabihf",
                (Some(Libc::Musl), _) => "musl",
                (_, Arch::Armv7l) => "gnueabihf",
                _ => "gnu",
            };
            format!("{arch_part}-unknown-linux-{env}")
        }
        Os::MacOs => format!("{arch_part}-apple-darwin"),
        Os::FreeBsd => format!("{arch_part}-unknown-freebsd"),
        Os::Windows => format!("{arch_part}-pc-windows-gnu"),
    }
}

/// `uname -r`, or a placeholder when unavailable.
pub fn host_kernel_version() -> String {
    std::process::Command::new("uname")
        .arg("-r")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn write_file(path: &Utf8Path, contents: &str) -> Result<Utf8PathBuf> {
    std::fs::write(path, contents).map_err(io_err(path))?;
    Ok(path.to_owned())
}

#[cfg(unix)]
fn symlink(target: &str, link: &Utf8Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(io_err(link))
}

#[cfg(not(unix))]
fn symlink(_target: &str, link: &Utf8Path) -> Result<()> {
    Err(BuildEnvError::Io {
        path: link.to_owned(),
        source: std::io::Error::other("symlinks are not supported on this platform"),
    })
}
