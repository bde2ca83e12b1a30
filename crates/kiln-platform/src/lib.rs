//! Platform model and triplet algebra for kiln.
//!
//! A [`Platform`] describes a build target: operating system, architecture,
//! C library flavor, calling ABI, compiler ABI constraints, and a sorted set
//! of free-form extension tags (`march`, `cuda`, ...). Platforms print to and
//! parse from canonical triplet strings such as
//! `x86_64-linux-musl-libgfortran5-cxx11-march+avx2`.

pub mod expand;

use std::collections::BTreeMap;
use std::fmt;

use semver::Version;
use thiserror::Error;

/// Errors produced by platform parsing and tag manipulation
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("invalid triplet: {0}")]
    InvalidTriplet(String),

    #[error("invalid platform tag {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },
}

/// Result type for platform operations.
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Operating system families kiln can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Os {
    Linux,
    MacOs,
    FreeBsd,
    Windows,
}

impl Os {
    /// The triplet token for this OS
    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::MacOs => "macos",
            Os::FreeBsd => "freebsd",
            Os::Windows => "windows",
        }
    }

    /// Parse a triplet OS token
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linux" => Some(Os::Linux),
            "macos" => Some(Os::MacOs),
            "freebsd" => Some(Os::FreeBsd),
            "windows" => Some(Os::Windows),
            _ => None,
        }
    }

    /// The value CMake expects in `CMAKE_SYSTEM_NAME`
    pub fn cmake_system_name(&self) -> &'static str {
        match self {
            Os::Linux => "Linux",
            Os::MacOs => "Darwin",
            Os::FreeBsd => "FreeBSD",
            Os::Windows => "Windows",
        }
    }

    /// The value Meson expects in `host_machine.system`
    pub fn meson_system(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::MacOs => "darwin",
            Os::FreeBsd => "freebsd",
            Os::Windows => "windows",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architectures kiln can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    I686,
    X86_64,
    Armv7l,
    Aarch64,
    Powerpc64le,
}

impl Arch {
    /// The canonical architecture name
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::I686 => "i686",
            Arch::X86_64 => "x86_64",
            Arch::Armv7l => "armv7l",
            Arch::Aarch64 => "aarch64",
            Arch::Powerpc64le => "powerpc64le",
        }
    }

    /// The architecture token used in aatriplets (`armv7l` flattens to `arm`)
    pub fn aa_name(&self) -> &'static str {
        match self {
            Arch::Armv7l => "arm",
            other => other.as_str(),
        }
    }

    /// Parse an architecture token (accepts both `arm` and `armv7l`)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "i686" => Some(Arch::I686),
            "x86_64" => Some(Arch::X86_64),
            "arm" | "armv7l" => Some(Arch::Armv7l),
            "aarch64" => Some(Arch::Aarch64),
            "powerpc64le" => Some(Arch::Powerpc64le),
            _ => None,
        }
    }

    /// Microarchitecture names this architecture can be narrowed to.
    ///
    /// The first entry is the generic baseline for the architecture.
    pub fn microarchitectures(&self) -> &'static [&'static str] {
        match self {
            Arch::X86_64 => &["x86_64", "avx", "avx2", "avx512"],
            Arch::Aarch64 => &["armv8", "carmel", "thunderx2"],
            Arch::Armv7l => &["armv7l", "neon", "vfp4"],
            Arch::I686 | Arch::Powerpc64le => &[],
        }
    }

    /// The value CMake expects in `CMAKE_SYSTEM_PROCESSOR`
    pub fn cmake_processor(&self) -> &'static str {
        match self {
            Arch::Armv7l => "arm",
            Arch::Powerpc64le => "ppc64le",
            other => other.as_str(),
        }
    }

    /// The value Meson expects in `cpu_family`
    pub fn meson_cpu_family(&self) -> &'static str {
        match self {
            Arch::Powerpc64le => "ppc64",
            Arch::I686 => "x86",
            Arch::Armv7l => "arm",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// C library flavor (Linux only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Libc {
    Glibc,
    Musl,
}

impl Libc {
    /// The triplet token (`gnu` for glibc, matching toolchain convention)
    pub fn as_str(&self) -> &'static str {
        match self {
            Libc::Glibc => "gnu",
            Libc::Musl => "musl",
        }
    }
}

impl fmt::Display for Libc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calling ABI tag (armv7l-Linux only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallAbi {
    Eabihf,
}

impl CallAbi {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallAbi::Eabihf => "eabihf",
        }
    }
}

/// C++ string ABI of libstdc++
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CxxStringAbi {
    Cxx03,
    Cxx11,
}

impl CxxStringAbi {
    pub fn as_str(&self) -> &'static str {
        match self {
            CxxStringAbi::Cxx03 => "cxx03",
            CxxStringAbi::Cxx11 => "cxx11",
        }
    }
}

impl fmt::Display for CxxStringAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiler ABI constraints a platform may pin down.
///
/// Each field is independent; an unset field means "compatible with any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CompilerAbi {
    /// libgfortran major version (3, 4 or 5)
    pub libgfortran_version: Option<u32>,
    /// libstdc++ symbol version, e.g. 3.4.26 for GLIBCXX_3.4.26
    pub libstdcxx_version: Option<Version>,
    /// C++ std::string ABI
    pub cxxstring_abi: Option<CxxStringAbi>,
}

impl CompilerAbi {
    /// True when no ABI field is pinned
    pub fn is_unconstrained(&self) -> bool {
        self.libgfortran_version.is_none()
            && self.libstdcxx_version.is_none()
            && self.cxxstring_abi.is_none()
    }
}

/// A fully specified (non-wildcard) platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BasePlatform {
    pub os: Os,
    pub arch: Arch,
    /// Required on Linux, absent elsewhere
    pub libc: Option<Libc>,
    /// Required on armv7l-Linux, absent elsewhere
    pub call_abi: Option<CallAbi>,
    pub abi: CompilerAbi,
    /// Sorted free-form tags (`march`, `cuda`, `julia_version`, ...)
    pub extensions: BTreeMap<String, String>,
}

/// A build target platform.
///
/// `Any` is the wildcard platform: it matches every platform and, wherever a
/// concrete build environment is needed, behaves as `x86_64-linux-musl`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Platform {
    Any,
    Base(BasePlatform),
}

impl Platform {
    /// A Linux platform with the given architecture and libc
    pub fn linux(arch: Arch, libc: Libc) -> Self {
        let call_abi = match arch {
            Arch::Armv7l => Some(CallAbi::Eabihf),
            _ => None,
        };
        Platform::Base(BasePlatform {
            os: Os::Linux,
            arch,
            libc: Some(libc),
            call_abi,
            abi: CompilerAbi::default(),
            extensions: BTreeMap::new(),
        })
    }

    /// A macOS platform
    pub fn macos(arch: Arch) -> Self {
        Self::non_linux(Os::MacOs, arch)
    }

    /// A FreeBSD platform
    pub fn freebsd(arch: Arch) -> Self {
        Self::non_linux(Os::FreeBsd, arch)
    }

    /// A Windows platform
    pub fn windows(arch: Arch) -> Self {
        Self::non_linux(Os::Windows, arch)
    }

    fn non_linux(os: Os, arch: Arch) -> Self {
        Platform::Base(BasePlatform {
            os,
            arch,
            libc: None,
            call_abi: None,
            abi: CompilerAbi::default(),
            extensions: BTreeMap::new(),
        })
    }

    /// The concrete platform standing in for `Any` in build environments
    pub fn any_build_host() -> Self {
        Platform::linux(Arch::X86_64, Libc::Musl)
    }

    /// Resolve the wildcard: `Any` becomes `x86_64-linux-musl`, everything
    /// else is returned unchanged.
    pub fn concrete(&self) -> Platform {
        match self {
            Platform::Any => Self::any_build_host(),
            p => p.clone(),
        }
    }

    pub fn os(&self) -> Option<Os> {
        match self {
            Platform::Any => None,
            Platform::Base(b) => Some(b.os),
        }
    }

    pub fn arch(&self) -> Option<Arch> {
        match self {
            Platform::Any => None,
            Platform::Base(b) => Some(b.arch),
        }
    }

    pub fn libc(&self) -> Option<Libc> {
        match self {
            Platform::Any => None,
            Platform::Base(b) => b.libc,
        }
    }

    pub fn abi(&self) -> Option<&CompilerAbi> {
        match self {
            Platform::Any => None,
            Platform::Base(b) => Some(&b.abi),
        }
    }

    /// Look up an extension tag
    pub fn tag(&self, key: &str) -> Option<&str> {
        match self {
            Platform::Any => None,
            Platform::Base(b) => b.extensions.get(key).map(|s| s.as_str()),
        }
    }

    /// The `march` extension tag, if set
    pub fn march(&self) -> Option<&str> {
        self.tag("march")
    }

    /// Strip every ABI constraint and extension tag, keeping only
    /// OS, architecture, libc and calling ABI.
    pub fn abi_agnostic(&self) -> Platform {
        match self {
            Platform::Any => Platform::Any,
            Platform::Base(b) => Platform::Base(BasePlatform {
                os: b.os,
                arch: b.arch,
                libc: b.libc,
                call_abi: b.call_abi,
                abi: CompilerAbi::default(),
                extensions: BTreeMap::new(),
            }),
        }
    }

    /// Return a copy with the libgfortran version replaced
    pub fn with_libgfortran_version(&self, version: u32) -> Platform {
        let mut p = self.concrete();
        if let Platform::Base(b) = &mut p {
            b.abi.libgfortran_version = Some(version);
        }
        p
    }

    /// Return a copy with the C++ string ABI replaced
    pub fn with_cxxstring_abi(&self, abi: CxxStringAbi) -> Platform {
        let mut p = self.concrete();
        if let Platform::Base(b) = &mut p {
            b.abi.cxxstring_abi = Some(abi);
        }
        p
    }

    /// Return a copy with the libstdc++ version replaced
    pub fn with_libstdcxx_version(&self, version: Version) -> Platform {
        let mut p = self.concrete();
        if let Platform::Base(b) = &mut p {
            b.abi.libstdcxx_version = Some(version);
        }
        p
    }

    /// Return a copy with an extension tag added.
    ///
    /// Setting a key to its current value is idempotent; setting it to a
    /// different value, or using a value the tag grammar cannot round-trip,
    /// is an error. `march` values are validated against the architecture's
    /// microarchitecture table.
    pub fn with_tag(&self, key: &str, value: &str) -> Result<Platform> {
        validate_tag_component(key, key)?;
        validate_tag_component(key, value)?;

        let mut p = self.concrete();
        let Platform::Base(b) = &mut p else {
            unreachable!("concrete() never returns Any");
        };

        if key == "march" && !b.arch.microarchitectures().contains(&value) {
            return Err(PlatformError::InvalidKey {
                key: key.to_string(),
                reason: format!("unknown microarchitecture {value:?} for {}", b.arch),
            });
        }

        match b.extensions.get(key) {
            Some(existing) if existing == value => {}
            Some(existing) => {
                return Err(PlatformError::InvalidKey {
                    key: key.to_string(),
                    reason: format!("already set to {existing:?}, refusing to change to {value:?}"),
                });
            }
            None => {
                b.extensions.insert(key.to_string(), value.to_string());
            }
        }
        Ok(p)
    }

    /// The architecture-abi triplet used for tool path prefixes,
    /// e.g. `x86_64-linux-musl` or `arm-linux-gnueabihf`.
    pub fn aatriplet(&self) -> String {
        match self {
            Platform::Any => "any".to_string(),
            Platform::Base(b) => {
                let mut s = format!("{}-{}", b.arch.aa_name(), b.os);
                if let Some(libc) = b.libc {
                    s.push('-');
                    s.push_str(libc.as_str());
                    if let Some(call_abi) = b.call_abi {
                        s.push_str(call_abi.as_str());
                    }
                }
                s
            }
        }
    }

    /// The full canonical triplet: aatriplet plus ABI tags plus sorted
    /// `key+value` extension pairs.
    pub fn triplet(&self) -> String {
        match self {
            Platform::Any => "any".to_string(),
            Platform::Base(b) => {
                let mut s = self.aatriplet();
                if let Some(v) = b.abi.libgfortran_version {
                    s.push_str(&format!("-libgfortran{v}"));
                }
                if let Some(abi) = b.abi.cxxstring_abi {
                    s.push_str(&format!("-{abi}"));
                }
                if let Some(v) = &b.abi.libstdcxx_version {
                    s.push_str(&format!("-libstdcxx{}", v.patch));
                }
                for (key, value) in &b.extensions {
                    s.push_str(&format!("-{key}+{value}"));
                }
                s
            }
        }
    }

    /// Parse a canonical triplet. Inverse of [`Platform::triplet`] for every
    /// value that function can produce.
    pub fn parse(input: &str) -> Result<Platform> {
        if input == "any" {
            return Ok(Platform::Any);
        }

        let invalid = || PlatformError::InvalidTriplet(input.to_string());

        let mut tokens = input.split('-');
        let arch = tokens
            .next()
            .and_then(Arch::parse)
            .ok_or_else(invalid)?;
        let os = tokens.next().and_then(Os::parse).ok_or_else(invalid)?;

        let mut rest: Vec<&str> = tokens.collect();

        // The libc token (with optional fused eabihf suffix) follows the OS
        // on Linux only.
        let (libc, call_abi) = if os == Os::Linux {
            let token = if rest.is_empty() { None } else { Some(rest.remove(0)) };
            match token {
                Some("gnu") => (Some(Libc::Glibc), None),
                Some("musl") => (Some(Libc::Musl), None),
                Some("gnueabihf") => (Some(Libc::Glibc), Some(CallAbi::Eabihf)),
                Some("musleabihf") => (Some(Libc::Musl), Some(CallAbi::Eabihf)),
                _ => return Err(invalid()),
            }
        } else {
            (None, None)
        };

        // The hard-float ABI tag is exactly the armv7l story; anything else
        // carrying it does not round-trip.
        if (call_abi.is_some()) != (os == Os::Linux && arch == Arch::Armv7l) {
            return Err(invalid());
        }

        let mut abi = CompilerAbi::default();
        let mut platform = Platform::Base(BasePlatform {
            os,
            arch,
            libc,
            call_abi,
            abi: CompilerAbi::default(),
            extensions: BTreeMap::new(),
        });

        for token in rest {
            if let Some((key, value)) = token.split_once('+') {
                platform = platform.with_tag(key, value).map_err(|e| match e {
                    PlatformError::InvalidKey { .. } => e,
                    _ => invalid(),
                })?;
            } else if let Some(v) = token.strip_prefix("libgfortran") {
                let v: u32 = v.parse().map_err(|_| invalid())?;
                if !matches!(v, 3..=5) || abi.libgfortran_version.is_some() {
                    return Err(invalid());
                }
                abi.libgfortran_version = Some(v);
            } else if token == "cxx03" || token == "cxx11" {
                if abi.cxxstring_abi.is_some() {
                    return Err(invalid());
                }
                abi.cxxstring_abi = Some(if token == "cxx11" {
                    CxxStringAbi::Cxx11
                } else {
                    CxxStringAbi::Cxx03
                });
            } else if let Some(v) = token.strip_prefix("libstdcxx") {
                let patch: u64 = v.parse().map_err(|_| invalid())?;
                if abi.libstdcxx_version.is_some() {
                    return Err(invalid());
                }
                abi.libstdcxx_version = Some(Version::new(3, 4, patch));
            } else {
                return Err(invalid());
            }
        }

        if let Platform::Base(b) = &mut platform {
            b.abi = abi;
        }
        Ok(platform)
    }

    /// Platform compatibility check.
    ///
    /// True when every field specified on *both* sides agrees. A field
    /// unspecified on either side never forces a mismatch; extension keys
    /// are compared only when present on both sides. Reflexive and
    /// symmetric.
    pub fn matches(&self, other: &Platform) -> bool {
        let (a, b) = match (self, other) {
            (Platform::Any, _) | (_, Platform::Any) => return true,
            (Platform::Base(a), Platform::Base(b)) => (a, b),
        };

        if a.os != b.os || a.arch != b.arch {
            return false;
        }
        if !option_fields_agree(&a.libc, &b.libc) {
            return false;
        }
        if !option_fields_agree(&a.call_abi, &b.call_abi) {
            return false;
        }
        if !option_fields_agree(&a.abi.libgfortran_version, &b.abi.libgfortran_version) {
            return false;
        }
        if !option_fields_agree(&a.abi.libstdcxx_version, &b.abi.libstdcxx_version) {
            return false;
        }
        if !option_fields_agree(&a.abi.cxxstring_abi, &b.abi.cxxstring_abi) {
            return false;
        }
        a.extensions
            .iter()
            .all(|(k, v)| b.extensions.get(k).is_none_or(|other| other == v))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.triplet())
    }
}

impl std::str::FromStr for Platform {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self> {
        Platform::parse(s)
    }
}

/// Two optional fields agree unless both are set and differ
fn option_fields_agree<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Tag keys and values must survive the `-`-separated, `+`-joined triplet
/// grammar.
fn validate_tag_component(key: &str, component: &str) -> Result<()> {
    if component.is_empty() {
        return Err(PlatformError::InvalidKey {
            key: key.to_string(),
            reason: "empty tag component".to_string(),
        });
    }
    for forbidden in ['+', '-'] {
        if component.contains(forbidden) {
            return Err(PlatformError::InvalidKey {
                key: key.to_string(),
                reason: format!("{component:?} contains {forbidden:?}"),
            });
        }
    }
    Ok(())
}
