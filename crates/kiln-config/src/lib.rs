//! Process-wide configuration for kiln.
//!
//! All environment-derived state is collected once into an immutable
//! [`Config`] value and passed explicitly down the call graph; nothing else
//! in the workspace reads the environment.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

/// Which sandbox runner will execute the build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Runner {
    /// Unprivileged user-namespace sandbox (the default)
    #[default]
    UserNamespaces,
    /// Privileged sandbox (CI hosts)
    Privileged,
    /// Docker container sandbox
    Docker,
}

impl Runner {
    fn from_env(value: &str) -> Runner {
        match value {
            "userns" | "" => Runner::UserNamespaces,
            "privileged" => Runner::Privileged,
            "docker" => Runner::Docker,
            other => {
                warn!(runner = %other, "unknown RUNNER value, using the default");
                Runner::UserNamespaces
            }
        }
    }
}

/// Immutable process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-user storage root (artifact store, downloads, mounts, ccache)
    pub storage_root: Utf8PathBuf,
    /// Sandbox runner in use
    pub runner: Runner,
    /// Whether compiler shards are mounted from squashfs images
    pub use_squashfs: bool,
    /// Implicit Xcode EULA acceptance (`AUTOMATIC_APPLE=true`)
    pub automatic_apple: bool,
    /// Allow mounting through an encrypted filesystem
    pub allow_ecryptfs: bool,
    /// Route compilations through a ccache directory under the storage root
    pub use_ccache: bool,
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Config {
        let storage_root = std::env::var("STORAGE_DIR")
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|_| default_storage_root());

        let runner = Runner::from_env(&std::env::var("RUNNER").unwrap_or_default());

        // Squashfs is the default under CI and the privileged runner; Docker
        // images ship the shards unpacked.
        let use_squashfs = match std::env::var("USE_SQUASHFS").ok().as_deref() {
            Some("true") => true,
            Some("false") => false,
            _ => std::env::var("CI").is_ok() || runner == Runner::Privileged,
        };

        Config {
            storage_root,
            runner,
            use_squashfs: use_squashfs && runner != Runner::Docker,
            automatic_apple: env_flag("AUTOMATIC_APPLE"),
            allow_ecryptfs: env_flag("ALLOW_ECRYPTFS"),
            use_ccache: env_flag("USE_CCACHE"),
        }
    }

    /// A configuration rooted at an explicit storage directory, with every
    /// flag at its default. Used by tests and embedders.
    pub fn with_storage_root(storage_root: impl Into<Utf8PathBuf>) -> Config {
        Config {
            storage_root: storage_root.into(),
            runner: Runner::default(),
            use_squashfs: false,
            automatic_apple: false,
            allow_ecryptfs: false,
            use_ccache: false,
        }
    }

    /// The content-addressed artifact store root
    pub fn artifacts_dir(&self) -> Utf8PathBuf {
        self.storage_root.join("artifacts")
    }

    /// Where downloaded source archives land
    pub fn downloads_dir(&self) -> Utf8PathBuf {
        self.storage_root.join("downloads")
    }

    /// Per-UID squashfs copies and other mount scratch
    pub fn mounts_dir(&self) -> Utf8PathBuf {
        self.storage_root.join("mounts")
    }

    /// The ccache directory, when enabled
    pub fn ccache_dir(&self) -> Option<Utf8PathBuf> {
        self.use_ccache.then(|| self.storage_root.join("ccache"))
    }

    /// Whether the Xcode EULA has been accepted, either implicitly through
    /// the environment or by a persistent sentinel file.
    pub fn apple_eula_accepted(&self) -> bool {
        self.automatic_apple || self.eula_sentinel().exists()
    }

    /// Record EULA acceptance persistently.
    pub fn accept_apple_eula(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.storage_root)?;
        std::fs::write(self.eula_sentinel(), b"")
    }

    fn eula_sentinel(&self) -> Utf8PathBuf {
        self.storage_root.join("xcode_eula_accepted")
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "true")
}

fn default_storage_root() -> Utf8PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    Utf8Path::new(&home).join(".kiln")
}
