use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Capabilities of the platform the engine runs on. They decide whether
/// shared-storage destinations go through a [`crate::storage::StorageIndex`]
/// or straight to a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformFlags {
    /// Shared storage may only be written through registered index records.
    pub requires_shared_index: bool,
    /// A transfer may opt out of the index with `use_legacy_path`.
    pub legacy_override_allowed: bool,
    /// Records carry a creation timestamp.
    pub record_timestamps: bool,
}

impl Default for PlatformFlags {
    fn default() -> Self {
        Self {
            requires_shared_index: false,
            legacy_override_allowed: true,
            record_timestamps: true,
        }
    }
}

impl PlatformFlags {
    pub fn scoped_storage() -> Self {
        Self {
            requires_shared_index: true,
            legacy_override_allowed: false,
            record_timestamps: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub user_agent: String,
    /// Root used for shared-storage destinations that end up on the
    /// direct-file route.
    pub shared_root: PathBuf,
    pub platform: PlatformFlags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            user_agent: "xfer/0.1".to_string(),
            shared_root: default_shared_root(),
            platform: PlatformFlags::default(),
        }
    }
}

pub fn default_shared_root() -> PathBuf {
    if let Ok(dir) = env::var("XFER_SHARED_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(home) = env::var("HOME") {
        let home = PathBuf::from(home);
        if home.is_dir() {
            return home;
        }
    }
    Path::new("/tmp").to_path_buf()
}
