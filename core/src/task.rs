use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::CoreError;
use crate::progress::Progress;

/// Transfers are keyed by their source URL.
pub type TransferId = String;

/// Live state of a registered transfer. Finished transfers have no status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferStatus {
    Streaming,
    Paused,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Streaming => "streaming",
            TransferStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical folder a shared-storage record is filed under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum StorageCategory {
    Pictures,
    Movies,
    Music,
    #[default]
    Downloads,
}

impl StorageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageCategory::Pictures => "pictures",
            StorageCategory::Movies => "movies",
            StorageCategory::Music => "music",
            StorageCategory::Downloads => "downloads",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pictures" => Some(StorageCategory::Pictures),
            "movies" => Some(StorageCategory::Movies),
            "music" => Some(StorageCategory::Music),
            "downloads" => Some(StorageCategory::Downloads),
            _ => None,
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            StorageCategory::Pictures => "Pictures",
            StorageCategory::Movies => "Movies",
            StorageCategory::Music => "Music",
            StorageCategory::Downloads => "Download",
        }
    }
}

impl fmt::Display for StorageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Destination {
    DirectFile {
        path: String,
    },
    SharedStorage {
        display_name: String,
        category: StorageCategory,
        relative_path: Option<String>,
        use_legacy_path: bool,
        legacy_path: Option<String>,
    },
}

impl Destination {
    pub fn file(path: impl Into<String>) -> Self {
        Destination::DirectFile { path: path.into() }
    }

    pub fn shared(display_name: impl Into<String>, category: StorageCategory) -> Self {
        Destination::SharedStorage {
            display_name: display_name.into(),
            category,
            relative_path: None,
            use_legacy_path: false,
            legacy_path: None,
        }
    }

    pub fn with_relative_path(mut self, value: impl Into<String>) -> Self {
        if let Destination::SharedStorage { relative_path, .. } = &mut self {
            *relative_path = Some(value.into());
        }
        self
    }

    pub fn with_legacy_path(mut self, value: Option<String>) -> Self {
        if let Destination::SharedStorage {
            use_legacy_path,
            legacy_path,
            ..
        } = &mut self
        {
            *use_legacy_path = true;
            *legacy_path = value;
        }
        self
    }
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;
pub type SuccessCallback = Arc<dyn Fn() + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(&CoreError) + Send + Sync>;

#[derive(Clone)]
pub struct TransferCallbacks {
    pub on_progress: ProgressCallback,
    pub on_success: SuccessCallback,
    pub on_failure: FailureCallback,
}

impl Default for TransferCallbacks {
    fn default() -> Self {
        Self {
            on_progress: Arc::new(|_| {}),
            on_success: Arc::new(|| {}),
            on_failure: Arc::new(|_| {}),
        }
    }
}

impl fmt::Debug for TransferCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCallbacks").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub url: String,
    pub params: HashMap<String, String>,
    pub destination: Destination,
    pub callbacks: TransferCallbacks,
}

impl TransferConfig {
    pub fn new(url: impl Into<String>, destination: Destination) -> Self {
        Self {
            url: url.into(),
            params: HashMap::new(),
            destination,
            callbacks: TransferCallbacks::default(),
        }
    }

    pub fn id(&self) -> TransferId {
        self.url.clone()
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.callbacks.on_progress = Arc::new(f);
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_success = Arc::new(f);
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&CoreError) + Send + Sync + 'static,
    {
        self.callbacks.on_failure = Arc::new(f);
        self
    }
}

/// Terminal result of one transfer.
#[derive(Debug)]
pub enum TransferOutcome {
    Completed { bytes: u64 },
    Cancelled,
    Failed(CoreError),
}
