use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::config::PlatformFlags;
use crate::error::{CoreError, CoreResult};
use crate::storage::{mime_type_for, RecordMetadata, RecordRef, StorageIndex, StorageVolume};
use crate::task::{Destination, StorageCategory};

static FILE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.\-()%/]+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DirectFile,
    SharedStorage,
}

/// Which strategy a descriptor resolves to on the given platform.
pub fn select_strategy(dest: &Destination, platform: &PlatformFlags) -> Strategy {
    match dest {
        Destination::DirectFile { .. } => Strategy::DirectFile,
        Destination::SharedStorage {
            use_legacy_path, ..
        } => {
            if !platform.requires_shared_index {
                return Strategy::DirectFile;
            }
            if *use_legacy_path && platform.legacy_override_allowed {
                Strategy::DirectFile
            } else {
                Strategy::SharedStorage
            }
        }
    }
}

pub fn validate_file_path(path: &str) -> CoreResult<()> {
    if FILE_PATH_RE.is_match(path) {
        Ok(())
    } else {
        Err(CoreError::Config(format!("illegal file store path: {:?}", path)))
    }
}

fn validate_display_name(display_name: &str) -> CoreResult<()> {
    if display_name.trim().is_empty() {
        return Err(CoreError::Config(
            "display name is required for shared storage".to_string(),
        ));
    }
    Ok(())
}

/// Writable end of one transfer.
pub trait TransferSink: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> CoreResult<()>;
    /// Flush and release handles. Always runs once the loop is done with the sink.
    fn close(&mut self) -> CoreResult<()>;
    /// Release handles and remove whatever was written.
    fn discard(&mut self) -> CoreResult<()>;
}

pub trait DestinationProvider: Send + Sync {
    /// Reject descriptors this provider cannot serve. Runs before any network work.
    fn validate(&self, dest: &Destination) -> CoreResult<()>;
    fn open(&self, dest: &Destination) -> CoreResult<Box<dyn TransferSink>>;
}

/// Writes straight to a filesystem path.
#[derive(Debug, Clone)]
pub struct DirectFileProvider {
    shared_root: PathBuf,
}

impl DirectFileProvider {
    pub fn new(shared_root: impl Into<PathBuf>) -> Self {
        Self {
            shared_root: shared_root.into(),
        }
    }

    /// Resolve the target file. Shared-storage descriptors without an explicit
    /// legacy path land under `<shared_root>/<category>/<relative>/<name>`.
    pub fn target_path(&self, dest: &Destination) -> CoreResult<PathBuf> {
        match dest {
            Destination::DirectFile { path } => Ok(PathBuf::from(path)),
            Destination::SharedStorage {
                display_name,
                category,
                relative_path,
                legacy_path,
                ..
            } => {
                if let Some(path) = legacy_path {
                    return Ok(PathBuf::from(path));
                }
                Ok(shared_file_path(
                    &self.shared_root,
                    *category,
                    relative_path.as_deref(),
                    display_name,
                ))
            }
        }
    }
}

fn shared_file_path(
    root: &Path,
    category: StorageCategory,
    relative_path: Option<&str>,
    display_name: &str,
) -> PathBuf {
    let mut path = root.join(category.dir_name());
    if let Some(relative) = relative_path {
        for part in relative.split('/') {
            let part = part.trim();
            if part.is_empty() || part == "." || part == ".." {
                continue;
            }
            path.push(part);
        }
    }
    path.push(display_name.trim().replace(['/', '\\'], "_"));
    path
}

impl DestinationProvider for DirectFileProvider {
    fn validate(&self, dest: &Destination) -> CoreResult<()> {
        match dest {
            Destination::DirectFile { path } => validate_file_path(path),
            Destination::SharedStorage {
                display_name,
                legacy_path,
                ..
            } => {
                validate_display_name(display_name)?;
                if let Some(path) = legacy_path {
                    validate_file_path(path)?;
                }
                Ok(())
            }
        }
    }

    fn open(&self, dest: &Destination) -> CoreResult<Box<dyn TransferSink>> {
        let path = self.target_path(dest)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(Box::new(FileSink {
            path,
            writer: Some(BufWriter::new(file)),
        }))
    }
}

struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl TransferSink for FileSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> CoreResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CoreError::InvalidState("file sink already closed".to_string()))?;
        writer
            .write_all(chunk)
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    fn close(&mut self) -> CoreResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|err| CoreError::Io(err.to_string()))?;
        }
        Ok(())
    }

    fn discard(&mut self) -> CoreResult<()> {
        drop(self.writer.take());
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::Io(err.to_string())),
        }
    }
}

/// Registers a record with a [`StorageIndex`] and writes through it.
pub struct SharedStorageProvider {
    index: Arc<dyn StorageIndex>,
    record_timestamps: bool,
}

impl SharedStorageProvider {
    pub fn new(index: Arc<dyn StorageIndex>, platform: &PlatformFlags) -> Self {
        Self {
            index,
            record_timestamps: platform.record_timestamps,
        }
    }

    pub fn metadata(&self, dest: &Destination) -> CoreResult<RecordMetadata> {
        let Destination::SharedStorage {
            display_name,
            category,
            relative_path,
            ..
        } = dest
        else {
            return Err(CoreError::Config(
                "shared storage needs a shared storage destination".to_string(),
            ));
        };
        validate_display_name(display_name)?;
        let relative_path = relative_path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Ok(RecordMetadata {
            display_name: display_name.clone(),
            mime_type: mime_type_for(display_name).to_string(),
            category: *category,
            relative_path,
            date_taken: self.record_timestamps.then(now_millis),
        })
    }

    fn drop_record(&self, record: &RecordRef) {
        if let Err(err) = self.index.delete_record(record) {
            log::warn!("removing record {} failed: {}", record.id, err);
        }
    }
}

impl DestinationProvider for SharedStorageProvider {
    fn validate(&self, dest: &Destination) -> CoreResult<()> {
        self.metadata(dest).map(|_| ())
    }

    fn open(&self, dest: &Destination) -> CoreResult<Box<dyn TransferSink>> {
        let meta = self.metadata(dest)?;
        let volume = if self.index.external_mounted() {
            StorageVolume::External
        } else {
            StorageVolume::Internal
        };
        let record = self
            .index
            .insert_record(volume, &meta)?
            .ok_or_else(|| CoreError::Storage("storage index rejected the record".to_string()))?;
        let writer = match self.index.open_for_write(&record) {
            Ok(Some(writer)) => writer,
            Ok(None) => {
                self.drop_record(&record);
                return Err(CoreError::Storage(
                    "storage index returned no writable handle".to_string(),
                ));
            }
            Err(err) => {
                self.drop_record(&record);
                return Err(err);
            }
        };
        log::debug!(
            "registered {} record {} for {}",
            volume.as_str(),
            record.id,
            meta.display_name
        );
        Ok(Box::new(RecordSink {
            index: Arc::clone(&self.index),
            record,
            writer: Some(writer),
        }))
    }
}

struct RecordSink {
    index: Arc<dyn StorageIndex>,
    record: RecordRef,
    writer: Option<Box<dyn Write + Send>>,
}

impl TransferSink for RecordSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> CoreResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CoreError::InvalidState("record sink already closed".to_string()))?;
        writer
            .write_all(chunk)
            .map_err(|err| CoreError::Io(err.to_string()))?;
        writer.flush().map_err(|err| CoreError::Io(err.to_string()))
    }

    fn close(&mut self) -> CoreResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|err| CoreError::Io(err.to_string()))?;
        }
        Ok(())
    }

    fn discard(&mut self) -> CoreResult<()> {
        drop(self.writer.take());
        self.index.delete_record(&self.record)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
