use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
#[cfg(feature = "sqlite")]
use std::sync::PoisonError;
#[cfg(feature = "sqlite")]
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::task::StorageCategory;

#[cfg(feature = "sqlite")]
use rusqlite::{params, OptionalExtension, TransactionBehavior};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StorageVolume {
    External,
    Internal,
}

impl StorageVolume {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageVolume::External => "external",
            StorageVolume::Internal => "internal",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "external" => Some(StorageVolume::External),
            "internal" => Some(StorageVolume::Internal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordMetadata {
    pub display_name: String,
    pub mime_type: String,
    pub category: StorageCategory,
    pub relative_path: Option<String>,
    /// Creation time in epoch milliseconds.
    pub date_taken: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub id: Uuid,
    pub volume: StorageVolume,
}

/// Indexed shared storage. Content must be registered as a record before a
/// writable handle can be obtained for it.
pub trait StorageIndex: Send + Sync {
    fn external_mounted(&self) -> bool;
    fn insert_record(
        &self,
        volume: StorageVolume,
        meta: &RecordMetadata,
    ) -> CoreResult<Option<RecordRef>>;
    fn open_for_write(&self, record: &RecordRef) -> CoreResult<Option<Box<dyn Write + Send>>>;
    fn delete_record(&self, record: &RecordRef) -> CoreResult<()>;
    fn record_path(&self, record: &RecordRef) -> CoreResult<Option<PathBuf>>;
    fn list_records(&self) -> CoreResult<Vec<(RecordRef, RecordMetadata)>>;
}

/// Where record content lands on disk for each volume.
#[derive(Debug, Clone)]
pub struct VolumeLayout {
    pub external_root: PathBuf,
    pub internal_root: PathBuf,
}

impl VolumeLayout {
    pub fn new(external_root: impl Into<PathBuf>, internal_root: impl Into<PathBuf>) -> Self {
        Self {
            external_root: external_root.into(),
            internal_root: internal_root.into(),
        }
    }

    pub fn external_mounted(&self) -> bool {
        self.external_root.is_dir()
    }

    pub fn root(&self, volume: StorageVolume) -> &Path {
        match volume {
            StorageVolume::External => &self.external_root,
            StorageVolume::Internal => &self.internal_root,
        }
    }

    fn directory_for(&self, volume: StorageVolume, meta: &RecordMetadata) -> PathBuf {
        let mut dir = self.root(volume).join(meta.category.dir_name());
        if let Some(relative) = meta.relative_path.as_deref() {
            for part in relative.split('/') {
                let part = part.trim();
                if part.is_empty() || part == "." || part == ".." {
                    continue;
                }
                dir.push(part);
            }
        }
        dir
    }

    /// Pick a free path for a new record, suffixing ` (n)` on collisions.
    pub fn allocate(
        &self,
        volume: StorageVolume,
        meta: &RecordMetadata,
        taken: &dyn Fn(&Path) -> bool,
    ) -> PathBuf {
        let dir = self.directory_for(volume, meta);
        let name = sanitize_display_name(&meta.display_name);
        let candidate = dir.join(&name);
        if !candidate.exists() && !taken(&candidate) {
            return candidate;
        }
        let (stem, ext) = split_extension(&name);
        let mut counter = 1u32;
        loop {
            let file_name = match ext {
                Some(ext) => format!("{} ({}).{}", stem, counter, ext),
                None => format!("{} ({})", stem, counter),
            };
            let candidate = dir.join(file_name);
            if !candidate.exists() && !taken(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }
}

fn sanitize_display_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '\0' => '_',
            _ => ch,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "download.bin".to_string()
    } else {
        cleaned
    }
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

/// MIME type guessed from a display name's extension.
pub fn mime_type_for(display_name: &str) -> &'static str {
    let ext = match split_extension(display_name.trim()) {
        (_, Some(ext)) => ext.to_ascii_lowercase(),
        _ => return "application/octet-stream",
    };
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "3gp" => "video/3gpp",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "wav" => "audio/x-wav",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "apk" => "application/vnd.android.package-archive",
        _ => "application/octet-stream",
    }
}

fn create_record_file(path: &Path) -> CoreResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
        }
    }
    File::create(path).map_err(|err| CoreError::Io(err.to_string()))
}

fn remove_record_file(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CoreError::Io(err.to_string())),
    }
}

#[derive(Debug, Clone)]
struct MemoryRecord {
    meta: RecordMetadata,
    path: PathBuf,
}

/// Record table kept in memory, content stored under a [`VolumeLayout`].
pub struct MemoryStorageIndex {
    layout: VolumeLayout,
    records: Mutex<HashMap<RecordRef, MemoryRecord>>,
}

impl MemoryStorageIndex {
    pub fn new(layout: VolumeLayout) -> Self {
        Self {
            layout,
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl StorageIndex for MemoryStorageIndex {
    fn external_mounted(&self) -> bool {
        self.layout.external_mounted()
    }

    fn insert_record(
        &self,
        volume: StorageVolume,
        meta: &RecordMetadata,
    ) -> CoreResult<Option<RecordRef>> {
        if meta.display_name.trim().is_empty() {
            return Ok(None);
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| CoreError::Storage("record lock poisoned".to_string()))?;
        let path = self.layout.allocate(volume, meta, &|candidate| {
            records.values().any(|record| record.path == candidate)
        });
        let record = RecordRef {
            id: Uuid::new_v4(),
            volume,
        };
        records.insert(
            record,
            MemoryRecord {
                meta: meta.clone(),
                path,
            },
        );
        Ok(Some(record))
    }

    fn open_for_write(&self, record: &RecordRef) -> CoreResult<Option<Box<dyn Write + Send>>> {
        let Some(path) = self.record_path(record)? else {
            return Ok(None);
        };
        let file = create_record_file(&path)?;
        Ok(Some(Box::new(file)))
    }

    fn delete_record(&self, record: &RecordRef) -> CoreResult<()> {
        let removed = self
            .records
            .lock()
            .map_err(|_| CoreError::Storage("record lock poisoned".to_string()))?
            .remove(record);
        if let Some(entry) = removed {
            remove_record_file(&entry.path)?;
        }
        Ok(())
    }

    fn record_path(&self, record: &RecordRef) -> CoreResult<Option<PathBuf>> {
        let records = self
            .records
            .lock()
            .map_err(|_| CoreError::Storage("record lock poisoned".to_string()))?;
        Ok(records.get(record).map(|entry| entry.path.clone()))
    }

    fn list_records(&self) -> CoreResult<Vec<(RecordRef, RecordMetadata)>> {
        let records = self
            .records
            .lock()
            .map_err(|_| CoreError::Storage("record lock poisoned".to_string()))?;
        Ok(records
            .iter()
            .map(|(record, entry)| (*record, entry.meta.clone()))
            .collect())
    }
}

/// Record table in SQLite. Path allocation and the insert are serialized so
/// concurrent records with the same name get distinct suffixes.
#[cfg(feature = "sqlite")]
pub struct SqliteStorageIndex {
    pub path: String,
    layout: VolumeLayout,
    insert_lock: Mutex<()>,
}

#[cfg(feature = "sqlite")]
impl SqliteStorageIndex {
    pub fn new(path: impl Into<String>, layout: VolumeLayout) -> CoreResult<Self> {
        let index = Self {
            path: path.into(),
            layout,
            insert_lock: Mutex::new(()),
        };
        index.init()?;
        Ok(index)
    }

    fn conn(&self) -> CoreResult<rusqlite::Connection> {
        let conn = rusqlite::Connection::open(&self.path)
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(conn)
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                volume TEXT NOT NULL,
                display_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                category TEXT NOT NULL,
                relative_path TEXT,
                date_taken INTEGER,
                path TEXT NOT NULL UNIQUE
            );
            ",
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn path_taken(conn: &rusqlite::Connection, candidate: &Path) -> bool {
        conn.query_row(
            "SELECT 1 FROM records WHERE path = ?1",
            params![candidate.to_string_lossy()],
            |_| Ok(()),
        )
        .optional()
        .map(|row| row.is_some())
        .unwrap_or(false)
    }
}

#[cfg(feature = "sqlite")]
impl StorageIndex for SqliteStorageIndex {
    fn external_mounted(&self) -> bool {
        self.layout.external_mounted()
    }

    fn insert_record(
        &self,
        volume: StorageVolume,
        meta: &RecordMetadata,
    ) -> CoreResult<Option<RecordRef>> {
        if meta.display_name.trim().is_empty() {
            return Ok(None);
        }
        let _guard = self
            .insert_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let path = self
            .layout
            .allocate(volume, meta, &|candidate| Self::path_taken(&tx, candidate));
        let record = RecordRef {
            id: Uuid::new_v4(),
            volume,
        };
        tx.execute(
            "INSERT INTO records (id, volume, display_name, mime_type, category, relative_path, date_taken, path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id.to_string(),
                volume.as_str(),
                meta.display_name,
                meta.mime_type,
                meta.category.as_str(),
                meta.relative_path,
                meta.date_taken.map(|value| value as i64),
                path.to_string_lossy(),
            ],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        tx.commit()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(Some(record))
    }

    fn open_for_write(&self, record: &RecordRef) -> CoreResult<Option<Box<dyn Write + Send>>> {
        let Some(path) = self.record_path(record)? else {
            return Ok(None);
        };
        let file = create_record_file(&path)?;
        Ok(Some(Box::new(file)))
    }

    fn delete_record(&self, record: &RecordRef) -> CoreResult<()> {
        let path = self.record_path(record)?;
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM records WHERE id = ?1",
            params![record.id.to_string()],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        if let Some(path) = path {
            remove_record_file(&path)?;
        }
        Ok(())
    }

    fn record_path(&self, record: &RecordRef) -> CoreResult<Option<PathBuf>> {
        let conn = self.conn()?;
        let path: Option<String> = conn
            .query_row(
                "SELECT path FROM records WHERE id = ?1",
                params![record.id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(path.map(PathBuf::from))
    }

    fn list_records(&self) -> CoreResult<Vec<(RecordRef, RecordMetadata)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, volume, display_name, mime_type, category, relative_path, date_taken
                 FROM records",
            )
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                ))
            })
            .map_err(|err| CoreError::Storage(err.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, volume, display_name, mime_type, category, relative_path, date_taken) =
                row.map_err(|err| CoreError::Storage(err.to_string()))?;
            let id = Uuid::parse_str(&id).map_err(|err| CoreError::Storage(err.to_string()))?;
            let volume = StorageVolume::from_str(&volume)
                .ok_or_else(|| CoreError::Storage(format!("unknown volume {}", volume)))?;
            let category = StorageCategory::from_str(&category)
                .ok_or_else(|| CoreError::Storage(format!("unknown category {}", category)))?;
            out.push((
                RecordRef { id, volume },
                RecordMetadata {
                    display_name,
                    mime_type,
                    category,
                    relative_path,
                    date_taken: date_taken.map(|value| value as u64),
                },
            ));
        }
        Ok(out)
    }
}
