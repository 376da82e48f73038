use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::config::{EngineConfig, PlatformFlags};
use crate::destination::{DestinationProvider, DirectFileProvider, TransferSink};
use crate::error::{CoreError, CoreResult};
use crate::manager::TransferManager;
use crate::net::{HttpClient, TransferRequest, TransferResponse};
use crate::progress::Progress;
use crate::storage::{MemoryStorageIndex, StorageIndex, VolumeLayout};
use crate::task::{Destination, StorageCategory, TransferConfig, TransferOutcome, TransferStatus};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

struct FakeHttp {
    responses: Mutex<HashMap<String, TransferResponse>>,
    fetches: Arc<AtomicUsize>,
}

impl FakeHttp {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let http = Self {
            responses: Mutex::new(HashMap::new()),
            fetches: Arc::clone(&fetches),
        };
        (http, fetches)
    }

    fn respond(self, url: &str, response: TransferResponse) -> Self {
        self.responses
            .lock()
            .expect("responses")
            .insert(url.to_string(), response);
        self
    }
}

impl HttpClient for FakeHttp {
    fn fetch(&self, req: &TransferRequest) -> CoreResult<TransferResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .map_err(|_| CoreError::Transport("fake lock poisoned".to_string()))?
            .remove(&req.url)
            .ok_or_else(|| CoreError::Transport(format!("connection refused: {}", req.url)))
    }
}

/// Body whose chunks are released by the test; ends when the sender drops.
struct GatedBody {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl GatedBody {
    fn new() -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel();
        (
            tx,
            Self {
                rx,
                pending: Vec::new(),
                pos: 0,
            },
        )
    }
}

impl Read for GatedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Direct-file provider that counts sink writes.
struct CountingProvider {
    inner: DirectFileProvider,
    writes: Arc<AtomicUsize>,
}

struct CountingSink {
    inner: Box<dyn TransferSink>,
    writes: Arc<AtomicUsize>,
}

impl TransferSink for CountingSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> CoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_chunk(chunk)
    }

    fn close(&mut self) -> CoreResult<()> {
        self.inner.close()
    }

    fn discard(&mut self) -> CoreResult<()> {
        self.inner.discard()
    }
}

impl DestinationProvider for CountingProvider {
    fn validate(&self, dest: &Destination) -> CoreResult<()> {
        self.inner.validate(dest)
    }

    fn open(&self, dest: &Destination) -> CoreResult<Box<dyn TransferSink>> {
        Ok(Box::new(CountingSink {
            inner: self.inner.open(dest)?,
            writes: Arc::clone(&self.writes),
        }))
    }
}

#[derive(Clone, Default)]
struct Calls {
    progress: Arc<Mutex<Vec<Progress>>>,
    successes: Arc<AtomicUsize>,
    failures: Arc<Mutex<Vec<String>>>,
}

impl Calls {
    fn attach(&self, config: TransferConfig) -> TransferConfig {
        let progress = Arc::clone(&self.progress);
        let successes = Arc::clone(&self.successes);
        let failures = Arc::clone(&self.failures);
        config
            .on_progress(move |value| progress.lock().expect("progress").push(value))
            .on_success(move || {
                successes.fetch_add(1, Ordering::SeqCst);
            })
            .on_failure(move |err| failures.lock().expect("failures").push(err.to_string()))
    }

    fn progress(&self) -> Vec<Progress> {
        self.progress.lock().expect("progress").clone()
    }

    fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    fn failures(&self) -> Vec<String> {
        self.failures.lock().expect("failures").clone()
    }
}

fn scratch_dir() -> PathBuf {
    let dir = env::temp_dir().join(format!("xfer-test-{}", Uuid::new_v4()));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

fn engine_config(root: &Path, chunk_size: usize) -> EngineConfig {
    EngineConfig {
        chunk_size,
        shared_root: root.to_path_buf(),
        ..EngineConfig::default()
    }
}

fn manager(root: &Path, chunk_size: usize, http: FakeHttp) -> TransferManager {
    TransferManager::new(engine_config(root, chunk_size))
        .expect("manager")
        .with_http_client(Box::new(http))
}

fn file_destination(path: &Path) -> Destination {
    Destination::file(path.to_string_lossy().to_string())
}

#[test]
fn test_direct_file_transfer_of_two_chunks() {
    let dir = scratch_dir();
    let url = "https://example.com/two-chunks.bin";
    let body: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    let (http, fetches) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(Cursor::new(body.clone()), 2048));
    let writes = Arc::new(AtomicUsize::new(0));
    let manager = manager(&dir, 1024, http).with_direct_provider(Arc::new(CountingProvider {
        inner: DirectFileProvider::new(&dir),
        writes: Arc::clone(&writes),
    }));

    let target = dir.join("out").join("two-chunks.bin");
    let calls = Calls::default();
    let handle = manager
        .submit(calls.attach(TransferConfig::new(url, file_destination(&target))))
        .expect("submit");
    let outcome = handle.wait();

    assert!(matches!(outcome, TransferOutcome::Completed { bytes: 2048 }));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(writes.load(Ordering::SeqCst), 2);
    assert_eq!(
        calls.progress(),
        vec![Progress::Ratio(0.5), Progress::Ratio(1.0), Progress::COMPLETE]
    );
    assert_eq!(calls.successes(), 1);
    assert!(calls.failures().is_empty());
    assert_eq!(fs::read(&target).expect("read output"), body);

    manager.wait_all();
    assert_eq!(manager.status(url), None);
    manager.pause(url, true);
    manager.cancel(url);
    assert!(!manager.registry().is_paused(url));
    assert!(!manager.registry().is_cancel_requested(url));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_progress_is_monotonic_and_counts_chunks() {
    let dir = scratch_dir();
    let url = "https://example.com/odd.bin";
    let len = 5000usize;
    let (http, _) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(Cursor::new(vec![3u8; len]), len as i64));
    let manager = manager(&dir, 1024, http);

    let calls = Calls::default();
    let outcome = manager
        .submit(calls.attach(TransferConfig::new(url, file_destination(&dir.join("odd.bin")))))
        .expect("submit")
        .wait();

    assert!(matches!(outcome, TransferOutcome::Completed { bytes: 5000 }));
    let progress = calls.progress();
    assert_eq!(progress.len(), len.div_ceil(1024) + 1);
    let ratios: Vec<f32> = progress.iter().filter_map(Progress::ratio).collect();
    assert!(ratios.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(progress.last(), Some(&Progress::COMPLETE));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_illegal_path_is_rejected_before_network() {
    let dir = scratch_dir();
    let (http, fetches) = FakeHttp::new();
    let manager = manager(&dir, 1024, http);
    let calls = Calls::default();

    let result = manager.submit(calls.attach(TransferConfig::new(
        "https://example.com/file.bin",
        Destination::file("bad path!"),
    )));

    assert!(matches!(result, Err(CoreError::Config(_))));
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    assert!(manager.active_transfers().is_empty());
    assert!(calls.failures().is_empty());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_empty_url_is_rejected() {
    let dir = scratch_dir();
    let (http, fetches) = FakeHttp::new();
    let manager = manager(&dir, 1024, http);
    let result = manager.submit(TransferConfig::new("  ", Destination::file("a.bin")));
    assert!(matches!(result, Err(CoreError::Config(_))));
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_cancel_before_first_chunk_leaves_no_output() {
    let dir = scratch_dir();
    let url = "https://example.com/cancel-early.bin";
    let (tx, body) = GatedBody::new();
    let (http, _) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(body, 4096));
    let manager = manager(&dir, 1024, http);

    let target = dir.join("cancel-early.bin");
    let calls = Calls::default();
    let handle = manager
        .submit(calls.attach(TransferConfig::new(url, file_destination(&target))))
        .expect("submit");
    manager.cancel(url);
    tx.send(vec![1u8; 1024]).expect("feed");
    drop(tx);

    assert!(matches!(handle.wait(), TransferOutcome::Cancelled));
    assert!(!target.exists());
    assert!(calls.progress().is_empty());
    assert_eq!(calls.successes(), 0);
    assert!(calls.failures().is_empty());
    assert_eq!(manager.status(url), None);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_blank_display_name_is_rejected() {
    let dir = scratch_dir();
    for platform in [PlatformFlags::scoped_storage(), PlatformFlags::default()] {
        let (http, fetches) = FakeHttp::new();
        let config = EngineConfig {
            platform,
            ..engine_config(&dir, 1024)
        };
        let manager = TransferManager::new(config)
            .expect("manager")
            .with_http_client(Box::new(http));
        let result = manager.submit(TransferConfig::new(
            "https://example.com/pic.png",
            Destination::shared(" ", StorageCategory::Pictures),
        ));
        assert!(matches!(result, Err(CoreError::Config(_))));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_unknown_length_reports_indeterminate_progress() {
    let dir = scratch_dir();
    let url = "https://example.com/chunked";
    let (http, _) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(Cursor::new(vec![5u8; 2000]), -1));
    let manager = manager(&dir, 1024, http);

    let calls = Calls::default();
    let outcome = manager
        .submit(calls.attach(TransferConfig::new(url, file_destination(&dir.join("chunked.bin")))))
        .expect("submit")
        .wait();

    assert!(matches!(outcome, TransferOutcome::Completed { bytes: 2000 }));
    assert_eq!(
        calls.progress(),
        vec![
            Progress::Indeterminate { bytes: 1024 },
            Progress::Indeterminate { bytes: 2000 },
            Progress::COMPLETE,
        ]
    );
    assert_eq!(calls.successes(), 1);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_transport_failure_skips_the_loop() {
    let dir = scratch_dir();
    let url = "https://unreachable.example/file.bin";
    let (http, fetches) = FakeHttp::new();
    let manager = manager(&dir, 1024, http);

    let target = dir.join("never.bin");
    let calls = Calls::default();
    let outcome = manager
        .submit(calls.attach(TransferConfig::new(url, file_destination(&target))))
        .expect("submit")
        .wait();

    assert!(matches!(outcome, TransferOutcome::Failed(CoreError::Transport(_))));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(calls.failures().len(), 1);
    assert_eq!(calls.successes(), 0);
    assert!(calls.progress().is_empty());
    assert!(!target.exists());
    assert_eq!(manager.status(url), None);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_empty_body_is_a_stream_error() {
    let dir = scratch_dir();
    let url = "https://example.com/empty";
    let (http, _) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(Cursor::new(Vec::<u8>::new()), 0));
    let manager = manager(&dir, 1024, http);

    let target = dir.join("empty.bin");
    let calls = Calls::default();
    let outcome = manager
        .submit(calls.attach(TransferConfig::new(url, file_destination(&target))))
        .expect("submit")
        .wait();

    assert!(matches!(outcome, TransferOutcome::Failed(CoreError::Stream(_))));
    assert_eq!(calls.failures().len(), 1);
    assert!(!target.exists());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_pause_holds_progress_and_resume_continues() {
    let dir = scratch_dir();
    let url = "https://example.com/paused.bin";
    let (tx, body) = GatedBody::new();
    let (http, _) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(body, 12));
    let manager = manager(&dir, 4, http);

    let (progress_tx, progress_rx) = mpsc::channel();
    let progress_tx = Mutex::new(progress_tx);
    let target = dir.join("paused.bin");
    let config = TransferConfig::new(url, file_destination(&target)).on_progress(move |value| {
        let _ = progress_tx.lock().expect("progress sender").send(value);
    });

    tx.send(b"aaaa".to_vec()).expect("feed");
    let handle = manager.submit(config).expect("submit");
    assert_eq!(progress_rx.recv_timeout(WAIT), Ok(Progress::Ratio(0.33)));

    manager.pause(url, true);
    assert_eq!(manager.status(url), Some(TransferStatus::Paused));
    tx.send(b"bbbb".to_vec()).expect("feed");
    assert!(progress_rx.recv_timeout(QUIET).is_err());
    assert!(handle.try_outcome().is_none());
    assert!(handle.wait_timeout(QUIET).is_none());

    manager.resume(url);
    assert_eq!(progress_rx.recv_timeout(WAIT), Ok(Progress::Ratio(0.67)));
    tx.send(b"cccc".to_vec()).expect("feed");
    assert_eq!(progress_rx.recv_timeout(WAIT), Ok(Progress::Ratio(1.0)));
    drop(tx);

    assert!(matches!(
        handle.wait_timeout(WAIT),
        Some(TransferOutcome::Completed { bytes: 12 })
    ));
    assert_eq!(progress_rx.recv_timeout(WAIT), Ok(Progress::COMPLETE));
    assert_eq!(fs::read(&target).expect("read output"), b"aaaabbbbcccc");
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_cancel_while_paused_removes_partial_file() {
    let dir = scratch_dir();
    let url = "https://example.com/pause-then-cancel.bin";
    let (tx, body) = GatedBody::new();
    let (http, _) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(body, 12));
    let manager = manager(&dir, 4, http);

    let (progress_tx, progress_rx) = mpsc::channel();
    let progress_tx = Mutex::new(progress_tx);
    let target = dir.join("pause-then-cancel.bin");
    let calls = Calls::default();
    let config = calls
        .attach(TransferConfig::new(url, file_destination(&target)))
        .on_progress(move |value| {
            let _ = progress_tx.lock().expect("progress sender").send(value);
        });

    tx.send(b"aaaa".to_vec()).expect("feed");
    let handle = manager.submit(config).expect("submit");
    assert!(progress_rx.recv_timeout(WAIT).is_ok());
    manager.pause(url, true);
    tx.send(b"bbbb".to_vec()).expect("feed");
    assert!(progress_rx.recv_timeout(QUIET).is_err());
    assert!(target.exists());

    manager.cancel(url);
    manager.cancel(url);
    assert!(matches!(handle.wait(), TransferOutcome::Cancelled));
    assert!(!target.exists());
    assert_eq!(calls.successes(), 0);
    assert!(calls.failures().is_empty());
    assert_eq!(manager.status(url), None);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_shared_storage_transfer_registers_record() {
    let dir = scratch_dir();
    let url = "https://example.com/song";
    let (http, _) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(Cursor::new(vec![8u8; 3000]), 3000));
    let index = Arc::new(MemoryStorageIndex::new(VolumeLayout::new(
        dir.join("sdcard"),
        dir.join("internal"),
    )));
    fs::create_dir_all(dir.join("sdcard")).expect("mount external");
    let config = EngineConfig {
        platform: PlatformFlags::scoped_storage(),
        ..engine_config(&dir, 1024)
    };
    let manager = TransferManager::new(config)
        .expect("manager")
        .with_http_client(Box::new(http))
        .with_storage_index(index.clone());

    let calls = Calls::default();
    let dest = Destination::shared("song.mp3", StorageCategory::Music).with_relative_path("Live");
    let outcome = manager
        .submit(calls.attach(TransferConfig::new(url, dest)))
        .expect("submit")
        .wait();

    assert!(matches!(outcome, TransferOutcome::Completed { bytes: 3000 }));
    let records = index.list_records().expect("records");
    assert_eq!(records.len(), 1);
    let (record, meta) = &records[0];
    assert_eq!(meta.mime_type, "audio/mpeg");
    assert_eq!(meta.relative_path.as_deref(), Some("Live"));
    let path = index.record_path(record).expect("path").expect("known");
    assert_eq!(path, dir.join("sdcard").join("Music").join("Live").join("song.mp3"));
    assert_eq!(fs::read(&path).expect("read record").len(), 3000);
    assert_eq!(calls.successes(), 1);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_shared_storage_cancel_deletes_record() {
    let dir = scratch_dir();
    let url = "https://example.com/clip";
    let (tx, body) = GatedBody::new();
    let (http, _) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(body, 8));
    let index = Arc::new(MemoryStorageIndex::new(VolumeLayout::new(
        dir.join("sdcard"),
        dir.join("internal"),
    )));
    let config = EngineConfig {
        platform: PlatformFlags::scoped_storage(),
        ..engine_config(&dir, 4)
    };
    let manager = TransferManager::new(config)
        .expect("manager")
        .with_http_client(Box::new(http))
        .with_storage_index(index.clone());

    let (progress_tx, progress_rx) = mpsc::channel();
    let progress_tx = Mutex::new(progress_tx);
    let dest = Destination::shared("clip.mp4", StorageCategory::Movies);
    let config = TransferConfig::new(url, dest).on_progress(move |value| {
        let _ = progress_tx.lock().expect("progress sender").send(value);
    });

    tx.send(b"1234".to_vec()).expect("feed");
    let handle = manager.submit(config).expect("submit");
    assert_eq!(progress_rx.recv_timeout(WAIT), Ok(Progress::Ratio(0.5)));
    assert_eq!(index.list_records().expect("records").len(), 1);

    manager.cancel(url);
    tx.send(b"5678".to_vec()).expect("feed");
    assert!(matches!(handle.wait(), TransferOutcome::Cancelled));
    assert!(index.list_records().expect("records").is_empty());
    assert!(!dir.join("internal").join("Movies").join("clip.mp4").exists());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_legacy_override_writes_plain_file() {
    let dir = scratch_dir();
    let url = "https://example.com/legacy";
    let (http, _) = FakeHttp::new();
    let http = http.respond(url, TransferResponse::new(Cursor::new(vec![1u8; 10]), 10));
    let index = Arc::new(MemoryStorageIndex::new(VolumeLayout::new(
        dir.join("sdcard"),
        dir.join("internal"),
    )));
    let config = EngineConfig {
        platform: PlatformFlags {
            legacy_override_allowed: true,
            ..PlatformFlags::scoped_storage()
        },
        ..engine_config(&dir, 1024)
    };
    let manager = TransferManager::new(config)
        .expect("manager")
        .with_http_client(Box::new(http))
        .with_storage_index(index.clone());

    let dest = Destination::shared("notes.txt", StorageCategory::Downloads).with_legacy_path(None);
    let outcome = manager
        .submit(TransferConfig::new(url, dest))
        .expect("submit")
        .wait();

    assert!(matches!(outcome, TransferOutcome::Completed { bytes: 10 }));
    assert!(index.list_records().expect("records").is_empty());
    assert_eq!(
        fs::read(dir.join("Download").join("notes.txt")).expect("read legacy file"),
        vec![1u8; 10]
    );
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_cancel_all_stops_every_transfer() {
    let dir = scratch_dir();
    let urls = ["https://a.example/one.bin", "https://b.example/two.bin"];
    let (mut http, _) = FakeHttp::new();
    let mut feeds = Vec::new();
    for url in urls {
        let (tx, body) = GatedBody::new();
        http = http.respond(url, TransferResponse::new(body, 16));
        feeds.push(tx);
    }
    let manager = manager(&dir, 4, http);

    let mut handles = Vec::new();
    let mut targets = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        let target = dir.join(format!("part{}.bin", i));
        feeds[i].send(vec![0u8; 4]).expect("feed");
        handles.push(
            manager
                .submit(TransferConfig::new(*url, file_destination(&target)))
                .expect("submit"),
        );
        targets.push(target);
    }

    manager.pause_all(true);
    for url in urls {
        assert!(manager.registry().is_paused(url));
    }
    manager.cancel_all();
    for tx in &feeds {
        let _ = tx.send(vec![0u8; 4]);
    }
    drop(feeds);

    for handle in handles {
        assert!(matches!(handle.wait(), TransferOutcome::Cancelled));
    }
    for target in targets {
        assert!(!target.exists());
    }
    assert!(manager.active_transfers().is_empty());
    manager.wait_all();
    let _ = fs::remove_dir_all(&dir);
}
