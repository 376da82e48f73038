use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use xfer_core::config::default_shared_root;
use xfer_core::storage::{MemoryStorageIndex, StorageIndex, VolumeLayout};
use xfer_core::{
    CoreError, Destination, EngineConfig, PlatformFlags, Progress, StorageCategory,
    TransferConfig, TransferManager, TransferOutcome,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let request = match args[1].as_str() {
        "get" => match (args.get(2), args.get(3)) {
            (Some(url), Some(dest)) => Some((url.clone(), Destination::file(dest.clone()))),
            _ => None,
        },
        "share" => parse_share(&args),
        _ => None,
    };
    let Some((url, destination)) = request else {
        print_usage();
        return;
    };

    let manager = match build_manager() {
        Ok(manager) => Arc::new(manager),
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };

    let config = TransferConfig::new(url.clone(), destination)
        .on_progress(print_progress)
        .on_success(|| println!())
        .on_failure(|err| eprintln!("\nfailed: {}", err));

    let handle = match manager.submit(config) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };
    spawn_controls(Arc::clone(&manager), url);

    match handle.wait() {
        TransferOutcome::Completed { bytes } => println!("done: {}", format_bytes(bytes)),
        TransferOutcome::Cancelled => println!("\ncancelled"),
        TransferOutcome::Failed(_) => {}
    }
    manager.wait_all();
}

fn parse_share(args: &[String]) -> Option<(String, Destination)> {
    let url = args.get(2)?.clone();
    let category = StorageCategory::from_str(args.get(3)?)?;
    let display_name = args.get(4)?.clone();
    let mut destination = Destination::shared(display_name, category);
    let mut rest = args.iter().skip(5);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--path" => destination = destination.with_relative_path(rest.next()?.clone()),
            "--legacy" => destination = destination.with_legacy_path(None),
            "--legacy-file" => {
                destination = destination.with_legacy_path(Some(rest.next()?.clone()))
            }
            _ => return None,
        }
    }
    Some((url, destination))
}

fn build_manager() -> Result<TransferManager, CoreError> {
    let mut config = EngineConfig::default();
    if env::var("XFER_SCOPED").map(|v| v == "1").unwrap_or(false) {
        config.platform = PlatformFlags::scoped_storage();
        if env::var("XFER_ALLOW_LEGACY").map(|v| v == "1").unwrap_or(false) {
            config.platform.legacy_override_allowed = true;
        }
    }
    let layout = VolumeLayout::new(
        env::var("XFER_EXTERNAL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_shared_root().join("external")),
        default_shared_root().join("internal"),
    );
    let manager = TransferManager::new(config)?;
    Ok(manager.with_storage_index(build_index(layout)?))
}

fn build_index(layout: VolumeLayout) -> Result<Arc<dyn StorageIndex>, CoreError> {
    if let Ok(path) = env::var("XFER_DB") {
        let index = xfer_core::storage::SqliteStorageIndex::new(path, layout)?;
        return Ok(Arc::new(index));
    }
    Ok(Arc::new(MemoryStorageIndex::new(layout)))
}

fn spawn_controls(manager: Arc<TransferManager>, id: String) {
    // Left detached, a blocking stdin read can outlive the transfer.
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match line.trim() {
                "p" | "pause" => manager.pause(&id, true),
                "r" | "resume" => manager.resume(&id),
                "c" | "cancel" => manager.cancel(&id),
                "s" | "status" => match manager.status(&id) {
                    Some(status) => eprintln!("\n{}", status),
                    None => eprintln!("\nfinished"),
                },
                "" => {}
                other => eprintln!("unknown control {:?} (p/r/c/s)", other),
            }
            if manager.status(&id).is_none() {
                break;
            }
        }
    });
}

fn print_progress(progress: Progress) {
    match progress {
        Progress::Ratio(value) => print!("\r{:>6.2}%", value * 100.0),
        Progress::Indeterminate { bytes } => print!("\r{} received", format_bytes(bytes)),
    }
    let _ = io::stdout().flush();
}

fn print_usage() {
    eprintln!(
        "Usage: xfer-cli <command> [args]\n\
Commands:\n\
  get <url> <dest>                          Download to a file path\n\
  share <url> <category> <name> [options]   Download into shared storage\n\
      category: pictures | movies | music | downloads\n\
      --path <relative>                     Sub-folder inside the category\n\
      --legacy                              Prefer a plain file when allowed\n\
      --legacy-file <path>                  Plain file to use for --legacy\n\
While running, type p (pause), r (resume), c (cancel) or s (status) then Enter.\n\
Environment:\n\
  XFER_SHARED_DIR=/path     Root for shared storage\n\
  XFER_EXTERNAL_DIR=/path   External volume root (used when it exists)\n\
  XFER_DB=/path/to/db       Keep shared storage records in SQLite\n\
  XFER_SCOPED=1             Require the storage index for shared storage\n\
  XFER_ALLOW_LEGACY=1       Honour --legacy when XFER_SCOPED=1\n\
  RUST_LOG=debug            Log verbosity"
    );
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}
