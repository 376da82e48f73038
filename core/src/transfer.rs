use std::io::{BufRead, BufReader, ErrorKind, Read};

use crate::destination::TransferSink;
use crate::error::{CoreError, CoreResult};
use crate::net::TransferResponse;
use crate::progress::Progress;
use crate::registry::TaskRegistry;
use crate::task::{TransferCallbacks, TransferOutcome};

enum Drained {
    Finished(u64),
    Cancelled,
}

/// Drains one response body into one sink, honouring the registry's pause and
/// cancel flags for `id` between chunks.
pub struct TransferLoop<'a> {
    id: &'a str,
    registry: &'a TaskRegistry,
    callbacks: &'a TransferCallbacks,
    chunk_size: usize,
}

impl<'a> TransferLoop<'a> {
    pub fn new(
        id: &'a str,
        registry: &'a TaskRegistry,
        callbacks: &'a TransferCallbacks,
        chunk_size: usize,
    ) -> Self {
        Self {
            id,
            registry,
            callbacks,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Run to a terminal state. The registry entry is gone and exactly one
    /// terminal callback (none for a cancel) has fired when this returns.
    pub fn run<F>(&self, response: TransferResponse, open_sink: F) -> TransferOutcome
    where
        F: FnOnce() -> CoreResult<Box<dyn TransferSink>>,
    {
        let outcome = self.drive(response, open_sink);
        self.registry.clear(self.id);
        match &outcome {
            TransferOutcome::Completed { bytes } => {
                log::info!("transfer of {} completed ({} bytes)", self.id, bytes);
                (self.callbacks.on_progress)(Progress::COMPLETE);
                (self.callbacks.on_success)();
            }
            TransferOutcome::Cancelled => {
                log::info!("transfer of {} cancelled", self.id);
            }
            TransferOutcome::Failed(err) => {
                log::error!("transfer of {} failed: {}", self.id, err);
                (self.callbacks.on_failure)(err);
            }
        }
        outcome
    }

    fn drive<F>(&self, response: TransferResponse, open_sink: F) -> TransferOutcome
    where
        F: FnOnce() -> CoreResult<Box<dyn TransferSink>>,
    {
        let declared_len = response.content_length;
        let Some(body) = response.body else {
            return TransferOutcome::Failed(CoreError::Stream(
                "response carries no body".to_string(),
            ));
        };
        let mut reader = BufReader::with_capacity(self.chunk_size, body);
        match reader.fill_buf() {
            Ok(buf) if !buf.is_empty() => {}
            Ok(_) => {
                return TransferOutcome::Failed(CoreError::Stream(
                    "response body is empty".to_string(),
                ))
            }
            Err(err) => return TransferOutcome::Failed(CoreError::Stream(err.to_string())),
        }

        if self.registry.is_cancel_requested(self.id) {
            return TransferOutcome::Cancelled;
        }
        if declared_len <= 0 {
            log::warn!(
                "no content length for {}, progress will be indeterminate",
                self.id
            );
        }

        let mut sink = match open_sink() {
            Ok(sink) => sink,
            Err(err) => return TransferOutcome::Failed(err),
        };

        match self.drain(&mut reader, sink.as_mut(), declared_len) {
            Ok(Drained::Finished(bytes)) => match sink.close() {
                Ok(()) => TransferOutcome::Completed { bytes },
                Err(err) => TransferOutcome::Failed(err),
            },
            Ok(Drained::Cancelled) => self.discard(sink.as_mut()),
            Err(err) => {
                if self.registry.is_cancel_requested(self.id) {
                    return self.discard(sink.as_mut());
                }
                if let Err(close_err) = sink.close() {
                    log::warn!("closing sink for {} failed: {}", self.id, close_err);
                }
                TransferOutcome::Failed(err)
            }
        }
    }

    fn drain(
        &self,
        reader: &mut impl Read,
        sink: &mut dyn TransferSink,
        declared_len: i64,
    ) -> CoreResult<Drained> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut written = 0u64;
        loop {
            let read = read_chunk(reader, &mut buffer)?;
            if read == 0 {
                break;
            }
            if self.registry.is_cancel_requested(self.id) {
                return Ok(Drained::Cancelled);
            }
            if self.registry.wait_while_paused(self.id) {
                return Ok(Drained::Cancelled);
            }
            sink.write_chunk(&buffer[..read])?;
            written += read as u64;
            (self.callbacks.on_progress)(Progress::from_bytes(written, declared_len));
        }
        Ok(Drained::Finished(written))
    }

    fn discard(&self, sink: &mut dyn TransferSink) -> TransferOutcome {
        if let Err(err) = sink.discard() {
            log::warn!("removing partial output of {} failed: {}", self.id, err);
        }
        TransferOutcome::Cancelled
    }
}

/// Fill `buffer` unless the stream ends first. Returns the byte count, zero at
/// end of stream.
fn read_chunk(reader: &mut impl Read, buffer: &mut [u8]) -> CoreResult<usize> {
    let mut filled = 0usize;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(CoreError::Io(err.to_string())),
        }
    }
    Ok(filled)
}
