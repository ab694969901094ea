use crate::{Error, Result};
use async_trait::async_trait;
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::io;
use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Alignment required for in-place bulk read destinations.
pub const PAGE_SIZE: usize = 4096;

/// Chunk size the producer drops to while the consumer is saturated. Keeps
/// individual bulk transfers short so host stacks that abort transfers
/// stalled longer than a few seconds never see one.
pub const SLOW_MODE_CHUNK: usize = 1024;

/// Bounded wait for consumer capacity before engaging slow mode.
const STALL_WAIT: Duration = Duration::from_millis(500);

/// Chunks in flight between producer and consumer.
const PIPELINE_DEPTH: usize = 2;

/// Produces payload bytes at increasing offsets.
#[async_trait]
pub trait TransferSource: Send {
    /// Fill `buf` from `offset`, returning the byte count produced. The
    /// destination is always page-aligned at index zero. Returning 0 ends
    /// the transfer early.
    async fn read_chunk(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Called once when the transfer ends before every byte was delivered
    /// (consumer failure, short read, cancellation), so the source can
    /// drain or release its underlying stream.
    async fn abort(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Consumes payload bytes at increasing offsets.
#[async_trait]
pub trait TransferSink: Send {
    async fn write_chunk(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
}

/// Pipeline execution mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    /// Inline read/write loop on the current task.
    SingleThreaded,
    /// Decoupled producer and consumer tasks with back-pressure.
    MultiThreaded,
    /// Single-threaded when the payload fits one buffer, else multi.
    SingleThreadedIfSmaller,
}

/// Move exactly `size` bytes from `source` to `sink`.
///
/// In multi-threaded mode the two sides run as separate tasks joined by a
/// bounded channel of capacity 2. When no capacity appears within 500 ms the
/// producer switches to 1024-byte reads and accumulates locally until the
/// consumer drains ("slow mode"); leaving slow mode flushes the accumulation.
/// The first failing side's error wins, producer first. Cancellation is
/// observed between chunks.
pub async fn transfer<S, K>(
    size: u64,
    source: S,
    sink: K,
    buffer_len: usize,
    mode: TransferMode,
    cancel: CancellationToken,
) -> Result<()>
where
    S: TransferSource + 'static,
    K: TransferSink + 'static,
{
    let buffer_len = buffer_len
        .min(usize::try_from(size).unwrap_or(usize::MAX))
        .max(1);
    let mode = match mode {
        TransferMode::SingleThreadedIfSmaller => {
            if size <= buffer_len as u64 {
                TransferMode::SingleThreaded
            } else {
                TransferMode::MultiThreaded
            }
        }
        other => other,
    };

    match mode {
        TransferMode::SingleThreaded => {
            trace!(size, "single-threaded transfer");
            run_inline(size, source, sink, buffer_len, cancel).await
        }
        TransferMode::MultiThreaded => {
            trace!(size, buffer_len, "multi-threaded transfer");
            run_pipelined(size, source, sink, buffer_len, cancel).await
        }
        TransferMode::SingleThreadedIfSmaller => unreachable!(),
    }
}

async fn run_inline<S, K>(
    size: u64,
    mut source: S,
    mut sink: K,
    buffer_len: usize,
    cancel: CancellationToken,
) -> Result<()>
where
    S: TransferSource,
    K: TransferSink,
{
    let mut offset = 0u64;
    let result = pump_inline(&mut source, &mut sink, size, &mut offset, buffer_len, &cancel).await;
    if offset < size {
        if let Err(err) = source.abort().await {
            trace!(%err, "source cleanup after early exit failed");
        }
    }
    result?;
    ensure_complete(size, offset)
}

async fn pump_inline<S, K>(
    source: &mut S,
    sink: &mut K,
    size: u64,
    offset: &mut u64,
    buffer_len: usize,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: TransferSource,
    K: TransferSink,
{
    let mut buf = PageAlignedBuf::new(buffer_len);
    while *offset < size {
        if cancel.is_cancelled() {
            return Err(Error::TransportCancelled);
        }
        let want = buffer_len.min((size - *offset) as usize);
        let read = source
            .read_chunk(*offset, &mut buf.as_mut_slice()[..want])
            .await?;
        if read == 0 {
            break;
        }
        sink.write_chunk(*offset, &buf.as_slice()[..read]).await?;
        *offset += read as u64;
    }
    Ok(())
}

async fn run_pipelined<S, K>(
    size: u64,
    source: S,
    sink: K,
    buffer_len: usize,
    cancel: CancellationToken,
) -> Result<()>
where
    S: TransferSource + 'static,
    K: TransferSink + 'static,
{
    let (tx, rx) = mpsc::channel::<Chunk>(PIPELINE_DEPTH);
    let produce = tokio::spawn(run_source(size, source, buffer_len, tx, cancel.clone()));
    let consume = tokio::spawn(run_sink(size, sink, rx, cancel));
    let (produced, consumed) = tokio::join!(produce, consume);

    // Producer errors take precedence; a dead consumer shows up on the
    // producer side as a closed channel, not as the root cause.
    produced.map_err(join_error)??;
    let written = consumed.map_err(join_error)??;
    ensure_complete(size, written)
}

struct Chunk {
    offset: u64,
    data: Vec<u8>,
}

async fn run_source<S>(
    size: u64,
    mut source: S,
    buffer_len: usize,
    tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: TransferSource,
{
    let mut offset = 0u64;
    let result = pump_source(&mut source, size, &mut offset, buffer_len, &tx, &cancel).await;
    if offset < size {
        // The consumer bailed or the stream fell short; the source still
        // owns an open stream that must not bleed into the next transfer.
        if let Err(err) = source.abort().await {
            trace!(%err, "source cleanup after early exit failed");
        }
    }
    result
}

async fn pump_source<S>(
    source: &mut S,
    size: u64,
    offset: &mut u64,
    buffer_len: usize,
    tx: &mpsc::Sender<Chunk>,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: TransferSource,
{
    let mut scratch = PageAlignedBuf::new(buffer_len);
    let mut acc: Vec<u8> = Vec::with_capacity(buffer_len);
    let mut acc_offset = 0u64;
    let mut slow = false;

    while *offset < size {
        if cancel.is_cancelled() {
            return Err(Error::TransportCancelled);
        }

        // Wait for consumer capacity, but never longer than the stall bound.
        let permit = match tx.try_reserve() {
            Ok(permit) => Some(permit),
            Err(TrySendError::Closed(())) => break,
            Err(TrySendError::Full(())) => match timeout(STALL_WAIT, tx.reserve()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_closed)) => break,
                Err(_elapsed) => None,
            },
        };

        let now_slow = permit.is_none();
        if now_slow != slow {
            slow = now_slow;
            trace!(slow, offset = *offset, "transfer pacing change");
        }

        let chunk_cap = if slow { SLOW_MODE_CHUNK } else { buffer_len };
        let want = chunk_cap.min((size - *offset) as usize);
        let read = source
            .read_chunk(*offset, &mut scratch.as_mut_slice()[..want])
            .await?;
        if read == 0 {
            break;
        }
        if acc.is_empty() {
            acc_offset = *offset;
        }
        acc.extend_from_slice(&scratch.as_slice()[..read]);
        *offset += read as u64;

        if let Some(permit) = permit {
            permit.send(Chunk {
                offset: acc_offset,
                data: mem::take(&mut acc),
            });
        }
    }

    if !acc.is_empty() {
        // Consumer may already be gone; its own result carries the cause.
        let _ = tx
            .send(Chunk {
                offset: acc_offset,
                data: acc,
            })
            .await;
    }
    Ok(())
}

async fn run_sink<K>(
    size: u64,
    mut sink: K,
    mut rx: mpsc::Receiver<Chunk>,
    cancel: CancellationToken,
) -> Result<u64>
where
    K: TransferSink,
{
    let mut written = 0u64;
    while written < size {
        if cancel.is_cancelled() {
            return Err(Error::TransportCancelled);
        }
        let Some(chunk) = rx.recv().await else {
            break;
        };
        sink.write_chunk(chunk.offset, &chunk.data).await?;
        written += chunk.data.len() as u64;
    }
    Ok(written)
}

fn ensure_complete(expected: u64, actual: u64) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::IncompleteTransfer { expected, actual })
    }
}

fn join_error(err: JoinError) -> Error {
    Error::Filesystem(io::Error::other(format!("transfer task failed: {err}")))
}

/// Page-aligned byte buffer backing transfer chunks, so in-place bulk reads
/// can land directly in it.
pub struct PageAlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for PageAlignedBuf {}
unsafe impl Sync for PageAlignedBuf {}

impl PageAlignedBuf {
    pub fn new(len: usize) -> Self {
        let len = len.max(1);
        let layout = Layout::from_size_align(len, PAGE_SIZE).expect("page-aligned layout");
        // Safety: layout has non-zero size and a valid alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PageAlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, PAGE_SIZE).expect("page-aligned layout");
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}
