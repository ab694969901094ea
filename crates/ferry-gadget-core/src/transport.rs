use crate::{metrics, Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Size of one device-side bulk transfer buffer. Reads and writes move at
/// most this many bytes per endpoint operation.
pub const BULK_TRANSFER_BUFFER_LEN: usize = 16 * 1024;

/// Bulk max packet size advertised by the high-speed endpoints.
pub const BULK_MAX_PACKET: usize = 512;

/// A USB bulk endpoint pair as seen from the device side.
///
/// `read_packet` returns the bytes of exactly one bulk transfer; a result
/// shorter than `buf` (including zero, for a zero-length packet) marks the
/// end of the current transmission. `write_packet` submits exactly one
/// transfer; an empty `buf` submits a zero-length packet.
#[async_trait]
pub trait UsbBulk: Send + Sync {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_packet(&self, buf: &[u8]) -> io::Result<()>;

    fn max_packet_size(&self) -> usize;
}

/// Cancellable wrapper over a bulk endpoint pair.
///
/// Every call races the cancellation token; a cancelled call reports
/// [`Error::TransportCancelled`] without completing the transfer.
pub struct UsbServer<T> {
    endpoints: Arc<T>,
    cancel: CancellationToken,
}

impl<T> Clone for UsbServer<T> {
    fn clone(&self) -> Self {
        Self {
            endpoints: self.endpoints.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: UsbBulk> UsbServer<T> {
    pub fn new(endpoints: T, cancel: CancellationToken) -> Self {
        Self {
            endpoints: Arc::new(endpoints),
            cancel,
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.endpoints.max_packet_size()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Read one bulk transfer from the host (bulk OUT → device).
    pub async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::TransportCancelled),
            res = self.endpoints.read_packet(buf) => match res {
                Ok(read) => {
                    metrics::observe_bulk_out(read);
                    Ok(read)
                }
                Err(err) => Err(Error::TransportClosed(err)),
            },
        }
    }

    /// Write one bulk transfer to the host (bulk IN → host).
    pub async fn write_packet(&self, buf: &[u8]) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::TransportCancelled),
            res = self.endpoints.write_packet(buf) => match res {
                Ok(()) => {
                    metrics::observe_bulk_in(buf.len());
                    Ok(())
                }
                Err(err) => Err(Error::TransportClosed(err)),
            },
        }
    }
}

/// In-memory bulk endpoint pair with wire-accurate transmission framing.
///
/// Writes accumulate into the current transmission; a chunk that is empty or
/// not a multiple of the max packet size seals it, exactly as a short or
/// zero-length wire packet would. Reads drain one transmission at a time and
/// reproduce the short-packet / zero-length-packet end-of-transmission
/// signals on the other side.
///
/// Used by the test suites and by embedders that want to exercise the
/// responder without gadget hardware.
pub struct LoopbackUsb {
    incoming: Arc<Direction>,
    outgoing: Arc<Direction>,
}

impl LoopbackUsb {
    /// Create a connected (device, host) pair.
    pub fn pair() -> (LoopbackUsb, LoopbackUsb) {
        let a = Arc::new(Direction::new());
        let b = Arc::new(Direction::new());
        (
            LoopbackUsb {
                incoming: a.clone(),
                outgoing: b.clone(),
            },
            LoopbackUsb {
                incoming: b,
                outgoing: a,
            },
        )
    }
}

impl Drop for LoopbackUsb {
    fn drop(&mut self) {
        self.outgoing.close();
        self.incoming.close();
    }
}

#[async_trait]
impl UsbBulk for LoopbackUsb {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let notified = self.incoming.notify.notified();
            {
                let mut queue = self.incoming.queue.lock().unwrap();
                if let Some(front) = queue.front_mut() {
                    if front.pos == front.data.len() {
                        // Exhausted on a packet boundary: deliver the
                        // zero-length terminator.
                        queue.pop_front();
                        return Ok(0);
                    }
                    let n = buf.len().min(front.data.len() - front.pos);
                    buf[..n].copy_from_slice(&front.data[front.pos..front.pos + n]);
                    front.pos += n;
                    if front.pos == front.data.len() && n < buf.len() {
                        queue.pop_front();
                    }
                    return Ok(n);
                }
                if self.incoming.closed.load(Ordering::Acquire) {
                    return Err(io::Error::from(io::ErrorKind::BrokenPipe));
                }
            }
            notified.await;
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> io::Result<()> {
        if self.outgoing.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let mut queue = self.outgoing.queue.lock().unwrap();
        let seals = buf.is_empty() || buf.len() % BULK_MAX_PACKET != 0;
        match queue.back_mut() {
            Some(back) if !back.sealed => {
                back.data.extend_from_slice(buf);
                if seals {
                    back.sealed = true;
                }
            }
            _ => {
                queue.push_back(Transmission {
                    data: buf.to_vec(),
                    pos: 0,
                    sealed: seals,
                });
            }
        }
        drop(queue);
        self.outgoing.notify.notify_waiters();
        Ok(())
    }

    fn max_packet_size(&self) -> usize {
        BULK_MAX_PACKET
    }
}

struct Transmission {
    data: Vec<u8>,
    pos: usize,
    sealed: bool,
}

struct Direction {
    queue: Mutex<VecDeque<Transmission>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Direction {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_packet_marks_end_of_transmission() {
        let (device, host) = LoopbackUsb::pair();
        host.write_packet(&[0xAA; 100]).await.unwrap();

        let mut buf = [0u8; BULK_TRANSFER_BUFFER_LEN];
        let read = device.read_packet(&mut buf).await.unwrap();
        assert_eq!(read, 100);
        assert!(buf[..read].iter().all(|&b| b == 0xAA));
    }

    #[tokio::test]
    async fn exact_multiple_requires_zero_length_terminator() {
        let (device, host) = LoopbackUsb::pair();
        host.write_packet(&[0x5A; 1024]).await.unwrap();
        host.write_packet(&[]).await.unwrap();

        let mut buf = [0u8; 1024];
        assert_eq!(device.read_packet(&mut buf).await.unwrap(), 1024);
        assert_eq!(device.read_packet(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transmission_spans_multiple_full_chunks() {
        let (device, host) = LoopbackUsb::pair();
        host.write_packet(&[1u8; 2048]).await.unwrap();
        host.write_packet(&[2u8; 100]).await.unwrap();

        let mut buf = [0u8; 1024];
        assert_eq!(device.read_packet(&mut buf).await.unwrap(), 1024);
        assert_eq!(device.read_packet(&mut buf).await.unwrap(), 1024);
        let read = device.read_packet(&mut buf).await.unwrap();
        assert_eq!(read, 100);
        assert_eq!(buf[0], 2);
    }

    #[tokio::test]
    async fn cancelled_server_reports_cancellation() {
        let (device, _host) = LoopbackUsb::pair();
        let cancel = CancellationToken::new();
        let server = UsbServer::new(device, cancel.clone());
        cancel.cancel();

        let mut buf = [0u8; 64];
        assert!(matches!(
            server.read_packet(&mut buf).await,
            Err(Error::TransportCancelled)
        ));
    }

    #[tokio::test]
    async fn dropped_peer_closes_transport() {
        let (device, host) = LoopbackUsb::pair();
        drop(host);

        let mut buf = [0u8; 64];
        assert!(device.read_packet(&mut buf).await.is_err());
    }
}
