use crate::transport::UsbBulk;
use async_trait::async_trait;
use std::fs::File as StdFile;
use std::io;
use std::os::fd::OwnedFd;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

/// Bulk endpoint pair backed by FunctionFS endpoint file descriptors.
///
/// One `read` on an endpoint fd completes exactly one bulk transfer, and a
/// `write` submits one, which is precisely the packet contract the responder
/// needs. The interrupt IN endpoint is kept open so the interface stays
/// configured, but the responder does not emit events through it.
pub struct FunctionfsEndpoints {
    bulk_in: Mutex<File>,
    bulk_out: Mutex<File>,
    #[allow(dead_code)]
    interrupt_in: Mutex<File>,
    max_packet: usize,
}

impl FunctionfsEndpoints {
    pub fn new(
        bulk_in: OwnedFd,
        bulk_out: OwnedFd,
        interrupt_in: OwnedFd,
        max_packet: usize,
    ) -> io::Result<Self> {
        Ok(Self {
            bulk_in: Mutex::new(to_tokio_file(bulk_in)),
            bulk_out: Mutex::new(to_tokio_file(bulk_out)),
            interrupt_in: Mutex::new(to_tokio_file(interrupt_in)),
            max_packet,
        })
    }
}

#[async_trait]
impl UsbBulk for FunctionfsEndpoints {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.bulk_out.lock().await;
        let read = file.read(buf).await?;
        trace!(requested = buf.len(), read, "bulk OUT transfer");
        Ok(read)
    }

    async fn write_packet(&self, buf: &[u8]) -> io::Result<()> {
        let mut file = self.bulk_in.lock().await;
        if buf.is_empty() {
            // Zero-length terminator: submit an empty transfer.
            file.write(&[]).await?;
        } else {
            file.write_all(buf).await?;
        }
        file.flush().await?;
        trace!(written = buf.len(), "bulk IN transfer");
        Ok(())
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet
    }
}

fn to_tokio_file(fd: OwnedFd) -> File {
    File::from_std(StdFile::from(fd))
}
