//! FunctionFS ep0 event pump and the PTP class control requests.

use anyhow::{anyhow, Context, Result};
use std::fs::File as StdFile;
use std::os::fd::OwnedFd;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

const SETUP_STAGE_LEN: usize = 8;
const FUNCTIONFS_EVENT_SIZE: usize = SETUP_STAGE_LEN + 4;

const USB_DIR_IN: u8 = 0x80;
const USB_TYPE_CLASS: u8 = 0x20;
const USB_RECIP_INTERFACE: u8 = 0x01;
/// bmRequestType of PTP class requests arriving on ep0.
const PTP_CLASS_OUT: u8 = USB_TYPE_CLASS | USB_RECIP_INTERFACE;
const PTP_CLASS_IN: u8 = USB_DIR_IN | USB_TYPE_CLASS | USB_RECIP_INTERFACE;

/// PTP class-specific control requests.
const PTP_REQ_CANCEL: u8 = 0x64;
const PTP_REQ_DEVICE_RESET: u8 = 0x66;
const PTP_REQ_GET_DEVICE_STATUS: u8 = 0x67;

/// Device status payload: wLength 4, code Ok.
const DEVICE_STATUS_OK: [u8; 4] = [0x04, 0x00, 0x01, 0x20];

#[derive(Clone, Copy, Debug)]
pub struct UsbControlRequest {
    pub request_type: u8,
    pub request: u8,
    #[allow(dead_code)]
    pub value: u16,
    #[allow(dead_code)]
    pub index: u16,
    pub length: u16,
}

impl UsbControlRequest {
    fn from_bytes(bytes: [u8; SETUP_STAGE_LEN]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum FunctionfsEvent {
    Bind,
    Unbind,
    Enable,
    Disable,
    Setup(UsbControlRequest),
    Suspend,
    Resume,
}

impl FunctionfsEvent {
    fn from_bytes(bytes: [u8; FUNCTIONFS_EVENT_SIZE]) -> Result<Self> {
        Ok(match bytes[SETUP_STAGE_LEN] {
            0 => FunctionfsEvent::Bind,
            1 => FunctionfsEvent::Unbind,
            2 => FunctionfsEvent::Enable,
            3 => FunctionfsEvent::Disable,
            4 => {
                let mut setup = [0u8; SETUP_STAGE_LEN];
                setup.copy_from_slice(&bytes[..SETUP_STAGE_LEN]);
                FunctionfsEvent::Setup(UsbControlRequest::from_bytes(setup))
            }
            5 => FunctionfsEvent::Suspend,
            6 => FunctionfsEvent::Resume,
            other => return Err(anyhow!("unknown FunctionFS event type {other}")),
        })
    }
}

/// Owns the ep0 file: lifecycle events in, control-request answers out.
pub struct Ep0Monitor {
    ep0: File,
}

impl Ep0Monitor {
    pub fn new(ep0: OwnedFd) -> Self {
        Self {
            ep0: File::from_std(StdFile::from(ep0)),
        }
    }

    async fn next_event(&mut self) -> Result<FunctionfsEvent> {
        let mut buf = [0u8; FUNCTIONFS_EVENT_SIZE];
        self.ep0
            .read_exact(&mut buf)
            .await
            .context("read ep0 event")?;
        FunctionfsEvent::from_bytes(buf)
    }

    /// Pump events until the host enables the interface, answering any
    /// control requests that arrive on the way.
    pub async fn wait_configured(&mut self) -> Result<()> {
        debug!("waiting for host to configure the interface");
        loop {
            let event = self.next_event().await?;
            trace!(?event, "ep0 event");
            match event {
                FunctionfsEvent::Enable => {
                    debug!("interface enabled");
                    return Ok(());
                }
                FunctionfsEvent::Setup(setup) => self.handle_setup(setup).await?,
                _ => {}
            }
        }
    }

    /// Run the ep0 pump until the fd dies. Host detaches bump the reset
    /// counter so the serve loop can drop session state.
    pub async fn pump(mut self, reset: watch::Sender<u64>) -> Result<()> {
        loop {
            let event = self.next_event().await?;
            trace!(?event, "ep0 event");
            match event {
                FunctionfsEvent::Disable | FunctionfsEvent::Unbind => {
                    debug!(?event, "host detached; requesting session reset");
                    reset.send_modify(|count| *count += 1);
                }
                FunctionfsEvent::Setup(setup) => self.handle_setup(setup).await?,
                FunctionfsEvent::Enable => debug!("interface re-enabled"),
                _ => {}
            }
        }
    }

    async fn handle_setup(&mut self, setup: UsbControlRequest) -> Result<()> {
        debug!(
            request = setup.request,
            request_type = setup.request_type,
            length = setup.length,
            "ep0 setup request"
        );
        match (setup.request_type, setup.request) {
            (PTP_CLASS_IN, PTP_REQ_GET_DEVICE_STATUS) => {
                let len = DEVICE_STATUS_OK.len().min(setup.length as usize);
                self.write_ep0(&DEVICE_STATUS_OK[..len])
                    .await
                    .context("reply to GET_DEVICE_STATUS")
            }
            (PTP_CLASS_OUT, PTP_REQ_CANCEL) => {
                // Cancel carries a 6-byte payload (code + transaction id).
                let mut payload = [0u8; 6];
                let len = payload.len().min(setup.length as usize);
                if len > 0 {
                    self.ep0
                        .read_exact(&mut payload[..len])
                        .await
                        .context("read CANCEL payload")?;
                }
                let tid = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
                warn!(tid, "host requested transfer cancel");
                Ok(())
            }
            (PTP_CLASS_OUT, PTP_REQ_DEVICE_RESET) => {
                warn!("host requested device reset");
                self.write_ep0(&[]).await.context("ack DEVICE_RESET")
            }
            (request_type, _) if request_type & USB_DIR_IN == 0 && setup.length == 0 => {
                trace!(request = setup.request, "acknowledging status-only control request");
                self.write_ep0(&[]).await.context("ack control status stage")
            }
            _ => {
                warn!(
                    request = setup.request,
                    request_type = setup.request_type,
                    "unsupported setup request"
                );
                Ok(())
            }
        }
    }

    async fn write_ep0(&mut self, data: &[u8]) -> Result<()> {
        self.ep0.write_all(data).await.context("write ep0 data")?;
        self.ep0.flush().await.context("flush ep0")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_requests_decode_little_endian() {
        let raw = [0xA1, 0x67, 0x01, 0x00, 0x02, 0x00, 0x04, 0x00];
        let setup = UsbControlRequest::from_bytes(raw);
        assert_eq!(setup.request_type, PTP_CLASS_IN);
        assert_eq!(setup.request, PTP_REQ_GET_DEVICE_STATUS);
        assert_eq!(setup.value, 1);
        assert_eq!(setup.index, 2);
        assert_eq!(setup.length, 4);
    }

    #[test]
    fn events_decode_by_type_byte() {
        let mut raw = [0u8; FUNCTIONFS_EVENT_SIZE];
        raw[SETUP_STAGE_LEN] = 2;
        assert!(matches!(
            FunctionfsEvent::from_bytes(raw).unwrap(),
            FunctionfsEvent::Enable
        ));
        raw[SETUP_STAGE_LEN] = 9;
        assert!(FunctionfsEvent::from_bytes(raw).is_err());
    }
}
