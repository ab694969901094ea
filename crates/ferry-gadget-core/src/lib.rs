//! Device-side PTP/MTP responder core.
//!
//! The crate is organised around the serve path: a [`UsbServer`] wraps a
//! bulk endpoint pair, [`PtpDataParser`]/[`PtpDataBuilder`] frame containers
//! over it, and the [`PtpResponder`] executes host transactions against a
//! [`FilesystemProxy`], streaming object payloads through the
//! [`transfer`] pipeline. Everything is transport-generic; FunctionFS and an
//! in-memory loopback are provided.

mod error;
mod events;
mod functionfs;
mod heap;
pub mod metrics;
mod parser;
mod responder;
pub mod transfer;
mod transport;
mod vfs;

pub use error::{Error, Result};
pub use events::{EventSink, SessionEvent, MAX_EVENT_PATH};
pub use functionfs::FunctionfsEndpoints;
pub use heap::{ObjectEntry, ObjectHandle, ObjectHeap, ObjectStat};
pub use parser::{Dataset, PtpDataBuilder, PtpDataParser};
pub use responder::{DeviceIdentity, PtpResponder};
pub use transfer::{TransferMode, TransferSink, TransferSource};
pub use transport::{LoopbackUsb, UsbBulk, UsbServer, BULK_MAX_PACKET, BULK_TRANSFER_BUFFER_LEN};
pub use vfs::{DirEntryInfo, FilesystemProxy, FsEntry, Storage, MAX_STORAGES};
