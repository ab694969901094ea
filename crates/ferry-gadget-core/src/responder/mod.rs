mod props;

use crate::events::{EventSink, SessionEvent};
use crate::heap::{ObjectHandle, ObjectHeap, ObjectStat};
use crate::parser::{Dataset, PtpDataBuilder, PtpDataParser};
use crate::transfer::{self, TransferMode, TransferSink, TransferSource};
use crate::transport::{UsbBulk, UsbServer};
use crate::vfs::FilesystemProxy;
use crate::{metrics, Error, Result};
use async_trait::async_trait;
use ferry_proto::{
    CommandBlock, ContainerType, OperationCode, ResponseBlock, ResponseCode, ALL_STORAGES,
    ASSOCIATION_TYPE_GENERIC_FOLDER, OBJECT_FORMAT_ASSOCIATION, OBJECT_FORMAT_UNDEFINED,
    PARENT_ROOT,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, trace, warn};

/// Buffer size for file payload staging in the transfer pipeline.
const FILE_TRANSFER_BUFFER: usize = 256 * 1024;

/// Identity strings the device reports to the host.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
    pub friendly_name: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "ferry".into(),
            model: "ferry gadget".into(),
            device_version: env!("CARGO_PKG_VERSION").into(),
            serial_number: "00000001".into(),
            friendly_name: "ferry".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Session {
    Closed,
    Open { id: u32 },
}

/// SendObjectInfo state awaiting the matching SendObject.
struct PendingObject {
    storage_id: u32,
    handle: ObjectHandle,
    relative: PathBuf,
    size: u64,
}

/// The PTP transaction state machine.
///
/// One instance serves one host connection: it decodes command containers,
/// executes them against the filesystem proxy, streams data phases through
/// the transfer pipeline, and answers every transaction with a response
/// container. Protocol-level failures become response codes; only
/// cancellation and transport death escape [`PtpResponder::process_request`].
pub struct PtpResponder<T: UsbBulk + 'static> {
    server: UsbServer<T>,
    vfs: Arc<FilesystemProxy>,
    heap: ObjectHeap,
    events: EventSink,
    identity: DeviceIdentity,
    session: Session,
    last_transaction: u32,
    pending: Option<PendingObject>,
}

impl<T: UsbBulk + 'static> PtpResponder<T> {
    pub fn new(
        server: UsbServer<T>,
        vfs: Arc<FilesystemProxy>,
        events: EventSink,
        identity: DeviceIdentity,
    ) -> Self {
        Self {
            server,
            vfs,
            heap: ObjectHeap::new(),
            events,
            identity,
            session: Session::Closed,
            last_transaction: 0,
            pending: None,
        }
    }

    /// True while a host session is open.
    pub fn session_open(&self) -> bool {
        matches!(self.session, Session::Open { .. })
    }

    /// Drop all session state, as after a host detach.
    pub fn reset_session(&mut self) {
        if self.session_open() {
            self.events.emit(SessionEvent::CloseSession);
        }
        self.session = Session::Closed;
        self.pending = None;
        self.heap.clear();
    }

    /// Receive and execute one transaction: command, optional data phase,
    /// response. Returns `Ok` after the response is on the wire; protocol
    /// failures are answered inline and do not surface here.
    pub async fn process_request(&mut self) -> Result<()> {
        let mut parser = PtpDataParser::new(self.server.clone());
        let header = match parser.read_header().await {
            Ok(header) => header,
            // A bare zero-length packet between transactions is noise, not
            // a protocol violation.
            Err(Error::EndOfTransmission) => return Ok(()),
            Err(Error::Protocol(_)) => {
                warn!("unreadable container header; resynchronizing");
                self.drain(&mut parser).await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if header.kind != ContainerType::Command {
            warn!(kind = ?header.kind, code = header.code, "container without a pending command");
            self.drain(&mut parser).await?;
            return self
                .write_response(ResponseCode::GeneralError, header.transaction_id, &[])
                .await;
        }

        let command = if header.payload_len() <= 4 * ferry_proto::MAX_CONTAINER_PARAMS {
            let mut payload = vec![0u8; header.payload_len()];
            match parser.read_buffer(&mut payload).await {
                Ok(()) => CommandBlock::decode(&header, &payload).ok(),
                // A container shorter than its advertised length is as
                // malformed as an oversized one.
                Err(Error::EndOfTransmission) => None,
                Err(err) => return Err(err),
            }
        } else {
            None
        };
        self.drain(&mut parser).await?;
        let Some(command) = command else {
            warn!(code = header.code, length = header.length, "malformed command container");
            return self
                .write_response(ResponseCode::GeneralError, header.transaction_id, &[])
                .await;
        };

        trace!(
            code = command.code,
            transaction_id = command.transaction_id,
            params = command.params.len(),
            "command received"
        );
        metrics::observe_transaction(command.code);
        self.execute_command(command).await
    }

    async fn execute_command(&mut self, command: CommandBlock) -> Result<()> {
        let tid = command.transaction_id;
        let Some(op) = command.operation() else {
            debug!(code = command.code, "unsupported operation");
            return self
                .write_response(ResponseCode::OperationNotSupported, tid, &[])
                .await;
        };

        // Transaction ids are totally ordered within a session; OpenSession
        // resets the sequence.
        if op != OperationCode::OpenSession && self.session_open() {
            let expected = match self.last_transaction {
                u32::MAX => 1,
                last => last + 1,
            };
            if tid != expected {
                warn!(tid, expected, "transaction id out of sequence");
                return self
                    .write_response(ResponseCode::InvalidTransactionId, tid, &[])
                    .await;
            }
            self.last_transaction = tid;
        }

        if op.requires_session() && !self.session_open() {
            return self.write_response(ResponseCode::SessionNotOpen, tid, &[]).await;
        }

        // A pending SendObjectInfo only survives until the next command; any
        // other operation discards it and proceeds normally.
        if self.pending.is_some() && op != OperationCode::SendObject {
            debug!("discarding pending object info");
            self.pending = None;
        }

        let result = self.dispatch(op, &command).await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_terminal() => Err(err),
            Err(err) => {
                let code = err.response_code();
                warn!(op = ?op, %err, response = ?code, "operation failed");
                self.write_response(code, tid, &[]).await
            }
        }
    }

    async fn dispatch(&mut self, op: OperationCode, command: &CommandBlock) -> Result<()> {
        match op {
            OperationCode::GetDeviceInfo => self.get_device_info(command).await,
            OperationCode::OpenSession => self.open_session(command).await,
            OperationCode::CloseSession => self.close_session(command).await,
            OperationCode::GetStorageIds => self.get_storage_ids(command).await,
            OperationCode::GetStorageInfo => self.get_storage_info(command).await,
            OperationCode::GetObjectHandles => self.get_object_handles(command).await,
            OperationCode::GetObjectInfo => self.get_object_info(command).await,
            OperationCode::GetObject => self.get_object(command).await,
            OperationCode::GetPartialObject => self.get_partial_object(command).await,
            OperationCode::DeleteObject => self.delete_object(command).await,
            OperationCode::SendObjectInfo => self.send_object_info(command).await,
            OperationCode::SendObject => self.send_object(command).await,
            OperationCode::MoveObject => self.move_object(command).await,
            OperationCode::GetDevicePropDesc => self.get_device_prop_desc(command).await,
            OperationCode::GetDevicePropValue => self.get_device_prop_value(command).await,
            OperationCode::GetObjectPropsSupported => {
                self.get_object_props_supported(command).await
            }
            OperationCode::GetObjectPropDesc => self.get_object_prop_desc(command).await,
            OperationCode::GetObjectPropValue => self.get_object_prop_value(command).await,
            OperationCode::SetObjectPropValue => self.set_object_prop_value(command).await,
            OperationCode::GetObjectPropList => self.get_object_prop_list(command).await,
        }
    }

    // --- session -----------------------------------------------------------

    async fn open_session(&mut self, command: &CommandBlock) -> Result<()> {
        let session_id = command.param(0);
        if session_id == 0 {
            return Err(Error::Protocol(ResponseCode::InvalidParameter));
        }
        if let Session::Open { id } = self.session {
            return self
                .write_response(ResponseCode::SessionAlreadyOpen, command.transaction_id, &[id])
                .await;
        }
        debug!(session_id, "session opened");
        self.session = Session::Open { id: session_id };
        self.last_transaction = command.transaction_id;
        self.heap.clear();
        self.events.emit(SessionEvent::OpenSession);
        self.ok(command).await
    }

    async fn close_session(&mut self, command: &CommandBlock) -> Result<()> {
        debug!("session closed");
        self.session = Session::Closed;
        self.pending = None;
        self.heap.clear();
        self.events.emit(SessionEvent::CloseSession);
        self.ok(command).await
    }

    // --- device & storage --------------------------------------------------

    async fn get_device_info(&mut self, command: &CommandBlock) -> Result<()> {
        let ops: Vec<u16> = OperationCode::ALL.iter().map(|op| u16::from(*op)).collect();
        let device_props: Vec<u16> = ferry_proto::DevicePropCode::ALL
            .iter()
            .map(|prop| u16::from(*prop))
            .collect();

        let mut ds = Dataset::new();
        ds.put_u16(ferry_proto::STANDARD_VERSION)
            .put_u32(ferry_proto::MTP_VENDOR_EXTENSION_ID)
            .put_u16(ferry_proto::MTP_VENDOR_EXTENSION_VERSION)
            .put_string(ferry_proto::MTP_VENDOR_EXTENSION_DESC)
            .put_u16(ferry_proto::FUNCTIONAL_MODE_STANDARD)
            .put_u16_array(&ops)
            .put_u16_array(&[]) // events
            .put_u16_array(&device_props)
            .put_u16_array(&[]) // capture formats
            .put_u16_array(&[OBJECT_FORMAT_UNDEFINED, OBJECT_FORMAT_ASSOCIATION])
            .put_string(&self.identity.manufacturer)
            .put_string(&self.identity.model)
            .put_string(&self.identity.device_version)
            .put_string(&self.identity.serial_number);
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    async fn get_storage_ids(&mut self, command: &CommandBlock) -> Result<()> {
        let ids: Vec<u32> = self.vfs.storages().iter().map(|storage| storage.id).collect();
        let mut ds = Dataset::new();
        ds.put_u32_array(&ids);
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    async fn get_storage_info(&mut self, command: &CommandBlock) -> Result<()> {
        let storage = self.vfs.storage(command.param(0))?.clone();
        let (total, free) = self.vfs.storage_stat(storage.id).await?;
        let access = if storage.writable {
            ferry_proto::ACCESS_CAPABILITY_READ_WRITE
        } else {
            ferry_proto::ACCESS_CAPABILITY_READ_ONLY
        };

        let mut ds = Dataset::new();
        ds.put_u16(ferry_proto::STORAGE_TYPE_FIXED_RAM)
            .put_u16(ferry_proto::FILESYSTEM_TYPE_HIERARCHICAL)
            .put_u16(access)
            .put_u64(total)
            .put_u64(free)
            .put_u32(ferry_proto::FREE_SPACE_OBJECTS_UNTRACKED)
            .put_string(&storage.display_name)
            .put_string("");
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    // --- enumeration & object info ----------------------------------------

    async fn get_object_handles(&mut self, command: &CommandBlock) -> Result<()> {
        let storage_param = command.param(0);
        let format = command.param(1);
        let association = command.param(2);
        if format != 0 {
            return Err(Error::Protocol(ResponseCode::SpecificationByFormatUnsupported));
        }

        let storage_ids: Vec<u32> = if storage_param == ALL_STORAGES {
            self.vfs.storages().iter().map(|storage| storage.id).collect()
        } else {
            vec![self.vfs.storage(storage_param)?.id]
        };

        let mut handles: Vec<u32> = Vec::new();
        for storage_id in storage_ids {
            let (parent_handle, parent_path) = if association == PARENT_ROOT || association == 0 {
                (0, PathBuf::new())
            } else {
                let entry = self
                    .heap
                    .get(association)
                    .ok_or(Error::Protocol(ResponseCode::InvalidParentObject))?;
                if entry.storage_id != storage_id {
                    continue;
                }
                let stat = self.fresh_stat(association).await?;
                if !stat.is_dir {
                    return Err(Error::Protocol(ResponseCode::InvalidParentObject));
                }
                let (_, path) = self
                    .heap
                    .resolve(association)
                    .ok_or(Error::Protocol(ResponseCode::InvalidParentObject))?;
                (association, path)
            };

            for entry in self.vfs.enumerate(storage_id, &parent_path).await? {
                let handle = self.heap.intern(storage_id, parent_handle, &entry.name);
                self.heap.cache_stat(
                    handle,
                    ObjectStat {
                        is_dir: entry.is_dir,
                        size: entry.size,
                    },
                );
                handles.push(handle);
            }
        }

        trace!(count = handles.len(), "object handles enumerated");
        let mut ds = Dataset::new();
        ds.put_u32_array(&handles);
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    async fn get_object_info(&mut self, command: &CommandBlock) -> Result<()> {
        let handle = command.param(0);
        let (storage_id, _) = self.resolve_handle(handle)?;
        let stat = self.fresh_stat(handle).await?;
        let entry = self
            .heap
            .get(handle)
            .ok_or(Error::Protocol(ResponseCode::InvalidObjectHandle))?;

        let format = if stat.is_dir {
            OBJECT_FORMAT_ASSOCIATION
        } else {
            OBJECT_FORMAT_UNDEFINED
        };
        let compressed_size = u32::try_from(stat.size).unwrap_or(u32::MAX);
        let association_type = if stat.is_dir {
            ASSOCIATION_TYPE_GENERIC_FOLDER
        } else {
            0
        };

        let mut ds = Dataset::new();
        ds.put_u32(storage_id)
            .put_u16(format)
            .put_u16(0) // protection status
            .put_u32(compressed_size)
            .put_u16(0) // thumb format
            .put_u32(0) // thumb compressed size
            .put_u32(0) // thumb width
            .put_u32(0) // thumb height
            .put_u32(0) // image width
            .put_u32(0) // image height
            .put_u32(0) // image bit depth
            .put_u32(entry.parent)
            .put_u16(association_type)
            .put_u32(0) // association description
            .put_u32(0) // sequence number
            .put_string(&entry.name)
            .put_string("") // capture date
            .put_string("") // modification date
            .put_string(""); // keywords
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    // --- object data -------------------------------------------------------

    async fn get_object(&mut self, command: &CommandBlock) -> Result<()> {
        let handle = command.param(0);
        let (storage_id, relative) = self.resolve_handle(handle)?;
        let stat = match self.heap.get(handle).and_then(|entry| entry.cached) {
            Some(stat) => stat,
            None => self.fresh_stat(handle).await?,
        };
        if stat.is_dir {
            return Err(Error::Protocol(ResponseCode::InvalidObjectHandle));
        }

        let path = self.display_path(storage_id, &relative)?;
        let file = self.vfs.open_read(storage_id, &relative).await?;
        self.events.emit(SessionEvent::ReadBegin { path: path.clone() });

        self.stream_object_in(command, file, stat.size).await?;

        self.events.emit(SessionEvent::ReadEnd { path });
        self.ok(command).await
    }

    async fn get_partial_object(&mut self, command: &CommandBlock) -> Result<()> {
        let handle = command.param(0);
        let offset = u64::from(command.param(1));
        let limit = u64::from(command.param(2));
        let (storage_id, relative) = self.resolve_handle(handle)?;
        let stat = self.fresh_stat(handle).await?;
        if stat.is_dir {
            return Err(Error::Protocol(ResponseCode::InvalidObjectHandle));
        }
        if offset > stat.size {
            return Err(Error::Protocol(ResponseCode::InvalidParameter));
        }
        let span = limit.min(stat.size - offset);

        let path = self.display_path(storage_id, &relative)?;
        let mut file = self.vfs.open_read(storage_id, &relative).await?;
        file.seek(SeekFrom::Start(offset)).await.map_err(Error::Filesystem)?;
        self.events.emit(SessionEvent::ReadBegin { path: path.clone() });

        self.stream_object_in(command, file, span).await?;

        self.events.emit(SessionEvent::ReadEnd { path });
        let actual = u32::try_from(span).unwrap_or(u32::MAX);
        self.write_response(ResponseCode::Ok, command.transaction_id, &[actual])
            .await
    }

    /// Stream `size` file bytes to the host as one Data container.
    async fn stream_object_in(
        &mut self,
        command: &CommandBlock,
        file: fs::File,
        size: u64,
    ) -> Result<()> {
        let mut builder = PtpDataBuilder::new(self.server.clone());
        builder
            .begin_data(command.code, command.transaction_id, size)
            .await?;
        if size == 0 {
            return builder.commit().await;
        }

        metrics::record_transfer_active(true);
        let result = transfer::transfer(
            size,
            FileSource { file },
            ProgressSink {
                inner: BulkSink {
                    builder: Some(builder),
                    total: size,
                },
                events: self.events.clone(),
                total: size,
                read_side: true,
            },
            FILE_TRANSFER_BUFFER,
            TransferMode::SingleThreadedIfSmaller,
            self.server.cancel_token().clone(),
        )
        .await;
        metrics::record_transfer_active(false);
        result
    }

    // --- upload ------------------------------------------------------------

    async fn send_object_info(&mut self, command: &CommandBlock) -> Result<()> {
        // Consume the ObjectInfo data phase before any validation, so a
        // rejection leaves the bulk pipe aligned on the next command.
        let mut parser = PtpDataParser::new(self.server.clone());
        self.expect_data_header(&mut parser, command).await?;
        let _sender_storage = parser.read_u32().await?;
        let format = parser.read_u16().await?;
        let _protection = parser.read_u16().await?;
        let compressed_size = parser.read_u32().await?;
        let _thumb_format = parser.read_u16().await?;
        let _thumb_size = parser.read_u32().await?;
        let _thumb_width = parser.read_u32().await?;
        let _thumb_height = parser.read_u32().await?;
        let _image_width = parser.read_u32().await?;
        let _image_height = parser.read_u32().await?;
        let _bit_depth = parser.read_u32().await?;
        let _sender_parent = parser.read_u32().await?;
        let _association_type = parser.read_u16().await?;
        let _association_desc = parser.read_u32().await?;
        let _sequence = parser.read_u32().await?;
        let filename = parser.read_string().await?;
        self.drain(&mut parser).await?;

        if filename.is_empty() || filename.contains(['/', '\0']) {
            return Err(Error::Protocol(ResponseCode::InvalidParameter));
        }

        let storage_id = match command.param(0) {
            0 => self.vfs.storages()[0].id,
            id => self.vfs.storage(id)?.id,
        };
        self.vfs.ensure_writable(storage_id)?;

        let parent_param = command.param(1);
        let (parent_handle, parent_path) = if parent_param == PARENT_ROOT || parent_param == 0 {
            (0, PathBuf::new())
        } else {
            let stat = self.fresh_stat(parent_param).await?;
            if !stat.is_dir {
                return Err(Error::Protocol(ResponseCode::InvalidParentObject));
            }
            let (parent_storage, path) = self
                .heap
                .resolve(parent_param)
                .ok_or(Error::Protocol(ResponseCode::InvalidParentObject))?;
            if parent_storage != storage_id {
                return Err(Error::Protocol(ResponseCode::InvalidParentObject));
            }
            (parent_param, path)
        };

        let relative = parent_path.join(&filename);
        let handle = self.heap.intern(storage_id, parent_handle, &filename);
        let path = self.display_path(storage_id, &relative)?;

        if format == OBJECT_FORMAT_ASSOCIATION {
            self.vfs.create_dir(storage_id, &relative).await?;
            self.heap.cache_stat(handle, ObjectStat { is_dir: true, size: 0 });
            self.events.emit(SessionEvent::CreateFolder { path });
        } else {
            drop(self.vfs.create_file(storage_id, &relative).await?);
            self.heap.cache_stat(handle, ObjectStat { is_dir: false, size: 0 });
            self.events.emit(SessionEvent::CreateFile { path });
            self.pending = Some(PendingObject {
                storage_id,
                handle,
                relative,
                size: u64::from(compressed_size),
            });
        }

        debug!(handle, storage_id, %filename, size = compressed_size, "object info received");
        let parent_response = if parent_handle == 0 { PARENT_ROOT } else { parent_handle };
        self.write_response(
            ResponseCode::Ok,
            command.transaction_id,
            &[storage_id, parent_response, handle],
        )
        .await
    }

    async fn send_object(&mut self, command: &CommandBlock) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Err(Error::Protocol(ResponseCode::NoValidObjectInfo));
        };
        self.vfs.ensure_writable(pending.storage_id)?;

        let mut parser = PtpDataParser::new(self.server.clone());
        self.expect_data_header(&mut parser, command).await?;

        let path = self.display_path(pending.storage_id, &pending.relative)?;
        let file = self.vfs.open_write(pending.storage_id, &pending.relative).await?;

        self.events.emit(SessionEvent::WriteBegin { path: path.clone() });
        metrics::record_transfer_active(true);
        let result = transfer::transfer(
            pending.size,
            BulkSource {
                parser,
                remaining: pending.size,
            },
            ProgressSink {
                inner: FileSink { file },
                events: self.events.clone(),
                total: pending.size,
                read_side: false,
            },
            FILE_TRANSFER_BUFFER,
            TransferMode::SingleThreadedIfSmaller,
            self.server.cancel_token().clone(),
        )
        .await;
        metrics::record_transfer_active(false);
        result?;

        self.heap.cache_stat(
            pending.handle,
            ObjectStat {
                is_dir: false,
                size: pending.size,
            },
        );
        self.events.emit(SessionEvent::WriteEnd { path });
        debug!(handle = pending.handle, size = pending.size, "object received");
        self.ok(command).await
    }

    // --- delete & move -----------------------------------------------------

    async fn delete_object(&mut self, command: &CommandBlock) -> Result<()> {
        let handle = command.param(0);
        let (storage_id, relative) = self.resolve_handle(handle)?;
        let stat = self.fresh_stat(handle).await?;
        let path = self.display_path(storage_id, &relative)?;

        if stat.is_dir {
            let result = self.vfs.delete_dir_recursive(storage_id, &relative).await;
            self.heap.remove(handle);
            result?;
            self.events.emit(SessionEvent::DeleteFolder { path });
        } else {
            self.vfs.delete_file(storage_id, &relative).await?;
            self.heap.remove(handle);
            self.events.emit(SessionEvent::DeleteFile { path });
        }
        self.ok(command).await
    }

    async fn move_object(&mut self, command: &CommandBlock) -> Result<()> {
        let handle = command.param(0);
        let storage_param = command.param(1);
        let parent_param = command.param(2);

        let (storage_id, relative) = self.resolve_handle(handle)?;
        if storage_param != 0 && storage_param != storage_id {
            // Cross-storage moves would not be atomic; refuse them.
            return Err(Error::Protocol(ResponseCode::InvalidStorageId));
        }
        self.vfs.ensure_writable(storage_id)?;
        let stat = self.fresh_stat(handle).await?;

        let (new_parent, parent_path) = if parent_param == 0 || parent_param == PARENT_ROOT {
            (0, PathBuf::new())
        } else {
            let parent_stat = self.fresh_stat(parent_param).await?;
            if !parent_stat.is_dir {
                return Err(Error::Protocol(ResponseCode::InvalidParentObject));
            }
            let (parent_storage, path) = self
                .heap
                .resolve(parent_param)
                .ok_or(Error::Protocol(ResponseCode::InvalidParentObject))?;
            if parent_storage != storage_id {
                return Err(Error::Protocol(ResponseCode::InvalidParentObject));
            }
            (parent_param, path)
        };

        let name = self
            .heap
            .get(handle)
            .ok_or(Error::Protocol(ResponseCode::InvalidObjectHandle))?
            .name
            .clone();
        let destination = parent_path.join(&name);
        let from = self.display_path(storage_id, &relative)?;
        let to = self.display_path(storage_id, &destination)?;

        self.vfs.rename(storage_id, &relative, &destination).await?;
        self.heap.reparent(handle, new_parent);
        if stat.is_dir {
            self.events
                .emit(SessionEvent::RenameFolder { path: from, new_path: to });
        } else {
            self.events
                .emit(SessionEvent::RenameFile { path: from, new_path: to });
        }
        self.ok(command).await
    }

    // --- shared helpers ----------------------------------------------------

    fn resolve_handle(&self, handle: ObjectHandle) -> Result<(u32, PathBuf)> {
        self.heap
            .resolve(handle)
            .ok_or(Error::Protocol(ResponseCode::InvalidObjectHandle))
    }

    async fn fresh_stat(&mut self, handle: ObjectHandle) -> Result<ObjectStat> {
        let (storage_id, relative) = self.resolve_handle(handle)?;
        let stat = self.vfs.stat(storage_id, &relative).await?;
        self.heap.cache_stat(handle, stat);
        Ok(stat)
    }

    fn display_path(&self, storage_id: u32, relative: &std::path::Path) -> Result<String> {
        let full = self.vfs.full_path(storage_id, relative)?;
        Ok(full.display().to_string())
    }

    async fn send_dataset(&mut self, command: &CommandBlock, dataset: Dataset) -> Result<()> {
        let mut builder = PtpDataBuilder::new(self.server.clone());
        builder
            .begin_data(command.code, command.transaction_id, dataset.len() as u64)
            .await?;
        builder.write_buffer(dataset.as_bytes()).await?;
        builder.commit().await
    }

    async fn expect_data_header(
        &mut self,
        parser: &mut PtpDataParser<T>,
        command: &CommandBlock,
    ) -> Result<()> {
        let header = parser.read_header().await?;
        if header.kind != ContainerType::Data || header.code != command.code {
            warn!(kind = ?header.kind, code = header.code, "unexpected container in data phase");
            self.drain(parser).await?;
            return Err(Error::Protocol(ResponseCode::GeneralError));
        }
        if header.transaction_id != command.transaction_id {
            self.drain(parser).await?;
            return Err(Error::Protocol(ResponseCode::InvalidTransactionId));
        }
        Ok(())
    }

    async fn drain(&mut self, parser: &mut PtpDataParser<T>) -> Result<()> {
        match parser.finalize().await {
            Ok(()) | Err(Error::EndOfTransmission) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn ok(&mut self, command: &CommandBlock) -> Result<()> {
        self.write_response(ResponseCode::Ok, command.transaction_id, &[])
            .await
    }

    async fn write_response(&self, code: ResponseCode, tid: u32, params: &[u32]) -> Result<()> {
        trace!(response = ?code, tid, "response sent");
        let block = ResponseBlock::new(code, tid, params)?;
        self.server.write_packet(&block.encode()).await
    }
}

// --- transfer pipeline endpoints ------------------------------------------

struct FileSource {
    file: fs::File,
}

#[async_trait]
impl TransferSource for FileSource {
    async fn read_chunk(&mut self, _offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf).await.map_err(Error::Filesystem)?)
    }
}

struct FileSink {
    file: fs::File,
}

#[async_trait]
impl TransferSink for FileSink {
    async fn write_chunk(&mut self, _offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await.map_err(Error::Filesystem)?;
        self.file.flush().await.map_err(Error::Filesystem)?;
        Ok(())
    }
}

/// Streams a Data container payload out through the builder, committing the
/// zero-length terminator once the final byte is written.
struct BulkSink<T: UsbBulk> {
    builder: Option<PtpDataBuilder<T>>,
    total: u64,
}

#[async_trait]
impl<T: UsbBulk + 'static> TransferSink for BulkSink<T> {
    async fn write_chunk(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let Some(builder) = self.builder.as_mut() else {
            return Err(Error::Protocol(ResponseCode::GeneralError));
        };
        builder.write_buffer(buf).await?;
        if offset + buf.len() as u64 == self.total {
            if let Some(builder) = self.builder.take() {
                builder.commit().await?;
            }
        }
        Ok(())
    }
}

/// Pulls a Data container payload off the bulk pipe with page-aligned
/// in-place reads, draining the trailing terminator with the final chunk.
struct BulkSource<T: UsbBulk> {
    parser: PtpDataParser<T>,
    remaining: u64,
}

#[async_trait]
impl<T: UsbBulk + 'static> TransferSource for BulkSource<T> {
    async fn read_chunk(&mut self, _offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let read = match self.parser.read_buffer_in_place(&mut buf[..want]).await {
            Ok(read) => read,
            // The host ended the transmission early; let the pipeline report
            // the short byte count.
            Err(Error::EndOfTransmission) => 0,
            Err(err) => return Err(err),
        };
        self.remaining -= read as u64;
        if self.remaining == 0 {
            // Consume the terminator so the next command starts clean.
            match self.parser.finalize().await {
                Ok(()) | Err(Error::EndOfTransmission) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(read)
    }

    async fn abort(&mut self) -> Result<()> {
        // The sink failed or the stream fell short; drain the rest of the
        // host's Data container so the next command starts on a container
        // boundary.
        match self.parser.finalize().await {
            Ok(()) | Err(Error::EndOfTransmission) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Emits Read/Write progress callbacks around an inner sink.
struct ProgressSink<K> {
    inner: K,
    events: EventSink,
    total: u64,
    read_side: bool,
}

#[async_trait]
impl<K: TransferSink> TransferSink for ProgressSink<K> {
    async fn write_chunk(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.inner.write_chunk(offset, buf).await?;
        let event = if self.read_side {
            SessionEvent::ReadProgress {
                offset: offset + buf.len() as u64,
                size: self.total,
            }
        } else {
            SessionEvent::WriteProgress {
                offset: offset + buf.len() as u64,
                size: self.total,
            }
        };
        self.events.emit(event);
        Ok(())
    }
}
