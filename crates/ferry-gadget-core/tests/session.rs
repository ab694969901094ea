//! End-to-end sessions: a loopback host driving the responder over the
//! in-memory bulk pair, against tempdir-backed storages.

use ferry_gadget_core::{
    DeviceIdentity, EventSink, FilesystemProxy, FsEntry, LoopbackUsb, PtpDataBuilder,
    PtpDataParser, PtpResponder, SessionEvent, UsbServer,
};
use ferry_proto::{
    CommandBlock, ContainerHeader, ContainerType, OperationCode, ResponseCode, ALL_STORAGES,
    CONTAINER_HEADER_LEN, OBJECT_FORMAT_UNDEFINED, PARENT_ROOT,
};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Host {
    server: UsbServer<LoopbackUsb>,
}

impl Host {
    async fn command(&self, code: impl Into<u16>, tid: u32, params: &[u32]) {
        let block = CommandBlock::new(code.into(), tid, params).unwrap();
        self.server.write_packet(&block.encode()).await.unwrap();
    }

    async fn data(&self, code: impl Into<u16>, tid: u32, payload: &[u8]) {
        let mut builder = PtpDataBuilder::new(self.server.clone());
        builder
            .begin_data(code.into(), tid, payload.len() as u64)
            .await
            .unwrap();
        builder.write_buffer(payload).await.unwrap();
        builder.commit().await.unwrap();
    }

    async fn read_data(&self) -> (ContainerHeader, Vec<u8>) {
        let mut parser = PtpDataParser::new(self.server.clone());
        let header = parser.read_header().await.unwrap();
        assert_eq!(header.kind, ContainerType::Data);
        let mut payload = vec![0u8; header.length as usize - CONTAINER_HEADER_LEN];
        parser.read_buffer(&mut payload).await.unwrap();
        parser.finalize().await.unwrap();
        (header, payload)
    }

    async fn read_response(&self) -> (u16, u32, Vec<u32>) {
        let mut parser = PtpDataParser::new(self.server.clone());
        let header = parser.read_header().await.unwrap();
        assert_eq!(header.kind, ContainerType::Response);
        let count = (header.length as usize - CONTAINER_HEADER_LEN) / 4;
        let mut params = Vec::with_capacity(count);
        for _ in 0..count {
            params.push(parser.read_u32().await.unwrap());
        }
        parser.finalize().await.unwrap();
        (header.code, header.transaction_id, params)
    }

    async fn expect_ok(&self, tid: u32) -> Vec<u32> {
        let (code, rtid, params) = self.read_response().await;
        assert_eq!(code, u16::from(ResponseCode::Ok), "params: {params:?}");
        assert_eq!(rtid, tid);
        params
    }
}

struct Fixture {
    host: Host,
    cancel: CancellationToken,
    serve: JoinHandle<()>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_writable(true)
    }

    fn with_writable(writable: bool) -> Self {
        let root = TempDir::new().unwrap();
        let (device_end, host_end) = LoopbackUsb::pair();
        let cancel = CancellationToken::new();
        let server = UsbServer::new(device_end, cancel.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink = EventSink::new(move |event| captured.lock().unwrap().push(event.clone()));
        let vfs = Arc::new(
            FilesystemProxy::new(vec![FsEntry {
                display_name: "A".into(),
                root_path: root.path().to_owned(),
                writable,
            }])
            .unwrap(),
        );
        let mut responder = PtpResponder::new(server, vfs, sink, DeviceIdentity::default());
        let serve = tokio::spawn(async move {
            loop {
                match responder.process_request().await {
                    Ok(()) => {}
                    Err(err) if err.is_terminal() => break,
                    Err(err) => panic!("non-terminal error escaped the responder: {err}"),
                }
            }
        });
        Self {
            host: Host {
                server: UsbServer::new(host_end, CancellationToken::new()),
            },
            cancel,
            serve,
            events,
            root,
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.serve.await;
    }

    fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }
}

fn parse_u32_array(payload: &[u8]) -> Vec<u32> {
    let count = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    (0..count)
        .map(|i| u32::from_le_bytes(payload[4 + 4 * i..8 + 4 * i].try_into().unwrap()))
        .collect()
}

/// Minimal ObjectInfo dataset for SendObjectInfo.
fn object_info(name: &str, size: u32) -> Vec<u8> {
    let mut ds = ferry_gadget_core::Dataset::new();
    ds.put_u32(0) // storage id (ignored from the initiator)
        .put_u16(OBJECT_FORMAT_UNDEFINED)
        .put_u16(0) // protection
        .put_u32(size)
        .put_u16(0) // thumb format
        .put_u32(0)
        .put_u32(0)
        .put_u32(0)
        .put_u32(0) // image width
        .put_u32(0)
        .put_u32(0)
        .put_u32(0) // parent (ignored)
        .put_u16(0) // association type
        .put_u32(0)
        .put_u32(0)
        .put_string(name)
        .put_string("")
        .put_string("")
        .put_string("");
    ds.as_bytes().to_vec()
}

#[tokio::test]
async fn enumerate_empty_storage() {
    let fx = Fixture::new();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;

    fx.host.command(OperationCode::GetStorageIds, 1, &[]).await;
    let (_, payload) = fx.host.read_data().await;
    assert_eq!(parse_u32_array(&payload), vec![1]);
    fx.host.expect_ok(1).await;

    fx.host
        .command(OperationCode::GetObjectHandles, 2, &[1, 0, PARENT_ROOT])
        .await;
    let (_, payload) = fx.host.read_data().await;
    assert!(parse_u32_array(&payload).is_empty());
    fx.host.expect_ok(2).await;

    fx.host.command(OperationCode::CloseSession, 3, &[]).await;
    fx.host.expect_ok(3).await;

    assert_eq!(
        fx.events(),
        vec![SessionEvent::OpenSession, SessionEvent::CloseSession]
    );
    fx.shutdown().await;
}

#[tokio::test]
async fn download_one_mebibyte_file() {
    let fx = Fixture::new();
    let body = vec![0x5Au8; 1024 * 1024];
    std::fs::write(fx.root.path().join("foo.bin"), &body).unwrap();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;

    fx.host
        .command(OperationCode::GetObjectHandles, 1, &[ALL_STORAGES, 0, PARENT_ROOT])
        .await;
    let (_, payload) = fx.host.read_data().await;
    let handles = parse_u32_array(&payload);
    assert_eq!(handles.len(), 1);
    fx.host.expect_ok(1).await;

    fx.host
        .command(OperationCode::GetObject, 2, &[handles[0]])
        .await;
    let (header, payload) = fx.host.read_data().await;
    assert_eq!(header.code, u16::from(OperationCode::GetObject));
    assert_eq!(payload, body);
    fx.host.expect_ok(2).await;

    // ReadBegin, at least one ReadProgress, ReadEnd, in that order.
    let events = fx.events();
    let begin = events
        .iter()
        .position(|event| matches!(event, SessionEvent::ReadBegin { path } if path.ends_with("foo.bin")))
        .expect("ReadBegin");
    let end = events
        .iter()
        .position(|event| matches!(event, SessionEvent::ReadEnd { path } if path.ends_with("foo.bin")))
        .expect("ReadEnd");
    let progress = events
        .iter()
        .enumerate()
        .filter(|(_, event)| matches!(event, SessionEvent::ReadProgress { .. }))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    assert!(!progress.is_empty());
    assert!(begin < progress[0] && *progress.last().unwrap() < end);
    fx.shutdown().await;
}

#[tokio::test]
async fn upload_then_list() {
    let fx = Fixture::new();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;

    fx.host
        .command(OperationCode::SendObjectInfo, 1, &[1, PARENT_ROOT])
        .await;
    fx.host
        .data(OperationCode::SendObjectInfo, 1, &object_info("x.dat", 4096))
        .await;
    let params = fx.host.expect_ok(1).await;
    assert_eq!(params[0], 1);
    assert_eq!(params[1], PARENT_ROOT);
    let new_handle = params[2];
    assert_ne!(new_handle, 0);

    let body = vec![0xA5u8; 4096];
    fx.host.command(OperationCode::SendObject, 2, &[]).await;
    fx.host.data(OperationCode::SendObject, 2, &body).await;
    fx.host.expect_ok(2).await;

    fx.host
        .command(OperationCode::GetObjectHandles, 3, &[1, 0, PARENT_ROOT])
        .await;
    let (_, payload) = fx.host.read_data().await;
    assert!(parse_u32_array(&payload).contains(&new_handle));
    fx.host.expect_ok(3).await;

    assert_eq!(std::fs::read(fx.root.path().join("x.dat")).unwrap(), body);

    let events = fx.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::CreateFile { path } if path.ends_with("x.dat"))));
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::WriteEnd { path } if path.ends_with("x.dat"))));
    fx.shutdown().await;
}

#[tokio::test]
async fn data_container_without_command_is_answered_with_general_error() {
    let fx = Fixture::new();

    fx.host.data(0x1009u16, 42, &[1, 2, 3]).await;
    let (code, tid, _) = fx.host.read_response().await;
    assert_eq!(code, u16::from(ResponseCode::GeneralError));
    assert_eq!(tid, 42);

    // The responder is back in its command loop.
    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;
    fx.shutdown().await;
}

#[tokio::test]
async fn zero_length_terminated_download_loses_no_bytes() {
    let fx = Fixture::new();
    // Payload + container header an exact multiple of the 16 KiB transfer
    // buffer, so every bulk transfer is full-size and the transmission must
    // end with a zero-length packet.
    let size = 2 * 16 * 1024 - CONTAINER_HEADER_LEN;
    let body: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
    std::fs::write(fx.root.path().join("aligned.bin"), &body).unwrap();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;
    fx.host
        .command(OperationCode::GetObjectHandles, 1, &[1, 0, PARENT_ROOT])
        .await;
    let (_, payload) = fx.host.read_data().await;
    let handles = parse_u32_array(&payload);
    fx.host.expect_ok(1).await;

    fx.host
        .command(OperationCode::GetObject, 2, &[handles[0]])
        .await;
    let (_, payload) = fx.host.read_data().await;
    assert_eq!(payload, body);
    fx.host.expect_ok(2).await;
    fx.shutdown().await;
}

#[tokio::test]
async fn transaction_ids_are_validated_and_echoed() {
    let fx = Fixture::new();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;

    // Skipping ahead in the sequence is rejected.
    fx.host.command(OperationCode::GetStorageIds, 5, &[]).await;
    let (code, tid, _) = fx.host.read_response().await;
    assert_eq!(code, u16::from(ResponseCode::InvalidTransactionId));
    assert_eq!(tid, 5);

    // The expected id still works afterwards.
    fx.host.command(OperationCode::GetStorageIds, 1, &[]).await;
    let _ = fx.host.read_data().await;
    fx.host.expect_ok(1).await;
    fx.shutdown().await;
}

#[tokio::test]
async fn unsupported_operation_is_reported() {
    let fx = Fixture::new();
    // GetNumObjects is not implemented.
    fx.host.command(0x1006u16, 0, &[1, 0, 0]).await;
    let (code, tid, _) = fx.host.read_response().await;
    assert_eq!(code, u16::from(ResponseCode::OperationNotSupported));
    assert_eq!(tid, 0);
    fx.shutdown().await;
}

#[tokio::test]
async fn session_rules_are_enforced() {
    let fx = Fixture::new();

    // In-session operations require a session.
    fx.host.command(OperationCode::GetStorageIds, 0, &[]).await;
    let (code, _, _) = fx.host.read_response().await;
    assert_eq!(code, u16::from(ResponseCode::SessionNotOpen));

    // Session id zero is invalid.
    fx.host.command(OperationCode::OpenSession, 0, &[0]).await;
    let (code, _, _) = fx.host.read_response().await;
    assert_eq!(code, u16::from(ResponseCode::InvalidParameter));

    fx.host.command(OperationCode::OpenSession, 0, &[7]).await;
    fx.host.expect_ok(0).await;

    // Re-opening reports the already-open session id.
    fx.host.command(OperationCode::OpenSession, 1, &[8]).await;
    let (code, _, params) = fx.host.read_response().await;
    assert_eq!(code, u16::from(ResponseCode::SessionAlreadyOpen));
    assert_eq!(params, vec![7]);
    fx.shutdown().await;
}

#[tokio::test]
async fn read_only_storage_rejects_uploads() {
    let fx = Fixture::with_writable(false);

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;

    fx.host
        .command(OperationCode::SendObjectInfo, 1, &[1, PARENT_ROOT])
        .await;
    fx.host
        .data(OperationCode::SendObjectInfo, 1, &object_info("x.dat", 16))
        .await;
    let (code, _, _) = fx.host.read_response().await;
    assert_eq!(code, u16::from(ResponseCode::StoreReadOnly));
    fx.shutdown().await;
}

#[tokio::test]
async fn delete_directory_recursively() {
    let fx = Fixture::new();
    std::fs::create_dir(fx.root.path().join("photos")).unwrap();
    std::fs::create_dir(fx.root.path().join("photos/trip")).unwrap();
    std::fs::write(fx.root.path().join("photos/a.jpg"), b"a").unwrap();
    std::fs::write(fx.root.path().join("photos/trip/b.jpg"), b"b").unwrap();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;
    fx.host
        .command(OperationCode::GetObjectHandles, 1, &[1, 0, PARENT_ROOT])
        .await;
    let (_, payload) = fx.host.read_data().await;
    let handles = parse_u32_array(&payload);
    assert_eq!(handles.len(), 1);
    fx.host.expect_ok(1).await;

    fx.host
        .command(OperationCode::DeleteObject, 2, &[handles[0], 0])
        .await;
    fx.host.expect_ok(2).await;

    assert!(!fx.root.path().join("photos").exists());
    assert!(fx
        .events()
        .iter()
        .any(|event| matches!(event, SessionEvent::DeleteFolder { path } if path.ends_with("photos"))));
    fx.shutdown().await;
}

#[tokio::test]
async fn rename_via_object_file_name_property() {
    let fx = Fixture::new();
    std::fs::write(fx.root.path().join("old.txt"), b"contents").unwrap();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;
    fx.host
        .command(OperationCode::GetObjectHandles, 1, &[1, 0, PARENT_ROOT])
        .await;
    let (_, payload) = fx.host.read_data().await;
    let handle = parse_u32_array(&payload)[0];
    fx.host.expect_ok(1).await;

    fx.host
        .command(
            OperationCode::SetObjectPropValue,
            2,
            &[handle, u32::from(u16::from(ferry_proto::ObjectPropCode::ObjectFileName))],
        )
        .await;
    let mut name = ferry_gadget_core::Dataset::new();
    name.put_string("new.txt");
    fx.host
        .data(OperationCode::SetObjectPropValue, 2, name.as_bytes())
        .await;
    fx.host.expect_ok(2).await;

    assert!(fx.root.path().join("new.txt").exists());
    assert!(!fx.root.path().join("old.txt").exists());

    // The handle survives the rename.
    fx.host
        .command(OperationCode::GetObjectInfo, 3, &[handle])
        .await;
    let (_, _info) = fx.host.read_data().await;
    fx.host.expect_ok(3).await;
    fx.shutdown().await;
}

#[tokio::test]
async fn get_device_info_outside_session() {
    let fx = Fixture::new();
    fx.host.command(OperationCode::GetDeviceInfo, 0, &[]).await;
    let (_, payload) = fx.host.read_data().await;
    // Standard version and MTP extension id lead the dataset.
    assert_eq!(u16::from_le_bytes(payload[0..2].try_into().unwrap()), 100);
    assert_eq!(u32::from_le_bytes(payload[2..6].try_into().unwrap()), 6);
    fx.host.expect_ok(0).await;
    fx.shutdown().await;
}

#[tokio::test]
async fn partial_object_reads_a_window() {
    let fx = Fixture::new();
    let body: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    std::fs::write(fx.root.path().join("span.bin"), &body).unwrap();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;
    fx.host
        .command(OperationCode::GetObjectHandles, 1, &[1, 0, PARENT_ROOT])
        .await;
    let (_, payload) = fx.host.read_data().await;
    let handle = parse_u32_array(&payload)[0];
    fx.host.expect_ok(1).await;

    fx.host
        .command(OperationCode::GetPartialObject, 2, &[handle, 1000, 512])
        .await;
    let (_, payload) = fx.host.read_data().await;
    assert_eq!(payload, &body[1000..1512]);
    let params = fx.host.expect_ok(2).await;
    assert_eq!(params, vec![512]);
    fx.shutdown().await;
}

#[tokio::test]
async fn disk_full_mid_upload_keeps_session_alive() {
    let fx = Fixture::new();
    // Writes to /dev/full fail with ENOSPC; route the upload target there
    // so the sink dies on its first chunk, mid data phase.
    std::os::unix::fs::symlink("/dev/full", fx.root.path().join("full.bin")).unwrap();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;

    fx.host
        .command(OperationCode::SendObjectInfo, 1, &[1, PARENT_ROOT])
        .await;
    fx.host
        .data(
            OperationCode::SendObjectInfo,
            1,
            &object_info("full.bin", 1024 * 1024),
        )
        .await;
    fx.host.expect_ok(1).await;

    // The responder must drain the rest of the data phase before answering.
    let body = vec![0x11u8; 1024 * 1024];
    fx.host.command(OperationCode::SendObject, 2, &[]).await;
    fx.host.data(OperationCode::SendObject, 2, &body).await;
    let (code, tid, _) = fx.host.read_response().await;
    assert_eq!(code, u16::from(ResponseCode::StoreFull));
    assert_eq!(tid, 2);

    // The pipe is still aligned and the session still serves.
    fx.host.command(OperationCode::GetStorageIds, 3, &[]).await;
    let (_, payload) = fx.host.read_data().await;
    assert_eq!(parse_u32_array(&payload), vec![1]);
    fx.host.expect_ok(3).await;

    let events = fx.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::WriteBegin { path } if path.ends_with("full.bin"))));
    assert!(!events
        .iter()
        .any(|event| matches!(event, SessionEvent::WriteEnd { .. })));
    fx.shutdown().await;
}

#[tokio::test]
async fn intervening_command_discards_pending_object_info() {
    let fx = Fixture::new();

    fx.host.command(OperationCode::OpenSession, 0, &[1]).await;
    fx.host.expect_ok(0).await;

    fx.host
        .command(OperationCode::SendObjectInfo, 1, &[1, PARENT_ROOT])
        .await;
    fx.host
        .data(OperationCode::SendObjectInfo, 1, &object_info("y.dat", 16))
        .await;
    fx.host.expect_ok(1).await;

    // Any other command discards the pending info...
    fx.host.command(OperationCode::GetStorageIds, 2, &[]).await;
    let _ = fx.host.read_data().await;
    fx.host.expect_ok(2).await;

    // ...so SendObject now has nothing to attach to.
    fx.host.command(OperationCode::SendObject, 3, &[]).await;
    let (code, _, _) = fx.host.read_response().await;
    assert_eq!(code, u16::from(ResponseCode::NoValidObjectInfo));
    fx.shutdown().await;
}
