//! Orchestration for the ferry PTP/MTP gadget: ConfigFS/FunctionFS bring-up,
//! the ep0 control pump, the serve loop, and the embedding start/stop
//! surface.

mod ep0;

pub use ep0::Ep0Monitor;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ferry_gadget_core::{
    DeviceIdentity, Error as CoreError, EventSink, FilesystemProxy, FsEntry, FunctionfsEndpoints,
    PtpResponder, UsbBulk, UsbServer, BULK_MAX_PACKET, MAX_STORAGES,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::fs::File as StdFile;
use std::io::Write;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use usb_gadget::{
    function::custom::{Custom, Endpoint, EndpointDirection, Interface, TransferType},
    Class, Config, Gadget, Id, RegGadget, Strings,
};

/// USB Still Image class triple (PIMA 15740 / PTP).
const STILL_IMAGE_CLASS: u8 = 0x06;
const STILL_IMAGE_SUBCLASS: u8 = 0x01;
const PTP_PROTOCOL: u8 = 0x01;

/// Interrupt endpoint max packet size for the PTP event pipe.
const INTERRUPT_MAX_PACKET: u16 = 64;

#[derive(Debug, Parser)]
#[command(name = "ferry-gadget-cli", version)]
#[command(about = "Expose directories to a USB host as a PTP/MTP media device", long_about = None)]
pub struct Args {
    /// Storage root to expose, as NAME=PATH[:ro]. Repeatable.
    #[arg(long = "root", value_name = "NAME=PATH[:ro]", value_parser = parse_root)]
    pub roots: Vec<FsEntry>,
    /// JSON config file carrying storage entries, merged after --root.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// USB vendor ID for the gadget (hex).
    #[arg(long, value_name = "HEX", default_value = "0x1209", value_parser = parse_hex_u16)]
    pub vendor_id: u16,
    /// USB product ID for the gadget (hex).
    #[arg(long, value_name = "HEX", default_value = "0x0010", value_parser = parse_hex_u16)]
    pub product_id: u16,
    /// Manufacturer string reported to the host.
    #[arg(long, default_value = "ferry")]
    pub manufacturer: String,
    /// Model string reported to the host.
    #[arg(long, default_value = "ferry gadget")]
    pub model: String,
    /// Serial number reported to the host.
    #[arg(long, default_value = "00000001")]
    pub serial: String,
    /// Friendly name exposed through the DeviceFriendlyName property.
    #[arg(long, default_value = "ferry")]
    pub friendly_name: String,
    /// Expose Prometheus metrics on this TCP port (0 disables).
    #[arg(long, default_value_t = 0)]
    pub metrics_port: u16,
    /// Use an existing FunctionFS directory and skip configfs management.
    #[arg(long, value_name = "PATH")]
    pub ffs_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let args = Args::parse();
    let result = run_impl(args).await;
    if let Err(err) = &result {
        error!(error = ?err, "ferry-gadget-cli exiting with error");
    }
    result
}

pub async fn run_with_args(args: Args) -> Result<()> {
    run_impl(args).await
}

async fn run_impl(args: Args) -> Result<()> {
    let entries = collect_entries(&args)?;
    install_metrics_listener(args.metrics_port)?;

    let vfs = Arc::new(FilesystemProxy::new(entries)?);
    let identity = DeviceIdentity {
        manufacturer: args.manufacturer.clone(),
        model: args.model.clone(),
        device_version: env!("CARGO_PKG_VERSION").into(),
        serial_number: args.serial.clone(),
        friendly_name: args.friendly_name.clone(),
    };

    let (endpoints, mut ep0, _gadget_guard) =
        setup_functionfs(&args).context("setup FunctionFS")?;
    info!(
        vendor_id = args.vendor_id,
        product_id = args.product_id,
        storages = vfs.storages().len(),
        "ferry gadget registered"
    );

    tokio::select! {
        res = ep0.wait_configured() => res?,
        _ = signal::ctrl_c() => {
            info!("shutdown requested before host configured the interface");
            return Ok(());
        }
    }

    let (reset_tx, mut reset_rx) = watch::channel(0u64);
    let ep0_task = tokio::spawn(ep0.pump(reset_tx));

    let cancel = CancellationToken::new();
    let server = UsbServer::new(endpoints, cancel.clone());
    let events = EventSink::new(|event| debug!(?event, "session event"));
    let mut responder = PtpResponder::new(server, vfs, events, identity);

    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
        res = serve_loop(&mut responder, &mut reset_rx) => res,
    };

    cancel.cancel();
    ep0_task.abort();
    let _ = ep0_task.await;
    result
}

/// The reactor: dispatches host transactions until cancellation, applying
/// host-detach resets between them.
async fn serve_loop<T: UsbBulk + 'static>(
    responder: &mut PtpResponder<T>,
    reset: &mut watch::Receiver<u64>,
) -> Result<()> {
    loop {
        if reset.has_changed().unwrap_or(false) {
            reset.borrow_and_update();
            debug!("applying session reset after host detach");
            responder.reset_session();
        }
        match responder.process_request().await {
            Ok(()) => {}
            Err(CoreError::TransportCancelled | CoreError::StopRequested) => {
                debug!("serve loop stopping");
                return Ok(());
            }
            Err(err) if err.is_terminal() => bail!("bulk transport failed: {err}"),
            Err(err) => {
                // Failed transactions are already answered on the wire; the
                // session keeps serving.
                warn!(%err, "transaction failed");
            }
        }
    }
}

fn collect_entries(args: &Args) -> Result<Vec<FsEntry>> {
    let mut entries = args.roots.clone();
    if let Some(path) = &args.config {
        let data = std::fs::read(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: ConfigFile = serde_json::from_slice(&data).context("decode config file")?;
        entries.extend(config.storages.into_iter().map(|storage| FsEntry {
            display_name: storage.display_name,
            root_path: storage.root_path,
            writable: storage.writable,
        }));
    }
    if entries.is_empty() {
        bail!("no storage roots configured; pass --root or --config");
    }
    if entries.len() > MAX_STORAGES {
        bail!("{} storage roots exceed the PTP limit of {MAX_STORAGES}", entries.len());
    }
    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    storages: Vec<ConfigStorage>,
}

#[derive(Debug, Deserialize)]
struct ConfigStorage {
    display_name: String,
    root_path: PathBuf,
    #[serde(default = "default_writable")]
    writable: bool,
}

fn default_writable() -> bool {
    true
}

fn install_metrics_listener(port: u16) -> Result<()> {
    if port == 0 {
        return Ok(());
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("install Prometheus metrics exporter")?;
    info!(%addr, "metrics listener started");
    Ok(())
}

struct GadgetGuard {
    #[allow(dead_code)]
    custom: Custom,
    #[allow(dead_code)]
    registration: Option<RegGadget>,
}

fn setup_functionfs(args: &Args) -> Result<(FunctionfsEndpoints, Ep0Monitor, GadgetGuard)> {
    let mut builder = Custom::builder().with_interface(
        Interface::new(
            Class::new(STILL_IMAGE_CLASS, STILL_IMAGE_SUBCLASS, PTP_PROTOCOL),
            "mtp",
        )
        .with_endpoint(bulk_in_ep())
        .with_endpoint(bulk_out_ep())
        .with_endpoint(interrupt_in_ep()),
    );
    builder.ffs_no_init = true;
    let (ffs_descs, ffs_strings) = builder.ffs_descriptors_and_strings()?;
    let (mut custom, handle) = builder.build();

    let (registration, ffs_dir) = match &args.ffs_dir {
        Some(dir) => (None, dir.clone()),
        None => {
            let klass = Class::new(0, 0, 0);
            let id = Id::new(args.vendor_id, args.product_id);
            let strings = Strings::new(&args.manufacturer, &args.model, &args.serial);
            let gadget = Gadget::new(klass, id, strings)
                .with_config(Config::new("config").with_function(handle));
            let registration = gadget.register().context("register gadget")?;
            let dir = custom.ffs_dir().context("resolve FunctionFS dir")?;
            (Some(registration), dir)
        }
    };

    let mut ep0 = StdFile::options()
        .read(true)
        .write(true)
        .open(ffs_dir.join("ep0"))
        .context("open ep0")?;
    ep0.write_all(&ffs_descs).context("write descriptors")?;
    ep0.write_all(&ffs_strings).context("write strings")?;

    if let Some(registration) = &registration {
        let udc = usb_gadget::default_udc().context("locate UDC")?;
        registration.bind(Some(&udc)).context("bind gadget to UDC")?;
    }

    let bulk_in = open_endpoint_fd(ffs_dir.join("ep1")).context("open bulk IN")?;
    let bulk_out = open_endpoint_fd(ffs_dir.join("ep2")).context("open bulk OUT")?;
    let interrupt_in = open_endpoint_fd(ffs_dir.join("ep3")).context("open interrupt IN")?;
    let endpoints = FunctionfsEndpoints::new(bulk_in, bulk_out, interrupt_in, BULK_MAX_PACKET)
        .context("wrap endpoint files")?;
    let monitor = Ep0Monitor::new(to_owned_fd(ep0));

    Ok((
        endpoints,
        monitor,
        GadgetGuard {
            custom,
            registration,
        },
    ))
}

fn bulk_in_ep() -> Endpoint {
    let (_, dir) = EndpointDirection::device_to_host();
    make_ep(dir, TransferType::Bulk, BULK_MAX_PACKET as u16)
}

fn bulk_out_ep() -> Endpoint {
    let (_, dir) = EndpointDirection::host_to_device();
    make_ep(dir, TransferType::Bulk, BULK_MAX_PACKET as u16)
}

fn interrupt_in_ep() -> Endpoint {
    let (_, dir) = EndpointDirection::device_to_host();
    make_ep(dir, TransferType::Interrupt, INTERRUPT_MAX_PACKET)
}

fn make_ep(direction: EndpointDirection, ty: TransferType, packet_size: u16) -> Endpoint {
    let mut ep = match ty {
        TransferType::Bulk => Endpoint::bulk(direction),
        _ => Endpoint::custom(direction, ty),
    };
    ep.max_packet_size_hs = packet_size;
    ep.max_packet_size_ss = packet_size;
    ep
}

fn open_endpoint_fd(path: PathBuf) -> Result<OwnedFd> {
    let file = StdFile::options()
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok(to_owned_fd(file))
}

fn to_owned_fd(file: StdFile) -> OwnedFd {
    let raw = file.into_raw_fd();
    unsafe { OwnedFd::from_raw_fd(raw) }
}

fn parse_hex_u16(input: &str) -> std::result::Result<u16, String> {
    let trimmed = input.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16).map_err(|err| err.to_string())
}

fn parse_root(input: &str) -> std::result::Result<FsEntry, String> {
    let (name, rest) = input
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH[:ro], got {input:?}"))?;
    if name.is_empty() {
        return Err("storage name must not be empty".into());
    }
    let (path, writable) = match rest.strip_suffix(":ro") {
        Some(path) => (path, false),
        None => (rest, true),
    };
    if path.is_empty() {
        return Err("storage path must not be empty".into());
    }
    Ok(FsEntry {
        display_name: name.to_owned(),
        root_path: PathBuf::from(path),
        writable,
    })
}

// --- embedding surface -----------------------------------------------------

/// One live service per process; the USB device is a singleton.
static SERVICE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Configuration for [`Service::start`].
pub struct ServiceConfig {
    pub entries: Vec<FsEntry>,
    pub identity: DeviceIdentity,
    pub events: EventSink,
    /// Pin the serve thread to a CPU, for embedders that keep USB work off
    /// their latency-sensitive cores.
    pub worker_affinity: Option<usize>,
}

/// A running responder on its own dedicated thread.
///
/// `start` brings the serve loop up over an already-opened endpoint pair;
/// `stop` (or drop) cancels in-flight bulk work, joins the thread, and
/// guarantees no further callbacks are delivered. Failures never propagate
/// out of this surface; they are logged and collapse into `None`.
pub struct Service {
    cancel: CancellationToken,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Service {
    pub fn start<T>(endpoints: T, config: ServiceConfig) -> Option<Service>
    where
        T: UsbBulk + 'static,
    {
        if SERVICE_ACTIVE.swap(true, Ordering::SeqCst) {
            warn!("ferry service already running");
            return None;
        }
        let vfs = match FilesystemProxy::new(config.entries) {
            Ok(vfs) => Arc::new(vfs),
            Err(err) => {
                warn!(%err, "invalid storage configuration");
                SERVICE_ACTIVE.store(false, Ordering::SeqCst);
                return None;
            }
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let identity = config.identity;
        let events = config.events;
        let affinity = config.worker_affinity;
        let spawned = std::thread::Builder::new()
            .name("ferry-serve".into())
            .spawn(move || {
                if let Some(cpu) = affinity {
                    apply_affinity(cpu);
                }
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        warn!(%err, "failed to build serve runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let server = UsbServer::new(endpoints, token);
                    let mut responder = PtpResponder::new(server, vfs, events, identity);
                    loop {
                        match responder.process_request().await {
                            Ok(()) => {}
                            Err(CoreError::TransportCancelled | CoreError::StopRequested) => {
                                debug!("service serve loop stopping");
                                break;
                            }
                            Err(err) if err.is_terminal() => {
                                warn!(%err, "bulk transport failed; service stopping");
                                break;
                            }
                            Err(err) => {
                                warn!(%err, "transaction failed");
                            }
                        }
                    }
                });
            });

        match spawned {
            Ok(thread) => {
                info!("ferry service started");
                Some(Service {
                    cancel,
                    thread: Some(thread),
                })
            }
            Err(err) => {
                warn!(%err, "failed to spawn serve thread");
                SERVICE_ACTIVE.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    /// Request stop, join the serve thread, release the singleton.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.cancel.cancel();
        if thread.join().is_err() {
            warn!("service thread panicked");
        }
        SERVICE_ACTIVE.store(false, Ordering::SeqCst);
        debug!("ferry service stopped");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_affinity(cpu: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if let Err(err) = set.set(cpu) {
        warn!(%err, cpu, "CPU index out of range for affinity mask");
        return;
    }
    if let Err(err) = sched_setaffinity(Pid::from_raw(0), &set) {
        warn!(%err, cpu, "failed to set serve thread affinity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_gadget_core::{LoopbackUsb, PtpDataParser, SessionEvent};
    use ferry_proto::{CommandBlock, ContainerType, OperationCode, ResponseCode, PARENT_ROOT};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn parse_root_accepts_writable_and_read_only() {
        let entry = parse_root("A=/srv/media").unwrap();
        assert_eq!(entry.display_name, "A");
        assert_eq!(entry.root_path, PathBuf::from("/srv/media"));
        assert!(entry.writable);

        let entry = parse_root("sd=/mnt/sd:ro").unwrap();
        assert!(!entry.writable);
        assert_eq!(entry.root_path, PathBuf::from("/mnt/sd"));

        assert!(parse_root("missing-separator").is_err());
        assert!(parse_root("=path").is_err());
        assert!(parse_root("name=").is_err());
    }

    #[test]
    fn parse_hex_ids() {
        assert_eq!(parse_hex_u16("0x1209").unwrap(), 0x1209);
        assert_eq!(parse_hex_u16("BEEF").unwrap(), 0xBEEF);
        assert!(parse_hex_u16("xyz").is_err());
    }

    #[test]
    fn config_file_round_trips() {
        let json = r#"{"storages": [
            {"display_name": "A", "root_path": "/srv/a"},
            {"display_name": "B", "root_path": "/srv/b", "writable": false}
        ]}"#;
        let config: ConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(config.storages.len(), 2);
        assert!(config.storages[0].writable);
        assert!(!config.storages[1].writable);
    }

    struct TestHost {
        server: UsbServer<LoopbackUsb>,
    }

    impl TestHost {
        async fn command(&self, code: OperationCode, tid: u32, params: &[u32]) {
            let block = CommandBlock::new(code.into(), tid, params).unwrap();
            self.server.write_packet(&block.encode()).await.unwrap();
        }

        async fn read_response(&self) -> (u16, Vec<u32>) {
            let mut parser = PtpDataParser::new(self.server.clone());
            let header = parser.read_header().await.unwrap();
            assert_eq!(header.kind, ContainerType::Response);
            let count = header.payload_len() / 4;
            let mut params = Vec::new();
            for _ in 0..count {
                params.push(parser.read_u32().await.unwrap());
            }
            parser.finalize().await.unwrap();
            (header.code, params)
        }

        async fn read_data_payload(&self) -> Vec<u8> {
            let mut parser = PtpDataParser::new(self.server.clone());
            let header = parser.read_header().await.unwrap();
            assert_eq!(header.kind, ContainerType::Data);
            let mut payload = vec![0u8; header.payload_len()];
            parser.read_buffer(&mut payload).await.unwrap();
            parser.finalize().await.unwrap();
            payload
        }
    }

    /// Exit mid-transfer: the serve thread winds down promptly, and no
    /// callbacks arrive after stop() returns.
    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_mid_transfer_stops_cleanly() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("big.bin"), vec![0x42u8; 8 * 1024 * 1024]).unwrap();

        let events: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink = EventSink::new(move |event| captured.lock().unwrap().push(event.clone()));

        let (device_end, host_end) = LoopbackUsb::pair();
        let service = Service::start(
            device_end,
            ServiceConfig {
                entries: vec![FsEntry {
                    display_name: "A".into(),
                    root_path: root.path().to_owned(),
                    writable: true,
                }],
                identity: DeviceIdentity::default(),
                events: sink,
                worker_affinity: None,
            },
        )
        .expect("service starts");

        // The device endpoint singleton refuses a second instance.
        let (second_device, _second_host) = LoopbackUsb::pair();
        assert!(Service::start(
            second_device,
            ServiceConfig {
                entries: vec![FsEntry {
                    display_name: "B".into(),
                    root_path: root.path().to_owned(),
                    writable: true,
                }],
                identity: DeviceIdentity::default(),
                events: EventSink::disabled(),
                worker_affinity: None,
            },
        )
        .is_none());

        let host = TestHost {
            server: UsbServer::new(host_end, CancellationToken::new()),
        };
        host.command(OperationCode::OpenSession, 0, &[1]).await;
        let (code, _) = host.read_response().await;
        assert_eq!(code, u16::from(ResponseCode::Ok));

        host.command(OperationCode::GetObjectHandles, 1, &[1, 0, PARENT_ROOT])
            .await;
        let payload = host.read_data_payload().await;
        let handle = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        let (code, _) = host.read_response().await;
        assert_eq!(code, u16::from(ResponseCode::Ok));

        host.command(OperationCode::GetObject, 2, &[handle]).await;

        // Wait for the transfer to visibly start before pulling the plug.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if events
                .lock()
                .unwrap()
                .iter()
                .any(|event| matches!(event, SessionEvent::ReadProgress { .. }))
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "transfer never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::task::spawn_blocking(move || service.stop())
            .await
            .unwrap();

        let seen = events.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(events.lock().unwrap().len(), seen, "callback after stop");
    }
}
