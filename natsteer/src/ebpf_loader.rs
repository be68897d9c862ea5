use std::{
    ffi::CString,
    fs, io, mem,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::pin::PinError;
use aya::programs::tc::{SchedClassifier, SchedClassifierLinkId, TcAttachType};
use aya::util::online_cpus;
use aya::{
    Ebpf, EbpfLoader, include_bytes_aligned,
    maps::{Array, AsyncPerfEventArray, HashMap as FlowMap},
};
use bytes::BytesMut;
use log::{info, warn};
use tokio::signal;

use natsteer_common::{
    FlowKey, FlowRecord, MAP_CONFIG, MAP_EVENTS, MAP_FLOWS, RuntimeConfig, TRACE_ADMITTED,
    TRACE_REDIRECTED, TraceEvent,
};

use crate::flowmap;

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/natsteer"));
const TC_PROGRAM: &str = "natsteer";
const CONFIG_SLOT_RUNTIME: u32 = 0;
const PERF_READ_BUFFERS: usize = 16;

pub const DEFAULT_FLOW_MAP_PIN: &str = "/sys/fs/bpf/natsteer/natsteer_flows";
pub const DEFAULT_CONFIG_MAP_PIN: &str = "/sys/fs/bpf/natsteer/natsteer_config";

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub iface: String,
    /// Service port in host byte order; converted on the way into the map.
    pub service_port: u16,
    /// Interface redirected frames leave through. None selects hairpin,
    /// back out the arrival interface.
    pub egress_iface: Option<String>,
    pub flow_map_entries: u32,
    pub flow_pin_path: PathBuf,
    pub config_pin_path: PathBuf,
    /// Destinations to track from the start; more can be added later
    /// through the pinned map.
    pub track: Vec<Ipv4Addr>,
}

pub async fn attach_program(opts: AttachOptions) -> Result<()> {
    validate_attach_options(&opts)?;

    let egress_ifindex = match opts.egress_iface.as_deref() {
        None => 0,
        Some(name) => resolve_ifindex(name)?,
    };

    let mut loader = EbpfLoader::new();
    #[allow(deprecated)]
    {
        // Stable aya has no per-map max_entries setter besides this.
        loader.set_max_entries(MAP_FLOWS, opts.flow_map_entries);
    }
    let mut bpf = loader
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;

    let config = RuntimeConfig {
        service_port: opts.service_port.to_be(),
        _pad: [0; 2],
        egress_ifindex,
    };
    write_runtime_config(&mut bpf, config)?;
    seed_flow_entries(&mut bpf, &opts.track)?;

    pin_map(&mut bpf, MAP_FLOWS, &opts.flow_pin_path)?;
    pin_map(&mut bpf, MAP_CONFIG, &opts.config_pin_path)?;

    spawn_event_readers(&mut bpf)?;

    let link = attach_tc(&mut bpf, &opts.iface)?;
    info!(
        "attached {TC_PROGRAM} to {} ingress, steering udp port {}; press Ctrl+C to detach",
        opts.iface, opts.service_port
    );

    signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    info!("detaching {TC_PROGRAM} from {}", opts.iface);
    detach(&mut bpf, link)?;
    Ok(())
}

fn validate_attach_options(opts: &AttachOptions) -> Result<()> {
    ensure!(
        opts.flow_map_entries > 0,
        "flow map size must be greater than zero"
    );
    ensure!(opts.service_port > 0, "service port must be non-zero");
    Ok(())
}

fn resolve_ifindex(name: &str) -> Result<u32> {
    let ifname = CString::new(name).context("interface name contains a nul byte")?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    ensure!(ifindex != 0, "failed to lookup interface index for {name}");
    Ok(ifindex)
}

fn write_runtime_config(bpf: &mut Ebpf, cfg: RuntimeConfig) -> Result<()> {
    let map = bpf
        .map_mut(MAP_CONFIG)
        .with_context(|| format!("map {MAP_CONFIG} not found"))?;
    let mut array =
        Array::<_, RuntimeConfig>::try_from(map).context("config map has unexpected type")?;
    array
        .set(CONFIG_SLOT_RUNTIME, cfg, 0)
        .context("failed to write runtime config")?;
    Ok(())
}

fn seed_flow_entries(bpf: &mut Ebpf, track: &[Ipv4Addr]) -> Result<()> {
    if track.is_empty() {
        return Ok(());
    }
    let map = bpf
        .map_mut(MAP_FLOWS)
        .with_context(|| format!("map {MAP_FLOWS} not found"))?;
    let mut flows =
        FlowMap::<_, FlowKey, FlowRecord>::try_from(map).context("flow map has unexpected type")?;
    for addr in track {
        flows
            .insert(flowmap::key_for(*addr), FlowRecord { count: 0 }, 0)
            .with_context(|| format!("failed to seed flow entry for {addr}"))?;
    }
    info!("seeded {} tracked destination(s)", track.len());
    Ok(())
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(())
        }
        Err(err) => Err(anyhow!(
            "failed to pin map {map_name} at {}: {err}",
            path.display()
        )),
    }
}

/// Spawns one reader task per online CPU draining the trace event ring.
/// Event loss is tolerated; the datapath never blocks on telemetry.
fn spawn_event_readers(bpf: &mut Ebpf) -> Result<()> {
    let mut events = AsyncPerfEventArray::try_from(
        bpf.take_map(MAP_EVENTS)
            .with_context(|| format!("map {MAP_EVENTS} not found"))?,
    )
    .context("events map has unexpected type")?;

    let cpus = online_cpus().map_err(|(err_str, io_err)| anyhow!("{err_str}: {io_err}"))?;
    for cpu_id in cpus {
        let mut buf = events
            .open(cpu_id, None)
            .with_context(|| format!("failed to open perf buffer on cpu {cpu_id}"))?;
        tokio::spawn(async move {
            let mut buffers = (0..PERF_READ_BUFFERS)
                .map(|_| BytesMut::with_capacity(mem::size_of::<TraceEvent>()))
                .collect::<Vec<_>>();
            loop {
                let batch = match buf.read_events(&mut buffers).await {
                    Ok(batch) => batch,
                    Err(_) => break, // perf buffer was closed
                };
                if batch.lost > 0 {
                    warn!("cpu {cpu_id}: lost {} trace events", batch.lost);
                }
                for buffer in buffers.iter().take(batch.read) {
                    match decode_trace_event(buffer) {
                        Some(event) => info!("cpu {cpu_id}: {}", describe_trace_event(&event)),
                        None => warn!("cpu {cpu_id}: truncated trace event"),
                    }
                }
            }
        });
    }
    Ok(())
}

fn decode_trace_event(buf: &[u8]) -> Option<TraceEvent> {
    if buf.len() < mem::size_of::<TraceEvent>() {
        return None;
    }
    Some(unsafe { (buf.as_ptr() as *const TraceEvent).read_unaligned() })
}

fn describe_trace_event(event: &TraceEvent) -> String {
    let addr = Ipv4Addr::from(event.addr.to_ne_bytes());
    let port = u16::from_be(event.port);
    match event.kind {
        TRACE_ADMITTED => format!(
            "admitted {} byte frame for {addr}:{port} (ifindex {})",
            event.pkt_len, event.ifindex
        ),
        TRACE_REDIRECTED => format!(
            "redirected {} byte frame for {addr}:{port} (ifindex {})",
            event.pkt_len, event.ifindex
        ),
        other => format!("unknown trace event kind {other}"),
    }
}

fn attach_tc(bpf: &mut Ebpf, iface: &str) -> Result<SchedClassifierLinkId> {
    let program: &mut SchedClassifier = bpf
        .program_mut(TC_PROGRAM)
        .with_context(|| format!("program {TC_PROGRAM} not found"))?
        .try_into()
        .context("tc program has wrong type")?;
    program.load().context("failed to load tc program")?;
    program
        .attach(iface, TcAttachType::Ingress)
        .with_context(|| format!("failed to attach tc on {iface}"))
}

fn detach(bpf: &mut Ebpf, link: SchedClassifierLinkId) -> Result<()> {
    let program: &mut SchedClassifier = bpf
        .program_mut(TC_PROGRAM)
        .with_context(|| format!("program {TC_PROGRAM} not found"))?
        .try_into()
        .context("tc program has wrong type")?;
    program.detach(link).context("failed to detach tc program")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(kind: u8) -> TraceEvent {
        TraceEvent {
            kind,
            _pad: [0; 3],
            ifindex: 4,
            pkt_len: 60,
            addr: u32::from_ne_bytes([10, 0, 0, 7]),
            port: 4222u16.to_be(),
            _pad2: [0; 2],
        }
    }

    #[test]
    fn describe_trace_event_formats_admission() {
        let text = describe_trace_event(&sample_event(TRACE_ADMITTED));
        assert_eq!(text, "admitted 60 byte frame for 10.0.0.7:4222 (ifindex 4)");
    }

    #[test]
    fn describe_trace_event_formats_redirect() {
        let text = describe_trace_event(&sample_event(TRACE_REDIRECTED));
        assert_eq!(
            text,
            "redirected 60 byte frame for 10.0.0.7:4222 (ifindex 4)"
        );
    }

    #[test]
    fn describe_trace_event_flags_unknown_kinds() {
        let text = describe_trace_event(&sample_event(9));
        assert_eq!(text, "unknown trace event kind 9");
    }

    #[test]
    fn decode_trace_event_rejects_short_buffers() {
        let event = sample_event(TRACE_ADMITTED);
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &event as *const TraceEvent as *const u8,
                mem::size_of::<TraceEvent>(),
            )
        };
        let decoded = decode_trace_event(bytes).expect("full buffer decodes");
        assert_eq!(decoded, event);
        assert!(decode_trace_event(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn validate_attach_options_rejects_zeroes() {
        let opts = AttachOptions {
            iface: "lo".to_string(),
            service_port: 0,
            egress_iface: None,
            flow_map_entries: 0,
            flow_pin_path: PathBuf::from(DEFAULT_FLOW_MAP_PIN),
            config_pin_path: PathBuf::from(DEFAULT_CONFIG_MAP_PIN),
            track: Vec::new(),
        };
        assert!(validate_attach_options(&opts).is_err());
        let opts = AttachOptions {
            flow_map_entries: 128,
            ..opts
        };
        assert!(validate_attach_options(&opts).is_err());
        let opts = AttachOptions {
            service_port: 4222,
            ..opts
        };
        assert!(validate_attach_options(&opts).is_ok());
    }
}
