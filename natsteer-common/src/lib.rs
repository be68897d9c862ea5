#![no_std]

// Types shared between the userspace agent and the eBPF program.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

pub mod csum;

/// Default tracked service port (NATS client port), host byte order.
/// The runtime config installed by the loader can override it.
pub const DEFAULT_SERVICE_PORT: u16 = 4222;

/// Maximum number of tracked destination addresses.
pub const FLOW_MAP_MAX_ENTRIES: u32 = 65535;

// Map names (must match between the eBPF program and the userspace loader).
pub const MAP_FLOWS: &str = "natsteer_flows";
pub const MAP_CONFIG: &str = "natsteer_config";
pub const MAP_EVENTS: &str = "natsteer_events";

// Frame layout constants.
pub const ETH_HLEN: usize = 14;
pub const ETH_DST_OFF: usize = 0;
pub const ETH_SRC_OFF: usize = 6;
pub const ETH_TYPE_OFF: usize = 12;
pub const IPV4_MIN_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;
/// Minimum frame a verdict can be produced for: Ethernet + minimal IPv4.
pub const MIN_FRAME_LEN: usize = ETH_HLEN + IPV4_MIN_HLEN;

// Offsets relative to the start of the IPv4 header.
pub const IPV4_PROTO_OFF: usize = 9;
pub const IPV4_CSUM_OFF: usize = 10;
pub const IPV4_SRC_OFF: usize = 12;
pub const IPV4_DST_OFF: usize = 16;

// Offsets relative to the start of the L4 header. Source/destination port
// offsets are shared between TCP and UDP.
pub const L4_SPORT_OFF: usize = 0;
pub const L4_DPORT_OFF: usize = 2;
pub const UDP_CSUM_OFF: usize = 6;

pub const ETH_P_IP: u16 = 0x0800;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Key of the flow map: tracked destination address, network byte order.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub addr: u32,
}

impl FlowKey {
    /// Builds a key from address octets as they appear on the wire. The
    /// stored integer keeps the wire byte order on both map sides.
    pub fn from_octets(octets: [u8; 4]) -> Self {
        Self {
            addr: u32::from_ne_bytes(octets),
        }
    }

    pub fn octets(&self) -> [u8; 4] {
        self.addr.to_ne_bytes()
    }
}

/// Value of the flow map: per-destination hit counter. 16 bits, wraps on
/// overflow; installed with an initial count by the control plane.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowRecord {
    pub count: u16,
}

/// Runtime configuration, written once by the loader into slot 0 of the
/// config array. `service_port` is kept in network byte order so the eBPF
/// program can compare it against the wire value directly; a zero port means
/// "not configured" and the compiled-in default applies.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RuntimeConfig {
    pub service_port: u16,
    pub _pad: [u8; 2],
    /// Egress interface for redirected frames; 0 hairpins the frame out the
    /// interface it arrived on.
    pub egress_ifindex: u32,
}

/// Trace event kinds emitted to the perf buffer.
pub const TRACE_ADMITTED: u8 = 1;
pub const TRACE_REDIRECTED: u8 = 2;

/// Fire-and-forget telemetry record. One is emitted when a frame is admitted
/// into the steering pipeline and one when the redirect decision is made.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TraceEvent {
    pub kind: u8,
    pub _pad: [u8; 3],
    pub ifindex: u32,
    pub pkt_len: u32,
    /// Destination address of the frame, network byte order.
    pub addr: u32,
    /// Destination port of the frame, network byte order.
    pub port: u16,
    pub _pad2: [u8; 2],
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes `aya::Pod` for these types so they can be used with aya's typed
// map APIs. Kept behind a feature so the eBPF side doesn't pull in
// userspace-only dependencies.
#[cfg(feature = "user")]
mod user_impls {
    use super::{FlowKey, FlowRecord, RuntimeConfig, TraceEvent};
    use aya::Pod;

    unsafe impl Pod for FlowKey {}
    unsafe impl Pod for FlowRecord {}
    unsafe impl Pod for RuntimeConfig {}
    unsafe impl Pod for TraceEvent {}
}
