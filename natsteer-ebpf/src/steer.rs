// Steering pipeline: classify -> flow lookup -> endpoint swap -> verdict.
//
// All packet reads and writes go through the bounded skb accessors
// (bpf_skb_load_bytes / bpf_skb_store_bytes underneath), so every access is
// verified against the frame bounds at the point of use. The pipeline is a
// straight decision tree; there is no loop over packet contents.

use aya_ebpf::bindings::TC_ACT_OK;
use aya_ebpf::helpers::{bpf_l4_csum_replace, bpf_redirect};
use aya_ebpf::programs::TcContext;

use natsteer_common::{
    FlowKey, TraceEvent, DEFAULT_SERVICE_PORT, ETH_DST_OFF, ETH_HLEN, ETH_P_IP, ETH_SRC_OFF,
    ETH_TYPE_OFF, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, IPV4_DST_OFF, IPV4_PROTO_OFF,
    IPV4_SRC_OFF, L4_DPORT_OFF, L4_SPORT_OFF, TRACE_ADMITTED, TRACE_REDIRECTED, UDP_CSUM_OFF,
};

use crate::{NATSTEER_CONFIG, NATSTEER_EVENTS, NATSTEER_FLOWS};

const ETH_P_IP_BE: u16 = ETH_P_IP.to_be();

pub enum SteerError {
    /// Frame too short to hold the headers a read expected.
    InvalidFrame,
    /// A rewrite could not be applied; the frame may be half-mutated.
    Write,
    /// The transport checksum could not be patched.
    Csum,
}

pub fn try_steer(ctx: &mut TcContext) -> Result<i32, SteerError> {
    let ether_type: u16 = load(ctx, ETH_TYPE_OFF)?;
    if ether_type != ETH_P_IP_BE {
        // Pass unknown traffic to the stack.
        return Ok(TC_ACT_OK);
    }
    handle_ipv4(ctx)
}

fn handle_ipv4(ctx: &mut TcContext) -> Result<i32, SteerError> {
    let ver_ihl: u8 = load(ctx, ETH_HLEN)?;
    if ver_ihl >> 4 != 4 {
        return Err(SteerError::InvalidFrame);
    }
    let ihl = (ver_ihl & 0x0f) as usize;
    if ihl < 5 {
        return Err(SteerError::InvalidFrame);
    }
    let l4_off = ETH_HLEN + ihl * 4;

    let protocol: u8 = load(ctx, ETH_HLEN + IPV4_PROTO_OFF)?;
    let daddr: u32 = load(ctx, ETH_HLEN + IPV4_DST_OFF)?;

    // Port offsets are shared between TCP and UDP; ICMP has no port, which
    // is not an error. Any other transport is not our concern.
    let dport: u16 = match protocol {
        IPPROTO_TCP | IPPROTO_UDP => load(ctx, l4_off + L4_DPORT_OFF)?,
        IPPROTO_ICMP => return Ok(TC_ACT_OK),
        _ => return Ok(TC_ACT_OK),
    };

    let (service_port_be, egress_override) = runtime_config();

    // Only UDP destined to the tracked service port is eligible.
    if protocol != IPPROTO_UDP || dport != service_port_be {
        return Ok(TC_ACT_OK);
    }
    let sport: u16 = load(ctx, l4_off + L4_SPORT_OFF)?;

    emit(ctx, TRACE_ADMITTED, ingress_ifindex(ctx), daddr, dport);

    let record = match NATSTEER_FLOWS.get_ptr_mut(&FlowKey { addr: daddr }) {
        Some(record) => record,
        // Untracked destination: deliver through the normal stack.
        None => return Ok(TC_ACT_OK),
    };
    // Best-effort hit accounting; concurrent hits on the same record may
    // lose an increment. The counter wraps at 16 bits.
    unsafe { (*record).count = (*record).count.wrapping_add(1) };

    swap_endpoints(ctx, l4_off, sport, dport)?;

    let egress = if egress_override != 0 {
        egress_override
    } else {
        ifindex(ctx)
    };
    emit(ctx, TRACE_REDIRECTED, egress, daddr, dport);
    Ok(unsafe { bpf_redirect(egress, 0) } as i32)
}

/// Rewrites the frame so it heads back where it came from: Ethernet
/// addresses swapped, IPv4 addresses swapped, UDP ports swapped.
fn swap_endpoints(
    ctx: &mut TcContext,
    l4_off: usize,
    sport: u16,
    dport: u16,
) -> Result<(), SteerError> {
    let dmac: [u8; 6] = load(ctx, ETH_DST_OFF)?;
    let smac: [u8; 6] = load(ctx, ETH_SRC_OFF)?;
    store(ctx, ETH_DST_OFF, &smac)?;
    store(ctx, ETH_SRC_OFF, &dmac)?;

    let saddr: u32 = load(ctx, ETH_HLEN + IPV4_SRC_OFF)?;
    let daddr: u32 = load(ctx, ETH_HLEN + IPV4_DST_OFF)?;
    store(ctx, ETH_HLEN + IPV4_SRC_OFF, &daddr)?;
    store(ctx, ETH_HLEN + IPV4_DST_OFF, &saddr)?;
    // The IPv4 header checksum sums the header as 16-bit words, so
    // exchanging the two address fields leaves it unchanged. The UDP
    // pseudo-header sum is invariant under the same exchange. Both fixups
    // become necessary the moment this turns into an asymmetric rewrite.

    let udp_check: u16 = load(ctx, l4_off + UDP_CSUM_OFF)?;
    store(ctx, l4_off + L4_DPORT_OFF, &sport)?;
    store(ctx, l4_off + L4_SPORT_OFF, &dport)?;
    if udp_check != 0 {
        // Zero means "no checksum" for UDP over IPv4; leave it alone.
        replace_l4_csum(ctx, l4_off + UDP_CSUM_OFF, dport, sport)?;
        replace_l4_csum(ctx, l4_off + UDP_CSUM_OFF, sport, dport)?;
    }

    Ok(())
}

#[inline(always)]
fn runtime_config() -> (u16, u32) {
    match NATSTEER_CONFIG.get(0) {
        Some(cfg) if cfg.service_port != 0 => (cfg.service_port, cfg.egress_ifindex),
        _ => (DEFAULT_SERVICE_PORT.to_be(), 0),
    }
}

#[inline(always)]
fn load<T>(ctx: &TcContext, offset: usize) -> Result<T, SteerError> {
    ctx.load(offset).map_err(|_| SteerError::InvalidFrame)
}

#[inline(always)]
fn store<T>(ctx: &mut TcContext, offset: usize, value: &T) -> Result<(), SteerError> {
    ctx.store(offset, value, 0).map_err(|_| SteerError::Write)
}

#[inline(always)]
fn replace_l4_csum(ctx: &mut TcContext, offset: usize, from: u16, to: u16) -> Result<(), SteerError> {
    let ret = unsafe {
        bpf_l4_csum_replace(
            ctx.skb.skb as *mut _,
            offset as u32,
            from as u64,
            to as u64,
            2, // field size in bytes
        )
    };
    if ret != 0 {
        return Err(SteerError::Csum);
    }
    Ok(())
}

#[inline(always)]
fn ifindex(ctx: &TcContext) -> u32 {
    unsafe { (*ctx.skb.skb).ifindex }
}

#[inline(always)]
fn ingress_ifindex(ctx: &TcContext) -> u32 {
    unsafe { (*ctx.skb.skb).ingress_ifindex }
}

#[inline(always)]
fn emit(ctx: &TcContext, kind: u8, ifindex: u32, addr: u32, port: u16) {
    let pkt_len = ctx.data_end().saturating_sub(ctx.data()) as u32;
    let event = TraceEvent {
        kind,
        _pad: [0; 3],
        ifindex,
        pkt_len,
        addr,
        port,
        _pad2: [0; 2],
    };
    NATSTEER_EVENTS.output(ctx, &event, 0);
}
