use std::{
    collections::{HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use natsteer_common::{
    ETH_DST_OFF, ETH_HLEN, ETH_P_IP, ETH_SRC_OFF, ETH_TYPE_OFF, IPPROTO_ICMP, IPPROTO_TCP,
    IPPROTO_UDP, IPV4_DST_OFF, IPV4_PROTO_OFF, IPV4_SRC_OFF, L4_DPORT_OFF, L4_SPORT_OFF,
    MIN_FRAME_LEN, UDP_CSUM_OFF, UDP_HLEN, csum,
};

const FLOW_SHARDS: usize = 64;

/// Outcome of running one frame through the steering decision. `Pass` leaves
/// the frame byte-for-byte untouched; `Redirect` means the frame has been
/// rewritten in place and should be transmitted back out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Pass,
    Redirect,
    Drop(DropReason),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// The frame claims IPv4 but is too short or malformed to parse.
    InvalidFrame,
}

struct ServiceFrame {
    l4_off: usize,
    daddr_key: u32,
    sport: u16,
    dport: u16,
}

enum Classified {
    Pass,
    Invalid,
    Service(ServiceFrame),
}

/// Runs one frame through the same pipeline the in-kernel program applies:
/// classify, look up the destination, and rewrite eligible frames in place.
pub fn process(frame: &mut [u8], flows: &FlowTable, service_port: u16) -> Verdict {
    let meta = match classify(frame, service_port) {
        Classified::Pass => return Verdict::Pass,
        Classified::Invalid => return Verdict::Drop(DropReason::InvalidFrame),
        Classified::Service(meta) => meta,
    };
    if flows.lookup_and_increment(meta.daddr_key).is_none() {
        // Untracked destination: hand the frame to the normal stack.
        return Verdict::Pass;
    }
    rewrite(frame, &meta);
    Verdict::Redirect
}

fn classify(frame: &[u8], service_port: u16) -> Classified {
    let ether_type = match read_u16(frame, ETH_TYPE_OFF) {
        Some(v) => v,
        None => return Classified::Invalid,
    };
    if ether_type != ETH_P_IP {
        return Classified::Pass;
    }
    if frame.len() < MIN_FRAME_LEN {
        return Classified::Invalid;
    }

    let ver_ihl = frame[ETH_HLEN];
    if ver_ihl >> 4 != 4 {
        return Classified::Invalid;
    }
    let ihl = (ver_ihl & 0x0f) as usize;
    if ihl < 5 {
        return Classified::Invalid;
    }
    let l4_off = ETH_HLEN + ihl * 4;

    // Port offsets are shared between TCP and UDP; ICMP has no port, which
    // is not an error. Any other transport is not our concern.
    let protocol = frame[ETH_HLEN + IPV4_PROTO_OFF];
    let dport = match protocol {
        IPPROTO_TCP | IPPROTO_UDP => match read_u16(frame, l4_off + L4_DPORT_OFF) {
            Some(v) => v,
            None => return Classified::Invalid,
        },
        IPPROTO_ICMP => return Classified::Pass,
        _ => return Classified::Pass,
    };
    if protocol != IPPROTO_UDP || dport != service_port {
        return Classified::Pass;
    }
    let sport = match read_u16(frame, l4_off + L4_SPORT_OFF) {
        Some(v) => v,
        None => return Classified::Invalid,
    };
    if frame.len() < l4_off + UDP_HLEN {
        return Classified::Invalid;
    }

    Classified::Service(ServiceFrame {
        l4_off,
        daddr_key: addr_key(frame, ETH_HLEN + IPV4_DST_OFF),
        sport,
        dport,
    })
}

/// Rewrites the frame so it heads back where it came from: Ethernet
/// addresses swapped, IPv4 addresses swapped, UDP ports swapped.
fn rewrite(frame: &mut [u8], meta: &ServiceFrame) {
    swap_fields(frame, ETH_DST_OFF, ETH_SRC_OFF, 6);
    swap_fields(frame, ETH_HLEN + IPV4_SRC_OFF, ETH_HLEN + IPV4_DST_OFF, 4);
    // The IPv4 header checksum sums the header as 16-bit words, so
    // exchanging the two address fields leaves it unchanged. The UDP
    // pseudo-header sum is invariant under the same exchange.
    swap_fields(frame, meta.l4_off + L4_SPORT_OFF, meta.l4_off + L4_DPORT_OFF, 2);

    let check_off = meta.l4_off + UDP_CSUM_OFF;
    if let Some(check) = read_u16(frame, check_off) {
        if check != 0 {
            // Zero means "no checksum" for UDP over IPv4; leave it alone.
            let check = csum::replace16(check, meta.dport, meta.sport);
            let check = csum::replace16(check, meta.sport, meta.dport);
            write_u16(frame, check_off, check);
        }
    }
}

fn read_u16(frame: &[u8], off: usize) -> Option<u16> {
    let bytes = frame.get(off..off + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn write_u16(frame: &mut [u8], off: usize, value: u16) {
    frame[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

/// Reads an IPv4 address in wire byte order, matching the key layout the
/// in-kernel map uses.
fn addr_key(frame: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([frame[off], frame[off + 1], frame[off + 2], frame[off + 3]])
}

fn swap_fields(frame: &mut [u8], a: usize, b: usize, len: usize) {
    for i in 0..len {
        frame.swap(a + i, b + i);
    }
}

/// Tracked destinations with per-address hit counters, sharded to keep lock
/// contention down when several workers process frames concurrently. Keys
/// are IPv4 addresses in wire byte order.
pub struct FlowTable {
    shards: Vec<Mutex<HashMap<u32, u16>>>,
    capacity: usize,
    len: AtomicUsize,
}

impl FlowTable {
    pub fn new(capacity: usize) -> Self {
        let mut shards = Vec::with_capacity(FLOW_SHARDS);
        for _ in 0..FLOW_SHARDS {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self {
            shards,
            capacity,
            len: AtomicUsize::new(0),
        }
    }

    fn shard_index(&self, key: u32) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len().max(1)
    }

    /// Installs or overwrites a tracked destination. Returns false when the
    /// table is full and the address is not already present.
    pub fn insert(&self, addr: u32, count: u16) -> bool {
        let idx = self.shard_index(addr);
        let mut guard = self.shards[idx].lock().expect("flow shard mutex poisoned");
        if let Some(entry) = guard.get_mut(&addr) {
            *entry = count;
            return true;
        }
        if self.len.fetch_add(1, Ordering::Relaxed) >= self.capacity {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        guard.insert(addr, count);
        true
    }

    /// Bumps the hit counter for a tracked destination and returns the new
    /// value, or None when the address is untracked. The counter wraps at
    /// 16 bits.
    pub fn lookup_and_increment(&self, addr: u32) -> Option<u16> {
        let idx = self.shard_index(addr);
        let mut guard = self.shards[idx].lock().expect("flow shard mutex poisoned");
        let entry = guard.get_mut(&addr)?;
        *entry = entry.wrapping_add(1);
        Some(*entry)
    }

    pub fn snapshot(&self) -> Vec<(u32, u16)> {
        let mut entries = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().expect("flow shard mutex poisoned");
            entries.extend(guard.iter().map(|(addr, count)| (*addr, *count)));
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natsteer_common::DEFAULT_SERVICE_PORT;

    const SRC_IP: [u8; 4] = [192, 0, 2, 17];
    const DST_IP: [u8; 4] = [10, 0, 0, 7];

    fn table_tracking(dst: [u8; 4], count: u16) -> FlowTable {
        let table = FlowTable::new(16);
        assert!(table.insert(u32::from_ne_bytes(dst), count));
        table
    }

    fn count_of(table: &FlowTable, dst: [u8; 4]) -> u16 {
        let key = u32::from_ne_bytes(dst);
        table
            .snapshot()
            .into_iter()
            .find(|(addr, _)| *addr == key)
            .map(|(_, count)| count)
            .expect("destination not tracked")
    }

    // Reference checksum, from scratch, over big-endian 16-bit words.
    fn internet_checksum(data: &[u8], initial: u32) -> u16 {
        let mut sum = initial;
        let mut chunks = data.chunks_exact(2);
        for chunk in &mut chunks {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        if let [last] = chunks.remainder() {
            sum += (*last as u32) << 8;
        }
        !csum::fold(sum)
    }

    fn udp_checksum(src: &[u8; 4], dst: &[u8; 4], udp: &[u8]) -> u16 {
        let mut pseudo = 0u32;
        pseudo += u16::from_be_bytes([src[0], src[1]]) as u32;
        pseudo += u16::from_be_bytes([src[2], src[3]]) as u32;
        pseudo += u16::from_be_bytes([dst[0], dst[1]]) as u32;
        pseudo += u16::from_be_bytes([dst[2], dst[3]]) as u32;
        pseudo += IPPROTO_UDP as u32;
        pseudo += udp.len() as u32;
        let check = internet_checksum(udp, pseudo);
        if check == 0 { 0xffff } else { check }
    }

    fn build_udp_frame(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        build_udp_frame_with_options(sport, dport, payload, 0)
    }

    fn build_udp_frame_with_options(
        sport: u16,
        dport: u16,
        payload: &[u8],
        options_len: usize,
    ) -> Vec<u8> {
        assert!(options_len % 4 == 0 && options_len <= 40);
        let ip_hlen = 20 + options_len;
        let udp_len = UDP_HLEN + payload.len();
        let total_len = ip_hlen + udp_len;

        let mut frame = Vec::with_capacity(ETH_HLEN + total_len);
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]); // dst mac
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]); // src mac
        frame.extend_from_slice(&ETH_P_IP.to_be_bytes());

        let mut ip = vec![0u8; ip_hlen];
        ip[0] = 0x40 | (ip_hlen / 4) as u8;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip[8] = 64; // ttl
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&SRC_IP);
        ip[16..20].copy_from_slice(&DST_IP);
        let check = internet_checksum(&ip, 0);
        ip[10..12].copy_from_slice(&check.to_be_bytes());
        frame.extend_from_slice(&ip);

        let mut udp = vec![0u8; udp_len];
        udp[0..2].copy_from_slice(&sport.to_be_bytes());
        udp[2..4].copy_from_slice(&dport.to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        udp[UDP_HLEN..].copy_from_slice(payload);
        let check = udp_checksum(&SRC_IP, &DST_IP, &udp);
        udp[6..8].copy_from_slice(&check.to_be_bytes());
        frame.extend_from_slice(&udp);

        frame
    }

    #[test]
    fn runt_frame_is_dropped() {
        let mut frame = vec![0u8; 10];
        let flows = FlowTable::new(16);
        assert_eq!(
            process(&mut frame, &flows, DEFAULT_SERVICE_PORT),
            Verdict::Drop(DropReason::InvalidFrame)
        );
    }

    #[test]
    fn truncated_ipv4_frame_is_dropped() {
        let mut frame = build_udp_frame(9000, DEFAULT_SERVICE_PORT, b"hi");
        frame.truncate(30);
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(
            process(&mut frame, &flows, DEFAULT_SERVICE_PORT),
            Verdict::Drop(DropReason::InvalidFrame)
        );
        assert_eq!(count_of(&flows, DST_IP), 0);
    }

    #[test]
    fn non_ipv4_ethertype_passes_untouched() {
        let mut frame = vec![0u8; 60];
        frame[ETH_TYPE_OFF..ETH_TYPE_OFF + 2].copy_from_slice(&0x0806u16.to_be_bytes()); // ARP
        let original = frame.clone();
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(process(&mut frame, &flows, DEFAULT_SERVICE_PORT), Verdict::Pass);
        assert_eq!(frame, original);
    }

    #[test]
    fn udp_to_another_port_passes_untouched() {
        let mut frame = build_udp_frame(9000, 53, b"query");
        let original = frame.clone();
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(process(&mut frame, &flows, DEFAULT_SERVICE_PORT), Verdict::Pass);
        assert_eq!(frame, original);
        assert_eq!(count_of(&flows, DST_IP), 0);
    }

    #[test]
    fn tcp_to_service_port_passes() {
        let mut frame = build_udp_frame(9000, DEFAULT_SERVICE_PORT, b"hi");
        frame[ETH_HLEN + IPV4_PROTO_OFF] = IPPROTO_TCP;
        let original = frame.clone();
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(process(&mut frame, &flows, DEFAULT_SERVICE_PORT), Verdict::Pass);
        assert_eq!(frame, original);
    }

    #[test]
    fn icmp_passes() {
        let mut frame = build_udp_frame(9000, DEFAULT_SERVICE_PORT, b"hi");
        frame[ETH_HLEN + IPV4_PROTO_OFF] = IPPROTO_ICMP;
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(process(&mut frame, &flows, DEFAULT_SERVICE_PORT), Verdict::Pass);
    }

    #[test]
    fn unknown_transport_passes() {
        let mut frame = build_udp_frame(9000, DEFAULT_SERVICE_PORT, b"hi");
        frame[ETH_HLEN + IPV4_PROTO_OFF] = 47; // GRE
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(process(&mut frame, &flows, DEFAULT_SERVICE_PORT), Verdict::Pass);
    }

    #[test]
    fn untracked_destination_passes_untouched() {
        let mut frame = build_udp_frame(9000, DEFAULT_SERVICE_PORT, b"hi");
        let original = frame.clone();
        let flows = FlowTable::new(16);
        assert_eq!(process(&mut frame, &flows, DEFAULT_SERVICE_PORT), Verdict::Pass);
        assert_eq!(frame, original);
    }

    #[test]
    fn tracked_destination_is_rewritten_and_redirected() {
        let mut frame = build_udp_frame(9000, DEFAULT_SERVICE_PORT, b"ping");
        let flows = table_tracking(DST_IP, 5);

        assert_eq!(
            process(&mut frame, &flows, DEFAULT_SERVICE_PORT),
            Verdict::Redirect
        );
        assert_eq!(count_of(&flows, DST_IP), 6);

        // Ethernet addresses swapped.
        assert_eq!(&frame[0..6], &[0x02, 0, 0, 0, 0, 0x02]);
        assert_eq!(&frame[6..12], &[0x02, 0, 0, 0, 0, 0x01]);
        // IPv4 addresses swapped.
        assert_eq!(&frame[ETH_HLEN + IPV4_SRC_OFF..ETH_HLEN + IPV4_SRC_OFF + 4], &DST_IP);
        assert_eq!(&frame[ETH_HLEN + IPV4_DST_OFF..ETH_HLEN + IPV4_DST_OFF + 4], &SRC_IP);
        // UDP ports swapped.
        let l4 = ETH_HLEN + 20;
        assert_eq!(read_u16(&frame, l4 + L4_SPORT_OFF), Some(DEFAULT_SERVICE_PORT));
        assert_eq!(read_u16(&frame, l4 + L4_DPORT_OFF), Some(9000));
        // The IPv4 header checksum still verifies after the rewrite.
        assert_eq!(internet_checksum(&frame[ETH_HLEN..ETH_HLEN + 20], 0), 0);
    }

    #[test]
    fn udp_checksum_matches_recomputation_after_rewrite() {
        let mut frame = build_udp_frame(9000, DEFAULT_SERVICE_PORT, b"payload");
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(
            process(&mut frame, &flows, DEFAULT_SERVICE_PORT),
            Verdict::Redirect
        );

        let l4 = ETH_HLEN + 20;
        let src: [u8; 4] = frame[ETH_HLEN + IPV4_SRC_OFF..ETH_HLEN + IPV4_SRC_OFF + 4]
            .try_into()
            .unwrap();
        let dst: [u8; 4] = frame[ETH_HLEN + IPV4_DST_OFF..ETH_HLEN + IPV4_DST_OFF + 4]
            .try_into()
            .unwrap();
        let stored = read_u16(&frame, l4 + UDP_CSUM_OFF).unwrap();
        let mut udp = frame[l4..].to_vec();
        udp[6..8].fill(0);
        assert_eq!(udp_checksum(&src, &dst, &udp), stored);
    }

    #[test]
    fn redirecting_twice_restores_the_original_bytes() {
        // Service-to-service traffic keeps the destination port eligible
        // after the swap, so the rewritten frame is admitted again.
        let mut frame = build_udp_frame(DEFAULT_SERVICE_PORT, DEFAULT_SERVICE_PORT, b"echo");
        let original = frame.clone();
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(
            process(&mut frame, &flows, DEFAULT_SERVICE_PORT),
            Verdict::Redirect
        );
        assert_ne!(frame, original);
        let flows_back = table_tracking(SRC_IP, 0);
        assert_eq!(
            process(&mut frame, &flows_back, DEFAULT_SERVICE_PORT),
            Verdict::Redirect
        );
        assert_eq!(frame, original);
    }

    #[test]
    fn zero_udp_checksum_stays_zero() {
        let mut frame = build_udp_frame(9000, DEFAULT_SERVICE_PORT, b"hi");
        let l4 = ETH_HLEN + 20;
        frame[l4 + UDP_CSUM_OFF..l4 + UDP_CSUM_OFF + 2].fill(0);
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(
            process(&mut frame, &flows, DEFAULT_SERVICE_PORT),
            Verdict::Redirect
        );
        assert_eq!(read_u16(&frame, l4 + UDP_CSUM_OFF), Some(0));
    }

    #[test]
    fn options_bearing_header_is_rewritten() {
        let mut frame = build_udp_frame_with_options(9000, DEFAULT_SERVICE_PORT, b"hi", 4);
        let flows = table_tracking(DST_IP, 0);
        assert_eq!(
            process(&mut frame, &flows, DEFAULT_SERVICE_PORT),
            Verdict::Redirect
        );
        let l4 = ETH_HLEN + 24;
        assert_eq!(read_u16(&frame, l4 + L4_SPORT_OFF), Some(DEFAULT_SERVICE_PORT));
        assert_eq!(read_u16(&frame, l4 + L4_DPORT_OFF), Some(9000));
    }

    #[test]
    fn hit_counter_wraps() {
        let flows = table_tracking(DST_IP, u16::MAX);
        let mut frame = build_udp_frame(9000, DEFAULT_SERVICE_PORT, b"hi");
        assert_eq!(
            process(&mut frame, &flows, DEFAULT_SERVICE_PORT),
            Verdict::Redirect
        );
        assert_eq!(count_of(&flows, DST_IP), 0);
    }

    #[test]
    fn flow_table_respects_capacity() {
        let table = FlowTable::new(2);
        assert!(table.insert(1, 0));
        assert!(table.insert(2, 0));
        assert!(!table.insert(3, 0));
        // Overwriting an existing entry does not consume capacity.
        assert!(table.insert(2, 9));
        assert_eq!(table.snapshot().len(), 2);
    }
}
