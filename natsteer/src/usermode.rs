use std::{
    ffi::CString,
    fs::File,
    io::{self, BufRead, BufReader},
    mem,
    net::Ipv4Addr,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    ptr, slice,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering, fence},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use chrono::Utc;
use log::warn;
use tokio::{signal, task, time};

use crate::pipeline::{self, FlowTable, Verdict};

const PACKET_OUTGOING: u8 = 4; // sll_pkttype for frames this host sent

pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 20; // 1 MiB
pub const DEFAULT_BLOCK_COUNT: u32 = 64;
pub const DEFAULT_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_BLOCK_TIMEOUT_MS: u32 = 100;

#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    pub block_size: u32,
    pub block_count: u32,
    pub frame_size: u32,
    pub block_timeout_ms: u32,
}

pub struct UsermodeOptions {
    pub iface: String,
    pub workers: usize,
    pub fanout_group: Option<u16>,
    pub service_port: u16,
    pub flow_capacity: usize,
    pub track: Vec<Ipv4Addr>,
    /// Optional file of additional destinations, one per line, `#` comments.
    pub track_file: Option<PathBuf>,
    pub report_interval: Duration,
    pub ring: RingConfig,
}

#[derive(Default)]
pub struct PipelineStats {
    passed: AtomicU64,
    redirected: AtomicU64,
    dropped: AtomicU64,
    truncated: AtomicU64,
    tx_failures: AtomicU64,
}

impl PipelineStats {
    fn record(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Pass => &self.passed,
            Verdict::Redirect => &self.redirected,
            Verdict::Drop(_) => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn read_address_list(path: &Path) -> Result<Vec<Ipv4Addr>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open address list at {}", path.display()))?;
    parse_address_lines(BufReader::new(file), &path.display().to_string())
}

fn parse_address_lines<R: BufRead>(reader: R, source: &str) -> Result<Vec<Ipv4Addr>> {
    let mut addrs = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line
            .with_context(|| format!("failed to read line {} of {source}", line_no + 1))?;
        let trimmed = line.split('#').next().unwrap_or("").trim();
        if trimmed.is_empty() {
            continue;
        }
        let addr: Ipv4Addr = trimmed.parse().with_context(|| {
            format!(
                "invalid IPv4 address '{}' on line {} of {source}",
                trimmed,
                line_no + 1
            )
        })?;
        addrs.push(addr);
    }
    Ok(addrs)
}

fn validate_ring_config(cfg: &RingConfig) -> Result<()> {
    if cfg.block_size == 0 || cfg.block_count == 0 || cfg.frame_size == 0 {
        return Err(anyhow!("ring parameters must be non-zero"));
    }
    if cfg.block_size % cfg.frame_size != 0 {
        return Err(anyhow!("block size must be a multiple of frame size"));
    }
    let alignment = libc::TPACKET_ALIGNMENT as u32;
    if cfg.block_size % alignment != 0 || cfg.frame_size % alignment != 0 {
        return Err(anyhow!(
            "block and frame sizes must be aligned to {} bytes",
            alignment
        ));
    }
    Ok(())
}

/// Runs the steering pipeline over an AF_PACKET ring instead of the
/// in-kernel program. Same decisions, same rewrites; redirected frames are
/// retransmitted through the capture socket.
pub async fn run_usermode_pipeline(opts: UsermodeOptions) -> Result<()> {
    if opts.workers == 0 {
        return Err(anyhow!("workers must be at least 1"));
    }
    if opts.report_interval.is_zero() {
        return Err(anyhow!("report interval must be greater than zero"));
    }
    ensure!(opts.service_port > 0, "service port must be non-zero");
    validate_ring_config(&opts.ring)?;

    let mut tracked = opts.track.clone();
    if let Some(path) = &opts.track_file {
        tracked.extend(read_address_list(path)?);
    }
    let flows = Arc::new(FlowTable::new(opts.flow_capacity));
    for addr in &tracked {
        ensure!(
            flows.insert(u32::from_ne_bytes(addr.octets()), 0),
            "flow table full while seeding {addr}"
        );
    }

    let stats = Arc::new(PipelineStats::default());
    let running = Arc::new(AtomicBool::new(true));

    let mut handles = Vec::with_capacity(opts.workers);
    for worker_id in 0..opts.workers {
        let iface = opts.iface.clone();
        let fanout = opts.fanout_group;
        let service_port = opts.service_port;
        let flows_clone = flows.clone();
        let stats_clone = stats.clone();
        let running_clone = running.clone();
        let ring_cfg = opts.ring;
        handles.push(task::spawn(async move {
            worker_loop(
                worker_id,
                &iface,
                fanout,
                service_port,
                running_clone,
                flows_clone,
                stats_clone,
                ring_cfg,
            )
            .await
        }));
    }

    let reporter_stats = stats.clone();
    let reporter_flows = flows.clone();
    let reporter_running = running.clone();
    let report_interval = opts.report_interval;
    let reporter = tokio::spawn(async move {
        let mut ticker = time::interval(report_interval);
        loop {
            ticker.tick().await;
            if !reporter_running.load(Ordering::Relaxed) {
                break;
            }
            log_report(&reporter_stats, &reporter_flows);
        }
    });

    signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    println!("Received shutdown signal, draining...");
    running.store(false, Ordering::Relaxed);

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(anyhow!("worker panicked: {err}")),
        }
    }

    reporter.abort();
    let _ = reporter.await;

    log_report(&stats, &flows);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    iface: &str,
    fanout_group: Option<u16>,
    service_port: u16,
    running: Arc<AtomicBool>,
    flows: Arc<FlowTable>,
    stats: Arc<PipelineStats>,
    ring_cfg: RingConfig,
) -> Result<()> {
    let mut socket = PacketSocket::bind(iface, fanout_group, ring_cfg)
        .with_context(|| format!("worker {worker_id}: failed to bind packet socket"))?;
    socket.pump(&running, service_port, &flows, &stats).await
}

struct PacketSocket {
    fd: OwnedFd,
    ring: PacketRing,
}

impl PacketSocket {
    fn bind(iface: &str, fanout_group: Option<u16>, ring_cfg: RingConfig) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("failed to create packet socket");
        }

        let owned_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let version: libc::c_int = libc::tpacket_versions::TPACKET_V3 as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                owned_fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_VERSION,
                &version as *const _ as *const libc::c_void,
                mem::size_of_val(&version) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to enable TPACKET_V3");
        }

        bind_interface(owned_fd.as_raw_fd(), iface, protocol)?;
        configure_fanout(owned_fd.as_raw_fd(), fanout_group)?;

        let ring = PacketRing::new(owned_fd.as_raw_fd(), ring_cfg)?;

        Ok(Self { fd: owned_fd, ring })
    }

    async fn pump(
        &mut self,
        running: &AtomicBool,
        service_port: u16,
        flows: &FlowTable,
        stats: &PipelineStats,
    ) -> Result<()> {
        let block_nr = self.ring.block_count() as usize;
        while running.load(Ordering::Relaxed) {
            let mut made_progress = false;
            for _ in 0..block_nr {
                if self
                    .ring
                    .consume_next_block(self.fd.as_raw_fd(), service_port, flows, stats)?
                {
                    made_progress = true;
                }
            }

            // If we didn't make any progress, wait for the socket to be readable
            if !made_progress {
                wait_for_read(self.fd.as_raw_fd()).await?;
            }
        }

        Ok(())
    }
}

fn bind_interface(fd: RawFd, iface: &str, protocol: u16) -> Result<()> {
    let ifname = CString::new(iface)?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error()).context("failed to lookup interface index");
    }

    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as libc::c_int;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("failed to bind packet socket");
    }

    Ok(())
}

fn configure_fanout(fd: RawFd, fanout_group: Option<u16>) -> Result<()> {
    if let Some(group) = fanout_group {
        let fanout_type = libc::PACKET_FANOUT_HASH;
        let val: u32 = (group as u32) | (fanout_type << 16);
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_FANOUT,
                &val as *const _ as *const libc::c_void,
                mem::size_of_val(&val) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to configure PACKET_FANOUT");
        }
    }

    Ok(())
}

struct PacketRing {
    base: *mut u8,
    len: usize,
    req: libc::tpacket_req3,
    current_block: u32,
}

// This is safe because each PacketRing is tied to a single PacketSocket, and each PacketSocket is
// only owned by a single thread.
unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

impl PacketRing {
    fn new(fd: RawFd, cfg: RingConfig) -> Result<Self> {
        if cfg.block_count == 0 {
            return Err(anyhow!("block count must be greater than zero"));
        }
        if cfg.block_size == 0 {
            return Err(anyhow!("block size must be greater than zero"));
        }
        if cfg.frame_size > cfg.block_size {
            return Err(anyhow!("frame size must be <= block size"));
        }
        let frames_per_block = cfg.block_size / cfg.frame_size;
        if frames_per_block == 0 {
            return Err(anyhow!("frame size does not fit within block"));
        }
        let frame_nr = frames_per_block
            .checked_mul(cfg.block_count)
            .ok_or_else(|| anyhow!("ring size overflow"))?;

        let req = libc::tpacket_req3 {
            tp_block_size: cfg.block_size,
            tp_block_nr: cfg.block_count,
            tp_frame_size: cfg.frame_size,
            tp_frame_nr: frame_nr,
            tp_retire_blk_tov: cfg.block_timeout_ms,
            tp_sizeof_priv: 0,
            tp_feature_req_word: libc::TP_FT_REQ_FILL_RXHASH,
        };

        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_RX_RING,
                &req as *const _ as *const libc::c_void,
                mem::size_of::<libc::tpacket_req3>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to configure PACKET_RX_RING");
        }

        let len = (req.tp_block_size as usize)
            .checked_mul(req.tp_block_nr as usize)
            .ok_or_else(|| anyhow!("ring mmap length overflow"))?;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).context("failed to mmap PACKET_RX_RING");
        }

        Ok(Self {
            base: base as *mut u8,
            len,
            req,
            current_block: 0,
        })
    }

    fn block_count(&self) -> u32 {
        self.req.tp_block_nr
    }

    fn block_size(&self) -> usize {
        self.req.tp_block_size as usize
    }

    fn consume_next_block(
        &mut self,
        fd: RawFd,
        service_port: u16,
        flows: &FlowTable,
        stats: &PipelineStats,
    ) -> Result<bool> {
        let idx = self.current_block;
        self.current_block = (self.current_block + 1) % self.req.tp_block_nr.max(1);
        self.consume_block(idx, fd, service_port, flows, stats)
    }

    fn consume_block(
        &mut self,
        idx: u32,
        fd: RawFd,
        service_port: u16,
        flows: &FlowTable,
        stats: &PipelineStats,
    ) -> Result<bool> {
        let block_ptr = unsafe { self.base.add(idx as usize * self.block_size()) };
        let desc = block_ptr as *mut libc::tpacket_block_desc;
        let status = unsafe { (*desc).hdr.bh1.block_status };
        if status & libc::TP_STATUS_USER == 0 {
            return Ok(false);
        }

        fence(Ordering::Acquire);
        unsafe {
            let hdr = &mut (*desc).hdr.bh1;
            let mut offset = hdr.offset_to_first_pkt as usize;
            let block_size = self.block_size();
            for _ in 0..hdr.num_pkts {
                if offset >= block_size {
                    break;
                }
                let frame_ptr = block_ptr.add(offset) as *mut libc::tpacket3_hdr;
                let next = (*frame_ptr).tp_next_offset as usize;
                let snaplen = (*frame_ptr).tp_snaplen as usize;
                let packet_len = (*frame_ptr).tp_len as usize;
                let mac = (*frame_ptr).tp_mac as usize;
                if snaplen == 0 {
                    break;
                }
                let data_offset = offset + mac;
                if data_offset >= block_size || data_offset + snaplen > block_size {
                    break;
                }
                // Frames we retransmit come back through the tap as outgoing
                // copies; consuming those again would loop forever.
                if frame_pkttype(frame_ptr) != PACKET_OUTGOING {
                    let data = slice::from_raw_parts(block_ptr.add(data_offset), snaplen);
                    handle_frame(data, packet_len, fd, service_port, flows, stats);
                }
                if next == 0 {
                    break;
                }
                offset += next;
            }
            hdr.block_status = libc::TP_STATUS_KERNEL;
        }
        fence(Ordering::Release);
        Ok(true)
    }
}

impl Drop for PacketRing {
    fn drop(&mut self) {
        if !self.base.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Reads `sll_pkttype` from the sockaddr_ll the kernel places after the
/// frame header.
unsafe fn frame_pkttype(frame_ptr: *const libc::tpacket3_hdr) -> u8 {
    let sll = (frame_ptr as *const u8).add(tpacket_align(mem::size_of::<libc::tpacket3_hdr>()))
        as *const libc::sockaddr_ll;
    (*sll).sll_pkttype
}

fn tpacket_align(len: usize) -> usize {
    let alignment = libc::TPACKET_ALIGNMENT as usize;
    (len + alignment - 1) & !(alignment - 1)
}

fn handle_frame(
    data: &[u8],
    packet_len: usize,
    fd: RawFd,
    service_port: u16,
    flows: &FlowTable,
    stats: &PipelineStats,
) {
    // A truncated capture cannot be rewritten and retransmitted faithfully.
    if data.len() < packet_len {
        stats.truncated.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let mut frame = data.to_vec();
    let verdict = pipeline::process(&mut frame, flows, service_port);
    stats.record(verdict);
    if verdict == Verdict::Redirect && !transmit(fd, &frame) {
        stats.tx_failures.fetch_add(1, Ordering::Relaxed);
    }
}

fn transmit(fd: RawFd, frame: &[u8]) -> bool {
    let rc = unsafe {
        libc::send(
            fd,
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            0,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            warn!("failed to transmit redirected frame: {err}");
        }
        return false;
    }
    true
}

async fn wait_for_read(fd: RawFd) -> Result<()> {
    use tokio::io::unix::AsyncFd;

    let async_fd = AsyncFd::new(fd).context("failed to create AsyncFd")?;
    loop {
        let mut guard = async_fd
            .readable()
            .await
            .context("failed to wait for socket readability")?;
        match guard.try_io(|_| Ok(())) {
            Ok(result) => {
                result?;
                return Ok(());
            }
            Err(_would_block) => continue,
        }
    }
}

fn log_report(stats: &PipelineStats, flows: &FlowTable) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    println!(
        "[{timestamp}] passed: {} redirected: {} dropped: {} truncated: {} tx_failures: {}",
        stats.passed.load(Ordering::Relaxed),
        stats.redirected.load(Ordering::Relaxed),
        stats.dropped.load(Ordering::Relaxed),
        stats.truncated.load(Ordering::Relaxed),
        stats.tx_failures.load(Ordering::Relaxed),
    );
    let mut entries = flows.snapshot();
    entries.sort_unstable();
    for (addr, count) in entries {
        println!(
            "[{timestamp}] flow {} - hits {count}",
            Ipv4Addr::from(addr.to_ne_bytes())
        );
    }
}
