#![no_std]
#![no_main]

mod steer;

use aya_ebpf::bindings::TC_ACT_SHOT;
use aya_ebpf::macros::{classifier, map};
use aya_ebpf::maps::{Array, HashMap, PerfEventArray};
use aya_ebpf::programs::TcContext;
use natsteer_common::{FlowKey, FlowRecord, RuntimeConfig, TraceEvent, FLOW_MAP_MAX_ENTRIES};

/// Tracked destination addresses. Entries are installed and removed by the
/// userspace control plane; the program only looks up and counts.
#[map(name = "natsteer_flows")]
static NATSTEER_FLOWS: HashMap<FlowKey, FlowRecord> =
    HashMap::<FlowKey, FlowRecord>::with_max_entries(FLOW_MAP_MAX_ENTRIES, 0);

/// Single-slot runtime config written by the loader.
#[map(name = "natsteer_config")]
static NATSTEER_CONFIG: Array<RuntimeConfig> = Array::<RuntimeConfig>::with_max_entries(1, 0);

/// Trace events consumed (best effort) by the userspace agent.
#[map(name = "natsteer_events")]
static NATSTEER_EVENTS: PerfEventArray<TraceEvent> = PerfEventArray::<TraceEvent>::new(0);

#[classifier]
pub fn natsteer(mut ctx: TcContext) -> i32 {
    match steer::try_steer(&mut ctx) {
        Ok(action) => action,
        // A failed or half-rewritten frame must never reach the stack.
        Err(_) => TC_ACT_SHOT,
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
