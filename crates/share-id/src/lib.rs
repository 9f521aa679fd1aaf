//! Monotonic, sortable, prefixed identifiers for sessions, messages, and parts.
//!
//! Each id packs a 48-bit millisecond timestamp and a 12-bit intra-millisecond
//! counter into a single 60-bit sortable prefix, followed by 14 bytes of
//! cryptographic random. Ascending ids sort in creation order; descending ids
//! bitwise-complement the sortable prefix so lexicographic order matches
//! reverse chronological order (used for session listing).

use rand::RngCore;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const COUNTER_BITS: u32 = 12;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;
const RANDOM_BYTES: usize = 14;

/// The three id kinds this service mints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Session,
    Message,
    Part,
}

impl Kind {
    pub fn prefix(self) -> &'static str {
        match self {
            Kind::Session => "ses",
            Kind::Message => "msg",
            Kind::Part => "prt",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid id: {0}")]
pub struct InvalidId(pub String);

struct TickState {
    last_ms: u64,
    counter: u64,
}

static STATE: Mutex<TickState> = Mutex::new(TickState {
    last_ms: 0,
    counter: 0,
});

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Allocate the next (timestamp, counter) pair, blocking briefly if the
/// 12-bit counter would overflow within the current millisecond.
fn next_tick() -> (u64, u64) {
    loop {
        let mut state = STATE.lock().expect("id generator mutex poisoned");
        let ms = now_ms();
        if ms != state.last_ms {
            state.last_ms = ms;
            state.counter = 0;
            return (ms, 0);
        }
        if state.counter < COUNTER_MASK {
            state.counter += 1;
            return (ms, state.counter);
        }
        // Counter exhausted for this millisecond; drop the lock and spin
        // until the clock ticks forward.
        drop(state);
        std::thread::yield_now();
    }
}

fn sortable_prefix(ms: u64, counter: u64, descending: bool) -> u64 {
    let packed = ((ms & ((1u64 << 48) - 1)) << COUNTER_BITS) | (counter & COUNTER_MASK);
    if descending {
        !packed
    } else {
        packed
    }
}

fn render(prefix: &str, sortable: u64, random: &[u8; RANDOM_BYTES]) -> String {
    let mut out = String::with_capacity(prefix.len() + 1 + 16 + RANDOM_BYTES * 2);
    out.push_str(prefix);
    out.push('_');
    out.push_str(&format!("{:016x}", sortable));
    for b in random {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn generate(kind: Kind, descending: bool) -> String {
    let (ms, counter) = next_tick();
    let sortable = sortable_prefix(ms, counter, descending);
    let mut random = [0u8; RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut random);
    render(kind.prefix(), sortable, &random)
}

/// Generate an id whose lexicographic order matches creation order.
pub fn ascending(kind: Kind) -> String {
    generate(kind, false)
}

/// Generate an id whose lexicographic order is the reverse of creation order.
pub fn descending(kind: Kind) -> String {
    generate(kind, true)
}

/// Verify that `id` carries the prefix expected for `kind`.
pub fn validate(id: &str, kind: Kind) -> Result<(), InvalidId> {
    let expected = kind.prefix();
    let rest = id
        .strip_prefix(expected)
        .and_then(|r| r.strip_prefix('_'))
        .ok_or_else(|| InvalidId(id.to_owned()))?;
    if rest.len() != 16 + RANDOM_BYTES * 2 || !rest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(InvalidId(id.to_owned()));
    }
    Ok(())
}
