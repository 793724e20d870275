//! Process-wide log verbosity mask and hex-dump flag.
//!
//! Writers are rare (only the control plane mutates these) and readers
//! tolerate a stale value for a read or two, so plain atomics are enough;
//! no lock is needed.

use std::sync::atomic::{AtomicU8, Ordering};

/// Bit 1: INFO-level messages.
pub const LOG_MASK_INFO: u8 = 0b001;
/// Bit 2: TRACE-level messages.
pub const LOG_MASK_TRACE: u8 = 0b010;
/// Bit 4: DEBUG-level messages.
pub const LOG_MASK_DEBUG: u8 = 0b100;
pub const LOG_MASK_ALL: u8 = LOG_MASK_INFO | LOG_MASK_TRACE | LOG_MASK_DEBUG;
pub const LOG_MASK_NONE: u8 = 0;

static VERBOSITY: AtomicU8 = AtomicU8::new(LOG_MASK_NONE);
static DUMP_FLAG: AtomicU8 = AtomicU8::new(0);

pub fn set_verbosity(mask: u8) {
    VERBOSITY.store(mask & LOG_MASK_ALL, Ordering::Relaxed);
}

pub fn verbosity() -> u8 {
    VERBOSITY.load(Ordering::Relaxed)
}

pub fn info_enabled() -> bool {
    verbosity() & LOG_MASK_INFO != 0
}

pub fn trace_enabled() -> bool {
    verbosity() & LOG_MASK_TRACE != 0
}

pub fn debug_enabled() -> bool {
    verbosity() & LOG_MASK_DEBUG != 0
}

/// Toggles the dump flag, returning the new value.
pub fn toggle_dump_flag() -> bool {
    let prev = DUMP_FLAG.fetch_xor(1, Ordering::Relaxed);
    prev == 0
}

pub fn dump_flag() -> bool {
    DUMP_FLAG.load(Ordering::Relaxed) != 0
}

/// Hex-dump helper gated by the dump flag. Emitted at `trace` level so it
/// composes with the standard `log` facade instead of printing directly to
/// stdout.
pub fn dump(label: &str, bytes: &[u8]) {
    if !dump_flag() {
        return;
    }
    let mut line = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i != 0 && i % 16 == 0 {
            line.push('\n');
        }
        line.push_str(&format!(" {b:02X}"));
    }
    log::trace!("[DUMP] {label} ({} bytes)\n{line}", bytes.len());
}

/// Logs at INFO level, gated by the runtime verbosity mask rather than
/// `log`'s own static filter -- the mask is mutated at runtime by the
/// control plane (`"0".."7"` commands), which a compile-time `RUST_LOG`
/// filter cannot express.
#[macro_export]
macro_rules! engine_info {
    ($($arg:tt)+) => {
        if $crate::engine::log_state::info_enabled() {
            log::info!($($arg)+);
        }
    };
}

#[macro_export]
macro_rules! engine_trace {
    ($($arg:tt)+) => {
        if $crate::engine::log_state::trace_enabled() {
            log::trace!($($arg)+);
        }
    };
}

#[macro_export]
macro_rules! engine_debug {
    ($($arg:tt)+) => {
        if $crate::engine::log_state::debug_enabled() {
            log::debug!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_flag_toggle_twice_is_idempotent() {
        let start = dump_flag();
        toggle_dump_flag();
        toggle_dump_flag();
        assert_eq!(dump_flag(), start);
    }

    #[test]
    fn verbosity_mask_roundtrip() {
        set_verbosity(LOG_MASK_TRACE);
        assert!(trace_enabled());
        assert!(!info_enabled());
        set_verbosity(LOG_MASK_INFO | LOG_MASK_DEBUG);
        assert!(info_enabled());
        assert!(debug_enabled());
        assert!(!trace_enabled());
    }
}
