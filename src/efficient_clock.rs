#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::_rdtsc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

/// High-precision timestamp utilities for the logging hot path.
///
/// Records carry raw counter values; turning them into seconds happens only
/// in the decompressor, using the calibration stored in the file header.

/// How long the one-off calibration watches the counter.
const CALIBRATION_WINDOW: Duration = Duration::from_millis(10);

lazy_static! {
    static ref CYCLES_PER_SECOND: u64 = calibrate();
}

/// Returns a monotonic timestamp with the highest precision available.
///
/// This function uses architecture-specific instructions when available:
/// - x86_64: RDTSC instruction (CPU time stamp counter)
/// - aarch64: CNTVCT_EL0 register (ARM virtual counter)
/// - Other platforms: System time with nanosecond precision
///
/// # Performance
///
/// - On x86_64: ~25 CPU cycles
/// - On aarch64: ~10-20 CPU cycles
/// - Other platforms: Varies by OS
#[inline(always)]
pub fn get_timestamp() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _rdtsc()
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        let mut value: u64;
        std::arch::asm!("mrs {}, cntvct_el0", out(reg) value);
        value
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Number of `get_timestamp` ticks per wall-clock second.
///
/// Measured once per process (the first call blocks for about 10ms) and
/// written into every log file header so the decompressor can convert
/// cycle counts without access to the machine that produced them.
pub fn cycles_per_second() -> u64 {
    *CYCLES_PER_SECOND
}

fn calibrate() -> u64 {
    let wall_start = Instant::now();
    let start = get_timestamp();
    while wall_start.elapsed() < CALIBRATION_WINDOW {
        std::hint::spin_loop();
    }
    let ticks = get_timestamp().saturating_sub(start);
    let nanos = wall_start.elapsed().as_nanos().max(1);
    let rate = (ticks as u128 * 1_000_000_000 / nanos) as u64;
    // A counter that did not move would make every conversion divide by zero.
    rate.max(1)
}

/// Converts a tick count into a duration using the given calibration.
///
/// ```
/// # use nanolog::efficient_clock::cycles_to_duration;
/// use std::time::Duration;
/// assert_eq!(cycles_to_duration(3_000_000_000, 2_000_000_000), Duration::from_millis(1500));
/// ```
pub fn cycles_to_duration(cycles: u64, cycles_per_second: u64) -> Duration {
    let cps = cycles_per_second.max(1);
    let secs = cycles / cps;
    let rem = cycles % cps;
    let nanos = (rem as u128 * 1_000_000_000 / cps as u128) as u32;
    Duration::new(secs, nanos)
}
