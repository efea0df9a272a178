//! Timestamp counter calibration.
//!
//! The cycle counter is used for timing only when the processor advertises an
//! invariant counter. Its rate is taken from the model-name frequency the OS
//! reports, or measured against the wall clock when that report is missing
//! or inconsistent.
#![allow(unsafe_code)]

use std::fs;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, trace};
use once_cell::race::OnceBox;

use crate::cpuid::{CpuidSource, LEAF_EXTENDED_MAX, LEAF_INVARIANT_TSC, NativeCpuid};

/// Relative agreement required between the running average and the latest
/// sample before calibration stops (5 significant digits).
const MEASURE_ACCURACY: f64 = 1e-5;
/// Upper bound on the convergence phase.
const MEASURE_MAX_TIME: Duration = Duration::from_millis(1);
const STABILIZE_ROUNDS: usize = 10;

/// Rate of the generic microsecond clock used without an invariant counter.
pub const GENERIC_CLOCKS_PER_SEC: f64 = 1.0e6;

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// True if the processor advertises a constant-rate cycle counter.
pub fn has_invariant_counter(src: &impl CpuidSource) -> bool {
    let max_ext = src.query(LEAF_EXTENDED_MAX, 0).eax;
    if max_ext > LEAF_INVARIANT_TSC && src.query(LEAF_INVARIANT_TSC, 0).edx & (1 << 8) != 0 {
        return true;
    }

    debug!("CPU does not support invariant TSC, using fallback timer");
    false
}

// =============================================================================
// REPORTED FREQUENCY
// =============================================================================

/// Frequency in Hz from `model name ... @ X.XXGHz` lines of a cpuinfo dump.
///
/// Returns `None` if no line carries a frequency, or if any processor reports
/// less than the maximum seen so far (mixed-frequency system).
pub fn frequency_from_cpuinfo(text: &str) -> Option<f64> {
    let mut max_ghz = 0.0f64;

    for line in text.lines() {
        let Some(rest) = line.strip_prefix("model name") else {
            continue;
        };
        if !rest.trim_start().starts_with(':') {
            continue;
        }
        let Some((_, rate)) = line.rsplit_once('@') else {
            continue;
        };
        let Some(ghz) = rate
            .trim()
            .strip_suffix("GHz")
            .and_then(|v| v.trim().parse::<f64>().ok())
        else {
            continue;
        };

        max_ghz = max_ghz.max(ghz);
        if max_ghz != ghz {
            debug!("Conflicting CPU frequencies detected, using fallback timer");
            return None;
        }
    }

    (max_ghz > 0.0).then_some(max_ghz * 1e9)
}

/// Frequency reported by the OS for all logical processors.
pub fn frequency_from_system_report() -> Option<f64> {
    let text = fs::read_to_string(CPUINFO_PATH).ok()?;
    frequency_from_cpuinfo(&text)
}

// =============================================================================
// MEASURED FREQUENCY
// =============================================================================

/// A cycle counter paired with a wall clock.
pub trait CycleClock {
    /// Current cycle counter value.
    fn cycles(&self) -> u64;
    /// Wall-clock time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// The processor's timestamp counter against the OS clock.
#[derive(Debug)]
pub struct TscClock {
    origin: Instant,
}

impl TscClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TscClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleClock for TscClock {
    #[inline]
    fn cycles(&self) -> u64 {
        // SAFETY: RDTSC is available on every x86_64 processor.
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    #[inline]
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Measure the counter rate of `clock` in Hz.
///
/// The start point is the sample whose bracketing counter reads were closest
/// together, which filters out scheduling noise. Sampling then continues until
/// the latest rate agrees with the running average, or the time budget runs
/// out. Returns the latest rate.
pub fn measure_frequency_with(clock: &impl CycleClock) -> f64 {
    let mut min_diff = u64::MAX;
    let mut start_cycles = 0u64;
    let mut start_time = Duration::ZERO;

    for _ in 0..STABILIZE_ROUNDS {
        let before = clock.cycles();
        let now = clock.now();
        let after = clock.cycles();
        let diff = after.wrapping_sub(before);
        if diff < min_diff {
            min_diff = diff;
            start_time = now;
            start_cycles = after;
        }
    }

    let mut avg_freq = 0.0f64;
    let mut curr_freq = 1.0f64;
    let (end_time, end_cycles) = loop {
        let now = clock.now();
        let cycles = clock.cycles();
        let elapsed = now.saturating_sub(start_time);

        // Only a sample where the clock actually moved says anything.
        if !elapsed.is_zero() {
            curr_freq = cycles.wrapping_sub(start_cycles) as f64 / elapsed.as_secs_f64();
            avg_freq = (avg_freq + curr_freq) / 2.0;
        }

        let converged =
            (curr_freq - avg_freq).abs() <= curr_freq.max(avg_freq) * MEASURE_ACCURACY;
        if converged || elapsed >= MEASURE_MAX_TIME {
            break (now, cycles);
        }
    };

    trace!(
        "tsc measure start {:?} {} (diff {}) end {:?} {}",
        start_time, start_cycles, min_diff, end_time, end_cycles
    );
    debug!(
        "measured tsc frequency {:.3} MHz after {:.2} ms",
        curr_freq * 1e-6,
        end_time.saturating_sub(start_time).as_secs_f64() * 1e3
    );

    curr_freq
}

/// Measure the timestamp counter rate of the running processor.
pub fn frequency_measured() -> f64 {
    measure_frequency_with(&TscClock::new())
}

// =============================================================================
// PROCESS-WIDE STATE
// =============================================================================

/// Whether counter-based timing is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    /// Not calibrated yet.
    Unknown,
    Yes,
    No,
}

/// Calibration result. `frequency_hz` is meaningful only when
/// `invariant_counter` is `Yes`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingState {
    pub invariant_counter: CounterState,
    pub frequency_hz: f64,
}

static TIMING: OnceBox<TimingState> = OnceBox::new();

/// Current calibration state without triggering calibration.
pub fn timing_state() -> TimingState {
    TIMING.get().copied().unwrap_or(TimingState {
        invariant_counter: CounterState::Unknown,
        frequency_hz: 0.0,
    })
}

/// Calibrate once. Later calls return the published state.
pub fn init_timing_state() -> &'static TimingState {
    TIMING.get_or_init(|| {
        let state = if has_invariant_counter(&NativeCpuid) {
            let frequency_hz = match frequency_from_system_report() {
                Some(freq) if freq > 0.0 => freq,
                _ => frequency_measured(),
            };
            TimingState {
                invariant_counter: CounterState::Yes,
                frequency_hz,
            }
        } else {
            TimingState {
                invariant_counter: CounterState::No,
                frequency_hz: 0.0,
            }
        };
        Box::new(state)
    })
}

/// Ticks per second of [`read_clock`].
pub fn clocks_per_sec() -> f64 {
    let state = init_timing_state();
    if state.invariant_counter == CounterState::Yes {
        state.frequency_hz
    } else {
        GENERIC_CLOCKS_PER_SEC
    }
}

/// High-resolution clock: the cycle counter when calibrated, otherwise
/// microseconds since the Unix epoch.
pub fn read_clock() -> u64 {
    if init_timing_state().invariant_counter == CounterState::Yes {
        // SAFETY: RDTSC is available on every x86_64 processor.
        unsafe { core::arch::x86_64::_rdtsc() }
    } else {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuid::Registers;
    use crate::cpuid::fake::{FakeCpuid, GENUINE_INTEL};
    use core::cell::Cell;

    /// Advances 1us per wall-clock read; the counter is a function of time.
    struct FakeClock {
        ns: Cell<u64>,
        counter: fn(u64) -> u64,
        reads: Cell<usize>,
    }

    impl FakeClock {
        fn new(counter: fn(u64) -> u64) -> Self {
            Self {
                ns: Cell::new(0),
                counter,
                reads: Cell::new(0),
            }
        }
    }

    impl CycleClock for FakeClock {
        fn cycles(&self) -> u64 {
            (self.counter)(self.ns.get())
        }

        fn now(&self) -> Duration {
            self.reads.set(self.reads.get() + 1);
            self.ns.set(self.ns.get() + 1000);
            Duration::from_nanos(self.ns.get())
        }
    }

    #[test]
    fn test_measure_converges_on_constant_rate() {
        let clock = FakeClock::new(|ns| ns * 3);
        let freq = measure_frequency_with(&clock);
        assert!((freq - 3.0e9).abs() / 3.0e9 < 1e-6, "got {freq}");
        // converges long before the 1ms budget
        assert!(clock.ns.get() < 200_000);
    }

    #[test]
    fn test_measure_is_time_bounded() {
        // Rate keeps climbing, so the average never catches up.
        let clock = FakeClock::new(|ns| ns * ns / 1000);
        let freq = measure_frequency_with(&clock);
        assert!(freq.is_finite() && freq > 0.0);
        assert!(clock.ns.get() <= 1_100_000, "ran {} ns", clock.ns.get());
        assert!(clock.reads.get() > 100);
    }

    #[test]
    fn test_measure_native_counter() {
        let freq = frequency_measured();
        assert!(freq.is_finite() && freq > 0.0);
    }

    #[test]
    fn test_cpuinfo_single_frequency() {
        let text = "processor\t: 0\nmodel name\t: Intel(R) Xeon(R) CPU E5-2680 v2 @ 2.80GHz\n\
                    processor\t: 1\nmodel name\t: Intel(R) Xeon(R) CPU E5-2680 v2 @ 2.80GHz\n";
        let freq = frequency_from_cpuinfo(text).unwrap();
        assert!((freq - 2.8e9).abs() < 1.0, "got {freq}");
    }

    #[test]
    fn test_cpuinfo_conflicting_frequencies() {
        let text = "model name\t: Fake CPU @ 3.00GHz\nmodel name\t: Fake CPU @ 2.00GHz\n";
        assert_eq!(frequency_from_cpuinfo(text), None);

        // A later, higher value only raises the maximum.
        let text = "model name\t: Fake CPU @ 2.00GHz\nmodel name\t: Fake CPU @ 3.00GHz\n";
        assert_eq!(frequency_from_cpuinfo(text), Some(3.0e9));
    }

    #[test]
    fn test_cpuinfo_without_frequency() {
        assert_eq!(frequency_from_cpuinfo(""), None);
        let text = "model name\t: AMD EPYC 7742 64-Core Processor\nflags\t: fpu @ 1.0GHz\n";
        assert_eq!(frequency_from_cpuinfo(text), None);
        let text = "model name\t: Fake @ fastGHz\n";
        assert_eq!(frequency_from_cpuinfo(text), None);
    }

    #[test]
    fn test_invariant_counter_detection() {
        let mut fake = FakeCpuid::with_vendor(0xd, GENUINE_INTEL);
        fake.set(LEAF_EXTENDED_MAX, 0, Registers::new(0x8000_0008, 0, 0, 0));
        fake.set(LEAF_INVARIANT_TSC, 0, Registers::new(0, 0, 0, 1 << 8));
        assert!(has_invariant_counter(&fake));

        fake.set(LEAF_INVARIANT_TSC, 0, Registers::new(0, 0, 0, 0));
        assert!(!has_invariant_counter(&fake));

        // max extended leaf too low: the feature bit is not consulted
        fake.set(LEAF_EXTENDED_MAX, 0, Registers::new(0x8000_0007, 0, 0, 0));
        fake.set(LEAF_INVARIANT_TSC, 0, Registers::new(0, 0, 0, 1 << 8));
        assert!(!has_invariant_counter(&fake));
    }

    #[test]
    fn test_clocks_per_sec_is_stable() {
        let first = clocks_per_sec();
        assert!(first.is_finite() && first > 0.0);
        assert_eq!(clocks_per_sec(), first);
        assert_ne!(timing_state().invariant_counter, CounterState::Unknown);
    }

    #[test]
    fn test_read_clock_advances() {
        let a = read_clock();
        std::thread::sleep(Duration::from_millis(2));
        let b = read_clock();
        assert!(b > a);
    }
}
