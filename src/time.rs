//! Wall-clock time-tags and clock tracking
//!
//! Streams are scheduled against OSC (NTP-format) time-tags supplied by the
//! host with every audio tick. A delay-locked loop smooths those jittery
//! timestamps into an effective sample-rate estimate, and a moving-average
//! guard watches for abnormally long DSP periods caused by host scheduling
//! hiccups.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const FRACTION_SCALE: f64 = 4_294_967_296.0; // 2^32

/// 64-bit NTP-format time-tag: upper 32 bits are seconds since 1900,
/// lower 32 bits are the binary fraction of a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeTag(pub u64);

impl TimeTag {
    /// Read the current wall-clock time.
    pub fn now() -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seconds = unix.as_secs() + NTP_UNIX_OFFSET;
        let fraction = (unix.subsec_nanos() as f64 * FRACTION_SCALE / 1e9) as u64;
        Self((seconds << 32) | (fraction & 0xffff_ffff))
    }

    /// Build a time-tag from seconds since the NTP epoch.
    pub fn from_seconds(s: f64) -> Self {
        let seconds = s.floor() as u64;
        let fraction = ((s - s.floor()) * FRACTION_SCALE) as u64;
        Self((seconds << 32) | (fraction & 0xffff_ffff))
    }

    /// Seconds since the NTP epoch.
    pub fn to_seconds(self) -> f64 {
        let seconds = self.0 >> 32;
        let fraction = self.0 & 0xffff_ffff;
        seconds as f64 + fraction as f64 / FRACTION_SCALE
    }

    /// Signed duration `b - a` in seconds.
    pub fn duration(a: TimeTag, b: TimeTag) -> f64 {
        b.to_seconds() - a.to_seconds()
    }

    /// An all-zero tag marks "no sample seen yet".
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Delay-locked loop tracking the effective sample rate of a running stream.
///
/// Second-order filter after Fons Adriaensen's DLL design: each observed
/// block boundary time nudges the predicted period so that `sample_rate()`
/// converges on the rate the clock actually delivers, rather than the
/// nominal one.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeDll {
    block_size: f64,
    nominal_period: f64,
    b: f64,
    c: f64,
    t0: f64,
    t1: f64,
    e2: f64,
}

impl TimeDll {
    /// Initialize the loop for a nominal rate and block size.
    ///
    /// `bandwidth` is the loop bandwidth in (0, 1]; smaller values track
    /// more slowly but reject more jitter.
    pub fn setup(&mut self, sample_rate: f64, block_size: f64, bandwidth: f64, t: f64) {
        self.block_size = block_size;
        self.nominal_period = block_size / sample_rate;
        // bandwidth is normalized to the update rate, not to wall time
        let omega = 2.0 * std::f64::consts::PI * bandwidth;
        self.b = std::f64::consts::SQRT_2 * omega;
        self.c = omega * omega;
        self.e2 = self.nominal_period;
        self.t0 = t;
        self.t1 = t + self.e2;
    }

    /// Advance the filter with the observed time of the next block boundary.
    pub fn update(&mut self, t: f64) {
        let e = t - self.t1;
        // A wall-clock leap of several periods means the stream was
        // suspended; re-anchor instead of slewing through the gap.
        if e.abs() > 16.0 * self.nominal_period {
            tracing::debug!("time DLL re-anchored after {:.3} s gap", e);
            self.e2 = self.nominal_period;
            self.t0 = t - self.e2;
            self.t1 = t;
            return;
        }
        self.t0 = self.t1;
        self.t1 += self.b * e + self.e2;
        self.e2 += self.c * e;
    }

    /// Current period estimate in seconds per block.
    pub fn period(&self) -> f64 {
        self.t1 - self.t0
    }

    /// Current sample-rate estimate in samples per second.
    pub fn sample_rate(&self) -> f64 {
        self.block_size / self.period()
    }
}

/// Verdict of a [`Timer`] update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerState {
    /// First sample after construction or reset; the baseline was (re)taken.
    Reset,
    /// Tick cadence within tolerance.
    Ok,
    /// The average period exceeded the nominal period beyond tolerance;
    /// carries the excess of the last delta in seconds.
    Error(f64),
}

const TIMER_WINDOW: usize = 64; // power of two
const TIMER_TOLERANCE: f64 = 0.25;

/// Moving-average guard over audio-tick periods.
///
/// Ring-buffer schedulers compute several DSP blocks back to back, so
/// individual deltas swing wildly while their mean stays at the nominal
/// period. Only a drifting *mean* indicates that ticks took too long and
/// the owning clock must restart.
#[derive(Debug, Clone)]
pub struct Timer {
    last: TimeTag,
    elapsed: f64,
    nominal_delta: f64,
    deltas: [f64; TIMER_WINDOW],
    sum: f64,
    head: usize,
}

impl Timer {
    pub fn new(sample_rate: f64, block_size: f64) -> Self {
        let nominal_delta = block_size / sample_rate;
        let mut timer = Self {
            last: TimeTag::default(),
            elapsed: 0.0,
            nominal_delta,
            deltas: [0.0; TIMER_WINDOW],
            sum: 0.0,
            head: 0,
        };
        timer.reset();
        timer
    }

    /// Forget the baseline; the next update yields [`TimerState::Reset`].
    pub fn reset(&mut self) {
        self.last = TimeTag::default();
        self.elapsed = 0.0;
        self.deltas.fill(self.nominal_delta);
        self.sum = self.nominal_delta * TIMER_WINDOW as f64;
        self.head = 0;
    }

    /// Seconds elapsed since the baseline tick.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Feed the next tick time-tag and check the cadence.
    pub fn update(&mut self, t: TimeTag) -> TimerState {
        if self.last.is_empty() {
            self.last = t;
            return TimerState::Reset;
        }

        let delta = TimeTag::duration(self.last, t);
        self.last = t;
        self.elapsed += delta;

        // recursive moving average
        self.head = (self.head + 1) & (TIMER_WINDOW - 1);
        self.sum += delta - self.deltas[self.head];
        self.deltas[self.head] = delta;

        let average = self.sum / TIMER_WINDOW as f64;
        if average - self.nominal_delta > self.nominal_delta * TIMER_TOLERANCE {
            tracing::warn!(
                "DSP tick(s) took too long: average period {:.3} ms, nominal {:.3} ms",
                average * 1000.0,
                self.nominal_delta * 1000.0
            );
            TimerState::Error((delta - self.nominal_delta).max(0.0))
        } else {
            TimerState::Ok
        }
    }
}
