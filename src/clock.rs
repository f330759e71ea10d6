//! # Clock sources and divider search
//!
//! The serial clock is derived from one of two sources: the fixed 100 MHz
//! reference clock or the (board-dependent) core clock. A clock block
//! divides the selected source; the generated rate is `F_src / 2` for
//! divisor 0 and `F_src / (4 * d)` for divisor `d > 0`.
//!
//! [`determine_clock_settings`] picks the source and divisor for a target
//! rate. Matching always rounds *down*: the chosen rate never exceeds the
//! target, and no achievable rate lies strictly between the two. When the
//! target is below everything the dividers can produce, the slowest
//! achievable rate is returned instead of an error; enforcing minimum bus
//! speeds is the transfer engine's job.

use fugit::{HertzU32, RateExtU32};

/// Which clock the serial-clock divider runs from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockSource {
    /// The fixed 100 MHz reference clock.
    #[default]
    Reference,
    /// The core clock. Faster, but scales with the core frequency.
    Core,
}

/// The clock rates the divider search works against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Clocks {
    /// Rate of the fixed reference clock.
    pub reference_clock: HertzU32,
    /// Rate of the core clock.
    pub core_clock: HertzU32,
}

impl Default for Clocks {
    fn default() -> Self {
        Self {
            reference_clock: 100u32.MHz(),
            core_clock: 600u32.MHz(),
        }
    }
}

impl Clocks {
    fn rate_of(&self, source: ClockSource) -> HertzU32 {
        match source {
            ClockSource::Reference => self.reference_clock,
            ClockSource::Core => self.core_clock,
        }
    }
}

/// Largest supported divisor; the divider register is 8 bits wide.
pub const MAX_CLOCK_DIVISOR: u8 = u8::MAX;

/// Returns the serial-clock rate produced by `source` and `divisor`.
///
/// Pure inverse of [`determine_clock_settings`], useful for verifying or
/// reporting the rate a transaction will actually run at.
pub fn actual_clock_rate(clocks: &Clocks, source: ClockSource, divisor: u8) -> HertzU32 {
    let src = clocks.rate_of(source).to_Hz();
    let hz = if divisor == 0 {
        src / 2
    } else {
        src / (4 * u32::from(divisor))
    };
    hz.Hz()
}

/// Finds the clock source and divisor that best match `speed_khz`.
///
/// Picks the fastest achievable rate that does not exceed the target. If
/// the target sits below the slowest rate either source can produce, the
/// slowest achievable rate is returned. When both sources can produce the
/// chosen rate the reference clock wins, being independent of core-clock
/// scaling.
pub fn determine_clock_settings(clocks: &Clocks, speed_khz: u32) -> (ClockSource, u8) {
    let target_hz = speed_khz.saturating_mul(1_000);

    let mut best: Option<(u32, ClockSource, u8)> = None;
    let mut slowest = (
        clocks.reference_clock.to_Hz() / (4 * u32::from(MAX_CLOCK_DIVISOR)),
        ClockSource::Reference,
        MAX_CLOCK_DIVISOR,
    );

    for source in [ClockSource::Reference, ClockSource::Core] {
        let src = clocks.rate_of(source).to_Hz();
        for divisor in 0..=MAX_CLOCK_DIVISOR {
            let rate = if divisor == 0 {
                src / 2
            } else {
                src / (4 * u32::from(divisor))
            };

            if rate <= target_hz && best.map_or(true, |(r, _, _)| rate > r) {
                best = Some((rate, source, divisor));
            }
            if rate < slowest.0 {
                slowest = (rate, source, divisor);
            }
        }
    }

    let (_, source, divisor) = best.unwrap_or(slowest);
    (source, divisor)
}
