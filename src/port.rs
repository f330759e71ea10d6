//! # Port and clock-block abstraction
//!
//! ## Overview
//!
//! The SPI drivers in this crate never touch pins directly. The platform
//! provides programmable I/O ports (digital lines with buffered, clocked
//! shifting) and clock blocks, programmable dividers that feed a port.
//! This module defines the traits for those collaborators and the port
//! bundles that tie them into a bus.
//!
//! Cycle-accurate shifting and sampling against the physical pad is the
//! platform's job. The contract here is purely logical: `shift_out`
//! pre-loads a shift register that the bus clock drains least-significant
//! bit first, `run_cycles` emits clock cycles, `shift_in` collects what was
//! sampled.
//!
//! ## Port bundles
//!
//! A bus is either a classic four-wire SPI bundle ([`SpiPorts`]) or a
//! quad-wire bundle ([`QspiPorts`]) where four data lines share one
//! bidirectional port. [`AnyPorts`] carries either, with the discriminant
//! stored alongside the ports.

use crate::{
    clock::ClockSource,
    spi::Mode,
    time::RefTimer,
};

pub(crate) mod private {
    pub trait Sealed {}
}

/// A plain output port. May be wider than one bit (the chip-select port
/// commonly is).
pub trait OutPort {
    /// Drives `value` onto the port.
    fn out(&mut self, value: u32);

    /// Blocks until all buffered output has reached the pins.
    fn sync(&mut self) {}
}

/// The serial-clock line driver.
///
/// When a clock block is bound, `run_cycles` emits complete clock cycles at
/// the divided rate, honoring the polarity and phase configured via
/// `configure_mode`. Data ports attached to the same clock block shift one
/// bit (or one nibble, for quad ports) per cycle.
pub trait ClockLine: OutPort {
    /// Applies clock polarity and phase for the coming transaction.
    fn configure_mode(&mut self, mode: Mode);

    /// Emits `cycles` full clock cycles.
    fn run_cycles(&mut self, cycles: u8);
}

/// A buffered output data port (MOSI, or the quad data port when writing).
pub trait DataOut: OutPort {
    /// Pre-loads `count` bits to be shifted out least-significant bit
    /// first, one bit per clock cycle (one nibble per cycle on quad ports).
    fn shift_out(&mut self, bits: u32, count: u8);
}

/// A buffered input data port (MISO, or the quad data port when reading).
pub trait DataIn {
    /// Samples the current pad level without clocking.
    fn sample(&mut self) -> u32;

    /// Collects `count` bits captured during the previous clock cycles,
    /// least-significant bit first.
    fn shift_in(&mut self, count: u8) -> u32;

    /// Adjusts when the pad is sampled relative to the clock edge.
    fn set_capture_timing(&mut self, timing: CaptureTiming);
}

/// A bidirectional buffered data port (the quad-SPI `sio` lines).
pub trait DataIo: DataOut + DataIn {}

impl<T: DataOut + DataIn> DataIo for T {}

/// A programmable clock divider feeding the serial-clock port.
///
/// The generated rate is `F_src / 2` for divisor 0 and `F_src / (4 * d)`
/// for divisor `d > 0`, where `F_src` is the selected source rate.
pub trait ClockBlock {
    /// Selects the source clock and divisor.
    fn configure(&mut self, source: ClockSource, divisor: u8);

    /// Starts the divider.
    fn start(&mut self);

    /// Stops the divider, releasing the line to its idle level.
    fn stop(&mut self);
}

/// Placeholder for an unbound data port.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPort;

impl OutPort for NoPort {
    fn out(&mut self, _value: u32) {}
}

impl DataOut for NoPort {
    fn shift_out(&mut self, _bits: u32, _count: u8) {}
}

impl DataIn for NoPort {
    fn sample(&mut self) -> u32 {
        0
    }

    fn shift_in(&mut self, _count: u8) -> u32 {
        0
    }

    fn set_capture_timing(&mut self, _timing: CaptureTiming) {}
}

/// Placeholder clock block for the timed (clock-block-less) master.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClockBlock;

impl ClockBlock for NoClockBlock {
    fn configure(&mut self, _source: ClockSource, _divisor: u8) {}

    fn start(&mut self) {}

    fn stop(&mut self) {}
}

/// When the input pad is sampled, in quarter clock cycles after the slave
/// drives it. Coarse companion to the pad delay; both only matter at high
/// clock rates where setup and hold budgets get tight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleDelay {
    /// Sample half a clock cycle after output.
    #[default]
    HalfCycle,
    /// Sample three quarters of a clock cycle after output.
    ThreeQuarterCycle,
    /// Sample one full clock cycle after output.
    FullCycle,
    /// Sample one and a quarter clock cycles after output.
    CycleAndQuarter,
    /// Sample one and a half clock cycles after output.
    CycleAndHalf,
}

/// Input capture timing for the MISO (or quad data) pad.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaptureTiming {
    /// Coarse sample point, in quarter clock cycles.
    pub sample_delay: SampleDelay,
    /// Fine adjustment in core clock cycles, 0..=5.
    pub pad_delay: u8,
}

impl CaptureTiming {
    /// Capture timing with the given coarse sample point.
    pub fn with_sample_delay(mut self, sample_delay: SampleDelay) -> Self {
        self.sample_delay = sample_delay;
        self
    }

    /// Capture timing with the given pad delay in core clock cycles.
    pub fn with_pad_delay(mut self, pad_delay: u8) -> Self {
        self.pad_delay = pad_delay;
        self
    }
}

/// The classic four-wire SPI port bundle.
///
/// MOSI and MISO are each optional: a write-only device needs no MISO line
/// and a read-only device no MOSI line. The clock still runs either way.
pub struct SpiPorts<Cs, Sclk, Mosi = NoPort, Miso = NoPort> {
    cs: Cs,
    sclk: Sclk,
    mosi: Option<Mosi>,
    miso: Option<Miso>,
}

impl<Cs, Sclk> SpiPorts<Cs, Sclk> {
    /// Creates a bundle from the chip-select and clock ports. Bind data
    /// lines with [`with_mosi`](Self::with_mosi) and
    /// [`with_miso`](Self::with_miso).
    pub fn new(cs: Cs, sclk: Sclk) -> Self {
        Self {
            cs,
            sclk,
            mosi: None,
            miso: None,
        }
    }
}

impl<Cs, Sclk, Mosi, Miso> SpiPorts<Cs, Sclk, Mosi, Miso> {
    /// Assigns the MOSI (master out, slave in) port.
    pub fn with_mosi<M: DataOut>(self, mosi: M) -> SpiPorts<Cs, Sclk, M, Miso> {
        SpiPorts {
            cs: self.cs,
            sclk: self.sclk,
            mosi: Some(mosi),
            miso: self.miso,
        }
    }

    /// Assigns the MISO (master in, slave out) port.
    pub fn with_miso<M: DataIn>(self, miso: M) -> SpiPorts<Cs, Sclk, Mosi, M> {
        SpiPorts {
            cs: self.cs,
            sclk: self.sclk,
            mosi: self.mosi,
            miso: Some(miso),
        }
    }
}

/// The quad-wire (QSPI) port bundle: chip select, clock, and one four-bit
/// bidirectional data port.
pub struct QspiPorts<Cs, Sclk, Sio> {
    cs: Cs,
    sclk: Sclk,
    sio: Sio,
}

impl<Cs, Sclk, Sio> QspiPorts<Cs, Sclk, Sio> {
    /// Creates a quad bundle.
    pub fn new(cs: Cs, sclk: Sclk, sio: Sio) -> Self {
        Self { cs, sclk, sio }
    }
}

/// Either port bundle, tagged. The variant is fixed when the bus is built
/// and never inferred from the stored ports.
pub enum AnyPorts<Cs, Sclk, Mosi = NoPort, Miso = NoPort, Sio = NoPort> {
    /// Four-wire SPI.
    Spi(SpiPorts<Cs, Sclk, Mosi, Miso>),
    /// Quad-wire SPI.
    Qspi(QspiPorts<Cs, Sclk, Sio>),
}

impl<Cs, Sclk, Mosi, Miso, Sio> From<SpiPorts<Cs, Sclk, Mosi, Miso>>
    for AnyPorts<Cs, Sclk, Mosi, Miso, Sio>
{
    fn from(ports: SpiPorts<Cs, Sclk, Mosi, Miso>) -> Self {
        AnyPorts::Spi(ports)
    }
}

impl<Cs, Sclk, Mosi, Miso, Sio> From<QspiPorts<Cs, Sclk, Sio>>
    for AnyPorts<Cs, Sclk, Mosi, Miso, Sio>
{
    fn from(ports: QspiPorts<Cs, Sclk, Sio>) -> Self {
        AnyPorts::Qspi(ports)
    }
}

/// Bus-level operations the master engine needs from a port bundle.
///
/// Implemented by [`SpiPorts`], [`QspiPorts`] and [`AnyPorts`]; not meant
/// to be implemented outside this crate.
pub trait BusPorts: private::Sealed {
    /// Drives the chip-select port to `value`.
    fn assert_cs(&mut self, value: u32);

    /// Releases all chip-select lines high.
    fn deassert_cs(&mut self);

    /// Applies mode and capture timing for the coming transaction.
    fn configure(&mut self, mode: Mode, capture: CaptureTiming);

    /// One full-duplex exchange of `count` bits, clocked by the bus clock.
    fn exchange_clocked(&mut self, out: u32, count: u8) -> u32;

    /// One full-duplex exchange of `count` bits, paced by the reference
    /// timer with `half_period` ticks per half clock cycle.
    fn exchange_timed<T: RefTimer>(
        &mut self,
        timer: &mut T,
        half_period: u32,
        mode: Mode,
        out: u32,
        count: u8,
    ) -> u32;

    /// Parks the bus lines in their idle state.
    fn park(&mut self);
}

fn low_bits(count: u8) -> u32 {
    if count >= 32 {
        u32::MAX
    } else {
        (1u32 << count) - 1
    }
}

impl<Cs, Sclk, Mosi, Miso> private::Sealed for SpiPorts<Cs, Sclk, Mosi, Miso> {}

impl<Cs, Sclk, Mosi, Miso> BusPorts for SpiPorts<Cs, Sclk, Mosi, Miso>
where
    Cs: OutPort,
    Sclk: ClockLine,
    Mosi: DataOut,
    Miso: DataIn,
{
    fn assert_cs(&mut self, value: u32) {
        self.cs.out(value);
        self.cs.sync();
    }

    fn deassert_cs(&mut self) {
        self.cs.out(u32::MAX);
        self.cs.sync();
    }

    fn configure(&mut self, mode: Mode, capture: CaptureTiming) {
        self.sclk.configure_mode(mode);
        if let Some(miso) = self.miso.as_mut() {
            miso.set_capture_timing(capture);
        }
    }

    fn exchange_clocked(&mut self, out: u32, count: u8) -> u32 {
        if let Some(mosi) = self.mosi.as_mut() {
            mosi.shift_out(out, count);
        }
        self.sclk.run_cycles(count);
        match self.miso.as_mut() {
            Some(miso) => miso.shift_in(count) & low_bits(count),
            None => 0,
        }
    }

    fn exchange_timed<T: RefTimer>(
        &mut self,
        timer: &mut T,
        half_period: u32,
        mode: Mode,
        out: u32,
        count: u8,
    ) -> u32 {
        let idle = mode.cpol() as u32;
        let active = !mode.cpol() as u32;
        let mut input = 0;
        for i in 0..count {
            let bit = (out >> i) & 1;
            if !mode.cpha() {
                if let Some(mosi) = self.mosi.as_mut() {
                    mosi.out(bit);
                }
                timer.wait_ticks(half_period);
                self.sclk.out(active);
                if let Some(miso) = self.miso.as_mut() {
                    input |= (miso.sample() & 1) << i;
                }
                timer.wait_ticks(half_period);
                self.sclk.out(idle);
            } else {
                self.sclk.out(active);
                if let Some(mosi) = self.mosi.as_mut() {
                    mosi.out(bit);
                }
                timer.wait_ticks(half_period);
                self.sclk.out(idle);
                if let Some(miso) = self.miso.as_mut() {
                    input |= (miso.sample() & 1) << i;
                }
                timer.wait_ticks(half_period);
            }
        }
        input
    }

    fn park(&mut self) {
        self.deassert_cs();
    }
}

impl<Cs, Sclk, Sio> private::Sealed for QspiPorts<Cs, Sclk, Sio> {}

impl<Cs, Sclk, Sio> BusPorts for QspiPorts<Cs, Sclk, Sio>
where
    Cs: OutPort,
    Sclk: ClockLine,
    Sio: DataIo,
{
    fn assert_cs(&mut self, value: u32) {
        self.cs.out(value);
        self.cs.sync();
    }

    fn deassert_cs(&mut self) {
        self.cs.out(u32::MAX);
        self.cs.sync();
    }

    fn configure(&mut self, mode: Mode, capture: CaptureTiming) {
        self.sclk.configure_mode(mode);
        self.sio.set_capture_timing(capture);
    }

    fn exchange_clocked(&mut self, out: u32, count: u8) -> u32 {
        // Four data lines move one nibble per clock cycle.
        self.sio.shift_out(out, count);
        self.sclk.run_cycles(count / 4);
        self.sio.shift_in(count) & low_bits(count)
    }

    fn exchange_timed<T: RefTimer>(
        &mut self,
        timer: &mut T,
        half_period: u32,
        mode: Mode,
        out: u32,
        count: u8,
    ) -> u32 {
        let idle = mode.cpol() as u32;
        let active = !mode.cpol() as u32;
        let mut input = 0;
        for cycle in 0..count / 4 {
            let shift = 4 * cycle;
            let nibble = (out >> shift) & 0xf;
            if !mode.cpha() {
                self.sio.out(nibble);
                timer.wait_ticks(half_period);
                self.sclk.out(active);
                input |= (self.sio.sample() & 0xf) << shift;
                timer.wait_ticks(half_period);
                self.sclk.out(idle);
            } else {
                self.sclk.out(active);
                self.sio.out(nibble);
                timer.wait_ticks(half_period);
                self.sclk.out(idle);
                input |= (self.sio.sample() & 0xf) << shift;
                timer.wait_ticks(half_period);
            }
        }
        input
    }

    fn park(&mut self) {
        self.deassert_cs();
    }
}

impl<Cs, Sclk, Mosi, Miso, Sio> private::Sealed for AnyPorts<Cs, Sclk, Mosi, Miso, Sio> {}

impl<Cs, Sclk, Mosi, Miso, Sio> BusPorts for AnyPorts<Cs, Sclk, Mosi, Miso, Sio>
where
    Cs: OutPort,
    Sclk: ClockLine,
    Mosi: DataOut,
    Miso: DataIn,
    Sio: DataIo,
{
    fn assert_cs(&mut self, value: u32) {
        match self {
            AnyPorts::Spi(p) => p.assert_cs(value),
            AnyPorts::Qspi(p) => p.assert_cs(value),
        }
    }

    fn deassert_cs(&mut self) {
        match self {
            AnyPorts::Spi(p) => p.deassert_cs(),
            AnyPorts::Qspi(p) => p.deassert_cs(),
        }
    }

    fn configure(&mut self, mode: Mode, capture: CaptureTiming) {
        match self {
            AnyPorts::Spi(p) => p.configure(mode, capture),
            AnyPorts::Qspi(p) => p.configure(mode, capture),
        }
    }

    fn exchange_clocked(&mut self, out: u32, count: u8) -> u32 {
        match self {
            AnyPorts::Spi(p) => p.exchange_clocked(out, count),
            AnyPorts::Qspi(p) => p.exchange_clocked(out, count),
        }
    }

    fn exchange_timed<T: RefTimer>(
        &mut self,
        timer: &mut T,
        half_period: u32,
        mode: Mode,
        out: u32,
        count: u8,
    ) -> u32 {
        match self {
            AnyPorts::Spi(p) => p.exchange_timed(timer, half_period, mode, out, count),
            AnyPorts::Qspi(p) => p.exchange_timed(timer, half_period, mode, out, count),
        }
    }

    fn park(&mut self) {
        match self {
            AnyPorts::Spi(p) => p.park(),
            AnyPorts::Qspi(p) => p.park(),
        }
    }
}

/// Result of one slave-side unit transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UnitCapture {
    /// Captured bits, least-significant bit first. Only the low
    /// `valid_bits` are meaningful.
    pub bits: u32,
    /// Number of bits actually clocked by the master.
    pub valid_bits: u8,
    /// Whether the master de-asserted chip select, ending the transaction.
    pub deasserted: bool,
}

/// Slave-side bus seam: the platform's cycle-level engine that follows the
/// external master's clock and chip select.
///
/// The slave driver pre-loads outgoing data for each unit before the master
/// clocks it; when the master de-asserts mid-unit, pre-loaded bits that
/// never left the pad are discarded.
pub trait SlaveBus {
    /// Whether chip select is currently asserted by the external master.
    fn selected(&mut self) -> bool;

    /// Pre-loads `out` (least-significant bit first) and follows the
    /// master's clock for up to `count` bits, returning what was captured.
    /// Returns early, with `deasserted` set, when the master releases chip
    /// select.
    fn transfer_unit(&mut self, out: u32, count: u8) -> UnitCapture;
}
