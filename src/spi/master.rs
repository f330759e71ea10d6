//! # SPI master transfer engine
//!
//! ## Overview
//!
//! One [`Spi`] instance owns one physical bus: the port bundle, the clock
//! block (when present) and the reference timer. Slave devices are
//! registered up front and addressed by their [`DeviceId`]; each carries
//! its own mode, clock settings, capture timing and chip-select timing
//! gaps, so devices with wildly different electrical needs can share the
//! bus.
//!
//! All data movement happens inside a transaction. [`Spi::begin_transaction`]
//! configures the clock for the requested rate, asserts the device's
//! chip-select bit and returns a [`Transaction`] guard; transfers run in
//! strict call order, and ending (or dropping) the guard releases the bus.
//!
//! ```rust,ignore
//! let mut spi = Spi::new(ports, clock_block, timer);
//! let dev = spi.add_device(DeviceConfig::default().with_mode(Mode::Mode0))?;
//!
//! let mut txn = spi.begin_transaction(dev, 1.MHz(), Mode::Mode0)?;
//! let status = txn.transfer8(0x05)?;
//! txn.end(0)?;
//! ```
//!
//! ## Clocked and timed paths
//!
//! With a clock block bound ([`Spi::new`]) the serial clock is divided down
//! from the reference or core clock; rates from 100 kHz up to half the
//! source rate are achievable. [`Spi::new_timed`] builds an engine without
//! a clock block: transfers are paced off the reference timer instead,
//! which tops out around 1 MHz but leaves the divider free for other
//! peripherals. Useful for control-only buses.
//!
//! ## Multiple clients
//!
//! `Spi` itself is single-client; the borrow checker pins every transfer to
//! the one open [`Transaction`]. Wrap the engine in
//! [`SharedSpi`](super::shared::SharedSpi) to serialize several competing
//! clients, or in [`SpiQueue`](super::asynch::SpiQueue) for non-blocking
//! submission.

use fugit::HertzU32;
use heapless::Vec;
use portable_atomic::AtomicU32;

use super::{Error, Mode};
use crate::{
    clock::{self, Clocks, ClockSource},
    port::{BusPorts, CaptureTiming, ClockBlock, NoClockBlock},
    time::RefTimer,
};

/// Padding byte transmitted when an array transfer has no output buffer.
const EMPTY_WRITE_PAD: u8 = 0x00;

/// Slowest bus rate the clocked path will accept, in kHz.
pub const MIN_CLOCKED_SPEED_KHZ: u32 = 100;

/// Fastest bus rate the timed (clock-block-less) path will accept, in kHz.
pub const MAX_TIMED_SPEED_KHZ: u32 = 1_000;

/// Shortest chip-select delay worth scheduling, in reference ticks.
pub const MINIMUM_DELAY_TICKS: u16 = 10;

/// Capacity of the per-bus device table.
pub const MAX_DEVICES: usize = 8;

/// Minimum gaps around chip-select assertion, in reference timer ticks
/// (10 ns nominal, 16-bit range; settings wrap at 65535).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SsClockTiming {
    /// Minimum ticks between chip-select assertion and the first clock
    /// edge.
    pub cs_to_clk_ticks: u16,
    /// Minimum ticks between the last clock edge and chip-select
    /// de-assertion.
    pub clk_to_cs_ticks: u16,
    /// Minimum ticks between de-assertion and the next assertion of the
    /// *same* device's chip select.
    pub cs_to_cs_ticks: u16,
}

impl Default for SsClockTiming {
    fn default() -> Self {
        Self {
            cs_to_clk_ticks: MINIMUM_DELAY_TICKS,
            clk_to_cs_ticks: MINIMUM_DELAY_TICKS,
            cs_to_cs_ticks: MINIMUM_DELAY_TICKS,
        }
    }
}

impl SsClockTiming {
    /// Timing with the given assert-to-clock gap.
    pub fn with_cs_to_clk(mut self, ticks: u16) -> Self {
        self.cs_to_clk_ticks = ticks;
        self
    }

    /// Timing with the given clock-to-deassert gap.
    pub fn with_clk_to_cs(mut self, ticks: u16) -> Self {
        self.clk_to_cs_ticks = ticks;
        self
    }

    /// Timing with the given same-device inter-transaction gap.
    pub fn with_cs_to_cs(mut self, ticks: u16) -> Self {
        self.cs_to_cs_ticks = ticks;
        self
    }
}

/// Per-device configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceConfig {
    /// SPI mode the device speaks.
    pub mode: Mode,
    /// Initial clock source. Overridden once a transaction requests a
    /// rate the current settings do not match.
    pub source_clock: ClockSource,
    /// Initial clock divisor.
    pub clock_divisor: u8,
    /// MISO capture timing.
    pub miso_capture: CaptureTiming,
    /// Chip-select timing gaps.
    pub ss_timing: SsClockTiming,
}

impl DeviceConfig {
    /// Configuration with the given SPI mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Configuration with the given clock source and divisor.
    pub fn with_clock(mut self, source: ClockSource, divisor: u8) -> Self {
        self.source_clock = source;
        self.clock_divisor = divisor;
        self
    }

    /// Configuration with the given MISO capture timing.
    pub fn with_miso_capture(mut self, timing: CaptureTiming) -> Self {
        self.miso_capture = timing;
        self
    }

    /// Configuration with the given chip-select timing gaps.
    pub fn with_ss_timing(mut self, timing: SsClockTiming) -> Self {
        self.ss_timing = timing;
        self
    }
}

/// Handle to a registered device, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceId(pub(crate) usize);

impl DeviceId {
    /// The device's index on its bus.
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Device {
    cs_bit: u8,
    mode: Mode,
    source_clock: ClockSource,
    clock_divisor: u8,
    configured_khz: u32,
    miso_capture: CaptureTiming,
    ss_timing: SsClockTiming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    SessionActive,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum Clocking {
    Divided,
    Timed { half_period: u32 },
}

struct Session {
    device: usize,
    mode: Mode,
    clocking: Clocking,
    clk_to_cs: u16,
    cs_to_cs: u16,
    /// Tick deadline before which no clock edge may be produced.
    not_before: u32,
    /// Tick stamp of the last clock activity.
    last_edge: u32,
}

struct Release {
    device: usize,
    at: u32,
    hold: u32,
}

/// SPI master driver for one physical bus.
pub struct Spi<P, Tm, Cb = NoClockBlock> {
    ports: P,
    clock_block: Option<Cb>,
    timer: Tm,
    clocks: Clocks,
    devices: Vec<Device, MAX_DEVICES>,
    state: State,
    session: Option<Session>,
    last_release: Option<Release>,
}

impl<P, Tm> Spi<P, Tm, NoClockBlock>
where
    P: BusPorts,
    Tm: RefTimer,
{
    /// Constructs a master without a clock block. Transfers are paced off
    /// the reference timer; rates are limited to [`MAX_TIMED_SPEED_KHZ`].
    pub fn new_timed(ports: P, timer: Tm) -> Self {
        Self {
            ports,
            clock_block: None,
            timer,
            clocks: Clocks::default(),
            devices: Vec::new(),
            state: State::Idle,
            session: None,
            last_release: None,
        }
    }
}

impl<P, Tm, Cb> Spi<P, Tm, Cb>
where
    P: BusPorts,
    Tm: RefTimer,
    Cb: ClockBlock,
{
    /// Constructs a master driving the bus from `clock_block`.
    pub fn new(ports: P, clock_block: Cb, timer: Tm) -> Self {
        Self {
            ports,
            clock_block: Some(clock_block),
            timer,
            clocks: Clocks::default(),
            devices: Vec::new(),
            state: State::Idle,
            session: None,
            last_release: None,
        }
    }

    /// Overrides the clock rates the divider search works against.
    pub fn with_clocks(mut self, clocks: Clocks) -> Self {
        self.clocks = clocks;
        self
    }

    /// Registers a slave device. Indices are assigned in registration
    /// order; the chip-select bit defaults to the index and can be changed
    /// with [`set_ss_port_bit`](Self::set_ss_port_bit).
    pub fn add_device(&mut self, config: DeviceConfig) -> Result<DeviceId, Error> {
        if self.state == State::Shutdown {
            return Err(Error::InvalidState);
        }
        let index = self.devices.len();
        let configured_khz =
            clock::actual_clock_rate(&self.clocks, config.source_clock, config.clock_divisor)
                .to_kHz();
        self.devices
            .push(Device {
                cs_bit: index as u8,
                mode: config.mode,
                source_clock: config.source_clock,
                clock_divisor: config.clock_divisor,
                configured_khz,
                miso_capture: config.miso_capture,
                ss_timing: config.ss_timing,
            })
            .map_err(|_| Error::TooManyDevices)?;
        Ok(DeviceId(index))
    }

    /// Selects which bit of the chip-select port drives `device`.
    ///
    /// Takes effect from the next transaction for the device; an open
    /// session keeps the value it was started with.
    pub fn set_ss_port_bit(&mut self, device: DeviceId, ss_port_bit: u8) -> Result<(), Error> {
        if self.state == State::Shutdown {
            return Err(Error::InvalidState);
        }
        self.devices[device.0].cs_bit = ss_port_bit;
        Ok(())
    }

    /// Sets when the MISO pad is sampled for `device`. Needed above
    /// roughly 20 MHz, where setup and hold budgets get tight.
    ///
    /// Takes effect from the next transaction for the device.
    pub fn set_miso_capture_timing(
        &mut self,
        device: DeviceId,
        timing: CaptureTiming,
    ) -> Result<(), Error> {
        if self.state == State::Shutdown {
            return Err(Error::InvalidState);
        }
        self.devices[device.0].miso_capture = timing;
        Ok(())
    }

    /// Sets the chip-select timing gaps for `device`.
    ///
    /// Takes effect from the next transaction for the device.
    pub fn set_ss_clock_timing(
        &mut self,
        device: DeviceId,
        timing: SsClockTiming,
    ) -> Result<(), Error> {
        if self.state == State::Shutdown {
            return Err(Error::InvalidState);
        }
        self.devices[device.0].ss_timing = timing;
        Ok(())
    }

    /// The rate `device`'s current clock settings actually produce.
    pub fn device_clock_rate(&self, device: DeviceId) -> HertzU32 {
        let dev = &self.devices[device.0];
        clock::actual_clock_rate(&self.clocks, dev.source_clock, dev.clock_divisor)
    }

    /// Opens a transaction with `device` at `speed` in `mode`.
    ///
    /// Recomputes the device's clock settings when `speed` differs from the
    /// rate it was last configured for, asserts the device's chip-select
    /// bit and enforces the configured assert-to-clock gap before the first
    /// transfer. If the previous transaction targeted the same device, the
    /// configured de-assert hold is enforced first; a different device
    /// proceeds immediately.
    ///
    /// Rates below [`MIN_CLOCKED_SPEED_KHZ`] (clocked path) or above
    /// [`MAX_TIMED_SPEED_KHZ`] (timed path) are rejected with
    /// [`Error::UnsupportedRate`].
    pub fn begin_transaction(
        &mut self,
        device: DeviceId,
        speed: HertzU32,
        mode: Mode,
    ) -> Result<Transaction<'_, P, Tm, Cb>, Error> {
        self.begin_session(device, speed, mode)?;
        Ok(Transaction {
            spi: self,
            serving: None,
            ended: false,
        })
    }

    /// Shuts the engine down, stopping the clock block and parking the bus
    /// lines. Fails with [`Error::SessionInProgress`] while a transaction
    /// is open; afterwards every operation fails with
    /// [`Error::InvalidState`].
    pub fn shutdown(&mut self) -> Result<(), Error> {
        match self.state {
            State::Shutdown => return Err(Error::InvalidState),
            State::SessionActive => return Err(Error::SessionInProgress),
            State::Idle => {}
        }
        if let Some(cb) = self.clock_block.as_mut() {
            cb.stop();
        }
        self.ports.park();
        self.state = State::Shutdown;
        debug!("spi: engine shut down");
        Ok(())
    }

    pub(crate) fn begin_session(
        &mut self,
        device: DeviceId,
        speed: HertzU32,
        mode: Mode,
    ) -> Result<(), Error> {
        match self.state {
            State::Shutdown => return Err(Error::InvalidState),
            State::SessionActive => return Err(Error::SessionInProgress),
            State::Idle => {}
        }

        let khz = speed.to_kHz();
        if self.clock_block.is_some() {
            if khz < MIN_CLOCKED_SPEED_KHZ {
                warn!("spi: {} kHz is below the supported minimum", khz);
                return Err(Error::UnsupportedRate);
            }
        } else if khz == 0 || khz > MAX_TIMED_SPEED_KHZ {
            warn!("spi: {} kHz is outside the timed path's range", khz);
            return Err(Error::UnsupportedRate);
        }

        let index = device.0;
        assert!(index < self.devices.len(), "unregistered device");

        {
            let dev = &mut self.devices[index];
            dev.mode = mode;
            if khz != dev.configured_khz {
                let (source, divisor) = clock::determine_clock_settings(&self.clocks, khz);
                dev.source_clock = source;
                dev.clock_divisor = divisor;
                dev.configured_khz = khz;
            }
        }
        let dev = self.devices[index];

        // Same-device spacing from the previous transaction.
        if let Some(release) = self.last_release.take() {
            if release.device == index {
                self.timer.wait_until(release.at.wrapping_add(release.hold));
            }
        }

        if let Some(cb) = self.clock_block.as_mut() {
            cb.stop();
            cb.configure(dev.source_clock, dev.clock_divisor);
            cb.start();
        }
        self.ports.configure(mode, dev.miso_capture);
        self.ports.assert_cs(!(1u32 << dev.cs_bit));

        let now = self.timer.now();
        let clocking = if self.clock_block.is_some() {
            Clocking::Divided
        } else {
            let ticks_per_bit = crate::time::TICKS_PER_SECOND / (khz * 1_000);
            Clocking::Timed {
                half_period: ticks_per_bit / 2,
            }
        };
        self.session = Some(Session {
            device: index,
            mode,
            clocking,
            clk_to_cs: dev.ss_timing.clk_to_cs_ticks,
            cs_to_cs: dev.ss_timing.cs_to_cs_ticks,
            not_before: now.wrapping_add(u32::from(dev.ss_timing.cs_to_clk_ticks)),
            last_edge: now,
        });
        self.state = State::SessionActive;
        trace!("spi: session open, device {}, {} kHz", index, khz);
        Ok(())
    }

    fn exchange_bits(&mut self, out: u32, count: u8) -> Result<u32, Error> {
        if self.state == State::Shutdown {
            return Err(Error::InvalidState);
        }
        let session = self.session.as_mut().ok_or(Error::NoActiveSession)?;
        self.timer.wait_until(session.not_before);
        let word = match session.clocking {
            Clocking::Divided => self.ports.exchange_clocked(out, count),
            Clocking::Timed { half_period } => {
                self.ports
                    .exchange_timed(&mut self.timer, half_period, session.mode, out, count)
            }
        };
        let now = self.timer.now();
        session.last_edge = now;
        session.not_before = now;
        Ok(word)
    }

    pub(crate) fn transfer8(&mut self, data: u8) -> Result<u8, Error> {
        Ok(self.exchange_bits(u32::from(data), 8)? as u8)
    }

    pub(crate) fn transfer32(&mut self, data: u32) -> Result<u32, Error> {
        // Most significant byte first on the wire, bits LSB-first within
        // each byte.
        Ok(self.exchange_bits(data.swap_bytes(), 32)?.swap_bytes())
    }

    pub(crate) fn transfer_array(
        &mut self,
        data_out: Option<&[u8]>,
        mut data_in: Option<&mut [u8]>,
        len: usize,
    ) -> Result<(), Error> {
        if let Some(out) = data_out {
            debug_assert!(out.len() >= len);
        }
        if let Some(in_buf) = data_in.as_deref() {
            debug_assert!(in_buf.len() >= len);
        }
        for i in 0..len {
            let tx = data_out.map_or(EMPTY_WRITE_PAD, |out| out[i]);
            let rx = self.exchange_bits(u32::from(tx), 8)? as u8;
            if let Some(in_buf) = data_in.as_deref_mut() {
                in_buf[i] = rx;
            }
        }
        Ok(())
    }

    pub(crate) fn transfer_array_32(
        &mut self,
        data_out: Option<&[u32]>,
        mut data_in: Option<&mut [u32]>,
        nwords: usize,
    ) -> Result<(), Error> {
        if let Some(out) = data_out {
            debug_assert!(out.len() >= nwords);
        }
        if let Some(in_buf) = data_in.as_deref() {
            debug_assert!(in_buf.len() >= nwords);
        }
        // Words travel in memory order; callers needing big-endian wire
        // layout byte-swap beforehand.
        for i in 0..nwords {
            let tx = data_out.map_or(0, |out| out[i]);
            let rx = self.exchange_bits(tx, 32)?;
            if let Some(in_buf) = data_in.as_deref_mut() {
                in_buf[i] = rx;
            }
        }
        Ok(())
    }

    pub(crate) fn delay_before_next_transfer(&mut self, delay_ticks: u16) -> Result<(), Error> {
        let session = self.session.as_mut().ok_or(Error::NoActiveSession)?;
        if delay_ticks >= MINIMUM_DELAY_TICKS {
            session.not_before = self.timer.now().wrapping_add(u32::from(delay_ticks));
        }
        Ok(())
    }

    pub(crate) fn finish_transaction(&mut self, ss_deassert_ticks: u16) -> Result<(), Error> {
        if self.state == State::Shutdown {
            return Err(Error::InvalidState);
        }
        let session = self.session.take().ok_or(Error::NoActiveSession)?;
        self.timer
            .wait_until(session.last_edge.wrapping_add(u32::from(session.clk_to_cs)));
        self.ports.deassert_cs();
        let hold = u32::from(ss_deassert_ticks.max(session.cs_to_cs));
        self.last_release = Some(Release {
            device: session.device,
            at: self.timer.now(),
            hold,
        });
        self.state = State::Idle;
        trace!("spi: session closed, device {}", session.device);
        Ok(())
    }
}

/// An open transaction: exclusive ownership of the bus by one device.
///
/// Transfers run in strict call order. [`end`](Self::end) closes the
/// transaction with an explicit de-assert hold; dropping the guard closes
/// it with the device's configured `cs_to_cs` gap, so the bus is released
/// even on early returns and panics.
pub struct Transaction<'a, P, Tm, Cb>
where
    P: BusPorts,
    Tm: RefTimer,
    Cb: ClockBlock,
{
    spi: &'a mut Spi<P, Tm, Cb>,
    pub(crate) serving: Option<&'a AtomicU32>,
    ended: bool,
}

impl<'a, P, Tm, Cb> Transaction<'a, P, Tm, Cb>
where
    P: BusPorts,
    Tm: RefTimer,
    Cb: ClockBlock,
{
    pub(crate) fn new(spi: &'a mut Spi<P, Tm, Cb>, serving: Option<&'a AtomicU32>) -> Self {
        Self {
            spi,
            serving,
            ended: false,
        }
    }

    /// Transfers one byte full duplex, returning the byte sampled while
    /// `data` was transmitted. Least-significant bit first.
    pub fn transfer8(&mut self, data: u8) -> Result<u8, Error> {
        self.spi.transfer8(data)
    }

    /// Transfers one 32-bit word full duplex. Bits travel
    /// least-significant first, bytes most-significant first; the byte
    /// reversal against native little-endian layout is applied here, on
    /// both directions.
    pub fn transfer32(&mut self, data: u32) -> Result<u32, Error> {
        self.spi.transfer32(data)
    }

    /// Transfers `len` bytes. Either buffer may be `None`: with no output
    /// buffer zero bytes are transmitted, with no input buffer the
    /// captured data is discarded. The clock runs for exactly `len * 8`
    /// cycles regardless.
    pub fn transfer_array(
        &mut self,
        data_out: Option<&[u8]>,
        data_in: Option<&mut [u8]>,
        len: usize,
    ) -> Result<(), Error> {
        self.spi.transfer_array(data_out, data_in, len)
    }

    /// Transfers `nwords` 32-bit words in memory order (no per-word byte
    /// reversal; callers needing big-endian wire layout swap beforehand).
    pub fn transfer_array_32(
        &mut self,
        data_out: Option<&[u32]>,
        data_in: Option<&mut [u32]>,
        nwords: usize,
    ) -> Result<(), Error> {
        self.spi.transfer_array_32(data_out, data_in, nwords)
    }

    /// Enforces a minimum gap of `delay_ticks` before the next transfer in
    /// this transaction. Returns immediately; the wait happens at the next
    /// transfer. Delays under [`MINIMUM_DELAY_TICKS`] are not scheduled.
    pub fn delay_before_next_transfer(&mut self, delay_ticks: u16) -> Result<(), Error> {
        self.spi.delay_before_next_transfer(delay_ticks)
    }

    /// Ends the transaction, de-asserting chip select and holding it
    /// de-asserted for at least `ss_deassert_ticks`. The hold is enforced
    /// only if the next transaction targets the same device.
    pub fn end(mut self, ss_deassert_ticks: u16) -> Result<(), Error> {
        self.ended = true;
        self.spi.finish_transaction(ss_deassert_ticks)
    }
}

impl<P, Tm, Cb> Drop for Transaction<'_, P, Tm, Cb>
where
    P: BusPorts,
    Tm: RefTimer,
    Cb: ClockBlock,
{
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.spi.finish_transaction(0);
        }
        if let Some(serving) = self.serving {
            serving.fetch_add(1, portable_atomic::Ordering::Release);
        }
    }
}

impl<P, Tm, Cb> embedded_hal::spi::ErrorType for Transaction<'_, P, Tm, Cb>
where
    P: BusPorts,
    Tm: RefTimer,
    Cb: ClockBlock,
{
    type Error = Error;
}

impl<P, Tm, Cb> embedded_hal::spi::SpiBus for Transaction<'_, P, Tm, Cb>
where
    P: BusPorts,
    Tm: RefTimer,
    Cb: ClockBlock,
{
    fn read(&mut self, words: &mut [u8]) -> Result<(), Error> {
        let len = words.len();
        self.spi.transfer_array(None, Some(words), len)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Error> {
        self.spi.transfer_array(Some(words), None, words.len())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Error> {
        let common = read.len().min(write.len());
        self.spi
            .transfer_array(Some(&write[..common]), Some(&mut read[..common]), common)?;
        if write.len() > common {
            self.spi
                .transfer_array(Some(&write[common..]), None, write.len() - common)?;
        }
        if read.len() > common {
            let rest = read.len() - common;
            self.spi
                .transfer_array(None, Some(&mut read[common..]), rest)?;
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Error> {
        for word in words.iter_mut() {
            *word = self.spi.transfer8(*word)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
