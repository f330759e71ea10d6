//! # Shared bus access
//!
//! ## Overview
//!
//! [`SharedSpi`] serializes transaction requests from multiple concurrent
//! clients onto one [`Spi`] engine. Arbitration is a FIFO ticket queue:
//! each [`begin_transaction`](SharedSpi::begin_transaction) call draws a
//! ticket and is granted the bus strictly in draw order. A client holding
//! the bus keeps it until its [`Transaction`] ends (or is dropped); waiting
//! clients spin, bounded by the length of the transactions ahead of them.
//!
//! There is no timeout primitive: a waiting client leaves the queue only by
//! being granted the bus or by external task termination.

use core::cell::UnsafeCell;

use fugit::HertzU32;
use portable_atomic::{AtomicU32, Ordering};

use super::{
    master::{DeviceConfig, DeviceId, Spi, SsClockTiming, Transaction},
    Error,
    Mode,
};
use crate::{
    port::{BusPorts, CaptureTiming, ClockBlock, NoClockBlock},
    time::RefTimer,
};

/// Multi-client front end for one SPI master engine.
///
/// First-come-first-served: requests are granted in arrival order, with no
/// further priority scheme. Configuration calls go through the same queue,
/// so they never race an open transaction.
pub struct SharedSpi<P, Tm, Cb = NoClockBlock> {
    bus: UnsafeCell<Spi<P, Tm, Cb>>,
    next_ticket: AtomicU32,
    serving: AtomicU32,
}

// The ticket queue hands out exclusive access to the engine, one holder at
// a time.
unsafe impl<P: Send, Tm: Send, Cb: Send> Sync for SharedSpi<P, Tm, Cb> {}

impl<P, Tm, Cb> SharedSpi<P, Tm, Cb>
where
    P: BusPorts,
    Tm: RefTimer,
    Cb: ClockBlock,
{
    /// Wraps an engine for multi-client use.
    pub fn new(spi: Spi<P, Tm, Cb>) -> Self {
        Self {
            bus: UnsafeCell::new(spi),
            next_ticket: AtomicU32::new(0),
            serving: AtomicU32::new(0),
        }
    }

    fn acquire(&self) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.serving.fetch_add(1, Ordering::Release);
    }

    fn with_bus<R>(&self, f: impl FnOnce(&mut Spi<P, Tm, Cb>) -> R) -> R {
        self.acquire();
        let result = f(unsafe { &mut *self.bus.get() });
        self.release();
        result
    }

    /// Opens a transaction, suspending the caller until every client ahead
    /// of it has released the bus. See [`Spi::begin_transaction`] for the
    /// per-transaction semantics.
    pub fn begin_transaction(
        &self,
        device: DeviceId,
        speed: HertzU32,
        mode: Mode,
    ) -> Result<Transaction<'_, P, Tm, Cb>, Error> {
        self.acquire();
        let spi = unsafe { &mut *self.bus.get() };
        match spi.begin_session(device, speed, mode) {
            Ok(()) => Ok(Transaction::new(spi, Some(&self.serving))),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Registers a device. See [`Spi::add_device`].
    pub fn add_device(&self, config: DeviceConfig) -> Result<DeviceId, Error> {
        self.with_bus(|spi| spi.add_device(config))
    }

    /// See [`Spi::set_ss_port_bit`].
    pub fn set_ss_port_bit(&self, device: DeviceId, ss_port_bit: u8) -> Result<(), Error> {
        self.with_bus(|spi| spi.set_ss_port_bit(device, ss_port_bit))
    }

    /// See [`Spi::set_miso_capture_timing`].
    pub fn set_miso_capture_timing(
        &self,
        device: DeviceId,
        timing: CaptureTiming,
    ) -> Result<(), Error> {
        self.with_bus(|spi| spi.set_miso_capture_timing(device, timing))
    }

    /// See [`Spi::set_ss_clock_timing`].
    pub fn set_ss_clock_timing(
        &self,
        device: DeviceId,
        timing: SsClockTiming,
    ) -> Result<(), Error> {
        self.with_bus(|spi| spi.set_ss_clock_timing(device, timing))
    }

    /// Shuts the engine down once the caller reaches the front of the
    /// queue. See [`Spi::shutdown`].
    pub fn shutdown(&self) -> Result<(), Error> {
        self.with_bus(|spi| spi.shutdown())
    }

    /// Dissolves the wrapper, returning the engine.
    pub fn into_inner(self) -> Spi<P, Tm, Cb> {
        self.bus.into_inner()
    }
}
