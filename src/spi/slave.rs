//! # SPI slave driver
//!
//! ## Overview
//!
//! The slave side is reactive: the external master owns the clock and chip
//! select, and the local side merely follows. [`SpiSlave`] pumps the
//! platform's [`SlaveBus`] seam and reports everything through a
//! [`SlaveHandler`]:
//!
//! - [`master_requires_data`](SlaveHandler::master_requires_data) supplies
//!   the next unit to drive onto the output line, least-significant bit
//!   first. The driver may fetch a unit speculatively to pre-load the pad;
//!   bits the master never clocks are discarded.
//! - [`master_supplied_data`](SlaveHandler::master_supplied_data) delivers
//!   each received unit. When the master de-asserts chip select mid-unit,
//!   `valid_bits` carries the actual count, so a partial unit never gets
//!   padded out to look complete.
//! - [`master_ends_transaction`](SlaveHandler::master_ends_transaction)
//!   fires on chip-select de-assertion.
//!
//! Unit width is fixed at construction: 8-bit or 32-bit
//! ([`DataWidth`]).
//!
//! ## Shutdown
//!
//! Teardown is a handshake. The owning task raises
//! [`ShutdownHandshake::request`]; the driver acknowledges between
//! transactions, never with a transfer in flight, after which
//! [`ShutdownHandshake::complete`] reports true and
//! [`SpiSlave::release`] returns the bus and handler.

use portable_atomic::{AtomicBool, Ordering};

use super::DataWidth;
use crate::port::{SlaveBus, UnitCapture};

/// Application callbacks driven by the slave engine.
pub trait SlaveHandler {
    /// Called when the master requires data: returns the next unit (8 or
    /// 32 bits, per the configured width) to transmit, least-significant
    /// bit first.
    fn master_requires_data(&mut self) -> u32;

    /// Called after each received unit. `valid_bits` is the number of bits
    /// actually clocked by the master: the full unit width normally, less
    /// when the master ended the transaction mid-unit. The bits above
    /// `valid_bits` in `datum` are zero and carry no data.
    fn master_supplied_data(&mut self, datum: u32, valid_bits: u8);

    /// Called when the master de-asserts chip select.
    fn master_ends_transaction(&mut self);
}

/// Single-slot shutdown signal pair between the task that owns the slave
/// driver's poll loop and the task tearing it down.
///
/// The requester sets the request exactly once; the driver clears it by
/// acknowledging, which it does only when no transfer is in flight.
#[derive(Debug, Default)]
pub struct ShutdownHandshake {
    requested: AtomicBool,
    acknowledged: AtomicBool,
}

impl ShutdownHandshake {
    /// A handshake with neither side signalled.
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            acknowledged: AtomicBool::new(false),
        }
    }

    /// Asks the slave engine to shut down once safe.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Whether the engine has acknowledged the request.
    pub fn complete(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// Spins until the engine has acknowledged the request.
    pub fn wait_complete(&self) {
        while !self.complete() {
            core::hint::spin_loop();
        }
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn acknowledge(&self) {
        self.acknowledged.store(true, Ordering::Release);
    }
}

/// Outcome of one [`SpiSlave::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlavePoll {
    /// Chip select is idle; nothing happened.
    Idle,
    /// A complete transaction was serviced.
    Transacted,
    /// A shutdown request was acknowledged; the driver is done and should
    /// be released.
    Shutdown,
}

/// SPI slave engine.
pub struct SpiSlave<'h, B, H> {
    bus: B,
    handler: H,
    width: DataWidth,
    handshake: &'h ShutdownHandshake,
    shut_down: bool,
}

impl<'h, B, H> SpiSlave<'h, B, H>
where
    B: SlaveBus,
    H: SlaveHandler,
{
    /// Builds a slave engine over the platform bus seam.
    pub fn new(bus: B, handler: H, width: DataWidth, handshake: &'h ShutdownHandshake) -> Self {
        Self {
            bus,
            handler,
            width,
            handshake,
            shut_down: false,
        }
    }

    /// Services the bus: runs one complete transaction if the master has
    /// asserted chip select, otherwise checks for a shutdown request.
    ///
    /// Blocks for the duration of a transaction, since the master's clock
    /// sets the pace. Call from the dedicated slave task's loop.
    pub fn poll(&mut self) -> SlavePoll {
        if self.shut_down {
            return SlavePoll::Shutdown;
        }

        if !self.bus.selected() {
            if self.handshake.is_requested() {
                self.handshake.acknowledge();
                self.shut_down = true;
                debug!("spi slave: shutdown acknowledged");
                return SlavePoll::Shutdown;
            }
            return SlavePoll::Idle;
        }

        let width = self.width.bits();
        loop {
            let out = self.handler.master_requires_data();
            let UnitCapture {
                bits,
                valid_bits,
                deasserted,
            } = self.bus.transfer_unit(out, width);
            if valid_bits > 0 {
                self.handler
                    .master_supplied_data(bits & low_bits(valid_bits), valid_bits);
            }
            if deasserted {
                self.handler.master_ends_transaction();
                return SlavePoll::Transacted;
            }
        }
    }

    /// Returns the bus and handler after shutdown.
    pub fn release(self) -> (B, H) {
        (self.bus, self.handler)
    }
}

fn low_bits(count: u8) -> u32 {
    if count >= 32 {
        u32::MAX
    } else {
        (1u32 << count) - 1
    }
}
