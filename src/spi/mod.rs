//! # Serial Peripheral Interface
//!
//! ## Overview
//!
//! SPI master and slave drivers built on the port and clock-block
//! abstraction in [`crate::port`]. The master side ([`master`]) arbitrates
//! one physical bus between any number of registered devices and any number
//! of client tasks; [`shared`] adds first-come-first-served multi-client
//! access and [`asynch`] a non-blocking submission queue. The slave side
//! ([`slave`]) follows an external master's clock and chip select and
//! reports data through callbacks.
//!
//! Wire contract, for every driver in this module:
//!
//! - bits travel least-significant bit first, always;
//! - 32-bit single-word transfers put the most significant *byte* on the
//!   wire first (callers holding native little-endian words get the byte
//!   reversal applied for them);
//! - array transfers move bytes (or words) in memory order.

use embedded_hal::spi::{Phase, Polarity};

pub mod asynch;
pub mod master;
pub mod shared;
pub mod slave;

/// SPI transfer mode: clock polarity and phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Mode 0: polarity 0, phase 0. Clock idles low, data is captured on
    /// the leading edge.
    #[default]
    Mode0,
    /// Mode 1: polarity 0, phase 1.
    Mode1,
    /// Mode 2: polarity 1, phase 0.
    Mode2,
    /// Mode 3: polarity 1, phase 1.
    Mode3,
}

impl Mode {
    /// Clock polarity: `true` when the clock idles high.
    pub fn cpol(self) -> bool {
        matches!(self, Mode::Mode2 | Mode::Mode3)
    }

    /// Clock phase: `true` when data is captured on the trailing edge.
    pub fn cpha(self) -> bool {
        matches!(self, Mode::Mode1 | Mode::Mode3)
    }
}

impl From<embedded_hal::spi::Mode> for Mode {
    fn from(mode: embedded_hal::spi::Mode) -> Self {
        match (mode.polarity, mode.phase) {
            (Polarity::IdleLow, Phase::CaptureOnFirstTransition) => Mode::Mode0,
            (Polarity::IdleLow, Phase::CaptureOnSecondTransition) => Mode::Mode1,
            (Polarity::IdleHigh, Phase::CaptureOnFirstTransition) => Mode::Mode2,
            (Polarity::IdleHigh, Phase::CaptureOnSecondTransition) => Mode::Mode3,
        }
    }
}

impl From<Mode> for embedded_hal::spi::Mode {
    fn from(mode: Mode) -> Self {
        let polarity = if mode.cpol() {
            Polarity::IdleHigh
        } else {
            Polarity::IdleLow
        };
        let phase = if mode.cpha() {
            Phase::CaptureOnSecondTransition
        } else {
            Phase::CaptureOnFirstTransition
        };
        embedded_hal::spi::Mode { polarity, phase }
    }
}

/// Transfer unit width used by the slave driver and the word paths of the
/// offload queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataWidth {
    /// 8-bit units.
    #[default]
    Bits8,
    /// 32-bit units.
    Bits32,
}

impl DataWidth {
    pub(crate) fn bits(self) -> u8 {
        match self {
            DataWidth::Bits8 => 8,
            DataWidth::Bits32 => 32,
        }
    }
}

/// Driver errors.
///
/// `UnsupportedRate` is the only recoverable case: pick another rate and
/// retry. Everything else reports a call-sequencing bug in the client;
/// continuing after one risks corrupting bus state for every other client,
/// so callers should treat them as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Operation attempted after the engine was shut down.
    InvalidState,
    /// Transfer attempted without an open transaction.
    NoActiveSession,
    /// Shutdown (or another idle-only operation) attempted while a
    /// transaction is open.
    SessionInProgress,
    /// Async buffer retrieved without a pending completion, or submitted
    /// while a previous submission is still in flight.
    OwnershipViolation,
    /// The requested speed cannot be matched to any achievable clock
    /// setting within the device's constraints.
    UnsupportedRate,
    /// The device table is full.
    TooManyDevices,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidState => write!(f, "engine has been shut down"),
            Error::NoActiveSession => write!(f, "no transaction is open"),
            Error::SessionInProgress => write!(f, "a transaction is open"),
            Error::OwnershipViolation => write!(f, "buffer ownership contract violated"),
            Error::UnsupportedRate => write!(f, "requested clock rate is not achievable"),
            Error::TooManyDevices => write!(f, "device table is full"),
        }
    }
}

impl embedded_hal::spi::Error for Error {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        embedded_hal::spi::ErrorKind::Other
    }
}
