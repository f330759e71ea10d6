//! # pio-spi
//!
//! Bit-accurate SPI master and slave drivers for targets whose peripherals
//! are built from programmable I/O ports and clock blocks rather than
//! fixed-function controllers.
//!
//! ## Overview
//!
//! The stack is layered:
//!
//! - [`port`] is the platform seam: port, clock-block, timer and slave-bus
//!   traits, plus the SPI/QSPI port bundles.
//! - [`clock`] is the clock-divider search: pick a source and divisor for
//!   a target rate, rounding down, never exceeding it.
//! - [`spi::master`] is the transfer engine: per-device configuration,
//!   transactions with RAII release, 8-bit, 32-bit and array transfers,
//!   strict chip-select timing.
//! - [`spi::shared`] adds first-come-first-served arbitration of one bus
//!   between several blocking clients.
//! - [`spi::asynch`] adds non-blocking submission: buffer ownership moves
//!   to the engine, a one-shot notification fires on completion, and
//!   ownership moves back at retrieval.
//! - [`spi::slave`] is the reactive slave role, driven entirely by the
//!   external master's clock and chip select.
//!
//! The crate is `no_std` and carries no allocator. Everything hardware
//! specific (the cycle-level shifting against pads) lives behind the
//! traits in [`port`] and is supplied by the platform.
//!
//! ## Feature Flags
#![doc = document_features::document_features!()]
#![no_std]

// MUST be the first module
mod fmt;

pub mod clock;
pub mod port;
pub mod spi;
pub mod time;

pub use self::{
    clock::{ClockSource, Clocks},
    spi::{DataWidth, Error, Mode},
};
