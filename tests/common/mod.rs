//! Simulated platform for host-run driver tests.
//!
//! One [`Wire`] models the bus: MOSI bits pre-loaded by the data port are
//! moved to the capture side by the clock (loopback wiring), every clocked
//! bit and chip-select write is recorded, and the reference timer is a
//! plain counter that advances on every read.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use pio_spi::clock::ClockSource;
use pio_spi::port::{
    CaptureTiming, ClockBlock, ClockLine, DataIn, DataOut, OutPort, QspiPorts, SlaveBus, SpiPorts,
    UnitCapture,
};
use pio_spi::spi::master::Spi;
use pio_spi::spi::slave::SlaveHandler;
use pio_spi::time::RefTimer;
use pio_spi::Mode;

#[derive(Default)]
pub struct WireState {
    pub loopback: bool,
    /// Data bits per clock cycle: 1 for plain SPI, 4 for quad.
    pub bits_per_cycle: u8,
    /// Bits pre-loaded for output, waiting to be clocked.
    pub pending_out: VecDeque<bool>,
    /// Bits captured on the input side, waiting to be shifted in.
    pub captured: VecDeque<bool>,
    /// Every bit that was actually clocked onto the bus.
    pub sent: Vec<bool>,
    /// Clock cycles emitted through the clock block path.
    pub cycles: u32,
    /// Level transitions on SCLK in the timed (bit-banged) path.
    pub sclk_transitions: u32,
    pub sclk_level: bool,
    /// Current level on the data-out line(s), for timed sampling.
    pub out_level: u32,
    /// Every value driven on the chip-select port.
    pub cs_history: Vec<u32>,
    /// Every (source, divisor) pair configured on the clock block.
    pub clock_configs: Vec<(ClockSource, u8)>,
    pub clock_started: u32,
    pub clock_stopped: u32,
    /// Capture timings applied to the input port.
    pub capture_timings: Vec<CaptureTiming>,
}

#[derive(Clone)]
pub struct Wire(Arc<Mutex<WireState>>);

impl Wire {
    pub fn new(loopback: bool) -> Self {
        Wire(Arc::new(Mutex::new(WireState {
            loopback,
            bits_per_cycle: 1,
            ..WireState::default()
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, WireState> {
        self.0.lock().unwrap()
    }

    pub fn set_bits_per_cycle(&self, bits: u8) {
        self.state().bits_per_cycle = bits;
    }

    pub fn cycles(&self) -> u32 {
        self.state().cycles
    }

    pub fn sclk_transitions(&self) -> u32 {
        self.state().sclk_transitions
    }

    pub fn cs_history(&self) -> Vec<u32> {
        self.state().cs_history.clone()
    }

    pub fn clock_configs(&self) -> Vec<(ClockSource, u8)> {
        self.state().clock_configs.clone()
    }

    pub fn sent_bits(&self) -> Vec<bool> {
        self.state().sent.clone()
    }

    /// The clocked-out bit stream decoded as bytes, LSB-first per byte.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent_bits()
            .chunks(8)
            .map(|bits| {
                bits.iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, b)| acc | ((*b as u8) << i))
            })
            .collect()
    }

    fn clock_one_cycle(state: &mut WireState) {
        for _ in 0..state.bits_per_cycle {
            let bit = state.pending_out.pop_front().unwrap_or(false);
            state.sent.push(bit);
            if state.loopback {
                state.captured.push_back(bit);
            }
        }
        state.cycles += 1;
    }
}

pub struct SimCs(pub Wire);

impl OutPort for SimCs {
    fn out(&mut self, value: u32) {
        self.0.state().cs_history.push(value);
    }
}

pub struct SimSclk(pub Wire);

impl OutPort for SimSclk {
    fn out(&mut self, value: u32) {
        let mut state = self.0.state();
        let level = value & 1 != 0;
        if level != state.sclk_level {
            state.sclk_level = level;
            state.sclk_transitions += 1;
        }
    }
}

impl ClockLine for SimSclk {
    fn configure_mode(&mut self, mode: Mode) {
        self.0.state().sclk_level = mode.cpol();
    }

    fn run_cycles(&mut self, cycles: u8) {
        let mut state = self.0.state();
        for _ in 0..cycles {
            Wire::clock_one_cycle(&mut state);
        }
    }
}

pub struct SimMosi(pub Wire);

impl OutPort for SimMosi {
    fn out(&mut self, value: u32) {
        let mut state = self.0.state();
        state.out_level = value & 1;
        state.sent.push(value & 1 != 0);
    }
}

impl DataOut for SimMosi {
    fn shift_out(&mut self, bits: u32, count: u8) {
        let mut state = self.0.state();
        for i in 0..count {
            state.pending_out.push_back((bits >> i) & 1 != 0);
        }
    }
}

pub struct SimMiso(pub Wire);

impl DataIn for SimMiso {
    fn sample(&mut self) -> u32 {
        let state = self.0.state();
        if state.loopback {
            state.out_level & 1
        } else {
            0
        }
    }

    /// Returns the most recent `count` captured bits and clears the
    /// capture buffer, like a buffered port being drained.
    fn shift_in(&mut self, count: u8) -> u32 {
        let mut state = self.0.state();
        let skip = state.captured.len().saturating_sub(count as usize);
        let mut value = 0u32;
        for (i, bit) in state.captured.iter().skip(skip).enumerate() {
            if *bit {
                value |= 1 << i;
            }
        }
        state.captured.clear();
        value
    }

    fn set_capture_timing(&mut self, timing: CaptureTiming) {
        self.0.state().capture_timings.push(timing);
    }
}

/// Quad data port: four lines on one bidirectional port.
pub struct SimSio(pub Wire);

impl OutPort for SimSio {
    fn out(&mut self, value: u32) {
        self.0.state().out_level = value & 0xf;
    }
}

impl DataOut for SimSio {
    fn shift_out(&mut self, bits: u32, count: u8) {
        let mut state = self.0.state();
        for i in 0..count {
            state.pending_out.push_back((bits >> i) & 1 != 0);
        }
    }
}

impl DataIn for SimSio {
    fn sample(&mut self) -> u32 {
        let state = self.0.state();
        if state.loopback {
            state.out_level & 0xf
        } else {
            0
        }
    }

    fn shift_in(&mut self, count: u8) -> u32 {
        let mut state = self.0.state();
        let skip = state.captured.len().saturating_sub(count as usize);
        let mut value = 0u32;
        for (i, bit) in state.captured.iter().skip(skip).enumerate() {
            if *bit {
                value |= 1 << i;
            }
        }
        state.captured.clear();
        value
    }

    fn set_capture_timing(&mut self, timing: CaptureTiming) {
        self.0.state().capture_timings.push(timing);
    }
}

pub struct SimClockBlock(pub Wire);

impl ClockBlock for SimClockBlock {
    fn configure(&mut self, source: ClockSource, divisor: u8) {
        self.0.state().clock_configs.push((source, divisor));
    }

    fn start(&mut self) {
        self.0.state().clock_started += 1;
    }

    fn stop(&mut self) {
        self.0.state().clock_stopped += 1;
    }
}

/// Reference timer that advances one tick per read.
#[derive(Clone)]
pub struct SimTimer(Arc<AtomicU32>);

impl SimTimer {
    pub fn new() -> Self {
        SimTimer(Arc::new(AtomicU32::new(0)))
    }

    pub fn value(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl RefTimer for SimTimer {
    fn now(&mut self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

pub type SimPorts = SpiPorts<SimCs, SimSclk, SimMosi, SimMiso>;
pub type SimQspiPorts = QspiPorts<SimCs, SimSclk, SimSio>;
pub type SimSpi = Spi<SimPorts, SimTimer, SimClockBlock>;

pub fn sim_ports(wire: &Wire) -> SimPorts {
    SpiPorts::new(SimCs(wire.clone()), SimSclk(wire.clone()))
        .with_mosi(SimMosi(wire.clone()))
        .with_miso(SimMiso(wire.clone()))
}

/// A clocked loopback bus: MOSI wired back to MISO.
pub fn loopback() -> (SimSpi, SimTimer, Wire) {
    let wire = Wire::new(true);
    let timer = SimTimer::new();
    let spi = Spi::new(
        sim_ports(&wire),
        SimClockBlock(wire.clone()),
        timer.clone(),
    );
    (spi, timer, wire)
}

/// A timed (clock-block-less) loopback bus.
pub fn loopback_timed() -> (Spi<SimPorts, SimTimer>, SimTimer, Wire) {
    let wire = Wire::new(true);
    let timer = SimTimer::new();
    let spi = Spi::new_timed(sim_ports(&wire), timer.clone());
    (spi, timer, wire)
}

/// A quad-wire loopback bus.
pub fn qspi_loopback() -> (Spi<SimQspiPorts, SimTimer, SimClockBlock>, SimTimer, Wire) {
    let wire = Wire::new(true);
    wire.set_bits_per_cycle(4);
    let timer = SimTimer::new();
    let ports = QspiPorts::new(SimCs(wire.clone()), SimSclk(wire.clone()), SimSio(wire.clone()));
    let spi = Spi::new(ports, SimClockBlock(wire.clone()), timer.clone());
    (spi, timer, wire)
}

/// Scripted external master for slave-side tests.
///
/// Each transaction is a list of `(bits, count)` units the master clocks;
/// a unit shorter than the configured width models the master de-asserting
/// chip select mid-unit.
pub struct ScriptedSlaveBus {
    transactions: VecDeque<VecDeque<(u32, u8)>>,
    current: Option<VecDeque<(u32, u8)>>,
    /// Every unit the driver pre-loaded for output.
    pub loaded: Vec<(u32, u8)>,
}

impl ScriptedSlaveBus {
    pub fn new(script: Vec<Vec<(u32, u8)>>) -> Self {
        Self {
            transactions: script.into_iter().map(VecDeque::from).collect(),
            current: None,
            loaded: Vec::new(),
        }
    }
}

impl SlaveBus for ScriptedSlaveBus {
    fn selected(&mut self) -> bool {
        if self.current.is_none() {
            self.current = self.transactions.pop_front();
        }
        self.current.is_some()
    }

    fn transfer_unit(&mut self, out: u32, count: u8) -> UnitCapture {
        self.loaded.push((out, count));
        let Some(units) = self.current.as_mut() else {
            return UnitCapture {
                bits: 0,
                valid_bits: 0,
                deasserted: true,
            };
        };
        match units.pop_front() {
            None => {
                self.current = None;
                UnitCapture {
                    bits: 0,
                    valid_bits: 0,
                    deasserted: true,
                }
            }
            Some((bits, valid_bits)) => {
                let deasserted = valid_bits < count;
                if deasserted {
                    self.current = None;
                }
                UnitCapture {
                    bits,
                    valid_bits,
                    deasserted,
                }
            }
        }
    }
}

/// Slave handler that records every callback.
pub struct RecordingHandler {
    pub tx_data: VecDeque<u32>,
    pub supplied: Vec<(u32, u8)>,
    pub ended: u32,
}

impl RecordingHandler {
    pub fn new(tx_data: Vec<u32>) -> Self {
        Self {
            tx_data: VecDeque::from(tx_data),
            supplied: Vec::new(),
            ended: 0,
        }
    }
}

impl SlaveHandler for RecordingHandler {
    fn master_requires_data(&mut self) -> u32 {
        self.tx_data.pop_front().unwrap_or(0)
    }

    fn master_supplied_data(&mut self, datum: u32, valid_bits: u8) {
        self.supplied.push((datum, valid_bits));
    }

    fn master_ends_transaction(&mut self) {
        self.ended += 1;
    }
}

pub fn leak_bytes(data: Vec<u8>) -> &'static mut [u8] {
    Box::leak(data.into_boxed_slice())
}

pub fn leak_words(data: Vec<u32>) -> &'static mut [u32] {
    Box::leak(data.into_boxed_slice())
}
