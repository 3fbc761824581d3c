//! Mutable adapter state, one instance per open port.

use crate::framer::{self, FramingMode};
use crate::types::{Baud, PowerDuration, PowerLevel, Speed};

/// Timing parameter group for one speed class: the three tunable line
/// characteristics the DS2480B keeps per speed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimingParams {
    /// Pulldown slew rate code.
    pub pulldown_slew: u8,
    /// Write-1 low time code.
    pub write_1_low: u8,
    /// Data sample offset code.
    pub sample_offset: u8,
}

// Parameter value codes, pre-shifted into bits 3..1 of a configuration
// command. 1.37 V/µs slew, 10 µs write-1 low, 8 µs sample offset for the
// regular and flexible sets; the fastest codes for overdrive.
const PARAMS_REGULAR: TimingParams =
    TimingParams { pulldown_slew: 0x06, write_1_low: 0x04, sample_offset: 0x0A };
const PARAMS_FLEX: TimingParams =
    TimingParams { pulldown_slew: 0x06, write_1_low: 0x04, sample_offset: 0x0A };
const PARAMS_OVERDRIVE: TimingParams =
    TimingParams { pulldown_slew: 0x00, write_1_low: 0x00, sample_offset: 0x00 };

/// Cursor of the ROM search, carried between calls so each call yields the
/// next device on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCursor {
    /// The ROM found by the previous pass.
    pub rom: [u8; 8],
    /// Bit position (1..=64) of the last discrepancy taken as zero, or 0 to
    /// start over.
    pub last_discrepancy: u8,
    /// Last discrepancy within the family byte (bit position < 9).
    pub last_family_discrepancy: u8,
    /// Set once the previous pass exhausted the discriminator tree.
    pub last_device: bool,
}

impl SearchCursor {
    pub fn new() -> Self {
        SearchCursor { rom: [0; 8], last_discrepancy: 0, last_family_discrepancy: 0, last_device: false }
    }

    /// Start the search over from the beginning of the tree.
    pub fn reset(&mut self) {
        self.last_discrepancy = 0;
        self.last_family_discrepancy = 0;
        self.last_device = false;
    }

    /// Seed the cursor so the next pass jumps straight into the subtree of
    /// one family code.
    pub fn seed_family(&mut self, family: u8) {
        self.rom = [family, 0, 0, 0, 0, 0, 0, 0];
        self.last_discrepancy = 64;
        self.last_family_discrepancy = 0;
        self.last_device = false;
    }

    /// Seed the cursor so the next pass tracks one specific ROM. A following
    /// search returns that ROM iff the device participates.
    pub fn seed_target(&mut self, rom: [u8; 8]) {
        self.rom = rom;
        self.last_discrepancy = 64;
        self.last_family_discrepancy = 0;
        self.last_device = false;
    }
}

impl Default for SearchCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the driver knows about the adapter and the bus, mutated only
/// under the exclusive lock. Created when a port is opened, dropped when it
/// closes.
#[derive(Debug)]
pub struct AdapterState {
    /// UART rate the adapter is currently tuned to.
    pub baud: Baud,
    /// Active 1-Wire speed class.
    pub speed: Speed,
    /// Which input mode the adapter is in (persists across transactions).
    pub mode: FramingMode,
    /// Electrical state of the line.
    pub level: PowerLevel,
    /// Level a pending arm will switch to.
    pub primed_level: PowerLevel,
    /// The next single-bit primitive also triggers the armed level change.
    pub arm_on_next_bit: bool,
    /// The next byte primitive also triggers the armed level change.
    pub arm_on_next_byte: bool,
    /// Accepted 5 V pulse duration.
    pub power_duration: PowerDuration,
    /// Accepted 12 V pulse duration.
    pub program_pulse_duration: PowerDuration,
    /// Chip revision bits from the first reset reply; 0 until seen.
    pub revision: u8,
    /// Whether the reset reply advertised 12 V program voltage.
    pub program_voltage_available: bool,
    /// Set after a timeout or glitch; the next operation re-runs master
    /// reset and verify before touching the bus.
    pub needs_verify: bool,
    /// ROM search cursor.
    pub cursor: SearchCursor,
    /// Families the search reports; empty means all.
    pub include_families: Vec<u8>,
    /// Families the search skips.
    pub exclude_families: Vec<u8>,
    /// Search with the conditional (alarm) command.
    pub only_alarming: bool,
    /// Skip the 1-Wire reset in front of each search pass.
    pub skip_reset_on_search: bool,
    params: [TimingParams; 3],
}

impl AdapterState {
    pub fn new() -> Self {
        AdapterState {
            baud: Baud::B9600,
            speed: Speed::Regular,
            mode: FramingMode::Command,
            level: PowerLevel::Normal,
            primed_level: PowerLevel::Normal,
            arm_on_next_bit: false,
            arm_on_next_byte: false,
            power_duration: PowerDuration::Infinite,
            program_pulse_duration: PowerDuration::Eprom,
            revision: 0,
            program_voltage_available: false,
            needs_verify: true,
            cursor: SearchCursor::new(),
            include_families: Vec::new(),
            exclude_families: Vec::new(),
            only_alarming: false,
            skip_reset_on_search: false,
            params: [PARAMS_REGULAR, PARAMS_FLEX, PARAMS_OVERDRIVE],
        }
    }

    /// State the adapter is in right after a master or power reset: 9600
    /// baud, regular speed, command mode.
    pub fn apply_master_reset(&mut self) {
        self.baud = Baud::B9600;
        self.speed = Speed::Regular;
        self.mode = FramingMode::Command;
    }

    /// Timing parameter group for the active speed.
    pub fn timing(&self) -> TimingParams {
        self.params[self.speed.index()]
    }

    /// Replace the timing parameter group for one speed class.
    pub fn set_timing(&mut self, speed: Speed, params: TimingParams) {
        self.params[speed.index()] = params;
    }

    /// Speed bits embedded into every function command.
    pub fn speed_bits(&self) -> u8 {
        framer::speed_bits(self.speed)
    }
}

impl Default for AdapterState {
    fn default() -> Self {
        Self::new()
    }
}
