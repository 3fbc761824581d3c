//! The adapter protocol engine.
//!
//! [`SerialAdapter`] translates 1-Wire operations into DS2480B command and
//! data traffic over a [`SerialLink`]. Every operation claims the exclusive
//! lock, assembles its primitives into one packet, runs a single write+read
//! round-trip, and decodes the reply slices. Detection (master reset,
//! verify) runs lazily: a fresh handle, a timeout, or a bad echo marks the
//! state and the next operation re-establishes contact before touching the
//! bus.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use snafu::{ensure, ResultExt};

use crate::commands;
use crate::framer::{
    FUNCTION_12VPULSE_NOW, FUNCTION_5VPULSE_NOW, FUNCTION_RESET, FUNCTION_STOP_PULSE,
    PARAMETER_12VPULSE, PARAMETER_5VPULSE, PARAMETER_BAUDRATE, PARAMETER_SAMPLEOFFSET,
    PARAMETER_SLEW, PARAMETER_WRITE1LOW, TIME12V_512US, TIME5V_INFINITE,
};
use crate::link::{PortConfig, SerialLink, UartLink};
use crate::lock::ExclusiveLock;
use crate::packet::{self, PacketBuilder, MAX_BYTES_STREAMED};
use crate::path::OwPath;
use crate::search::{self, FamilyFilter, ACCEL_FRAME_LEN};
use crate::state::{AdapterState, SearchCursor};
use crate::switch::{BranchSwitch, SwitchFactory, SwitchRegistry};
use crate::types::{Baud, PowerArming, PowerDuration, PowerLevel, ResetResult, RomAddress, Speed};
use crate::{
    AdapterLostSnafu, Error, InvalidArgumentSnafu, IoSnafu, NoPresenceSnafu, NotSupportedSnafu,
    ProtocolEchoSnafu, Result,
};

/// Adapter model name, used in path strings and diagnostics.
pub const ADAPTER_NAME: &str = "DS9097U";

/// Environment variable consulted by [`SerialAdapter::default_adapter`].
pub const PORT_ENV_VAR: &str = "ONEWIRE_PORT";

const BREAK_DURATION: Duration = Duration::from_millis(10);
const BAUD_SETTLE: Duration = Duration::from_millis(5);
const BAUD_GARBAGE_SETTLE: Duration = Duration::from_millis(150);
const POWER_DOWN: Duration = Duration::from_millis(300);
const POWER_UP: Duration = Duration::from_millis(1);
const BREAK_POWER_DOWN: Duration = Duration::from_millis(200);
const BREAK_POWER_UP: Duration = Duration::from_millis(300);

/// Identity of one open adapter: model name plus port name. Paths carry it
/// so cross-adapter path operations can be rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterId {
    name: String,
    port: String,
}

impl AdapterId {
    pub(crate) fn new(name: &str, port: &str) -> Self {
        AdapterId { name: name.to_string(), port: port.to_string() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.port)
    }
}

/// The operation classes with distinct streaming baud preferences.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Operation {
    Byte,
    Search,
}

/// Object-safe slice of the adapter surface that switch drivers and path
/// walking consume.
pub trait OwTransport {
    fn adapter_id(&self) -> AdapterId;
    fn begin_exclusive(&self);
    fn end_exclusive(&self);
    fn reset(&self) -> Result<ResetResult>;
    fn select(&self, rom: RomAddress) -> Result<bool>;
    fn assert_select(&self, rom: RomAddress) -> Result<()>;
    fn block(&self, buf: &mut [u8]) -> Result<()>;
    fn branch_switch(&self, family: u8) -> Result<Box<dyn BranchSwitch>>;
}

/// Driver handle for one DS2480B-based serial adapter.
///
/// The handle is caller-owned; share it behind an `Arc` for multi-threaded
/// use. All operations block and serialize on the adapter's exclusive lock;
/// wrap multi-primitive device transactions in
/// [`begin_exclusive`](Self::begin_exclusive) /
/// [`end_exclusive`](Self::end_exclusive) to keep them atomic. Dropping the
/// handle closes the port.
pub struct SerialAdapter<L: SerialLink> {
    id: AdapterId,
    session: ExclusiveLock,
    core: Mutex<Core<L>>,
}

impl SerialAdapter<UartLink> {
    /// Open a serial port and return a handle to the adapter on it. No bus
    /// traffic happens yet; detection runs on first use (or explicitly via
    /// [`adapter_detected`](Self::adapter_detected)).
    pub fn open(port_name: &str, config: &PortConfig) -> Result<Self> {
        Ok(Self::with_link(UartLink::open(port_name, config)?))
    }

    /// Open the adapter named by the `ONEWIRE_PORT` environment variable.
    pub fn default_adapter() -> Result<Self> {
        let port = std::env::var(PORT_ENV_VAR).ok().ok_or_else(|| {
            InvalidArgumentSnafu {
                reason: format!("{PORT_ENV_VAR} is not set and no port was given"),
            }
            .build()
        })?;
        Self::open(&port, &PortConfig::default())
    }
}

impl<L: SerialLink> SerialAdapter<L> {
    /// Wrap an already-open link. This is the seam the integration tests
    /// use to substitute a simulated adapter.
    pub fn with_link(link: L) -> Self {
        let id = AdapterId::new(ADAPTER_NAME, link.port_name());
        SerialAdapter {
            id,
            session: ExclusiveLock::new(),
            core: Mutex::new(Core {
                link,
                state: AdapterState::new(),
                build: PacketBuilder::new(),
                switches: SwitchRegistry::with_defaults(),
            }),
        }
    }

    pub fn adapter_name(&self) -> &str {
        self.id.name()
    }

    pub fn port_name(&self) -> &str {
        self.id.port()
    }

    pub fn id(&self) -> &AdapterId {
        &self.id
    }

    /// The root [`OwPath`] on this adapter.
    pub fn root_path(&self) -> OwPath {
        OwPath::root(self.id.clone())
    }

    /// Register a switch driver for a custom coupler family.
    pub fn register_switch_family(&self, family: u8, factory: SwitchFactory) {
        let _session = self.session.guard();
        self.lock_core().switches.register(family, factory);
    }

    // ---- capability probes ------------------------------------------------

    pub fn can_overdrive(&self) -> bool {
        true
    }

    pub fn can_hyperdrive(&self) -> bool {
        false
    }

    pub fn can_flex(&self) -> bool {
        true
    }

    pub fn can_deliver_power(&self) -> bool {
        true
    }

    pub fn can_deliver_smart_power(&self) -> bool {
        false
    }

    pub fn can_break(&self) -> bool {
        true
    }

    /// Whether the adapter was built with the 12 V program-voltage option.
    /// Needs one reset to have happened, so this may touch the bus.
    pub fn can_program(&self) -> Result<bool> {
        self.with_retry(|core| {
            core.ensure_adapter()?;
            if core.state.revision == 0 {
                core.one_wire_reset()?;
            }
            Ok(core.state.program_voltage_available)
        })
    }

    // ---- detection and diagnostics ---------------------------------------

    /// Force a full detect cycle and report whether a DS2480B answered.
    pub fn adapter_detected(&self) -> bool {
        let _session = self.session.guard();
        let core = &mut *self.lock_core();
        core.state.needs_verify = true;
        core.ensure_adapter().is_ok()
    }

    /// Version string derived from the chip revision in the reset reply.
    pub fn adapter_version(&self) -> Result<String> {
        self.with_retry(|core| {
            core.ensure_adapter()?;
            if core.state.revision == 0 {
                core.one_wire_reset()?;
            }
            Ok(format!("DS2480B based adapter, version {}", core.state.revision >> 2))
        })
    }

    /// Current 1-Wire speed class.
    pub fn speed(&self) -> Speed {
        let _session = self.session.guard();
        self.lock_core().state.speed
    }

    /// Current power level of the line.
    pub fn power_level(&self) -> PowerLevel {
        let _session = self.session.guard();
        self.lock_core().state.level
    }

    // ---- exclusive access -------------------------------------------------

    /// Claim the adapter for a multi-primitive transaction. Re-entrant;
    /// pair every call with [`end_exclusive`](Self::end_exclusive).
    pub fn begin_exclusive(&self) {
        self.session.enter();
    }

    /// Release one exclusive claim.
    pub fn end_exclusive(&self) {
        self.session.exit();
    }

    // ---- raw 1-Wire I/O ---------------------------------------------------

    /// Issue a 1-Wire reset at the current speed and report what answered.
    pub fn reset(&self) -> Result<ResetResult> {
        self.with_retry(Core::one_wire_reset)
    }

    /// Write one bit, verifying the adapter's echo.
    pub fn put_bit(&self, bit: bool) -> Result<()> {
        self.with_retry(|core| {
            let echo = core.bit_io(bit)?;
            if echo != bit {
                return Err(core.protocol("1-Wire bit echo mismatch"));
            }
            Ok(())
        })
    }

    /// Read one bit.
    pub fn get_bit(&self) -> Result<bool> {
        self.with_retry(|core| core.bit_io(true))
    }

    /// Write one byte, verifying the read-back.
    pub fn put_byte(&self, byte: u8) -> Result<()> {
        self.with_retry(|core| {
            let mut block = [byte];
            core.data_block(&mut block)?;
            if block[0] != byte {
                return Err(core.protocol("short on 1-Wire during put_byte"));
            }
            Ok(())
        })
    }

    /// Read one byte.
    pub fn get_byte(&self) -> Result<u8> {
        self.with_retry(|core| {
            let mut block = [0xFF];
            core.data_block(&mut block)?;
            Ok(block[0])
        })
    }

    /// Bidirectional transfer: every byte of `buf` goes onto the bus and is
    /// replaced by the concurrent read-back.
    pub fn block(&self, buf: &mut [u8]) -> Result<()> {
        self.with_retry(|core| core.data_block(buf))
    }

    /// Read `len` bytes by clocking out ones.
    pub fn get_block(&self, len: usize) -> Result<Vec<u8>> {
        self.with_retry(|core| {
            let mut buf = vec![0xFF; len];
            core.data_block(&mut buf)?;
            Ok(buf)
        })
    }

    /// Read the ROM of the only slave on the bus (match-less shortcut).
    pub fn read_rom(&self) -> Result<RomAddress> {
        self.with_retry(|core| {
            let reset = core.one_wire_reset()?;
            if !reset.is_present() {
                return Err(core.no_presence(None));
            }
            let mut block = [0xFF; 9];
            block[0] = commands::READ_ROM;
            core.data_block(&mut block)?;
            RomAddress::try_from(&block[1..])
        })
    }

    // ---- device selection -------------------------------------------------

    /// Reset the bus and, when something is present, address the given
    /// slave with a match-ROM. True iff a presence pulse was seen.
    pub fn select(&self, rom: RomAddress) -> Result<bool> {
        self.with_retry(|core| core.select(rom))
    }

    /// Like [`select`](Self::select), but an absent slave is an error.
    pub fn assert_select(&self, rom: RomAddress) -> Result<()> {
        self.with_retry(|core| {
            if core.select(rom)? {
                Ok(())
            } else {
                Err(core.no_presence(Some(rom)))
            }
        })
    }

    /// Non-disturbing presence check; the enumeration cursor is untouched.
    pub fn is_present(&self, rom: RomAddress) -> Result<bool> {
        self.with_retry(|core| core.device_answers(rom, false))
    }

    /// Non-disturbing check that the slave is present *and* alarming.
    pub fn is_alarming(&self, rom: RomAddress) -> Result<bool> {
        self.with_retry(|core| core.device_answers(rom, true))
    }

    // ---- enumeration ------------------------------------------------------

    /// Start the bus enumeration over and find the first device.
    pub fn find_first_device(&self) -> Result<bool> {
        self.with_retry(|core| {
            core.state.cursor.reset();
            core.find_next()
        })
    }

    /// Find the next device, honoring the family filters and search
    /// modifiers.
    pub fn find_next_device(&self) -> Result<bool> {
        self.with_retry(Core::find_next)
    }

    /// The ROM found by the last successful search pass.
    pub fn address(&self) -> RomAddress {
        let _session = self.session.guard();
        RomAddress::from_bytes_unchecked(self.lock_core().state.cursor.rom)
    }

    /// Limit enumeration to one family code.
    pub fn target_family(&self, family: u8) {
        self.target_families(&[family]);
    }

    /// Limit enumeration to a set of family codes.
    pub fn target_families(&self, families: &[u8]) {
        let _session = self.session.guard();
        self.lock_core().state.include_families = families.to_vec();
    }

    /// Skip one family code during enumeration.
    pub fn exclude_family(&self, family: u8) {
        self.exclude_families(&[family]);
    }

    /// Skip a set of family codes during enumeration.
    pub fn exclude_families(&self, families: &[u8]) {
        let _session = self.session.guard();
        self.lock_core().state.exclude_families = families.to_vec();
    }

    /// Drop both family filters.
    pub fn target_all_families(&self) {
        let _session = self.session.guard();
        let core = &mut *self.lock_core();
        core.state.include_families.clear();
        core.state.exclude_families.clear();
    }

    /// Enumerate only slaves in the alarm state.
    pub fn set_search_only_alarming(&self) {
        let _session = self.session.guard();
        self.lock_core().state.only_alarming = true;
    }

    /// Skip the 1-Wire reset in front of each search pass.
    pub fn set_no_reset_search(&self) {
        let _session = self.session.guard();
        self.lock_core().state.skip_reset_on_search = true;
    }

    /// Enumerate all slaves again: clears the alarm-only and no-reset
    /// modifiers.
    pub fn set_search_all(&self) {
        let _session = self.session.guard();
        let core = &mut *self.lock_core();
        core.state.only_alarming = false;
        core.state.skip_reset_on_search = false;
    }

    // ---- speed and power --------------------------------------------------

    /// Switch the 1-Wire speed class. Takes effect with the next command.
    pub fn set_speed(&self, speed: Speed) {
        let _session = self.session.guard();
        self.lock_core().state.speed = speed;
    }

    /// Accept a 5 V power-delivery duration. The DS2480B only does
    /// explicit-stop delivery.
    pub fn set_power_duration(&self, duration: PowerDuration) -> Result<()> {
        ensure!(
            duration == PowerDuration::Infinite,
            NotSupportedSnafu { what: "power delivery durations other than infinite" }
        );
        let _session = self.session.guard();
        self.lock_core().state.power_duration = duration;
        Ok(())
    }

    /// Begin strong-pullup power delivery, immediately or armed on the next
    /// bit/byte primitive.
    pub fn start_power_delivery(&self, arming: PowerArming) -> Result<()> {
        self.with_retry(move |core| core.start_power_delivery(arming))
    }

    /// Accept a 12 V program-pulse duration. Only the EPROM 512 µs pulse is
    /// available.
    pub fn set_program_pulse_duration(&self, duration: PowerDuration) -> Result<()> {
        ensure!(
            duration == PowerDuration::Eprom,
            NotSupportedSnafu { what: "program pulse durations other than 512 microseconds" }
        );
        let _session = self.session.guard();
        self.lock_core().state.program_pulse_duration = duration;
        Ok(())
    }

    /// Fire a 12 V program pulse.
    pub fn start_program_pulse(&self, arming: PowerArming) -> Result<()> {
        ensure!(
            arming == PowerArming::Now,
            NotSupportedSnafu { what: "armed program pulses" }
        );
        self.with_retry(|core| core.start_program_pulse())
    }

    /// Force the line to 0 V, resetting parasite-powered slaves. Leave with
    /// [`set_power_normal`](Self::set_power_normal).
    pub fn start_break(&self) -> Result<()> {
        let _session = self.session.guard();
        let core = &mut *self.lock_core();
        core.link.set_dtr_rts(false).context(IoSnafu { port: core.link.port_name() })?;
        core.link.pause(BREAK_POWER_DOWN);
        core.state.level = PowerLevel::Break;
        Ok(())
    }

    /// Return the line to normal signalling from any power level.
    pub fn set_power_normal(&self) -> Result<()> {
        self.with_retry(Core::power_normal)
    }
}

impl<L: SerialLink> SerialAdapter<L> {
    fn lock_core(&self) -> std::sync::MutexGuard<'_, Core<L>> {
        self.core.lock().expect("adapter core poisoned")
    }

    /// Run one operation under the exclusive lock. A transient I/O or echo
    /// failure marks the adapter for re-verify and the operation is retried
    /// once in the same critical section; everything else surfaces
    /// directly.
    fn with_retry<T>(&self, mut op: impl FnMut(&mut Core<L>) -> Result<T>) -> Result<T> {
        let _session = self.session.guard();
        let core = &mut *self.lock_core();
        match op(core) {
            Err(e) if e.is_transient() => {
                log::warn!("{}: retrying after transient failure: {e}", self.id.port());
                core.state.needs_verify = true;
                op(core)
            }
            result => result,
        }
    }
}

impl<L: SerialLink> OwTransport for SerialAdapter<L> {
    fn adapter_id(&self) -> AdapterId {
        self.id.clone()
    }

    fn begin_exclusive(&self) {
        SerialAdapter::begin_exclusive(self);
    }

    fn end_exclusive(&self) {
        SerialAdapter::end_exclusive(self);
    }

    fn reset(&self) -> Result<ResetResult> {
        SerialAdapter::reset(self)
    }

    fn select(&self, rom: RomAddress) -> Result<bool> {
        SerialAdapter::select(self, rom)
    }

    fn assert_select(&self, rom: RomAddress) -> Result<()> {
        SerialAdapter::assert_select(self, rom)
    }

    fn block(&self, buf: &mut [u8]) -> Result<()> {
        SerialAdapter::block(self, buf)
    }

    fn branch_switch(&self, family: u8) -> Result<Box<dyn BranchSwitch>> {
        let _session = self.session.guard();
        self.lock_core().switches.create(family)
    }
}

impl<L: SerialLink> fmt::Debug for SerialAdapter<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialAdapter").field("id", &self.id).finish()
    }
}

/// Everything behind the mutex: the link, the adapter state, and the packet
/// under construction.
struct Core<L> {
    link: L,
    state: AdapterState,
    build: PacketBuilder,
    switches: SwitchRegistry,
}

impl<L: SerialLink> Core<L> {
    fn port(&self) -> String {
        self.link.port_name().to_string()
    }

    fn protocol(&self, detail: impl Into<String>) -> Error {
        ProtocolEchoSnafu { port: self.port(), detail: detail.into() }.build()
    }

    fn no_presence(&self, rom: Option<RomAddress>) -> Error {
        NoPresenceSnafu { port: self.port(), address: rom }.build()
    }

    fn flush_link(&mut self) -> Result<()> {
        let port = self.port();
        self.link.flush().context(IoSnafu { port })
    }

    /// Write the assembled packet and collect its full expected reply. A
    /// short read is a timeout: the adapter is flagged for re-verify and
    /// the error surfaces as `Io`.
    fn transact(&mut self) -> Result<Vec<u8>> {
        let mut reply = Vec::with_capacity(self.build.expected_len());
        let mut failure = None;

        for segment in self.build.segments() {
            if let Some(settle) = segment.settle {
                self.link.pause(settle);
                if let Err(e) = self.link.flush() {
                    failure = Some(e);
                    break;
                }
                continue;
            }
            if segment.tx.is_empty() {
                continue;
            }
            if let Err(e) = self.link.write_all(&segment.tx) {
                failure = Some(e);
                break;
            }
            let start = reply.len();
            reply.resize(start + segment.rx_len, 0);
            match self.link.read_with_timeout(&mut reply[start..]) {
                Ok(n) if n == segment.rx_len => {}
                Ok(n) => {
                    failure = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("expected {} reply bytes, got {n}", segment.rx_len),
                    ));
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => Ok(reply),
            Some(e) => {
                self.state.needs_verify = true;
                Err(e).context(IoSnafu { port: self.link.port_name() })
            }
        }
    }

    // ---- detection --------------------------------------------------------

    /// Make sure a verified DS2480B is on the other end, re-running the
    /// reset ladder when the state is marked stale. Master reset twice,
    /// then a power reset; if none of the verifies pass the adapter is
    /// gone.
    fn ensure_adapter(&mut self) -> Result<()> {
        if !self.state.needs_verify {
            return Ok(());
        }
        for attempt in 0..3u8 {
            if attempt < 2 {
                self.master_reset();
            } else {
                self.power_reset();
            }
            if self.verify() {
                self.state.needs_verify = false;
                log::debug!("{}: adapter detected", self.link.port_name());
                return Ok(());
            }
        }
        log::error!("{}: adapter did not answer detection", self.link.port_name());
        AdapterLostSnafu { port: self.port() }.fail()
    }

    /// Knock the DS2480B back to 9600 baud command mode: line break, settle,
    /// then the timing byte.
    fn master_reset(&mut self) {
        log::debug!("{}: master reset", self.link.port_name());
        let result = (|| -> std::io::Result<()> {
            self.link.set_baud(Baud::B9600)?;
            self.state.apply_master_reset();
            self.link.send_break(BREAK_DURATION)?;
            self.link.pause(BAUD_SETTLE);
            self.link.flush()?;
            self.link.write_all(&[FUNCTION_RESET])?;
            self.link.flush()
        })();
        if let Err(e) = result {
            log::error!("{}: master reset failed: {e}", self.link.port_name());
        }
    }

    /// Power-cycle the DS2480B through DTR/RTS, then re-send the timing
    /// byte.
    fn power_reset(&mut self) {
        log::debug!("{}: power reset", self.link.port_name());
        let result = (|| -> std::io::Result<()> {
            self.link.set_baud(Baud::B9600)?;
            self.state.apply_master_reset();
            self.link.set_dtr_rts(false)?;
            self.link.pause(POWER_DOWN);
            self.link.set_dtr_rts(true)?;
            self.link.pause(POWER_UP);
            self.link.flush()?;
            self.link.write_all(&[FUNCTION_RESET])?;
            self.link.flush()
        })();
        if let Err(e) = result {
            log::error!("{}: power reset failed: {e}", self.link.port_name());
        }
    }

    /// Program the timing parameters for the current speed, arm an
    /// infinite 5 V pulse duration, and confirm the adapter by reading the
    /// baud register back and sampling one bit.
    fn verify(&mut self) -> bool {
        let result = (|| -> Result<bool> {
            self.flush_link()?;
            self.build.restart();
            let timing = self.state.timing();
            self.build.set_parameter(&mut self.state, PARAMETER_SLEW, timing.pulldown_slew);
            self.build.set_parameter(&mut self.state, PARAMETER_WRITE1LOW, timing.write_1_low);
            self.build.set_parameter(&mut self.state, PARAMETER_SAMPLEOFFSET, timing.sample_offset);
            self.build.set_parameter(&mut self.state, PARAMETER_5VPULSE, TIME5V_INFINITE);
            let baud_offset = self.build.get_parameter(&mut self.state, PARAMETER_BAUDRATE);
            let bit_offset = self.build.data_bit(&mut self.state, true, false);

            let reply = self.transact()?;
            Ok(reply.len() == bit_offset + 1
                && reply[baud_offset] & 0xF1 == 0
                && reply[baud_offset] & 0x0E == self.state.baud.code()
                && reply[bit_offset] & 0xF0 == 0x90
                && reply[bit_offset] & 0x0C == self.state.speed_bits())
        })();
        match result {
            Ok(ok) => ok,
            Err(e) => {
                log::debug!("{}: verify failed: {e}", self.link.port_name());
                false
            }
        }
    }

    // ---- streaming baud ---------------------------------------------------

    fn desired_baud(&self, operation: Operation, payload_len: usize) -> Baud {
        match operation {
            Operation::Byte => {
                if self.state.speed == Speed::Overdrive || payload_len > MAX_BYTES_STREAMED {
                    Baud::B115200
                } else {
                    Baud::B9600
                }
            }
            Operation::Search => {
                if self.state.speed == Speed::Overdrive {
                    Baud::B57600
                } else {
                    Baud::B9600
                }
            }
        }
    }

    /// Retune host and adapter for the upcoming operation. The set-baud
    /// command goes out at the old rate with no reply read; after the UART
    /// follows, the baud register is read back to confirm the adapter made
    /// the jump. A failed confirmation falls back to 9600 and re-detects.
    fn set_streaming_baud(&mut self, operation: Operation, payload_len: usize) -> Result<()> {
        let want = self.desired_baud(operation, payload_len);
        if want == self.state.baud && want == self.link.baud() {
            return Ok(());
        }
        log::debug!(
            "{}: streaming baud change {} -> {}",
            self.link.port_name(),
            self.state.baud.rate(),
            want.rate()
        );

        self.state.needs_verify = true;
        self.flush_link()?;
        self.build.restart();
        self.build.set_parameter(&mut self.state, PARAMETER_BAUDRATE, want.code());
        let tx: Vec<u8> =
            self.build.segments().iter().flat_map(|s| s.tx.iter().copied()).collect();
        let port = self.port();
        self.link.write_all(&tx).context(IoSnafu { port: port.clone() })?;
        self.link.pause(BAUD_SETTLE);
        self.link.flush().context(IoSnafu { port: port.clone() })?;
        self.link.set_baud(want).context(IoSnafu { port })?;
        self.state.baud = want;
        self.link.pause(BAUD_SETTLE);

        self.build.restart();
        let offset = self.build.get_parameter(&mut self.state, PARAMETER_BAUDRATE);
        let confirmed = match self.transact() {
            Ok(reply) => reply
                .get(offset)
                .is_some_and(|&r| r & 0xF1 == 0 && r & 0x0E == want.code()),
            Err(e) => {
                log::debug!("{}: baud confirmation failed: {e}", self.link.port_name());
                false
            }
        };

        if confirmed {
            self.state.needs_verify = false;
            self.link.pause(BAUD_GARBAGE_SETTLE);
            self.flush_link()?;
            Ok(())
        } else {
            log::error!("{}: failed to change adapter baud, reverting", self.link.port_name());
            let port = self.port();
            self.link.set_baud(Baud::B9600).context(IoSnafu { port })?;
            self.state.baud = Baud::B9600;
            self.state.needs_verify = true;
            self.ensure_adapter()
        }
    }

    // ---- primitives -------------------------------------------------------

    fn one_wire_reset(&mut self) -> Result<ResetResult> {
        self.ensure_adapter()?;
        self.normalize_level()?;
        self.flush_link()?;
        self.build.restart();
        let offset = self.build.one_wire_reset(&mut self.state);
        let reply = self.transact()?;
        let byte = reply
            .get(offset)
            .copied()
            .ok_or_else(|| self.protocol("no return byte from 1-Wire reset"))?;
        packet::interpret_reset(byte, &mut self.state)
            .ok_or_else(|| self.protocol(format!("unexpected reset reply {byte:#04X}")))
    }

    /// One single-bit transfer, firing a pending armed level change.
    /// Returns the sampled bus bit.
    fn bit_io(&mut self, bit: bool) -> Result<bool> {
        self.ensure_adapter()?;
        self.normalize_level()?;
        self.flush_link()?;
        self.build.restart();
        let arm = self.state.arm_on_next_bit;
        let offset = self.build.data_bit(&mut self.state, bit, arm);
        if arm {
            self.state.arm_on_next_bit = false;
            self.state.level = self.state.primed_level;
        }
        let reply = self.transact()?;
        reply
            .get(offset)
            .map(|&r| packet::interpret_bit(r))
            .ok_or_else(|| self.protocol("no return byte from bit I/O"))
    }

    /// Bidirectional block transfer, firing a pending armed level change on
    /// a single-byte transfer.
    fn data_block(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.ensure_adapter()?;
        self.normalize_level()?;
        self.set_streaming_baud(Operation::Byte, buf.len())?;
        self.flush_link()?;
        self.build.restart();

        if buf.len() == 1 && self.state.arm_on_next_byte {
            let offset = self.build.primed_data_byte(&mut self.state, buf[0]);
            self.state.arm_on_next_byte = false;
            let reply = self.transact()?;
            self.state.level = self.state.primed_level;
            buf[0] = packet::interpret_primed_byte(&reply, offset)
                .ok_or_else(|| self.protocol("short reply to primed byte"))?;
        } else {
            let offset = self.build.data_bytes(&mut self.state, buf);
            let reply = self.transact()?;
            if !packet::interpret_data_bytes(&reply, offset, buf) {
                return Err(self.protocol("short reply to data block"));
            }
        }
        Ok(())
    }

    fn select(&mut self, rom: RomAddress) -> Result<bool> {
        let reset = self.one_wire_reset()?;
        match reset {
            ResetResult::Short => {
                Err(crate::BusShortSnafu { port: self.port() }.build())
            }
            ResetResult::NoPresence => Ok(false),
            ResetResult::Presence | ResetResult::Alarm => {
                let mut block = [0u8; 9];
                block[0] = commands::MATCH_ROM;
                block[1..].copy_from_slice(rom.bytes());
                self.data_block(&mut block)?;
                Ok(true)
            }
        }
    }

    // ---- search -----------------------------------------------------------

    /// One pass of the ROM search against the live cursor. False when the
    /// bus is empty or the pass collapsed.
    fn run_search(&mut self, only_alarming: bool) -> Result<bool> {
        self.ensure_adapter()?;
        self.normalize_level()?;
        self.set_streaming_baud(Operation::Search, ACCEL_FRAME_LEN)?;
        self.flush_link()?;
        self.build.restart();

        let reset_offset = if self.state.skip_reset_on_search {
            None
        } else {
            Some(self.build.one_wire_reset(&mut self.state))
        };
        let command =
            if only_alarming { commands::ALARM_SEARCH } else { commands::SEARCH_ROM };
        self.build.data_byte(&mut self.state, command);
        let frame_offset = self.build.search(&mut self.state);

        let reply = self.transact()?;

        if let Some(offset) = reset_offset {
            let byte = reply
                .get(offset)
                .copied()
                .ok_or_else(|| self.protocol("no return byte from search reset"))?;
            let reset = packet::interpret_reset(byte, &mut self.state)
                .ok_or_else(|| self.protocol(format!("unexpected reset reply {byte:#04X}")))?;
            match reset {
                ResetResult::Short => {
                    self.state.cursor.reset();
                    return Err(crate::BusShortSnafu { port: self.port() }.build());
                }
                ResetResult::NoPresence => {
                    self.state.cursor.reset();
                    return Ok(false);
                }
                ResetResult::Presence | ResetResult::Alarm => {}
            }
        }

        let frame = reply
            .get(frame_offset..frame_offset + ACCEL_FRAME_LEN)
            .ok_or_else(|| self.protocol("short reply to search frame"))?;
        Ok(search::interpret_frame(&mut self.state.cursor, frame))
    }

    /// Advance the enumeration to the next admitted device.
    fn find_next(&mut self) -> Result<bool> {
        if self.state.cursor.last_device {
            self.state.cursor.reset();
            return Ok(false);
        }

        // a single-family target jumps straight into that subtree
        if self.state.cursor.last_discrepancy == 0
            && !self.state.cursor.last_device
            && self.state.include_families.len() == 1
        {
            self.state.cursor.seed_family(self.state.include_families[0]);
        }

        let filter = FamilyFilter {
            include: self.state.include_families.clone(),
            exclude: self.state.exclude_families.clone(),
        };

        loop {
            let found = self.run_search(self.state.only_alarming)?;
            if found && filter.admits(self.state.cursor.rom[0]) {
                return Ok(true);
            }
            // fast-forward over the rest of a filtered-out family subtree
            if found
                && !self.state.cursor.last_device
                && self.state.cursor.last_family_discrepancy != 0
            {
                self.state.cursor.last_discrepancy = self.state.cursor.last_family_discrepancy;
                self.state.cursor.last_family_discrepancy = 0;
                self.state.cursor.last_device = false;
                continue;
            }
            self.state.cursor.reset();
            return Ok(false);
        }
    }

    /// Presence probe that leaves the enumeration cursor untouched. Uses a
    /// targeted search at regular and flexible speed, the strong-access
    /// block at overdrive.
    fn device_answers(&mut self, rom: RomAddress, alarm_only: bool) -> Result<bool> {
        self.ensure_adapter()?;
        self.normalize_level()?;

        if self.state.speed == Speed::Overdrive {
            return self.strong_access(rom, alarm_only);
        }

        let saved_cursor = std::mem::replace(&mut self.state.cursor, SearchCursor::new());
        let saved_skip = self.state.skip_reset_on_search;
        self.state.cursor.seed_target(*rom.bytes());
        self.state.skip_reset_on_search = false;

        let outcome = self.run_search(alarm_only);
        let found_rom = self.state.cursor.rom;

        self.state.cursor = saved_cursor;
        self.state.skip_reset_on_search = saved_skip;
        Ok(outcome? && found_rom == *rom.bytes())
    }

    /// Directed triplet block: the target only participates if present (and
    /// alarming, for the alarm variant). Presence shows as eight clean
    /// triplets at the tail.
    fn strong_access(&mut self, rom: RomAddress, alarm_only: bool) -> Result<bool> {
        let reset = self.one_wire_reset()?;
        if !reset.is_present() {
            return Ok(false);
        }
        let mut command =
            [if alarm_only { commands::ALARM_SEARCH } else { commands::SEARCH_ROM }];
        self.data_block(&mut command)?;

        let mut block = search::strong_access_block(rom.bytes());
        self.data_block(&mut block)?;
        Ok(search::strong_access_present(rom.bytes(), &block))
    }

    // ---- power ------------------------------------------------------------

    fn normalize_level(&mut self) -> Result<()> {
        if self.state.level == PowerLevel::Normal {
            Ok(())
        } else {
            self.power_normal()
        }
    }

    /// Return to normal signalling. Stopping a strong pullup cleanly needs
    /// a stop pulse, a fresh unprimed start, and a final stop whose echo is
    /// checked.
    fn power_normal(&mut self) -> Result<()> {
        match self.state.level {
            PowerLevel::Normal => Ok(()),
            PowerLevel::StrongPullup | PowerLevel::ProgramPulse => {
                self.ensure_adapter()?;
                self.flush_link()?;
                self.build.restart();
                self.build.send_command(&mut self.state, FUNCTION_STOP_PULSE, true);
                self.build.send_command(&mut self.state, FUNCTION_5VPULSE_NOW, false);
                let offset =
                    self.build.send_command(&mut self.state, FUNCTION_STOP_PULSE, true);
                let reply = self.transact()?;
                let confirmed = reply.len() == offset + 1
                    && reply[offset] & 0xFC == FUNCTION_STOP_PULSE & 0xFC;
                if !confirmed {
                    return Err(self.protocol("no response from stopping power delivery"));
                }
                self.state.level = PowerLevel::Normal;
                Ok(())
            }
            PowerLevel::Break => {
                let port = self.port();
                self.link.set_dtr_rts(true).context(IoSnafu { port })?;
                self.link.pause(BREAK_POWER_UP);
                self.state.level = PowerLevel::Normal;
                self.state.needs_verify = true;
                self.ensure_adapter()
            }
        }
    }

    fn start_power_delivery(&mut self, arming: PowerArming) -> Result<()> {
        match arming {
            PowerArming::AfterNextBit => {
                self.state.arm_on_next_bit = true;
                self.state.primed_level = PowerLevel::StrongPullup;
                Ok(())
            }
            PowerArming::AfterNextByte => {
                self.state.arm_on_next_byte = true;
                self.state.primed_level = PowerLevel::StrongPullup;
                Ok(())
            }
            PowerArming::Now => {
                self.ensure_adapter()?;
                self.normalize_level()?;
                self.flush_link()?;
                self.build.restart();
                let offset =
                    self.build.set_parameter(&mut self.state, PARAMETER_5VPULSE, TIME5V_INFINITE);
                self.build.send_command(&mut self.state, FUNCTION_5VPULSE_NOW, false);
                let reply = self.transact()?;
                if reply.len() != offset + 1 {
                    return Err(self.protocol("no response from starting power delivery"));
                }
                self.state.level = PowerLevel::StrongPullup;
                Ok(())
            }
        }
    }

    fn start_program_pulse(&mut self) -> Result<()> {
        self.ensure_adapter()?;
        if self.state.revision == 0 {
            self.one_wire_reset()?;
        }
        ensure!(
            self.state.program_voltage_available,
            NotSupportedSnafu { what: "12 V program pulse on this adapter" }
        );
        self.normalize_level()?;
        self.flush_link()?;
        self.build.restart();
        self.build.set_parameter(&mut self.state, PARAMETER_12VPULSE, TIME12V_512US);
        let offset = self.build.send_command(&mut self.state, FUNCTION_12VPULSE_NOW, true);
        let reply = self.transact()?;
        let confirmed = reply.len() == offset + 1
            && reply[offset] & 0xFC == FUNCTION_12VPULSE_NOW & 0xFC;
        if !confirmed {
            return Err(self.protocol("no response from program pulse"));
        }
        Ok(())
    }
}
