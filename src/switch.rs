//! Branch switches: the slaves that gate remote bus segments.
//!
//! A tree-shaped 1-Wire network hangs sub-buses off couplers such as the
//! DS2409. Opening a path means walking its switches and latching the right
//! channel on each one. The drivers here know the switch command sets; the
//! path walking lives in [`crate::path`].

use std::collections::HashMap;

use snafu::ensure;

use crate::adapter::OwTransport;
use crate::types::RomAddress;
use crate::{InvalidArgumentSnafu, NotSupportedSnafu, ProtocolEchoSnafu, Result};

/// Family code of the DS2409 coupler.
pub const FAMILY_DS2409: u8 = 0x1F;

/// Desired latch state queued against one channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LatchRequest {
    Off,
    On,
    /// Turn the channel on and report whether anything answered on the
    /// branch, for switches that support it.
    SmartOn,
}

/// Snapshot of a switch, read from the device and edited channel-by-channel
/// before being written back. The snapshot is authoritative: `set_latch`
/// only touches the addressed channel, so a single-channel toggle can never
/// clobber the other channels.
#[derive(Debug, Clone, Default)]
pub struct SwitchState {
    /// Raw status byte as the device reported it.
    pub status: u8,
    /// Whether the last smart-on saw devices on the branch.
    pub devices_seen: bool,
    pending: Vec<(u8, LatchRequest)>,
}

impl SwitchState {
    fn queue(&mut self, channel: u8, request: LatchRequest) {
        self.pending.retain(|&(ch, _)| ch != channel);
        self.pending.push((channel, request));
    }

    fn take_pending(&mut self) -> Vec<(u8, LatchRequest)> {
        std::mem::take(&mut self.pending)
    }
}

/// Driver for one family of branch switches.
pub trait BranchSwitch {
    /// Family code this driver serves.
    fn family(&self) -> u8;

    /// Number of switchable channels.
    fn channel_count(&self) -> u8;

    /// Whether the switch can report branch activity while latching on.
    fn has_smart_on(&self) -> bool;

    /// Read the switch's state snapshot.
    fn read_state(&self, bus: &dyn OwTransport, rom: RomAddress) -> Result<SwitchState>;

    /// Queue a latch change for one channel of the snapshot.
    /// # Errors
    /// Returns [`crate::Error::InvalidArgument`] for a channel the switch
    /// does not have.
    fn set_latch(
        &self,
        state: &mut SwitchState,
        channel: u8,
        on: bool,
        smart: bool,
    ) -> Result<()>;

    /// Push the queued latch changes to the device.
    fn write_state(
        &self,
        bus: &dyn OwTransport,
        rom: RomAddress,
        state: &mut SwitchState,
    ) -> Result<()>;

    /// Whether a channel's latch is on in the given snapshot.
    fn latch_is_on(&self, state: &SwitchState, channel: u8) -> Result<bool>;
}

/// The DS2409 two-channel coupler.
///
/// Channel 0 is the main output, channel 1 the auxiliary. Only one channel
/// can conduct at a time; latching one on drops the other.
#[derive(Debug, Default)]
pub struct Ds2409;

const READ_WRITE_STATUS: u8 = 0x5A;
const ALL_LINES_OFF: u8 = 0x66;
const DISCHARGE: u8 = 0x99;
const DIRECT_ON_MAIN: u8 = 0xA5;
const SMART_ON_MAIN: u8 = 0xCC;
const SMART_ON_AUX: u8 = 0x33;

impl Ds2409 {
    /// Run one addressed command against the coupler: select, send the
    /// command and its stimulus byte, then clock out `extra` confirmation
    /// bytes. The device echoes the command (or duplicates the status byte)
    /// in the final slot; a bad echo gets one more attempt.
    fn device_operation(
        &self,
        bus: &dyn OwTransport,
        rom: RomAddress,
        command: u8,
        send_byte: u8,
        extra: usize,
    ) -> Result<Vec<u8>> {
        let mut last_err = None;
        for _ in 0..2 {
            let mut buf = vec![0xFF; extra + 2];
            buf[0] = command;
            buf[1] = send_byte;

            bus.assert_select(rom)?;
            bus.block(&mut buf)?;

            let verified = if command == READ_WRITE_STATUS {
                buf[buf.len() - 1] == buf[buf.len() - 2]
            } else {
                buf[buf.len() - 1] == command
            };
            if verified {
                return Ok(buf);
            }
            last_err = Some(
                ProtocolEchoSnafu {
                    port: bus.adapter_id().port().to_string(),
                    detail: format!("coupler {rom} did not confirm command {command:#04X}"),
                }
                .build(),
            );
        }
        Err(last_err.expect("two attempts always record an error"))
    }

    /// Force a power-on reset of parasitically powered slaves hanging off
    /// the coupler by discharging both outputs. The discharge must hold for
    /// at least 100 ms.
    pub fn discharge_lines(
        &self,
        bus: &dyn OwTransport,
        rom: RomAddress,
        duration_ms: u64,
    ) -> Result<()> {
        let duration_ms = duration_ms.max(100);
        self.device_operation(bus, rom, DISCHARGE, 0xFF, 0)?;
        std::thread::sleep(std::time::Duration::from_millis(duration_ms));
        self.device_operation(bus, rom, READ_WRITE_STATUS, 0xFF, 2)?;
        Ok(())
    }

    fn check_channel(&self, channel: u8) -> Result<()> {
        ensure!(
            channel < self.channel_count(),
            InvalidArgumentSnafu {
                reason: format!("DS2409 has no channel {channel}")
            }
        );
        Ok(())
    }
}

impl BranchSwitch for Ds2409 {
    fn family(&self) -> u8 {
        FAMILY_DS2409
    }

    fn channel_count(&self) -> u8 {
        2
    }

    fn has_smart_on(&self) -> bool {
        true
    }

    fn read_state(&self, bus: &dyn OwTransport, rom: RomAddress) -> Result<SwitchState> {
        let buf = self.device_operation(bus, rom, READ_WRITE_STATUS, 0xFF, 2)?;
        Ok(SwitchState { status: buf[2], devices_seen: false, pending: Vec::new() })
    }

    fn set_latch(
        &self,
        state: &mut SwitchState,
        channel: u8,
        on: bool,
        smart: bool,
    ) -> Result<()> {
        self.check_channel(channel)?;
        let request = match (on, smart) {
            (false, _) => LatchRequest::Off,
            (true, false) => LatchRequest::On,
            (true, true) => LatchRequest::SmartOn,
        };
        state.queue(channel, request);
        Ok(())
    }

    fn write_state(
        &self,
        bus: &dyn OwTransport,
        rom: RomAddress,
        state: &mut SwitchState,
    ) -> Result<()> {
        for (channel, request) in state.take_pending() {
            // main channel has a non-smart direct-on; the aux side latches
            // through smart-on only
            let (command, extra) = match (channel, request) {
                (_, LatchRequest::Off) => (ALL_LINES_OFF, 0),
                (0, LatchRequest::On) => (DIRECT_ON_MAIN, 0),
                (0, LatchRequest::SmartOn) => (SMART_ON_MAIN, 2),
                (1, _) => (SMART_ON_AUX, 2),
                (ch, _) => {
                    self.check_channel(ch)?;
                    unreachable!("channel validated at queue time")
                }
            };
            let buf = self.device_operation(bus, rom, command, 0xFF, extra)?;
            state.devices_seen = (command == SMART_ON_MAIN || command == SMART_ON_AUX)
                && buf[2] == 0x00;
        }
        Ok(())
    }

    fn latch_is_on(&self, state: &SwitchState, channel: u8) -> Result<bool> {
        self.check_channel(channel)?;
        // status bit is low-active per latch
        Ok(state.status >> (channel * 2) & 1 == 0)
    }
}

/// Constructor for a family's switch driver.
pub type SwitchFactory = fn() -> Box<dyn BranchSwitch>;

/// Closed mapping from family code to switch driver, populated with the
/// DS2409 and extendable at open time for custom couplers.
pub struct SwitchRegistry {
    factories: HashMap<u8, SwitchFactory>,
}

impl SwitchRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = SwitchRegistry { factories: HashMap::new() };
        registry.register(FAMILY_DS2409, || Box::new(Ds2409));
        registry
    }

    /// Register (or replace) the driver for a family code.
    pub fn register(&mut self, family: u8, factory: SwitchFactory) {
        self.factories.insert(family, factory);
    }

    /// Build a driver for the family.
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] for families with no
    /// registered driver.
    pub fn create(&self, family: u8) -> Result<Box<dyn BranchSwitch>> {
        let factory = self.factories.get(&family).copied();
        let factory =
            factory.ok_or_else(|| NotSupportedSnafu { what: "switch family" }.build())?;
        Ok(factory())
    }
}

impl std::fmt::Debug for SwitchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchRegistry")
            .field("families", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for SwitchRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
