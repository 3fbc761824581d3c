//! DS2480B wire framing.
//!
//! The adapter consumes bytes in one of two modes. In data mode every byte
//! is shifted onto the 1-Wire and the concurrent read-back is returned; in
//! command mode the byte selects a function (bit I/O, reset, search
//! accelerator, pulse control) or a configuration register. Two reserved
//! bytes switch between the modes, and a data byte equal to the
//! command-mode marker is escaped by doubling.

use crate::types::Speed;

/// Switches the adapter from command mode to data mode.
pub const MODE_DATA: u8 = 0xE1;
/// Switches the adapter from data mode to command mode. Escaped by doubling
/// when it occurs as a data byte.
pub const MODE_COMMAND: u8 = 0xE3;

/// Base bits of every function command.
pub const CMD_COMM: u8 = 0x81;
/// Base bit of every configuration command.
pub const CMD_CONFIG: u8 = 0x01;

/// Function select: single-bit I/O.
pub const FUNCTSEL_BIT: u8 = 0x00;
/// Function select: search accelerator on.
pub const FUNCTSEL_SEARCHON: u8 = 0x30;
/// Function select: search accelerator off.
pub const FUNCTSEL_SEARCHOFF: u8 = 0x20;
/// Function select: 1-Wire reset.
pub const FUNCTSEL_RESET: u8 = 0x40;
/// Function select: pulse / mode change.
pub const FUNCTSEL_CHMOD: u8 = 0x60;

/// Speed bits: regular.
pub const SPEEDSEL_STD: u8 = 0x00;
/// Speed bits: flexible.
pub const SPEEDSEL_FLEX: u8 = 0x04;
/// Speed bits: overdrive.
pub const SPEEDSEL_OD: u8 = 0x08;
/// Speed bits: pulse.
pub const SPEEDSEL_PULSE: u8 = 0x0C;

/// Bit polarity one for single-bit I/O.
pub const BITPOL_ONE: u8 = 0x10;
/// Bit polarity zero for single-bit I/O.
pub const BITPOL_ZERO: u8 = 0x00;
/// Arm strong pullup after the bit carrying this flag.
pub const PRIME5V: u8 = 0x02;

/// Power-on / master-reset timing byte; also the reset command at regular
/// speed.
pub const FUNCTION_RESET: u8 = CMD_COMM | FUNCTSEL_RESET; // 0xC1
/// Start a 5 V strong pullup immediately.
pub const FUNCTION_5VPULSE_NOW: u8 = CMD_COMM | FUNCTSEL_CHMOD | SPEEDSEL_PULSE; // 0xED
/// Arm a 5 V strong pullup.
pub const FUNCTION_5VPULSE_ARM: u8 = FUNCTION_5VPULSE_NOW | PRIME5V; // 0xEF
/// Fire a 12 V program pulse immediately.
pub const FUNCTION_12VPULSE_NOW: u8 = FUNCTION_5VPULSE_NOW | BITPOL_ONE; // 0xFD
/// Terminate an ongoing pulse.
pub const FUNCTION_STOP_PULSE: u8 = CMD_COMM | FUNCTSEL_CHMOD | BITPOL_ONE; // 0xF1

/// Configuration register: pulldown slew rate.
pub const PARAMETER_SLEW: u8 = 0x10;
/// Configuration register: 12 V pulse duration.
pub const PARAMETER_12VPULSE: u8 = 0x20;
/// Configuration register: 5 V pulse duration.
pub const PARAMETER_5VPULSE: u8 = 0x30;
/// Configuration register: write-1 low time.
pub const PARAMETER_WRITE1LOW: u8 = 0x40;
/// Configuration register: data sample offset.
pub const PARAMETER_SAMPLEOFFSET: u8 = 0x50;
/// Configuration register: UART baud rate.
pub const PARAMETER_BAUDRATE: u8 = 0x70;

/// 5 V pulse duration value: until explicitly terminated.
pub const TIME5V_INFINITE: u8 = 0x0E;
/// 12 V pulse duration value: 512 µs.
pub const TIME12V_512US: u8 = 0x08;

/// Reset reply: fixed high bits.
pub const RESET_REPLY_BITS: u8 = 0xC0;
/// Reset reply: chip revision mask.
pub const CHIP_VERSION_MASK: u8 = 0x1C;
/// Reset reply: 12 V program voltage available.
pub const PROGRAM_VOLTAGE_MASK: u8 = 0x20;
/// Reset reply: result mask (short / presence / alarm / no presence).
pub const RESET_RESULT_MASK: u8 = 0x03;

pub const RESET_SHORT: u8 = 0x00;
pub const RESET_PRESENCE: u8 = 0x01;
pub const RESET_ALARM: u8 = 0x02;
pub const RESET_NOPRESENCE: u8 = 0x03;

/// The speed bits the adapter runs bus commands with. Regular rides the
/// flexible timing set, as the original DS9097U driver stack does.
pub(crate) fn speed_bits(speed: Speed) -> u8 {
    match speed {
        Speed::Regular | Speed::Flex => SPEEDSEL_FLEX,
        Speed::Overdrive => SPEEDSEL_OD,
    }
}

/// Which of the two adapter input modes is active.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FramingMode {
    Command,
    Data,
}

/// Append a command byte, switching the adapter out of data mode first if
/// needed. Returns the new mode.
pub(crate) fn frame_command(out: &mut Vec<u8>, mode: FramingMode, byte: u8) -> FramingMode {
    if mode == FramingMode::Data {
        out.push(MODE_COMMAND);
    }
    out.push(byte);
    FramingMode::Command
}

/// Append a data payload, switching the adapter into data mode first if
/// needed and doubling any embedded command-mode markers. Returns the new
/// mode.
pub(crate) fn frame_data(out: &mut Vec<u8>, mode: FramingMode, payload: &[u8]) -> FramingMode {
    if mode == FramingMode::Command {
        out.push(MODE_DATA);
    }
    for &byte in payload {
        out.push(byte);
        if byte == MODE_COMMAND {
            out.push(MODE_COMMAND);
        }
    }
    FramingMode::Data
}

/// Undo the data-mode doubling of [`MODE_COMMAND`] bytes.
#[cfg(test)]
pub(crate) fn unescape_data(framed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(framed.len());
    let mut skip = false;
    for &byte in framed {
        if skip {
            skip = false;
            continue;
        }
        if byte == MODE_COMMAND {
            skip = true;
        }
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_command_values() {
        assert_eq!(FUNCTION_RESET, 0xC1);
        assert_eq!(FUNCTION_5VPULSE_NOW, 0xED);
        assert_eq!(FUNCTION_5VPULSE_ARM, 0xEF);
        assert_eq!(FUNCTION_12VPULSE_NOW, 0xFD);
        assert_eq!(FUNCTION_STOP_PULSE, 0xF1);
    }

    #[test]
    fn command_framing_prepends_marker_only_from_data_mode() {
        let mut out = Vec::new();
        let mode = frame_command(&mut out, FramingMode::Command, 0xC5);
        assert_eq!(out, [0xC5]);
        assert_eq!(mode, FramingMode::Command);

        let mut out = Vec::new();
        let mode = frame_command(&mut out, FramingMode::Data, 0xC5);
        assert_eq!(out, [MODE_COMMAND, 0xC5]);
        assert_eq!(mode, FramingMode::Command);
    }

    #[test]
    fn data_framing_escapes_command_marker() {
        let mut out = Vec::new();
        let mode = frame_data(&mut out, FramingMode::Command, &[0x44, 0xE3, 0xE3, 0x00]);
        assert_eq!(out, [MODE_DATA, 0x44, 0xE3, 0xE3, 0xE3, 0xE3, 0x00]);
        assert_eq!(mode, FramingMode::Data);
    }

    #[test]
    fn data_round_trip() {
        // arbitrary payloads survive framing and unframing
        let payloads: [&[u8]; 4] = [
            &[],
            &[0xE3],
            &[0xE3, 0xE3, 0x55, 0xE3],
            &[0x00, 0xFF, 0xE1, 0xE3, 0x12],
        ];
        for payload in payloads {
            let mut framed = Vec::new();
            frame_data(&mut framed, FramingMode::Data, payload);
            assert_eq!(unescape_data(&framed), payload, "payload {payload:02X?}");
        }
    }
}
