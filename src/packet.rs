//! Request batching for the DS2480B.
//!
//! UART latency dominates small transfers, so primitives are collected into
//! one write burst with a single contiguous expected reply. Each recorder
//! returns the offset into that reply where the primitive's result will
//! land; after the round-trip the interpreters slice the reply back apart.

use std::time::Duration;

use crate::framer::{
    frame_command, frame_data, BITPOL_ONE, BITPOL_ZERO, CMD_COMM, CMD_CONFIG, FUNCTSEL_BIT,
    FUNCTSEL_RESET, FUNCTSEL_SEARCHOFF, FUNCTSEL_SEARCHON, PRIME5V, RESET_ALARM, RESET_NOPRESENCE,
    RESET_PRESENCE, RESET_REPLY_BITS, RESET_RESULT_MASK, CHIP_VERSION_MASK, PROGRAM_VOLTAGE_MASK,
};
use crate::search;
use crate::state::AdapterState;
use crate::types::{ResetResult, Speed};

/// Data bytes streamed into one segment before a new write burst is begun.
pub(crate) const MAX_BYTES_STREAMED: usize = 128;

/// Settle time after a reset issued at regular or flexible speed, covering
/// the adapter's long alarm-reset window.
const RESET_SETTLE: Duration = Duration::from_millis(6);

/// One write burst plus its expected reply. A segment with a settle time
/// carries no traffic; the transport sleeps and drains instead.
#[derive(Debug)]
pub(crate) struct Segment {
    pub tx: Vec<u8>,
    pub rx_len: usize,
    pub settle: Option<Duration>,
    data_count: usize,
}

impl Segment {
    fn new() -> Self {
        Segment { tx: Vec::new(), rx_len: 0, settle: None, data_count: 0 }
    }

    fn settle(duration: Duration) -> Self {
        Segment { tx: Vec::new(), rx_len: 0, settle: Some(duration), data_count: 0 }
    }

    fn is_empty(&self) -> bool {
        self.tx.is_empty() && self.rx_len == 0 && self.settle.is_none()
    }
}

/// Accumulates framed primitives and tracks where each reply lands.
#[derive(Debug)]
pub(crate) struct PacketBuilder {
    segments: Vec<Segment>,
    expected: usize,
}

impl PacketBuilder {
    pub fn new() -> Self {
        PacketBuilder { segments: vec![Segment::new()], expected: 0 }
    }

    /// Drop any accumulated primitives and start a fresh batch.
    pub fn restart(&mut self) {
        self.segments.clear();
        self.segments.push(Segment::new());
        self.expected = 0;
    }

    /// Total reply bytes the batch will produce.
    pub fn expected_len(&self) -> usize {
        self.expected
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn tail(&mut self) -> &mut Segment {
        if self.segments.last().map_or(true, |s| s.settle.is_some()) {
            self.segments.push(Segment::new());
        }
        self.segments.last_mut().expect("builder holds at least one segment")
    }

    fn push_settle(&mut self, duration: Duration) {
        if self.segments.last().is_some_and(|s| s.is_empty()) {
            self.segments.pop();
        }
        self.segments.push(Segment::settle(duration));
    }

    fn record_reply(&mut self) -> usize {
        self.tail().rx_len += 1;
        let offset = self.expected;
        self.expected += 1;
        offset
    }

    /// Append a 1-Wire reset at the current speed. Returns the reply offset.
    pub fn one_wire_reset(&mut self, st: &mut AdapterState) -> usize {
        let cmd = CMD_COMM | FUNCTSEL_RESET | st.speed_bits();
        let segment = self.tail();
        st.mode = frame_command(&mut segment.tx, st.mode, cmd);
        let offset = self.record_reply();
        if st.speed != Speed::Overdrive {
            self.push_settle(RESET_SETTLE);
        }
        offset
    }

    /// Append a single-bit I/O, optionally arming the strong pullup on the
    /// same bit. Returns the reply offset.
    pub fn data_bit(&mut self, st: &mut AdapterState, bit: bool, arm_power: bool) -> usize {
        let cmd = CMD_COMM
            | FUNCTSEL_BIT
            | st.speed_bits()
            | if bit { BITPOL_ONE } else { BITPOL_ZERO }
            | if arm_power { PRIME5V } else { 0 };
        let segment = self.tail();
        st.mode = frame_command(&mut segment.tx, st.mode, cmd);
        self.record_reply()
    }

    /// Append one data byte. Returns the reply offset.
    pub fn data_byte(&mut self, st: &mut AdapterState, byte: u8) -> usize {
        self.data_bytes(st, &[byte])
    }

    /// Append a run of data bytes, split into bounded write bursts. Returns
    /// the reply offset of the first byte.
    pub fn data_bytes(&mut self, st: &mut AdapterState, payload: &[u8]) -> usize {
        let offset = self.expected;
        for &byte in payload {
            if self.tail().data_count >= MAX_BYTES_STREAMED {
                self.segments.push(Segment::new());
            }
            let segment = self.tail();
            st.mode = frame_data(&mut segment.tx, st.mode, &[byte]);
            segment.data_count += 1;
            self.record_reply();
        }
        offset
    }

    /// Append one byte transferred as eight bit commands with the strong
    /// pullup armed on the last. Returns the reply offset of the first bit.
    pub fn primed_data_byte(&mut self, st: &mut AdapterState, byte: u8) -> usize {
        let mut offset = 0;
        for i in 0..8 {
            let bit_offset = self.data_bit(st, (byte >> i) & 1 == 1, i == 7);
            if i == 0 {
                offset = bit_offset;
            }
        }
        offset
    }

    /// Append a configuration write. Returns the reply offset.
    pub fn set_parameter(&mut self, st: &mut AdapterState, parameter: u8, value: u8) -> usize {
        let segment = self.tail();
        st.mode = frame_command(&mut segment.tx, st.mode, CMD_CONFIG | parameter | value);
        self.record_reply()
    }

    /// Append a configuration read. Returns the reply offset.
    pub fn get_parameter(&mut self, st: &mut AdapterState, parameter: u8) -> usize {
        let segment = self.tail();
        st.mode = frame_command(&mut segment.tx, st.mode, CMD_CONFIG | (parameter >> 3));
        self.record_reply()
    }

    /// Append a raw function command. When `expect_reply` is false (pulse
    /// commands whose reply is deferred), the returned offset is where the
    /// *next* reply would land and only the batch length check uses it.
    pub fn send_command(&mut self, st: &mut AdapterState, cmd: u8, expect_reply: bool) -> usize {
        let segment = self.tail();
        st.mode = frame_command(&mut segment.tx, st.mode, cmd);
        if expect_reply {
            self.record_reply()
        } else {
            self.expected
        }
    }

    /// Append one search pass: accelerator on, the 16-byte discriminator
    /// frame seeded from the cursor, accelerator off. Returns the reply
    /// offset of the frame. The search command byte itself goes out as a
    /// plain data byte beforehand.
    pub fn search(&mut self, st: &mut AdapterState) -> usize {
        let on = CMD_COMM | FUNCTSEL_SEARCHON | st.speed_bits();
        let off = CMD_COMM | FUNCTSEL_SEARCHOFF | st.speed_bits();
        let frame = search::accelerator_frame(&st.cursor);

        self.send_command(st, on, false);
        let offset = self.data_bytes(st, &frame);
        self.send_command(st, off, false);
        offset
    }
}

/// Decode a single-bit reply: the sampled bus bit is duplicated in the two
/// low bits.
pub(crate) fn interpret_bit(reply: u8) -> bool {
    reply & 0x03 == 0x03
}

/// Decode a reset reply, capturing the chip revision and program-voltage
/// flag. `None` when the byte is not a reset reply at all.
pub(crate) fn interpret_reset(reply: u8, st: &mut AdapterState) -> Option<ResetResult> {
    if reply & RESET_REPLY_BITS != RESET_REPLY_BITS {
        return None;
    }
    st.revision = reply & CHIP_VERSION_MASK;
    st.program_voltage_available = reply & PROGRAM_VOLTAGE_MASK != 0;
    Some(match reply & RESET_RESULT_MASK {
        RESET_PRESENCE => ResetResult::Presence,
        RESET_ALARM => ResetResult::Alarm,
        RESET_NOPRESENCE => ResetResult::NoPresence,
        _ => ResetResult::Short,
    })
}

/// Copy the read-back of a data-byte run out of the reply buffer.
pub(crate) fn interpret_data_bytes(reply: &[u8], offset: usize, out: &mut [u8]) -> bool {
    let Some(slice) = reply.get(offset..offset + out.len()) else {
        return false;
    };
    out.copy_from_slice(slice);
    true
}

/// Reassemble the byte transferred by [`PacketBuilder::primed_data_byte`].
pub(crate) fn interpret_primed_byte(reply: &[u8], offset: usize) -> Option<u8> {
    let bits = reply.get(offset..offset + 8)?;
    let mut byte = 0u8;
    for (i, &bit_reply) in bits.iter().enumerate() {
        if interpret_bit(bit_reply) {
            byte |= 1 << i;
        }
    }
    Some(byte)
}
