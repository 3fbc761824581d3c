//! ROM search over the DS2480B search accelerator.
//!
//! One pass of the triplet search walks all 64 ROM bit positions in a single
//! bus traversal. The adapter's accelerator takes a 16-byte frame carrying
//! the chosen direction for every position (two frame bits per ROM bit) and
//! returns the same frame rewritten with the discovered ROM bits plus a
//! marker wherever a discrepancy was met. The cursor arithmetic on top of
//! that frame is the classic discriminator-tree walk: retrace the previous
//! ROM up to the last discrepancy, take the one branch there, and zeros
//! beyond.

use arrayvec::ArrayVec;

use crate::crc::crc8_is_valid;
use crate::state::SearchCursor;

/// Bytes in an accelerator frame: 64 ROM bits at two frame bits each.
pub(crate) const ACCEL_FRAME_LEN: usize = 16;

/// Read a bit out of a little-endian bit array.
pub(crate) fn array_bit(buf: &[u8], index: usize) -> bool {
    buf[index / 8] >> (index % 8) & 1 == 1
}

/// Write a bit into a little-endian bit array.
pub(crate) fn set_array_bit(buf: &mut [u8], index: usize, value: bool) {
    let mask = 1 << (index % 8);
    if value {
        buf[index / 8] |= mask;
    } else {
        buf[index / 8] &= !mask;
    }
}

/// Build the accelerator frame for the next search pass. ROM bit `i` maps to
/// frame bit `2i + 1`; positions before the last discrepancy retrace the
/// previous ROM, the position at it goes down the one branch, the rest stay
/// zero.
pub(crate) fn accelerator_frame(cursor: &SearchCursor) -> [u8; ACCEL_FRAME_LEN] {
    let mut frame = [0u8; ACCEL_FRAME_LEN];
    if cursor.last_discrepancy == 0 {
        return frame;
    }
    for i in 0..64 {
        let position = i as u8 + 1;
        if position < cursor.last_discrepancy {
            set_array_bit(&mut frame, i * 2 + 1, array_bit(&cursor.rom, i));
        } else if position == cursor.last_discrepancy {
            set_array_bit(&mut frame, i * 2 + 1, true);
        }
    }
    frame
}

/// Digest the frame the adapter sent back. On success the cursor holds the
/// discovered ROM and is positioned for the following pass; returns false
/// (leaving the found-ROM state unreliable) when the reply describes an
/// empty bus or fails the CRC.
pub(crate) fn interpret_frame(cursor: &mut SearchCursor, frame: &[u8]) -> bool {
    debug_assert_eq!(frame.len(), ACCEL_FRAME_LEN);

    let mut last_zero = 0u8;
    let mut rom = [0u8; 8];
    for i in 0..64 {
        set_array_bit(&mut rom, i, array_bit(frame, i * 2 + 1));
        if array_bit(frame, i * 2) && !array_bit(frame, i * 2 + 1) {
            last_zero = i as u8 + 1;
            if last_zero < 9 {
                cursor.last_family_discrepancy = last_zero;
            }
        }
    }

    if rom[0] == 0 || !crc8_is_valid(&rom) {
        return false;
    }

    cursor.rom = rom;
    cursor.last_discrepancy = last_zero;
    cursor.last_device = last_zero == 0;
    true
}

/// Family filter sets for enumeration.
#[derive(Debug, Default, Clone)]
pub(crate) struct FamilyFilter {
    pub include: Vec<u8>,
    pub exclude: Vec<u8>,
}

impl FamilyFilter {
    /// Whether a found family code passes the exclude list and, when an
    /// include list is set, appears in it.
    pub fn admits(&self, family: u8) -> bool {
        if self.exclude.contains(&family) {
            return false;
        }
        self.include.is_empty() || self.include.contains(&family)
    }
}

/// Encode a target ROM into the 24-byte strong-access block: bit `i` of the
/// ROM lands on the write slot of triplet `i` (bit `3i + 2`), every other
/// bit reads.
pub(crate) fn strong_access_block(rom: &[u8; 8]) -> ArrayVec<u8, 24> {
    let mut block: ArrayVec<u8, 24> = ArrayVec::new();
    block.extend([0xFF; 24]);
    for i in 0..64 {
        set_array_bit(&mut block, (i + 1) * 3 - 1, array_bit(rom, i));
    }
    block
}

/// Examine the last eight triplets of a completed strong-access block: the
/// target took part iff at least eight of them came back uncontested in the
/// target's direction.
pub(crate) fn strong_access_present(rom: &[u8; 8], block: &[u8]) -> bool {
    debug_assert_eq!(block.len(), 24);

    let mut good_bits = 0;
    let mut rom_bit = 56;
    let mut i = 168;
    while i < 192 {
        let triplet = (u8::from(array_bit(block, i)) << 1) | u8::from(array_bit(block, i + 1));
        let expected = array_bit(rom, rom_bit);
        if triplet == 0x03 {
            // nothing answered this slot
            return false;
        }
        if (expected && triplet == 0x02) || (!expected && triplet == 0x01) {
            good_bits += 1;
        }
        rom_bit += 1;
        i += 3;
    }
    good_bits >= 8
}
