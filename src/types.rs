use std::fmt;
use std::str::FromStr;

use snafu::ensure;

use crate::crc::{crc8, crc8_is_valid};
use crate::{CrcSnafu, Error, InvalidArgumentSnafu, Result};

/// 64-bit identifier of a 1-Wire slave.
///
/// Byte 0 is the family code, bytes 1..=6 a unique serial, byte 7 a CRC-8
/// over the first seven bytes. The checked constructors and the enumeration
/// machinery only ever produce addresses whose running CRC-8 is zero.
///
/// ## Example
/// ```
/// use ds2480_proto::RomAddress;
/// let rom: RomAddress = "2A0000000000AA1F".parse().unwrap();
/// assert_eq!(rom.family(), 0x1F);
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct RomAddress([u8; 8]);

impl RomAddress {
    /// Create an address from its wire bytes, verifying the trailing CRC-8.
    /// # Errors
    /// Returns [`Error::Crc`] if the CRC byte does not match.
    pub fn from_bytes(bytes: [u8; 8]) -> Result<Self> {
        ensure!(crc8_is_valid(&bytes), CrcSnafu { address: Self(bytes) });
        Ok(Self(bytes))
    }

    /// Create an address without CRC verification. For addresses that come
    /// from a trusted source, such as a previous enumeration.
    pub const fn from_bytes_unchecked(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create an address from its 64-bit form (byte 0 is the
    /// least-significant byte), verifying the trailing CRC-8.
    /// # Errors
    /// Returns [`Error::Crc`] if the CRC byte does not match.
    pub fn from_u64(value: u64) -> Result<Self> {
        Self::from_bytes(value.to_le_bytes())
    }

    /// The raw wire bytes, family code first.
    pub const fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// The address packed into 64 bits, family code least significant.
    pub const fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    /// The family code identifying the slave type.
    pub const fn family(&self) -> u8 {
        self.0[0]
    }

    /// Whether the trailing CRC-8 is consistent with the other bytes.
    pub fn is_valid(&self) -> bool {
        crc8_is_valid(&self.0)
    }

    /// The CRC-8 over the family and serial bytes.
    pub fn crc(&self) -> u8 {
        crc8(&self.0[..7])
    }
}

impl fmt::Display for RomAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.as_u64())
    }
}

impl fmt::Debug for RomAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RomAddress({self})")
    }
}

impl From<RomAddress> for u64 {
    fn from(rom: RomAddress) -> u64 {
        rom.as_u64()
    }
}

impl FromStr for RomAddress {
    type Err = Error;

    /// Parse the 16-hex-digit string form.
    fn from_str(s: &str) -> Result<Self> {
        ensure!(
            s.len() == 16,
            InvalidArgumentSnafu {
                reason: format!("rom address must be 16 hex digits, got {s:?}")
            }
        );
        let value = u64::from_str_radix(s, 16).ok().ok_or_else(|| {
            InvalidArgumentSnafu { reason: format!("rom address is not hex: {s:?}") }.build()
        })?;
        Self::from_u64(value)
    }
}

impl TryFrom<&[u8]> for RomAddress {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = value.try_into().ok().ok_or_else(|| {
            InvalidArgumentSnafu {
                reason: format!("rom address needs 8 bytes, got {}", value.len()),
            }
            .build()
        })?;
        Self::from_bytes(bytes)
    }
}

/// 1-Wire signalling speed class. `Regular` is the state after any adapter
/// reset; `Overdrive` additionally requires the slaves to have been commanded
/// into overdrive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Speed {
    Regular,
    Flex,
    Overdrive,
}

impl Speed {
    /// Index into the per-speed timing parameter table.
    pub(crate) fn index(self) -> usize {
        match self {
            Speed::Regular => 0,
            Speed::Flex => 1,
            Speed::Overdrive => 2,
        }
    }
}

/// Result of a 1-Wire reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetResult {
    /// No slave answered with a presence pulse.
    NoPresence,
    /// At least one slave is present.
    Presence,
    /// At least one slave is present and alarming.
    Alarm,
    /// The bus is shorted to ground.
    Short,
}

impl ResetResult {
    /// Whether any slave acknowledged the reset.
    pub fn is_present(self) -> bool {
        matches!(self, ResetResult::Presence | ResetResult::Alarm)
    }
}

/// Electrical state of the 1-Wire line beyond normal signalling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PowerLevel {
    Normal,
    StrongPullup,
    Break,
    ProgramPulse,
}

/// When a requested power-level change takes effect.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PowerArming {
    Now,
    AfterNextBit,
    AfterNextByte,
}

/// Requested duration of a power-delivery or program pulse.
///
/// The DS2480B serial adapter only honors `Infinite` for 5 V strong pullup
/// (terminated explicitly) and `Eprom` (512 µs) for the 12 V program pulse.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PowerDuration {
    HalfSecond,
    OneSecond,
    TwoSeconds,
    FourSeconds,
    SmartDone,
    Infinite,
    CurrentDetect,
    Eprom,
}

/// UART baud rates the DS2480B can be tuned to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Baud {
    B9600,
    B19200,
    B57600,
    B115200,
}

impl Baud {
    /// The configuration value bits for the baud-rate parameter.
    pub(crate) fn code(self) -> u8 {
        match self {
            Baud::B9600 => 0x00,
            Baud::B19200 => 0x02,
            Baud::B57600 => 0x04,
            Baud::B115200 => 0x06,
        }
    }

    /// The line rate in bits per second.
    pub fn rate(self) -> u32 {
        match self {
            Baud::B9600 => 9_600,
            Baud::B19200 => 19_200,
            Baud::B57600 => 57_600,
            Baud::B115200 => 115_200,
        }
    }

    /// Map a line rate to its enum value.
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for rates the adapter cannot do.
    pub fn from_rate(rate: u32) -> Result<Self> {
        match rate {
            9_600 => Ok(Baud::B9600),
            19_200 => Ok(Baud::B19200),
            57_600 => Ok(Baud::B57600),
            115_200 => Ok(Baud::B115200),
            other => {
                InvalidArgumentSnafu { reason: format!("unsupported baud rate {other}") }.fail()
            }
        }
    }
}


#[cfg(test)]
mod baud_tests {
    use super::Baud;

    #[test]
    fn rate_round_trip() {
        for baud in [Baud::B9600, Baud::B19200, Baud::B57600, Baud::B115200] {
            assert_eq!(Baud::from_rate(baud.rate()).unwrap(), baud);
        }
        assert!(Baud::from_rate(4800).is_err());
    }
}
