//! Host-side driver for DS2480B-based 1-Wire serial adapters (DS9097U).
//!
//! The crate is the adapter protocol engine: it translates high-level
//! 1-Wire operations (reset, bit/byte/block I/O, ROM search, power
//! delivery, speed changes, coupler paths) into the DS2480B's packetized
//! command/data framing over a plain UART, and decodes the replies.
//!
//! ```no_run
//! use ds2480_proto::{PortConfig, SerialAdapter};
//!
//! # fn main() -> ds2480_proto::Result<()> {
//! let adapter = SerialAdapter::open("/dev/ttyUSB0", &PortConfig::default())?;
//! let mut found = adapter.find_first_device()?;
//! while found {
//!     println!("{}", adapter.address());
//!     found = adapter.find_next_device()?;
//! }
//! # Ok(()) }
//! ```
//!
//! Device-specific command sets (temperature conversion, memory banks,
//! switch latches) live above this crate; they drive the raw operation
//! surface, taking [`SerialAdapter::begin_exclusive`] around multi-step
//! transactions. The one device family implemented here is the DS2409
//! coupler, because [`OwPath`] open/close semantics need it.

use snafu::Snafu;

pub mod adapter;
pub mod crc;
pub mod framer;
pub mod link;
mod lock;
mod packet;
pub mod path;
mod search;
mod state;
pub mod switch;
mod types;

pub use adapter::{AdapterId, OwTransport, SerialAdapter, ADAPTER_NAME, PORT_ENV_VAR};
pub use link::{port_names, PortConfig, SerialLink, UartLink};
pub use path::{OwPath, PathElement};
pub use state::{AdapterState, SearchCursor, TimingParams};
pub use switch::{
    BranchSwitch, Ds2409, SwitchFactory, SwitchRegistry, SwitchState, FAMILY_DS2409,
};
pub use types::{
    Baud, PowerArming, PowerDuration, PowerLevel, ResetResult, RomAddress, Speed,
};

/// The 1-Wire ROM command bytes.
pub mod commands {
    /// Read the ROM of the only slave on the bus.
    pub const READ_ROM: u8 = 0x33;
    /// Address one slave by its ROM.
    pub const MATCH_ROM: u8 = 0x55;
    /// Address every slave at once.
    pub const SKIP_ROM: u8 = 0xCC;
    /// Begin a ROM search pass.
    pub const SEARCH_ROM: u8 = 0xF0;
    /// Begin a ROM search pass that only alarming slaves join.
    pub const ALARM_SEARCH: u8 = 0xEC;
    /// Address one slave and shift it into overdrive.
    pub const OVERDRIVE_MATCH: u8 = 0x69;
    /// Shift every slave into overdrive.
    pub const OVERDRIVE_SKIP: u8 = 0x3C;
}

/// Everything that can go wrong talking to the adapter or the bus.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// Serial read/write failure or timeout.
    #[snafu(display("{port}: serial I/O failed: {source}"))]
    Io { port: String, source: std::io::Error },

    /// The adapter's reply disagreed with the command sent.
    #[snafu(display("{port}: {detail}"))]
    ProtocolEcho { port: String, detail: String },

    /// A slave was required but nothing answered the reset.
    #[snafu(display("{port}: no presence pulse{}", match address {
        Some(a) => format!(" from {a}"),
        None => String::new(),
    }))]
    NoPresence { port: String, address: Option<RomAddress> },

    /// The bus is shorted to ground.
    #[snafu(display("{port}: 1-Wire bus is shorted"))]
    BusShort { port: String },

    /// CRC verification failed.
    #[snafu(display("crc check failed for {address}"))]
    Crc { address: RomAddress },

    /// The adapter cannot do what was asked.
    #[snafu(display("{what}: not supported by this adapter"))]
    NotSupported { what: &'static str },

    /// The caller passed something out of range.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// Detection failed repeatedly; close and reopen the port before
    /// further use.
    #[snafu(display("{port}: adapter lost, close and reopen the port"))]
    AdapterLost { port: String },
}

impl Error {
    /// Whether one silent re-verify plus retry is worth attempting.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Error::Io { .. } | Error::ProtocolEcho { .. })
    }
}

/// Crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
