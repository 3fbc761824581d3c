//! The byte pipe under the protocol engine.
//!
//! [`SerialLink`] is the synchronous transport seam: the real implementation
//! wraps a UART through the `serialport` crate, the integration tests plug
//! in a simulated DS2480B. Reads are governed by a timeout scaled to the
//! expected payload, since the adapter answers strictly in lockstep with
//! what was written.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use snafu::ResultExt;

use crate::types::Baud;
use crate::{IoSnafu, Result};

/// Per-byte share of the read timeout.
const READ_TIMEOUT_PER_BYTE: Duration = Duration::from_millis(20);
/// Fixed floor of the read timeout.
const READ_TIMEOUT_FLOOR: Duration = Duration::from_millis(800);

/// Timeout for a read of `len` reply bytes.
pub(crate) fn read_timeout(len: usize) -> Duration {
    READ_TIMEOUT_PER_BYTE * len as u32 + READ_TIMEOUT_FLOOR
}

/// Options applied when opening a port.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Poll the UART byte-by-byte instead of draining whatever is reported
    /// available. Works around serial drivers whose available-byte count
    /// lies.
    pub bytebang_read: bool,
    /// UART rate to start at. The DS2480B powers up at 9600 baud, so
    /// anything else is rejected; the driver raises the rate later when a
    /// transfer warrants it.
    pub default_baud: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig { bytebang_read: false, default_baud: 9_600 }
    }
}

/// Synchronous byte pipe to the adapter.
pub trait SerialLink {
    /// Name of the underlying port, carried into errors.
    fn port_name(&self) -> &str;

    /// The rate the UART is currently tuned to.
    fn baud(&self) -> Baud;

    /// Retune the UART.
    fn set_baud(&mut self, baud: Baud) -> io::Result<()>;

    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` reply bytes, giving the far side
    /// [`read_timeout`] to produce them. Returns the count actually read;
    /// the caller treats a short read as a protocol failure.
    fn read_with_timeout(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Flush pending output and discard any unread input.
    fn flush(&mut self) -> io::Result<()>;

    /// Hold a line break for the given duration.
    fn send_break(&mut self, duration: Duration) -> io::Result<()>;

    /// Drive DTR and RTS together; dropping both powers the adapter down.
    fn set_dtr_rts(&mut self, level: bool) -> io::Result<()>;

    /// Wait out a protocol settle time. Simulated links may skip it.
    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// [`SerialLink`] over a real serial port.
pub struct UartLink {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    baud: Baud,
    bytebang: bool,
}

impl UartLink {
    /// Open and configure a port for the DS2480B: 8N1, no flow control,
    /// DTR and RTS asserted.
    pub fn open(port_name: &str, config: &PortConfig) -> Result<Self> {
        snafu::ensure!(
            config.default_baud == 9_600,
            crate::InvalidArgumentSnafu {
                reason: format!(
                    "the DS2480B powers up at 9600 baud, not {}",
                    config.default_baud
                )
            }
        );
        let baud = Baud::B9600;

        let mut port = serialport::new(port_name, baud.rate())
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(io_from_serial)
            .context(IoSnafu { port: port_name })?;

        port.write_data_terminal_ready(true)
            .map_err(io_from_serial)
            .context(IoSnafu { port: port_name })?;
        port.write_request_to_send(true)
            .map_err(io_from_serial)
            .context(IoSnafu { port: port_name })?;

        log::debug!("{port_name}: port opened at {} baud", baud.rate());

        Ok(UartLink { port, name: port_name.to_string(), baud, bytebang: config.bytebang_read })
    }

    fn available(&mut self) -> io::Result<usize> {
        self.port.bytes_to_read().map(|n| n as usize).map_err(io_from_serial)
    }

    fn read_bytebang(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        let mut count = 0;
        let mut byte = [0u8; 1];
        while count < buf.len() {
            match self.port.read(&mut byte) {
                Ok(1) => {
                    buf[count] = byte[0];
                    count += 1;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }
            if count < buf.len() && Instant::now() > deadline {
                log::debug!("{}: read timed out after {count} bytes", self.name);
                break;
            }
        }
        Ok(count)
    }

    fn read_available(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        let mut count = 0;
        while count < buf.len() {
            let available = self.available()?;
            if available > 0 {
                let end = (count + available).min(buf.len());
                count += self.port.read(&mut buf[count..end])?;
            } else if Instant::now() > deadline {
                log::debug!("{}: read timed out after {count} bytes", self.name);
                break;
            } else {
                std::thread::yield_now();
            }
        }
        Ok(count)
    }
}

impl SerialLink for UartLink {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn baud(&self) -> Baud {
        self.baud
    }

    fn set_baud(&mut self, baud: Baud) -> io::Result<()> {
        self.port.set_baud_rate(baud.rate()).map_err(io_from_serial)?;
        self.baud = baud;
        log::debug!("{}: baud set to {}", self.name, baud.rate());
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        log::trace!("{}: tx {data:02X?}", self.name);
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn read_with_timeout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + read_timeout(buf.len());
        let count = if self.bytebang {
            self.read_bytebang(buf, deadline)?
        } else {
            self.read_available(buf, deadline)?
        };
        log::trace!("{}: rx {:02X?}", self.name, &buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()?;
        self.port.clear(serialport::ClearBuffer::Input).map_err(io_from_serial)
    }

    fn send_break(&mut self, duration: Duration) -> io::Result<()> {
        self.port.set_break().map_err(io_from_serial)?;
        std::thread::sleep(duration);
        self.port.clear_break().map_err(io_from_serial)
    }

    fn set_dtr_rts(&mut self, level: bool) -> io::Result<()> {
        self.port.write_data_terminal_ready(level).map_err(io_from_serial)?;
        self.port.write_request_to_send(level).map_err(io_from_serial)
    }
}

impl std::fmt::Debug for UartLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UartLink")
            .field("name", &self.name)
            .field("baud", &self.baud)
            .field("bytebang", &self.bytebang)
            .finish()
    }
}

fn io_from_serial(e: serialport::Error) -> io::Error {
    match e.kind {
        serialport::ErrorKind::Io(kind) => io::Error::new(kind, e.description),
        _ => io::Error::other(e.description),
    }
}

/// Serial port names present on this host.
pub fn port_names() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            log::warn!("serial port enumeration failed: {e}");
            Vec::new()
        }
    }
}
