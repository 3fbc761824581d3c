use anyhow::{Context, Result};
use std::io::Write;
use std::iter::Peekable;
use std::str::{FromStr, SplitWhitespace};

use ds2480_proto::{PortConfig, RomAddress, SerialAdapter, UartLink};

fn cmd_scan(adapter: &SerialAdapter<UartLink>, alarming: bool) -> Result<()> {
    if alarming {
        adapter.set_search_only_alarming();
    } else {
        adapter.set_search_all();
    }
    let mut found = adapter.find_first_device()?;
    let mut count = 0;
    while found {
        println!("{}", adapter.address());
        count += 1;
        found = adapter.find_next_device()?;
    }
    println!("{count} device(s)");
    Ok(())
}

fn cmd_present(args: &mut CmdScanner, adapter: &SerialAdapter<UartLink>) -> Result<()> {
    let rom: RomAddress = args.parse_next()?;
    println!("{}", adapter.is_present(rom)?);
    Ok(())
}

fn cmd_byte(args: &mut CmdScanner, adapter: &SerialAdapter<UartLink>) -> Result<()> {
    let byte = u8::from_str_radix(args.next()?, 16).context("hex byte expected")?;
    adapter.put_byte(byte)?;
    Ok(())
}

fn main() {
    env_logger::init();

    let mut args = std::env::args();
    args.next(); // skip program name
    let port = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    let adapter = SerialAdapter::open(&port, &PortConfig::default())
        .expect("Failed to open serial port");
    if !adapter.adapter_detected() {
        eprintln!("No DS2480B answered on {port}");
        return;
    }
    println!("{}", adapter.adapter_version().unwrap_or_default());

    let mut stdout = std::io::stdout();
    loop {
        print!(">> ");
        stdout.flush().unwrap();
        let mut cmd = String::new();
        let mut scan = CmdScanner::read_stdin(&mut cmd);
        if let Err(err) = match scan.next() {
            Err(_) => continue,
            Ok("scan") | Ok("s") => cmd_scan(&adapter, false),
            Ok("alarm") => cmd_scan(&adapter, true),
            Ok("reset") => adapter.reset().map(|r| println!("{r:?}")).map_err(Into::into),
            Ok("rom") => adapter.read_rom().map(|r| println!("{r}")).map_err(Into::into),
            Ok("present") => cmd_present(&mut scan, &adapter),
            Ok("byte") => cmd_byte(&mut scan, &adapter),
            Ok("quit") | Ok("q") => break,
            Ok(cmd) => {
                println!("Unknown command {cmd}");
                continue;
            }
        } {
            println!("{err:?}")
        }
    }
}

struct CmdScanner<'a> {
    splt: Peekable<SplitWhitespace<'a>>,
}

impl<'a> CmdScanner<'a> {
    fn read_stdin(buf: &'a mut String) -> Self {
        buf.clear();
        std::io::stdin().read_line(buf).unwrap();
        let splt = buf.split_whitespace().peekable();
        Self { splt }
    }

    fn next(&mut self) -> Result<&str> {
        self.splt.next().context("End of stream")
    }

    fn parse_next<T: FromStr>(&mut self) -> Result<T> {
        self.next()?.parse::<T>().ok().context("Parse error")
    }
}
