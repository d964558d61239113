use crate::client::DEFAULT_SOCKET;
use crate::device::Device;
use crate::spi;
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use std::time::Duration;

/// Command line of the GPIO server.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(author, version, about)]
pub struct Args {
    /// Peripheral base address: 0x3f000000 for a Pi 3, 0xfe000000 for a Pi 4.
    #[arg(short, long, value_parser = parse_address, default_value = "0xfe000000")]
    pub address: u64,

    /// UIO device bound to the GPIO interrupt.
    #[arg(short, long, default_value = "/dev/uio0")]
    pub interrupt: PathBuf,

    /// Socket the namespace is served on.
    #[arg(short, long, default_value = DEFAULT_SOCKET)]
    pub mount: PathBuf,

    /// Permission bits of the directory node, in octal.
    #[arg(short = 'o', long, value_parser = parse_mode, default_value = "755")]
    pub mode: u32,

    /// SCHED_FIFO priority of the interrupt service thread.
    #[arg(short, long)]
    pub priority: Option<i32>,

    /// Identity to switch to once started, as user[:group].
    #[arg(short, long)]
    pub user: Option<String>,

    /// More output per occurrence.
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Memory device giving access to physical addresses.
    #[arg(long, default_value = "/dev/mem")]
    pub memory_device: PathBuf,

    /// Bound on SPI and clock status waits, in milliseconds.
    #[arg(long, default_value_t = spi::DEFAULT_TIMEOUT.as_millis() as u64)]
    pub spi_timeout_ms: u64,

    /// Back every register block with plain memory instead of the board.
    #[arg(long)]
    pub simulate: bool,
}

impl Args {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pub fn device(&self) -> Device {
        if self.simulate {
            Device::simulated(self.address)
        } else {
            Device::new(&self.memory_device, self.address)
        }
    }

    pub fn hardware_timeout(&self) -> Duration {
        Duration::from_millis(self.spi_timeout_ms)
    }
}

fn parse_address(value: &str) -> Result<u64, String> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid address {:?}: {}", value, err))
}

fn parse_mode(value: &str) -> Result<u32, String> {
    match u32::from_str_radix(value.trim_start_matches("0o"), 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        Ok(_) => Err(format!("mode {:?} has bits outside 0o7777", value)),
        Err(err) => Err(format!("invalid mode {:?}: {}", value, err)),
    }
}
