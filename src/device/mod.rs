use memmap::{MmapMut, MmapOptions};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use std::convert::AsRef;
use std::fs::File;
use std::hint;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub mod error;
mod memory;
pub mod pin;

use error::DeviceError;
pub use memory::RegisterBlock;

/// The SoC family, derived from the peripheral base address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Soc {
    Bcm2835,
    Bcm2711,
    Unknown,
}

impl Soc {
    pub fn from_base_addr(base_addr: u64) -> Self {
        match base_addr {
            0x3f00_0000 => Soc::Bcm2835,
            0xfe00_0000 => Soc::Bcm2711,
            _ => Soc::Unknown,
        }
    }
}

#[derive(Clone, Debug)]
enum MemorySource {
    Physical(PathBuf),
    Simulated,
}

/// Access to the peripheral address space of the board.
///
/// Every peripheral block (GPIO, SPI, PWM, clocks) lives at a fixed offset from the
/// peripheral base address. `Device` knows how to turn such an offset into a
/// `RegisterBlock`, either by mapping the memory device file or, when simulated, by
/// handing out anonymous memory.
#[derive(Clone, Debug)]
pub struct Device {
    source: MemorySource,
    base_addr: u64,
}

impl Device {
    pub const GPIO_OFFSET: u64 = 0x20_0000;
    pub const SPI0_OFFSET: u64 = 0x20_4000;
    pub const PWM_OFFSET: u64 = 0x20_c000;
    pub const CLOCK_OFFSET: u64 = 0x10_1000;
    pub const DEFAULT_BASE_ADDR: u64 = 0xfe00_0000;
    const BLOCK_SIZE: usize = 4096;

    /// Describes a board whose peripherals are reached through `device_path` (usually `/dev/mem`).
    ///
    /// Nothing is opened until a block is mapped.
    pub fn new<T: AsRef<Path>>(device_path: T, base_addr: u64) -> Self {
        Self {
            source: MemorySource::Physical(device_path.as_ref().to_path_buf()),
            base_addr,
        }
    }

    /// Describes a board whose registers are plain anonymous memory.
    pub fn simulated(base_addr: u64) -> Self {
        Self {
            source: MemorySource::Simulated,
            base_addr,
        }
    }

    pub fn soc(&self) -> Soc {
        Soc::from_base_addr(self.base_addr)
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.source, MemorySource::Simulated)
    }

    /// Maps one page of peripheral registers located `offset` bytes past the base address.
    pub fn map(&self, offset: u64) -> Result<RegisterBlock, DeviceError> {
        match &self.source {
            MemorySource::Simulated => {
                RegisterBlock::anonymous(Self::BLOCK_SIZE).map_err(DeviceError::MemoryMapFailed)
            }
            MemorySource::Physical(path) => {
                let (file_handle, map) = Self::load_device_file(path, self.base_addr + offset)?;
                Ok(RegisterBlock::new(Some(file_handle), map))
            }
        }
    }

    fn load_device_file<T: AsRef<Path>>(
        device_path: T,
        phys_addr: u64,
    ) -> Result<(File, MmapMut), DeviceError> {
        use std::os::unix::io::FromRawFd;
        use DeviceError::*;

        let mut open_flags = OFlag::empty();
        open_flags.insert(OFlag::O_RDWR);
        open_flags.insert(OFlag::O_SYNC);
        open_flags.insert(OFlag::O_CLOEXEC);

        let file_fd =
            open(device_path.as_ref(), open_flags, Mode::empty()).map_err(DeviceAccessFailed)?;

        // SAFETY: Validity of file_fd is checked by Nix.
        let handle = unsafe { File::from_raw_fd(file_fd) };

        let mut map_opts = MmapOptions::new();
        map_opts.offset(phys_addr);
        map_opts.len(Self::BLOCK_SIZE);

        // SAFETY: File handle is valid at this point.
        let map = unsafe { map_opts.map_mut(&handle).map_err(MemoryMapFailed)? };

        Ok((handle, map))
    }
}

/// Spins until `ready` returns true or `timeout` elapses.
///
/// Used for hardware status flags which clear within microseconds. Returns whether `ready`
/// was observed before the deadline.
pub fn poll_until<F: FnMut() -> bool>(timeout: Duration, mut ready: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if ready() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::{poll_until, Device, Soc};
    use std::time::Duration;

    #[test]
    fn base_address_identifies_the_soc() {
        assert_eq!(Soc::from_base_addr(0x3f00_0000), Soc::Bcm2835);
        assert_eq!(Soc::from_base_addr(0xfe00_0000), Soc::Bcm2711);
        assert_eq!(Soc::from_base_addr(0x2000_0000), Soc::Unknown);
    }

    #[test]
    fn simulated_blocks_are_independent() {
        let device = Device::simulated(Device::DEFAULT_BASE_ADDR);
        let gpio = device.map(Device::GPIO_OFFSET).unwrap();
        let spi = device.map(Device::SPI0_OFFSET).unwrap();
        gpio.write(0, 7);
        assert_eq!(spi.read(0), 0);
    }

    #[test]
    fn polling_gives_up_at_the_deadline() {
        assert!(!poll_until(Duration::from_millis(1), || false));
        let mut calls = 0;
        assert!(poll_until(Duration::from_millis(1), || {
            calls += 1;
            calls == 3
        }));
    }

    #[test]
    fn missing_memory_device_is_reported() {
        let device = Device::new("/nonexistent/mem", Device::DEFAULT_BASE_ADDR);
        assert!(device.map(Device::GPIO_OFFSET).is_err());
    }
}
