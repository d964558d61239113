//! SPI0 master engine.
//!
//! Transfers go through the hardware FIFOs. Every wait on a status flag is a bounded spin
//! against a wall-clock deadline, so a stuck peripheral yields `Timeout` instead of hanging
//! the request loop.
use crate::device::error::RequestError;
use crate::device::pin::{Function, Gpio};
use crate::device::{poll_until, Device, RegisterBlock};
use crate::pin_map::Pin;
use derive_try_from_primitive::TryFromPrimitive;
use log::{debug, trace, warn};
use std::time::Duration;

/// Largest number of bytes written or read in a single transaction.
pub const MAX_TRANSFER: usize = 8;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10);

const REG_CS: usize = 0;
const REG_FIFO: usize = 1;
const REG_CLK: usize = 2;

const CS_MASK: u32 = 0x3;
const CS_CLEAR_TX: u32 = 1 << 4;
const CS_CLEAR_RX: u32 = 1 << 5;
const CS_TA: u32 = 1 << 7;
const CS_DONE: u32 = 1 << 16;
const CS_RXD: u32 = 1 << 17;
const CS_TXD: u32 = 1 << 18;

/// MISO, MOSI and SCLK.
const SPI_PINS: [u32; 3] = [9, 10, 11];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum ChipSelect {
    Cs0 = 0,
    Cs1 = 1,
    Cs2 = 2,
    /// No chip select line is asserted by the peripheral.
    Manual = 3,
}

impl ChipSelect {
    pub fn from_code(code: u32) -> Option<Self> {
        u8::try_from(code).ok().and_then(|code| Self::try_from(code).ok())
    }
}

#[derive(Debug)]
pub struct Spi {
    registers: Option<RegisterBlock>,
    timeout: Duration,
}

impl Spi {
    pub fn new(timeout: Duration) -> Self {
        Self {
            registers: None,
            timeout,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.registers.is_some()
    }

    /// Maps the SPI block on first use, hands the SPI pins to the peripheral, resets the
    /// FIFOs and programs the clock divider.
    pub fn init(
        &mut self,
        device: &Device,
        gpio: &Gpio,
        clock_divider: u32,
    ) -> Result<(), RequestError> {
        debug!("SPI init, clock divider {}", clock_divider);

        if self.registers.is_none() {
            let registers = device.map(Device::SPI0_OFFSET).map_err(|err| {
                warn!("failed to map SPI registers: {}", err);
                RequestError::ResourceUnavailable
            })?;
            self.registers = Some(registers);
        }
        let registers = self
            .registers
            .as_ref()
            .ok_or(RequestError::ResourceUnavailable)?;

        for pin in SPI_PINS.iter().copied().filter_map(Pin::new) {
            gpio.set_function(pin, Function::Alt0);
        }

        registers.write(REG_CS, 0);
        registers.write(REG_CS, CS_CLEAR_TX | CS_CLEAR_RX);
        registers.write(REG_CLK, clock_divider);

        Ok(())
    }

    /// Writes `output` and then reads `read_len` bytes back on the given chip select line.
    ///
    /// Arguments are validated before any register is touched. On timeout the transfer is
    /// abandoned with the peripheral left as it is.
    pub fn transact(
        &self,
        chip_select: u32,
        output: &[u8],
        read_len: usize,
    ) -> Result<Vec<u8>, RequestError> {
        let cs = ChipSelect::from_code(chip_select).ok_or_else(|| {
            debug!("SPI: invalid chip select {}", chip_select);
            RequestError::InvalidArgument
        })?;
        if output.len() > MAX_TRANSFER || read_len > MAX_TRANSFER {
            return Err(RequestError::InvalidArgument);
        }
        let registers = self.registers.as_ref().ok_or(RequestError::NotSupported)?;

        debug!(
            "SPI: writing {} bytes, reading {} bytes on {:?}",
            output.len(),
            read_len,
            cs
        );

        let cs_reg = registers.read(REG_CS) & !CS_MASK;
        registers.write(REG_CS, cs_reg | cs as u32 | CS_CLEAR_TX | CS_CLEAR_RX);
        registers.set_bits(REG_CS, CS_TA);

        for &byte in output {
            self.wait(registers, CS_TXD, "TX FIFO space")?;
            registers.write(REG_FIFO, u32::from(byte));
            trace!("SPI: wrote {:#04x}", byte);
        }

        let mut input = Vec::with_capacity(read_len);
        for _ in 0..read_len {
            self.wait(registers, CS_RXD, "RX FIFO data")?;
            let byte = registers.read(REG_FIFO) as u8;
            trace!("SPI: read {:#04x}", byte);
            input.push(byte);
        }

        self.wait(registers, CS_DONE, "transfer done")?;
        registers.clear_bits(REG_CS, CS_TA);

        Ok(input)
    }

    fn wait(&self, registers: &RegisterBlock, mask: u32, what: &str) -> Result<(), RequestError> {
        trace!("SPI wait for {}: mask={:#x} cs={:#x}", what, mask, registers.read(REG_CS));
        if poll_until(self.timeout, || registers.read(REG_CS) & mask == mask) {
            Ok(())
        } else {
            debug!(
                "SPI timeout waiting for {}: cs={:#x}",
                what,
                registers.read(REG_CS)
            );
            Err(RequestError::Timeout)
        }
    }

    #[cfg(test)]
    fn registers(&self) -> &RegisterBlock {
        self.registers.as_ref().unwrap()
    }
}
