use super::{RegisterBlock, Soc};
use crate::pin_map::Pin;
use derive_try_from_primitive::TryFromPrimitive;
use std::hint;

/// Function select value of a pin, as encoded in the 3-bit GPFSEL fields.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum Function {
    Input = 0,
    Output = 1,
    Alt5 = 2,
    Alt4 = 3,
    Alt0 = 4,
    Alt1 = 5,
    Alt2 = 6,
    Alt3 = 7,
}

impl Function {
    pub fn from_code(code: u32) -> Option<Self> {
        u8::try_from(code).ok().and_then(|code| Self::try_from(code).ok())
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Whether bit 0 of the select value is set: the pin is driven by the SoC rather than sampled.
    pub fn drives(self) -> bool {
        self.code() & 1 != 0
    }
}

/// Logic level of a pin.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum Level {
    Low = 0,
    High = 1,
}

impl Level {
    pub fn from_bit(bit: u32) -> Self {
        if bit == 0 {
            Level::Low
        } else {
            Level::High
        }
    }

    pub fn bit(self) -> u32 {
        self as u32
    }
}

/// Pull resistor configuration.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum Pull {
    Off = 0,
    Down = 1,
    Up = 2,
}

impl Pull {
    pub fn from_code(code: u32) -> Option<Self> {
        u8::try_from(code).ok().and_then(|code| Self::try_from(code).ok())
    }
}

/// Set of edge and level conditions a pin can be armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Trigger(u32);

impl Trigger {
    pub const NONE: Trigger = Trigger(0);
    pub const RISING: Trigger = Trigger(1);
    pub const FALLING: Trigger = Trigger(2);
    pub const HIGH: Trigger = Trigger(4);
    pub const LOW: Trigger = Trigger(8);
    pub const BOTH_EDGES: Trigger = Trigger(1 | 2);
    const ALL: u32 = 0xf;

    /// Builds a trigger from its wire bits, ignoring unknown ones.
    pub fn from_bits(bits: u32) -> Self {
        Trigger(bits & Self::ALL)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Trigger) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Trigger) -> Self {
        Trigger(self.0 | other.0)
    }
}

/* Word indices of the GPIO registers. Registers holding one bit per pin come in pairs
 * (pins 0-31, pins 32-53); function select registers hold ten 3-bit fields each.
 */
const GPFSEL0: usize = 0;
const GPSET0: usize = 7;
const GPCLR0: usize = 10;
const GPLEV0: usize = 13;
const GPEDS0: usize = 16;
const GPREN0: usize = 19;
const GPFEN0: usize = 22;
const GPHEN0: usize = 25;
const GPLEN0: usize = 28;
const GPPUD: usize = 37;
const GPPUDCLK0: usize = 38;
const GPIO_PUP_PDN_CNTRL0: usize = 57;

const PUD_SETTLE_CYCLES: usize = 150;

#[derive(Copy, Clone, Debug)]
struct PinRegisters {
    pin: Pin,
}

impl PinRegisters {
    fn new(pin: Pin) -> Self {
        Self { pin }
    }

    fn bank(&self, first: usize) -> usize {
        first + self.pin.index() / 32
    }

    fn mask(&self) -> u32 {
        1 << (self.pin.index() % 32)
    }

    fn fsel(&self) -> (usize, u32) {
        (GPFSEL0 + self.pin.index() / 10, (self.pin.index() % 10) as u32 * 3)
    }

    fn pup_pdn(&self) -> (usize, u32) {
        (
            GPIO_PUP_PDN_CNTRL0 + self.pin.index() / 16,
            (self.pin.index() % 16) as u32 * 2,
        )
    }

    fn detect(&self, trigger: Trigger) -> Option<usize> {
        let first = match trigger {
            t if t == Trigger::RISING => GPREN0,
            t if t == Trigger::FALLING => GPFEN0,
            t if t == Trigger::HIGH => GPHEN0,
            t if t == Trigger::LOW => GPLEN0,
            _ => return None,
        };
        Some(self.bank(first))
    }
}

/// Register access layer for the GPIO block.
///
/// Every operation is a single read-modify-write of one register word. Pins are `Pin`
/// values, so they are always within the block. Only the request loop changes function,
/// output and detection registers; the interrupt service thread reads levels and
/// acknowledges pending events.
#[derive(Debug)]
pub struct Gpio {
    registers: RegisterBlock,
    soc: Soc,
}

impl Gpio {
    pub fn new(registers: RegisterBlock, soc: Soc) -> Self {
        Self { registers, soc }
    }

    pub fn soc(&self) -> Soc {
        self.soc
    }

    pub fn set_function(&self, pin: Pin, function: Function) {
        let (reg, shift) = PinRegisters::new(pin).fsel();
        self.registers
            .update(reg, |v| (v & !(0b111 << shift)) | (function.code() << shift));
    }

    pub fn get_function(&self, pin: Pin) -> Function {
        let (reg, shift) = PinRegisters::new(pin).fsel();
        let code = (self.registers.read(reg) >> shift) & 0b111;
        Function::from_code(code).unwrap_or(Function::Input)
    }

    pub fn read(&self, pin: Pin) -> Level {
        let regs = PinRegisters::new(pin);
        Level::from_bit(self.registers.read(regs.bank(GPLEV0)) & regs.mask())
    }

    pub fn write(&self, pin: Pin, level: Level) {
        let regs = PinRegisters::new(pin);
        let reg = match level {
            Level::High => regs.bank(GPSET0),
            Level::Low => regs.bank(GPCLR0),
        };
        self.registers.write(reg, regs.mask());
    }

    /// Enables or disables a single detection condition for a pin.
    ///
    /// `trigger` must name exactly one condition, composite triggers are ignored.
    pub fn set_detect(&self, pin: Pin, trigger: Trigger, enable: bool) {
        let regs = PinRegisters::new(pin);
        if let Some(reg) = regs.detect(trigger) {
            if enable {
                self.registers.set_bits(reg, regs.mask());
            } else {
                self.registers.clear_bits(reg, regs.mask());
            }
        }
    }

    /// Arms every condition in `trigger` and disarms the rest.
    pub fn arm(&self, pin: Pin, trigger: Trigger) {
        for single in [Trigger::RISING, Trigger::FALLING, Trigger::HIGH, Trigger::LOW] {
            self.set_detect(pin, single, trigger.contains(single));
        }
    }

    pub fn disarm(&self, pin: Pin) {
        self.arm(pin, Trigger::NONE);
    }

    /// Reads and acknowledges all pending detected events, returning one bit per pin.
    ///
    /// Only the bits that were read are acknowledged, so an event detected in between stays
    /// pending for the next call.
    pub fn take_pending(&self) -> u64 {
        let low = self.registers.read(GPEDS0);
        let high = self.registers.read(GPEDS0 + 1);
        self.registers.write_one_to_clear(GPEDS0, low);
        self.registers.write_one_to_clear(GPEDS0 + 1, high);
        u64::from(low) | (u64::from(high) << 32)
    }

    /// Clears pending events and disables detection on every pin.
    pub fn reset_detection(&self) {
        self.registers.write_one_to_clear(GPEDS0, 0xffff_ffff);
        self.registers.write_one_to_clear(GPEDS0 + 1, 0xffff_ffff);
        for first in [GPREN0, GPFEN0, GPHEN0, GPLEN0] {
            self.registers.write(first, 0);
            self.registers.write(first + 1, 0);
        }
    }

    pub fn set_pull(&self, pin: Pin, pull: Pull) {
        match self.soc {
            Soc::Bcm2711 => self.set_pull_bcm2711(pin, pull),
            _ => self.set_pull_bcm2835(pin, pull),
        }
    }

    fn set_pull_bcm2711(&self, pin: Pin, pull: Pull) {
        // The BCM2711 encodes up and down the other way around.
        let bits = match pull {
            Pull::Off => 0,
            Pull::Up => 1,
            Pull::Down => 2,
        };
        let (reg, shift) = PinRegisters::new(pin).pup_pdn();
        self.registers
            .update(reg, |v| (v & !(0b11 << shift)) | (bits << shift));
    }

    fn set_pull_bcm2835(&self, pin: Pin, pull: Pull) {
        let regs = PinRegisters::new(pin);
        let clk = regs.bank(GPPUDCLK0);

        self.registers.write(GPPUD, pull as u32);
        settle();
        self.registers.write(clk, regs.mask());
        settle();
        self.registers.write(GPPUD, 0);
        self.registers.write(clk, 0);
    }

    /// The raw register block, for diagnostics and for driving a simulated board.
    pub fn registers(&self) -> &RegisterBlock {
        &self.registers
    }
}

fn settle() {
    for _ in 0..PUD_SETTLE_CYCLES {
        hint::spin_loop();
    }
}
