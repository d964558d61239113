//! Hardware PWM channels.
//!
//! The PWM block has two channels sharing one clock from the clock manager. A channel is
//! claimed by the session which sets it up and released when that session closes.
use crate::device::error::{DeviceError, RequestError};
use crate::device::pin::{Function, Gpio};
use crate::device::{poll_until, Device, RegisterBlock, Soc};
use crate::pin_map::Pin;
use crate::ClientId;
use derive_try_from_primitive::TryFromPrimitive;
use log::{debug, info};
use std::time::Duration;

const PWM_CTL: usize = 0;
const PWM_STA: usize = 1;
const PWM_RNG: [usize; 2] = [4, 8];
const PWM_DAT: [usize; 2] = [5, 9];

const CTL_PWEN: u32 = 1;
const CTL_MSEN: u32 = 1 << 7;

const CM_PWMCTL: usize = 0xa0 / 4;
const CM_PWMDIV: usize = 0xa4 / 4;
const CM_PASSWD: u32 = 0x5a00_0000;
const CM_SRC_OSC: u32 = 1;
const CM_ENAB: u32 = 1 << 4;
const CM_BUSY: u32 = 1 << 7;

const MIN_DIVISOR: u64 = 2;
const MAX_DIVISOR: u64 = 4095;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum PwmMode {
    Balanced = 0,
    MarkSpace = 1,
}

impl PwmMode {
    pub fn from_code(code: u32) -> Option<Self> {
        u8::try_from(code).ok().and_then(|code| Self::try_from(code).ok())
    }
}

/// Channel and pin function routing a PWM channel to `pin`.
fn route(pin: Pin) -> Option<(usize, Function)> {
    Some(match pin.number() {
        12 | 40 => (0, Function::Alt0),
        18 => (0, Function::Alt5),
        13 | 41 | 45 => (1, Function::Alt0),
        19 => (1, Function::Alt5),
        _ => return None,
    })
}

#[derive(Debug, Default, Clone, Copy)]
struct Channel {
    owner: Option<ClientId>,
    pin: Option<Pin>,
    range: u32,
    divisor: u32,
}

#[derive(Debug)]
pub struct Pwm {
    registers: RegisterBlock,
    clock: RegisterBlock,
    oscillator_hz: u64,
    channels: [Channel; 2],
    clock_divisor: Option<u32>,
    timeout: Duration,
}

impl Pwm {
    /// Maps the PWM and clock manager blocks and disables both channels.
    pub fn new(device: &Device, timeout: Duration) -> Result<Self, DeviceError> {
        let registers = device.map(Device::PWM_OFFSET)?;
        let clock = device.map(Device::CLOCK_OFFSET)?;
        registers.write(PWM_CTL, 0);

        let oscillator_hz = match device.soc() {
            Soc::Bcm2711 => 54_000_000,
            _ => 19_200_000,
        };

        Ok(Self {
            registers,
            clock,
            oscillator_hz,
            channels: [Channel::default(); 2],
            clock_divisor: None,
            timeout,
        })
    }

    /// Claims the channel behind `pin` for `client` and starts it with a zero duty cycle.
    pub fn setup(
        &mut self,
        gpio: &Gpio,
        client: ClientId,
        pin: Pin,
        frequency: u32,
        range: u32,
        mode: u32,
    ) -> Result<(), RequestError> {
        let (index, function) = route(pin).ok_or(RequestError::NotSupported)?;
        let mode = PwmMode::from_code(mode).ok_or(RequestError::InvalidArgument)?;
        if frequency == 0 || range == 0 {
            return Err(RequestError::InvalidArgument);
        }

        let channel = self.channels[index];
        if channel.owner.map_or(false, |owner| owner != client) {
            return Err(RequestError::Busy);
        }

        let divisor = self.oscillator_hz / (u64::from(frequency) * u64::from(range));
        if !(MIN_DIVISOR..=MAX_DIVISOR).contains(&divisor) {
            return Err(RequestError::InvalidArgument);
        }
        let divisor = divisor as u32;

        // The clock is shared, a divisor change must not disturb another session's channel.
        let other = self.channels[1 - index];
        if other.owner.map_or(false, |owner| owner != client) && other.divisor != divisor {
            return Err(RequestError::Busy);
        }

        self.program_clock(divisor)?;

        let shift = 8 * index as u32;
        self.registers
            .clear_bits(PWM_CTL, (CTL_PWEN | CTL_MSEN) << shift);
        self.registers.write(PWM_RNG[index], range);
        self.registers.write(PWM_DAT[index], 0);
        let enable = match mode {
            PwmMode::Balanced => CTL_PWEN,
            PwmMode::MarkSpace => CTL_PWEN | CTL_MSEN,
        };
        self.registers.set_bits(PWM_CTL, enable << shift);

        if let Some(previous) = channel.pin.filter(|&previous| previous != pin) {
            gpio.set_function(previous, Function::Input);
        }
        gpio.set_function(pin, function);

        self.channels[index] = Channel {
            owner: Some(client),
            pin: Some(pin),
            range,
            divisor,
        };

        info!(
            "client {} set up PWM{} on GPIO {}: {} Hz, range {}, {:?}",
            client, index, pin, frequency, range, mode
        );
        Ok(())
    }

    pub fn set_duty_cycle(
        &mut self,
        client: ClientId,
        pin: Pin,
        duty: u32,
    ) -> Result<(), RequestError> {
        let (index, _) = route(pin).ok_or(RequestError::NotSupported)?;
        let channel = self.channels[index];

        match channel.owner {
            None => return Err(RequestError::NotSupported),
            Some(owner) if owner != client => return Err(RequestError::Busy),
            Some(_) => {}
        }
        if channel.pin != Some(pin) {
            return Err(RequestError::NotSupported);
        }
        if duty > channel.range {
            return Err(RequestError::InvalidArgument);
        }

        self.registers.write(PWM_DAT[index], duty);
        debug!("PWM{} duty {}/{}", index, duty, channel.range);
        Ok(())
    }

    /// Stops and releases every channel owned by `client`.
    pub fn release(&mut self, gpio: &Gpio, client: ClientId) {
        for index in 0..self.channels.len() {
            let channel = self.channels[index];
            if channel.owner != Some(client) {
                continue;
            }

            let shift = 8 * index as u32;
            self.registers
                .clear_bits(PWM_CTL, (CTL_PWEN | CTL_MSEN) << shift);
            self.registers.write(PWM_DAT[index], 0);
            if let Some(pin) = channel.pin {
                gpio.set_function(pin, Function::Input);
            }
            self.channels[index] = Channel::default();
            debug!("released PWM{} from client {}", index, client);
        }
    }

    /// Logs the register state of the channel routed to `pin`.
    pub fn debug(&self, pin: Pin) {
        let channel = route(pin).map(|(index, _)| index);
        info!(
            "PWM GPIO {} (channel {:?}): ctl={:#x} sta={:#x} rng1={} dat1={} rng2={} dat2={} clkctl={:#x} clkdiv={:#x}",
            pin,
            channel,
            self.registers.read(PWM_CTL),
            self.registers.read(PWM_STA),
            self.registers.read(PWM_RNG[0]),
            self.registers.read(PWM_DAT[0]),
            self.registers.read(PWM_RNG[1]),
            self.registers.read(PWM_DAT[1]),
            self.clock.read(CM_PWMCTL),
            self.clock.read(CM_PWMDIV),
        );
    }

    fn program_clock(&mut self, divisor: u32) -> Result<(), RequestError> {
        if self.clock_divisor == Some(divisor) {
            return Ok(());
        }

        let ctl = self.clock.read(CM_PWMCTL) & 0x00ff_ffff;
        self.clock.write(CM_PWMCTL, CM_PASSWD | (ctl & !CM_ENAB));
        if !poll_until(self.timeout, || self.clock.read(CM_PWMCTL) & CM_BUSY == 0) {
            debug!("PWM clock did not stop");
            return Err(RequestError::Timeout);
        }

        self.clock.write(CM_PWMDIV, CM_PASSWD | (divisor << 12));
        self.clock.write(CM_PWMCTL, CM_PASSWD | CM_SRC_OSC);
        self.clock
            .write(CM_PWMCTL, CM_PASSWD | CM_SRC_OSC | CM_ENAB);
        self.clock_divisor = Some(divisor);

        debug!("PWM clock divisor {}", divisor);
        Ok(())
    }
}
