use derive_try_from_primitive::TryFromPrimitive;
use std::fmt;

/// Number of GPIO lines exposed by the BCM283x/BCM2711 GPIO block.
pub const MAX_PINS: u32 = 54;

/// A validated GPIO line number (BCM numbering).
///
/// Values are always below `MAX_PINS`, so register layers never need to re-check them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pin(u8);

impl Pin {
    pub fn new(number: u32) -> Option<Self> {
        if number < MAX_PINS {
            Some(Self(number as u8))
        } else {
            None
        }
    }

    pub fn number(self) -> u32 {
        u32::from(self.0)
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn all() -> impl Iterator<Item = Pin> {
        (0..MAX_PINS as u8).map(Pin)
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<HeaderPin> for Pin {
    fn from(header: HeaderPin) -> Self {
        Pin(header as u8)
    }
}

/// Mapping from physical position of pins on the 40-pin header to BCM GPIO numbers.
///
/// Only header positions wired to a GPIO line are listed.
#[repr(u8)]
#[derive(TryFromPrimitive, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HeaderPin {
    Phy3 = 2,
    Phy5 = 3,
    Phy7 = 4,
    Phy8 = 14,
    Phy10 = 15,
    Phy11 = 17,
    Phy12 = 18,
    Phy13 = 27,
    Phy15 = 22,
    Phy16 = 23,
    Phy18 = 24,
    Phy19 = 10,
    Phy21 = 9,
    Phy22 = 25,
    Phy23 = 11,
    Phy24 = 8,
    Phy26 = 7,
    Phy29 = 5,
    Phy31 = 6,
    Phy32 = 12,
    Phy33 = 13,
    Phy35 = 19,
    Phy36 = 16,
    Phy37 = 26,
    Phy38 = 20,
    Phy40 = 21,
}

impl HeaderPin {
    /// Looks up the header pin by its physical position (1-40).
    pub fn from_position(position: u8) -> Option<Self> {
        use HeaderPin::*;
        Some(match position {
            3 => Phy3,
            5 => Phy5,
            7 => Phy7,
            8 => Phy8,
            10 => Phy10,
            11 => Phy11,
            12 => Phy12,
            13 => Phy13,
            15 => Phy15,
            16 => Phy16,
            18 => Phy18,
            19 => Phy19,
            21 => Phy21,
            22 => Phy22,
            23 => Phy23,
            24 => Phy24,
            26 => Phy26,
            29 => Phy29,
            31 => Phy31,
            32 => Phy32,
            33 => Phy33,
            35 => Phy35,
            36 => Phy36,
            37 => Phy37,
            38 => Phy38,
            40 => Phy40,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_are_bounded() {
        assert_eq!(Pin::new(53).map(Pin::number), Some(53));
        assert!(Pin::new(MAX_PINS).is_none());
        assert_eq!(Pin::all().count(), MAX_PINS as usize);
    }

    #[test]
    fn header_positions_map_to_bcm_numbers() {
        assert_eq!(Pin::from(HeaderPin::from_position(12).unwrap()).number(), 18);
        assert_eq!(Pin::from(HeaderPin::from_position(3).unwrap()).number(), 2);
        assert!(HeaderPin::from_position(1).is_none());
        assert_eq!(HeaderPin::try_from(21u8).ok(), Some(HeaderPin::Phy40));
    }
}
