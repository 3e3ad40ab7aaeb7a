//! BIST data object, see [6.4.3].
use proc_bitfield::bitfield;

bitfield! {
    /// The BIST data object, the first object of a BIST message.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct BistDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The requested BIST mode.
        pub mode: u8 [get BistMode, set BistMode] @ 28..=31,
    }
}

/// BIST modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BistMode {
    /// Continuous BMC-encoded carrier.
    CarrierMode2,
    /// Test frames, to be consumed without response.
    TestData,
    /// Any other mode, handled like test data.
    Other(u8),
}

impl From<u8> for BistMode {
    fn from(value: u8) -> Self {
        match value {
            0b0101 => Self::CarrierMode2,
            0b1000 => Self::TestData,
            x => Self::Other(x),
        }
    }
}

impl From<BistMode> for u8 {
    fn from(value: BistMode) -> Self {
        match value {
            BistMode::CarrierMode2 => 0b0101,
            BistMode::TestData => 0b1000,
            BistMode::Other(x) => x,
        }
    }
}
