//! Definitions of sink capabilities data message content.
//!
//! Sink capabilities are sent in response to Get_Sink_Cap messages, and are consulted
//! when a sink evaluates the capabilities of a source.
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;

use crate::_50millivolts_mod::_50millivolts;
use crate::_250milliwatts_mod::_250milliwatts;
use crate::units::{ElectricCurrent, ElectricPotential, Power};

bitfield! {
    /// A Sink Fixed Supply PDO.
    ///
    /// Differs from the source fixed supply PDO in bits 28 and 20..=24.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SinkFixedSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Fixed supply (00b)
        pub kind: u8 @ 30..=31,
        /// Dual-Role Power - set if Dual-Role Power supported
        pub dual_role_power: bool @ 29,
        /// Higher Capability - set if sink needs more than vSafe5V for full functionality
        pub higher_capability: bool @ 28,
        /// Unconstrained Power - set if external power source is available
        pub unconstrained_power: bool @ 27,
        /// USB Communications Capable
        pub usb_communications_capable: bool @ 26,
        /// Dual-Role Data
        pub dual_role_data: bool @ 25,
        /// Voltage in 50 mV units
        pub raw_voltage: u16 @ 10..=19,
        /// Operational Current in 10 mA units
        pub raw_operational_current: u16 @ 0..=9,
    }
}

impl SinkFixedSupply {
    /// Create a new SinkFixedSupply PDO for the required vSafe5V entry.
    pub fn new_vsafe5v(operational_current_10ma: u16) -> Self {
        Self::new(100, operational_current_10ma)
    }

    /// Create a new SinkFixedSupply PDO at a specific voltage.
    pub fn new(voltage_50mv: u16, operational_current_10ma: u16) -> Self {
        Self::default()
            .with_kind(0b00)
            .with_raw_voltage(voltage_50mv)
            .with_raw_operational_current(operational_current_10ma)
    }

    pub fn voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_voltage().into())
    }

    pub fn operational_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operational_current().into())
    }
}

bitfield! {
    /// A Sink Battery Supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SinkBattery(pub u32): Debug, FromStorage, IntoStorage {
        /// Battery (01b)
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50 mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50 mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Operational Power in 250 mW units
        pub raw_operational_power: u16 @ 0..=9,
    }
}

impl SinkBattery {
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    pub fn operational_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_operational_power().into())
    }
}

bitfield! {
    /// A Sink Variable Supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SinkVariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Variable supply (10b)
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Operational current in 10mA units
        pub raw_operational_current: u16 @ 0..=9,
    }
}

impl SinkVariableSupply {
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    pub fn operational_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operational_current().into())
    }
}

/// A Sink Power Data Object.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SinkPowerDataObject {
    /// Fixed voltage supply requirement.
    FixedSupply(SinkFixedSupply),
    /// Battery supply requirement.
    Battery(SinkBattery),
    /// Variable voltage supply requirement.
    VariableSupply(SinkVariableSupply),
    /// Any other kind, kept as is.
    Unknown(u32),
}

impl SinkPowerDataObject {
    /// Decode a raw object by its kind field.
    pub fn from_raw(raw: u32) -> Self {
        match raw >> 30 {
            0b00 => Self::FixedSupply(SinkFixedSupply(raw)),
            0b01 => Self::Battery(SinkBattery(raw)),
            0b10 => Self::VariableSupply(SinkVariableSupply(raw)),
            _ => Self::Unknown(raw),
        }
    }

    /// Convert the PDO to its raw u32 representation.
    pub fn to_raw(&self) -> u32 {
        match self {
            SinkPowerDataObject::FixedSupply(f) => f.0,
            SinkPowerDataObject::Battery(b) => b.0,
            SinkPowerDataObject::VariableSupply(v) => v.0,
            SinkPowerDataObject::Unknown(raw) => *raw,
        }
    }

    /// The highest voltage at which the sink can operate with this object.
    pub fn max_voltage(&self) -> Option<ElectricPotential> {
        match self {
            SinkPowerDataObject::FixedSupply(f) => Some(f.voltage()),
            SinkPowerDataObject::Battery(b) => Some(b.max_voltage()),
            SinkPowerDataObject::VariableSupply(v) => Some(v.max_voltage()),
            SinkPowerDataObject::Unknown(_) => None,
        }
    }
}

/// Sink capabilities message content.
///
/// All sinks offer at least one PDO at vSafe5V, in the first position.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SinkCapabilities(pub Vec<SinkPowerDataObject, 7>);

impl SinkCapabilities {
    /// Create new sink capabilities with a single vSafe5V PDO.
    pub fn new_vsafe5v_only(operational_current_10ma: u16) -> Self {
        let mut pdos = Vec::new();
        pdos.push(SinkPowerDataObject::FixedSupply(SinkFixedSupply::new_vsafe5v(
            operational_current_10ma,
        )))
        .ok();
        Self(pdos)
    }

    /// Parse capabilities from little-endian objects.
    pub fn from_bytes(payload: &[u8], num_objects: usize) -> Self {
        Self(
            payload
                .chunks_exact(4)
                .take(num_objects)
                .map(|buf| SinkPowerDataObject::from_raw(LittleEndian::read_u32(buf)))
                .collect(),
        )
    }

    /// Get the PDOs.
    pub fn pdos(&self) -> &[SinkPowerDataObject] {
        &self.0
    }

    /// The vSafe5V object in the first position.
    pub fn vsafe_5v(&self) -> Option<&SinkFixedSupply> {
        match self.0.first() {
            Some(SinkPowerDataObject::FixedSupply(supply)) => Some(supply),
            _ => None,
        }
    }

    /// Whether the first object announces dual-role power.
    pub fn dual_role_power(&self) -> bool {
        self.vsafe_5v().map(SinkFixedSupply::dual_role_power).unwrap_or_default()
    }

    /// Whether the first object announces an external power supply.
    pub fn unconstrained_power(&self) -> bool {
        self.vsafe_5v()
            .map(SinkFixedSupply::unconstrained_power)
            .unwrap_or_default()
    }

    /// The highest voltage over all objects.
    pub fn max_voltage(&self) -> Option<ElectricPotential> {
        self.0
            .iter()
            .filter_map(SinkPowerDataObject::max_voltage)
            .fold(None, |max, voltage| match max {
                Some(max) if max >= voltage => Some(max),
                _ => Some(voltage),
            })
    }

    /// Get the number of PDOs.
    pub fn num_objects(&self) -> u8 {
        self.0.len() as u8
    }

    /// Convert to bytes for transmission.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        let mut offset = 0;
        for pdo in &self.0 {
            LittleEndian::write_u32(&mut buffer[offset..offset + 4], pdo.to_raw());
            offset += 4;
        }
        offset
    }
}
