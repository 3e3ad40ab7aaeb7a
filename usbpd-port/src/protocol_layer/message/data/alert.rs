//! Alert data object, see [6.4.6].
use proc_bitfield::bitfield;

bitfield! {
    /// The alert data object, sent by a port to report a change of its condition.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct AlertDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Over-voltage protection event (source only).
        pub ovp: bool @ 30,
        /// Source input change event.
        pub source_input_change: bool @ 29,
        /// Operating condition change.
        pub operating_condition_change: bool @ 28,
        /// Over-temperature protection event.
        pub otp: bool @ 27,
        /// Over-current protection event (sink only).
        pub ocp: bool @ 26,
        /// Battery status change.
        pub battery_status_change: bool @ 25,
        /// Fixed batteries with a changed status, one bit each.
        pub fixed_batteries: u8 @ 20..=23,
        /// Hot-swappable batteries with a changed status, one bit each.
        pub hot_swappable_batteries: u8 @ 16..=19,
    }
}

impl AlertDataObject {
    /// Whether the alert is relevant to a port in the given power role.
    ///
    /// A source is told about over-voltage, a sink about over-current.
    pub fn is_relevant(&self, is_source: bool) -> bool {
        let protection = if is_source { self.ovp() } else { self.ocp() };

        protection
            || self.battery_status_change()
            || self.otp()
            || self.operating_condition_change()
            || self.source_input_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relevance_depends_on_role() {
        let ocp = AlertDataObject::default().with_ocp(true);
        assert!(ocp.is_relevant(false));
        assert!(!ocp.is_relevant(true));

        let ovp = AlertDataObject::default().with_ovp(true);
        assert!(ovp.is_relevant(true));
        assert!(!ovp.is_relevant(false));

        assert!(AlertDataObject::default().with_otp(true).is_relevant(true));
        assert!(!AlertDataObject::default().with_fixed_batteries(1).is_relevant(false));
    }
}
