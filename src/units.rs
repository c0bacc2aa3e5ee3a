//! Speed and distance units.
//!
//! Engine internals always work in bytes per second and the directory API
//! reports distances in miles; everything the caller sees is converted
//! through this module.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Kilometres in one statute mile.
const KILOMETRES_PER_MILE: f64 = 1.609344;

/// A throughput unit: bytes or bits per second with a decimal prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeedUnit {
    /// `Bps`
    BytesPerSec,
    /// `KBps`
    KiloBytesPerSec,
    /// `MBps`
    MegaBytesPerSec,
    /// `GBps`
    GigaBytesPerSec,
    /// `bps`
    BitsPerSec,
    /// `Kbps`
    KiloBitsPerSec,
    /// `Mbps`
    MegaBitsPerSec,
    /// `Gbps`
    GigaBitsPerSec,
}

impl SpeedUnit {
    pub const ALL: [SpeedUnit; 8] = [
        SpeedUnit::BytesPerSec,
        SpeedUnit::KiloBytesPerSec,
        SpeedUnit::MegaBytesPerSec,
        SpeedUnit::GigaBytesPerSec,
        SpeedUnit::BitsPerSec,
        SpeedUnit::KiloBitsPerSec,
        SpeedUnit::MegaBitsPerSec,
        SpeedUnit::GigaBitsPerSec,
    ];

    /// The unit tag, e.g. `"Mbps"`.
    pub fn tag(&self) -> &'static str {
        match self {
            SpeedUnit::BytesPerSec => "Bps",
            SpeedUnit::KiloBytesPerSec => "KBps",
            SpeedUnit::MegaBytesPerSec => "MBps",
            SpeedUnit::GigaBytesPerSec => "GBps",
            SpeedUnit::BitsPerSec => "bps",
            SpeedUnit::KiloBitsPerSec => "Kbps",
            SpeedUnit::MegaBitsPerSec => "Mbps",
            SpeedUnit::GigaBitsPerSec => "Gbps",
        }
    }

    /// How many bits per second one of this unit represents.
    fn bits_per_second(&self) -> f64 {
        match self {
            SpeedUnit::BytesPerSec => 8.0,
            SpeedUnit::KiloBytesPerSec => 8.0e3,
            SpeedUnit::MegaBytesPerSec => 8.0e6,
            SpeedUnit::GigaBytesPerSec => 8.0e9,
            SpeedUnit::BitsPerSec => 1.0,
            SpeedUnit::KiloBitsPerSec => 1.0e3,
            SpeedUnit::MegaBitsPerSec => 1.0e6,
            SpeedUnit::GigaBitsPerSec => 1.0e9,
        }
    }
}

/// A distance unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DistanceUnit {
    /// The directory API reports miles.
    #[default]
    Miles,
    Kilometres,
}

impl DistanceUnit {
    pub fn tag(&self) -> &'static str {
        match self {
            DistanceUnit::Miles => "mi",
            DistanceUnit::Kilometres => "km",
        }
    }

    fn kilometres(&self) -> f64 {
        match self {
            DistanceUnit::Miles => KILOMETRES_PER_MILE,
            DistanceUnit::Kilometres => 1.0,
        }
    }
}

/// Convert a speed value between units.
pub fn convert_speed(value: f64, from: SpeedUnit, to: SpeedUnit) -> f64 {
    if from == to {
        return value;
    }

    value * from.bits_per_second() / to.bits_per_second()
}

/// Convert a distance value between units.
pub fn convert_distance(
    value: f64,
    from: DistanceUnit,
    to: DistanceUnit,
) -> f64 {
    if from == to {
        return value;
    }

    value * from.kilometres() / to.kilometres()
}

/// Error returned when a unit tag is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownUnit(pub String);

impl fmt::Display for UnknownUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown unit '{}'", self.0)
    }
}

impl std::error::Error for UnknownUnit {}

impl FromStr for SpeedUnit {
    type Err = UnknownUnit;

    // Tags are case-sensitive: "MBps" and "Mbps" differ by a factor of 8.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpeedUnit::ALL
            .into_iter()
            .find(|unit| unit.tag() == s)
            .ok_or_else(|| UnknownUnit(s.to_string()))
    }
}

impl FromStr for DistanceUnit {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mi" => Ok(DistanceUnit::Miles),
            "km" => Ok(DistanceUnit::Kilometres),
            _ => Err(UnknownUnit(s.to_string())),
        }
    }
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl fmt::Display for DistanceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Serialize for SpeedUnit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl Serialize for DistanceUnit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_megabits_to_kilobits() {
        let kbps = convert_speed(
            10.0,
            SpeedUnit::MegaBitsPerSec,
            SpeedUnit::KiloBitsPerSec,
        );
        assert!((kbps - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_megabytes_to_kilobits() {
        let kbps = convert_speed(
            1.0,
            SpeedUnit::MegaBytesPerSec,
            SpeedUnit::KiloBitsPerSec,
        );
        assert!((kbps - 8_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_bytes_to_megabits() {
        let mbps = convert_speed(
            12_500_000.0,
            SpeedUnit::BytesPerSec,
            SpeedUnit::MegaBitsPerSec,
        );
        assert!((mbps - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_miles_to_kilometres() {
        let km = convert_distance(
            10.0,
            DistanceUnit::Miles,
            DistanceUnit::Kilometres,
        );
        assert!((km - 16.09344).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tags_case_sensitive() {
        assert_eq!("Mbps".parse::<SpeedUnit>(), Ok(SpeedUnit::MegaBitsPerSec));
        assert_eq!("MBps".parse::<SpeedUnit>(), Ok(SpeedUnit::MegaBytesPerSec));
        assert!("mbps".parse::<SpeedUnit>().is_err());
        assert_eq!("km".parse::<DistanceUnit>(), Ok(DistanceUnit::Kilometres));
        assert!("ft".parse::<DistanceUnit>().is_err());
    }

    #[test]
    fn test_tag_round_trips_through_parse() {
        for unit in SpeedUnit::ALL {
            assert_eq!(unit.tag().parse::<SpeedUnit>(), Ok(unit));
        }
    }

    proptest! {
        #[test]
        fn prop_speed_conversion_is_reversible(
            value in 0.0f64..1e12,
            from in 0usize..8,
            to in 0usize..8,
        ) {
            let (from, to) = (SpeedUnit::ALL[from], SpeedUnit::ALL[to]);
            let back = convert_speed(convert_speed(value, from, to), to, from);
            prop_assert!((back - value).abs() <= value * 1e-9 + 1e-9);
        }
    }
}
