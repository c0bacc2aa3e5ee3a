//! Measurement servers as reported by the speedtest.net directory, and the
//! latency-ranked shortlist built from them.

use crate::stats::round_to;
use crate::units::{convert_distance, DistanceUnit};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// One candidate measurement server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementServer {
    #[serde(deserialize_with = "lenient")]
    pub id: u32,
    /// `hostname:port` of the server's HTTP and WebSocket endpoints.
    pub host: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sponsor: String,
    #[serde(default)]
    pub country: String,
    /// ISO country code.
    #[serde(default, rename = "cc")]
    pub country_code: String,
    #[serde(deserialize_with = "lenient")]
    pub lat: f64,
    #[serde(deserialize_with = "lenient")]
    pub lon: f64,
    #[serde(default, deserialize_with = "lenient")]
    pub distance: f64,
    #[serde(default, skip_deserializing)]
    pub distance_unit: DistanceUnit,
    /// Round-trip latency in milliseconds, populated by ranking.
    #[serde(default, skip_deserializing)]
    pub latency: Option<f64>,
}

impl MeasurementServer {
    /// Convert the distance field to `unit`, rounded to two decimals.
    pub fn with_distance_unit(mut self, unit: DistanceUnit) -> Self {
        if unit != self.distance_unit {
            let converted =
                convert_distance(self.distance, self.distance_unit, unit);
            self.distance = round_to(converted, 2);
            self.distance_unit = unit;
        }
        self
    }

    /// Latency used for ordering; unmeasured servers sort last.
    fn sort_latency(&self) -> f64 {
        self.latency.unwrap_or(f64::INFINITY)
    }
}

/// Shortlist of servers ascending by measured latency.
///
/// Ties keep directory order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RankedServerSet(Vec<MeasurementServer>);

impl RankedServerSet {
    /// Sort `servers` by latency (stable) and keep the first `shortlist_size`.
    pub fn rank(mut servers: Vec<MeasurementServer>, shortlist_size: usize) -> Self {
        servers.sort_by(|a, b| a.sort_latency().total_cmp(&b.sort_latency()));
        servers.truncate(shortlist_size);
        Self(servers)
    }

    /// The lowest-latency server.
    pub fn best(&self) -> Option<&MeasurementServer> {
        self.0.first()
    }

    pub fn as_slice(&self) -> &[MeasurementServer] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<MeasurementServer> {
        self.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(serde_json::Number),
    String(String),
}

/// The directory sends some numbers as strings; accept either.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let text = match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(number) => number.to_string(),
        NumberOrString::String(text) => text,
    };

    text.trim().parse().map_err(D::Error::custom)
}
