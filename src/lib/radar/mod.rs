use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub mod legend;
pub mod spoke;
pub mod sweep;


// A "native to radar" bearing, usually [0..2048] or [0..4096] or [0..8192]
pub type SpokeBearing = u32;

pub const BYTE_LOOKUP_LENGTH: usize = (u8::MAX as usize) + 1;

// Used until the capability manifest says otherwise
pub const DEFAULT_SPOKES_PER_REVOLUTION: usize = 2048;
pub const DEFAULT_MAX_SPOKE_LEN: usize = 512;

// Anything larger is not a radar we can draw
pub const MAX_SPOKES_PER_REVOLUTION: usize = 65536;
pub const MAX_SPOKE_LEN: usize = 65536;
pub const MAX_SWEEP_BYTES: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum RadarError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Cannot decode spoke message: {0}")]
    Decode(#[from] protobuf::Error),
    #[error("Timeout")]
    Timeout,
    #[error("Shutdown")]
    Shutdown,
    #[error("No such radar with key '{0}'")]
    NoSuchRadar(String),
    #[error("Cannot parse JSON '{0}'")]
    ParseJson(String),
    #[error("Server replied with HTTP status {0}")]
    HttpStatus(u16),
    #[error("Not connected")]
    NotConnected,
}

/// Power state of a radar as reported by the control plane.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase", from = "String")]
#[strum(serialize_all = "lowercase")]
pub enum RadarStatus {
    Off,
    Standby,
    Transmit,
    #[default]
    Unknown,
}

impl From<&str> for RadarStatus {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "0" | "off" => RadarStatus::Off,
            "1" | "standby" => RadarStatus::Standby,
            "2" | "transmit" => RadarStatus::Transmit,
            _ => RadarStatus::Unknown,
        }
    }
}

impl From<String> for RadarStatus {
    fn from(s: String) -> Self {
        RadarStatus::from(s.as_str())
    }
}

impl RadarStatus {
    pub(crate) fn from_value(s: &Value) -> Self {
        match s {
            Value::Number(n) => match n.as_i64() {
                Some(0) => RadarStatus::Off,
                Some(1) => RadarStatus::Standby,
                Some(2) => RadarStatus::Transmit,
                _ => RadarStatus::Unknown,
            },
            Value::String(s) => RadarStatus::from(s.as_str()),
            _ => RadarStatus::Unknown,
        }
    }
}

/// The two numbers from a capability manifest that size the sweep buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Characteristics {
    pub spokes_per_revolution: usize,
    pub max_spoke_length: usize,
}

impl Default for Characteristics {
    fn default() -> Self {
        Characteristics {
            spokes_per_revolution: DEFAULT_SPOKES_PER_REVOLUTION,
            max_spoke_length: DEFAULT_MAX_SPOKE_LEN,
        }
    }
}

impl Characteristics {
    pub fn new(spokes_per_revolution: usize, max_spoke_length: usize) -> Self {
        Characteristics {
            spokes_per_revolution,
            max_spoke_length,
        }
    }

    /// Replace zero (unknown) values by the current ones.
    pub fn or(self, current: Characteristics) -> Characteristics {
        Characteristics {
            spokes_per_revolution: if self.spokes_per_revolution > 0 {
                self.spokes_per_revolution
            } else {
                current.spokes_per_revolution
            },
            max_spoke_length: if self.max_spoke_length > 0 {
                self.max_spoke_length
            } else {
                current.max_spoke_length
            },
        }
    }

    /// Whether a sweep of this size can be allocated.
    pub fn is_valid(&self) -> bool {
        (1..=MAX_SPOKES_PER_REVOLUTION).contains(&self.spokes_per_revolution)
            && (1..=MAX_SPOKE_LEN).contains(&self.max_spoke_length)
            && self
                .spokes_per_revolution
                .checked_mul(self.max_spoke_length)
                .is_some_and(|n| n <= MAX_SWEEP_BYTES)
    }

    ///
    /// Fill in unknown values from `current` and refuse sizes that cannot
    /// be allocated; those keep `current`, or the defaults if `current` is
    /// no good either.
    ///
    pub fn sanitized(self, current: Characteristics) -> Characteristics {
        let wanted = self.or(current);
        if wanted.is_valid() {
            return wanted;
        }
        let fallback = if current.is_valid() {
            current
        } else {
            Characteristics::default()
        };
        log::warn!(
            "Ignoring impossible sweep of {} spokes x {} pixels, keeping {}",
            self.spokes_per_revolution,
            self.max_spoke_length,
            fallback
        );
        fallback
    }
}

impl fmt::Display for Characteristics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} spokes x {} pixels",
            self.spokes_per_revolution, self.max_spoke_length
        )
    }
}

/// A target as tracked by the server; this side only displays them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArpaTarget {
    pub target_id: i32,
    pub bearing: f64,  // degrees
    pub distance: f64, // meters
    pub speed: f64,    // knots
    pub course: f64,   // degrees
    pub cpa: f64,      // closest point of approach in meters
    pub tcpa: f64,     // time to CPA in minutes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing() {
        assert_eq!(RadarStatus::from("Transmit"), RadarStatus::Transmit);
        assert_eq!(RadarStatus::from("standby"), RadarStatus::Standby);
        assert_eq!(RadarStatus::from("warming"), RadarStatus::Unknown);
        assert_eq!(
            RadarStatus::from_value(&serde_json::json!(0)),
            RadarStatus::Off
        );
        assert_eq!(
            RadarStatus::from_value(&serde_json::json!(true)),
            RadarStatus::Unknown
        );
        assert_eq!(RadarStatus::Transmit.to_string(), "transmit");

        let status: RadarStatus = serde_json::from_str("\"off\"").unwrap();
        assert_eq!(status, RadarStatus::Off);
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"off\"");
    }

    #[test]
    fn characteristics_keep_known_values() {
        let current = Characteristics::new(4096, 1024);
        assert_eq!(
            Characteristics::new(0, 512).or(current),
            Characteristics::new(4096, 512)
        );
        assert_eq!(Characteristics::new(0, 0).or(current), current);
    }

    #[test]
    fn impossible_sizes_are_refused() {
        let current = Characteristics::new(4096, 1024);

        let huge: Characteristics = serde_json::from_str(
            r#"{"spokesPerRevolution":18446744073709551615,"maxSpokeLength":2}"#,
        )
        .unwrap();
        assert!(!huge.is_valid());
        assert_eq!(huge.sanitized(current), current);
        assert_eq!(
            huge.sanitized(Characteristics::new(usize::MAX, 1)),
            Characteristics::default()
        );

        // Each value fits, the grid does not
        let big = Characteristics::new(65536, 65536);
        assert!(!big.is_valid());
        assert_eq!(big.sanitized(current), current);

        assert_eq!(
            Characteristics::new(8192, 1024).sanitized(current),
            Characteristics::new(8192, 1024)
        );
        assert_eq!(
            Characteristics::new(0, 2048).sanitized(current),
            Characteristics::new(4096, 2048)
        );
    }
}
