use serde::{Deserialize, Serialize};

use crate::ClientError;

/// A geographic reading: where a peer was, and when.
///
/// Latitude and longitude are degrees, the timestamp is milliseconds since
/// the Unix epoch. Values are immutable once constructed.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionTime {
    latitude: f64,
    longitude: f64,
    time: i64,
}

impl PositionTime {
    /// Creates a new reading.
    ///
    /// # Errors
    /// Returns [`ClientError::Protocol`] when latitude is outside [-90, 90]
    /// or longitude outside [-180, 180].
    pub fn new(latitude: f64, longitude: f64, time: i64) -> Result<Self, ClientError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(ClientError::protocol("latitude must be within [-90, 90]"));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(ClientError::protocol(
                "longitude must be within [-180, 180]",
            ));
        }
        Ok(Self {
            latitude,
            longitude,
            time,
        })
    }

    #[must_use]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    #[must_use]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    #[must_use]
    pub fn time(&self) -> i64 {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_coordinate_ranges() {
        assert!(PositionTime::new(56.0, 11.2, 0).is_ok());
        assert!(PositionTime::new(90.1, 0.0, 0).is_err());
        assert!(PositionTime::new(0.0, -180.5, 0).is_err());
    }
}
