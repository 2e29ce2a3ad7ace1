//! Small shared helpers.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Generates a new random run identifier.
#[must_use]
pub fn generate_run_id() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

/// Serializes a [`Duration`] as fractional seconds.
pub mod duration_secs {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    /// Serializes `duration` as seconds.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    /// Deserializes seconds into a duration. Negative or invalid values become zero.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::try_from_secs_f64(secs).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timed {
        #[serde(with = "duration_secs")]
        time: Duration,
    }

    #[test]
    fn test_duration_as_seconds() {
        let json = serde_json::to_value(Timed {
            time: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"time": 1.5}));

        let back: Timed = serde_json::from_value(serde_json::json!({"time": -3.0})).unwrap();
        assert_eq!(back.time, Duration::ZERO);
    }

    #[test]
    fn test_run_id_is_v4() {
        assert_eq!(generate_run_id().get_version_num(), 4);
    }
}
