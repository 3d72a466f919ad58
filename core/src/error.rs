//! Error types for the tracking filter
//!
//! Every fallible step of the filter reports through [`FilterError`]. A step that fails leaves
//! the prior filter state untouched.

use std::fmt;

use crate::measurements::SensorType;

/// Errors that can occur while configuring or running the filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterError {
    /// The first packet came from a sensor that is disabled, so there is nothing to seed from
    InitializationFailed {
        /// Sensor of the rejected packet
        sensor: SensorType,
    },

    /// Packet carries the wrong number of raw values for its sensor
    MalformedPacket {
        /// Sensor of the rejected packet
        sensor: SensorType,
        /// Number of values the sensor produces
        expected: usize,
        /// Number of values received
        actual: usize,
    },

    /// Packet is older than the last accepted one
    TimestampRegression {
        /// Last accepted timestamp (microseconds)
        previous: u64,
        /// Timestamp of the rejected packet (microseconds)
        current: u64,
    },

    /// Square root of a covariance failed even after regularization
    NotPositiveDefinite {
        /// Which matrix failed
        context: String,
    },

    /// Linear solve against a covariance failed
    SingularMatrix {
        /// Which matrix failed
        context: String,
    },

    /// Configuration error
    InvalidConfiguration {
        /// Description of the configuration issue
        description: String,
    },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::InitializationFailed { sensor } => {
                write!(
                    f,
                    "Initialization failed: {} sensor is disabled and no other sensor data is available",
                    sensor
                )
            }
            FilterError::MalformedPacket {
                sensor,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Malformed {} packet: expected {} values, got {}",
                    sensor, expected, actual
                )
            }
            FilterError::TimestampRegression { previous, current } => {
                write!(
                    f,
                    "Packet timestamp {} us precedes last accepted timestamp {} us",
                    current, previous
                )
            }
            FilterError::NotPositiveDefinite { context } => {
                write!(f, "Matrix is not positive definite: {}", context)
            }
            FilterError::SingularMatrix { context } => {
                write!(f, "Matrix solve failed: {}", context)
            }
            FilterError::InvalidConfiguration { description } => {
                write!(f, "Configuration error: {}", description)
            }
        }
    }
}

impl std::error::Error for FilterError {}
