use std::time::Duration;

use thiserror::Error;

/// Failure to read one instance's utilization.
///
/// Every variant is treated the same by the autoscaler: the sample is
/// missing and the instance is left out of the average.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("metric fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("metric transport error: {0}")]
    Transport(String),

    #[error("metric parse error: {0}")]
    Parse(String),
}
