use serde::{Deserialize, Serialize};

/// Raised when at least `raise_count` of the last `sample_count` samples
/// violate the limit, cleared when at most `clear_count` do.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountRule {
    pub limit: f64,
    pub sample_count: usize,
    pub raise_count: usize,
    pub clear_count: usize,
}

impl Default for CountRule {
    fn default() -> Self {
        Self {
            limit: 0.0,
            sample_count: 5,
            raise_count: 3,
            clear_count: 0,
        }
    }
}

impl CountRule {
    fn with_limit(limit: f64) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// Raised when the average of the last `sample_count` values exceeds
/// `max_average`, cleared when it falls to `clear_value` or below.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AverageRule {
    pub max_average: f64,
    pub clear_value: f64,
    pub sample_count: usize,
}

impl Default for AverageRule {
    fn default() -> Self {
        Self {
            max_average: 3.0,
            clear_value: 1.0,
            sample_count: 7,
        }
    }
}

/// Raised when the standard deviation of the last `sample_count` levels is
/// below `min_standard_deviation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviationRule {
    pub min_standard_deviation: f64,
    pub sample_count: usize,
    /// Samples ignored at the start of the call.
    pub skip_samples: usize,
}

impl Default for DeviationRule {
    fn default() -> Self {
        Self {
            min_standard_deviation: 327.67,
            sample_count: 10,
            skip_samples: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Milliseconds; violated above.
    pub jitter: CountRule,
    /// Milliseconds; violated above.
    pub rtt: CountRule,
    /// Violated below.
    pub mos: CountRule,
    pub packets_lost_fraction: AverageRule,
    pub audio_input_level: DeviationRule,
    pub audio_output_level: DeviationRule,
    /// Violated below.
    pub bytes_received: CountRule,
    /// Violated below.
    pub bytes_sent: CountRule,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        let bytes = CountRule {
            limit: 1.0,
            sample_count: 3,
            raise_count: 3,
            clear_count: 1,
        };
        Self {
            jitter: CountRule::with_limit(30.0),
            rtt: CountRule::with_limit(400.0),
            mos: CountRule::with_limit(3.0),
            packets_lost_fraction: AverageRule::default(),
            audio_input_level: DeviationRule::default(),
            audio_output_level: DeviationRule::default(),
            bytes_received: bytes,
            bytes_sent: bytes,
        }
    }
}

impl QualityThresholds {
    /// Samples the monitor has to keep to evaluate every rule.
    pub fn window_len(&self) -> usize {
        [
            self.jitter.sample_count,
            self.rtt.sample_count,
            self.mos.sample_count,
            self.packets_lost_fraction.sample_count,
            self.audio_input_level.sample_count,
            self.audio_output_level.sample_count,
            self.bytes_received.sample_count,
            self.bytes_sent.sample_count,
        ]
        .into_iter()
        .max()
        .unwrap_or(1)
    }
}
