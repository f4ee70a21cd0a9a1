//! Per-second call quality sampling and threshold warnings.

pub mod monitor;
pub mod sample;
pub mod thresholds;

pub use monitor::{QualityMonitor, SampleOutcome, ThresholdDescriptor, Warning, WarningEvent, WarningName};
pub use sample::{RtcSample, RtcStats, SampleTotals};
pub use thresholds::{AverageRule, CountRule, DeviationRule, QualityThresholds};
