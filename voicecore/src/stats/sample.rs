use crate::mos;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw statistics as reported by the peer connection. Counters are
/// cumulative since the start of the call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtcStats {
    pub timestamp: Option<DateTime<Utc>>,
    pub codec: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    /// Milliseconds.
    pub jitter: Option<f64>,
    /// Milliseconds.
    pub rtt: Option<f64>,
    /// `0..=32767`.
    pub audio_input_level: Option<f64>,
    pub audio_output_level: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleTotals {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    /// Loss over the whole call, in percent.
    pub packets_lost_fraction: u64,
}

/// One second of call quality.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtcSample {
    pub timestamp: DateTime<Utc>,
    pub codec: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    /// Loss over this interval, in percent.
    pub packets_lost_fraction: f64,
    pub jitter: Option<f64>,
    pub rtt: Option<f64>,
    pub mos: Option<f64>,
    pub audio_input_level: Option<f64>,
    pub audio_output_level: Option<f64>,
    pub totals: SampleTotals,
}

fn loss_percent(lost: u64, received: u64) -> f64 {
    let expected = lost + received;
    if expected == 0 {
        0.0
    } else {
        lost as f64 / expected as f64 * 100.0
    }
}

impl RtcSample {
    /// Converts a cumulative snapshot into a per-interval sample.
    /// Counters that went backwards are treated as a reset.
    pub fn from_stats(current: &RtcStats, previous: Option<&RtcStats>) -> Self {
        let zero = RtcStats::default();
        let prev = previous.unwrap_or(&zero);
        let delta = |now: u64, before: u64| now.saturating_sub(before);

        let packets_received = delta(current.packets_received, prev.packets_received);
        let packets_lost = delta(current.packets_lost, prev.packets_lost);
        let packets_lost_fraction = loss_percent(packets_lost, packets_received);

        Self {
            timestamp: current.timestamp.unwrap_or_else(Utc::now),
            codec: current.codec.clone(),
            bytes_sent: delta(current.bytes_sent, prev.bytes_sent),
            bytes_received: delta(current.bytes_received, prev.bytes_received),
            packets_sent: delta(current.packets_sent, prev.packets_sent),
            packets_received,
            packets_lost,
            packets_lost_fraction,
            jitter: current.jitter,
            rtt: current.rtt,
            mos: mos::calculate(current.rtt, current.jitter, packets_lost_fraction),
            audio_input_level: current.audio_input_level,
            audio_output_level: current.audio_output_level,
            totals: SampleTotals {
                bytes_sent: current.bytes_sent,
                bytes_received: current.bytes_received,
                packets_sent: current.packets_sent,
                packets_received: current.packets_received,
                packets_lost: current.packets_lost,
                packets_lost_fraction: loss_percent(current.packets_lost, current.packets_received)
                    .round() as u64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_and_loss_fraction() {
        let first = RtcStats {
            bytes_received: 1_000,
            packets_received: 50,
            packets_lost: 0,
            jitter: Some(5.0),
            rtt: Some(40.0),
            ..RtcStats::default()
        };
        let second = RtcStats {
            bytes_received: 1_800,
            packets_received: 95,
            packets_lost: 5,
            jitter: Some(6.0),
            rtt: Some(42.0),
            ..RtcStats::default()
        };

        let sample = RtcSample::from_stats(&second, Some(&first));
        assert_eq!(sample.bytes_received, 800);
        assert_eq!(sample.packets_received, 45);
        assert_eq!(sample.packets_lost, 5);
        assert!((sample.packets_lost_fraction - 10.0).abs() < 1e-9);
        assert_eq!(sample.totals.packets_lost_fraction, 5);
        assert!(sample.mos.is_some());
    }

    #[test]
    fn first_sample_is_measured_from_zero() {
        let stats = RtcStats {
            bytes_sent: 320,
            ..RtcStats::default()
        };
        let sample = RtcSample::from_stats(&stats, None);
        assert_eq!(sample.bytes_sent, 320);
        assert_eq!(sample.packets_lost_fraction, 0.0);
        assert_eq!(sample.mos, None);
    }
}
