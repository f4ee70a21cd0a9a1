use super::sample::{RtcSample, RtcStats};
use super::thresholds::{AverageRule, CountRule, DeviationRule, QualityThresholds};
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningName {
    HighJitter,
    HighRtt,
    LowMos,
    HighPacketsLostFraction,
    ConstantAudioInputLevel,
    ConstantAudioOutputLevel,
    LowBytesReceived,
    LowBytesSent,
}

impl WarningName {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningName::HighJitter => "high-jitter",
            WarningName::HighRtt => "high-rtt",
            WarningName::LowMos => "low-mos",
            WarningName::HighPacketsLostFraction => "high-packets-lost-fraction",
            WarningName::ConstantAudioInputLevel => "constant-audio-input-level",
            WarningName::ConstantAudioOutputLevel => "constant-audio-output-level",
            WarningName::LowBytesReceived => "low-bytes-received",
            WarningName::LowBytesSent => "low-bytes-sent",
        }
    }
}

impl fmt::Display for WarningName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdDescriptor {
    /// `max`, `min`, `maxAverage` or `minStandardDeviation`.
    pub name: &'static str,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub name: WarningName,
    pub threshold: ThresholdDescriptor,
    /// The values the rule looked at when it fired.
    pub values: Vec<f64>,
    pub samples: Vec<RtcSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "warning", rename_all = "lowercase")]
pub enum WarningEvent {
    Raised(Warning),
    Cleared(Warning),
}

impl WarningEvent {
    pub fn warning(&self) -> &Warning {
        match self {
            WarningEvent::Raised(w) | WarningEvent::Cleared(w) => w,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleOutcome {
    pub sample: RtcSample,
    pub events: Vec<WarningEvent>,
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Above,
    Below,
}

impl Bound {
    fn violated(self, value: f64, limit: f64) -> bool {
        match self {
            Bound::Above => value > limit,
            Bound::Below => value < limit,
        }
    }

    fn descriptor(self, limit: f64) -> ThresholdDescriptor {
        let name = match self {
            Bound::Above => "max",
            Bound::Below => "min",
        };
        ThresholdDescriptor { name, value: limit }
    }
}

enum Verdict {
    Raise,
    Clear,
    Hold,
}

struct Evaluation {
    name: WarningName,
    threshold: ThresholdDescriptor,
    verdict: Verdict,
    values: Vec<f64>,
    samples: Vec<RtcSample>,
}

/// Grades call quality from per-second statistics.
///
/// Each pushed snapshot becomes an [`RtcSample`] appended to the call's
/// history. Every rule is re-evaluated against a sliding window, and a
/// warning is raised once and cleared once.
#[derive(Debug)]
pub struct QualityMonitor {
    thresholds: QualityThresholds,
    previous: Option<RtcStats>,
    window: VecDeque<RtcSample>,
    window_len: usize,
    history: Vec<RtcSample>,
    active: BTreeMap<WarningName, Warning>,
    log: Vec<WarningEvent>,
}

impl QualityMonitor {
    pub fn new(thresholds: QualityThresholds) -> Self {
        let window_len = thresholds.window_len();
        Self {
            thresholds,
            previous: None,
            window: VecDeque::with_capacity(window_len),
            window_len,
            history: Vec::new(),
            active: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    pub fn history(&self) -> &[RtcSample] {
        &self.history
    }

    pub fn warning_log(&self) -> &[WarningEvent] {
        &self.log
    }

    pub fn is_raised(&self, name: WarningName) -> bool {
        self.active.contains_key(&name)
    }

    pub fn active_warnings(&self) -> impl Iterator<Item = &Warning> {
        self.active.values()
    }

    pub fn push(&mut self, stats: RtcStats) -> SampleOutcome {
        let sample = RtcSample::from_stats(&stats, self.previous.as_ref());
        self.previous = Some(stats);

        self.history.push(sample.clone());
        if self.window.len() == self.window_len {
            self.window.pop_front();
        }
        self.window.push_back(sample.clone());

        let events = self.evaluate();
        SampleOutcome { sample, events }
    }

    fn evaluate(&mut self) -> Vec<WarningEvent> {
        let t = self.thresholds.clone();
        let evaluations = [
            self.count(WarningName::HighJitter, &t.jitter, Bound::Above, |s| s.jitter),
            self.count(WarningName::HighRtt, &t.rtt, Bound::Above, |s| s.rtt),
            self.count(WarningName::LowMos, &t.mos, Bound::Below, |s| s.mos),
            self.average(&t.packets_lost_fraction),
            self.deviation(WarningName::ConstantAudioInputLevel, &t.audio_input_level, |s| {
                s.audio_input_level
            }),
            self.deviation(WarningName::ConstantAudioOutputLevel, &t.audio_output_level, |s| {
                s.audio_output_level
            }),
            self.count(WarningName::LowBytesReceived, &t.bytes_received, Bound::Below, |s| {
                Some(s.bytes_received as f64)
            }),
            self.count(WarningName::LowBytesSent, &t.bytes_sent, Bound::Below, |s| {
                Some(s.bytes_sent as f64)
            }),
        ];

        let mut events = Vec::new();
        for eval in evaluations.into_iter().flatten() {
            let raised = self.active.contains_key(&eval.name);
            let warning = Warning {
                name: eval.name,
                threshold: eval.threshold,
                values: eval.values,
                samples: eval.samples,
            };
            match eval.verdict {
                Verdict::Raise if !raised => {
                    debug!(target: "Quality", "Warning raised: {} {:?}", warning.name, warning.values);
                    self.active.insert(warning.name, warning.clone());
                    events.push(WarningEvent::Raised(warning));
                }
                Verdict::Clear if raised => {
                    debug!(target: "Quality", "Warning cleared: {}", warning.name);
                    self.active.remove(&warning.name);
                    events.push(WarningEvent::Cleared(warning));
                }
                _ => {}
            }
        }
        self.log.extend(events.iter().cloned());
        events
    }

    fn recent(&self, count: usize) -> Option<Vec<RtcSample>> {
        if count == 0 || self.window.len() < count {
            return None;
        }
        Some(self.window.iter().skip(self.window.len() - count).cloned().collect())
    }

    fn count(
        &self,
        name: WarningName,
        rule: &CountRule,
        bound: Bound,
        value: impl Fn(&RtcSample) -> Option<f64>,
    ) -> Option<Evaluation> {
        let samples = self.recent(rule.sample_count)?;
        let values: Vec<f64> = samples.iter().filter_map(&value).collect();
        let violations = values
            .iter()
            .filter(|v| bound.violated(**v, rule.limit))
            .count();
        let verdict = if violations >= rule.raise_count {
            Verdict::Raise
        } else if violations <= rule.clear_count {
            Verdict::Clear
        } else {
            Verdict::Hold
        };
        Some(Evaluation {
            name,
            threshold: bound.descriptor(rule.limit),
            verdict,
            values,
            samples,
        })
    }

    fn average(&self, rule: &AverageRule) -> Option<Evaluation> {
        let samples = self.recent(rule.sample_count)?;
        let values: Vec<f64> = samples.iter().map(|s| s.packets_lost_fraction).collect();
        let average = values.iter().sum::<f64>() / values.len() as f64;
        let verdict = if average > rule.max_average {
            Verdict::Raise
        } else if average <= rule.clear_value {
            Verdict::Clear
        } else {
            Verdict::Hold
        };
        Some(Evaluation {
            name: WarningName::HighPacketsLostFraction,
            threshold: ThresholdDescriptor {
                name: "maxAverage",
                value: rule.max_average,
            },
            verdict,
            values,
            samples,
        })
    }

    fn deviation(
        &self,
        name: WarningName,
        rule: &DeviationRule,
        value: impl Fn(&RtcSample) -> Option<f64>,
    ) -> Option<Evaluation> {
        if self.history.len() < rule.skip_samples + rule.sample_count {
            return None;
        }
        let samples = self.recent(rule.sample_count)?;
        let values: Vec<f64> = samples.iter().filter_map(&value).collect();
        let verdict = if values.len() < rule.sample_count {
            // A level that stopped being reported is not a constant one.
            if !self.active.contains_key(&name) {
                return None;
            }
            Verdict::Clear
        } else if standard_deviation(&values) < rule.min_standard_deviation {
            Verdict::Raise
        } else {
            Verdict::Clear
        };
        Some(Evaluation {
            name,
            threshold: ThresholdDescriptor {
                name: "minStandardDeviation",
                value: rule.min_standard_deviation,
            },
            verdict,
            values,
            samples,
        })
    }
}

fn standard_deviation(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}
