use crate::error::VoiceError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use voicecore::backoff::BackoffConfig;
use voicecore::edge::{self, EdgeConfig};
use voicecore::recovery::MediaRecoveryConfig;
use voicecore::stats::QualityThresholds;

/// Device settings. Every field has a default, so a JSON file only needs
/// the values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// A single edge or an ordered fallback list. Exclusive with `region`.
    pub edge: Option<EdgeConfig>,
    /// Legacy region code. Exclusive with `edge`.
    pub region: Option<String>,
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Wrap to the first endpoint after the last one fails.
    pub repeat_uris: bool,
    pub connect_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub registration_refresh_secs: u64,
    pub allow_incoming_while_busy: bool,
    pub media_disconnect_grace_ms: u64,
    pub ice_restart_budget_ms: u64,
    pub ice_restart_retry_ms: u64,
    pub sample_interval_ms: u64,
    pub thresholds: QualityThresholds,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            edge: None,
            region: None,
            backoff_max_ms: 20_000,
            max_reconnect_attempts: 12,
            repeat_uris: false,
            connect_timeout_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            registration_refresh_secs: 30,
            allow_incoming_while_busy: false,
            media_disconnect_grace_ms: 3_000,
            ice_restart_budget_ms: 30_000,
            ice_restart_retry_ms: 5_000,
            sample_interval_ms: 1_000,
            thresholds: QualityThresholds::default(),
        }
    }
}

impl DeviceOptions {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, VoiceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VoiceError::Options(format!("{}: {e}", path.display())))?;
        let options: Self = serde_json::from_str(&text)
            .map_err(|e| VoiceError::Options(format!("{}: {e}", path.display())))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), VoiceError> {
        self.signaling_uris()?;
        let positive = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("registration_refresh_secs", self.registration_refresh_secs),
            ("ice_restart_budget_ms", self.ice_restart_budget_ms),
            ("ice_restart_retry_ms", self.ice_restart_retry_ms),
            ("sample_interval_ms", self.sample_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(VoiceError::InvalidArgument(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn signaling_uris(&self) -> Result<Vec<String>, VoiceError> {
        Ok(edge::resolve_uris(self.edge.as_ref(), self.region.as_deref())?)
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig::default().with_max_delay(Duration::from_millis(self.backoff_max_ms))
    }

    pub fn media_recovery(&self) -> MediaRecoveryConfig {
        MediaRecoveryConfig {
            disconnect_grace: Duration::from_millis(self.media_disconnect_grace_ms),
            budget: Duration::from_millis(self.ice_restart_budget_ms),
            retry_interval: Duration::from_millis(self.ice_restart_retry_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"edge": ["sydney", "tokyo"], "repeat_uris": true, "thresholds": {{"jitter": {{"limit": 50.0}}}}}}"#
        )
        .unwrap();

        let options = DeviceOptions::from_json_file(file.path()).unwrap();
        assert!(options.repeat_uris);
        assert_eq!(options.heartbeat_timeout_ms, 15_000);
        assert_eq!(options.thresholds.jitter.limit, 50.0);
        assert_eq!(options.thresholds.jitter.sample_count, 5);
        assert_eq!(
            options.signaling_uris().unwrap(),
            vec![
                "wss://chunderw-vpc-gll-au1.twilio.com/signal",
                "wss://chunderw-vpc-gll-jp1.twilio.com/signal",
            ]
        );
    }

    #[test]
    fn edge_with_region_is_rejected() {
        let options = DeviceOptions {
            edge: Some(EdgeConfig::from("ashburn")),
            region: Some("us1".to_string()),
            ..DeviceOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(VoiceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let options = DeviceOptions {
            heartbeat_timeout_ms: 0,
            ..DeviceOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn unreadable_file_is_an_options_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DeviceOptions::from_json_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, VoiceError::Options(_)));
    }
}
