//! HORNET: Detection Thresholds
//!
//! Shared mutable threshold store. Read by the dispatcher and coordinator
//! on every decision, written by the config API and the tuner job. All
//! values are bounded to [0,1].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use hornet_types::{HornetConfig, HornetError};

/// Snapshot of the current thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdValues {
    /// Dismiss gate after detection
    pub dismiss: f64,
    /// Gate after analysis
    pub investigate: f64,
    /// Confidence treated as confirmed
    pub confirm: f64,
    /// Dispatcher promotion gate
    pub detection: f64,
}

/// Partial update from the config API.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ThresholdUpdate {
    #[serde(rename = "DISMISS")]
    pub dismiss: Option<f64>,
    #[serde(rename = "INVESTIGATE")]
    pub investigate: Option<f64>,
    #[serde(rename = "CONFIRM")]
    pub confirm: Option<f64>,
    #[serde(rename = "DETECTION")]
    pub detection: Option<f64>,
}

/// Threshold store.
pub struct Thresholds {
    inner: RwLock<ThresholdValues>,
}

impl Thresholds {
    pub fn from_config(config: &HornetConfig) -> Self {
        Self {
            inner: RwLock::new(ThresholdValues {
                dismiss: config.threshold_dismiss,
                investigate: config.threshold_investigate,
                confirm: config.threshold_confirm,
                detection: config.detection_threshold,
            }),
        }
    }

    pub fn get(&self) -> ThresholdValues {
        *self.inner.read()
    }

    /// Apply a bounded update; values outside [0,1] are rejected.
    pub fn update(&self, update: ThresholdUpdate) -> Result<ThresholdValues, HornetError> {
        for value in [update.dismiss, update.investigate, update.confirm, update.detection]
            .into_iter()
            .flatten()
        {
            if !(0.0..=1.0).contains(&value) {
                return Err(HornetError::Validation(format!(
                    "threshold {value} outside [0,1]"
                )));
            }
        }
        let mut inner = self.inner.write();
        if let Some(v) = update.dismiss {
            inner.dismiss = v;
        }
        if let Some(v) = update.investigate {
            inner.investigate = v;
        }
        if let Some(v) = update.confirm {
            inner.confirm = v;
        }
        if let Some(v) = update.detection {
            inner.detection = v;
        }
        Ok(*inner)
    }

    /// Shift the dismiss gate by `delta`, clamped to [0,1]. Used by the
    /// tuner job.
    pub fn adjust_dismiss(&self, delta: f64) -> f64 {
        let mut inner = self.inner.write();
        inner.dismiss = (inner.dismiss + delta).clamp(0.0, 1.0);
        inner.dismiss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_is_bounded() {
        let thresholds = Thresholds::from_config(&HornetConfig::default());
        let result = thresholds.update(ThresholdUpdate {
            dismiss: Some(1.5),
            ..Default::default()
        });
        assert!(result.is_err());
        assert_eq!(thresholds.get().dismiss, 0.30);
    }

    #[test]
    fn test_partial_update() {
        let thresholds = Thresholds::from_config(&HornetConfig::default());
        let values = thresholds
            .update(ThresholdUpdate {
                investigate: Some(0.7),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(values.investigate, 0.7);
        assert_eq!(values.dismiss, 0.30);
    }

    #[test]
    fn test_adjust_dismiss_clamps() {
        let thresholds = Thresholds::from_config(&HornetConfig::default());
        assert_eq!(thresholds.adjust_dismiss(0.05), 0.35);
        assert_eq!(thresholds.adjust_dismiss(10.0), 1.0);
        assert_eq!(thresholds.adjust_dismiss(-10.0), 0.0);
    }
}
