//! Count-based alert classification.

use serde::Serialize;

use crate::error::BridgeError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    None,
    Low,
    High,
}

impl AlertLevel {
    /// Wire value used by the `alert_triggered` field.
    pub fn as_u8(self) -> u8 {
        match self {
            AlertLevel::None => 0,
            AlertLevel::Low => 1,
            AlertLevel::High => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AlertLevel::None => "none",
            AlertLevel::Low => "low",
            AlertLevel::High => "high",
        }
    }
}

/// Detection-count boundaries: `count < low_min` is `None`,
/// `low_min <= count < high_min` is `Low`, anything above is `High`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlertThresholds {
    low_min: usize,
    high_min: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            low_min: 2,
            high_min: 8,
        }
    }
}

impl AlertThresholds {
    pub fn new(low_min: usize, high_min: usize) -> Result<Self, BridgeError> {
        if low_min > high_min {
            return Err(BridgeError::InvalidConfig(format!(
                "alert low threshold ({low_min}) exceeds high threshold ({high_min})"
            )));
        }
        Ok(Self { low_min, high_min })
    }

    pub fn low_min(&self) -> usize {
        self.low_min
    }

    pub fn high_min(&self) -> usize {
        self.high_min
    }

    pub fn classify(&self, detection_count: usize) -> AlertLevel {
        if detection_count >= self.high_min {
            AlertLevel::High
        } else if detection_count >= self.low_min {
            AlertLevel::Low
        } else {
            AlertLevel::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_boundaries_are_exact() {
        let thresholds = AlertThresholds::default();
        assert_eq!(thresholds.classify(0), AlertLevel::None);
        assert_eq!(thresholds.classify(1), AlertLevel::None);
        assert_eq!(thresholds.classify(2), AlertLevel::Low);
        assert_eq!(thresholds.classify(7), AlertLevel::Low);
        assert_eq!(thresholds.classify(8), AlertLevel::High);
        assert_eq!(thresholds.classify(500), AlertLevel::High);
    }

    #[test]
    fn classification_matches_reference_for_every_small_count() {
        let thresholds = AlertThresholds::default();
        for count in 0..64 {
            let expected = match count {
                c if c < 2 => AlertLevel::None,
                c if c <= 7 => AlertLevel::Low,
                _ => AlertLevel::High,
            };
            assert_eq!(thresholds.classify(count), expected, "count {count}");
        }
    }

    #[test]
    fn custom_thresholds_shift_the_bands() {
        let thresholds = AlertThresholds::new(1, 3).unwrap();
        assert_eq!(thresholds.classify(0), AlertLevel::None);
        assert_eq!(thresholds.classify(1), AlertLevel::Low);
        assert_eq!(thresholds.classify(3), AlertLevel::High);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        assert!(AlertThresholds::new(5, 4).is_err());
    }

    #[test]
    fn levels_are_ordered() {
        assert!(AlertLevel::None < AlertLevel::Low);
        assert!(AlertLevel::Low < AlertLevel::High);
        assert_eq!(AlertLevel::High.as_u8(), 2);
    }
}
