//! Metric analyzers — anomaly detection, trend analysis, regression checks.
//!
//! Section 1 treats analyzers as pluggable collaborators ("an analyzer
//! produces a list of findings"); this module defines the contract plus one
//! honestly-simple implementation of each, grounded in
//! `original_source/runners/profilers/performance_profiler.py`'s
//! `BaselineCalculator`/`TrendAnalyzer` shapes rather than a full statistics
//! engine.

#[derive(Debug, Clone)]
pub struct Finding {
    pub kind: FindingKind,
    pub metric_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    Anomaly,
    Trend,
    Regression,
}

/// One metric observation from execution history, the minimal shape every
/// analyzer needs.
#[derive(Debug, Clone)]
pub struct MetricObservation {
    pub value: f64,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

pub trait MetricAnalyzer: Send + Sync {
    fn analyze(&self, metric_name: &str, history: &[MetricObservation]) -> Vec<Finding>;
}

/// Flags observations more than `threshold_stddev` standard deviations from
/// the mean of the preceding window.
pub struct ZScoreAnomalyDetector {
    pub threshold_stddev: f64,
}

impl Default for ZScoreAnomalyDetector {
    fn default() -> Self {
        Self {
            threshold_stddev: 3.0,
        }
    }
}

impl MetricAnalyzer for ZScoreAnomalyDetector {
    fn analyze(&self, metric_name: &str, history: &[MetricObservation]) -> Vec<Finding> {
        if history.len() < 3 {
            return Vec::new();
        }
        let values: Vec<f64> = history.iter().map(|o| o.value).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let stddev = variance.sqrt();
        if stddev == 0.0 {
            return Vec::new();
        }

        history
            .iter()
            .filter_map(|o| {
                let z = (o.value - mean) / stddev;
                if z.abs() > self.threshold_stddev {
                    Some(Finding {
                        kind: FindingKind::Anomaly,
                        metric_name: metric_name.to_string(),
                        message: format!(
                            "{metric_name}={:.3} is {:.1} standard deviations from the mean ({:.3})",
                            o.value, z, mean
                        ),
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Fits a least-squares slope over the window and flags a consistent
/// upward/downward trend beyond `min_slope_fraction` of the mean per sample.
pub struct LinearTrendAnalyzer {
    pub min_slope_fraction: f64,
}

impl Default for LinearTrendAnalyzer {
    fn default() -> Self {
        Self {
            min_slope_fraction: 0.05,
        }
    }
}

impl MetricAnalyzer for LinearTrendAnalyzer {
    fn analyze(&self, metric_name: &str, history: &[MetricObservation]) -> Vec<Finding> {
        if history.len() < 4 {
            return Vec::new();
        }
        let n = history.len() as f64;
        let xs: Vec<f64> = (0..history.len()).map(|i| i as f64).collect();
        let ys: Vec<f64> = history.iter().map(|o| o.value).collect();
        let mean_x = xs.iter().sum::<f64>() / n;
        let mean_y = ys.iter().sum::<f64>() / n;

        let numerator: f64 = xs
            .iter()
            .zip(ys.iter())
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();
        let denominator: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
        if denominator == 0.0 {
            return Vec::new();
        }
        let slope = numerator / denominator;

        if mean_y != 0.0 && (slope / mean_y).abs() > self.min_slope_fraction {
            let direction = if slope > 0.0 { "increasing" } else { "decreasing" };
            vec![Finding {
                kind: FindingKind::Trend,
                metric_name: metric_name.to_string(),
                message: format!(
                    "{metric_name} is {direction} by {:.4} per sample (mean {:.3})",
                    slope, mean_y
                ),
            }]
        } else {
            Vec::new()
        }
    }
}

/// Compares the latest observation against a baseline (mean of all but the
/// latest) and flags a regression beyond `max_increase_fraction`.
pub struct BaselineRegressionDetector {
    pub max_increase_fraction: f64,
}

impl Default for BaselineRegressionDetector {
    fn default() -> Self {
        Self {
            max_increase_fraction: 0.20,
        }
    }
}

impl MetricAnalyzer for BaselineRegressionDetector {
    fn analyze(&self, metric_name: &str, history: &[MetricObservation]) -> Vec<Finding> {
        if history.len() < 2 {
            return Vec::new();
        }
        let (latest, baseline_set) = history.split_last().unwrap();
        let baseline_mean =
            baseline_set.iter().map(|o| o.value).sum::<f64>() / baseline_set.len() as f64;
        if baseline_mean == 0.0 {
            return Vec::new();
        }
        let increase = (latest.value - baseline_mean) / baseline_mean;
        if increase > self.max_increase_fraction {
            vec![Finding {
                kind: FindingKind::Regression,
                metric_name: metric_name.to_string(),
                message: format!(
                    "{metric_name} regressed: latest {:.3} is {:.1}% above baseline {:.3}",
                    latest.value,
                    increase * 100.0,
                    baseline_mean
                ),
            }]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn obs(values: &[f64]) -> Vec<MetricObservation> {
        values
            .iter()
            .map(|v| MetricObservation {
                value: *v,
                observed_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn zscore_flags_outlier() {
        let detector = ZScoreAnomalyDetector::default();
        let history = obs(&[1.0, 1.1, 0.9, 1.0, 1.05, 50.0]);
        let findings = detector.analyze("cpu_max", &history);
        assert!(!findings.is_empty());
    }

    #[test]
    fn trend_flags_consistent_increase() {
        let analyzer = LinearTrendAnalyzer::default();
        let history = obs(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let findings = analyzer.analyze("memory_max_mb", &history);
        assert!(!findings.is_empty());
    }

    #[test]
    fn regression_flags_latest_spike() {
        let detector = BaselineRegressionDetector::default();
        let history = obs(&[10.0, 10.0, 10.0, 20.0]);
        let findings = detector.analyze("execution_time_seconds", &history);
        assert!(!findings.is_empty());
    }

    #[test]
    fn flat_history_produces_no_findings() {
        let history = obs(&[1.0, 1.0, 1.0, 1.0]);
        assert!(ZScoreAnomalyDetector::default().analyze("m", &history).is_empty());
        assert!(LinearTrendAnalyzer::default().analyze("m", &history).is_empty());
        assert!(BaselineRegressionDetector::default().analyze("m", &history).is_empty());
    }
}
