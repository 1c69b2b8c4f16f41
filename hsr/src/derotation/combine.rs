//! NaN-aware combination of a derotated residual stack.

use ndarray::{Array2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{HsrError, Result};

/// Rule for collapsing the time axis of a derotated stack
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationRule {
    #[default]
    Mean,
    Median,
    /// Mean after discarding `floor(fraction * n)` samples at each end
    TrimmedMean { fraction: f64 },
}

impl CombinationRule {
    pub fn validate(&self) -> Result<()> {
        if let CombinationRule::TrimmedMean { fraction } = self {
            if !(0.0..0.5).contains(fraction) {
                return Err(HsrError::InvalidConfig(format!(
                    "trimmed mean fraction must be in [0, 0.5), got {fraction}"
                )));
            }
        }
        Ok(())
    }

    /// Combine the finite entries of `values`; NaN if there are none
    ///
    /// `values` is reordered in place.
    pub fn combine(&self, values: &mut Vec<f64>) -> f64 {
        values.retain(|v| v.is_finite());
        if values.is_empty() {
            return f64::NAN;
        }
        match self {
            CombinationRule::Mean => mean(values),
            CombinationRule::Median => {
                values.sort_by(|a, b| a.total_cmp(b));
                let n = values.len();
                if n % 2 == 1 {
                    values[n / 2]
                } else {
                    0.5 * (values[n / 2 - 1] + values[n / 2])
                }
            }
            CombinationRule::TrimmedMean { fraction } => {
                values.sort_by(|a, b| a.total_cmp(b));
                let n = values.len();
                let cut = (fraction * n as f64).floor() as usize;
                if 2 * cut >= n {
                    // Nothing would remain; fall back to the median sample(s)
                    return CombinationRule::Median.combine(values);
                }
                mean(&values[cut..n - cut])
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Collapse a `(n_frames, height, width)` stack along time
pub fn combine_stack(stack: &ArrayView3<f64>, rule: CombinationRule) -> Array2<f64> {
    let (_, height, width) = stack.dim();
    let mut combined = Array2::<f64>::from_elem((height, width), f64::NAN);
    let mut buffer = Vec::with_capacity(stack.len_of(Axis(0)));
    for ((r, c), value) in combined.indexed_iter_mut() {
        buffer.clear();
        buffer.extend(stack.slice(ndarray::s![.., r, c]).iter().copied());
        *value = rule.combine(&mut buffer);
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    #[test]
    fn test_rules_ignore_nan() {
        let values = vec![1.0, f64::NAN, 3.0, 2.0, 100.0];
        assert_relative_eq!(CombinationRule::Mean.combine(&mut values.clone()), 26.5);
        assert_relative_eq!(CombinationRule::Median.combine(&mut values.clone()), 2.5);
        let trimmed = CombinationRule::TrimmedMean { fraction: 0.25 };
        assert_relative_eq!(trimmed.combine(&mut values.clone()), 2.5);
    }

    #[test]
    fn test_all_nan_is_no_data() {
        for rule in [
            CombinationRule::Mean,
            CombinationRule::Median,
            CombinationRule::TrimmedMean { fraction: 0.1 },
        ] {
            assert!(rule.combine(&mut vec![f64::NAN, f64::NAN]).is_nan());
            assert!(rule.combine(&mut vec![]).is_nan());
        }
    }

    #[test]
    fn test_trimmed_mean_validation() {
        assert!(CombinationRule::TrimmedMean { fraction: 0.5 }.validate().is_err());
        assert!(CombinationRule::TrimmedMean { fraction: -0.1 }.validate().is_err());
        assert!(CombinationRule::TrimmedMean { fraction: 0.2 }.validate().is_ok());
        assert!(CombinationRule::Median.validate().is_ok());
    }

    #[test]
    fn test_combine_stack() {
        let mut stack = Array3::from_shape_fn((3, 2, 2), |(t, r, c)| (t + r + c) as f64);
        stack.slice_mut(ndarray::s![.., 1, 1]).fill(f64::NAN);
        let combined = combine_stack(&stack.view(), CombinationRule::Mean);
        assert_eq!(combined[[0, 0]], 1.0);
        assert_eq!(combined[[1, 0]], 2.0);
        assert!(combined[[1, 1]].is_nan());
    }

    #[test]
    fn test_serde_tags() {
        let json = serde_json::to_string(&CombinationRule::TrimmedMean { fraction: 0.1 }).unwrap();
        assert_eq!(json, r#"{"trimmed_mean":{"fraction":0.1}}"#);
        let rule: CombinationRule = serde_json::from_str(r#""median""#).unwrap();
        assert_eq!(rule, CombinationRule::Median);
    }
}
