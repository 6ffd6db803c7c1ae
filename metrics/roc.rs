use super::{MetricsError, scored_pairs};
use ndarray::{ArrayView1, ArrayView2, Axis};

/// One operating point of a ROC curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RocPoint {
    pub threshold: f64,
    pub tpr: f64,
    pub fpr: f64,
}

/// ROC curve of one binary label.
///
/// Thresholds run from `+inf` through the midpoints between consecutive distinct scores
/// down to `-inf`; at each threshold a sample counts as positive iff its score is
/// strictly greater. The first point is therefore `(0, 0)` and the last `(1, 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Roc {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub thresholds: Vec<f64>,
    /// Trapezoidal area under the curve; NaN when only one class is present.
    pub auroc: f64,
}

impl Roc {
    /// Fails on mismatched lengths and on NaN or infinite scores.
    pub fn new(y: ArrayView1<f32>, scores: ArrayView1<f32>) -> Result<Self, MetricsError> {
        Ok(Self::from_pairs(&scored_pairs(y, scores)?))
    }

    pub(crate) fn from_pairs(pairs: &[(bool, f64)]) -> Self {
        let mut sorted = pairs.to_vec();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));

        let positives = sorted.iter().filter(|(l, _)| *l).count() as f64;
        let negatives = sorted.len() as f64 - positives;
        let rate = |count: f64, total: f64| if total > 0.0 { count / total } else { 0.0 };

        let mut fpr = vec![0.0];
        let mut tpr = vec![0.0];
        let mut thresholds = vec![f64::INFINITY];
        let (mut tp, mut fp) = (0.0, 0.0);

        let mut i = 0;
        while i < sorted.len() {
            let score = sorted[i].1;
            // total_cmp so that a stray NaN still forms a group and `i` advances.
            while i < sorted.len() && sorted[i].1.total_cmp(&score).is_eq() {
                if sorted[i].0 {
                    tp += 1.0;
                } else {
                    fp += 1.0;
                }
                i += 1;
            }
            thresholds.push(match sorted.get(i) {
                Some(&(_, next)) => (score + next) / 2.0,
                None => f64::NEG_INFINITY,
            });
            tpr.push(rate(tp, positives));
            fpr.push(rate(fp, negatives));
        }

        let auroc = if positives == 0.0 || negatives == 0.0 {
            f64::NAN
        } else {
            fpr.windows(2)
                .zip(tpr.windows(2))
                .map(|(f, t)| (f[1] - f[0]) * (t[1] + t[0]) / 2.0)
                .sum()
        };

        Self {
            fpr,
            tpr,
            thresholds,
            auroc,
        }
    }

    /// The point maximising Youden's J (`tpr - fpr`); the first one on ties.
    pub fn optimal_point(&self) -> RocPoint {
        let mut best = 0;
        for i in 1..self.thresholds.len() {
            if self.tpr[i] - self.fpr[i] > self.tpr[best] - self.fpr[best] {
                best = i;
            }
        }
        RocPoint {
            threshold: self.thresholds[best],
            tpr: self.tpr[best],
            fpr: self.fpr[best],
        }
    }

    pub fn optimal_threshold(&self) -> f64 {
        self.optimal_point().threshold
    }
}

/// Independent ROC curves, one per label column.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiLabelRoc {
    pub labels: Vec<String>,
    pub rocs: Vec<Roc>,
}

fn check_shapes(y: ArrayView2<f32>, scores: ArrayView2<f32>) -> Result<(), MetricsError> {
    if y.dim() != scores.dim() {
        return Err(MetricsError::ShapeMismatch {
            labels: y.dim(),
            scores: scores.dim(),
        });
    }
    Ok(())
}

impl MultiLabelRoc {
    /// `y` and `scores` are `(patients, labels)`.
    pub fn new(
        y: ArrayView2<f32>,
        scores: ArrayView2<f32>,
        labels: &[String],
    ) -> Result<Self, MetricsError> {
        check_shapes(y, scores)?;
        if labels.len() != y.ncols() {
            return Err(MetricsError::LabelNameMismatch {
                names: labels.len(),
                columns: y.ncols(),
            });
        }
        let rocs = y
            .axis_iter(Axis(1))
            .zip(scores.axis_iter(Axis(1)))
            .map(|(yc, sc)| Roc::new(yc, sc))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            labels: labels.to_vec(),
            rocs,
        })
    }

    pub fn get(&self, label: &str) -> Option<&Roc> {
        let pos = self.labels.iter().position(|l| l == label)?;
        self.rocs.get(pos)
    }
}

/// AUROC of every label column of `(patients, labels)` matrices.
pub fn auroc_score(y: ArrayView2<f32>, scores: ArrayView2<f32>) -> Result<Vec<f64>, MetricsError> {
    check_shapes(y, scores)?;
    y.axis_iter(Axis(1))
        .zip(scores.axis_iter(Axis(1)))
        .map(|(yc, sc)| Roc::new(yc, sc).map(|roc| roc.auroc))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn roc(y: &[f32], s: &[f32]) -> Roc {
        Roc::new(Array1::from(y.to_vec()).view(), Array1::from(s.to_vec()).view()).unwrap()
    }

    /// Pairwise AUROC counting tied pairs as half a win.
    fn mann_whitney(y: &[f32], s: &[f32]) -> f64 {
        let mut pos_wins = 0.0;
        let mut pairs = 0.0;
        for i in 0..y.len() {
            for j in 0..y.len() {
                if y[i] > 0.5 && y[j] < 0.5 {
                    pairs += 1.0;
                    if s[i] > s[j] {
                        pos_wins += 1.0;
                    } else if s[i] == s[j] {
                        pos_wins += 0.5;
                    }
                }
            }
        }
        pos_wins / pairs
    }

    #[test]
    fn separable_scores_give_threshold_between_classes() {
        let curve = roc(&[0.0, 0.0, 1.0, 1.0], &[0.1, 0.2, 0.8, 0.9]);
        let best = curve.optimal_point();
        assert!(best.threshold > 0.2 && best.threshold < 0.8);
        assert_eq!(best.tpr, 1.0);
        assert_eq!(best.fpr, 0.0);
        assert_eq!(curve.auroc, 1.0);
    }

    #[test]
    fn curve_starts_at_origin_and_ends_at_one() {
        let curve = roc(&[1.0, 0.0, 1.0, 0.0, 1.0], &[0.3, 0.3, 0.7, 0.1, 0.5]);
        assert_eq!(curve.thresholds[0], f64::INFINITY);
        assert_eq!(*curve.thresholds.last().unwrap(), f64::NEG_INFINITY);
        assert_eq!((curve.fpr[0], curve.tpr[0]), (0.0, 0.0));
        assert_eq!((*curve.fpr.last().unwrap(), *curve.tpr.last().unwrap()), (1.0, 1.0));
        // Four distinct scores give five thresholds.
        assert_eq!(curve.thresholds.len(), 5);
        assert!(curve.fpr.windows(2).all(|w| w[0] <= w[1]));
        assert!(curve.tpr.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn trapezoid_area_matches_rank_statistic_with_ties() {
        let y = [1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0];
        let s = [0.3, 0.3, 0.7, 0.1, 0.5, 0.6, 0.5, 0.2];
        assert_abs_diff_eq!(roc(&y, &s).auroc, mann_whitney(&y, &s), epsilon = 1e-12);
    }

    #[test]
    fn single_class_has_undefined_auroc() {
        assert!(roc(&[1.0, 1.0, 1.0], &[0.2, 0.5, 0.9]).auroc.is_nan());
        assert!(roc(&[0.0, 0.0], &[0.2, 0.5]).auroc.is_nan());
    }

    #[test]
    fn multi_label_scores_each_column_independently() {
        let y = array![[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]];
        let s = array![[0.9f32, 0.9], [0.1, 0.1], [0.8, 0.85], [0.2, 0.8]];
        let labels = vec!["diabetes".to_string(), "asthma".to_string()];

        let multi = MultiLabelRoc::new(y.view(), s.view(), &labels).unwrap();
        assert_eq!(multi.get("diabetes").unwrap().auroc, 1.0);
        assert_eq!(multi.get("asthma").unwrap().auroc, 0.25);
        assert!(multi.get("copd").is_none());
        assert_eq!(auroc_score(y.view(), s.view()).unwrap(), vec![1.0, 0.25]);
    }

    #[test]
    fn non_finite_scores_are_rejected() {
        let y = Array1::from(vec![1.0f32, 0.0, 1.0]);
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let s = Array1::from(vec![0.9f32, bad, 0.2]);
            match Roc::new(y.view(), s.view()) {
                Err(MetricsError::NonFiniteScore { index, .. }) => assert_eq!(index, 1),
                other => panic!("expected NonFiniteScore, got {other:?}"),
            }
        }
        let y2 = array![[1.0f32], [0.0]];
        let s2 = array![[f32::NAN], [0.5]];
        assert!(matches!(
            auroc_score(y2.view(), s2.view()),
            Err(MetricsError::NonFiniteScore { index: 0, .. })
        ));
    }

    #[test]
    fn nan_pairs_still_terminate_the_sweep() {
        let curve = Roc::from_pairs(&[(true, 0.9), (false, f64::NAN), (true, 0.2), (false, f64::NAN)]);
        assert_eq!(*curve.tpr.last().unwrap(), 1.0);
        assert_eq!(*curve.fpr.last().unwrap(), 1.0);
    }

    #[test]
    fn shape_and_name_mismatches_are_errors() {
        let y = array![[1.0f32, 0.0], [0.0, 1.0]];
        let s = array![[0.9f32], [0.1]];
        assert!(matches!(
            auroc_score(y.view(), s.view()),
            Err(MetricsError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            MultiLabelRoc::new(y.view(), y.view(), &["one".to_string()]),
            Err(MetricsError::LabelNameMismatch { names: 1, columns: 2 })
        ));
    }
}
