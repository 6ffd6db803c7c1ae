//! Binary cross-entropy on logits with per-label positive weights, mean-reduced over
//! every `(patient, label)` cell.

use super::model::ModelError;
use ndarray::{Array1, Array2, ArrayView2, Zip};

fn softplus(x: f32) -> f32 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BceWithLogits {
    pos_weight: Array1<f32>,
}

impl BceWithLogits {
    /// `pos_weight[j]` multiplies the loss of positive cells in label column `j`.
    pub fn new(pos_weight: Vec<f32>) -> Self {
        Self {
            pos_weight: Array1::from(pos_weight),
        }
    }

    pub fn pos_weight(&self) -> &Array1<f32> {
        &self.pos_weight
    }

    fn check(&self, logits: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<(), ModelError> {
        if logits.dim() != targets.dim() {
            return Err(ModelError::InputShape {
                what: "target cells",
                expected: logits.len(),
                found: targets.len(),
            });
        }
        if logits.ncols() != self.pos_weight.len() {
            return Err(ModelError::InputShape {
                what: "label columns",
                expected: self.pos_weight.len(),
                found: logits.ncols(),
            });
        }
        Ok(())
    }

    /// Mean loss and its gradient with respect to `logits`.
    pub fn loss_and_grad(
        &self,
        logits: ArrayView2<f32>,
        targets: ArrayView2<f32>,
    ) -> Result<(f32, Array2<f32>), ModelError> {
        self.check(logits, targets)?;
        let n = logits.len().max(1) as f32;
        let mut total = 0.0f64;
        let mut grad = Array2::zeros(logits.dim());
        for ((i, j), g) in grad.indexed_iter_mut() {
            let (x, y, p) = (logits[[i, j]], targets[[i, j]], self.pos_weight[j]);
            // -[p·y·log σ(x) + (1-y)·log(1-σ(x))]
            total += (p * y * softplus(-x) + (1.0 - y) * softplus(x)) as f64;
            let s = sigmoid(x);
            *g = ((1.0 - y) * s - p * y * (1.0 - s)) / n;
        }
        Ok(((total / n as f64) as f32, grad))
    }

    pub fn loss(&self, logits: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<f32, ModelError> {
        self.check(logits, targets)?;
        let mut total = 0.0f64;
        Zip::indexed(logits).and(targets).for_each(|(_, j), &x, &y| {
            let p = self.pos_weight[j];
            total += (p * y * softplus(-x) + (1.0 - y) * softplus(x)) as f64;
        });
        Ok((total / logits.len().max(1) as f64) as f32)
    }
}
