// ========================================================================================
//
//                                   OPTIMIZERS
//
// ========================================================================================
//
// First-order update rules over the classifier's parameter list. Per-parameter state
// (moments, accumulators) is kept in the same order as the parameters and can be
// exported as named buffers for checkpointing.

use super::model::{ModelError, Parameter};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Learning rate of the plain SGD optimizer, independent of the configured rate.
pub const SGD_LR: f32 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "SGD")]
    Sgd,
    Adam,
    Adagrad,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdagradConfig {
    pub lr: f32,
    pub lr_decay: f32,
    pub weight_decay: f32,
    pub eps: f32,
}

/// Serializable snapshot of an optimizer's state.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub step: u64,
    /// `(name, tensor)` pairs, named `"{slot}.{parameter name}"`.
    pub buffers: Vec<(String, Array2<f32>)>,
}

#[derive(Debug, Clone)]
enum Rule {
    Sgd { lr: f32 },
    Adam { config: AdamConfig, m: Vec<Array2<f32>>, v: Vec<Array2<f32>> },
    Adagrad { config: AdagradConfig, sum: Vec<Array2<f32>> },
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    rule: Rule,
    names: Vec<String>,
    step: u64,
}

fn zeros_like(params: &[Parameter]) -> Vec<Array2<f32>> {
    params.iter().map(|p| Array2::zeros(p.value.dim())).collect()
}

impl Optimizer {
    pub fn sgd(params: &[Parameter]) -> Self {
        Self::with_rule(params, Rule::Sgd { lr: SGD_LR })
    }

    pub fn adam(params: &[Parameter], config: AdamConfig) -> Self {
        let rule = Rule::Adam {
            config,
            m: zeros_like(params),
            v: zeros_like(params),
        };
        Self::with_rule(params, rule)
    }

    pub fn adagrad(params: &[Parameter], config: AdagradConfig) -> Self {
        let rule = Rule::Adagrad {
            config,
            sum: zeros_like(params),
        };
        Self::with_rule(params, rule)
    }

    fn with_rule(params: &[Parameter], rule: Rule) -> Self {
        Self {
            rule,
            names: params.iter().map(|p| p.name.clone()).collect(),
            step: 0,
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        match self.rule {
            Rule::Sgd { .. } => OptimizerKind::Sgd,
            Rule::Adam { .. } => OptimizerKind::Adam,
            Rule::Adagrad { .. } => OptimizerKind::Adagrad,
        }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Applies one update. Frozen parameters are left untouched.
    pub fn step(&mut self, params: &mut [Parameter], grads: &[Array2<f32>]) -> Result<(), ModelError> {
        if params.len() != self.names.len() || grads.len() != params.len() {
            return Err(ModelError::InputShape {
                what: "gradient tensors",
                expected: self.names.len(),
                found: grads.len().min(params.len()),
            });
        }
        self.step += 1;
        let t = self.step;

        for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            if !param.trainable {
                continue;
            }
            if param.value.dim() != grad.dim() {
                return Err(ModelError::InputShape {
                    what: "gradient cells",
                    expected: param.value.len(),
                    found: grad.len(),
                });
            }
            match &mut self.rule {
                Rule::Sgd { lr } => param.value.scaled_add(-*lr, grad),
                Rule::Adam { config, m, v } => {
                    let c1 = 1.0 - config.beta1.powi(t as i32);
                    let c2 = 1.0 - config.beta2.powi(t as i32);
                    let AdamConfig { lr, beta1, beta2, eps } = *config;
                    Zip::from(&mut param.value)
                        .and(&mut m[i])
                        .and(&mut v[i])
                        .and(grad)
                        .for_each(|p, m, v, &g| {
                            *m = beta1 * *m + (1.0 - beta1) * g;
                            *v = beta2 * *v + (1.0 - beta2) * g * g;
                            let m_hat = *m / c1;
                            let v_hat = *v / c2;
                            *p -= lr * m_hat / (v_hat.sqrt() + eps);
                        });
                }
                Rule::Adagrad { config, sum } => {
                    let AdagradConfig { lr, lr_decay, weight_decay, eps } = *config;
                    let clr = lr / (1.0 + (t - 1) as f32 * lr_decay);
                    Zip::from(&mut param.value)
                        .and(&mut sum[i])
                        .and(grad)
                        .for_each(|p, s, &g| {
                            let g = g + weight_decay * *p;
                            *s += g * g;
                            *p -= clr * g / (s.sqrt() + eps);
                        });
                }
            }
        }
        Ok(())
    }

    pub fn export_state(&self) -> OptimizerState {
        let named = |slot: &str, tensors: &[Array2<f32>]| -> Vec<(String, Array2<f32>)> {
            self.names
                .iter()
                .zip(tensors)
                .map(|(name, t)| (format!("{slot}.{name}"), t.clone()))
                .collect()
        };
        let buffers = match &self.rule {
            Rule::Sgd { .. } => Vec::new(),
            Rule::Adam { m, v, .. } => {
                let mut buffers = named("exp_avg", m);
                buffers.extend(named("exp_avg_sq", v));
                buffers
            }
            Rule::Adagrad { sum, .. } => named("sum", sum),
        };
        OptimizerState {
            kind: self.kind(),
            step: self.step,
            buffers,
        }
    }

    /// Restores exported state. The kind, buffer names and shapes must all match.
    pub fn import_state(&mut self, state: OptimizerState) -> Result<(), String> {
        if state.kind != self.kind() {
            return Err(format!(
                "checkpoint holds {:?} optimizer state, experiment uses {:?}",
                state.kind,
                self.kind()
            ));
        }
        let expected = self.export_state();
        if expected.buffers.len() != state.buffers.len() {
            return Err(format!(
                "checkpoint holds {} optimizer buffers, expected {}",
                state.buffers.len(),
                expected.buffers.len()
            ));
        }
        for ((name, want), (got_name, got)) in expected.buffers.iter().zip(&state.buffers) {
            if name != got_name || want.dim() != got.dim() {
                return Err(format!(
                    "optimizer buffer '{got_name}' {:?} does not match '{name}' {:?}",
                    got.dim(),
                    want.dim()
                ));
            }
        }

        let mut tensors = state.buffers.into_iter().map(|(_, t)| t);
        let n = self.names.len();
        match &mut self.rule {
            Rule::Sgd { .. } => {}
            Rule::Adam { m, v, .. } => {
                *m = tensors.by_ref().take(n).collect();
                *v = tensors.collect();
            }
            Rule::Adagrad { sum, .. } => *sum = tensors.collect(),
        }
        self.step = state.step;
        Ok(())
    }
}
