//! Per-epoch losses and AUROCs, the last predictions of every split and the prediction
//! summary of a run. Persisted as `history.json`; undefined AUROCs (NaN) are written
//! as `null`.

use ndarray::Array2;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// JSON has no NaN or infinity, and serde_json would write both as `null`. NaN (an
/// undefined AUROC) is stored as `null`; `+inf`/`-inf` (sentinel ROC thresholds) are
/// stored as the strings `"inf"` and `"-inf"` so they read back unchanged.
mod float_repr {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    pub(super) enum Repr {
        Number(f64),
        Text(String),
    }

    pub(super) fn to_repr(v: f64) -> Option<Repr> {
        if v.is_nan() {
            None
        } else if v == f64::INFINITY {
            Some(Repr::Text("inf".to_string()))
        } else if v == f64::NEG_INFINITY {
            Some(Repr::Text("-inf".to_string()))
        } else {
            Some(Repr::Number(v))
        }
    }

    pub(super) fn from_repr<E: serde::de::Error>(repr: Option<Repr>) -> Result<f64, E> {
        match repr {
            None => Ok(f64::NAN),
            Some(Repr::Number(v)) => Ok(v),
            Some(Repr::Text(t)) => match t.as_str() {
                "inf" | "+inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(E::custom(format!("expected a number, null, \"inf\" or \"-inf\", got \"{other}\""))),
            },
        }
    }
}

mod nullable {
    use super::float_repr::{Repr, from_repr, to_repr};
    use super::*;

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        to_repr(*v).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        from_repr(Option::<Repr>::deserialize(d)?)
    }
}

mod nullable_vec {
    use super::float_repr::{Repr, from_repr, to_repr};
    use super::*;

    pub fn serialize<S: Serializer>(v: &[f64], s: S) -> Result<S::Ok, S::Error> {
        let reprs: Vec<Option<Repr>> = v.iter().map(|&x| to_repr(x)).collect();
        reprs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Option<Repr>>::deserialize(d)?
            .into_iter()
            .map(from_repr)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRow {
    pub epoch: usize,
    #[serde(with = "nullable")]
    pub loss: f64,
    /// One per label, in label order.
    #[serde(with = "nullable_vec")]
    pub aurocs: Vec<f64>,
}

/// Labels and probabilities of the most recent pass over a split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitOutputs {
    pub y: Array2<f32>,
    pub y_hat: Array2<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub label: String,
    #[serde(with = "nullable")]
    pub auroc: f64,
    #[serde(with = "nullable")]
    pub optimal_threshold: f64,
    #[serde(with = "nullable")]
    pub ci_lower: f64,
    #[serde(with = "nullable")]
    pub ci_upper: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    pub train: Vec<EpochRow>,
    pub valid: Vec<EpochRow>,
    /// Replaced by every prediction run.
    pub test: Option<EpochRow>,
    pub train_outputs: Option<SplitOutputs>,
    pub valid_outputs: Option<SplitOutputs>,
    pub test_outputs: Option<SplitOutputs>,
    pub prediction_summary: Vec<PredictionRow>,
}

impl RunHistory {
    pub fn last_epoch(&self) -> Option<usize> {
        self.train.last().map(|row| row.epoch)
    }
}
