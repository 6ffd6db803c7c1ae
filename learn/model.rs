// ========================================================================================
//
//                        EMBEDDING-BAG CLASSIFIER WITH MANUAL BACKPROP
//
// ========================================================================================
//
// Each record stream has an embedding table; every age bucket's codes are averaged
// into one vector (mean embedding bag) and the bucket vectors are pooled over time with
// fixed weights. The pooled record vectors are concatenated with the demographic
// embeddings and the normalised age, then pass through `linear_layers` ReLU layers that
// double the width each time, and a final layer with one logit per label.
//
// Because bag averaging and temporal pooling are both linear, a patient's record vector
// is a weighted sum of embedding rows. The forward pass records those `(row, weight)`
// pairs so the backward pass can scatter gradients straight into the tables.

use crate::encode::EncodedBatch;
use crate::vocab::EmbeddingDims;
use ndarray::{Array2, ArrayView2, Axis, Zip, s};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Batch input has {found} {what}, but the model was built for {expected}.")]
    InputShape {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Index {index} is outside embedding table '{table}' with {size} rows.")]
    IndexOutOfRange {
        table: String,
        index: usize,
        size: usize,
    },
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
}

/// A named, trainable tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Array2<f32>,
    pub trainable: bool,
}

impl Parameter {
    fn new(name: impl Into<String>, value: Array2<f32>) -> Self {
        Self {
            name: name.into(),
            value,
            trainable: true,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// The seam between the training loop and a concrete network.
pub trait Classifier {
    /// Whatever the backward pass needs from the forward pass.
    type Cache;

    /// Logits of shape `(patients, labels)`. Dropout is active iff `dropout` is given.
    fn forward(
        &self,
        batch: &EncodedBatch,
        dropout: Option<&mut StdRng>,
    ) -> Result<(Array2<f32>, Self::Cache), ModelError>;

    /// Gradients for every parameter, in `parameters()` order, given the gradient of
    /// the objective with respect to the logits.
    fn backward(&self, cache: &Self::Cache, grad_logits: ArrayView2<f32>) -> Vec<Array2<f32>>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCount {
    pub total: usize,
    pub trainable: usize,
    pub non_trainable: usize,
}

pub fn count_parameters<M: Classifier>(model: &M) -> ParameterCount {
    let (trainable, frozen): (Vec<&Parameter>, Vec<&Parameter>) =
        model.parameters().iter().partition(|p| p.trainable);
    let trainable: usize = trainable.iter().map(|p| p.len()).sum();
    let non_trainable: usize = frozen.iter().map(|p| p.len()).sum();
    ParameterCount {
        total: trainable + non_trainable,
        trainable,
        non_trainable,
    }
}

/// How the per-bucket vectors of a record stream are combined over time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pooling {
    /// Every bucket weighs the same.
    Mean,
    /// Bucket `t` of `T` weighs `decay^(T-1-t)`, normalised, so recent buckets count most.
    Recency { decay: f32 },
}

impl Pooling {
    pub fn weights(self, steps: usize) -> Vec<f32> {
        if steps == 0 {
            return Vec::new();
        }
        let raw: Vec<f32> = match self {
            Self::Mean => vec![1.0; steps],
            Self::Recency { decay } => (0..steps)
                .map(|t| decay.powi((steps - 1 - t) as i32))
                .collect(),
        };
        let total: f32 = raw.iter().sum();
        raw.into_iter().map(|w| w / total).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    /// `(vocab_size, width)` per demographic field.
    pub demographic_dims: Vec<(usize, usize)>,
    /// `(vocab_size, width)` per record stream.
    pub record_dims: Vec<(usize, usize)>,
    pub num_labels: usize,
    pub pooling: Pooling,
    pub linear_layers: usize,
    /// Embeddings start uniform in `[-initrange, initrange)`.
    pub initrange: f32,
    pub input_dropout: f32,
    pub linear_dropout: f32,
}

impl NetConfig {
    pub fn from_embedding_dims(dims: &EmbeddingDims, num_labels: usize) -> Self {
        Self {
            demographic_dims: dims.demographics.clone(),
            record_dims: dims.records.clone(),
            num_labels,
            pooling: Pooling::Mean,
            linear_layers: 4,
            initrange: 0.3,
            input_dropout: 0.3,
            linear_dropout: 0.3,
        }
    }

    fn validate(&self) -> Result<(), ModelError> {
        let invalid = |msg: String| Err(ModelError::InvalidConfig(msg));
        if self.num_labels == 0 {
            return invalid("at least one label is required".to_string());
        }
        for (name, p) in [
            ("input_dropout", self.input_dropout),
            ("linear_dropout", self.linear_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return invalid(format!("{name} must be in [0, 1), got {p}"));
            }
        }
        if !(self.initrange.is_finite() && self.initrange >= 0.0) {
            return invalid(format!("initrange must be non-negative, got {}", self.initrange));
        }
        if let Pooling::Recency { decay } = self.pooling {
            if !(decay > 0.0 && decay <= 1.0) {
                return invalid(format!("recency decay must be in (0, 1], got {decay}"));
            }
        }
        if self
            .demographic_dims
            .iter()
            .chain(&self.record_dims)
            .any(|&(rows, width)| rows == 0 || width == 0)
        {
            return invalid("embedding tables need at least one row and column".to_string());
        }
        Ok(())
    }
}

/// What `EmbeddingBagNet::backward` needs from a forward pass.
pub struct NetCache {
    /// `[patient][stream]` -> `(embedding row, weight)` making up the pooled vector.
    record_rows: Vec<Vec<Vec<(usize, f32)>>>,
    demographics: Vec<Vec<usize>>,
    input_mask: Option<Array2<f32>>,
    /// Inputs to every linear layer, then to the output layer.
    layer_inputs: Vec<Array2<f32>>,
    pre_activations: Vec<Array2<f32>>,
    dropout_masks: Vec<Option<Array2<f32>>>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingBagNet {
    config: NetConfig,
    parameters: Vec<Parameter>,
}

fn kaiming_normal(rng: &mut StdRng, fan_in: usize, fan_out: usize) -> Array2<f32> {
    let std = (2.0 / fan_in.max(1) as f32).sqrt();
    Array2::from_shape_simple_fn((fan_in, fan_out), || {
        let z: f32 = rng.sample(StandardNormal);
        z * std
    })
}

fn uniform_embedding(rng: &mut StdRng, rows: usize, width: usize, range: f32) -> Array2<f32> {
    if range == 0.0 {
        return Array2::zeros((rows, width));
    }
    Array2::from_shape_simple_fn((rows, width), || rng.gen_range(-range..range))
}

/// Inverted dropout mask: kept entries are scaled by `1 / (1 - p)`.
fn dropout_mask(rng: &mut StdRng, shape: (usize, usize), p: f32) -> Array2<f32> {
    let keep = 1.0 - p;
    Array2::from_shape_simple_fn(shape, || {
        if rng.gen_bool(keep as f64) { 1.0 / keep } else { 0.0 }
    })
}

impl EmbeddingBagNet {
    pub fn new(config: NetConfig, rng: &mut StdRng) -> Result<Self, ModelError> {
        config.validate()?;
        let mut parameters = Vec::new();

        for (i, &(rows, width)) in config.demographic_dims.iter().enumerate() {
            parameters.push(Parameter::new(
                format!("demographics.{i}.weight"),
                uniform_embedding(rng, rows, width, config.initrange),
            ));
        }
        for (k, &(rows, width)) in config.record_dims.iter().enumerate() {
            parameters.push(Parameter::new(
                format!("records.{k}.weight"),
                uniform_embedding(rng, rows, width, config.initrange),
            ));
        }

        let mut features = Self::input_width(&config);
        for l in 0..config.linear_layers {
            let out = features * 2;
            parameters.push(Parameter::new(
                format!("linear.{l}.weight"),
                kaiming_normal(rng, features, out),
            ));
            parameters.push(Parameter::new(format!("linear.{l}.bias"), Array2::zeros((1, out))));
            features = out;
        }
        parameters.push(Parameter::new(
            "output.weight",
            kaiming_normal(rng, features, config.num_labels),
        ));
        parameters.push(Parameter::new(
            "output.bias",
            Array2::zeros((1, config.num_labels)),
        ));

        log::debug!(
            "Built embedding-bag net: {} input features, {} linear layers, {} tensors",
            Self::input_width(&config),
            config.linear_layers,
            parameters.len()
        );
        Ok(Self { config, parameters })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    fn records_width(config: &NetConfig) -> usize {
        config.record_dims.iter().map(|d| d.1).sum()
    }

    /// Pooled records, demographic embeddings and the age scalar.
    fn input_width(config: &NetConfig) -> usize {
        Self::records_width(config) + config.demographic_dims.iter().map(|d| d.1).sum::<usize>() + 1
    }

    fn demographic_param(&self, field: usize) -> usize {
        field
    }

    fn record_param(&self, stream: usize) -> usize {
        self.config.demographic_dims.len() + stream
    }

    fn linear_param(&self, layer: usize) -> usize {
        self.config.demographic_dims.len() + self.config.record_dims.len() + 2 * layer
    }

    fn output_param(&self) -> usize {
        self.linear_param(self.config.linear_layers)
    }

    fn check_row(&self, param: usize, index: usize) -> Result<(), ModelError> {
        let table = &self.parameters[param];
        if index >= table.value.nrows() {
            return Err(ModelError::IndexOutOfRange {
                table: table.name.clone(),
                index,
                size: table.value.nrows(),
            });
        }
        Ok(())
    }

    fn embed(&self, batch: &EncodedBatch) -> Result<(Array2<f32>, NetCache), ModelError> {
        let n_streams = self.config.record_dims.len();
        let n_fields = self.config.demographic_dims.len();
        let mut x = Array2::zeros((batch.len(), Self::input_width(&self.config)));
        let mut record_rows = Vec::with_capacity(batch.len());
        let mut demographics = Vec::with_capacity(batch.len());

        for (p, patient) in batch.patients.iter().enumerate() {
            if patient.records.len() != n_streams {
                return Err(ModelError::InputShape {
                    what: "record streams",
                    expected: n_streams,
                    found: patient.records.len(),
                });
            }
            if patient.demographics.len() != n_fields {
                return Err(ModelError::InputShape {
                    what: "demographic fields",
                    expected: n_fields,
                    found: patient.demographics.len(),
                });
            }

            let mut col = 0;
            let mut rows_per_stream = Vec::with_capacity(n_streams);
            for (k, bags) in patient.records.iter().enumerate() {
                let param = self.record_param(k);
                let weights = self.config.pooling.weights(bags.num_bags());
                let mut rows = Vec::with_capacity(bags.values.len());
                for (t, w) in weights.iter().enumerate() {
                    let bag = bags.bag(t);
                    if bag.is_empty() {
                        continue;
                    }
                    let share = w / bag.len() as f32;
                    for &v in bag {
                        self.check_row(param, v)?;
                        rows.push((v, share));
                    }
                }

                let table = &self.parameters[param].value;
                let width = table.ncols();
                let mut slot = x.slice_mut(s![p, col..col + width]);
                for &(v, share) in &rows {
                    slot.scaled_add(share, &table.row(v));
                }
                rows_per_stream.push(rows);
                col += width;
            }

            for (j, &index) in patient.demographics.iter().enumerate() {
                let param = self.demographic_param(j);
                self.check_row(param, index)?;
                let table = &self.parameters[param].value;
                let width = table.ncols();
                x.slice_mut(s![p, col..col + width]).assign(&table.row(index));
                col += width;
            }
            x[[p, col]] = patient.age_now;

            record_rows.push(rows_per_stream);
            demographics.push(patient.demographics.clone());
        }

        let cache = NetCache {
            record_rows,
            demographics,
            input_mask: None,
            layer_inputs: Vec::new(),
            pre_activations: Vec::new(),
            dropout_masks: Vec::new(),
        };
        Ok((x, cache))
    }
}

impl Classifier for EmbeddingBagNet {
    type Cache = NetCache;

    fn forward(
        &self,
        batch: &EncodedBatch,
        mut dropout: Option<&mut StdRng>,
    ) -> Result<(Array2<f32>, NetCache), ModelError> {
        let (mut x, mut cache) = self.embed(batch)?;

        let records_width = Self::records_width(&self.config);
        if let Some(rng) = dropout.as_deref_mut() {
            if self.config.input_dropout > 0.0 {
                let mask = dropout_mask(rng, (batch.len(), records_width), self.config.input_dropout);
                let mut records = x.slice_mut(s![.., 0..records_width]);
                records *= &mask;
                cache.input_mask = Some(mask);
            }
        }

        let mut a = x;
        for l in 0..self.config.linear_layers {
            let w = &self.parameters[self.linear_param(l)].value;
            let b = &self.parameters[self.linear_param(l) + 1].value;
            let z = a.dot(w) + b;
            let mut h = z.mapv(|v| v.max(0.0));
            let mask = match dropout.as_deref_mut() {
                Some(rng) if self.config.linear_dropout > 0.0 => {
                    let mask = dropout_mask(rng, h.dim(), self.config.linear_dropout);
                    h *= &mask;
                    Some(mask)
                }
                _ => None,
            };
            cache.layer_inputs.push(a);
            cache.pre_activations.push(z);
            cache.dropout_masks.push(mask);
            a = h;
        }

        let out = self.output_param();
        let logits = a.dot(&self.parameters[out].value) + &self.parameters[out + 1].value;
        cache.layer_inputs.push(a);
        Ok((logits, cache))
    }

    fn backward(&self, cache: &NetCache, grad_logits: ArrayView2<f32>) -> Vec<Array2<f32>> {
        let mut grads: Vec<Array2<f32>> = self
            .parameters
            .iter()
            .map(|p| Array2::zeros(p.value.dim()))
            .collect();

        let out = self.output_param();
        let layers = self.config.linear_layers;
        let last_input = &cache.layer_inputs[layers];
        grads[out] = last_input.t().dot(&grad_logits);
        grads[out + 1] = grad_logits.sum_axis(Axis(0)).insert_axis(Axis(0));
        let mut g = grad_logits.dot(&self.parameters[out].value.t());

        for l in (0..layers).rev() {
            if let Some(mask) = &cache.dropout_masks[l] {
                g *= mask;
            }
            Zip::from(&mut g)
                .and(&cache.pre_activations[l])
                .for_each(|g, &z| {
                    if z <= 0.0 {
                        *g = 0.0;
                    }
                });
            let w = self.linear_param(l);
            grads[w] = cache.layer_inputs[l].t().dot(&g);
            grads[w + 1] = g.sum_axis(Axis(0)).insert_axis(Axis(0));
            g = g.dot(&self.parameters[w].value.t());
        }

        let records_width = Self::records_width(&self.config);
        if let Some(mask) = &cache.input_mask {
            let mut records = g.slice_mut(s![.., 0..records_width]);
            records *= mask;
        }

        for (p, streams) in cache.record_rows.iter().enumerate() {
            let mut col = 0;
            for (k, rows) in streams.iter().enumerate() {
                let param = self.record_param(k);
                let width = self.parameters[param].value.ncols();
                let upstream = g.slice(s![p, col..col + width]);
                for &(v, share) in rows {
                    grads[param].row_mut(v).scaled_add(share, &upstream);
                }
                col += width;
            }
            for (j, &index) in cache.demographics[p].iter().enumerate() {
                let param = self.demographic_param(j);
                let width = self.parameters[param].value.ncols();
                let upstream = g.slice(s![p, col..col + width]);
                let mut row = grads[param].row_mut(index);
                row += &upstream;
                col += width;
            }
        }

        grads
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.parameters
    }
}
