//! Gate network: N parallel sigmoid heads multiplied into one prediction.
//!
//! ```text
//! vals [B,P] -> BatchNorm(per position) --+
//!                                         +-> concat [B,P,5] -> flatten [B,5P]
//! locs [B,P] -> Embedding(watermark, 4) --+
//!
//! flatten -> Dense(1, sigmoid) -> Dropout(0.4) --+
//! flatten -> Dense(1, sigmoid) -> Dropout(0.4) --+-> product -> y [B]
//!   ... N heads ...                              |
//! ```
//!
//! Every head is an independent gate in `[0, 1]`, so at inference the product
//! is in `[0, 1]` as well. A product of gates can later be read back as a
//! conjunction of per-position conditions, which a single dense layer cannot.
//!
//! Built on candle in `f64` on the CPU. The N heads are one
//! [`candle_nn::Linear`] with N outputs; row `i` of its weight is head `i`.
//! Learnable tensors live in a [`VarMap`] so an optimizer can step them;
//! batch-norm running statistics are plain tensors outside it.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder, VarMap};
use eyre::Result;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Width of a location embedding.
pub const EMBEDDING_DIM: usize = 4;
/// Features per position after concatenating embedding and normalized value.
pub const FEATURES_PER_POSITION: usize = EMBEDDING_DIM + 1;
/// Dropout probability applied to every head while training.
pub const DROPOUT_PROB: f64 = 0.4;
/// Default number of parallel heads.
pub const DEFAULT_HEADS: usize = 50;

const BN_MOMENTUM: f64 = 0.99;
const BN_EPSILON: f64 = 1e-3;
const EMBEDDING_INIT_RANGE: f64 = 0.05;
/// Fuzz factor for the min-max norm constraint.
const CONSTRAINT_EPSILON: f64 = 1e-7;

/// Version prefix for parameter fingerprints. Bump when tensor order changes.
const FINGERPRINT_VERSION: &str = "v2";

const GAMMA: &str = "bn.gamma";
const BETA: &str = "bn.beta";
const EMBEDDING: &str = "embedding.weight";
const HEADS_WEIGHT: &str = "heads.weight";
const HEADS_BIAS: &str = "heads.bias";

/// Shape of a gate network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Topology {
    /// Positions per run.
    pub poscount: usize,
    /// Embedding-table rows (location vocabulary watermark).
    pub watermark: usize,
    /// Parallel heads.
    pub heads: usize,
}

impl Topology {
    /// Flattened feature width seen by every head.
    pub fn flat_width(&self) -> usize {
        self.poscount * FEATURES_PER_POSITION
    }

    pub fn param_count(&self) -> usize {
        2 * self.poscount
            + self.watermark * EMBEDDING_DIM
            + self.heads * self.flat_width()
            + self.heads
    }
}

/// Learnable parameters plus batch-norm running statistics.
pub struct GateNet {
    topo: Topology,
    device: Device,
    varmap: VarMap,
    /// Batch-norm scale, one per position.
    gamma: Tensor,
    /// Batch-norm shift, one per position.
    beta: Tensor,
    embedding: Embedding,
    heads: Linear,
    moving_mean: Tensor,
    moving_var: Tensor,
}

/// What a training forward pass hands back to the trainer.
pub struct TrainForward {
    /// `[B]` product of the dropped-out heads.
    pub output: Tensor,
    /// `[P]` batch mean per position.
    pub batch_mean: Tensor,
    /// `[P]` biased batch variance per position.
    pub batch_var: Tensor,
    pub batch_size: usize,
}

impl GateNet {
    /// Fresh network with randomly initialized weights.
    ///
    /// Kernels are Glorot-uniform, embeddings uniform in `±0.05`, biases and
    /// `beta` zero, `gamma` one. Random values come from `rng` so a seed
    /// pins the whole network.
    pub fn new<R: Rng>(topo: Topology, rng: &mut R) -> Result<Self> {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let flat = topo.flat_width();

        let gamma = vb.get_with_hints(topo.poscount, GAMMA, Init::Const(1.0))?;
        let beta = vb.get_with_hints(topo.poscount, BETA, Init::Const(0.0))?;
        let table =
            vb.get_with_hints((topo.watermark, EMBEDDING_DIM), EMBEDDING, Init::Const(0.0))?;
        let kernel = vb.get_with_hints((topo.heads, flat), HEADS_WEIGHT, Init::Const(0.0))?;
        let bias = vb.get_with_hints(topo.heads, HEADS_BIAS, Init::Const(0.0))?;

        let limit = (6.0 / (flat + 1) as f64).sqrt();
        let kernel_init: Vec<f64> = (0..topo.heads * flat)
            .map(|_| rng.gen_range(-limit..limit))
            .collect();
        let table_init: Vec<f64> = (0..topo.watermark * EMBEDDING_DIM)
            .map(|_| rng.gen_range(-EMBEDDING_INIT_RANGE..EMBEDDING_INIT_RANGE))
            .collect();
        varmap.set_one(
            HEADS_WEIGHT,
            Tensor::from_vec(kernel_init, (topo.heads, flat), &device)?,
        )?;
        varmap.set_one(
            EMBEDDING,
            Tensor::from_vec(table_init, (topo.watermark, EMBEDDING_DIM), &device)?,
        )?;

        Ok(Self {
            topo,
            moving_mean: Tensor::zeros(topo.poscount, DType::F64, &device)?,
            moving_var: Tensor::ones(topo.poscount, DType::F64, &device)?,
            embedding: Embedding::new(table, EMBEDDING_DIM),
            heads: Linear::new(kernel, Some(bias)),
            gamma,
            beta,
            varmap,
            device,
        })
    }

    pub fn topology(&self) -> Topology {
        self.topo
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Every learnable variable, for the optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Clip the L2 norms of `gamma` and `beta` into `[0, 1]`.
    pub fn apply_constraints(&mut self) -> Result<()> {
        for (name, w) in [(GAMMA, &self.gamma), (BETA, &self.beta)] {
            let norm = w.sqr()?.sum_all()?.to_scalar::<f64>()?.sqrt();
            let clipped = w.affine(min_max_scale(norm, 0.0, 1.0), 0.0)?;
            self.varmap.set_one(name, clipped)?;
        }
        Ok(())
    }

    /// SHA-256 over every parameter and running statistic.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION.as_bytes());
        for n in [self.topo.poscount, self.topo.watermark, self.topo.heads] {
            hasher.update((n as u64).to_le_bytes());
        }
        for t in [
            &self.gamma,
            &self.beta,
            &self.moving_mean,
            &self.moving_var,
            self.embedding.embeddings(),
            self.heads.weight(),
        ]
        .into_iter()
        .chain(self.heads.bias())
        {
            for v in t.flatten_all()?.to_vec1::<f64>()? {
                hasher.update(v.to_le_bytes());
            }
        }
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    // -----------------------------------------------------------------------
    // Forward
    // -----------------------------------------------------------------------

    /// Inference-mode predictions: running batch-norm statistics, no dropout.
    pub fn predict(&self, locs: &[&[usize]], vals: &[&[f64]]) -> Result<Vec<f64>> {
        if locs.is_empty() {
            return Ok(Vec::new());
        }
        let gates = self.inference_gates(locs, vals)?;
        Ok(product_of_heads(&gates)?.to_vec1::<f64>()?)
    }

    /// Training-mode forward pass: batch statistics and random dropout.
    ///
    /// Dropout masks are drawn from `rng` and scaled by `1 / keep`.
    pub fn forward_train<R: Rng>(
        &self,
        locs: &[&[usize]],
        vals: &[&[f64]],
        rng: &mut R,
    ) -> Result<TrainForward> {
        let (ids, x) = self.batch_tensors(locs, vals)?;
        let batch_size = locs.len();

        let mean = x.mean_keepdim(0)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(0)?;
        let xhat = centered.broadcast_div(&var.affine(1.0, BN_EPSILON)?.sqrt()?)?;
        let gates = self.gates(&ids, &xhat)?;

        let keep = 1.0 - DROPOUT_PROB;
        let mask: Vec<f64> = (0..batch_size * self.topo.heads)
            .map(|_| if rng.gen::<f64>() < keep { 1.0 / keep } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, (batch_size, self.topo.heads), &self.device)?;

        Ok(TrainForward {
            output: product_of_heads(&gates.mul(&mask)?)?,
            batch_mean: mean.squeeze(0)?,
            batch_var: var.squeeze(0)?,
            batch_size,
        })
    }

    /// Fold a training batch's statistics into the running averages.
    ///
    /// The variance is rescaled by `n / (n - (1 + eps))` first, so the
    /// running value estimates the population variance.
    pub fn update_moving_stats(&mut self, step: &TrainForward) -> Result<()> {
        let n = step.batch_size as f64;
        let sample_var = step.batch_var.affine(n / (n - (1.0 + BN_EPSILON)), 0.0)?;
        self.moving_mean = self
            .moving_mean
            .affine(BN_MOMENTUM, 0.0)?
            .add(&step.batch_mean.affine(1.0 - BN_MOMENTUM, 0.0)?)?;
        self.moving_var = self
            .moving_var
            .affine(BN_MOMENTUM, 0.0)?
            .add(&sample_var.affine(1.0 - BN_MOMENTUM, 0.0)?)?;
        Ok(())
    }

    /// `[B, heads]` sigmoid outputs in inference mode.
    fn inference_gates(&self, locs: &[&[usize]], vals: &[&[f64]]) -> Result<Tensor> {
        let (ids, x) = self.batch_tensors(locs, vals)?;
        let std = self.moving_var.affine(1.0, BN_EPSILON)?.sqrt()?;
        let xhat = x.broadcast_sub(&self.moving_mean)?.broadcast_div(&std)?;
        self.gates(&ids, &xhat)
    }

    /// Scale and shift `xhat`, join it with the embeddings and run every head.
    fn gates(&self, ids: &Tensor, xhat: &Tensor) -> Result<Tensor> {
        let (batch, _) = xhat.dims2()?;
        let normd = xhat
            .broadcast_mul(&self.gamma)?
            .broadcast_add(&self.beta)?
            .unsqueeze(2)?;
        let embedded = self.embedding.forward(ids)?;
        let features = Tensor::cat(&[&embedded, &normd], 2)?
            .reshape((batch, self.topo.flat_width()))?;
        Ok(candle_nn::ops::sigmoid(&self.heads.forward(&features)?)?)
    }

    /// `[B, P]` location ids and values.
    fn batch_tensors(&self, locs: &[&[usize]], vals: &[&[f64]]) -> Result<(Tensor, Tensor)> {
        let shape = (locs.len(), self.topo.poscount);
        let ids: Vec<u32> = locs.iter().flat_map(|r| r.iter().map(|&i| i as u32)).collect();
        let x: Vec<f64> = vals.iter().flat_map(|r| r.iter().copied()).collect();
        Ok((
            Tensor::from_vec(ids, shape, &self.device)?,
            Tensor::from_vec(x, shape, &self.device)?,
        ))
    }
}

// ---------------------------------------------------------------------------
// Loss and helpers
// ---------------------------------------------------------------------------

/// `[B, heads] -> [B]` by multiplying the head columns together.
fn product_of_heads(gates: &Tensor) -> Result<Tensor> {
    let (_, heads) = gates.dims2()?;
    let mut out = gates.narrow(1, 0, 1)?;
    for i in 1..heads {
        out = out.mul(&gates.narrow(1, i, 1)?)?;
    }
    Ok(out.squeeze(1)?)
}

/// Mean squared error as a scalar tensor.
pub fn mse_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    Ok(pred.sub(target)?.sqr()?.mean_all()?)
}

/// Count of predictions on the right side of 0.5. A NaN prediction is never
/// a hit.
pub fn binary_hits(pred: &[f64], target: &[f64]) -> usize {
    pred.iter()
        .zip(target)
        .filter(|(y, t)| !y.is_nan() && (**y > 0.5) == (**t > 0.5))
        .count()
}

/// Factor that brings an L2 norm into `[min, max]`.
fn min_max_scale(norm: f64, min: f64, max: f64) -> f64 {
    norm.clamp(min, max) / (CONSTRAINT_EPSILON + norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn topo(heads: usize) -> Topology {
        Topology {
            poscount: 3,
            watermark: 4,
            heads,
        }
    }

    fn build(heads: usize, seed: u64) -> GateNet {
        GateNet::new(topo(heads), &mut ChaCha8Rng::seed_from_u64(seed)).unwrap()
    }

    fn sample_batch() -> (Vec<Vec<usize>>, Vec<Vec<f64>>, Vec<f64>) {
        let locs = vec![vec![1, 2, 0], vec![1, 3, 2], vec![2, 2, 3], vec![3, 1, 0]];
        let vals = vec![
            vec![0.5, -1.0, 0.0],
            vec![2.0, 0.25, 7.0],
            vec![-3.0, 1.5, 1.0],
            vec![1.0, 0.0, 0.0],
        ];
        let labels = vec![1.0, 0.0, 1.0, 0.0];
        (locs, vals, labels)
    }

    fn views<'a>(locs: &'a [Vec<usize>], vals: &'a [Vec<f64>]) -> (Vec<&'a [usize]>, Vec<&'a [f64]>) {
        (
            locs.iter().map(Vec::as_slice).collect(),
            vals.iter().map(Vec::as_slice).collect(),
        )
    }

    #[test]
    fn test_param_count() {
        let t = topo(2);
        let net = build(2, 1);
        let stored: usize = net.trainable_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(stored, t.param_count());
        assert_eq!(t.flat_width(), 15);
    }

    #[test]
    fn test_prediction_in_unit_interval() {
        let net = build(50, 5);
        let (locs, vals, _) = sample_batch();
        let (l, v) = views(&locs, &vals);
        for y in net.predict(&l, &v).unwrap() {
            assert!((0.0..=1.0).contains(&y), "prediction out of range: {y}");
        }
    }

    #[test]
    fn test_single_head_is_plain_sigmoid() {
        let net = build(1, 8);
        let (locs, vals, _) = sample_batch();
        let (l, v) = views(&locs, &vals);
        let preds = net.predict(&l, &v).unwrap();
        let gates = net.inference_gates(&l, &v).unwrap().to_vec2::<f64>().unwrap();
        for (p, row) in preds.iter().zip(&gates) {
            assert_eq!(row.len(), 1);
            assert!((p - row[0]).abs() < 1e-15);
        }
    }

    #[test]
    fn test_product_of_heads() {
        let net = build(4, 9);
        let (locs, vals, _) = sample_batch();
        let (l, v) = views(&locs, &vals);
        let preds = net.predict(&l, &v).unwrap();
        let gates = net.inference_gates(&l, &v).unwrap().to_vec2::<f64>().unwrap();
        for (p, row) in preds.iter().zip(&gates) {
            let expected: f64 = row.iter().product();
            assert!((p - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_gradients_reach_every_variable() {
        let net = build(3, 11);
        let (locs, vals, labels) = sample_batch();
        let (l, v) = views(&locs, &vals);
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let step = net.forward_train(&l, &v, &mut rng).unwrap();
        let target = Tensor::new(labels.as_slice(), net.device()).unwrap();
        let grads = mse_loss(&step.output, &target).unwrap().backward().unwrap();
        for var in net.trainable_vars() {
            assert!(grads.get(&var).is_some(), "no gradient for {:?}", var.shape());
        }
    }

    #[test]
    fn test_min_max_norm_constraint() {
        assert!((min_max_scale(5.0, 0.0, 1.0) * 5.0 - 1.0).abs() < 1e-6);
        assert!((min_max_scale(0.5, 0.0, 1.0) - 1.0).abs() < 1e-6);

        let mut net = build(2, 4);
        let gamma = Tensor::new(&[3.0f64, 4.0, 0.0], &Device::Cpu).unwrap();
        net.varmap.set_one(GAMMA, gamma).unwrap();
        net.apply_constraints().unwrap();
        let gamma = net.gamma.to_vec1::<f64>().unwrap();
        let norm = gamma.iter().map(|g| g * g).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((gamma[0] / gamma[1] - 0.75).abs() < 1e-12);
        // beta starts at zero and stays there.
        assert_eq!(net.beta.to_vec1::<f64>().unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn test_moving_stats_track_batch() {
        let mut net = build(2, 2);
        let (locs, vals, _) = sample_batch();
        let (l, v) = views(&locs, &vals);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let step = net.forward_train(&l, &v, &mut rng).unwrap();
        net.update_moving_stats(&step).unwrap();

        // Column 0 is [0.5, 2, -3, 1]: mean 0.125, squared deviations sum to 14.1875.
        let mean = net.moving_mean.to_vec1::<f64>().unwrap();
        assert!((mean[0] - 0.00125).abs() < 1e-12);
        let var = net.moving_var.to_vec1::<f64>().unwrap();
        let expected = 0.99 + 0.01 * 14.1875 / (4.0 - 1.001);
        assert!((var[0] - expected).abs() < 1e-12, "moving var {}", var[0]);
    }

    #[test]
    fn test_single_run_batch_keeps_moving_var_finite() {
        let mut net = build(2, 6);
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let step = net
            .forward_train(&[&[1, 2, 3][..]], &[&[4.0, -2.0, 0.5][..]], &mut rng)
            .unwrap();
        net.update_moving_stats(&step).unwrap();
        for v in net.moving_var.to_vec1::<f64>().unwrap() {
            assert!((v - 0.99).abs() < 1e-12, "moving var {v}");
        }
    }

    #[test]
    fn test_fingerprint_tracks_parameters() {
        let mut net = build(2, 3);
        let before = net.fingerprint().unwrap();
        assert_eq!(before, build(2, 3).fingerprint().unwrap());
        assert_ne!(before, build(2, 4).fingerprint().unwrap());

        let bias = Tensor::new(&[1.0f64, 0.0], &Device::Cpu).unwrap();
        net.varmap.set_one(HEADS_BIAS, bias).unwrap();
        assert_ne!(before, net.fingerprint().unwrap());
        assert!(before.starts_with("sha256:"));
    }

    #[test]
    fn test_mse_and_hits() {
        let dev = Device::Cpu;
        let pred = Tensor::new(&[1.0f64, 0.0], &dev).unwrap();
        let target = Tensor::new(&[0.0f64, 0.0], &dev).unwrap();
        let loss = mse_loss(&pred, &target).unwrap().to_scalar::<f64>().unwrap();
        assert!((loss - 0.5).abs() < 1e-12);
        assert_eq!(binary_hits(&[0.9, 0.4, 0.6], &[1.0, 0.0, 0.0]), 2);
    }

    #[test]
    fn test_nan_prediction_is_never_a_hit() {
        assert_eq!(binary_hits(&[f64::NAN, f64::NAN], &[0.0, 1.0]), 0);
        assert_eq!(binary_hits(&[f64::NAN, 0.1], &[0.0, 0.0]), 1);
    }
}
