//! Mini-batch training loop.

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use eyre::{Result, WrapErr};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::corpus::Dataset;
use crate::model::{binary_hits, mse_loss, GateNet};

/// Keras' Adam defaults; weight decay stays off so AdamW reduces to Adam.
const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-7;

/// Loss and accuracy of one pass over the data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    /// Sample-weighted mean of batch losses.
    pub loss: f64,
    pub acc: f64,
    pub batches: usize,
}

/// Owns the network, its optimizer and the RNG driving shuffles and dropout.
pub struct Trainer {
    net: GateNet,
    optimizer: AdamW,
    rng: ChaCha8Rng,
}

impl Trainer {
    pub fn new(net: GateNet, learning_rate: f64, rng: ChaCha8Rng) -> Result<Self> {
        let optimizer = AdamW::new(
            net.trainable_vars(),
            ParamsAdamW {
                lr: learning_rate,
                beta1: ADAM_BETA1,
                beta2: ADAM_BETA2,
                eps: ADAM_EPSILON,
                weight_decay: 0.0,
            },
        )
        .wrap_err("creating optimizer")?;
        Ok(Self {
            net,
            optimizer,
            rng,
        })
    }

    /// Convenience constructor seeding its own RNG.
    pub fn with_seed(net: GateNet, learning_rate: f64, seed: u64) -> Result<Self> {
        Self::new(net, learning_rate, ChaCha8Rng::seed_from_u64(seed))
    }

    pub fn net(&self) -> &GateNet {
        &self.net
    }

    pub fn into_net(self) -> GateNet {
        self.net
    }

    /// Train for `epochs` passes over `data` in shuffled batches of `batch_size`.
    ///
    /// Non-finite losses are reported but do not stop training.
    pub fn fit(
        &mut self,
        data: &Dataset,
        epochs: usize,
        batch_size: usize,
    ) -> Result<Vec<EpochStats>> {
        let batch_size = batch_size.max(1);
        let mut order: Vec<usize> = (0..data.len()).collect();
        let mut history = Vec::with_capacity(epochs);

        for epoch in 1..=epochs {
            order.shuffle(&mut self.rng);
            let mut loss_sum = 0.0;
            let mut hits = 0usize;
            let mut batches = 0usize;

            for chunk in order.chunks(batch_size) {
                let (loss, batch_hits) = self
                    .train_batch(data, chunk)
                    .wrap_err_with(|| format!("epoch {epoch}, batch {}", batches + 1))?;
                loss_sum += loss * chunk.len() as f64;
                hits += batch_hits;
                batches += 1;
                debug!(epoch, batch = batches, loss, "batch done");
            }

            let n = data.len().max(1) as f64;
            let stats = EpochStats {
                epoch,
                loss: loss_sum / n,
                acc: hits as f64 / n,
                batches,
            };
            if stats.loss.is_finite() {
                info!(epoch, epochs, loss = stats.loss, acc = stats.acc, "epoch done");
            } else {
                warn!(
                    epoch,
                    epochs,
                    loss = stats.loss,
                    batch_size,
                    "non-finite loss; smaller batches usually avoid this"
                );
            }
            history.push(stats);
        }
        Ok(history)
    }

    /// One forward/backward/update step. Returns batch loss and hit count.
    fn train_batch(&mut self, data: &Dataset, rows: &[usize]) -> Result<(f64, usize)> {
        let locs: Vec<&[usize]> = rows.iter().map(|&r| data.locs[r].as_slice()).collect();
        let vals: Vec<&[f64]> = rows.iter().map(|&r| data.vals[r].as_slice()).collect();
        let target: Vec<f64> = rows
            .iter()
            .map(|&r| if data.labels[r] { 1.0 } else { 0.0 })
            .collect();

        let step = self.net.forward_train(&locs, &vals, &mut self.rng)?;
        let target_t = Tensor::new(target.as_slice(), self.net.device())?;
        let loss = mse_loss(&step.output, &target_t)?;
        let hits = binary_hits(&step.output.to_vec1::<f64>()?, &target);

        self.optimizer.backward_step(&loss)?;
        self.net.apply_constraints()?;
        self.net.update_moving_stats(&step)?;
        Ok((loss.to_scalar::<f64>()?, hits))
    }
}

/// Loss and accuracy of `net` in inference mode.
pub fn evaluate(net: &GateNet, data: &Dataset) -> Result<(f64, f64)> {
    if data.is_empty() {
        return Ok((0.0, 0.0));
    }
    let locs: Vec<&[usize]> = data.locs.iter().map(Vec::as_slice).collect();
    let vals: Vec<&[f64]> = data.vals.iter().map(Vec::as_slice).collect();
    let target: Vec<f64> = data.labels.iter().map(|&l| if l { 1.0 } else { 0.0 }).collect();
    let pred = net.predict(&locs, &vals)?;
    let loss = mse_loss(
        &Tensor::new(pred.as_slice(), net.device())?,
        &Tensor::new(target.as_slice(), net.device())?,
    )?
    .to_scalar::<f64>()?;
    Ok((loss, binary_hits(&pred, &target) as f64 / data.len() as f64))
}
