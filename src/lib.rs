//! fuzzgate: learn to predict fuzzed test outcomes from their trace logs.
//!
//! A corpus directory holds one binary fuzzlog per fuzzed test run, named
//! `<n>.s` for runs that passed and `<n>.f` for runs that failed. fuzzgate
//! loads the corpus, lays every run out as aligned `(location, value)` rows,
//! and trains a gate network: N parallel sigmoid heads whose outputs are
//! multiplied. A product of independent gates is what the downstream solver
//! knows how to turn back into generator feedback. The network is built and
//! trained with candle (`candle-core`, `candle-nn`).
//!
//! Uses structured logging via [`tracing`]. Set the `RUST_LOG` environment
//! variable to control log verbosity (e.g., `RUST_LOG=fuzzgate=debug`).

pub mod config;
pub mod corpus;
pub mod fuzzlog;
pub mod model;
pub mod report;
pub mod train;
pub mod validate;

use eyre::{Result, WrapErr};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::config::TrainConfig;
use crate::corpus::Corpus;
use crate::model::{GateNet, Topology};
use crate::report::{CorpusSummary, RunReport};
use crate::train::Trainer;

/// Load the corpus named by `config`, build a fresh gate network, train it
/// and report.
///
/// The trained parameters only live for the duration of this call; the
/// report carries their fingerprint.
pub fn build_and_train(config: TrainConfig) -> Result<RunReport> {
    config.validate().wrap_err("invalid configuration")?;

    let corpus = Corpus::load(&config.data_dir)
        .wrap_err_with(|| format!("loading training corpus {}", config.data_dir.display()))?;
    let watermark = corpus.locidx.watermark();
    corpus.data.check_shape(corpus.poscount, watermark)?;

    let seed = config.seed.unwrap_or_else(rand::random);
    info!(seed, explicit = config.seed.is_some(), "rng seeded");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let topology = Topology {
        poscount: corpus.poscount,
        watermark,
        heads: config.heads,
    };
    let net = GateNet::new(topology, &mut rng).wrap_err("building gate network")?;
    info!(
        heads = topology.heads,
        poscount = topology.poscount,
        watermark = topology.watermark,
        params = topology.param_count(),
        "gate network built"
    );

    let mut trainer = Trainer::new(net, config.learning_rate, rng)?;
    let history = trainer.fit(&corpus.data, config.epochs, config.batch_size)?;
    let net = trainer.into_net();
    let (final_loss, final_acc) = train::evaluate(&net, &corpus.data)?;

    let validation = match &config.valn_dir {
        Some(dir) => validate::validate_dir(&net, &corpus, dir, config.threshold)
            .wrap_err_with(|| format!("validating against {}", dir.display()))?,
        None => None,
    };
    let predictions =
        validate::predict_files(&net, &corpus.locidx, &config.predict, config.threshold)?;

    Ok(RunReport {
        seed,
        corpus: CorpusSummary {
            runs: corpus.data.len(),
            poscount: corpus.poscount,
            locations: corpus.locidx.len(),
            watermark,
            success_rate: corpus.data.success_rate(),
        },
        topology,
        param_count: topology.param_count(),
        history,
        final_loss,
        final_acc,
        validation,
        predictions,
        fingerprint: net.fingerprint()?,
        config,
    })
}
