use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SamplerConfig;
use crate::error::MarkowitzError;
use crate::portfolio::{PortfolioEvaluator, PortfolioMetrics};
use crate::statistics::Statistics;
use crate::MarkowitzResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One random allocation and its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledPortfolio {
    pub weights: Vec<f64>,
    pub metrics: PortfolioMetrics,
}

/// Random allocations in draw order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPopulation {
    pub portfolios: Vec<SampledPortfolio>,
    /// Draws requested, including rejected ones.
    pub requested: usize,
    /// Draws discarded because evaluation failed.
    pub rejected: usize,
    pub seed: Option<u64>,
    pub workers: usize,
}

impl PortfolioPopulation {
    pub fn len(&self) -> usize {
        self.portfolios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.portfolios.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SampledPortfolio> {
        self.portfolios.iter()
    }

    /// Highest Sharpe ratio among non-degenerate samples.
    pub fn max_sharpe(&self) -> Option<&SampledPortfolio> {
        self.portfolios
            .iter()
            .filter(|p| !p.metrics.degenerate)
            .max_by(|a, b| a.metrics.sharpe_ratio.total_cmp(&b.metrics.sharpe_ratio))
    }

    /// Lowest volatility sample.
    pub fn min_volatility(&self) -> Option<&SampledPortfolio> {
        self.portfolios
            .iter()
            .min_by(|a, b| a.metrics.volatility.total_cmp(&b.metrics.volatility))
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Draws long-only, fully invested allocations uniformly at random.
///
/// Each draw takes n uniform[0, 1) values and divides by their sum. The only
/// constraints are non-negativity and sum-to-one, so a single asset can carry
/// almost all the weight; the optimizer's per-asset box bounds do not apply
/// here.
#[derive(Debug, Clone)]
pub struct MonteCarloSampler {
    config: SamplerConfig,
    evaluator: PortfolioEvaluator,
}

impl MonteCarloSampler {
    pub fn new(config: &SamplerConfig, evaluator: PortfolioEvaluator) -> Self {
        MonteCarloSampler {
            config: config.clone(),
            evaluator,
        }
    }

    /// Draw and score `count` allocations.
    ///
    /// With a seed the population is reproducible bit for bit for a given
    /// worker count: draws are split into contiguous chunks, one per worker,
    /// each with its own stream seeded from a master stream.
    pub fn sample(&self, stats: &Statistics, count: usize) -> MarkowitzResult<PortfolioPopulation> {
        if count == 0 {
            return Err(MarkowitzError::InvalidInput {
                field: "count".into(),
                reason: "Must be at least 1".into(),
            });
        }
        if self.config.workers == 0 {
            return Err(MarkowitzError::InvalidInput {
                field: "workers".into(),
                reason: "Must be at least 1".into(),
            });
        }
        let n = stats.num_assets();
        if n == 0 {
            return Err(MarkowitzError::InsufficientData(
                "At least one asset required".into(),
            ));
        }
        stats.check_dimensions()?;

        let mut master = match self.config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let workers = self.config.workers.min(count);
        let chunks: Vec<(usize, u64)> = partition(count, workers)
            .into_iter()
            .map(|size| (size, master.gen::<u64>()))
            .collect();

        let run_chunk = |&(size, seed): &(usize, u64)| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut accepted = Vec::with_capacity(size);
            let mut rejected = 0usize;
            for _ in 0..size {
                let weights = draw_weights(&mut rng, n);
                match self.evaluator.evaluate(&weights, stats) {
                    Ok(metrics) => accepted.push(SampledPortfolio { weights, metrics }),
                    Err(e) => {
                        debug!(error = %e, "discarding sample");
                        rejected += 1;
                    }
                }
            }
            (accepted, rejected)
        };

        let results: Vec<(Vec<SampledPortfolio>, usize)> = if workers > 1 {
            chunks.par_iter().map(run_chunk).collect()
        } else {
            chunks.iter().map(run_chunk).collect()
        };

        let mut portfolios = Vec::with_capacity(count);
        let mut rejected = 0usize;
        for (accepted, r) in results {
            portfolios.extend(accepted);
            rejected += r;
        }

        if rejected > 0 {
            warn!(
                rejected,
                requested = count,
                "samples rejected during evaluation"
            );
        }
        debug!(
            accepted = portfolios.len(),
            workers,
            "sampled random portfolios"
        );

        Ok(PortfolioPopulation {
            portfolios,
            requested: count,
            rejected,
            seed: self.config.seed,
            workers,
        })
    }
}

/// Split `count` into `workers` contiguous chunk sizes, larger chunks first.
fn partition(count: usize, workers: usize) -> Vec<usize> {
    let base = count / workers;
    let extra = count % workers;
    (0..workers).map(|i| base + usize::from(i < extra)).collect()
}

/// Uniform draws normalised by their sum.
pub(crate) fn draw_weights(rng: &mut StdRng, n: usize) -> Vec<f64> {
    loop {
        let raw: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
        let total: f64 = raw.iter().sum();
        if total > 0.0 {
            return raw.into_iter().map(|x| x / total).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::validate_weights;
    use pretty_assertions::assert_eq;

    const SEED: u64 = 42;

    fn three_asset() -> Statistics {
        Statistics::from_parts(
            vec!["A".into(), "B".into(), "C".into()],
            vec![0.08, 0.12, 0.15],
            vec![
                vec![0.04, 0.006, 0.002],
                vec![0.006, 0.09, 0.01],
                vec![0.002, 0.01, 0.16],
            ],
        )
        .unwrap()
    }

    fn sampler(seed: Option<u64>, workers: usize) -> MonteCarloSampler {
        let cfg = SamplerConfig {
            count: 1_000,
            seed,
            workers,
        };
        MonteCarloSampler::new(&cfg, PortfolioEvaluator::default())
    }

    #[test]
    fn test_weights_valid() {
        let pop = sampler(Some(SEED), 1)
            .sample(&three_asset(), 2_000)
            .unwrap();
        assert_eq!(pop.len(), 2_000);
        for p in pop.iter() {
            assert!(validate_weights(&p.weights, 3).is_ok());
            let total: f64 = p.weights.iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert!(p.weights.iter().all(|w| (0.0..=1.0).contains(w)));
        }
    }

    #[test]
    fn test_seeded_reproducibility() {
        let a = sampler(Some(SEED), 1).sample(&three_asset(), 500).unwrap();
        let b = sampler(Some(SEED), 1).sample(&three_asset(), 500).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = sampler(Some(1), 1).sample(&three_asset(), 50).unwrap();
        let b = sampler(Some(2), 1).sample(&three_asset(), 50).unwrap();
        assert_ne!(a.portfolios, b.portfolios);
    }

    #[test]
    fn test_parallel_reproducibility() {
        let a = sampler(Some(SEED), 4)
            .sample(&three_asset(), 1_001)
            .unwrap();
        let b = sampler(Some(SEED), 4)
            .sample(&three_asset(), 1_001)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1_001);
        assert_eq!(a.workers, 4);
    }

    #[test]
    fn test_workers_capped_by_count() {
        let pop = sampler(Some(SEED), 8).sample(&three_asset(), 3).unwrap();
        assert_eq!(pop.workers, 3);
        assert_eq!(pop.len(), 3);
    }

    #[test]
    fn test_no_rejections_when_well_conditioned() {
        let stats = three_asset();
        assert!(!stats.conditioning.singular);
        let pop = sampler(Some(SEED), 2).sample(&stats, 5_000).unwrap();
        assert_eq!(pop.rejected, 0);
        assert_eq!(pop.requested, 5_000);
    }

    #[test]
    fn test_failed_evaluations_are_tallied() {
        // Indefinite matrix: balanced portfolios have negative variance.
        let stats = Statistics::from_parts(
            vec!["A".into(), "B".into()],
            vec![0.1, 0.1],
            vec![vec![0.05, -0.10], vec![-0.10, 0.05]],
        )
        .unwrap();
        let pop = sampler(Some(SEED), 1).sample(&stats, 1_000).unwrap();
        assert!(pop.rejected > 0);
        assert!(!pop.is_empty());
        assert_eq!(pop.rejected + pop.len(), 1_000);
    }

    #[test]
    fn test_single_asset_full_weight() {
        let stats = Statistics::from_parts(vec!["A".into()], vec![0.1], vec![vec![0.04]]).unwrap();
        let pop = sampler(Some(SEED), 1).sample(&stats, 10).unwrap();
        assert!(pop.iter().all(|p| p.weights == vec![1.0]));
    }

    #[test]
    fn test_mismatched_statistics_rejected() {
        let mut stats = three_asset();
        stats.covariance.pop();
        let res = sampler(Some(SEED), 1).sample(&stats, 10);
        assert!(matches!(res, Err(MarkowitzError::InvalidInput { .. })));
    }

    #[test]
    fn test_zero_count_rejected() {
        assert!(sampler(Some(SEED), 1).sample(&three_asset(), 0).is_err());
    }

    #[test]
    fn test_selection_helpers() {
        let pop = sampler(Some(SEED), 1)
            .sample(&three_asset(), 1_000)
            .unwrap();
        let best = pop.max_sharpe().unwrap().metrics.sharpe_ratio;
        let safest = pop.min_volatility().unwrap().metrics.volatility;
        assert!(pop.iter().all(|p| p.metrics.sharpe_ratio <= best));
        assert!(pop.iter().all(|p| p.metrics.volatility >= safest));
    }

    #[test]
    fn test_partition() {
        assert_eq!(partition(10, 3), vec![4, 3, 3]);
        assert_eq!(partition(9, 3), vec![3, 3, 3]);
        assert_eq!(partition(5, 1), vec![5]);
    }
}
