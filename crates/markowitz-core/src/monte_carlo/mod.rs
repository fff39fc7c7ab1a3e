pub mod sampler;

pub use sampler::{MonteCarloSampler, PortfolioPopulation, SampledPortfolio};
