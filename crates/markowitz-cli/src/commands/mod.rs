pub mod data;
pub mod optimization;
pub mod portfolio;
pub mod statistics;
