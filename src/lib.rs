//! Price forecasting worker: downloads kline archives, trains a windowed
//! forecaster once, then logs forecasts for the configured token forever.

pub mod config;
pub mod dataset;
pub mod format;
pub mod inference;
pub mod klines;
pub mod model;
pub mod pipeline;
pub mod predictor;
pub mod storage;
pub mod train;

pub use config::AppConfig;
pub use model::{Forecast, Forecaster, ModelError, WindowRegressor};
pub use pipeline::{PipelineError, prepare_model};
pub use predictor::{CycleFailure, CycleOutcome, LoopSummary, PredictionLoop};
