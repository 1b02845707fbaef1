//! The steady-state loop: fetch the current price, forecast, log, repeat.
//!
//! Nothing that happens inside a cycle stops the loop. Only the stop signal
//! does.

use crate::config::ScheduleConfig;
use crate::inference::PriceSource;
use crate::model::Forecaster;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub token: String,
    pub current_price: f64,
    pub target_timestamp: f64,
    pub forecast: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Logged(PredictionRecord),
    /// The inference API gave no usable price.
    NoData,
    /// The model could not produce a single finite value.
    NoPrediction,
    /// The cycle panicked.
    Failed(CycleFailure),
}

/// What a panicking cycle had got to before it unwound.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleFailure {
    pub message: String,
    pub current_price: Option<f64>,
    pub target_timestamp: Option<f64>,
}

/// Progress of the cycle in flight, kept outside the unwinding future.
#[derive(Debug, Default)]
struct CycleTrace {
    current_price: Option<f64>,
    target_timestamp: Option<f64>,
}

impl CycleOutcome {
    /// Skipped cycles back off longer than regular ones.
    pub fn delay(&self, schedule: &ScheduleConfig) -> Duration {
        match self {
            CycleOutcome::NoData | CycleOutcome::NoPrediction => schedule.skip_delay,
            CycleOutcome::Logged(_) | CycleOutcome::Failed(_) => schedule.cycle_delay,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
    pub cycles: usize,
    pub logged: usize,
    pub no_data: usize,
    pub no_prediction: usize,
    pub failed: usize,
}

impl LoopSummary {
    fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Logged(_) => self.logged += 1,
            CycleOutcome::NoData => self.no_data += 1,
            CycleOutcome::NoPrediction => self.no_prediction += 1,
            CycleOutcome::Failed(_) => self.failed += 1,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn unix_seconds_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct PredictionLoop<F, S> {
    model: F,
    source: S,
    token: String,
    schedule: ScheduleConfig,
}

impl<F: Forecaster, S: PriceSource> PredictionLoop<F, S> {
    pub fn new(model: F, source: S, token: impl Into<String>, schedule: ScheduleConfig) -> Self {
        Self {
            model,
            source,
            token: token.into(),
            schedule,
        }
    }

    pub fn model(&self) -> &F {
        &self.model
    }

    async fn cycle_body(&self, trace: &mut CycleTrace) -> CycleOutcome {
        info!("Starting a new cycle");

        let current_price = match self.source.current_price(&self.token).await {
            Ok(price) => price,
            Err(e) => {
                warn!(token = %self.token, "No data received, skipping cycle: {e}");
                return CycleOutcome::NoData;
            }
        };
        trace.current_price = Some(current_price);
        info!(token = %self.token, price = current_price, "Retrieved current price");

        let target_timestamp = unix_seconds_now() + self.schedule.forecast_horizon.as_secs_f64();
        trace.target_timestamp = Some(target_timestamp);
        let forecast = self
            .model
            .predict(&[target_timestamp])
            .and_then(f64::try_from);

        match forecast {
            Ok(forecast) => {
                info!(token = %self.token, forecast, target_timestamp, "Prediction for {}: {}", self.token, forecast);
                CycleOutcome::Logged(PredictionRecord {
                    token: self.token.clone(),
                    current_price,
                    target_timestamp,
                    forecast,
                })
            }
            Err(e) => {
                warn!(token = %self.token, "Prediction failed, skipping cycle: {e}");
                CycleOutcome::NoPrediction
            }
        }
    }

    /// Runs one cycle. A panic anywhere in the cycle is caught and reported
    /// as [`CycleOutcome::Failed`].
    pub async fn run_cycle(&self) -> CycleOutcome {
        let mut trace = CycleTrace::default();
        let result = AssertUnwindSafe(self.cycle_body(&mut trace)).catch_unwind().await;
        match result {
            Ok(outcome) => outcome,
            Err(payload) => {
                let failure = CycleFailure {
                    message: panic_message(payload.as_ref()),
                    current_price: trace.current_price,
                    target_timestamp: trace.target_timestamp,
                };
                error!(
                    token = %self.token,
                    current_price = ?failure.current_price,
                    target_timestamp = ?failure.target_timestamp,
                    forecast_horizon_secs = self.schedule.forecast_horizon.as_secs(),
                    "Error in prediction loop: {}",
                    failure.message
                );
                CycleOutcome::Failed(failure)
            }
        }
    }

    /// Cycles until `stop` turns true (or its sender goes away). Both the
    /// cycle and the pause after it are interrupted by the signal.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> LoopSummary {
        let mut summary = LoopSummary::default();
        info!(token = %self.token, "Prediction loop started");

        loop {
            if *stop.borrow() {
                break;
            }

            let outcome = tokio::select! {
                outcome = self.run_cycle() => outcome,
                _ = stop.changed() => break,
            };
            summary.record(&outcome);

            tokio::select! {
                _ = tokio::time::sleep(outcome.delay(&self.schedule)) => {}
                _ = stop.changed() => break,
            }
        }

        info!(
            cycles = summary.cycles,
            logged = summary.logged,
            skipped = summary.no_data + summary.no_prediction,
            failed = summary.failed,
            "Prediction loop stopped"
        );
        summary
    }
}
