//! Forecasting model seam and the default windowed linear forecaster.
//!
//! The prediction loop and the trainer only talk to [`Forecaster`]. The shape
//! of whatever a model returns is resolved once, by converting a [`Forecast`]
//! into an `f64`.

use crate::config::ModelConfig;
use crate::dataset::{TrainingWindow, median_step};
use ndarray::{Array1, Array2, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of time features a window carries (the timestamp).
pub const NUM_TIME_FEATURES: usize = 1;

#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
    #[error("need at least one training window, got none")]
    NotEnoughWindows,

    #[error("window {index}: expected {expected} values, got {got}")]
    ShapeMismatch { index: usize, expected: usize, got: usize },

    #[error("model has not been fitted yet")]
    NotFitted,

    #[error("forecast is empty")]
    EmptyForecast,

    #[error("forecast value {0} is not finite")]
    NonFinite(f64),

    #[error("training diverged at epoch {epoch}")]
    Diverged { epoch: usize },

    #[error("persisted model expects context {found_context}/prediction {found_prediction}, configured {context}/{prediction}")]
    ConfigMismatch {
        context: usize,
        prediction: usize,
        found_context: usize,
        found_prediction: usize,
    },

    #[error("persisted {field} has shape {found:?}, expected {expected:?}")]
    CorruptState {
        field: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Raw model output. Models may answer with a scalar, an array or a list.
#[derive(Debug, Clone, PartialEq)]
pub enum Forecast {
    Scalar(f64),
    Array(Array1<f64>),
    List(Vec<f64>),
}

impl TryFrom<Forecast> for f64 {
    type Error = ModelError;

    /// Single-element arrays give their element; longer arrays and lists give
    /// their first element.
    fn try_from(forecast: Forecast) -> Result<Self, Self::Error> {
        let value = match forecast {
            Forecast::Scalar(v) => v,
            Forecast::Array(a) => *a.first().ok_or(ModelError::EmptyForecast)?,
            Forecast::List(l) => *l.first().ok_or(ModelError::EmptyForecast)?,
        };
        if value.is_finite() { Ok(value) } else { Err(ModelError::NonFinite(value)) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    pub windows: usize,
    pub epochs: usize,
    pub final_loss: f64,
}

pub trait Forecaster {
    fn fit(&mut self, windows: &[TrainingWindow]) -> Result<FitReport, ModelError>;

    /// One forecast value per requested timestamp (seconds since the epoch).
    fn predict(&self, timestamps: &[f64]) -> Result<Forecast, ModelError>;
}

/// What the fitted model remembers about the end of its training series, so
/// it can forecast from a timestamp alone.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ForecastContext {
    pub recent_prices: Array1<f64>,
    pub last_timestamp: f64,
    pub step_seconds: f64,
}

/// Direct multi-horizon linear model over a window of past prices.
///
/// Prices are scaled by the last observed price, so the model learns relative
/// moves. Weights start at zero, which forecasts "no change".
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WindowRegressor {
    context_length: usize,
    prediction_length: usize,
    num_time_features: usize,
    epochs: usize,
    batch_size: usize,
    learning_rate: f64,
    weights: Array2<f64>,
    bias: Array1<f64>,
    context: Option<ForecastContext>,
}

impl WindowRegressor {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            context_length: config.context_length,
            prediction_length: config.prediction_length,
            num_time_features: NUM_TIME_FEATURES,
            epochs: config.epochs,
            batch_size: config.batch_size.max(1),
            learning_rate: config.learning_rate,
            weights: Array2::zeros((config.prediction_length, config.context_length)),
            bias: Array1::zeros(config.prediction_length),
            context: None,
        }
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn prediction_length(&self) -> usize {
        self.prediction_length
    }

    pub fn forecast_context(&self) -> Option<&ForecastContext> {
        self.context.as_ref()
    }

    /// Rejects a persisted model built with different window sizes, or whose
    /// arrays do not agree with those sizes.
    pub fn check_config(&self, config: &ModelConfig) -> Result<(), ModelError> {
        if self.context_length != config.context_length || self.prediction_length != config.prediction_length {
            return Err(ModelError::ConfigMismatch {
                context: config.context_length,
                prediction: config.prediction_length,
                found_context: self.context_length,
                found_prediction: self.prediction_length,
            });
        }

        let mut shapes = vec![
            ("weights", vec![self.prediction_length, self.context_length], self.weights.shape().to_vec()),
            ("bias", vec![self.prediction_length], self.bias.shape().to_vec()),
        ];
        if let Some(ctx) = &self.context {
            shapes.push(("recent_prices", vec![self.context_length], ctx.recent_prices.shape().to_vec()));
        }
        for (field, expected, found) in shapes {
            if expected != found {
                return Err(ModelError::CorruptState { field, expected, found });
            }
        }
        Ok(())
    }

    fn check_window(&self, index: usize, w: &TrainingWindow) -> Result<(), ModelError> {
        let checks = [
            (w.past_values.len(), self.context_length),
            (w.past_time_features.len(), self.context_length * self.num_time_features),
            (w.future_values.len(), self.prediction_length),
            (w.future_time_features.len(), self.prediction_length * self.num_time_features),
        ];
        for (got, expected) in checks {
            if got != expected {
                return Err(ModelError::ShapeMismatch { index, expected, got });
            }
        }
        Ok(())
    }

    /// Scaled design matrix and targets. Windows ending on a non-positive
    /// price cannot be scaled and are left out.
    fn design(&self, windows: &[TrainingWindow]) -> (Array2<f64>, Array2<f64>) {
        let usable: Vec<&TrainingWindow> = windows
            .iter()
            .filter(|w| w.past_values.last().is_some_and(|p| *p > 0.0))
            .collect();

        let mut x = Array2::zeros((usable.len(), self.context_length));
        let mut y = Array2::zeros((usable.len(), self.prediction_length));
        for (row, w) in usable.iter().enumerate() {
            let anchor = w.past_values[self.context_length - 1];
            x.row_mut(row).assign(&(&w.past_values / anchor - 1.0));
            y.row_mut(row).assign(&(&w.future_values / anchor - 1.0));
        }
        (x, y)
    }

    fn horizon(&self, ctx: &ForecastContext) -> Array1<f64> {
        let anchor = ctx.recent_prices[self.context_length - 1];
        let x = &ctx.recent_prices / anchor - 1.0;
        (self.weights.dot(&x) + &self.bias + 1.0) * anchor
    }

    fn step_for(&self, ctx: &ForecastContext, timestamp: f64) -> usize {
        let ahead = ((timestamp - ctx.last_timestamp) / ctx.step_seconds).ceil();
        if ahead.is_finite() {
            (ahead.max(1.0) as usize).min(self.prediction_length)
        } else {
            1
        }
    }
}

fn tail_context(last: &TrainingWindow, context_length: usize) -> ForecastContext {
    let prices = ndarray::concatenate(Axis(0), &[last.past_values.view(), last.future_values.view()])
        .unwrap_or_else(|_| last.past_values.clone());
    let times: Vec<f64> = last
        .past_time_features
        .iter()
        .chain(last.future_time_features.iter())
        .copied()
        .collect();

    let start = prices.len() - context_length;

    ForecastContext {
        recent_prices: prices.slice(s![start..]).to_owned(),
        last_timestamp: times[times.len() - 1],
        step_seconds: median_step(&times).unwrap_or(1.0),
    }
}

impl Forecaster for WindowRegressor {
    fn fit(&mut self, windows: &[TrainingWindow]) -> Result<FitReport, ModelError> {
        if windows.is_empty() || self.context_length == 0 || self.prediction_length == 0 {
            return Err(ModelError::NotEnoughWindows);
        }
        for (index, w) in windows.iter().enumerate() {
            self.check_window(index, w)?;
        }

        let (x, y) = self.design(windows);
        if x.nrows() == 0 {
            return Err(ModelError::NotEnoughWindows);
        }

        let mut final_loss = f64::NAN;
        for epoch in 0..self.epochs {
            let mut loss_sum = 0.0;
            let mut start = 0;
            while start < x.nrows() {
                let end = (start + self.batch_size).min(x.nrows());
                let xb = x.slice(s![start..end, ..]);
                let yb = y.slice(s![start..end, ..]);
                let m = (end - start) as f64;

                let err = xb.dot(&self.weights.t()) + &self.bias - &yb;
                let grad_w = err.t().dot(&xb) * (2.0 / m);
                let grad_b = err.sum_axis(Axis(0)) * (2.0 / m);

                self.weights.scaled_add(-self.learning_rate, &grad_w);
                self.bias.scaled_add(-self.learning_rate, &grad_b);

                loss_sum += err.mapv(|e| e * e).sum();
                start = end;
            }

            final_loss = loss_sum / (x.nrows() * self.prediction_length) as f64;
            if !final_loss.is_finite() {
                return Err(ModelError::Diverged { epoch });
            }
        }

        // `windows` is non-empty, checked above.
        let last = &windows[windows.len() - 1];
        self.context = Some(tail_context(last, self.context_length));

        Ok(FitReport {
            windows: x.nrows(),
            epochs: self.epochs,
            final_loss,
        })
    }

    fn predict(&self, timestamps: &[f64]) -> Result<Forecast, ModelError> {
        let ctx = self.context.as_ref().ok_or(ModelError::NotFitted)?;
        let horizon = self.horizon(ctx);
        let values: Array1<f64> = timestamps.iter().map(|&t| horizon[self.step_for(ctx, t) - 1]).collect();
        Ok(Forecast::Array(values))
    }
}
