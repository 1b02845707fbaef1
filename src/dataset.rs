//! Price series and the fixed-length training windows cut from it.

use crate::format::END_TIME_FORMAT;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use ndarray::{Array1, s};
use serde::Deserialize;
use std::path::Path;

// A step this much larger than the typical one is a hole in the data.
const GAP_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    /// Candle end, in seconds since the epoch.
    pub timestamp: f64,
    /// Mean of open, close, high and low.
    pub price: f64,
}

#[derive(Deserialize)]
struct DatasetRow {
    end_time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl DatasetRow {
    fn into_point(self) -> Result<PricePoint> {
        let end_time = NaiveDateTime::parse_from_str(&self.end_time, END_TIME_FORMAT)
            .with_context(|| format!("bad end_time {:?}", self.end_time))?
            .and_utc();
        Ok(PricePoint {
            timestamp: end_time.timestamp_millis() as f64 / 1000.0,
            price: (self.open + self.close + self.high + self.low) / 4.0,
        })
    }
}

/// One training example: `context_length` past points followed by
/// `prediction_length` future points. The only time feature is the timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingWindow {
    pub past_values: Array1<f64>,
    pub past_time_features: Array1<f64>,
    pub future_values: Array1<f64>,
    pub future_time_features: Array1<f64>,
}

pub fn parse_price_series(bytes: &[u8]) -> Result<Vec<PricePoint>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut points = Vec::new();
    for (idx, row) in reader.deserialize::<DatasetRow>().enumerate() {
        let row = row.with_context(|| format!("dataset row {}", idx + 1))?;
        points.push(row.into_point()?);
    }
    Ok(points)
}

pub fn load_price_series(path: &Path) -> Result<Vec<PricePoint>> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read dataset {}", path.display()))?;
    parse_price_series(&bytes)
}

/// Median spacing between consecutive timestamps, ignoring non-positive steps.
pub fn median_step(timestamps: &[f64]) -> Option<f64> {
    let mut steps: Vec<f64> = timestamps.windows(2).map(|w| w[1] - w[0]).filter(|d| *d > 0.0).collect();
    if steps.is_empty() {
        return None;
    }
    steps.sort_by(|a, b| a.total_cmp(b));
    Some(steps[steps.len() / 2])
}

/// Splits the series wherever time goes backwards, stands still, or jumps by
/// more than `GAP_FACTOR` times the median step.
pub fn contiguous_segments(points: &[PricePoint]) -> Vec<&[PricePoint]> {
    let times: Vec<f64> = points.iter().map(|p| p.timestamp).collect();
    let Some(step) = median_step(&times) else {
        return if points.is_empty() { Vec::new() } else { vec![points] };
    };

    let mut segments = Vec::new();
    let mut start = 0;
    for i in 1..points.len() {
        let delta = points[i].timestamp - points[i - 1].timestamp;
        if delta <= 0.0 || delta > step * GAP_FACTOR {
            segments.push(&points[start..i]);
            start = i;
        }
    }
    segments.push(&points[start..]);
    segments
}

/// Overlapping stride-1 windows over a contiguous series. A series of length
/// L yields `max(0, L - context_length - prediction_length + 1)` windows.
pub fn build_windows(points: &[PricePoint], context_length: usize, prediction_length: usize) -> Vec<TrainingWindow> {
    let size = context_length + prediction_length;
    if size == 0 || points.len() < size {
        return Vec::new();
    }

    let values: Array1<f64> = points.iter().map(|p| p.price).collect();
    let times: Array1<f64> = points.iter().map(|p| p.timestamp).collect();

    (0..=points.len() - size)
        .map(|i| {
            let split = i + context_length;
            let end = i + size;
            TrainingWindow {
                past_values: values.slice(s![i..split]).to_owned(),
                past_time_features: times.slice(s![i..split]).to_owned(),
                future_values: values.slice(s![split..end]).to_owned(),
                future_time_features: times.slice(s![split..end]).to_owned(),
            }
        })
        .collect()
}

/// Windows for every contiguous segment; none straddles a gap.
pub fn training_windows(points: &[PricePoint], context_length: usize, prediction_length: usize) -> Vec<TrainingWindow> {
    contiguous_segments(points)
        .into_iter()
        .flat_map(|segment| build_windows(segment, context_length, prediction_length))
        .collect()
}
