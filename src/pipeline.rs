//! This module contains the startup pipeline and hands over to the prediction loop.

use crate::config::AppConfig;
use crate::inference::{InferenceClient, token_for_topic};
use crate::model::WindowRegressor;
use crate::predictor::{LoopSummary, PredictionLoop};
use crate::storage::AsyncStorageManager;
use crate::{format, klines, train};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use std::path::Path;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no training data could be formatted from the downloaded archives")]
    NoTrainingData,

    #[error("stop requested before the model was ready")]
    Stopped,
}

fn ensure_running(stop: &watch::Receiver<bool>) -> Result<(), PipelineError> {
    if *stop.borrow() { Err(PipelineError::Stopped) } else { Ok(()) }
}

/// Resolves once `stop` is raised or its sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Only a missing file means "no model". Any other I/O error is fatal, so an
/// unreadable model is never trained over.
async fn model_is_persisted(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("cannot check model file {}", path.display()))
}

/// Brings the worker from UNINITIALIZED to MODEL_READY:
/// 1. Creates the data and model directories.
/// 2. If no model is persisted, downloads archives, formats them and trains.
/// 3. Loads the persisted model and checks it against the configuration.
///
/// A raised `stop` ends setup with [`PipelineError::Stopped`] before the next
/// download, the formatting step or training.
pub async fn prepare_model(
    config: &AppConfig,
    today: NaiveDate,
    stop: &watch::Receiver<bool>,
) -> Result<WindowRegressor> {
    let storage = AsyncStorageManager::prepare(&config.paths).await?;
    let model_file = &config.paths.model_file;

    if !model_is_persisted(model_file).await? {
        info!(path = %model_file.display(), "Model file not found, training a new model");

        // Step 1: Download Archives
        klines::run(config, &storage, today, stop).await?;
        ensure_running(stop)?;

        // Step 2: Format Data
        let format_config = config.clone();
        let formatted = tokio::task::spawn_blocking(move || format::run(&format_config))
            .await
            .context("formatting task panicked")??;
        if !formatted {
            error!("Failed to format data, exiting");
            return Err(PipelineError::NoTrainingData.into());
        }

        // Step 3: Train
        ensure_running(stop)?;
        train::run(config).await?;
    }

    let model: WindowRegressor = AsyncStorageManager::load_json(model_file)
        .await
        .with_context(|| format!("cannot load model from {}", model_file.display()))?;
    model.check_config(&config.model)?;

    info!(
        path = %model_file.display(),
        context_length = model.context_length(),
        prediction_length = model.prediction_length(),
        "Model loaded"
    );
    Ok(model)
}

/// Prepares the model, then runs the prediction loop until `stop` is raised.
/// A stop during setup abandons the step in flight and returns an empty
/// summary.
pub async fn run(config: &AppConfig, stop: watch::Receiver<bool>) -> Result<LoopSummary> {
    let mut watcher = stop.clone();
    let prepared = tokio::select! {
        prepared = prepare_model(config, Utc::now().date_naive(), &stop) => prepared,
        _ = stop_requested(&mut watcher) => Err(PipelineError::Stopped.into()),
    };
    let model = match prepared {
        Ok(model) => model,
        Err(e) if matches!(e.downcast_ref::<PipelineError>(), Some(PipelineError::Stopped)) => {
            info!("Stop requested during startup, exiting");
            return Ok(LoopSummary::default());
        }
        Err(e) => return Err(e),
    };

    let client = InferenceClient::new(&config.inference_api_address, config.schedule.http_timeout)?;
    let token = token_for_topic(&config.topic_id);
    let prediction_loop = PredictionLoop::new(model, client, token, config.schedule.clone());

    Ok(prediction_loop.run(stop).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_model_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!model_is_persisted(&dir.path().join("model.json")).await.unwrap());
    }

    #[tokio::test]
    async fn unreadable_model_path_is_an_error_not_absence() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"not a directory").unwrap();

        // Looking up a file below a regular file fails with ENOTDIR.
        assert!(model_is_persisted(&plain.join("model.json")).await.is_err());
    }

    #[test]
    fn raised_stop_halts_setup() {
        let (tx, rx) = watch::channel(false);
        assert!(ensure_running(&rx).is_ok());
        tx.send(true).unwrap();
        assert!(matches!(ensure_running(&rx), Err(PipelineError::Stopped)));
    }
}
