use crate::config::AppConfig;
use crate::dataset::{load_price_series, training_windows};
use crate::model::{Forecaster, WindowRegressor};
use crate::storage::AsyncStorageManager;
use anyhow::{Context, Result};
use tracing::info;

/// Reads the formatted dataset, fits a fresh [`WindowRegressor`] on it and
/// persists the result. Nothing is written unless fitting succeeds.
pub async fn run(config: &AppConfig) -> Result<WindowRegressor> {
    let dataset = config.paths.training_csv.clone();
    let model_config = config.model.clone();

    let (model, report) = tokio::task::spawn_blocking(move || -> Result<_> {
        let points = load_price_series(&dataset)?;
        let windows = training_windows(&points, model_config.context_length, model_config.prediction_length);
        info!(rows = points.len(), windows = windows.len(), "Prepared training windows");

        let mut model = WindowRegressor::new(&model_config);
        let report = model.fit(&windows).context("model fit failed")?;
        Ok((model, report))
    })
    .await
    .context("training task panicked")??;

    AsyncStorageManager::save_json(&config.paths.model_file, &model)
        .await
        .with_context(|| format!("cannot save model to {}", config.paths.model_file.display()))?;

    info!(
        windows = report.windows,
        epochs = report.epochs,
        loss = report.final_loss,
        path = %config.paths.model_file.display(),
        "Trained model saved"
    );
    Ok(model)
}
