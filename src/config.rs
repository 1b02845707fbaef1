use std::env;
use std::path::PathBuf;
use std::time::Duration;

// CONFIGURATION STRUCTS
// Built once at startup and handed to every component by reference.

#[derive(Debug, Clone)]
pub struct DataPaths {
    pub archive_dir: PathBuf,  // raw kline archives, one file per period
    pub training_csv: PathBuf, // formatted, time-sorted dataset
    pub model_file: PathBuf,   // persisted forecaster
}

#[derive(Debug, Clone)]
pub struct KlineConfig {
    pub base_url: String,       // e.g., "https://data.binance.vision"
    pub quote_asset: String,    // e.g., "USDT"
    pub intervals: Vec<String>, // e.g., "1d", "1h"
    pub years: Vec<i32>,
    pub months: Vec<u32>,
    pub daily_top_up: bool, // fetch the days of the current month as well
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub context_length: usize,
    pub prediction_length: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub cycle_delay: Duration,      // after every regular cycle
    pub skip_delay: Duration,       // after a "no data" / "no prediction" cycle
    pub forecast_horizon: Duration, // how far ahead the forecast targets
    pub http_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub inference_api_address: String,
    pub topic_id: String,
    pub paths: DataPaths,
    pub klines: KlineConfig,
    pub model: ModelConfig,
    pub schedule: ScheduleConfig,
}

pub const DEFAULT_INFERENCE_API_ADDRESS: &str = "http://inference:8000";
pub const DEFAULT_TOPIC_ID: &str = "1";

impl Default for DataPaths {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("/app/data/binance"),
            training_csv: PathBuf::from("/app/data/training_price_data.csv"),
            model_file: PathBuf::from("/app/model/price_prediction_model.json"),
        }
    }
}

impl DataPaths {
    /// Lays the three paths out under a single root, mirroring the default
    /// `/app` layout.
    pub fn under<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        Self {
            archive_dir: root.join("data").join("binance"),
            training_csv: root.join("data").join("training_price_data.csv"),
            model_file: root.join("model").join("price_prediction_model.json"),
        }
    }
}

impl Default for KlineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.binance.vision".to_string(),
            quote_asset: "USDT".to_string(),
            intervals: vec!["1d".to_string()],
            years: (2020..=2024).collect(),
            months: (1..=12).collect(),
            daily_top_up: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_length: 60,
            prediction_length: 10,
            epochs: 3,
            batch_size: 32,
            learning_rate: 0.01,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cycle_delay: Duration::from_secs(5),
            skip_delay: Duration::from_secs(10),
            forecast_horizon: Duration::from_secs(600),
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            inference_api_address: DEFAULT_INFERENCE_API_ADDRESS.to_string(),
            topic_id: DEFAULT_TOPIC_ID.to_string(),
            paths: DataPaths::default(),
            klines: KlineConfig::default(),
            model: ModelConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads `INFERENCE_API_ADDRESS` and `TOPIC_ID`; everything else keeps
    /// its built-in default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable lookup. Blank values count
    /// as unset.
    pub fn from_lookup<L>(lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let mut config = Self::default();
        if let Some(address) = get("INFERENCE_API_ADDRESS") {
            config.inference_api_address = address.trim_end_matches('/').to_string();
        }
        if let Some(topic_id) = get("TOPIC_ID") {
            config.topic_id = topic_id;
        }
        config
    }
}
