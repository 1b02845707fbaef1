//! Client for the external inference API that reports the current price of a
//! token.

use reqwest::{Client, StatusCode};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Maps a configured topic id to the asset it forecasts. Unknown ids fall
/// back to ETH.
pub fn token_for_topic(topic_id: &str) -> &'static str {
    match topic_id {
        "1" => "ETH",
        "3" => "BTC",
        "5" => "SOL",
        _ => "ETH",
    }
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("response body {body:?} is not a number")]
    Parse { body: String },
}

/// Anything able to report the current price of a token.
pub trait PriceSource {
    fn current_price(&self, token: &str) -> impl Future<Output = Result<f64, InferenceError>> + Send;
}

pub struct InferenceClient {
    client: Client,
    base_url: String,
}

impl InferenceClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, token: &str) -> String {
        format!("{}/inference/{}", self.base_url, token)
    }
}

impl PriceSource for InferenceClient {
    async fn current_price(&self, token: &str) -> Result<f64, InferenceError> {
        let url = self.url_for(token);
        let request_error = |source| InferenceError::Request {
            url: url.clone(),
            source,
        };

        let response = self.client.get(&url).send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Status { url: url.clone(), status });
        }

        let body = response.text().await.map_err(request_error)?;
        parse_price(&body)
    }
}

fn parse_price(body: &str) -> Result<f64, InferenceError> {
    body.trim()
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite())
        .ok_or_else(|| InferenceError::Parse {
            body: body.to_string(),
        })
}
