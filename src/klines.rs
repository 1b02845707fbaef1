use crate::config::AppConfig;
use crate::inference::token_for_topic;
use crate::storage::AsyncStorageManager;
use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use reqwest::Client;
use std::sync::LazyLock;
use tokio::sync::watch;
use tracing::{error, info};

static ARCHIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<symbol>[A-Z0-9]+)-(?P<interval>\d+[smhdwM])-(?P<year>\d{4})-(?P<month>\d{2})(?:-(?P<day>\d{2}))?\.zip$")
        .expect("archive name pattern is valid")
});

/// One archive's worth of time: a whole month, or a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Month { year: i32, month: u32 },
    Day(NaiveDate),
}

impl Period {
    fn granularity(&self) -> &'static str {
        match self {
            Period::Month { .. } => "monthly",
            Period::Day(_) => "daily",
        }
    }
}

pub fn archive_file_name(symbol: &str, interval: &str, period: Period) -> String {
    match period {
        Period::Month { year, month } => format!("{symbol}-{interval}-{year}-{month:02}.zip"),
        Period::Day(date) => format!("{symbol}-{interval}-{}.zip", date.format("%Y-%m-%d")),
    }
}

pub fn archive_url(base_url: &str, symbol: &str, interval: &str, period: Period) -> String {
    format!(
        "{}/data/spot/{}/klines/{symbol}/{interval}/{}",
        base_url.trim_end_matches('/'),
        period.granularity(),
        archive_file_name(symbol, interval, period)
    )
}

/// Symbol and interval recovered from an archive file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub symbol: String,
    pub interval: String,
}

impl ArchiveName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = ARCHIVE_NAME.captures(file_name)?;
        Some(Self {
            symbol: caps["symbol"].to_string(),
            interval: caps["interval"].to_string(),
        })
    }
}

pub fn monthly_periods(years: &[i32], months: &[u32]) -> Vec<Period> {
    years
        .iter()
        .flat_map(|&year| months.iter().map(move |&month| Period::Month { year, month }))
        .collect()
}

/// Days of `today`'s month that have already closed. Today's archive is not
/// published yet.
pub fn daily_periods(today: NaiveDate) -> Vec<Period> {
    (1..today.day())
        .filter_map(|day| today.with_day(day))
        .map(Period::Day)
        .collect()
}

pub fn training_symbol(config: &AppConfig) -> String {
    format!("{}{}", token_for_topic(&config.topic_id), config.klines.quote_asset)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub failed: usize,
}

impl DownloadReport {
    fn merge(&mut self, other: DownloadReport) {
        self.downloaded += other.downloaded;
        self.failed += other.failed;
    }
}

async fn fetch_archive(client: &Client, url: &str) -> Result<Vec<u8>> {
    let response = client.get(url).send().await?.error_for_status()?;
    // The whole body is buffered before anything touches the disk, so a
    // broken transfer never leaves a partial file behind.
    let body = response.bytes().await?;
    Ok(body.to_vec())
}

/// Downloads one archive per (symbol, interval, period), sequentially. A
/// failed request is logged and skipped; it never aborts the run. Once `stop`
/// is raised no further request is started.
pub async fn download_archives(
    client: &Client,
    storage: &AsyncStorageManager,
    base_url: &str,
    symbols: &[String],
    intervals: &[String],
    periods: &[Period],
    stop: &watch::Receiver<bool>,
) -> DownloadReport {
    let mut report = DownloadReport::default();

    for symbol in symbols {
        for interval in intervals {
            for &period in periods {
                if *stop.borrow() {
                    info!(downloaded = report.downloaded, "Stop requested, skipping remaining downloads");
                    return report;
                }

                let file_name = archive_file_name(symbol, interval, period);
                let url = archive_url(base_url, symbol, interval, period);

                let outcome = match fetch_archive(client, &url).await {
                    Ok(bytes) => storage.save_archive(&file_name, &bytes).await.map(|_| ()),
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(()) => {
                        report.downloaded += 1;
                        info!(file = %file_name, "Downloaded archive");
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(file = %file_name, url = %url, "Failed to download: {e:#}");
                    }
                }
            }
        }
    }

    report
}

/// Fetches the monthly history and, when enabled, the closed days of the
/// current month for the configured token.
pub async fn run(
    config: &AppConfig,
    storage: &AsyncStorageManager,
    today: NaiveDate,
    stop: &watch::Receiver<bool>,
) -> Result<DownloadReport> {
    let client = Client::builder().timeout(config.schedule.http_timeout).build()?;
    let symbols = vec![training_symbol(config)];
    let klines = &config.klines;

    let monthly = monthly_periods(&klines.years, &klines.months);
    let mut report =
        download_archives(&client, storage, &klines.base_url, &symbols, &klines.intervals, &monthly, stop).await;
    info!(
        downloaded = report.downloaded,
        failed = report.failed,
        dir = %storage.archive_dir.display(),
        "Finished monthly downloads"
    );

    if klines.daily_top_up && !*stop.borrow() {
        let daily = daily_periods(today);
        let daily_report =
            download_archives(&client, storage, &klines.base_url, &symbols, &klines.intervals, &daily, stop).await;
        info!(
            downloaded = daily_report.downloaded,
            failed = daily_report.failed,
            month = %today.format("%Y-%m"),
            "Finished daily downloads"
        );
        report.merge(daily_report);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_follow_the_template() {
        let month = Period::Month { year: 2024, month: 3 };
        assert_eq!(archive_file_name("ETHUSDT", "1d", month), "ETHUSDT-1d-2024-03.zip");

        let day = Period::Day(NaiveDate::from_ymd_opt(2025, 7, 9).unwrap());
        assert_eq!(archive_file_name("BTCUSDT", "1h", day), "BTCUSDT-1h-2025-07-09.zip");
    }

    #[test]
    fn urls_use_the_granularity_path() {
        let month = Period::Month { year: 2021, month: 12 };
        assert_eq!(
            archive_url("https://data.binance.vision/", "ETHUSDT", "1d", month),
            "https://data.binance.vision/data/spot/monthly/klines/ETHUSDT/1d/ETHUSDT-1d-2021-12.zip"
        );

        let day = Period::Day(NaiveDate::from_ymd_opt(2025, 1, 31).unwrap());
        assert_eq!(
            archive_url("https://data.binance.vision", "SOLUSDT", "1h", day),
            "https://data.binance.vision/data/spot/daily/klines/SOLUSDT/1h/SOLUSDT-1h-2025-01-31.zip"
        );
    }

    #[test]
    fn archive_names_round_trip_through_the_parser() {
        let parsed = ArchiveName::parse("ETHUSDT-1d-2024-03.zip").unwrap();
        assert_eq!(parsed.symbol, "ETHUSDT");
        assert_eq!(parsed.interval, "1d");

        let parsed = ArchiveName::parse("BTCUSDT-15m-2025-07-09.zip").unwrap();
        assert_eq!(parsed.interval, "15m");

        assert!(ArchiveName::parse("notes.zip").is_none());
        assert!(ArchiveName::parse("ETHUSDT-1d-2024-03.zip.tmp").is_none());
    }

    #[test]
    fn monthly_periods_cover_every_pair() {
        let periods = monthly_periods(&[2023, 2024], &[1, 2, 3]);
        assert_eq!(periods.len(), 6);
        assert_eq!(periods[0], Period::Month { year: 2023, month: 1 });
        assert_eq!(periods[5], Period::Month { year: 2024, month: 3 });
    }

    #[test]
    fn daily_periods_stop_before_today() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 4).unwrap();
        let periods = daily_periods(today);
        assert_eq!(periods.len(), 3);
        assert_eq!(periods[2], Period::Day(NaiveDate::from_ymd_opt(2026, 10, 3).unwrap()));

        let first = NaiveDate::from_ymd_opt(2026, 10, 1).unwrap();
        assert!(daily_periods(first).is_empty());
    }

    #[test]
    fn training_symbol_uses_the_topic_token() {
        let mut config = AppConfig::default();
        config.topic_id = "3".to_string();
        assert_eq!(training_symbol(&config), "BTCUSDT");
    }
}
