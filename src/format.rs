//! Turns the raw kline archives into the single, time-sorted training CSV.

use crate::config::AppConfig;
use crate::klines::{ArchiveName, training_symbol};
use crate::storage::write_atomic_blocking;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use serde::Serialize;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// Leading archive columns that are kept; the trailing "ignore" column is not.
pub const KLINE_COLUMNS: usize = 11;

pub const END_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

// Binance moved spot archives from milliseconds to microseconds in 2025.
const MICROS_THRESHOLD: i64 = 1_000_000_000_000_000;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode formatted rows: {0}")]
    Encode(#[from] csv::Error),
}

/// Why a single archive was skipped.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("not a zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive contains no files")]
    NoEntries,

    #[error("unreadable csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("row {row}: {reason}")]
    Row { row: usize, reason: String },
}

/// One candle, as read from the first eleven archive columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub end_time: DateTime<Utc>,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
}

#[derive(Serialize)]
struct FormattedRow {
    end_time: String,
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quote_volume: f64,
    trade_count: u64,
    taker_buy_volume: f64,
    taker_buy_quote_volume: f64,
}

impl From<&Kline> for FormattedRow {
    fn from(k: &Kline) -> Self {
        Self {
            end_time: k.end_time.format(END_TIME_FORMAT).to_string(),
            open_time: k.open_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            quote_volume: k.quote_volume,
            trade_count: k.trade_count,
            taker_buy_volume: k.taker_buy_volume,
            taker_buy_quote_volume: k.taker_buy_quote_volume,
        }
    }
}

pub fn epoch_to_utc(value: i64) -> Option<DateTime<Utc>> {
    if value >= MICROS_THRESHOLD {
        DateTime::from_timestamp_micros(value)
    } else {
        DateTime::from_timestamp_millis(value)
    }
}

fn field<T: std::str::FromStr>(record: &StringRecord, idx: usize, row: usize) -> Result<T, ArchiveError> {
    let raw = record.get(idx).unwrap_or("").trim();
    raw.parse::<T>().map_err(|_| ArchiveError::Row {
        row,
        reason: format!("column {idx} value {raw:?} is not valid"),
    })
}

impl Kline {
    pub fn from_record(record: &StringRecord, row: usize) -> Result<Self, ArchiveError> {
        if record.len() < KLINE_COLUMNS {
            return Err(ArchiveError::Row {
                row,
                reason: format!("expected {KLINE_COLUMNS} columns, found {}", record.len()),
            });
        }

        let close_time: i64 = field(record, 6, row)?;
        let end_time = epoch_to_utc(close_time).ok_or_else(|| ArchiveError::Row {
            row,
            reason: format!("close time {close_time} is out of range"),
        })?;

        Ok(Self {
            open_time: field(record, 0, row)?,
            open: field(record, 1, row)?,
            high: field(record, 2, row)?,
            low: field(record, 3, row)?,
            close: field(record, 4, row)?,
            volume: field(record, 5, row)?,
            end_time,
            quote_volume: field(record, 7, row)?,
            trade_count: field(record, 8, row)?,
            taker_buy_volume: field(record, 9, row)?,
            taker_buy_quote_volume: field(record, 10, row)?,
        })
    }
}

/// Parses the first file inside a kline zip archive.
pub fn read_archive(bytes: &[u8]) -> Result<Vec<Kline>, ArchiveError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(bytes))?;
    if zip.is_empty() {
        return Err(ArchiveError::NoEntries);
    }

    let mut content = Vec::new();
    zip.by_index(0)?.read_to_end(&mut content)?;

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_slice());

    let mut klines = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        // Some newer archives start with a header row.
        if idx == 0 && record.get(0).is_some_and(|v| v.trim().parse::<i64>().is_err()) {
            continue;
        }
        klines.push(Kline::from_record(&record, idx + 1)?);
    }

    Ok(klines)
}

/// Which series the formatter accepts. Archives whose name parses to another
/// symbol or interval are skipped; unrecognised names are still processed.
#[derive(Debug, Clone)]
pub struct SeriesFilter {
    pub symbol: String,
    pub intervals: Vec<String>,
}

impl SeriesFilter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            symbol: training_symbol(config),
            intervals: config.klines.intervals.clone(),
        }
    }

    fn accepts(&self, name: &ArchiveName) -> bool {
        name.symbol == self.symbol && self.intervals.iter().any(|i| *i == name.interval)
    }
}

fn list_archives(dir: &Path) -> Result<Vec<PathBuf>, FormatError> {
    let io_err = |source| FormatError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "zip") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn encode_rows(klines: &[Kline]) -> Result<Vec<u8>, FormatError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for kline in klines {
        writer.serialize(FormattedRow::from(kline))?;
    }
    writer
        .into_inner()
        .map_err(|e| FormatError::Encode(csv::Error::from(e.into_error())))
}

/// Rebuilds `output` from every archive in `archive_dir`.
///
/// Returns `Ok(false)`, without touching `output`, when no rows could be
/// read. Malformed archives are logged and skipped.
pub fn format_archives(archive_dir: &Path, output: &Path, filter: &SeriesFilter) -> Result<bool, FormatError> {
    let files = list_archives(archive_dir)?;
    if files.is_empty() {
        warn!(dir = %archive_dir.display(), "No archives found");
        return Ok(false);
    }

    let mut klines: Vec<Kline> = Vec::new();
    for path in &files {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

        if let Some(name) = ArchiveName::parse(file_name) {
            if !filter.accepts(&name) {
                warn!(file = %file_name, symbol = %name.symbol, interval = %name.interval, "Skipping archive of another series");
                continue;
            }
        }

        let parsed = fs::read(path)
            .map_err(ArchiveError::from)
            .and_then(|bytes| read_archive(&bytes));
        match parsed {
            Ok(rows) => {
                info!(file = %file_name, rows = rows.len(), "Processed archive");
                klines.extend(rows);
            }
            Err(e) => error!(file = %file_name, "Error processing archive: {e}"),
        }
    }

    if klines.is_empty() {
        warn!("No data processed, training dataset is empty");
        return Ok(false);
    }

    klines.sort_by_key(|k| k.end_time);
    // Monthly and daily archives may overlap on the same candles.
    klines.dedup_by_key(|k| k.end_time);

    let encoded = encode_rows(&klines)?;
    write_atomic_blocking(output, &encoded).map_err(|source| FormatError::Io {
        path: output.to_path_buf(),
        source,
    })?;

    info!(rows = klines.len(), path = %output.display(), "Formatted data saved");
    Ok(true)
}

pub fn run(config: &AppConfig) -> Result<bool, FormatError> {
    format_archives(
        &config.paths.archive_dir,
        &config.paths.training_csv,
        &SeriesFilter::from_config(config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_bytes(inner_name: &str, csv: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file(inner_name, SimpleFileOptions::default()).unwrap();
        writer.write_all(csv.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn row(open_time: i64, close_time: i64, price: f64) -> String {
        format!("{open_time},{price},{},{},{price},10.5,{close_time},1000.0,42,5.25,500.0,0\n", price + 1.0, price - 1.0)
    }

    fn eth_filter() -> SeriesFilter {
        SeriesFilter {
            symbol: "ETHUSDT".to_string(),
            intervals: vec!["1d".to_string()],
        }
    }

    #[test]
    fn reads_headerless_archive() {
        let csv = row(1_704_067_200_000, 1_704_153_599_999, 2300.0);
        let klines = read_archive(&zip_bytes("ETHUSDT-1d-2024-01.csv", &csv)).unwrap();

        assert_eq!(klines.len(), 1);
        let k = &klines[0];
        assert_eq!(k.open, 2300.0);
        assert_eq!(k.high, 2301.0);
        assert_eq!(k.trade_count, 42);
        assert_eq!(k.end_time.format(END_TIME_FORMAT).to_string(), "2024-01-01 23:59:59.999");
    }

    #[test]
    fn skips_leading_header_row() {
        let csv = format!(
            "open_time,open,high,low,close,volume,close_time,quote_volume,count,taker_buy_volume,taker_buy_quote_volume,ignore\n{}",
            row(1_704_067_200_000, 1_704_153_599_999, 2300.0)
        );
        let klines = read_archive(&zip_bytes("a.csv", &csv)).unwrap();
        assert_eq!(klines.len(), 1);
    }

    #[test]
    fn microsecond_timestamps_are_recognised() {
        let millis = epoch_to_utc(1_735_775_999_999).unwrap();
        let micros = epoch_to_utc(1_735_775_999_999_999).unwrap();
        assert_eq!(millis.timestamp(), micros.timestamp());
    }

    #[test]
    fn short_rows_are_rejected() {
        let err = read_archive(&zip_bytes("a.csv", "1,2,3\n")).unwrap_err();
        assert!(matches!(err, ArchiveError::Row { row: 1, .. }));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        assert!(matches!(read_archive(b"not a zip"), Err(ArchiveError::Zip(_))));
    }

    #[test]
    fn empty_directory_reports_failure_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archives = dir.path().join("binance");
        fs::create_dir_all(&archives).unwrap();
        let output = dir.path().join("training.csv");

        assert!(!format_archives(&archives, &output, &eth_filter()).unwrap());
        assert!(!output.exists());
    }

    #[test]
    fn only_malformed_archives_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ETHUSDT-1d-2024-01.zip"), b"garbage").unwrap();
        let output = dir.path().join("training.csv");

        assert!(!format_archives(dir.path(), &output, &eth_filter()).unwrap());
        assert!(!output.exists());
    }

    #[test]
    fn output_is_sorted_deduplicated_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archives = dir.path().join("binance");
        fs::create_dir_all(&archives).unwrap();

        let day = 86_400_000;
        let base = 1_704_067_200_000;
        let feb: String = (31..33).map(|d| row(base + d * day, base + (d + 1) * day - 1, 2500.0 + d as f64)).collect();
        let jan: String = (0..3).rev().map(|d| row(base + d * day, base + (d + 1) * day - 1, 2300.0 + d as f64)).collect();
        // Overlaps the first day of the monthly archive.
        let daily = row(base, base + day - 1, 2300.0);

        fs::write(archives.join("ETHUSDT-1d-2024-02.zip"), zip_bytes("feb.csv", &feb)).unwrap();
        fs::write(archives.join("ETHUSDT-1d-2024-01.zip"), zip_bytes("jan.csv", &jan)).unwrap();
        fs::write(archives.join("ETHUSDT-1d-2024-01-01.zip"), zip_bytes("day.csv", &daily)).unwrap();
        fs::write(archives.join("ETHUSDT-1d-2023-12.zip"), b"broken").unwrap();
        fs::write(archives.join("BTCUSDT-1d-2024-01.zip"), zip_bytes("btc.csv", &row(0, 1, 1.0))).unwrap();

        let output = dir.path().join("training.csv");
        assert!(format_archives(&archives, &output, &eth_filter()).unwrap());
        let first = fs::read(&output).unwrap();

        let mut reader = csv::Reader::from_reader(first.as_slice());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "end_time");
        assert_eq!(headers.len(), KLINE_COLUMNS);

        let end_times: Vec<String> = reader.records().map(|r| r.unwrap()[0].to_string()).collect();
        assert_eq!(end_times.len(), 5);
        let mut sorted = end_times.clone();
        sorted.sort();
        assert_eq!(end_times, sorted);

        assert!(format_archives(&archives, &output, &eth_filter()).unwrap());
        assert_eq!(fs::read(&output).unwrap(), first);
    }
}
