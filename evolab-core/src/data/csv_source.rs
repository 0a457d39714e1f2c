//! CSV-backed market data.
//!
//! Files live under a root directory as `{symbol}_{timeframe}.csv` with the
//! header `timestamp,open,high,low,close,volume`. Timestamps are RFC 3339
//! strings or integer epoch milliseconds. A root that is itself a file serves
//! every request from that one file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::source::{DataError, MarketDataSource, MarketRequest};
use crate::domain::{MarketKey, OhlcvBar, OhlcvSeries};

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Clone)]
pub struct CsvSource {
    root: PathBuf,
}

impl CsvSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &MarketKey) -> PathBuf {
        if self.root.is_file() {
            self.root.clone()
        } else {
            self.root.join(format!("{}_{}.csv", key.symbol, key.timeframe))
        }
    }
}

impl MarketDataSource for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn fetch_ohlcv(&self, request: &MarketRequest) -> Result<OhlcvSeries, DataError> {
        let path = self.path_for(&request.key);
        if !path.exists() {
            return Err(DataError::SymbolNotFound {
                symbol: request.key.symbol.clone(),
            });
        }
        let mut series = read_csv(&path)?;
        series.truncate_to_recent(request.limit);
        Ok(series)
    }
}

/// Read a whole OHLCV file, sorted ascending with duplicate timestamps dropped.
pub fn read_csv(path: &Path) -> Result<OhlcvSeries, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| DataError::Io(format!("{}: {e}", path.display())))?;

    let mut bars = Vec::new();
    for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row.map_err(|e| DataError::InvalidData(format!("{}: {e}", path.display())))?;
        let timestamp = parse_timestamp(&row.timestamp).ok_or_else(|| {
            DataError::InvalidData(format!(
                "{}: row {}: unparseable timestamp '{}'",
                path.display(),
                line + 1,
                row.timestamp
            ))
        })?;
        bars.push(OhlcvBar {
            timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }
    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    Ok(OhlcvSeries::new(bars))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ms) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Write a series in the format [`read_csv`] accepts.
pub fn write_csv(path: &Path, series: &OhlcvSeries) -> Result<(), DataError> {
    let mut writer =
        csv::Writer::from_path(path).map_err(|e| DataError::Io(format!("{}: {e}", path.display())))?;
    let io = |e: csv::Error| DataError::Io(format!("{}: {e}", path.display()));
    writer
        .write_record(["timestamp", "open", "high", "low", "close", "volume"])
        .map_err(io)?;
    for bar in &series.bars {
        writer
            .write_record([
                bar.timestamp.to_rfc3339(),
                bar.open.to_string(),
                bar.high.to_string(),
                bar.low.to_string(),
                bar.close.to_string(),
                bar.volume.to_string(),
            ])
            .map_err(io)?;
    }
    writer
        .flush()
        .map_err(|e| DataError::Io(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timeframe;
    use std::io::Write;

    #[test]
    fn reads_mixed_timestamp_formats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTCUSDT_1h.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "timestamp,open,high,low,close,volume").unwrap();
        writeln!(f, "2024-01-01T01:00:00Z,101,102,100,101.5,5").unwrap();
        writeln!(f, "1704067200000,100,101,99,100.5,4").unwrap();
        drop(f);

        let src = CsvSource::new(dir.path());
        let series = src
            .fetch_ohlcv(&MarketRequest::new("any", "BTCUSDT", Timeframe::H1, 10))
            .unwrap();
        assert_eq!(series.len(), 2);
        assert!(series.is_ascending());
        assert_eq!(series.bars[0].close, 100.5);
    }

    #[test]
    fn missing_file_is_symbol_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let src = CsvSource::new(dir.path());
        let err = src
            .fetch_ohlcv(&MarketRequest::new("any", "NOPE", Timeframe::D1, 10))
            .unwrap_err();
        assert!(matches!(err, DataError::SymbolNotFound { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn round_trip_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.csv");
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let series = OhlcvSeries::new(
            (0..20)
                .map(|i| OhlcvBar {
                    timestamp: start + chrono::Duration::minutes(5 * i),
                    open: 10.0 + i as f64,
                    high: 11.0 + i as f64,
                    low: 9.0 + i as f64,
                    close: 10.5 + i as f64,
                    volume: 1.0,
                })
                .collect(),
        );
        write_csv(&path, &series).unwrap();

        let src = CsvSource::new(&path);
        let fetched = src
            .fetch_ohlcv(&MarketRequest::new("any", "ANY", Timeframe::M5, 5))
            .unwrap();
        assert_eq!(fetched.len(), 5);
        assert_eq!(fetched.bars, series.bars[15..].to_vec());
    }

    #[test]
    fn bad_timestamp_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X_1d.csv");
        std::fs::write(&path, "timestamp,open,high,low,close,volume\nyesterday,1,1,1,1,1\n").unwrap();
        let err = read_csv(&path).unwrap_err();
        assert!(matches!(err, DataError::InvalidData(_)));
    }
}
