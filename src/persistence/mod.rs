//! CSV Persistence Module
//!
//! Observability-only snapshots of positions and trader state, one CSV file per
//! day. Nothing here is read back by the trading core.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::info;

use crate::signal::SignalReference;
use crate::trader::TraderState;
use crate::types::Position;

/// Position row written every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub timestamp: i64,
    pub ticker: String,
    pub quantity: f64,
    pub average_price: f64,
    pub current_price: f64,
    pub current_value: f64,
}

impl PositionRecord {
    pub fn from_position(position: &Position, time: DateTime<Utc>) -> Self {
        Self {
            timestamp: time.timestamp_millis(),
            ticker: position.ticker.clone(),
            quantity: position.quantity,
            average_price: position.average_price,
            current_price: position.current_price,
            current_value: position.current_value(),
        }
    }
}

/// Trader state row written after every processed tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub timestamp: i64,
    pub state: String,
    pub time_last_base_change: Option<i64>,
    pub base_value_at_last_change: Option<f64>,
    pub lev_value_at_last_change: Option<f64>,
    pub position_entry_price: Option<f64>,
}

impl StateRecord {
    pub fn new(state: &TraderState, time: DateTime<Utc>) -> Self {
        let reference: Option<&SignalReference> = state.reference();
        Self {
            timestamp: time.timestamp_millis(),
            state: state.name().to_string(),
            time_last_base_change: reference.map(|r| r.time_last_base_change.timestamp_millis()),
            base_value_at_last_change: reference.map(|r| r.base_value_at_last_change),
            lev_value_at_last_change: reference.map(|r| r.lev_value_at_last_change),
            position_entry_price: reference.map(|r| r.position_entry_price),
        }
    }
}

/// Destination for per-tick observability rows
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn write_snapshot(&self, positions: &[Position], time: DateTime<Utc>) -> Result<()>;
    async fn write_state(&self, record: &StateRecord) -> Result<()>;
}

/// Sink used when persistence is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSnapshotSink;

#[async_trait]
impl SnapshotSink for NullSnapshotSink {
    async fn write_snapshot(&self, _positions: &[Position], _time: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn write_state(&self, _record: &StateRecord) -> Result<()> {
        Ok(())
    }
}

/// Appending writer that rolls over to a new file when the date changes
struct DailyWriter {
    dir: PathBuf,
    prefix: &'static str,
    current: Option<(NaiveDate, csv::Writer<File>)>,
}

impl DailyWriter {
    fn new(dir: PathBuf, prefix: &'static str) -> Self {
        Self {
            dir,
            prefix,
            current: None,
        }
    }

    fn writer_for(&mut self, date: NaiveDate) -> Result<&mut csv::Writer<File>> {
        let stale = !matches!(&self.current, Some((d, _)) if *d == date);
        if stale {
            let filename = format!("{}_{}.csv", self.prefix, date.format("%Y-%m-%d"));
            let writer = CsvSnapshotSink::create_writer(&self.dir, &filename)?;
            self.current = Some((date, writer));
        }
        match self.current.as_mut() {
            Some((_, writer)) => Ok(writer),
            None => anyhow::bail!("No CSV writer open for {}", self.prefix),
        }
    }
}

/// Daily CSV files under `positions/` and `states/`
pub struct CsvSnapshotSink {
    data_dir: PathBuf,
    position_writer: AsyncRwLock<DailyWriter>,
    state_writer: AsyncRwLock<DailyWriter>,
}

impl CsvSnapshotSink {
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);

        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(data_dir.join("positions"))?;
        fs::create_dir_all(data_dir.join("states"))?;

        info!(data_dir = %data_dir.display(), "CSV snapshot sink initialized");

        Ok(Self {
            position_writer: AsyncRwLock::new(DailyWriter::new(data_dir.join("positions"), "positions")),
            state_writer: AsyncRwLock::new(DailyWriter::new(data_dir.join("states"), "states")),
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }
}

fn millis_to_date(timestamp_ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_else(Utc::now)
        .date_naive()
}

#[async_trait]
impl SnapshotSink for CsvSnapshotSink {
    async fn write_snapshot(&self, positions: &[Position], time: DateTime<Utc>) -> Result<()> {
        let mut daily = self.position_writer.write().await;
        let writer = daily.writer_for(time.date_naive())?;
        for position in positions {
            writer
                .serialize(PositionRecord::from_position(position, time))
                .context("Failed to write position record")?;
        }
        writer.flush().context("Failed to flush position writer")?;
        Ok(())
    }

    async fn write_state(&self, record: &StateRecord) -> Result<()> {
        let mut daily = self.state_writer.write().await;
        let writer = daily.writer_for(millis_to_date(record.timestamp))?;
        writer
            .serialize(record)
            .context("Failed to write state record")?;
        writer.flush().context("Failed to flush state writer")?;
        Ok(())
    }
}
