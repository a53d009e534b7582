// Reporting boundary: stages declare counters and send samples

use crate::error::{PipelineError, Result};
use crate::storage::Storage;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

pub const METRIC_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metric (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stage TEXT NOT NULL,
    metric TEXT NOT NULL,
    UNIQUE(stage, metric)
);

CREATE TABLE IF NOT EXISTS metric_data (
    metric_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,     -- RFC 3339, UTC
    value INTEGER NOT NULL,
    FOREIGN KEY(metric_id) REFERENCES metric(id)
);

CREATE INDEX IF NOT EXISTS idx_metric_data_metric ON metric_data(metric_id);
CREATE INDEX IF NOT EXISTS idx_metric_data_timestamp ON metric_data(timestamp);
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricInfo {
    pub id: i64,
    pub stage: String,
    pub metric: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: i64,
}

/// Where stages report counters. Pipeline correctness never depends on it.
pub trait MetricSink {
    /// Gets or creates the named metrics of `stage`, returning name -> id.
    fn declare(&mut self, stage: &str, metrics: &[&str]) -> Result<HashMap<String, i64>>;

    fn send(&mut self, samples: &[Sample]) -> Result<()>;
}

/// Sink used when no collector is configured.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricSink for NoopMetrics {
    fn declare(&mut self, _stage: &str, metrics: &[&str]) -> Result<HashMap<String, i64>> {
        Ok(metrics
            .iter()
            .enumerate()
            .map(|(id, name)| (name.to_string(), id as i64))
            .collect())
    }

    fn send(&mut self, _samples: &[Sample]) -> Result<()> {
        Ok(())
    }
}

/// The operations the metric store answers, validated before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum MetricRequest {
    Declare {
        stage: String,
        metrics: Vec<String>,
    },
    Send {
        values: Vec<Sample>,
    },
    Query {
        metric_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    List,
}

impl MetricRequest {
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| PipelineError::InvalidRequest(e.to_string()))
    }
}

/// SQLite backed metric collector.
pub struct MetricStore {
    storage: Storage,
}

fn encode_time(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl MetricStore {
    pub fn new(mut storage: Storage) -> Result<Self> {
        storage.ensure_schema("metric", METRIC_SCHEMA)?;
        Ok(Self { storage })
    }

    pub fn list(&mut self) -> Result<Vec<MetricInfo>> {
        self.storage.with_cursor(|tx| {
            let mut stmt = tx.prepare("SELECT id, stage, metric FROM metric ORDER BY stage, metric")?;
            let metrics = stmt
                .query_map([], |row| {
                    Ok(MetricInfo {
                        id: row.get(0)?,
                        stage: row.get(1)?,
                        metric: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(metrics)
        })
    }

    pub fn query(
        &mut self,
        metric_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>> {
        self.storage.with_cursor(|tx| {
            let mut stmt = tx.prepare(
                "SELECT timestamp, value FROM metric_data
                 WHERE metric_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                 ORDER BY timestamp ASC",
            )?;
            let points = stmt
                .query_map(
                    params![metric_id, encode_time(&from), encode_time(&to)],
                    |row| {
                        let timestamp: String = row.get(0)?;
                        Ok(DataPoint {
                            timestamp: decode_time(&timestamp)?,
                            value: row.get(1)?,
                        })
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(points)
        })
    }

    pub fn dispatch(&mut self, request: MetricRequest) -> Result<Value> {
        match request {
            MetricRequest::Declare { stage, metrics } => {
                let names: Vec<&str> = metrics.iter().map(String::as_str).collect();
                Ok(json!(self.declare(&stage, &names)?))
            }
            MetricRequest::Send { values } => {
                self.send(&values)?;
                Ok(json!({ "accepted": values.len() }))
            }
            MetricRequest::Query { metric_id, from, to } => {
                Ok(serde_json::to_value(self.query(metric_id, from, to)?)?)
            }
            MetricRequest::List => Ok(serde_json::to_value(self.list()?)?),
        }
    }
}

impl MetricSink for MetricStore {
    fn declare(&mut self, stage: &str, metrics: &[&str]) -> Result<HashMap<String, i64>> {
        self.storage.with_cursor(|tx| {
            for metric in metrics {
                tx.execute(
                    "INSERT INTO metric (stage, metric) VALUES (?1, ?2)
                     ON CONFLICT(stage, metric) DO NOTHING",
                    params![stage, metric],
                )?;
            }

            let mut stmt = tx.prepare("SELECT metric, id FROM metric WHERE stage = ?1")?;
            let ids = stmt
                .query_map(params![stage], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<HashMap<String, i64>>>()?;
            Ok(ids)
        })
    }

    fn send(&mut self, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        self.storage.with_cursor(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_data (metric_id, timestamp, value) VALUES (?1, ?2, ?3)",
            )?;
            for sample in samples {
                stmt.execute(params![
                    sample.metric_id,
                    encode_time(&sample.timestamp),
                    sample.value
                ])?;
            }
            Ok(())
        })
    }
}
