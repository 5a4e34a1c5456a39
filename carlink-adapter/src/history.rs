//! Refuel/charge episode tracking derived from level telemetry.
//!
//! An episode is a contiguous rising interval of tank level or state of
//! charge. The tracker is an online, single-pass algorithm over republished
//! level facts: no backtracking, so a dropped or reordered update permanently
//! skews derived totals. All of its state lives in the tree under
//! `{vin}.history.*`, which keeps episodes intact across reconnects and
//! process restarts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};

use crate::tree::{StateTree, TreeError};

/// The two tracked level metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Fuel,
    Charge,
}

impl Metric {
    /// Telemetry attribute carrying this metric's level.
    pub fn attribute(self) -> &'static str {
        match self {
            Metric::Fuel => "tanklevelpercent",
            Metric::Charge => "soc",
        }
    }

    fn last_key(self) -> &'static str {
        match self {
            Metric::Fuel => "tankLevelLast",
            Metric::Charge => "socLevelLast",
        }
    }

    fn status_key(self) -> &'static str {
        match self {
            Metric::Fuel => "tankLevelStatus",
            Metric::Charge => "socStatus",
        }
    }

    fn before_key(self) -> &'static str {
        match self {
            Metric::Fuel => "tankLevelBeforeFueling",
            Metric::Charge => "socLevelBeforeFueling",
        }
    }

    fn json_key(self) -> &'static str {
        match self {
            Metric::Fuel => "tankLevelJSON",
            Metric::Charge => "socJSON",
        }
    }
}

/// One completed episode, persisted newest-first in `{vin}.history.*JSON`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub start: i64,
    pub end: i64,
    pub date: String,
    pub diff: i64,
    pub quantity: f64,
    pub price: f64,
    pub odo: i64,
    pub basic_price: f64,
}

/// Per-vin capacity and pricing configuration. Anything missing degrades to
/// zero-valued quantities; records are still written.
#[derive(Debug, Clone, Default)]
pub struct HistoryConfig {
    /// Tank capacity in liters, per vin.
    pub tank_capacity: HashMap<String, f64>,
    /// Battery capacity in kWh, per vin.
    pub battery_capacity: HashMap<String, f64>,
    /// Electricity price per kWh.
    pub kwh_price: Option<f64>,
    /// The tank level telemetry already reports liters rather than percent.
    pub tank_level_in_liters: bool,
}

/// External unit-price lookup for fuel episodes.
#[async_trait]
pub trait FuelPriceSource: Send + Sync {
    /// Unit price near the given position, if one can be determined.
    async fn price_at(&self, lat: f64, lon: f64) -> Option<f64>;
}

pub struct HistoryTracker {
    tree: Arc<dyn StateTree>,
    config: HistoryConfig,
    fuel_price: Option<Arc<dyn FuelPriceSource>>,
}

impl HistoryTracker {
    pub fn new(tree: Arc<dyn StateTree>, config: HistoryConfig) -> Self {
        Self {
            tree,
            config,
            fuel_price: None,
        }
    }

    pub fn with_fuel_price(mut self, source: Arc<dyn FuelPriceSource>) -> Self {
        self.fuel_price = Some(source);
        self
    }

    /// Process one republished level fact.
    pub async fn on_level(&self, vin: &str, metric: Metric, value: i64) -> Result<(), TreeError> {
        let last_key = format!("{vin}.history.{}", metric.last_key());
        let status_key = format!("{vin}.history.{}", metric.status_key());
        let before_key = format!("{vin}.history.{}", metric.before_key());

        let changed = self
            .get_bool(&format!("{vin}.state.{}.changed", metric.attribute()))
            .await?;
        if changed == Some(false) {
            // Bulk resend: episode state untouched, but the observed level
            // still advances. Kept exactly as shipped even though the
            // ordering reads oddly; downstream totals depend on it.
            self.tree.set(&last_key, value.into()).await?;
            return Ok(());
        }

        let episode_active = match self.get_bool(&status_key).await? {
            Some(v) => v,
            None => {
                self.tree.set(&status_key, false.into()).await?;
                false
            }
        };
        let Some(last) = self.get_i64(&last_key).await? else {
            // First observation for this vin/metric.
            self.tree.set(&last_key, value.into()).await?;
            return Ok(());
        };

        if value == last && episode_active {
            tracing::debug!(vin, metric = metric.attribute(), "level plateau, episode closed");
            self.tree.set(&status_key, false.into()).await?;
        }

        if value > last && !episode_active {
            let plug_charging = metric == Metric::Charge
                && self
                    .get_i64(&format!("{vin}.state.chargingstatus.intValue"))
                    .await?
                    .is_some_and(|s| s >= 2);
            if plug_charging {
                tracing::debug!(vin, "plug-in charge already tracked elsewhere, not opening an episode");
            } else {
                self.tree.set(&before_key, last.into()).await?;
                self.tree.set(&status_key, true.into()).await?;
            }
        }

        if value == 100 || (value < last && episode_active) {
            self.tree.set(&status_key, false.into()).await?;
            let start = self.get_i64(&before_key).await?.unwrap_or(0);
            // A plateau at the maximum closes at the reported level; a drop
            // while the episode is open closes at the last level seen before
            // the drop.
            let end = if value == 100 { value } else { last };
            let diff = end - start;
            if start < 99 && diff > 0 {
                let record = self.build_record(vin, metric, start, end, diff).await?;
                self.prepend_record(vin, metric, record).await?;
            }
        }

        self.tree.set(&last_key, value.into()).await?;
        Ok(())
    }

    async fn build_record(
        &self,
        vin: &str,
        metric: Metric,
        start: i64,
        end: i64,
        diff: i64,
    ) -> Result<HistoryRecord, TreeError> {
        let odo = self
            .get_i64(&format!("{vin}.state.odo.intValue"))
            .await?
            .unwrap_or(0);

        let (quantity, basic_price) = match metric {
            Metric::Charge => match self.config.battery_capacity.get(vin) {
                Some(capacity) => (
                    round2(diff as f64 * capacity / 100.0),
                    self.config.kwh_price.unwrap_or(0.0),
                ),
                None => {
                    tracing::warn!(vin, "no battery capacity configured, recording zero quantity");
                    (0.0, 0.0)
                }
            },
            Metric::Fuel => {
                let quantity = if self.config.tank_level_in_liters {
                    Some(diff as f64)
                } else {
                    self.config
                        .tank_capacity
                        .get(vin)
                        .map(|capacity| diff as f64 * capacity / 100.0)
                };
                match quantity {
                    Some(q) => (round2(q), self.fuel_unit_price(vin).await?),
                    None => {
                        tracing::warn!(vin, "no tank capacity configured, recording zero quantity");
                        (0.0, 0.0)
                    }
                }
            }
        };

        Ok(HistoryRecord {
            start,
            end,
            date: format_timestamp(&chrono::Local::now()),
            diff,
            quantity,
            price: round2(quantity * basic_price),
            odo,
            basic_price,
        })
    }

    async fn fuel_unit_price(&self, vin: &str) -> Result<f64, TreeError> {
        let Some(source) = &self.fuel_price else {
            return Ok(0.0);
        };
        let lat = self
            .get_f64(&format!("{vin}.state.positionLat.doubleValue"))
            .await?;
        let lon = self
            .get_f64(&format!("{vin}.state.positionLong.doubleValue"))
            .await?;
        let (Some(lat), Some(lon)) = (lat, lon) else {
            tracing::warn!(vin, "no position available for fuel price lookup");
            return Ok(0.0);
        };
        Ok(source.price_at(lat, lon).await.unwrap_or(0.0))
    }

    async fn prepend_record(
        &self,
        vin: &str,
        metric: Metric,
        record: HistoryRecord,
    ) -> Result<(), TreeError> {
        let json_key = format!("{vin}.history.{}", metric.json_key());
        let mut records: Vec<HistoryRecord> = match self.tree.get(&json_key).await? {
            Some(serde_json::Value::String(s)) => serde_json::from_str(&s).unwrap_or_default(),
            _ => Vec::new(),
        };
        records.insert(0, record);
        let serialized = serde_json::to_string(&records)
            .map_err(|e| TreeError::Backend(format!("serialize history: {e}")))?;
        self.tree.set(&json_key, serialized.into()).await?;
        Ok(())
    }

    async fn get_bool(&self, key: &str) -> Result<Option<bool>, TreeError> {
        Ok(self.tree.get(key).await?.and_then(|v| v.as_bool()))
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, TreeError> {
        Ok(self.tree.get(key).await?.and_then(|v| v.as_i64()))
    }

    async fn get_f64(&self, key: &str) -> Result<Option<f64>, TreeError> {
        Ok(self.tree.get(key).await?.and_then(|v| v.as_f64()))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Local-time stamp in the `d.m.yyyy hh:mm` form the history JSON has always
/// used (day and month unpadded, hours and minutes padded).
fn format_timestamp<T: Datelike + Timelike>(t: &T) -> String {
    format!(
        "{}.{}.{} {:02}:{:02}",
        t.day(),
        t.month(),
        t.year(),
        t.hour(),
        t.minute()
    )
}
