//! Energy rollups from instantaneous power readings.
//!
//! Every snapshot stands for the sample interval that was in effect when it was
//! taken, so energy is `power × interval`. Rows written before the interval column
//! existed fall back to the configured default.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::models::TemperatureSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Hourly,
    Daily,
}

impl Bucket {
    fn seconds(self) -> i64 {
        match self {
            Bucket::Hourly => 3600,
            Bucket::Daily => 86_400,
        }
    }

    /// Start of the bucket containing `ts` (UTC).
    pub fn start_of(self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.seconds())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionBucket {
    /// Bucket start, unix seconds.
    pub start: i64,
    pub electrical_kwh: f64,
    pub thermal_kwh: f64,
    pub samples: usize,
}

impl ConsumptionBucket {
    /// Coefficient of performance over the bucket.
    pub fn cop(&self) -> Option<f64> {
        (self.electrical_kwh > 0.0).then(|| self.thermal_kwh / self.electrical_kwh)
    }
}

/// Thermal output counted for a sample. A stopped compressor produces no heat even
/// when the heat meter still reports its last value.
pub fn effective_thermal_power_w(row: &TemperatureSnapshot) -> Option<f64> {
    match row.compressor_power_w {
        Some(p) if p <= 0.0 => Some(0.0),
        _ => row.thermal_power_w,
    }
}

pub fn integrate(rows: &[TemperatureSnapshot], bucket: Bucket, default_interval_min: i32) -> Vec<ConsumptionBucket> {
    let mut buckets: BTreeMap<i64, ConsumptionBucket> = BTreeMap::new();

    for row in rows {
        let interval_min = row.sample_interval_min.filter(|m| *m > 0).unwrap_or(default_interval_min);
        let hours = f64::from(interval_min) / 60.0;
        let start = bucket.start_of(row.sample_time);
        let b = buckets.entry(start).or_insert(ConsumptionBucket {
            start,
            electrical_kwh: 0.0,
            thermal_kwh: 0.0,
            samples: 0,
        });
        b.samples += 1;
        if let Some(p) = row.compressor_power_w {
            b.electrical_kwh += p.max(0.0) * hours / 1000.0;
        }
        if let Some(p) = effective_thermal_power_w(row) {
            b.thermal_kwh += p.max(0.0) * hours / 1000.0;
        }
    }

    buckets.into_values().collect()
}
