//! Diesel model structs for archived events, temperature snapshots and the
//! single-row cadence settings tables.
//!
//! All timestamps are unix seconds (UTC).

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

// Values for `events.event_type` the pipeline produces itself or treats specially.
pub mod event_types {
    pub const DEVICE_ERROR: &str = "device-error";
    pub const FEATURE_CHANGED: &str = "feature-changed";
    pub const GATEWAY_ONLINE: &str = "gateway-online";
    pub const GATEWAY_OFFLINE: &str = "gateway-offline";
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::events)]
pub struct Event {
    pub id: i64,
    pub hash: String,
    pub event_time: i64,
    pub event_type: String,
    pub account_id: String,
    pub installation_id: String,
    pub gateway_serial: Option<String>,
    pub device_id: Option<String>,
    pub error_code: Option<String>,
    pub error_description: Option<String>,
    pub category: String,
    pub severity: String,
    pub feature_name: Option<String>,
    pub feature_value: Option<String>,
    pub active: Option<bool>,
    pub body: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::events)]
pub struct NewEvent {
    pub hash: String,
    pub event_time: i64,
    pub event_type: String,
    pub account_id: String,
    pub installation_id: String,
    pub gateway_serial: Option<String>,
    pub device_id: Option<String>,
    pub error_code: Option<String>,
    pub error_description: Option<String>,
    pub category: String,
    pub severity: String,
    pub feature_name: Option<String>,
    pub feature_value: Option<String>,
    pub active: Option<bool>,
    pub body: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::temperature_snapshots)]
pub struct TemperatureSnapshot {
    pub id: i64,
    pub sample_time: i64,
    pub account_id: String,
    pub installation_id: String,
    pub gateway_id: String,
    pub device_id: String,
    pub outside_temp_c: Option<f64>,
    pub room_temp_c: Option<f64>,
    pub supply_temp_c: Option<f64>,
    pub target_supply_temp_c: Option<f64>,
    pub return_temp_c: Option<f64>,
    pub primary_supply_temp_c: Option<f64>,
    pub primary_return_temp_c: Option<f64>,
    pub secondary_supply_temp_c: Option<f64>,
    pub secondary_return_temp_c: Option<f64>,
    pub dhw_temp_c: Option<f64>,
    pub dhw_top_temp_c: Option<f64>,
    pub dhw_bottom_temp_c: Option<f64>,
    pub dhw_target_temp_c: Option<f64>,
    pub boiler_temp_c: Option<f64>,
    pub buffer_temp_c: Option<f64>,
    pub buffer_top_temp_c: Option<f64>,
    pub heating_curve_slope: Option<f64>,
    pub heating_curve_shift: Option<f64>,
    pub compressor_active: Option<bool>,
    pub compressor_speed_rps: Option<f64>,
    pub compressor_power_w: Option<f64>,
    pub compressor_inlet_temp_c: Option<f64>,
    pub compressor_outlet_temp_c: Option<f64>,
    pub compressor_inlet_pressure_bar: Option<f64>,
    pub thermal_power_w: Option<f64>,
    pub volumetric_flow_lph: Option<f64>,
    pub burner_modulation_pct: Option<f64>,
    pub circulation_pump_active: Option<bool>,
    pub dhw_pump_active: Option<bool>,
    pub four_way_valve: Option<String>,
    pub sample_interval_min: Option<i32>,
}

// Upserts overwrite every reading, so a missing value replaces an older one.
#[derive(Debug, Clone, PartialEq, Default, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = schema::temperature_snapshots, treat_none_as_null = true)]
pub struct NewTemperatureSnapshot {
    pub sample_time: i64,
    pub account_id: String,
    pub installation_id: String,
    pub gateway_id: String,
    pub device_id: String,
    pub outside_temp_c: Option<f64>,
    pub room_temp_c: Option<f64>,
    pub supply_temp_c: Option<f64>,
    pub target_supply_temp_c: Option<f64>,
    pub return_temp_c: Option<f64>,
    pub primary_supply_temp_c: Option<f64>,
    pub primary_return_temp_c: Option<f64>,
    pub secondary_supply_temp_c: Option<f64>,
    pub secondary_return_temp_c: Option<f64>,
    pub dhw_temp_c: Option<f64>,
    pub dhw_top_temp_c: Option<f64>,
    pub dhw_bottom_temp_c: Option<f64>,
    pub dhw_target_temp_c: Option<f64>,
    pub boiler_temp_c: Option<f64>,
    pub buffer_temp_c: Option<f64>,
    pub buffer_top_temp_c: Option<f64>,
    pub heating_curve_slope: Option<f64>,
    pub heating_curve_shift: Option<f64>,
    pub compressor_active: Option<bool>,
    pub compressor_speed_rps: Option<f64>,
    pub compressor_power_w: Option<f64>,
    pub compressor_inlet_temp_c: Option<f64>,
    pub compressor_outlet_temp_c: Option<f64>,
    pub compressor_inlet_pressure_bar: Option<f64>,
    pub thermal_power_w: Option<f64>,
    pub volumetric_flow_lph: Option<f64>,
    pub burner_modulation_pct: Option<f64>,
    pub circulation_pump_active: Option<bool>,
    pub dhw_pump_active: Option<bool>,
    pub four_way_valve: Option<String>,
    pub sample_interval_min: Option<i32>,
}

impl NewTemperatureSnapshot {
    pub fn new(
        sample_time: i64,
        account_id: &str,
        installation_id: &str,
        gateway_id: &str,
        device_id: &str,
        sample_interval_min: i32,
    ) -> Self {
        NewTemperatureSnapshot {
            sample_time,
            account_id: account_id.to_string(),
            installation_id: installation_id.to_string(),
            gateway_id: gateway_id.to_string(),
            device_id: device_id.to_string(),
            sample_interval_min: Some(sample_interval_min),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::event_archive_settings)]
pub struct EventArchiveSettingsRow {
    pub id: i32,
    pub enabled: bool,
    pub interval_minutes: i32,
    pub retention_days: i32,
    pub days_back: i32,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::temperature_log_settings)]
pub struct TemperatureLogSettingsRow {
    pub id: i32,
    pub enabled: bool,
    pub sample_interval_minutes: i32,
    pub retention_days: i32,
    pub updated_at: i64,
}
