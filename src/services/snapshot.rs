//! Feature snapshot → temperature snapshot row.
//!
//! Heat pumps and gas boilers expose overlapping readings under different feature
//! names, so each column lists its candidates in order of preference.

use chrono::{DateTime, Utc};

use crate::db::models::NewTemperatureSnapshot;
use crate::services::feature_cache::{DeviceKey, Features};

const OUTSIDE: &[&str] = &["heating.sensors.temperature.outside"];
const ROOM: &[&str] = &[
    "heating.circuits.0.sensors.temperature.room",
    "heating.sensors.temperature.room",
];
const SUPPLY: &[&str] = &[
    "heating.circuits.0.sensors.temperature.supply",
    "heating.sensors.temperature.supply",
];
const TARGET_SUPPLY: &[&str] = &["heating.circuits.0.temperature"];
const RETURN: &[&str] = &["heating.sensors.temperature.return"];
const PRIMARY_SUPPLY: &[&str] = &["heating.primaryCircuit.sensors.temperature.supply"];
const PRIMARY_RETURN: &[&str] = &["heating.primaryCircuit.sensors.temperature.return"];
const SECONDARY_SUPPLY: &[&str] = &["heating.secondaryCircuit.sensors.temperature.supply"];
const SECONDARY_RETURN: &[&str] = &["heating.secondaryCircuit.sensors.temperature.return"];
const DHW: &[&str] = &[
    "heating.dhw.sensors.temperature.hotWaterStorage",
    "heating.dhw.sensors.temperature.dhwCylinder",
];
const DHW_TOP: &[&str] = &[
    "heating.dhw.sensors.temperature.hotWaterStorage.top",
    "heating.dhw.sensors.temperature.dhwCylinder.top",
];
const DHW_BOTTOM: &[&str] = &[
    "heating.dhw.sensors.temperature.hotWaterStorage.bottom",
    "heating.dhw.sensors.temperature.dhwCylinder.bottom",
];
const DHW_TARGET: &[&str] = &["heating.dhw.temperature.main"];
const BOILER: &[&str] = &[
    "heating.boiler.sensors.temperature.commonSupply",
    "heating.boiler.sensors.temperature.main",
];
const BUFFER: &[&str] = &[
    "heating.buffer.sensors.temperature.main",
    "heating.bufferCylinder.sensors.temperature.main",
];
const BUFFER_TOP: &[&str] = &[
    "heating.buffer.sensors.temperature.top",
    "heating.bufferCylinder.sensors.temperature.top",
];
const CURVE: &[&str] = &["heating.circuits.0.heating.curve"];
const COMPRESSOR: &[&str] = &["heating.compressors.0"];
const COMPRESSOR_SPEED: &[&str] = &["heating.compressors.0.speed.current"];
const COMPRESSOR_POWER: &[&str] = &[
    "heating.compressors.0.power.consumption.current",
    "heating.power.consumption.current",
];
const COMPRESSOR_INLET_TEMP: &[&str] = &["heating.compressors.0.sensors.temperature.inlet"];
const COMPRESSOR_OUTLET_TEMP: &[&str] = &["heating.compressors.0.sensors.temperature.outlet"];
const COMPRESSOR_INLET_PRESSURE: &[&str] = &["heating.compressors.0.sensors.pressure.inlet"];
const THERMAL_POWER: &[&str] = &["heating.heat.production.current"];
const VOLUMETRIC_FLOW: &[&str] = &[
    "heating.sensors.volumetricFlow.allengra",
    "heating.sensors.volumetricFlow.return",
];
const BURNER_MODULATION: &[&str] = &["heating.burners.0.modulation"];
const CIRCULATION_PUMP: &[&str] = &["heating.circuits.0.circulation.pump"];
const DHW_PUMP: &[&str] = &["heating.dhw.pumps.primary"];
const FOUR_WAY_VALVE: &[&str] = &["heating.valves.fourThreeWay.position"];

fn number(f: &Features, names: &[&str], property: &str) -> Option<f64> {
    names.iter().find_map(|n| f.number(n, property))
}

fn boolean(f: &Features, names: &[&str], property: &str) -> Option<bool> {
    names.iter().find_map(|n| f.boolean(n, property))
}

fn text(f: &Features, names: &[&str], property: &str) -> Option<String> {
    names.iter().find_map(|n| f.text(n, property))
}

/// Unix seconds truncated to the start of the minute.
pub fn sample_time(at: DateTime<Utc>) -> i64 {
    let secs = at.timestamp();
    secs - secs.rem_euclid(60)
}

/// Builds one snapshot row. Returns `None` when the device reported no usable reading.
pub fn snapshot_from_features(
    features: &Features,
    account_id: &str,
    device: &DeviceKey,
    taken_at: DateTime<Utc>,
    sample_interval_min: i32,
) -> Option<NewTemperatureSnapshot> {
    let f = features;
    let mut row = NewTemperatureSnapshot::new(
        sample_time(taken_at),
        account_id,
        &device.installation_id,
        &device.gateway_serial,
        &device.device_id,
        sample_interval_min,
    );

    row.outside_temp_c = number(f, OUTSIDE, "value");
    row.room_temp_c = number(f, ROOM, "value");
    row.supply_temp_c = number(f, SUPPLY, "value");
    row.target_supply_temp_c = number(f, TARGET_SUPPLY, "value");
    row.return_temp_c = number(f, RETURN, "value");
    row.primary_supply_temp_c = number(f, PRIMARY_SUPPLY, "value");
    row.primary_return_temp_c = number(f, PRIMARY_RETURN, "value");
    row.secondary_supply_temp_c = number(f, SECONDARY_SUPPLY, "value");
    row.secondary_return_temp_c = number(f, SECONDARY_RETURN, "value");
    row.dhw_temp_c = number(f, DHW, "value");
    row.dhw_top_temp_c = number(f, DHW_TOP, "value");
    row.dhw_bottom_temp_c = number(f, DHW_BOTTOM, "value");
    row.dhw_target_temp_c = number(f, DHW_TARGET, "value");
    row.boiler_temp_c = number(f, BOILER, "value");
    row.buffer_temp_c = number(f, BUFFER, "value");
    row.buffer_top_temp_c = number(f, BUFFER_TOP, "value");
    row.heating_curve_slope = number(f, CURVE, "slope");
    row.heating_curve_shift = number(f, CURVE, "shift");
    row.compressor_active = boolean(f, COMPRESSOR, "active");
    row.compressor_speed_rps = number(f, COMPRESSOR_SPEED, "value");
    row.compressor_power_w = number(f, COMPRESSOR_POWER, "value");
    row.compressor_inlet_temp_c = number(f, COMPRESSOR_INLET_TEMP, "value");
    row.compressor_outlet_temp_c = number(f, COMPRESSOR_OUTLET_TEMP, "value");
    row.compressor_inlet_pressure_bar = number(f, COMPRESSOR_INLET_PRESSURE, "value");
    row.thermal_power_w = number(f, THERMAL_POWER, "value");
    row.volumetric_flow_lph = number(f, VOLUMETRIC_FLOW, "value");
    row.burner_modulation_pct = number(f, BURNER_MODULATION, "value");
    row.circulation_pump_active = boolean(f, CIRCULATION_PUMP, "status");
    row.dhw_pump_active = boolean(f, DHW_PUMP, "status");
    row.four_way_valve = text(f, FOUR_WAY_VALVE, "value");

    has_reading(&row).then_some(row)
}

fn has_reading(row: &NewTemperatureSnapshot) -> bool {
    [
        row.outside_temp_c,
        row.room_temp_c,
        row.supply_temp_c,
        row.return_temp_c,
        row.primary_supply_temp_c,
        row.secondary_supply_temp_c,
        row.dhw_temp_c,
        row.boiler_temp_c,
        row.buffer_temp_c,
        row.compressor_power_w,
        row.thermal_power_w,
    ]
    .iter()
    .any(Option::is_some)
        || row.compressor_active.is_some()
}
