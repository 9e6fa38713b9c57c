// Kept in sync with migrations/ by hand.

diesel::table! {
    events (id) {
        id -> BigInt,
        hash -> Text,
        event_time -> BigInt,
        event_type -> Text,
        account_id -> Text,
        installation_id -> Text,
        gateway_serial -> Nullable<Text>,
        device_id -> Nullable<Text>,
        error_code -> Nullable<Text>,
        error_description -> Nullable<Text>,
        category -> Text,
        severity -> Text,
        feature_name -> Nullable<Text>,
        feature_value -> Nullable<Text>,
        active -> Nullable<Bool>,
        body -> Nullable<Text>,
        created_at -> BigInt,
    }
}

diesel::table! {
    temperature_snapshots (id) {
        id -> BigInt,
        sample_time -> BigInt,
        account_id -> Text,
        installation_id -> Text,
        gateway_id -> Text,
        device_id -> Text,
        outside_temp_c -> Nullable<Double>,
        room_temp_c -> Nullable<Double>,
        supply_temp_c -> Nullable<Double>,
        target_supply_temp_c -> Nullable<Double>,
        return_temp_c -> Nullable<Double>,
        primary_supply_temp_c -> Nullable<Double>,
        primary_return_temp_c -> Nullable<Double>,
        secondary_supply_temp_c -> Nullable<Double>,
        secondary_return_temp_c -> Nullable<Double>,
        dhw_temp_c -> Nullable<Double>,
        dhw_top_temp_c -> Nullable<Double>,
        dhw_bottom_temp_c -> Nullable<Double>,
        dhw_target_temp_c -> Nullable<Double>,
        boiler_temp_c -> Nullable<Double>,
        buffer_temp_c -> Nullable<Double>,
        buffer_top_temp_c -> Nullable<Double>,
        heating_curve_slope -> Nullable<Double>,
        heating_curve_shift -> Nullable<Double>,
        compressor_active -> Nullable<Bool>,
        compressor_speed_rps -> Nullable<Double>,
        compressor_power_w -> Nullable<Double>,
        compressor_inlet_temp_c -> Nullable<Double>,
        compressor_outlet_temp_c -> Nullable<Double>,
        compressor_inlet_pressure_bar -> Nullable<Double>,
        thermal_power_w -> Nullable<Double>,
        volumetric_flow_lph -> Nullable<Double>,
        burner_modulation_pct -> Nullable<Double>,
        circulation_pump_active -> Nullable<Bool>,
        dhw_pump_active -> Nullable<Bool>,
        four_way_valve -> Nullable<Text>,
        sample_interval_min -> Nullable<Integer>,
    }
}

// Single-row tables (id = 1)
diesel::table! {
    event_archive_settings (id) {
        id -> Integer,
        enabled -> Bool,
        interval_minutes -> Integer,
        retention_days -> Integer,
        days_back -> Integer,
        updated_at -> BigInt,
    }
}

diesel::table! {
    temperature_log_settings (id) {
        id -> Integer,
        enabled -> Bool,
        sample_interval_minutes -> Integer,
        retention_days -> Integer,
        updated_at -> BigInt,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    events,
    temperature_snapshots,
    event_archive_settings,
    temperature_log_settings,
);
