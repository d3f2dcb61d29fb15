//! Canonical mapping from a raw NUT variable map to a typed snapshot.
//!
//! The mapper is pure: no I/O, no clock. A missing variable always maps
//! to `None`, never to an error — NUT servers only publish what the
//! driver knows.

use std::collections::HashMap;

use vlt_schemas::{UpsSnapshot, UpsStatus};

/// Derive the canonical status from the raw `ups.status` flag string.
///
/// Matching is case-insensitive. Priority: `OL` wins over everything,
/// then `OB`/`LB`, otherwise (including a missing variable) the UPS is
/// treated as offline.
pub fn derive_status(raw: Option<&str>) -> UpsStatus {
    let Some(raw) = raw else {
        return UpsStatus::UpsOffline;
    };
    let flags = raw.to_uppercase();
    if flags.contains("OL") {
        UpsStatus::Online
    } else if flags.contains("OB") || flags.contains("LB") {
        UpsStatus::OnBattery
    } else {
        UpsStatus::UpsOffline
    }
}

fn float(vars: &HashMap<String, String>, key: &str) -> Option<f64> {
    vars.get(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Percentage-like values round to the nearest integer.
fn int_round(vars: &HashMap<String, String>, key: &str) -> Option<i32> {
    float(vars, key).map(|v| v.round() as i32)
}

/// Time- and count-like values truncate toward zero.
fn int_trunc(vars: &HashMap<String, String>, key: &str) -> Option<i32> {
    float(vars, key).map(|v| v.trunc() as i32)
}

fn text(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Map a raw variable dump for `ups_name` into a typed snapshot.
pub fn map_snapshot(ups_name: &str, vars: &HashMap<String, String>) -> UpsSnapshot {
    let ups_status_raw = vars.get("ups.status").cloned();
    let status = derive_status(ups_status_raw.as_deref());
    let runtime_seconds = int_trunc(vars, "battery.runtime");

    UpsSnapshot {
        ups_id: ups_name.to_lowercase(),
        status,
        ups_status_raw,

        battery_percent: int_round(vars, "battery.charge"),
        runtime_minutes: runtime_seconds.map(|s| s.div_euclid(60)),
        runtime_seconds,
        load_percent: int_round(vars, "ups.load"),
        input_voltage: float(vars, "input.voltage"),
        output_voltage: float(vars, "output.voltage"),

        battery_voltage: float(vars, "battery.voltage"),
        battery_voltage_nominal: float(vars, "battery.voltage.nominal"),
        battery_type: text(vars, "battery.type"),
        battery_date: text(vars, "battery.date"),
        battery_mfr_date: text(vars, "battery.mfr.date"),
        battery_charge_low: int_round(vars, "battery.charge.low"),
        battery_charge_warning: int_round(vars, "battery.charge.warning"),
        battery_runtime_low: int_trunc(vars, "battery.runtime.low"),

        device_mfr: text(vars, "device.mfr"),
        device_model: text(vars, "device.model"),
        device_serial: text(vars, "device.serial"),
        device_type: text(vars, "device.type"),

        driver_name: text(vars, "driver.name"),
        driver_version: text(vars, "driver.version"),
        driver_version_internal: text(vars, "driver.version.internal"),
        driver_version_data: text(vars, "driver.version.data"),
        driver_poll_freq: int_trunc(vars, "driver.parameter.pollfreq"),
        driver_poll_interval: int_trunc(vars, "driver.parameter.pollinterval"),

        input_voltage_nominal: float(vars, "input.voltage.nominal"),
        input_sensitivity: text(vars, "input.sensitivity"),
        input_transfer_high: float(vars, "input.transfer.high"),
        input_transfer_low: float(vars, "input.transfer.low"),

        output_frequency: float(vars, "output.frequency"),
        output_frequency_nominal: float(vars, "output.frequency.nominal"),
        output_voltage_nominal: float(vars, "output.voltage.nominal"),

        ups_beeper_status: text(vars, "ups.beeper.status"),
        ups_delay_shutdown: int_trunc(vars, "ups.delay.shutdown"),
        ups_delay_start: int_trunc(vars, "ups.delay.start"),
        ups_timer_shutdown: int_trunc(vars, "ups.timer.shutdown"),
        ups_timer_start: int_trunc(vars, "ups.timer.start"),
        ups_firmware: text(vars, "ups.firmware"),
        ups_firmware_aux: text(vars, "ups.firmware.aux"),
        ups_mfr: text(vars, "ups.mfr"),
        ups_model: text(vars, "ups.model"),
        ups_productid: text(vars, "ups.productid"),
        ups_vendorid: text(vars, "ups.vendorid"),
        ups_serial: text(vars, "ups.serial"),
        ups_test_result: text(vars, "ups.test.result"),
        ups_realpower_nominal: int_trunc(vars, "ups.realpower.nominal"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn status_priority_table() {
        assert_eq!(derive_status(Some("OL")), UpsStatus::Online);
        assert_eq!(derive_status(Some("OL CHRG")), UpsStatus::Online);
        // OL wins even when LB is present.
        assert_eq!(derive_status(Some("OL LB")), UpsStatus::Online);
        assert_eq!(derive_status(Some("OB")), UpsStatus::OnBattery);
        assert_eq!(derive_status(Some("OB LB")), UpsStatus::OnBattery);
        assert_eq!(derive_status(Some("LB")), UpsStatus::OnBattery);
        assert_eq!(derive_status(Some("")), UpsStatus::UpsOffline);
        assert_eq!(derive_status(Some("CHRG")), UpsStatus::UpsOffline);
        assert_eq!(derive_status(None), UpsStatus::UpsOffline);
    }

    #[test]
    fn status_is_case_insensitive() {
        assert_eq!(derive_status(Some("ol")), UpsStatus::Online);
        assert_eq!(derive_status(Some("ob lb")), UpsStatus::OnBattery);
    }

    #[test]
    fn percent_fields_round_time_fields_truncate() {
        let v = vars(&[
            ("ups.status", "OL"),
            ("battery.charge", "87.4"),
            ("ups.load", "12.6"),
            ("battery.runtime", "125.9"),
            ("ups.delay.shutdown", "20.7"),
        ]);
        let snap = map_snapshot("UPS1", &v);
        assert_eq!(snap.ups_id, "ups1");
        assert_eq!(snap.battery_percent, Some(87));
        assert_eq!(snap.load_percent, Some(13));
        assert_eq!(snap.runtime_seconds, Some(125));
        assert_eq!(snap.ups_delay_shutdown, Some(20));
    }

    #[test]
    fn runtime_minutes_is_floored_seconds_over_sixty() {
        let v = vars(&[("battery.runtime", "119")]);
        let snap = map_snapshot("ups1", &v);
        assert_eq!(snap.runtime_seconds, Some(119));
        assert_eq!(snap.runtime_minutes, Some(1));
    }

    #[test]
    fn missing_keys_map_to_none() {
        let snap = map_snapshot("ups1", &HashMap::new());
        assert_eq!(snap.status, UpsStatus::UpsOffline);
        assert!(snap.ups_status_raw.is_none());
        assert!(snap.battery_percent.is_none());
        assert!(snap.runtime_minutes.is_none());
        assert!(snap.input_voltage.is_none());
        assert!(snap.ups_model.is_none());
    }

    #[test]
    fn unparseable_numbers_map_to_none() {
        let v = vars(&[("battery.charge", "n/a"), ("input.voltage", "")]);
        let snap = map_snapshot("ups1", &v);
        assert!(snap.battery_percent.is_none());
        assert!(snap.input_voltage.is_none());
    }

    #[test]
    fn raw_status_is_kept_verbatim() {
        let v = vars(&[("ups.status", "ol chrg")]);
        let snap = map_snapshot("ups1", &v);
        assert_eq!(snap.ups_status_raw.as_deref(), Some("ol chrg"));
        assert_eq!(snap.status, UpsStatus::Online);
    }

    #[test]
    fn extended_fields_are_mapped() {
        let v = vars(&[
            ("battery.voltage", "13.52"),
            ("battery.type", "PbAc"),
            ("driver.name", "usbhid-ups"),
            ("driver.parameter.pollfreq", "30"),
            ("input.transfer.high", "264"),
            ("ups.beeper.status", "enabled"),
            ("ups.realpower.nominal", "480.9"),
            ("ups.vendorid", "051d"),
        ]);
        let snap = map_snapshot("ups1", &v);
        assert_eq!(snap.battery_voltage, Some(13.52));
        assert_eq!(snap.battery_type.as_deref(), Some("PbAc"));
        assert_eq!(snap.driver_name.as_deref(), Some("usbhid-ups"));
        assert_eq!(snap.driver_poll_freq, Some(30));
        assert_eq!(snap.input_transfer_high, Some(264.0));
        assert_eq!(snap.ups_beeper_status.as_deref(), Some("enabled"));
        assert_eq!(snap.ups_realpower_nominal, Some(480));
        assert_eq!(snap.ups_vendorid.as_deref(), Some("051d"));
    }
}
