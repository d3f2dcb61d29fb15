//! UPS snapshot repository.
//!
//! Single-writer: only the poller calls [`upsert_snapshot`] and
//! [`register_failure`]; the HTTP layer only reads. `register_failure`
//! takes a row lock so the increment-and-promote step is atomic.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::Postgres;
use sqlx::PgPool;
use vlt_schemas::{DataSource, FailureOutcome, UpsRow, UpsSnapshot, UpsStatus};

/// Consecutive failed polls after which a UPS is promoted to `ups_offline`.
pub const OFFLINE_FAILURE_THRESHOLD: i32 = 3;

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct DbUpsRow {
    ups_id: String,
    data_source: String,
    status: String,
    ups_status_raw: Option<String>,
    battery_percent: Option<i32>,
    runtime_minutes: Option<i32>,
    runtime_seconds: Option<i32>,
    load_percent: Option<i32>,
    input_voltage: Option<f64>,
    output_voltage: Option<f64>,
    battery_voltage: Option<f64>,
    battery_voltage_nominal: Option<f64>,
    battery_type: Option<String>,
    battery_date: Option<String>,
    battery_mfr_date: Option<String>,
    battery_charge_low: Option<i32>,
    battery_charge_warning: Option<i32>,
    battery_runtime_low: Option<i32>,
    device_mfr: Option<String>,
    device_model: Option<String>,
    device_serial: Option<String>,
    device_type: Option<String>,
    driver_name: Option<String>,
    driver_version: Option<String>,
    driver_version_internal: Option<String>,
    driver_version_data: Option<String>,
    driver_poll_freq: Option<i32>,
    driver_poll_interval: Option<i32>,
    input_voltage_nominal: Option<f64>,
    input_sensitivity: Option<String>,
    input_transfer_high: Option<f64>,
    input_transfer_low: Option<f64>,
    output_frequency: Option<f64>,
    output_frequency_nominal: Option<f64>,
    output_voltage_nominal: Option<f64>,
    ups_beeper_status: Option<String>,
    ups_delay_shutdown: Option<i32>,
    ups_delay_start: Option<i32>,
    ups_timer_shutdown: Option<i32>,
    ups_timer_start: Option<i32>,
    ups_firmware: Option<String>,
    ups_firmware_aux: Option<String>,
    ups_mfr: Option<String>,
    ups_model: Option<String>,
    ups_productid: Option<String>,
    ups_vendorid: Option<String>,
    ups_serial: Option<String>,
    ups_test_result: Option<String>,
    ups_realpower_nominal: Option<i32>,
    consecutive_failures: i32,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl DbUpsRow {
    fn into_row(self) -> Result<UpsRow> {
        let status = UpsStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("invalid status in ups row: {:?}", self.status))?;
        let data_source = DataSource::parse(&self.data_source)
            .ok_or_else(|| anyhow!("invalid data_source in ups row: {:?}", self.data_source))?;

        Ok(UpsRow {
            snapshot: UpsSnapshot {
                ups_id: self.ups_id,
                status,
                ups_status_raw: self.ups_status_raw,
                battery_percent: self.battery_percent,
                runtime_minutes: self.runtime_minutes,
                runtime_seconds: self.runtime_seconds,
                load_percent: self.load_percent,
                input_voltage: self.input_voltage,
                output_voltage: self.output_voltage,
                battery_voltage: self.battery_voltage,
                battery_voltage_nominal: self.battery_voltage_nominal,
                battery_type: self.battery_type,
                battery_date: self.battery_date,
                battery_mfr_date: self.battery_mfr_date,
                battery_charge_low: self.battery_charge_low,
                battery_charge_warning: self.battery_charge_warning,
                battery_runtime_low: self.battery_runtime_low,
                device_mfr: self.device_mfr,
                device_model: self.device_model,
                device_serial: self.device_serial,
                device_type: self.device_type,
                driver_name: self.driver_name,
                driver_version: self.driver_version,
                driver_version_internal: self.driver_version_internal,
                driver_version_data: self.driver_version_data,
                driver_poll_freq: self.driver_poll_freq,
                driver_poll_interval: self.driver_poll_interval,
                input_voltage_nominal: self.input_voltage_nominal,
                input_sensitivity: self.input_sensitivity,
                input_transfer_high: self.input_transfer_high,
                input_transfer_low: self.input_transfer_low,
                output_frequency: self.output_frequency,
                output_frequency_nominal: self.output_frequency_nominal,
                output_voltage_nominal: self.output_voltage_nominal,
                ups_beeper_status: self.ups_beeper_status,
                ups_delay_shutdown: self.ups_delay_shutdown,
                ups_delay_start: self.ups_delay_start,
                ups_timer_shutdown: self.ups_timer_shutdown,
                ups_timer_start: self.ups_timer_start,
                ups_firmware: self.ups_firmware,
                ups_firmware_aux: self.ups_firmware_aux,
                ups_mfr: self.ups_mfr,
                ups_model: self.ups_model,
                ups_productid: self.ups_productid,
                ups_vendorid: self.ups_vendorid,
                ups_serial: self.ups_serial,
                ups_test_result: self.ups_test_result,
                ups_realpower_nominal: self.ups_realpower_nominal,
            },
            data_source,
            consecutive_failures: self.consecutive_failures,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Upsert
// ---------------------------------------------------------------------------

const UPSERT_SQL: &str = r#"
insert into ups (
  ups_id, data_source, status, ups_status_raw,
  battery_percent, runtime_minutes, runtime_seconds, load_percent,
  input_voltage, output_voltage,
  battery_voltage, battery_voltage_nominal, battery_type, battery_date,
  battery_mfr_date, battery_charge_low, battery_charge_warning,
  battery_runtime_low,
  device_mfr, device_model, device_serial, device_type,
  driver_name, driver_version, driver_version_internal, driver_version_data,
  driver_poll_freq, driver_poll_interval,
  input_voltage_nominal, input_sensitivity, input_transfer_high,
  input_transfer_low,
  output_frequency, output_frequency_nominal, output_voltage_nominal,
  ups_beeper_status, ups_delay_shutdown, ups_delay_start,
  ups_timer_shutdown, ups_timer_start,
  ups_firmware, ups_firmware_aux, ups_mfr, ups_model,
  ups_productid, ups_vendorid, ups_serial, ups_test_result,
  ups_realpower_nominal,
  consecutive_failures, updated_at
) values (
  $1, 'nut', $2, $3,
  $4, $5, $6, $7,
  $8, $9,
  $10, $11, $12, $13,
  $14, $15, $16,
  $17,
  $18, $19, $20, $21,
  $22, $23, $24, $25,
  $26, $27,
  $28, $29, $30,
  $31,
  $32, $33, $34,
  $35, $36, $37,
  $38, $39,
  $40, $41, $42, $43,
  $44, $45, $46, $47,
  $48,
  0, now()
)
on conflict (ups_id) do update set
  data_source = 'nut',
  status = excluded.status,
  ups_status_raw = excluded.ups_status_raw,
  battery_percent = excluded.battery_percent,
  runtime_minutes = excluded.runtime_minutes,
  runtime_seconds = excluded.runtime_seconds,
  load_percent = excluded.load_percent,
  input_voltage = excluded.input_voltage,
  output_voltage = excluded.output_voltage,
  battery_voltage = excluded.battery_voltage,
  battery_voltage_nominal = excluded.battery_voltage_nominal,
  battery_type = excluded.battery_type,
  battery_date = excluded.battery_date,
  battery_mfr_date = excluded.battery_mfr_date,
  battery_charge_low = excluded.battery_charge_low,
  battery_charge_warning = excluded.battery_charge_warning,
  battery_runtime_low = excluded.battery_runtime_low,
  device_mfr = excluded.device_mfr,
  device_model = excluded.device_model,
  device_serial = excluded.device_serial,
  device_type = excluded.device_type,
  driver_name = excluded.driver_name,
  driver_version = excluded.driver_version,
  driver_version_internal = excluded.driver_version_internal,
  driver_version_data = excluded.driver_version_data,
  driver_poll_freq = excluded.driver_poll_freq,
  driver_poll_interval = excluded.driver_poll_interval,
  input_voltage_nominal = excluded.input_voltage_nominal,
  input_sensitivity = excluded.input_sensitivity,
  input_transfer_high = excluded.input_transfer_high,
  input_transfer_low = excluded.input_transfer_low,
  output_frequency = excluded.output_frequency,
  output_frequency_nominal = excluded.output_frequency_nominal,
  output_voltage_nominal = excluded.output_voltage_nominal,
  ups_beeper_status = excluded.ups_beeper_status,
  ups_delay_shutdown = excluded.ups_delay_shutdown,
  ups_delay_start = excluded.ups_delay_start,
  ups_timer_shutdown = excluded.ups_timer_shutdown,
  ups_timer_start = excluded.ups_timer_start,
  ups_firmware = excluded.ups_firmware,
  ups_firmware_aux = excluded.ups_firmware_aux,
  ups_mfr = excluded.ups_mfr,
  ups_model = excluded.ups_model,
  ups_productid = excluded.ups_productid,
  ups_vendorid = excluded.ups_vendorid,
  ups_serial = excluded.ups_serial,
  ups_test_result = excluded.ups_test_result,
  ups_realpower_nominal = excluded.ups_realpower_nominal,
  consecutive_failures = 0,
  updated_at = now()
returning *
"#;

fn bind_snapshot<'q>(
    query: sqlx::query::QueryAs<'q, Postgres, DbUpsRow, sqlx::postgres::PgArguments>,
    snap: &'q UpsSnapshot,
) -> sqlx::query::QueryAs<'q, Postgres, DbUpsRow, sqlx::postgres::PgArguments> {
    query
        .bind(&snap.ups_id)
        .bind(snap.status.as_str())
        .bind(&snap.ups_status_raw)
        .bind(snap.battery_percent)
        .bind(snap.runtime_minutes)
        .bind(snap.runtime_seconds)
        .bind(snap.load_percent)
        .bind(snap.input_voltage)
        .bind(snap.output_voltage)
        .bind(snap.battery_voltage)
        .bind(snap.battery_voltage_nominal)
        .bind(&snap.battery_type)
        .bind(&snap.battery_date)
        .bind(&snap.battery_mfr_date)
        .bind(snap.battery_charge_low)
        .bind(snap.battery_charge_warning)
        .bind(snap.battery_runtime_low)
        .bind(&snap.device_mfr)
        .bind(&snap.device_model)
        .bind(&snap.device_serial)
        .bind(&snap.device_type)
        .bind(&snap.driver_name)
        .bind(&snap.driver_version)
        .bind(&snap.driver_version_internal)
        .bind(&snap.driver_version_data)
        .bind(snap.driver_poll_freq)
        .bind(snap.driver_poll_interval)
        .bind(snap.input_voltage_nominal)
        .bind(&snap.input_sensitivity)
        .bind(snap.input_transfer_high)
        .bind(snap.input_transfer_low)
        .bind(snap.output_frequency)
        .bind(snap.output_frequency_nominal)
        .bind(snap.output_voltage_nominal)
        .bind(&snap.ups_beeper_status)
        .bind(snap.ups_delay_shutdown)
        .bind(snap.ups_delay_start)
        .bind(snap.ups_timer_shutdown)
        .bind(snap.ups_timer_start)
        .bind(&snap.ups_firmware)
        .bind(&snap.ups_firmware_aux)
        .bind(&snap.ups_mfr)
        .bind(&snap.ups_model)
        .bind(&snap.ups_productid)
        .bind(&snap.ups_vendorid)
        .bind(&snap.ups_serial)
        .bind(&snap.ups_test_result)
        .bind(snap.ups_realpower_nominal)
}

/// Write a successful poll result, resetting the failure counter.
///
/// Returns the stored row and the status the row had before this write
/// (`None` when the row was just created).
pub async fn upsert_snapshot(
    pool: &PgPool,
    snap: &UpsSnapshot,
) -> Result<(UpsRow, Option<UpsStatus>)> {
    let mut tx = pool.begin().await.context("upsert begin failed")?;

    let previous: Option<(String,)> =
        sqlx::query_as::<_, (String,)>("select status from ups where ups_id = $1 for update")
            .bind(&snap.ups_id)
            .fetch_optional(&mut *tx)
            .await
            .context("upsert previous-status query failed")?;

    let row = bind_snapshot(sqlx::query_as::<_, DbUpsRow>(UPSERT_SQL), snap)
        .fetch_one(&mut *tx)
        .await
        .context("upsert_snapshot failed")?;

    tx.commit().await.context("upsert commit failed")?;

    let previous_status = previous.and_then(|(s,)| UpsStatus::parse(&s));
    Ok((row.into_row()?, previous_status))
}

// ---------------------------------------------------------------------------
// Failure registration
// ---------------------------------------------------------------------------

const CLEAR_METRICS_SQL: &str = r#"
update ups set
  status = 'ups_offline',
  consecutive_failures = $2,
  updated_at = now(),
  ups_status_raw = null,
  battery_percent = null,
  runtime_minutes = null,
  runtime_seconds = null,
  load_percent = null,
  input_voltage = null,
  output_voltage = null,
  battery_voltage = null,
  battery_voltage_nominal = null,
  battery_type = null,
  battery_date = null,
  battery_mfr_date = null,
  battery_charge_low = null,
  battery_charge_warning = null,
  battery_runtime_low = null,
  device_mfr = null,
  device_model = null,
  device_serial = null,
  device_type = null,
  driver_name = null,
  driver_version = null,
  driver_version_internal = null,
  driver_version_data = null,
  driver_poll_freq = null,
  driver_poll_interval = null,
  input_voltage_nominal = null,
  input_sensitivity = null,
  input_transfer_high = null,
  input_transfer_low = null,
  output_frequency = null,
  output_frequency_nominal = null,
  output_voltage_nominal = null,
  ups_beeper_status = null,
  ups_delay_shutdown = null,
  ups_delay_start = null,
  ups_timer_shutdown = null,
  ups_timer_start = null,
  ups_firmware = null,
  ups_firmware_aux = null,
  ups_mfr = null,
  ups_model = null,
  ups_productid = null,
  ups_vendorid = null,
  ups_serial = null,
  ups_test_result = null,
  ups_realpower_nominal = null
where ups_id = $1
returning *
"#;

/// Record a failed poll for `ups_id`.
///
/// Returns `None` when the UPS was never polled successfully (no row).
/// At [`OFFLINE_FAILURE_THRESHOLD`] consecutive failures the row is
/// promoted to `ups_offline` with every metric column nulled.
pub async fn register_failure(pool: &PgPool, ups_id: &str) -> Result<Option<FailureOutcome>> {
    let mut tx = pool.begin().await.context("register_failure begin failed")?;

    let existing = sqlx::query_as::<_, DbUpsRow>("select * from ups where ups_id = $1 for update")
        .bind(ups_id)
        .fetch_optional(&mut *tx)
        .await
        .context("register_failure load failed")?;

    let Some(existing) = existing else {
        tx.rollback().await.ok();
        return Ok(None);
    };

    let previous_status = UpsStatus::parse(&existing.status)
        .ok_or_else(|| anyhow!("invalid status in ups row: {:?}", existing.status))?;
    let failures = existing.consecutive_failures + 1;
    let promote =
        failures >= OFFLINE_FAILURE_THRESHOLD && previous_status != UpsStatus::UpsOffline;

    let row = if promote {
        sqlx::query_as::<_, DbUpsRow>(CLEAR_METRICS_SQL)
            .bind(ups_id)
            .bind(failures)
            .fetch_one(&mut *tx)
            .await
            .context("register_failure promote failed")?
    } else {
        sqlx::query_as::<_, DbUpsRow>(
            "update ups set consecutive_failures = $2, updated_at = now() \
             where ups_id = $1 returning *",
        )
        .bind(ups_id)
        .bind(failures)
        .fetch_one(&mut *tx)
        .await
        .context("register_failure increment failed")?
    };

    tx.commit().await.context("register_failure commit failed")?;

    Ok(Some(FailureOutcome {
        row: row.into_row()?,
        previous_status,
        status_changed: promote,
    }))
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub async fn fetch_all(pool: &PgPool) -> Result<Vec<UpsRow>> {
    let rows = sqlx::query_as::<_, DbUpsRow>("select * from ups order by ups_id")
        .fetch_all(pool)
        .await
        .context("fetch_all ups failed")?;
    rows.into_iter().map(DbUpsRow::into_row).collect()
}

pub async fn fetch_by_id(pool: &PgPool, ups_id: &str) -> Result<Option<UpsRow>> {
    let row = sqlx::query_as::<_, DbUpsRow>("select * from ups where ups_id = $1")
        .bind(ups_id)
        .fetch_optional(pool)
        .await
        .context("fetch_by_id ups failed")?;
    row.map(DbUpsRow::into_row).transpose()
}
