use super::{Connector, SqlValue, Storage};
use crate::controller::{ControlSample, WindowSource};
use crate::config::DbConfig;
use crate::error::StorageError;
use crate::schema::{ColumnKind, ColumnSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres, Row};
use std::str::FromStr;
use tracing::debug;

pub type DbPool = Pool<Postgres>;

const DUPLICATE_TABLE: &str = "42P07";

/// Connection options from `database.url`. `database.user` and
/// `database.password` fill in whatever the URL leaves out.
pub fn connect_options(cfg: &DbConfig) -> Result<PgConnectOptions, StorageError> {
    let mut opts = PgConnectOptions::from_str(&cfg.url)?;
    let (has_user, has_password) = url_credentials(&cfg.url);
    if let (false, Some(user)) = (has_user, &cfg.user) {
        opts = opts.username(user);
    }
    if let (false, Some(password)) = (has_password, &cfg.password) {
        opts = opts.password(password);
    }
    Ok(opts)
}

/// Whether the URL's authority carries a user name and a password.
fn url_credentials(url: &str) -> (bool, bool) {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    match authority.rsplit_once('@') {
        Some((userinfo, _)) => match userinfo.split_once(':') {
            Some((user, password)) => (!user.is_empty(), !password.is_empty()),
            None => (!userinfo.is_empty(), false),
        },
        None => (false, false),
    }
}

pub async fn connect(
    options: PgConnectOptions,
    max_connections: u32,
) -> Result<DbPool, StorageError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(classify)?;
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    max_connections: u32,
}

impl PgConnector {
    pub fn new(options: PgConnectOptions, max_connections: u32) -> Self {
        Self {
            options,
            max_connections,
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn Storage>, StorageError> {
        let pool = connect(self.options.clone(), self.max_connections).await?;
        Ok(Box::new(PgStorage::new(pool)))
    }
}

pub struct PgStorage {
    pool: DbPool,
}

impl PgStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), StorageError> {
        let sql = create_table_sql(table, columns);
        debug!(table = %table, sql = %sql, "creating table");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| schema_error(table, e))?;
        Ok(())
    }

    async fn adapt_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), StorageError> {
        if columns.is_empty() {
            return Ok(());
        }
        let sql = adapt_table_sql(table, columns);
        debug!(table = %table, sql = %sql, "altering table");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| schema_error(table, e))?;
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let cols: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns WHERE table_name = $1 ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        Ok(cols)
    }

    async fn insert(
        &self,
        table: &str,
        fields: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let sql = insert_sql(table, fields, rows.len());
        let mut q = sqlx::query(&sql);
        for row in rows {
            for b in row {
                q = match b {
                    SqlValue::Ts(v) => q.bind(*v),
                    SqlValue::Text(v) => q.bind(v.clone()),
                    SqlValue::F64(v) => q.bind(*v),
                    SqlValue::I64(v) => q.bind(*v),
                };
            }
        }
        q.execute(&self.pool).await.map_err(|e| match classify(e) {
            StorageError::Db(e) => StorageError::Insert {
                table: table.to_string(),
                reason: e.to_string(),
            },
            other => other,
        })?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(kind: ColumnKind) -> String {
    match kind {
        ColumnKind::Text(len) => format!("VARCHAR({len})"),
        ColumnKind::Integer => "BIGINT".into(),
        ColumnKind::Decimal => "DOUBLE PRECISION".into(),
        ColumnKind::Timestamp => "TIMESTAMPTZ".into(),
    }
}

fn create_table_sql(table: &str, columns: &[ColumnSpec]) -> String {
    let defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.kind)))
        .collect();
    format!("CREATE TABLE {} ({})", quote_ident(table), defs.join(", "))
}

fn adapt_table_sql(table: &str, columns: &[ColumnSpec]) -> String {
    let adds: Vec<String> = columns
        .iter()
        .map(|c| {
            format!(
                "ADD COLUMN IF NOT EXISTS {} {}",
                quote_ident(&c.name),
                sql_type(c.kind)
            )
        })
        .collect();
    format!("ALTER TABLE {} {}", quote_ident(table), adds.join(", "))
}

fn insert_sql(table: &str, fields: &[String], row_count: usize) -> String {
    let columns: Vec<String> = fields.iter().map(|f| quote_ident(f)).collect();
    let mut values_placeholders: Vec<String> = Vec::with_capacity(row_count);
    let mut arg_index = 1;
    for _ in 0..row_count {
        let mut tuple = Vec::with_capacity(fields.len());
        for _ in fields {
            tuple.push(format!("${}", arg_index));
            arg_index += 1;
        }
        values_placeholders.push(format!("({})", tuple.join(", ")));
    }
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        columns.join(", "),
        values_placeholders.join(", ")
    )
}

fn classify(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(DUPLICATE_TABLE) {
            return StorageError::AlreadyExists(db.message().to_string());
        }
    }
    let err = StorageError::Db(e);
    if err.is_connection_closed() {
        StorageError::ConnectionClosed(err.to_string())
    } else {
        err
    }
}

fn schema_error(table: &str, e: sqlx::Error) -> StorageError {
    match classify(e) {
        StorageError::Db(e) => StorageError::Schema {
            table: table.to_string(),
            reason: e.to_string(),
        },
        other => other,
    }
}

/// Reads the control window by joining the inverter quota table, the battery
/// quota table and the house energy meter table over the last 30 minutes.
pub struct PgWindowSource {
    pool: DbPool,
    query: String,
    inverter_sn: String,
    battery_sn: String,
}

impl PgWindowSource {
    pub fn new(
        pool: DbPool,
        inverter_table: &str,
        battery_table: &str,
        energy_table: &str,
        inverter_sn: impl Into<String>,
        battery_sn: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            query: window_sql(inverter_table, battery_table, energy_table),
            inverter_sn: inverter_sn.into(),
            battery_sn: battery_sn.into(),
        }
    }
}

fn window_sql(inverter_table: &str, battery_table: &str, energy_table: &str) -> String {
    format!(
        r#"
        SELECT
            h.inserted_on::timestamptz AS ts,
            ((q.eco_20_1_pv1inputwatts + q.eco_20_1_pv2inputwatts) / 10)::bigint AS solargen,
            abs(least(q.eco_20_1_batinputwatts::float8 / 10, 0))::float8 AS batinput,
            abs(greatest(q.eco_20_1_batinputwatts::float8 / 10, 0))::float8 AS batout,
            (q.eco_20_1_genewatt / 10)::bigint AS housein,
            abs(q.eco_20_1_gridconswatts::float8 / 10)::float8 AS gridwatts,
            (q.eco_20_1_invdemandwatts / 10)::bigint AS requested,
            q.eco_20_1_bmsreqchgamp::bigint AS batreqfill,
            h.powercurr::bigint AS powercurr,
            h.powerout::bigint AS powerout,
            b.eco_bms_bmsstatus_actsoc::bigint AS batfill
        FROM {inverter} q, {energy} h, {battery} b
        WHERE q.serial_number = upper($1)
          AND b.serial_number = upper($2)
          AND h.inserted_on >= NOW() - '30 minute'::INTERVAL
          AND q.timestamp >= NOW() - '30 minute'::INTERVAL
          AND b.timestamp >= NOW() - '30 minute'::INTERVAL
          AND to_char(to_timestamp(q.eco_20_1_utctime), 'YYYYMMDD HH24MI') = to_char(h.inserted_on, 'YYYYMMDD HH24MI')
          AND to_char(b.timestamp, 'YYYYMMDD HH24MI') = to_char(h.inserted_on, 'YYYYMMDD HH24MI')
        ORDER BY h.inserted_on DESC, q.timestamp DESC
        LIMIT $3
        "#,
        inverter = quote_ident(inverter_table),
        battery = quote_ident(battery_table),
        energy = quote_ident(energy_table),
    )
}

#[async_trait]
impl WindowSource for PgWindowSource {
    async fn read_window(&self, size: usize) -> Result<Vec<ControlSample>, StorageError> {
        let rows = sqlx::query(&self.query)
            .bind(&self.inverter_sn)
            .bind(&self.battery_sn)
            .bind(size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        let mut window = Vec::with_capacity(rows.len());
        for row in rows {
            let int = |col: &str| -> Result<i64, sqlx::Error> {
                Ok(row.try_get::<Option<i64>, _>(col)?.unwrap_or_default())
            };
            let float = |col: &str| -> Result<f64, sqlx::Error> {
                Ok(row.try_get::<Option<f64>, _>(col)?.unwrap_or_default())
            };
            window.push(ControlSample {
                timestamp: row.try_get::<DateTime<Utc>, _>("ts").map_err(classify)?,
                solar_gen: int("solargen").map_err(classify)?,
                bat_input: float("batinput").map_err(classify)?,
                bat_output: float("batout").map_err(classify)?,
                house_in: int("housein").map_err(classify)?,
                grid_watts: float("gridwatts").map_err(classify)?,
                requested: int("requested").map_err(classify)?,
                bat_req_fill: int("batreqfill").map_err(classify)?,
                power_curr: int("powercurr").map_err(classify)?,
                power_out: int("powerout").map_err(classify)?,
                bat_fill: int("batfill").map_err(classify)?,
            });
        }
        Ok(window)
    }
}
