use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use chrono::NaiveDate;
use rusqlite::{Connection, OpenFlags, params, params_from_iter, types::Value};
use tracing::{debug, info};

use crate::{
    data::{
        domain::{EntityId, IndexCode},
        observation::RawObservation,
        window::{Mode, WindowSpec},
    },
    error::{EngineError, EngineResult, SetupError, StoreError},
    report::flow_batch::flow_column,
    store::{ClassificationLookup, ObservationSource, ResultSink, on_or_after},
    window::{FlowRecord, MetricRecord},
};

const SOURCE_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS quota_observations (
        fund_code   TEXT NOT NULL,
        sub_class   TEXT,
        date        TEXT NOT NULL,
        quota_value REAL
    );
    CREATE INDEX IF NOT EXISTS idx_quota_date ON quota_observations(date);

    CREATE TABLE IF NOT EXISTS benchmark_levels (
        date       TEXT NOT NULL,
        index_code TEXT NOT NULL,
        value      REAL
    );
    CREATE INDEX IF NOT EXISTS idx_benchmark_code ON benchmark_levels(index_code, date);

    CREATE TABLE IF NOT EXISTS fund_classification (
        fund_code   TEXT NOT NULL,
        asset_class TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS allocator_positions (
        allocator    TEXT NOT NULL,
        asset_class  TEXT NOT NULL,
        date         TEXT NOT NULL,
        market_value REAL
    );
"#;

const DESTINATION_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS fund_metrics (
        entity_key        TEXT NOT NULL,
        fund_code         TEXT NOT NULL,
        sub_class         TEXT,
        reference_date    TEXT NOT NULL,
        "window"          TEXT NOT NULL,
        "return"          REAL NOT NULL,
        volatility        REAL,
        max_drawdown      REAL NOT NULL,
        recovery_time     REAL NOT NULL,
        sharpe            REAL,
        calmar            REAL,
        hit_ratio         REAL NOT NULL,
        information_ratio REAL,
        UNIQUE (entity_key, reference_date, "window")
    );
    CREATE INDEX IF NOT EXISTS idx_fund_metrics_date ON fund_metrics(reference_date);

    CREATE TABLE IF NOT EXISTS fund_flow (
        allocator      TEXT NOT NULL,
        asset_class    TEXT NOT NULL,
        reference_date TEXT NOT NULL,
        total_position REAL NOT NULL,
        UNIQUE (allocator, asset_class, reference_date)
    );
    CREATE INDEX IF NOT EXISTS idx_fund_flow_date ON fund_flow(reference_date);
"#;

/// SQLite adapter for the source tables and the destination tables.
///
/// Dates are stored as ISO-8601 text so range filters compare lexicographically.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens an existing source database without write access.
    pub fn open_source(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(
            |e| SetupError::SourceUnreachable {
                path: path.display().to_string(),
                msg: e.to_string(),
            },
        )?;
        debug!(path = %path.display(), "Opened source store");
        Ok(Self { conn })
    }

    /// Opens or creates a destination database and ensures its tables exist.
    pub fn open_destination(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let unreachable = |e: rusqlite::Error| SetupError::DestinationUnreachable {
            path: path.display().to_string(),
            msg: e.to_string(),
        };
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(unreachable)?;
        conn.execute_batch(DESTINATION_SCHEMA).map_err(unreachable)?;
        debug!(path = %path.display(), "Opened destination store");
        Ok(Self { conn })
    }

    /// Private database holding both source and destination tables.
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::from)?;
        conn.execute_batch(SOURCE_SCHEMA).map_err(StoreError::from)?;
        conn.execute_batch(DESTINATION_SCHEMA).map_err(StoreError::from)?;
        Ok(Self { conn })
    }

    /// Creates the source tables on a writable store.
    pub fn init_source_schema(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(SOURCE_SCHEMA)
            .map_err(StoreError::from)?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn insert_valuation(
        &self,
        code: &str,
        sub_class: Option<&str>,
        date: &str,
        value: Option<f64>,
    ) -> EngineResult<()> {
        self.conn
            .execute(
                "INSERT INTO quota_observations (fund_code, sub_class, date, quota_value)
                 VALUES (?1, ?2, ?3, ?4)",
                params![code, sub_class, date, value],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    pub fn insert_index_level(&self, code: &str, date: &str, value: Option<f64>) -> EngineResult<()> {
        self.conn
            .execute(
                "INSERT INTO benchmark_levels (date, index_code, value) VALUES (?1, ?2, ?3)",
                params![date, code, value],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    pub fn insert_classification(&self, code: &str, asset_class: &str) -> EngineResult<()> {
        self.conn
            .execute(
                "INSERT INTO fund_classification (fund_code, asset_class) VALUES (?1, ?2)",
                params![code, asset_class],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    pub fn insert_position(
        &self,
        allocator: &str,
        asset_class: &str,
        date: &str,
        market_value: Option<f64>,
    ) -> EngineResult<()> {
        self.conn
            .execute(
                "INSERT INTO allocator_positions (allocator, asset_class, date, market_value)
                 VALUES (?1, ?2, ?3, ?4)",
                params![allocator, asset_class, date, market_value],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Number of rows persisted at `reference_date` for `mode`.
    pub fn count_rows(&self, mode: Mode, reference_date: NaiveDate) -> EngineResult<usize> {
        let sql = match mode {
            Mode::Metrics => "SELECT COUNT(*) FROM fund_metrics WHERE reference_date = ?1",
            Mode::Flow => "SELECT COUNT(*) FROM fund_flow WHERE reference_date = ?1",
        };
        let n: i64 = self
            .conn
            .query_row(sql, params![reference_date.to_string()], |row| row.get(0))
            .map_err(StoreError::from)?;
        Ok(n as usize)
    }

    fn query_observations(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<RawObservation>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(RawObservation {
                code: row.get(0)?,
                qualifier: row.get(1)?,
                date: row.get(2)?,
                value: row.get(3)?,
                seq: row.get(4)?,
            });
        }
        Ok(out)
    }

    fn flow_columns(&self) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self.conn.prepare("PRAGMA table_info(fund_flow)")?;
        let mut rows = stmt.query([])?;
        let mut columns = HashSet::new();
        while let Some(row) = rows.next()? {
            columns.insert(row.get::<_, String>(1)?);
        }
        Ok(columns)
    }

    /// Adds a `flow_<window>` column for every window not yet present.
    fn ensure_flow_columns(&self, windows: &[WindowSpec]) -> Result<(), StoreError> {
        let existing = self.flow_columns()?;
        for window in windows {
            let column = flow_column(window);
            if !existing.contains(&column) {
                self.conn.execute_batch(&format!(
                    "ALTER TABLE fund_flow ADD COLUMN \"{column}\" REAL"
                ))?;
                info!(column = %column, "Added flow column");
            }
        }
        Ok(())
    }

    fn insert_metrics(&self, records: &[MetricRecord]) -> Result<usize, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"INSERT INTO fund_metrics (
                    entity_key, fund_code, sub_class, reference_date, "window",
                    "return", volatility, max_drawdown, recovery_time,
                    sharpe, calmar, hit_ratio, information_ratio
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
            )?;
            for r in records {
                stmt.execute(params![
                    r.entity.key(),
                    r.entity.code(),
                    r.entity.sub_class(),
                    r.reference_date.to_string(),
                    r.window,
                    r.ret,
                    r.volatility,
                    r.max_drawdown,
                    r.recovery_time,
                    r.sharpe,
                    r.calmar,
                    r.hit_ratio,
                    r.information_ratio,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn insert_flows(
        &self,
        reference_date: NaiveDate,
        records: &[FlowRecord],
        windows: &[WindowSpec],
    ) -> Result<usize, StoreError> {
        self.ensure_flow_columns(windows)?;

        let flow_columns: Vec<String> = windows
            .iter()
            .map(|w| format!("\"{}\"", flow_column(w)))
            .collect();
        let placeholders: Vec<String> = (1..=4 + windows.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO fund_flow (allocator, asset_class, reference_date, total_position, {}) \
             VALUES ({})",
            flow_columns.join(", "),
            placeholders.join(", ")
        );

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for r in records {
                let mut values = vec![
                    Value::Text(r.allocator().to_string()),
                    Value::Text(r.asset_class().to_string()),
                    Value::Text(reference_date.to_string()),
                    Value::Real(r.total_position),
                ];
                for window in windows {
                    values.push(r.flow(window.label()).map_or(Value::Null, Value::Real));
                }
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }
}

impl ObservationSource for SqliteStore {
    fn valuations(&self, since: NaiveDate) -> EngineResult<Vec<RawObservation>> {
        // Raw dates come in several formats, so the cutoff is applied after parsing.
        let rows = self.query_observations(
            "SELECT fund_code, sub_class, date, quota_value, rowid
             FROM quota_observations
             ORDER BY rowid",
            &[],
        )?;
        Ok(rows
            .into_iter()
            .filter(|row| on_or_after(&row.date, since))
            .collect())
    }

    fn positions(&self) -> EngineResult<Vec<RawObservation>> {
        Ok(self.query_observations(
            "SELECT allocator, asset_class, date, SUM(market_value), MIN(rowid)
             FROM allocator_positions
             GROUP BY allocator, asset_class, date
             ORDER BY allocator, asset_class, date",
            &[],
        )?)
    }

    fn index_levels(
        &self,
        code: &IndexCode,
        since: NaiveDate,
    ) -> EngineResult<Vec<RawObservation>> {
        let rows = self.query_observations(
            "SELECT index_code, NULL, date, value, rowid
             FROM benchmark_levels
             WHERE index_code = ?1
             ORDER BY rowid",
            &[&code.0],
        )?;
        Ok(rows
            .into_iter()
            .filter(|row| on_or_after(&row.date, since))
            .collect())
    }
}

impl ClassificationLookup for SqliteStore {
    fn asset_class_labels(&self) -> EngineResult<HashMap<String, String>> {
        let read = || -> Result<HashMap<String, String>, StoreError> {
            let mut stmt = self
                .conn
                .prepare("SELECT fund_code, asset_class FROM fund_classification ORDER BY rowid")?;
            let mut rows = stmt.query([])?;
            let mut labels = HashMap::new();
            while let Some(row) = rows.next()? {
                let code: String = row.get(0)?;
                let label: String = row.get(1)?;
                labels.entry(code).or_insert(label);
            }
            Ok(labels)
        };
        Ok(read()?)
    }
}

impl ResultSink for SqliteStore {
    fn checkpoint(&self, mode: Mode, reference_date: NaiveDate) -> EngineResult<HashSet<String>> {
        let read = || -> Result<HashSet<String>, StoreError> {
            let date = reference_date.to_string();
            let mut keys = HashSet::new();
            match mode {
                Mode::Metrics => {
                    let mut stmt = self.conn.prepare(
                        "SELECT DISTINCT entity_key FROM fund_metrics WHERE reference_date = ?1",
                    )?;
                    let mut rows = stmt.query(params![date])?;
                    while let Some(row) = rows.next()? {
                        keys.insert(row.get::<_, String>(0)?);
                    }
                }
                Mode::Flow => {
                    let mut stmt = self.conn.prepare(
                        "SELECT DISTINCT allocator, asset_class FROM fund_flow
                         WHERE reference_date = ?1",
                    )?;
                    let mut rows = stmt.query(params![date])?;
                    while let Some(row) = rows.next()? {
                        let allocator: String = row.get(0)?;
                        let asset_class: String = row.get(1)?;
                        keys.insert(EntityId::new(allocator, Some(asset_class.as_str())).key());
                    }
                }
            }
            Ok(keys)
        };
        Ok(read()?)
    }

    fn append_metrics(
        &self,
        reference_date: NaiveDate,
        records: &[MetricRecord],
    ) -> EngineResult<usize> {
        self.insert_metrics(records)
            .map_err(|e| reject(reference_date, e))
    }

    fn append_flows(
        &self,
        reference_date: NaiveDate,
        records: &[FlowRecord],
        windows: &[WindowSpec],
    ) -> EngineResult<usize> {
        self.insert_flows(reference_date, records, windows)
            .map_err(|e| reject(reference_date, e))
    }
}

fn reject(reference_date: NaiveDate, e: StoreError) -> EngineError {
    match e {
        StoreError::AppendRejected { .. } => e.into(),
        other => StoreError::AppendRejected {
            date: reference_date.to_string(),
            msg: other.to_string(),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    fn metric(code: &str, sub: Option<&str>, window: &str) -> MetricRecord {
        MetricRecord {
            entity: EntityId::new(code, sub),
            reference_date: d(2024, 4, 30),
            window: window.to_string(),
            ret: 0.21,
            volatility: Some(0.3),
            max_drawdown: -0.1,
            recovery_time: 1.0,
            sharpe: Some(0.4),
            calmar: Some(2.1),
            hit_ratio: 2.0 / 3.0,
            information_ratio: None,
        }
    }

    #[test]
    fn source_queries_filter_and_aggregate() {
        let store = SqliteStore::in_memory().expect("store");
        store.insert_valuation("F1", None, "2014-05-30", Some(99.0)).expect("insert");
        store.insert_valuation("F1", None, "2014-06-30", Some(100.0)).expect("insert");
        store.insert_valuation("F1", Some("S1"), "2014-06-30", Some(10.0)).expect("insert");
        store.insert_index_level("CDI", "2014-06-30", Some(1.0)).expect("insert");
        store.insert_index_level("IBOV", "2014-06-30", Some(5.0)).expect("insert");
        store.insert_position("A1", "Ações", "2024-01-31", Some(2.0)).expect("insert");
        store.insert_position("A1", "Ações", "2024-01-31", Some(3.0)).expect("insert");

        let rows = store.valuations(d(2014, 6, 1)).expect("valuations");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].qualifier.as_deref(), Some("S1"));

        let cdi = store
            .index_levels(&IndexCode::from("CDI"), d(2014, 6, 1))
            .expect("levels");
        assert_eq!(cdi.len(), 1);
        assert_eq!(cdi[0].code, "CDI");

        let positions = store.positions().expect("positions");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].value, Some(5.0));
    }

    #[test]
    fn non_iso_dates_are_filtered_after_parsing() {
        let store = SqliteStore::in_memory().expect("store");
        store.insert_valuation("F1", None, "2024-01-31", Some(100.0)).expect("insert");
        store.insert_valuation("F1", None, "15/02/2024", Some(101.0)).expect("insert");
        store.insert_valuation("F1", None, "28/03/2024", Some(102.0)).expect("insert");
        store.insert_valuation("F1", None, "20140530", Some(90.0)).expect("insert");
        store.insert_index_level("CDI", "15/02/2024", Some(1.0)).expect("insert");

        let dates: Vec<String> = store
            .valuations(d(2014, 6, 1))
            .expect("valuations")
            .into_iter()
            .map(|r| r.date)
            .collect();
        assert_eq!(dates, vec!["2024-01-31", "15/02/2024", "28/03/2024"]);

        let cdi = store
            .index_levels(&IndexCode::from("CDI"), d(2014, 6, 1))
            .expect("levels");
        assert_eq!(cdi.len(), 1, "day-first dates below the cutoff text still load");
    }

    #[test]
    fn classification_keeps_first_label() {
        let store = SqliteStore::in_memory().expect("store");
        store.insert_classification("F1", "Ações").expect("insert");
        store.insert_classification("F1", "Renda Fixa").expect("insert");

        let labels = store.asset_class_labels().expect("labels");
        assert_eq!(labels.get("F1").map(String::as_str), Some("Ações"));
    }

    #[test]
    fn metrics_append_is_atomic_and_checkpointed() {
        let store = SqliteStore::in_memory().expect("store");
        let date = d(2024, 4, 30);

        let n = store
            .append_metrics(date, &[metric("F1", None, "6M"), metric("F1", Some("S1"), "6M")])
            .expect("append");
        assert_eq!(n, 2);

        let sub: Option<String> = store
            .connection()
            .query_row(
                "SELECT sub_class FROM fund_metrics WHERE entity_key = 'F1 | MASTER'",
                [],
                |row| row.get(0),
            )
            .expect("row");
        assert_eq!(sub, None, "MASTER is stored as NULL");

        let err = store.append_metrics(date, &[metric("F2", None, "6M"), metric("F1", None, "6M")]);
        assert!(err.is_err(), "duplicate key must be rejected");
        assert_eq!(store.count_rows(Mode::Metrics, date).expect("count"), 2);

        let done = store.checkpoint(Mode::Metrics, date).expect("checkpoint");
        assert_eq!(
            done,
            HashSet::from(["F1 | MASTER".to_string(), "F1 | S1".to_string()])
        );
    }

    #[test]
    fn flow_append_adds_window_columns() {
        let store = SqliteStore::in_memory().expect("store");
        let date = d(2024, 6, 30);
        let windows = vec![
            WindowSpec::new("6M", 6).expect("window"),
            WindowSpec::new("12M", 12).expect("window"),
        ];
        let record = FlowRecord {
            entity: EntityId::new("A1", Some("Ações")),
            reference_date: date,
            total_position: 120.0,
            flows: vec![("6M".to_string(), 20.0), ("12M".to_string(), 120.0)],
        };

        store
            .append_flows(date, std::slice::from_ref(&record), &windows)
            .expect("append");
        let flow_12m: f64 = store
            .connection()
            .query_row("SELECT flow_12m FROM fund_flow", [], |row| row.get(0))
            .expect("row");
        assert_eq!(flow_12m, 120.0);

        let done = store.checkpoint(Mode::Flow, date).expect("checkpoint");
        assert!(done.contains("A1 | Ações"));
    }

    #[test]
    fn failed_flow_window_is_stored_as_null() {
        let store = SqliteStore::in_memory().expect("store");
        let date = d(2024, 6, 30);
        let windows = vec![
            WindowSpec::new("6M", 6).expect("window"),
            WindowSpec::new("12M", 12).expect("window"),
        ];
        let record = FlowRecord {
            entity: EntityId::new("A1", Some("Ações")),
            reference_date: date,
            total_position: 120.0,
            flows: vec![("6M".to_string(), 20.0)],
        };

        store
            .append_flows(date, std::slice::from_ref(&record), &windows)
            .expect("append");
        let (flow_6m, flow_12m): (f64, Option<f64>) = store
            .connection()
            .query_row("SELECT flow_6m, flow_12m FROM fund_flow", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .expect("row");
        assert_eq!(flow_6m, 20.0);
        assert_eq!(flow_12m, None);
    }
}
