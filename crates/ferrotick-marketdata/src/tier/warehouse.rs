//! Disk tier: chunks persisted in a local `DuckDB` file.
//!
//! Bars and coverage live in two tables. Coverage rows for a series never
//! overlap or touch; every write merges the new range with its neighbours.
//!
//! | Table | Key |
//! |-------|-----|
//! | `series_bars` | exchange, area, symbol, timeframe, open_time |
//! | `series_coverage` | exchange, area, symbol, timeframe, range_start |

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::duckdb::ConnectionPool;
use super::{Availability, DataTier, TierError, TierFuture, TierKind};
use crate::chunk::ChunkDescriptor;
use crate::domain::{Bar, SeriesKey, TimeRange, UtcDateTime};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS series_bars (
    exchange VARCHAR NOT NULL,
    area VARCHAR NOT NULL,
    symbol VARCHAR NOT NULL,
    timeframe VARCHAR NOT NULL,
    open_time BIGINT NOT NULL,
    open DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    close DOUBLE NOT NULL,
    volume DOUBLE NOT NULL,
    PRIMARY KEY (exchange, area, symbol, timeframe, open_time)
);
CREATE TABLE IF NOT EXISTS series_coverage (
    exchange VARCHAR NOT NULL,
    area VARCHAR NOT NULL,
    symbol VARCHAR NOT NULL,
    timeframe VARCHAR NOT NULL,
    range_start BIGINT NOT NULL,
    range_end BIGINT NOT NULL,
    PRIMARY KEY (exchange, area, symbol, timeframe, range_start)
);
";

#[derive(Debug, Error)]
enum WarehouseError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

impl From<WarehouseError> for TierError {
    fn from(error: WarehouseError) -> Self {
        TierError::storage(error.to_string())
    }
}

/// Location and pool size of the warehouse database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseTierConfig {
    /// Root directory for ferrotick data.
    pub home: PathBuf,
    /// Database file; defaults to `<home>/cache/marketdata.duckdb`.
    pub db_path: Option<PathBuf>,
    pub max_pool_size: usize,
}

impl Default for WarehouseTierConfig {
    fn default() -> Self {
        Self {
            home: resolve_ferrotick_home(),
            db_path: None,
            max_pool_size: 4,
        }
    }
}

impl WarehouseTierConfig {
    /// Keeps the database under `home`.
    pub fn in_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.home.join("cache").join("marketdata.duckdb"))
    }
}

/// [`DataTier`] persisting chunks to `DuckDB`.
///
/// Database calls run on the blocking thread pool.
#[derive(Clone)]
pub struct WarehouseTier {
    pool: ConnectionPool,
}

impl std::fmt::Debug for WarehouseTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseTier")
            .field("db_path", &self.pool.db_path())
            .finish()
    }
}

impl WarehouseTier {
    /// Opens the database, creating the file and schema when missing.
    pub fn open(config: &WarehouseTierConfig) -> Result<Self, TierError> {
        Self::open_inner(config).map_err(TierError::from)
    }

    fn open_inner(config: &WarehouseTierConfig) -> Result<Self, WarehouseError> {
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pool = ConnectionPool::open(db_path, config.max_pool_size)?;
        pool.acquire()?.execute_batch(SCHEMA)?;
        debug!(db_path = %pool.db_path().display(), "opened warehouse tier");
        Ok(Self { pool })
    }

    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    async fn blocking<T, F>(&self, task: F) -> Result<T, TierError>
    where
        F: FnOnce(&Connection) -> Result<T, WarehouseError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let connection = pool.acquire().map_err(WarehouseError::from)?;
            task(&connection)
        })
        .await
        .map_err(|error| TierError::internal(format!("warehouse task failed: {error}")))?
        .map_err(TierError::from)
    }
}

impl DataTier for WarehouseTier {
    fn kind(&self) -> TierKind {
        TierKind::Disk
    }

    fn probe<'a>(&'a self, chunk: &'a ChunkDescriptor) -> TierFuture<'a, Availability> {
        let columns = SeriesColumns::from(chunk.series());
        let range = chunk.range();
        Box::pin(async move {
            let covered = self
                .blocking(move |connection| covered_ranges(connection, &columns, range))
                .await?;

            if covered.is_empty() {
                return Ok(Availability::None);
            }
            let missing = range.subtract(&covered);
            if missing.is_empty() {
                Ok(Availability::Full)
            } else {
                Ok(Availability::Partial(missing))
            }
        })
    }

    fn fetch<'a>(&'a self, series: &'a SeriesKey, range: TimeRange) -> TierFuture<'a, Vec<Bar>> {
        let columns = SeriesColumns::from(series);
        Box::pin(self.blocking(move |connection| read_bars(connection, &columns, range)))
    }

    fn put<'a>(
        &'a self,
        chunk: &'a ChunkDescriptor,
        range: TimeRange,
        bars: &'a [Bar],
    ) -> TierFuture<'a, ()> {
        let columns = SeriesColumns::from(chunk.series());
        let clipped = range.intersect(&chunk.range());
        let bars = bars.to_vec();
        Box::pin(async move {
            let Some(range) = clipped else {
                return Ok(());
            };
            self.blocking(move |connection| write_chunk(connection, &columns, range, &bars))
                .await
        })
    }
}

struct SeriesColumns {
    exchange: String,
    area: String,
    symbol: String,
    timeframe: String,
}

impl From<&SeriesKey> for SeriesColumns {
    fn from(series: &SeriesKey) -> Self {
        Self {
            exchange: series.exchange().to_owned(),
            area: series.area().to_owned(),
            symbol: series.symbol().as_str().to_owned(),
            timeframe: series.timeframe().to_string(),
        }
    }
}

fn covered_ranges(
    connection: &Connection,
    columns: &SeriesColumns,
    range: TimeRange,
) -> Result<Vec<TimeRange>, WarehouseError> {
    let mut statement = connection.prepare(
        "SELECT range_start, range_end FROM series_coverage \
         WHERE exchange = ? AND area = ? AND symbol = ? AND timeframe = ? \
           AND range_end > ? AND range_start < ? \
         ORDER BY range_start",
    )?;
    let rows = statement.query_map(
        params![
            columns.exchange,
            columns.area,
            columns.symbol,
            columns.timeframe,
            range.start().unix_seconds(),
            range.end().unix_seconds(),
        ],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    )?;

    let mut covered = Vec::new();
    for row in rows {
        let (start, end) = row?;
        let stored = TimeRange::new(
            to_timestamp("series_coverage", start)?,
            to_timestamp("series_coverage", end)?,
        )
        .map_err(|error| WarehouseError::Corrupt {
            table: "series_coverage",
            reason: error.to_string(),
        })?;
        covered.extend(stored.intersect(&range));
    }
    Ok(covered)
}

fn read_bars(
    connection: &Connection,
    columns: &SeriesColumns,
    range: TimeRange,
) -> Result<Vec<Bar>, WarehouseError> {
    let mut statement = connection.prepare(
        "SELECT open_time, open, high, low, close, volume FROM series_bars \
         WHERE exchange = ? AND area = ? AND symbol = ? AND timeframe = ? \
           AND open_time >= ? AND open_time < ? \
         ORDER BY open_time",
    )?;
    let rows = statement.query_map(
        params![
            columns.exchange,
            columns.area,
            columns.symbol,
            columns.timeframe,
            range.start().unix_seconds(),
            range.end().unix_seconds(),
        ],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
            ))
        },
    )?;

    let mut bars = Vec::new();
    for row in rows {
        let (open_time, open, high, low, close, volume) = row?;
        let bar = Bar::new(
            to_timestamp("series_bars", open_time)?,
            open,
            high,
            low,
            close,
            volume,
        )
        .map_err(|error| WarehouseError::Corrupt {
            table: "series_bars",
            reason: error.to_string(),
        })?;
        bars.push(bar);
    }
    Ok(bars)
}

fn write_chunk(
    connection: &Connection,
    columns: &SeriesColumns,
    range: TimeRange,
    bars: &[Bar],
) -> Result<(), WarehouseError> {
    connection.execute_batch("BEGIN TRANSACTION")?;
    let result = (|| -> Result<(), WarehouseError> {
        for bar in bars.iter().filter(|bar| range.contains(bar.open_time)) {
            connection.execute(
                "INSERT OR REPLACE INTO series_bars \
                 (exchange, area, symbol, timeframe, open_time, open, high, low, close, volume) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    columns.exchange,
                    columns.area,
                    columns.symbol,
                    columns.timeframe,
                    bar.open_time.unix_seconds(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ],
            )?;
        }

        // Neighbours that overlap or touch `range` are folded into one row.
        let start = range.start().unix_seconds();
        let end = range.end().unix_seconds();
        let mut statement = connection.prepare(
            "SELECT range_start, range_end FROM series_coverage \
             WHERE exchange = ? AND area = ? AND symbol = ? AND timeframe = ? \
               AND range_end >= ? AND range_start <= ?",
        )?;
        let neighbours = statement
            .query_map(
                params![
                    columns.exchange,
                    columns.area,
                    columns.symbol,
                    columns.timeframe,
                    start,
                    end,
                ],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let merged_start = neighbours.iter().map(|(s, _)| *s).fold(start, i64::min);
        let merged_end = neighbours.iter().map(|(_, e)| *e).fold(end, i64::max);

        connection.execute(
            "DELETE FROM series_coverage \
             WHERE exchange = ? AND area = ? AND symbol = ? AND timeframe = ? \
               AND range_end >= ? AND range_start <= ?",
            params![
                columns.exchange,
                columns.area,
                columns.symbol,
                columns.timeframe,
                start,
                end,
            ],
        )?;
        connection.execute(
            "INSERT INTO series_coverage \
             (exchange, area, symbol, timeframe, range_start, range_end) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                columns.exchange,
                columns.area,
                columns.symbol,
                columns.timeframe,
                merged_start,
                merged_end,
            ],
        )?;
        Ok(())
    })();

    finalize_transaction(connection, result)
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn to_timestamp(table: &'static str, seconds: i64) -> Result<UtcDateTime, WarehouseError> {
    UtcDateTime::from_unix_seconds(seconds).map_err(|error| WarehouseError::Corrupt {
        table,
        reason: error.to_string(),
    })
}

fn resolve_ferrotick_home() -> PathBuf {
    if let Some(path) = env::var_os("FERROTICK_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".ferrotick");
    }

    PathBuf::from(".ferrotick")
}
