//! Append-only SQLite log of sensor readings.
//!
//! - One writer connection behind a mutex, so ids are handed out strictly
//!   increasing with no gaps under concurrent appends.
//! - A small r2d2 pool of read-only connections. The database runs in WAL
//!   mode, so readers see a committed snapshot and never wait on the writer.

use chrono::{Local, NaiveDateTime};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PoolError};
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::db::models::{Measurement, MeasurementValue, Reading, Sample, WindowPoint, TIMESTAMP_FORMAT};
use crate::schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const BUSY_TIMEOUT_MS: u32 = 5_000;
const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage fault: the persistence layer could not complete an operation.
#[derive(Debug)]
pub enum StoreError {
    Connect(ConnectionError),
    Pool(PoolError),
    Query(diesel::result::Error),
    Migration(String),
    /// A writer panicked while holding the write lock.
    Poisoned,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connect(e) => write!(f, "database connection failed: {}", e),
            StoreError::Pool(e) => write!(f, "read pool unavailable: {}", e),
            StoreError::Query(e) => write!(f, "database query failed: {}", e),
            StoreError::Migration(e) => write!(f, "schema migration failed: {}", e),
            StoreError::Poisoned => write!(f, "writer lock poisoned by an earlier panic"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Connect(e) => Some(e),
            StoreError::Pool(e) => Some(e),
            StoreError::Query(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for StoreError {
    fn from(value: ConnectionError) -> Self {
        StoreError::Connect(value)
    }
}

impl From<PoolError> for StoreError {
    fn from(value: PoolError) -> Self {
        StoreError::Pool(value)
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::Query(value)
    }
}

#[derive(Debug)]
struct ReadOnlySession;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ReadOnlySession {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA query_only = ON;",
            BUSY_TIMEOUT_MS
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub struct Store {
    path: PathBuf,
    writer: Mutex<SqliteConnection>,
    readers: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// The schema is not touched here; call [`Store::initialize`] before use.
    pub fn open(path: impl AsRef<Path>, read_pool_size: u32) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let url = path.to_string_lossy().into_owned();

        let mut writer = SqliteConnection::establish(&url)?;
        writer.batch_execute(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = {};",
            BUSY_TIMEOUT_MS
        ))?;

        let readers = Pool::builder()
            .max_size(read_pool_size.max(1))
            .connection_timeout(POOL_CHECKOUT_TIMEOUT)
            .connection_customizer(Box::new(ReadOnlySession))
            .build(ConnectionManager::<SqliteConnection>::new(url))?;

        debug!("Opened reading store at {}", path.display());
        Ok(Store {
            path,
            writer: Mutex::new(writer),
            readers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the schema if it does not exist yet. Safe to call repeatedly.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let mut conn = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        if applied.is_empty() {
            info!("Database schema is up to date; no migrations were applied");
        } else {
            let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
            info!("Applied {} database migration(s): {}", applied.len(), names);
        }
        Ok(())
    }

    /// Append a reading stamped with the current server wall-clock time.
    pub fn append(&self, sample: &Sample) -> Result<i64, StoreError> {
        self.append_with(sample, || Local::now().naive_local())
    }

    /// Append a reading with an explicit timestamp.
    pub fn append_at(&self, sample: &Sample, at: NaiveDateTime) -> Result<i64, StoreError> {
        self.append_with(sample, || at)
    }

    fn append_with(&self, sample: &Sample, clock: impl FnOnce() -> NaiveDateTime) -> Result<i64, StoreError> {
        use schema::sensor_data::dsl as S;

        let mut conn = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        // stamped under the lock so timestamps follow id order
        let timestamp = clock().format(TIMESTAMP_FORMAT).to_string();
        let row = sample.to_insertable(&timestamp);

        let id = conn.immediate_transaction(|conn| {
            diesel::insert_into(S::sensor_data)
                .values(&row)
                .returning(S::id)
                .get_result::<i64>(conn)
        })?;
        debug!("Appended reading {} at {}", id, timestamp);
        Ok(id)
    }

    /// The newest `limit` readings projected to `(timestamp, field)`, oldest first.
    pub fn recent_window(&self, limit: usize, field: Measurement) -> Result<Vec<WindowPoint>, StoreError> {
        use schema::sensor_data::dsl as S;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut pooled = self.readers.get()?;
        let conn: &mut SqliteConnection = &mut pooled;

        macro_rules! newest {
            ($column:expr, $ty:ty, $variant:ident) => {
                S::sensor_data
                    .select((S::timestamp, $column))
                    .order(S::id.desc())
                    .limit(limit)
                    .load::<(String, $ty)>(conn)?
                    .into_iter()
                    .map(|(ts, v)| WindowPoint(ts, MeasurementValue::$variant(v)))
                    .collect::<Vec<_>>()
            };
        }

        let mut points = match field {
            Measurement::Temperature => newest!(S::temperature, f64, Float),
            Measurement::Humidity => newest!(S::humidity, f64, Float),
            Measurement::Noise => newest!(S::noise, i64, Integer),
            Measurement::Luminance => newest!(S::luminance, i64, Integer),
        };
        points.reverse();
        Ok(points)
    }

    /// The newest `limit` full readings, oldest first.
    pub fn recent_readings(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        use schema::sensor_data::dsl as S;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut pooled = self.readers.get()?;
        let conn: &mut SqliteConnection = &mut pooled;

        let mut rows = S::sensor_data
            .select(Reading::as_select())
            .order(S::id.desc())
            .limit(limit)
            .load(conn)?;
        rows.reverse();
        Ok(rows)
    }

    /// Number of persisted readings.
    pub fn count(&self) -> Result<i64, StoreError> {
        use schema::sensor_data::dsl as S;

        let mut pooled = self.readers.get()?;
        let conn: &mut SqliteConnection = &mut pooled;
        Ok(S::sensor_data.count().get_result::<i64>(conn)?)
    }
}
