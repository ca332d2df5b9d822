use crate::source::event::Event;
use crate::source::reader::PolledRecord;
use crate::window::WindowAccumulator;
use chrono::{DateTime, NaiveDate, Utc};

/// A row type that can be staged into a Parquet table.
///
/// Timestamps are bound as epoch microseconds and converted with
/// `make_timestamp` so no floating point is involved.
pub trait SinkRow: Send + 'static {
    /// Column definitions for the staging table
    const COLUMNS: &'static str;
    /// Placeholder list matching `COLUMNS`
    const VALUES: &'static str;
    /// Total order used when writing, so equal input yields equal files
    const ORDER_BY: &'static str;

    /// Date partition the row belongs to
    fn partition_date(&self) -> NaiveDate;

    fn insert(&self, stmt: &mut duckdb::Statement<'_>) -> duckdb::Result<usize>;
}

fn micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClickRow {
    pub event_id: String,
    pub user_id: String,
    pub url: String,
    pub referrer: String,
    pub user_agent: String,
    pub session_id: Option<String>,
    pub event_time: DateTime<Utc>,
    pub log_partition: u32,
    pub log_offset: u64,
    pub log_append_time: Option<DateTime<Utc>>,
}

impl SinkRow for ClickRow {
    const COLUMNS: &'static str = "event_id VARCHAR NOT NULL,
        user_id VARCHAR NOT NULL,
        url VARCHAR NOT NULL,
        referrer VARCHAR NOT NULL,
        user_agent VARCHAR NOT NULL,
        session_id VARCHAR,
        event_time TIMESTAMP NOT NULL,
        log_partition UINTEGER NOT NULL,
        log_offset UBIGINT NOT NULL,
        log_append_time TIMESTAMP";
    const VALUES: &'static str =
        "?, ?, ?, ?, ?, ?, make_timestamp(?), ?, ?, make_timestamp(?)";
    const ORDER_BY: &'static str = "log_partition, log_offset";

    fn partition_date(&self) -> NaiveDate {
        self.event_time.date_naive()
    }

    fn insert(&self, stmt: &mut duckdb::Statement<'_>) -> duckdb::Result<usize> {
        stmt.execute(duckdb::params![
            self.event_id,
            self.user_id,
            self.url,
            self.referrer,
            self.user_agent,
            self.session_id,
            micros(self.event_time),
            self.log_partition,
            self.log_offset,
            self.log_append_time.map(micros),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub device_id: String,
    pub site: String,
    pub temp_c: f64,
    pub humidity: f64,
    pub battery: f64,
    pub signal_strength: i32,
    pub event_time: DateTime<Utc>,
    pub log_partition: u32,
    pub log_offset: u64,
    pub log_append_time: Option<DateTime<Utc>>,
}

impl SinkRow for TelemetryRow {
    const COLUMNS: &'static str = "device_id VARCHAR NOT NULL,
        site VARCHAR NOT NULL,
        temp_c DOUBLE NOT NULL,
        humidity DOUBLE NOT NULL,
        battery DOUBLE NOT NULL,
        signal_strength INTEGER NOT NULL,
        event_time TIMESTAMP NOT NULL,
        log_partition UINTEGER NOT NULL,
        log_offset UBIGINT NOT NULL,
        log_append_time TIMESTAMP";
    const VALUES: &'static str =
        "?, ?, ?, ?, ?, ?, make_timestamp(?), ?, ?, make_timestamp(?)";
    const ORDER_BY: &'static str = "log_partition, log_offset";

    fn partition_date(&self) -> NaiveDate {
        self.event_time.date_naive()
    }

    fn insert(&self, stmt: &mut duckdb::Statement<'_>) -> duckdb::Result<usize> {
        stmt.execute(duckdb::params![
            self.device_id,
            self.site,
            self.temp_c,
            self.humidity,
            self.battery,
            self.signal_strength,
            micros(self.event_time),
            self.log_partition,
            self.log_offset,
            self.log_append_time.map(micros),
        ])
    }
}

/// One finalized window of the page-view aggregate table
#[derive(Debug, Clone, PartialEq)]
pub struct WindowCountRow {
    pub minute_start: DateTime<Utc>,
    pub minute_end: DateTime<Utc>,
    pub group_key: String,
    pub count: u64,
}

impl From<&WindowAccumulator> for WindowCountRow {
    fn from(window: &WindowAccumulator) -> Self {
        Self {
            minute_start: window.window_start,
            minute_end: window.window_end,
            group_key: window.group_key.clone(),
            count: window.count,
        }
    }
}

impl SinkRow for WindowCountRow {
    const COLUMNS: &'static str = "minute_start TIMESTAMP NOT NULL,
        minute_end TIMESTAMP NOT NULL,
        group_key VARCHAR NOT NULL,
        count UBIGINT NOT NULL";
    const VALUES: &'static str = "make_timestamp(?), make_timestamp(?), ?, ?";
    const ORDER_BY: &'static str = "minute_start, group_key";

    fn partition_date(&self) -> NaiveDate {
        self.minute_start.date_naive()
    }

    fn insert(&self, stmt: &mut duckdb::Statement<'_>) -> duckdb::Result<usize> {
        stmt.execute(duckdb::params![
            micros(self.minute_start),
            micros(self.minute_end),
            self.group_key,
            self.count,
        ])
    }
}

/// Raw rows accumulated for one batch
#[derive(Debug, Default)]
pub struct RawRows {
    pub clicks: Vec<ClickRow>,
    pub telemetry: Vec<TelemetryRow>,
}

impl RawRows {
    pub fn push(&mut self, record: &PolledRecord) {
        match &record.event {
            Event::Click(e) => self.clicks.push(ClickRow {
                event_id: e.event_id.clone(),
                user_id: e.user_id.clone(),
                url: e.url.clone(),
                referrer: e.referrer.clone(),
                user_agent: e.user_agent.clone(),
                session_id: e.session_id.clone(),
                event_time: e.event_time,
                log_partition: record.partition,
                log_offset: record.offset,
                log_append_time: record.append_time,
            }),
            Event::Telemetry(e) => self.telemetry.push(TelemetryRow {
                device_id: e.device_id.clone(),
                site: e.site.clone(),
                temp_c: e.temp_c,
                humidity: e.humidity,
                battery: e.battery,
                signal_strength: e.signal_strength,
                event_time: e.event_time,
                log_partition: record.partition,
                log_offset: record.offset,
                log_append_time: record.append_time,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.clicks.len() + self.telemetry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
