//! Database client abstraction: a closed, two-variant capability set (live,
//! dry-run), modeled as a narrow trait over a closed set of implementers
//! rather than open subclassing.

mod dryrun;
pub mod live;

pub use dryrun::DryRunClient;
pub use live::LiveClient;

use async_trait::async_trait;

use crate::error::PlayerResult;

/// A single returned value. Kept deliberately small: the player never
/// interprets row contents beyond what the checkpoint store needs.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Bytes(Vec<u8>),
    Int(i64),
    UInt(u64),
}

impl DbValue {
    pub fn as_str(&self) -> Option<std::borrow::Cow<'_, str>> {
        match self {
            DbValue::Null => None,
            DbValue::Bytes(b) => Some(String::from_utf8_lossy(b)),
            DbValue::Int(i) => Some(i.to_string().into()),
            DbValue::UInt(u) => Some(u.to_string().into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub fields: Vec<String>,
    pub rows_affected: u64,
    pub insert_id: u64,
    pub rows: Vec<Vec<DbValue>>,
}

impl QueryResult {
    /// Look up a column value in the first row by case-insensitive name.
    pub fn field(&self, row: &[DbValue], name: &str) -> Option<DbValue> {
        self.fields
            .iter()
            .position(|f| f.eq_ignore_ascii_case(name))
            .and_then(|idx| row.get(idx).cloned())
    }
}

/// How a failed `execute` should affect the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Deadlock found when trying to get lock (source protocol code 1213).
    Deadlock,
    /// Connection-class error (codes 2000-2018, or 1317 query interrupted):
    /// the connection should be closed so the next `execute` reconnects.
    Connection,
    Other,
}

#[async_trait]
pub trait DatabaseClient: Send {
    async fn connect(&mut self) -> PlayerResult<()>;
    async fn begin(&mut self) -> PlayerResult<()>;
    async fn commit(&mut self) -> PlayerResult<()>;
    async fn rollback(&mut self) -> PlayerResult<()>;
    async fn close(&mut self) -> PlayerResult<()>;
    async fn execute(&mut self, query: &str, max_rows: usize, want_fields: bool) -> PlayerResult<QueryResult>;
}
