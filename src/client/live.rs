//! The live, SQL-backed [`DatabaseClient`].
//!
//! On any execute error, inspects the error: connection-class errors (the
//! 2000-2018 band, or 1317 "query interrupted") close the underlying
//! connection so the next `execute` reconnects. `commit`/`rollback` failures
//! close the connection unconditionally. No pooling: a client is owned by
//! exactly one player, mirroring `MySqlBinlogConnector`'s single owned
//! `mysql_async::Conn`.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use tracing::warn;

use super::{DatabaseClient, DbValue, ErrorClass, QueryResult};
use crate::error::{PlayerError, PlayerResult};

const DEADLOCK_CODE: u16 = 1213;
const QUERY_INTERRUPTED_CODE: u16 = 1317;
const CONNECTION_ERROR_RANGE: std::ops::RangeInclusive<u16> = 2000..=2018;

pub fn classify(err: &mysql_async::Error) -> ErrorClass {
    if let mysql_async::Error::Server(server_err) = err {
        if server_err.code == DEADLOCK_CODE {
            return ErrorClass::Deadlock;
        }
        if server_err.code == QUERY_INTERRUPTED_CODE || CONNECTION_ERROR_RANGE.contains(&server_err.code) {
            return ErrorClass::Connection;
        }
    }
    ErrorClass::Other
}

pub struct LiveClient {
    opts: mysql_async::Opts,
    conn: Option<mysql_async::Conn>,
}

impl LiveClient {
    pub fn new(opts: mysql_async::Opts) -> Self {
        LiveClient { opts, conn: None }
    }

    async fn conn_mut(&mut self) -> PlayerResult<&mut mysql_async::Conn> {
        if self.conn.is_none() {
            self.conn = Some(mysql_async::Conn::new(self.opts.clone()).await?);
        }
        Ok(self.conn.as_mut().expect("just ensured connected"))
    }

    async fn close_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.disconnect().await;
        }
    }
}

#[async_trait]
impl DatabaseClient for LiveClient {
    async fn connect(&mut self) -> PlayerResult<()> {
        self.conn_mut().await.map(|_| ())
    }

    async fn begin(&mut self) -> PlayerResult<()> {
        self.conn_mut().await?.query_drop("BEGIN").await.map_err(PlayerError::from)
    }

    async fn commit(&mut self) -> PlayerResult<()> {
        let result = self.conn_mut().await?.query_drop("COMMIT").await;
        if result.is_err() {
            self.close_connection().await;
        }
        result.map_err(PlayerError::from)
    }

    async fn rollback(&mut self) -> PlayerResult<()> {
        let result = self.conn_mut().await?.query_drop("ROLLBACK").await;
        if result.is_err() {
            self.close_connection().await;
        }
        result.map_err(PlayerError::from)
    }

    async fn close(&mut self) -> PlayerResult<()> {
        self.close_connection().await;
        Ok(())
    }

    async fn execute(&mut self, query: &str, max_rows: usize, want_fields: bool) -> PlayerResult<QueryResult> {
        let conn = self.conn_mut().await?;
        let result = conn.query_iter(query).await;

        let mut query_result = match result {
            Ok(r) => r,
            Err(e) => {
                if matches!(classify(&e), ErrorClass::Connection) {
                    warn!(error = %e, "connection-class error on execute, closing connection");
                    self.close_connection().await;
                }
                return Err(PlayerError::from(e));
            }
        };

        let fields = if want_fields {
            query_result
                .columns()
                .map(|cols| cols.iter().map(|c| c.name_str().to_string()).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut rows = Vec::new();
        while let Some(row) = query_result
            .next()
            .await
            .map_err(PlayerError::from)?
        {
            if rows.len() >= max_rows && max_rows > 0 {
                break;
            }
            rows.push(row_to_values(row));
        }

        Ok(QueryResult {
            fields,
            rows_affected: query_result.affected_rows(),
            insert_id: query_result.last_insert_id().unwrap_or(0),
            rows,
        })
    }
}

fn row_to_values(row: mysql_async::Row) -> Vec<DbValue> {
    let mut out = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let value = row.as_ref(i).cloned().unwrap_or(mysql_async::Value::NULL);
        out.push(mysql_value_to_db_value(value));
    }
    out
}

fn mysql_value_to_db_value(value: mysql_async::Value) -> DbValue {
    match value {
        mysql_async::Value::NULL => DbValue::Null,
        mysql_async::Value::Bytes(b) => DbValue::Bytes(b),
        mysql_async::Value::Int(i) => DbValue::Int(i),
        mysql_async::Value::UInt(u) => DbValue::UInt(u),
        other => DbValue::Bytes(format!("{other:?}").into_bytes()),
    }
}
