//! Transaction batcher: collapses the buffered source transactions into a
//! single downstream transaction with one BEGIN, one COMMIT at the last
//! source COMMIT boundary, and one checkpoint UPDATE inside it.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::checkpoint;
use crate::client::{DatabaseClient, ErrorClass};
use crate::client::live::classify as classify_mysql_error;
use crate::config::Config;
use crate::error::{PlayerError, PlayerResult};
use crate::filter::Filter;
use crate::stats::Stats;
use crate::state_machine::{ReplicationCoordinates, SqlType, TxnBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The batch committed downstream and the checkpoint advanced.
    Flushed,
    /// No DML in the batch matched the filter; no downstream transaction
    /// was ever opened, and the recovery position was not advanced.
    Empty,
    /// A deadlock was hit; caller should sleep and retry the same buffer.
    Retry,
}

pub struct Batcher<'a> {
    client: &'a mut dyn DatabaseClient,
    filter: &'a Filter,
    stats: &'a Stats,
    uid: u32,
    exec_ddl: bool,
    slow_query_threshold: Duration,
}

impl<'a> Batcher<'a> {
    pub fn new(client: &'a mut dyn DatabaseClient, filter: &'a Filter, stats: &'a Stats, config: &Config) -> Self {
        Batcher {
            client,
            filter,
            stats,
            uid: config.uid,
            exec_ddl: config.exec_ddl,
            slow_query_threshold: config.slow_query_threshold(),
        }
    }

    /// One flush attempt over `buffer`. On `Flushed` or `Empty` the caller
    /// must reset the buffer; on `Retry` the buffer is left untouched so
    /// the same flush can be reattempted.
    pub async fn flush(&mut self, buffer: &TxnBuffer) -> PlayerResult<FlushOutcome> {
        let mut opened = false;
        let mut commit_counter = 0usize;
        let mut query_count = 0usize;
        let mut txn_start: Option<Instant> = None;

        for event in &buffer.events {
            match event.data.sql_type {
                Some(SqlType::Begin) => continue,
                Some(SqlType::Dml) => {
                    if !self.filter.matches(&event.data) {
                        continue;
                    }

                    if !opened {
                        self.client.begin().await?;
                        opened = true;
                        txn_start = Some(Instant::now());
                    }

                    for sql in &event.data.sql {
                        let query_start = Instant::now();
                        match self.client.execute(sql, 0, false).await {
                            Ok(_) => {
                                self.stats.record_query(query_start.elapsed());
                                query_count += 1;
                            }
                            Err(PlayerError::Database(e)) if classify_mysql_error(&e) == ErrorClass::Deadlock => {
                                warn!("deadlock detected applying DML, rolling back and retrying");
                                let _ = self.client.rollback().await;
                                return Ok(FlushOutcome::Retry);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Some(SqlType::Commit) => {
                    commit_counter += 1;
                    if commit_counter == buffer.txn_index {
                        if opened {
                            checkpoint::write_recovery_position(
                                self.client,
                                self.stats,
                                self.uid,
                                &event.position,
                                self.slow_query_threshold,
                            )
                            .await?;
                            query_count += 1;

                            self.client.commit().await?;

                            if let Some(start) = txn_start {
                                self.stats.record_txn(start.elapsed());
                            }
                            self.stats.add_txns(buffer.txn_index as u64);
                            self.stats.add_queries(query_count as u64);
                        }
                    }
                }
                Some(SqlType::Ddl) | None => unreachable!("DDL and malformed events never enter the buffer"),
            }
        }

        if opened {
            Ok(FlushOutcome::Flushed)
        } else {
            Ok(FlushOutcome::Empty)
        }
    }

    /// Apply a DDL event outside a transaction, then advance the checkpoint
    /// in its own fresh transaction.
    pub async fn apply_ddl(&mut self, sql: &[String], position: &ReplicationCoordinates) -> PlayerResult<()> {
        if !self.exec_ddl {
            info!(?position, "DDL execution disabled, discarding statement");
            return Ok(());
        }

        for stmt in sql {
            if stmt.is_empty() {
                continue;
            }
            let query_start = Instant::now();
            self.client.execute(stmt, 0, false).await?;
            self.stats.record_query(query_start.elapsed());
        }

        self.client.begin().await?;
        checkpoint::write_recovery_position(self.client, self.stats, self.uid, position, self.slow_query_threshold)
            .await?;
        self.client.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DryRunClient;
    use crate::state_machine::{BinlogData, BinlogResponse, EventStateMachine};
    use std::time::Instant;

    fn make_buffer(tables: &[&str]) -> (TxnBuffer, Filter) {
        let mut sm = EventStateMachine::new(10, Duration::from_secs(3600));
        let t0 = Instant::now();
        sm.step(
            BinlogResponse {
                data: BinlogData {
                    sql_type: Some(SqlType::Begin),
                    sql: vec![],
                },
                ..Default::default()
            },
            t0,
        )
        .unwrap();
        sm.step(
            BinlogResponse {
                data: BinlogData {
                    sql_type: Some(SqlType::Dml),
                    sql: vec!["insert into t values (1) /* _stream t (id ) (1 ); */".into()],
                },
                ..Default::default()
            },
            t0,
        )
        .unwrap();
        sm.step(
            BinlogResponse {
                position: ReplicationCoordinates {
                    master_filename: "bin.1".into(),
                    master_position: 100,
                    group_id: String::new(),
                },
                data: BinlogData {
                    sql_type: Some(SqlType::Commit),
                    sql: vec![],
                },
                ..Default::default()
            },
            t0,
        )
        .unwrap();
        (sm.buffer, Filter::new(tables.iter().map(|s| s.to_string()).collect()))
    }

    #[tokio::test]
    async fn flushes_matching_batch_and_writes_checkpoint() {
        let (buffer, filter) = make_buffer(&["t"]);
        let stats = Stats::new(15);
        let mut sql_sink = Vec::new();
        let mut client = DryRunClient::new(&mut sql_sink);
        let config = Config {
            uid: 1,
            addr: "x".into(),
            key_range_start: String::new(),
            key_range_end: String::new(),
            tables: vec!["t".into()],
            txn_batch: 10,
            max_txn_interval_ms: 1000,
            exec_ddl: false,
            slow_query_threshold_ms: 100,
            enable_statement_logging: false,
            deadlock_retry_initial_ms: 50,
            deadlock_retry_max_ms: 5000,
            deadlock_retry_max_attempts: 20,
            stats_rate_window_samples: 15,
            downstream_dsn: String::new(),
            dry_run: true,
        };
        let mut batcher = Batcher::new(&mut client, &filter, &stats, &config);
        let outcome = batcher.flush(&buffer).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Flushed);
        assert_eq!(stats.snapshot().txn_count, 1);
        assert_eq!(stats.snapshot().query_count, 2); // insert + checkpoint update
    }

    #[tokio::test]
    async fn filtered_out_batch_never_opens_a_transaction() {
        let (buffer, filter) = make_buffer(&["other"]);
        let stats = Stats::new(15);
        let mut sql_sink = Vec::new();
        let mut client = DryRunClient::new(&mut sql_sink);
        let config = Config {
            uid: 1,
            addr: "x".into(),
            key_range_start: String::new(),
            key_range_end: String::new(),
            tables: vec!["other".into()],
            txn_batch: 10,
            max_txn_interval_ms: 1000,
            exec_ddl: false,
            slow_query_threshold_ms: 100,
            enable_statement_logging: false,
            deadlock_retry_initial_ms: 50,
            deadlock_retry_max_ms: 5000,
            deadlock_retry_max_attempts: 20,
            stats_rate_window_samples: 15,
            downstream_dsn: String::new(),
            dry_run: true,
        };
        let mut batcher = Batcher::new(&mut client, &filter, &stats, &config);
        let outcome = batcher.flush(&buffer).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Empty);
        assert_eq!(stats.snapshot().txn_count, 0);
    }
}
