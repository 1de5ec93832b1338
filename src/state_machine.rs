//! Event state machine and the transaction buffer it drives.
//!
//! This module is pure: it classifies one [`BinlogResponse`] at a time and
//! mutates the buffer accordingly, but never touches the database client or
//! the checkpoint store. The [`crate::batcher`] and [`crate::driver`]
//! modules own the side effects the resulting [`Action`] implies.

use std::time::{Duration, Instant};

use crate::error::{PlayerError, PlayerResult};

/// `{masterFilename, masterPosition, groupId}`. Validity requires either a
/// non-empty `group_id`, or both a non-empty `master_filename` and a
/// non-zero `master_position`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationCoordinates {
    pub master_filename: String,
    pub master_position: u64,
    pub group_id: String,
}

impl ReplicationCoordinates {
    pub fn is_valid(&self) -> bool {
        !self.group_id.is_empty() || (!self.master_filename.is_empty() && self.master_position != 0)
    }
}

impl std::fmt::Display for ReplicationCoordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} (group {})",
            self.master_filename, self.master_position, self.group_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Begin,
    Commit,
    Dml,
    Ddl,
}

#[derive(Debug, Clone, Default)]
pub struct BinlogData {
    pub sql_type: Option<SqlType>,
    pub sql: Vec<String>,
}

/// One event from upstream. `error` is non-empty only for a terminal EOF
/// or a fatal upstream error, in which case `data` carries no meaning.
#[derive(Debug, Clone, Default)]
pub struct BinlogResponse {
    pub error: String,
    pub position: ReplicationCoordinates,
    pub data: BinlogData,
}

impl BinlogResponse {
    pub fn is_eof(&self) -> bool {
        self.error.contains("EOF")
    }
}

/// An ordered sequence of buffered binlog responses for at most `txn_batch`
/// completed source transactions.
#[derive(Debug, Default)]
pub struct TxnBuffer {
    pub events: Vec<BinlogResponse>,
    pub in_txn: bool,
    pub txn_index: usize,
    pub batch_start: Option<Instant>,
}

impl TxnBuffer {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn reset(&mut self) {
        self.events.clear();
        self.in_txn = false;
        self.txn_index = 0;
        self.batch_start = None;
    }
}

/// What the driver/batcher should do in response to one event.
#[derive(Debug)]
pub enum Action {
    /// The event was appended to the buffer; no flush is due yet.
    Buffered,
    /// A COMMIT crossed the count or time threshold; flush the buffer now.
    FlushBatch(FlushReason),
    /// A DDL event arrived. If `flush_first`, the caller must flush the
    /// currently buffered batch before applying `ddl`.
    Ddl { flush_first: bool, ddl: DdlEvent },
    /// Terminal EOF. `needs_flush` is true when the last buffered event is
    /// a COMMIT that hasn't been flushed yet.
    Eof { needs_flush: bool, group_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    CountThreshold,
    TimeThreshold,
}

#[derive(Debug, Clone)]
pub struct DdlEvent {
    pub sql: Vec<String>,
    pub position: ReplicationCoordinates,
}

pub struct EventStateMachine {
    pub buffer: TxnBuffer,
    txn_batch: usize,
    max_txn_interval: Duration,
}

impl EventStateMachine {
    pub fn new(txn_batch: usize, max_txn_interval: Duration) -> Self {
        EventStateMachine {
            buffer: TxnBuffer::default(),
            txn_batch,
            max_txn_interval,
        }
    }

    /// Classify one event and update the buffer accordingly.
    pub fn step(&mut self, response: BinlogResponse, now: Instant) -> PlayerResult<Action> {
        if !response.error.is_empty() {
            return self.step_error(response);
        }

        match response.data.sql_type {
            Some(SqlType::Ddl) => {
                let flush_first = self.buffer.txn_index > 0;
                Ok(Action::Ddl {
                    flush_first,
                    ddl: DdlEvent {
                        sql: response.data.sql.clone(),
                        position: response.position.clone(),
                    },
                })
            }
            Some(SqlType::Begin) => self.step_begin(response, now),
            Some(SqlType::Commit) => self.step_commit(response, now),
            Some(SqlType::Dml) => self.step_dml(response),
            None => Err(PlayerError::protocol("unknown SqlType")),
        }
    }

    fn step_error(&mut self, response: BinlogResponse) -> PlayerResult<Action> {
        if response.is_eof() {
            let needs_flush = self.buffer.txn_index > 0
                && matches!(
                    self.buffer.events.last().and_then(|e| e.data.sql_type),
                    Some(SqlType::Commit)
                );
            return Ok(Action::Eof {
                needs_flush,
                group_id: response.position.group_id,
            });
        }

        if !response.position.master_filename.is_empty() {
            Err(PlayerError::Upstream(format!(
                "{} (at {})",
                response.error, response.position
            )))
        } else {
            Err(PlayerError::Upstream(response.error))
        }
    }

    fn step_begin(&mut self, response: BinlogResponse, now: Instant) -> PlayerResult<Action> {
        if self.buffer.in_txn {
            return Err(PlayerError::protocol("txn already in progress"));
        }
        // Only the first BEGIN of a batch starts its clock; later ones in
        // the same batch append to the already-buffered completed
        // transactions rather than clearing them.
        if self.buffer.txn_index == 0 {
            self.buffer.batch_start = Some(now);
        }
        self.buffer.in_txn = true;
        self.buffer.events.push(response);
        Ok(Action::Buffered)
    }

    fn step_commit(&mut self, response: BinlogResponse, now: Instant) -> PlayerResult<Action> {
        if !self.buffer.in_txn {
            return Err(PlayerError::protocol("COMMIT received outside of a transaction"));
        }
        self.buffer.events.push(response);
        self.buffer.txn_index += 1;
        self.buffer.in_txn = false;

        let elapsed = self
            .buffer
            .batch_start
            .map(|start| now.duration_since(start))
            .unwrap_or_default();

        if elapsed > self.max_txn_interval {
            Ok(Action::FlushBatch(FlushReason::TimeThreshold))
        } else if self.buffer.txn_index == self.txn_batch {
            Ok(Action::FlushBatch(FlushReason::CountThreshold))
        } else {
            Ok(Action::Buffered)
        }
    }

    fn step_dml(&mut self, response: BinlogResponse) -> PlayerResult<Action> {
        if !self.buffer.in_txn {
            return Err(PlayerError::protocol("DML received outside of a transaction"));
        }
        self.buffer.events.push(response);
        Ok(Action::Buffered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin() -> BinlogResponse {
        BinlogResponse {
            data: BinlogData {
                sql_type: Some(SqlType::Begin),
                sql: vec![],
            },
            ..Default::default()
        }
    }

    fn dml(sql: &str) -> BinlogResponse {
        BinlogResponse {
            data: BinlogData {
                sql_type: Some(SqlType::Dml),
                sql: vec![sql.to_string()],
            },
            ..Default::default()
        }
    }

    fn commit(pos: u64) -> BinlogResponse {
        BinlogResponse {
            position: ReplicationCoordinates {
                master_filename: "bin.000001".into(),
                master_position: pos,
                group_id: String::new(),
            },
            data: BinlogData {
                sql_type: Some(SqlType::Commit),
                sql: vec![],
            },
            ..Default::default()
        }
    }

    #[test]
    fn simple_batch_flushes_on_count_threshold() {
        let mut sm = EventStateMachine::new(2, Duration::from_secs(3600));
        let t0 = Instant::now();

        assert!(matches!(sm.step(begin(), t0).unwrap(), Action::Buffered));
        assert!(matches!(sm.step(dml("insert"), t0).unwrap(), Action::Buffered));
        assert!(matches!(sm.step(commit(10), t0).unwrap(), Action::Buffered));
        assert_eq!(sm.buffer.txn_index, 1);

        assert!(matches!(sm.step(begin(), t0).unwrap(), Action::Buffered));
        assert!(matches!(sm.step(dml("update"), t0).unwrap(), Action::Buffered));
        let action = sm.step(commit(20), t0).unwrap();
        assert!(matches!(action, Action::FlushBatch(FlushReason::CountThreshold)));
        assert_eq!(sm.buffer.txn_index, 2);
    }

    #[test]
    fn time_bounded_flush_fires_on_first_commit() {
        let mut sm = EventStateMachine::new(10, Duration::from_millis(50));
        let t0 = Instant::now();
        sm.step(begin(), t0).unwrap();
        sm.step(dml("insert"), t0).unwrap();
        let later = t0 + Duration::from_millis(100);
        let action = sm.step(commit(1), later).unwrap();
        assert!(matches!(action, Action::FlushBatch(FlushReason::TimeThreshold)));
    }

    #[test]
    fn nested_begin_is_rejected() {
        let mut sm = EventStateMachine::new(10, Duration::from_secs(1));
        let t0 = Instant::now();
        sm.step(begin(), t0).unwrap();
        let err = sm.step(begin(), t0).unwrap_err();
        assert!(err.to_string().contains("txn already in progress"));
    }

    #[test]
    fn commit_without_begin_is_rejected() {
        let mut sm = EventStateMachine::new(10, Duration::from_secs(1));
        let t0 = Instant::now();
        let err = sm.step(commit(1), t0).unwrap_err();
        assert!(err.to_string().contains("outside of a transaction"));
    }

    #[test]
    fn dml_without_begin_is_rejected() {
        let mut sm = EventStateMachine::new(10, Duration::from_secs(1));
        let t0 = Instant::now();
        let err = sm.step(dml("insert"), t0).unwrap_err();
        assert!(err.to_string().contains("outside of a transaction"));
    }

    #[test]
    fn ddl_flushes_in_progress_batch_first() {
        let mut sm = EventStateMachine::new(10, Duration::from_secs(1));
        let t0 = Instant::now();
        sm.step(begin(), t0).unwrap();
        sm.step(dml("insert"), t0).unwrap();
        sm.step(commit(1), t0).unwrap();
        assert_eq!(sm.buffer.txn_index, 1);

        let ddl = BinlogResponse {
            data: BinlogData {
                sql_type: Some(SqlType::Ddl),
                sql: vec!["alter table t add column c int".into()],
            },
            ..Default::default()
        };
        let action = sm.step(ddl, t0).unwrap();
        match action {
            Action::Ddl { flush_first, .. } => assert!(flush_first),
            _ => panic!("expected Ddl action"),
        }
    }

    #[test]
    fn eof_with_pending_commit_requests_flush() {
        let mut sm = EventStateMachine::new(10, Duration::from_secs(1));
        let t0 = Instant::now();
        sm.step(begin(), t0).unwrap();
        sm.step(dml("insert"), t0).unwrap();
        sm.step(commit(1), t0).unwrap();

        let eof = BinlogResponse {
            error: "replication stream EOF".into(),
            position: ReplicationCoordinates {
                group_id: "G".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let action = sm.step(eof, t0).unwrap();
        match action {
            Action::Eof { needs_flush, group_id } => {
                assert!(needs_flush);
                assert_eq!(group_id, "G");
            }
            _ => panic!("expected Eof action"),
        }
    }

    #[test]
    fn non_eof_upstream_error_is_returned() {
        let mut sm = EventStateMachine::new(10, Duration::from_secs(1));
        let t0 = Instant::now();
        let err_resp = BinlogResponse {
            error: "connection reset by peer".into(),
            position: ReplicationCoordinates {
                master_filename: "bin.000001".into(),
                master_position: 42,
                group_id: String::new(),
            },
            ..Default::default()
        };
        let err = sm.step(err_resp, t0).unwrap_err();
        assert!(err.to_string().contains("connection reset by peer"));
        assert!(err.to_string().contains("bin.000001"));
    }
}
