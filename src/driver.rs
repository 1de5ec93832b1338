//! Stream driver: owns the upstream RPC stream, the cancellation signal,
//! and the main receive loop. Feeds events to the state machine and
//! terminates cleanly on EOF, error, or external interrupt.
//!
//! Single-logical-thread per player: the state machine, batcher, and
//! database client are never touched concurrently. The only suspension
//! points are the upstream receive, the database calls, and the retry
//! sleep.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::batcher::{Batcher, FlushOutcome};
use crate::checkpoint;
use crate::client::DatabaseClient;
use crate::config::{Config, RecoveryState};
use crate::error::{PlayerError, PlayerResult};
use crate::filter::Filter;
use crate::stats::Stats;
use crate::state_machine::{Action, EventStateMachine, TxnBuffer};
use crate::upstream::{self, UpstreamClient};

/// Runs the player against the upstream addr/position in `recovery` until
/// EOF, a fatal error, or `interrupt` fires. The upstream RPC handle is
/// acquired on entry and released on every exit path.
pub async fn apply_binlog_events(
    config: &Config,
    recovery: &mut RecoveryState,
    client: &mut dyn DatabaseClient,
    filter: &Filter,
    stats: &Stats,
    mut interrupt: oneshot::Receiver<()>,
) -> PlayerResult<()> {
    recovery.validate()?;

    let key_range = config.key_range()?;
    let (start_hex, end_hex) = key_range.to_hex();
    info!(addr = %recovery.addr, start = %start_hex, end = %end_hex, "dialing upstream binlog server");

    let mut upstream = UpstreamClient::connect(&recovery.addr).await?;
    let mut stream = upstream.serve_binlog(&recovery.position, &key_range).await?;

    let mut sm = EventStateMachine::new(config.txn_batch, config.max_txn_interval());

    loop {
        tokio::select! {
            biased;
            _ = &mut interrupt => {
                info!("received interrupt, stopping stream driver");
                return Ok(());
            }
            item = stream.next() => {
                let Some(item) = item else {
                    info!("upstream response channel closed");
                    return Ok(());
                };
                let response = upstream::convert_item(item)?;
                if config.enable_statement_logging {
                    debug!(?response, "received binlog event");
                }

                let now = Instant::now();
                match sm.step(response, now)? {
                    Action::Buffered => {}
                    Action::FlushBatch(_reason) => {
                        flush_until_done(&mut sm.buffer, client, filter, stats, config, recovery).await?;
                    }
                    Action::Ddl { flush_first, ddl } => {
                        if flush_first {
                            flush_until_done(&mut sm.buffer, client, filter, stats, config, recovery).await?;
                        }
                        let mut batcher = Batcher::new(client, filter, stats, config);
                        batcher.apply_ddl(&ddl.sql, &ddl.position).await?;
                        recovery.position = ddl.position;
                    }
                    Action::Eof { needs_flush, group_id } => {
                        if needs_flush {
                            flush_until_done(&mut sm.buffer, client, filter, stats, config, recovery).await?;
                        }
                        if sm.buffer.is_empty() {
                            checkpoint::save_last_eof_group_id(
                                client,
                                stats,
                                config.uid,
                                &group_id,
                                config.slow_query_threshold(),
                            )
                            .await?;
                        }
                        info!("upstream drained cleanly at EOF");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Flush `buffer`, retrying on deadlock with capped exponential backoff.
/// On success the buffer is reset and `recovery.position` is advanced to
/// the last buffered COMMIT's position.
async fn flush_until_done(
    buffer: &mut TxnBuffer,
    client: &mut dyn DatabaseClient,
    filter: &Filter,
    stats: &Stats,
    config: &Config,
    recovery: &mut RecoveryState,
) -> PlayerResult<()> {
    let last_commit_position = buffer
        .events
        .iter()
        .rev()
        .find(|e| matches!(e.data.sql_type, Some(crate::state_machine::SqlType::Commit)))
        .map(|e| e.position.clone());

    let mut attempt = 0u32;
    loop {
        let mut batcher = Batcher::new(client, filter, stats, config);
        match batcher.flush(buffer).await? {
            FlushOutcome::Flushed => {
                if let Some(position) = last_commit_position {
                    recovery.position = position;
                }
                buffer.reset();
                return Ok(());
            }
            FlushOutcome::Empty => {
                buffer.reset();
                return Ok(());
            }
            FlushOutcome::Retry => {
                attempt += 1;
                if attempt > config.deadlock_retry_max_attempts {
                    return Err(PlayerError::RetryExhausted(attempt));
                }
                let delay = backoff_delay(config, attempt);
                warn!(attempt, ?delay, "retrying flush after deadlock");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn backoff_delay(config: &Config, attempt: u32) -> Duration {
    let base_ms = config.deadlock_retry_initial_ms.saturating_mul(1u64 << attempt.min(16));
    let capped_ms = base_ms.min(config.deadlock_retry_max_ms);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped_ms / 4 + 1);
    Duration::from_millis(capped_ms + jitter_ms)
}
