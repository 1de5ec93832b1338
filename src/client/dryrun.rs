//! The dry-run [`DatabaseClient`]: writes `BEGIN;`, `COMMIT;`, `ROLLBACK;`,
//! and each query terminated by `;\n` to a buffered output sink, instead of
//! touching a real database. Used for capture/replay tooling.
//!
//! Flushes its buffered writer explicitly on close, rather than leaving the
//! last bytes stranded in the buffer.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use super::{DatabaseClient, QueryResult};
use crate::error::PlayerResult;

pub struct DryRunClient<W> {
    out: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> DryRunClient<W> {
    pub fn new(sink: W) -> Self {
        DryRunClient {
            out: BufWriter::new(sink),
        }
    }

    async fn write_line(&mut self, line: &str) -> PlayerResult<()> {
        self.out.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> DatabaseClient for DryRunClient<W> {
    async fn connect(&mut self) -> PlayerResult<()> {
        Ok(())
    }

    async fn begin(&mut self) -> PlayerResult<()> {
        self.write_line("BEGIN;\n").await
    }

    async fn commit(&mut self) -> PlayerResult<()> {
        self.write_line("COMMIT;\n").await
    }

    async fn rollback(&mut self) -> PlayerResult<()> {
        self.write_line("ROLLBACK;\n").await
    }

    async fn close(&mut self) -> PlayerResult<()> {
        self.out.flush().await?;
        Ok(())
    }

    async fn execute(&mut self, query: &str, _max_rows: usize, _want_fields: bool) -> PlayerResult<QueryResult> {
        self.write_line(query).await?;
        self.write_line(";\n").await?;
        Ok(QueryResult {
            rows_affected: 1,
            ..Default::default()
        })
    }
}
