//! Upstream RPC client: a streaming `ServeBinlog(startPosition, keyRange)
//! -> stream<BinlogResponse>` call dialed over gRPC. The upstream binlog
//! server itself is an external collaborator — this module only owns the
//! dial, the request shape, and the conversion from wire types into the
//! domain types [`crate::state_machine`] operates on.

use tonic::transport::Channel;
use tonic::Streaming;

use crate::config::KeyRange;
use crate::error::{PlayerError, PlayerResult};
use crate::pb::blp::binlog_server_client::BinlogServerClient;
use crate::pb::blp::{self, ServeBinlogRequest};
use crate::state_machine::{BinlogData, BinlogResponse, ReplicationCoordinates, SqlType};

pub struct UpstreamClient {
    inner: BinlogServerClient<Channel>,
}

impl UpstreamClient {
    pub async fn connect(addr: &str) -> PlayerResult<Self> {
        let endpoint = format!("http://{addr}");
        let inner = BinlogServerClient::connect(endpoint).await?;
        Ok(UpstreamClient { inner })
    }

    /// Open the streaming call and return the raw `tonic::Streaming` handle.
    /// The caller (stream driver) owns draining it and releasing it on
    /// every exit path.
    pub async fn serve_binlog(
        &mut self,
        start_position: &ReplicationCoordinates,
        key_range: &KeyRange,
    ) -> PlayerResult<Streaming<blp::BinlogResponse>> {
        let request = ServeBinlogRequest {
            start_position: Some(blp::ReplicationCoordinates {
                master_filename: start_position.master_filename.clone(),
                master_position: start_position.master_position,
                group_id: start_position.group_id.clone(),
            }),
            key_range: Some(blp::KeyRange {
                start: key_range.start.clone(),
                end: key_range.end.clone(),
            }),
        };
        let response = self.inner.serve_binlog(request).await?;
        Ok(response.into_inner())
    }
}

impl From<blp::BinlogResponse> for BinlogResponse {
    fn from(value: blp::BinlogResponse) -> Self {
        let position = value
            .position
            .and_then(|p| p.position)
            .map(coordinates_from_pb)
            .unwrap_or_default();

        let data = value.data.map(data_from_pb).unwrap_or_default();

        BinlogResponse {
            error: value.error,
            position,
            data,
        }
    }
}

fn coordinates_from_pb(value: blp::ReplicationCoordinates) -> ReplicationCoordinates {
    ReplicationCoordinates {
        master_filename: value.master_filename,
        master_position: value.master_position,
        group_id: value.group_id,
    }
}

fn data_from_pb(value: blp::BinlogData) -> BinlogData {
    let sql_type = match blp::SqlType::try_from(value.sql_type) {
        Ok(blp::SqlType::Begin) => Some(SqlType::Begin),
        Ok(blp::SqlType::Commit) => Some(SqlType::Commit),
        Ok(blp::SqlType::Dml) => Some(SqlType::Dml),
        Ok(blp::SqlType::Ddl) => Some(SqlType::Ddl),
        _ => None,
    };
    BinlogData {
        sql_type,
        sql: value.sql,
    }
}

/// Convert a raw `tonic` stream item into our domain type, surfacing
/// transport failure as a [`PlayerError::Transport`].
pub fn convert_item(item: Result<blp::BinlogResponse, tonic::Status>) -> PlayerResult<BinlogResponse> {
    item.map(BinlogResponse::from).map_err(PlayerError::from)
}
