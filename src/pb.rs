//! Generated upstream RPC types (`proto/binlog.proto`), via `tonic_build` in
//! `build.rs` — the same build-time codegen pattern the wider corpus uses
//! for its own protobuf-backed connector surfaces.

pub mod blp {
    tonic::include_proto!("blp");
}
