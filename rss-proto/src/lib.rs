//! Generated gRPC messages and service stubs for the RSS wire protocol. See
//! `proto/rss.proto` for the message and service definitions; conversions to
//! and from `rss-common::model` types live in each component crate that
//! needs them, to keep this crate free of business logic.

tonic::include_proto!("rss");

/// Build a fresh 16-byte request id, per §6's "16-byte request id" framing.
pub fn new_request_id() -> Vec<u8> {
    uuid::Uuid::new_v4().as_bytes().to_vec()
}
