//! Test doubles for the Concord wire protocol.
//!
//! `MockWsClient` drives a real server from tests; `MockWsServer` plays the
//! server's half of the handshake so client-side logic can be exercised
//! without the real thing.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockWsClient;
pub use mock_ws_server::{MockServerBehavior, MockWsServer};
