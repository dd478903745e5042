//! # Relay Test Utilities
//!
//! Mocks and fixtures for testing the chat relay without Redis or real
//! sockets.
//!
//! ## Modules
//!
//! - `mock_transport` - scripted in-memory transport with a test-side peer
//! - `mock_gate` - token decoder and membership directory mocks
//! - `mock_backbone` - backbones that fail, stall, record or subscribe late
//! - `fixtures` - identifiers, user tokens, polling helpers
//! - `server_harness` - `TestRelayServer`, a relay on a real listener
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let (gate, _mock) = MockGate::new()
//!         .member("r1", "alice")
//!         .member("r1", "bob")
//!         .into_access_gate();
//!     let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");
//!
//!     let alice = connect_client(&relay, "r1", "alice").await;
//!     let mut bob = connect_client(&relay, "r1", "bob").await;
//!     alice.peer.send_text("hi");
//!     assert!(bob.peer.recv().await.is_some());
//! }
//! ```

pub mod fixtures;
pub mod mock_backbone;
pub mod mock_gate;
pub mod mock_transport;
pub mod server_harness;

pub use fixtures::*;
pub use mock_backbone::*;
pub use mock_gate::*;
pub use mock_transport::*;
pub use server_harness::*;
