//! # PC Test Utilities
//!
//! Shared test utilities for the Presence Coordinator (PC) service.
//!
//! This crate provides:
//! - Server test harness (`TestPcServer`: real router, mock media engine)
//! - WebSocket test client (`TestClient`)
//! - Request params fixtures
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestPcServer::spawn().await?;
//!     let mut client = server.connect_client().await?;
//!
//!     let result = client.request("register", fixtures::register("Ann", None)).await?;
//!     assert_eq!(result["ok"], true);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use server_harness::*;
pub use ws_client::*;
