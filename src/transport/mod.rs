//! HTTP data-source construction for download sessions.
//!
//! This module provides the [`TransportFactory`], which builds HTTP
//! connections carrying the session's fixed client identifier, and the
//! [`Transport`] those connections power: HEAD probing and byte-range
//! streaming fetches.
//!
//! # Example
//!
//! ```no_run
//! use mediadl_core::transport::TransportFactory;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = TransportFactory::new("player-app");
//! let transport = factory.create()?;
//! let mut fetch = transport.fetch_from("https://example.com/clip.mp4", 0).await?;
//! while let Some(chunk) = fetch.next_chunk().await? {
//!     // ... write chunk to the cache ...
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod factory;

pub use client::{Fetch, RemoteResource, Transport};
pub use error::TransportError;
pub use factory::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, TransportFactory};
