//! # dbgate-testing
//!
//! Test infrastructure for the dbgate connection layer.
//!
//! The connection layer talks to the outside world through two seams: the
//! [`EventDemux`](dbgate_core::EventDemux) that watches descriptors and the
//! [`Protocol`](dbgate_core::Protocol) modules that own the sockets. This
//! crate provides in-memory doubles for both, plus a [`TestGateway`] that
//! wires them to a [`DcbManager`](dbgate_core::DcbManager) and a server
//! registry.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbgate_testing::TestGateway;
//!
//! let gw = TestGateway::new(2)?;
//! let db1 = gw.add_server("db1", 5, std::time::Duration::from_secs(60))?;
//! let backend = gw.connect(&db1, "alice")?;
//! gw.manager.close(&backend);
//! assert_eq!(db1.stats().n_persistent, 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod demux;
pub mod gateway;
pub mod protocol;

pub use demux::MockDemux;
pub use gateway::{TestGateway, init_tracing};
pub use protocol::RecordingProtocol;
