//! Gateway core: WebSocket clients driving SQL Server sessions.
//!
//! - One [`Session`] per connection, owning the database handle
//! - Queries run on a background [`executor`] thread, one at a time
//! - Results stream out as events or come back as one spreadsheet
//!
//! Inbound frames go through [`dispatch`]; outbound events go through the
//! connection's [`Outbox`] and are written by the connection thread.

pub mod dispatch;
pub mod executor;
pub mod outbox;
pub mod server;
pub mod session;
pub mod sink;

#[cfg(test)]
pub mod testing;

pub use executor::QueryOutcome;
pub use outbox::Outbox;
pub use server::{ConnectionRegistry, GatewayConfig, GatewayServer, ServerMetrics, ShutdownHandle};
pub use session::{Session, SessionError, SessionSettings};
