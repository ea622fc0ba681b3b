//! Controller side of the graphlink protocol.
//!
//! ```no_run
//! # async fn demo() -> Result<(), graphlink_core::ProtocolError> {
//! use graphlink_client::connect;
//! use graphlink_core::BindParams;
//!
//! let mut conn = connect("tcp://127.0.0.1:7400").await?;
//! conn.bind(BindParams::new(["ext0"])).await?;
//! conn.run().await?;
//! let events = conn.poll(Some(16)).await?;
//! # let _ = events;
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod connect;
mod upward;

pub use backoff::Backoff;
pub use connect::{ClientChannel, connect};
pub use upward::UpwardConnection;
