//! Server-side core for a lightweight RPC and publish/subscribe protocol
//! multiplexed over a single bidirectional, message-oriented transport.
//!
//! Clients connect, invoke named server-side procedures identified by path
//! patterns, and receive asynchronously published messages on paths to which
//! the server has subscribed them. This crate provides the textual framing
//! codec, the routing and middleware layers that dispatch invocations, the
//! subscription registry that fans published payloads out to interested
//! clients, and the connection lifecycle that ties them together.
//!
//! The underlying transport, HTTP upgrade handling, and front-end
//! authentication are external collaborators and are not provided here; see
//! [`server::connection::Transport`] for the seam a transport adapter must
//! fill.

#![cfg_attr(test, expect(clippy::unwrap_used, reason = "test code can panic"))]
#![cfg_attr(test, expect(clippy::expect_used, reason = "test code can panic"))]
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "test code with known bounds")
)]
#![cfg_attr(test, expect(clippy::shadow_reuse, reason = "test code shadowing"))]

pub mod codec;
pub mod config;
pub mod error;
pub mod middleware;
pub mod registry;
pub mod router;
pub mod server;

pub use codec::{Frame, InvokeId, ParserError, Path};
pub use error::{DispatchError, InvokeError};
pub use server::{Server, ServerConfig, ServerEvent};
