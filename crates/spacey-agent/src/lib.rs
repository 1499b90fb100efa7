// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # Spacey Agent
//!
//! Keep-alive connection pooling for HTTP clients, modelled on the
//! `http.Agent` of Node.js.
//!
//! The crate is split in two layers:
//!
//! - [`Pool`]: the bookkeeping. It owns no sockets and performs no I/O; each
//!   operation returns the [`Action`]s the caller must carry out.
//! - [`Agent`]: a tokio task that drives a [`Pool`], opening connections
//!   through a [`Transport`] and handing them out as [`Lease`]s.
//!
//! ```rust,ignore
//! use spacey_agent::{Agent, AgentOptions, ConnectOptions, TcpTransport};
//!
//! let agent = Agent::spawn(AgentOptions::keep_alive(), TcpTransport::new())?;
//! let first = agent.request(ConnectOptions::new("localhost", 8080)).await?;
//! first.release();
//!
//! let second = agent.request(ConnectOptions::new("localhost", 8080)).await?;
//! assert!(second.reused());
//! ```

#![warn(missing_docs)]

pub mod agent;
pub mod error;
pub mod key;
pub mod options;
pub mod pool;
pub mod session;
pub mod transport;

pub use agent::{Agent, AgentHandle, HostEvent, Lease, PendingLease};
pub use error::{AgentError, Result};
pub use key::EndpointKey;
pub use options::{AgentOptions, ConnectOptions, Scheduling, TlsOptions};
pub use pool::{
    Action, EndpointStats, FreeInfo, Pool, PoolStats, RequestId, SocketEvent, SocketId,
};
pub use session::{SessionCache, SharedSessionCache};
pub use transport::{Connection, TcpConnection, TcpTransport, Transport};
