//! RPC plumbing and the service adapters.
//!
//! The transport is a framed request/response exchange over a
//! [`Socket`]/[`Listener`] seam (TCP in production, mocks in tests). On
//! top of it sit symmetric shims per service: a handler that exposes an
//! in-process capability on the wire, and a client that wraps the wire as
//! the capability. Callers therefore hold `Arc<dyn Chunkserver>` or
//! `Arc<dyn SyncCoordinator>` without knowing whether the far side is a
//! function call or a network hop.

pub mod chunkserver;
pub mod client;
pub mod error;
pub mod message;
pub mod server;
pub mod service;
pub mod socket;
pub mod sync;
pub mod tcp;

pub use chunkserver::{ChunkserverService, RemoteChunkserver, RpcConnectionCache};
pub use client::{Connector, RpcClient};
pub use error::{FrameDefect, RpcError};
pub use server::{publish, ServerHandle};
pub use service::{ServiceHandler, ServiceRegistry};
pub use socket::{Listener, Socket};
pub use sync::{RemoteSync, SyncService};
pub use tcp::{TcpConnector, TcpListener, TcpSocket};
