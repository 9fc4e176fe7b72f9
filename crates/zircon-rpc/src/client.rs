//! The RPC client: pooled connections and deadline-carrying calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;

use zircon_types::ServerAddress;

use crate::error::RpcError;
use crate::server::{decode_response, encode_request};
use crate::socket::{recv_frame, send_frame, Socket};

/// Establishes new connections to a remote address.
#[async_trait]
pub trait Connector<S: Socket>: Send + Sync {
    async fn connect(&self, address: &ServerAddress) -> Result<S, RpcError>;
}

/// RPC client over pooled connections, one per remote address.
///
/// A call locks its connection for the whole request/response exchange,
/// so concurrent callers to the same address serialize on the socket
/// instead of interleaving frames. Every call carries a deadline; on
/// expiry the connection is dropped from the pool (a response may still
/// be in flight on it) and the call fails with `DeadlineExceeded`.
pub struct RpcClient<S: Socket> {
    pool: DashMap<ServerAddress, Arc<Mutex<S>>>,
    call_timeout: Duration,
}

impl<S: Socket> RpcClient<S> {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            pool: DashMap::new(),
            call_timeout,
        }
    }

    /// Send one request and wait for its response payload.
    pub async fn call(
        &self,
        connector: &(dyn Connector<S> + '_),
        address: &ServerAddress,
        service_id: u16,
        method_id: u16,
        body: &[u8],
    ) -> Result<Bytes, RpcError> {
        let outcome = tokio::time::timeout(
            self.call_timeout,
            self.exchange(connector, address, service_id, method_id, body),
        )
        .await;

        match outcome {
            Ok(Ok(payload)) => decode_response(payload),
            Ok(Err(e)) => {
                // The connection is in an unknown state; dial fresh next time.
                self.pool.remove(address);
                Err(e)
            }
            Err(_) => {
                self.pool.remove(address);
                Err(RpcError::DeadlineExceeded)
            }
        }
    }

    async fn exchange(
        &self,
        connector: &(dyn Connector<S> + '_),
        address: &ServerAddress,
        service_id: u16,
        method_id: u16,
        body: &[u8],
    ) -> Result<Bytes, RpcError> {
        let connection = self.get_or_connect(connector, address).await?;
        let socket = connection.lock().await;
        send_frame(&*socket, &encode_request(service_id, method_id, body)).await?;
        recv_frame(&*socket).await
    }

    async fn get_or_connect(
        &self,
        connector: &(dyn Connector<S> + '_),
        address: &ServerAddress,
    ) -> Result<Arc<Mutex<S>>, RpcError> {
        if let Some(entry) = self.pool.get(address) {
            return Ok(Arc::clone(entry.value()));
        }
        let socket = connector.connect(address).await?;
        let connection = Arc::new(Mutex::new(socket));
        self.pool
            .insert(address.clone(), Arc::clone(&connection));
        Ok(connection)
    }

    /// Drop a pooled connection.
    pub fn evict(&self, address: &ServerAddress) {
        self.pool.remove(address);
    }
}
