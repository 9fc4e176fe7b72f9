//! Sync service adapters: the lease coordination surface on the wire.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use zircon_lease::SyncCoordinator;
use zircon_proto::sync::{
    BlockReq, ConfirmSyncRsp, Empty, GetFsRootRsp, MethodId, SERVICE_ID, SERVICE_NAME,
};
use zircon_proto::{decode, encode};
use zircon_types::{BlockId, Result, ServerAddress, ZirconError};

use crate::client::{Connector, RpcClient};
use crate::service::{unknown_method, ServiceHandler};
use crate::socket::Socket;

fn outcome(result: Result<()>) -> Empty {
    match result {
        Ok(()) => Empty::ok(),
        Err(e) => Empty::err(e.to_string()),
    }
}

/// Wire handler exposing a sync coordinator.
pub struct SyncService {
    coordinator: Arc<dyn SyncCoordinator>,
}

impl SyncService {
    pub fn new(coordinator: Arc<dyn SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ServiceHandler for SyncService {
    fn service_id(&self) -> u16 {
        SERVICE_ID
    }

    fn service_name(&self) -> &str {
        SERVICE_NAME
    }

    async fn handle(&self, method_id: u16, request: Bytes) -> Result<Bytes> {
        let method =
            MethodId::from_u16(method_id).ok_or_else(|| unknown_method(SERVICE_NAME, method_id))?;

        match method {
            MethodId::StartSync => {
                let req: BlockReq = decode(&request)?;
                let result = self.coordinator.start_sync(BlockId(req.block)).await;
                Ok(encode(&outcome(result)))
            }
            MethodId::UpgradeSync => {
                let req: BlockReq = decode(&request)?;
                let result = self.coordinator.upgrade_sync(BlockId(req.block)).await;
                Ok(encode(&outcome(result)))
            }
            MethodId::ReleaseSync => {
                let req: BlockReq = decode(&request)?;
                let result = self.coordinator.release_sync(BlockId(req.block)).await;
                Ok(encode(&outcome(result)))
            }
            MethodId::ConfirmSync => {
                let req: BlockReq = decode(&request)?;
                let rsp = match self.coordinator.confirm_sync(BlockId(req.block)).await {
                    Ok(held) => ConfirmSyncRsp {
                        held,
                        error: String::new(),
                    },
                    Err(e) => ConfirmSyncRsp {
                        held: false,
                        error: e.to_string(),
                    },
                };
                Ok(encode(&rsp))
            }
            MethodId::GetFsRoot => {
                let rsp = match self.coordinator.get_fs_root().await {
                    Ok(block) => GetFsRootRsp {
                        block: block.0,
                        error: String::new(),
                    },
                    Err(e) => GetFsRootRsp {
                        block: 0,
                        error: e.to_string(),
                    },
                };
                Ok(encode(&rsp))
            }
        }
    }
}

/// Sync coordinator capability over the wire.
pub struct RemoteSync<S: Socket> {
    client: Arc<RpcClient<S>>,
    connector: Arc<dyn Connector<S>>,
    address: ServerAddress,
}

impl<S: Socket> RemoteSync<S> {
    pub fn new(
        client: Arc<RpcClient<S>>,
        connector: Arc<dyn Connector<S>>,
        address: ServerAddress,
    ) -> Self {
        Self {
            client,
            connector,
            address,
        }
    }

    async fn call<Req, Rsp>(&self, method: MethodId, req: &Req) -> Result<Rsp>
    where
        Req: Serialize + Sync,
        Rsp: DeserializeOwned,
    {
        let payload = self
            .client
            .call(
                self.connector.as_ref(),
                &self.address,
                SERVICE_ID,
                method.as_u16(),
                &encode(req),
            )
            .await
            .map_err(ZirconError::from)?;
        decode(&payload)
    }

    async fn call_unit(&self, method: MethodId, block: BlockId) -> Result<()> {
        let rsp: Empty = self.call(method, &BlockReq { block: block.0 }).await?;
        if rsp.error.is_empty() {
            Ok(())
        } else {
            Err(ZirconError::Remote(rsp.error))
        }
    }
}

#[async_trait]
impl<S: Socket> SyncCoordinator for RemoteSync<S> {
    async fn start_sync(&self, block: BlockId) -> Result<()> {
        self.call_unit(MethodId::StartSync, block).await
    }

    async fn upgrade_sync(&self, block: BlockId) -> Result<()> {
        self.call_unit(MethodId::UpgradeSync, block).await
    }

    async fn release_sync(&self, block: BlockId) -> Result<()> {
        self.call_unit(MethodId::ReleaseSync, block).await
    }

    async fn confirm_sync(&self, block: BlockId) -> Result<bool> {
        let rsp: ConfirmSyncRsp = self
            .call(MethodId::ConfirmSync, &BlockReq { block: block.0 })
            .await?;
        if rsp.error.is_empty() {
            Ok(rsp.held)
        } else {
            Err(ZirconError::Remote(rsp.error))
        }
    }

    async fn get_fs_root(&self) -> Result<BlockId> {
        let rsp: GetFsRootRsp = self.call(MethodId::GetFsRoot, &Empty::ok()).await?;
        if rsp.error.is_empty() {
            Ok(BlockId(rsp.block))
        } else {
            Err(ZirconError::Remote(rsp.error))
        }
    }
}
