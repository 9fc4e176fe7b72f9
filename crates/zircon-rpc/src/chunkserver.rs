//! Chunkserver service adapters.
//!
//! [`ChunkserverService`] exposes an in-process [`Chunkserver`] as a wire
//! handler; [`RemoteChunkserver`] wraps the wire client as the capability.
//! Mutating RPCs coerce errors into the response's error string. `Read` is
//! the exception: its response carries the observed version even on error,
//! and the client reconstructs `StaleReplica` from a non-zero version so
//! freshness handling survives the network hop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use zircon_chunkserver::{Chunkserver, ConnectionCache};
use zircon_proto::chunkserver::{
    AddReq, ChunkVersion, CommitWriteReq, DeleteReq, Empty, ListAllChunksRsp, MethodId, ReadReq,
    ReadRsp, ReplicateReq, StartWriteReplicatedReq, StartWriteReq, UpdateLatestVersionReq,
    SERVICE_ID, SERVICE_NAME,
};
use zircon_proto::{decode, encode};
use zircon_types::{ChunkNum, CommitHash, Result, ServerAddress, Version, ZirconError};

use crate::client::{Connector, RpcClient};
use crate::service::{unknown_method, ServiceHandler};
use crate::socket::Socket;
use crate::tcp::{TcpConnector, TcpSocket};

fn outcome(result: Result<()>) -> Empty {
    match result {
        Ok(()) => Empty::ok(),
        Err(e) => Empty::err(e.to_string()),
    }
}

/// Wire handler exposing a chunkserver capability.
pub struct ChunkserverService {
    server: Arc<dyn Chunkserver>,
}

impl ChunkserverService {
    pub fn new(server: Arc<dyn Chunkserver>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl ServiceHandler for ChunkserverService {
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
            MethodId::StartWriteReplicated => {
                let req: StartWriteReplicatedReq = decode(&request)?;
                let replicas = req.addresses.into_iter().map(ServerAddress::from).collect();
                let result = self
                    .server
                    .start_write_replicated(ChunkNum(req.chunk), req.offset, req.data, replicas)
                    .await;
                Ok(encode(&outcome(result)))
            }
            MethodId::Replicate => {
                let req: ReplicateReq = decode(&request)?;
                let result = self
                    .server
                    .replicate(
                        ChunkNum(req.chunk),
                        ServerAddress::from(req.server_address),
                        Version(req.version),
                    )
                    .await;
                Ok(encode(&outcome(result)))
            }
            MethodId::Read => {
                let req: ReadReq = decode(&request)?;
                let rsp = match self
                    .server
                    .read(
                        ChunkNum(req.chunk),
                        req.offset,
                        req.length,
                        Version(req.version),
                    )
                    .await
                {
                    Ok((data, version)) => ReadRsp {
                        data,
                        version: version.0,
                        error: String::new(),
                    },
                    Err(e) => {
                        // Report the replica's version alongside the error
                        // so the caller can diagnose staleness.
                        let version = match &e {
                            ZirconError::StaleReplica { version } => version.0,
                            _ => 0,
                        };
                        let error = e.to_string();
                        debug_assert!(!error.is_empty(), "errored read needs a diagnostic");
                        ReadRsp {
                            data: Vec::new(),
                            version,
                            error,
                        }
                    }
                };
                Ok(encode(&rsp))
            }
            MethodId::StartWrite => {
                let req: StartWriteReq = decode(&request)?;
                let result = self
                    .server
                    .start_write(ChunkNum(req.chunk), req.offset, req.data)
                    .await;
                Ok(encode(&outcome(result)))
            }
            MethodId::CommitWrite => {
                let req: CommitWriteReq = decode(&request)?;
                let result = self
                    .server
                    .commit_write(
                        ChunkNum(req.chunk),
                        CommitHash(req.hash),
                        Version(req.old_version),
                        Version(req.new_version),
                    )
                    .await;
                Ok(encode(&outcome(result)))
            }
            MethodId::UpdateLatestVersion => {
                let req: UpdateLatestVersionReq = decode(&request)?;
                let result = self
                    .server
                    .update_latest_version(
                        ChunkNum(req.chunk),
                        Version(req.old_version),
                        Version(req.new_version),
                    )
                    .await;
                Ok(encode(&outcome(result)))
            }
            MethodId::Add => {
                let req: AddReq = decode(&request)?;
                let result = self
                    .server
                    .add(ChunkNum(req.chunk), req.initial_data, Version(req.version))
                    .await;
                Ok(encode(&outcome(result)))
            }
            MethodId::Delete => {
                let req: DeleteReq = decode(&request)?;
                let result = self
                    .server
                    .delete(ChunkNum(req.chunk), Version(req.version))
                    .await;
                Ok(encode(&outcome(result)))
            }
            MethodId::ListAllChunks => {
                let rsp = match self.server.list_all_chunks().await {
                    Ok(chunks) => ListAllChunksRsp {
                        chunks: chunks
                            .into_iter()
                            .map(|(chunk, version)| ChunkVersion {
                                chunk: chunk.0,
                                version: version.0,
                            })
                            .collect(),
                        error: String::new(),
                    },
                    Err(e) => ListAllChunksRsp {
                        chunks: Vec::new(),
                        error: e.to_string(),
                    },
                };
                Ok(encode(&rsp))
            }
        }
    }
}

/// Chunkserver capability over the wire.
pub struct RemoteChunkserver<S: Socket> {
    client: Arc<RpcClient<S>>,
    connector: Arc<dyn Connector<S>>,
    address: ServerAddress,
}

impl<S: Socket> RemoteChunkserver<S> {
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

    async fn call_unit<Req>(&self, method: MethodId, req: &Req) -> Result<()>
    where
        Req: Serialize + Sync,
    {
        let rsp: Empty = self.call(method, req).await?;
        if rsp.error.is_empty() {
            Ok(())
        } else {
            Err(ZirconError::Remote(rsp.error))
        }
    }
}

#[async_trait]
impl<S: Socket> Chunkserver for RemoteChunkserver<S> {
    async fn start_write_replicated(
        &self,
        chunk: ChunkNum,
        offset: u32,
        data: Vec<u8>,
        replicas: Vec<ServerAddress>,
    ) -> Result<()> {
        let req = StartWriteReplicatedReq {
            chunk: chunk.0,
            offset,
            data,
            addresses: replicas.into_iter().map(|a| a.0).collect(),
        };
        self.call_unit(MethodId::StartWriteReplicated, &req).await
    }

    async fn replicate(
        &self,
        chunk: ChunkNum,
        source: ServerAddress,
        version: Version,
    ) -> Result<()> {
        let req = ReplicateReq {
            chunk: chunk.0,
            server_address: source.0,
            version: version.0,
        };
        self.call_unit(MethodId::Replicate, &req).await
    }

    async fn read(
        &self,
        chunk: ChunkNum,
        offset: u32,
        length: u32,
        min_version: Version,
    ) -> Result<(Vec<u8>, Version)> {
        let req = ReadReq {
            chunk: chunk.0,
            offset,
            length,
            version: min_version.0,
        };
        let rsp: ReadRsp = self.call(MethodId::Read, &req).await?;
        if rsp.error.is_empty() {
            Ok((rsp.data, Version(rsp.version)))
        } else if rsp.version != 0 {
            // The replica answered with its (stale) version.
            Err(ZirconError::StaleReplica {
                version: Version(rsp.version),
            })
        } else {
            Err(ZirconError::Remote(rsp.error))
        }
    }

    async fn start_write(&self, chunk: ChunkNum, offset: u32, data: Vec<u8>) -> Result<()> {
        let req = StartWriteReq {
            chunk: chunk.0,
            offset,
            data,
        };
        self.call_unit(MethodId::StartWrite, &req).await
    }

    async fn commit_write(
        &self,
        chunk: ChunkNum,
        hash: CommitHash,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        let req = CommitWriteReq {
            chunk: chunk.0,
            hash: hash.0,
            old_version: old_version.0,
            new_version: new_version.0,
        };
        self.call_unit(MethodId::CommitWrite, &req).await
    }

    async fn update_latest_version(
        &self,
        chunk: ChunkNum,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        let req = UpdateLatestVersionReq {
            chunk: chunk.0,
            old_version: old_version.0,
            new_version: new_version.0,
        };
        self.call_unit(MethodId::UpdateLatestVersion, &req).await
    }

    async fn add(&self, chunk: ChunkNum, initial_data: Vec<u8>, version: Version) -> Result<()> {
        let req = AddReq {
            chunk: chunk.0,
            initial_data,
            version: version.0,
        };
        self.call_unit(MethodId::Add, &req).await
    }

    async fn delete(&self, chunk: ChunkNum, version: Version) -> Result<()> {
        let req = DeleteReq {
            chunk: chunk.0,
            version: version.0,
        };
        self.call_unit(MethodId::Delete, &req).await
    }

    async fn list_all_chunks(&self) -> Result<Vec<(ChunkNum, Version)>> {
        let rsp: ListAllChunksRsp = self.call(MethodId::ListAllChunks, &Empty::ok()).await?;
        if !rsp.error.is_empty() {
            return Err(ZirconError::Remote(rsp.error));
        }
        Ok(rsp
            .chunks
            .into_iter()
            .map(|cv| (ChunkNum(cv.chunk), Version(cv.version)))
            .collect())
    }
}

/// Connection cache that dials chunkservers over TCP, one wire client per
/// remote address.
pub struct RpcConnectionCache {
    client: Arc<RpcClient<TcpSocket>>,
    connector: Arc<TcpConnector>,
    servers: DashMap<ServerAddress, Arc<dyn Chunkserver>>,
}

impl RpcConnectionCache {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            client: Arc::new(RpcClient::new(call_timeout)),
            connector: Arc::new(TcpConnector),
            servers: DashMap::new(),
        }
    }
}

#[async_trait]
impl ConnectionCache for RpcConnectionCache {
    async fn chunkserver(&self, address: &ServerAddress) -> Result<Arc<dyn Chunkserver>> {
        if let Some(entry) = self.servers.get(address) {
            return Ok(Arc::clone(entry.value()));
        }
        let remote: Arc<dyn Chunkserver> = Arc::new(RemoteChunkserver::new(
            Arc::clone(&self.client),
            Arc::clone(&self.connector) as Arc<dyn Connector<TcpSocket>>,
            address.clone(),
        ));
        self.servers.insert(address.clone(), Arc::clone(&remote));
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::publish;
    use crate::service::ServiceRegistry;
    use crate::socket::Listener;
    use crate::tcp::TcpListener;
    use zircon_chunkserver::testing::test_chunkserver;
    use zircon_chunkserver::StaticConnectionCache;

    async fn publish_chunkserver(
        server: Arc<dyn Chunkserver>,
    ) -> (crate::server::ServerHandle, ServerAddress) {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(ChunkserverService::new(server)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        (publish(listener, Arc::new(registry)), addr)
    }

    fn remote(addr: &ServerAddress) -> RemoteChunkserver<TcpSocket> {
        RemoteChunkserver::new(
            Arc::new(RpcClient::new(Duration::from_secs(2))),
            Arc::new(TcpConnector) as Arc<dyn Connector<TcpSocket>>,
            addr.clone(),
        )
    }

    #[tokio::test]
    async fn test_add_then_read_over_tcp() {
        let cache = Arc::new(StaticConnectionCache::new());
        let (server, _) = test_chunkserver(&cache, ServerAddress::from("cs-0:7000"));
        let (handle, addr) = publish_chunkserver(server).await;

        let client = remote(&addr);
        client
            .add(ChunkNum(7), b"hello".to_vec(), Version(1))
            .await
            .unwrap();
        let (data, version) = client.read(ChunkNum(7), 0, 5, Version(1)).await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(version, Version(1));

        handle.teardown(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_two_phase_write_over_tcp() {
        let cache = Arc::new(StaticConnectionCache::new());
        let (server, _) = test_chunkserver(&cache, ServerAddress::from("cs-0:7000"));
        let (handle, addr) = publish_chunkserver(server).await;

        let client = remote(&addr);
        client
            .add(ChunkNum(7), b"hello".to_vec(), Version(1))
            .await
            .unwrap();
        client
            .start_write(ChunkNum(7), 1, b"A".to_vec())
            .await
            .unwrap();
        client
            .commit_write(ChunkNum(7), CommitHash::of(b"A"), Version(1), Version(2))
            .await
            .unwrap();

        let (data, version) = client.read(ChunkNum(7), 0, 5, Version(2)).await.unwrap();
        assert_eq!(data, b"hAllo");
        assert_eq!(version, Version(2));

        handle.teardown(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_read_carries_version_across_the_wire() {
        let cache = Arc::new(StaticConnectionCache::new());
        let (server, _) = test_chunkserver(&cache, ServerAddress::from("cs-0:7000"));
        let (handle, addr) = publish_chunkserver(server).await;

        let client = remote(&addr);
        client
            .add(ChunkNum(7), b"hello".to_vec(), Version(1))
            .await
            .unwrap();

        match client.read(ChunkNum(7), 0, 5, Version(2)).await {
            Err(ZirconError::StaleReplica { version }) => assert_eq!(version, Version(1)),
            other => panic!("expected StaleReplica, got {other:?}"),
        }

        handle.teardown(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_mutation_errors_become_remote_errors() {
        let cache = Arc::new(StaticConnectionCache::new());
        let (server, _) = test_chunkserver(&cache, ServerAddress::from("cs-0:7000"));
        let (handle, addr) = publish_chunkserver(server).await;

        let client = remote(&addr);
        let err = client
            .commit_write(ChunkNum(99), CommitHash::of(b"x"), Version(1), Version(2))
            .await
            .unwrap_err();
        match err {
            ZirconError::Remote(msg) => assert!(!msg.is_empty()),
            other => panic!("expected Remote, got {other:?}"),
        }

        handle.teardown(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_all_chunks_over_tcp() {
        let cache = Arc::new(StaticConnectionCache::new());
        let (server, _) = test_chunkserver(&cache, ServerAddress::from("cs-0:7000"));
        let (handle, addr) = publish_chunkserver(server).await;

        let client = remote(&addr);
        client.add(ChunkNum(1), b"a".to_vec(), Version(1)).await.unwrap();
        client.add(ChunkNum(2), b"b".to_vec(), Version(3)).await.unwrap();

        let mut chunks = client.list_all_chunks().await.unwrap();
        chunks.sort();
        assert_eq!(
            chunks,
            vec![(ChunkNum(1), Version(1)), (ChunkNum(2), Version(3))]
        );

        handle.teardown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_replicated_write_across_tcp_servers() {
        // Two chunkservers, each with its own engine, wired to each other
        // through real TCP connections.
        let rpc_cache_a = Arc::new(RpcConnectionCache::new(Duration::from_secs(2)));
        let rpc_cache_b = Arc::new(RpcConnectionCache::new(Duration::from_secs(2)));

        // Bind listeners first so the advertised replica addresses are known.
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr();
        let addr_b = listener_b.local_addr();

        let storage_a = Arc::new(zircon_chunkserver::MemoryStorage::new());
        let engine_a = Arc::new(zircon_chunkserver::ReplicaEngine::new(
            storage_a,
            zircon_chunkserver::EngineConfig::default(),
        ));
        let server_a = Arc::new(zircon_chunkserver::ChunkserverChatter::new(
            engine_a,
            rpc_cache_a,
            addr_a.clone(),
        ));

        let storage_b = Arc::new(zircon_chunkserver::MemoryStorage::new());
        let engine_b = Arc::new(zircon_chunkserver::ReplicaEngine::new(
            storage_b,
            zircon_chunkserver::EngineConfig::default(),
        ));
        let server_b = Arc::new(zircon_chunkserver::ChunkserverChatter::new(
            engine_b,
            rpc_cache_b,
            addr_b.clone(),
        ));

        let registry_a = ServiceRegistry::new();
        registry_a.register(Arc::new(ChunkserverService::new(
            Arc::clone(&server_a) as Arc<dyn Chunkserver>
        )));
        let handle_a = publish(listener_a, Arc::new(registry_a));

        let registry_b = ServiceRegistry::new();
        registry_b.register(Arc::new(ChunkserverService::new(
            Arc::clone(&server_b) as Arc<dyn Chunkserver>
        )));
        let handle_b = publish(listener_b, Arc::new(registry_b));

        // The client drives the protocol against the primary over TCP.
        let client = remote(&addr_a);
        let replicas = vec![addr_a.clone(), addr_b.clone()];
        let chunk = ChunkNum(7);

        client.add(chunk, b"hello".to_vec(), Version(1)).await.unwrap();
        remote(&addr_b)
            .add(chunk, b"hello".to_vec(), Version(1))
            .await
            .unwrap();

        client
            .start_write_replicated(chunk, 1, b"A".to_vec(), replicas)
            .await
            .unwrap();

        let hash = CommitHash::of(b"A");
        client
            .commit_write(chunk, hash.clone(), Version(1), Version(2))
            .await
            .unwrap();
        remote(&addr_b)
            .commit_write(chunk, hash, Version(1), Version(2))
            .await
            .unwrap();

        for addr in [&addr_a, &addr_b] {
            let (data, version) = remote(addr).read(chunk, 0, 5, Version(2)).await.unwrap();
            assert_eq!(data, b"hAllo");
            assert_eq!(version, Version(2));
        }

        handle_a.teardown(false).await.unwrap();
        handle_b.teardown(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_deadline_expires() {
        use crate::service::ServiceHandler;

        struct SlowService;

        #[async_trait]
        impl ServiceHandler for SlowService {
            fn service_id(&self) -> u16 {
                SERVICE_ID
            }
            fn service_name(&self) -> &str {
                "slow"
            }
            async fn handle(&self, _method_id: u16, _request: Bytes) -> Result<Bytes> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Bytes::new())
            }
        }

        let registry = ServiceRegistry::new();
        registry.register(Arc::new(SlowService));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let handle = publish(listener, Arc::new(registry));

        let client = RemoteChunkserver::new(
            Arc::new(RpcClient::new(Duration::from_millis(100))),
            Arc::new(TcpConnector) as Arc<dyn Connector<TcpSocket>>,
            addr,
        );
        let err = client
            .read(ChunkNum(1), 0, 1, Version(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ZirconError::Timeout));

        handle.teardown(true).await.unwrap();
    }
}
