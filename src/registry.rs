//! Process-wide lookup tables for pipelines and services.
//!
//! Both registries are plain constructible structs — build one per process,
//! or one per test. [`Client`] keys pipelines on the full
//! `(peer_type, peer_no)` tuple; [`Server`] keys services on their mark.
//! Adding under an occupied key evicts and stops the previous occupant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Result, RpcError};
use crate::net::Net;
use crate::pipeline::Pipeline;
use crate::proto::Proto;
use crate::service::Service;

/// Registry of caller-side pipelines keyed by remote peer identity.
pub struct Client {
    pipelines: Mutex<HashMap<(u32, u32), Arc<Pipeline>>>,
}

impl Client {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Build a pipeline over `net`, register it under the peer identity,
    /// and spawn its read loop. A previous occupant is stopped first.
    pub fn add_pipeline(
        &self,
        net: Arc<dyn Net>,
        peer_type: u32,
        peer_no: u32,
        mark: &str,
        timeout_sec: u32,
    ) -> Arc<Pipeline> {
        let pipeline = Arc::new(Pipeline::new(net, peer_type, peer_no, mark));
        pipeline.set_timeout(timeout_sec);

        let old = self
            .lock()
            .insert((peer_type, peer_no), pipeline.clone());
        if let Some(old) = old {
            tracing::debug!(
                peer = crate::util::peer_id(peer_type, peer_no),
                "evicting previous pipeline"
            );
            old.stop();
        }

        pipeline.start();
        pipeline
    }

    /// Look up the pipeline attached to a peer.
    pub fn pipeline(&self, peer_type: u32, peer_no: u32) -> Option<Arc<Pipeline>> {
        self.lock().get(&(peer_type, peer_no)).cloned()
    }

    /// Remove and stop the pipeline attached to a peer, if any.
    pub fn remove_pipeline(&self, peer_type: u32, peer_no: u32) {
        if let Some(pipeline) = self.lock().remove(&(peer_type, peer_no)) {
            pipeline.stop();
        }
    }

    /// Stop every pipeline and clear the table.
    pub fn remove_all_pipelines(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, p)| p).collect();
        for pipeline in drained {
            pipeline.stop();
        }
    }

    /// Typed call through the registered pipeline.
    pub async fn call(
        &self,
        peer_type: u32,
        peer_no: u32,
        func_name: &str,
        req_obj: &dyn Proto,
        resp_obj: Option<&mut dyn Proto>,
    ) -> Result<i32> {
        let pipeline = self
            .pipeline(peer_type, peer_no)
            .ok_or(RpcError::ServiceNotExist)?;
        pipeline.call(func_name, req_obj, resp_obj).await
    }

    /// One-way notification through the registered pipeline.
    pub async fn call_no_return(
        &self,
        peer_type: u32,
        peer_no: u32,
        func_name: &str,
        req_obj: &dyn Proto,
    ) -> Result<()> {
        let pipeline = self
            .pipeline(peer_type, peer_no)
            .ok_or(RpcError::ServiceNotExist)?;
        pipeline.call_no_return(func_name, req_obj).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(u32, u32), Arc<Pipeline>>> {
        self.pipelines.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of callee-side services keyed by mark.
pub struct Server {
    services: Mutex<HashMap<String, Arc<dyn Service>>>,
}

impl Server {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fully built service under its name and spawn its read
    /// loop. A previous occupant under the same name is stopped first.
    pub fn add_service(&self, service: Arc<dyn Service>) {
        let name = service.name();

        let old = self.lock().insert(name.clone(), service.clone());
        if let Some(old) = old {
            tracing::debug!(name = %name, "evicting previous service");
            old.stop();
        }

        service.start();
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.lock().get(name).cloned()
    }

    /// Remove and stop a service, if registered.
    pub fn remove_service(&self, name: &str) {
        if let Some(service) = self.lock().remove(name) {
            service.stop();
        }
    }

    /// Stop every service and clear the table.
    pub fn remove_all_services(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, s)| s).collect();
        for service in drained {
            service.stop();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Service>>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::LoopbackNet;
    use crate::service::BaseService;

    fn loopback() -> (Arc<LoopbackNet>, Arc<LoopbackNet>) {
        LoopbackNet::pair(8, (2, 1), (1, 1))
    }

    #[tokio::test]
    async fn test_add_pipeline_evicts_and_stops_previous() {
        let client = Client::new();

        let (net1, _peer1) = loopback();
        let first = client.add_pipeline(net1, 1, 1, "game", 0);

        let (net2, _peer2) = loopback();
        let second = client.add_pipeline(net2, 1, 1, "game", 0);

        // The evicted pipeline's transport is closed.
        assert!(matches!(
            first.call_by_func_no(2, &[]).await,
            Err(RpcError::NetClosed)
        ));

        let found = client.pipeline(1, 1).unwrap();
        assert!(Arc::ptr_eq(&found, &second));
    }

    #[tokio::test]
    async fn test_remove_all_pipelines_stops_everything() {
        let client = Client::new();

        let (net1, _p1) = loopback();
        let a = client.add_pipeline(net1, 1, 1, "game", 0);
        let (net2, _p2) = loopback();
        let b = client.add_pipeline(net2, 1, 2, "chat", 0);

        client.remove_all_pipelines();

        assert!(client.pipeline(1, 1).is_none());
        assert!(client.pipeline(1, 2).is_none());
        assert!(matches!(
            a.call_by_func_no(2, &[]).await,
            Err(RpcError::NetClosed)
        ));
        assert!(matches!(
            b.call_by_func_no(2, &[]).await,
            Err(RpcError::NetClosed)
        ));
    }

    #[tokio::test]
    async fn test_distinct_peer_tuples_do_not_collide() {
        let client = Client::new();

        // Legacy 16-bit packing would alias these two identities.
        let (net1, _p1) = loopback();
        client.add_pipeline(net1, 1, 0x0001_0000, "game", 0);
        let (net2, _p2) = loopback();
        client.add_pipeline(net2, 2, 0, "chat", 0);

        assert_eq!(client.pipeline(1, 0x0001_0000).unwrap().service(), "game");
        assert_eq!(client.pipeline(2, 0).unwrap().service(), "chat");
    }

    #[tokio::test]
    async fn test_client_call_without_pipeline_fails() {
        let client = Client::new();
        let result = client
            .call_no_return(9, 9, "echo", &String::new())
            .await;
        assert!(matches!(result, Err(RpcError::ServiceNotExist)));
    }

    #[tokio::test]
    async fn test_server_add_get_remove() {
        let server = Server::new();

        let (_cli, srv_net) = loopback();
        let service = Arc::new(BaseService::new(srv_net));
        service.set_name("game");
        server.add_service(service);

        assert!(server.service("game").is_some());
        assert!(server.service("chat").is_none());

        server.remove_service("game");
        assert!(server.service("game").is_none());
    }
}
