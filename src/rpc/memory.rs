//! In-process transport. Replicas register their `RpcHandler` under their id;
//! links can be cut per replica or per pair to simulate crashes and partitions.

use crate::error::{Error, Result};
use crate::rpc::{AppendRequest, AppendResponse, RpcHandler, Transport, VoteRequest, VoteResponse};
use crate::types::ReplicaId;
use async_lock::RwLock;
use async_trait::async_trait;
use log::trace;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct Routes {
    handlers: HashMap<ReplicaId, Arc<dyn RpcHandler>>,
    isolated: HashSet<ReplicaId>,
    severed: HashSet<(ReplicaId, ReplicaId)>,
}

impl Routes {
    fn connected(&self, from: &str, to: &str) -> bool {
        !self.isolated.contains(from)
            && !self.isolated.contains(to)
            && !self.severed.contains(&(from.to_string(), to.to_string()))
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<RwLock<Routes>>,
}

impl MemoryNetwork {
    pub fn new() -> MemoryNetwork {
        MemoryNetwork::default()
    }

    pub async fn register(&self, id: &str, handler: Arc<dyn RpcHandler>) {
        self.routes
            .write()
            .await
            .handlers
            .insert(id.to_string(), handler);
    }

    /// Cuts every link to and from `id`.
    pub async fn isolate(&self, id: &str) {
        self.routes.write().await.isolated.insert(id.to_string());
    }

    pub async fn reconnect(&self, id: &str) {
        self.routes.write().await.isolated.remove(id);
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub async fn sever(&self, a: &str, b: &str) {
        let mut routes = self.routes.write().await;
        routes.severed.insert((a.to_string(), b.to_string()));
        routes.severed.insert((b.to_string(), a.to_string()));
    }

    pub async fn heal(&self) {
        let mut routes = self.routes.write().await;
        routes.isolated.clear();
        routes.severed.clear();
    }

    /// Outbound transport for replica `from`.
    pub fn transport(&self, from: &str) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            from: from.to_string(),
            network: self.clone(),
        })
    }

    async fn route(&self, from: &str, to: &str) -> Result<Arc<dyn RpcHandler>> {
        let routes = self.routes.read().await;
        if !routes.connected(from, to) {
            return Err(Error::Unreachable(to.to_string()));
        }
        routes
            .handlers
            .get(to)
            .cloned()
            .ok_or_else(|| Error::Unreachable(to.to_string()))
    }

    async fn still_connected(&self, from: &str, to: &str) -> Result<()> {
        if self.routes.read().await.connected(from, to) {
            Ok(())
        } else {
            trace!("Dropping response from {} to {}", to, from);
            Err(Error::Unreachable(to.to_string()))
        }
    }
}

struct MemoryTransport {
    from: ReplicaId,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn append_entries(&self, target: &str, request: AppendRequest) -> Result<AppendResponse> {
        let handler = self.network.route(&self.from, target).await?;
        let response = handler.append_entries(request).await?;
        self.network.still_connected(&self.from, target).await?;
        Ok(response)
    }

    async fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse> {
        let handler = self.network.route(&self.from, target).await?;
        let response = handler.request_vote(request).await?;
        self.network.still_connected(&self.from, target).await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryNetwork;
    use crate::error::{Error, Result};
    use crate::rpc::{AppendRequest, AppendResponse, RpcHandler, VoteRequest, VoteResponse};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Grants;

    #[async_trait]
    impl RpcHandler for Grants {
        async fn append_entries(&self, request: AppendRequest) -> Result<AppendResponse> {
            Ok(AppendResponse::success(request.term, request.last_index()))
        }

        async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
            Ok(VoteResponse::granted(request.term))
        }
    }

    fn vote(term: u64) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: "a".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[tokio::test]
    async fn routes_and_partitions() {
        let network = MemoryNetwork::new();
        network.register("b", Arc::new(Grants)).await;
        network.register("c", Arc::new(Grants)).await;
        let a = network.transport("a");

        assert!(a.request_vote("b", vote(1)).await.unwrap().granted);
        assert!(matches!(
            a.request_vote("missing", vote(1)).await,
            Err(Error::Unreachable(_))
        ));

        network.isolate("b").await;
        assert!(a.request_vote("b", vote(1)).await.is_err());
        assert!(a.request_vote("c", vote(1)).await.is_ok());

        network.sever("a", "c").await;
        assert!(a.request_vote("c", vote(1)).await.is_err());
        assert!(network
            .transport("b")
            .request_vote("c", vote(1))
            .await
            .is_err());

        network.heal().await;
        assert!(a.request_vote("b", vote(1)).await.is_ok());
        assert!(a.request_vote("c", vote(1)).await.is_ok());
    }
}
