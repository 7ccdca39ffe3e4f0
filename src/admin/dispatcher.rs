//! The collection admin dispatcher.
//!
//! Accepts create/delete/reload/sync-shard commands. The first three are
//! composed into `{operation, ...}` records and enqueued on the overseer
//! queue with a bounded wait for the coordinator's response; sync-shard is
//! resolved against the cluster state and sent straight to the shard leader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{FalxError, Result};

/// Queue operation key in enqueued records.
pub const QUEUE_OPERATION: &str = "operation";

/// Operation names understood by the coordinator.
pub const CREATE_COLLECTION: &str = "createcollection";
pub const DELETE_COLLECTION: &str = "deletecollection";
pub const RELOAD_COLLECTION: &str = "reloadcollection";

/// Admin actions accepted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Create,
    Delete,
    Reload,
    SyncShard,
}

impl AdminAction {
    /// Parse the `action` request parameter.
    pub fn from_param(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "create" => Ok(AdminAction::Create),
            "delete" => Ok(AdminAction::Delete),
            "reload" => Ok(AdminAction::Reload),
            "syncshard" => Ok(AdminAction::SyncShard),
            other => Err(FalxError::bad_request(format!("unknown action: {other}"))),
        }
    }
}

/// What came back from an `offer` on the coordinator queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The coordinator processed the record and responded.
    Response(Value),

    /// A watch fired without a response payload.
    WatchFired {
        /// Human-readable watch details, carried into the error message.
        details: String,
    },

    /// The wait timed out.
    Timeout,
}

/// The coordinator's distributed work queue.
pub trait OverseerQueue: Send + Sync + std::fmt::Debug {
    /// Enqueue a record and wait up to `timeout` for the coordinator's
    /// response event.
    fn offer(&self, record: Value, timeout: Duration) -> Result<QueueEvent>;
}

/// Read-only oracle over the cluster topology.
pub trait ClusterState: Send + Sync + std::fmt::Debug {
    /// Resolve the current leader of a shard.
    fn shard_leader(&self, collection: &str, shard: &str) -> Result<NodeRef>;
}

/// Location of one node hosting a shard replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    /// Base URL of the node.
    pub base_url: String,

    /// Name of the hosted core.
    pub core_name: String,
}

/// Synchronous RPC channel to another node.
pub trait ShardRpc: Send + Sync + std::fmt::Debug {
    /// Ask a shard leader to sync its replicas.
    fn request_sync(&self, leader: &NodeRef, collection: &str, shard: &str) -> Result<Value>;
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// How long to wait for the coordinator to answer an enqueued
    /// operation.
    pub queue_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            queue_timeout: Duration::from_secs(60),
        }
    }
}

/// Validates admin commands and routes them to the coordinator.
#[derive(Debug)]
pub struct AdminDispatcher {
    queue: Arc<dyn OverseerQueue>,
    cluster_state: Arc<dyn ClusterState>,
    shard_rpc: Arc<dyn ShardRpc>,
    config: DispatcherConfig,
}

impl AdminDispatcher {
    /// Create a dispatcher over the given collaborators.
    pub fn new(
        queue: Arc<dyn OverseerQueue>,
        cluster_state: Arc<dyn ClusterState>,
        shard_rpc: Arc<dyn ShardRpc>,
        config: DispatcherConfig,
    ) -> Self {
        AdminDispatcher {
            queue,
            cluster_state,
            shard_rpc,
            config,
        }
    }

    /// Handle one admin request.
    pub fn handle(&self, action: AdminAction, params: &HashMap<String, String>) -> Result<Value> {
        match action {
            AdminAction::Create => self.handle_create(params),
            AdminAction::Delete => self.handle_delete(params),
            AdminAction::Reload => self.handle_reload(params),
            AdminAction::SyncShard => self.handle_sync_shard(params),
        }
    }

    fn handle_create(&self, params: &HashMap<String, String>) -> Result<Value> {
        info!("creating collection: {params:?}");
        let name = required_param(params, "name")?;

        let mut record = json!({
            QUEUE_OPERATION: CREATE_COLLECTION,
            "name": name,
            "replicationFactor": params
                .get("replicationFactor")
                .cloned()
                .unwrap_or_else(|| "1".to_string()),
        });
        for optional in ["numShards", "maxShardsPerNode", "createNodeSet"] {
            if let Some(value) = params.get(optional) {
                record[optional] = Value::String(value.clone());
            }
        }

        self.enqueue(CREATE_COLLECTION, record)
    }

    fn handle_delete(&self, params: &HashMap<String, String>) -> Result<Value> {
        info!("deleting collection: {params:?}");
        let name = required_param(params, "name")?;
        let record = json!({ QUEUE_OPERATION: DELETE_COLLECTION, "name": name });
        self.enqueue(DELETE_COLLECTION, record)
    }

    fn handle_reload(&self, params: &HashMap<String, String>) -> Result<Value> {
        info!("reloading collection: {params:?}");
        let name = required_param(params, "name")?;
        let record = json!({ QUEUE_OPERATION: RELOAD_COLLECTION, "name": name });
        self.enqueue(RELOAD_COLLECTION, record)
    }

    fn handle_sync_shard(&self, params: &HashMap<String, String>) -> Result<Value> {
        info!("syncing shard: {params:?}");
        let collection = required_param(params, "collection")?;
        let shard = required_param(params, "shard")?;

        let leader = self.cluster_state.shard_leader(collection, shard)?;
        self.shard_rpc.request_sync(&leader, collection, shard)
    }

    fn enqueue(&self, operation: &str, record: Value) -> Result<Value> {
        match self.queue.offer(record, self.config.queue_timeout)? {
            QueueEvent::Response(response) => Ok(response),
            QueueEvent::Timeout => Err(FalxError::server(format!(
                "{operation} timed out after {}s",
                self.config.queue_timeout.as_secs()
            ))),
            QueueEvent::WatchFired { details } => Err(FalxError::server(format!(
                "{operation} failed [watcher fired: {details}]"
            ))),
        }
    }
}

fn required_param<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FalxError::bad_request(format!("missing required parameter: {name}")))
}

/// An in-process overseer queue over a channel pair.
///
/// The test double for the coordinator: records go out on one channel and
/// the caller blocks on the other for the matching event.
#[derive(Debug)]
pub struct ChannelQueue {
    records: Sender<Value>,
    events: Receiver<QueueEvent>,
}

impl ChannelQueue {
    /// Create a queue; the returned handles drive the coordinator side.
    pub fn new() -> (Self, Receiver<Value>, Sender<QueueEvent>) {
        let (record_tx, record_rx) = bounded(16);
        let (event_tx, event_rx) = bounded(16);
        (
            ChannelQueue {
                records: record_tx,
                events: event_rx,
            },
            record_rx,
            event_tx,
        )
    }
}

impl OverseerQueue for ChannelQueue {
    fn offer(&self, record: Value, timeout: Duration) -> Result<QueueEvent> {
        let deadline = Instant::now() + timeout;
        self.records
            .send(record)
            .map_err(|e| FalxError::server(format!("coordinator queue closed: {e}")))?;

        match self.events.recv_deadline(deadline) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Ok(QueueEvent::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(FalxError::server("coordinator queue closed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug)]
    struct StaticClusterState {
        leader: NodeRef,
    }

    impl ClusterState for StaticClusterState {
        fn shard_leader(&self, _collection: &str, _shard: &str) -> Result<NodeRef> {
            Ok(self.leader.clone())
        }
    }

    #[derive(Debug)]
    struct RecordingRpc;

    impl ShardRpc for RecordingRpc {
        fn request_sync(&self, leader: &NodeRef, collection: &str, shard: &str) -> Result<Value> {
            Ok(json!({
                "synced": format!("{}/{}", collection, shard),
                "leader": leader.base_url,
            }))
        }
    }

    fn dispatcher(
        timeout: Duration,
    ) -> (AdminDispatcher, Receiver<Value>, Sender<QueueEvent>) {
        let (queue, records, events) = ChannelQueue::new();
        let dispatcher = AdminDispatcher::new(
            Arc::new(queue),
            Arc::new(StaticClusterState {
                leader: NodeRef {
                    base_url: "http://node1:8983".to_string(),
                    core_name: "core_a".to_string(),
                },
            }),
            Arc::new(RecordingRpc),
            DispatcherConfig {
                queue_timeout: timeout,
            },
        );
        (dispatcher, records, events)
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!(AdminAction::from_param("CREATE").unwrap(), AdminAction::Create);
        assert_eq!(
            AdminAction::from_param("syncshard").unwrap(),
            AdminAction::SyncShard
        );
        assert!(matches!(
            AdminAction::from_param("optimize"),
            Err(FalxError::BadRequest(_))
        ));
    }

    #[test]
    fn test_missing_param_is_bad_request() {
        let (dispatcher, _records, _events) = dispatcher(Duration::from_secs(1));

        for action in [AdminAction::Create, AdminAction::Delete, AdminAction::Reload] {
            match dispatcher.handle(action, &HashMap::new()) {
                Err(FalxError::BadRequest(msg)) => assert!(msg.contains("name")),
                other => panic!("expected BadRequest, got {other:?}"),
            }
        }

        match dispatcher.handle(AdminAction::SyncShard, &params(&[("collection", "c1")])) {
            Err(FalxError::BadRequest(msg)) => assert!(msg.contains("shard")),
            other => panic!("expected BadRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_create_enqueues_and_returns_response() {
        let (dispatcher, records, events) = dispatcher(Duration::from_secs(5));

        let coordinator = thread::spawn(move || {
            let record = records.recv().unwrap();
            assert_eq!(record[QUEUE_OPERATION], CREATE_COLLECTION);
            assert_eq!(record["name"], "products");
            assert_eq!(record["numShards"], "4");
            assert_eq!(record["replicationFactor"], "2");
            events
                .send(QueueEvent::Response(json!({"success": true})))
                .unwrap();
        });

        let response = dispatcher
            .handle(
                AdminAction::Create,
                &params(&[
                    ("name", "products"),
                    ("numShards", "4"),
                    ("replicationFactor", "2"),
                ]),
            )
            .unwrap();
        assert_eq!(response["success"], true);
        coordinator.join().unwrap();
    }

    #[test]
    fn test_timeout_is_server_error() {
        let (dispatcher, _records, _events) = dispatcher(Duration::from_millis(20));

        match dispatcher.handle(AdminAction::Delete, &params(&[("name", "stale")])) {
            Err(FalxError::ServerError(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_watch_without_response_is_server_error() {
        let (dispatcher, records, events) = dispatcher(Duration::from_secs(5));

        let coordinator = thread::spawn(move || {
            let _ = records.recv().unwrap();
            events
                .send(QueueEvent::WatchFired {
                    details: "node deleted".to_string(),
                })
                .unwrap();
        });

        match dispatcher.handle(AdminAction::Reload, &params(&[("name", "c1")])) {
            Err(FalxError::ServerError(msg)) => assert!(msg.contains("node deleted")),
            other => panic!("expected ServerError, got {other:?}"),
        }
        coordinator.join().unwrap();
    }

    #[test]
    fn test_sync_shard_routes_to_leader() {
        let (dispatcher, _records, _events) = dispatcher(Duration::from_secs(1));

        let response = dispatcher
            .handle(
                AdminAction::SyncShard,
                &params(&[("collection", "orders"), ("shard", "shard1")]),
            )
            .unwrap();

        assert_eq!(response["synced"], "orders/shard1");
        assert_eq!(response["leader"], "http://node1:8983");
    }
}
