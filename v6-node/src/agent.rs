//! Node agent main loop, grounded on the teacher's `tokio::select!`-driven
//! boot/run structure: boot once, then loop over socket events and a
//! bounded work queue with a capped worker pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use v6_crypto::Cryptor;
use v6_runtime::docker::DockerRuntime;
use v6_runtime::ContainerRuntime;
use v6_types::entities::{CollaborationId, NodeId, OrganizationId, RunId, TaskId};
use v6_types::DispatchEvent;

use crate::client::CoordinatorClient;
use crate::config::NodeConfig;
use crate::worker::{self, DatabaseCatalog, RunExecution};

pub struct Agent {
    config: NodeConfig,
    client: CoordinatorClient,
    cryptor: Arc<Cryptor>,
    runtime: Arc<dyn ContainerRuntime>,
    node_id: NodeId,
    organization_id: OrganizationId,
    collaboration_id: CollaborationId,
    /// Label -> local connection URI, taken from this node's own config
    /// record (set by an operator, not the coordinator).
    sources: BTreeMap<String, String>,
    org_pubkeys: Mutex<BTreeMap<OrganizationId, String>>,
    cancels: Mutex<HashMap<RunId, watch::Sender<bool>>>,
    run_task_ids: Mutex<HashMap<RunId, TaskId>>,
    semaphore: Arc<Semaphore>,
}

impl Agent {
    /// Boot sequence: load/generate this node's key, authenticate, fetch
    /// our own node/organization records, and reconcile the public key the
    /// coordinator has on file for us. Returns the agent plus the access
    /// token the caller should open the `/tasks` socket with.
    pub async fn boot(config: NodeConfig) -> anyhow::Result<(Arc<Self>, String)> {
        let cryptor = Arc::new(Cryptor::load_or_generate(&config.private_key_file)?);
        let client = CoordinatorClient::new(config.coordinator_url.clone());

        let auth = client.authenticate(&config.api_key).await?;
        let access_token = auth.access_token;

        let node = client.get_node(&access_token, auth.node_id).await?;
        let organization = client
            .get_organization(&access_token, auth.organization_id)
            .await?;
        if !cryptor.verify_public_key(&organization.public_key).unwrap_or(false) {
            let our_key = cryptor.public_key_str()?;
            log::info!("registering this node's public key with the coordinator");
            client
                .set_organization_public_key(&access_token, auth.organization_id, &our_key)
                .await?;
        }

        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
        let max_concurrent = config.max_concurrent_tasks.max(1);

        let agent = Arc::new(Agent {
            config,
            client,
            cryptor,
            runtime,
            node_id: auth.node_id,
            organization_id: auth.organization_id,
            collaboration_id: auth.collaboration_id,
            sources: node.config,
            org_pubkeys: Mutex::new(BTreeMap::new()),
            cancels: Mutex::new(HashMap::new()),
            run_task_ids: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        });

        Ok((agent, access_token))
    }

    /// Connects the `/tasks` websocket, resyncs any already-pending runs,
    /// then loops forever dispatching socket events into the work queue and
    /// draining the queue through a `max_concurrent_tasks`-wide pool.
    pub async fn run(self: Arc<Self>, access_token: String) -> anyhow::Result<()> {
        let (task_tx, mut task_rx) = mpsc::channel::<TaskId>(self.config.task_queue_capacity);

        self.resync_pending_runs(&access_token, &task_tx).await;

        let ws_url = format!(
            "{}/tasks?collaboration_id={}",
            self.config.coordinator_url.replacen("http", "ws", 1),
            self.collaboration_id
        );
        let (socket, _) = tokio_tungstenite::connect_async(&ws_url).await?;
        let (mut ws_tx, mut ws_rx) = socket.split();
        let _ = ws_tx.send(WsMessage::Text("hello".to_string())).await;

        loop {
            tokio::select! {
                Some(msg) = ws_rx.next() => {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            self.handle_socket_text(&text, &task_tx).await;
                        }
                        Ok(WsMessage::Close(_)) => {
                            log::warn!("coordinator closed the /tasks socket");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::error!("socket error: {e}");
                            return Err(e.into());
                        }
                    }
                }
                Some(task_id) = task_rx.recv() => {
                    let agent = self.clone();
                    let token = access_token.clone();
                    let permit = agent.semaphore.clone().acquire_owned().await.unwrap();
                    tokio::spawn(async move {
                        let _permit = permit;
                        agent.execute_task(&token, task_id).await;
                    });
                }
                else => return Ok(()),
            }
        }
    }

    async fn handle_socket_text(&self, text: &str, task_tx: &mpsc::Sender<TaskId>) {
        let event: DispatchEvent = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(_) => return, // non-event frames (the initial "hello", pings) are ignored
        };
        match event {
            DispatchEvent::NewTask { task_id } => {
                let _ = task_tx.send(task_id).await;
            }
            DispatchEvent::KillContainers { task_id, node_id, .. } => {
                if node_id.is_some() && node_id != Some(self.node_id) {
                    return;
                }
                self.cancel_matching(task_id).await;
            }
            DispatchEvent::ExpiredToken => {
                log::warn!("coordinator reports our token expired; re-authentication is required");
            }
            DispatchEvent::AlgorithmStatusChange { .. }
            | DispatchEvent::NodeStatusChanged { .. }
            | DispatchEvent::Message { .. } => {}
        }
    }

    async fn cancel_matching(&self, task_id: Option<TaskId>) {
        let run_task_ids = self.run_task_ids.lock().await;
        let cancels = self.cancels.lock().await;
        for (run_id, sender) in cancels.iter() {
            let matches = match task_id {
                Some(t) => run_task_ids.get(run_id) == Some(&t),
                None => true,
            };
            if matches {
                let _ = sender.send(true);
            }
        }
    }

    async fn resync_pending_runs(&self, token: &str, task_tx: &mpsc::Sender<TaskId>) {
        match self.client.runs_for_node(token, self.node_id).await {
            Ok(runs) => {
                let mut queued = HashSet::new();
                for run in runs {
                    if run.status.is_alive() && queued.insert(run.task_id) {
                        let _ = task_tx.send(run.task_id).await;
                    }
                }
            }
            Err(e) => log::error!("failed to resync pending runs: {e}"),
        }
    }

    async fn peer_pubkey(&self, org_id: OrganizationId, token: &str) -> Option<String> {
        if let Some(key) = self.org_pubkeys.lock().await.get(&org_id) {
            return Some(key.clone());
        }
        let org = self.client.get_organization(token, org_id).await.ok()?;
        self.org_pubkeys
            .lock()
            .await
            .insert(org_id, org.public_key.clone());
        Some(org.public_key)
    }

    async fn execute_task(&self, token: &str, task_id: TaskId) {
        let task = match self.client.get_task(token, task_id).await {
            Ok(t) => t,
            Err(e) => {
                log::error!("failed to fetch task {task_id}: {e}");
                return;
            }
        };

        let runs = match self.client.runs_for_node(token, self.node_id).await {
            Ok(runs) => runs
                .into_iter()
                .filter(|r| r.task_id == task_id && r.status.is_alive())
                .collect::<Vec<_>>(),
            Err(e) => {
                log::error!("failed to list runs for task {task_id}: {e}");
                return;
            }
        };

        let output_dataframe_handle = if task.action.is_session_modifying() {
            Some(format!("df{}", task.dataframe_id.unwrap_or_default()))
        } else {
            None
        };

        for run in runs {
            let run_id = run.id;
            let (tx, rx) = watch::channel(false);
            self.cancels.lock().await.insert(run_id, tx);
            self.run_task_ids.lock().await.insert(run_id, task_id);

            let recipient_pubkey = match self.peer_pubkey(task.init_org_id, token).await {
                Some(k) => k,
                None => {
                    log::error!("no public key on file for organization {}; skipping run {run_id}", task.init_org_id);
                    self.cancels.lock().await.remove(&run_id);
                    self.run_task_ids.lock().await.remove(&run_id);
                    continue;
                }
            };

            let execution = RunExecution {
                run,
                node_id: self.node_id,
                image: task.image.clone(),
                action: task.action,
                session_id: task.session_id,
                databases: task.databases.clone(),
                result_recipient_pubkey: recipient_pubkey,
                init_org_id: task.init_org_id,
                init_user_id: task.init_user_id,
                output_dataframe_handle: output_dataframe_handle.clone(),
            };

            let catalog = DatabaseCatalog { sources: self.sources.clone() };
            let status = worker::execute_run(
                &self.config,
                &self.client,
                token,
                &self.cryptor,
                &catalog,
                &self.runtime,
                execution,
                rx,
            )
            .await;
            log::info!("run {run_id} finished with status {status:?}");

            self.cancels.lock().await.remove(&run_id);
            self.run_task_ids.lock().await.remove(&run_id);
        }
    }
}
