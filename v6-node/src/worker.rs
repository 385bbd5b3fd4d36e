use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use v6_crypto::Cryptor;
use v6_runtime::{ContainerRuntime, JobSpec, Mount};
use v6_session::SessionFileManager;
use v6_types::entities::{DbRef, DbRefKind, NodeId, OrganizationId, Run, TaskAction, UserId};
use v6_types::status::RunStatus;

use crate::client::CoordinatorClient;
use crate::config::NodeConfig;
use crate::proxy::{build_proxy_routes, ProxyState};

pub struct DatabaseCatalog {
    /// label -> local file/connection URI for non-dataframe ("source") args.
    pub sources: BTreeMap<String, String>,
}

/// Fires the embedded proxy's graceful shutdown when dropped, so every
/// return path out of `execute_run` tears the proxy server down, not just
/// the success path.
struct ProxyShutdownGuard(Option<tokio::sync::oneshot::Sender<()>>);

impl Drop for ProxyShutdownGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug)]
pub enum ResolveError {
    NotAllowed(String),
    DataframeNotFound(String),
}

impl From<ResolveError> for RunStatus {
    fn from(value: ResolveError) -> Self {
        match value {
            ResolveError::NotAllowed(_) => RunStatus::NotAllowed,
            ResolveError::DataframeNotFound(_) => RunStatus::DataframeNotFound,
        }
    }
}

/// Resolves a task's `databases` argument slots into a single
/// `USER_REQUESTED_DATAFRAMES`-shaped env string and a set of bind mounts,
/// per §4.4 step 3: `source` refs map to local-config URIs, `dataframe`
/// refs map to `sessions/.../<handle>.parquet`.
pub fn resolve_databases(
    data_root: &std::path::Path,
    session_id: u64,
    catalog: &DatabaseCatalog,
    slots: &[Vec<DbRef>],
) -> Result<(Vec<(String, String)>, Vec<Mount>), ResolveError> {
    let mut env = Vec::new();
    let mut mounts = Vec::new();
    let mut slot_strings = Vec::new();

    for slot in slots {
        let mut handles = Vec::new();
        for db_ref in slot {
            match db_ref.kind {
                DbRefKind::Source => {
                    let label = db_ref
                        .label
                        .clone()
                        .ok_or_else(|| ResolveError::NotAllowed("missing source label".to_string()))?;
                    let uri = catalog
                        .sources
                        .get(&label)
                        .ok_or_else(|| ResolveError::NotAllowed(format!("unknown database label {label}")))?;
                    env.push((format!("{label}_DATABASE_URI"), uri.clone()));
                    handles.push(label);
                }
                DbRefKind::Dataframe => {
                    let handle = format!("df{}", db_ref.dataframe_id.unwrap_or_default());
                    let path = data_root
                        .join("sessions")
                        .join(format!("session{session_id:09}"))
                        .join(format!("{handle}.parquet"));
                    if !path.exists() {
                        return Err(ResolveError::DataframeNotFound(handle));
                    }
                    mounts.push(Mount {
                        host_path: path,
                        container_path: format!("/app/dataframes/{handle}.parquet"),
                        read_only: true,
                    });
                    handles.push(handle);
                }
            }
        }
        slot_strings.push(handles.join(","));
    }

    env.push((
        "USER_REQUESTED_DATAFRAMES".to_string(),
        slot_strings.join(";"),
    ));
    Ok((env, mounts))
}

pub struct RunExecution {
    pub run: Run,
    pub node_id: NodeId,
    pub image: String,
    pub action: TaskAction,
    pub session_id: u64,
    pub databases: Vec<Vec<DbRef>>,
    pub result_recipient_pubkey: String,
    pub init_org_id: OrganizationId,
    pub init_user_id: UserId,
    /// Handle to write the produced dataframe under, for
    /// data-extraction/preprocessing runs; `None` for compute actions.
    pub output_dataframe_handle: Option<String>,
}

/// Drives one run end to end: §4.4's per-run execution contract. Returns
/// the terminal status so the caller can log/propagate it; the coordinator
/// has already been updated by the time this returns.
pub async fn execute_run(
    config: &NodeConfig,
    client: &CoordinatorClient,
    token: &str,
    cryptor: &Arc<Cryptor>,
    catalog: &DatabaseCatalog,
    runtime: &Arc<dyn ContainerRuntime>,
    execution: RunExecution,
    mut cancel: tokio::sync::watch::Receiver<bool>,
) -> RunStatus {
    let run_id = execution.run.id;

    if !config.image_is_allowed(&execution.image) {
        let _ = client
            .patch_run_result(token, run_id, RunStatus::NotAllowed, "image not on allowlist".to_string(), String::new(), false)
            .await;
        return RunStatus::NotAllowed;
    }

    let container_token = match client
        .request_container_token(token, execution.node_id, execution.run.task_id, &execution.image)
        .await
    {
        Ok(t) => t,
        Err(_) => String::new(), // only central_compute tasks get one; absence is fine.
    };

    let plaintext_input = match cryptor.decrypt(&execution.run.input) {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = client
                .patch_run_result(token, run_id, RunStatus::Crashed, format!("decrypt failed: {e}"), String::new(), false)
                .await;
            return RunStatus::Crashed;
        }
    };

    let (db_env, mut mounts) = match resolve_databases(&config.data_root, execution.session_id, catalog, &execution.databases) {
        Ok(pair) => pair,
        Err(e) => {
            let status: RunStatus = e.into();
            let _ = client.patch_run_status(token, run_id, status).await;
            return status;
        }
    };

    let scratch_dir = config.data_root.join("tasks").join(format!("task-{run_id:09}"));
    if let Err(e) = std::fs::create_dir_all(&scratch_dir) {
        log::error!("failed to create scratch dir for run {run_id}: {e}");
        let _ = client.patch_run_status(token, run_id, RunStatus::StartFailed).await;
        return RunStatus::StartFailed;
    }
    write_scratch_file(&scratch_dir, "input.txt", &plaintext_input);
    write_scratch_file(&scratch_dir, "output.txt", b"");
    write_scratch_file(&scratch_dir, "token.txt", container_token.as_bytes());

    mounts.push(Mount {
        host_path: scratch_dir.join("input.txt"),
        container_path: "/app/input.txt".to_string(),
        read_only: true,
    });
    mounts.push(Mount {
        host_path: scratch_dir.join("output.txt"),
        container_path: "/app/output.txt".to_string(),
        read_only: false,
    });
    mounts.push(Mount {
        host_path: scratch_dir.join("token.txt"),
        container_path: "/app/token.txt".to_string(),
        read_only: true,
    });
    if execution.output_dataframe_handle.is_some() {
        mounts.push(Mount {
            host_path: scratch_dir.join("output_dataframe.parquet"),
            container_path: "/app/output_dataframe.parquet".to_string(),
            read_only: false,
        });
    }

    let _ = client.patch_run_started(token, run_id).await;
    let _ = client.patch_run_status(token, run_id, RunStatus::Active).await;

    let proxy_state = ProxyState {
        coordinator: client.clone(),
        node_token: token.to_string(),
        container_token: container_token.clone(),
        cryptor: cryptor.clone(),
        init_org_id: execution.init_org_id,
        init_user_id: execution.init_user_id,
    };
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind local proxy for run {run_id}: {e}");
            let _ = client.patch_run_status(token, run_id, RunStatus::StartFailed).await;
            return RunStatus::StartFailed;
        }
    };
    let proxy_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let proxy_app = build_proxy_routes(proxy_state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, proxy_app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    // Shuts the proxy down on every return path below, regardless of which one is taken.
    let _proxy_guard = ProxyShutdownGuard(Some(shutdown_tx));

    let host = config
        .host_uri_override
        .clone()
        .unwrap_or_else(|| "host.docker.internal".to_string());

    let mut env: BTreeMap<String, String> = BTreeMap::new();
    env.insert("TASK_ID".to_string(), execution.run.task_id.to_string());
    env.insert("RUN_ID".to_string(), run_id.to_string());
    env.insert("HOST".to_string(), host);
    env.insert("PORT".to_string(), proxy_port.to_string());
    env.insert("API_PATH".to_string(), String::new());
    env.insert("ACTION".to_string(), format!("{:?}", execution.action));
    env.insert(
        "PKG_NAME".to_string(),
        v6_runtime::image_ref::parse(&execution.image)
            .map(|r| r.repository)
            .unwrap_or_else(|_| execution.image.clone()),
    );
    env.insert("TOKEN_FILE".to_string(), "/app/token.txt".to_string());
    env.insert("INPUT_FILE".to_string(), "/app/input.txt".to_string());
    env.insert("OUTPUT_FILE".to_string(), "/app/output.txt".to_string());
    env.insert(
        "SESSION_FOLDER".to_string(),
        format!("/mnt/sessions/session{:09}", execution.session_id),
    );
    for (k, v) in db_env {
        env.insert(k, v);
    }

    let spec = JobSpec {
        run_id,
        task_id: execution.run.task_id,
        image: execution.image.clone(),
        env,
        mounts,
        labels: BTreeMap::new(),
        network_name: None,
    };

    let mut handle = match runtime.launch(spec).await {
        Ok(h) => h,
        Err(e) => {
            log::error!("failed to launch run {run_id}: {e}");
            let _ = client.patch_run_status(token, run_id, RunStatus::StartFailed).await;
            return RunStatus::StartFailed;
        }
    };

    let job_result = tokio::select! {
        result = handle.wait() => match result {
            Ok(r) => r,
            Err(e) => {
                log::error!("error while waiting on run {run_id}: {e}");
                let _ = client.patch_run_status(token, run_id, RunStatus::UnknownError).await;
                return RunStatus::UnknownError;
            }
        },
        _ = cancel.changed() => {
            log::info!("run {run_id} cancelled by a kill_containers event");
            let _ = handle.kill().await;
            let _ = client.patch_run_status(token, run_id, RunStatus::KilledByUser).await;
            return RunStatus::KilledByUser;
        }
    };

    let mut status = job_result.status;

    if status == RunStatus::Completed {
        if let Some(handle) = &execution.output_dataframe_handle {
            let produced = scratch_dir.join("output_dataframe.parquet");
            match SessionFileManager::open(&config.data_root, execution.session_id)
                .and_then(|mgr| mgr.ingest_dataframe_file(handle, &produced))
            {
                Ok(()) => {}
                Err(e) => {
                    log::error!("failed to ingest dataframe for run {run_id}: {e}");
                    status = RunStatus::UnexpectedOutput;
                }
            }
        }
    }

    let output = if status == RunStatus::Completed && job_result.output.is_empty() && execution.output_dataframe_handle.is_none() {
        status = RunStatus::UnexpectedOutput;
        Vec::new()
    } else {
        job_result.output
    };

    let encrypted_result = if status == RunStatus::Completed {
        v6_crypto::Cryptor::encrypt(&output, &execution.result_recipient_pubkey).unwrap_or_default()
    } else {
        String::new()
    };

    let (stored_result, blob_storage_used) =
        if config.use_blob_storage && status == RunStatus::Completed && !encrypted_result.is_empty() {
            match client.upload_blob(token, encrypted_result.clone().into_bytes()).await {
                Ok(uuid) => (uuid, true),
                Err(e) => {
                    log::warn!("blob upload failed for run {run_id}, falling back to inline result: {e}");
                    (encrypted_result, false)
                }
            }
        } else {
            (encrypted_result, false)
        };

    let _ = client
        .patch_run_result(token, run_id, status, job_result.logs, stored_result, blob_storage_used)
        .await;

    status
}

fn write_scratch_file(dir: &PathBuf, name: &str, contents: &[u8]) {
    if let Err(e) = std::fs::write(dir.join(name), contents) {
        log::error!("failed to write scratch file {name}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn source_ref(label: &str) -> DbRef {
        DbRef {
            kind: DbRefKind::Source,
            label: Some(label.to_string()),
            dataframe_id: None,
            position: 0,
        }
    }

    #[test]
    fn resolve_unknown_source_label_is_not_allowed() {
        let dir = tempdir().unwrap();
        let catalog = DatabaseCatalog { sources: BTreeMap::new() };
        let err = resolve_databases(dir.path(), 1, &catalog, &[vec![source_ref("default")]]).unwrap_err();
        assert!(matches!(err, ResolveError::NotAllowed(_)));
    }

    #[test]
    fn resolve_known_source_label_emits_uri_env() {
        let dir = tempdir().unwrap();
        let mut sources = BTreeMap::new();
        sources.insert("default".to_string(), "csv:///data/patients.csv".to_string());
        let catalog = DatabaseCatalog { sources };
        let (env, mounts) = resolve_databases(dir.path(), 1, &catalog, &[vec![source_ref("default")]]).unwrap();
        assert!(mounts.is_empty());
        assert!(env.iter().any(|(k, v)| k == "default_DATABASE_URI" && v == "csv:///data/patients.csv"));
    }

    #[test]
    fn resolve_missing_dataframe_file_errors() {
        let dir = tempdir().unwrap();
        let catalog = DatabaseCatalog { sources: BTreeMap::new() };
        let df_ref = DbRef {
            kind: DbRefKind::Dataframe,
            label: None,
            dataframe_id: Some(7),
            position: 0,
        };
        let err = resolve_databases(dir.path(), 1, &catalog, &[vec![df_ref]]).unwrap_err();
        assert!(matches!(err, ResolveError::DataframeNotFound(_)));
    }
}
