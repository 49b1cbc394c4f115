// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`CronService`] — the Cron Service: schedule-driven triggers
//! emitted as `cron.trigger` events, backed by a persisted [`CronStore`].
//!
//! A single background task re-reads the task list on every tick so
//! `cron.add`/`cron.update`/`cron.remove` take effect without a restart; a
//! [`tokio::sync::Notify`] wakes it immediately after a mutation instead of
//! waiting out the poll cap.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::warn;
use vargos_gateway::{ErrorKind, GatewayClient, Registration, RpcError, ServiceHandler};

use crate::error::CronError;
use crate::store::CronStore;
use crate::types::{CronTask, CronTaskPatch};

/// Upper bound on how long the scheduler sleeps before re-checking the task
/// list, so a newly added task with no `wake()` call still fires on time.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

fn kind_of(err: &CronError) -> ErrorKind {
    match err {
        CronError::NotFound(_) => ErrorKind::NotFound,
        CronError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        CronError::Storage(_) => ErrorKind::Fatal,
    }
}

fn rpc_err(err: CronError) -> RpcError {
    RpcError::new(kind_of(&err), err.to_string())
}

/// The Cron Service's self-description.
pub fn registration() -> Registration {
    Registration::new("cron", "1")
        .methods(["cron.list", "cron.add", "cron.remove", "cron.update", "cron.run"])
        .events(["cron.trigger"])
}

pub struct CronService {
    store: Arc<CronStore>,
    client: tokio::sync::OnceCell<Arc<GatewayClient>>,
    wake: Notify,
}

impl CronService {
    pub fn new(store: Arc<CronStore>) -> Arc<Self> {
        Arc::new(Self { store, client: tokio::sync::OnceCell::new(), wake: Notify::new() })
    }

    /// Attach the connected client and start the background scheduler loop.
    /// Must be called exactly once, after `connect_in_process`/`connect_ws`.
    pub fn attach_client(self: &Arc<Self>, client: Arc<GatewayClient>) {
        let _ = self.client.set(client);
        let this = self.clone();
        tokio::spawn(async move { this.run_loop().await });
    }

    fn emit(&self, name: &str, payload: Value) {
        if let Some(client) = self.client.get() {
            client.emit(name, payload);
        } else {
            warn!(event = name, "cron service not yet attached to a gateway client; dropping event");
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let now = Utc::now();
            let tasks = self.store.list().await;
            let mut earliest_wait = MAX_POLL_INTERVAL;

            for task in tasks.iter().filter(|t| t.enabled) {
                let Ok(schedule) = Schedule::from_str(&task.schedule) else {
                    warn!(task_id = %task.task_id, schedule = %task.schedule, "cron task has an unparseable schedule");
                    continue;
                };
                let reference = task.last_fired_at.unwrap_or(task.created_at);
                let Some(next) = schedule.after(&reference).next() else { continue };

                if next <= now {
                    self.fire(task).await;
                } else if let Ok(until) = (next - now).to_std() {
                    earliest_wait = earliest_wait.min(until);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(earliest_wait) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn fire(&self, task: &CronTask) {
        self.emit(
            "cron.trigger",
            json!({
                "taskId": task.task_id,
                "task": task.task,
                "sessionKey": task.session_key,
                "notify": task.notify,
            }),
        );
        if let Err(err) = self.store.mark_fired(&task.task_id, Utc::now()).await {
            warn!(task_id = %task.task_id, error = %err, "failed to persist cron task fire timestamp");
        }
    }

    async fn fire_by_id(&self, task_id: &str) -> Result<(), CronError> {
        let task = self.store.get(task_id).await.ok_or_else(|| CronError::NotFound(task_id.to_string()))?;
        self.fire(&task).await;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AddParams {
    schedule: String,
    #[serde(rename = "sessionKey")]
    session_key: String,
    #[serde(default)]
    task: String,
    #[serde(default)]
    notify: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TaskIdParams {
    #[serde(rename = "taskId")]
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    #[serde(rename = "taskId")]
    task_id: String,
    #[serde(flatten)]
    patch: CronTaskPatch,
}

#[async_trait]
impl ServiceHandler for CronService {
    async fn handle_method(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "cron.list" => {
                let tasks = self.store.list().await;
                Ok(json!({ "tasks": tasks }))
            }
            "cron.add" => {
                let p: AddParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let task = self
                    .store
                    .add(p.schedule, p.session_key, p.task, p.notify)
                    .await
                    .map_err(rpc_err)?;
                self.wake.notify_one();
                Ok(serde_json::to_value(task).unwrap())
            }
            "cron.remove" => {
                let p: TaskIdParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                self.store.remove(&p.task_id).await.map_err(rpc_err)?;
                self.wake.notify_one();
                Ok(json!({ "taskId": p.task_id }))
            }
            "cron.update" => {
                let p: UpdateParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let task = self.store.update(&p.task_id, p.patch).await.map_err(rpc_err)?;
                self.wake.notify_one();
                Ok(serde_json::to_value(task).unwrap())
            }
            "cron.run" => {
                let p: TaskIdParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                self.fire_by_id(&p.task_id).await.map_err(rpc_err)?;
                Ok(json!({ "taskId": p.task_id }))
            }
            other => Err(RpcError::new(ErrorKind::NotFound, format!("no such method `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vargos_gateway::{connect_in_process, GatewayHub, NullHandler};

    async fn service() -> (tempfile::TempDir, Arc<CronService>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::load(dir.path().join("tasks.json")).await.unwrap());
        (dir, CronService::new(store))
    }

    #[tokio::test]
    async fn add_then_list_round_trips() {
        let (_dir, svc) = service().await;
        svc.handle_method(
            "cron.add",
            json!({ "schedule": "0 * * * * *", "sessionKey": "cron:t1", "task": "ping" }),
        )
        .await
        .unwrap();

        let result = svc.handle_method("cron.list", json!({})).await.unwrap();
        let tasks = result["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["sessionKey"], json!("cron:t1"));
    }

    #[tokio::test]
    async fn run_unknown_task_is_not_found() {
        let (_dir, svc) = service().await;
        let err = svc.handle_method("cron.run", json!({ "taskId": "ghost" })).await.unwrap_err();
        assert_eq!(err.code, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn cron_run_emits_trigger_event() {
        let hub = GatewayHub::new();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::load(dir.path().join("tasks.json")).await.unwrap());
        let svc = CronService::new(store);
        let client = connect_in_process(&hub, registration(), svc.clone()).await.unwrap();
        svc.attach_client(client);

        let added = svc
            .handle_method(
                "cron.add",
                json!({ "schedule": "0 0 1 1 *", "sessionKey": "cron:heartbeat", "task": "daily check" }),
            )
            .await
            .unwrap();
        let task_id = added["taskId"].as_str().unwrap().to_string();

        struct Sub(Arc<tokio::sync::Mutex<Vec<Value>>>);
        #[async_trait]
        impl ServiceHandler for Sub {
            async fn handle_method(&self, method: &str, _p: Value) -> Result<Value, RpcError> {
                Err(RpcError::no_route(method))
            }
            async fn handle_event(&self, name: &str, payload: Value) {
                if name == "cron.trigger" {
                    self.0.lock().await.push(payload);
                }
            }
        }
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let _sub = connect_in_process(
            &hub,
            Registration::new("watcher", "1").subscriptions(["cron.trigger"]),
            Arc::new(Sub(seen.clone())),
        )
        .await
        .unwrap();

        svc.handle_method("cron.run", json!({ "taskId": task_id })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = seen.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["sessionKey"], json!("cron:heartbeat"));
    }
}
