//! Management facade: JSON request/response surface over the scheduler
//! and token manager.
//!
//! Every handler returns a `serde_json::Value`; errors are mapped to the
//! stable `{code, message}` shape so callers can match on codes across
//! releases.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, ZmigrateError};
use crate::task::scheduler::Scheduler;
use crate::task::{TaskParams, TaskStatus};
use crate::token::{Operation, TokenManager, TransferFlags};

const DEFAULT_LIST_LIMIT: usize = 100;

pub struct Api {
    scheduler: Arc<Scheduler>,
    tokens: TokenManager,
    token_default_ttl: Duration,
}

#[derive(Debug, Deserialize)]
pub struct TokenIssueRequest {
    pub operation: Operation,
    pub dataset: String,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub flags: TransferFlags,
    pub owner: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl Api {
    pub fn new(
        scheduler: Arc<Scheduler>,
        tokens: TokenManager,
        token_default_ttl: Duration,
    ) -> Self {
        Self {
            scheduler,
            tokens,
            token_default_ttl,
        }
    }

    pub async fn migration_create(&self, params: TaskParams) -> Result<Value> {
        let task = self.scheduler.submit(params).await?;
        Ok(json!({
            "task_id": task.id,
            "status": task.status.as_str(),
            "created_at": task.created_at,
        }))
    }

    pub async fn migration_list(
        &self,
        status: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Value> {
        let status = match status {
            Some(s) => Some(TaskStatus::parse(s).ok_or_else(|| {
                ZmigrateError::Validation(format!("unknown status filter: {s}"))
            })?),
            None => None,
        };
        let (tasks, total) = self
            .scheduler
            .list(status, limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await?;
        Ok(json!({ "tasks": tasks, "total": total }))
    }

    pub async fn migration_get(&self, task_id: &str) -> Result<Value> {
        let task = self.scheduler.get(task_id).await?;
        Ok(serde_json::to_value(&task)?)
    }

    pub async fn migration_progress(&self, task_id: &str) -> Result<Value> {
        let task = self.scheduler.get(task_id).await?;
        Ok(json!({
            "task_id": task.id,
            "status": task.status.as_str(),
            "progress": task.progress,
            "error": task.error,
        }))
    }

    pub async fn migration_cancel(&self, task_id: &str) -> Result<Value> {
        let cancelled = self.scheduler.cancel(task_id).await?;
        Ok(json!({ "cancelled": cancelled, "task_id": task_id }))
    }

    pub async fn token_issue(&self, req: TokenIssueRequest) -> Result<Value> {
        let ttl = req
            .ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(self.token_default_ttl);
        let claims = self
            .tokens
            .issue(
                req.operation,
                &req.dataset,
                req.snapshot.as_deref(),
                req.flags,
                &req.owner,
                ttl,
            )
            .await?;
        Ok(json!({
            "token": claims.id,
            "operation": claims.operation,
            "dataset": claims.dataset,
            "expires_at": claims.expires_at,
        }))
    }

    pub async fn token_revoke(&self, token_id: &str) -> Result<Value> {
        let revoked = self.tokens.revoke(token_id).await?;
        Ok(json!({ "revoked": revoked }))
    }

    pub async fn token_list(&self, owner: &str) -> Result<Value> {
        let tokens = self.tokens.list(owner).await?;
        Ok(json!({ "tokens": tokens }))
    }
}

/// Maps an error into the wire shape callers match on.
pub fn error_body(err: &ZmigrateError) -> Value {
    json!({
        "error": {
            "code": err.code(),
            "message": err.to_string(),
        }
    })
}

impl Api {
    /// Dispatches one `{method, params}` request to its handler.
    pub async fn dispatch(&self, request: &Value) -> Value {
        let method = request["method"].as_str().unwrap_or_default();
        let params = &request["params"];
        let result = match method {
            "migration_create" => match serde_json::from_value(params.clone()) {
                Ok(p) => self.migration_create(p).await,
                Err(e) => Err(ZmigrateError::Validation(e.to_string())),
            },
            "migration_list" => {
                self.migration_list(
                    params["status"].as_str(),
                    params["limit"].as_u64().map(|n| n as usize),
                )
                .await
            }
            "migration_get" => match params["task_id"].as_str() {
                Some(id) => self.migration_get(id).await,
                None => Err(ZmigrateError::Validation("task_id is required".into())),
            },
            "migration_progress" => match params["task_id"].as_str() {
                Some(id) => self.migration_progress(id).await,
                None => Err(ZmigrateError::Validation("task_id is required".into())),
            },
            "migration_cancel" => match params["task_id"].as_str() {
                Some(id) => self.migration_cancel(id).await,
                None => Err(ZmigrateError::Validation("task_id is required".into())),
            },
            "token_issue" => match serde_json::from_value(params.clone()) {
                Ok(req) => self.token_issue(req).await,
                Err(e) => Err(ZmigrateError::Validation(e.to_string())),
            },
            "token_revoke" => match params["token"].as_str() {
                Some(id) => self.token_revoke(id).await,
                None => Err(ZmigrateError::Validation("token is required".into())),
            },
            "token_list" => match params["owner"].as_str() {
                Some(owner) => self.token_list(owner).await,
                None => Err(ZmigrateError::Validation("owner is required".into())),
            },
            _ => Err(ZmigrateError::Validation(format!(
                "unknown method: {method}"
            ))),
        };
        match result {
            Ok(value) => json!({ "result": value }),
            Err(e) => error_body(&e),
        }
    }
}

/// Control socket: one length-prefixed JSON request per frame, one
/// response frame back, until the client half-closes.
pub async fn run_control(listener: tokio::net::TcpListener, api: Arc<Api>) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Control socket listening");
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let api = api.clone();
        tokio::spawn(async move {
            loop {
                let request = match crate::transport::read_json_frame(&mut stream).await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let response = api.dispatch(&request).await;
                if crate::transport::write_json_frame(&mut stream, &response)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            tracing::debug!(%peer, "Control connection closed");
        });
    }
}
