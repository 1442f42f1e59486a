//! JSON-RPC method handlers.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use relaybot_cron::{CronError, JobCreate, JobPatch, RunMode};

use crate::GatewayState;
use crate::jsonrpc::{INTERNAL_ERROR, INVALID_PARAMS, JsonRpcResponse, METHOD_NOT_FOUND, NOT_FOUND};

const DEFAULT_RUNS_LIMIT: usize = 50;

/// Route a JSON-RPC request to its handler.
pub async fn handle_rpc(method: &str, params: &Value, id: Value, state: &GatewayState) -> JsonRpcResponse {
    match method {
        "health" => handle_health(id, state).await,
        "cron.status" => JsonRpcResponse::success(id, json!(state.cron.status().await)),
        "cron.list" => handle_cron_list(params, id, state).await,
        "cron.add" => handle_cron_add(params, id, state).await,
        "cron.update" => handle_cron_update(params, id, state).await,
        "cron.remove" => handle_cron_remove(params, id, state).await,
        "cron.enable" => handle_cron_set_enabled(params, id, state, true).await,
        "cron.disable" => handle_cron_set_enabled(params, id, state, false).await,
        "cron.run" => handle_cron_run(params, id, state).await,
        "cron.runs" => handle_cron_runs(params, id, state),
        "lanes.stats" => JsonRpcResponse::success(id, json!({ "lanes": state.cron.lane_stats() })),
        "channels.list" => JsonRpcResponse::success(id, json!({ "channels": state.channels.list_channels().await })),
        _ => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}")),
    }
}

/// Deserialize params, treating a missing value as an empty object.
fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, String> {
    let value = if params.is_null() { json!({}) } else { params.clone() };
    serde_json::from_value(value).map_err(|e| format!("Invalid params: {e}"))
}

fn cron_error(id: Value, err: CronError) -> JsonRpcResponse {
    match err {
        CronError::Validation(e) => JsonRpcResponse::error(id, INVALID_PARAMS, e),
        CronError::NotFound(job) => JsonRpcResponse::error(id, NOT_FOUND, format!("Job not found: {job}")),
        other => JsonRpcResponse::error(id, INTERNAL_ERROR, other),
    }
}

macro_rules! params_or_return {
    ($params:expr, $id:expr) => {
        match parse_params($params) {
            Ok(p) => p,
            Err(e) => return JsonRpcResponse::error($id, INVALID_PARAMS, e),
        }
    };
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobIdParams {
    id: String,
}

/// health: process status plus a scheduler summary.
async fn handle_health(id: Value, state: &GatewayState) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "cron": state.cron.status().await,
        }),
    )
}

/// cron.list. Params: includeDisabled (bool, default false).
async fn handle_cron_list(params: &Value, id: Value, state: &GatewayState) -> JsonRpcResponse {
    #[derive(Deserialize, Default)]
    #[serde(rename_all = "camelCase", default)]
    struct ListParams {
        include_disabled: bool,
    }
    let p: ListParams = params_or_return!(params, id);
    let jobs = state.cron.list(p.include_disabled).await;
    JsonRpcResponse::success(id, json!({ "jobs": jobs }))
}

/// cron.add. Params: a job definition.
async fn handle_cron_add(params: &Value, id: Value, state: &GatewayState) -> JsonRpcResponse {
    let input: JobCreate = params_or_return!(params, id);
    match state.cron.add(input).await {
        Ok(job) => JsonRpcResponse::success(id, json!({ "job": job })),
        Err(e) => cron_error(id, e),
    }
}

/// cron.update. Params: id, patch.
async fn handle_cron_update(params: &Value, id: Value, state: &GatewayState) -> JsonRpcResponse {
    #[derive(Deserialize)]
    struct UpdateParams {
        id: String,
        #[serde(default)]
        patch: JobPatch,
    }
    let p: UpdateParams = params_or_return!(params, id);
    match state.cron.update(&p.id, p.patch).await {
        Ok(job) => JsonRpcResponse::success(id, json!({ "job": job })),
        Err(e) => cron_error(id, e),
    }
}

/// cron.remove. Params: id. Run history is kept.
async fn handle_cron_remove(params: &Value, id: Value, state: &GatewayState) -> JsonRpcResponse {
    let p: JobIdParams = params_or_return!(params, id);
    match state.cron.remove(&p.id).await {
        Ok(removed) => JsonRpcResponse::success(id, json!({ "removed": removed })),
        Err(e) => cron_error(id, e),
    }
}

async fn handle_cron_set_enabled(params: &Value, id: Value, state: &GatewayState, enabled: bool) -> JsonRpcResponse {
    let p: JobIdParams = params_or_return!(params, id);
    match state.cron.set_enabled(&p.id, enabled).await {
        Ok(job) => JsonRpcResponse::success(id, json!({ "job": job })),
        Err(e) => cron_error(id, e),
    }
}

/// cron.run. Params: id, mode ("force" | "due", default force). Waits for the run.
async fn handle_cron_run(params: &Value, id: Value, state: &GatewayState) -> JsonRpcResponse {
    #[derive(Deserialize)]
    struct RunParams {
        id: String,
        #[serde(default)]
        mode: RunMode,
    }
    let p: RunParams = params_or_return!(params, id);
    match state.cron.run_now(&p.id, p.mode).await {
        Ok(result) => JsonRpcResponse::success(id, json!(result)),
        Err(e) => cron_error(id, e),
    }
}

/// cron.runs. Params: jobId (optional), limit (default 50).
fn handle_cron_runs(params: &Value, id: Value, state: &GatewayState) -> JsonRpcResponse {
    #[derive(Deserialize, Default)]
    #[serde(rename_all = "camelCase", default)]
    struct RunsParams {
        job_id: Option<String>,
        limit: Option<usize>,
    }
    let p: RunsParams = params_or_return!(params, id);
    let limit = p.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    match state.cron.runs(p.job_id.as_deref(), limit) {
        Ok(entries) => JsonRpcResponse::success(id, json!({ "entries": entries })),
        Err(e) => cron_error(id, e),
    }
}
