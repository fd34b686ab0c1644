//! REST API handlers.
//!
//! Each handler resolves the caller, delegates to the `TenantService` and
//! wraps the result in the response envelope.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};
use tenantry_core::Role;
use tenantry_orchestrator::DeleteReport;
use tenantry_orchestrator::service::{
    AdminProjectMembers, AdminProjectsInfo, EncryptedServiceKey, JobStatusView, MemberView,
    TenantSummary, TransferReceipt,
};
use tenantry_runtime::{LifecycleReport, LogTail, StatusReport};

use crate::ApiState;
use crate::error::{ApiError, ApiJson, ApiResponse, ApiResult};
use crate::identity::{DELETE_PASSWORD, Identity, SHARED_TOKEN, header_str};

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok(json!({ "status": "ok" }))
}

// ── Projects ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NewProject {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct DuplicateProject {
    #[serde(default)]
    pub original_name: String,
    #[serde(default)]
    pub new_name: String,
    #[serde(default)]
    pub copy_data: bool,
}

/// GET /api/projects
pub async fn list_projects(
    State(state): State<ApiState>,
    Identity(caller): Identity,
) -> ApiResult<Vec<TenantSummary>> {
    Ok(ApiResponse::ok(state.service.list_tenants(&caller).await?))
}

/// POST /api/projects
pub async fn create_project(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    ApiJson(body): ApiJson<NewProject>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state.service.create_tenant(&caller, &body.name).await?;
    Ok((StatusCode::ACCEPTED, ApiResponse::ok(ticket)))
}

/// POST /api/projects/duplicate
pub async fn duplicate_project(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    ApiJson(body): ApiJson<DuplicateProject>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state
        .service
        .duplicate_tenant(&caller, &body.original_name, &body.new_name, body.copy_data)
        .await?;
    Ok((StatusCode::ACCEPTED, ApiResponse::ok(ticket)))
}

/// DELETE /api/projects/{name}
pub async fn delete_project(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<DeleteReport> {
    let password = header_str(&headers, DELETE_PASSWORD);
    let report = state.service.delete_tenant(&caller, &name, password).await?;
    Ok(ApiResponse::ok(report))
}

/// GET /api/projects/status/{job_id}
pub async fn job_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> ApiResult<JobStatusView> {
    Ok(ApiResponse::ok(state.service.job_status(&job_id).await?))
}

/// GET /api/projects/internal/enc-key/{name}
pub async fn encrypted_service_key(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<EncryptedServiceKey> {
    let token = header_str(&headers, SHARED_TOKEN);
    Ok(ApiResponse::ok(
        state.service.encrypted_service_key(&name, token).await?,
    ))
}

// ── Members ────────────────────────────────────────────────────

fn default_role() -> String {
    Role::Member.as_str().to_string()
}

#[derive(Debug, Deserialize)]
pub struct AddMember {
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

/// GET /api/projects/{name}/members
pub async fn list_members(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path(name): Path<String>,
) -> ApiResult<Vec<MemberView>> {
    Ok(ApiResponse::ok(state.service.list_members(&caller, &name).await?))
}

/// POST /api/projects/{name}/members
pub async fn add_member(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path(name): Path<String>,
    ApiJson(body): ApiJson<AddMember>,
) -> ApiResult<Value> {
    let role = Role::from_str(&body.role).map_err(ApiError::bad_request)?;
    state
        .service
        .add_member(&caller, &name, &body.user_id, role)
        .await?;
    Ok(ApiResponse::ok(json!({ "ok": true })))
}

/// DELETE /api/projects/{name}/members/{member_id}
pub async fn remove_member(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path((name, member_id)): Path<(String, String)>,
) -> ApiResult<Value> {
    state
        .service
        .remove_member(&caller, &name, &member_id)
        .await?;
    Ok(ApiResponse::ok(json!({ "ok": true })))
}

// ── Fleet ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<u32>,
}

/// GET /api/projects/{name}/status
pub async fn fleet_status(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path(name): Path<String>,
) -> ApiResult<StatusReport> {
    Ok(ApiResponse::ok(state.service.fleet_status(&caller, &name).await?))
}

/// POST /api/projects/{name}/start
pub async fn start_project(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path(name): Path<String>,
) -> ApiResult<LifecycleReport> {
    Ok(ApiResponse::ok(state.service.start(&caller, &name).await?))
}

/// POST /api/projects/{name}/stop
pub async fn stop_project(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path(name): Path<String>,
) -> ApiResult<LifecycleReport> {
    Ok(ApiResponse::ok(state.service.stop(&caller, &name).await?))
}

/// POST /api/projects/{name}/restart
pub async fn restart_project(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path(name): Path<String>,
) -> ApiResult<LifecycleReport> {
    Ok(ApiResponse::ok(state.service.restart(&caller, &name).await?))
}

/// GET /api/projects/{name}/logs/{service}?lines=N
pub async fn container_logs(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path((name, service)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<LogTail> {
    Ok(ApiResponse::ok(
        state
            .service
            .logs(&caller, &name, &service, query.lines)
            .await?,
    ))
}

// ── Administration ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    #[serde(default)]
    pub new_owner_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ProjectsInfoBody {
    #[serde(default)]
    pub user_id: String,
}

/// POST /api/projects/{name}/transfer
pub async fn transfer_project(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path(name): Path<String>,
    ApiJson(body): ApiJson<TransferBody>,
) -> ApiResult<TransferReceipt> {
    Ok(ApiResponse::ok(
        state
            .service
            .transfer_ownership(&caller, &name, &body.new_owner_id)
            .await?,
    ))
}

/// POST /api/projects/admin/projects-info
pub async fn admin_projects_info(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    ApiJson(body): ApiJson<ProjectsInfoBody>,
) -> ApiResult<AdminProjectsInfo> {
    Ok(ApiResponse::ok(
        state
            .service
            .admin_projects_info(&caller, &body.user_id)
            .await?,
    ))
}

/// GET /api/admin/projects/{name}/all-users
pub async fn admin_project_members(
    State(state): State<ApiState>,
    Identity(caller): Identity,
    Path(name): Path<String>,
) -> ApiResult<AdminProjectMembers> {
    Ok(ApiResponse::ok(
        state.service.admin_project_members(&caller, &name).await?,
    ))
}
