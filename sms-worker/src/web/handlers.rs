//! HTTP endpoint handlers.
//!
//! Handlers only extract, call into the library and shape the response.
//! Uploads are spooled and handed to the import worker; the response goes out
//! before any row is parsed.

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{multipart::Field, FromRequestParts, Multipart, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::campaign::{self, CreateCampaign, Progress};
use crate::config::Config;
use crate::error::Error;
use crate::events::EventBus;
use crate::import::{self, ImportRegistry, ImportTask, Spooled, Spooler};
use crate::messages::{self, DirectSend};
use crate::model::{Campaign, ImportJob, Message, MessageEvent, MessageTemplate, Webhook, WebhookDelivery};
use crate::status::callbacks::{handle_callback, CallbackOutcome, GatewayCallback};
use crate::status::StatusMachine;
use crate::templates;
use crate::web::error::ApiError;
use crate::webhooks::signature::{
    is_signature_verification_enabled, verify_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use crate::webhooks::{self, CreateWebhook};

pub type ApiResult<T> = Result<T, ApiError>;

/// Header carrying the authenticated owner, set by the fronting proxy.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub machine: StatusMachine,
    pub imports: mpsc::Sender<ImportTask>,
    pub registry: ImportRegistry,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        machine: StatusMachine,
        imports: mpsc::Sender<ImportTask>,
        registry: ImportRegistry,
    ) -> Self {
        Self {
            config,
            machine,
            imports,
            registry,
        }
    }

    fn pool(&self) -> &SqlitePool {
        self.machine.pool()
    }

    fn bus(&self) -> &EventBus {
        self.machine.bus()
    }
}

/// Owner of the request, taken from [`OWNER_HEADER`].
pub struct Owner(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or(ApiError::Unauthorized("missing X-Owner-Id header"))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Imports
// =============================================================================

async fn spool_field(field: &mut Field<'_>, config: &Config) -> Result<Spooled, Error> {
    let mut spooler = Spooler::new(config.import_scratch_dir.as_deref(), config.import_max_file_bytes)?;
    loop {
        let chunk = field
            .chunk()
            .await
            .map_err(|e| Error::validation(format!("upload interrupted: {}", e.body_text())))?;
        match chunk {
            Some(chunk) => spooler.write_chunk(&chunk).await?,
            None => break,
        }
    }
    spooler.finish().await
}

/// Accept a CSV upload from the multipart field `file`.
///
/// Returns 202 with the job as soon as the file is spooled.
pub async fn upload_import(
    State(state): State<AppState>,
    Owner(owner): Owner,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<ImportJob>)> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        import::validate_upload(&filename, content_type.as_deref(), &state.config)?;

        let job = import::create_job(state.pool(), &state.config, &owner, &filename).await?;
        let spooled = match spool_field(&mut field, &state.config).await {
            Ok(spooled) => spooled,
            Err(err) => {
                import::reject_job(state.pool(), &job.id, &err).await?;
                return Err(err.into());
            }
        };
        import::record_upload(state.pool(), &job.id, &spooled).await?;

        state.registry.register(&job.id);
        let task = ImportTask {
            job_id: job.id.clone(),
            path: spooled.path,
        };
        if state.imports.send(task).await.is_err() {
            let err = Error::Io(std::io::Error::other("import worker is not running"));
            import::reject_job(state.pool(), &job.id, &err).await?;
            return Err(err.into());
        }

        info!(
            import_id = %job.id,
            size_bytes = spooled.size_bytes,
            "import_upload_accepted"
        );
        let job = import::get_import(state.pool(), &owner, &job.id).await?;
        return Ok((StatusCode::ACCEPTED, Json(job)));
    }
    Err(ApiError::BadRequest(
        "multipart field 'file' is required".to_string(),
    ))
}

pub async fn get_import(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<ImportJob>> {
    Ok(Json(import::get_import(state.pool(), &owner, &id).await?))
}

pub async fn cancel_import(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<ImportJob>> {
    Ok(Json(
        import::cancel_import(state.pool(), &state.registry, &owner, &id).await?,
    ))
}

// =============================================================================
// Templates
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateTemplate {
    pub name: String,
    pub content: String,
}

pub async fn create_template(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<CreateTemplate>,
) -> ApiResult<(StatusCode, Json<MessageTemplate>)> {
    let template = templates::create_template(state.pool(), &owner, &req.name, &req.content).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn get_template(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageTemplate>> {
    Ok(Json(templates::get_template(state.pool(), &owner, &id).await?))
}

pub async fn deactivate_template(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageTemplate>> {
    Ok(Json(
        templates::deactivate_template(state.pool(), &owner, &id).await?,
    ))
}

// =============================================================================
// Campaigns
// =============================================================================

pub async fn create_campaign(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<CreateCampaign>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    let campaign = campaign::create_campaign(state.pool(), state.bus(), &owner, req).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn get_campaign(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(campaign::get_campaign(state.pool(), &owner, &id).await?))
}

pub async fn start_campaign(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(
        campaign::start_campaign(&state.machine, &owner, &id).await?,
    ))
}

pub async fn pause_campaign(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(campaign::pause_campaign(state.pool(), &owner, &id).await?))
}

pub async fn cancel_campaign(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(
        campaign::cancel_campaign(&state.machine, &owner, &id).await?,
    ))
}

pub async fn campaign_status(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<Progress>> {
    Ok(Json(campaign::campaign_status(state.pool(), &owner, &id).await?))
}

pub async fn batch_progress(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<Progress>> {
    Ok(Json(
        campaign::batch_progress(state.pool(), &owner, &batch_id).await?,
    ))
}

// =============================================================================
// Messages
// =============================================================================

/// A message with its audit trail.
#[derive(Serialize)]
pub struct MessageDetail {
    #[serde(flatten)]
    pub message: Message,
    pub events: Vec<MessageEvent>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<DirectSend>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = messages::send_direct(state.pool(), state.bus(), &owner, req).await?;
    Ok((StatusCode::ACCEPTED, Json(message)))
}

pub async fn get_message(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageDetail>> {
    let message = messages::get_message(state.pool(), &owner, &id).await?;
    let events = messages::message_events(state.pool(), &message.id).await?;
    Ok(Json(MessageDetail { message, events }))
}

pub async fn retry_message(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<Message>> {
    Ok(Json(state.machine.retry_failed(&owner, &id).await?))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    messages::delete_message(state.pool(), &owner, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Webhooks
// =============================================================================

pub async fn create_webhook(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<CreateWebhook>,
) -> ApiResult<(StatusCode, Json<Webhook>)> {
    let webhook = webhooks::create_webhook(state.pool(), &owner, req).await?;
    Ok((StatusCode::CREATED, Json(webhook)))
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> ApiResult<Json<Vec<Webhook>>> {
    Ok(Json(webhooks::list_webhooks(state.pool(), &owner).await?))
}

pub async fn deactivate_webhook(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<Json<Webhook>> {
    Ok(Json(
        webhooks::deactivate_webhook(state.pool(), &owner, &id).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct FailedDeliveriesQuery {
    #[serde(default = "default_failed_limit")]
    pub limit: u32,
}

fn default_failed_limit() -> u32 {
    50
}

pub async fn failed_deliveries(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<FailedDeliveriesQuery>,
) -> ApiResult<Json<Vec<WebhookDelivery>>> {
    Ok(Json(
        webhooks::list_failed_deliveries(state.pool(), &owner, query.limit).await?,
    ))
}

// =============================================================================
// Gateway Callback
// =============================================================================

/// Delivery report from the SMS gateway.
///
/// The body is taken raw so the signature is checked over the exact bytes
/// the gateway signed.
pub async fn gateway_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<CallbackOutcome>> {
    if is_signature_verification_enabled(&state.config.callback_signing_key) {
        let signing_key = state.config.callback_signing_key.as_deref().unwrap_or_default();
        if !verify_signature(
            signing_key,
            &body,
            header_str(&headers, TIMESTAMP_HEADER),
            header_str(&headers, SIGNATURE_HEADER),
            state.config.callback_signature_max_age,
        ) {
            warn!(body_length = body.len(), "gateway_callback_signature_invalid");
            return Err(ApiError::Unauthorized("invalid callback signature"));
        }
    }

    let callback: GatewayCallback = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid callback body: {e}")))?;
    Ok(Json(handle_callback(&state.machine, &callback).await?))
}
