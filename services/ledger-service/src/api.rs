//! REST API handlers for Ledger Service

use actix_web::{web, HttpResponse, Result};
use securechat_ledger::{Block, ValidationReport};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ServiceError;
use crate::AppState;

/// Configure API routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health_check))
            .route("/messages", web::post().to(send_message))
            .route("/ledger/{username}", web::get().to(participant_ledger))
            .route("/chain", web::get().to(full_chain))
            .route("/chain/tail", web::get().to(chain_tail))
            .route("/chain/blocks/{index}", web::get().to(get_block))
            .route("/chain/validate", web::get().to(validate_chain)),
    );
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
}

/// Health check endpoint
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        service: "ledger-service",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Message send request from the transport
#[derive(Deserialize)]
struct SendMessageRequest {
    from: String,
    to: String,
    payload: String,
}

/// Receipt returned to the sender
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageReceipt {
    index: u64,
    hash: String,
    prev_hash: String,
    timestamp: String,
}

/// Record a message block
async fn send_message(
    state: web::Data<AppState>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, ServiceError> {
    let SendMessageRequest { from, to, payload } = body.into_inner();
    let store = state.store.clone();

    let block = web::block(move || store.append(&from, &to, &payload)).await??;

    Ok(HttpResponse::Created().json(MessageReceipt {
        index: block.index,
        hash: block.hash,
        prev_hash: block.prev_hash,
        timestamp: block.timestamp,
    }))
}

/// Block list response
#[derive(Serialize, Deserialize)]
struct BlocksResponse {
    blocks: Vec<Block>,
    count: usize,
}

impl From<Vec<Block>> for BlocksResponse {
    fn from(blocks: Vec<Block>) -> Self {
        Self {
            count: blocks.len(),
            blocks,
        }
    }
}

/// Ledger view for one participant
async fn participant_ledger(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ServiceError> {
    let username = path.into_inner();
    let store = state.store.clone();

    let blocks = web::block(move || store.chain_for_participant(&username)).await??;
    Ok(HttpResponse::Ok().json(BlocksResponse::from(blocks)))
}

/// Full chain export
async fn full_chain(state: web::Data<AppState>) -> Result<HttpResponse, ServiceError> {
    let store = state.store.clone();

    let blocks = web::block(move || store.full_chain()).await??;
    Ok(HttpResponse::Ok().json(BlocksResponse::from(blocks)))
}

/// Current tail block
async fn chain_tail(state: web::Data<AppState>) -> Result<HttpResponse, ServiceError> {
    let store = state.store.clone();

    let tail = web::block(move || store.tail())
        .await??
        .ok_or_else(|| ServiceError::NotFound("chain has no blocks".to_string()))?;
    Ok(HttpResponse::Ok().json(tail))
}

/// Single block by index
async fn get_block(
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> Result<HttpResponse, ServiceError> {
    let index = path.into_inner();
    let store = state.store.clone();

    let block = web::block(move || store.block(index))
        .await??
        .ok_or_else(|| ServiceError::NotFound(format!("block {}", index)))?;
    Ok(HttpResponse::Ok().json(block))
}

/// Verify chain integrity
async fn validate_chain(state: web::Data<AppState>) -> Result<HttpResponse, ServiceError> {
    let store = state.store.clone();

    let validation = web::block(move || store.validate()).await??;
    info!("Chain validation requested: {}", validation);

    Ok(HttpResponse::Ok().json(ValidationReport::from(&validation)))
}
