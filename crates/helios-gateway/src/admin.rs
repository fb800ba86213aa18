//! The Admin API: `GET/POST /v1/backends`, `POST /v1/strategy`,
//! `GET /v1/metrics`, `GET /v1/health`. Mutating endpoints are gated by a
//! bearer token and an IP allow/deny filter before they touch the registry.

use actix_web::{web, HttpRequest, HttpResponse};
use helios_core::config::settings::AdminApiConfig;
use helios_core::error::HeliosError;
use helios_core::models::backend::BackendConfig;
use helios_core::services::dispatcher::DispatcherState;
use helios_core::utils::ip::{client_ip, ip_permitted};
use serde::Deserialize;

/// Checks the bearer token and the CIDR allow/deny list for a mutating
/// request. Deny wins; an empty allow list means allow-all-except-denied.
fn authorize_mutation(req: &HttpRequest, cfg: &AdminApiConfig) -> Result<(), HeliosError> {
    let ip = client_ip(req);
    if !ip_permitted(&ip, &cfg.ip_allow_list, &cfg.ip_deny_list) {
        return Err(HeliosError::Forbidden(format!("{ip} is not permitted to reach the admin API")));
    }

    if let Some(token) = &cfg.auth_token {
        if token.is_empty() {
            return Ok(());
        }
        let provided = req
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided != Some(token.as_str()) {
            return Err(HeliosError::Unauthorized("missing or invalid bearer token".to_string()));
        }
    }

    Ok(())
}

pub async fn list_backends(state: web::Data<DispatcherState>) -> HttpResponse {
    HttpResponse::Ok().json(state.registry.list())
}

#[derive(Debug, Deserialize)]
pub struct AddBackendRequest {
    pub name: String,
    pub address: String,
    pub weight: Option<u32>,
}

pub async fn add_backend(
    req: HttpRequest,
    state: web::Data<DispatcherState>,
    admin_cfg: web::Data<AdminApiConfig>,
    body: web::Json<AddBackendRequest>,
) -> Result<HttpResponse, HeliosError> {
    authorize_mutation(&req, &admin_cfg)?;
    let cfg = BackendConfig {
        name: body.name.clone(),
        address: body.address.clone(),
        weight: body.weight,
    };
    state.registry.add(&cfg)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "added", "name": cfg.name })))
}

#[derive(Debug, Deserialize)]
pub struct RemoveBackendRequest {
    pub name: String,
}

pub async fn remove_backend(
    req: HttpRequest,
    state: web::Data<DispatcherState>,
    admin_cfg: web::Data<AdminApiConfig>,
    body: web::Json<RemoveBackendRequest>,
) -> Result<HttpResponse, HeliosError> {
    authorize_mutation(&req, &admin_cfg)?;
    state.registry.remove(&body.name);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "removed", "name": body.name })))
}

#[derive(Debug, Deserialize)]
pub struct SetStrategyRequest {
    pub strategy: String,
}

pub async fn set_strategy(
    req: HttpRequest,
    state: web::Data<DispatcherState>,
    admin_cfg: web::Data<AdminApiConfig>,
    body: web::Json<SetStrategyRequest>,
) -> Result<HttpResponse, HeliosError> {
    authorize_mutation(&req, &admin_cfg)?;
    state.registry.set_strategy(&body.strategy)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "strategy_updated", "strategy": body.strategy })))
}

pub async fn metrics(state: web::Data<DispatcherState>) -> HttpResponse {
    HttpResponse::Ok().json(state.metrics.get_metrics())
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub fn configure_admin(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1")
            .route("/backends", web::get().to(list_backends))
            .route("/backends/add", web::post().to(add_backend))
            .route("/backends/remove", web::post().to(remove_backend))
            .route("/backends/remove", web::delete().to(remove_backend))
            .route("/strategy", web::post().to(set_strategy))
            .route("/metrics", web::get().to(metrics))
            .route("/health", web::get().to(health)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with(token: Option<&str>, allow: Vec<&str>, deny: Vec<&str>) -> AdminApiConfig {
        AdminApiConfig {
            enabled: true,
            port: 9091,
            auth_token: token.map(String::from),
            ip_allow_list: allow.into_iter().map(String::from).collect(),
            ip_deny_list: deny.into_iter().map(String::from).collect(),
        }
    }

    #[actix_web::test]
    async fn missing_token_is_rejected_when_configured() {
        let cfg = cfg_with(Some("secret"), vec![], vec![]);
        let req = actix_web::test::TestRequest::default().to_http_request();
        assert!(authorize_mutation(&req, &cfg).is_err());
    }

    #[actix_web::test]
    async fn correct_bearer_token_is_accepted() {
        let cfg = cfg_with(Some("secret"), vec![], vec![]);
        let req = actix_web::test::TestRequest::default()
            .insert_header(("Authorization", "Bearer secret"))
            .to_http_request();
        assert!(authorize_mutation(&req, &cfg).is_ok());
    }

    #[actix_web::test]
    async fn no_token_configured_allows_any_request() {
        let cfg = cfg_with(None, vec![], vec![]);
        let req = actix_web::test::TestRequest::default().to_http_request();
        assert!(authorize_mutation(&req, &cfg).is_ok());
    }
}
