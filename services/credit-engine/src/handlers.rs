use crate::coordinator::BalanceCoordinator;
use crate::errors::BalanceError;
use crate::metrics;
use crate::models::{AddTokensRequest, BalanceResponse};
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use serde_json::json;
use validator::Validate;

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "credit-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Top-up endpoint
pub async fn add_tokens(
    coordinator: web::Data<BalanceCoordinator>,
    request: web::Json<AddTokensRequest>,
) -> Result<HttpResponse, BalanceError> {
    let request = request.into_inner();
    request
        .validate()
        .map_err(|e| BalanceError::Validation(e.to_string()))?;

    coordinator
        .add_tokens(&request.auth_token, request.amount)
        .await?;

    Ok(HttpResponse::Ok().json(json!({ "status": "ok" })))
}

/// Balance endpoint, client identified by the Authorization header
pub async fn get_balance(
    coordinator: web::Data<BalanceCoordinator>,
    req: HttpRequest,
) -> Result<HttpResponse, BalanceError> {
    let Some(identity) = auth_token(&req) else {
        return Ok(missing_token());
    };

    let balance = coordinator.get_balance(identity).await?;
    Ok(HttpResponse::Ok().json(BalanceResponse { balance }))
}

/// Charge one metered call
pub async fn deduct_tokens(
    coordinator: web::Data<BalanceCoordinator>,
    req: HttpRequest,
) -> Result<HttpResponse, BalanceError> {
    let Some(identity) = auth_token(&req) else {
        return Ok(missing_token());
    };

    coordinator.deduct_tokens(identity).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "cost": coordinator.cost()
    })))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "error": "Failed to gather metrics",
            "details": e.to_string()
        })),
    }
}

fn auth_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn missing_token() -> HttpResponse {
    HttpResponse::Unauthorized().json(json!({
        "error": {
            "code": 401,
            "message": "Missing authorization token",
            "type": "unauthorized"
        }
    }))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/tokens")
            .route("/add", web::post().to(add_tokens))
            .route("/balance", web::get().to(get_balance))
            .route("/deduct", web::post().to(deduct_tokens)),
    )
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/health", web::get().to(health_check));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::CreditConfig;
    use crate::coordinator::BackgroundTasks;
    use crate::ledger::InMemoryLedger;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    async fn coordinator_with_client(identity: &str) -> (BalanceCoordinator, BackgroundTasks) {
        let ledger = InMemoryLedger::new();
        ledger.create_client(identity).await;

        let mut config = CreditConfig::default();
        config.sweep_interval_secs = 0;

        BalanceCoordinator::spawn(Arc::new(ledger), Arc::new(InMemoryCache::new()), &config)
    }

    #[actix_web::test]
    async fn test_top_up_then_balance() {
        let (coordinator, _tasks) = coordinator_with_client("tok1").await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(coordinator))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/tokens/add")
            .set_json(json!({ "auth_token": "tok1", "amount": 5 }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::get()
            .uri("/api/v1/tokens/balance")
            .insert_header((header::AUTHORIZATION, "tok1"))
            .to_request();
        let body: BalanceResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.balance, 5);
    }

    #[actix_web::test]
    async fn test_error_statuses() {
        let (coordinator, _tasks) = coordinator_with_client("tok1").await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(coordinator))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/tokens/balance").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::UNAUTHORIZED
        );

        let req = test::TestRequest::get()
            .uri("/api/v1/tokens/balance")
            .insert_header((header::AUTHORIZATION, "no-such-token"))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::UNAUTHORIZED
        );

        let req = test::TestRequest::post()
            .uri("/api/v1/tokens/deduct")
            .insert_header((header::AUTHORIZATION, "tok1"))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::PAYMENT_REQUIRED
        );

        let req = test::TestRequest::post()
            .uri("/api/v1/tokens/add")
            .set_json(json!({ "auth_token": "tok1", "amount": 0 }))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::BAD_REQUEST
        );
    }
}
