use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::create_cors_layer;
use crate::handlers::{deals, health_check, payments, vouchers};
use crate::rate_limit::limit_requests;
use crate::state::AppState;

pub fn create_routes(state: AppState) -> Router {
    // Spending money gets its own, stricter budget on top of the general one.
    let payment_limited = Router::new()
        .route("/api/vouchers/purchase", post(vouchers::purchase))
        .route("/api/payments/checkout", post(payments::checkout))
        .route_layer(middleware::from_fn_with_state(
            state.payment_limiter.clone(),
            limit_requests,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/vouchers", get(vouchers::list_my_vouchers))
        .route("/api/vouchers/:id", get(vouchers::get_voucher))
        .route("/api/vouchers/:id/qr", get(vouchers::get_voucher_qr))
        .route("/api/vouchers/redeem", post(vouchers::redeem))
        .route("/api/vouchers/redeem/qr", post(vouchers::redeem_qr))
        .route(
            "/api/vouchers/venue/:venue_id",
            get(vouchers::list_venue_vouchers),
        )
        .route(
            "/api/vouchers/venue/:venue_id/analytics",
            get(vouchers::venue_analytics),
        )
        .route(
            "/api/vouchers/admin/expiring",
            get(vouchers::expiring_vouchers),
        )
        .route("/api/vouchers/admin/expire", post(vouchers::expire_vouchers))
        .route(
            "/api/vouchers/admin/analytics",
            get(vouchers::admin_analytics),
        )
        .route("/api/deals", get(deals::list_deals).post(deals::create_deal))
        .route("/api/deals/search", get(deals::search_deals))
        .route("/api/deals/trending", get(deals::trending_deals))
        .route("/api/deals/expiring", get(deals::expiring_deals))
        .route("/api/deals/:id", get(deals::get_deal).put(deals::update_deal))
        .route("/api/deals/:id/availability", get(deals::check_availability))
        .route("/api/deals/:id/analytics", get(deals::deal_analytics))
        .route("/api/deals/venue/:venue_id", get(deals::list_venue_deals))
        .route("/api/deals/:id/activate", post(deals::activate_deal))
        .route("/api/deals/:id/pause", post(deals::pause_deal))
        .route("/api/deals/:id/end", post(deals::end_deal))
        .route("/api/payments", get(payments::list_payments))
        .route("/api/payments/webhook", post(payments::webhook))
        .route(
            "/api/payments/venue/:venue_id",
            get(payments::list_venue_payments),
        )
        .route(
            "/api/payments/venue/:venue_id/analytics",
            get(payments::venue_payment_analytics),
        )
        .route("/api/payments/admin/failed", get(payments::failed_payments))
        .route("/api/payments/admin/pending", get(payments::pending_payments))
        .route(
            "/api/payments/admin/analytics",
            get(payments::admin_payment_analytics),
        )
        .route("/api/payments/:id", get(payments::get_payment))
        .route("/api/payments/:id/refund", post(payments::refund_payment))
        .route("/api/payments/:id/retry", post(payments::retry_payment))
        .merge(payment_limited)
        .layer(middleware::from_fn_with_state(
            state.general_limiter.clone(),
            limit_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer(&state.config.cors_allowed_origins))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::mail::{DynMailClient, LogMailClient};
    use crate::models::{User, UserRole};
    use crate::rate_limit::MemoryCounterStore;
    use crate::services::test_support::{
        active_deal, customer, seeded_store, user_with_role, venue_owner, VENUE_ID,
    };
    use crate::store::{MemoryStore, Store};

    struct TestApp {
        router: Router,
        state: AppState,
        store: Arc<MemoryStore>,
    }

    impl TestApp {
        fn new(config: Config) -> Self {
            let store = seeded_store();
            let dyn_store: Arc<dyn Store> = store.clone();
            let mail: DynMailClient = Arc::new(LogMailClient::new("test@example.com"));
            let state = AppState::new(
                config,
                dyn_store,
                mail,
                Arc::new(MemoryCounterStore::new()),
            )
            .unwrap();
            Self {
                router: create_routes(state.clone()),
                state,
                store,
            }
        }

        fn token(&self, user: &User) -> String {
            self.state.tokens.issue(user.id, user.role).unwrap()
        }

        async fn send(&self, request: Request<Body>) -> Response {
            self.router.clone().oneshot(request).await.unwrap()
        }

        async fn get(&self, uri: &str, user: Option<&User>) -> Response {
            let mut builder = Request::builder().uri(uri);
            if let Some(user) = user {
                builder = builder.header("authorization", format!("Bearer {}", self.token(user)));
            }
            self.send(builder.body(Body::empty()).unwrap()).await
        }

        async fn post(&self, uri: &str, user: Option<&User>, body: Value) -> Response {
            let mut builder = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json");
            if let Some(user) = user {
                builder = builder.header("authorization", format!("Bearer {}", self.token(user)));
            }
            self.send(builder.body(Body::from(body.to_string())).unwrap())
                .await
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = TestApp::new(Config::default());
        let response = app
            .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-ratelimit-limit"));
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_purchase_requires_token() {
        let app = TestApp::new(Config::default());
        let response = app
            .post(
                "/api/vouchers/purchase",
                None,
                json!({ "deal_id": uuid::Uuid::new_v4() }),
            )
            .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "AUTH_ERROR");
        assert_eq!(body["error"]["message"], "Access token required");
    }

    #[tokio::test]
    async fn test_purchase_then_redeem_over_http() {
        let app = TestApp::new(Config::default());
        let buyer = customer(&app.store, None);
        let staff = venue_owner();
        let deal = active_deal(&app.store, |_| {}).await;

        let response = app
            .post(
                "/api/vouchers/purchase",
                Some(&buyer),
                json!({ "deal_id": deal.id, "quantity": 2 }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        let vouchers = body["data"]["vouchers"].as_array().unwrap();
        assert_eq!(vouchers.len(), 2);
        assert!(vouchers[0].get("qr_code_data").is_none());
        let code = vouchers[0]["voucher_code"].as_str().unwrap().to_string();

        let response = app
            .post(
                "/api/vouchers/redeem",
                Some(&staff),
                json!({ "voucher_code": code }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["voucher"]["status"], "redeemed");
        assert_eq!(body["data"]["customer_info"]["email"], buyer.email);

        let response = app
            .post(
                "/api/vouchers/redeem",
                Some(&staff),
                json!({ "voucher_code": code }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "VOUCHER_NOT_ACTIVE");
        assert_eq!(body["error"]["message"], "This voucher has been redeemed");
    }

    #[tokio::test]
    async fn test_purchase_quantity_is_validated() {
        let app = TestApp::new(Config::default());
        let buyer = customer(&app.store, None);
        let deal = active_deal(&app.store, |_| {}).await;

        let response = app
            .post(
                "/api/vouchers/purchase",
                Some(&buyer),
                json!({ "deal_id": deal.id, "quantity": 11 }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_admin_routes_reject_customers() {
        let app = TestApp::new(Config::default());
        let buyer = customer(&app.store, None);

        let response = app
            .post("/api/vouchers/admin/expire", Some(&buyer), json!({}))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(
            body["error"]["message"],
            "This action requires admin role. You have customer role."
        );

        let admin = user_with_role(&app.store, UserRole::Admin);
        let response = app
            .post("/api/vouchers/admin/expire", Some(&admin), json!({}))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["expired_count"], 0);
    }

    #[tokio::test]
    async fn test_payment_routes_are_rate_limited() {
        let mut config = Config::default();
        config.payment_rate_limit.max_requests = 2;
        let app = TestApp::new(config);
        let buyer = customer(&app.store, None);
        let deal = active_deal(&app.store, |_| {}).await;

        for _ in 0..2 {
            let response = app
                .post(
                    "/api/vouchers/purchase",
                    Some(&buyer),
                    json!({ "deal_id": deal.id }),
                )
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app
            .post(
                "/api/vouchers/purchase",
                Some(&buyer),
                json!({ "deal_id": deal.id }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_webhook_rejects_unsigned_body() {
        let app = TestApp::new(Config::default());
        let response = app
            .post(
                "/api/payments/webhook",
                None,
                json!({ "payment_id": "PAY-1", "payment_status": "COMPLETE" }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_public_deal_lookup() {
        let app = TestApp::new(Config::default());
        let deal = active_deal(&app.store, |d| d.max_vouchers = 50).await;

        let response = app
            .send(
                Request::builder()
                    .uri(format!("/api/deals/{}", deal.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["vouchers_remaining"], 50);
        assert_eq!(body["data"]["status"], "active");
    }

    #[tokio::test]
    async fn test_public_deal_browsing() {
        let app = TestApp::new(Config::default());
        let deal = active_deal(&app.store, |d| {
            d.title = "Bottomless brunch".to_string();
            d.max_vouchers = 5;
        })
        .await;

        let response = app.get("/api/deals?city=cape%20town", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["pagination"]["total"], 1);
        assert_eq!(body["data"]["items"][0]["venue_name"], "The Corner Bistro");

        let response = app.get("/api/deals/search?q=brunch", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["items"][0]["id"], deal.id.to_string());

        let response = app.get("/api/deals/search", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.get("/api/deals/trending", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.get("/api/deals/expiring?days=60", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let response = app
            .get(&format!("/api/deals/{}/availability?quantity=6", deal.id), None)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["available"], false);
        assert_eq!(body["data"]["vouchers_remaining"], 5);
        assert_eq!(body["data"]["reason"], "Only 5 vouchers remaining");
    }

    #[tokio::test]
    async fn test_venue_views_require_ownership() {
        let app = TestApp::new(Config::default());
        let stranger = user_with_role(&app.store, UserRole::Venue);
        let owner = venue_owner();

        for uri in [
            format!("/api/vouchers/venue/{VENUE_ID}"),
            format!("/api/payments/venue/{VENUE_ID}"),
            format!("/api/payments/venue/{VENUE_ID}/analytics"),
        ] {
            let response = app.get(&uri, Some(&stranger)).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
            let response = app.get(&uri, Some(&owner)).await;
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }

        let deal = active_deal(&app.store, |_| {}).await;
        let mut request = Request::builder()
            .method("PUT")
            .uri(format!("/api/deals/{}", deal.id))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", app.token(&stranger)))
            .body(Body::from(json!({ "title": "Mine now" }).to_string()))
            .unwrap();
        assert_eq!(app.send(request).await.status(), StatusCode::FORBIDDEN);

        request = Request::builder()
            .method("PUT")
            .uri(format!("/api/deals/{}", deal.id))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", app.token(&owner)))
            .body(Body::from(json!({ "title": "Tasting menu for two" }).to_string()))
            .unwrap();
        let response = app.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["title"], "Tasting menu for two");
    }

    #[tokio::test]
    async fn test_admin_payment_views() {
        let app = TestApp::new(Config::default());
        let admin = user_with_role(&app.store, UserRole::Admin);
        let buyer = customer(&app.store, None);

        let response = app.get("/api/payments/admin/failed", Some(&buyer)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        for uri in [
            "/api/payments/admin/failed?hours=48",
            "/api/payments/admin/pending",
            "/api/payments/admin/analytics?period=7",
        ] {
            let response = app.get(uri, Some(&admin)).await;
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
        let body = json_body(app.get("/api/payments/admin/analytics", Some(&admin)).await).await;
        assert_eq!(body["data"]["total_payments"], 0);
        assert_eq!(body["data"]["success_rate"], 0.0);
    }
}
