use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post, put},
};
use tower_cookies::CookieManagerLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::{handlers, middleware_layer, state::AppState};

/// Builds the application router.
///
/// Connection-level layers (CORS, per-IP throttling) are added by the binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/second-factor", post(handlers::auth::second_factor))
        .route("/api/auth/federated", post(handlers::auth::federated))
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/network/status", get(handlers::network::status));

    let protected_routes = Router::new()
        .route("/api/auth/me", get(handlers::auth::me))
        .route(
            "/api/auth/change-password",
            post(handlers::auth::change_password),
        )
        .route("/api/auth/totp/enroll", post(handlers::auth::totp_enroll))
        .route("/api/auth/totp/confirm", post(handlers::auth::totp_confirm))
        .route("/api/auth/totp/disable", post(handlers::auth::totp_disable))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_auth,
        ));

    // route_layer order: require_auth (added last) runs first.
    let staff_routes = Router::new()
        .route(
            "/api/staff/users/{user_id}/revoke-sessions",
            post(handlers::staff::revoke_sessions),
        )
        .route(
            "/api/staff/users/{user_id}/role",
            put(handlers::staff::set_role),
        )
        .route(
            "/api/staff/sessions/sweep",
            post(handlers::staff::sweep_sessions),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::staff::require_staff,
        ))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(staff_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false))
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .layer(CookieManagerLayer::new())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{HeaderMap, Request, StatusCode, header},
    };
    use chrono::{DateTime, TimeZone, Utc};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use totp_rs::{Algorithm, TOTP};
    use tower::ServiceExt;
    use zeroize::Zeroizing;

    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        config::{Config, StoreBackend},
        crypto::{
            aes::{self, SecureKey},
            password::{self, PasswordParams},
        },
        models::user::{NewUser, Role, User},
        repositories::{memory::MemoryStore, user::UserStore},
        services::auth::AuthStores,
    };

    const MASTER_KEY: [u8; 32] = [5u8; 32];
    const PASSWORD: &str = "correct-horse-battery";
    const TOTP_SECRET: [u8; 20] = *b"gatehouse-test-seed!";
    const TRUSTED_IP: &str = "100.64.0.9";
    const OUTSIDE_IP: &str = "203.0.113.5";

    struct Harness {
        app: Router,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    fn config(network_gate_enabled: bool) -> Config {
        Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            store_backend: StoreBackend::Memory,
            database_url: None,
            redis_url: String::new(),
            master_key: Zeroizing::new(MASTER_KEY.to_vec()),
            session_duration_hours: 1,
            session_cookie_name: "session_id".to_string(),
            production: false,
            challenge_ttl_secs: 300,
            totp_issuer: "gatehouse".to_string(),
            rate_limit_window_secs: 900,
            login_max_failures: 5,
            challenge_max_failures: 3,
            network_gate_enabled,
            network_gate_required: true,
            trusted_subnets: vec!["100.64.0.0/10".parse().unwrap()],
            trust_proxy_headers: true,
            trusted_proxy_hops: 1,
            require_email_verified: false,
            require_approval: false,
            session_sweep_interval_secs: 3600,
            cors_allowed_origins: Vec::new(),
        }
    }

    fn harness(network_gate_enabled: bool) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_010, 0).unwrap()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let stores = AuthStores {
            users: store.clone(),
            sessions: store.clone(),
            challenges: store.clone(),
            attempts: store.clone(),
        };
        let state = AppState::from_parts(
            &config(network_gate_enabled),
            stores,
            clock.clone(),
            PasswordParams::fast_for_tests(),
        )
        .unwrap();
        Harness {
            app: router(state),
            clock,
            store,
        }
    }

    #[test]
    fn session_lifetime_out_of_range_is_rejected_not_panicking() {
        for hours in [0, i64::MAX] {
            let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_010, 0).unwrap()));
            let store = Arc::new(MemoryStore::new(clock.clone()));
            let config = Config {
                session_duration_hours: hours,
                ..config(false)
            };
            let built = AppState::from_parts(
                &config,
                AuthStores {
                    users: store.clone(),
                    sessions: store.clone(),
                    challenges: store.clone(),
                    attempts: store,
                },
                clock,
                PasswordParams::fast_for_tests(),
            );
            assert!(built.is_err(), "accepted {} hours", hours);
        }
    }

    impl Harness {
        async fn add_user(&self, username: &str, role: Role, second_factor: bool) -> User {
            let hash =
                password::hash_password(PASSWORD, &PasswordParams::fast_for_tests()).unwrap();
            let user = UserStore::insert(
                self.store.as_ref(),
                NewUser {
                    username: username.to_string(),
                    email: format!("{}@example.com", username),
                    display_name: username.to_uppercase(),
                    role,
                    password_hash: Some(hash),
                    external_id: None,
                    email_verified: true,
                    approved: true,
                },
                self.clock.now(),
            )
            .await
            .unwrap();

            if second_factor {
                let key = SecureKey::new(MASTER_KEY);
                let sealed = aes::seal(&key, user.id.as_bytes(), &TOTP_SECRET).unwrap();
                self.store
                    .update_totp_secret(user.id, Some(sealed), self.clock.now())
                    .await
                    .unwrap();
            }
            user
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, headers, body)
        }

        async fn post(&self, uri: &str, body: Value, cookie: Option<&str>, ip: Option<&str>) -> (StatusCode, HeaderMap, Value) {
            let mut builder = Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(cookie) = cookie {
                builder = builder.header(header::COOKIE, cookie);
            }
            if let Some(ip) = ip {
                builder = builder.header("x-forwarded-for", ip);
            }
            self.send(builder.body(Body::from(body.to_string())).unwrap())
                .await
        }

        async fn get(&self, uri: &str, cookie: Option<&str>, ip: Option<&str>) -> (StatusCode, HeaderMap, Value) {
            let mut builder = Request::builder().method("GET").uri(uri);
            if let Some(cookie) = cookie {
                builder = builder.header(header::COOKIE, cookie);
            }
            if let Some(ip) = ip {
                builder = builder.header("x-forwarded-for", ip);
            }
            self.send(builder.body(Body::empty()).unwrap()).await
        }

        async fn login(&self, username: &str) -> String {
            let (status, headers, _) = self
                .post(
                    "/api/auth/login",
                    json!({"identifier": username, "password": PASSWORD}),
                    None,
                    None,
                )
                .await;
            assert_eq!(status, StatusCode::OK);
            session_cookie(&headers).expect("session cookie")
        }
    }

    /// `name=value` of the session cookie set by a response, if any.
    fn session_cookie(headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("session_id="))
            .and_then(|v| v.split(';').next())
            .filter(|pair| pair.len() > "session_id=".len())
            .map(str::to_string)
    }

    fn set_cookie_headers(headers: &HeaderMap) -> Vec<String> {
        headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }

    fn code_at(time: DateTime<Utc>) -> String {
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            TOTP_SECRET.to_vec(),
            None,
            "user".to_string(),
        )
        .unwrap()
        .generate(time.timestamp() as u64)
    }

    fn wrong_code(time: DateTime<Utc>) -> String {
        let right: u32 = code_at(time).parse().unwrap();
        format!("{:06}", (right + 500_000) % 1_000_000)
    }

    #[tokio::test]
    async fn login_without_second_factor_then_introspect() {
        let h = harness(false);
        h.add_user("ada", Role::Member, false).await;

        let (status, headers, body) = h
            .post(
                "/api/auth/login",
                json!({"username": "ada", "password": PASSWORD}),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "authenticated");

        let set_cookie = set_cookie_headers(&headers).join("\n");
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("SameSite=Strict"));
        assert!(!set_cookie.contains("Domain"));

        let cookie = session_cookie(&headers).unwrap();
        let (status, _, me) = h.get("/api/auth/me", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["username"], "ada");
        assert_eq!(me["display_name"], "ADA");
        assert_eq!(me["role"], "member");
        assert!(me.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_get_the_same_response() {
        let h = harness(false);
        h.add_user("ada", Role::Member, false).await;

        let wrong = h
            .post("/api/auth/login", json!({"identifier": "ada", "password": "nope"}), None, None)
            .await;
        let unknown = h
            .post("/api/auth/login", json!({"identifier": "bob", "password": "nope"}), None, None)
            .await;
        assert_eq!(wrong.0, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.0, unknown.0);
        assert_eq!(wrong.2, unknown.2);
        assert!(session_cookie(&wrong.1).is_none());
    }

    #[tokio::test]
    async fn login_with_second_factor_requires_code() {
        let h = harness(false);
        h.add_user("ada", Role::Member, true).await;

        let (status, headers, body) = h
            .post(
                "/api/auth/login",
                json!({"identifier": "ada", "password": PASSWORD}),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "challenge_required");
        assert!(session_cookie(&headers).is_none());
        let challenge_id = body["challenge_id"].as_str().unwrap().to_string();

        let (status, headers, body) = h
            .post(
                "/api/auth/second-factor",
                json!({"challenge_id": challenge_id, "code": code_at(h.clock.now())}),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["username"], "ada");

        let cookie = session_cookie(&headers).unwrap();
        let (status, _, _) = h.get("/api/auth/me", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);

        // The challenge is single use.
        let (status, _, _) = h
            .post(
                "/api/auth/second-factor",
                json!({"challenge_id": challenge_id, "code": code_at(h.clock.now())}),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn repeated_wrong_codes_rate_limit_the_challenge() {
        let h = harness(false);
        h.add_user("ada", Role::Member, true).await;

        let (_, _, body) = h
            .post(
                "/api/auth/login",
                json!({"identifier": "ada", "password": PASSWORD}),
                None,
                None,
            )
            .await;
        let challenge_id = body["challenge_id"].as_str().unwrap().to_string();

        for _ in 0..3 {
            let (status, headers, _) = h
                .post(
                    "/api/auth/second-factor",
                    json!({"challenge_id": challenge_id, "code": wrong_code(h.clock.now())}),
                    None,
                    None,
                )
                .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(session_cookie(&headers).is_none());
        }

        let (status, headers, _) = h
            .post(
                "/api/auth/second-factor",
                json!({"challenge_id": challenge_id, "code": code_at(h.clock.now())}),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(session_cookie(&headers).is_none());
    }

    #[tokio::test]
    async fn expired_challenge_requires_fresh_login() {
        let h = harness(false);
        h.add_user("ada", Role::Member, true).await;

        let (_, _, body) = h
            .post(
                "/api/auth/login",
                json!({"identifier": "ada", "password": PASSWORD}),
                None,
                None,
            )
            .await;
        let challenge_id = body["challenge_id"].as_str().unwrap().to_string();

        h.clock.advance(chrono::Duration::seconds(301));
        let (status, _, body) = h
            .post(
                "/api/auth/second-factor",
                json!({"challenge_id": challenge_id, "code": code_at(h.clock.now())}),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Verification expired, please sign in again");
    }

    #[tokio::test]
    async fn admin_outside_trusted_network_is_forbidden() {
        let h = harness(true);
        h.add_user("root", Role::Admin, false).await;
        let victim = h.add_user("ada", Role::Member, false).await;
        let admin_cookie = h.login("root").await;
        let victim_cookie = h.login("ada").await;
        let uri = format!("/api/staff/users/{}/revoke-sessions", victim.id);

        let (status, _, body) = h.post(&uri, json!({}), Some(&admin_cookie), Some(OUTSIDE_IP)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Access denied");
        let (status, _, _) = h.get("/api/auth/me", Some(&victim_cookie), None).await;
        assert_eq!(status, StatusCode::OK, "handler must not have run");

        let (status, _, body) = h.post(&uri, json!({}), Some(&admin_cookie), Some(TRUSTED_IP)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revoked"], 1);
        let (status, _, _) = h.get("/api/auth/me", Some(&victim_cookie), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn forged_forwarded_for_does_not_reach_staff_routes() {
        let h = harness(true);
        h.add_user("root", Role::Admin, false).await;
        let admin_cookie = h.login("root").await;
        let forged = format!("{}, {}", TRUSTED_IP, OUTSIDE_IP);

        let (status, _, body) = h
            .post("/api/staff/sessions/sweep", json!({}), Some(&admin_cookie), Some(&forged))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Access denied");

        let (_, _, status_body) = h.get("/api/network/status", None, Some(&forged)).await;
        assert_eq!(status_body["client_ip"], OUTSIDE_IP);
        assert_eq!(status_body["in_trusted_network"], false);
    }

    #[tokio::test]
    async fn member_on_trusted_network_is_forbidden_with_the_same_response() {
        let h = harness(true);
        h.add_user("root", Role::Admin, false).await;
        h.add_user("ada", Role::Member, false).await;
        let member_cookie = h.login("ada").await;
        let admin_cookie = h.login("root").await;

        let by_role = h
            .post("/api/staff/sessions/sweep", json!({}), Some(&member_cookie), Some(TRUSTED_IP))
            .await;
        let by_network = h
            .post("/api/staff/sessions/sweep", json!({}), Some(&admin_cookie), Some(OUTSIDE_IP))
            .await;
        assert_eq!(by_role.0, StatusCode::FORBIDDEN);
        assert_eq!(by_role.0, by_network.0);
        assert_eq!(by_role.2, by_network.2);
    }

    #[tokio::test]
    async fn staff_routes_need_a_session_first() {
        let h = harness(false);
        let (status, _, _) = h
            .post("/api/staff/sessions/sweep", json!({}), None, Some(TRUSTED_IP))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn disabled_gate_lets_admins_in_from_anywhere() {
        let h = harness(false);
        let user = h.add_user("ada", Role::Member, false).await;
        h.add_user("root", Role::Admin, false).await;
        let admin_cookie = h.login("root").await;

        let mut request = Request::builder()
            .method("PUT")
            .uri(format!("/api/staff/users/{}/role", user.id))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::COOKIE, &admin_cookie)
            .header("x-forwarded-for", OUTSIDE_IP)
            .body(Body::from(json!({"role": "ADMIN"}).to_string()))
            .unwrap();
        let (status, _, body) = h.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "admin");

        request = Request::builder()
            .method("PUT")
            .uri(format!("/api/staff/users/{}/role", user.id))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::COOKIE, &admin_cookie)
            .body(Body::from(json!({"role": "superuser"}).to_string()))
            .unwrap();
        let (status, _, _) = h.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_always_clears_the_cookie() {
        let h = harness(false);
        h.add_user("ada", Role::Member, false).await;
        let cookie = h.login("ada").await;

        let (status, headers, _) = h.post("/api/auth/logout", json!({}), Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);
        let cleared = set_cookie_headers(&headers).join("\n");
        assert!(cleared.contains("session_id="));
        assert!(cleared.contains("Max-Age=0"));

        let (status, _, _) = h.get("/api/auth/me", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // No session at all, or a forged one: still success, still cleared.
        for cookie in [None, Some("session_id=forged")] {
            let (status, headers, _) = h.post("/api/auth/logout", json!({}), cookie, None).await;
            assert_eq!(status, StatusCode::OK);
            assert!(set_cookie_headers(&headers).join("\n").contains("Max-Age=0"));
        }
    }

    #[tokio::test]
    async fn expired_session_is_unauthenticated_and_cleared() {
        let h = harness(false);
        h.add_user("ada", Role::Member, false).await;
        let cookie = h.login("ada").await;

        h.clock.advance(chrono::Duration::hours(1));
        let (status, headers, body) = h.get("/api/auth/me", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Authentication required");
        assert!(set_cookie_headers(&headers).join("\n").contains("Max-Age=0"));
        assert_eq!(h.store.session_count(), 0);
    }

    #[tokio::test]
    async fn change_password_replaces_the_session() {
        let h = harness(false);
        h.add_user("ada", Role::Member, false).await;
        let old = h.login("ada").await;

        let (status, headers, _) = h
            .post(
                "/api/auth/change-password",
                json!({"current_password": PASSWORD, "new_password": "brand-new-secret"}),
                Some(&old),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let fresh = session_cookie(&headers).unwrap();

        assert_eq!(h.get("/api/auth/me", Some(&old), None).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(h.get("/api/auth/me", Some(&fresh), None).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn enrolling_a_second_factor_changes_the_login_flow() {
        let h = harness(false);
        h.add_user("ada", Role::Member, false).await;
        let cookie = h.login("ada").await;

        let (status, _, offer) = h.post("/api/auth/totp/enroll", json!({}), Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);
        let secret = totp_rs::Secret::Encoded(offer["secret_base32"].as_str().unwrap().to_string())
            .to_bytes()
            .unwrap();
        let code = TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, None, "user".to_string())
            .unwrap()
            .generate(h.clock.now().timestamp() as u64);

        let (status, _, _) = h
            .post("/api/auth/totp/confirm", json!({"code": code}), Some(&cookie), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = h
            .post(
                "/api/auth/login",
                json!({"identifier": "ada", "password": PASSWORD}),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "challenge_required");
    }

    #[tokio::test]
    async fn federated_login_is_not_found_without_a_provider() {
        let h = harness(false);
        let (status, _, _) = h
            .post("/api/auth/federated", json!({"assertion": "token"}), None, None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn network_status_reports_resolved_client() {
        let h = harness(true);
        let (status, _, body) = h.get("/api/network/status", None, Some(TRUSTED_IP)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["client_ip"], TRUSTED_IP);
        assert_eq!(body["in_trusted_network"], true);
        assert_eq!(body["enforced"], true);

        let (_, _, body) = h.get("/api/network/status", None, Some(OUTSIDE_IP)).await;
        assert_eq!(body["in_trusted_network"], false);
    }
}
