//! Request authentication
//!
//! One [`Authenticator`] is chosen at startup: bearer API tokens in
//! production, or a trusted `X-Test-Username` header in test mode.
//! [`RequireAuth`] runs it for every request in the wrapped scope and
//! stores the resulting [`AuthenticatedUser`] in the request extensions.

use crate::config::AuthConfig;
use crate::errors::ApiError;
use actix_web::{
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderMap, AUTHORIZATION},
    Error, FromRequest, HttpMessage, HttpRequest,
};
use async_trait::async_trait;
use bean_ledger::{types::validate_user_facing, Ledger};
use futures_util::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

pub const TEST_USERNAME_HEADER: &str = "X-Test-Username";

/// Identity material pulled from request headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub test_username: Option<String>,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let bearer = match headers.get(AUTHORIZATION) {
            Some(value) => {
                let raw = value.to_str().unwrap_or("");
                match raw.strip_prefix("Bearer ") {
                    Some(token) if !token.trim().is_empty() => Some(token.trim().to_string()),
                    _ => {
                        return Err(ApiError::Unauthorized(
                            "invalid authorization header format".to_string(),
                        ))
                    }
                }
            }
            None => None,
        };

        let test_username = headers
            .get(TEST_USERNAME_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        Ok(Self {
            bearer,
            test_username,
        })
    }
}

/// Resolves request credentials to a username
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String, ApiError>;

    fn name(&self) -> &'static str;
}

/// Production authenticator: `Authorization: Bearer <api token>`
pub struct BearerTokenAuthenticator {
    ledger: Ledger,
}

impl BearerTokenAuthenticator {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Authenticator for BearerTokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String, ApiError> {
        let token = credentials
            .bearer
            .as_deref()
            .ok_or_else(|| ApiError::Unauthorized("authorization header required".to_string()))?;

        let claims = self.ledger.validate_token(token).await?;
        Ok(claims.username)
    }

    fn name(&self) -> &'static str {
        "bearer-token"
    }
}

/// Test authenticator: trusts the `X-Test-Username` header as-is
pub struct TrustedHeaderAuthenticator;

#[async_trait]
impl Authenticator for TrustedHeaderAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String, ApiError> {
        let username = credentials.test_username.as_deref().ok_or_else(|| {
            ApiError::Unauthorized(format!("{} header required in test mode", TEST_USERNAME_HEADER))
        })?;

        validate_user_facing(username).map_err(|e| ApiError::Unauthorized(e.to_string()))?;
        Ok(username.to_string())
    }

    fn name(&self) -> &'static str {
        "trusted-header"
    }
}

/// Pick the authenticator for this process
pub fn authenticator_for(config: &AuthConfig, ledger: Ledger) -> Arc<dyn Authenticator> {
    if config.test_mode {
        warn!("TEST MODE: trusting {} without credentials", TEST_USERNAME_HEADER);
        Arc::new(TrustedHeaderAuthenticator)
    } else {
        Arc::new(BearerTokenAuthenticator::new(ledger))
    }
}

/// The caller, as resolved by [`RequireAuth`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub username: String,
    pub is_admin: bool,
}

impl FromRequest for AuthenticatedUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<AuthenticatedUser>()
                .cloned()
                .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string())),
        )
    }
}

/// An [`AuthenticatedUser`] on the configured admin list
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthenticatedUser);

impl FromRequest for AdminUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let user = match AuthenticatedUser::from_request(req, payload).into_inner() {
            Ok(user) => user,
            Err(e) => return ready(Err(e)),
        };

        if !user.is_admin {
            warn!("Non-admin {} refused on {}", user.username, req.path());
            return ready(Err(ApiError::Forbidden));
        }
        ready(Ok(AdminUser(user)))
    }
}

/// Authentication middleware
#[derive(Clone)]
pub struct RequireAuth {
    authenticator: Arc<dyn Authenticator>,
    auth: Arc<AuthConfig>,
}

impl RequireAuth {
    pub fn new(authenticator: Arc<dyn Authenticator>, config: &AuthConfig) -> Self {
        Self {
            authenticator,
            auth: Arc::new(config.clone()),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequireAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequireAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequireAuthMiddleware {
            service: Rc::new(service),
            authenticator: self.authenticator.clone(),
            auth: self.auth.clone(),
        }))
    }
}

pub struct RequireAuthMiddleware<S> {
    service: Rc<S>,
    authenticator: Arc<dyn Authenticator>,
    auth: Arc<AuthConfig>,
}

impl<S, B> Service<ServiceRequest> for RequireAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let credentials = match Credentials::from_headers(req.headers()) {
            Ok(credentials) => credentials,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        let service = self.service.clone();
        let authenticator = self.authenticator.clone();
        let auth = self.auth.clone();

        Box::pin(async move {
            let username = match authenticator.authenticate(&credentials).await {
                Ok(username) => username,
                Err(e) => {
                    warn!("{} authentication failed: {}", authenticator.name(), e);
                    return Err(e.into());
                }
            };

            debug!("Authenticated {} via {}", username, authenticator.name());
            let is_admin = auth.is_admin(&username);
            req.extensions_mut().insert(AuthenticatedUser { username, is_admin });

            service.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, web, App, HttpResponse};
    use bean_ledger::{Config, LedgerStore};
    use sqlx::postgres::PgPoolOptions;

    fn auth_config(test_mode: bool) -> AuthConfig {
        AuthConfig {
            admin_users: vec!["root".to_string()],
            test_mode,
        }
    }

    // Never connects: every path exercised here fails before reaching the store.
    fn offline_ledger() -> Ledger {
        let mut config = Config::default();
        config.signing.jwt_secret = "unit-test-secret".into();
        config.signing.export_key = "unit-test-export".into();
        let pool = PgPoolOptions::new()
            .connect_lazy(&config.database.url)
            .unwrap();
        Ledger::with_store(LedgerStore::from_pool(pool), config)
    }

    async fn whoami(user: AuthenticatedUser) -> HttpResponse {
        HttpResponse::Ok().json(user)
    }

    async fn admin_only(admin: AdminUser) -> HttpResponse {
        HttpResponse::Ok().body(admin.0.username)
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                actix_web::http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                actix_web::http::header::HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[::core::prelude::v1::test]
    fn test_credentials_from_headers() {
        let creds = Credentials::from_headers(&headers(&[("Authorization", "Bearer abc.def")])).unwrap();
        assert_eq!(creds.bearer.as_deref(), Some("abc.def"));
        assert_eq!(creds.test_username, None);

        let creds = Credentials::from_headers(&headers(&[(TEST_USERNAME_HEADER, " alice ")])).unwrap();
        assert_eq!(creds.test_username.as_deref(), Some("alice"));

        assert!(Credentials::from_headers(&headers(&[("Authorization", "Basic xyz")])).is_err());
        assert!(Credentials::from_headers(&headers(&[("Authorization", "Bearer ")])).is_err());
        assert_eq!(Credentials::from_headers(&HeaderMap::new()).unwrap(), Credentials::default());
    }

    #[actix_web::test]
    async fn test_trusted_header_authenticator() {
        let auth = TrustedHeaderAuthenticator;
        let creds = Credentials {
            bearer: None,
            test_username: Some("alice".into()),
        };
        assert_eq!(auth.authenticate(&creds).await.unwrap(), "alice");

        assert!(auth.authenticate(&Credentials::default()).await.is_err());

        let system = Credentials {
            bearer: None,
            test_username: Some("system".into()),
        };
        assert!(auth.authenticate(&system).await.is_err());
    }

    #[actix_web::test]
    async fn test_bearer_authenticator_rejects_before_store() {
        let auth = BearerTokenAuthenticator::new(offline_ledger());

        let err = auth.authenticate(&Credentials::default()).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let forged = Credentials {
            bearer: Some("not.a.token".into()),
            test_username: Some("alice".into()),
        };
        let err = auth.authenticate(&forged).await.unwrap_err();
        assert!(matches!(err, ApiError::Ledger(bean_ledger::LedgerError::InvalidToken)));
    }

    #[actix_web::test]
    async fn test_middleware_test_mode() {
        let config = auth_config(true);
        let authenticator = authenticator_for(&config, offline_ledger());
        assert_eq!(authenticator.name(), "trusted-header");

        let app = test::init_service(
            App::new().service(
                web::scope("/api")
                    .wrap(RequireAuth::new(authenticator, &config))
                    .route("/me", web::get().to(whoami))
                    .route("/admin", web::get().to(admin_only)),
            ),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/me")
            .insert_header((TEST_USERNAME_HEADER, "alice"))
            .to_request();
        let user: AuthenticatedUser = test::call_and_read_body_json(&app, req).await;
        assert_eq!(
            user,
            AuthenticatedUser {
                username: "alice".into(),
                is_admin: false
            }
        );

        let req = test::TestRequest::get()
            .uri("/api/admin")
            .insert_header((TEST_USERNAME_HEADER, "alice"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::get()
            .uri("/api/admin")
            .insert_header((TEST_USERNAME_HEADER, "root"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/api/me").to_request();
        let resp = test::try_call_service(&app, req).await;
        let err = resp.err().expect("missing header must be rejected");
        assert_eq!(err.as_response_error().status_code(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_middleware_production_ignores_test_header() {
        let config = auth_config(false);
        let authenticator = authenticator_for(&config, offline_ledger());
        assert_eq!(authenticator.name(), "bearer-token");

        let app = test::init_service(
            App::new().service(
                web::scope("/api")
                    .wrap(RequireAuth::new(authenticator, &config))
                    .route("/me", web::get().to(whoami)),
            ),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/me")
            .insert_header((TEST_USERNAME_HEADER, "root"))
            .to_request();
        let err = test::try_call_service(&app, req)
            .await
            .err()
            .expect("test header must not authenticate in production");
        assert_eq!(err.as_response_error().status_code(), StatusCode::UNAUTHORIZED);
    }
}
