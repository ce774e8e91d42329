use std::rc::Rc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::{header, Method};
use actix_web::{web, Error, FromRequest, HttpMessage, HttpRequest, HttpResponse};
use bcrypt::{hash, verify};
use chrono::{Duration, Utc};
use futures_util::future::{ok, ready, LocalBoxFuture, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::config::AdminSeed;
use crate::envelope::Envelope;
use crate::error::ApiError;
use crate::models::{PublicUser, Role, User};
use crate::services::users;
use crate::store::Db;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 2, max = 50, message = "Name must be between 2 and 50 characters"))]
    pub name: String,
    #[validate(email(message = "A valid email is required"))]
    pub email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    pub password: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub refresh_token: String,
    pub user: PublicUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Handlers behind [`RequireAuth`] take the verified claims as an argument.
impl FromRequest for Claims {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Claims>()
                .cloned()
                .ok_or_else(|| ApiError::Unauthorized("Authentication required".into())),
        )
    }
}

/// Signing keys and hashing cost, built once from configuration.
pub struct Auth {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    bcrypt_cost: u32,
}

impl Auth {
    pub fn new(secret: &str, bcrypt_cost: u32) -> Self {
        let refresh_secret = format!("{secret}:refresh");
        Self {
            access_encoding: EncodingKey::from_secret(secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(refresh_secret.as_bytes()),
            bcrypt_cost,
        }
    }

    /// Access token (2 hours) and refresh token (7 days).
    pub fn generate_tokens(&self, user: &User) -> Result<(String, String), ApiError> {
        let now = Utc::now();
        let claims = |ttl: Duration| Claims {
            sub: user.id,
            role: user.role,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(&Header::default(), &claims(Duration::hours(2)), &self.access_encoding)
            .map_err(|e| ApiError::Internal(format!("Token generation failed: {e}")))?;
        let refresh_token = encode(
            &Header::default(),
            &claims(Duration::days(7)),
            &self.refresh_encoding,
        )
        .map_err(|e| ApiError::Internal(format!("Refresh token generation failed: {e}")))?;

        Ok((token, refresh_token))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.access_decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "rejected access token");
                ApiError::Unauthorized("Invalid or expired token".into())
            })
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.refresh_decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "rejected refresh token");
                ApiError::Unauthorized("Invalid refresh token".into())
            })
    }

    /// bcrypt is deliberately slow, so it runs on the blocking pool.
    pub async fn hash_password(&self, password: String) -> Result<String, ApiError> {
        let cost = self.bcrypt_cost;
        web::block(move || hash(password, cost))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(|e| ApiError::Internal(format!("Password hashing failed: {e}")))
    }

    pub async fn verify_password(&self, password: String, hashed: String) -> Result<bool, ApiError> {
        web::block(move || verify(password, &hashed))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(|e| ApiError::Internal(format!("Password verification failed: {e}")))
    }

    fn respond(&self, user: User) -> Result<AuthResponse, ApiError> {
        let (token, refresh_token) = self.generate_tokens(&user)?;
        Ok(AuthResponse {
            token,
            refresh_token,
            user: user.into(),
        })
    }
}

pub async fn register(
    db: web::Data<Db>,
    auth: web::Data<Auth>,
    body: web::Json<RegisterRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    body.validate()?;

    if users::find_by_email(&db, &body.email).await?.is_some() {
        return Err(ApiError::Conflict("Email already registered".into()));
    }

    let password_hash = auth.hash_password(body.password).await?;
    let mut user = users::create(&db, &body.name, &body.email, password_hash, Role::User).await?;
    if let Some(phone) = body.phone.filter(|p| !p.trim().is_empty()) {
        users::set_phone(&db, user.id, &phone).await?;
        user.phone = Some(phone.trim().to_owned());
    }

    info!(id = user.id, "user registered");
    Ok(HttpResponse::Created().json(
        Envelope::ok(auth.respond(user)?).with_message("User registered successfully"),
    ))
}

pub async fn login(
    db: web::Data<Db>,
    auth: web::Data<Auth>,
    credentials: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let credentials = credentials.into_inner();
    let invalid = || ApiError::Unauthorized("Invalid credentials".into());

    let user = users::find_by_email(&db, &credentials.email)
        .await?
        .ok_or_else(invalid)?;
    if !auth
        .verify_password(credentials.password, user.password.clone())
        .await?
    {
        warn!(id = user.id, "failed login");
        return Err(invalid());
    }
    if !user.is_active {
        return Err(ApiError::Unauthorized("Account is deactivated".into()));
    }

    info!(id = user.id, "user logged in");
    Ok(HttpResponse::Ok().json(Envelope::ok(auth.respond(user)?)))
}

pub async fn refresh_token(
    db: web::Data<Db>,
    auth: web::Data<Auth>,
    body: web::Json<RefreshTokenRequest>,
) -> Result<HttpResponse, ApiError> {
    let claims = auth.verify_refresh_token(&body.refresh_token)?;
    let user = users::find(&db, claims.sub)
        .await
        .map_err(|_| ApiError::Unauthorized("Invalid refresh token".into()))?;
    if !user.is_active {
        return Err(ApiError::Unauthorized("Account is deactivated".into()));
    }

    Ok(HttpResponse::Ok().json(Envelope::ok(auth.respond(user)?)))
}

/// Creates the configured admin account unless that email is already taken.
pub async fn ensure_admin(db: &Db, auth: &Auth, seed: &AdminSeed) -> Result<bool, ApiError> {
    if users::find_by_email(db, &seed.email).await?.is_some() {
        debug!(email = %seed.email, "admin account already present");
        return Ok(false);
    }
    let password_hash = auth.hash_password(seed.password.clone()).await?;
    let admin = users::create(db, &seed.name, &seed.email, password_hash, Role::Admin).await?;
    info!(id = admin.id, email = %admin.email, "bootstrapped admin account");
    Ok(true)
}

fn bearer(req: &ServiceRequest) -> Result<&str, ApiError> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("No authorization header".into()))?
        .to_str()
        .map_err(|_| ApiError::Unauthorized("Invalid authorization header".into()))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("Invalid authorization header format".into()))
}

/// Rejects requests without a valid access token (401) and, for admin
/// scopes, tokens that do not carry the admin role (403). Verified claims are
/// stored in the request extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireAuth {
    admin: bool,
    public_reads: bool,
}

impl RequireAuth {
    pub fn user() -> Self {
        Self::default()
    }

    pub fn admin() -> Self {
        Self {
            admin: true,
            public_reads: false,
        }
    }

    /// Safe methods pass without a token; everything else needs an admin.
    pub fn admin_writes() -> Self {
        Self {
            admin: true,
            public_reads: true,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequireAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RequireAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RequireAuthMiddleware {
            service: Rc::new(service),
            rule: *self,
        })
    }
}

pub struct RequireAuthMiddleware<S> {
    service: Rc<S>,
    rule: RequireAuth,
}

impl<S, B> Service<ServiceRequest> for RequireAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let safe = matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS);
        if self.rule.public_reads && safe {
            let fut = self.service.call(req);
            return Box::pin(async move { Ok(fut.await?.map_into_left_body()) });
        }

        let service = Rc::clone(&self.service);
        let admin = self.rule.admin;
        Box::pin(async move {
            let authorized = authorize(&req, admin).await;
            match authorized {
                Ok(claims) => {
                    req.extensions_mut().insert(claims);
                    Ok(service.call(req).await?.map_into_left_body())
                }
                Err(e) => Ok(req.error_response(e).map_into_right_body()),
            }
        })
    }
}

/// Role and active flag are read from the store, not the token, so a
/// demotion or deactivation applies to tokens already issued.
async fn authorize(req: &ServiceRequest, admin: bool) -> Result<Claims, ApiError> {
    let (Some(auth), Some(db)) = (
        req.app_data::<web::Data<Auth>>(),
        req.app_data::<web::Data<Db>>(),
    ) else {
        return Err(ApiError::Internal("authentication is not configured".into()));
    };
    let mut claims = auth.verify_token(bearer(req)?)?;

    let user = match users::find(db, claims.sub).await {
        Ok(user) => user,
        Err(ApiError::NotFound(_)) => {
            return Err(ApiError::Unauthorized("Account no longer exists".into()))
        }
        Err(e) => return Err(e),
    };
    if !user.is_active {
        return Err(ApiError::Unauthorized("Account is deactivated".into()));
    }
    claims.role = user.role;

    if admin && !claims.is_admin() {
        warn!(user = claims.sub, path = %req.path(), "non-admin reached an admin route");
        return Err(ApiError::Forbidden("Admin access required".into()));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use actix_cors::Cors;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::{json, Value};

    use super::*;
    use crate::store::Table;
    use crate::testing::memory_db;

    const SECRET: &str = "test-secret";

    fn user(id: i64, role: Role) -> User {
        serde_json::from_value(json!({
            "id": id, "name": "Test", "email": "t@example.com", "password": "x",
            "role": role, "isActive": true,
            "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    async fn whoami(claims: Claims) -> HttpResponse {
        HttpResponse::Ok().json(json!({ "sub": claims.sub }))
    }

    #[actix_web::test]
    async fn tokens_carry_id_and_role() {
        let auth = Auth::new(SECRET, 4);
        let (token, refresh) = auth.generate_tokens(&user(7, Role::Admin)).unwrap();

        let claims = auth.verify_token(&token).unwrap();
        assert_eq!(claims.sub, 7);
        assert!(claims.is_admin());

        assert!(auth.verify_token(&refresh).is_err());
        assert_eq!(auth.verify_refresh_token(&refresh).unwrap().sub, 7);
        assert!(Auth::new("other", 4).verify_token(&token).is_err());
    }

    struct Guarded {
        db: Db,
        auth: web::Data<Auth>,
        user_id: i64,
        admin_id: i64,
    }

    async fn guarded() -> Guarded {
        let db = memory_db().await;
        let user = users::create(&db, "Wanjiru", "wanjiru@example.com", "x".into(), Role::User)
            .await
            .unwrap();
        let admin = users::create(&db, "Otieno", "otieno@example.com", "x".into(), Role::Admin)
            .await
            .unwrap();
        Guarded {
            db,
            auth: web::Data::new(Auth::new(SECRET, 4)),
            user_id: user.id,
            admin_id: admin.id,
        }
    }

    impl Guarded {
        fn token(&self, id: i64, role: Role) -> String {
            self.auth.generate_tokens(&user(id, role)).unwrap().0
        }
    }

    macro_rules! guarded_app {
        ($g:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($g.db.clone()))
                    .app_data($g.auth.clone())
                    .service(
                        web::scope("/admin")
                            .wrap(RequireAuth::admin())
                            .route("", web::get().to(whoami)),
                    )
                    .service(
                        web::scope("/products")
                            .wrap(RequireAuth::admin_writes())
                            .route("", web::get().to(|| async { HttpResponse::Ok().finish() }))
                            .route("", web::post().to(whoami)),
                    ),
            )
            .await
        };
    }

    fn get(uri: &str, token: Option<&str>) -> test::TestRequest {
        let req = test::TestRequest::get().uri(uri);
        match token {
            Some(token) => req.insert_header((header::AUTHORIZATION, format!("Bearer {token}"))),
            None => req,
        }
    }

    #[actix_web::test]
    async fn middleware_enforces_token_and_role() {
        let g = guarded().await;
        let user_token = g.token(g.user_id, Role::User);
        let admin_token = g.token(g.admin_id, Role::Admin);
        let app = guarded_app!(g);

        let res = test::call_service(&app, get("/admin", None).to_request()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["message"], "No authorization header");

        let res = test::call_service(&app, get("/admin", Some("garbage")).to_request()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = test::call_service(&app, get("/admin", Some(&user_token)).to_request()).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["success"], false);

        let res = test::call_service(&app, get("/admin", Some(&admin_token)).to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["sub"], g.admin_id);

        let res = test::call_service(&app, get("/products", None).to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri("/products")
            .insert_header((header::AUTHORIZATION, format!("Bearer {user_token}")))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn stored_role_and_active_flag_override_the_token() {
        let g = guarded().await;
        // Token minted while the user was an admin.
        let stale_admin = g.token(g.user_id, Role::Admin);
        let admin_token = g.token(g.admin_id, Role::Admin);
        let ghost = g.token(999, Role::Admin);
        let app = guarded_app!(g);

        let res = test::call_service(&app, get("/admin", Some(&stale_admin)).to_request()).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = test::call_service(&app, get("/admin", Some(&ghost)).to_request()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let mut changes = crate::store::Row::new();
        changes.insert("isActive".into(), json!(false));
        g.db.update(Table::Users, g.admin_id, changes).await.unwrap();

        let res = test::call_service(&app, get("/admin", Some(&admin_token)).to_request()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["message"], "Account is deactivated");
    }

    #[actix_web::test]
    async fn rejections_still_carry_cors_headers() {
        let g = guarded().await;
        let user_token = g.token(g.user_id, Role::User);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(g.db.clone()))
                .app_data(g.auth.clone())
                .wrap(Cors::default().allowed_origin("http://localhost:3000"))
                .service(
                    web::scope("/products")
                        .wrap(RequireAuth::admin_writes())
                        .route("", web::post().to(whoami)),
                ),
        )
        .await;

        for token in [None, Some(user_token.as_str())] {
            let mut req = test::TestRequest::post()
                .uri("/products")
                .insert_header((header::ORIGIN, "http://localhost:3000"));
            if let Some(token) = token {
                req = req.insert_header((header::AUTHORIZATION, format!("Bearer {token}")));
            }
            let res = test::call_service(&app, req.to_request()).await;
            assert!(res.status().is_client_error());
            assert_eq!(
                res.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
                "http://localhost:3000"
            );
        }
    }

    #[actix_web::test]
    async fn register_login_and_refresh() {
        let db = web::Data::new(memory_db().await);
        let auth = web::Data::new(Auth::new(SECRET, 4));
        let app = test::init_service(
            App::new()
                .app_data(db.clone())
                .app_data(auth.clone())
                .route("/register", web::post().to(register))
                .route("/login", web::post().to(login))
                .route("/refresh", web::post().to(refresh_token)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/register")
            .set_json(json!({"name": "Njeri", "email": "Njeri@Example.com", "password": "hunter22"}))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["data"]["user"]["email"], "njeri@example.com");
        assert!(body["data"]["user"].get("password").is_none());

        let stored = users::find_by_email(&db, "njeri@example.com").await.unwrap().unwrap();
        assert_ne!(stored.password, "hunter22");

        let req = test::TestRequest::post()
            .uri("/register")
            .set_json(json!({"name": "Njeri", "email": "njeri@example.com", "password": "hunter22"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post()
            .uri("/login")
            .set_json(json!({"email": "njeri@example.com", "password": "wrong"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/login")
            .set_json(json!({"email": "njeri@example.com", "password": "hunter22"}))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = test::read_body_json(res).await;
        let refresh = body["data"]["refreshToken"].as_str().unwrap().to_owned();

        let req = test::TestRequest::post()
            .uri("/refresh")
            .set_json(json!({ "refreshToken": refresh }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["data"]["user"]["role"], "user");
    }

    #[actix_web::test]
    async fn invalid_registration_lists_fields() {
        let db = web::Data::new(memory_db().await);
        let auth = web::Data::new(Auth::new(SECRET, 4));
        let app = test::init_service(
            App::new()
                .app_data(db)
                .app_data(auth)
                .route("/register", web::post().to(register)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/register")
            .set_json(json!({"name": "N", "email": "not-an-email", "password": "123"}))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(res).await;
        let fields: Vec<_> = body["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["field"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(fields, ["email", "name", "password"]);
    }

    #[actix_web::test]
    async fn admin_bootstrap_runs_once() {
        let db = memory_db().await;
        let auth = Auth::new(SECRET, 4);
        let seed = AdminSeed {
            name: "Admin".into(),
            email: "admin@example.com".into(),
            password: "changeme123".into(),
        };

        assert!(ensure_admin(&db, &auth, &seed).await.unwrap());
        assert!(!ensure_admin(&db, &auth, &seed).await.unwrap());

        let admin = users::find_by_email(&db, &seed.email).await.unwrap().unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(auth
            .verify_password(seed.password.clone(), admin.password)
            .await
            .unwrap());
    }
}
