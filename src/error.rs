use actix_web::body::{BoxBody, EitherBody};
use actix_web::dev::ServiceResponse;
use actix_web::http::header::{self, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::middleware::ErrorHandlerResponse;
use actix_web::{web, HttpResponse, ResponseError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};
use validator::{ValidationErrors, ValidationErrorsKind};

use crate::envelope::Envelope;
use crate::store::StoreError;

const GENERIC_INTERNAL: &str = "Something went wrong, please try again later";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Too many requests, please try again later")]
    TooManyRequests,

    #[error(transparent)]
    Store(StoreError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ApiError::Validation(vec![FieldError {
            field: field.to_owned(),
            message: message.into(),
        }])
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Duplicate => {
                ApiError::Conflict("A record with the same unique value already exists".into())
            }
            StoreError::UnknownColumn { .. } => ApiError::BadRequest(error.to_string()),
            other => ApiError::Store(other),
        }
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        let mut fields = Vec::new();
        flatten("", &errors, &mut fields);
        fields.sort_by(|a, b| a.field.cmp(&b.field));
        ApiError::Validation(fields)
    }
}

/// Rust field names back to the camelCase the API speaks.
fn camel(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn flatten(prefix: &str, errors: &ValidationErrors, out: &mut Vec<FieldError>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            camel(field)
        } else {
            format!("{prefix}.{}", camel(field))
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                for e in list {
                    let message = e
                        .message
                        .as_ref()
                        .map_or_else(|| format!("{path} is invalid"), ToString::to_string);
                    out.push(FieldError {
                        field: path.clone(),
                        message,
                    });
                }
            }
            ValidationErrorsKind::Struct(inner) => flatten(&path, inner, out),
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    flatten(&format!("{path}[{index}]"), inner, out);
                }
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = match self {
            ApiError::Validation(fields) => json!({
                "success": false,
                "message": self.to_string(),
                "errors": fields,
            }),
            _ => json!({
                "success": false,
                "message": self.to_string(),
            }),
        };
        HttpResponse::build(status).json(body)
    }
}

/// Malformed JSON bodies answer with the envelope instead of actix's plain text.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        warn!(error = %err, "rejected request body");
        ApiError::BadRequest(format!("Invalid request body: {err}")).into()
    })
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| {
        warn!(error = %err, "rejected query string");
        ApiError::BadRequest(format!("Invalid query parameters: {err}")).into()
    })
}

/// Non-numeric ids can never match a row.
pub fn path_config() -> web::PathConfig {
    web::PathConfig::default().error_handler(|_err, _req| ApiError::NotFound("Resource").into())
}

/// Replaces the body of every 500 with a generic message so internal error
/// text never reaches clients in production.
pub fn redact_internal<B>(
    res: ServiceResponse<B>,
) -> actix_web::Result<ErrorHandlerResponse<B>> {
    let (req, mut res) = res.into_parts();
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    let body = serde_json::to_string(&Envelope::failure(GENERIC_INTERNAL))?;
    let res = res.set_body(body);
    let res: ServiceResponse<EitherBody<B, BoxBody>> = ServiceResponse::new(req, res)
        .map_into_boxed_body()
        .map_into_right_body();
    Ok(ErrorHandlerResponse::Response(res))
}

#[cfg(test)]
mod tests {
    use actix_web::middleware::ErrorHandlers;
    use actix_web::{test, App};
    use serde_json::Value;
    use validator::Validate;

    use super::*;
    use crate::models::PlaceOrderRequest;

    async fn leak() -> Result<HttpResponse, ApiError> {
        Err(ApiError::Internal("disk /var/lib/secret is full".into()))
    }

    #[actix_web::test]
    async fn internal_errors_are_redacted_when_enabled() {
        let app = test::init_service(
            App::new()
                .wrap(ErrorHandlers::new().handler(StatusCode::INTERNAL_SERVER_ERROR, redact_internal))
                .route("/", web::get().to(leak)),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], GENERIC_INTERNAL);
    }

    #[actix_web::test]
    async fn internal_errors_keep_detail_without_redaction() {
        let app = test::init_service(App::new().route("/", web::get().to(leak))).await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["message"], "disk /var/lib/secret is full");
    }

    #[actix_web::test]
    async fn duplicate_maps_to_conflict() {
        let error = ApiError::from(StoreError::Duplicate);
        assert_eq!(error.status_code(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn nested_validation_errors_use_api_field_paths() {
        let request: PlaceOrderRequest = serde_json::from_value(serde_json::json!({
            "items": [{"productId": 1, "quantity": 0}],
            "shippingAddress": {
                "fullName": "", "phone": "0712345678", "street": "Moi Ave",
                "city": "Nairobi", "country": "Kenya"
            },
            "paymentMethod": "mpesa"
        }))
        .unwrap();

        let ApiError::Validation(fields) = ApiError::from(request.validate().unwrap_err()) else {
            panic!("expected a validation error");
        };
        let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, ["items[0].quantity", "shippingAddress.fullName"]);
        assert_eq!(fields[1].message, "Full name is required");
    }
}
