//! Per-client request throttling.
//!
//! The limiter is created once at startup and shared by every worker. Its
//! state lives in memory only and starts empty after a restart.

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{self, HeaderValue};
use actix_web::{Error, ResponseError};
use futures_util::future::{ok, LocalBoxFuture, Ready};
use governor::clock::Clock;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::{debug, warn};

use crate::error::ApiError;

pub type Limiter = DefaultKeyedRateLimiter<IpAddr>;

/// `max` requests per `window` for each client address.
pub fn limiter(window: Duration, max: u32) -> Option<Arc<Limiter>> {
    let burst = NonZeroU32::new(max)?;
    let quota = Quota::with_period(window / burst.get())?.allow_burst(burst);
    Some(Arc::new(RateLimiter::keyed(quota)))
}

/// Drops clients whose buckets have fully refilled so the key map does not
/// grow without bound.
pub async fn sweep(limiter: Arc<Limiter>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let before = limiter.len();
        limiter.retain_recent();
        limiter.shrink_to_fit();
        debug!(before, after = limiter.len(), "swept rate limiter keys");
    }
}

#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<Limiter>,
}

impl RateLimit {
    pub fn new(limiter: Arc<Limiter>) -> Self {
        Self { limiter }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimitMiddleware {
            service,
            limiter: self.limiter.clone(),
        })
    }
}

pub struct RateLimitMiddleware<S> {
    service: S,
    limiter: Arc<Limiter>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddleware<S>
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
        let client = req
            .peer_addr()
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |addr| addr.ip());

        if let Err(not_until) = self.limiter.check_key(&client) {
            let wait = not_until.wait_time_from(self.limiter.clock().now());
            warn!(%client, path = %req.path(), retry_after = wait.as_secs(), "rate limit exceeded");

            let mut response = ApiError::TooManyRequests.error_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(wait.as_secs().max(1)));
            let response = req.into_response(response).map_into_right_body();
            return Box::pin(async move { Ok(response) });
        }

        let fut = self.service.call(req);
        Box::pin(async move { Ok(fut.await?.map_into_left_body()) })
    }
}
