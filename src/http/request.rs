//! Request handling and transformation.
//!
//! # Responsibilities
//! - Buffer the client body (bounded) so it can be replayed on retry
//! - Strip hop-by-hop headers and add forwarding headers
//! - Build one upstream request per attempt, addressed to the chosen backend
//!
//! # Design Decisions
//! - Origin-form URI and `Host` set to the backend authority
//! - Upstream requests are always HTTP/1.1
//! - Original host preserved in X-Forwarded-Host

use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap};
use axum::http::uri::PathAndQuery;
use axum::http::{Method, Request, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::load_balancer::backend::Backend;
use crate::security::headers::{add_forwarded, strip_hop_by_hop};

/// Why a client request could not be turned into an upstream request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Body(String),
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = match self {
            RequestError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RequestError::Body(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// A client request prepared for (possibly repeated) forwarding.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path_and_query: PathAndQuery,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    /// Read and sanitize a client request.
    pub async fn from_client(
        request: Request<Body>,
        client: SocketAddr,
        max_body_size: usize,
    ) -> Result<Self, RequestError> {
        let (parts, body) = request.into_parts();

        let too_large = RequestError::BodyTooLarge { limit: max_body_size };
        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > max_body_size) {
            return Err(too_large);
        }

        let body = match Limited::new(body, max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => return Err(too_large),
            Err(e) => return Err(RequestError::Body(e.to_string())),
        };

        let mut headers = parts.headers;
        let original_host = headers.get(header::HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| a.as_str().parse().ok())
        });
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::EXPECT);
        add_forwarded(&mut headers, client.ip(), original_host);

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        Ok(Self {
            method: parts.method,
            path_and_query,
            headers,
            body,
        })
    }

    /// Build the request for one attempt against `backend`.
    pub fn to_request(&self, backend: &Backend) -> Result<Request<Body>, axum::http::Error> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.path_and_query.as_str())
            .version(Version::HTTP_11)
            .header(header::HOST, backend.authority.as_str());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers.clone());
        }
        builder.body(Body::from(self.body.clone()))
    }
}
