//! Gateway-specific error taxonomy.
//!
//! The dispatcher and plugins all return `pingora_error::Result<T>`, the same as the rest
//! of the proxy stack, but the gateway needs to distinguish a handful of outcomes that
//! `pingora_error::ErrorType` doesn't model on its own (route miss vs. plugin denial vs.
//! upstream failure). `ProxyError` carries that distinction and knows how to turn itself
//! into both a `pingora_error::Error` (for phases that must return `Result<_>`) and an HTTP
//! response (for phases that write directly to the session).

use bytes::Bytes;
use http::{header, StatusCode};
use pingora_error::{Error, ErrorType, Result};
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use serde::Serialize;

/// The error kinds a request can fail with inside the gateway core.
#[derive(Debug, Clone)]
pub enum ProxyError {
    /// The active configuration snapshot could not be built or validated.
    ConfigInvalid(String),
    /// No route matched the incoming request.
    RouteMiss,
    /// A plugin in the chain denied the request.
    PluginDenied { status: u16, message: String },
    /// No upstream peer could be constructed for the matched route.
    UpstreamUnavailable(String),
    /// The upstream connection failed or returned a transport-level error.
    UpstreamError(String),
    /// Anything else: a bug, a panic boundary, an invariant violation.
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::RouteMiss => StatusCode::NOT_FOUND,
            ProxyError::PluginDenied { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::FORBIDDEN)
            }
            ProxyError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProxyError::ConfigInvalid(msg) => msg.clone(),
            ProxyError::RouteMiss => "no route matched this request".to_string(),
            ProxyError::PluginDenied { message, .. } => message.clone(),
            ProxyError::UpstreamUnavailable(msg) => msg.clone(),
            ProxyError::UpstreamError(msg) => msg.clone(),
            ProxyError::Internal(msg) => msg.clone(),
        }
    }

    /// JSON error body shape sent to the downstream client.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind_name(),
            message: self.message(),
        }
    }

    /// Writes this error directly to the session as the structured JSON body spec §7
    /// prescribes, bypassing pingora's own default error rendering. Used by dispatcher-level
    /// failures that are known before (or instead of) an upstream call: route miss, an
    /// unhandled plugin error, a denied-by-policy short-circuit that wants the JSON shape.
    pub async fn write_to(&self, session: &mut Session) -> Result<()> {
        self.write_to_with_headers(session, None).await
    }

    /// Same as `write_to`, additionally layering on `extra_headers` - used so a route's CORS
    /// plugin (spec §4.10) can decorate this response even though it is written by the
    /// dispatcher or by a different, earlier-ordered plugin rather than by CORS itself.
    pub async fn write_to_with_headers(
        &self,
        session: &mut Session,
        extra_headers: Option<&[(String, String)]>,
    ) -> Result<()> {
        let body = serde_json::to_vec(&self.body()).unwrap_or_default();
        let mut resp = ResponseHeader::build(self.status(), None)?;
        resp.insert_header(header::CONTENT_TYPE, "application/json")?;
        resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
        if let Some(headers) = extra_headers {
            for (name, value) in headers {
                resp.insert_header(name.clone(), value.clone())?;
            }
        }
        session.write_response_header(Box::new(resp), false).await?;
        session
            .write_response_body(Some(Bytes::from(body)), true)
            .await?;
        Ok(())
    }

    fn kind_name(&self) -> &'static str {
        match self {
            ProxyError::ConfigInvalid(_) => "config_invalid",
            ProxyError::RouteMiss => "route_miss",
            ProxyError::PluginDenied { .. } => "plugin_denied",
            ProxyError::UpstreamUnavailable(_) => "upstream_unavailable",
            ProxyError::UpstreamError(_) => "upstream_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind_name(), self.message())
    }
}

impl std::error::Error for ProxyError {}

impl From<ProxyError> for Box<Error> {
    fn from(err: ProxyError) -> Self {
        let error_type = match &err {
            ProxyError::ConfigInvalid(_) => ErrorType::InternalError,
            ProxyError::RouteMiss => ErrorType::HTTPStatus(404),
            ProxyError::PluginDenied { status, .. } => ErrorType::HTTPStatus(*status),
            ProxyError::UpstreamUnavailable(_) => ErrorType::ConnectNoRoute,
            ProxyError::UpstreamError(_) => ErrorType::InternalError,
            ProxyError::Internal(_) => ErrorType::InternalError,
        };
        Error::because(error_type, err.message(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_denied_carries_its_own_status() {
        let err = ProxyError::PluginDenied {
            status: 429,
            message: "rate limited".to_string(),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.body().error, "plugin_denied");
    }

    #[test]
    fn route_miss_is_404() {
        assert_eq!(ProxyError::RouteMiss.status(), StatusCode::NOT_FOUND);
    }
}
