//! Response-writing helpers shared by the dispatcher and the policy plugins (spec §4.2,
//! §4.5-§4.11): every plugin that short-circuits a request builds its final response
//! through `ResponseBuilder` rather than poking `ResponseHeader` fields ad hoc.

use bytes::Bytes;
use http::{header, StatusCode};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
}

/// Response builder for plugin short-circuit responses
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Build a proxy ResponseHeader for plugins
    pub fn build_proxy_response(
        status: StatusCode,
        message: Option<&str>,
        headers: Option<&[(String, String)]>,
    ) -> Result<ResponseHeader> {
        let mut resp = ResponseHeader::build(status, None)?;

        if let Some(msg) = message {
            resp.insert_header(header::CONTENT_LENGTH, msg.len().to_string())?;
            resp.insert_header(header::CONTENT_TYPE, content_type::TEXT_PLAIN)?;
        }

        if let Some(hdrs) = headers {
            for (name, value) in hdrs {
                resp.insert_header(name.clone(), value.clone())?;
            }
        }

        Ok(resp)
    }

    /// Send a proxy error response for plugins. `headers` carries any extra response
    /// headers to layer on - most notably a route's CORS headers (spec §4.10), which must
    /// apply to this response regardless of which plugin produced it.
    pub async fn send_proxy_error(
        session: &mut Session,
        status: StatusCode,
        message: Option<&str>,
        headers: Option<&[(String, String)]>,
    ) -> Result<()> {
        let resp = Self::build_proxy_response(status, message, headers)?;
        session
            .write_response_header(Box::new(resp), message.is_none())
            .await?;

        if let Some(msg) = message {
            session
                .write_response_body(Some(Bytes::copy_from_slice(msg.as_bytes())), true)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_proxy_response_sets_length_and_type() {
        let resp = ResponseBuilder::build_proxy_response(
            StatusCode::FORBIDDEN,
            Some("blocked"),
            Some(&[("x-reason".to_string(), "ip-denied".to_string())]),
        )
        .unwrap();
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
        assert_eq!(
            resp.headers.get(header::CONTENT_LENGTH).unwrap(),
            "7"
        );
        assert_eq!(resp.headers.get("x-reason").unwrap(), "ip-denied");
    }
}
