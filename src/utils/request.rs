use http::HeaderName;
use once_cell::sync::Lazy;
use pingora_http::RequestHeader;
use pingora_proxy::Session;

/// Extracts the value of a specific query parameter from the request URI.
///
/// Returns the first occurrence of the parameter's value.
pub fn get_query_value<'a>(req_header: &'a RequestHeader, name: &str) -> Option<&'a str> {
    req_header.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            if let Some((k, v)) = pair.split_once('=') {
                if k == name {
                    Some(v.trim()) // Trim whitespace from value
                } else {
                    None
                }
            } else if pair == name {
                // Handle key-only parameters if needed? Usually not.
                Some("") // Or None, depending on desired behavior for key-only params
            } else {
                None
            }
        })
    })
}

/// Retrieves the value of a specific header from the request.
///
/// Returns `None` if the header is not present or its value is not valid UTF-8.
pub fn get_req_header_value<'a>(req_header: &'a RequestHeader, key: &str) -> Option<&'a str> {
    req_header
        .headers
        .get(key)
        .and_then(|value| value.to_str().ok())
}

/// Retrieves the request host (domain name) from the request header.
///
/// Prefers the host from the URI, falls back to the `Host` header.
/// Removes the port number if present in the `Host` header.
pub fn get_request_host(header: &RequestHeader) -> Option<&str> {
    // 1. Try host from URI (highest precedence, less likely to be ambiguous)
    if let Some(host) = header.uri.host() {
        // Check if it's not empty, as uri.host() can return "" in some cases
        if !host.is_empty() {
            return Some(host);
        }
    }
    // 2. Fallback to Host header
    if let Some(host_header_value) = header.headers.get(http::header::HOST) {
        if let Ok(host_str) = host_header_value.to_str() {
            // Remove port if present ":port"
            return Some(host_str.split(':').next().unwrap_or("")); // Take the part before the first ':'
        }
    }
    // 3. No host found
    None
}

// Use http::header constants where available for better readability and type safety
static HTTP_HEADER_X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

static HTTP_HEADER_X_REAL_IP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-real-ip"));

/// Gets the client's apparent IP address based on common proxy headers or the direct connection address.
///
/// The order of precedence is:
/// 1. `X-Forwarded-For` (first IP in the list)
/// 2. `X-Real-IP`
/// 3. Direct client address (`session.client_addr()`)
///
/// Returns an empty string if no IP address can be determined.
pub fn get_client_ip(session: &Session) -> String {
    // 1. Check X-Forwarded-For
    if let Some(value) = session.get_header(HTTP_HEADER_X_FORWARDED_FOR.clone()) {
        if let Ok(forwarded) = value.to_str() {
            // Note: Takes the *first* IP from the X-Forwarded-For list.
            // This is common practice but assumes the first IP is the actual client
            // and the header hasn't been spoofed by intermediate proxies or the client.
            // For environments requiring higher security, validate against a list
            // of trusted proxy IPs or implement more sophisticated logic.
            if let Some(ip) = forwarded.split(',').next() {
                let trimmed_ip = ip.trim();
                if !trimmed_ip.is_empty() {
                    return trimmed_ip.to_string();
                }
            }
        }
    }

    // 2. Check X-Real-IP
    if let Some(value) = session.get_header(HTTP_HEADER_X_REAL_IP.clone()) {
        if let Ok(real_ip) = value.to_str() {
            let trimmed_ip = real_ip.trim();
            if !trimmed_ip.is_empty() {
                return trimmed_ip.to_string();
            }
        }
    }

    // 3. Fallback to direct client address
    if let Some(addr) = session.client_addr() {
        // Return only the IP part, converting IPAddr to string
        return addr
            .as_inet()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();
    }

    // 4. Unable to determine IP
    log::debug!("Could not determine client IP address");
    "".to_string()
}
