//! Per-request context propagation helpers: resolving a request-id /
//! trace-id for an inbound request and writing it back onto the response.
//!
//! spec.md's design notes describe this as a "per-request context bag" that
//! logging adapters read without the core knowing the transport specifics.
//! `helios-core` never sees HTTP request/response types at all, so the bag
//! lives here in the gateway binary, wired in as a `wrap_fn` middleware
//! around the whole `App`.

use actix_web::body::MessageBody;
use actix_web::dev::ServiceRequest;
use actix_web::dev::ServiceResponse;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::HttpMessage;
use uuid::Uuid;

/// Reads `header` off the inbound request, or mints a fresh UUIDv4 if it's
/// absent. Returns `None` when propagation for this id is disabled.
pub fn resolve_id(req: &ServiceRequest, header: &str, enabled: bool) -> Option<String> {
    if !enabled {
        return None;
    }
    let existing = req
        .headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    Some(existing.unwrap_or_else(|| Uuid::new_v4().to_string()))
}

/// Writes `value` onto the response's `name` header, silently skipping if
/// either isn't a legal header component (never the case for our own UUIDs,
/// but a caller-supplied header *name* comes from the config file).
pub fn set_response_header(res: &mut ServiceResponse<impl MessageBody>, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        res.headers_mut().insert(name, value);
    }
}

/// Stashes the resolved request-id into the request's extensions so
/// downstream handlers (not just the outermost middleware) could read it
/// without reparsing headers, matching the "context bag" design note.
pub fn stash_request_id(req: &ServiceRequest, request_id: Option<String>) {
    if let Some(id) = request_id {
        req.extensions_mut().insert(RequestId(id));
    }
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);
