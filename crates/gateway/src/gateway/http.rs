//! HTTP helpers for the Pingora session boundary.

use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora::proxy::Session;

use crate::pipeline::TerminalResponse;

/// Trace-id headers honored, in order of preference.
const TRACE_HEADERS: [&str; 3] = ["x-trace-id", "x-correlation-id", "x-request-id"];

/// Extract or generate the request trace id.
pub fn get_or_create_trace_id(session: &Session) -> String {
    let req_header = session.req_header();
    for header_name in &TRACE_HEADERS {
        if let Some(value) = req_header.headers.get(*header_name) {
            if let Ok(id) = value.to_str() {
                if !id.is_empty() {
                    return id.to_string();
                }
            }
        }
    }
    uuid::Uuid::new_v4().simple().to_string()
}

/// Write a terminal response to the session, ending the exchange.
pub async fn write_terminal(
    session: &mut Session,
    response: &TerminalResponse,
) -> Result<(), Box<Error>> {
    let mut resp_header = ResponseHeader::build(response.status, None)?;
    for (name, value) in &response.headers {
        resp_header.insert_header(name.clone(), value.as_str())?;
    }
    resp_header.insert_header("Content-Length", response.body.len().to_string())?;

    session.set_keepalive(None);
    session
        .write_response_header(Box::new(resp_header), false)
        .await?;
    session
        .write_response_body(Some(response.body.clone()), true)
        .await?;
    Ok(())
}

/// Write a plain error response.
pub async fn write_error(
    session: &mut Session,
    status: u16,
    body: &str,
    content_type: &str,
) -> Result<(), Box<Error>> {
    let mut resp_header = ResponseHeader::build(status, None)?;
    resp_header.insert_header("Content-Type", content_type)?;
    resp_header.insert_header("Content-Length", body.len().to_string())?;

    session.set_keepalive(None);
    session
        .write_response_header(Box::new(resp_header), false)
        .await?;
    session
        .write_response_body(Some(bytes::Bytes::copy_from_slice(body.as_bytes())), true)
        .await?;
    Ok(())
}
