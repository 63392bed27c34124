//! Control API served on the dashboard host
//!
//! Every endpoint takes its target as a `name` query parameter, resolved with
//! [`AppRegistry::resolve_name`](crate::registry::AppRegistry::resolve_name),
//! so `shop:web`, `web.shop`, `web-shop` and a unique bare `web` all work.

use crate::context::AppContext;
use crate::error::{json_error_response, ErrorCode};
use crate::pages;
use crate::registry::Target;
use futures::StreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::sync::Arc;
use tracing::{debug, info, warn};

type ControlResponse = Response<BoxBody<Bytes, hyper::Error>>;

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> ControlResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(CACHE_CONTROL, "no-store")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Value of query parameter `key`, percent-decoded
fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k != key {
            return None;
        }
        let v = v.replace('+', " ");
        Some(
            urlencoding::decode(&v)
                .map(|d| d.into_owned())
                .unwrap_or(v),
        )
    })
}

/// Resolve the `name` parameter, or the error response to send instead
fn target_param(uri: &Uri, ctx: &AppContext) -> Result<Target, ControlResponse> {
    let name = query_param(uri, "name")
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            json_error_response(ErrorCode::MissingParameter, "missing 'name' query parameter")
        })?;

    ctx.registry()
        .resolve_name(&name)
        .map_err(|e| json_error_response(ErrorCode::from(&e), e.to_string()))
}

/// Port and static apps have nothing to start or stop
fn is_managed(target: &Target) -> bool {
    target.launch().is_some() || target.app.services().is_some()
}

fn not_managed(target: &Target) -> ControlResponse {
    json_error_response(
        ErrorCode::NotManaged,
        format!("'{}' is not a command app or service", target.process_name()),
    )
}

fn action_response(ctx: &AppContext, target: &Target) -> ControlResponse {
    let body = serde_json::json!({
        "ok": true,
        "name": target.process_name(),
        "status": ctx.app_status(target),
    });
    json_response(StatusCode::OK, body.to_string())
}

fn sse_frame(data: &str) -> Frame<Bytes> {
    Frame::data(Bytes::from(format!("data: {}\n\n", data)))
}

/// Snapshot now, then one event per published change until the client leaves
fn event_stream(ctx: &AppContext) -> ControlResponse {
    let mut rx = ctx.broadcaster().subscribe();
    let initial = sse_frame(&ctx.snapshot().to_json());

    let updates = futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
        .map(|message| Ok::<_, hyper::Error>(sse_frame(&message)));
    let stream = futures::stream::iter([Ok(initial)]).chain(updates);

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .body(BoxBody::new(StreamBody::new(stream)))
        .expect("valid response with StatusCode enum and static headers")
}

/// Handle a request addressed to the dashboard host
pub async fn handle<B>(req: Request<B>, ctx: &Arc<AppContext>) -> ControlResponse {
    // No endpoint reads a body
    let (parts, _) = req.into_parts();
    let method = &parts.method;
    let uri = &parts.uri;
    let path = uri.path();

    debug!(%method, %path, "Control API request");

    match (method, path) {
        (&Method::GET, "/") => pages::dashboard_page(&ctx.snapshot()),

        (&Method::GET, "/api/status") => json_response(StatusCode::OK, ctx.snapshot().to_json()),

        (&Method::GET, "/api/events") => event_stream(ctx),

        (&Method::GET, "/api/start") => {
            let target = match target_param(uri, ctx) {
                Ok(target) => target,
                Err(response) => return response,
            };
            if !is_managed(&target) {
                return not_managed(&target);
            }
            match ctx.start_target(&target) {
                Ok(_) => {
                    info!(name = %target.process_name(), "Started via control API");
                    action_response(ctx, &target)
                }
                Err(e) => json_error_response(ErrorCode::from(&e), e.to_string()),
            }
        }

        (&Method::GET, "/api/stop") => {
            let target = match target_param(uri, ctx) {
                Ok(target) => target,
                Err(response) => return response,
            };
            if !is_managed(&target) {
                return not_managed(&target);
            }
            match ctx.stop_target(&target).await {
                Ok(stopped) => {
                    info!(name = %target.process_name(), stopped, "Stopped via control API");
                    action_response(ctx, &target)
                }
                Err(e) => json_error_response(ErrorCode::from(&e), e.to_string()),
            }
        }

        (&Method::GET, "/api/restart") => {
            let target = match target_param(uri, ctx) {
                Ok(target) => target,
                Err(response) => return response,
            };
            if !is_managed(&target) {
                return not_managed(&target);
            }
            match ctx.restart_target(&target).await {
                Ok(_) => action_response(ctx, &target),
                Err(e) => {
                    warn!(name = %target.process_name(), error = %e, "Restart failed");
                    json_error_response(ErrorCode::from(&e), e.to_string())
                }
            }
        }

        (&Method::GET, "/api/logs") => {
            let target = match target_param(uri, ctx) {
                Ok(target) => target,
                Err(response) => return response,
            };
            match ctx.logs(&target) {
                Some(lines) => json_response(
                    StatusCode::OK,
                    serde_json::to_string(&lines).unwrap_or_else(|_| "[]".to_string()),
                ),
                None => json_error_response(
                    ErrorCode::NotRunning,
                    format!("'{}' is not running", target.process_name()),
                ),
            }
        }

        (&Method::GET, "/api/app-status") => match target_param(uri, ctx) {
            Ok(target) => {
                let status = ctx.app_status(&target);
                match serde_json::to_string(&status) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(e) => json_error_response(ErrorCode::InternalError, e.to_string()),
                }
            }
            Err(response) => response,
        },

        (&Method::GET | &Method::POST, "/api/reload") => match ctx.registry().reload() {
            Ok(count) => {
                ctx.publish_status();
                let body = serde_json::json!({ "ok": true, "apps": count });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Reload failed");
                json_error_response(ErrorCode::InternalError, format!("reload failed: {:#}", e))
            }
        },

        _ => json_error_response(ErrorCode::NotFound, "not found"),
    }
}
