//! Serving static-file apps from disk

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" | "md" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Map a request path to a file under `root`.
///
/// `Err` means the path escapes the root. `Ok(None)` means nothing matched,
/// not even the fallback.
fn resolve_file(root: &Path, request_path: &str) -> Result<Option<PathBuf>, ()> {
    let root = match root.canonicalize() {
        Ok(root) => root,
        Err(_) => return Ok(None),
    };

    // A single-file app answers every path with that file
    if root.is_file() {
        return Ok(Some(root));
    }

    let raw_path = request_path.split('?').next().unwrap_or("");
    let decoded = urlencoding::decode(raw_path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| raw_path.to_string());
    let relative = decoded.trim_start_matches('/');

    let candidate = root.join(relative);
    if let Ok(found) = candidate.canonicalize() {
        if !found.starts_with(&root) {
            return Err(());
        }
        if found.is_file() {
            return Ok(Some(found));
        }
        let index = found.join("index.html");
        if index.is_file() {
            return Ok(Some(index));
        }
    }

    // Unknown paths fall back to the main page for client-side routing
    let index = root.join("index.html");
    Ok(index.is_file().then_some(index))
}

/// Serve `request_path` from a static app rooted at `root`
pub async fn serve(
    root: &Path,
    method: &Method,
    request_path: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if method != Method::GET && method != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n");
    }

    let path = match resolve_file(root, request_path) {
        Ok(Some(path)) => path,
        Ok(None) => return text_response(StatusCode::NOT_FOUND, "Not found\n"),
        Err(()) => {
            warn!(root = %root.display(), path = request_path, "Blocked path traversal");
            return text_response(StatusCode::FORBIDDEN, "Forbidden\n");
        }
    };

    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to read static file");
            return text_response(StatusCode::NOT_FOUND, "Not found\n");
        }
    };

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type(&path))
        .header(CONTENT_LENGTH, contents.len())
        .header(CACHE_CONTROL, "no-cache");

    let body = if method == Method::HEAD {
        Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
    } else {
        Full::new(Bytes::from(contents)).map_err(|e| match e {}).boxed()
    };

    builder
        .body(body)
        .expect("valid response with StatusCode enum and static headers")
}
