//! Generated HTML pages: interstitials, not-found, service list and dashboard

use crate::status::StatusSnapshot;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};

/// Log lines shown on the failure page
pub const FAILURE_LOG_LINES: usize = 50;

const STYLE: &str = r#"<style>
body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; margin: 0; background: #f6f7f9; color: #1f2328; }
main { max-width: 860px; margin: 8vh auto; padding: 0 24px; }
h1 { font-size: 1.6rem; margin-bottom: 0.4rem; }
.muted { color: #6b7280; }
.error { color: #b42318; }
pre { background: #111827; color: #e5e7eb; padding: 16px; border-radius: 6px; overflow-x: auto; font-size: 0.85rem; }
ul { padding-left: 1.2rem; } li { margin: 0.3rem 0; }
a { color: #2563eb; }
button { background: #2563eb; color: white; border: 0; border-radius: 6px; padding: 8px 16px; font-size: 0.95rem; cursor: pointer; }
.state { display: inline-block; min-width: 5.5rem; font-size: 0.8rem; }
.running { color: #15803d; } .starting { color: #b45309; } .failed { color: #b42318; } .idle { color: #6b7280; }
</style>"#;

/// Escape text for use inside HTML element content and attribute values
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn document(title: &str, head_extra: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
         <title>{}</title>\n{}\n{}\n</head>\n<body>\n<main>\n{}\n</main>\n</body>\n</html>\n",
        escape_html(title),
        STYLE,
        head_extra,
        body
    )
}

fn html_response(status: StatusCode, html: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(CACHE_CONTROL, "no-store")
        .body(Full::new(Bytes::from(html)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

fn interstitial(html: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = html_response(StatusCode::BAD_GATEWAY, html);
    response
        .headers_mut()
        .insert(RETRY_AFTER, hyper::header::HeaderValue::from_static("1"));
    response
}

fn reload_script(delay_ms: u64) -> String {
    format!(
        "<script>setTimeout(function () {{ window.location.reload(); }}, {});</script>",
        delay_ms
    )
}

/// Shown while a process is starting; reloads itself until the app answers
pub fn waiting_page(name: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!(
        "<h1>Starting {name}&hellip;</h1>\n\
         <p class=\"muted\">This page reloads automatically once the app accepts connections.</p>",
        name = escape_html(name)
    );
    interstitial(document(&format!("Starting {}", name), &reload_script(1000), &body))
}

/// Shown when a process failed, with its last output and a restart control
pub fn failure_page(
    name: &str,
    error: &str,
    logs: &[String],
    restart_url: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let start = logs.len().saturating_sub(FAILURE_LOG_LINES);
    let output = if logs.is_empty() {
        "<p class=\"muted\">No output was captured.</p>".to_string()
    } else {
        format!("<pre>{}</pre>", escape_html(&logs[start..].join("\n")))
    };

    let body = format!(
        "<h1 class=\"error\">{name} failed to start</h1>\n\
         <p>{error}</p>\n\
         {output}\n\
         <p><button id=\"restart\" data-url=\"{restart}\">Restart {name}</button></p>\n\
         <script>\n\
         document.getElementById('restart').addEventListener('click', function () {{\n\
           fetch(this.dataset.url, {{ mode: 'no-cors' }}).finally(function () {{\n\
             setTimeout(function () {{ window.location.reload(); }}, 500);\n\
           }});\n\
         }});\n\
         </script>",
        name = escape_html(name),
        error = escape_html(error),
        output = output,
        restart = escape_html(restart_url),
    );
    interstitial(document(&format!("{} failed", name), &reload_script(5000), &body))
}

/// No app matches the requested host
pub fn not_found_page(host: &str, apps: &[(String, String)]) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!(
        "<h1>No app for {host}</h1>\n\
         <p class=\"muted\">Add an app file to the apps directory and reload this page.</p>\n{list}",
        host = escape_html(host),
        list = link_list(apps)
    );
    html_response(StatusCode::NOT_FOUND, document("App not found", "", &body))
}

/// Services of a multi-service app that has no default
pub fn service_list_page(
    app: &str,
    services: &[(String, String)],
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!(
        "<h1>{app}</h1>\n<p class=\"muted\">Pick a service:</p>\n{list}",
        app = escape_html(app),
        list = link_list(services)
    );
    html_response(StatusCode::OK, document(app, "", &body))
}

/// Minimal app list on the dashboard host
pub fn dashboard_page(snapshot: &StatusSnapshot) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut rows = String::new();
    for app in &snapshot.apps {
        let state = app.process.as_ref().map(|p| p.state).unwrap_or("");
        rows.push_str(&format!(
            "<li><span class=\"state {state}\">{state}</span> <a href=\"{url}\">{name}</a>",
            state = state,
            url = escape_html(&app.url),
            name = escape_html(&app.name),
        ));
        if !app.services.is_empty() {
            rows.push_str("<ul>");
            for service in &app.services {
                rows.push_str(&format!(
                    "<li><span class=\"state {state}\">{state}</span> <a href=\"{url}\">{name}</a></li>",
                    state = service.process.state,
                    url = escape_html(&service.url),
                    name = escape_html(&service.name),
                ));
            }
            rows.push_str("</ul>");
        }
        rows.push_str("</li>\n");
    }

    let body = format!(
        "<h1>devhost</h1>\n<ul>\n{}</ul>\n\
         <script>\n\
         var seen = false;\n\
         new EventSource('/api/events').onmessage = function () {{\n\
           if (seen) {{ window.location.reload(); }}\n\
           seen = true;\n\
         }};\n\
         </script>",
        rows
    );
    html_response(StatusCode::OK, document("devhost", "", &body))
}

fn link_list(links: &[(String, String)]) -> String {
    if links.is_empty() {
        return String::new();
    }
    let items: String = links
        .iter()
        .map(|(name, url)| {
            format!(
                "<li><a href=\"{}\">{}</a></li>\n",
                escape_html(url),
                escape_html(name)
            )
        })
        .collect();
    format!("<ul>\n{}</ul>", items)
}
