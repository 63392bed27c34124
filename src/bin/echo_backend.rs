//! Tiny HTTP backend for smoke and integration tests
//!
//! Environment variables:
//! - PORT: Port to listen on (required, set by the supervisor)
//! - STARTUP_DELAY_MS: Delay before accepting connections (default: 0)
//!
//! Every request is answered with `echo response <METHOD> <PATH>` followed by
//! the forwarding headers it saw. `/html` answers with a cacheable HTML page
//! and `/exit` terminates the process after replying.

use anyhow::Context;
use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = env::var("PORT")
        .context("PORT environment variable required")?
        .parse()
        .context("PORT must be a valid port number")?;

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if startup_delay > 0 {
        println!("echo: sleeping {}ms before listening", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    println!("echo: listening on port {}", port);

    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(handle_connection(stream));
    }
}

async fn handle_connection(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 16 * 1024 {
            return;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let mut lines = request.lines();
    let mut request_line = lines.next().unwrap_or("GET / HTTP/1.1").split(' ');
    let method = request_line.next().unwrap_or("GET").to_string();
    let path = request_line.next().unwrap_or("/").to_string();

    let forwarded: Vec<String> = lines
        .take_while(|l| !l.is_empty())
        .filter(|l| l.to_ascii_lowercase().starts_with("x-forwarded-"))
        .map(|l| l.to_ascii_lowercase())
        .collect();

    println!("echo: {} {}", method, path);

    let (content_type, body) = if path == "/html" {
        ("text/html", "<h1>echo</h1>".to_string())
    } else {
        let mut body = format!("echo response {} {}\n", method, path);
        for header in &forwarded {
            body.push_str(header);
            body.push('\n');
        }
        ("text/plain", body)
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {}\r\n\
         Cache-Control: max-age=3600\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{}",
        content_type,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;

    if path == "/exit" {
        println!("echo: exiting on request");
        std::process::exit(0);
    }
}
