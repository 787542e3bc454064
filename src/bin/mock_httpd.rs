//! Stand-in for httpd in integration tests
//!
//! Invoked the same way as httpd (`mock-httpd -f <config> [flags]`) and reads
//! the subset of directives the fixture renders:
//! - `LoadModule` (the module file must exist, as with real httpd)
//! - `Listen`, `PidFile`, `ErrorLog`, `CustomLog`
//! - `Alias / <dir>` for static files and directory listings
//! - `ProxyPass <prefix> <url>`, first match wins
//! - `MockStartupDelay <ms>` delays binding, to simulate slow startup
//!
//! Blocks inside `<IfModule>` are skipped and other directives are ignored.

use anyhow::{bail, Context};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Largest request head accepted
const MAX_HEAD: usize = 64 * 1024;

#[derive(Debug, Default)]
struct MockConfig {
    listen: String,
    pid_file: Option<PathBuf>,
    error_log: Option<PathBuf>,
    access_log: Option<PathBuf>,
    document_root: Option<PathBuf>,
    proxies: Vec<(String, String)>,
    startup_delay_ms: u64,
}

fn parse_config(text: &str) -> anyhow::Result<MockConfig> {
    let mut config = MockConfig::default();
    let mut depth = 0usize;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("<IfModule") {
            depth += 1;
            continue;
        }
        if line.starts_with("</IfModule") {
            depth = depth.saturating_sub(1);
            continue;
        }
        if depth > 0 || line.starts_with('<') {
            continue;
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        let arg = |n: usize| {
            words
                .get(n)
                .copied()
                .with_context(|| format!("line {}: {} takes more arguments", idx + 1, words[0]))
        };

        match words[0] {
            "LoadModule" => {
                let module = arg(2)?;
                if !Path::new(module).is_file() {
                    bail!("line {}: Cannot load {} into server", idx + 1, module);
                }
            }
            "Listen" => config.listen = arg(1)?.to_string(),
            "PidFile" => config.pid_file = Some(PathBuf::from(arg(1)?)),
            "ErrorLog" => config.error_log = Some(PathBuf::from(arg(1)?)),
            "CustomLog" => config.access_log = Some(PathBuf::from(arg(1)?)),
            "Alias" if arg(1)? == "/" => config.document_root = Some(PathBuf::from(arg(2)?)),
            "ProxyPass" => config.proxies.push((arg(1)?.to_string(), arg(2)?.to_string())),
            "MockStartupDelay" => {
                config.startup_delay_ms = arg(1)?
                    .parse()
                    .with_context(|| format!("line {}: MockStartupDelay expects milliseconds", idx + 1))?;
            }
            _ => {}
        }
    }

    if config.listen.is_empty() {
        bail!("no Listen directive");
    }
    Ok(config)
}

/// Append-only log file shared between connections
struct LogFile(Option<Mutex<File>>);

impl LogFile {
    fn open(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("cannot open log {}", path.display()))?;
                Ok(Self(Some(Mutex::new(file))))
            }
            None => Ok(Self(None)),
        }
    }

    fn line(&self, text: &str) {
        if let Some(ref file) = self.0 {
            let _ = writeln!(file.lock(), "[{}] {}", timestamp(), text);
        }
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct State {
    document_root: Option<PathBuf>,
    proxies: Vec<(String, String)>,
    http: reqwest::Client,
    error_log: LogFile,
    access_log: LogFile,
}

struct Request {
    method: String,
    target: String,
    content_type: Option<String>,
    body: Vec<u8>,
}

struct Response {
    status: u16,
    content_type: String,
    body: Vec<u8>,
}

impl Response {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            body: body.into().into_bytes(),
        }
    }
}

fn config_path() -> anyhow::Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-f" {
            return args.next().map(PathBuf::from).context("-f requires a path");
        }
    }
    bail!("usage: mock-httpd -f <config>")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path()?;
    let text = std::fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))?;
    let config = parse_config(&text).with_context(|| format!("syntax error in {}", path.display()))?;

    if config.startup_delay_ms > 0 {
        eprintln!("mock-httpd: sleeping for {}ms before starting", config.startup_delay_ms);
        tokio::time::sleep(Duration::from_millis(config.startup_delay_ms)).await;
    }

    let error_log = LogFile::open(config.error_log.as_deref())?;
    let access_log = LogFile::open(config.access_log.as_deref())?;

    let listener = TcpListener::bind(config.listen.as_str())
        .await
        .with_context(|| format!("could not bind to address {}", config.listen))?;

    if let Some(ref pid_file) = config.pid_file {
        std::fs::write(pid_file, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot write pid file {}", pid_file.display()))?;
    }

    error_log.line(&format!("[notice] mock-httpd listening on {}", config.listen));
    eprintln!("mock-httpd: listening on {}", config.listen);

    let state = Arc::new(State {
        document_root: config.document_root.clone(),
        proxies: config.proxies.clone(),
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("cannot build proxy client")?,
        error_log,
        access_log,
    });

    let serve = {
        let state = Arc::clone(&state);
        async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            handle_connection(stream, state).await;
                        });
                    }
                    Err(e) => state.error_log.line(&format!("[error] accept: {}", e)),
                }
            }
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
        tokio::select! {
            _ = serve => {}
            _ = sigterm.recv() => state.error_log.line("[notice] caught SIGTERM, shutting down"),
            _ = tokio::signal::ctrl_c() => state.error_log.line("[notice] caught SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = serve => {}
            _ = tokio::signal::ctrl_c() => state.error_log.line("[notice] caught SIGINT, shutting down"),
        }
    }

    if let Some(ref pid_file) = config.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut temp = [0u8; 4096];

    let head_end = loop {
        let n = stream.read(&mut temp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&temp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEAD {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let mut parts = lines.next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut content_length = 0usize;
    let mut content_type = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "content-type" => content_type = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut temp).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&temp[..n]);
    }
    body.truncate(content_length);

    Some(Request {
        method,
        target,
        content_type,
        body,
    })
}

async fn handle_connection(mut stream: TcpStream, state: Arc<State>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "-".to_string());
    let Some(request) = read_request(&mut stream).await else {
        return;
    };

    let proxy = state
        .proxies
        .iter()
        .find(|(source, _)| request.target.starts_with(source.as_str()));

    let response = match proxy {
        Some((source, destination)) => forward(&state, &request, source, destination).await,
        None => serve_static(state.document_root.as_deref(), &request),
    };

    state.access_log.line(&format!(
        "{} - - \"{} {} HTTP/1.1\" {} {}",
        peer,
        request.method,
        request.target,
        response.status,
        response.body.len()
    ));

    let reason = reqwest::StatusCode::from_u16(response.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Server: mock-httpd\r\n\
         \r\n",
        response.status,
        reason,
        response.content_type,
        response.body.len()
    );
    if stream.write_all(head.as_bytes()).await.is_ok() {
        let _ = stream.write_all(&response.body).await;
    }
}

async fn forward(state: &State, request: &Request, source: &str, destination: &str) -> Response {
    let url = format!("{}{}", destination, &request.target[source.len()..]);
    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return Response::text(400, "bad method"),
    };

    let mut outbound = state.http.request(method, &url).body(request.body.clone());
    if let Some(ref content_type) = request.content_type {
        outbound = outbound.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
    }

    let upstream = match outbound.send().await {
        Ok(r) => r,
        Err(e) => {
            state.error_log.line(&format!("[error] proxy: error reading from {}: {}", url, e));
            return Response::text(502, "Bad Gateway");
        }
    };

    let status = upstream.status().as_u16();
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    match upstream.bytes().await {
        Ok(body) => Response {
            status,
            content_type,
            body: body.to_vec(),
        },
        Err(e) => {
            state.error_log.line(&format!("[error] proxy: incomplete body from {}: {}", url, e));
            Response::text(502, "Bad Gateway")
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        _ => "application/octet-stream",
    }
}

fn serve_static(document_root: Option<&Path>, request: &Request) -> Response {
    let Some(root) = document_root else {
        return Response::text(404, "Not Found");
    };
    if request.method != "GET" && request.method != "HEAD" {
        return Response::text(405, "Method Not Allowed");
    }

    let path = request.target.split('?').next().unwrap_or("/");
    if path.split('/').any(|segment| segment == "..") {
        return Response::text(403, "Forbidden");
    }

    let local = root.join(path.trim_start_matches('/'));
    if local.is_dir() {
        let index = local.join("index.html");
        if index.is_file() {
            return read_file(&index);
        }
        let mut names: Vec<String> = std::fs::read_dir(&local)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        let items: String = names
            .iter()
            .map(|n| format!("<li><a href=\"{}\">{}</a></li>\n", n, n))
            .collect();
        return Response {
            status: 200,
            content_type: "text/html".to_string(),
            body: format!("<html><body><h1>Index of {}</h1><ul>\n{}</ul></body></html>\n", path, items).into_bytes(),
        };
    }
    if local.is_file() {
        return read_file(&local);
    }
    Response::text(404, "Not Found")
}

fn read_file(path: &Path) -> Response {
    match std::fs::read(path) {
        Ok(body) => Response {
            status: 200,
            content_type: content_type_for(path).to_string(),
            body,
        },
        Err(_) => Response::text(403, "Forbidden"),
    }
}
