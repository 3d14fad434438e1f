//! Onboarding HTTP surface served on the proxy's own address: status and setup
//! pages, the CA certificate download, the PAC script and a debug snapshot.

use std::{
    convert::Infallible,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, MutexGuard},
    time::Duration,
};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    ca::CERT_FILE_NAME,
    config::proxy_url,
    enrollment::SharedStore,
    pac,
    probe::{DebugInfo, Probe, ProbeContext},
    store::Store,
};

pub const CERT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";

/// Reports whether the OS trusts the CA. May shell out, so it runs on the blocking pool.
pub type CertCheck = Arc<dyn Fn() -> bool + Send + Sync>;
const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const JSON_CONTENT_TYPE: &str = "application/json";
const INFO_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the handlers read. Shared across connections behind an `Arc`.
pub struct OnboardingState {
    pub version: String,
    /// Address advertised in the PAC script and on the pages, `host:port`.
    pub proxy_addr: String,
    pub cert_path: PathBuf,
    pub cert_pem: String,
    pub skipped_names: Vec<String>,
    pub store: SharedStore,
    pub probe: Arc<Probe>,
    pub cert_check: Option<CertCheck>,
}

impl OnboardingState {
    fn proxy_url(&self) -> String {
        proxy_url(&self.proxy_addr)
    }

    fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Backend and auto-config flag as currently on disk. Other processes
    /// (`fingertip backend`, `enable`) write the store while the server runs.
    fn store_facts(&self) -> (String, bool) {
        let mut store = self.lock_store();
        if let Err(err) = store.reload() {
            tracing::warn!("keeping in-memory app store: {err:#}");
        }
        (store.backend().to_owned(), store.auto_config())
    }

    async fn cert_installed(&self) -> Option<bool> {
        let check = Arc::clone(self.cert_check.as_ref()?);
        match tokio::task::spawn_blocking(move || check()).await {
            Ok(installed) => Some(installed),
            Err(err) => {
                tracing::debug!("join certificate trust check: {err}");
                None
            }
        }
    }
}

#[derive(Debug)]
pub struct OnboardingHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl OnboardingHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

pub async fn serve(bind: SocketAddr, state: Arc<OnboardingState>) -> anyhow::Result<OnboardingHandle> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind onboarding listener {bind}"))?;
    let listen_addr = listener
        .local_addr()
        .context("read onboarding listener address")?;
    tracing::info!(%listen_addr, "onboarding server listening");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("onboarding connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(OnboardingHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<OnboardingState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    Ok(route(&method, &uri, &state).await)
}

async fn route(method: &Method, uri: &Uri, state: &OnboardingState) -> Response<Full<Bytes>> {
    let path = uri.path();
    let cert_route = format!("/{CERT_FILE_NAME}");
    let known = matches!(path, "" | "/" | "/setup" | "/info.json" | "/proxy.pac") || path == cert_route;
    if !known {
        return simple_response(StatusCode::NOT_FOUND, "not found");
    }
    if method != Method::GET {
        return simple_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    match path {
        "" | "/" => html_response(&status_page(state)),
        "/setup" => html_response(&setup_page(state)),
        "/info.json" => info_response(uri, state).await,
        "/proxy.pac" => typed_response(
            pac::CONTENT_TYPE,
            pac::script(&state.proxy_addr, &state.skipped_names),
        ),
        _ => typed_response(CERT_CONTENT_TYPE, state.cert_pem.clone()),
    }
}

async fn info_response(uri: &Uri, state: &OnboardingState) -> Response<Full<Bytes>> {
    if query_flag(uri, "init") {
        state.probe.reset();
    }
    let (backend, auto_config) = state.store_facts();
    let cert_installed = state.cert_installed().await;
    let info = state.probe.snapshot(&ProbeContext {
        version: &state.version,
        backend: &backend,
        proxy_addr: &state.proxy_addr,
        auto_config,
        cert_installed,
    });
    let response = json_response(StatusCode::OK, &info);
    // `peek=1` reads without counting as a page visit.
    if !query_flag(uri, "peek") {
        state.probe.ping();
    }
    response
}

/// Reads the debug snapshot of a running onboarding server at `base_url`
/// without registering a visit.
pub async fn fetch_debug_info(base_url: &str) -> anyhow::Result<DebugInfo> {
    let uri: Uri = format!("{}/info.json?peek=1", base_url.trim_end_matches('/'))
        .parse()
        .with_context(|| format!("invalid onboarding URL {base_url}"))?;
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .context("build onboarding info request")?;

    let res = tokio::time::timeout(INFO_FETCH_TIMEOUT, client.request(req))
        .await
        .with_context(|| format!("onboarding server at {base_url} did not answer"))?
        .with_context(|| format!("connect to onboarding server at {base_url}"))?;
    let status = res.status();
    let body = res
        .into_body()
        .collect()
        .await
        .context("read onboarding info response")?
        .to_bytes();
    if !status.is_success() {
        anyhow::bail!(
            "onboarding info returned {}: {}",
            status,
            String::from_utf8_lossy(&body)
        );
    }
    serde_json::from_slice(&body).context("parse onboarding info response")
}

fn query_flag(uri: &Uri, name: &str) -> bool {
    let Some(raw_query) = uri.query() else {
        return false;
    };
    raw_query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(key, value)| key == name && value == "1")
}

struct PageFacts {
    backend: String,
    cert_path: String,
    cert_href: String,
    pac_url: String,
    proxy_url: String,
    version: String,
}

impl PageFacts {
    fn gather(state: &OnboardingState) -> Self {
        let proxy_url = state.proxy_url();
        let (backend, _) = state.store_facts();
        Self {
            backend: escape_html(&backend),
            cert_path: escape_html(&state.cert_path.display().to_string()),
            cert_href: escape_html(&format!("/{CERT_FILE_NAME}")),
            pac_url: escape_html(&format!("{proxy_url}/proxy.pac")),
            proxy_url: escape_html(&proxy_url),
            version: escape_html(&state.version),
        }
    }
}

fn status_page(state: &OnboardingState) -> String {
    let facts = PageFacts::gather(state);
    let body = format!(
        r#"<h1>Fingertip is running</h1>
<table>
<tr><th>Resolver backend</th><td>{backend}</td></tr>
<tr><th>CA certificate</th><td><code>{cert_path}</code></td></tr>
<tr><th>Proxy</th><td><code>{proxy_url}</code></td></tr>
<tr><th>Version</th><td>{version}</td></tr>
</table>
<ul>
<li><a href="{cert_href}">Download the CA certificate</a></li>
<li><a href="/proxy.pac">Proxy auto-config script</a> (<code>{pac_url}</code>)</li>
<li><a href="/setup">Manual setup instructions</a></li>
</ul>"#,
        backend = facts.backend,
        cert_path = facts.cert_path,
        proxy_url = facts.proxy_url,
        version = facts.version,
        cert_href = facts.cert_href,
        pac_url = facts.pac_url,
    );
    layout("Fingertip", &body)
}

fn setup_page(state: &OnboardingState) -> String {
    let facts = PageFacts::gather(state);
    let body = format!(
        r#"<h1>Set up Fingertip manually</h1>
<ol>
<li><a href="{cert_href}">Download the CA certificate</a> and mark it trusted for websites in your
operating system or browser certificate store. It is stored at <code>{cert_path}</code>.</li>
<li>Set the automatic proxy configuration URL to <code>{pac_url}</code>.</li>
<li>Firefox: enable <code>security.enterprise_roots.enabled</code> or import the certificate under
Settings &gt; Privacy &amp; Security &gt; Certificates, then choose
"Use system proxy settings".</li>
</ol>
<p>Resolver backend: {backend}. Version {version}. <a href="/">Back to status</a></p>"#,
        cert_href = facts.cert_href,
        cert_path = facts.cert_path,
        pac_url = facts.pac_url,
        backend = facts.backend,
        version = facts.version,
    );
    layout("Fingertip setup", &body)
}

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n<body>\n{body}\n</body>\n</html>\n"
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

fn html_response(page: &str) -> Response<Full<Bytes>> {
    typed_response(HTML_CONTENT_TYPE, page.to_owned())
}

fn typed_response(content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(JSON_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            tracing::debug!("failed to serialize onboarding JSON response: {err}");
            simple_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize response",
            )
        }
    }
}
