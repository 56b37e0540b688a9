//! Pull-only OCI distribution endpoint with peer mirroring.
//!
//! Every request is either a mirror request (find a peer that has the
//! content and proxy to it) or a serve request (a peer asking us to serve
//! from the local store), selected by the `X-Spegel-Mirrored` header. Serve
//! mode never re-enters mirror mode, which is what keeps two mirrors from
//! bouncing a request between each other forever.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::any;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::key::is_digest;
use crate::metrics;
use crate::oci::{Digest, ImageReference, OciClient};
use crate::routing::Router;
use crate::throttle::{Byterate, Throttler};

/// Marks a request as already mirrored; such requests are served locally.
pub const MIRRORED_HEADER: &str = "X-Spegel-Mirrored";

/// Names the upstream registry in containerd mirror configuration.
pub const REGISTRY_HEADER: &str = "X-Spegel-Registry";

/// Marks mirrors on other nodes in containerd mirror configuration.
pub const EXTERNAL_HEADER: &str = "X-Spegel-External";

/// Digest header expected by registry clients.
const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Hop-by-hop headers never propagated from a proxied response (RFC 7230).
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Tunables for the registry endpoint.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Address clients use to reach this node, for external detection
    pub local_addr: String,
    /// Port the registry listens on, used to build peer forward URLs
    pub registry_port: u16,
    /// Empty resolve rounds to attempt before giving up
    pub resolve_retries: usize,
    /// Wall-clock bound on peer discovery
    pub resolve_timeout: Duration,
    /// Serve references with the `latest` tag
    pub resolve_latest_tag: bool,
    /// Pace blob writes at this rate
    pub blob_speed: Option<Byterate>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            local_addr: String::new(),
            registry_port: 5000,
            resolve_retries: 3,
            resolve_timeout: Duration::from_secs(1),
            resolve_latest_tag: true,
            blob_speed: None,
        }
    }
}

/// Shared state behind the registry handlers.
#[derive(Clone)]
pub struct RegistryState {
    oci: Arc<dyn OciClient>,
    router: Arc<dyn Router>,
    http: reqwest::Client,
    throttler: Option<Throttler>,
    config: Arc<RegistryConfig>,
}

impl RegistryState {
    pub fn new(
        oci: Arc<dyn OciClient>,
        router: Arc<dyn Router>,
        config: RegistryConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            oci,
            router,
            http,
            throttler: config.blob_speed.map(Throttler::new),
            config: Arc::new(config),
        })
    }
}

/// Build the registry application router.
pub fn create_app(state: RegistryState) -> axum::Router {
    axum::Router::new()
        .route("/healthz", any(health_handler))
        .route("/v2", any(v2_handler))
        .route("/v2/", any(v2_handler))
        .route("/v2/{*rest}", any(registry_handler))
        .fallback(fallback_handler)
        .layer(axum::middleware::from_fn(telemetry_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the registry on an already bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: RegistryState) -> Result<()> {
    let app = create_app(state);
    tracing::info!(addr = %listener.local_addr()?, "registry listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn telemetry_middleware(
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let handler = if path.starts_with("/v2") {
        "/v2/*".to_owned()
    } else {
        path.clone()
    };
    let ip = client_ip(request.headers(), remote);

    metrics::global().inflight_add(&handler, 1);
    let response = next.run(request).await;
    metrics::global().inflight_add(&handler, -1);

    let latency = start.elapsed();
    let status = response.status().as_u16();
    let size = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or(0.0);
    metrics::global().observe_http(&handler, method.as_str(), status, latency.as_secs_f64(), size);

    // Skip health probes to keep the log readable.
    if path != "/healthz" {
        let latency_ms = latency.as_millis() as u64;
        if (200..300).contains(&status) {
            tracing::info!(path, status, method = %method, latency_ms, ip, "request served");
        } else {
            tracing::warn!(path, status, method = %method, latency_ms, ip, "request failed");
        }
    }
    response
}

async fn health_handler(State(state): State<RegistryState>, request: Request) -> Response {
    if request.method() != Method::GET {
        return status_response(StatusCode::NOT_FOUND);
    }
    match state.router.ready().await {
        Ok(true) => status_response(StatusCode::OK),
        Ok(false) => error_response(&Error::RouterUnready),
        Err(err) => error_response(&err),
    }
}

async fn v2_handler(request: Request) -> Response {
    if request.method() == Method::GET {
        status_response(StatusCode::OK)
    } else {
        status_response(StatusCode::NOT_FOUND)
    }
}

async fn fallback_handler() -> Response {
    status_response(StatusCode::NOT_FOUND)
}

async fn registry_handler(State(state): State<RegistryState>, request: Request) -> Response {
    let method = request.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return status_response(StatusCode::NOT_FOUND);
    }

    let path = request.uri().path().to_owned();
    let ns = query_param(request.uri().query(), "ns");
    let parsed = match parse_path_components(ns.as_deref(), &path) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(&err),
    };

    // Gate latest tags before touching the router or the store.
    if !state.config.resolve_latest_tag && parsed.digest.is_none() {
        if let Some(reference) = &parsed.reference {
            if reference.is_latest_tag() {
                return status_response(StatusCode::NOT_FOUND);
            }
        }
    }

    let mirrored = request
        .headers()
        .get(MIRRORED_HEADER)
        .and_then(|value| value.to_str().ok())
        == Some("true");

    if !mirrored {
        let key = match (&parsed.digest, &parsed.reference) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(reference)) => reference.to_string(),
            (None, None) => return status_response(StatusCode::NOT_FOUND),
        };
        let external = is_external(request.headers(), &state.config.local_addr);
        let response = handle_mirror(&state, method, &path, ns.as_deref(), &key, external).await;
        let hit = response.status() == StatusCode::OK;
        metrics::global().record_mirror_request(ns.as_deref().unwrap_or_default(), hit, external);
        return response;
    }

    let digest = match parsed.digest {
        Some(digest) => digest,
        None => {
            let reference = parsed
                .reference
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            match state.oci.resolve(&reference).await {
                Ok(digest) => digest,
                Err(err) => return error_response(&err),
            }
        }
    };

    match parsed.kind {
        RefKind::Manifest => serve_manifest(&state, &method, &digest).await,
        RefKind::Blob => serve_blob(&state, &method, &digest).await,
    }
}

/// Resolve the key to peers and proxy to the first one that answers 200.
///
/// One attempt is in flight at a time; a failed peer just advances the
/// stream. The resolve timeout bounds discovery only, not the proxied
/// transfer. Peer failures never surface as 5xx.
async fn handle_mirror(
    state: &RegistryState,
    method: Method,
    path: &str,
    ns: Option<&str>,
    key: &str,
    external: bool,
) -> Response {
    if external {
        tracing::info!(key, path, "handling mirror request from external node");
    }

    let mut peers = match state
        .router
        .resolve(key, external, state.config.resolve_retries)
        .await
    {
        Ok(peers) => peers,
        Err(err) => return error_response(&err),
    };

    let deadline = tokio::time::Instant::now() + state.config.resolve_timeout;
    loop {
        let ip = match tokio::time::timeout_at(deadline, peers.recv()).await {
            Err(_) => {
                return error_response(&Error::not_found(format!(
                    "mirror resolve timed out for key: {key}"
                )))
            }
            Ok(None) => return error_response(&Error::ResolveExhausted(key.to_owned())),
            Ok(Some(ip)) => ip,
        };

        let mut url = format!("http://{ip}:{}{path}", state.config.registry_port);
        if let Some(ns) = ns {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("ns", ns)
                .finish();
            url.push('?');
            url.push_str(&query);
        }

        let upstream = match state
            .http
            .request(method.clone(), &url)
            .header(MIRRORED_HEADER, "true")
            .send()
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::warn!(url, error = %err, "mirror attempt failed, trying next peer");
                continue;
            }
        };
        if upstream.status() != StatusCode::OK {
            tracing::warn!(url, status = %upstream.status(), "peer returned unexpected status, trying next peer");
            continue;
        }

        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(headers) = builder.headers_mut() {
            copy_response_headers(headers, upstream.headers());
        }
        let body = if method == Method::HEAD {
            Body::empty()
        } else {
            Body::from_stream(upstream.bytes_stream())
        };
        tracing::debug!(url, key, "mirrored request");
        return builder
            .body(body)
            .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR));
    }
}

async fn serve_manifest(state: &RegistryState, method: &Method, digest: &Digest) -> Response {
    let (bytes, media_type) = match state.oci.get_manifest(digest).await {
        Ok(manifest) => manifest,
        Err(err) => return error_response(&err),
    };
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type)
        .header(header::CONTENT_LENGTH, bytes.len())
        .header(DIGEST_HEADER, digest.as_str());
    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(bytes)
    };
    builder
        .body(body)
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

async fn serve_blob(state: &RegistryState, method: &Method, digest: &Digest) -> Response {
    let size = match state.oci.size(digest).await {
        Ok(size) => size,
        Err(err) => return error_response(&err),
    };
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, size)
        .header(DIGEST_HEADER, digest.as_str());
    if *method == Method::HEAD {
        return builder
            .body(Body::empty())
            .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR));
    }
    let stream = match state.oci.get_blob(digest).await {
        Ok(stream) => stream,
        Err(err) => return error_response(&err),
    };
    let stream = match &state.throttler {
        Some(throttler) => throttler.throttle(stream),
        None => stream,
    };
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

/// What a `/v2/...` path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefKind {
    Manifest,
    Blob,
}

#[derive(Debug)]
struct ParsedPath {
    kind: RefKind,
    digest: Option<Digest>,
    reference: Option<ImageReference>,
}

/// Parse `/v2/<name>/manifests/<ref>` and `/v2/<name>/blobs/<digest>`.
///
/// Tag references need the `ns` query parameter to form a canonical
/// reference; digest requests identify content on their own.
fn parse_path_components(registry: Option<&str>, path: &str) -> Result<ParsedPath> {
    let rest = path
        .strip_prefix("/v2/")
        .ok_or_else(|| Error::malformed(format!("path does not match v2 grammar: {path}")))?;

    if let Some(idx) = rest.rfind("/manifests/") {
        let name = &rest[..idx];
        let reference = &rest[idx + "/manifests/".len()..];
        if name.is_empty() || reference.is_empty() || reference.contains('/') {
            return Err(Error::malformed(format!(
                "path does not match v2 grammar: {path}"
            )));
        }
        if is_digest(reference) {
            return Ok(ParsedPath {
                kind: RefKind::Manifest,
                digest: Some(Digest::parse(reference)?),
                reference: None,
            });
        }
        let Some(registry) = registry else {
            return Err(Error::malformed(
                "registry parameter ns is required for tag references",
            ));
        };
        return Ok(ParsedPath {
            kind: RefKind::Manifest,
            digest: None,
            reference: Some(ImageReference {
                registry: registry.to_owned(),
                repository: name.to_owned(),
                tag: Some(reference.to_owned()),
                digest: None,
            }),
        });
    }

    if let Some(idx) = rest.rfind("/blobs/") {
        let name = &rest[..idx];
        let digest = &rest[idx + "/blobs/".len()..];
        if name.is_empty() || digest.is_empty() || digest.contains('/') {
            return Err(Error::malformed(format!(
                "path does not match v2 grammar: {path}"
            )));
        }
        return Ok(ParsedPath {
            kind: RefKind::Blob,
            digest: Some(Digest::parse(digest)?),
            reference: None,
        });
    }

    Err(Error::malformed(format!(
        "path does not match v2 grammar: {path}"
    )))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// A request is external when its Host is not this node's own address.
fn is_external(headers: &HeaderMap, local_addr: &str) -> bool {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host != local_addr)
        .unwrap_or(true)
}

fn copy_response_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    let connection_named: Vec<String> = src
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();
    for (name, value) in src {
        let lower = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lower) || connection_named.iter().any(|n| n == lower) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

fn error_response(err: &Error) -> Response {
    let status = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    tracing::debug!(error = %err, "request rejected");
    status_response(status)
}

fn status_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response must build")
}
