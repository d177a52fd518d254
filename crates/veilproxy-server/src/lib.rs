//! C11: Request Orchestrator, C7: Response Dispatcher, C9: WebSocket
//! Tunnel. Wires the URL Resolver, Header Rewriter, content rewriters, Edge
//! Cache, and Asset Generator into one axum `Router`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, FromRequest, Request, State},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue, StatusCode};
use thiserror::Error;
use tower_http::trace::{self, TraceLayer};
use tracing::{error, warn, Level};
use url::Url;

use veilproxy_assets::{interceptor_script, service_worker_injector_script, service_worker_script};
use veilproxy_cache::{cache_key, is_cacheable, EdgeCache};
use veilproxy_config::Config;
use veilproxy_rewrite::mods::{
    active_compiled_mods, active_traffic_mod, builtin_mods, builtin_traffic_mods, CompiledMod, Mod, TrafficAction,
    TrafficMod,
};
use veilproxy_rewrite::{headers as rw_headers, request as rw_request, resolve, Resolution, Suffix};
use veilproxy_trace::{CacheOutcome, RequestSpan};

use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request host is not a proxyable subdomain of the configured root domain")]
    NotProxyable,
    #[error("could not resolve a redirect target from the landing request")]
    InvalidRedirectTarget,
    #[error("upstream request failed: {0}")]
    UpstreamFetch(#[from] reqwest::Error),
    #[error("websocket upgrade to upstream failed: {0}")]
    WebSocketUpgradeFailed(String),
    #[error("configuration is invalid: {0}")]
    ConfigInvalid(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::NotProxyable => StatusCode::NOT_FOUND,
            ProxyError::InvalidRedirectTarget => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamFetch(_) => StatusCode::BAD_GATEWAY,
            ProxyError::WebSocketUpgradeFailed(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// CSS/JS/JSON/XML handlers buffer the full body before transforming; above
/// this many bytes they fall through to passthrough rather than hold an
/// unbounded allocation. HTML streams through `lol_html` and has no cap.
const MAX_BUFFERED_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    suffix: Arc<Suffix>,
    client: reqwest::Client,
    cache: EdgeCache,
    root_passthrough: Arc<Vec<wildmatch::WildMatch>>,
    proxy_passthrough: Arc<Vec<wildmatch::WildMatch>>,
    mods: Arc<Vec<CompiledMod>>,
    traffic_mods: Arc<Vec<TrafficMod>>,
}

/// Build the axum `Router` for the stealth proxy. Separate from
/// [`run_server`] so tests can exercise it with `tower::ServiceExt` without
/// binding a socket.
pub fn build_router(config: Config) -> Router {
    let suffix = Suffix::new(config.root_domain.clone());
    let root_passthrough = config
        .cookies
        .root_passthrough
        .iter()
        .map(|p| wildmatch::WildMatch::new(p))
        .collect();
    let proxy_passthrough = config
        .cookies
        .proxy_passthrough
        .iter()
        .map(|p| wildmatch::WildMatch::new(p))
        .collect();

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("reqwest client builds with default TLS backend");

    let mods: Vec<CompiledMod> = builtin_mods().iter().filter_map(Mod::compile).collect();
    let traffic_mods = builtin_traffic_mods();

    let state = AppState {
        config: Arc::new(config),
        suffix: Arc::new(suffix),
        client,
        cache: EdgeCache::new(),
        root_passthrough: Arc::new(root_passthrough),
        proxy_passthrough: Arc::new(proxy_passthrough),
        mods: Arc::new(mods),
        traffic_mods: Arc::new(traffic_mods),
    };

    Router::new()
        .route("/*path", any(dispatch))
        .route("/", any(dispatch))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

pub async fn run_server(port: u16, config: Config) -> anyhow::Result<()> {
    let app = build_router(config);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "stealth proxy listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn path_and_query(req: &Request) -> String {
    let uri = req.uri();
    let mut s = uri.path().to_string();
    if let Some(q) = uri.query() {
        s.push('?');
        s.push_str(q);
    }
    s
}

fn host_of(req: &Request) -> Option<String> {
    req.uri()
        .host()
        .map(|h| h.to_string())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|h| h.split(':').next().unwrap_or(h).to_string())
        })
}

async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let Some(host) = host_of(&req) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };
    let pq = path_and_query(&req);

    if let Some(asset) = dispatch_generated_asset(&req, &pq) {
        return asset;
    }

    match resolve(&state.suffix, &host, &pq) {
        Ok(Resolution::Landing) => landing_response(&state, &req),
        Ok(Resolution::Target(target)) => {
            let target_host = target.0.host_str().unwrap_or("").to_string();
            if let Some(traffic_mod) = active_traffic_mod(&state.traffic_mods, |id| state.config.mod_enabled(id), &target_host) {
                if let Some(action) = traffic_mod.execute(&target_host) {
                    return traffic_mod_response(action);
                }
            }
            if req
                .headers()
                .get(http::header::UPGRADE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
            {
                upgrade_websocket(state, req, target.0).await
            } else {
                proxy_http(state, req, target.0).await.into_response()
            }
        }
        Err(_) => ProxyError::NotProxyable.into_response(),
    }
}

/// Build the short-circuit response for a Traffic Mod's action (spec
/// 4.11): a redirect, or a bare status with no upstream request made.
fn traffic_mod_response(action: &TrafficAction) -> Response {
    match action {
        TrafficAction::Redirect { to } => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(to) {
                headers.insert(http::header::LOCATION, value);
            }
            (StatusCode::FOUND, headers).into_response()
        }
        TrafficAction::Block { status } => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::FORBIDDEN);
            (status, "blocked by traffic mod").into_response()
        }
    }
}

fn dispatch_generated_asset(req: &Request, pq: &str) -> Option<Response> {
    let path = req.uri().path();
    if path == veilproxy_assets::INTERCEPTOR_PATH {
        let asset = interceptor_script();
        return Some(asset_response(asset));
    }
    if path == veilproxy_assets::SERVICE_WORKER_PATH {
        let asset = service_worker_script();
        return Some(asset_response(asset));
    }
    if path == veilproxy_assets::SERVICE_WORKER_INJECTOR_PATH {
        let target = req
            .uri()
            .query()
            .and_then(|q| url::form_urlencoded::parse(q.as_bytes()).find(|(k, _)| k == "target"))
            .map(|(_, v)| v.into_owned());
        let _ = pq;
        let asset = service_worker_injector_script(target.as_deref());
        return Some(asset_response(asset));
    }
    None
}

fn asset_response(asset: veilproxy_assets::GeneratedAsset) -> Response {
    let mut response = Response::builder().status(asset.status);
    *response.headers_mut().unwrap() = asset.headers;
    response.body(Body::from(asset.body)).unwrap()
}

/// Landing page on the bare root domain: either a redirect built from a
/// user-typed target in the query string, or a minimal placeholder page.
fn landing_response(state: &AppState, req: &Request) -> Response {
    let query = req.uri().query().unwrap_or("");
    match veilproxy_url::resolve_root_redirect(&state.suffix, query) {
        Ok(location) => {
            let mut headers = HeaderMap::new();
            headers.insert(http::header::LOCATION, HeaderValue::from_str(&location).unwrap());
            (StatusCode::FOUND, headers).into_response()
        }
        Err(_) => (
            StatusCode::OK,
            [(http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
            "<!doctype html><html><body>stealth proxy</body></html>",
        )
            .into_response(),
    }
}

async fn proxy_http(state: AppState, req: Request, target_url: Url) -> Result<Response, ProxyError> {
    let span = RequestSpan::start(req.method().as_str(), target_url.host_str().unwrap_or(""), target_url.as_str());
    let method = req.method().clone();
    let is_get = method == http::Method::GET;

    let cache_key_str = cache_key(target_url.host_str().unwrap_or(""), target_url.path());
    if is_get && state.config.cache.enabled {
        if let Some(entry) = state.cache.get(&cache_key_str, Duration::from_secs(state.config.cache.ttl_seconds)) {
            let mut headers = entry.headers;
            rw_headers::set_cache_hit(&mut headers);
            span.finish(entry.status, CacheOutcome::Hit);
            let mut response = Response::builder().status(entry.status);
            *response.headers_mut().unwrap() = headers;
            return Ok(response.body(Body::from(entry.body)).unwrap());
        }
    }

    let upstream_headers = rw_request::prepare_upstream_headers(
        &state.suffix,
        target_url.host_str().unwrap_or(""),
        req.headers().clone(),
        &state.root_passthrough,
        &state.proxy_passthrough,
    );

    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    let upstream_response = state
        .client
        .request(method.clone(), target_url.clone())
        .headers(upstream_headers)
        .body(body_bytes)
        .send()
        .await?;

    let status = upstream_response.status().as_u16();
    let mut resp_headers = upstream_response.headers().clone();

    if rw_headers::is_status_shortcut(status) {
        rw_headers::sanitize(&mut resp_headers);
        rw_headers::rewrite_set_cookie(&state.suffix, &mut resp_headers);
        rw_headers::rewrite_location(&state.suffix, &target_url, &mut resp_headers);
        rw_headers::set_robots_tag(&mut resp_headers);
        span.finish(status, CacheOutcome::Bypass);
        let body = upstream_response.bytes().await.unwrap_or_default();
        let mut response = Response::builder().status(status);
        *response.headers_mut().unwrap() = resp_headers;
        return Ok(response.body(Body::from(body)).unwrap());
    }

    rw_headers::rewrite_response_headers(&state.suffix, &target_url, &mut resp_headers);

    let content_type = resp_headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.contains("application/pdf") {
        resp_headers.insert(
            http::header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment"),
        );
    }

    let upstream_bytes = upstream_response.bytes().await.unwrap_or_default();
    let is_html = content_type.contains("text/html");
    let active_mods = active_compiled_mods(
        &state.mods,
        |id| state.config.mod_enabled(id),
        target_url.host_str().unwrap_or(""),
    );
    let rewritten_body = if is_html || upstream_bytes.len() <= MAX_BUFFERED_BODY_BYTES {
        rewrite_body_for_content_type(&state.suffix, &target_url, &content_type, &upstream_bytes, &active_mods)
    } else {
        warn!(len = upstream_bytes.len(), %content_type, "response body exceeds buffering cap, passing through unrewritten");
        upstream_bytes.to_vec()
    };

    if let Ok(len) = HeaderValue::from_str(&rewritten_body.len().to_string()) {
        resp_headers.insert(http::header::CONTENT_LENGTH, len);
    }

    let cache_outcome = if is_get
        && state.config.cache.enabled
        && is_cacheable(status, &resp_headers, &state.config.cache.cacheable_types)
    {
        state.cache.put(
            cache_key_str,
            status,
            resp_headers.clone(),
            rewritten_body.clone().into(),
            state.config.cache.ttl_seconds,
        );
        CacheOutcome::Miss
    } else {
        CacheOutcome::Bypass
    };

    span.finish(status, cache_outcome);

    let mut response = Response::builder().status(status);
    *response.headers_mut().unwrap() = resp_headers;
    Ok(response.body(Body::from(rewritten_body)).unwrap())
}

fn rewrite_body_for_content_type(
    suffix: &Suffix,
    target_url: &Url,
    content_type: &str,
    body: &[u8],
    mods: &[CompiledMod],
) -> Vec<u8> {
    if content_type.contains("text/html") {
        veilproxy_rewrite::html::rewrite_html(suffix, target_url, body, mods).unwrap_or_else(|_| body.to_vec())
    } else if content_type.contains("text/css") {
        let text = String::from_utf8_lossy(body);
        veilproxy_rewrite::css::rewrite_css(suffix, target_url, &text).into_bytes()
    } else if content_type.contains("javascript") {
        let text = String::from_utf8_lossy(body);
        veilproxy_rewrite::js::rewrite_js(&text).into_bytes()
    } else if content_type.contains("json") {
        let text = String::from_utf8_lossy(body);
        veilproxy_rewrite::json::rewrite_json_str(suffix, target_url, &text).into_bytes()
    } else if content_type.contains("xml") {
        let text = String::from_utf8_lossy(body);
        veilproxy_rewrite::xml::rewrite_xml(suffix, target_url, &text).into_bytes()
    } else if content_type.contains("application/pdf") {
        body.to_vec()
    } else {
        body.to_vec()
    }
}

/// C9: accept the client-side WebSocket upgrade with axum's native
/// extractor, then dial the upstream over `tokio-tungstenite` and pump
/// frames bidirectionally until either side closes.
async fn upgrade_websocket(state: AppState, req: Request, target_url: Url) -> Response {
    let mut ws_url = target_url.clone();
    let scheme = if ws_url.scheme() == "https" { "wss" } else { "ws" };
    if ws_url.set_scheme(scheme).is_err() {
        return ProxyError::WebSocketUpgradeFailed("invalid target scheme".into()).into_response();
    }

    let headers = req.headers().clone();
    let upgrade = match WebSocketUpgrade::from_request(req, &()).await {
        Ok(upgrade) => upgrade,
        Err(_) => return ProxyError::WebSocketUpgradeFailed("client did not send a websocket upgrade".into()).into_response(),
    };

    upgrade.on_upgrade(move |client_socket| async move {
        if let Err(e) = pump_websocket(&state, client_socket, ws_url, headers).await {
            warn!(error = %e, "websocket tunnel ended with error");
        }
    })
}

async fn pump_websocket(
    state: &AppState,
    client_socket: axum::extract::ws::WebSocket,
    ws_url: Url,
    headers: HeaderMap,
) -> Result<(), ProxyError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::WebSocketUpgradeFailed(e.to_string()))?;
    if let Some(value) = headers.get(http::header::SEC_WEBSOCKET_PROTOCOL) {
        request.headers_mut().insert("Sec-WebSocket-Protocol", value.clone());
    }
    let upstream_headers = rw_request::prepare_upstream_headers(
        &state.suffix,
        ws_url.host_str().unwrap_or(""),
        headers,
        &state.root_passthrough,
        &state.proxy_passthrough,
    );
    for name in [http::header::COOKIE, http::header::USER_AGENT, http::header::ORIGIN] {
        if let Some(value) = upstream_headers.get(&name) {
            request.headers_mut().insert(name, value.clone());
        }
    }

    let (upstream_ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ProxyError::WebSocketUpgradeFailed(e.to_string()))?;

    let (mut upstream_sink, mut upstream_stream) = upstream_ws.split();
    let (mut client_sink, mut client_stream) = client_socket.split();

    // Per-direction message order is preserved; cross-direction ordering is
    // not — select! races the two reads and forwards whichever arrives.
    loop {
        tokio::select! {
            msg = client_stream.next() => {
                match msg {
                    Some(Ok(axum::extract::ws::Message::Close(frame))) => {
                        let close = frame.map(to_tungstenite_close);
                        let _ = upstream_sink.send(TungsteniteMessage::Close(close)).await;
                        break;
                    }
                    Some(Ok(message)) => {
                        if upstream_sink.send(to_tungstenite_message(message)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(_)) | None => break,
                }
            }
            msg = upstream_stream.next() => {
                match msg {
                    Some(Ok(TungsteniteMessage::Close(frame))) => {
                        let close = frame.map(to_axum_close);
                        let _ = client_sink.send(axum::extract::ws::Message::Close(close)).await;
                        break;
                    }
                    Some(Ok(TungsteniteMessage::Frame(_))) => continue,
                    Some(Ok(message)) => {
                        if client_sink.send(to_axum_message(message)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "upstream websocket read failed");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

fn to_tungstenite_close(frame: axum::extract::ws::CloseFrame) -> tokio_tungstenite::tungstenite::protocol::CloseFrame<'static> {
    tokio_tungstenite::tungstenite::protocol::CloseFrame {
        code: frame.code.into(),
        reason: frame.reason.to_string().into(),
    }
}

fn to_axum_close(frame: tokio_tungstenite::tungstenite::protocol::CloseFrame<'static>) -> axum::extract::ws::CloseFrame {
    axum::extract::ws::CloseFrame {
        code: frame.code.into(),
        reason: frame.reason.to_string().into(),
    }
}

fn to_tungstenite_message(message: axum::extract::ws::Message) -> tokio_tungstenite::tungstenite::Message {
    match message {
        axum::extract::ws::Message::Binary(data) => TungsteniteMessage::Binary(data.to_vec()),
        axum::extract::ws::Message::Text(text) => TungsteniteMessage::Text(text.to_string()),
        axum::extract::ws::Message::Ping(data) => TungsteniteMessage::Ping(data.to_vec()),
        axum::extract::ws::Message::Pong(data) => TungsteniteMessage::Pong(data.to_vec()),
        axum::extract::ws::Message::Close(_) => unreachable!("close handled by caller"),
    }
}

fn to_axum_message(message: tokio_tungstenite::tungstenite::Message) -> axum::extract::ws::Message {
    match message {
        TungsteniteMessage::Binary(data) => axum::extract::ws::Message::Binary(data.into()),
        TungsteniteMessage::Text(text) => axum::extract::ws::Message::Text(text.into()),
        TungsteniteMessage::Ping(data) => axum::extract::ws::Message::Ping(data.into()),
        TungsteniteMessage::Pong(data) => axum::extract::ws::Message::Pong(data.into()),
        TungsteniteMessage::Close(_) | TungsteniteMessage::Frame(_) => {
            unreachable!("close/raw-frame handled by caller")
        }
    }
}
