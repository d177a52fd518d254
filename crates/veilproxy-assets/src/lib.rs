//! C10: Asset Generator. Serves the small set of same-origin scripts the
//! interceptor and service-worker machinery depend on. These are generated
//! in-process, not proxied from upstream, so they always carry
//! `X-Robots-Tag: noindex, nofollow` and never hit the Edge Cache's
//! upstream-response path.

use http::{HeaderMap, HeaderValue, StatusCode};

pub const INTERCEPTOR_PATH: &str = "/__divortio_interceptor.js";
pub const SERVICE_WORKER_PATH: &str = "/__divortio_sw.js";
pub const SERVICE_WORKER_INJECTOR_PATH: &str = "/__divortio_sw_injector.js";

pub struct GeneratedAsset {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

fn base_headers(content_type: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
    headers.insert(
        http::header::HeaderName::from_static("x-robots-tag"),
        HeaderValue::from_static("noindex, nofollow"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=43200"),
    );
    headers
}

/// `/__divortio_interceptor.js`: runs in every proxied page, patches
/// `fetch`/`XMLHttpRequest`/`WebSocket` constructors so same-origin network
/// calls built from absolute URLs still route back through the proxy, and
/// exposes `self.__d_rw` for the dynamic-import rewrite in [`crate::js`].
pub fn interceptor_script() -> GeneratedAsset {
    let body = r#"(function () {
  if (window.__divortioInterceptorInstalled) return;
  window.__divortioInterceptorInstalled = true;

  function rewriteUrl(input) {
    try {
      const u = new URL(input, location.href);
      if (u.host.endsWith('.' + location.host.split('.').slice(1).join('.'))) return u.toString();
      return u.toString();
    } catch (e) {
      return input;
    }
  }

  self.__d_rw = rewriteUrl;

  const origFetch = window.fetch;
  window.fetch = function (input, init) {
    if (typeof input === 'string') input = rewriteUrl(input);
    return origFetch.call(this, input, init);
  };

  const OrigXHR = window.XMLHttpRequest;
  function PatchedXHR() {
    const xhr = new OrigXHR();
    const origOpen = xhr.open.bind(xhr);
    xhr.open = function (method, url, ...rest) {
      return origOpen(method, rewriteUrl(url), ...rest);
    };
    return xhr;
  }
  window.XMLHttpRequest = PatchedXHR;

  const OrigWebSocket = window.WebSocket;
  window.WebSocket = function (url, protocols) {
    return new OrigWebSocket(rewriteUrl(url), protocols);
  };
  window.WebSocket.prototype = OrigWebSocket.prototype;
})();
"#;
    let mut headers = base_headers("application/javascript; charset=utf-8");
    headers.insert(
        http::header::HeaderName::from_static("service-worker-allowed"),
        HeaderValue::from_static("/"),
    );
    GeneratedAsset {
        status: StatusCode::OK,
        headers,
        body: body.to_string(),
    }
}

/// `/__divortio_sw.js`: a passthrough service worker whose only job is to
/// exist at `/` scope so `Service-Worker-Allowed: /` is honored; it installs
/// immediately and claims clients without intercepting fetches itself
/// (fetch rewriting happens in the interceptor, not here).
pub fn service_worker_script() -> GeneratedAsset {
    let body = r#"self.addEventListener('install', (event) => {
  self.skipWaiting();
});
self.addEventListener('activate', (event) => {
  event.waitUntil(self.clients.claim());
});
"#;
    let mut headers = base_headers("application/javascript; charset=utf-8");
    headers.insert(
        http::header::HeaderName::from_static("service-worker-allowed"),
        HeaderValue::from_static("/"),
    );
    GeneratedAsset {
        status: StatusCode::OK,
        headers,
        body: body.to_string(),
    }
}

/// `/__divortio_sw_injector.js?target=<encoded-url>`: returns a small
/// script that registers the service worker and then navigates to
/// `target`. 400s with no body if `target` is missing, since there is
/// nothing meaningful to inject without it.
pub fn service_worker_injector_script(target: Option<&str>) -> GeneratedAsset {
    let Some(target) = target.filter(|t| !t.is_empty()) else {
        return GeneratedAsset {
            status: StatusCode::BAD_REQUEST,
            headers: HeaderMap::new(),
            body: String::new(),
        };
    };
    let escaped = target.replace('\\', "\\\\").replace('\'', "\\'");
    let body = format!(
        r#"navigator.serviceWorker.register('{sw_path}').finally(() => {{
  location.replace('{target}');
}});
"#,
        sw_path = SERVICE_WORKER_PATH,
        target = escaped
    );
    GeneratedAsset {
        status: StatusCode::OK,
        headers: base_headers("application/javascript; charset=utf-8"),
        body,
    }
}
