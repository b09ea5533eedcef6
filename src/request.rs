//! Request identity and intercepted request types.

use bytes::Bytes;
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Header browsers send to describe how a request was initiated.
pub const SEC_FETCH_MODE: &str = "sec-fetch-mode";

/// Identity of a stored entry: method plus absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    /// Upper-cased HTTP method.
    pub method: String,
    /// Absolute URL, fragment stripped.
    pub url: String,
}

impl RequestKey {
    /// Builds a key for `method` and `url`.
    #[must_use]
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Builds a `GET` key for `url`.
    #[must_use]
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Returns true for keys the store is allowed to hold.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET.as_str()
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// How the page initiated a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    /// Script, stylesheet, image, XHR and everything else.
    #[default]
    SubResource,
}

impl RequestMode {
    /// Classifies a request from its method and headers.
    ///
    /// `Sec-Fetch-Mode` wins when present. Older clients don't send it, so a
    /// `GET` that accepts `text/html` counts as a navigation.
    #[must_use]
    pub fn classify(method: &Method, headers: &HeaderMap) -> Self {
        if let Some(mode) = headers.get(SEC_FETCH_MODE).and_then(|v| v.to_str().ok()) {
            return if mode.eq_ignore_ascii_case("navigate") {
                Self::Navigate
            } else {
                Self::SubResource
            };
        }

        let accepts_html = headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.to_ascii_lowercase().contains("text/html"));

        if *method == Method::GET && accepts_html {
            Self::Navigate
        } else {
            Self::SubResource
        }
    }
}

/// A request intercepted on its way from the page to the network.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute target URL.
    pub url: Url,
    /// Whether this is a navigation or a sub-resource load.
    pub mode: RequestMode,
    /// End-to-end request headers forwarded to the network.
    pub headers: HeaderMap,
    /// Request body (empty for `GET`).
    pub body: Bytes,
}

impl ProxyRequest {
    /// Creates a sub-resource request for `url`.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            mode: RequestMode::SubResource,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a sub-resource `GET` for `url`.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Creates a navigation `GET` for `url`.
    #[must_use]
    pub fn navigate(url: Url) -> Self {
        Self::get(url).with_mode(RequestMode::Navigate)
    }

    /// Sets the request mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replaces the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the store key for this request.
    #[must_use]
    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.url)
    }

    /// Returns true for top-level page loads.
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Resolves `target` against `origin`.
///
/// Absolute URLs (`https://cdn.example/lib.js`) are returned unchanged;
/// paths (`/dashboard`) are joined onto the origin.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if `target` is neither an absolute URL nor
/// a path that can be joined onto `origin`.
pub fn resolve(origin: &Url, target: &str) -> Result<Url> {
    match Url::parse(target) {
        Ok(url) => Ok(url),
        Err(_) => origin
            .join(target)
            .map_err(|e| Error::InvalidUrl(format!("{target}: {e}"))),
    }
}
