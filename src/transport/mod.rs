//! Cached HTTP clients, one per distinct transport configuration.
//!
//! Building a `reqwest::Client` is expensive (connection pool, TLS setup), so
//! clients are built on first use of a [`TransportKey`] and reused for every
//! later request with the same routing target and transport flags.

use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use reqwest::redirect;
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, HttpVersion, PendingRequest, Result, proxy::RoutingTarget};

/// Default number of redirects followed before a request fails, 10.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;
/// Default timeout for establishing a connection, 10 seconds.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default user agent, `volley/<PKG_VERSION>`.
pub const DEFAULT_USER_AGENT: &str = concat!("volley/", env!("CARGO_PKG_VERSION"));

/// Settings shared by every transport an engine builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportOptions {
    /// Timeout for establishing a connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,

    /// Redirects followed before giving up, if redirects are followed at all
    pub max_redirects: usize,

    /// `User-Agent` sent with every request that doesn't set one
    pub user_agent: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Everything that requires a separate client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey {
    /// Direct or through which proxy
    pub target: RoutingTarget,
    /// Whether server certificates are validated
    pub validate_certificates: bool,
    /// Whether redirects are followed
    pub follow_redirects: bool,
    /// Protocol version
    pub version: HttpVersion,
}

impl TransportKey {
    /// The key a request routed through `target` needs
    #[must_use]
    pub fn for_request(request: &PendingRequest, target: &RoutingTarget) -> Self {
        Self {
            target: target.clone(),
            validate_certificates: request.validate_certificates,
            follow_redirects: request.follow_redirects,
            version: request.version,
        }
    }
}

/// Thread-safe cache of `reqwest` clients.
///
/// Entries live until [`TransportPool::clear`] is called.
#[derive(Debug, Default)]
pub struct TransportPool {
    clients: DashMap<TransportKey, reqwest::Client>,
    options: TransportOptions,
}

impl TransportPool {
    /// Create an empty pool building clients with the given options
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self {
            clients: DashMap::new(),
            options,
        }
    }

    /// Get the client for `key`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy is invalid or the client cannot be
    /// built. Nothing is cached in that case.
    pub fn get(&self, key: &TransportKey) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.get(key) {
            return Ok(client.clone());
        }

        // Build while holding the shard lock so concurrent first uses of the
        // same key end up with a single client.
        match self.clients.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let client = self.build(entry.key())?;
                log::debug!("Built transport for {}", entry.key().target);
                Ok(entry.insert(client).clone())
            }
        }
    }

    /// Number of cached clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client was built yet (or since the last clear)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop all cached clients
    pub fn clear(&self) {
        self.clients.clear();
    }

    fn build(&self, key: &TransportKey) -> Result<reqwest::Client> {
        let redirect_policy = if key.follow_redirects {
            redirect::Policy::limited(self.options.max_redirects)
        } else {
            redirect::Policy::none()
        };

        let mut builder = reqwest::ClientBuilder::new()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .user_agent(&self.options.user_agent)
            .danger_accept_invalid_certs(!key.validate_certificates)
            .redirect(redirect_policy);

        if let Some(timeout) = self.options.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        builder = match &key.target {
            RoutingTarget::Direct => builder.no_proxy(),
            RoutingTarget::Proxy(proxy) => builder.proxy(proxy.to_reqwest()?),
        };

        builder = match key.version {
            HttpVersion::Auto => builder,
            HttpVersion::Http1 => builder.http1_only(),
            HttpVersion::Http2 => builder.http2_prior_knowledge(),
        };

        builder.build().map_err(ErrorKind::BuildTransport)
    }
}
