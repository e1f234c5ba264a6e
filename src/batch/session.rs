use std::collections::BTreeMap;

use cookie_store::RawCookie;
use dashmap::DashMap;
use http::{HeaderValue, header};
use url::Url;

use crate::{PendingRequest, Response};

/// Per-host cookies and referer carried from one request to the next.
///
/// This is not a cookie jar: cookies are keyed by host and
/// name only, the last `Set-Cookie` wins, and path, domain and expiry
/// attributes are ignored.
#[derive(Debug, Default)]
pub(crate) struct SessionStore {
    persist_cookies: bool,
    persist_referer: bool,
    cookies: DashMap<String, BTreeMap<String, String>>,
    referers: DashMap<String, Url>,
}

impl SessionStore {
    pub(crate) fn new(persist_cookies: bool, persist_referer: bool) -> Self {
        Self {
            persist_cookies,
            persist_referer,
            ..Self::default()
        }
    }

    /// Merge stored cookies and referer into `request`.
    pub(crate) fn apply(&self, request: &mut PendingRequest) {
        let Some(host) = request.host() else {
            return;
        };

        if self.persist_cookies
            && let Some(cookies) = self.cookies.get(&host)
            && !cookies.is_empty()
        {
            let header = cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            if let Err(e) = request.merge_cookie_header(&header) {
                log::debug!("Skipping stored cookies for {host}: {e}");
            }
        }

        if self.persist_referer
            && !request.headers.contains_key(header::REFERER)
            && let Some(referer) = self.referers.get(&host)
            && let Ok(value) = HeaderValue::from_str(referer.as_str())
        {
            request.headers.insert(header::REFERER, value);
        }
    }

    /// Remember what a completed send leaves for the next request to the
    /// same host: its URL as referer and the cookies the response sets.
    pub(crate) fn record(&self, request: &PendingRequest, response: &Response) {
        let Some(host) = request.host() else {
            return;
        };
        if self.persist_referer {
            self.referers.insert(host.clone(), request.url.clone());
        }
        if !self.persist_cookies {
            return;
        }

        let parsed: Vec<_> = response
            .headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| match RawCookie::parse(value) {
                Ok(cookie) => Some((cookie.name().to_string(), cookie.value().to_string())),
                Err(e) => {
                    log::debug!("Ignoring invalid Set-Cookie from {host}: {e}");
                    None
                }
            })
            .collect();
        if parsed.is_empty() {
            return;
        }

        self.cookies
            .entry(host)
            .or_default()
            .extend(parsed);
    }
}
