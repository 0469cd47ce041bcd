use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::{HeaderValue, SET_COOKIE};
use url::Url;

use crate::util::{read_unpoisoned, write_unpoisoned};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub host_only: bool,
    pub secure: bool,
    pub http_only: bool,
    pub expires: Option<SystemTime>,
}

impl Cookie {
    /// Host-only session cookie scoped to the host and root path of `url`.
    pub fn new(name: impl Into<String>, value: impl Into<String>, url: &Url) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: url.host_str().unwrap_or_default().to_ascii_lowercase(),
            path: "/".to_owned(),
            host_only: true,
            secure: false,
            http_only: false,
            expires: None,
        }
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Parses one `Set-Cookie` value received from `request_url`.
    ///
    /// Returns `None` for malformed values and for `Domain` attributes the
    /// request host does not domain-match.
    pub fn parse(header: &str, request_url: &Url, now: SystemTime) -> Option<Self> {
        let request_host = request_url.host_str()?.to_ascii_lowercase();
        let mut attributes = header.split(';');
        let (name, value) = attributes.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut domain = None;
        let mut path = None;
        let mut expires = None;
        let mut max_age = None;
        let mut secure = false;
        let mut http_only = false;
        for attribute in attributes {
            let (key, raw) = match attribute.split_once('=') {
                Some((key, raw)) => (key.trim(), raw.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => {
                    let candidate = raw.trim_start_matches('.').to_ascii_lowercase();
                    if !candidate.is_empty() {
                        domain = Some(candidate);
                    }
                }
                "path" if raw.starts_with('/') => path = Some(raw.to_owned()),
                "expires" => expires = httpdate::parse_http_date(raw).ok(),
                "max-age" => {
                    if let Ok(seconds) = raw.parse::<i64>() {
                        max_age = Some(if seconds <= 0 {
                            SystemTime::UNIX_EPOCH
                        } else {
                            now.checked_add(Duration::from_secs(seconds.unsigned_abs()))
                                .unwrap_or_else(latest_expiry)
                        });
                    }
                }
                "secure" => secure = true,
                "httponly" => http_only = true,
                _ => {}
            }
        }

        let (domain, host_only) = match domain {
            Some(domain) => {
                if !domain_match(&request_host, &domain) {
                    return None;
                }
                (domain, false)
            }
            None => (request_host, true),
        };

        Some(Self {
            name: name.to_owned(),
            value: value.trim().trim_matches('"').to_owned(),
            domain,
            path: path.unwrap_or_else(|| default_path(request_url.path())),
            host_only,
            secure,
            http_only,
            expires: max_age.or(expires),
        })
    }

    fn matches(&self, url: &Url, now: SystemTime) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(&host, &self.domain)
        };
        domain_ok
            && path_match(url.path(), &self.path)
            && (!self.secure || url.scheme() == "https")
            && !self.is_expired_at(now)
    }

    fn key(&self) -> CookieKey {
        CookieKey {
            domain: self.domain.clone(),
            path: self.path.clone(),
            name: self.name.clone(),
        }
    }
}

/// Expiry for a `Max-Age` too large to add to the clock: the last second of
/// year 9999.
fn latest_expiry() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(253_402_300_799)
}

fn domain_match(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    host.parse::<IpAddr>().is_err()
        && host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct CookieKey {
    domain: String,
    path: String,
    name: String,
}

/// Cookie store keyed by (domain, path, name).
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: RwLock<BTreeMap<CookieKey, Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies every `Set-Cookie` in `headers` under a single write lock.
    pub fn store_response_cookies(&self, headers: &HeaderMap, request_url: &Url) {
        let now = SystemTime::now();
        let parsed: Vec<Cookie> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| Cookie::parse(value, request_url, now))
            .collect();
        if parsed.is_empty() {
            return;
        }
        let mut cookies = write_unpoisoned(&self.cookies);
        for cookie in parsed {
            apply(&mut cookies, cookie, now);
        }
    }

    pub fn insert(&self, cookie: Cookie) {
        let now = SystemTime::now();
        apply(&mut write_unpoisoned(&self.cookies), cookie, now);
    }

    /// First live cookie called `name`, in (domain, path) order.
    pub fn get(&self, name: &str) -> Option<Cookie> {
        let now = SystemTime::now();
        read_unpoisoned(&self.cookies)
            .values()
            .find(|cookie| cookie.name == name && !cookie.is_expired_at(now))
            .cloned()
    }

    /// Removes every cookie called `name`, returning how many were dropped.
    pub fn remove(&self, name: &str) -> usize {
        let mut cookies = write_unpoisoned(&self.cookies);
        let before = cookies.len();
        cookies.retain(|key, _| key.name != name);
        before - cookies.len()
    }

    pub fn clear(&self) {
        write_unpoisoned(&self.cookies).clear();
    }

    pub fn cookies(&self) -> Vec<Cookie> {
        let now = SystemTime::now();
        read_unpoisoned(&self.cookies)
            .values()
            .filter(|cookie| !cookie.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.cookies).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Cookie` header for `url`, longest paths first.
    pub fn header_value(&self, url: &Url) -> Option<HeaderValue> {
        let now = SystemTime::now();
        let (mut matching, expired) = {
            let cookies = read_unpoisoned(&self.cookies);
            let matching: Vec<Cookie> = cookies
                .values()
                .filter(|cookie| cookie.matches(url, now))
                .cloned()
                .collect();
            let expired: Vec<CookieKey> = cookies
                .iter()
                .filter(|(_, cookie)| cookie.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            (matching, expired)
        };
        if !expired.is_empty() {
            let mut cookies = write_unpoisoned(&self.cookies);
            for key in expired {
                if cookies.get(&key).is_some_and(|cookie| cookie.is_expired_at(now)) {
                    cookies.remove(&key);
                }
            }
        }

        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|left, right| right.path.len().cmp(&left.path.len()));
        let header = matching
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header).ok()
    }
}

fn apply(cookies: &mut BTreeMap<CookieKey, Cookie>, cookie: Cookie, now: SystemTime) {
    let key = cookie.key();
    if cookie.is_expired_at(now) {
        cookies.remove(&key);
    } else {
        cookies.insert(key, cookie);
    }
}
