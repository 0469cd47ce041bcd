use std::sync::RwLock;

use http::HeaderMap;
use http::header::{COOKIE, HeaderName, HeaderValue};
use url::Url;

use crate::config::RequestConfig;
use crate::cookie::{Cookie, CookieJar};
use crate::util::{merge_headers, read_unpoisoned, write_unpoisoned};

/// Per-client mutable state: the cookie jar plus runtime default headers.
#[derive(Debug, Default)]
pub struct Session {
    jar: CookieJar,
    default_headers: RwLock<HeaderMap>,
    cookies_enabled: bool,
}

impl Session {
    pub(crate) fn new(cookies_enabled: bool) -> Self {
        Self {
            jar: CookieJar::new(),
            default_headers: RwLock::new(HeaderMap::new()),
            cookies_enabled,
        }
    }

    pub fn cookie_jar(&self) -> &CookieJar {
        &self.jar
    }

    pub fn cookies_enabled(&self) -> bool {
        self.cookies_enabled
    }

    /// Copy of `config` with session defaults and matching cookies applied.
    ///
    /// Headers already present in `config` win over session defaults, and a
    /// caller-supplied `Cookie` header suppresses the jar.
    pub fn apply_to(&self, config: &RequestConfig, url: &Url) -> RequestConfig {
        let mut applied = config.clone();
        {
            let defaults = read_unpoisoned(&self.default_headers);
            if !defaults.is_empty() {
                applied.headers = merge_headers(&defaults, &config.headers);
            }
        }
        if self.cookies_enabled
            && !applied.headers.contains_key(COOKIE)
            && let Some(cookie_header) = self.jar.header_value(url)
        {
            applied.headers.insert(COOKIE, cookie_header);
        }
        applied
    }

    pub fn update_from(&self, headers: &HeaderMap, url: &Url) {
        if self.cookies_enabled {
            self.jar.store_response_cookies(headers, url);
        }
    }

    pub fn set_cookie(&self, url: &Url, name: impl Into<String>, value: impl Into<String>) {
        self.jar.insert(Cookie::new(name, value, url));
    }

    pub fn cookie(&self, name: &str) -> Option<Cookie> {
        self.jar.get(name)
    }

    pub fn remove_cookie(&self, name: &str) -> usize {
        self.jar.remove(name)
    }

    pub fn clear_cookies(&self) {
        self.jar.clear();
    }

    pub fn cookies(&self) -> Vec<Cookie> {
        self.jar.cookies()
    }

    pub fn set_default_header(&self, name: HeaderName, value: HeaderValue) {
        write_unpoisoned(&self.default_headers).insert(name, value);
    }

    pub fn remove_default_header(&self, name: &HeaderName) -> Option<HeaderValue> {
        write_unpoisoned(&self.default_headers).remove(name)
    }

    pub fn default_headers(&self) -> HeaderMap {
        read_unpoisoned(&self.default_headers).clone()
    }
}
