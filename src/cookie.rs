use tower_cookies::cookie::SameSite;
use tower_cookies::cookie::time::Duration;
use tower_cookies::{Cookie, Cookies};

use crate::crypto::token::OpaqueToken;

/// Carries the session token between the service and the client.
///
/// The cookie value is the bare opaque token: no user id, no role. Every
/// request has to go back through session validation to learn who it is.
#[derive(Debug, Clone)]
pub struct CookieCodec {
    name: String,
    secure: bool,
    max_age_secs: i64,
}

impl CookieCodec {
    pub fn new(name: impl Into<String>, secure: bool, max_age_secs: i64) -> Self {
        Self {
            name: name.into(),
            secure,
            max_age_secs,
        }
    }

    /// Base cookie with the attributes shared by issuance and clearing.
    /// No `Domain` attribute, so the cookie stays host-only.
    fn base(&self, value: String) -> Cookie<'static> {
        let mut cookie = Cookie::new(self.name.clone(), value);
        cookie.set_http_only(true);
        cookie.set_secure(self.secure);
        cookie.set_same_site(SameSite::Strict);
        cookie.set_path("/");
        cookie
    }

    /// Builds the cookie that hands `token` to the client.
    pub fn encode(&self, token: &OpaqueToken) -> Cookie<'static> {
        let mut cookie = self.base(token.as_str().to_string());
        cookie.set_max_age(Duration::seconds(self.max_age_secs));
        cookie
    }

    /// Reads the session token, ignoring anything that is not well-formed.
    pub fn decode(&self, cookies: &Cookies) -> Option<OpaqueToken> {
        cookies
            .get(&self.name)
            .and_then(|cookie| Self::decode_value(cookie.value()))
    }

    fn decode_value(value: &str) -> Option<OpaqueToken> {
        OpaqueToken::parse(value)
    }

    pub fn issue(&self, cookies: &Cookies, token: &OpaqueToken) {
        cookies.add(self.encode(token));
    }

    /// Cookie that tells the client to drop the session cookie: empty value,
    /// zero max-age, expiry in the past, same path and security attributes
    /// as at issuance.
    fn removal(&self) -> Cookie<'static> {
        let mut cookie = self.base(String::new());
        cookie.make_removal();
        cookie
    }

    /// Emits the removal cookie whether or not the request carried one.
    pub fn clear(&self, cookies: &Cookies) {
        cookies.add(self.removal());
    }
}
