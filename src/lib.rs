//! Authentication, session and access-gating service.
//!
//! Login runs through [`services::auth::AuthService`]; every later request
//! carries an opaque session cookie that is resolved again on each call.

pub mod clock;
pub mod config;
pub mod cookie;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;

pub mod crypto {
    pub mod aes;
    pub mod password;
    pub mod token;
}

pub mod models {
    pub mod challenge;
    pub mod session;
    pub mod user;
}

pub mod repositories {
    pub mod attempts;
    pub mod challenge;
    pub mod memory;
    pub mod session;
    pub mod user;
}

pub mod services {
    pub mod auth;
    pub mod authorization;
    pub mod credentials;
    pub mod federation;
    pub mod network;
    pub mod sessions;
    pub mod totp;
}

pub mod handlers {
    pub mod auth;
    pub mod network;
    pub mod staff;
}

pub mod middleware_layer {
    pub mod auth;
    pub mod client;
    pub mod staff;
}

pub mod validation {
    pub mod auth;
}
