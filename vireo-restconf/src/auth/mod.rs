//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod nacm;
#[cfg(feature = "pam")]
pub mod pam;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::HeaderMap;
use tokio::sync::watch;
use tracing::{info, trace, warn};
use vireo_datastore::nacm::NacmRules;
use vireo_utils::task::Task;

/// The well-known identity used when no `Authorization` header is supplied.
pub const ANONYMOUS_USER: &str = "yangnobody";
/// The NACM group that must front the anonymous rule-list.
pub const ANONYMOUS_USER_GROUP: &str = "yangnobody";

/// Authentication failure, optionally carrying a delay to apply before the
/// 401 goes out.
#[derive(Debug)]
pub struct Error {
    pub message: String,
    pub delay: Option<Duration>,
}

/// The seam towards the system credential store. The production
/// implementation speaks PAM; tests plug in their own.
pub trait Authenticator: Send + Sync {
    /// Validates the credentials and returns the effective user name,
    /// which may differ from the submitted one.
    fn authenticate(
        &self,
        username: &str,
        password: &str,
        remote_host: Option<&str>,
    ) -> Result<String, Error>;
}

/// Request-boundary authentication and anonymous-access policy.
///
/// The anonymous flag is recomputed whenever the engine republishes the
/// NACM rules, never on the request path.
pub struct AuthGate {
    authenticator: Option<Arc<dyn Authenticator>>,
    anonymous_enabled: Arc<AtomicBool>,
    _policy_watcher: Task<()>,
}

// ===== impl Error =====

impl Error {
    pub fn new(message: impl Into<String>) -> Error {
        Error {
            message: message.into(),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Option<Duration>) -> Error {
        self.delay = delay;
        self
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

// ===== impl AuthGate =====

impl AuthGate {
    pub fn new(
        authenticator: Option<Arc<dyn Authenticator>>,
        mut nacm_rx: watch::Receiver<Arc<NacmRules>>,
    ) -> AuthGate {
        let anonymous_enabled = Arc::new(AtomicBool::new(false));

        let enabled = anonymous_enabled.clone();
        update_anonymous_policy(&enabled, &nacm_rx.borrow());
        let policy_watcher = Task::spawn(async move {
            while nacm_rx.changed().await.is_ok() {
                update_anonymous_policy(&enabled, &nacm_rx.borrow());
            }
        });

        AuthGate {
            authenticator,
            anonymous_enabled,
            _policy_watcher: policy_watcher,
        }
    }

    /// Resolves the identity of a request: HTTP Basic credentials when
    /// present, the anonymous identity otherwise (subject to the
    /// anonymous-access policy).
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        peer: &str,
    ) -> Result<String, Error> {
        let Some(header) = headers.get(http::header::AUTHORIZATION) else {
            if !self.anonymous_enabled.load(Ordering::Relaxed) {
                trace!("anonymous access not configured");
                return Err(Error::new("Access denied."));
            }
            return Ok(ANONYMOUS_USER.to_owned());
        };

        let header = header
            .to_str()
            .map_err(|_| Error::new("Cannot parse the Authorization header"))?
            .to_owned();
        let (username, password) = parse_basic_auth(&header)?;

        let Some(authenticator) = self.authenticator.clone() else {
            return Err(Error::new(
                "Password authentication is not available",
            ));
        };

        // The credential check may block (PAM modules do I/O and enforce
        // fail delays), so it runs off the async workers.
        let peer = peer.to_owned();
        Task::spawn_blocking(move || {
            authenticator.authenticate(&username, &password, Some(&peer))
        })
        .await
        .map_err(|_| Error::new("Authentication task failed"))?
    }
}

// ===== global functions =====

/// Parses an HTTP Basic `Authorization` header into its username and
/// password. The scheme is case-insensitive; the password may contain
/// colons, the username may not.
pub fn parse_basic_auth(header: &str) -> Result<(String, String), Error> {
    let (scheme, blob) = header
        .split_once(' ')
        .ok_or_else(|| Error::new("Cannot parse the Basic authorization header"))?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(Error::new("Cannot parse the Basic authorization header"));
    }

    let decoded = BASE64
        .decode(blob.trim())
        .map_err(|_| Error::new("Cannot parse the Basic authorization header"))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| Error::new("Cannot parse the user-pass authorization blob"))?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| Error::new("Cannot parse the user-pass authorization blob"))?;
    if username.is_empty() || password.is_empty() {
        return Err(Error::new("Cannot parse the user-pass authorization blob"));
    }

    Ok((username.to_owned(), password.to_owned()))
}

// ===== helper functions =====

fn update_anonymous_policy(enabled: &AtomicBool, rules: &NacmRules) {
    let allowed =
        nacm::valid_anonymous_nacm_rules(rules, ANONYMOUS_USER_GROUP);
    if allowed != enabled.swap(allowed, Ordering::Relaxed) {
        if allowed {
            info!("NACM config validation: anonymous user access enabled");
        } else {
            warn!("NACM config validation: anonymous user access disabled");
        }
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(credentials: &str) -> String {
        format!("Basic {}", BASE64.encode(credentials))
    }

    #[test]
    fn basic_auth_roundtrip() {
        let (user, pass) = parse_basic_auth(&encode("alice:secret")).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "secret");
    }

    #[test]
    fn password_may_contain_colons() {
        let (user, pass) =
            parse_basic_auth(&encode("alice:sec:ret:")).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "sec:ret:");
    }

    #[test]
    fn scheme_is_case_insensitive() {
        for scheme in ["basic", "BASIC", "bAsIc"] {
            let header =
                format!("{} {}", scheme, BASE64.encode("bob:pw"));
            let (user, _) = parse_basic_auth(&header).unwrap();
            assert_eq!(user, "bob");
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_basic_auth("Bearer abcdef").is_err());
        assert!(parse_basic_auth("Basic !!!not-base64!!!").is_err());
        assert!(parse_basic_auth(&encode("no-colon-here")).is_err());
        assert!(parse_basic_auth(&encode(":empty-user")).is_err());
        assert!(parse_basic_auth(&encode("empty-pass:")).is_err());
        assert!(parse_basic_auth("Basic").is_err());
    }
}
