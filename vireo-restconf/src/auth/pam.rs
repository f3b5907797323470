//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use tracing::{debug, info};

use crate::auth::{Authenticator, Error};

/// Authenticates HTTP Basic credentials against the system PAM stack.
///
/// The `pam` crate doesn't expose the `PAM_FAIL_DELAY` observer, so the
/// delay applied to failed attempts comes from configuration instead of
/// from the PAM modules.
pub struct PamAuthenticator {
    service: String,
    fail_delay: Option<Duration>,
}

// ===== impl PamAuthenticator =====

impl PamAuthenticator {
    pub fn new(
        service: impl Into<String>,
        fail_delay: Option<Duration>,
    ) -> PamAuthenticator {
        let service = service.into();
        info!(%service, "using PAM authentication");
        PamAuthenticator {
            service,
            fail_delay,
        }
    }
}

impl Authenticator for PamAuthenticator {
    fn authenticate(
        &self,
        username: &str,
        password: &str,
        remote_host: Option<&str>,
    ) -> Result<String, Error> {
        let mut authenticator =
            pam::Authenticator::with_password(&self.service).map_err(
                |error| Error::new(format!("PAM: pam_start(): {error}")),
            )?;

        authenticator
            .get_handler()
            .set_credentials(username, password);
        if let Err(error) = authenticator.authenticate() {
            debug!(%username, remote_host = remote_host.unwrap_or("-"),
                %error, "PAM authentication failed");
            return Err(Error::new(format!(
                "PAM: pam_authenticate: {error}"
            ))
            .with_delay(self.fail_delay));
        }

        Ok(username.to_owned())
    }
}
