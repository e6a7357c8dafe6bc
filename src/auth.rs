// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Authorization` header generation, threaded across requests.
//!
//! The client owns one [`Authenticator`]. A `401` response's
//! `WWW-Authenticate` header updates it via [`Authenticator::handle_challenge`];
//! every subsequent request asks it for a header. `Digest` arithmetic is
//! delegated to the `digest_auth` crate; `Basic` is base64 credentials.

use std::borrow::Cow;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::error::ErrorInt;
use crate::Error;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't leak the password into logs.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Challenge {
    Basic,
    Digest(Box<digest_auth::WwwAuthenticateHeader>),
}

/// Per-client authentication state: optional credentials plus the most recent
/// server challenge.
#[derive(Debug, Default)]
pub struct Authenticator {
    creds: Option<Credentials>,
    challenge: Option<Challenge>,
}

impl Authenticator {
    pub fn new(creds: Option<Credentials>) -> Self {
        Self {
            creds,
            challenge: None,
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.creds.as_ref()
    }

    pub fn set_credentials(&mut self, creds: Option<Credentials>) {
        self.creds = creds;
    }

    /// True once a challenge has been absorbed; a second `401` after this is
    /// terminal rather than retryable.
    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    /// Forgets the current challenge (connection reset).
    pub fn clear_challenge(&mut self) {
        self.challenge = None;
    }

    /// Absorbs a `WWW-Authenticate` header value, updating realm/nonce state.
    pub fn handle_challenge(&mut self, www_authenticate: &str) -> Result<(), Error> {
        if www_authenticate.starts_with("Basic") {
            self.challenge = Some(Challenge::Basic);
            return Ok(());
        }
        if !www_authenticate.starts_with("Digest") {
            bail!(ErrorInt::InvalidArgument(format!(
                "unsupported authentication scheme requested: {www_authenticate}"
            )));
        }
        let parsed = digest_auth::WwwAuthenticateHeader::parse(www_authenticate).map_err(|e| {
            wrap!(ErrorInt::InvalidArgument(format!(
                "bad WWW-Authenticate header {www_authenticate:?}: {e}"
            )))
        })?;
        self.challenge = Some(Challenge::Digest(Box::new(parsed)));
        Ok(())
    }

    /// Computes an `Authorization` header value for `(method, uri)`.
    ///
    /// Returns `None` before any challenge has been seen. Errors if the
    /// server demanded authentication but no credentials were supplied.
    pub fn authorization_header(
        &mut self,
        method: &rtsp_types::Method,
        uri: &str,
    ) -> Result<Option<String>, Error> {
        let challenge = match self.challenge.as_mut() {
            None => return Ok(None),
            Some(c) => c,
        };
        let creds = match self.creds.as_ref() {
            None => bail!(ErrorInt::FailedPrecondition(
                "authentication required; no credentials supplied".into()
            )),
            Some(c) => c,
        };
        match challenge {
            Challenge::Basic => {
                let encoded = BASE64.encode(format!("{}:{}", creds.username, creds.password));
                Ok(Some(format!("Basic {encoded}")))
            }
            Challenge::Digest(digest) => {
                let ctx = digest_auth::AuthContext::new_with_method(
                    &creds.username,
                    &creds.password,
                    uri,
                    Option::<&'static [u8]>::None,
                    digest_auth::HttpMethod(Cow::Borrowed(Into::<&str>::into(method))),
                );
                let authorization = digest.respond(&ctx).map_err(|e| {
                    wrap!(ErrorInt::InvalidArgument(format!(
                        "unable to answer digest challenge: {e}"
                    )))
                })?;
                Ok(Some(authorization.to_string()))
            }
        }
    }
}
