//! Test doubles for code that depends on an [`OAuthProvider`].
//!
//! Enabled inside this crate's tests and, for downstream crates, through the
//! `test-util` feature.

use async_trait::async_trait;
use parking_lot::Mutex;
use rootcause::prelude::*;
use std::collections::HashMap;

use crate::error::ProviderError;
use crate::provider::{AccessToken, OAuthProvider};
use crate::user::Identity;

/// A provider that never leaves the process.
///
/// Each authorization code maps to an identity registered with
/// [`StaticProvider::with_code`]. Unknown codes fail the token exchange.
#[derive(Debug, Default)]
pub struct StaticProvider {
    identities: Mutex<HashMap<String, Identity>>,
    fail_identity: bool,
}

impl StaticProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `code` as a valid authorization code for `identity`.
    #[must_use]
    pub fn with_code(self, code: impl Into<String>, identity: Identity) -> Self {
        self.identities.lock().insert(code.into(), identity);
        self
    }

    /// Makes every identity lookup fail.
    #[must_use]
    pub fn failing_identity(mut self) -> Self {
        self.fail_identity = true;
        self
    }
}

#[async_trait]
impl OAuthProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    fn authorization_url(&self, state: &str) -> String {
        format!("https://provider.test/authorize?state={state}")
    }

    async fn exchange_code(
        &self,
        code: &str,
        _state: &str,
    ) -> Result<AccessToken, Report<ProviderError>> {
        if self.identities.lock().contains_key(code) {
            Ok(AccessToken::new(code.to_string()))
        } else {
            Err(ProviderError::TokenExchange {
                reason: "unknown code".to_string(),
            }
            .into())
        }
    }

    async fn fetch_identity(&self, token: &AccessToken) -> Result<Identity, Report<ProviderError>> {
        if self.fail_identity {
            return Err(ProviderError::Identity {
                reason: "identity lookup disabled".to_string(),
            }
            .into());
        }
        self.identities
            .lock()
            .get(token.secret())
            .cloned()
            .ok_or_else(|| {
                ProviderError::Identity {
                    reason: "no identity for token".to_string(),
                }
                .into()
            })
    }
}
