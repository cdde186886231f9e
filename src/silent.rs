// ABOUTME: OIDC prompt=none error classification for silent authentication fallback
// ABOUTME: Parses provider callback errors and client redirect URLs into typed results
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Silent-authentication helpers.
//!
//! When a client runs the flow with `prompt=none`, the provider signals that
//! interaction is required with one of four well-known error codes (OIDC Core
//! 3.1.2.6). Those codes are relayed to the client verbatim so it can fall
//! back to an interactive flow; these helpers classify them on both sides.

use serde::{Deserialize, Serialize};
use url::Url;

/// The four OIDC error codes that indicate silent authentication cannot
/// proceed without user interaction.
pub const SILENT_AUTH_ERROR_CODES: [&str; 4] = [
    "login_required",
    "consent_required",
    "interaction_required",
    "account_selection_required",
];

/// Whether an error code is one of the silent-authentication codes.
#[must_use]
pub fn is_silent_auth_error(code: &str) -> bool {
    SILENT_AUTH_ERROR_CODES.contains(&code)
}

/// A classified silent-authentication failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilentAuthError {
    /// The OIDC error code, passed through verbatim.
    pub error: String,
    /// Provider-supplied description, if any.
    pub error_description: Option<String>,
    /// The client `state` echoed on the redirect, if any.
    pub state: Option<String>,
}

impl SilentAuthError {
    /// User-facing suggestion for this failure.
    #[must_use]
    pub fn fallback_hint(&self) -> &'static str {
        match self.error.as_str() {
            "login_required" => "The user must sign in again; retry without prompt=none",
            "consent_required" => "The user must grant consent; retry interactively",
            "account_selection_required" => {
                "The user must pick an account; retry interactively"
            }
            _ => "User interaction is required; retry without prompt=none",
        }
    }
}

/// Classify the error parameters a client received on its redirect URI.
///
/// Returns `None` when the URL does not parse, carries no `error` parameter,
/// or the error is not a silent-authentication code.
#[must_use]
pub fn classify_redirect_error(redirect_url: &str) -> Option<SilentAuthError> {
    let url = Url::parse(redirect_url).ok()?;
    let mut error = None;
    let mut description = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }

    let error = error?;
    if !is_silent_auth_error(&error) {
        return None;
    }
    Some(SilentAuthError {
        error,
        error_description: description,
        state,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_all_four_codes() {
        for code in SILENT_AUTH_ERROR_CODES {
            assert!(is_silent_auth_error(code));
        }
        assert!(!is_silent_auth_error("access_denied"));
        assert!(!is_silent_auth_error("server_error"));
    }

    #[test]
    fn classifies_redirect_url() {
        let url = "http://127.0.0.1:8765/cb?error=login_required&error_description=Session%20expired&state=s1";
        let classified = classify_redirect_error(url).unwrap();
        assert_eq!(classified.error, "login_required");
        assert_eq!(classified.error_description.as_deref(), Some("Session expired"));
        assert_eq!(classified.state.as_deref(), Some("s1"));
    }

    #[test]
    fn non_silent_errors_are_not_classified() {
        assert!(classify_redirect_error("http://127.0.0.1/cb?error=access_denied&state=s").is_none());
        assert!(classify_redirect_error("http://127.0.0.1/cb?code=abc&state=s").is_none());
        assert!(classify_redirect_error("not-a-url").is_none());
    }
}
