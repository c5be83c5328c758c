//! Authentication against the hosted auth endpoint.
//!
//! The protocol internals (token refresh, password hashing) belong to the
//! provider; this adapter only exchanges credentials for a user id and a
//! bearer token, and publishes that token into the shared [`TokenCell`] the
//! REST store reads from.

use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;

use crate::store::TokenCell;

const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug)]
pub enum AuthError {
    Http(String),
    Decode(serde_json::Error),
    /// The provider refused the credentials.
    InvalidCredentials,
    NotSignedIn,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Http(e) => write!(f, "http error: {e}"),
            AuthError::Decode(e) => write!(f, "decode error: {e}"),
            AuthError::InvalidCredentials => write!(f, "invalid email or password"),
            AuthError::NotSignedIn => write!(f, "not signed in"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::Decode(e)
    }
}

impl From<ureq::Error> for AuthError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(code, _) if (400..=403).contains(&code) => {
                AuthError::InvalidCredentials
            }
            other => AuthError::Http(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AuthError {
    fn from(e: std::io::Error) -> Self {
        AuthError::Http(e.to_string())
    }
}

/// Session identity as the rest of the crate sees it.
pub trait AuthProvider: Send + Sync {
    /// Signed-in user id, if any.
    fn current_user(&self) -> Option<String>;
    /// Exchange credentials for a session; returns the user id.
    fn sign_in(&self, email: &str, password: &str) -> Result<String, AuthError>;
    /// Register a new account; returns the new user id.
    fn sign_up(&self, email: &str, password: &str) -> Result<String, AuthError>;
    fn sign_out(&self) -> Result<(), AuthError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: String,
}

struct AuthSession {
    user_id: String,
    access_token: String,
}

/// [`AuthProvider`] over the hosted auth REST endpoint.
pub struct RestAuth {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    token: TokenCell,
    session: RwLock<Option<AuthSession>>,
}

impl RestAuth {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, token: TokenCell) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            token,
            session: RwLock::new(None),
        }
    }

    fn store_session(&self, resp: TokenResponse) -> String {
        let user_id = resp.user.id.clone();
        if let Ok(mut token) = self.token.write() {
            *token = Some(resp.access_token.clone());
        }
        if let Ok(mut session) = self.session.write() {
            *session = Some(AuthSession {
                user_id: user_id.clone(),
                access_token: resp.access_token,
            });
        }
        user_id
    }

    fn post_credentials(
        &self,
        path: &str,
        email: &str,
        password: &str,
    ) -> Result<TokenResponse, AuthError> {
        let url = format!("{}/auth/v1/{}", self.base_url, path);
        let resp: TokenResponse = self
            .agent
            .post(&url)
            .set("apikey", &self.api_key)
            .send_json(serde_json::json!({ "email": email, "password": password }))?
            .into_json()?;
        Ok(resp)
    }
}

impl AuthProvider for RestAuth {
    fn current_user(&self) -> Option<String> {
        self.session
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.user_id.clone()))
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<String, AuthError> {
        let resp = self.post_credentials("token?grant_type=password", email, password)?;
        Ok(self.store_session(resp))
    }

    fn sign_up(&self, email: &str, password: &str) -> Result<String, AuthError> {
        let resp = self.post_credentials("signup", email, password)?;
        Ok(self.store_session(resp))
    }

    fn sign_out(&self) -> Result<(), AuthError> {
        let access_token = {
            let session = self
                .session
                .read()
                .map_err(|_| AuthError::NotSignedIn)?;
            match session.as_ref() {
                Some(s) => s.access_token.clone(),
                None => return Err(AuthError::NotSignedIn),
            }
        };

        let url = format!("{}/auth/v1/logout", self.base_url);
        let result = self
            .agent
            .post(&url)
            .set("apikey", &self.api_key)
            .set("Authorization", &format!("Bearer {access_token}"))
            .call();

        // Local teardown happens regardless: a failed revoke must not leave
        // a usable token behind on the device.
        if let Ok(mut token) = self.token.write() {
            *token = None;
        }
        if let Ok(mut session) = self.session.write() {
            *session = None;
        }

        result.map(|_| ()).map_err(AuthError::from)
    }
}
