//! HTTP client for the hosted auth API (`/auth/v1`).

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::AuthError;
use crate::models::{AuthSession, Credentials, RefreshRequest, SignUpResponse, User};
use crate::session::AuthProvider;
use crate::table_client::error_message;

#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl AuthClient {
    pub fn new(config: &RemoteConfig) -> Self {
        AuthClient {
            http: Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.anon_key.clone(),
        }
    }

    /// Where to send the browser for a third-party sign in.
    pub fn authorize_url(&self, provider: &str, redirect_to: &str) -> Result<Url, AuthError> {
        let mut url = self.url("authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("redirect_to", redirect_to);
        Ok(url)
    }

    fn url(&self, path: &str) -> Result<Url, AuthError> {
        Url::parse(&format!("{}/auth/v1/{}", self.base_url, path))
            .map_err(|e| AuthError::Provider(format!("invalid url: {e}")))
    }

    async fn token<B: Serialize + Sync>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> Result<Response, AuthError> {
        let mut url = self.url("token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        let resp = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .json(body)
            .send()
            .await?;
        Ok(resp)
    }
}

async fn provider_error(resp: Response) -> AuthError {
    let status = resp.status();
    let message = error_message(resp)
        .await
        .unwrap_or_else(|| status.to_string());
    AuthError::Provider(message)
}

#[async_trait]
impl AuthProvider for AuthClient {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, AuthError> {
        let body = Credentials {
            email: email.to_string(),
            password: password.to_string(),
        };
        let resp = self.token("password", &body).await?;
        match resp.status() {
            s if s.is_success() => Ok(resp.json().await?),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => Err(AuthError::InvalidCredentials),
            _ => Err(provider_error(resp).await),
        }
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpResponse, AuthError> {
        let resp = self
            .http
            .post(self.url("signup")?)
            .header("apikey", &self.api_key)
            .json(&Credentials {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(provider_error(resp).await);
        }
        let body: SignUpResponse = resp.json().await?;
        debug!(user_id = %body.user.id, confirmed = body.session.is_some(), "Signed up");
        Ok(body)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError> {
        let body = RefreshRequest {
            refresh_token: refresh_token.to_string(),
        };
        let resp = self.token("refresh_token", &body).await?;
        match resp.status() {
            s if s.is_success() => Ok(resp.json().await?),
            s if s.is_client_error() => Err(AuthError::Unauthorized),
            _ => Err(provider_error(resp).await),
        }
    }

    async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
        let resp = self
            .http
            .get(self.url("user")?)
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(resp.json().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Unauthorized),
            _ => Err(provider_error(resp).await),
        }
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let resp = self
            .http
            .post(self.url("logout")?)
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        match resp.status() {
            // an already dead token is as good as signed out
            s if s.is_success() || s == StatusCode::UNAUTHORIZED => Ok(()),
            _ => Err(provider_error(resp).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_carries_provider_and_redirect() {
        let client = AuthClient::new(&RemoteConfig {
            url: "http://localhost:9999/".into(),
            anon_key: "anon".into(),
        });
        let url = client
            .authorize_url("github", "https://app.example/cb")
            .unwrap();
        assert_eq!(url.path(), "/auth/v1/authorize");
        assert_eq!(
            url.query(),
            Some("provider=github&redirect_to=https%3A%2F%2Fapp.example%2Fcb")
        );
    }
}
