//! Auth session lifecycle: `SignedOut -> Authenticating -> SignedIn(user)`.
//!
//! The manager owns the tokens, persists them for silent restore, and
//! publishes transitions on a broadcast channel. Which persistence backend is
//! live is decided by the state held here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::Url;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::kv::KeyValueStore;
use crate::models::{AuthSession, SignUpResponse, User};

pub const SESSION_KEY: &str = "todolists-auth";

const DEFAULT_EXPIRES_IN: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    SignedOut,
    Authenticating,
    SignedIn(User),
}

/// Published on every transition into or out of `SignedIn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(User),
    SignedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    SignedIn(User),
    /// The backend wants the address confirmed before issuing a session.
    ConfirmationRequired(String),
}

/// Auth operations of the hosted backend.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, AuthError>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpResponse, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError>;

    async fn get_user(&self, access_token: &str) -> Result<User, AuthError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError>;
}

/// Shared view of the current tokens, read by the table client and remote store.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle(Arc<RwLock<Option<AuthSession>>>);

impl SessionHandle {
    pub fn get(&self) -> Option<AuthSession> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, session: Option<AuthSession>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = session;
    }

    pub fn access_token(&self) -> Option<String> {
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    pub fn user_id(&self) -> Option<String> {
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.user.id.clone())
    }
}

pub struct SessionManager {
    provider: Arc<dyn AuthProvider>,
    storage: Arc<dyn KeyValueStore>,
    handle: SessionHandle,
    state: AuthState,
    events: broadcast::Sender<AuthEvent>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn AuthProvider>, storage: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        SessionManager {
            provider,
            storage,
            handle: SessionHandle::default(),
            state: AuthState::SignedOut,
            events,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn user(&self) -> Option<&User> {
        match &self.state {
            AuthState::SignedIn(user) => Some(user),
            _ => None,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self.state, AuthState::SignedIn(_))
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Silent restore from the saved tokens. Tries the access token, then one
    /// refresh; lands in `SignedOut` otherwise.
    pub async fn restore(&mut self) -> &AuthState {
        let saved = match self.storage.get(SESSION_KEY) {
            Ok(Some(raw)) => serde_json::from_str::<AuthSession>(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read saved session");
                None
            }
        };
        let Some(saved) = saved else {
            debug!("No saved session");
            return &self.state;
        };

        self.state = AuthState::Authenticating;
        match self.provider.get_user(&saved.access_token).await {
            Ok(user) => {
                let session = AuthSession { user, ..saved };
                self.enter_signed_in(session);
            }
            Err(AuthError::Unauthorized) => match self.provider.refresh(&saved.refresh_token).await {
                Ok(session) => {
                    self.enter_signed_in(session);
                }
                Err(e) => {
                    info!(error = %e, "Saved session expired");
                    self.forget_saved();
                    self.state = AuthState::SignedOut;
                }
            },
            Err(e) => {
                // keep the saved tokens for the next start
                warn!(error = %e, "Session restore failed");
                self.state = AuthState::SignedOut;
            }
        }
        &self.state
    }

    /// A failed attempt leaves the previous state, tokens included, untouched.
    pub async fn sign_in(&mut self, email: &str, password: &str) -> Result<User, AuthError> {
        let previous = std::mem::replace(&mut self.state, AuthState::Authenticating);
        match self
            .provider
            .sign_in_with_password(email.trim(), password)
            .await
        {
            Ok(session) => Ok(self.enter_signed_in(session)),
            Err(e) => {
                info!(error = %e, "Sign in failed");
                self.state = previous;
                Err(e)
            }
        }
    }

    pub async fn sign_up(&mut self, email: &str, password: &str) -> Result<SignUpOutcome, AuthError> {
        let previous = std::mem::replace(&mut self.state, AuthState::Authenticating);
        match self.provider.sign_up(email.trim(), password).await {
            Ok(SignUpResponse {
                session: Some(session),
                ..
            }) => Ok(SignUpOutcome::SignedIn(self.enter_signed_in(session))),
            Ok(SignUpResponse { user, session: None }) => {
                self.state = previous;
                info!(email = %user.email, "Sign up needs email confirmation");
                Ok(SignUpOutcome::ConfirmationRequired(format!(
                    "Check {} for a confirmation link, then sign in.",
                    user.email
                )))
            }
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    /// Finish an OAuth redirect whose URL carries the tokens in its fragment or query.
    pub async fn complete_oauth_redirect(&mut self, redirect_url: &str) -> Result<User, AuthError> {
        let params = redirect_params(redirect_url)?;
        if let Some(error) = params
            .get("error_description")
            .or_else(|| params.get("error"))
        {
            return Err(AuthError::Provider(error.clone()));
        }
        let access_token = params
            .get("access_token")
            .cloned()
            .ok_or_else(|| AuthError::Provider("redirect carries no access token".into()))?;

        let previous = std::mem::replace(&mut self.state, AuthState::Authenticating);
        let user = match self.provider.get_user(&access_token).await {
            Ok(user) => user,
            Err(e) => {
                self.state = previous;
                return Err(e);
            }
        };

        let session = AuthSession {
            access_token,
            refresh_token: params.get("refresh_token").cloned().unwrap_or_default(),
            token_type: params
                .get("token_type")
                .cloned()
                .unwrap_or_else(|| "bearer".into()),
            expires_in: params
                .get("expires_in")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_EXPIRES_IN),
            user,
        };
        Ok(self.enter_signed_in(session))
    }

    /// Take over a session obtained elsewhere, e.g. another browsing context.
    pub fn adopt(&mut self, session: AuthSession) -> User {
        self.enter_signed_in(session)
    }

    pub async fn sign_out(&mut self) {
        if let Some(token) = self.handle.access_token() {
            if let Err(e) = self.provider.sign_out(&token).await {
                // local sign-out proceeds regardless
                warn!(error = %e, "Remote sign out failed");
            }
        }
        self.enter_signed_out();
    }

    /// The session was invalidated outside this process.
    pub fn invalidate(&mut self) {
        self.enter_signed_out();
    }

    fn enter_signed_in(&mut self, session: AuthSession) -> User {
        let user = session.user.clone();
        match serde_json::to_string(&session) {
            Ok(raw) => {
                if let Err(e) = self.storage.set(SESSION_KEY, &raw) {
                    warn!(error = %e, "Failed to save session");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode session"),
        }
        self.handle.set(Some(session));
        self.state = AuthState::SignedIn(user.clone());
        info!(user_id = %user.id, "Signed in");
        let _ = self.events.send(AuthEvent::SignedIn(user.clone()));
        user
    }

    fn enter_signed_out(&mut self) {
        let was_signed_in = self.is_signed_in();
        self.forget_saved();
        self.handle.set(None);
        self.state = AuthState::SignedOut;
        if was_signed_in {
            info!("Signed out");
            let _ = self.events.send(AuthEvent::SignedOut);
        }
    }

    fn forget_saved(&self) {
        if let Err(e) = self.storage.remove(SESSION_KEY) {
            warn!(error = %e, "Failed to clear saved session");
        }
    }
}

/// Query and fragment parameters of a redirect URL; fragment values win.
fn redirect_params(redirect_url: &str) -> Result<HashMap<String, String>, AuthError> {
    let url = Url::parse(redirect_url)
        .map_err(|e| AuthError::Provider(format!("invalid redirect url: {e}")))?;
    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(fragment) = url.fragment() {
        let mut as_query = url.clone();
        as_query.set_query(Some(fragment));
        params.extend(as_query.query_pairs().into_owned());
    }
    Ok(params)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Scriptable provider; any password equal to `password` signs in.
    pub struct FakeProvider {
        pub password: String,
        pub confirm_email: bool,
        pub valid_tokens: Mutex<Vec<String>>,
        pub refreshable: Mutex<Vec<String>>,
        pub signed_out: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        pub fn new(password: &str) -> Self {
            FakeProvider {
                password: password.to_string(),
                confirm_email: false,
                valid_tokens: Mutex::new(Vec::new()),
                refreshable: Mutex::new(Vec::new()),
                signed_out: Mutex::new(Vec::new()),
            }
        }

        pub fn user(email: &str) -> User {
            User {
                id: format!("user-{email}"),
                email: email.to_string(),
                created_at: 0,
            }
        }

        fn issue(&self, email: &str, n: usize) -> AuthSession {
            let access = format!("access-{email}-{n}");
            let refresh = format!("refresh-{email}-{n}");
            self.valid_tokens.lock().unwrap().push(access.clone());
            self.refreshable.lock().unwrap().push(refresh.clone());
            AuthSession {
                access_token: access,
                refresh_token: refresh,
                token_type: "bearer".into(),
                expires_in: 3600,
                user: Self::user(email),
            }
        }
    }

    #[async_trait]
    impl AuthProvider for FakeProvider {
        async fn sign_in_with_password(
            &self,
            email: &str,
            password: &str,
        ) -> Result<AuthSession, AuthError> {
            if password != self.password {
                return Err(AuthError::InvalidCredentials);
            }
            let n = self.valid_tokens.lock().unwrap().len();
            Ok(self.issue(email, n))
        }

        async fn sign_up(&self, email: &str, _password: &str) -> Result<SignUpResponse, AuthError> {
            if self.confirm_email {
                return Ok(SignUpResponse {
                    user: Self::user(email),
                    session: None,
                });
            }
            let n = self.valid_tokens.lock().unwrap().len();
            let session = self.issue(email, n);
            Ok(SignUpResponse {
                user: session.user.clone(),
                session: Some(session),
            })
        }

        async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError> {
            let known = self
                .refreshable
                .lock()
                .unwrap()
                .iter()
                .any(|t| t == refresh_token);
            if !known {
                return Err(AuthError::Unauthorized);
            }
            let email = refresh_token
                .trim_start_matches("refresh-")
                .rsplit_once('-')
                .map(|(e, _)| e.to_string())
                .unwrap_or_default();
            let n = self.valid_tokens.lock().unwrap().len();
            Ok(self.issue(&email, n))
        }

        async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
            if !self
                .valid_tokens
                .lock()
                .unwrap()
                .iter()
                .any(|t| t == access_token)
            {
                return Err(AuthError::Unauthorized);
            }
            let email = access_token
                .trim_start_matches("access-")
                .rsplit_once('-')
                .map(|(e, _)| e.to_string())
                .unwrap_or_default();
            Ok(Self::user(&email))
        }

        async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
            self.valid_tokens
                .lock()
                .unwrap()
                .retain(|t| t != access_token);
            self.signed_out.lock().unwrap().push(access_token.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeProvider;
    use super::*;
    use crate::kv::MemoryKv;

    fn manager(provider: FakeProvider) -> (SessionManager, Arc<FakeProvider>, MemoryKv) {
        let provider = Arc::new(provider);
        let kv = MemoryKv::new();
        let manager = SessionManager::new(provider.clone(), Arc::new(kv.clone()));
        (manager, provider, kv)
    }

    #[tokio::test]
    async fn starts_signed_out_without_saved_session() {
        let (mut manager, _, _) = manager(FakeProvider::new("pw"));
        assert_eq!(manager.restore().await, &AuthState::SignedOut);
    }

    #[tokio::test]
    async fn sign_in_persists_and_publishes() {
        let (mut manager, _, kv) = manager(FakeProvider::new("pw"));
        let mut events = manager.subscribe();

        let user = manager.sign_in("a@b.c", "pw").await.unwrap();
        assert_eq!(manager.state(), &AuthState::SignedIn(user.clone()));
        assert!(kv.get(SESSION_KEY).unwrap().is_some());
        assert_eq!(manager.handle().user_id(), Some(user.id.clone()));
        assert_eq!(events.recv().await.unwrap(), AuthEvent::SignedIn(user));
    }

    #[tokio::test]
    async fn bad_credentials_stay_signed_out() {
        let (mut manager, _, kv) = manager(FakeProvider::new("pw"));
        let err = manager.sign_in("a@b.c", "nope").await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
        assert_eq!(manager.state(), &AuthState::SignedOut);
        assert!(kv.get(SESSION_KEY).unwrap().is_none());
        assert!(manager.handle().get().is_none());
    }

    #[tokio::test]
    async fn failed_attempts_keep_an_existing_session() {
        let (mut manager, _, kv) = manager(FakeProvider::new("pw"));
        let user = manager.sign_in("a@b.c", "pw").await.unwrap();
        let token = manager.handle().access_token();

        assert!(manager.sign_in("a@b.c", "nope").await.is_err());
        assert!(manager
            .complete_oauth_redirect("https://app.example/?error=access_denied")
            .await
            .is_err());
        assert!(manager
            .complete_oauth_redirect("https://app.example/#access_token=forged")
            .await
            .is_err());

        assert_eq!(manager.state(), &AuthState::SignedIn(user));
        assert_eq!(manager.handle().access_token(), token);
        assert!(kv.get(SESSION_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn sign_up_with_confirmation_stays_signed_out() {
        let mut provider = FakeProvider::new("pw");
        provider.confirm_email = true;
        let (mut manager, _, _) = manager(provider);
        let outcome = manager.sign_up("new@b.c", "pw").await.unwrap();
        assert!(matches!(outcome, SignUpOutcome::ConfirmationRequired(msg) if msg.contains("new@b.c")));
        assert_eq!(manager.state(), &AuthState::SignedOut);
    }

    #[tokio::test]
    async fn sign_up_with_session_signs_in() {
        let (mut manager, _, _) = manager(FakeProvider::new("pw"));
        let outcome = manager.sign_up("new@b.c", "pw").await.unwrap();
        assert!(matches!(outcome, SignUpOutcome::SignedIn(_)));
        assert!(manager.is_signed_in());
    }

    #[tokio::test]
    async fn restore_uses_saved_tokens() {
        let provider = Arc::new(FakeProvider::new("pw"));
        let kv = MemoryKv::new();
        let mut first = SessionManager::new(provider.clone(), Arc::new(kv.clone()));
        let user = first.sign_in("a@b.c", "pw").await.unwrap();

        let mut second = SessionManager::new(provider, Arc::new(kv));
        assert_eq!(second.restore().await, &AuthState::SignedIn(user));
    }

    #[tokio::test]
    async fn restore_refreshes_expired_access_token() {
        let provider = Arc::new(FakeProvider::new("pw"));
        let kv = MemoryKv::new();
        let mut first = SessionManager::new(provider.clone(), Arc::new(kv.clone()));
        first.sign_in("a@b.c", "pw").await.unwrap();
        provider.valid_tokens.lock().unwrap().clear();

        let mut second = SessionManager::new(provider.clone(), Arc::new(kv));
        assert!(matches!(second.restore().await, AuthState::SignedIn(_)));
        let token = second.handle().access_token().unwrap();
        assert!(provider.valid_tokens.lock().unwrap().contains(&token));
    }

    #[tokio::test]
    async fn restore_with_dead_tokens_signs_out_and_forgets() {
        let provider = Arc::new(FakeProvider::new("pw"));
        let kv = MemoryKv::new();
        let mut first = SessionManager::new(provider.clone(), Arc::new(kv.clone()));
        first.sign_in("a@b.c", "pw").await.unwrap();
        provider.valid_tokens.lock().unwrap().clear();
        provider.refreshable.lock().unwrap().clear();

        let mut second = SessionManager::new(provider, Arc::new(kv.clone()));
        assert_eq!(second.restore().await, &AuthState::SignedOut);
        assert!(kv.get(SESSION_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn sign_out_revokes_and_clears() {
        let (mut manager, provider, kv) = manager(FakeProvider::new("pw"));
        manager.sign_in("a@b.c", "pw").await.unwrap();
        let token = manager.handle().access_token().unwrap();
        let mut events = manager.subscribe();

        manager.sign_out().await;
        assert_eq!(manager.state(), &AuthState::SignedOut);
        assert!(kv.get(SESSION_KEY).unwrap().is_none());
        assert_eq!(provider.signed_out.lock().unwrap().as_slice(), &[token]);
        assert_eq!(events.recv().await.unwrap(), AuthEvent::SignedOut);
    }

    #[tokio::test]
    async fn oauth_redirect_fragment_signs_in() {
        let (mut manager, provider, _) = manager(FakeProvider::new("pw"));
        provider
            .valid_tokens
            .lock()
            .unwrap()
            .push("access-o@b.c-9".into());

        let user = manager
            .complete_oauth_redirect(
                "https://app.example/#access_token=access-o%40b.c-9&refresh_token=r&expires_in=60",
            )
            .await
            .unwrap();
        assert_eq!(user.email, "o@b.c");
        let session = manager.handle().get().unwrap();
        assert_eq!(session.expires_in, 60);
        assert_eq!(session.refresh_token, "r");
    }

    #[tokio::test]
    async fn oauth_redirect_error_is_surfaced() {
        let (mut manager, _, _) = manager(FakeProvider::new("pw"));
        let err = manager
            .complete_oauth_redirect("https://app.example/?error=access_denied&error_description=User+cancelled")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Provider("User cancelled".into()));
        assert_eq!(manager.state(), &AuthState::SignedOut);
    }
}
