//! Security collaborator interfaces.
//!
//! Credentials are obtained through the opaque [`CredentialProvider`]
//! capability. The factory wraps a provider per destination in a
//! [`SecurityTokenProviderContainer`] with an explicit open/close/abort
//! lifecycle; the [`SecurityTokenManager`] shares granted credentials between
//! containers through a cache keyed by URI prefix.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use channelrpc_core::{ChannelError, SharedMruCache};
use futures::future::BoxFuture;
use http::{HeaderValue, Uri};

use crate::timeout::TimeoutBudget;

const CREDENTIAL_CACHE_CAPACITY: usize = 64;
const PREFIX_CACHE_CAPACITY: usize = 256;

/// HTTP authentication scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum AuthScheme {
    #[default]
    Anonymous,
    Basic,
    Bearer,
    Digest,
    Ntlm,
    Negotiate,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Anonymous => "Anonymous",
            AuthScheme::Basic => "Basic",
            AuthScheme::Bearer => "Bearer",
            AuthScheme::Digest => "Digest",
            AuthScheme::Ntlm => "NTLM",
            AuthScheme::Negotiate => "Negotiate",
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, AuthScheme::Anonymous)
    }

    /// Schemes whose identity includes impersonation and authentication level.
    pub fn is_windows_family(&self) -> bool {
        matches!(
            self,
            AuthScheme::Digest | AuthScheme::Ntlm | AuthScheme::Negotiate
        )
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential granted by a provider.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
    /// A pre-computed authorization value for challenge-based schemes.
    Opaque { identity: String, authorization: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => write!(f, "Anonymous"),
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credential::Bearer(_) => write!(f, "Bearer(..)"),
            Credential::Opaque { identity, .. } => f
                .debug_struct("Opaque")
                .field("identity", identity)
                .finish_non_exhaustive(),
        }
    }
}

impl Credential {
    /// Non-secret identity folded into the connection fingerprint.
    pub fn identity(&self) -> String {
        match self {
            Credential::Anonymous => String::new(),
            Credential::Basic { username, .. } => format!("basic:{username}"),
            Credential::Bearer(_) => "bearer".to_string(),
            Credential::Opaque { identity, .. } => format!("opaque:{identity}"),
        }
    }

    /// Value for an `Authorization` or `Proxy-Authorization` header.
    pub fn authorization(&self) -> Result<Option<HeaderValue>, ChannelError> {
        let raw = match self {
            Credential::Anonymous => return Ok(None),
            Credential::Basic { username, password } => {
                format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
            }
            Credential::Bearer(token) => format!("Bearer {token}"),
            Credential::Opaque { authorization, .. } => authorization.clone(),
        };
        let mut value = HeaderValue::from_str(&raw).map_err(|_| {
            ChannelError::Authentication("credential is not a valid header value".into())
        })?;
        value.set_sensitive(true);
        Ok(Some(value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ImpersonationLevel {
    Anonymous,
    #[default]
    Identification,
    Impersonation,
    Delegation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum AuthenticationLevel {
    #[default]
    None,
    MutualAuthRequested,
    MutualAuthRequired,
}

/// Result of `GetCredential`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialGrant {
    pub credential: Credential,
    pub impersonation: ImpersonationLevel,
    pub auth_level: AuthenticationLevel,
}

impl CredentialGrant {
    pub fn anonymous() -> Self {
        Self {
            credential: Credential::Anonymous,
            impersonation: ImpersonationLevel::Anonymous,
            auth_level: AuthenticationLevel::None,
        }
    }

    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            impersonation: ImpersonationLevel::default(),
            auth_level: AuthenticationLevel::default(),
        }
    }

    /// Identity contribution to the connection fingerprint for `scheme`.
    pub fn fingerprint_identity(&self, scheme: AuthScheme) -> String {
        if scheme.is_anonymous() {
            return String::new();
        }
        let mut identity = format!("{scheme}:{}", self.credential.identity());
        if scheme.is_windows_family() {
            identity.push_str(&format!(":{:?}:{:?}", self.impersonation, self.auth_level));
        }
        identity
    }
}

/// Opaque async credential acquisition.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Obtain a credential for `scheme` at `target`, within `timeout`.
    fn get_credential<'a>(
        &'a self,
        scheme: AuthScheme,
        target: &'a Uri,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CredentialGrant, ChannelError>>;
}

/// Provider that returns one fixed credential for every request.
#[derive(Clone, Debug)]
pub struct StaticCredentialProvider {
    grant: CredentialGrant,
}

impl StaticCredentialProvider {
    pub fn new(credential: Credential) -> Self {
        Self {
            grant: CredentialGrant::new(credential),
        }
    }

    pub fn with_levels(
        mut self,
        impersonation: ImpersonationLevel,
        auth_level: AuthenticationLevel,
    ) -> Self {
        self.grant.impersonation = impersonation;
        self.grant.auth_level = auth_level;
        self
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get_credential<'a>(
        &'a self,
        _scheme: AuthScheme,
        _target: &'a Uri,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<CredentialGrant, ChannelError>> {
        let grant = self.grant.clone();
        Box::pin(async move { Ok(grant) })
    }
}

/// `GetCredential(scheme, provider, timeout)`.
///
/// The anonymous scheme returns immediately without touching the provider.
pub async fn get_credential(
    scheme: AuthScheme,
    provider: Option<&dyn CredentialProvider>,
    target: &Uri,
    budget: &TimeoutBudget,
) -> Result<CredentialGrant, ChannelError> {
    if scheme.is_anonymous() {
        return Ok(CredentialGrant::anonymous());
    }
    let Some(provider) = provider else {
        return Err(ChannelError::configuration(format!(
            "{scheme} authentication requires a credential provider"
        )));
    };
    budget
        .run(
            "credential acquisition",
            provider.get_credential(scheme, target, budget.remaining()),
        )
        .await
}

/// Lifecycle of a token provider container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderState {
    Created,
    Opened,
    Closed,
    Aborted,
}

/// A credential provider bound to one scheme and target, with an explicit
/// lifecycle.
pub struct SecurityTokenProviderContainer {
    manager: Arc<SecurityTokenManager>,
    scheme: AuthScheme,
    target: Uri,
    state: Mutex<ProviderState>,
}

impl fmt::Debug for SecurityTokenProviderContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityTokenProviderContainer")
            .field("scheme", &self.scheme)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

impl SecurityTokenProviderContainer {
    fn new(manager: Arc<SecurityTokenManager>, scheme: AuthScheme, target: Uri) -> Self {
        Self {
            manager,
            scheme,
            target,
            state: Mutex::new(ProviderState::Created),
        }
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn state(&self) -> ProviderState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn transition(&self, from: &[ProviderState], to: ProviderState) -> Result<(), ChannelError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ChannelError::invalid_operation("token provider state poisoned"))?;
        if !from.contains(&state) {
            return Err(ChannelError::invalid_operation(format!(
                "token provider for {} is {:?}",
                self.target, *state
            )));
        }
        *state = to;
        Ok(())
    }

    pub fn open(&self, budget: &TimeoutBudget) -> Result<(), ChannelError> {
        budget.check("token provider open")?;
        self.transition(&[ProviderState::Created], ProviderState::Opened)
    }

    /// Obtain a credential, consulting the shared cache first.
    pub async fn get_credential(
        &self,
        budget: &TimeoutBudget,
    ) -> Result<CredentialGrant, ChannelError> {
        if self.state() != ProviderState::Opened {
            return Err(ChannelError::invalid_operation(format!(
                "token provider for {} is not open",
                self.target
            )));
        }
        self.manager
            .credential_for(self.scheme, &self.target, budget)
            .await
    }

    pub fn close(&self) -> Result<(), ChannelError> {
        self.transition(&[ProviderState::Opened, ProviderState::Created], ProviderState::Closed)
    }

    /// Idempotent; never fails.
    pub fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = ProviderState::Aborted;
        }
    }
}

/// Shared credential state for one factory.
///
/// Created only when the binding uses a non-anonymous scheme.
pub struct SecurityTokenManager {
    provider: Arc<dyn CredentialProvider>,
    auth_scheme: AuthScheme,
    proxy_auth_scheme: AuthScheme,
    credentials: SharedMruCache<(AuthScheme, String), CredentialGrant>,
    prefixes: SharedMruCache<String, String>,
}

impl fmt::Debug for SecurityTokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityTokenManager")
            .field("auth_scheme", &self.auth_scheme)
            .field("proxy_auth_scheme", &self.proxy_auth_scheme)
            .field("cached_credentials", &self.credentials.len())
            .finish_non_exhaustive()
    }
}

impl SecurityTokenManager {
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        auth_scheme: AuthScheme,
        proxy_auth_scheme: AuthScheme,
    ) -> Self {
        Self {
            provider,
            auth_scheme,
            proxy_auth_scheme,
            credentials: SharedMruCache::new(CREDENTIAL_CACHE_CAPACITY),
            prefixes: SharedMruCache::new(PREFIX_CACHE_CAPACITY),
        }
    }

    /// Containers for a destination and optional proxy.
    pub fn create_providers(self: &Arc<Self>, to: &Uri, proxy: Option<&Uri>) -> TokenProviders {
        let auth = (!self.auth_scheme.is_anonymous()).then(|| {
            Arc::new(SecurityTokenProviderContainer::new(
                Arc::clone(self),
                self.auth_scheme,
                to.clone(),
            ))
        });
        let proxy = match proxy {
            Some(proxy) if !self.proxy_auth_scheme.is_anonymous() => {
                Some(Arc::new(SecurityTokenProviderContainer::new(
                    Arc::clone(self),
                    self.proxy_auth_scheme,
                    proxy.clone(),
                )))
            }
            _ => None,
        };
        TokenProviders { auth, proxy }
    }

    /// Credential cache key: scheme, authority and the path up to its last
    /// segment.
    pub fn uri_prefix(&self, uri: &Uri) -> Arc<String> {
        let raw = uri.to_string();
        self.prefixes.get_or_insert_with(raw, || {
            let scheme = uri.scheme_str().unwrap_or("http");
            let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
            let path = uri.path();
            let dir = match path.rfind('/') {
                Some(idx) => &path[..=idx],
                None => "/",
            };
            format!("{scheme}://{}{dir}", authority.to_ascii_lowercase())
        })
    }

    async fn credential_for(
        &self,
        scheme: AuthScheme,
        target: &Uri,
        budget: &TimeoutBudget,
    ) -> Result<CredentialGrant, ChannelError> {
        let key = (scheme, self.uri_prefix(target).as_str().to_string());
        if let Some(grant) = self.credentials.get(&key) {
            return Ok((*grant).clone());
        }
        let grant = get_credential(scheme, Some(self.provider.as_ref()), target, budget).await?;
        let (winner, _) = self.credentials.insert(key, grant);
        Ok((*winner).clone())
    }

    /// Forget every cached credential.
    pub fn clear(&self) {
        self.credentials.clear();
    }
}

/// Authentication and proxy-authentication containers with a joint
/// lifecycle.
#[derive(Clone, Debug, Default)]
pub struct TokenProviders {
    pub auth: Option<Arc<SecurityTokenProviderContainer>>,
    pub proxy: Option<Arc<SecurityTokenProviderContainer>>,
}

impl TokenProviders {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.auth.is_none() && self.proxy.is_none()
    }

    fn all(&self) -> impl Iterator<Item = &Arc<SecurityTokenProviderContainer>> {
        self.auth.iter().chain(self.proxy.iter())
    }

    pub fn open(&self, budget: &TimeoutBudget) -> Result<(), ChannelError> {
        for container in self.all() {
            container.open(budget)?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), ChannelError> {
        for container in self.all() {
            container.close()?;
        }
        Ok(())
    }

    pub fn abort(&self) {
        for container in self.all() {
            container.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowProvider {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CredentialProvider for SlowProvider {
        fn get_credential<'a>(
            &'a self,
            _scheme: AuthScheme,
            _target: &'a Uri,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<CredentialGrant, ChannelError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                Ok(CredentialGrant::new(Credential::Bearer("t0k3n".into())))
            })
        }
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_anonymous_short_circuits() {
        let budget = TimeoutBudget::new(Duration::from_secs(1));
        let grant = get_credential(AuthScheme::Anonymous, None, &uri("http://a/"), &budget)
            .await
            .unwrap();
        assert_eq!(grant, CredentialGrant::anonymous());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_respects_budget() {
        let provider = SlowProvider {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(10),
        };
        let budget = TimeoutBudget::new(Duration::from_secs(1));
        let err = get_credential(AuthScheme::Bearer, Some(&provider), &uri("http://a/"), &budget)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_container_lifecycle_and_cache() {
        let provider = Arc::new(SlowProvider {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let manager = Arc::new(SecurityTokenManager::new(
            provider.clone(),
            AuthScheme::Bearer,
            AuthScheme::Anonymous,
        ));
        let budget = TimeoutBudget::new(Duration::from_secs(5));

        let providers = manager.create_providers(&uri("http://svc/a/op1"), None);
        assert!(providers.proxy.is_none());
        let auth = providers.auth.clone().unwrap();

        assert!(auth.get_credential(&budget).await.is_err());
        providers.open(&budget).unwrap();
        assert!(providers.open(&budget).is_err());

        let grant = auth.get_credential(&budget).await.unwrap();
        assert_eq!(grant.credential, Credential::Bearer("t0k3n".into()));

        // Same prefix, different operation: served from the cache.
        let other = manager.create_providers(&uri("http://SVC/a/op2"), None);
        other.open(&budget).unwrap();
        other.auth.as_ref().unwrap().get_credential(&budget).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        providers.close().unwrap();
        assert_eq!(auth.state(), ProviderState::Closed);
        providers.abort();
        providers.abort();
        assert_eq!(auth.state(), ProviderState::Aborted);
    }

    #[test]
    fn test_basic_authorization_header() {
        let credential = Credential::Basic {
            username: "aladdin".into(),
            password: "opensesame".into(),
        };
        let value = credential.authorization().unwrap().unwrap();
        assert_eq!(value, "Basic YWxhZGRpbjpvcGVuc2VzYW1l");
        assert!(value.is_sensitive());
        assert!(!format!("{credential:?}").contains("opensesame"));
    }

    #[test]
    fn test_windows_identity_includes_levels() {
        let grant = CredentialGrant::new(Credential::Opaque {
            identity: "corp\\svc".into(),
            authorization: "Negotiate abc".into(),
        });
        let mut delegated = grant.clone();
        delegated.impersonation = ImpersonationLevel::Delegation;
        assert_ne!(
            grant.fingerprint_identity(AuthScheme::Negotiate),
            delegated.fingerprint_identity(AuthScheme::Negotiate)
        );
        assert_eq!(
            grant.fingerprint_identity(AuthScheme::Bearer),
            delegated.fingerprint_identity(AuthScheme::Bearer)
        );
    }
}
