use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::access::{self, ActionState, DenyPolicy, Permissions, Requirement};
use crate::error::{StoreError, SyndicError};
use crate::model::{display_name_from_email, Role, UserId, UserProfile};
use crate::store::RemoteStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: UserId,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("an account already exists for {0}")]
    AlreadyRegistered(String),
    #[error("not signed in")]
    NotSignedIn,
    #[error("password hashing failed: {0}")]
    Hashing(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AuthError> for SyndicError {
    fn from(err: AuthError) -> Self {
        SyndicError::Auth(err.to_string())
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_identity(&self) -> Result<Option<Identity>, AuthError>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError>;
    async fn sign_up(&self, email: &str, password: &str) -> Result<Identity, AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
    /// Auth-state changes, starting with the current identity.
    fn watch(&self) -> watch::Receiver<Option<Identity>>;
}

/// Who is acting, with the capabilities their role grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub permissions: Permissions,
}

#[derive(Debug, Default)]
struct AuthState {
    identity: Option<Identity>,
    profile: Option<UserProfile>,
    loading: bool,
}

pub struct AuthSession<S, P> {
    store: Arc<S>,
    provider: Arc<P>,
    state: Mutex<AuthState>,
}

impl<S, P> AuthSession<S, P>
where
    S: RemoteStore,
    P: IdentityProvider,
{
    pub fn new(store: Arc<S>, provider: Arc<P>) -> Self {
        Self {
            store,
            provider,
            state: Mutex::new(AuthState {
                loading: true,
                ..AuthState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Picks up an existing provider session, if any.
    pub async fn restore(&self) -> Result<Option<Identity>, SyndicError> {
        let identity = self.provider.current_identity().await?;
        self.handle_auth_change(identity.clone()).await;
        Ok(identity)
    }

    /// Loads the profile for a new identity, or clears it on sign-out.
    pub async fn handle_auth_change(&self, identity: Option<Identity>) {
        {
            let mut state = self.state();
            state.loading = identity.is_some();
            state.identity = identity.clone();
            if identity.is_none() {
                state.profile = None;
            }
        }
        if let Some(identity) = identity {
            let profile = self.load_profile(&identity).await;
            let mut state = self.state();
            // A newer auth change may have landed while the profile loaded.
            if state.identity.as_ref() == Some(&identity) {
                state.profile = Some(profile);
                state.loading = false;
            }
        }
    }

    async fn load_profile(&self, identity: &Identity) -> UserProfile {
        match self.store.fetch_profile(&identity.id).await {
            Ok(Some(profile)) => {
                info!(user = %identity.id, role = profile.role.as_str(), "profile loaded");
                profile
            }
            Ok(None) => {
                warn!(user = %identity.id, "no profile row yet, acting as viewer");
                UserProfile::transient_viewer(identity.id.clone(), identity.email.clone())
            }
            Err(err) => {
                warn!(user = %identity.id, error = %err, "profile fetch failed, acting as viewer");
                UserProfile::transient_viewer(identity.id.clone(), identity.email.clone())
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, SyndicError> {
        let identity = self.provider.sign_in(email, password).await?;
        self.handle_auth_change(Some(identity.clone())).await;
        Ok(identity)
    }

    pub async fn sign_out(&self) -> Result<(), SyndicError> {
        self.provider.sign_out().await?;
        self.handle_auth_change(None).await;
        Ok(())
    }

    pub async fn refresh_profile(&self) {
        let identity = self.state().identity.clone();
        if identity.is_some() {
            self.handle_auth_change(identity).await;
        }
    }

    /// Creates the first administrator. Refused once any admin profile
    /// exists, and for accounts that already have a profile.
    pub async fn bootstrap_admin(&self, email: &str, password: &str) -> Result<UserProfile, SyndicError> {
        let profiles = self
            .store
            .list_profiles()
            .await
            .map_err(SyndicError::load("profiles"))?;
        if profiles.iter().any(|profile| profile.role == Role::Admin) {
            warn!("admin bootstrap refused, an admin already exists");
            return Err(SyndicError::PermissionDenied("an administrator already exists"));
        }

        let identity = match self.provider.sign_up(email, password).await {
            Ok(identity) => identity,
            Err(AuthError::AlreadyRegistered(_)) => self.provider.sign_in(email, password).await?,
            Err(err) => return Err(err.into()),
        };
        if profiles.iter().any(|profile| profile.id == identity.id) {
            self.provider.sign_out().await?;
            warn!(user = %identity.id, "admin bootstrap refused for existing profile");
            return Err(SyndicError::PermissionDenied("this account already has a profile"));
        }

        let profile = UserProfile {
            id: identity.id.clone(),
            email: identity.email.clone(),
            display_name: display_name_from_email(&identity.email),
            role: Role::Admin,
            created_at: Utc::now(),
        };
        self.store
            .upsert_profile(&profile)
            .await
            .map_err(SyndicError::write("profile"))?;
        info!(user = %identity.id, "admin profile created");
        self.handle_auth_change(Some(identity)).await;
        Ok(profile)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state().identity.clone()
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.state().profile.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    pub fn permissions(&self) -> Permissions {
        let state = self.state();
        match (&state.identity, &state.profile) {
            (None, _) if state.loading => Permissions::PENDING,
            (None, _) => Permissions::NONE,
            (Some(_), _) if state.loading => Permissions::PENDING,
            (Some(_), Some(profile)) => Permissions::for_role(profile.role),
            (Some(_), None) => Permissions::for_role(Role::Viewer),
        }
    }

    pub fn evaluate(&self, requirement: Requirement, policy: DenyPolicy) -> ActionState {
        access::evaluate(self.permissions(), requirement, policy)
    }

    /// The signed-in user, for operations that need an identity.
    pub fn actor(&self) -> Result<Actor, SyndicError> {
        let id = self
            .state()
            .identity
            .as_ref()
            .map(|identity| identity.id.clone())
            .ok_or_else(|| SyndicError::from(AuthError::NotSignedIn))?;
        Ok(Actor {
            id,
            permissions: self.permissions(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn session() -> (Arc<SqliteStore>, AuthSession<SqliteStore, SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let auth = AuthSession::new(store.clone(), store.clone());
        (store, auth)
    }

    #[tokio::test]
    async fn view_only_until_restored() {
        let (_store, auth) = session();
        assert!(auth.is_loading());
        assert_eq!(auth.permissions(), Permissions::PENDING);
        assert!(!auth.permissions().can_modify);
        assert!(!auth.permissions().can_manage_users);

        assert_eq!(auth.restore().await.expect("restore"), None);
        assert!(!auth.is_loading());
        assert_eq!(auth.permissions(), Permissions::NONE);
        assert!(auth.actor().is_err());
    }

    #[tokio::test]
    async fn missing_profile_means_viewer() {
        let (store, auth) = session();
        store.sign_up("new@building.test", "pw").await.expect("sign up");
        auth.sign_out().await.expect("sign out");

        auth.sign_in("new@building.test", "pw").await.expect("sign in");
        let profile = auth.profile().expect("transient profile");
        assert_eq!(profile.role, Role::Viewer);
        assert_eq!(profile.display_name, "new");
        assert_eq!(auth.permissions(), Permissions::for_role(Role::Viewer));
        // The stand-in is never written back.
        assert!(store.fetch_profile(&profile.id).await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn bootstrap_admin_only_while_no_admin_exists() {
        let (_store, auth) = session();
        let first = auth.bootstrap_admin("boss@building.test", "pw").await.expect("bootstrap");
        assert_eq!(first.role, Role::Admin);
        assert_eq!(auth.permissions(), Permissions::for_role(Role::Admin));

        auth.sign_out().await.expect("sign out");
        let again = auth.bootstrap_admin("boss@building.test", "pw").await;
        assert!(matches!(again, Err(SyndicError::PermissionDenied(_))));
        assert!(auth.identity().is_none());
    }

    #[tokio::test]
    async fn viewer_cannot_bootstrap_themselves_to_admin() {
        let (store, auth) = session();
        auth.bootstrap_admin("boss@building.test", "pw").await.expect("bootstrap");
        auth.sign_out().await.expect("sign out");

        let viewer = store.sign_up("viewer@building.test", "mine").await.expect("sign up");
        store
            .upsert_profile(&UserProfile::transient_viewer(viewer.id.clone(), viewer.email.clone()))
            .await
            .expect("viewer profile");

        let result = auth.bootstrap_admin("viewer@building.test", "mine").await;
        assert!(matches!(result, Err(SyndicError::PermissionDenied(_))));
        let stored = store.fetch_profile(&viewer.id).await.expect("fetch").expect("profile");
        assert_eq!(stored.role, Role::Viewer);
    }

    #[tokio::test]
    async fn existing_profile_is_never_promoted_by_bootstrap() {
        let (store, auth) = session();
        let viewer = store.sign_up("first@building.test", "pw").await.expect("sign up");
        store
            .upsert_profile(&UserProfile::transient_viewer(viewer.id.clone(), viewer.email.clone()))
            .await
            .expect("viewer profile");

        let result = auth.bootstrap_admin("first@building.test", "pw").await;
        assert!(matches!(result, Err(SyndicError::PermissionDenied(_))));
        assert_eq!(store.current_identity().await.expect("identity"), None);
        let stored = store.fetch_profile(&viewer.id).await.expect("fetch").expect("profile");
        assert_eq!(stored.role, Role::Viewer);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (store, auth) = session();
        store.sign_up("a@b.test", "right").await.expect("sign up");
        let err = auth.sign_in("a@b.test", "wrong").await.expect_err("rejected");
        assert!(matches!(err, SyndicError::Auth(_)));
    }

    #[tokio::test]
    async fn sign_out_clears_profile() {
        let (_store, auth) = session();
        auth.bootstrap_admin("boss@building.test", "pw").await.expect("bootstrap");
        auth.sign_out().await.expect("sign out");
        assert!(auth.profile().is_none());
        assert!(auth.identity().is_none());
        assert_eq!(auth.permissions(), Permissions::NONE);
    }
}
