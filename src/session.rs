//! Session orchestration.
//!
//! [`SessionController`] owns the lifecycle: sign-in resolves the friend
//! graph, seeds the location sync engine, and opens the realtime
//! subscription; every mutation that can change the friend-id set
//! re-resolves and re-subscribes; sign-out tears everything down.  All
//! mutable collections live behind one async mutex, so mutations are
//! serialized even though the realtime pump runs on its own task.
//!
//! Derived state is published on four `watch` channels — current profile,
//! authentication flag, friend locations, pending/sent request lists — each
//! holding the latest value for however many UI readers subscribe.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::auth::{AuthError, AuthProvider};
use crate::colors::{ColorStore, ColorStoreError};
use crate::friend_graph::{self, FriendEntry};
use crate::location_sync::LocationSyncEngine;
use crate::realtime::{RealtimeChannel, Subscription};
use crate::store::{
    Connection, ConnectionStatus, ConnectionStore, DataStore, FriendLocation, ProfileStore,
    StoreError, UserProfile,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failure of an explicit user action, with a user-facing message.
/// Background failures (location pushes, realtime drops) never surface
/// here; they are logged only.
#[derive(Debug)]
pub enum SessionError {
    Auth(AuthError),
    Store(StoreError),
    Colors(ColorStoreError),
    NotSignedIn,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Auth(e) => write!(f, "{e}"),
            SessionError::Store(e) => write!(f, "{e}"),
            SessionError::Colors(e) => write!(f, "{e}"),
            SessionError::NotSignedIn => write!(f, "not signed in"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<AuthError> for SessionError {
    fn from(e: AuthError) -> Self {
        SessionError::Auth(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

impl From<ColorStoreError> for SessionError {
    fn from(e: ColorStoreError) -> Self {
        SessionError::Colors(e)
    }
}

// ---------------------------------------------------------------------------
// State types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    SignedOut,
    Authenticating,
    SignedIn,
}

/// The two pending-request views published to the UI.
#[derive(Debug, Clone, Default)]
pub struct RequestLists {
    pub pending_received: Vec<FriendEntry>,
    pub pending_sent: Vec<FriendEntry>,
}

struct Inner {
    auth_state: AuthState,
    engine: LocationSyncEngine,
    colors: ColorStore,
    /// Accepted friends from the last graph resolution.
    friends: Vec<FriendEntry>,
    /// Task draining the current realtime subscription, if one is open.
    pump: Option<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct SessionController {
    auth: Arc<dyn AuthProvider>,
    connections: ConnectionStore,
    profiles: ProfileStore,
    realtime: Arc<dyn RealtimeChannel>,
    inner: Arc<Mutex<Inner>>,
    profile_tx: watch::Sender<Option<UserProfile>>,
    signed_in_tx: watch::Sender<bool>,
    locations_tx: watch::Sender<Vec<FriendLocation>>,
    requests_tx: watch::Sender<RequestLists>,
}

impl SessionController {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn DataStore>,
        realtime: Arc<dyn RealtimeChannel>,
        colors: ColorStore,
    ) -> Self {
        let (profile_tx, _) = watch::channel(None);
        let (signed_in_tx, _) = watch::channel(false);
        let (locations_tx, _) = watch::channel(Vec::new());
        let (requests_tx, _) = watch::channel(RequestLists::default());
        Self {
            auth,
            connections: ConnectionStore::new(store.clone()),
            profiles: ProfileStore::new(store),
            realtime,
            inner: Arc::new(Mutex::new(Inner {
                auth_state: AuthState::SignedOut,
                engine: LocationSyncEngine::new(""),
                colors,
                friends: Vec::new(),
                pump: None,
            })),
            profile_tx,
            signed_in_tx,
            locations_tx,
            requests_tx,
        }
    }

    // -- observable state ---------------------------------------------------

    pub fn profile_updates(&self) -> watch::Receiver<Option<UserProfile>> {
        self.profile_tx.subscribe()
    }

    pub fn auth_updates(&self) -> watch::Receiver<bool> {
        self.signed_in_tx.subscribe()
    }

    pub fn location_updates(&self) -> watch::Receiver<Vec<FriendLocation>> {
        self.locations_tx.subscribe()
    }

    pub fn request_updates(&self) -> watch::Receiver<RequestLists> {
        self.requests_tx.subscribe()
    }

    pub async fn auth_state(&self) -> AuthState {
        self.inner.lock().await.auth_state
    }

    /// Accepted friends from the last graph resolution.
    pub async fn friends(&self) -> Vec<FriendEntry> {
        self.inner.lock().await.friends.clone()
    }

    // -- lifecycle ----------------------------------------------------------

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), SessionError> {
        self.set_auth_state(AuthState::Authenticating).await;
        let user_id = match self.auth.sign_in(email, password) {
            Ok(id) => id,
            Err(e) => {
                self.set_auth_state(AuthState::SignedOut).await;
                return Err(SessionError::Auth(e));
            }
        };
        self.finish_sign_in(user_id).await
    }

    /// Register a new account, create its profile row with defaults, and
    /// enter the signed-in state.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<(), SessionError> {
        self.set_auth_state(AuthState::Authenticating).await;
        let user_id = match self.auth.sign_up(email, password) {
            Ok(id) => id,
            Err(e) => {
                self.set_auth_state(AuthState::SignedOut).await;
                return Err(SessionError::Auth(e));
            }
        };
        if let Err(e) = self.profiles.upsert(&UserProfile::new(&user_id, email)) {
            self.abandon_sign_in().await;
            return Err(SessionError::Store(e));
        }
        self.finish_sign_in(user_id).await
    }

    async fn finish_sign_in(&self, user_id: String) -> Result<(), SessionError> {
        let profile = match self.profiles.get(&user_id) {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                self.abandon_sign_in().await;
                return Err(SessionError::Store(StoreError::NotFound(format!(
                    "profile {user_id}"
                ))));
            }
            Err(e) => {
                self.abandon_sign_in().await;
                return Err(SessionError::Store(e));
            }
        };

        {
            let mut st = self.inner.lock().await;
            st.auth_state = AuthState::SignedIn;
            st.engine = LocationSyncEngine::new(&user_id);
        }
        self.profile_tx.send_replace(Some(profile));
        self.signed_in_tx.send_replace(true);
        crate::cvlog!("session: signed in as {}", crate::logging::user_id(&user_id));

        self.refresh().await
    }

    /// Sign out: stop sharing server-side first, tear down the realtime
    /// subscription, clear all derived state.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let Some(user_id) = self.auth.current_user() else {
            return Err(SessionError::NotSignedIn);
        };

        if let Err(e) = self.profiles.set_sharing(&user_id, false) {
            crate::cvlog!("sign-out: stop sharing failed (continuing): {}", e);
        }

        {
            let mut st = self.inner.lock().await;
            if let Some(pump) = st.pump.take() {
                pump.abort();
                let _ = pump.await;
            }
            st.engine = LocationSyncEngine::new("");
            st.friends.clear();
            st.auth_state = AuthState::SignedOut;
        }

        if let Err(e) = self.auth.sign_out() {
            crate::cvlog!("sign-out: token revoke failed (continuing): {}", e);
        }

        self.profile_tx.send_replace(None);
        self.signed_in_tx.send_replace(false);
        self.locations_tx.send_replace(Vec::new());
        self.requests_tx.send_replace(RequestLists::default());
        crate::cvlog!("session: signed out {}", crate::logging::user_id(&user_id));
        Ok(())
    }

    // -- friend graph -------------------------------------------------------

    /// Re-resolve the friend graph, rebuild the location set, publish both,
    /// and re-subscribe when the friend-id set changed.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        let Some(user_id) = self.auth.current_user() else {
            return Err(SessionError::NotSignedIn);
        };

        let connection_rows = self.connections.list_all()?;
        let graph =
            friend_graph::resolve(&user_id, &connection_rows, &mut |id| self.profiles.get(id));
        crate::cvlog!(
            "refresh: {} friend(s), {} received, {} sent",
            graph.accepted.len(),
            graph.pending_received.len(),
            graph.pending_sent.len()
        );

        let friend_ids = graph.friend_ids();
        let next_ids: HashSet<String> = friend_ids.iter().cloned().collect();

        let resubscribe;
        {
            let mut st = self.inner.lock().await;
            let st = &mut *st;
            resubscribe = *st.engine.friend_ids() != next_ids;
            st.friends = graph.accepted.clone();
            st.engine.rebuild(friend_ids, &self.profiles, &st.colors)?;
            self.locations_tx.send_replace(st.engine.locations().to_vec());
        }
        self.requests_tx.send_replace(RequestLists {
            pending_received: graph.pending_received,
            pending_sent: graph.pending_sent,
        });

        if resubscribe {
            self.resubscribe(next_ids).await;
        }
        Ok(())
    }

    /// Send a friend request to `target_id`.  Fails with the classified
    /// duplicate reason when a connection already links the pair.
    pub async fn send_friend_request(&self, target_id: &str) -> Result<Connection, SessionError> {
        let Some(user_id) = self.auth.current_user() else {
            return Err(SessionError::NotSignedIn);
        };
        let connection = self.connections.create(&user_id, target_id)?;
        crate::cvlog!(
            "session: request sent to {}",
            crate::logging::user_id(target_id)
        );
        self.refresh().await?;
        Ok(connection)
    }

    pub async fn accept_request(&self, connection_id: &str) -> Result<(), SessionError> {
        self.connections
            .set_status(connection_id, ConnectionStatus::Accepted)?;
        self.refresh().await
    }

    pub async fn reject_request(&self, connection_id: &str) -> Result<(), SessionError> {
        self.connections
            .set_status(connection_id, ConnectionStatus::Rejected)?;
        self.refresh().await
    }

    pub async fn remove_friend(&self, connection_id: &str) -> Result<(), SessionError> {
        self.connections.delete(connection_id)?;
        self.refresh().await
    }

    // -- colours ------------------------------------------------------------

    /// Set a local marker-colour override for one friend and recompute the
    /// published location list.
    pub async fn set_color_override(
        &self,
        friend_id: &str,
        color: &str,
    ) -> Result<(), SessionError> {
        let Some(user_id) = self.auth.current_user() else {
            return Err(SessionError::NotSignedIn);
        };
        let mut st = self.inner.lock().await;
        let st = &mut *st;
        st.colors.set_override(&user_id, friend_id, color)?;
        let ids: Vec<String> = st.engine.friend_ids().iter().cloned().collect();
        st.engine.rebuild(ids, &self.profiles, &st.colors)?;
        self.locations_tx.send_replace(st.engine.locations().to_vec());
        Ok(())
    }

    pub async fn clear_color_override(&self, friend_id: &str) -> Result<(), SessionError> {
        let Some(user_id) = self.auth.current_user() else {
            return Err(SessionError::NotSignedIn);
        };
        let mut st = self.inner.lock().await;
        let st = &mut *st;
        st.colors.clear_override(&user_id, friend_id)?;
        let ids: Vec<String> = st.engine.friend_ids().iter().cloned().collect();
        st.engine.rebuild(ids, &self.profiles, &st.colors)?;
        self.locations_tx.send_replace(st.engine.locations().to_vec());
        Ok(())
    }

    // -- own profile --------------------------------------------------------

    /// Push the device's position to the backend.  Best effort: location
    /// updates are high frequency, so failures are logged and never
    /// retried or surfaced.
    pub fn update_my_location(&self, lat: f64, lon: f64) {
        let Some(user_id) = self.auth.current_user() else {
            return;
        };
        let profiles = self.profiles.clone();
        let updated = crate::logging::format_timestamp();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = profiles.update_location(&user_id, lat, lon, &updated) {
                crate::cvlog!("location push failed (ignored): {}", e);
            }
        });
    }

    pub async fn set_sharing(&self, sharing: bool) -> Result<(), SessionError> {
        let Some(user_id) = self.auth.current_user() else {
            return Err(SessionError::NotSignedIn);
        };
        self.profiles.set_sharing(&user_id, sharing)?;
        self.profile_tx.send_modify(|p| {
            if let Some(p) = p {
                p.is_sharing_location = sharing;
            }
        });
        Ok(())
    }

    pub async fn update_display_name(&self, display_name: &str) -> Result<(), SessionError> {
        let Some(user_id) = self.auth.current_user() else {
            return Err(SessionError::NotSignedIn);
        };
        self.profiles.update_display_name(&user_id, display_name)?;
        self.profile_tx.send_modify(|p| {
            if let Some(p) = p {
                p.display_name = display_name.to_string();
            }
        });
        Ok(())
    }

    pub async fn update_marker_color(&self, color: &str) -> Result<(), SessionError> {
        let Some(user_id) = self.auth.current_user() else {
            return Err(SessionError::NotSignedIn);
        };
        self.profiles.update_marker_color(&user_id, color)?;
        self.profile_tx.send_modify(|p| {
            if let Some(p) = p {
                p.marker_color = color.to_string();
            }
        });
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    async fn set_auth_state(&self, state: AuthState) {
        self.inner.lock().await.auth_state = state;
    }

    /// Authentication succeeded but the session could not be established.
    /// Revoke the fresh auth session so no token survives the failure, then
    /// return to signed-out.
    async fn abandon_sign_in(&self) {
        if let Err(e) = self.auth.sign_out() {
            crate::cvlog!("sign-in abandoned: token revoke failed: {}", e);
        }
        self.set_auth_state(AuthState::SignedOut).await;
    }

    /// Replace the current subscription with one for `friend_ids`.  The old
    /// pump is aborted and awaited first, which drops its subscription and
    /// closes the underlying channel before the new one opens — two
    /// subscriptions never coexist.
    async fn resubscribe(&self, friend_ids: HashSet<String>) {
        let mut st = self.inner.lock().await;
        if let Some(pump) = st.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        if friend_ids.is_empty() {
            return;
        }
        let subscription = self.realtime.open(friend_ids);
        st.pump = Some(tokio::spawn(pump_events(
            subscription,
            self.inner.clone(),
            self.locations_tx.clone(),
        )));
    }
}

/// Drain a subscription into the engine, publishing the merged list after
/// every accepted event.  Ends when the subscription's stream ends.
async fn pump_events(
    mut subscription: Subscription,
    inner: Arc<Mutex<Inner>>,
    locations_tx: watch::Sender<Vec<FriendLocation>>,
) {
    while let Some(event) = subscription.next_event().await {
        let mut st = inner.lock().await;
        let st = &mut *st;
        if st.engine.apply_event(&event, &st.colors) {
            crate::cvlog!(
                "realtime: location update from {}",
                crate::logging::user_id(&event.id)
            );
            locations_tx.send_replace(st.engine.locations().to_vec());
        }
    }
}
