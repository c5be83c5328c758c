//! Row types and store adapters for the hosted backend.
//!
//! The backend is a generic hosted database service exposing row CRUD with
//! equality/OR filters over two tables: `users` (profiles) and `connections`
//! (friend requests).  The rows are owned by the backend; this module holds
//! the client-side view.  [`DataStore`] is the seam between the rest of the
//! crate and the transport so tests can run against an in-memory fake, and
//! [`RestStore`] is the production implementation.
//!
//! The backend's access policy silently filters rows the signed-in user may
//! not see.  An empty result is therefore indistinguishable from access
//! denial and is never treated as an error.

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::friend_graph::{self, DuplicateReason};

/// Marker colour assigned to a profile that has never picked one.
pub const DEFAULT_MARKER_COLOR: &str = "#2196F3";

const HTTP_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    /// Transport failure: backend unreachable, non-2xx response, timeout.
    Http(String),
    /// The backend answered but the body did not decode.
    Decode(serde_json::Error),
    NotFound(String),
    /// A connection between the two users already exists; see the reason for
    /// the user-facing classification.
    Duplicate(DuplicateReason),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Http(e) => write!(f, "http error: {e}"),
            StoreError::Decode(e) => write!(f, "decode error: {e}"),
            StoreError::NotFound(msg) => write!(f, "not found: {msg}"),
            StoreError::Duplicate(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e)
    }
}

impl From<ureq::Error> for StoreError {
    fn from(e: ureq::Error) -> Self {
        StoreError::Http(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Http(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Profile row in the backend `users` table.
///
/// `last_location_lat` and `last_location_lon` are jointly null or jointly
/// set; [`UserProfile::coordinates`] is the only sanctioned way to read them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub marker_color: String,
    pub is_sharing_location: bool,
    pub last_location_lat: Option<f64>,
    pub last_location_lon: Option<f64>,
    pub last_location_updated: Option<String>,
}

impl UserProfile {
    /// A fresh profile with defaults, as created at sign-up.
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        let email = email.into();
        let display_name = email.split('@').next().unwrap_or(&email).to_string();
        Self {
            id: id.into(),
            email,
            display_name,
            marker_color: DEFAULT_MARKER_COLOR.to_string(),
            is_sharing_location: false,
            last_location_lat: None,
            last_location_lon: None,
            last_location_updated: None,
        }
    }

    /// Both coordinates, or `None` when the profile has never reported a
    /// location.  A half-set pair is treated as absent.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.last_location_lat, self.last_location_lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Accepted => "accepted",
            ConnectionStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed friend-request row in the backend `connections` table.
///
/// `user_id` is the requester, `friend_id` the recipient.  A logical
/// friendship is exactly one row regardless of direction; "the other side"
/// is computed against the viewer's id.  The application-layer duplicate
/// guard keeps the pair unique, but nothing at the storage level does — two
/// clients racing past the guard can still insert twice (known gap).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub friend_id: String,
    pub status: ConnectionStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Connection {
    /// True when `a` is either side of this connection.
    pub fn involves(&self, a: &str) -> bool {
        self.user_id == a || self.friend_id == a
    }

    /// True when this row links the unordered pair `{a, b}`.
    pub fn links(&self, a: &str, b: &str) -> bool {
        (self.user_id == a && self.friend_id == b) || (self.user_id == b && self.friend_id == a)
    }

    /// The id of the party that is not `viewer`, or `None` if `viewer` is
    /// not a side of this connection.
    pub fn other_party<'a>(&'a self, viewer: &str) -> Option<&'a str> {
        if self.user_id == viewer {
            Some(&self.friend_id)
        } else if self.friend_id == viewer {
            Some(&self.user_id)
        } else {
            None
        }
    }
}

/// A friend's live position as shown on the dashboard map.  Derived from a
/// profile row plus any local colour override; never persisted, lifetime
/// bound to the current session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FriendLocation {
    pub friend_id: String,
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Effective colour: the local override when present, else the
    /// profile's marker colour.
    pub marker_color: String,
    pub is_sharing_location: bool,
    pub last_updated: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current wall-clock time in seconds since the epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate a random 128-bit row id, hex encoded.
pub fn new_row_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ---------------------------------------------------------------------------
// DataStore seam
// ---------------------------------------------------------------------------

/// Row CRUD over the backend's `users` and `connections` tables.
///
/// All calls are blocking network operations bounded by the transport
/// timeout.  Implementations must be shareable across tasks.
pub trait DataStore: Send + Sync {
    fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError>;
    fn fetch_profiles(&self, user_ids: &[String]) -> Result<Vec<UserProfile>, StoreError>;
    fn upsert_profile(&self, profile: &UserProfile) -> Result<(), StoreError>;
    fn update_display_name(&self, user_id: &str, display_name: &str) -> Result<(), StoreError>;
    fn update_marker_color(&self, user_id: &str, color: &str) -> Result<(), StoreError>;
    fn set_sharing(&self, user_id: &str, sharing: bool) -> Result<(), StoreError>;
    fn update_location(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
        updated: &str,
    ) -> Result<(), StoreError>;

    /// All connection rows visible to the signed-in user.  The backend's
    /// access policy may silently reduce this to a partial or empty set.
    fn list_connections(&self) -> Result<Vec<Connection>, StoreError>;
    fn insert_connection(&self, connection: &Connection) -> Result<(), StoreError>;
    /// Returns false when no row matched the id.
    fn set_connection_status(
        &self,
        connection_id: &str,
        status: ConnectionStatus,
    ) -> Result<bool, StoreError>;
    /// Returns false when no row matched the id.
    fn delete_connection(&self, connection_id: &str) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

/// Shared bearer token slot, written by the auth adapter after sign-in and
/// read by [`RestStore`] on every request.
pub type TokenCell = Arc<RwLock<Option<String>>>;

/// [`DataStore`] over the hosted backend's REST row API.
///
/// Filters use the backend's query syntax: `column=eq.value`,
/// `or=(a.eq.x,b.eq.x)`, `id=in.(a,b,c)`.
pub struct RestStore {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    token: TokenCell,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, token: TokenCell) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            token,
        }
    }

    fn url(&self, table: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}/rest/v1/{}", self.base_url, table)
        } else {
            format!("{}/rest/v1/{}?{}", self.base_url, table, query)
        }
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let req = self
            .agent
            .request(method, url)
            .set("apikey", &self.api_key)
            .set("Content-Type", "application/json");
        match self.token.read().ok().and_then(|t| t.clone()) {
            Some(token) => req.set("Authorization", &format!("Bearer {token}")),
            None => req,
        }
    }

    fn patch_users(&self, user_id: &str, body: serde_json::Value) -> Result<(), StoreError> {
        let url = self.url("users", &format!("id=eq.{user_id}"));
        self.request("PATCH", &url).send_json(body)?;
        Ok(())
    }
}

impl DataStore for RestStore {
    fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let url = self.url("users", &format!("id=eq.{user_id}"));
        let rows: Vec<UserProfile> = self.request("GET", &url).call()?.into_json()?;
        Ok(rows.into_iter().next())
    }

    fn fetch_profiles(&self, user_ids: &[String]) -> Result<Vec<UserProfile>, StoreError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url("users", &format!("id=in.({})", user_ids.join(",")));
        let rows: Vec<UserProfile> = self.request("GET", &url).call()?.into_json()?;
        Ok(rows)
    }

    fn upsert_profile(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let url = self.url("users", "on_conflict=id");
        self.request("POST", &url)
            .set("Prefer", "resolution=merge-duplicates,return=minimal")
            .send_json(serde_json::to_value(profile)?)?;
        Ok(())
    }

    fn update_display_name(&self, user_id: &str, display_name: &str) -> Result<(), StoreError> {
        self.patch_users(user_id, serde_json::json!({ "display_name": display_name }))
    }

    fn update_marker_color(&self, user_id: &str, color: &str) -> Result<(), StoreError> {
        self.patch_users(user_id, serde_json::json!({ "marker_color": color }))
    }

    fn set_sharing(&self, user_id: &str, sharing: bool) -> Result<(), StoreError> {
        self.patch_users(user_id, serde_json::json!({ "is_sharing_location": sharing }))
    }

    fn update_location(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
        updated: &str,
    ) -> Result<(), StoreError> {
        self.patch_users(
            user_id,
            serde_json::json!({
                "last_location_lat": lat,
                "last_location_lon": lon,
                "last_location_updated": updated,
            }),
        )
    }

    fn list_connections(&self) -> Result<Vec<Connection>, StoreError> {
        let url = self.url("connections", "order=created_at.desc");
        let rows: Vec<Connection> = self.request("GET", &url).call()?.into_json()?;
        Ok(rows)
    }

    fn insert_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        let url = self.url("connections", "");
        self.request("POST", &url)
            .set("Prefer", "return=minimal")
            .send_json(serde_json::to_value(connection)?)?;
        Ok(())
    }

    fn set_connection_status(
        &self,
        connection_id: &str,
        status: ConnectionStatus,
    ) -> Result<bool, StoreError> {
        let url = self.url("connections", &format!("id=eq.{connection_id}"));
        let rows: Vec<Connection> = self
            .request("PATCH", &url)
            .set("Prefer", "return=representation")
            .send_json(serde_json::json!({
                "status": status.as_str(),
                "updated_at": now_secs(),
            }))?
            .into_json()?;
        Ok(!rows.is_empty())
    }

    fn delete_connection(&self, connection_id: &str) -> Result<bool, StoreError> {
        let url = self.url("connections", &format!("id=eq.{connection_id}"));
        let rows: Vec<Connection> = self
            .request("DELETE", &url)
            .set("Prefer", "return=representation")
            .call()?
            .into_json()?;
        Ok(!rows.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Store adapters
// ---------------------------------------------------------------------------

/// CRUD over directed friend-request rows, with the duplicate guard applied
/// before every insert.
#[derive(Clone)]
pub struct ConnectionStore {
    store: Arc<dyn DataStore>,
}

impl ConnectionStore {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Create a pending connection from `user_id` to `friend_id`.
    ///
    /// Scans the visible connection rows for an either-direction match
    /// first; an existing row fails the call with the classified
    /// [`DuplicateReason`].  The scan-then-insert is not atomic — two sides
    /// requesting simultaneously can both pass (documented race).
    pub fn create(&self, user_id: &str, friend_id: &str) -> Result<Connection, StoreError> {
        let all = self.store.list_connections()?;
        if let Some(existing) = friend_graph::find_between(&all, user_id, friend_id) {
            return Err(StoreError::Duplicate(friend_graph::classify_duplicate(
                existing, user_id,
            )));
        }
        let now = now_secs();
        let connection = Connection {
            id: new_row_id(),
            user_id: user_id.to_string(),
            friend_id: friend_id.to_string(),
            status: ConnectionStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_connection(&connection)?;
        Ok(connection)
    }

    pub fn set_status(
        &self,
        connection_id: &str,
        status: ConnectionStatus,
    ) -> Result<(), StoreError> {
        if self.store.set_connection_status(connection_id, status)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!(
                "connection {connection_id}"
            )))
        }
    }

    pub fn delete(&self, connection_id: &str) -> Result<(), StoreError> {
        if self.store.delete_connection(connection_id)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!(
                "connection {connection_id}"
            )))
        }
    }

    pub fn list_all(&self) -> Result<Vec<Connection>, StoreError> {
        self.store.list_connections()
    }
}

/// Read/write access to profile rows.
#[derive(Clone)]
pub struct ProfileStore {
    store: Arc<dyn DataStore>,
}

impl ProfileStore {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        self.store.get_profile(user_id)
    }

    pub fn fetch_many(&self, user_ids: &[String]) -> Result<Vec<UserProfile>, StoreError> {
        self.store.fetch_profiles(user_ids)
    }

    pub fn upsert(&self, profile: &UserProfile) -> Result<(), StoreError> {
        self.store.upsert_profile(profile)
    }

    pub fn update_display_name(&self, user_id: &str, name: &str) -> Result<(), StoreError> {
        self.store.update_display_name(user_id, name)
    }

    pub fn update_marker_color(&self, user_id: &str, color: &str) -> Result<(), StoreError> {
        self.store.update_marker_color(user_id, color)
    }

    pub fn set_sharing(&self, user_id: &str, sharing: bool) -> Result<(), StoreError> {
        self.store.set_sharing(user_id, sharing)
    }

    pub fn update_location(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
        updated: &str,
    ) -> Result<(), StoreError> {
        self.store.update_location(user_id, lat, lon, updated)
    }
}
