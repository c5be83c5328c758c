//! Friend-graph resolution.
//!
//! Derives, from the raw connection rows visible to one viewer, the three
//! disjoint views the dashboard needs: accepted friends, inbound pending
//! requests, and outbound pending requests.  Also hosts the duplicate-request
//! classification used before inserting a new connection.

use std::collections::HashSet;

use crate::store::{Connection, ConnectionStatus, StoreError, UserProfile};

/// One resolved entry in the friend graph: a connection row plus the *other*
/// party's profile.
#[derive(Debug, Clone, PartialEq)]
pub struct FriendEntry {
    pub connection_id: String,
    pub profile: UserProfile,
}

/// The viewer's resolved friend graph.  The three lists are disjoint.
#[derive(Debug, Clone, Default)]
pub struct FriendGraph {
    /// Accepted friendships, one entry per distinct other-party id.
    pub accepted: Vec<FriendEntry>,
    /// Pending requests where the viewer is the recipient; profile is the
    /// requester's.
    pub pending_received: Vec<FriendEntry>,
    /// Pending requests the viewer authored; profile is the recipient's.
    pub pending_sent: Vec<FriendEntry>,
}

impl FriendGraph {
    /// Distinct ids of accepted friends, in list order.
    pub fn friend_ids(&self) -> Vec<String> {
        self.accepted.iter().map(|f| f.profile.id.clone()).collect()
    }
}

/// Resolve the friend graph for `viewer_id` from the given connection rows.
///
/// `lookup` fetches a profile by user id.  A lookup that fails or returns
/// `None` drops that entry from the result; partial results are preferred
/// over failing the whole resolution.  Duplicate accepted rows for the same
/// pair collapse to one entry (first row wins).
pub fn resolve(
    viewer_id: &str,
    connections: &[Connection],
    lookup: &mut dyn FnMut(&str) -> Result<Option<UserProfile>, StoreError>,
) -> FriendGraph {
    let mut graph = FriendGraph::default();
    let mut seen_friends: HashSet<String> = HashSet::new();

    for connection in connections {
        match connection.status {
            ConnectionStatus::Accepted => {
                let Some(other) = connection.other_party(viewer_id) else {
                    continue;
                };
                if !seen_friends.insert(other.to_string()) {
                    continue;
                }
                match lookup(other) {
                    Ok(Some(profile)) => graph.accepted.push(FriendEntry {
                        connection_id: connection.id.clone(),
                        profile,
                    }),
                    Ok(None) => {
                        // Profile row missing — drop the entry, allow a later
                        // duplicate row for the same pair to try again.
                        seen_friends.remove(other);
                    }
                    Err(e) => {
                        seen_friends.remove(other);
                        crate::cvlog!(
                            "friend graph: profile lookup failed for {}: {}",
                            crate::logging::user_id(other),
                            e
                        );
                    }
                }
            }
            ConnectionStatus::Pending => {
                let (list, subject) = if connection.friend_id == viewer_id {
                    (&mut graph.pending_received, connection.user_id.as_str())
                } else if connection.user_id == viewer_id {
                    (&mut graph.pending_sent, connection.friend_id.as_str())
                } else {
                    continue;
                };
                match lookup(subject) {
                    Ok(Some(profile)) => list.push(FriendEntry {
                        connection_id: connection.id.clone(),
                        profile,
                    }),
                    Ok(None) => {}
                    Err(e) => {
                        crate::cvlog!(
                            "friend graph: profile lookup failed for {}: {}",
                            crate::logging::user_id(subject),
                            e
                        );
                    }
                }
            }
            ConnectionStatus::Rejected => {}
        }
    }

    graph
}

// ---------------------------------------------------------------------------
// Duplicate-request guard
// ---------------------------------------------------------------------------

/// Why a new friend request between two users cannot be created.
///
/// Pure function of the existing row's status and its direction relative to
/// the requester; the display strings are user-facing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateReason {
    /// A pending request the requester already authored.
    AlreadySent,
    /// A pending request the target authored towards the requester.
    TheyAlreadySent,
    AlreadyFriends,
    /// Any other existing row (e.g. rejected).
    Exists(ConnectionStatus),
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicateReason::AlreadySent => write!(f, "already sent"),
            DuplicateReason::TheyAlreadySent => write!(f, "they already sent one to you"),
            DuplicateReason::AlreadyFriends => write!(f, "already friends"),
            DuplicateReason::Exists(status) => {
                write!(f, "connection already exists (status={status})")
            }
        }
    }
}

/// Find an existing connection row linking `a` and `b` in either direction.
pub fn find_between<'a>(connections: &'a [Connection], a: &str, b: &str) -> Option<&'a Connection> {
    connections.iter().find(|c| c.links(a, b))
}

/// Classify an existing row as a duplicate-request reason, from the
/// requester's point of view.
pub fn classify_duplicate(existing: &Connection, requester_id: &str) -> DuplicateReason {
    match existing.status {
        ConnectionStatus::Pending if existing.user_id == requester_id => {
            DuplicateReason::AlreadySent
        }
        ConnectionStatus::Pending => DuplicateReason::TheyAlreadySent,
        ConnectionStatus::Accepted => DuplicateReason::AlreadyFriends,
        status => DuplicateReason::Exists(status),
    }
}
