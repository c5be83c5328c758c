pub mod auth;
pub mod colors;
pub mod friend_graph;
pub mod location_sync;
pub mod logging;
pub mod realtime;
pub mod session;
pub mod store;
