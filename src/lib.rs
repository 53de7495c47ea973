//! keyhub - API-key gated WebSocket hub
//!
//! Issues and revokes bearer keys, admits WebSocket clients that present a live key,
//! and closes every connection a key authorized the moment that key is revoked.
//! Inbound binary frames are MessagePack arrays dispatched through a tree of typed routers.

pub mod auth;
pub mod config;
pub mod server;
pub mod storage;

pub use auth::{AdminKey, IssuedKey, KeyError, KeyId, KeyStore, KeySummary};
pub use config::{HubConfig, ServerConfig, StoreConfig};
pub use server::{BaseRoute, Hub, KeyhubServer, Route, RouteError, Router};
