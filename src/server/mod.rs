//! keyhub server implementation
//!
//! Handles WebSocket connections, per-key connection tracking and route dispatch of
//! MessagePack frames.

pub mod admin;
mod base_router;
mod connections;
mod hub;
mod router;
pub mod transport;
pub mod websocket;

pub use base_router::{base_router, base_router_with, BaseRoute};
pub use connections::{
    close_code, ClientConnection, CloseReason, ConnectionClosed, ConnectionManager, RegisterError,
    UpgradeTicket,
};
pub use hub::{extract_credential, Hub, HubError, API_KEY_PARAM};
pub use router::{
    decode_int_tag, decode_payload, dispatch_frame, encode_frame, Dispatch, HandlerFuture,
    RequestContext, Route, RouteError, RouteTag, Router,
};
pub use transport::KeyhubServer;
pub use websocket::{create_router, AppState};
