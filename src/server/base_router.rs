//! Connection-level control routes
//!
//! Tags: `0` ping, `1` pong, `2` application messages (handed to a nested router).
//! A ping carries an integer and is answered with a pong frame `[1, <same integer>]`.

use crate::server::router::{decode_int_tag, RequestContext, Route, RouteError, RouteTag, Router};
use serde::{Serialize, Serializer};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BaseRoute {
    Ping = 0,
    Pong = 1,
    App = 2,
}

impl TryFrom<i64> for BaseRoute {
    type Error = RouteError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BaseRoute::Ping),
            1 => Ok(BaseRoute::Pong),
            2 => Ok(BaseRoute::App),
            other => Err(RouteError::Decode(format!("invalid base route {}", other))),
        }
    }
}

impl fmt::Display for BaseRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseRoute::Ping => write!(f, "ping"),
            BaseRoute::Pong => write!(f, "pong"),
            BaseRoute::App => write!(f, "app"),
        }
    }
}

impl Serialize for BaseRoute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

async fn handle_ping(value: i64, ctx: RequestContext) -> Result<(), RouteError> {
    ctx.send(BaseRoute::Pong, &value).await?;
    debug!(conn_id = %ctx.connection().id, value, "Sent pong");
    Ok(())
}

async fn handle_pong(_value: i64, _ctx: RequestContext) -> Result<(), RouteError> {
    Ok(())
}

/// Router with the ping and pong routes registered
pub fn base_router() -> Result<Router<BaseRoute>, RouteError> {
    let router = Router::new(decode_int_tag::<BaseRoute>);

    router.register(BaseRoute::Ping, Route::leaf(handle_ping))?;
    router.register(BaseRoute::Pong, Route::leaf(handle_pong))?;

    Ok(router)
}

/// Base router with `app` mounted under the application tag
pub fn base_router_with<U: RouteTag>(app: Router<U>) -> Result<Router<BaseRoute>, RouteError> {
    let router = base_router()?;
    router.register(BaseRoute::App, Route::nested(app))?;
    Ok(router)
}
