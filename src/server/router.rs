//! Binary message routing
//!
//! Every inbound frame is a MessagePack array: `[tag, tag, ..., payload]`.
//! A [`Router`] decodes one tag, looks it up and either hands the rest of the
//! frame to a nested router or decodes the payload for a leaf handler. How a tag
//! is decoded is up to each router, so different levels can use different tag types.

use crate::auth::KeyId;
use crate::server::connections::{ClientConnection, ConnectionClosed};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Future returned by a matched handler
pub type HandlerFuture = BoxFuture<'static, Result<(), RouteError>>;

type TagDecoder<T> = dyn Fn(&mut &[u8]) -> Result<T, RouteError> + Send + Sync;
type LeafFn = dyn Fn(&mut &[u8], RequestContext) -> Result<HandlerFuture, RouteError> + Send + Sync;

/// Values usable as route tags
pub trait RouteTag: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> RouteTag for T where T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route for path '{path}'")]
    NotFound { path: String },

    #[error("route '{tag}' is already registered")]
    Collision { tag: String },

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("malformed frame: {0}")]
    Framing(String),

    #[error("expected {expected} value(s) after path '{path}', found {found}")]
    Structural {
        path: String,
        expected: usize,
        found: usize,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RouteError {
    /// Whether the frame itself was unreadable, which ends the connection
    pub fn is_framing(&self) -> bool {
        matches!(self, RouteError::Framing(_))
    }
}

impl From<ConnectionClosed> for RouteError {
    fn from(e: ConnectionClosed) -> Self {
        RouteError::Transport(e.to_string())
    }
}

/// Per-frame context handed to handlers
#[derive(Clone)]
pub struct RequestContext {
    connection: Arc<ClientConnection>,
    path: Vec<String>,
}

impl RequestContext {
    pub fn new(connection: Arc<ClientConnection>) -> Self {
        Self {
            connection,
            path: Vec::new(),
        }
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    /// Key that authorized the connection, if known
    pub fn key_id(&self) -> Option<KeyId> {
        self.connection.key_id
    }

    /// Tags decoded so far, outermost first
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn path_string(&self) -> String {
        self.path.join("/")
    }

    fn push_tag(&mut self, tag: &impl fmt::Display) {
        self.path.push(tag.to_string());
    }

    /// Encode `[tag, payload]` and queue it on the connection
    pub async fn send<Tg, P>(&self, tag: Tg, payload: &P) -> Result<(), RouteError>
    where
        Tg: Serialize,
        P: Serialize + ?Sized,
    {
        let frame = encode_frame(tag, payload)?;
        self.connection.send(frame).await?;
        Ok(())
    }
}

/// Encode an outbound frame as the MessagePack array `[tag, payload]`
pub fn encode_frame<Tg, P>(tag: Tg, payload: &P) -> Result<Vec<u8>, RouteError>
where
    Tg: Serialize,
    P: Serialize + ?Sized,
{
    rmp_serde::to_vec(&(tag, payload)).map_err(|e| RouteError::Encode(e.to_string()))
}

/// Decode a MessagePack integer tag and convert it into `T`
pub fn decode_int_tag<T: TryFrom<i64>>(rd: &mut &[u8]) -> Result<T, RouteError> {
    let raw: i64 =
        rmp::decode::read_int(rd).map_err(|e| RouteError::Decode(format!("route tag: {}", e)))?;

    T::try_from(raw).map_err(|_| RouteError::Decode(format!("invalid route tag {}", raw)))
}

/// Decode one MessagePack value into `P`
pub fn decode_payload<P: DeserializeOwned>(rd: &mut &[u8]) -> Result<P, RouteError> {
    rmp_serde::from_read(rd).map_err(|e| RouteError::Decode(e.to_string()))
}

/// Anything that can take over dispatch of the remaining frame
pub trait Dispatch: Send + Sync {
    /// Decode the next tag from `rd` and resolve it to a handler.
    /// `remaining` is the number of array elements not yet consumed.
    fn dispatch(
        &self,
        ctx: RequestContext,
        remaining: usize,
        rd: &mut &[u8],
    ) -> Result<HandlerFuture, RouteError>;

    fn route_count(&self) -> usize;
}

/// A leaf: payload decoder plus handler
#[derive(Clone)]
pub struct LeafRoute {
    invoke: Arc<LeafFn>,
    payload_type: &'static str,
}

impl fmt::Debug for LeafRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafRoute")
            .field("payload_type", &self.payload_type)
            .finish()
    }
}

/// What a tag resolves to
#[derive(Clone)]
pub enum Route {
    Leaf(LeafRoute),
    Nested(Arc<dyn Dispatch>),
}

impl Route {
    /// Leaf whose payload is decoded with serde
    pub fn leaf<P, F, Fut>(handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RouteError>> + Send + 'static,
    {
        Self::with_decoder(decode_payload::<P>, handler)
    }

    /// Leaf with an explicit payload decoder
    pub fn with_decoder<P, D, F, Fut>(decoder: D, handler: F) -> Self
    where
        P: Send + 'static,
        D: Fn(&mut &[u8]) -> Result<P, RouteError> + Send + Sync + 'static,
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RouteError>> + Send + 'static,
    {
        let invoke: Arc<LeafFn> = Arc::new(move |rd: &mut &[u8], ctx: RequestContext| {
            let payload = decoder(rd)?;
            Ok(handler(payload, ctx).boxed())
        });

        Route::Leaf(LeafRoute {
            invoke,
            payload_type: std::any::type_name::<P>(),
        })
    }

    /// Hand everything after this tag to another router
    pub fn nested<U: RouteTag>(router: Router<U>) -> Self {
        Route::Nested(Arc::new(router))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Leaf(leaf) => leaf.fmt(f),
            Route::Nested(sub) => f
                .debug_struct("Nested")
                .field("routes", &sub.route_count())
                .finish(),
        }
    }
}

/// Tag-keyed dispatch table
///
/// Registration happens at setup; lookups run concurrently from every read loop.
pub struct Router<T: RouteTag> {
    decode_tag: Arc<TagDecoder<T>>,
    routes: DashMap<T, Route>,
}

impl<T: RouteTag> Router<T> {
    pub fn new<F>(decode_tag: F) -> Self
    where
        F: Fn(&mut &[u8]) -> Result<T, RouteError> + Send + Sync + 'static,
    {
        Self {
            decode_tag: Arc::new(decode_tag),
            routes: DashMap::new(),
        }
    }

    /// Bind `tag` to `route`. An already bound tag is an error, never an overwrite.
    pub fn register(&self, tag: T, route: Route) -> Result<(), RouteError> {
        if let Route::Nested(sub) = &route {
            if sub.route_count() == 0 {
                return Err(RouteError::InvalidRoute(format!(
                    "nested router for '{}' has no routes",
                    tag
                )));
            }
        }

        match self.routes.entry(tag) {
            Entry::Occupied(_) => Err(RouteError::Collision {
                tag: tag.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(route);
                Ok(())
            }
        }
    }

    pub fn contains(&self, tag: &T) -> bool {
        self.routes.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<T: RouteTag> Dispatch for Router<T> {
    fn dispatch(
        &self,
        mut ctx: RequestContext,
        remaining: usize,
        rd: &mut &[u8],
    ) -> Result<HandlerFuture, RouteError> {
        if remaining == 0 {
            return Err(RouteError::Structural {
                path: ctx.path_string(),
                expected: 1,
                found: 0,
            });
        }

        let tag = (self.decode_tag)(rd)?;
        ctx.push_tag(&tag);
        let remaining = remaining - 1;

        // Clone out so no map guard outlives the lookup
        let route = self
            .routes
            .get(&tag)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RouteError::NotFound {
                path: ctx.path_string(),
            })?;

        debug!(conn_id = %ctx.connection.id, path = %ctx.path_string(), "Dispatching frame");

        match route {
            Route::Leaf(leaf) => {
                if remaining != 1 {
                    return Err(RouteError::Structural {
                        path: ctx.path_string(),
                        expected: 1,
                        found: remaining,
                    });
                }
                (leaf.invoke)(rd, ctx)
            }
            Route::Nested(sub) => sub.dispatch(ctx, remaining, rd),
        }
    }

    fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Read the array header of a frame and run it through `router`
pub async fn dispatch_frame(
    router: &dyn Dispatch,
    ctx: RequestContext,
    frame: &[u8],
) -> Result<(), RouteError> {
    let handler = {
        let mut rd = frame;
        let len = rmp::decode::read_array_len(&mut rd)
            .map_err(|e| RouteError::Framing(e.to_string()))?;
        let handler = router.dispatch(ctx, len as usize, &mut rd)?;

        // Payload decoding is synchronous, so the whole frame has been read by now
        if !rd.is_empty() {
            return Err(RouteError::Framing(format!(
                "{} trailing bytes after frame",
                rd.len()
            )));
        }
        handler
    };

    handler.await
}
