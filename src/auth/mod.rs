//! Authentication and key lifecycle
//!
//! - `tokens`: key identities, secrets, digests and the admin key
//! - `store`: issuing, validating, listing and revoking keys
//! - `revocation`: fan-out of revocation events to subscribers
//!
//! The hub only depends on the traits below, so any validator can gate it.
//! Without a [`KeyResolver`] the hub still authenticates but cannot close
//! connections when a key is revoked.

mod revocation;
mod store;
mod tokens;

pub use revocation::{Revocation, RevocationReceiver, Subscribers, Unsubscribe};
pub use store::{IssuedKey, KeyError, KeyStore, KeySummary};
pub use tokens::{
    generate_secret, AdminKey, KeyDigest, KeyId, TokenError, DEFAULT_SECRET_LEN, MIN_SECRET_LEN,
};

use async_trait::async_trait;

/// Checks whether a presented secret is acceptable
#[async_trait]
pub trait KeyValidator: Send + Sync {
    async fn validate(&self, secret: &str) -> bool;

    /// Identity resolution, if this validator supports it
    fn resolver(&self) -> Option<&dyn KeyResolver> {
        None
    }
}

/// Maps a presented secret to the identity of the key it belongs to
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, secret: &str) -> Option<KeyId>;
}

/// Publisher of revocation events
pub trait RevocationSource: Send + Sync {
    fn subscribe_revocations(&self) -> (RevocationReceiver, Unsubscribe);
}
