//! Nostr relay fleet client with tiered query resolution and a local event cache.
//!
//! [`ProtocolClient`] is the entry point: it owns a [`RelayFleet`] of
//! WebSocket [`Connection`]s, an [`EventCache`] on SQLite and an optional
//! [`GatewayClient`].

pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod filter;
pub mod fleet;
pub mod gateway;
pub mod logging;
pub mod message;
pub mod relay_store;

pub use cache::EventCache;
pub use client::{
    cache_in_background, BroadcastResult, ClientConfig, CountResult, CountSource,
    ProtocolClient, RelayOutcome, Subscription,
};
pub use connection::{Connection, ConnectionConfig, ConnectionError, ConnectionState};
pub use error::{Error, Result};
pub use event::{Event, KindClass, Keys, Signer, Tag, UnsignedEvent};
pub use filter::{Filter, SortKey};
pub use fleet::{ConnectionStatus, FleetConfig, FleetSummary, RelayChange, RelayFleet, RelayRecord};
pub use gateway::{GatewayClient, GatewayResponse, HttpGateway};
pub use message::{ClientMessage, RelayMessage};
pub use relay_store::{FileRelayStore, MemoryRelayStore, RelayListStore};
