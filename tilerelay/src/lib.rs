//! tilerelay: a caching tile proxy and on-demand tile-pyramid builder.
//!
//! Sits between map clients and heterogeneous upstream sources (WMS servers,
//! tile services, renderers) and answers requests from a multi-backend tile
//! cache. Cache misses are coalesced into meta-tiles, computed once under a
//! per-fingerprint lock, composed, split and stored.
//!
//! This crate holds the moving parts: [`Layer`] (ordered composition of
//! sources and caches), [`TileManager`] (the miss-resolution scheduler),
//! [`TileService`] (the operations the protocol frontends call) and the
//! [`seed`] driver. The building blocks live in `tilerelay_core`,
//! `tilerelay_image`, `tilerelay_cache` and `tilerelay_source`.

mod cache_source;
mod layer;
pub mod manager;
pub mod seed;
mod service;

pub use cache_source::{CachedSource, cache_as_source};
pub use layer::{Layer, LayerEntry, LayerSource, SourceErrorPolicy};
pub use manager::{ServedTile, TileManager, TileManagerBuilder};
pub use service::TileService;
