//! Core types of the tilerelay workspace: spatial reference handling, tile grids,
//! coverages, bounding boxes, tile formats, error kinds and normalized configuration.
//!
//! Everything in this crate is long-lived and immutable after construction; the
//! request-scoped machinery (caches, sources, the tile manager) lives in the
//! sibling crates and consumes these types by reference.

mod bbox;
pub mod concurrency;
pub mod config;
mod error;
mod format;
pub mod coverage;
pub mod grid;
pub mod srs;

pub use bbox::MapBBox;
pub use concurrency::ConcurrencyLimits;
pub use config::*;
pub use coverage::Coverage;
pub use error::*;
pub use format::TileFormat;
pub use grid::{GridBuilder, GridOrigin, MetaTile, ResFactor, TileCoord, TileGrid, TileRange};
pub use srs::Srs;
