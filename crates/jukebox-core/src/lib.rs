//! Queueing, background-fetch and LRU audio cache core for the jukebox daemon.
//!
//! ```text
//!   Jukebox::request()
//!         │
//!         ▼
//!     SongQueue ──SongAdded──► FetchCoordinator ──► CacheStore / Downloader
//!         │  ▲                       │
//!         │  └── title + file path patched in place
//!         ▼
//!   PlaybackDriver ──play──► Streamer
//!         ▲                     │
//!         └──── completed ──────┘
//! ```

pub mod cache;
pub mod collab;
pub mod config;
pub mod error;
pub mod fetch;
pub mod platform;
pub mod playback;
pub mod protocol;
pub mod queue;
pub mod resource;
pub mod service;

pub use error::{Error, Result};
