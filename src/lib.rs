//! MTDM: a multithreaded segmented HTTP download engine.
//!
//! A file is split into byte ranges, each fetched by its own worker over a
//! ranged GET and written to a segment file; completed segments are stitched
//! into the final output. A bounded scheduler caps how many tasks download
//! at once.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod logging;
pub mod naming;
pub mod pool;
pub mod probe;
pub mod provider;
pub mod ranges;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod speed;
pub mod state;
pub mod task;
