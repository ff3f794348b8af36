//! Covscope: a loupe for test-run line coverage.
//!
//! Reads SimpleCov-style `.resultset.json` documents, merges multi-suite
//! runs into one coverage map, and answers per-file and per-project
//! coverage questions — including whether the recorded coverage is still
//! trustworthy for the current source tree (staleness detection). Loaded
//! data is cached per resultset behind a stat signature and a content
//! digest, so repeated queries never re-parse an unchanged report.

// Core infrastructure
pub mod cache;
pub mod coverage;
pub mod error;
pub mod globs;
pub mod loader;
pub mod model;
pub mod output;
pub mod paths;
pub mod resultset;
pub mod staleness;

// Front doors for people and agents
pub mod cli;
#[cfg(feature = "mcp")]
pub mod mcp;
