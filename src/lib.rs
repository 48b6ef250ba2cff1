//! # codecensus: corpus-scale code usage statistics
//!
//! Parses every source file of a large corpus, extracts normalized usage
//! facts (calls, imports, complexity metrics, pattern hits) and folds them
//! into aggregate tables, checkpointing as it goes so an interrupted run can
//! resume without double counting.
//!
//! ## Architecture
//!
//! - **[`config`]**: run configuration (JSON file + defaults + validation)
//! - **[`loader`]**: corpus enumeration and content retrieval (directory, manifest, dump)
//! - **[`parser`]**: Tree-sitter parsing into structural trees, with pre-processing
//! - **[`extractor`]**: lazy fact extraction, metrics and pattern detectors
//! - **[`aggregate`]**: mergeable aggregate tables, sharded aggregation and CSV export
//! - **[`store`]**: checkpoint persistence (SQLite, in-memory)
//! - **[`status`]**: per-unit terminal statuses and failure taxonomy
//! - **[`pipeline`]**: the run orchestrator, its phases and the final report

pub mod aggregate;
pub mod config;
pub mod extractor;
pub mod loader;
pub mod parser;
pub mod pipeline;
pub mod status;
pub mod store;
