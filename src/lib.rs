//! Local-first analytics core for community data captured by a companion
//! browser extension.
//!
//! The extension polls `/api/tasks` for fetch work, performs the remote
//! calls with the member's own session, and posts raw results back to
//! `/api/results`. Everything it returns lands append-only in a fetch
//! ledger; extraction derives versioned snapshot rows from the ledger and
//! can be replayed at any time.

pub mod config;
pub mod db;
pub mod extract;
pub mod filter;
pub mod planner;
pub mod policy;
pub mod web;
