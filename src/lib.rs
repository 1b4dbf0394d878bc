//! `graphmail`: an agent-facing client for the Microsoft Graph mailbox API.
//!
//! Besides plain mail operations, this crate provides an incremental
//! attachment sync that turns the paginated listing API into a resumable,
//! deduplicated download stream with crash-safe local state and a
//! replayable event ledger (see [`sync`]).

pub mod auth;
pub mod config;
pub mod download;
pub mod error;
pub mod folders;
pub mod graph;
pub mod mail;
pub mod model;
pub mod output;
pub mod sync;
