//! stream-scout: media-stream detection and download orchestration
//!
//! A browser extension reports HTTP traffic, DOM discoveries, and tab
//! lifecycle over a local HTTP API; the core classifies playable streams,
//! registers them per tab, enriches them through an external helper
//! subprocess, orchestrates downloads, and fans live deltas out to popup
//! observers over WebSocket.

pub mod config;
pub mod detection;
pub mod downloads;
pub mod enrichment;
pub mod errors;
pub mod events;
pub mod fanout;
pub mod helper;
pub mod limiter;
pub mod models;
pub mod platform;
pub mod registry;
pub mod storage;
pub mod web;
