//! NGA thread reminder library.
//!
//! Watches NGA forum threads through the app API, stores every post in
//! SQLite, notifies on new posts from selected authors and serves the
//! stored data over a small JSON API.

// Test fixtures embed JSON in raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod config;
pub mod constants;
pub mod crawler;
pub mod db;
pub mod monitor;
pub mod notify;
pub mod web;
