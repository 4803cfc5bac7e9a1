//! Feedsmith - a feed aggregator for syndication feeds and plain web pages.
//!
//! Standard RSS/Atom feeds are parsed directly; any other page can be turned
//! into a feed with CSS-like queries. Entries are reconciled into SQLite,
//! article pages and images are cached locally, and a small web interface
//! serves the result.

pub mod config;
pub mod dates;
pub mod db;
pub mod error;
pub mod extract;
pub mod feed;
pub mod fetcher;
pub mod html_feed;
pub mod http;
pub mod media;
pub mod notify;
pub mod query;
pub mod reader;
pub mod reconcile;
pub mod routes;
pub mod view;
