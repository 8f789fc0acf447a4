//! Client library for the NMDC REST API: linked-instance traversal, a local
//! SQLite cache of entity relationships, collection search, record export,
//! GFF annotation queries and two-group enrichment.

pub mod app;
pub mod biosample;
pub mod collection;
pub mod config;
pub mod data_object;
pub mod domain;
pub mod enrichment;
pub mod error;
pub mod export;
pub mod extract;
pub mod filter;
pub mod fs_util;
pub mod functional_search;
pub mod gff;
pub mod link_cache;
pub mod linked_instances;
pub mod output;
pub mod study;
pub mod transport;
