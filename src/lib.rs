//! Shared-store coordination for a two-process job scraping pipeline.
//!
//! A discovery producer registers job ids it finds on listing pages; an
//! enrichment consumer fetches full detail for pending ids and merges
//! it in. Both processes share one SQLite file, which serves as work
//! queue and system of record at once. See `db` for the write
//! protocols and `workers` for the long-running loops.

pub mod db;
pub mod models;
pub mod workers;
