//! Collection Watcher - keeps a music collection store in step with disk.
//!
//! The [`scanner`] walks collection roots on a background thread, reconciles
//! what it finds with a [`store::Store`] and reports every change as a
//! [`scanner::CollectionEvent`]. Tag reading, CUE parsing, fingerprinting,
//! image decoding and file watching are pluggable collaborators.

pub mod cli;
pub mod config;
pub mod cue;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod paths;
pub mod scanner;
pub mod store;
pub mod tags;
pub mod tasks;
#[cfg(test)]
pub(crate) mod test_utils;
