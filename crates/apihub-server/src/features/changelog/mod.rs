//! Comparison and changelog endpoints

pub mod routes;

pub use routes::{changelog_routes, comparisons_routes};
