//! Revision reads and maintenance endpoints

pub mod routes;

pub use routes::versions_routes;
