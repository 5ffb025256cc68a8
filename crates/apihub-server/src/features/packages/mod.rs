//! Package namespace endpoints

pub mod routes;

pub use routes::packages_routes;
