//! Build queue and worker protocol endpoints

pub mod routes;

pub use routes::builds_routes;
