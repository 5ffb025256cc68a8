//! Operation group endpoints

pub mod routes;

pub use routes::groups_routes;
