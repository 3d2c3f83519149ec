pub mod backend;
pub mod schema;
pub mod store;
pub mod tiers;

pub use backend::DuckDbBackend;
