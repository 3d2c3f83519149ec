pub mod app;
pub mod auth;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod sources;
pub mod state;
