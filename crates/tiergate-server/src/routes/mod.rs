pub mod access;
pub mod cache;
pub mod health;
pub mod webhook;
