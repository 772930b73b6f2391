// crates/server/src/routes/mod.rs
pub mod backends;
pub mod events;
pub mod sessions;
