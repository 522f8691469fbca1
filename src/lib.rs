//! Read-through/write-through dataset caches kept eventually consistent by
//! replaying a shared change log.
//!
//! [`CacheSystem`] wires the pieces together from [`config::Settings`]:
//! the [`cache::CacheRegistry`], the [`changelog::ChangeLogWriter`] it
//! records mutations with, and the [`reconcile::Reconciler`] that replays
//! peers' mutations into the local caches.

pub mod cache;
pub mod changelog;
pub mod clock;
pub mod config;
pub mod consistency;
pub mod error;
pub mod http;
pub mod reconcile;
mod system;
pub mod telemetry;

pub use system::CacheSystem;
