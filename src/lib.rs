#[macro_use]
extern crate tracing;

pub mod address;
pub mod cluster;
pub mod context;
pub mod health;
pub mod queue;
pub mod rdns;
pub mod reconcile;
pub mod renew;
pub mod retry;
pub mod settings;
pub mod watcher;

#[cfg(test)]
mod testing;
