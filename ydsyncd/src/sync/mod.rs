pub mod backoff;
pub mod conflict;
pub mod context;
pub mod digest;
pub mod engine;
pub mod executor;
pub mod handler;
pub mod history;
#[cfg(test)]
pub(crate) mod memory_remote;
pub mod ops;
pub mod pairing;
pub mod paths;
pub mod reconciler;
pub mod remote;
pub mod status;
pub mod task;
pub mod transfer;
pub mod watcher;
