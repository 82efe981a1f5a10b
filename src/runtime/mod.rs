//! Transport layer for the chargen engine.
//!
//! Two interchangeable backends deliver connection events to the engine:
//! - `mio_impl`: single-threaded readiness reactor (epoll/kqueue)
//! - `tokio_impl`: reader tasks feeding one engine task over a channel
//!
//! Both share:
//! - `Dispatcher`: event routing, acknowledgement and poll scheduling
//! - `ConnectionRegistry`: slab of live transport connections
//! - `socket`: listener setup and send-buffer queries

mod connection;
mod dispatch;
mod mio_impl;
mod socket;
mod tokio_impl;

use crate::config::Config;

/// Run the server on the mio reactor.
pub fn run_mio(config: Config) -> std::io::Result<()> {
    mio_impl::run(config)
}

/// Run the server on the Tokio runtime.
pub fn run_tokio(config: Config) -> std::io::Result<()> {
    tokio_impl::run(config)
}
