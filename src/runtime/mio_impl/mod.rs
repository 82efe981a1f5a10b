//! mio-based transport.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! One reactor thread owns the listener, every connection and the engine,
//! so engine callbacks never run concurrently.

mod event_loop;

pub use event_loop::Reactor;

use crate::config::Config;

/// Run the server using the mio backend.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut reactor = Reactor::bind(&config)?;
    reactor.run()
}
