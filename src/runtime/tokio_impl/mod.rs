//! Tokio message-passing transport.
//!
//! The acceptor and one reader task per connection turn socket activity
//! into [`Event`](crate::flow::Event) messages. A single engine task owns
//! the flow engine and every write half, so events for the slot table are
//! still handled one at a time.

mod event_loop;

pub use event_loop::Server;

use crate::config::Config;

/// Run the server on a multi-threaded Tokio runtime.
pub fn run(config: Config) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("chargen-worker")
        .build()?;

    runtime.block_on(async move {
        let server = Server::bind(&config)?;
        server.run().await
    })
}
