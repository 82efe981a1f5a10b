//! Periodic connection status report.
//!
//! Renders a slot table snapshot the way an operator watches it on the
//! console: one line per slot, then the active total.

use crate::slots::{ConnId, SlotView};
use std::net::SocketAddr;
use tracing::info;

/// Render the report lines for `views`.
///
/// `peer_addr` resolves a connection handle to its remote address, if the
/// transport still knows it.
pub fn render<F>(listen: &str, views: &[SlotView], peer_addr: F) -> Vec<String>
where
    F: Fn(ConnId) -> Option<SocketAddr>,
{
    let mut lines = Vec::with_capacity(views.len() + 2);
    lines.push(format!("--- Chargen Connection Status ({listen}) ---"));

    for view in views {
        match view.occupant {
            Some(conn) => {
                let peer = peer_addr(conn)
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                lines.push(format!(
                    "  Slot {}: ACTIVE peer={} rotation={}",
                    view.index, peer, view.cursor
                ));
            }
            None => lines.push(format!("  Slot {}: Free", view.index)),
        }
    }

    let active = views.iter().filter(|view| view.is_occupied()).count();
    lines.push(format!("Total Active Clients: {}/{}", active, views.len()));
    lines
}

/// Log the status report at info level.
pub fn report<F>(listen: &str, views: &[SlotView], peer_addr: F)
where
    F: Fn(ConnId) -> Option<SocketAddr>,
{
    for line in render(listen, views, peer_addr) {
        info!("{line}");
    }
}
