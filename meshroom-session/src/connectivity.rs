//! Network reachability monitoring
//!
//! Polls a [`ReachabilitySource`] on a fixed interval and reports edges:
//! - reachable → unreachable: [`NetworkTransition::Disconnected`]
//! - unreachable → reachable: [`NetworkTransition::Reconnected`]
//!
//! Last-known state is seeded `true`, so a session that starts offline
//! reports a disconnect on the first tick.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Address used to probe for a route off the host
const DEFAULT_PROBE_ADDR: ([u8; 4], u16) = ([8, 8, 8, 8], 80);

/// Source of perceived network reachability
#[cfg_attr(test, mockall::automock)]
pub trait ReachabilitySource: Send + Sync {
    fn is_reachable(&self) -> bool;
}

/// Reachable when the OS has a route to the probe address.
///
/// No packet is sent: connecting a UDP socket only resolves the route.
#[derive(Debug, Clone, Copy)]
pub struct RouteReachability {
    probe: SocketAddr,
}

impl RouteReachability {
    #[must_use]
    pub const fn new(probe: SocketAddr) -> Self {
        Self { probe }
    }
}

impl Default for RouteReachability {
    fn default() -> Self {
        Self::new(SocketAddr::from(DEFAULT_PROBE_ADDR))
    }
}

impl ReachabilitySource for RouteReachability {
    fn is_reachable(&self) -> bool {
        UdpSocket::bind(("0.0.0.0", 0))
            .and_then(|socket| socket.connect(self.probe))
            .is_ok()
    }
}

/// Reachability edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransition {
    Disconnected,
    Reconnected,
}

/// Edge detector over a reachability source
pub struct ConnectivityMonitor {
    source: Arc<dyn ReachabilitySource>,
    last_known: bool,
}

impl ConnectivityMonitor {
    #[must_use]
    pub fn new(source: Arc<dyn ReachabilitySource>) -> Self {
        Self {
            source,
            last_known: true,
        }
    }

    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.last_known
    }

    /// One poll: returns the edge crossed since the previous poll, if any
    pub fn poll(&mut self) -> Option<NetworkTransition> {
        let reachable = self.source.is_reachable();
        let transition = match (self.last_known, reachable) {
            (true, false) => Some(NetworkTransition::Disconnected),
            (false, true) => Some(NetworkTransition::Reconnected),
            _ => None,
        };
        self.last_known = reachable;
        transition
    }

    /// Poll every `period` until `cancel` fires or the receiver is dropped
    pub fn spawn(
        mut self,
        period: Duration,
        tx: mpsc::UnboundedSender<NetworkTransition>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "Starting connectivity monitor");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(transition) = self.poll() {
                            debug!(?transition, "Reachability changed");
                            if tx.send(transition).is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            debug!("Connectivity monitor stopped");
        })
    }
}
