//! Server discovery: repeated discovery requests, replies deduplicated by sender address.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info};

use super::command::CommandChannel;
use crate::Result;
use crate::protocol::Message;
use crate::protocol::server_info::{ClientHello, ServerInfo};

/// Discovery window parameters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DiscoveryPlan {
    pub target: SocketAddr,
    pub timeout: Duration,
    /// Delay between repeated discovery requests.
    pub interval: Duration,
    /// `0` collects until the timeout.
    pub max_results: usize,
}

/// Servers found so far; a second reply from the same address replaces the first.
#[derive(Debug, Default)]
pub(crate) struct DiscoveredServers {
    servers: BTreeMap<SocketAddr, ServerInfo>,
}

impl DiscoveredServers {
    /// Returns whether the address was new.
    pub(crate) fn insert(&mut self, address: SocketAddr, info: ServerInfo) -> bool {
        self.servers.insert(address, info).is_none()
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }

    pub(crate) fn is_satisfied(&self, max_results: usize) -> bool {
        max_results > 0 && self.servers.len() >= max_results
    }

    pub(crate) fn into_inner(self) -> BTreeMap<SocketAddr, ServerInfo> {
        self.servers
    }
}

/// Runs one discovery window on the command channel.
///
/// Returns whatever was found when the timeout elapses; finding nothing is not an error here.
pub(crate) async fn discover(
    channel: &CommandChannel,
    hello: &ClientHello,
    plan: DiscoveryPlan,
) -> Result<BTreeMap<SocketAddr, ServerInfo>> {
    let _exclusive = channel.exclusive().await?;
    info!(target = %plan.target, max_results = plan.max_results, "Discovering servers");

    let mut replies = channel.begin_discovery();
    let request = Message::Discovery(hello.clone());
    let deadline = Instant::now() + plan.timeout;
    let mut resend = interval(plan.interval.max(Duration::from_millis(1)));
    resend.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut found = DiscoveredServers::default();

    let outcome = loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                debug!("Discovery window elapsed");
                break Ok(());
            }
            _ = resend.tick() => {
                if let Err(e) = channel.send(plan.target, &request).await {
                    break Err(e);
                }
            }
            reply = replies.recv() => match reply {
                Some((address, info)) => {
                    if found.insert(address, info) {
                        debug!(%address, "Discovered server");
                    }
                    if found.is_satisfied(plan.max_results) {
                        break Ok(());
                    }
                }
                None => break Err(crate::NatNetError::Closed),
            },
        }
    };
    channel.end_discovery();
    outcome?;

    info!("Discovered {} server(s)", found.len());
    Ok(found.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_replies_yield_one_entry() {
        let mut found = DiscoveredServers::default();
        let address = SocketAddr::from(([10, 0, 0, 2], 1510));
        assert!(found.insert(address, ServerInfo::default()));
        let renamed = ServerInfo { application_name: "Motive".into(), ..Default::default() };
        assert!(!found.insert(address, renamed));

        let servers = found.into_inner();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[&address].application_name, "Motive");
    }

    #[test]
    fn zero_max_results_never_satisfies() {
        let mut found = DiscoveredServers::default();
        found.insert(SocketAddr::from(([10, 0, 0, 2], 1510)), ServerInfo::default());
        assert!(!found.is_satisfied(0));
        assert!(found.is_satisfied(1));
        assert!(!found.is_satisfied(2));
    }
}
