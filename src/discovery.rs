//! LAN peer discovery. `Discovery` is the abstraction the node depends on;
//! `MdnsDiscovery` is the only implementation, built on `mdns-sd`.

use std::collections::HashMap;
use std::net::SocketAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::sync::mpsc;

const SERVICE_TYPE: &str = "_meshchat._tcp.local.";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mdns-sd daemon error: {0}")]
    Daemon(#[from] mdns_sd::Error),
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerUp { node_id: String, addr: SocketAddr },
    PeerDown { node_id: String },
}

/// Local-network peer discovery, abstracted so the node doesn't depend on
/// any one advertisement mechanism.
#[async_trait::async_trait]
pub trait Discovery: Send {
    async fn run(self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<(), DiscoveryError>;
}

/// mDNS/DNS-SD discovery: advertises this node's `(node_id, port)` under
/// `_meshchat._tcp.local.` and browses for the same service type.
pub struct MdnsDiscovery {
    node_id: String,
    username: String,
    port: u16,
}

impl MdnsDiscovery {
    pub fn new(node_id: String, username: String, port: u16) -> Self {
        MdnsDiscovery { node_id, username, port }
    }
}

#[async_trait::async_trait]
impl Discovery for MdnsDiscovery {
    async fn run(self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<(), DiscoveryError> {
        let daemon = ServiceDaemon::new()?;

        let host_ip = local_ip_or_unspecified();
        let instance_name = format!("meshchat-{}", &self.node_id[..16.min(self.node_id.len())]);
        let mut properties = HashMap::new();
        properties.insert("node_id".to_string(), self.node_id.clone());
        properties.insert("username".to_string(), self.username.clone());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &format!("{instance_name}.local."),
            host_ip,
            self.port,
            Some(properties),
        )
        .map_err(DiscoveryError::Daemon)?;
        daemon.register(service)?;

        let receiver = daemon.browse(SERVICE_TYPE)?;

        // Maps the mDNS service's fullname to the node_id it announced,
        // populated on PeerUp. The departure event only carries a fullname,
        // so this index is what lets us resolve a departure to the exact
        // peer that announced under that name, rather than guessing.
        let mut service_to_node: HashMap<String, String> = HashMap::new();

        // mdns-sd delivers events on its own background thread via this
        // std::sync::mpsc-style receiver; `recv_async` bridges it onto the
        // tokio runtime without ever touching shared state from that thread
        // directly — only `DiscoveryEvent` values cross the boundary.
        while let Ok(event) = receiver.recv_async().await {
            match event {
                ServiceEvent::ServiceResolved(info) => {
                    let Some(node_id) = info.get_property_val_str("node_id").map(str::to_string) else {
                        continue;
                    };
                    if node_id == self.node_id {
                        continue; // don't discover ourselves
                    }
                    let Some(ip) = info.get_addresses().iter().next() else {
                        continue;
                    };
                    let addr = SocketAddr::new(*ip, info.get_port());
                    service_to_node.insert(info.get_fullname().to_string(), node_id.clone());
                    if tx.send(DiscoveryEvent::PeerUp { node_id, addr }).await.is_err() {
                        break;
                    }
                }
                ServiceEvent::ServiceRemoved(_ty, fullname) => {
                    if let Some(node_id) = service_to_node.remove(&fullname) {
                        if tx.send(DiscoveryEvent::PeerDown { node_id }).await.is_err() {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn local_ip_or_unspecified() -> std::net::IpAddr {
    // mdns-sd resolves the advertised interface itself when given the
    // unspecified address; we don't need to enumerate interfaces.
    std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}
