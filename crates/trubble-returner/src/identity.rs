//! Host identity attached to every reported event

use crate::error::TransportError;
use trubble_core::attributes::scalar_string;
use trubble_core::AttributeSnapshot;

const BAD_FQDNS: &[&str] = &["localhost", "localhost.localdomain", "localhost6.localdomain6"];

/// How this host names itself in reported events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub minion_id: String,
    /// Master this agent reports to, or its own hostname when masterless
    pub master: String,
    /// `dest_host`
    pub fqdn: String,
    /// `dest_ip`
    pub ip: String,
    /// `dest_fqdn`
    pub local_fqdn: String,
    pub system_uuid: Option<String>,
}

impl HostIdentity {
    /// Derive identity from grains
    ///
    /// `hostname` is the system hostname used when grains only know `localhost`.
    pub fn from_snapshot(
        snapshot: &AttributeSnapshot,
        minion_id: &str,
        hostname: &str,
    ) -> Result<Self, TransportError> {
        let grain = |key: &str| snapshot.grain(key).and_then(scalar_string).filter(|s| !s.is_empty());
        let first = |key: &str| {
            snapshot
                .grain(key)
                .and_then(|v| v.as_array())
                .and_then(|items| items.first())
                .and_then(scalar_string)
        };
        let ipv4: Vec<String> = snapshot
            .grain("ipv4")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(scalar_string).collect())
            .unwrap_or_default();

        let raw_fqdn = grain("fqdn");
        let mut fqdn = raw_fqdn.clone().unwrap_or_else(|| minion_id.to_string());

        let mut ip = grain("local_ip4")
            .or_else(|| first("fqdn_ip4"))
            .or_else(|| ipv4.first().cloned())
            .ok_or_else(|| TransportError::Identity("no ipv4 grains found".into()))?;
        if ip.starts_with("127.") {
            if let Some(routable) = ipv4.iter().find(|a| !a.is_empty() && !a.starts_with("127.")) {
                ip = routable.clone();
            }
        }

        if BAD_FQDNS.contains(&fqdn.as_str()) {
            fqdn = if hostname.contains('.') && !BAD_FQDNS.contains(&hostname) {
                hostname.to_string()
            } else {
                ip.clone()
            };
        }

        let local_fqdn = grain("local_fqdn")
            .or(raw_fqdn)
            .unwrap_or_else(|| fqdn.clone());
        let master = grain("master").unwrap_or_else(|| hostname.to_string());

        Ok(Self {
            minion_id: minion_id.to_string(),
            master,
            fqdn,
            ip,
            local_fqdn,
            system_uuid: grain("system_uuid"),
        })
    }
}
