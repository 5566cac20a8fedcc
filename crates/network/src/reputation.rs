use std::collections::HashSet;
use std::net::IpAddr;

/// Read-only view of the node's peer blacklist.
///
/// Consulted before dialing; connections never write to it.
pub trait PeerReputationStore: Send + Sync {
    fn is_bad(&self, address: &IpAddr) -> bool;
}

/// Store that trusts every peer, for nodes running without a blacklist.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustAll;

impl PeerReputationStore for TrustAll {
    fn is_bad(&self, _address: &IpAddr) -> bool {
        false
    }
}

/// Fixed set of banned addresses
impl PeerReputationStore for HashSet<IpAddr> {
    fn is_bad(&self, address: &IpAddr) -> bool {
        self.contains(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_set_flags_listed_addresses() {
        let banned: IpAddr = "10.0.0.7".parse().unwrap();
        let store: HashSet<IpAddr> = [banned].into_iter().collect();
        assert!(store.is_bad(&banned));
        assert!(!store.is_bad(&"10.0.0.8".parse().unwrap()));
        assert!(!TrustAll.is_bad(&banned));
    }
}
