//! Cluster membership: configurations, fingerprints, and configuration storage.

mod storage;

pub use storage::ConfigurationObserver;
pub use storage::ConfigurationStorage;
pub use storage::InMemoryConfigurationStorage;
pub use storage::MembershipDiff;
pub use storage::PersistentConfigurationStorage;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use bytes::Buf;
use bytes::BufMut;
use serde::Deserialize;
use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

/// A Raft node's ID.
pub type NodeId = u64;

/// A single cluster configuration: an ordered mapping from member ID to
/// endpoint address, identified by a 64-bit fingerprint.
///
/// The fingerprint of a bootstrap configuration is the hash of its content;
/// each applied reconfiguration advances the fingerprint of the previous
/// active configuration by one, so fingerprints strictly increase over a
/// cluster's lifetime and every applied configuration is uniquely
/// identified.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    /// The voting members, ordered by ID.
    pub members: BTreeMap<NodeId, String>,
    /// The fingerprint uniquely identifying this configuration.
    pub fingerprint: u64,
}

impl ClusterConfiguration {
    /// Create a bootstrap configuration from the given members. The
    /// fingerprint is derived from the content.
    pub fn bootstrap(members: BTreeMap<NodeId, String>) -> Self {
        let mut cfg = Self { members, fingerprint: 0 };
        cfg.fingerprint = cfg.content_hash();
        cfg
    }

    /// Create a bootstrap configuration containing only the given node.
    pub fn new_initial(id: NodeId, address: String) -> Self {
        let mut members = BTreeMap::new();
        members.insert(id, address);
        Self::bootstrap(members)
    }

    /// Derive the successor configuration with the given member set. The
    /// fingerprint advances by one.
    pub fn successor(&self, members: BTreeMap<NodeId, String>) -> Self {
        Self {
            members,
            fingerprint: self.fingerprint.wrapping_add(1),
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The canonical binary encoding. Also the input of the content hash, so
    /// the encoding must stay deterministic: members in ID order.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.fingerprint);
        buf.put_u32_le(self.members.len() as u32);
        for (id, address) in &self.members {
            buf.put_u64_le(*id);
            buf.put_u16_le(address.len() as u16);
            buf.put_slice(address.as_bytes());
        }
    }

    /// Decode a configuration from its canonical binary encoding.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeConfigurationError> {
        if buf.remaining() < 12 {
            return Err(DecodeConfigurationError::Truncated);
        }
        let fingerprint = buf.get_u64_le();
        let count = buf.get_u32_le();
        let mut members = BTreeMap::new();
        for _ in 0..count {
            if buf.remaining() < 10 {
                return Err(DecodeConfigurationError::Truncated);
            }
            let id = buf.get_u64_le();
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return Err(DecodeConfigurationError::Truncated);
            }
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            let address = String::from_utf8(raw).map_err(|_| DecodeConfigurationError::BadAddress)?;
            members.insert(id, address);
        }
        Ok(Self { members, fingerprint })
    }

    /// Hash of the member content (fingerprint excluded).
    pub fn content_hash(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        for (id, address) in &self.members {
            hasher.update(&id.to_le_bytes());
            hasher.update(&(address.len() as u16).to_le_bytes());
            hasher.update(address.as_bytes());
        }
        hasher.digest()
    }
}

/// Errors decoding a configuration blob.
#[derive(Debug, thiserror::Error)]
pub enum DecodeConfigurationError {
    #[error("configuration blob is truncated")]
    Truncated,
    #[error("configuration member address is not valid utf-8")]
    BadAddress,
}

/// The membership view a Raft node reasons about: the active configuration
/// plus at most one proposed configuration.
///
/// While a proposal is in flight the cluster quorum is computed against the
/// union of the two member sets; a new configuration only takes effect once
/// the carrying log entry has replicated to a majority of the proposed set.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// The active configuration.
    pub active: ClusterConfiguration,
    /// The proposed configuration, when a reconfiguration is in flight.
    pub proposed: Option<ClusterConfiguration>,
}

impl Membership {
    /// Create a new initial membership containing only the given node ID.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            active: ClusterConfiguration::new_initial(id, String::new()),
            proposed: None,
        }
    }

    /// Membership around a bootstrap configuration.
    pub fn uniform(active: ClusterConfiguration) -> Self {
        Self { active, proposed: None }
    }

    /// All node IDs in the union of active and proposed member sets.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all: BTreeSet<NodeId> = self.active.members.keys().cloned().collect();
        if let Some(proposed) = &self.proposed {
            all.extend(proposed.members.keys().cloned());
        }
        all
    }

    /// Check if the given node ID is in the active or proposed member set.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.active.contains(id) || self.proposed.as_ref().map(|p| p.contains(id)).unwrap_or(false)
    }

    /// Whether a reconfiguration is in flight.
    pub fn is_reconfiguring(&self) -> bool {
        self.proposed.is_some()
    }

    /// The membership once the in-flight proposal (if any) is applied.
    pub fn to_final(&self) -> Self {
        match &self.proposed {
            None => self.clone(),
            Some(p) => Self {
                active: p.clone(),
                proposed: None,
            },
        }
    }

    /// The number of confirmations needed for a quorum of the relevant
    /// configuration: the union of old and new while reconfiguring.
    pub fn quorum(&self) -> usize {
        crate::quorum::majority_of(self.all_nodes().len())
    }

    /// Quorum check over an arbitrary confirmation predicate. The local node
    /// counts like any other member.
    pub fn quorum_achieved<F>(&self, confirmed: F) -> bool
    where F: Fn(&NodeId) -> bool {
        let nodes = self.all_nodes();
        let granted = nodes.iter().filter(|id| confirmed(id)).count();
        granted >= crate::quorum::majority_of(nodes.len())
    }

    /// Whether the proposed configuration has replicated to a majority of
    /// its own (new) member set. Vacuously false without a proposal.
    pub fn proposal_committed<F>(&self, confirmed: F) -> bool
    where F: Fn(&NodeId) -> bool {
        match &self.proposed {
            None => false,
            Some(p) => {
                let granted = p.members.keys().filter(|id| confirmed(id)).count();
                granted >= crate::quorum::majority_of(p.members.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    fn cfg(ids: &[NodeId]) -> ClusterConfiguration {
        ClusterConfiguration::bootstrap(ids.iter().map(|id| (*id, format!("node-{}", id))).collect())
    }

    #[test]
    fn test_fingerprint_identifies_content() {
        let a = cfg(&[1, 2, 3]);
        let b = cfg(&[1, 2, 3]);
        let c = cfg(&[1, 2, 4]);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn test_successor_advances_fingerprint_by_one() {
        let a = cfg(&[1, 2, 3]);
        let b = a.successor(btreemap! {1 => "node-1".into(), 2 => "node-2".into()});
        assert_eq!(b.fingerprint, a.fingerprint.wrapping_add(1));
        let c = b.successor(a.members.clone());
        assert_eq!(c.fingerprint, a.fingerprint.wrapping_add(2));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let a = cfg(&[7, 9, 11]);
        let mut buf = bytes::BytesMut::new();
        a.encode(&mut buf);
        let decoded = ClusterConfiguration::decode(&mut buf.freeze()).unwrap();
        assert_eq!(a, decoded);
    }

    #[test]
    fn test_union_quorum_while_reconfiguring() {
        let active = cfg(&[1, 2, 3]);
        let proposed = active.successor(btreemap! {
            1 => "node-1".into(), 2 => "node-2".into(), 3 => "node-3".into(),
            4 => "node-4".into(), 5 => "node-5".into(),
        });
        let membership = Membership {
            active,
            proposed: Some(proposed),
        };
        // Union is {1..5}: majority is 3.
        assert_eq!(membership.quorum(), 3);
        assert!(membership.quorum_achieved(|id| *id <= 3));
        assert!(!membership.quorum_achieved(|id| *id <= 2));

        // The proposal itself commits against the NEW set of 5: majority 3.
        assert!(membership.proposal_committed(|id| *id <= 3));
        assert!(!membership.proposal_committed(|id| *id <= 2));
    }

    #[test]
    fn test_to_final_drops_proposal() {
        let active = cfg(&[1, 2]);
        let proposed = active.successor(btreemap! {1 => "node-1".into()});
        let membership = Membership {
            active: active.clone(),
            proposed: Some(proposed.clone()),
        };
        let done = membership.to_final();
        assert_eq!(done.active, proposed);
        assert!(done.proposed.is_none());
        assert!(!done.is_reconfiguring());
    }
}
