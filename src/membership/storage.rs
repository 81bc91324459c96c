//! Cluster configuration storage: the active/proposed two-slot store with
//! two-phase reconfiguration.
//!
//! Two implementations share the `ConfigurationStorage` interface. The
//! in-memory variant backs tests and ephemeral nodes; the persistent
//! variant keeps `config.active` and `config.proposed` blobs on disk and
//! applies proposals with atomic-rename semantics.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::error::SyncError;
use crate::membership::ClusterConfiguration;
use crate::membership::NodeId;
use crate::sync::event::AsyncCompletionPipe;

const CONFIG_MAGIC: u32 = 0x52_57_43_46; // "RWCF"
const CONFIG_VERSION: u32 = 1;

/// The per-member difference between two configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub added: Vec<(NodeId, String)>,
    pub removed: Vec<NodeId>,
}

impl MembershipDiff {
    /// Compute the diff transforming `old` into `new`.
    pub fn between(old: &ClusterConfiguration, new: &ClusterConfiguration) -> Self {
        let added = new
            .members
            .iter()
            .filter(|(id, _)| !old.members.contains_key(id))
            .map(|(id, addr)| (*id, addr.clone()))
            .collect();
        let removed = old.members.keys().filter(|id| !new.members.contains_key(id)).cloned().collect();
        Self { added, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A handler invoked after a configuration has been applied.
pub type ConfigurationObserver = Box<dyn Fn(&ClusterConfiguration, &MembershipDiff) + Send + Sync>;

/// The interface of a two-slot (active/proposed) configuration store.
///
/// At most one proposed configuration exists at a time; `apply` promotes it
/// to active, fires the registered observers with the membership diff, and
/// completes every pending `wait_for_apply` future.
#[async_trait]
pub trait ConfigurationStorage: Send + Sync + 'static {
    /// Load persisted configuration state. A no-op for in-memory stores.
    async fn load(&self) -> Result<()>;

    /// The current active configuration.
    fn active(&self) -> ClusterConfiguration;

    /// The proposed configuration, if a reconfiguration is in flight.
    fn proposed(&self) -> Option<ClusterConfiguration>;

    /// Populate the proposed slot with the active configuration plus the
    /// given member. Returns false when the change is a no-op.
    async fn add_member(&self, id: NodeId, address: String) -> Result<bool>;

    /// Populate the proposed slot with the active configuration minus the
    /// given member. Returns false when the change is a no-op.
    async fn remove_member(&self, id: NodeId) -> Result<bool>;

    /// Replace the proposed slot with the given configuration.
    async fn propose(&self, configuration: ClusterConfiguration) -> Result<()>;

    /// Promote the proposed configuration to active, clear the proposed
    /// slot, notify observers and pending `wait_for_apply` futures.
    async fn apply(&self) -> Result<()>;

    /// Resolves when `apply` next succeeds, yielding the new active
    /// configuration. Multiple waiters share the same apply event.
    async fn wait_for_apply(&self) -> Result<ClusterConfiguration, SyncError>;

    /// Register an observer fired on every apply.
    fn register_observer(&self, observer: ConfigurationObserver);
}

struct Slots {
    active: ClusterConfiguration,
    proposed: Option<ClusterConfiguration>,
}

impl Slots {
    fn propose_members(&mut self, members: BTreeMap<NodeId, String>) -> bool {
        if members == self.active.members {
            return false;
        }
        if let Some(p) = &self.proposed {
            if p.members == members {
                return false;
            }
        }
        self.proposed = Some(self.active.successor(members));
        true
    }
}

/// In-memory configuration storage.
pub struct InMemoryConfigurationStorage {
    slots: Mutex<Slots>,
    observers: Mutex<Vec<ConfigurationObserver>>,
    applied: AsyncCompletionPipe<ClusterConfiguration>,
}

impl InMemoryConfigurationStorage {
    pub fn new(active: ClusterConfiguration) -> Self {
        Self {
            slots: Mutex::new(Slots { active, proposed: None }),
            observers: Mutex::new(Vec::new()),
            applied: AsyncCompletionPipe::new(),
        }
    }
}

#[async_trait]
impl ConfigurationStorage for InMemoryConfigurationStorage {
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    fn active(&self) -> ClusterConfiguration {
        self.slots.lock().unwrap().active.clone()
    }

    fn proposed(&self) -> Option<ClusterConfiguration> {
        self.slots.lock().unwrap().proposed.clone()
    }

    async fn add_member(&self, id: NodeId, address: String) -> Result<bool> {
        let mut slots = self.slots.lock().unwrap();
        if slots.active.members.contains_key(&id) {
            return Ok(false);
        }
        let mut members = slots.active.members.clone();
        members.insert(id, address);
        Ok(slots.propose_members(members))
    }

    async fn remove_member(&self, id: NodeId) -> Result<bool> {
        let mut slots = self.slots.lock().unwrap();
        if !slots.active.members.contains_key(&id) {
            return Ok(false);
        }
        let mut members = slots.active.members.clone();
        members.remove(&id);
        Ok(slots.propose_members(members))
    }

    async fn propose(&self, configuration: ClusterConfiguration) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        slots.proposed = Some(configuration);
        Ok(())
    }

    async fn apply(&self) -> Result<()> {
        let (new_active, diff) = {
            let mut slots = self.slots.lock().unwrap();
            let proposed = match slots.proposed.take() {
                Some(p) => p,
                None => return Ok(()),
            };
            let diff = MembershipDiff::between(&slots.active, &proposed);
            slots.active = proposed.clone();
            (proposed, diff)
        };
        notify(&self.observers, &self.applied, &new_active, &diff);
        Ok(())
    }

    async fn wait_for_apply(&self) -> Result<ClusterConfiguration, SyncError> {
        self.applied.wait().await
    }

    fn register_observer(&self, observer: ConfigurationObserver) {
        self.observers.lock().unwrap().push(observer);
    }
}

fn notify(
    observers: &Mutex<Vec<ConfigurationObserver>>,
    applied: &AsyncCompletionPipe<ClusterConfiguration>,
    new_active: &ClusterConfiguration,
    diff: &MembershipDiff,
) {
    let observers = observers.lock().unwrap();
    for observer in observers.iter() {
        observer(new_active, diff);
    }
    drop(observers);
    applied.complete(new_active.clone());
}

/// Persistent configuration storage over two blob files.
///
/// Layout of each blob: magic, version, payload length, the canonical
/// configuration encoding, crc32 of everything before the checksum. The
/// apply path writes the promoted blob to a temporary file, renames it over
/// `config.active`, removes `config.proposed`, then fsyncs the parent
/// directory so the rename is durable.
pub struct PersistentConfigurationStorage {
    dir: PathBuf,
    slots: Mutex<Slots>,
    observers: Mutex<Vec<ConfigurationObserver>>,
    applied: AsyncCompletionPipe<ClusterConfiguration>,
}

impl PersistentConfigurationStorage {
    pub const ACTIVE_FILENAME: &'static str = "config.active";
    pub const PROPOSED_FILENAME: &'static str = "config.proposed";

    pub fn new<P: AsRef<Path>>(dir: P, initial: ClusterConfiguration) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            slots: Mutex::new(Slots {
                active: initial,
                proposed: None,
            }),
            observers: Mutex::new(Vec::new()),
            applied: AsyncCompletionPipe::new(),
        }
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(Self::ACTIVE_FILENAME)
    }

    fn proposed_path(&self) -> PathBuf {
        self.dir.join(Self::PROPOSED_FILENAME)
    }

    fn encode_blob(configuration: &ClusterConfiguration) -> Vec<u8> {
        let mut payload = BytesMut::new();
        configuration.encode(&mut payload);

        let mut blob = BytesMut::with_capacity(payload.len() + 16);
        blob.put_u32_le(CONFIG_MAGIC);
        blob.put_u32_le(CONFIG_VERSION);
        blob.put_u32_le(payload.len() as u32);
        blob.put_slice(&payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&blob);
        blob.put_u32_le(hasher.finalize());
        blob.to_vec()
    }

    fn decode_blob(raw: &[u8]) -> Result<ClusterConfiguration> {
        anyhow::ensure!(raw.len() >= 16, "configuration blob too short");
        let (body, crc_bytes) = raw.split_at(raw.len() - 4);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        anyhow::ensure!(hasher.finalize() == expected, "configuration blob checksum mismatch");

        let mut buf = body;
        anyhow::ensure!(buf.get_u32_le() == CONFIG_MAGIC, "configuration blob bad magic");
        anyhow::ensure!(buf.get_u32_le() == CONFIG_VERSION, "configuration blob bad version");
        let len = buf.get_u32_le() as usize;
        anyhow::ensure!(buf.remaining() == len, "configuration blob length mismatch");
        ClusterConfiguration::decode(&mut buf).context("decoding configuration payload")
    }

    async fn write_blob(path: &Path, blob: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, blob).await.with_context(|| format!("writing {:?}", tmp))?;
        tokio::fs::rename(&tmp, path).await.with_context(|| format!("renaming {:?} into place", tmp))?;
        Ok(())
    }

    async fn fsync_dir(&self) -> Result<()> {
        let dir = tokio::fs::File::open(&self.dir).await.with_context(|| format!("opening {:?}", self.dir))?;
        dir.sync_all().await.context("fsync of configuration directory")?;
        Ok(())
    }
}

#[async_trait]
impl ConfigurationStorage for PersistentConfigurationStorage {
    async fn load(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.context("creating configuration directory")?;

        if let Ok(raw) = tokio::fs::read(self.active_path()).await {
            let active = Self::decode_blob(&raw)?;
            self.slots.lock().unwrap().active = active;
        }
        if let Ok(raw) = tokio::fs::read(self.proposed_path()).await {
            let proposed = Self::decode_blob(&raw)?;
            self.slots.lock().unwrap().proposed = Some(proposed);
        }
        Ok(())
    }

    fn active(&self) -> ClusterConfiguration {
        self.slots.lock().unwrap().active.clone()
    }

    fn proposed(&self) -> Option<ClusterConfiguration> {
        self.slots.lock().unwrap().proposed.clone()
    }

    async fn add_member(&self, id: NodeId, address: String) -> Result<bool> {
        let proposed = {
            let mut slots = self.slots.lock().unwrap();
            if slots.active.members.contains_key(&id) {
                return Ok(false);
            }
            let mut members = slots.active.members.clone();
            members.insert(id, address);
            if !slots.propose_members(members) {
                return Ok(false);
            }
            slots.proposed.clone().expect("proposal recorded above")
        };
        Self::write_blob(&self.proposed_path(), &Self::encode_blob(&proposed)).await?;
        Ok(true)
    }

    async fn remove_member(&self, id: NodeId) -> Result<bool> {
        let proposed = {
            let mut slots = self.slots.lock().unwrap();
            if !slots.active.members.contains_key(&id) {
                return Ok(false);
            }
            let mut members = slots.active.members.clone();
            members.remove(&id);
            if !slots.propose_members(members) {
                return Ok(false);
            }
            slots.proposed.clone().expect("proposal recorded above")
        };
        Self::write_blob(&self.proposed_path(), &Self::encode_blob(&proposed)).await?;
        Ok(true)
    }

    async fn propose(&self, configuration: ClusterConfiguration) -> Result<()> {
        Self::write_blob(&self.proposed_path(), &Self::encode_blob(&configuration)).await?;
        self.slots.lock().unwrap().proposed = Some(configuration);
        Ok(())
    }

    async fn apply(&self) -> Result<()> {
        let proposed = match self.proposed() {
            Some(p) => p,
            None => return Ok(()),
        };

        Self::write_blob(&self.active_path(), &Self::encode_blob(&proposed)).await?;
        let _ = tokio::fs::remove_file(self.proposed_path()).await;
        self.fsync_dir().await?;

        let (new_active, diff) = {
            let mut slots = self.slots.lock().unwrap();
            let diff = MembershipDiff::between(&slots.active, &proposed);
            slots.active = proposed.clone();
            slots.proposed = None;
            (proposed, diff)
        };
        notify(&self.observers, &self.applied, &new_active, &diff);
        Ok(())
    }

    async fn wait_for_apply(&self) -> Result<ClusterConfiguration, SyncError> {
        self.applied.wait().await
    }

    fn register_observer(&self, observer: ConfigurationObserver) {
        self.observers.lock().unwrap().push(observer);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use maplit::btreemap;

    use super::*;

    fn initial() -> ClusterConfiguration {
        ClusterConfiguration::bootstrap(btreemap! {
            1 => "node-1".to_string(),
            2 => "node-2".to_string(),
            3 => "node-3".to_string(),
        })
    }

    #[tokio::test]
    async fn test_add_then_remove_returns_to_original_set() {
        let store = InMemoryConfigurationStorage::new(initial());
        let base = store.active();

        assert!(store.add_member(4, "node-4".into()).await.unwrap());
        store.apply().await.unwrap();
        assert!(store.active().contains(&4));

        assert!(store.remove_member(4).await.unwrap());
        store.apply().await.unwrap();

        let done = store.active();
        assert_eq!(done.members, base.members);
        // Two applies advance the fingerprint by exactly two.
        assert_eq!(done.fingerprint, base.fingerprint.wrapping_add(2));
    }

    #[tokio::test]
    async fn test_add_existing_member_is_noop() {
        let store = InMemoryConfigurationStorage::new(initial());
        assert!(!store.add_member(1, "node-1".into()).await.unwrap());
        assert!(store.proposed().is_none());
        assert!(!store.remove_member(9).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_apply_completes_all_pending() {
        let store = Arc::new(InMemoryConfigurationStorage::new(initial()));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let s = store.clone();
            waiters.push(tokio::spawn(async move { s.wait_for_apply().await }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        store.add_member(4, "node-4".into()).await.unwrap();
        store.apply().await.unwrap();

        for w in waiters {
            let cfg = w.await.unwrap().unwrap();
            assert!(cfg.contains(&4));
        }
    }

    #[tokio::test]
    async fn test_observers_see_member_diffs() {
        let store = InMemoryConfigurationStorage::new(initial());
        let adds = Arc::new(AtomicUsize::new(0));
        let removes = Arc::new(AtomicUsize::new(0));
        let (a, r) = (adds.clone(), removes.clone());
        store.register_observer(Box::new(move |_, diff| {
            a.fetch_add(diff.added.len(), Ordering::SeqCst);
            r.fetch_add(diff.removed.len(), Ordering::SeqCst);
        }));

        store.add_member(4, "node-4".into()).await.unwrap();
        store.apply().await.unwrap();
        store.remove_member(2).await.unwrap();
        store.apply().await.unwrap();

        assert_eq!(adds.load(Ordering::SeqCst), 1);
        assert_eq!(removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentConfigurationStorage::new(dir.path(), initial());
        store.load().await.unwrap();

        store.add_member(4, "node-4".into()).await.unwrap();
        store.apply().await.unwrap();
        let expected = store.active();

        // A fresh instance over the same directory sees the applied config.
        let reopened = PersistentConfigurationStorage::new(dir.path(), ClusterConfiguration::default());
        reopened.load().await.unwrap();
        assert_eq!(reopened.active(), expected);
        assert!(reopened.proposed().is_none());
    }

    #[tokio::test]
    async fn test_persistent_proposal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentConfigurationStorage::new(dir.path(), initial());
        store.load().await.unwrap();
        store.add_member(4, "node-4".into()).await.unwrap();

        let reopened = PersistentConfigurationStorage::new(dir.path(), initial());
        reopened.load().await.unwrap();
        let proposed = reopened.proposed().expect("proposal must survive restart");
        assert!(proposed.contains(&4));
    }

    #[tokio::test]
    async fn test_persistent_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentConfigurationStorage::new(dir.path(), initial());
        store.load().await.unwrap();
        store.add_member(4, "node-4".into()).await.unwrap();
        store.apply().await.unwrap();

        // Flip a byte in the active blob.
        let path = dir.path().join(PersistentConfigurationStorage::ACTIVE_FILENAME);
        let mut raw = std::fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let reopened = PersistentConfigurationStorage::new(dir.path(), initial());
        assert!(reopened.load().await.is_err());
    }
}
