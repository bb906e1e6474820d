//! The channel-record store.
//!
//! All operations address records through the 32-byte binary primary key,
//! rendered URL-safe base64 for the backing service. Device sets, host
//! mappings, and proprietary-ping blobs each live under their own key
//! shape. Missing keys are normalised to "absent" here; they never escape
//! as errors.

use crate::error::StoreError;
use crate::kv::Connector;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::record::{ChannelRecord, ChannelState, DeviceSet};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use beacon_protocol::ids::binary_key;
use beacon_protocol::messages::Update;
use beacon_protocol::{ChannelId, DeviceId};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Store behaviour knobs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Key prefix for host mappings.
    pub host_prefix: String,
    /// Key prefix for proprietary-ping blobs.
    pub ping_prefix: String,
    /// Host returned when no mapping exists for a device.
    pub default_host: String,
    /// TTL for `Live` records.
    pub ttl_live: Duration,
    /// TTL for `Registered` records.
    pub ttl_registered: Duration,
    /// TTL for `Deleted` records.
    pub ttl_deleted: Duration,
    /// Best-effort attempts to mark a record deleted on unregister.
    pub unregister_retries: usize,
    /// Historical behaviour: report every device as existing.
    pub compat_exists: bool,
    /// Refuse version downgrades on update.
    pub enforce_monotonic_version: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host_prefix: "_h-".to_string(),
            ping_prefix: "_pc-".to_string(),
            default_host: "localhost".to_string(),
            ttl_live: Duration::from_secs(3 * 24 * 60 * 60),
            ttl_registered: Duration::from_secs(3 * 60 * 60),
            ttl_deleted: Duration::from_secs(24 * 60 * 60),
            unregister_retries: 3,
            compat_exists: false,
            enforce_monotonic_version: false,
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The channel-record store.
pub struct Store {
    pool: ConnectionPool,
    config: StoreConfig,
}

impl Store {
    /// Create a store over the given backend.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: StoreConfig, pool: PoolConfig) -> Self {
        Self {
            pool: ConnectionPool::new(connector, pool),
            config,
        }
    }

    /// Close the underlying pool. Idempotent.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Whether a device has previously registered.
    ///
    /// # Errors
    ///
    /// Returns backend errors; absence is not an error.
    pub async fn exists(&self, uaid: &DeviceId) -> Result<bool, StoreError> {
        let present = self.fetch_device_set(uaid).await?.is_some();
        if self.config.compat_exists {
            // Legacy adapters reported missing device sets as registered.
            return Ok(true);
        }
        Ok(present)
    }

    /// Create and store a channel record, adding the channel to the
    /// device set. A non-zero `version` marks the record live.
    ///
    /// # Errors
    ///
    /// Returns backend or codec errors.
    pub async fn register(
        &self,
        uaid: &DeviceId,
        chid: &ChannelId,
        version: u64,
    ) -> Result<(), StoreError> {
        let mut set = self.fetch_device_set(uaid).await?.unwrap_or_default();
        if set.insert(chid.as_bytes()) {
            self.store_device_set(uaid, &set).await?;
        }
        let state = if version > 0 {
            ChannelState::Live
        } else {
            ChannelState::Registered
        };
        let mut rec = ChannelRecord::new(state, version);
        self.store_record(&self.record_key(uaid, chid), &mut rec)
            .await
    }

    /// Update the version for a channel. Falls through to [`register`]
    /// when the record is absent or deleted.
    ///
    /// [`register`]: Store::register
    ///
    /// # Errors
    ///
    /// Returns backend or codec errors.
    pub async fn update(
        &self,
        uaid: &DeviceId,
        chid: &ChannelId,
        version: u64,
    ) -> Result<(), StoreError> {
        let key = self.record_key(uaid, chid);
        if let Some(existing) = self.fetch_record(&key).await? {
            if existing.state != ChannelState::Deleted {
                if self.config.enforce_monotonic_version && version <= existing.version {
                    debug!(
                        uaid = %uaid,
                        chid = %chid,
                        version,
                        stored = existing.version,
                        "dropping non-monotonic version"
                    );
                    return Ok(());
                }
                let mut rec = ChannelRecord::new(ChannelState::Live, version);
                return self.store_record(&key, &mut rec).await;
            }
        }
        debug!(uaid = %uaid, chid = %chid, version, "registering channel on update");
        self.register(uaid, chid, version).await
    }

    /// Remove a channel from the device set and mark its record deleted.
    ///
    /// Marking the record is best-effort with bounded retries; the final
    /// failure is logged, not returned.
    ///
    /// # Errors
    ///
    /// `InvalidChannel` when the channel is not in the device set;
    /// backend errors from the set update.
    pub async fn unregister(&self, uaid: &DeviceId, chid: &ChannelId) -> Result<(), StoreError> {
        let mut set = self
            .fetch_device_set(uaid)
            .await?
            .ok_or(StoreError::InvalidChannel)?;
        if !set.remove(chid.as_bytes()) {
            return Err(StoreError::InvalidChannel);
        }
        self.store_device_set(uaid, &set).await?;

        let key = self.record_key(uaid, chid);
        for attempt in 0..self.config.unregister_retries {
            let rec = match self.fetch_record(&key).await {
                Ok(rec) => rec,
                Err(err) => {
                    warn!(uaid = %uaid, chid = %chid, attempt, error = %err, "fetch failed while deleting channel");
                    continue;
                }
            };
            let mut rec = rec.unwrap_or_else(|| ChannelRecord::new(ChannelState::Deleted, 0));
            rec.state = ChannelState::Deleted;
            match self.store_record(&key, &mut rec).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(uaid = %uaid, chid = %chid, attempt, error = %err, "failed to mark channel deleted");
                }
            }
        }
        warn!(uaid = %uaid, chid = %chid, "giving up marking channel deleted");
        Ok(())
    }

    /// Hard-delete a channel record. Does not touch the device set; used
    /// for post-ack cleanup.
    ///
    /// # Errors
    ///
    /// Returns backend errors; a missing record is success.
    pub async fn drop_channel(&self, uaid: &DeviceId, chid: &ChannelId) -> Result<(), StoreError> {
        let key = self.record_key(uaid, chid);
        let mut conn = self.pool.acquire().await?;
        match conn.delete(&key).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_missing() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch all deliverable updates and expired channels for a device
    /// since the given unix-seconds cutoff.
    ///
    /// Live records with a zero version are emitted with a synthetic
    /// now-seconds version and logged as anomalous.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the device-set read; unreadable
    /// individual records are skipped.
    pub async fn fetch_all(
        &self,
        uaid: &DeviceId,
        since: i64,
    ) -> Result<(Vec<Update>, Vec<String>), StoreError> {
        let set = self.fetch_device_set(uaid).await?.unwrap_or_default();
        let mut updates = Vec::new();
        let mut expired = Vec::new();
        if set.is_empty() {
            return Ok((updates, expired));
        }

        let mut conn = self.pool.acquire().await?;
        for chid in set.iter() {
            let key = URL_SAFE_NO_PAD.encode(binary_key(uaid.as_bytes(), chid));
            let Ok(raw) = conn.get(&key).await else {
                continue;
            };
            let Ok(rec) = ChannelRecord::from_bytes(&raw) else {
                warn!(uaid = %uaid, chid = %hex::encode(chid), "skipping undecodable record");
                continue;
            };
            if rec.last_touched < since {
                continue;
            }
            match rec.state {
                ChannelState::Live => {
                    let mut version = rec.version;
                    if version == 0 {
                        version = now_secs() as u64;
                        error!(
                            uaid = %uaid,
                            chid = %hex::encode(chid),
                            "live record with zero version, substituting timestamp"
                        );
                    }
                    updates.push(Update::new(hex::encode(chid), version));
                }
                ChannelState::Deleted => expired.push(hex::encode(chid)),
                ChannelState::Registered => {
                    // Registered but not yet active; nothing to deliver.
                }
            }
        }
        Ok((updates, expired))
    }

    /// Delete every channel record for a device, then the device set,
    /// then the host mapping. Missing keys are success.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the set or host deletions.
    pub async fn drop_all(&self, uaid: &DeviceId) -> Result<(), StoreError> {
        let set = self.fetch_device_set(uaid).await?.unwrap_or_default();
        let mut conn = self.pool.acquire().await?;
        for chid in set.iter() {
            let key = URL_SAFE_NO_PAD.encode(binary_key(uaid.as_bytes(), chid));
            let _ = conn.delete(&key).await;
        }
        match conn.delete(&self.device_set_key(uaid)).await {
            Ok(()) => {}
            Err(err) if err.is_missing() => {}
            Err(err) => return Err(err.into()),
        }
        match conn.delete(&self.host_key(uaid)).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_missing() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the device set with the channels the client presented.
    ///
    /// Server-side channels the client no longer knows are dropped and
    /// newly presented channels admitted; the result is exactly the
    /// presented set. No write is issued when nothing changes.
    ///
    /// # Errors
    ///
    /// Returns backend or codec errors.
    pub async fn reconcile_channels(
        &self,
        uaid: &DeviceId,
        presented: &[ChannelId],
    ) -> Result<(), StoreError> {
        let merged = DeviceSet::from_channels(presented.iter().map(ChannelId::as_bytes));
        match self.fetch_device_set(uaid).await? {
            None if merged.is_empty() => Ok(()),
            Some(ref stored) if *stored == merged => Ok(()),
            _ => self.store_device_set(uaid, &merged).await,
        }
    }

    /// Fetch the proprietary-ping blob for a device.
    ///
    /// # Errors
    ///
    /// Returns backend errors; absence yields `None`.
    pub async fn fetch_ping(&self, uaid: &DeviceId) -> Result<Option<String>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        match conn.get(&self.ping_key(uaid)).await {
            Ok(raw) => Ok(Some(String::from_utf8_lossy(&raw).into_owned())),
            Err(err) if err.is_missing() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Store the proprietary-ping blob for a device.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    pub async fn put_ping(&self, uaid: &DeviceId, connect: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        conn.set(&self.ping_key(uaid), connect.as_bytes(), Duration::ZERO)
            .await?;
        Ok(())
    }

    /// Remove the proprietary-ping blob for a device.
    ///
    /// # Errors
    ///
    /// Returns backend errors; a missing blob is success.
    pub async fn drop_ping(&self, uaid: &DeviceId) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        match conn.delete(&self.ping_key(uaid)).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_missing() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch the node currently holding the device's connection, falling
    /// back to the configured default host.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    pub async fn fetch_host(&self, uaid: &DeviceId) -> Result<String, StoreError> {
        let key = self.host_key(uaid);
        let mut conn = self.pool.acquire().await?;
        let host = match conn.get(&key).await {
            Ok(raw) => {
                let host = String::from_utf8_lossy(&raw).into_owned();
                if host.is_empty() {
                    self.config.default_host.clone()
                } else {
                    host
                }
            }
            Err(err) if err.is_missing() => return Ok(self.config.default_host.clone()),
            Err(err) => return Err(err.into()),
        };
        // Refresh the mapping's TTL; best-effort.
        if let Err(err) = conn
            .set(&key, host.as_bytes(), self.config.ttl_live)
            .await
        {
            debug!(uaid = %uaid, error = %err, "host refresh failed");
        }
        Ok(host)
    }

    /// Record the node holding the device's connection.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    pub async fn put_host(&self, uaid: &DeviceId, host: &str) -> Result<(), StoreError> {
        let host = if host.is_empty() {
            self.config.default_host.as_str()
        } else {
            host
        };
        let mut conn = self.pool.acquire().await?;
        conn.set(&self.host_key(uaid), host.as_bytes(), self.config.ttl_live)
            .await?;
        Ok(())
    }

    /// Remove the host mapping for a device.
    ///
    /// # Errors
    ///
    /// Returns backend errors; a missing mapping is success.
    pub async fn drop_host(&self, uaid: &DeviceId) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        match conn.delete(&self.host_key(uaid)).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_missing() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Probe the backend with a set/get/delete roundtrip on a random key.
    ///
    /// # Errors
    ///
    /// `InvalidValue` if the read-back mismatches; backend errors
    /// otherwise.
    pub async fn status(&self) -> Result<(), StoreError> {
        let key = format!("status_{}", uuid::Uuid::new_v4().simple());
        let mut conn = self.pool.acquire().await?;
        conn.set(&key, b"test", Duration::from_secs(6)).await?;
        let val = conn.get(&key).await?;
        if val != b"test" {
            return Err(StoreError::InvalidValue);
        }
        let _ = conn.delete(&key).await;
        Ok(())
    }

    fn record_key(&self, uaid: &DeviceId, chid: &ChannelId) -> String {
        URL_SAFE_NO_PAD.encode(binary_key(uaid.as_bytes(), chid.as_bytes()))
    }

    fn device_set_key(&self, uaid: &DeviceId) -> String {
        URL_SAFE_NO_PAD.encode(binary_key(uaid.as_bytes(), &[]))
    }

    fn host_key(&self, uaid: &DeviceId) -> String {
        format!("{}{}", self.config.host_prefix, uaid)
    }

    fn ping_key(&self, uaid: &DeviceId) -> String {
        format!("{}{}", self.config.ping_prefix, uaid)
    }

    fn ttl_for(&self, state: ChannelState) -> Duration {
        match state {
            ChannelState::Deleted => self.config.ttl_deleted,
            ChannelState::Registered => self.config.ttl_registered,
            ChannelState::Live => self.config.ttl_live,
        }
    }

    async fn fetch_record(&self, key: &str) -> Result<Option<ChannelRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        match conn.get(key).await {
            Ok(raw) => Ok(Some(ChannelRecord::from_bytes(&raw)?)),
            Err(err) if err.is_missing() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn store_record(&self, key: &str, rec: &mut ChannelRecord) -> Result<(), StoreError> {
        rec.last_touched = now_secs();
        let ttl = self.ttl_for(rec.state);
        let raw = rec.to_bytes()?;
        let mut conn = self.pool.acquire().await?;
        conn.set(key, &raw, ttl).await?;
        Ok(())
    }

    async fn fetch_device_set(&self, uaid: &DeviceId) -> Result<Option<DeviceSet>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        match conn.get(&self.device_set_key(uaid)).await {
            Ok(raw) => Ok(Some(DeviceSet::from_bytes(&raw)?)),
            Err(err) if err.is_missing() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn store_device_set(&self, uaid: &DeviceId, set: &DeviceSet) -> Result<(), StoreError> {
        let raw = set.to_bytes()?;
        let mut conn = self.pool.acquire().await?;
        conn.set(&self.device_set_key(uaid), &raw, Duration::ZERO)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryConnector;
    use crate::kv::KvError;

    fn test_store(connector: MemoryConnector) -> Store {
        Store::new(
            Arc::new(connector),
            StoreConfig::default(),
            PoolConfig {
                min_conns: 1,
                max_conns: 2,
                pool_timeout: Duration::from_millis(250),
            },
        )
    }

    fn ids() -> (DeviceId, ChannelId) {
        (
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap(),
            "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_register_then_update_is_fetchable() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        store.register(&uaid, &chid, 0).await.unwrap();
        store.update(&uaid, &chid, 42).await.unwrap();

        let (updates, expired) = store.fetch_all(&uaid, 0).await.unwrap();
        assert_eq!(updates, vec![Update::new(chid.to_string(), 42)]);
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_latest_version() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        store.update(&uaid, &chid, 1).await.unwrap();
        store.update(&uaid, &chid, 2).await.unwrap();

        let (updates, _) = store.fetch_all(&uaid, 0).await.unwrap();
        assert_eq!(updates[0].version, 2);
    }

    #[tokio::test]
    async fn test_registered_channels_are_not_delivered() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        store.register(&uaid, &chid, 0).await.unwrap();
        let (updates, expired) = store.fetch_all(&uaid, 0).await.unwrap();
        assert!(updates.is_empty());
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_then_reregister_goes_live() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        store.register(&uaid, &chid, 0).await.unwrap();
        store.unregister(&uaid, &chid).await.unwrap();

        let (updates, expired) = store.fetch_all(&uaid, 0).await.unwrap();
        assert!(updates.is_empty());
        // Channel left the device set, so it is not reported expired either.
        assert!(expired.is_empty());

        store.register(&uaid, &chid, 7).await.unwrap();
        let (updates, _) = store.fetch_all(&uaid, 0).await.unwrap();
        assert_eq!(updates, vec![Update::new(chid.to_string(), 7)]);
    }

    #[tokio::test]
    async fn test_update_resurrects_deleted_record() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        store.register(&uaid, &chid, 42).await.unwrap();
        store.unregister(&uaid, &chid).await.unwrap();
        // A sender racing the unregister re-creates the channel.
        store.update(&uaid, &chid, 43).await.unwrap();

        let (updates, _) = store.fetch_all(&uaid, 0).await.unwrap();
        assert_eq!(updates, vec![Update::new(chid.to_string(), 43)]);
    }

    #[tokio::test]
    async fn test_unregister_unknown_channel() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        assert!(matches!(
            store.unregister(&uaid, &chid).await,
            Err(StoreError::InvalidChannel)
        ));

        store.register(&uaid, &chid, 0).await.unwrap();
        let other: ChannelId = "cc".parse().unwrap();
        assert!(matches!(
            store.unregister(&uaid, &other).await,
            Err(StoreError::InvalidChannel)
        ));
    }

    #[tokio::test]
    async fn test_drop_channel_consumes_record() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        store.update(&uaid, &chid, 42).await.unwrap();
        store.drop_channel(&uaid, &chid).await.unwrap();
        // Dropping again is fine.
        store.drop_channel(&uaid, &chid).await.unwrap();

        let (updates, _) = store.fetch_all(&uaid, 0).await.unwrap();
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn test_drop_all_removes_everything() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        store.register(&uaid, &chid, 5).await.unwrap();
        store.put_host(&uaid, "node-1").await.unwrap();
        assert!(store.exists(&uaid).await.unwrap());

        store.drop_all(&uaid).await.unwrap();
        assert!(!store.exists(&uaid).await.unwrap());
        let (updates, expired) = store.fetch_all(&uaid, 0).await.unwrap();
        assert!(updates.is_empty() && expired.is_empty());
        assert_eq!(store.fetch_host(&uaid).await.unwrap(), "localhost");
    }

    #[tokio::test]
    async fn test_exists_compat_flag() {
        let connector = MemoryConnector::new();
        let store = Store::new(
            Arc::new(connector),
            StoreConfig {
                compat_exists: true,
                ..StoreConfig::default()
            },
            PoolConfig {
                min_conns: 1,
                max_conns: 2,
                pool_timeout: Duration::from_millis(250),
            },
        );
        let (uaid, _) = ids();
        assert!(store.exists(&uaid).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_all_since_cutoff() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        store.update(&uaid, &chid, 42).await.unwrap();
        let (updates, _) = store.fetch_all(&uaid, now_secs() + 10).await.unwrap();
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_channels() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();
        let other: ChannelId = "cccccccccccccccccccccccccccccccc".parse().unwrap();

        store.register(&uaid, &chid, 9).await.unwrap();
        // The client presents a different set; the stored one follows it.
        store
            .reconcile_channels(&uaid, std::slice::from_ref(&other))
            .await
            .unwrap();

        let (updates, _) = store.fetch_all(&uaid, 0).await.unwrap();
        assert!(updates.is_empty());

        // The orphaned record is gone from the set, so re-registering the
        // presented channel works from a clean slate.
        store.register(&uaid, &other, 3).await.unwrap();
        let (updates, _) = store.fetch_all(&uaid, 0).await.unwrap();
        assert_eq!(updates, vec![Update::new(other.to_string(), 3)]);
    }

    #[tokio::test]
    async fn test_host_mapping_fallback() {
        let store = test_store(MemoryConnector::new());
        let (uaid, _) = ids();

        assert_eq!(store.fetch_host(&uaid).await.unwrap(), "localhost");
        store.put_host(&uaid, "node-7").await.unwrap();
        assert_eq!(store.fetch_host(&uaid).await.unwrap(), "node-7");
        store.drop_host(&uaid).await.unwrap();
        assert_eq!(store.fetch_host(&uaid).await.unwrap(), "localhost");
    }

    #[tokio::test]
    async fn test_ping_blob_roundtrip() {
        let store = test_store(MemoryConnector::new());
        let (uaid, _) = ids();

        assert!(store.fetch_ping(&uaid).await.unwrap().is_none());
        store.put_ping(&uaid, r#"{"gcm":{"regid":"x"}}"#).await.unwrap();
        assert_eq!(
            store.fetch_ping(&uaid).await.unwrap().as_deref(),
            Some(r#"{"gcm":{"regid":"x"}}"#)
        );
        store.drop_ping(&uaid).await.unwrap();
        assert!(store.fetch_ping(&uaid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_probe() {
        let store = test_store(MemoryConnector::new());
        store.status().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_record_expires() {
        let store = test_store(MemoryConnector::new());
        let (uaid, chid) = ids();

        store.register(&uaid, &chid, 42).await.unwrap();
        // Past the live TTL the record is gone.
        tokio::time::advance(Duration::from_secs(3 * 24 * 60 * 60 + 1)).await;
        let (updates, _) = store.fetch_all(&uaid, 0).await.unwrap();
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn test_saturated_pool_surfaces_error() {
        // Two connections held against a slow backend; the third caller
        // times out in the pool.
        let connector = MemoryConnector::with_delay(Duration::from_millis(500));
        let store = Arc::new(Store::new(
            Arc::new(connector),
            StoreConfig::default(),
            PoolConfig {
                min_conns: 1,
                max_conns: 2,
                pool_timeout: Duration::from_millis(50),
            },
        ));
        let (uaid, _) = ids();

        let s1 = store.clone();
        let u1 = uaid.clone();
        let first = tokio::spawn(async move { s1.exists(&u1).await });
        let s2 = store.clone();
        let u2 = uaid.clone();
        let second = tokio::spawn(async move { s2.exists(&u2).await });

        // Let both acquire their connections.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = store.exists(&uaid).await.unwrap_err();
        assert!(matches!(err, StoreError::PoolSaturated));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }

    #[test]
    fn test_backend_error_is_not_missing() {
        assert!(!KvError::Timeout.is_missing());
        assert!(KvError::Missing.is_missing());
    }
}
