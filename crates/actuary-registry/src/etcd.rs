//! etcd coordination store
//!
//! `CoordinationStore` over an etcd v3 cluster. Conditional writes are
//! transactions comparing `create_revision` (absent) or `mod_revision`
//! (unchanged); leases map onto etcd leases with TTLs rounded up to whole
//! seconds. Each prefix watch is forwarded from the etcd stream into an mpsc
//! channel by a dedicated task.

use crate::coordination::{
    CoordinationStore, Expect, KeyValue, LeaseId, Listing, Revision, WatchEvent, WatchStream,
    WriteOp,
};
use crate::error::{RegistryError, RegistryResult};
use actuary_core::constants::WATCH_CHANNEL_CAPACITY;
use actuary_core::RetryConfig;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp, TxnOpResponse,
    WatchOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Coordination store backed by etcd
#[derive(Clone)]
pub struct EtcdCoordinationStore {
    client: Client,
}

impl EtcdCoordinationStore {
    /// Connect to `endpoints`, retrying with backoff
    #[instrument(skip_all, fields(endpoints = ?endpoints))]
    pub async fn connect(endpoints: &[String], policy: &RetryConfig) -> RegistryResult<Self> {
        if endpoints.is_empty() {
            return Err(RegistryError::store("no etcd endpoints configured"));
        }
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(policy.backoff_initial_ms),
            max_interval: Duration::from_millis(policy.backoff_max_ms),
            multiplier: policy.multiplier,
            max_elapsed_time: Some(Duration::from_millis(
                policy.backoff_max_ms * u64::from(policy.attempts_max),
            )),
            ..Default::default()
        };

        let client = retry(backoff, || async {
            match Client::connect(endpoints, None).await {
                Ok(client) => Ok(client),
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| RegistryError::store(format!("etcd connect failed: {}", e)))?;

        info!("Connected to etcd");
        Ok(Self { client })
    }

    /// Wrap an already connected client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for EtcdCoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdCoordinationStore").finish_non_exhaustive()
    }
}

fn map_err(e: etcd_client::Error, lease: Option<LeaseId>) -> RegistryError {
    let message = e.to_string();
    match lease {
        Some(lease_id) if message.contains("lease not found") => {
            RegistryError::LeaseNotFound { lease_id }
        }
        _ => RegistryError::store(message),
    }
}

fn revision_of(header: Option<&etcd_client::ResponseHeader>) -> Revision {
    header.map(|h| h.revision().max(0) as Revision).unwrap_or(0)
}

fn convert(kv: &etcd_client::KeyValue) -> RegistryResult<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| RegistryError::internal(format!("non-utf8 key: {}", e)))?;
    Ok(KeyValue {
        key: key.to_string(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision().max(0) as Revision,
        lease: (kv.lease() != 0).then_some(kv.lease()),
    })
}

fn compare(key: &str, expect: Expect) -> Option<Compare> {
    match expect {
        Expect::Any => None,
        Expect::Absent => Some(Compare::create_revision(key, CompareOp::Equal, 0)),
        Expect::Revision(r) => Some(Compare::mod_revision(key, CompareOp::Equal, r as i64)),
    }
}

fn holds(expect: Expect, current: Option<Revision>) -> bool {
    match expect {
        Expect::Any => true,
        Expect::Absent => current.is_none(),
        Expect::Revision(r) => current == Some(r),
    }
}

fn ttl_secs(ttl_ms: u64) -> i64 {
    ttl_ms.div_ceil(1000).max(1) as i64
}

impl EtcdCoordinationStore {
    /// Run `op` if `expect` holds; on failure report the key's current revision
    async fn guarded(
        &self,
        key: &str,
        expect: Expect,
        op: TxnOp,
        lease: Option<LeaseId>,
    ) -> RegistryResult<Revision> {
        let mut client = self.client.clone();
        let Some(cmp) = compare(key, expect) else {
            let resp = client
                .txn(Txn::new().and_then(vec![op]))
                .await
                .map_err(|e| map_err(e, lease))?;
            return Ok(revision_of(resp.header()));
        };

        let txn = Txn::new()
            .when(vec![cmp])
            .and_then(vec![op])
            .or_else(vec![TxnOp::get(key, None)]);
        let resp = client.txn(txn).await.map_err(|e| map_err(e, lease))?;
        if resp.succeeded() {
            return Ok(revision_of(resp.header()));
        }

        let current = resp.op_responses().into_iter().find_map(|r| match r {
            TxnOpResponse::Get(get) => get
                .kvs()
                .first()
                .map(|kv| kv.mod_revision().max(0) as Revision),
            _ => None,
        });
        Err(RegistryError::PreconditionFailed {
            key: key.to_string(),
            current,
        })
    }
}

#[async_trait]
impl CoordinationStore for EtcdCoordinationStore {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        expect: Expect,
    ) -> RegistryResult<Revision> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.guarded(key, expect, TxnOp::put(key, value, options), lease)
            .await
    }

    async fn delete(&self, key: &str, expect: Expect) -> RegistryResult<Option<Revision>> {
        if expect == Expect::Any {
            let mut client = self.client.clone();
            let resp = client.delete(key, None).await.map_err(|e| map_err(e, None))?;
            return Ok((resp.deleted() > 0).then(|| revision_of(resp.header())));
        }
        self.guarded(key, expect, TxnOp::delete(key, None), None)
            .await
            .map(Some)
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> RegistryResult<Revision> {
        let mut compares = Vec::new();
        let mut guarded = Vec::new();
        let mut writes = Vec::with_capacity(ops.len());
        let mut lease = None;
        for op in ops {
            if let Some(cmp) = compare(op.key(), op.expect()) {
                compares.push(cmp);
                guarded.push((op.key().to_string(), op.expect()));
            }
            writes.push(match op {
                WriteOp::Put {
                    key,
                    value,
                    lease: attached,
                    ..
                } => {
                    lease = lease.or(attached);
                    let options = attached.map(|id| PutOptions::new().with_lease(id));
                    TxnOp::put(key, value, options)
                }
                WriteOp::Delete { key, .. } => TxnOp::delete(key, None),
            });
        }

        // On failure read back every guarded key to name the one that moved
        let reads = guarded
            .iter()
            .map(|(key, _)| TxnOp::get(key.as_str(), None))
            .collect::<Vec<_>>();
        let txn = Txn::new().when(compares).and_then(writes).or_else(reads);
        let mut client = self.client.clone();
        let resp = client.txn(txn).await.map_err(|e| map_err(e, lease))?;
        if resp.succeeded() {
            return Ok(revision_of(resp.header()));
        }

        let currents = resp.op_responses().into_iter().map(|r| match r {
            TxnOpResponse::Get(get) => get
                .kvs()
                .first()
                .map(|kv| kv.mod_revision().max(0) as Revision),
            _ => None,
        });
        let mut first = None;
        for ((key, expect), current) in guarded.into_iter().zip(currents) {
            if !holds(expect, current) {
                return Err(RegistryError::PreconditionFailed { key, current });
            }
            first.get_or_insert(key);
        }
        // Moved again between the compare and the read-back
        Err(RegistryError::PreconditionFailed {
            key: first.unwrap_or_default(),
            current: None,
        })
    }

    async fn get(&self, key: &str) -> RegistryResult<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(|e| map_err(e, None))?;
        resp.kvs().first().map(convert).transpose()
    }

    async fn list(&self, prefix: &str) -> RegistryResult<Listing> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| map_err(e, None))?;

        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match convert(kv) {
                Ok(kv) => kvs.push(kv),
                Err(e) => warn!(error = %e, "Skipping key in listing"),
            }
        }
        Ok(Listing {
            kvs,
            revision: revision_of(resp.header()),
        })
    }

    async fn watch(&self, prefix: &str) -> RegistryResult<WatchStream> {
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| map_err(e, None))?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            'outer: loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        warn!(prefix, "etcd watch stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(prefix, error = %e, "etcd watch stream failed");
                        break;
                    }
                };
                if resp.canceled() {
                    warn!(prefix, "etcd watch canceled");
                    break;
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else {
                        continue;
                    };
                    let converted = match convert(kv) {
                        Ok(kv) => kv,
                        Err(e) => {
                            warn!(error = %e, "Skipping watch event");
                            continue;
                        }
                    };
                    let event = match event.event_type() {
                        EventType::Put => WatchEvent::Put(converted),
                        EventType::Delete => WatchEvent::Delete {
                            key: converted.key,
                            revision: converted.mod_revision,
                        },
                    };
                    if tx.send(event).await.is_err() {
                        debug!(prefix, "Watch receiver dropped");
                        break 'outer;
                    }
                }
            }
            let _ = watcher.cancel().await;
        });

        Ok(WatchStream::new(rx))
    }

    async fn grant_lease(&self, ttl_ms: u64) -> RegistryResult<LeaseId> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl_secs(ttl_ms), None)
            .await
            .map_err(|e| map_err(e, None))?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| map_err(e, Some(lease)))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| map_err(e, Some(lease)))?;

        match stream.message().await.map_err(|e| map_err(e, Some(lease)))? {
            // etcd answers an unknown lease with TTL 0
            Some(resp) if resp.ttl() > 0 => Ok(()),
            Some(_) => Err(RegistryError::LeaseNotFound { lease_id: lease }),
            None => Err(RegistryError::store("lease keep-alive stream closed")),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> RegistryResult<()> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease)
            .await
            .map_err(|e| map_err(e, Some(lease)))?;
        Ok(())
    }
}
