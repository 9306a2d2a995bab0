//! Component J: the background loops that keep a [`crate::network::Network`]
//! alive without being asked — bootstrapping from the configured bootnodes,
//! periodically refreshing under-populated routing table buckets, and
//! keeping recently-seen peers warm with pings. Grounded in the teacher's
//! `start_discovery_service`/`start_revalidation_task` split: one
//! `tokio::spawn` per independent loop, joined with `try_join!` so any one
//! loop dying brings the whole service down rather than limping along
//! half-functional.

use crate::network::Network;
use crate::node::random_id_at_log_distance;
use futures::{try_join, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often a fully-populated routing table is still worth refreshing, to
/// catch churn in regions we currently know nothing about.
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Burst size for [`TokenBucket`]: how many refresh lookups can fire back to
/// back (e.g. right after startup) before the steady one-per-interval rate
/// takes over.
const BUCKET_REFRESH_BURST: u32 = 10;
/// How many of the largest-distance, least-full buckets are considered as
/// refresh candidates each tick.
const BUCKET_REFRESH_CANDIDATES: usize = 16;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Window given to each bootnode to answer a bonding attempt before it is
/// counted as a failure for this round.
const BOOTSTRAP_WINDOW: Duration = Duration::from_secs(20);

#[derive(Debug)]
pub enum MaintenanceError {
    /// One of the joined background tasks panicked or was aborted.
    TaskFailed,
}

/// A simple token bucket: `capacity` tokens available at once, refilled one
/// at a time every `refill_interval`. Used to bound how aggressively bucket
/// refresh lookups are issued without needing a dedicated scheduler.
struct TokenBucket {
    tokens: AtomicU64,
    capacity: u64,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: AtomicU64::new(capacity as u64),
            capacity: capacity as u64,
        }
    }

    fn try_take(&self) -> bool {
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn refill_one(&self) {
        let _ = self
            .tokens
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |tokens| {
                if tokens < self.capacity {
                    Some(tokens + 1)
                } else {
                    None
                }
            });
    }
}

/// Spawns every background loop (inbound serving, bootstrap, bucket refresh,
/// keepalive) and blocks until one of them exits, which only happens on an
/// unrecoverable failure.
pub async fn run(network: Arc<Network>) -> Result<(), MaintenanceError> {
    let receive_handle = network.run();
    let serve_handle = tokio::spawn(network.clone().serve_requests());
    let bootstrap_handle = tokio::spawn(bootstrap(network.clone()));
    let refresh_handle = tokio::spawn(run_bucket_refresh(network.clone()));
    let keepalive_handle = tokio::spawn(run_keepalive(network));

    let result = try_join!(
        receive_handle,
        serve_handle,
        bootstrap_handle,
        refresh_handle,
        keepalive_handle
    );

    match result {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!(%err, "a maintenance task exited unexpectedly");
            Err(MaintenanceError::TaskFailed)
        }
    }
}

/// Bonds with every configured bootnode in parallel, each given a
/// [`BOOTSTRAP_WINDOW`] to answer, and repeats the whole round until at
/// least one succeeds. Once the table has a first live entry, runs one
/// recursive lookup for the local node id to seed it further before
/// returning.
pub async fn bootstrap(network: Arc<Network>) {
    let bootnodes = network.config.bootnodes.clone();
    if bootnodes.is_empty() {
        warn!("no bootnodes configured, skipping bootstrap");
        return;
    }

    loop {
        let attempts = bootnodes.iter().map(|bootnode| {
            let network = network.clone();
            let peer = crate::node::Peer::new(bootnode.node_id, bootnode.endpoint);
            async move {
                match tokio::time::timeout(BOOTSTRAP_WINDOW, network.bond(peer)).await {
                    Ok(Ok(())) => {
                        info!(%peer, "bonded with bootnode");
                        true
                    }
                    Ok(Err(err)) => {
                        warn!(%peer, %err, "failed to bond with bootnode");
                        false
                    }
                    Err(_) => {
                        warn!(%peer, "bootnode bonding timed out");
                        false
                    }
                }
            }
        });
        let succeeded = futures::future::join_all(attempts).await.into_iter().any(|ok| ok);
        if succeeded {
            break;
        }
        warn!("no bootnode answered this round, retrying bootstrap");
    }

    let local_id = network.local_node_id();
    let found = network.recursive_find_nodes(local_id);
    let discovered = found.collect::<Vec<_>>().await.len();
    info!(discovered, "initial bootstrap lookup complete");
}

/// Once per [`BUCKET_REFRESH_INTERVAL`] (rate-limited by a token bucket so a
/// burst of empty buckets at startup doesn't fire dozens of lookups at
/// once), picks one of the [`BUCKET_REFRESH_CANDIDATES`] largest non-full
/// bucket distances at random, weighted toward the largest of that set, and
/// runs a lookup targeting a random id at that distance.
async fn run_bucket_refresh(network: Arc<Network>) {
    let bucket = TokenBucket::new(BUCKET_REFRESH_BURST);
    let mut interval = tokio::time::interval(BUCKET_REFRESH_INTERVAL);
    interval.tick().await;

    loop {
        interval.tick().await;
        bucket.refill_one();
        if !bucket.try_take() {
            continue;
        }

        let Some(distance) = pick_refresh_distance(&network) else {
            continue;
        };
        let target = random_id_at_log_distance(network.local_node_id(), distance);
        debug!(distance, "refreshing bucket");
        let local_id = network.local_node_id();
        let mut found = network.recursive_find_nodes(target);
        let mut discovered = 0usize;
        while let Some(enr) = found.next().await {
            discovered += 1;
            let Some(node_id) = enr.node_id() else { continue };
            if node_id == local_id {
                continue;
            }
            let Some((ip, port)) = enr.udp_endpoint() else { continue };
            let peer = crate::node::Peer::new(node_id, crate::node::Endpoint::new(std::net::IpAddr::V4(ip), port));
            let network = network.clone();
            tokio::spawn(async move {
                if let Err(err) = network.bond(peer).await {
                    debug!(%peer, %err, "failed to bond with bucket-refresh candidate");
                }
            });
        }
        debug!(distance, discovered, "bucket refresh lookup complete");
    }
}

/// Selects a 1-based log distance to refresh: among the
/// `BUCKET_REFRESH_CANDIDATES` largest distances with room left in their
/// bucket, picks one at random, weighted by the distance value itself so the
/// outermost (largest-distance) buckets are proportionally more likely to be
/// chosen than the ones just inside them.
fn pick_refresh_distance(network: &Network) -> Option<usize> {
    use rand::distributions::{Distribution, WeightedIndex};

    let table = network.routing_table.lock().expect("routing table lock poisoned");
    let bucket_size = table.bucket_size();
    let num_buckets = table.num_buckets();

    let candidates: Vec<usize> = (1..=num_buckets)
        .rev()
        .filter(|&distance| table.get_nodes_at_log_distance(distance).len() < bucket_size)
        .take(BUCKET_REFRESH_CANDIDATES)
        .collect();
    drop(table);

    if candidates.is_empty() {
        return None;
    }
    let dist = WeightedIndex::new(&candidates).ok()?;
    let index = dist.sample(&mut rand::thread_rng());
    Some(candidates[index])
}

/// Once per [`KEEPALIVE_INTERVAL`], pings every routing-table member that
/// hasn't answered a PING in at least that long, dropping it from the table
/// on failure (via the same witness/eviction path a lookup uses).
async fn run_keepalive(network: Arc<Network>) {
    let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
    interval.tick().await;

    loop {
        interval.tick().await;
        let node_ids = {
            network
                .routing_table
                .lock()
                .expect("routing table lock poisoned")
                .iter_all_random()
        };

        for node_id in node_ids {
            let stale = match network.last_pong_at(node_id) {
                Some(last) => last.elapsed() >= KEEPALIVE_INTERVAL,
                None => true,
            };
            if !stale {
                continue;
            }
            let Some(enr) = network.enr_db.get(&node_id) else {
                continue;
            };
            let Some((ip, port)) = enr.udp_endpoint() else {
                continue;
            };
            let peer = crate::node::Peer::new(
                node_id,
                crate::node::Endpoint::new(std::net::IpAddr::V4(ip), port),
            );
            match network.ping(peer).await {
                Ok(_) => {
                    network.witness(node_id);
                }
                Err(err) => {
                    debug!(%peer, %err, "keepalive ping failed, dropping from routing table");
                    network
                        .routing_table
                        .lock()
                        .expect("routing table lock poisoned")
                        .remove(node_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_refills_up_to_capacity_only() {
        let bucket = TokenBucket::new(2);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
        bucket.refill_one();
        bucket.refill_one();
        bucket.refill_one();
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
    }
}
