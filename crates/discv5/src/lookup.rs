//! Component I: the recursive find-nodes lookup engine.
//!
//! Generic over how a single peer is actually queried (`query`), so the
//! convergence logic can be exercised without a real socket or dispatcher —
//! callers (see [`crate::network`]) close over a [`crate::dispatcher::Dispatcher`]
//! and hand in a closure that issues one `FINDNODE`/`NODES` round trip.

use crate::enr::NodeRecord;
use crate::node::NodeId;
use crate::Discv5Error;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Number of peers queried concurrently per round.
    pub concurrency: usize,
    /// How many closest results are kept and returned at the end.
    pub result_size: usize,
    /// Minimum number of RTT samples before the adaptive timeout kicks in;
    /// below this, `default_timeout` is used as-is.
    pub adaptive_timeout_sample_threshold: usize,
    /// Multiplier applied to the sample standard deviation above the mean.
    pub adaptive_timeout_variance: f64,
    pub default_timeout: Duration,
    /// Upper bound on the entire lookup's wall-clock time, regardless of
    /// how many rounds are left to run; guards against a peer population
    /// that keeps answering just late enough to never finish.
    pub deadlock_watchdog: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            result_size: 16,
            adaptive_timeout_sample_threshold: 1,
            adaptive_timeout_variance: 2.0,
            default_timeout: Duration::from_millis(500),
            deadlock_watchdog: Duration::from_secs(60),
        }
    }
}

/// Upper bound on the adaptive timeout regardless of how slow the fastest
/// observed peer in a lookup has been; keeps one unusually slow round from
/// stalling a batch indefinitely.
const ADAPTIVE_TIMEOUT_CEILING: Duration = Duration::from_secs(5);

/// Tracks the fastest observed round-trip time and derives a timeout that
/// widens once enough samples are in, instead of a single fixed value that
/// is either too tight for a slow network or too loose for a fast one.
struct AdaptiveTimeout {
    fastest: Option<Duration>,
    sample_count: usize,
    sample_threshold: usize,
    variance: f64,
    default_timeout: Duration,
}

impl AdaptiveTimeout {
    fn new(config: &LookupConfig) -> Self {
        Self {
            fastest: None,
            sample_count: 0,
            sample_threshold: config.adaptive_timeout_sample_threshold,
            variance: config.adaptive_timeout_variance,
            default_timeout: config.default_timeout,
        }
    }

    fn record(&mut self, rtt: Duration) {
        self.sample_count += 1;
        self.fastest = Some(match self.fastest {
            Some(fastest) => fastest.min(rtt),
            None => rtt,
        });
    }

    /// `max(default_timeout, variance × fastest_response_so_far)` once
    /// `sample_threshold` responses have arrived, clamped to
    /// [`ADAPTIVE_TIMEOUT_CEILING`].
    fn current(&self) -> Duration {
        let Some(fastest) = self.fastest else {
            return self.default_timeout;
        };
        if self.sample_count < self.sample_threshold {
            return self.default_timeout;
        }
        fastest
            .mul_f64(self.variance)
            .max(self.default_timeout)
            .min(ADAPTIVE_TIMEOUT_CEILING)
    }
}

fn distance_key(record: &NodeRecord, target: NodeId) -> NodeId {
    record.node_id().map(|id| id ^ target).unwrap_or(NodeId::repeat_byte(0xff))
}

/// Runs an iterative find-nodes lookup for `target`, starting from `seeds`.
///
/// `query(peer, timeout)` must perform one request/response round trip and
/// return the peer's reported closer nodes; a failure (timeout, validation
/// error, missing endpoint) is signalled as `Err` and the caller is expected
/// to have already recorded the peer as unresponsive. `exclude(node_id)`
/// filters both the seed set and every subsequent round's candidates — the
/// caller is expected to fold in the local node id and the shared
/// unresponsive cache. `results`, when given, receives every newly
/// discovered record as soon as it is seen; dropping the receiving half
/// cancels all outstanding work within one scheduling tick.
///
/// Workers are modelled as a fixed-size pool of in-flight queries: whenever
/// one completes, a fresh candidate is pulled in immediately rather than
/// waiting for the rest of a synchronized batch to finish, so one slow peer
/// never stalls the others.
pub async fn recursive_find_nodes<Q, Fut, E>(
    target: NodeId,
    seeds: Vec<NodeRecord>,
    config: &LookupConfig,
    exclude: E,
    results: Option<mpsc::Sender<NodeRecord>>,
    query: Q,
) -> Vec<NodeRecord>
where
    Q: Fn(NodeRecord, Duration) -> Fut,
    Fut: Future<Output = Result<Vec<NodeRecord>, Discv5Error>>,
    E: Fn(NodeId) -> bool,
{
    let watchdog = tokio::time::sleep(config.deadlock_watchdog);
    tokio::pin!(watchdog);

    let mut seen: HashMap<NodeId, NodeRecord> = HashMap::new();
    for record in seeds {
        if let Some(id) = record.node_id() {
            if !exclude(id) {
                seen.insert(id, record);
            }
        }
    }
    let mut queried: HashSet<NodeId> = HashSet::new();
    let mut in_flight_ids: HashSet<NodeId> = HashSet::new();
    let mut timeout_tracker = AdaptiveTimeout::new(config);
    let mut in_flight: FuturesUnordered<_> = FuturesUnordered::new();
    let mut results = results;

    'outer: loop {
        while in_flight.len() < config.concurrency {
            let mut candidates: Vec<NodeRecord> = seen.values().cloned().collect();
            candidates.sort_by_key(|r| distance_key(r, target));
            let next = candidates.into_iter().find(|r| {
                r.node_id().is_some_and(|id| {
                    !queried.contains(&id) && !in_flight_ids.contains(&id) && !exclude(id)
                })
            });
            let Some(record) = next else { break };
            let id = record.node_id().expect("filtered to records with a node id above");
            queried.insert(id);
            in_flight_ids.insert(id);

            let timeout = timeout_tracker.current();
            let fut = query(record, timeout);
            in_flight.push(async move {
                let start = Instant::now();
                (id, fut.await, start.elapsed())
            });
        }

        if in_flight.is_empty() {
            break 'outer;
        }

        tokio::select! {
            biased;
            _ = &mut watchdog => break 'outer,
            next = in_flight.next() => {
                let Some((id, outcome, elapsed)) = next else { continue };
                in_flight_ids.remove(&id);
                match outcome {
                    Ok(records) => {
                        timeout_tracker.record(elapsed);
                        for candidate in records {
                            let Some(candidate_id) = candidate.node_id() else { continue };
                            if exclude(candidate_id) || seen.contains_key(&candidate_id) {
                                continue;
                            }
                            seen.insert(candidate_id, candidate.clone());
                            if let Some(tx) = &results {
                                if tx.send(candidate).await.is_err() {
                                    results = None;
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Err(_) => {}
                }
            }
        }
    }

    let mut closest: Vec<NodeRecord> = seen.into_values().collect();
    closest.sort_by_key(|r| distance_key(r, target));
    closest.truncate(config.result_size);
    closest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enr::Pairs;
    use ethereum_types::H264;
    use secp256k1::{PublicKey, SecretKey, SECP256K1};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record_for(key_byte: u8, seq: u64) -> NodeRecord {
        let signer = SecretKey::from_slice(&[key_byte; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(SECP256K1, &signer);
        NodeRecord::sign(
            seq,
            Pairs {
                id: Some("v4".into()),
                secp256k1: Some(H264::from_slice(&pubkey.serialize())),
                ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
                udp_port: Some(9000 + key_byte as u16),
            },
            &signer,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn converges_once_no_new_closer_peers_are_offered() {
        let seed_a = record_for(1, 1);
        let seed_b = record_for(2, 1);
        let extra = record_for(3, 1);
        let target = extra.node_id().unwrap();

        let extra_for_closure = extra.clone();
        let query_count = std::sync::Arc::new(AtomicUsize::new(0));
        let count_handle = query_count.clone();

        let config = LookupConfig {
            concurrency: 2,
            ..Default::default()
        };

        let results = recursive_find_nodes(
            target,
            vec![seed_a, seed_b],
            &config,
            |_id| false,
            None,
            move |peer, _timeout| {
                count_handle.fetch_add(1, Ordering::SeqCst);
                let reply = if peer.node_id() != extra_for_closure.node_id() {
                    vec![extra_for_closure.clone()]
                } else {
                    Vec::new()
                };
                async move { Ok(reply) }
            },
        )
        .await;

        assert!(results.iter().any(|r| r.node_id() == Some(target)));
        // Two seeds each offer `extra`, then `extra` itself is queried once
        // and offers nothing new: three total queries, not an infinite loop.
        assert_eq!(query_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unresponsive_peers_do_not_block_convergence() {
        let seed = record_for(5, 1);
        let target = NodeId::repeat_byte(0xaa);

        let config = LookupConfig {
            concurrency: 1,
            ..Default::default()
        };

        let results = recursive_find_nodes(
            target,
            vec![seed],
            &config,
            |_id| false,
            None,
            |_peer, _timeout| async move { Err(Discv5Error::EmptyFindNodesResponse) },
        )
        .await;

        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn excluded_seeds_are_never_queried() {
        let excluded = record_for(6, 1);
        let excluded_id = excluded.node_id().unwrap();
        let target = NodeId::repeat_byte(0xbb);
        let config = LookupConfig::default();

        let query_count = std::sync::Arc::new(AtomicUsize::new(0));
        let count_handle = query_count.clone();
        let results = recursive_find_nodes(
            target,
            vec![excluded],
            &config,
            move |id| id == excluded_id,
            None,
            move |_peer, _timeout| {
                count_handle.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Vec::new()) }
            },
        )
        .await;

        assert!(results.is_empty());
        assert_eq!(query_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn streams_newly_discovered_records_to_the_caller() {
        let seed = record_for(7, 1);
        let extra = record_for(8, 1);
        let target = extra.node_id().unwrap();
        let config = LookupConfig {
            concurrency: 1,
            ..Default::default()
        };

        let (tx, mut rx) = mpsc::channel(8);
        let extra_for_closure = extra.clone();
        let handle = tokio::spawn(async move {
            recursive_find_nodes(
                target,
                vec![seed],
                &config,
                |_id| false,
                Some(tx),
                move |peer, _timeout| {
                    let reply = if peer.node_id() == Some(target) {
                        Vec::new()
                    } else {
                        vec![extra_for_closure.clone()]
                    };
                    async move { Ok(reply) }
                },
            )
            .await
        });

        let streamed = rx.recv().await.expect("extra record streamed");
        assert_eq!(streamed.node_id(), Some(target));
        handle.await.unwrap();
    }

    #[test]
    fn adaptive_timeout_uses_default_until_threshold_samples_arrive() {
        let config = LookupConfig {
            adaptive_timeout_sample_threshold: 2,
            adaptive_timeout_variance: 2.0,
            default_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let mut tracker = AdaptiveTimeout::new(&config);
        assert_eq!(tracker.current(), Duration::from_millis(500));
        tracker.record(Duration::from_millis(100));
        assert_eq!(tracker.current(), Duration::from_millis(500));
    }

    #[test]
    fn adaptive_timeout_scales_the_fastest_response_by_variance() {
        let config = LookupConfig {
            adaptive_timeout_sample_threshold: 1,
            adaptive_timeout_variance: 2.0,
            default_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let mut tracker = AdaptiveTimeout::new(&config);
        tracker.record(Duration::from_millis(300));
        assert_eq!(tracker.current(), Duration::from_millis(600));
        // A later, slower sample does not widen the timeout further: only
        // the fastest response observed so far drives the formula.
        tracker.record(Duration::from_millis(900));
        assert_eq!(tracker.current(), Duration::from_millis(600));
    }

    #[test]
    fn adaptive_timeout_never_exceeds_the_hard_ceiling() {
        let config = LookupConfig {
            adaptive_timeout_sample_threshold: 1,
            adaptive_timeout_variance: 10.0,
            default_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let mut tracker = AdaptiveTimeout::new(&config);
        tracker.record(Duration::from_secs(2));
        assert_eq!(tracker.current(), ADAPTIVE_TIMEOUT_CEILING);
    }
}
