//! Rebalance E2E Test Suite
//!
//! End-to-end tests running several [`CacheNode`](crate::node::CacheNode)s on
//! one [`InMemoryNetwork`](crate::testing::InMemoryNetwork), verifying:
//! - Topology convergence when members join, leave and crash
//! - Data routing to segment owners
//! - Per-key write ordering
//! - Coordinator failover
//!
//! # Test Cases
//!
//! | Test ID    | Scenario                        | Verification                          |
//! |------------|---------------------------------|---------------------------------------|
//! | TC_REB_01  | Three members join              | Stable topology, reads see writes     |
//! | TC_REB_02  | Scale up                        | New member receives segments          |
//! | TC_REB_03  | Sole owner crashes              | Survivors take over every segment     |
//! | TC_REB_04  | Coordinator crashes             | Next member recovers the cache        |
//! | TC_REB_05  | Concurrent writes to one key    | Writes applied one after the other    |
//! | TC_REB_06  | Owner unreachable               | Write fails with a timeout            |
//! | TC_REB_07  | Cache dependencies              | Dependants stop first, cycles refused |
//! | TC_REB_08  | Rebalancing switched off        | Joiner waits until switched back on   |
//! | TC_REB_09  | Members ahead of new coordinator| Numbering continues past their ids    |
//! | TC_REB_10  | Writers on two nodes, late join | Every owner ends with the same value  |

#[cfg(test)]
mod tests {
    use crate::config::{CoreConfig, RpcConfig, TopologyConfig};
    use crate::error::Error;
    use crate::partitioning::KeyPartitioner;
    use crate::testing::{wait_for, TestCluster};
    use crate::topology::{
        CacheTopology, NoopTopologyListener, Phase, RebalancingStatus, TopologyListener,
    };
    use crate::types::{Address, CacheName, PhaseFailure};
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::info;

    const STABLE_TIMEOUT: Duration = Duration::from_secs(5);

    fn config(num_owners: usize) -> CoreConfig {
        CoreConfig::default()
            .with_rpc_config(RpcConfig::default().with_timeout(Duration::from_secs(2)))
            .with_topology_config(
                TopologyConfig::default()
                    .with_num_owners(num_owners)
                    .with_num_segments(32)
                    .with_join_timeout(Duration::from_secs(2)),
            )
    }

    fn cache() -> CacheName {
        CacheName::new("users")
    }

    /// Holds every topology of one phase for `delay` before accepting it.
    struct SlowPhaseListener {
        phase: Phase,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl TopologyListener for SlowPhaseListener {
        async fn on_topology_update(
            &self,
            _cache: &CacheName,
            topology: &CacheTopology,
        ) -> std::result::Result<(), PhaseFailure> {
            if topology.phase == self.phase {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }
    }

    fn generate_test_data(count: usize) -> Vec<(String, String)> {
        (0..count)
            .map(|i| (format!("key-{}", i), format!("value-{}", i)))
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_01_members_join_and_route_data() {
        let cluster = TestCluster::new(3, config(2)).unwrap();
        cluster.start_cache(&cache()).await.unwrap();

        let topology = cluster
            .wait_for_stable(&cache(), STABLE_TIMEOUT)
            .await
            .expect("cache did not stabilise");
        info!(topology_id = topology.topology_id, "Cluster stable");
        assert_eq!(topology.phase, Phase::NoRebalance);
        assert_eq!(topology.actual_members, cluster.addresses());
        for segment in 0..topology.num_segments() {
            assert_eq!(topology.read_owners(segment).len(), 2);
        }

        let data = generate_test_data(20);
        for (key, value) in &data {
            let previous = cluster
                .node(1)
                .put(cache(), Bytes::from(key.clone()), Bytes::from(value.clone()))
                .await
                .unwrap();
            assert_eq!(previous, None);
        }

        let partitioner = KeyPartitioner::new(topology.num_segments());
        for (key, value) in &data {
            let read = cluster
                .node(3)
                .get(cache(), Bytes::from(key.clone()))
                .await
                .unwrap();
            assert_eq!(read, Some(Bytes::from(value.clone())));

            let segment = partitioner.segment_of(key.as_bytes());
            for owner in topology.write_owners(segment) {
                assert!(cluster.store(owner.id()).contains(&cache(), key.as_bytes()));
            }
        }

        let previous = cluster.node(2).remove(cache(), "key-0").await.unwrap();
        assert_eq!(previous, Some(Bytes::from("value-0")));
        assert_eq!(cluster.node(1).get(cache(), "key-0").await.unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_02_scale_up_assigns_segments() {
        let mut cluster = TestCluster::new(2, config(1)).unwrap();
        cluster.start_cache(&cache()).await.unwrap();
        let before = cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();

        let joiner = cluster.add_node().unwrap();
        joiner
            .start_cache(cache(), Arc::new(NoopTopologyListener))
            .await
            .unwrap();
        let after = cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();

        assert!(after.topology_id > before.topology_id);
        assert_eq!(after.actual_members.len(), 3);
        let owned = (0..after.num_segments())
            .filter(|&segment| after.read_owners(segment).contains(&joiner.address()))
            .count();
        assert!(owned > 0, "joiner owns no segment");
        assert_eq!(
            cluster.coordinator().metrics().rebalance_completed.get(),
            2,
            "one rebalance per joiner after the first"
        );

        joiner.put(cache(), "k", "v").await.unwrap();
        assert_eq!(cluster.node(1).get(cache(), "k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_03_sole_owner_crash() {
        let mut cluster = TestCluster::new(3, config(1)).unwrap();
        cluster.start_cache(&cache()).await.unwrap();
        cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();

        cluster.kill(3);
        let topology = cluster
            .wait_for_stable(&cache(), STABLE_TIMEOUT)
            .await
            .expect("survivors did not stabilise");

        let dead = Address::new(3);
        assert_eq!(topology.actual_members, vec![Address::new(1), Address::new(2)]);
        for segment in 0..topology.num_segments() {
            let owners = topology.read_owners(segment);
            assert_eq!(owners.len(), 1);
            assert_ne!(owners[0], dead);
        }

        cluster.node(2).put(cache(), "after-crash", "v").await.unwrap();
        assert_eq!(
            cluster.node(1).get(cache(), "after-crash").await.unwrap(),
            Some(Bytes::from("v"))
        );
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_04_coordinator_failover() {
        let mut cluster = TestCluster::new(3, config(2)).unwrap();
        cluster.start_cache(&cache()).await.unwrap();
        let before = cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();
        assert!(cluster.node(1).is_coordinator());
        assert!(matches!(
            cluster.node(2).rebalancing_status(&cache()),
            Err(Error::NotCoordinator { .. })
        ));

        cluster.kill(1);
        assert!(cluster.node(2).is_coordinator());
        let after = cluster
            .wait_for_stable(&cache(), STABLE_TIMEOUT)
            .await
            .expect("new coordinator did not recover the cache");

        assert!(after.topology_id > before.topology_id);
        assert_eq!(after.actual_members, vec![Address::new(2), Address::new(3)]);
        assert_eq!(
            cluster.node(2).rebalancing_status(&cache()).unwrap(),
            RebalancingStatus::Complete
        );
        for segment in 0..after.num_segments() {
            assert_eq!(after.read_owners(segment).len(), 2);
        }
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_05_concurrent_writes_are_ordered() {
        let cluster = TestCluster::new(2, config(2)).unwrap();
        cluster.start_cache(&cache()).await.unwrap();
        cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();

        let node = cluster.node(1).clone();
        let first = {
            let node = node.clone();
            tokio::spawn(async move { node.put(cache(), "counter", "a").await })
        };
        let second = {
            let node = node.clone();
            tokio::spawn(async move { node.put(cache(), "counter", "b").await })
        };
        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();

        // Exactly one write saw the other's value.
        let previous: HashSet<Option<Bytes>> = [a, b].into_iter().collect();
        assert!(previous.contains(&None));
        assert_eq!(previous.len(), 2);

        let stats = node.sequencer_stats();
        assert_eq!(stats.pending_actions, 0);
        assert_eq!(stats.tracked_keys, 0);
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_06_unreachable_owner_times_out() {
        let config = config(2)
            .with_rpc_config(RpcConfig::default().with_timeout(Duration::from_millis(200)));
        let cluster = TestCluster::new(2, config).unwrap();
        cluster.start_cache(&cache()).await.unwrap();
        cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();

        cluster.network.block(Address::new(1), Address::new(2));
        let result = cluster.node(1).put(cache(), "k", "v").await;
        match result {
            Err(Error::Timeout { missing, .. }) => assert_eq!(missing, vec![Address::new(2)]),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(cluster.network.dropped() > 0);

        cluster.network.unblock_all();
        cluster.node(1).put(cache(), "k", "v2").await.unwrap();
        assert_eq!(
            cluster.store(2).get(&cache(), b"k"),
            Some(Bytes::from("v2"))
        );
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_07_cache_dependencies() {
        let cluster = TestCluster::new(2, config(2)).unwrap();
        let base = CacheName::new("base");
        let index = CacheName::new("index");
        cluster.start_cache(&base).await.unwrap();
        cluster.start_cache(&index).await.unwrap();
        cluster.wait_for_stable(&base, STABLE_TIMEOUT).await.unwrap();
        cluster.wait_for_stable(&index, STABLE_TIMEOUT).await.unwrap();

        let node = cluster.node(2);
        node.add_cache_dependency(index.clone(), base.clone()).unwrap();
        assert!(matches!(
            node.add_cache_dependency(base.clone(), index.clone()),
            Err(Error::CyclicDependency { .. })
        ));

        node.stop_cache(base.clone()).await.unwrap();
        assert!(node.topology(&index).is_none());
        assert!(node.topology(&base).is_none());

        let coordinator = cluster.coordinator().cluster_topology().clone();
        let left = wait_for(
            || {
                [&base, &index].iter().all(|name| {
                    coordinator
                        .cache_topology(name)
                        .is_some_and(|t| t.actual_members == vec![Address::new(1)])
                })
            },
            STABLE_TIMEOUT,
        )
        .await;
        assert!(left, "member still listed after stopping its caches");
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_08_rebalancing_switch() {
        let mut cluster = TestCluster::new(2, config(1)).unwrap();
        cluster.start_cache(&cache()).await.unwrap();
        cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();

        let coordinator = cluster.coordinator().clone();
        coordinator.set_rebalancing_enabled(None, false).unwrap();
        assert_eq!(
            coordinator.rebalancing_status(&cache()).unwrap(),
            RebalancingStatus::Suspended
        );

        let joiner = cluster.add_node().unwrap();
        joiner
            .start_cache(cache(), Arc::new(NoopTopologyListener))
            .await
            .unwrap();
        let topology = coordinator.cluster_topology().cache_topology(&cache()).unwrap();
        assert_eq!(topology.phase, Phase::NoRebalance);
        assert!(!topology.actual_members.contains(&joiner.address()));

        coordinator.set_rebalancing_enabled(None, true).unwrap();
        let topology = cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();
        assert!(topology.actual_members.contains(&joiner.address()));
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_09_failover_with_members_ahead() {
        let mut cluster = TestCluster::new(3, config(2)).unwrap();
        cluster.start_cache(&cache()).await.unwrap();
        let before = cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();

        // Node 2 misses every topology the coordinator publishes from here on.
        cluster.network.block(Address::new(1), Address::new(2));
        let joiner = cluster.add_node().unwrap();
        joiner
            .start_cache(cache(), Arc::new(NoopTopologyListener))
            .await
            .unwrap();
        let ahead = wait_for(
            || {
                cluster
                    .node(3)
                    .topology(&cache())
                    .is_some_and(|t| t.topology_id > before.topology_id)
            },
            STABLE_TIMEOUT,
        )
        .await;
        assert!(ahead, "node 3 never moved past the stable topology");
        let ahead_id = cluster.node(3).topology(&cache()).unwrap().topology_id;
        assert_eq!(
            cluster.node(2).topology(&cache()).unwrap().topology_id,
            before.topology_id
        );

        cluster.kill(1);
        cluster.network.unblock_all();
        let after = cluster
            .wait_for_stable(&cache(), STABLE_TIMEOUT)
            .await
            .expect("members ahead of the new coordinator never converged");

        info!(ahead_id, recovered = after.topology_id, "Recovered past members ahead");
        assert!(after.topology_id > ahead_id);
        assert_eq!(
            after.actual_members,
            vec![Address::new(2), Address::new(3), Address::new(4)]
        );
        let owned = (0..after.num_segments())
            .filter(|&segment| after.read_owners(segment).contains(&joiner.address()))
            .count();
        assert!(owned > 0, "joiner owns no segment");
    }

    #[test_log::test(tokio::test)]
    async fn tc_reb_10_writers_on_two_nodes_with_join_during_read_all() {
        let mut cluster = TestCluster::new(3, config(2)).unwrap();
        for id in 1..=3 {
            let listener: Arc<dyn TopologyListener> = if id == 3 {
                Arc::new(SlowPhaseListener {
                    phase: Phase::ReadAllWriteAll,
                    delay: Duration::from_millis(300),
                })
            } else {
                Arc::new(NoopTopologyListener)
            };
            cluster.node(id).start_cache(cache(), listener).await.unwrap();
        }
        cluster.wait_for_stable(&cache(), STABLE_TIMEOUT).await.unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let writers: Vec<_> = [1, 2]
            .into_iter()
            .map(|id| {
                let node = cluster.node(id).clone();
                let stop = Arc::clone(&stop);
                let written = Arc::new(AtomicUsize::new(0));
                let counter = Arc::clone(&written);
                let task = tokio::spawn(async move {
                    let mut last = None;
                    while !stop.load(Ordering::Acquire) {
                        let value = Bytes::from(format!("node{}-{}", id, counter.load(Ordering::Relaxed)));
                        node.put(cache(), "shared", value.clone()).await?;
                        counter.fetch_add(1, Ordering::Relaxed);
                        last = Some(value);
                    }
                    Ok::<_, Error>(last)
                });
                (written, task)
            })
            .collect();

        let first = cluster.add_node().unwrap();
        first
            .start_cache(cache(), Arc::new(NoopTopologyListener))
            .await
            .unwrap();
        let coordinator = cluster.coordinator().cluster_topology().clone();
        let in_read_all = wait_for(
            || {
                coordinator
                    .cache_topology(&cache())
                    .is_some_and(|t| t.phase == Phase::ReadAllWriteAll)
            },
            STABLE_TIMEOUT,
        )
        .await;
        assert!(in_read_all, "rebalance never reached ReadAllWriteAll");

        let late = cluster.add_node().unwrap();
        let joined = late
            .start_cache(cache(), Arc::new(NoopTopologyListener))
            .await
            .unwrap();
        assert_eq!(joined.phase, Phase::ReadAllWriteAll);
        assert!(!joined
            .pending_ch
            .as_ref()
            .is_some_and(|pending| pending.contains_member(&late.address())));

        let stable = cluster
            .wait_for_stable(&cache(), Duration::from_secs(10))
            .await
            .expect("cluster did not stabilise after both joins");
        assert_eq!(stable.actual_members.len(), 5);
        assert!(!stable.current_ch.segments_for_owner(&late.address()).is_empty());

        // Let both writers land a few writes on the final owners.
        let progress: Vec<usize> = writers.iter().map(|(n, _)| n.load(Ordering::Relaxed)).collect();
        let progressed = wait_for(
            || {
                writers
                    .iter()
                    .zip(&progress)
                    .all(|((n, _), before)| n.load(Ordering::Relaxed) >= before + 3)
            },
            STABLE_TIMEOUT,
        )
        .await;
        assert!(progressed, "writers stalled after the rebalance");
        stop.store(true, Ordering::Release);

        let mut last_writes = HashSet::new();
        for (_, task) in writers {
            last_writes.insert(task.await.unwrap().unwrap().unwrap());
        }

        let segment = KeyPartitioner::new(stable.num_segments()).segment_of(b"shared");
        let owners = stable.write_owners(segment).to_vec();
        let values: HashSet<Option<Bytes>> = owners
            .iter()
            .map(|owner| cluster.store(owner.id()).get(&cache(), b"shared"))
            .collect();
        assert_eq!(values.len(), 1, "owners {:?} disagree: {:?}", owners, values);
        let value = values.into_iter().next().flatten().unwrap();
        assert!(last_writes.contains(&value), "{:?} is not a final write", value);
        assert_eq!(
            cluster.node(late.address().id()).get(cache(), "shared").await.unwrap(),
            Some(value)
        );
    }
}
