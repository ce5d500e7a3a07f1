//! Thread ID allocation over per-node typed pools.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::mailbox::{NodeId, ThreadId, ThreadKind};
use crate::utils::ParasyncError;

use fixedbitset::FixedBitSet;

/// Pools of one node.
#[derive(Debug)]
struct NodePools {
    servers: Vec<ThreadId>,
    helpers: Vec<ThreadId>,
    /// Occupied worker slots.
    workers: FixedBitSet,
}

/// Hands out worker thread IDs and pairs each with a free helper thread of
/// the same node.
#[derive(Debug)]
pub struct IdMapper {
    pools: BTreeMap<NodeId, NodePools>,
    worker_helper: HashMap<ThreadId, ThreadId>,
    bound_helpers: HashSet<ThreadId>,
}

impl IdMapper {
    /// Sets up fixed server and helper pools plus a worker slot pool on
    /// every node.
    pub fn new(
        nodes: &[NodeId],
        num_servers: u16,
        num_helpers: u16,
        max_workers: u16,
    ) -> Self {
        let pools = nodes
            .iter()
            .map(|&node| {
                (
                    node,
                    NodePools {
                        servers: (0..num_servers)
                            .map(|s| ThreadId::server(node, s))
                            .collect(),
                        helpers: (0..num_helpers)
                            .map(|s| ThreadId::helper(node, s))
                            .collect(),
                        workers: FixedBitSet::with_capacity(
                            max_workers as usize,
                        ),
                    },
                )
            })
            .collect();
        IdMapper {
            pools,
            worker_helper: HashMap::new(),
            bound_helpers: HashSet::new(),
        }
    }

    fn pools_of(&self, node: NodeId) -> Result<&NodePools, ParasyncError> {
        self.pools
            .get(&node)
            .ok_or_else(|| {
                ParasyncError::IdMap(format!("unknown node {}", node))
            })
    }

    /// Takes the lowest free worker slot on `node` and binds it to the first
    /// unbound helper there. Fails if either pool is exhausted.
    pub fn allocate_worker_thread(
        &mut self,
        node: NodeId,
    ) -> Result<ThreadId, ParasyncError> {
        let pools = match self.pools.get_mut(&node) {
            Some(pools) => pools,
            None => return logged_err!(IdMap; "unknown node {}", node),
        };
        let slot = match (0..pools.workers.len())
            .find(|&i| !pools.workers.contains(i))
        {
            Some(slot) => slot,
            None => {
                return logged_err!(
                    IdMap;
                    "no free worker slot on node {}",
                    node
                )
            }
        };
        let helper = match pools
            .helpers
            .iter()
            .find(|h| !self.bound_helpers.contains(*h))
        {
            Some(&helper) => helper,
            None => {
                return logged_err!(IdMap; "no free helper on node {}", node)
            }
        };

        pools.workers.insert(slot);
        let tid = ThreadId::worker(node, slot as u16);
        self.bound_helpers.insert(helper);
        self.worker_helper.insert(tid, helper);
        pf_trace!("allocated {} bound to {}", tid, helper);
        Ok(tid)
    }

    /// Releases a worker slot and its helper binding.
    pub fn deallocate_worker_thread(
        &mut self,
        tid: ThreadId,
    ) -> Result<(), ParasyncError> {
        if tid.kind != ThreadKind::Worker {
            return logged_err!(IdMap; "{} is not a worker thread", tid);
        }
        let helper = match self.worker_helper.remove(&tid) {
            Some(helper) => helper,
            None => {
                return logged_err!(IdMap; "worker {} not allocated", tid)
            }
        };
        self.bound_helpers.remove(&helper);
        if let Some(pools) = self.pools.get_mut(&tid.node) {
            pools.workers.set(tid.slot as usize, false);
        }
        Ok(())
    }

    /// Helper bound to `tid`, if allocated.
    pub fn helper_for_worker(&self, tid: ThreadId) -> Option<ThreadId> {
        self.worker_helper.get(&tid).copied()
    }

    pub fn server_threads_for_node(
        &self,
        node: NodeId,
    ) -> Result<&[ThreadId], ParasyncError> {
        Ok(&self.pools_of(node)?.servers)
    }

    pub fn helper_threads_for_node(
        &self,
        node: NodeId,
    ) -> Result<&[ThreadId], ParasyncError> {
        Ok(&self.pools_of(node)?.helpers)
    }

    /// Currently allocated workers on `node`, by slot.
    pub fn worker_threads_for_node(
        &self,
        node: NodeId,
    ) -> Result<Vec<ThreadId>, ParasyncError> {
        Ok(self
            .pools_of(node)?
            .workers
            .ones()
            .map(|slot| ThreadId::worker(node, slot as u16))
            .collect())
    }

    /// Server threads of the whole cluster, by node then slot.
    pub fn all_server_threads(&self) -> Vec<ThreadId> {
        self.pools
            .values()
            .flat_map(|pools| pools.servers.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod idmap_tests {
    use super::*;

    #[test]
    fn fixed_pools() -> Result<(), ParasyncError> {
        let mapper = IdMapper::new(&[1, 0], 2, 3, 4);
        assert_eq!(
            mapper.all_server_threads(),
            vec![
                ThreadId::server(0, 0),
                ThreadId::server(0, 1),
                ThreadId::server(1, 0),
                ThreadId::server(1, 1)
            ]
        );
        assert_eq!(mapper.helper_threads_for_node(1)?.len(), 3);
        assert!(mapper.server_threads_for_node(5).is_err());
        Ok(())
    }

    #[test]
    fn allocate_binds_helpers() -> Result<(), ParasyncError> {
        let mut mapper = IdMapper::new(&[0, 1], 1, 2, 4);
        let w0 = mapper.allocate_worker_thread(0)?;
        let w1 = mapper.allocate_worker_thread(0)?;
        let v0 = mapper.allocate_worker_thread(1)?;
        assert_eq!(w0, ThreadId::worker(0, 0));
        assert_eq!(w1, ThreadId::worker(0, 1));
        assert_eq!(v0, ThreadId::worker(1, 0));
        assert_eq!(mapper.helper_for_worker(w0), Some(ThreadId::helper(0, 0)));
        assert_eq!(mapper.helper_for_worker(w1), Some(ThreadId::helper(0, 1)));
        assert_eq!(mapper.helper_for_worker(v0), Some(ThreadId::helper(1, 0)));
        assert_eq!(mapper.worker_threads_for_node(0)?, vec![w0, w1]);

        // out of helpers on node 0 even though worker slots remain
        assert!(mapper.allocate_worker_thread(0).is_err());
        assert_eq!(mapper.worker_threads_for_node(0)?.len(), 2);
        assert!(mapper.allocate_worker_thread(7).is_err());
        Ok(())
    }

    #[test]
    fn exhaustion_and_reuse() -> Result<(), ParasyncError> {
        let mut mapper = IdMapper::new(&[0], 1, 2, 2);
        let w0 = mapper.allocate_worker_thread(0)?;
        let w1 = mapper.allocate_worker_thread(0)?;
        assert!(mapper.allocate_worker_thread(0).is_err());

        mapper.deallocate_worker_thread(w0)?;
        assert_eq!(mapper.helper_for_worker(w0), None);
        assert!(mapper.deallocate_worker_thread(w0).is_err());
        assert!(mapper
            .deallocate_worker_thread(ThreadId::server(0, 0))
            .is_err());

        // lowest slot and the freed helper come back
        let w2 = mapper.allocate_worker_thread(0)?;
        assert_eq!(w2, w0);
        assert_eq!(mapper.helper_for_worker(w2), Some(ThreadId::helper(0, 0)));
        assert_eq!(mapper.helper_for_worker(w1), Some(ThreadId::helper(0, 1)));
        Ok(())
    }

    #[test]
    fn refills_gap_in_slots() -> Result<(), ParasyncError> {
        let mut mapper = IdMapper::new(&[0], 1, 3, 3);
        let _w0 = mapper.allocate_worker_thread(0)?;
        let w1 = mapper.allocate_worker_thread(0)?;
        let w2 = mapper.allocate_worker_thread(0)?;
        assert_eq!(w2, ThreadId::worker(0, 2));

        mapper.deallocate_worker_thread(w1)?;
        assert_eq!(mapper.allocate_worker_thread(0)?, ThreadId::worker(0, 1));
        assert!(mapper.allocate_worker_thread(0).is_err());
        Ok(())
    }

    #[test]
    fn slot_pool_exhaustion() -> Result<(), ParasyncError> {
        let mut mapper = IdMapper::new(&[0], 1, 4, 1);
        mapper.allocate_worker_thread(0)?;
        assert!(matches!(
            mapper.allocate_worker_thread(0),
            Err(ParasyncError::IdMap(_))
        ));
        Ok(())
    }
}
