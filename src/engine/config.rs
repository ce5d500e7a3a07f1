//! Cluster membership and engine tunables.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::client::AssignerConfig;
use crate::mailbox::NodeId;
use crate::utils::ParasyncError;

use serde::{Deserialize, Serialize};

/// One node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Address the node listens on for peer links.
    pub addr: SocketAddr,
}

/// Static cluster membership as seen by one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// My node ID.
    pub me: NodeId,
    pub nodes: Vec<NodeInfo>,
}

impl ClusterConfig {
    pub fn new(
        me: NodeId,
        nodes: Vec<NodeInfo>,
    ) -> Result<Self, ParasyncError> {
        let config = ClusterConfig { me, nodes };
        config.validate()?;
        Ok(config)
    }

    /// Single-node cluster that never opens sockets.
    pub fn single() -> Self {
        ClusterConfig {
            me: 0,
            nodes: vec![NodeInfo {
                id: 0,
                addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            }],
        }
    }

    /// Parses a TOML document of the form:
    /// ```toml
    /// me = 0
    /// [[nodes]]
    /// id = 0
    /// addr = "10.0.0.1:52700"
    /// ```
    pub fn from_toml(config_str: &str) -> Result<Self, ParasyncError> {
        let config: ClusterConfig = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Node IDs must be unique and include `me`.
    pub fn validate(&self) -> Result<(), ParasyncError> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        ids.sort();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return logged_err!("duplicate node IDs in {:?}", ids);
        }
        if !ids.contains(&self.me) {
            return logged_err!("node {} not among cluster nodes", self.me);
        }
        Ok(())
    }

    /// All node IDs in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        ids.sort();
        ids
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn my_addr(&self) -> Result<SocketAddr, ParasyncError> {
        self.nodes
            .iter()
            .find(|n| n.id == self.me)
            .map(|n| n.addr)
            .ok_or(ParasyncError::msg(format!("node {} not found", self.me)))
    }

    pub fn addrs(&self) -> HashMap<NodeId, SocketAddr> {
        self.nodes.iter().map(|n| (n.id, n.addr)).collect()
    }
}

/// Engine tunables, parsed from an optional TOML string.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Server threads per node.
    pub num_server_threads: u16,

    /// Helper threads per node; bounds concurrent workers per node.
    pub num_helper_threads: u16,

    /// Size of the per-node worker ID pool.
    pub max_workers_per_node: u16,

    /// Fraction of a pass after which progress is reported.
    pub checkpoint: f64,

    /// Minimum remaining fraction worth reassigning.
    pub min_reassign_ratio: f64,

    /// Progress lead above which help is offered.
    pub help_threshold: f64,

    /// Upper bound on pass-time measurement window.
    pub window_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            num_server_threads: 1,
            num_helper_threads: 8,
            max_workers_per_node: 64,
            checkpoint: 0.75,
            min_reassign_ratio: 0.05,
            help_threshold: 0.2,
            window_size: 100,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the fields present in `config_str`.
    pub fn parse(config_str: Option<&str>) -> Result<Self, ParasyncError> {
        let config = parsed_config!(config_str => EngineConfig;
                                    num_server_threads, num_helper_threads,
                                    max_workers_per_node, checkpoint,
                                    min_reassign_ratio, help_threshold,
                                    window_size)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ParasyncError> {
        if self.num_server_threads == 0 {
            return logged_err!("invalid num_server_threads 0");
        }
        if self.num_helper_threads == 0 {
            return logged_err!("invalid num_helper_threads 0");
        }
        if self.max_workers_per_node < self.num_helper_threads {
            return logged_err!(
                "max_workers_per_node {} < num_helper_threads {}",
                self.max_workers_per_node,
                self.num_helper_threads
            );
        }
        for (name, val) in [
            ("checkpoint", self.checkpoint),
            ("min_reassign_ratio", self.min_reassign_ratio),
            ("help_threshold", self.help_threshold),
        ] {
            if val <= 0.0 || val >= 1.0 {
                return logged_err!("invalid {} {}", name, val);
            }
        }
        if self.window_size == 0 {
            return logged_err!("invalid window_size 0");
        }
        Ok(())
    }

    pub fn assigner_config(&self) -> AssignerConfig {
        AssignerConfig {
            checkpoint: self.checkpoint,
            min_reassign_ratio: self.min_reassign_ratio,
            help_threshold: self.help_threshold,
            window_size: self.window_size,
        }
    }
}
