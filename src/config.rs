use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Tunables consumed by the post-consensus core. Every deployment constant is
/// injected here so tests can run several cores with different settings in
/// one process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub ds_multicast_cluster_size: usize,
    pub comm_size: usize,
    pub tx_sharing_cluster_size: usize,
    pub num_final_block_per_pow: u64,
    pub microblock_timeout_secs: u64,
    pub ds_microblock_consensus_object_timeout_secs: u64,
    pub consensus_object_timeout_secs: u64,
    pub consensus_msg_order_block_window_secs: u64,
    pub fetching_missing_data_timeout_secs: u64,
    pub viewchange_time_secs: u64,
    pub viewchange_precheck_time_secs: u64,
    pub viewchange_extra_time_secs: u64,
    pub num_dsblock_gossip_receivers_per_shard: usize,
    pub num_gossip_receivers: usize,
    pub num_forwarded_block_receivers_per_shard: usize,
    pub num_ds_election: usize,
    pub num_of_treebased_child_clusters: usize,
    #[serde(default)]
    pub lookup_node_mode: bool,
    #[serde(default)]
    pub guard_mode: bool,
    #[serde(default)]
    pub broadcast_gossip_mode: bool,
    #[serde(default = "default_true")]
    pub broadcast_treebased_cluster_mode: bool,
    #[serde(default)]
    pub test_net_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ds_multicast_cluster_size: 10,
            comm_size: 10,
            tx_sharing_cluster_size: 20,
            num_final_block_per_pow: 100,
            microblock_timeout_secs: 30,
            ds_microblock_consensus_object_timeout_secs: 30,
            consensus_object_timeout_secs: 10,
            consensus_msg_order_block_window_secs: 60,
            fetching_missing_data_timeout_secs: 20,
            viewchange_time_secs: 60,
            viewchange_precheck_time_secs: 10,
            viewchange_extra_time_secs: 15,
            num_dsblock_gossip_receivers_per_shard: 4,
            num_gossip_receivers: 8,
            num_forwarded_block_receivers_per_shard: 3,
            num_ds_election: 2,
            num_of_treebased_child_clusters: 3,
            lookup_node_mode: false,
            guard_mode: false,
            broadcast_gossip_mode: false,
            broadcast_treebased_cluster_mode: true,
            test_net_mode: false,
        }
    }
}

impl RuntimeConfig {
    pub fn microblock_timeout(&self) -> Duration {
        Duration::from_secs(self.microblock_timeout_secs)
    }

    pub fn ds_microblock_consensus_object_timeout(&self) -> Duration {
        Duration::from_secs(self.ds_microblock_consensus_object_timeout_secs)
    }

    pub fn consensus_object_timeout(&self) -> Duration {
        Duration::from_secs(self.consensus_object_timeout_secs)
    }

    pub fn consensus_msg_order_block_window(&self) -> Duration {
        Duration::from_secs(self.consensus_msg_order_block_window_secs)
    }

    pub fn fetching_missing_data_timeout(&self) -> Duration {
        Duration::from_secs(self.fetching_missing_data_timeout_secs)
    }

    /// Upper bound on how stale a view-change block timestamp may be: the
    /// consensus round itself plus the full view-change detour.
    pub fn viewchange_timestamp_window_secs(&self) -> u64 {
        self.consensus_object_timeout_secs
            + self.viewchange_time_secs
            + self.viewchange_precheck_time_secs
            + self.viewchange_extra_time_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = NodeConfig::default();
        let encoded = toml::to_string_pretty(&config).expect("encode");
        let decoded: NodeConfig = toml::from_str(&encoded).expect("decode");
        assert_eq!(decoded.runtime.comm_size, config.runtime.comm_size);
        assert_eq!(
            decoded.runtime.num_final_block_per_pow,
            config.runtime.num_final_block_per_pow
        );
        assert!(decoded.runtime.broadcast_treebased_cluster_mode);
    }

    #[test]
    fn viewchange_window_sums_all_phases() {
        let runtime = RuntimeConfig {
            consensus_object_timeout_secs: 10,
            viewchange_time_secs: 60,
            viewchange_precheck_time_secs: 10,
            viewchange_extra_time_secs: 15,
            ..RuntimeConfig::default()
        };
        assert_eq!(runtime.viewchange_timestamp_window_secs(), 95);
    }
}
