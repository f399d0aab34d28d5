// state.rs

use crate::*;

/// State shared by every task of the node.
///
/// Config is fixed after startup; the status slot is the only mutable
/// piece and carries its own lock.
pub struct NodeState {
    pub config: NodeConfig,
    pub status: StatusStore,
}

impl NodeState {
    pub fn new(config: NodeConfig) -> Self {
        NodeState {
            config,
            status: StatusStore::new(),
        }
    }
}
// EOF
