//! Node identity as assigned by the backend.

use crate::protocol::control::{NodeInfoReply, DEFAULT_NODE_PORT};

/// Per-node identity. Filled once from the backend lookup and never changed
/// for the life of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeParams {
    /// Backend database id.
    pub node_id: u32,
    /// Unique hardware address.
    pub address: u32,
    /// Wire-level alias assigned at join.
    pub session_id: u8,
    pub firmware_version: u8,
    pub code: String,
    pub name: String,
    pub port: u16,
}

impl NodeParams {
    pub fn new(node_id: u32, address: u32, session_id: u8) -> Self {
        Self {
            node_id,
            address,
            session_id,
            firmware_version: 0,
            code: String::new(),
            name: String::new(),
            port: DEFAULT_NODE_PORT,
        }
    }
}

impl From<&NodeInfoReply> for NodeParams {
    fn from(reply: &NodeInfoReply) -> Self {
        Self {
            node_id: reply.node_id,
            address: reply.address,
            session_id: reply.session_id,
            firmware_version: reply.firmware_version,
            code: reply.code.clone(),
            name: reply.name.clone(),
            port: reply.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_node_info_reply() {
        let reply = NodeInfoReply {
            node_id: 7,
            address: 0x0D47_3533,
            session_id: 1,
            code: "N7".into(),
            name: "pump".into(),
            firmware_version: 3,
            port: 9000,
        };
        let params = NodeParams::from(&reply);
        assert_eq!(params.node_id, 7);
        assert_eq!(params.session_id, 1);
        assert_eq!(params.port, 9000);
        assert_eq!(NodeParams::new(1, 2, 3).port, DEFAULT_NODE_PORT);
    }
}
