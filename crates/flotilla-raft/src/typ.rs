//! Raft type configuration.
//!
//! Wires together the openraft associated types: node ids, the
//! store-action request payload, and the async runtime.

use std::io::Cursor;

use openraft::TokioRuntime;

use flotilla_store::StoreAction;

/// One replicated write: a batch of store actions committed atomically.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Request {
    pub actions: Vec<StoreAction>,
}

/// Outcome of applying a request to the state machine.
///
/// A rejected batch (stale version, name conflict) is a *successful*
/// log application with `applied == false`: every member rejects it
/// identically, and the proposer maps the error string back to a store
/// error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Response {
    pub applied: bool,
    pub error: Option<String>,
}

openraft::declare_raft_types!(
    /// Flotilla Raft type configuration.
    pub TypeConfig:
        D = Request,
        R = Response,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// Convenience alias for the Raft instance.
pub type FlotillaRaft = openraft::Raft<TypeConfig>;

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::{Kind, StoreAction};

    #[test]
    fn request_roundtrips_through_json() {
        let req = Request {
            actions: vec![StoreAction::Delete {
                kind: Kind::Task,
                id: "t1".to_string(),
            }],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.actions.len(), 1);
        assert_eq!(back.actions[0].id(), "t1");
    }

    #[test]
    fn response_roundtrips_through_json() {
        let resp = Response {
            applied: false,
            error: Some("name already in use: web".to_string()),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert!(!back.applied);
        assert!(back.error.unwrap().contains("web"));
    }
}
