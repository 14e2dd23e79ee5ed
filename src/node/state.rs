use serde::{Deserialize, Serialize};

use crate::error::{Result, TokenMeshError};

/// Externally visible state of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum NodeState {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "REQUESTING")]
    Requesting,
    #[serde(rename = "IN_CS")]
    InCs,
    #[serde(rename = "FAILED")]
    Failed,
}

impl NodeState {
    pub fn label(&self) -> &'static str {
        match self {
            NodeState::Idle => "IDLE",
            NodeState::Requesting => "REQUESTING",
            NodeState::InCs => "IN_CS",
            NodeState::Failed => "FAILED",
        }
    }

    /// Whether `self -> next` is one of the allowed edges.
    ///
    /// IDLE -> REQUESTING -> IN_CS -> IDLE, anything -> FAILED, FAILED -> IDLE.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (NodeState::Idle, NodeState::Requesting)
                | (NodeState::Requesting, NodeState::InCs)
                | (NodeState::InCs, NodeState::Idle)
                | (NodeState::Failed, NodeState::Idle)
                | (NodeState::Idle, NodeState::Failed)
                | (NodeState::Requesting, NodeState::Failed)
                | (NodeState::InCs, NodeState::Failed)
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "IDLE" => Ok(NodeState::Idle),
            "REQUESTING" => Ok(NodeState::Requesting),
            "IN_CS" => Ok(NodeState::InCs),
            "FAILED" => Ok(NodeState::Failed),
            _ => Err(format!("Invalid node state: {}", s)),
        }
    }
}

/// Guards the node's lifecycle edges.
#[derive(Clone, Debug)]
pub struct NodeStateMachine {
    current: NodeState,
    transitions: u64,
}

impl Default for NodeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStateMachine {
    pub fn new() -> Self {
        Self {
            current: NodeState::Idle,
            transitions: 0,
        }
    }

    pub fn current(&self) -> NodeState {
        self.current
    }

    pub fn is(&self, state: NodeState) -> bool {
        self.current == state
    }

    /// Number of successful transitions so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn transition(&mut self, next: NodeState) -> Result<NodeState> {
        if !self.current.can_transition_to(next) {
            return Err(TokenMeshError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        let previous = self.current;
        self.current = next;
        self.transitions += 1;
        Ok(previous)
    }
}
