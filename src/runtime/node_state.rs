//! runtime/node_state.rs — the node/edge/program state machine (spec §4.3)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeStatus {
    NotReady = 0,
    Ready = 1,
    Running = 2,
    PostOp = 3,
    Finished = 4,
}

impl NodeStatus {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => NodeStatus::Ready,
            2 => NodeStatus::Running,
            3 => NodeStatus::PostOp,
            4 => NodeStatus::Finished,
            _ => NodeStatus::NotReady,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EdgeStatus {
    NotReady = 0,
    Ready = 1,
}

impl EdgeStatus {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => EdgeStatus::Ready,
            _ => EdgeStatus::NotReady,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProgramStatus {
    NotStarted = 0,
    Running = 1,
    Success = 2,
    Exception = 3,
}

impl ProgramStatus {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => ProgramStatus::Running,
            2 => ProgramStatus::Success,
            3 => ProgramStatus::Exception,
            _ => ProgramStatus::NotStarted,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_status_round_trips() {
        for s in [
            NodeStatus::NotReady,
            NodeStatus::Ready,
            NodeStatus::Running,
            NodeStatus::PostOp,
            NodeStatus::Finished,
        ] {
            assert_eq!(NodeStatus::from_i64(s.as_i64()), s);
        }
    }

    #[test]
    fn unknown_value_defaults_not_ready() {
        assert_eq!(NodeStatus::from_i64(99), NodeStatus::NotReady);
    }
}
