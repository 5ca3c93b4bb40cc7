//! runtime/block.rs — InstructionBlock: a scheduling unit (spec §3)

use crate::runtime::instruction::Instruction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionBlock {
    pub id: usize,
    pub label: String,
    pub priority: usize,
    pub instrs: Vec<Instruction>,
    pub start_time_ms: Option<i64>,
    pub end_time_ms: Option<i64>,
    /// Estimated wall-clock duration derived from `Program::io_rate`/
    /// `flop_rate` (spec's original uses these rates to estimate instruction
    /// durations); filled in by `Program::post_op` once the block's actual
    /// IO/flops totals are known, `None` until then.
    pub estimated_duration_ms: Option<i64>,
}

impl InstructionBlock {
    pub fn new(id: usize, label: impl Into<String>, instrs: Vec<Instruction>) -> Self {
        InstructionBlock {
            id,
            label: label.into(),
            priority: 0,
            instrs,
            start_time_ms: None,
            end_time_ms: None,
            estimated_duration_ms: None,
        }
    }

    /// Instruction ids within a block must be unique (spec §3 invariant).
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for ins in &self.instrs {
            if !seen.insert(ins.id) {
                return Err(format!(
                    "block {} ({}) has duplicate instruction id {}",
                    self.id, self.label, ins.id
                ));
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for ins in &mut self.instrs {
            ins.clear();
        }
    }

    pub fn total_flops(&self) -> f64 {
        self.instrs.iter().map(|i| i.flops).sum()
    }

    pub fn total_read(&self) -> u64 {
        self.instrs.iter().map(|i| i.read_size).sum()
    }

    pub fn total_write(&self) -> u64 {
        self.instrs.iter().map(|i| i.write_size).sum()
    }

    /// Donate priority up to `p`, never lowering an existing, higher value
    /// (spec §4.2 — priorities are monotonically non-decreasing).
    pub fn donate_priority(&mut self, p: usize, max_priority: usize) {
        self.priority = self.priority.max(p.min(max_priority));
    }
}

impl std::fmt::Display for InstructionBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} (priority={})", self.label, self.priority)?;
        for ins in &self.instrs {
            writeln!(f, "\t{:?}", ins.op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::instruction::{Instruction, Op};

    #[test]
    fn rejects_duplicate_instruction_ids() {
        let block = InstructionBlock::new(
            0,
            "dup",
            vec![
                Instruction::new(1, Op::Barrier),
                Instruction::new(1, Op::Barrier),
            ],
        );
        assert!(block.validate().is_err());
    }

    #[test]
    fn donate_priority_never_lowers() {
        let mut block = InstructionBlock::new(0, "x", vec![]);
        block.donate_priority(2, 5);
        assert_eq!(block.priority, 2);
        block.donate_priority(1, 5);
        assert_eq!(block.priority, 2);
        block.donate_priority(10, 5);
        assert_eq!(block.priority, 5);
    }
}
