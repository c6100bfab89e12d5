//! Runtime programs.

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::instruction::{DeviceInstruction, Instruction};

/// Something the executor can run against an execution context.
pub trait Program {
    fn execute(&self, ec: &mut ExecutionContext) -> Result<()>;
}

impl<F> Program for F
where
    F: Fn(&mut ExecutionContext) -> Result<()>,
{
    fn execute(&self, ec: &mut ExecutionContext) -> Result<()> {
        self(ec)
    }
}

/// A straight-line sequence of device instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionProgram {
    instructions: Vec<Instruction>,
}

impl InstructionProgram {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn push(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl FromIterator<Instruction> for InstructionProgram {
    fn from_iter<I: IntoIterator<Item = Instruction>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Program for InstructionProgram {
    fn execute(&self, ec: &mut ExecutionContext) -> Result<()> {
        for (index, instruction) in self.instructions.iter().enumerate() {
            tracing::debug!(index, %instruction, "Executing instruction");
            instruction.execute(ec).inspect_err(|e| {
                tracing::warn!(index, opcode = instruction.opcode(), error = %e, "Instruction failed");
            })?;
        }
        Ok(())
    }
}
