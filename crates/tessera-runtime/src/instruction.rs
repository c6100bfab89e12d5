//! Device instructions.
//!
//! Each instruction variant implements [`DeviceInstruction`]. Unary and
//! binary instructions resolve their opcode against a fixed allow-list only
//! after their inputs are staged and the output shape is published, so an
//! unsupported opcode still leaves the output's metadata behind but never
//! allocates or launches anything.
//!
//! Without a bound device (accelerator disabled) unary and binary
//! instructions are evaluated on the host in the same order. Those are not
//! counted as executed device instructions.

use crate::context::ExecutionContext;
use crate::error::{Result, RuntimeError};
use crate::stager::OperandStager;
use std::fmt;
use tessera_core::{BinaryOp, Matrix, Shape, UnaryOp};

/// Opcode of the variable-removal instruction.
pub const REMOVE_VARIABLE_OPCODE: &str = "rmvar";

/// Capability interface shared by all device instructions.
pub trait DeviceInstruction {
    fn opcode(&self) -> &str;

    /// Number of operands read.
    fn input_arity(&self) -> usize;

    /// Number of operands written.
    fn output_arity(&self) -> usize;

    /// Execute against the device bound to `ec`.
    fn execute(&self, ec: &mut ExecutionContext) -> Result<()>;
}

/// `output = op(input)`, elementwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnaryInstruction {
    pub opcode: String,
    pub input: String,
    pub output: String,
}

impl DeviceInstruction for UnaryInstruction {
    fn opcode(&self) -> &str {
        &self.opcode
    }

    fn input_arity(&self) -> usize {
        1
    }

    fn output_arity(&self) -> usize {
        1
    }

    fn execute(&self, ec: &mut ExecutionContext) -> Result<()> {
        if !ec.has_device() {
            return self.execute_on_host(ec);
        }
        ec.metrics().increment_executed_instructions();

        let mut stager = OperandStager::new(ec);
        let input = stager.input(&self.input)?;
        stager.publish_shape(&self.output, input.shape)?;

        let op = UnaryOp::from_opcode(&self.opcode)
            .ok_or_else(|| RuntimeError::UnsupportedOperator(self.opcode.clone()))?;

        let output = stager.output(&self.output, input.shape)?;
        let kernel = stager.kernel(op.into(), input.shape.len())?;
        stager.launch(&kernel, &[&input], &output, &self.opcode)?;
        stager.release()
    }
}

impl UnaryInstruction {
    fn execute_on_host(&self, ec: &mut ExecutionContext) -> Result<()> {
        let input = ec.matrix(&self.input)?;
        ec.set_metadata(&self.output, input.shape())?;

        let op = UnaryOp::from_opcode(&self.opcode)
            .ok_or_else(|| RuntimeError::UnsupportedOperator(self.opcode.clone()))?;

        let data = input.data().iter().map(|&x| op.apply(x)).collect();
        ec.bind_matrix(self.output.as_str(), Matrix::new(input.shape(), data)?)
    }
}

/// `output = left op right`, elementwise over equal shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInstruction {
    pub opcode: String,
    pub left: String,
    pub right: String,
    pub output: String,
}

impl DeviceInstruction for BinaryInstruction {
    fn opcode(&self) -> &str {
        &self.opcode
    }

    fn input_arity(&self) -> usize {
        2
    }

    fn output_arity(&self) -> usize {
        1
    }

    fn execute(&self, ec: &mut ExecutionContext) -> Result<()> {
        if !ec.has_device() {
            return self.execute_on_host(ec);
        }
        ec.metrics().increment_executed_instructions();

        let mut stager = OperandStager::new(ec);
        let left = stager.input(&self.left)?;
        let right = stager.input(&self.right)?;
        self.check_shapes(left.shape, right.shape)?;
        stager.publish_shape(&self.output, left.shape)?;

        let op = BinaryOp::from_opcode(&self.opcode)
            .ok_or_else(|| RuntimeError::UnsupportedOperator(self.opcode.clone()))?;

        let output = stager.output(&self.output, left.shape)?;
        let kernel = stager.kernel(op.into(), left.shape.len())?;
        stager.launch(&kernel, &[&left, &right], &output, &self.opcode)?;
        stager.release()
    }
}

impl BinaryInstruction {
    fn check_shapes(&self, left: Shape, right: Shape) -> Result<()> {
        if left != right {
            return Err(RuntimeError::KernelFailure(format!(
                "'{}' needs equal shapes, got {left} ({}) and {right} ({})",
                self.opcode, self.left, self.right
            )));
        }
        Ok(())
    }

    fn execute_on_host(&self, ec: &mut ExecutionContext) -> Result<()> {
        let left = ec.matrix(&self.left)?;
        let right = ec.matrix(&self.right)?;
        self.check_shapes(left.shape(), right.shape())?;
        ec.set_metadata(&self.output, left.shape())?;

        let op = BinaryOp::from_opcode(&self.opcode)
            .ok_or_else(|| RuntimeError::UnsupportedOperator(self.opcode.clone()))?;

        let data = left
            .data()
            .iter()
            .zip(right.data())
            .map(|(&a, &b)| op.apply(a, b))
            .collect();
        ec.bind_matrix(self.output.as_str(), Matrix::new(left.shape(), data)?)
    }
}

/// Unbind a variable and free its device copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveVariableInstruction {
    pub name: String,
}

impl DeviceInstruction for RemoveVariableInstruction {
    fn opcode(&self) -> &str {
        REMOVE_VARIABLE_OPCODE
    }

    fn input_arity(&self) -> usize {
        1
    }

    fn output_arity(&self) -> usize {
        0
    }

    fn execute(&self, ec: &mut ExecutionContext) -> Result<()> {
        ec.metrics().increment_executed_instructions();
        ec.remove_variable(&self.name)?;
        Ok(())
    }
}

/// A device instruction of any variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Unary(UnaryInstruction),
    Binary(BinaryInstruction),
    RemoveVariable(RemoveVariableInstruction),
}

impl Instruction {
    pub fn unary(
        opcode: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::Unary(UnaryInstruction {
            opcode: opcode.into(),
            input: input.into(),
            output: output.into(),
        })
    }

    pub fn binary(
        opcode: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::Binary(BinaryInstruction {
            opcode: opcode.into(),
            left: left.into(),
            right: right.into(),
            output: output.into(),
        })
    }

    pub fn remove_variable(name: impl Into<String>) -> Self {
        Self::RemoveVariable(RemoveVariableInstruction { name: name.into() })
    }

    fn as_dyn(&self) -> &dyn DeviceInstruction {
        match self {
            Self::Unary(inst) => inst,
            Self::Binary(inst) => inst,
            Self::RemoveVariable(inst) => inst,
        }
    }
}

impl DeviceInstruction for Instruction {
    fn opcode(&self) -> &str {
        self.as_dyn().opcode()
    }

    fn input_arity(&self) -> usize {
        self.as_dyn().input_arity()
    }

    fn output_arity(&self) -> usize {
        self.as_dyn().output_arity()
    }

    fn execute(&self, ec: &mut ExecutionContext) -> Result<()> {
        self.as_dyn().execute(ec)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary(i) => write!(f, "{} = {}({})", i.output, i.opcode, i.input),
            Self::Binary(i) => write!(f, "{} = {} {} {}", i.output, i.left, i.opcode, i.right),
            Self::RemoveVariable(i) => write!(f, "{REMOVE_VARIABLE_OPCODE} {}", i.name),
        }
    }
}
