//! Integration tests for device instructions.
//!
//! Tests: opcode allow-lists, shape propagation, unary and binary results,
//! in-place updates, variable removal

mod common;

use common::{accelerated, assert_close, context_for, init_tracing, ramp_3x4, simulated_executor};
use std::sync::Arc;
use tessera_core::{BinaryOp, Matrix, RunConfiguration, Shape, UnaryOp};
use tessera_runtime::{
    DeviceContextPool, DeviceInstruction, ExecutionContext, Instruction, InstructionProgram,
    ProgramExecutor, RuntimeError,
};

/// Run `program` with a fresh single-device executor over `inputs`.
fn run_with(
    program: &InstructionProgram,
    inputs: &[(&str, Matrix)],
    config: &RunConfiguration,
) -> (ProgramExecutor, ExecutionContext, tessera_runtime::Result<()>) {
    init_tracing();
    let executor = simulated_executor(1);
    let mut ec = context_for(&executor);
    for (name, matrix) in inputs {
        ec.bind_matrix(*name, matrix.clone()).unwrap();
    }
    let result = executor.run(program, Some(&mut ec), config);
    (executor, ec, result)
}

#[test]
fn test_unsupported_opcodes_dispatch_nothing() {
    for opcode in ["sel+", "relu", "EXP", "", "+"] {
        let program = InstructionProgram::new(vec![Instruction::unary(opcode, "X", "Y")]);
        let (executor, ec, result) = run_with(&program, &[("X", ramp_3x4())], &accelerated());

        assert!(
            matches!(&result, Err(RuntimeError::UnsupportedOperator(op)) if op == opcode),
            "{opcode:?}: {result:?}"
        );
        let snapshot = executor.metrics().snapshot();
        assert_eq!(snapshot.kernel_launches, 0);
        // only the input was ever allocated
        assert_eq!(snapshot.device_allocations, 1);
        assert_eq!(ec.metadata("Y"), Some(Shape::new(3, 4)));
        assert!(!ec.variable("Y").unwrap().has_host_data());
    }

    for opcode in ["exp", "sel+", "**"] {
        let program = InstructionProgram::new(vec![Instruction::binary(opcode, "X", "X", "Y")]);
        let (executor, _, result) = run_with(&program, &[("X", ramp_3x4())], &accelerated());
        assert!(matches!(result, Err(RuntimeError::UnsupportedOperator(_))));
        assert_eq!(executor.metrics().snapshot().kernel_launches, 0);
    }
}

#[test]
fn test_unary_preserves_shape() {
    for shape in [Shape::new(1, 1), Shape::new(3, 4), Shape::new(17, 9), Shape::new(0, 5)] {
        let input = Matrix::from_fn(shape, |r, c| (r + c) as f32);
        let program = InstructionProgram::new(vec![Instruction::unary("abs", "X", "Y")]);
        let (_, mut ec, result) = run_with(&program, &[("X", input)], &accelerated());

        result.expect("Run should succeed");
        assert_eq!(ec.metadata("Y"), Some(shape));
        assert_eq!(ec.matrix("Y").unwrap().shape(), shape);
    }
}

#[test]
fn test_every_unary_op_matches_host_math() {
    let input = Matrix::from_fn(Shape::new(2, 5), |r, c| 0.25 + (r * 5 + c) as f32 * 0.3);
    for op in UnaryOp::ALL {
        for codegen in [false, true] {
            let program =
                InstructionProgram::new(vec![Instruction::unary(op.opcode(), "X", "Y")]);
            let config = accelerated().with_codegen(codegen);
            let (_, mut ec, result) = run_with(&program, &[("X", input.clone())], &config);
            result.unwrap_or_else(|e| panic!("{} failed: {e}", op.opcode()));

            let expected: Vec<f32> = input
                .data()
                .iter()
                .map(|&x| match op {
                    UnaryOp::Exp => x.exp(),
                    UnaryOp::Log => x.ln(),
                    UnaryOp::Sqrt => x.sqrt(),
                    UnaryOp::Abs => x.abs(),
                    UnaryOp::Sin => x.sin(),
                    UnaryOp::Cos => x.cos(),
                    UnaryOp::Tan => x.tan(),
                    UnaryOp::Tanh => x.tanh(),
                    UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
                    UnaryOp::Round => x.round_ties_even(),
                    UnaryOp::Floor => x.floor(),
                    UnaryOp::Ceil => x.ceil(),
                    UnaryOp::Sign => 1.0,
                })
                .collect();
            assert_close(ec.matrix("Y").unwrap().data(), &expected);
        }
    }
}

#[test]
fn test_binary_ops() {
    let a = Matrix::new(Shape::new(2, 2), vec![1.0, 4.0, 9.0, 2.0]).unwrap();
    let b = Matrix::new(Shape::new(2, 2), vec![2.0, 2.0, 3.0, 8.0]).unwrap();
    let cases: [(BinaryOp, [f32; 4]); 7] = [
        (BinaryOp::Add, [3.0, 6.0, 12.0, 10.0]),
        (BinaryOp::Sub, [-1.0, 2.0, 6.0, -6.0]),
        (BinaryOp::Mul, [2.0, 8.0, 27.0, 16.0]),
        (BinaryOp::Div, [0.5, 2.0, 3.0, 0.25]),
        (BinaryOp::Max, [2.0, 4.0, 9.0, 8.0]),
        (BinaryOp::Min, [1.0, 2.0, 3.0, 2.0]),
        (BinaryOp::Pow, [1.0, 16.0, 729.0, 256.0]),
    ];

    for (op, expected) in cases {
        let program =
            InstructionProgram::new(vec![Instruction::binary(op.opcode(), "A", "B", "C")]);
        let (_, mut ec, result) = run_with(
            &program,
            &[("A", a.clone()), ("B", b.clone())],
            &accelerated().with_codegen(true),
        );
        result.unwrap_or_else(|e| panic!("{} failed: {e}", op.opcode()));
        assert_close(ec.matrix("C").unwrap().data(), &expected);
    }
}

#[test]
fn test_binary_shape_mismatch() {
    let program = InstructionProgram::new(vec![Instruction::binary("+", "A", "B", "C")]);
    let (executor, ec, result) = run_with(
        &program,
        &[
            ("A", Matrix::zeros(Shape::new(2, 3))),
            ("B", Matrix::zeros(Shape::new(3, 2))),
        ],
        &accelerated(),
    );

    assert!(matches!(result, Err(RuntimeError::KernelFailure(_))));
    assert!(!ec.contains("C"));
    assert_eq!(executor.pool().stats().outstanding, 0);
}

#[test]
fn test_in_place_update() {
    let program = InstructionProgram::new(vec![
        Instruction::unary("sqrt", "X", "X"),
        Instruction::binary("+", "X", "X", "X"),
    ]);
    let input = Matrix::new(Shape::new(1, 3), vec![1.0, 4.0, 16.0]).unwrap();
    let (executor, mut ec, result) = run_with(&program, &[("X", input)], &accelerated());

    result.expect("Run should succeed");
    assert_close(ec.matrix("X").unwrap().data(), &[2.0, 4.0, 8.0]);
    let devices = executor.pool().devices();
    assert_eq!(devices[0].live_buffers(), 0);
}

#[test]
fn test_remove_variable_instruction() {
    let program = InstructionProgram::new(vec![
        Instruction::unary("exp", "X", "T"),
        Instruction::unary("log", "T", "Y"),
        Instruction::remove_variable("T"),
    ]);
    let input = Matrix::new(Shape::new(1, 2), vec![0.5, 1.5]).unwrap();
    let (executor, mut ec, result) = run_with(&program, &[("X", input)], &accelerated());

    result.expect("Run should succeed");
    assert!(!ec.contains("T"));
    assert_close(ec.matrix("Y").unwrap().data(), &[0.5, 1.5]);
    assert_eq!(executor.metrics().snapshot().executed_instructions, 3);

    let missing = InstructionProgram::new(vec![Instruction::remove_variable("nope")]);
    let result = executor.run(&missing, Some(&mut ec), &accelerated());
    assert!(matches!(result, Err(RuntimeError::VariableNotFound(_))));
}

#[test]
fn test_instruction_arity_and_display() {
    let unary = Instruction::unary("exp", "X", "Y");
    let binary = Instruction::binary("max", "A", "B", "C");
    let rmvar = Instruction::remove_variable("T");

    assert_eq!((unary.input_arity(), unary.output_arity()), (1, 1));
    assert_eq!((binary.input_arity(), binary.output_arity()), (2, 1));
    assert_eq!((rmvar.input_arity(), rmvar.output_arity()), (1, 0));
    assert_eq!(rmvar.opcode(), "rmvar");

    assert_eq!(unary.to_string(), "Y = exp(X)");
    assert_eq!(binary.to_string(), "C = A max B");
    assert_eq!(rmvar.to_string(), "rmvar T");
}

#[test]
fn test_instruction_requires_initialized_device() {
    let pool = DeviceContextPool::simulated(1, tessera_core::PoolConfig::default()).unwrap();
    let mut ec = ExecutionContext::new(Arc::new(tessera_core::RuntimeMetrics::new()));
    ec.bind_matrix("X", ramp_3x4()).unwrap();
    ec.bind_device(pool.acquire().unwrap()).unwrap();

    let result = Instruction::unary("exp", "X", "Y").execute(&mut ec);
    assert!(matches!(result, Err(RuntimeError::InvalidState(_))));

    let ctx = ec.take_device().unwrap();
    pool.release(ctx).unwrap();
}
