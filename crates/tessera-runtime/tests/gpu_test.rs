//! End-to-end tests against a real GPU through wgpu.

mod common;

use common::{assert_close, init_tracing, ramp_3x4};
use std::sync::Arc;
use tessera_core::{PoolConfig, RunConfiguration, RuntimeMetrics, Shape};
use tessera_runtime::{
    DeviceBackend, DeviceContextPool, ExecutionContext, GpuBackend, Instruction,
    InstructionProgram, ProgramExecutor,
};

async fn request_backend() -> GpuBackend {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions::default())
        .await
        .expect("Should find a GPU adapter");
    GpuBackend::with_adapter(0, &adapter)
        .await
        .expect("Device creation should succeed")
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_gpu_exp_then_add() {
    init_tracing();
    let backend = Arc::new(request_backend().await);
    println!("GPU: {}", backend.name());

    let metrics = Arc::new(RuntimeMetrics::new());
    let pool = DeviceContextPool::new(
        vec![Arc::clone(&backend) as Arc<dyn DeviceBackend>],
        PoolConfig::default(),
    )
    .expect("Pool should build");
    let executor = ProgramExecutor::new(Arc::new(pool), Arc::clone(&metrics));

    let input = ramp_3x4();
    let mut ec = ExecutionContext::new(Arc::clone(&metrics));
    ec.bind_matrix("X", input.clone()).unwrap();

    let program = InstructionProgram::new(vec![
        Instruction::unary("exp", "X", "E"),
        Instruction::binary("+", "E", "X", "Y"),
    ]);
    for codegen in [false, true] {
        let config = RunConfiguration::default()
            .with_accelerator(true)
            .with_codegen(codegen);
        executor
            .run(&program, Some(&mut ec), &config)
            .expect("Run should succeed");

        let expected: Vec<f32> = input.data().iter().map(|x| x.exp() + x).collect();
        let y = ec.matrix("Y").unwrap();
        assert_eq!(y.shape(), Shape::new(3, 4));
        assert_close(y.data(), &expected);
    }

    assert_eq!(backend.live_buffers(), 0);
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_gpu_round_trip_large_buffer() {
    let backend = request_backend().await;
    let data: Vec<f32> = (0..100_000).map(|i| i as f32).collect();

    let id = backend.upload(&data).unwrap();
    assert_eq!(backend.download(id).unwrap(), data);
    backend.free(id).unwrap();
    assert_eq!(backend.live_buffers(), 0);
}
