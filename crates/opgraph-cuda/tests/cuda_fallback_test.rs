//! Integration tests for running host operators inside a device pipeline.
//!
//! Test categories:
//! - Construction: placement checks, outer and local blob resolution
//! - Execution: staging round trip, in-place use, host operator failures
//! - Device errors surfaced while staging
//!
//! ```bash
//! cargo test -p opgraph-cuda --test cuda_fallback_test
//! ```

use opgraph_core::ops::AddOp;
use opgraph_core::{
    CoreResult, DeviceOption, HostOperator, HostTensor, Operator, OperatorBase, OperatorDef,
    Workspace,
};
use opgraph_cuda::{runtime, CudaContext, CudaError, CudaFallbackOp, CudaTensor};

fn set_device_input(ws: &mut Workspace, name: &str, data: &[f32], device: usize) {
    let ctx = CudaContext::new(device).unwrap();
    let host = HostTensor::from_slice(&[data.len()], data).unwrap();
    let tensor = CudaTensor::from_host(&host, &ctx).unwrap();
    ws.create_blob(name).write().set(tensor);
}

fn read_device_output(ws: &Workspace, name: &str) -> (Option<usize>, Vec<f32>) {
    let blob = ws.get_blob(name).unwrap();
    let guard = blob.read();
    let tensor = guard.get::<CudaTensor>().expect("output holds a device tensor");
    let host = tensor.fetch().unwrap();
    (tensor.device(), host.to_vec::<f32>().unwrap())
}

fn add_def(device: usize) -> OperatorDef {
    OperatorDef::new("Add", ["A", "B"], ["C"]).with_device_option(DeviceOption::cuda(device))
}

/// Host operator that declares two outputs but only ever creates the first.
#[derive(Debug)]
struct FirstOutputOnly {
    base: OperatorBase,
}

impl Operator for FirstOutputOnly {
    fn def(&self) -> &OperatorDef {
        self.base.def()
    }

    fn run(&mut self) -> bool {
        true
    }
}

impl HostOperator for FirstOutputOnly {
    fn create(def: &OperatorDef, ws: &mut Workspace) -> CoreResult<Self> {
        Ok(Self {
            base: OperatorBase::with_outputs(def, ws, &def.outputs[..1])?,
        })
    }
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

#[test]
fn test_integration_rejects_host_placement() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0], 0);
    set_device_input(&mut ws, "B", &[1.0], 0);
    let def = OperatorDef::new("Add", ["A", "B"], ["C"]);

    let err = CudaFallbackOp::<AddOp>::new(&def, &mut ws).unwrap_err();
    assert!(matches!(err, CudaError::InvalidDeviceOption(_)), "got {err:?}");
}

#[test]
fn test_integration_missing_outer_input() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0], 0);

    let err = CudaFallbackOp::<AddOp>::new(&add_def(0), &mut ws).unwrap_err();
    match err {
        CudaError::MissingBlob { name, context } => {
            assert_eq!(name, "B");
            assert_eq!(context, "outer input");
        }
        other => panic!("expected MissingBlob, got {other:?}"),
    }
}

#[test]
fn test_integration_host_op_must_produce_every_output() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "X", &[1.0], 0);
    let def = OperatorDef::new("Split", ["X"], ["P", "Q"])
        .with_device_option(DeviceOption::cuda(0));

    let err = CudaFallbackOp::<FirstOutputOnly>::new(&def, &mut ws).unwrap_err();
    match err {
        CudaError::MissingBlob { name, context } => {
            assert_eq!(name, "Q");
            assert_eq!(context, "host operator output");
        }
        other => panic!("expected MissingBlob, got {other:?}"),
    }
}

#[test]
fn test_integration_construction_creates_outer_outputs_and_private_workspace() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0], 0);
    set_device_input(&mut ws, "B", &[2.0], 0);

    let op = CudaFallbackOp::<AddOp>::new(&add_def(0), &mut ws).unwrap();
    assert!(ws.has_blob("C"));
    assert!(ws.get_blob("C").unwrap().read().is_empty());

    let local = op.local_workspace();
    for name in ["A", "B", "C"] {
        assert!(local.has_blob(name), "private workspace lacks {name}");
    }
    assert_eq!(op.base_op().def().device_option, DeviceOption::cpu());
    assert_eq!(op.input_size(), 2);
    assert_eq!(op.output_size(), 1);
}

#[test]
fn test_integration_rejects_invisible_device() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0], 0);
    set_device_input(&mut ws, "B", &[1.0], 0);
    let device = runtime::device_count();

    let err = CudaFallbackOp::<AddOp>::new(&add_def(device), &mut ws).unwrap_err();
    assert!(matches!(err, CudaError::InvalidDevice { .. }), "got {err:?}");
}

// ============================================================================
// EXECUTION
// ============================================================================

#[test]
fn test_integration_add_through_host_fallback() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0, 2.0, 3.0], 0);
    set_device_input(&mut ws, "B", &[4.0, 5.0, 6.0], 0);

    let mut op = CudaFallbackOp::<AddOp>::new(&add_def(0), &mut ws).unwrap();
    assert!(op.run());

    let (device, values) = read_device_output(&ws, "C");
    assert_eq!(device, Some(0));
    assert_eq!(values, vec![5.0, 7.0, 9.0]);
}

#[test]
fn test_integration_outputs_land_on_the_operator_device() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0, 1.0], 1);
    set_device_input(&mut ws, "B", &[0.5, 0.25], 1);

    let mut op = CudaFallbackOp::<AddOp>::new(&add_def(1), &mut ws).unwrap();
    assert!(op.run());

    let (device, values) = read_device_output(&ws, "C");
    assert_eq!(device, Some(1));
    assert_eq!(values, vec![1.5, 1.25]);
}

#[test]
fn test_integration_repeated_runs_restage_inputs() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0], 0);
    set_device_input(&mut ws, "B", &[1.0], 0);
    let mut op = CudaFallbackOp::<AddOp>::new(&add_def(0), &mut ws).unwrap();
    assert!(op.run());
    assert_eq!(read_device_output(&ws, "C").1, vec![2.0]);

    set_device_input(&mut ws, "B", &[10.0], 0);
    assert!(op.run());
    assert_eq!(read_device_output(&ws, "C").1, vec![11.0]);
}

#[test]
fn test_integration_in_place_output() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0, 2.0], 0);
    set_device_input(&mut ws, "B", &[3.0, 4.0], 0);
    let def = OperatorDef::new("Add", ["A", "B"], ["A"]).with_device_option(DeviceOption::cuda(0));

    let mut op = CudaFallbackOp::<AddOp>::new(&def, &mut ws).unwrap();
    assert!(op.run());
    assert_eq!(read_device_output(&ws, "A").1, vec![4.0, 6.0]);
}

#[test]
fn test_integration_host_op_failure_returns_false() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0, 2.0], 0);
    set_device_input(&mut ws, "B", &[1.0, 2.0, 3.0], 0);

    let mut op = CudaFallbackOp::<AddOp>::new(&add_def(0), &mut ws).unwrap();
    assert!(!op.run());
    // Step 4 never ran, so the outer output is untouched.
    assert!(ws.get_blob("C").unwrap().read().is_empty());
}

#[test]
fn test_integration_non_device_input_returns_false() {
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0], 0);
    ws.create_blob("B")
        .write()
        .set(HostTensor::from_vec(vec![1.0f32]));

    let mut op = CudaFallbackOp::<AddOp>::new(&add_def(0), &mut ws).unwrap();
    assert!(!op.run());
}

// ============================================================================
// DEVICE ERRORS
// ============================================================================

#[test]
fn test_integration_staging_fault_returns_false() {
    let sim = runtime::simulated_backend().expect("tests run on the simulated backend");
    let mut ws = Workspace::new();
    set_device_input(&mut ws, "A", &[1.0], 0);
    set_device_input(&mut ws, "B", &[2.0], 0);
    let mut op = CudaFallbackOp::<AddOp>::new(&add_def(0), &mut ws).unwrap();

    sim.inject_fault(719, "unspecified launch failure");
    assert!(!op.run());

    // The fault was consumed by the staging synchronize; the next run is clean.
    assert!(op.run());
    assert_eq!(read_device_output(&ws, "C").1, vec![3.0]);
}
