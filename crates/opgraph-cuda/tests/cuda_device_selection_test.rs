//! Active-device and default-device behavior.
//!
//! The active device is process state, so every test here is `#[serial]`
//! and leaves device 0 active and default when it finishes.

use opgraph_core::DeviceOption;
use opgraph_cuda::{runtime, CudaContext, CudaError, DeviceGuard};
use serial_test::serial;

fn active_device() -> usize {
    runtime::backend().current_device().unwrap()
}

fn reset() {
    runtime::backend().set_device(0).unwrap();
    runtime::set_default_device(0).unwrap();
}

#[test]
#[serial]
fn test_select_makes_context_device_active() {
    reset();
    let ctx = CudaContext::new(1).unwrap();
    ctx.select().unwrap();
    assert_eq!(active_device(), 1);
    reset();
}

#[test]
#[serial]
fn test_device_guard_restores_previous_device() {
    reset();
    {
        let guard = DeviceGuard::new(1).unwrap();
        assert_eq!(guard.previous(), 0);
        assert_eq!(active_device(), 1);
        {
            let inner = DeviceGuard::new(0).unwrap();
            assert_eq!(inner.previous(), 1);
            assert_eq!(active_device(), 0);
        }
        assert_eq!(active_device(), 1);
    }
    assert_eq!(active_device(), 0);
}

#[test]
#[serial]
fn test_device_guard_rejects_invisible_device() {
    reset();
    let count = runtime::device_count();
    let err = DeviceGuard::new(count).unwrap_err();
    assert!(matches!(err, CudaError::InvalidDevice { .. }), "got {err:?}");
    assert_eq!(active_device(), 0);
}

#[test]
#[serial]
fn test_handle_creation_restores_active_device() {
    reset();
    let ctx = CudaContext::new(1).unwrap();
    ctx.blas_handle().unwrap();
    ctx.rng_handle().unwrap();
    assert_eq!(active_device(), 0, "creating device 1 handles leaked the active device");
}

#[test]
#[serial]
fn test_allocation_restores_active_device() {
    reset();
    let ctx = CudaContext::new(1).unwrap();
    let block = ctx.allocate(16).unwrap();
    assert_eq!(active_device(), 0, "allocating on device 1 leaked the active device");
    ctx.release(block).unwrap();

    // A cache miss on a fresh size goes back to the device allocator.
    let block = ctx.allocate(3 << 20).unwrap();
    assert_eq!(active_device(), 0);
    ctx.release(block).unwrap();
}

#[test]
#[serial]
fn test_default_device_drives_unplaced_contexts() {
    reset();
    runtime::set_default_device(1).unwrap();

    let ctx = CudaContext::on_default_device().unwrap();
    assert_eq!(ctx.device_id(), 1);

    let from_option = CudaContext::from_device_option(&DeviceOption::cuda_default()).unwrap();
    assert_eq!(from_option.device_id(), 1);

    // An explicit id wins over the default.
    let explicit = CudaContext::from_device_option(&DeviceOption::cuda(0)).unwrap();
    assert_eq!(explicit.device_id(), 0);
    reset();
}

#[test]
#[serial]
fn test_set_default_device_rejects_invisible_device() {
    reset();
    let count = runtime::device_count();
    assert!(matches!(
        runtime::set_default_device(count),
        Err(CudaError::InvalidDevice { device, count: c }) if device == count && c == count
    ));
    assert_eq!(runtime::default_device(), 0);
}
