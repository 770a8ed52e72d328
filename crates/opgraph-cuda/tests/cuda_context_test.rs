//! Integration tests for the execution context and per-thread resources.
//!
//! Run against the simulated backend, which exposes the state real devices
//! keep opaque (handle bindings, stream lifetimes, pending work).
//!
//! ```bash
//! cargo test -p opgraph-cuda --test cuda_context_test
//! ```

use std::thread;

use opgraph_core::DeviceOption;
use opgraph_cuda::backend::PointerMode;
use opgraph_cuda::runtime;
use opgraph_cuda::{CudaContext, Device, Host, SimulatedBackend, DEFAULT_RANDOM_SEED};

fn simulated() -> &'static SimulatedBackend {
    runtime::simulated_backend().expect("tests run on the simulated backend")
}

// ============================================================================
// HANDLE LIFECYCLE
// ============================================================================

#[test]
fn test_handles_are_idempotent_per_thread_and_device() {
    let ctx = CudaContext::new(0).unwrap();
    let blas = ctx.blas_handle().unwrap();
    let rng = ctx.rng_handle().unwrap();
    assert_eq!(ctx.blas_handle().unwrap(), blas);
    assert_eq!(ctx.rng_handle().unwrap(), rng);

    // A second context on the same device shares the thread's handles.
    let other = CudaContext::new(0).unwrap();
    assert_eq!(other.blas_handle().unwrap(), blas);
    assert_eq!(other.stream().unwrap(), ctx.stream().unwrap());
}

#[test]
fn test_devices_get_distinct_handles_bound_to_their_own_stream() {
    let sim = simulated();
    let ctx0 = CudaContext::new(0).unwrap();
    let ctx1 = CudaContext::new(1).unwrap();

    let (s0, s1) = (ctx0.stream().unwrap(), ctx1.stream().unwrap());
    assert_ne!(s0, s1);
    assert_eq!(sim.stream_device(s0.raw()), Some(0));
    assert_eq!(sim.stream_device(s1.raw()), Some(1));

    let (b0, b1) = (ctx0.blas_handle().unwrap(), ctx1.blas_handle().unwrap());
    assert_ne!(b0, b1);
    let info0 = sim.blas_info(b0.raw()).unwrap();
    let info1 = sim.blas_info(b1.raw()).unwrap();
    assert_eq!((info0.device, info0.stream), (0, Some(s0.raw())));
    assert_eq!((info1.device, info1.stream), (1, Some(s1.raw())));
    assert_eq!(info0.pointer_mode, PointerMode::Host);

    let (r0, r1) = (ctx0.rng_handle().unwrap(), ctx1.rng_handle().unwrap());
    assert_ne!(r0, r1);
    assert_eq!(sim.rng_info(r0.raw()).unwrap().stream, Some(s0.raw()));
    assert_eq!(sim.rng_info(r1.raw()).unwrap().stream, Some(s1.raw()));
}

#[test]
fn test_rng_seed_is_context_seed_plus_device() {
    let sim = simulated();

    let option = DeviceOption::cuda(1).with_random_seed(500);
    let ctx = CudaContext::from_device_option(&option).unwrap();
    let rng = ctx.rng_handle().unwrap();
    assert_eq!(sim.rng_info(rng.raw()).unwrap().seed, 501);

    let ctx0 = CudaContext::new(0).unwrap();
    let rng0 = ctx0.rng_handle().unwrap();
    assert_eq!(
        sim.rng_info(rng0.raw()).unwrap().seed,
        u64::from(DEFAULT_RANDOM_SEED)
    );
}

#[test]
fn test_threads_own_independent_resources() {
    let main_ctx = CudaContext::new(0).unwrap();
    let main_stream = main_ctx.stream().unwrap().raw();
    let main_blas = main_ctx.blas_handle().unwrap().raw();

    let (stream, blas) = thread::spawn(|| {
        let ctx = CudaContext::new(0).unwrap();
        (ctx.stream().unwrap().raw(), ctx.blas_handle().unwrap().raw())
    })
    .join()
    .unwrap();

    assert_ne!(stream, main_stream);
    assert_ne!(blas, main_blas);
}

#[test]
fn test_thread_exit_destroys_its_resources() {
    let sim = simulated();
    let (streams, blas, rng) = thread::spawn(|| {
        let ctx0 = CudaContext::new(0).unwrap();
        let ctx1 = CudaContext::new(1).unwrap();
        (
            [ctx0.stream().unwrap().raw(), ctx1.stream().unwrap().raw()],
            ctx0.blas_handle().unwrap().raw(),
            ctx1.rng_handle().unwrap().raw(),
        )
    })
    .join()
    .unwrap();

    for stream in streams {
        assert!(!sim.stream_exists(stream), "stream {:#x} outlived its thread", stream);
    }
    assert!(sim.blas_info(blas).is_none());
    assert!(sim.rng_info(rng).is_none());
}

#[test]
fn test_streams_exist_for_every_device_after_first_touch() {
    let sim = simulated();
    let ctx = CudaContext::new(0).unwrap();
    let _ = ctx.stream().unwrap();
    // Touching device 0 created the stream for device 1 as well.
    let ctx1 = CudaContext::new(1).unwrap();
    assert!(sim.stream_exists(ctx1.stream().unwrap().raw()));
}

// ============================================================================
// COPIES
// ============================================================================

#[test]
fn test_copy_host_device_host_roundtrip() {
    let ctx = CudaContext::new(1).unwrap();
    let src: Vec<u8> = (0..=255).collect();
    let mut back = vec![0u8; src.len()];

    let d = ctx.allocate(src.len()).unwrap();
    unsafe {
        ctx.copy::<Host, Device>(src.len(), src.as_ptr(), d).unwrap();
        ctx.copy::<Device, Host>(src.len(), d, back.as_mut_ptr()).unwrap();
    }
    assert!(ctx.synchronize());
    assert_eq!(back, src);
    ctx.release(d).unwrap();
}

#[test]
fn test_copy_device_to_device() {
    let ctx = CudaContext::new(0).unwrap();
    let src = [1.5f32, -2.0, 3.25, 8.0];
    let mut back = [0.0f32; 4];

    let a = ctx.allocate(16).unwrap() as *mut f32;
    let b = ctx.allocate(16).unwrap() as *mut f32;
    unsafe {
        ctx.copy_items::<f32, Host, Device>(4, src.as_ptr(), a).unwrap();
        ctx.copy_items::<f32, Device, Device>(4, a, b).unwrap();
        ctx.copy_items::<f32, Device, Host>(4, b, back.as_mut_ptr()).unwrap();
    }
    assert!(ctx.synchronize());
    assert_eq!(back, src);
    ctx.release(a.cast()).unwrap();
    ctx.release(b.cast()).unwrap();
}

#[test]
fn test_synchronize_drains_pending_work() {
    let sim = simulated();
    let ctx = CudaContext::new(0).unwrap();
    let stream = ctx.stream().unwrap();
    let src = [9u8; 32];
    let d = ctx.allocate(32).unwrap();
    unsafe { ctx.copy::<Host, Device>(32, src.as_ptr(), d).unwrap() };
    assert_eq!(sim.pending_ops(stream.raw()), Some(1));
    assert!(ctx.synchronize());
    assert_eq!(sim.pending_ops(stream.raw()), Some(0));
    ctx.release(d).unwrap();
}

// ============================================================================
// DEVICE ERRORS
// ============================================================================

#[test]
fn test_synchronize_reports_injected_fault_without_aborting() {
    let sim = simulated();
    let ctx = CudaContext::new(0).unwrap();
    assert!(ctx.synchronize());

    sim.inject_fault(700, "an illegal memory access was encountered");
    assert!(!ctx.synchronize());

    // The fault is consumed; the context drops cleanly afterwards.
    assert!(ctx.synchronize());
}

#[test]
fn test_allocation_errors_propagate() {
    let ctx = CudaContext::new(0).unwrap();
    let capacity = simulated().capacity();
    let err = ctx.allocate(capacity + 1).unwrap_err();
    assert!(matches!(err, opgraph_cuda::CudaError::OutOfMemory { device: 0, .. }));
}
