//! A device error seen while a context is dropped is fatal.
//!
//! The abort path runs in a child process: the parent re-executes this test
//! binary filtered to `fatal_sync_child`, with `OPGRAPH_FATAL_SYNC_CHILD`
//! set so the child actually faults.

use std::env;
use std::process::Command;

use opgraph_core::SyncFailurePolicy;
use opgraph_cuda::{runtime, CudaContext};

const CHILD_ENV: &str = "OPGRAPH_FATAL_SYNC_CHILD";

fn inject_fault() {
    runtime::simulated_backend()
        .expect("tests run on the simulated backend")
        .inject_fault(700, "an illegal memory access was encountered");
}

#[test]
fn fatal_sync_child() {
    if env::var_os(CHILD_ENV).is_none() {
        return;
    }
    let ctx = CudaContext::new(0)
        .unwrap()
        .with_sync_failure_policy(SyncFailurePolicy::Abort);
    inject_fault();
    drop(ctx);
    unreachable!("context drop should have aborted the process");
}

#[test]
fn test_drop_after_device_fault_aborts_process() {
    let exe = env::current_exe().unwrap();
    let output = Command::new(exe)
        .args(["fatal_sync_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap();

    assert!(
        !output.status.success(),
        "child exited cleanly: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(6), "expected SIGABRT");
    }
}

#[test]
#[should_panic(expected = "device synchronization failed")]
fn test_drop_after_device_fault_panics_under_panic_policy() {
    let ctx = CudaContext::new(0)
        .unwrap()
        .with_sync_failure_policy(SyncFailurePolicy::Panic);
    inject_fault();
    drop(ctx);
}

#[test]
fn test_clean_drop_does_not_fault() {
    let ctx = CudaContext::new(1)
        .unwrap()
        .with_sync_failure_policy(SyncFailurePolicy::Panic);
    assert_eq!(ctx.sync_failure_policy(), SyncFailurePolicy::Panic);
    drop(ctx);
}
