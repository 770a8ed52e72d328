//! BLAS and RNG passthroughs on a context's handles.

use opgraph_core::DataType;

use crate::context::CudaContext;
use crate::error::{CudaError, CudaResult};
use crate::runtime;
use crate::tensor::CudaTensor;

fn check_on_device(ctx: &CudaContext, t: &CudaTensor) -> CudaResult<()> {
    match t.device() {
        Some(device) if device != ctx.device_id() => Err(CudaError::DeviceMismatch {
            expected: ctx.device_id(),
            actual: device,
        }),
        _ => Ok(()),
    }
}

/// `y = alpha * x + y` over f32 tensors on the context's device.
///
/// Enqueued on the context's stream.
pub fn axpy(ctx: &CudaContext, alpha: f32, x: &CudaTensor, y: &mut CudaTensor) -> CudaResult<()> {
    if x.dims() != y.dims() {
        return Err(CudaError::ShapeMismatch {
            expected: y.dims().to_vec(),
            actual: x.dims().to_vec(),
        });
    }
    check_on_device(ctx, x)?;
    check_on_device(ctx, y)?;
    let xp = x.data_ptr::<f32>()?;
    let yp = y.data_mut_ptr::<f32>()?;
    let n = x.numel();
    if n == 0 {
        return Ok(());
    }

    let handle = ctx.blas_handle()?;
    // SAFETY: both tensors hold `n` f32 on the context's device and are
    // borrowed for the call; later work on the same stream is ordered after it.
    unsafe { runtime::backend().saxpy(handle, n, alpha, xp, yp) }
}

/// Fill an f32 tensor with uniform values in `(0, 1]` from the context's RNG.
pub fn rand_uniform(ctx: &CudaContext, out: &mut CudaTensor) -> CudaResult<()> {
    if out.dtype() != DataType::F32 {
        return Err(CudaError::DTypeMismatch {
            expected: DataType::F32,
            actual: out.dtype(),
        });
    }
    check_on_device(ctx, out)?;
    let n = out.numel();
    if n == 0 {
        return Ok(());
    }
    let dst = out.data_mut_ptr::<f32>()?;
    let handle = ctx.rng_handle()?;
    // SAFETY: `out` holds `n` f32 on the context's device.
    unsafe { runtime::backend().generate_uniform(handle, dst, n) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opgraph_core::HostTensor;

    #[test]
    fn test_axpy() {
        let ctx = CudaContext::new(0).unwrap();
        let x = CudaTensor::from_host(&HostTensor::from_vec(vec![1.0f32, 2.0, 3.0]), &ctx).unwrap();
        let mut y =
            CudaTensor::from_host(&HostTensor::from_vec(vec![1.0f32, 1.0, 1.0]), &ctx).unwrap();
        axpy(&ctx, 2.0, &x, &mut y).unwrap();
        let out = y.to_host(&ctx).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_axpy_shape_and_device_checks() {
        let ctx0 = CudaContext::new(0).unwrap();
        let ctx1 = CudaContext::new(1).unwrap();
        let x = CudaTensor::from_host(&HostTensor::from_vec(vec![1.0f32, 2.0]), &ctx0).unwrap();
        let mut short = CudaTensor::from_host(&HostTensor::from_vec(vec![1.0f32]), &ctx0).unwrap();
        assert!(matches!(
            axpy(&ctx0, 1.0, &x, &mut short),
            Err(CudaError::ShapeMismatch { .. })
        ));

        let mut y = CudaTensor::from_host(&HostTensor::from_vec(vec![0.0f32, 0.0]), &ctx0).unwrap();
        assert!(matches!(
            axpy(&ctx1, 1.0, &x, &mut y),
            Err(CudaError::DeviceMismatch { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn test_rand_uniform_range() {
        let ctx = CudaContext::new(0).unwrap();
        let mut out = CudaTensor::new(&[64], DataType::F32, &ctx).unwrap();
        rand_uniform(&ctx, &mut out).unwrap();
        let values = out.to_host(&ctx).unwrap().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v > 0.0 && *v <= 1.0));

        let mut ints = CudaTensor::new(&[4], DataType::I32, &ctx).unwrap();
        assert!(matches!(
            rand_uniform(&ctx, &mut ints),
            Err(CudaError::DTypeMismatch { .. })
        ));
    }
}
