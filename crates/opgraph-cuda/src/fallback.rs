//! Run a host-only operator inside a device pipeline.
//!
//! [`CudaFallbackOp`] wraps a [`HostOperator`] so it can be scheduled
//! wherever a CUDA operator is expected. Each run stages the device inputs
//! into a private host workspace, runs the wrapped operator there and copies
//! its outputs back to the device. Every run pays two transfers and a
//! blocking synchronize; it is meant for operators with no device
//! implementation yet.

use std::fmt;

use opgraph_core::{
    BlobRef, DeviceOption, DeviceType, HostOperator, HostTensor, Operator, OperatorDef, Workspace,
};
use tracing::{debug, error};

use crate::context::CudaContext;
use crate::error::{CudaError, CudaResult};
use crate::tensor::{CudaTensor, TensorCopy};

/// Device-scheduled adapter around the host operator `Op`.
///
/// Inputs and outputs in the outer workspace hold [`CudaTensor`]s; the
/// private workspace holds [`HostTensor`]s under the same names. The adapter
/// is single-owner and not cloneable.
pub struct CudaFallbackOp<Op: HostOperator> {
    def: OperatorDef,
    device: usize,
    random_seed: u32,
    inputs: Vec<BlobRef>,
    outputs: Vec<BlobRef>,
    local_ws: Workspace,
    local_input_blobs: Vec<BlobRef>,
    local_output_blobs: Vec<BlobRef>,
    base_op: Op,
}

impl<Op: HostOperator> CudaFallbackOp<Op> {
    /// Build the adapter for a CUDA-placed `def` against the outer workspace.
    ///
    /// # Errors
    ///
    /// - `CudaError::InvalidDeviceOption` if `def` is not placed on CUDA
    /// - `CudaError::InvalidDevice` if the placement names an invisible device
    /// - `CudaError::MissingBlob` if an outer input does not exist, or the
    ///   wrapped operator does not produce one of the declared outputs
    /// - the wrapped operator's own construction error
    pub fn new(def: &OperatorDef, ws: &mut Workspace) -> CudaResult<Self> {
        if def.device_option.device_type != DeviceType::Cuda {
            return Err(CudaError::InvalidDeviceOption(format!(
                "fallback operator '{}' must be placed on CUDA, got {:?}",
                def.op_type, def.device_option.device_type
            )));
        }
        // Resolve placement once; every run builds its context from it.
        let placement = CudaContext::from_device_option(&def.device_option)?;
        let (device, random_seed) = (placement.device_id(), placement.random_seed());
        drop(placement);

        let inputs = def
            .inputs
            .iter()
            .map(|name| {
                ws.get_blob(name).ok_or_else(|| CudaError::MissingBlob {
                    name: name.clone(),
                    context: "outer input",
                })
            })
            .collect::<CudaResult<Vec<_>>>()?;
        let outputs = def.outputs.iter().map(|name| ws.create_blob(name)).collect();

        let mut base_def = def.clone();
        base_def.device_option = DeviceOption::cpu();

        let mut local_ws = Workspace::new();
        let local_input_blobs = def
            .inputs
            .iter()
            .map(|name| local_ws.create_blob(name))
            .collect();
        let base_op = Op::create(&base_def, &mut local_ws)?;
        let local_output_blobs = def
            .outputs
            .iter()
            .map(|name| {
                local_ws.get_blob(name).ok_or_else(|| CudaError::MissingBlob {
                    name: name.clone(),
                    context: "host operator output",
                })
            })
            .collect::<CudaResult<Vec<_>>>()?;

        debug!(
            op = %def.op_type,
            device,
            inputs = def.inputs.len(),
            outputs = def.outputs.len(),
            "created fallback operator"
        );
        Ok(Self {
            def: def.clone(),
            device,
            random_seed,
            inputs,
            outputs,
            local_ws,
            local_input_blobs,
            local_output_blobs,
            base_op,
        })
    }

    /// The wrapped host operator.
    pub fn base_op(&self) -> &Op {
        &self.base_op
    }

    /// The private host workspace.
    pub fn local_workspace(&self) -> &Workspace {
        &self.local_ws
    }

    fn run_staged(&mut self) -> CudaResult<bool> {
        let ctx = CudaContext::with_seed(self.device, self.random_seed)?;

        for (name, (outer, local)) in self
            .def
            .inputs
            .iter()
            .zip(self.inputs.iter().zip(&self.local_input_blobs))
        {
            let outer = outer.read();
            let src = outer
                .get::<CudaTensor>()
                .ok_or_else(|| CudaError::BlobTypeMismatch {
                    name: name.clone(),
                    expected: "CudaTensor",
                })?;
            let mut local = local.write();
            let dst = local.get_mut_or_default::<HostTensor>();
            // SAFETY: both tensors are owned by workspace blobs that outlive
            // the synchronize below, and nothing else runs on this thread.
            unsafe { dst.copy_using(src, &ctx)? };
        }

        if !ctx.synchronize() {
            return Err(CudaError::AsyncFault {
                device: self.device,
                message: "staging inputs to host failed".to_string(),
            });
        }

        if !self.base_op.run() {
            error!(
                op = %self.def.op_type,
                def = %self.def.debug_string(),
                "Base op run failed in CudaFallbackOp"
            );
            return Ok(false);
        }

        for (name, (outer, local)) in self
            .def
            .outputs
            .iter()
            .zip(self.outputs.iter().zip(&self.local_output_blobs))
        {
            let local = local.read();
            let src = local
                .get::<HostTensor>()
                .ok_or_else(|| CudaError::BlobTypeMismatch {
                    name: name.clone(),
                    expected: "HostTensor",
                })?;
            let mut outer = outer.write();
            let dst = outer.get_mut_or_default::<CudaTensor>();
            // SAFETY: the source lives in the private workspace, which only
            // this adapter touches; `ctx` synchronizes when dropped below.
            unsafe { dst.copy_using(src, &ctx)? };
        }
        Ok(true)
    }
}

impl<Op: HostOperator> Operator for CudaFallbackOp<Op> {
    fn def(&self) -> &OperatorDef {
        &self.def
    }

    fn run(&mut self) -> bool {
        match self.run_staged() {
            Ok(ok) => ok,
            Err(e) => {
                error!(op = %self.def.op_type, device = self.device, error = %e, "fallback operator failed");
                false
            }
        }
    }
}

impl<Op: HostOperator> fmt::Debug for CudaFallbackOp<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaFallbackOp")
            .field("op_type", &self.def.op_type)
            .field("device", &self.device)
            .field("inputs", &self.def.inputs)
            .field("outputs", &self.def.outputs)
            .finish()
    }
}
