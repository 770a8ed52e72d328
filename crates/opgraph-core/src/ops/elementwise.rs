//! Elementwise host operators.

use tracing::error;

use crate::device_option::OperatorDef;
use crate::error::{CoreError, CoreResult};
use crate::operator::{HostOperator, Operator, OperatorBase};
use crate::tensor::HostTensor;
use crate::workspace::{Blob, Workspace};

/// `C = A + B` over `f32` host tensors of identical shape.
#[derive(Debug)]
pub struct AddOp {
    base: OperatorBase,
}

impl AddOp {
    fn compute(&self) -> CoreResult<()> {
        // Inputs are read into an owned result before the output lock is
        // taken, so in-place use (C aliasing A or B) cannot deadlock.
        let (dims, sum) = {
            let a_guard = self.base.input(0).read();
            let b_guard = self.base.input(1).read();
            let a = host_tensor(&a_guard, &self.base.def().inputs[0])?;
            let b = host_tensor(&b_guard, &self.base.def().inputs[1])?;
            if a.dims() != b.dims() {
                return Err(CoreError::ShapeMismatch {
                    expected: a.dims().to_vec(),
                    actual: b.dims().to_vec(),
                });
            }
            let sum: Vec<f32> = a
                .data::<f32>()?
                .iter()
                .zip(b.data::<f32>()?)
                .map(|(x, y)| x + y)
                .collect();
            (a.dims().to_vec(), sum)
        };

        let mut out = self.base.output(0).write();
        *out.get_mut_or_default::<HostTensor>() = HostTensor::from_slice(&dims, &sum)?;
        Ok(())
    }
}

fn host_tensor<'a>(blob: &'a Blob, name: &str) -> CoreResult<&'a HostTensor> {
    blob.get::<HostTensor>()
        .ok_or_else(|| CoreError::BlobTypeMismatch {
            name: name.to_string(),
            expected: "HostTensor",
        })
}

impl Operator for AddOp {
    fn def(&self) -> &OperatorDef {
        self.base.def()
    }

    fn run(&mut self) -> bool {
        match self.compute() {
            Ok(()) => true,
            Err(e) => {
                error!(op = %self.base.def().op_type, error = %e, "AddOp failed");
                false
            }
        }
    }
}

impl HostOperator for AddOp {
    fn create(def: &OperatorDef, ws: &mut Workspace) -> CoreResult<Self> {
        if def.inputs.len() != 2 || def.outputs.len() != 1 {
            return Err(CoreError::InvalidOperatorDef(format!(
                "Add takes 2 inputs and 1 output, got {} and {}",
                def.inputs.len(),
                def.outputs.len()
            )));
        }
        Ok(Self {
            base: OperatorBase::new(def, ws)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_host_input(ws: &mut Workspace, name: &str, tensor: HostTensor) {
        ws.create_blob(name).write().set(tensor);
    }

    fn add_workspace(a: &[f32], b: &[f32]) -> Workspace {
        let mut ws = Workspace::new();
        set_host_input(&mut ws, "A", HostTensor::from_slice(&[a.len()], a).unwrap());
        set_host_input(&mut ws, "B", HostTensor::from_slice(&[b.len()], b).unwrap());
        ws
    }

    #[test]
    fn test_add() {
        let mut ws = add_workspace(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        let def = OperatorDef::new("Add", ["A", "B"], ["C"]);
        let mut op = AddOp::create(&def, &mut ws).unwrap();
        assert!(op.run());

        let c = ws.get_blob("C").unwrap();
        let guard = c.read();
        let tensor = guard.get::<HostTensor>().unwrap();
        assert_eq!(tensor.data::<f32>().unwrap(), &[5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_add_in_place() {
        let mut ws = add_workspace(&[1.0, 1.0], &[2.0, 3.0]);
        let def = OperatorDef::new("Add", ["A", "B"], ["A"]);
        let mut op = AddOp::create(&def, &mut ws).unwrap();
        assert!(op.run());
        let a = ws.get_blob("A").unwrap();
        assert_eq!(
            a.read().get::<HostTensor>().unwrap().to_vec::<f32>().unwrap(),
            vec![3.0, 4.0]
        );
    }

    #[test]
    fn test_add_shape_mismatch_fails_run() {
        let mut ws = add_workspace(&[1.0, 2.0], &[1.0, 2.0, 3.0]);
        let def = OperatorDef::new("Add", ["A", "B"], ["C"]);
        let mut op = AddOp::create(&def, &mut ws).unwrap();
        assert!(!op.run());
    }

    #[test]
    fn test_add_rejects_wrong_arity() {
        let mut ws = add_workspace(&[1.0], &[1.0]);
        let def = OperatorDef::new("Add", ["A"], ["C"]);
        assert!(matches!(
            AddOp::create(&def, &mut ws),
            Err(CoreError::InvalidOperatorDef(_))
        ));
    }

    #[test]
    fn test_add_non_tensor_input_fails_run() {
        let mut ws = add_workspace(&[1.0], &[1.0]);
        ws.get_blob("B").unwrap().write().set(String::from("oops"));
        let def = OperatorDef::new("Add", ["A", "B"], ["C"]);
        let mut op = AddOp::create(&def, &mut ws).unwrap();
        assert!(!op.run());
    }
}
