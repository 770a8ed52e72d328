//! Operator capability and the shared input/output plumbing.

use crate::device_option::OperatorDef;
use crate::error::CoreResult;
use crate::workspace::{BlobRef, Workspace};

/// Anything the dispatch layer can run.
///
/// `run` reports success as a plain boolean: a `false` is an ordinary
/// operator failure that the caller may react to, not a crash.
pub trait Operator: Send {
    fn def(&self) -> &OperatorDef;

    fn run(&mut self) -> bool;

    fn input_size(&self) -> usize {
        self.def().inputs.len()
    }

    fn output_size(&self) -> usize {
        self.def().outputs.len()
    }
}

/// Host-only operator constructible against a workspace.
///
/// Construction resolves the operator's blobs once; after it returns, every
/// output the operator produces must exist in `ws`.
pub trait HostOperator: Operator + Sized {
    fn create(def: &OperatorDef, ws: &mut Workspace) -> CoreResult<Self>;
}

/// Resolved input and output blobs of an operator.
///
/// Inputs must already exist in the workspace; outputs are created.
#[derive(Debug)]
pub struct OperatorBase {
    def: OperatorDef,
    inputs: Vec<BlobRef>,
    outputs: Vec<BlobRef>,
}

impl OperatorBase {
    /// Resolve every input and create every output named by `def`.
    ///
    /// # Errors
    ///
    /// `CoreError::MissingBlob` for the first input not present in `ws`.
    pub fn new(def: &OperatorDef, ws: &mut Workspace) -> CoreResult<Self> {
        Self::with_outputs(def, ws, &def.outputs)
    }

    /// Like [`OperatorBase::new`] but creating only `outputs`, for operators
    /// that produce a subset of what the descriptor names.
    pub fn with_outputs(
        def: &OperatorDef,
        ws: &mut Workspace,
        outputs: &[String],
    ) -> CoreResult<Self> {
        let inputs = def
            .inputs
            .iter()
            .map(|name| ws.require_blob(name))
            .collect::<CoreResult<Vec<_>>>()?;
        let outputs = outputs.iter().map(|name| ws.create_blob(name)).collect();
        Ok(Self {
            def: def.clone(),
            inputs,
            outputs,
        })
    }

    #[inline]
    pub fn def(&self) -> &OperatorDef {
        &self.def
    }

    /// Input blob at `index`.
    ///
    /// # Panics
    ///
    /// If `index >= input_size()`.
    #[inline]
    pub fn input(&self, index: usize) -> &BlobRef {
        &self.inputs[index]
    }

    /// Output blob at `index`.
    ///
    /// # Panics
    ///
    /// If `index >= output_size()`.
    #[inline]
    pub fn output(&self, index: usize) -> &BlobRef {
        &self.outputs[index]
    }

    #[inline]
    pub fn input_size(&self) -> usize {
        self.inputs.len()
    }

    #[inline]
    pub fn output_size(&self) -> usize {
        self.outputs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn test_base_resolves_inputs_and_creates_outputs() {
        let mut ws = Workspace::new();
        ws.create_blob("X");
        let def = OperatorDef::new("Copy", ["X"], ["Y"]);

        let base = OperatorBase::new(&def, &mut ws).unwrap();
        assert_eq!(base.input_size(), 1);
        assert_eq!(base.output_size(), 1);
        assert!(ws.has_blob("Y"));
    }

    #[test]
    fn test_base_missing_input() {
        let mut ws = Workspace::new();
        let def = OperatorDef::new("Copy", ["X"], ["Y"]);
        let err = OperatorBase::new(&def, &mut ws).unwrap_err();
        assert!(matches!(err, CoreError::MissingBlob { name } if name == "X"));
        assert!(!ws.has_blob("Y"), "outputs must not be created on failure");
    }

    #[test]
    fn test_with_outputs_subset() {
        let mut ws = Workspace::new();
        let def = OperatorDef::new("Split", Vec::<String>::new(), ["P", "Q"]);
        let base = OperatorBase::with_outputs(&def, &mut ws, &def.outputs[..1]).unwrap();
        assert_eq!(base.output_size(), 1);
        assert!(ws.has_blob("P"));
        assert!(!ws.has_blob("Q"));
    }
}
