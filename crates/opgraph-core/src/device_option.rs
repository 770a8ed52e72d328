//! Device placement and operator descriptors.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Kind of device an operator is declared to run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Host CPU.
    #[default]
    Cpu,
    /// CUDA GPU.
    Cuda,
}

/// Placement descriptor for an operator.
///
/// Optional fields mirror presence-checked message fields: an unset GPU id
/// means "the process default device", an unset seed means "derive one".
///
/// # Example
///
/// ```
/// use opgraph_core::{DeviceOption, DeviceType};
///
/// let option = DeviceOption::cuda(1).with_random_seed(7);
/// assert_eq!(option.device_type, DeviceType::Cuda);
/// assert!(option.has_cuda_gpu_id());
/// assert_eq!(option.random_seed, Some(7));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceOption {
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuda_gpu_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u32>,
}

impl DeviceOption {
    /// Host placement with no seed.
    pub fn cpu() -> Self {
        Self::default()
    }

    /// CUDA placement on an explicit device.
    pub fn cuda(gpu_id: usize) -> Self {
        Self {
            device_type: DeviceType::Cuda,
            cuda_gpu_id: Some(gpu_id),
            random_seed: None,
        }
    }

    /// CUDA placement on the process default device.
    pub fn cuda_default() -> Self {
        Self {
            device_type: DeviceType::Cuda,
            cuda_gpu_id: None,
            random_seed: None,
        }
    }

    #[must_use]
    pub fn with_random_seed(mut self, seed: u32) -> Self {
        self.random_seed = Some(seed);
        self
    }

    #[inline]
    pub fn has_cuda_gpu_id(&self) -> bool {
        self.cuda_gpu_id.is_some()
    }

    #[inline]
    pub fn has_random_seed(&self) -> bool {
        self.random_seed.is_some()
    }
}

/// Operator descriptor: type, named inputs/outputs and placement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OperatorDef {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub device_option: DeviceOption,
}

impl OperatorDef {
    /// Create a descriptor with host placement.
    pub fn new<I, O, S1, S2>(op_type: impl Into<String>, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator<Item = S1>,
        O: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            name: String::new(),
            op_type: op_type.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            device_option: DeviceOption::cpu(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_device_option(mut self, option: DeviceOption) -> Self {
        self.device_option = option;
        self
    }

    /// Fail unless the descriptor is placed on `expected`.
    pub fn expect_device_type(&self, expected: DeviceType) -> CoreResult<()> {
        if self.device_option.device_type != expected {
            return Err(CoreError::InvalidOperatorDef(format!(
                "operator '{}' ({}) is placed on {:?}, expected {:?}",
                self.name, self.op_type, self.device_option.device_type, expected
            )));
        }
        Ok(())
    }

    /// Multi-line human-readable rendering for diagnostics.
    pub fn debug_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_checks() {
        let option = DeviceOption::cuda_default();
        assert!(!option.has_cuda_gpu_id());
        assert!(!option.has_random_seed());

        let option = DeviceOption::cuda(3).with_random_seed(42);
        assert_eq!(option.cuda_gpu_id, Some(3));
        assert!(option.has_random_seed());
    }

    #[test]
    fn test_expect_device_type() {
        let def = OperatorDef::new("Add", ["A", "B"], ["C"]);
        assert!(def.expect_device_type(DeviceType::Cpu).is_ok());

        let err = def.expect_device_type(DeviceType::Cuda).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperatorDef(_)));
    }

    #[test]
    fn test_debug_string_mentions_io() {
        let def = OperatorDef::new("Add", ["A", "B"], ["C"])
            .with_name("add0")
            .with_device_option(DeviceOption::cuda(0));
        let text = def.debug_string();
        assert!(text.contains("\"op_type\": \"Add\""));
        assert!(text.contains("\"cuda\""));
        assert!(text.contains("add0"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let def: OperatorDef =
            serde_json::from_str(r#"{"op_type": "Relu", "inputs": ["X"], "outputs": ["Y"]}"#)
                .unwrap();
        assert_eq!(def.device_option, DeviceOption::cpu());
        assert!(def.name.is_empty());
    }
}
