use std::collections::HashSet;

use fuser_rs::backend::spec::{
    BackendError, BackendResult, Function, ParameterKind, Program, SpecErrorCode,
};

use crate::cpu::{check_inputs, interpret, CpuTensor, ExecutionMode};
use crate::fused::FusedKernel;

/// Validated program ready to run, optionally with a fused kernel.
pub struct CompiledPlan {
    function: Function,
    kernel: Option<FusedKernel>,
}

impl CompiledPlan {
    pub fn compile(program: &Program, mode: ExecutionMode) -> BackendResult<Self> {
        let function = program.entry_function()?.clone();
        validate_function(&function)?;
        let kernel = match mode {
            ExecutionMode::Fused => {
                let kernel = FusedKernel::build(&function);
                if kernel.is_none() {
                    tracing::debug!(
                        function = %function.name,
                        "program has reductions or size queries, using interpreter"
                    );
                }
                kernel
            }
            ExecutionMode::Interpreted => None,
        };
        Ok(Self { function, kernel })
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn is_fused(&self) -> bool {
        self.kernel.is_some()
    }

    pub fn execute(&self, inputs: &[CpuTensor]) -> BackendResult<Vec<CpuTensor>> {
        check_inputs(&self.function, inputs)?;
        if let Some(kernel) = &self.kernel {
            if let Some(results) = kernel.execute(inputs)? {
                return Ok(results);
            }
            tracing::trace!("input shapes defeat the fused kernel, interpreting");
        }
        interpret(&self.function, inputs)
    }
}

/// Structural checks: operands defined before use, results and aliases in range.
fn validate_function(function: &Function) -> BackendResult<()> {
    if function.parameters.len() != function.parameter_ids.len()
        || function.results.len() != function.result_ids.len()
    {
        return Err(BackendError::spec(
            SpecErrorCode::ArityMismatch,
            format!("function @{} has inconsistent signatures", function.name),
        ));
    }
    let mut defined: HashSet<_> = function.parameter_ids.iter().copied().collect();
    for instruction in &function.body {
        if let Some(missing) = instruction
            .operands
            .iter()
            .find(|operand| !defined.contains(operand))
        {
            return Err(BackendError::spec(
                SpecErrorCode::UnknownValue,
                format!("%{} used by %{} before definition", missing.0, instruction.id.0),
            ));
        }
        if !defined.insert(instruction.id) {
            return Err(BackendError::spec(
                SpecErrorCode::UnknownValue,
                format!("%{} defined twice", instruction.id.0),
            ));
        }
    }
    if let Some(missing) = function.result_ids.iter().find(|id| !defined.contains(id)) {
        return Err(BackendError::spec(
            SpecErrorCode::UnknownValue,
            format!("result %{} is not defined", missing.0),
        ));
    }
    for alias in &function.aliases {
        let valid = alias.result < function.result_ids.len()
            && function
                .parameters
                .get(alias.parameter)
                .is_some_and(|param| param.kind == ParameterKind::Tensor);
        if !valid {
            return Err(BackendError::spec(
                SpecErrorCode::InvalidAlias,
                format!("{alias:?}"),
            ));
        }
    }
    Ok(())
}
