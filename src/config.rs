//! Run-time configuration of the Jacobian assembler.
use serde::{Deserialize, Serialize};

/// Switches recognized by [`JacobianAssembler`](crate::assembly::JacobianAssembler).
///
/// Both switches are off by default, which makes every call to `assemble` a full
/// relinearization of the system.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerSettings {
    /// Relinearize only those degrees of freedom that have changed "sufficiently" between
    /// two Newton iterations.
    pub enable_partial_relinearization: bool,
    /// Re-use the linearized system of equations at the first iteration of the next time step.
    pub enable_linearization_recycling: bool,
}

impl AssemblerSettings {
    pub fn with_partial_relinearization(mut self, enable: bool) -> Self {
        self.enable_partial_relinearization = enable;
        self
    }

    pub fn with_linearization_recycling(mut self, enable: bool) -> Self {
        self.enable_linearization_recycling = enable;
        self
    }
}
