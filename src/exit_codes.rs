use crate::error::{DrError, ErrorClass};

/// Process exit codes of the `drove` binary.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    /// A service call failed or the DR job did not complete.
    pub const OPERATIONAL_FAILURE: i32 = 1;
    /// A precondition, trace, or postcondition check failed.
    pub const VALIDATION_FAILURE: i32 = 2;
    /// Bad input, missing catalog entry, or unsupported operation.
    pub const CONFIGURATION_FAILURE: i32 = 3;
}

pub fn for_class(class: ErrorClass) -> i32 {
    match class {
        ErrorClass::Validation => exit::VALIDATION_FAILURE,
        ErrorClass::Operational => exit::OPERATIONAL_FAILURE,
        ErrorClass::Configuration | ErrorClass::Unsupported => exit::CONFIGURATION_FAILURE,
    }
}

pub fn for_error(err: &DrError) -> i32 {
    for_class(err.class())
}

/// Errors outside the engine come from unreadable or malformed input files.
pub fn for_anyhow(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DrError>() {
        Some(e) => for_error(e),
        None => exit::CONFIGURATION_FAILURE,
    }
}
