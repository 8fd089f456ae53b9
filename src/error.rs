//! flashgrad error types

/// flashgrad result type
pub type Result<T> = std::result::Result<T, Error>;

/// flashgrad errors
///
/// Every variant except `Numr` is a launch-time failure: it is raised before
/// any tile is processed and leaves outputs and workspace untouched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations (dropout mask generation)
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Kernel configuration is inconsistent with itself or with the launch
    #[error("invalid kernel configuration: {reason}")]
    InvalidConfig {
        /// Description of the conflict
        reason: String,
    },

    /// Base address or stride not aligned to the vector-access width
    #[error("{tensor}: {what} = {value} is not a multiple of {alignment}")]
    Misaligned {
        /// Tensor name
        tensor: &'static str,
        /// Which stride, or the base address
        what: &'static str,
        /// Offending value, in elements (bytes for a base address)
        value: usize,
        /// Required alignment, in the unit of `value`
        alignment: usize,
    },

    /// A strided view addresses past the end of its buffer
    #[error("{tensor}: view needs {required} elements but buffer holds {len}")]
    OutOfBounds {
        /// Tensor name
        tensor: &'static str,
        /// Elements addressed by the view
        required: usize,
        /// Elements available
        len: usize,
    },

    /// Caller-provided spill workspace is smaller than the documented size
    #[error("workspace too small: need {required} f32 elements, got {got}")]
    WorkspaceTooSmall {
        /// Required number of f32 elements
        required: usize,
        /// Provided number of f32 elements
        got: usize,
    },
}
