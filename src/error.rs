// Error taxonomy for the fusion pipeline
//
// Per the error-handling design, only configuration errors and resource
// exhaustion are surfaced to callers as `Result`. Transient pipeline
// pressure (short ring reads/writes) and upstream capture loss are
// absorbed locally -- they are logged through `fusion_utils::log`, never
// returned.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("unsupported output resolution {width}x{height}")]
    UnsupportedResolution { width: u32, height: u32 },

    #[error("invalid option `{name}`: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("registration requires at least 6 control points, got {0}")]
    TooFewControlPoints(usize),

    #[error("control point file `{0}` could not be parsed: {1}")]
    ControlPointParse(String, String),

    #[error("interpolation table file `{0}` could not be parsed: {1}")]
    TableParse(String, String),

    #[error("buffer of length {actual} is too small for {width}x{height} stride {stride} ({expected} bytes required)")]
    BufferTooSmall {
        width: usize,
        height: usize,
        stride: usize,
        expected: usize,
        actual: usize,
    },

    #[error("affine system is singular and could not be solved")]
    SingularAffineSystem,

    #[error("fusion pipeline already started")]
    AlreadyStarted,

    #[error("failed to spawn pipeline worker `{0}`: {1}")]
    WorkerSpawn(String, std::io::Error),

    #[error("i/o error on `{0}`: {1}")]
    Io(String, std::io::Error),
}

pub type Result<T> = anyhow::Result<T>;
