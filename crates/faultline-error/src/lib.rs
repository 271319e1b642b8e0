//! Error taxonomy for the faultline engine.
//!
//! Errors fall into the classes of [`ErrorClass`]: configuration mistakes are
//! rejected before any kernel resource is touched, resource failures unwind
//! whatever was acquired, budget and invariant failures end the handler
//! thread, and protocol failures (talking to an instance that is shutting
//! down) are soft and reported to the caller.

use std::io;

use thiserror::Error;

/// Primary error type for faultline operations.
#[derive(Error, Debug)]
pub enum FaultError {
    // === Configuration Errors ===
    /// Element stride must be at least one byte.
    #[error("invalid stride {stride}: must be at least 1 byte")]
    InvalidStride { stride: u32 },

    /// The high watermark must be strictly above the low watermark.
    #[error("invalid memory limits: high watermark {high} must exceed low watermark {low}")]
    InvalidWatermarks { high: usize, low: usize },

    /// An object with neither header nor body cannot be mapped.
    #[error("object has no header and no elements")]
    EmptyObject,

    /// The object's reserved range would not fit the address space.
    #[error(
        "object of {element_count} elements of {stride} bytes behind a {header_size}-byte header is too large"
    )]
    ObjectTooLarge {
        header_size: u64,
        element_count: u64,
        stride: u32,
    },

    /// Objects need a population callback before they can be created.
    #[error("object configuration has no populate function")]
    MissingPopulateFunction,

    /// Memory limits may only change before the handler starts.
    #[error("memory limits can only be set before init")]
    LimitsAfterInit,

    /// `init` was called on a running or stopped instance.
    #[error("instance already initialized")]
    AlreadyInitialized,

    /// The instance has not been started with `init`.
    #[error("instance not initialized")]
    NotInitialized,

    // === Resource Errors ===
    /// A kernel resource could not be acquired or released.
    #[error("{op} failed: {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Plain I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // === Budget Errors ===
    /// A single chunk is larger than the whole eviction budget.
    #[error("chunk of {chunk} bytes exceeds the high watermark of {high} bytes")]
    ChunkExceedsBudget { chunk: usize, high: usize },

    /// Every resident chunk was reclaimed and there is still not enough room.
    #[error(
        "eviction ring exhausted: need {needed} bytes with {resident} resident, low watermark {low}"
    )]
    BudgetExhausted {
        needed: usize,
        resident: usize,
        low: usize,
    },

    // === Protocol Errors ===
    /// The instance is shutting down or already stopped.
    #[error("instance is shutting down")]
    ShuttingDown,

    /// A request named an object the handler does not know.
    #[error("unknown object {id}")]
    UnknownObject { id: u64 },

    // === Invariant Violations ===
    /// A page fault arrived for an address no live object owns.
    #[error("page fault at {address:#x} does not belong to any object")]
    UnknownFaultAddress { address: usize },

    /// Internal bookkeeping is inconsistent.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    // === Population Errors ===
    /// The population callback reported failure.
    #[error("populate callback failed for elements {start}..{end} with code {code}")]
    Populate { start: u64, end: u64, code: i32 },

    /// The handler thread panicked instead of returning.
    #[error("fault handler thread panicked")]
    HandlerPanicked,
}

/// Coarse classification of a [`FaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Configuration,
    Resource,
    Budget,
    Protocol,
    Invariant,
    Populate,
}

/// Stable status codes handed to the binding layer.
///
/// Zero is success; every failure is negative so callers can test `< 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Config = -1,
    Resource = -2,
    Budget = -3,
    ShuttingDown = -4,
    UnknownObject = -5,
    Invariant = -6,
    Populate = -7,
    Misuse = -8,
}

impl FaultError {
    /// Which part of the taxonomy this error belongs to.
    #[allow(clippy::match_same_arms)]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidStride { .. }
            | Self::InvalidWatermarks { .. }
            | Self::EmptyObject
            | Self::ObjectTooLarge { .. }
            | Self::MissingPopulateFunction
            | Self::LimitsAfterInit
            | Self::AlreadyInitialized
            | Self::NotInitialized => ErrorClass::Configuration,
            Self::Resource { .. } | Self::Io(_) => ErrorClass::Resource,
            Self::ChunkExceedsBudget { .. } | Self::BudgetExhausted { .. } => ErrorClass::Budget,
            Self::ShuttingDown | Self::UnknownObject { .. } => ErrorClass::Protocol,
            Self::UnknownFaultAddress { .. } | Self::Invariant(_) | Self::HandlerPanicked => {
                ErrorClass::Invariant
            }
            Self::Populate { .. } => ErrorClass::Populate,
        }
    }

    /// Map this error to the status code reported through the C surface.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::LimitsAfterInit | Self::AlreadyInitialized | Self::NotInitialized => {
                ErrorCode::Misuse
            }
            Self::ShuttingDown => ErrorCode::ShuttingDown,
            Self::UnknownObject { .. } => ErrorCode::UnknownObject,
            _ => match self.class() {
                ErrorClass::Configuration => ErrorCode::Config,
                ErrorClass::Resource => ErrorCode::Resource,
                ErrorClass::Budget => ErrorCode::Budget,
                ErrorClass::Protocol => ErrorCode::ShuttingDown,
                ErrorClass::Invariant => ErrorCode::Invariant,
                ErrorClass::Populate => ErrorCode::Populate,
            },
        }
    }

    /// Integer form of [`Self::error_code`].
    pub const fn status_code(&self) -> i32 {
        self.error_code() as i32
    }

    /// Whether this error ends the handler thread when raised there.
    ///
    /// `ChunkExceedsBudget` is soft when raised by allocate; on the fault
    /// path the handler escalates any budget error regardless.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Budget | ErrorClass::Invariant | ErrorClass::Populate
        )
    }

    /// Whether the caller should fall back to local cleanup instead of
    /// treating this as a failure.
    pub const fn is_soft(&self) -> bool {
        matches!(self, Self::ShuttingDown)
    }

    /// Wrap an OS error raised by the named operation.
    pub fn resource(op: &'static str, source: impl Into<io::Error>) -> Self {
        Self::Resource {
            op,
            source: source.into(),
        }
    }

    /// Create an invariant-violation error.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}

/// Copies rebuild wrapped I/O errors from their OS code, or from kind and
/// message when there is none, so the class and status code always survive.
impl Clone for FaultError {
    fn clone(&self) -> Self {
        match self {
            Self::InvalidStride { stride } => Self::InvalidStride { stride: *stride },
            Self::InvalidWatermarks { high, low } => Self::InvalidWatermarks {
                high: *high,
                low: *low,
            },
            Self::EmptyObject => Self::EmptyObject,
            Self::ObjectTooLarge {
                header_size,
                element_count,
                stride,
            } => Self::ObjectTooLarge {
                header_size: *header_size,
                element_count: *element_count,
                stride: *stride,
            },
            Self::MissingPopulateFunction => Self::MissingPopulateFunction,
            Self::LimitsAfterInit => Self::LimitsAfterInit,
            Self::AlreadyInitialized => Self::AlreadyInitialized,
            Self::NotInitialized => Self::NotInitialized,
            Self::Resource { op, source } => Self::Resource {
                op,
                source: clone_io(source),
            },
            Self::Io(e) => Self::Io(clone_io(e)),
            Self::ChunkExceedsBudget { chunk, high } => Self::ChunkExceedsBudget {
                chunk: *chunk,
                high: *high,
            },
            Self::BudgetExhausted {
                needed,
                resident,
                low,
            } => Self::BudgetExhausted {
                needed: *needed,
                resident: *resident,
                low: *low,
            },
            Self::ShuttingDown => Self::ShuttingDown,
            Self::UnknownObject { id } => Self::UnknownObject { id: *id },
            Self::UnknownFaultAddress { address } => Self::UnknownFaultAddress { address: *address },
            Self::Invariant(msg) => Self::Invariant(msg.clone()),
            Self::Populate { start, end, code } => Self::Populate {
                start: *start,
                end: *end,
                code: *code,
            },
            Self::HandlerPanicked => Self::HandlerPanicked,
        }
    }
}

fn clone_io(e: &io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(e.kind(), e.to_string()),
    }
}

/// Result type alias using `FaultError`.
pub type Result<T> = std::result::Result<T, FaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = FaultError::InvalidWatermarks { high: 1, low: 2 };
        assert_eq!(
            err.to_string(),
            "invalid memory limits: high watermark 1 must exceed low watermark 2"
        );

        let err = FaultError::UnknownFaultAddress { address: 0x7f00 };
        assert_eq!(
            err.to_string(),
            "page fault at 0x7f00 does not belong to any object"
        );
    }

    #[test]
    fn resource_display_names_operation() {
        let err = FaultError::resource("userfaultfd", io::ErrorKind::PermissionDenied);
        assert!(err.to_string().starts_with("userfaultfd failed: "));
        assert_eq!(err.class(), ErrorClass::Resource);
    }

    #[test]
    fn classes() {
        assert_eq!(
            FaultError::InvalidStride { stride: 0 }.class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            FaultError::ChunkExceedsBudget { chunk: 2, high: 1 }.class(),
            ErrorClass::Budget
        );
        assert_eq!(FaultError::ShuttingDown.class(), ErrorClass::Protocol);
        assert_eq!(FaultError::invariant("x").class(), ErrorClass::Invariant);
        assert_eq!(
            FaultError::Populate {
                start: 0,
                end: 1,
                code: 3
            }
            .class(),
            ErrorClass::Populate
        );
    }

    #[test]
    fn fatal_and_soft() {
        assert!(FaultError::invariant("bad").is_fatal());
        assert!(
            FaultError::BudgetExhausted {
                needed: 1,
                resident: 0,
                low: 0
            }
            .is_fatal()
        );
        assert!(!FaultError::ShuttingDown.is_fatal());
        assert!(FaultError::ShuttingDown.is_soft());
        assert!(!FaultError::EmptyObject.is_soft());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(FaultError::InvalidStride { stride: 0 }.status_code(), -1);
        assert_eq!(FaultError::ShuttingDown.status_code(), -4);
        assert_eq!(FaultError::NotInitialized.status_code(), -8);
        assert_eq!(FaultError::UnknownObject { id: 9 }.status_code(), -5);
        assert_eq!(FaultError::HandlerPanicked.status_code(), -6);
    }

    #[test]
    fn too_large_is_configuration() {
        let err = FaultError::ObjectTooLarge {
            header_size: 0,
            element_count: u64::MAX,
            stride: 8,
        };
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert_eq!(err.status_code(), -1);
    }

    #[test]
    fn clone_keeps_class_and_message() {
        let errs = [
            // EPERM
            FaultError::resource("userfaultfd", io::Error::from_raw_os_error(1)),
            FaultError::Io(io::Error::other("disk gone")),
            FaultError::BudgetExhausted {
                needed: 8192,
                resident: 0,
                low: 4096,
            },
            FaultError::Populate {
                start: 0,
                end: 512,
                code: 7,
            },
            FaultError::invariant("ring out of sync"),
        ];
        for err in &errs {
            let copy = err.clone();
            assert_eq!(copy.class(), err.class());
            assert_eq!(copy.error_code(), err.error_code());
            assert_eq!(copy.to_string(), err.to_string());
        }
    }

    #[test]
    fn io_error_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: FaultError = io_err.into();
        assert!(matches!(err, FaultError::Io(_)));
        assert_eq!(err.error_code(), ErrorCode::Resource);
    }
}
