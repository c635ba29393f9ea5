//! Error types shared by the parser, the interpreter and the runtime.
use thiserror::Error;

/// Malformed code image. Any of these aborts the whole parse, no partial
/// image is ever handed out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad magic {0:02x?}, expected a dex\\n0NN\\0 prefix")]
    BadMagic([u8; 8]),

    #[error("unsupported endian tag {0:#010x}")]
    BadEndianTag(u32),

    #[error("truncated read of {needed} bytes at offset {offset:#x}")]
    Truncated { offset: usize, needed: usize },

    #[error("{table} index {index} out of range (table size {size})")]
    IndexOutOfRange {
        table: &'static str,
        index: u32,
        size: usize,
    },

    #[error("malformed string data at offset {offset:#x}")]
    InvalidString { offset: usize },

    #[error("uleb128 value at offset {offset:#x} does not fit in 32 bits")]
    Uleb128Overflow { offset: usize },

    #[error("invalid type descriptor {0:?}")]
    InvalidDescriptor(String),

    #[error("invalid code item at offset {offset:#x}: {reason}")]
    InvalidCodeItem { offset: usize, reason: &'static str },

    #[error("checksum mismatch: header says {expected:#010x}, data hashes to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("header file size {declared} exceeds buffer length {actual}")]
    FileSizeMismatch { declared: u32, actual: usize },
}

/// Failure to bring a code image into the runtime.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// `RuntimeError` covers every way a run request can fail. Application
/// level exceptions only show up here once no handler caught them.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("no `public static void main(String[])` method in the image")]
    MissingEntryPoint,

    #[error("no native handler registered for {0}")]
    UnresolvedNative(String),

    #[error("uncaught exception {class}: {message}")]
    UncaughtException { class: String, message: String },

    #[error("unknown opcode {opcode:#04x} at code unit {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("out of memory: requested {requested} bytes with {used}/{capacity} in use")]
    OutOfMemory {
        requested: usize,
        used: usize,
        capacity: usize,
    },

    #[error("instruction at code unit {offset} runs past the end of the code")]
    TruncatedInstruction { offset: usize },

    #[error("register v{register} out of range for a frame of {size} registers")]
    InvalidRegister { register: usize, size: usize },

    #[error("branch from code unit {from} to {target} leaves the method")]
    InvalidBranchTarget { from: usize, target: i64 },

    #[error("{instruction} expected {expected} in v{register}")]
    TypeMismatch {
        instruction: &'static str,
        register: usize,
        expected: &'static str,
    },

    #[error("call to {method} passes {given} argument words, callee takes {expected}")]
    ArgumentMismatch {
        method: String,
        given: usize,
        expected: usize,
    },

    #[error("{table} index {index} out of range")]
    BadIndex { table: &'static str, index: u32 },

    #[error("invalid native method name {0:?}, expected `pkg/Class.method`")]
    InvalidNativeName(String),

    #[error("native {name} failed: {reason}")]
    NativeFailure { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<FormatError> for RuntimeError {
    fn from(err: FormatError) -> Self {
        RuntimeError::Load(LoadError::Format(err))
    }
}
