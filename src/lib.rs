pub mod bytecode;
pub mod classes;
pub mod config;
pub mod dex;
pub mod error;
pub mod gc;
pub mod heap;
pub mod interpreter;
pub mod jit;
pub mod natives;
pub mod profiler;
pub mod program;
pub mod runtime;
pub mod trace;

#[cfg(test)]
mod testing;

pub use config::{DeviceInfo, VmConfig};
pub use error::{FormatError, LoadError, RuntimeError};
pub use heap::{HeapStats, ObjectId, Value};
pub use natives::NativeContext;
pub use runtime::Runtime;
