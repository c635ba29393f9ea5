//! Runtime tunables.
use crate::error::RuntimeError;

/// Settings for a `Runtime`. Build with struct update syntax:
///
/// ```
/// use droidbrew::config::VmConfig;
///
/// let config = VmConfig {
///     jit_threshold: 3,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Heap capacity in bytes.
    pub heap_capacity: usize,
    /// Fraction of `heap_capacity` in use that triggers a collection.
    pub gc_threshold: f64,
    /// Executed instructions between two `collect_if_needed` checks.
    pub gc_interval: u64,
    pub jit_enabled: bool,
    /// Invocations before a method is promoted to the compiled tier.
    pub jit_threshold: u64,
    /// Frames on the call stack before `StackOverflowError` is raised.
    pub max_call_depth: usize,
    /// Check the adler32 checksum of every loaded image.
    pub verify_checksum: bool,
    /// Record every invocation in the call trace.
    pub trace_calls: bool,
    pub device: DeviceInfo,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            heap_capacity: 1024 * 1024,
            gc_threshold: 0.7,
            gc_interval: 100,
            jit_enabled: true,
            jit_threshold: 10,
            max_call_depth: 4096,
            verify_checksum: false,
            trace_calls: false,
            device: DeviceInfo::default(),
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.heap_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "heap capacity must be non-zero".into(),
            ));
        }
        if !(self.gc_threshold > 0.0 && self.gc_threshold <= 1.0) {
            return Err(RuntimeError::InvalidConfig(format!(
                "gc threshold {} must be in (0, 1]",
                self.gc_threshold
            )));
        }
        if self.gc_interval == 0 {
            return Err(RuntimeError::InvalidConfig(
                "gc interval must be at least one instruction".into(),
            ));
        }
        if self.jit_threshold == 0 {
            return Err(RuntimeError::InvalidConfig(
                "jit threshold must be at least one invocation".into(),
            ));
        }
        if self.max_call_depth == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max call depth must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Identity the built-in `android/os/Build` natives report.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_name: String,
    pub model: String,
    pub files_dir: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            device_name: "VirtualPhone".into(),
            model: "droidbrew virtual device".into(),
            files_dir: "/data/data/com.example.app/files".into(),
        }
    }
}
