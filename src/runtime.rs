//! The runtime owns every piece of VM state (loaded classes, heap,
//! collector, tiering cache, native registry, call trace) and exposes the
//! load and run entry points.
//!
//! Loading registers every class of an image by name, a later load of the
//! same class replaces the earlier definition. Running locates the entry
//! point of an image and hands it to an `Interpreter` borrowing the state
//! for the duration of the run.
use std::io;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::classes::ClassTable;
use crate::config::VmConfig;
use crate::dex::{verify_checksum, DexParser};
use crate::error::{LoadError, RuntimeError};
use crate::gc::{Collection, GarbageCollector, GcStats};
use crate::heap::{Heap, HeapStats, ObjectKind, Value};
use crate::interpreter::{Interpreter, VmContext};
use crate::jit::{JitCache, MethodStats};
use crate::natives::{install_builtins, Console, NativeContext, NativeRegistry, NativeResult};
use crate::program::{CodeImage, MethodKey};
use crate::trace::{CallRecord, TraceRecorder};

type Result<T> = std::result::Result<T, RuntimeError>;

const SYSTEM_CLASS: &str = "Ljava/lang/System;";
const PRINT_STREAM_CLASS: &str = "Ljava/io/PrintStream;";

pub struct Runtime {
    config: VmConfig,
    classes: ClassTable,
    heap: Heap,
    gc: GarbageCollector,
    jit: JitCache,
    natives: NativeRegistry,
    tracer: TraceRecorder,
}

impl Runtime {
    /// Creates a runtime whose `PrintStream` natives write to stdout.
    pub fn new(config: VmConfig) -> Result<Self> {
        let console: Console = Arc::new(Mutex::new(io::stdout()));
        Self::with_console(config, console)
    }

    pub fn with_console(config: VmConfig, console: Console) -> Result<Self> {
        config.validate()?;
        let mut natives = NativeRegistry::new();
        install_builtins(&mut natives, &config.device, console)?;
        let mut heap = Heap::new(config.heap_capacity);
        let out = heap.allocate(PRINT_STREAM_CLASS, ObjectKind::Instance { fields: Vec::new() })?;
        heap.set_static(SYSTEM_CLASS, "out", Value::Object(out));
        let mut tracer = TraceRecorder::new();
        if config.trace_calls {
            tracer.init();
        }
        info!(
            target: "runtime",
            "runtime ready: heap {} bytes, jit {} (threshold {})",
            config.heap_capacity,
            if config.jit_enabled { "on" } else { "off" },
            config.jit_threshold
        );
        Ok(Self {
            classes: ClassTable::new(),
            gc: GarbageCollector::new(config.gc_threshold),
            jit: JitCache::new(config.jit_threshold, config.jit_enabled),
            heap,
            natives,
            tracer,
            config,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Parses `bytes` and registers every class it defines.
    pub fn load(&mut self, bytes: &[u8]) -> std::result::Result<(), LoadError> {
        self.load_image(bytes).map(|_| ())
    }

    pub(crate) fn load_image(&mut self, bytes: &[u8]) -> std::result::Result<Arc<CodeImage>, LoadError> {
        if self.config.verify_checksum {
            verify_checksum(bytes)?;
        }
        let image = Arc::new(DexParser::parse(bytes)?);
        for replaced in self.classes.insert_image(&image) {
            self.jit.invalidate_class(&replaced);
        }
        info!(
            target: "runtime",
            "loaded {} classes ({} loaded in total)",
            image.classes.len(),
            self.classes.len()
        );
        Ok(image)
    }

    /// Loads `bytes` and runs its entry point with no arguments.
    pub fn run_entry_point(&mut self, bytes: &[u8]) -> Result<Option<Value>> {
        self.run_entry_point_with_args(bytes, &[])
    }

    /// Loads `bytes` and runs its entry point. `args` become the
    /// `String[]` parameter when the entry point takes one.
    pub fn run_entry_point_with_args(&mut self, bytes: &[u8], args: &[&str]) -> Result<Option<Value>> {
        let image = self.load_image(bytes)?;
        let method = image
            .find_entry_method()
            .ok_or(RuntimeError::MissingEntryPoint)?;
        let wants_args = method.code.as_ref().map_or(!args.is_empty(), |code| code.ins_size > 0);
        debug!(target: "runtime", "entering {}", method.key());

        let mut interpreter = self.interpreter();
        let argv = if wants_args {
            vec![interpreter.string_array(args)?]
        } else {
            Vec::new()
        };
        let result = interpreter.execute(method, image, &argv);
        debug!(
            target: "runtime",
            "run finished after {} instructions",
            interpreter.instructions_executed()
        );
        result
    }

    /// Interpreter borrowing this runtime's state.
    pub(crate) fn interpreter(&mut self) -> Interpreter<'_> {
        Interpreter::new(VmContext {
            config: &self.config,
            classes: &mut self.classes,
            heap: &mut self.heap,
            gc: &mut self.gc,
            jit: &mut self.jit,
            natives: &mut self.natives,
            tracer: &mut self.tracer,
        })
    }

    /// Binds a handler for a method without code, named `pkg/Class.method`.
    pub fn register_native<F>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: FnMut(&mut NativeContext<'_>, &[Value]) -> NativeResult + Send + 'static,
    {
        self.natives.register(name, Box::new(handler))
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    /// Collects with only static fields as roots. Only meaningful between
    /// runs, when no frame is live.
    pub fn collect(&mut self) -> Collection {
        self.gc.collect(&mut self.heap, std::iter::empty())
    }

    pub fn jit(&self) -> &JitCache {
        &self.jit
    }

    pub fn method_stats(&self, key: &MethodKey) -> Option<MethodStats> {
        self.jit.stats(key).cloned()
    }

    pub fn trace(&self) -> &[CallRecord] {
        self.tracer.records()
    }

    /// Renders the recorded call trace.
    pub fn trace_dump(&self) -> String {
        self.tracer.debug()
    }

    /// Host copy of a string value.
    pub fn string_value(&self, value: &Value) -> Option<String> {
        value
            .as_object()
            .and_then(|id| self.heap.string(id))
            .map(str::to_string)
    }
}
