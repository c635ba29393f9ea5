//! Native method registry and the handlers installed by default.
//!
//! A native handler stands in for any method without a code item. It is
//! looked up by qualified name, `pkg/Class.method`, receives the call's
//! arguments (receiver first, wide arguments as single `Value::Wide`) and
//! returns the value a bytecode method would have returned. Handlers reach
//! the heap through a `NativeContext`, which collects before an allocation
//! that would not fit, the same way bytecode allocation does.
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, LazyLock, Mutex};

use log::debug;
use regex::Regex;

use crate::config::DeviceInfo;
use crate::error::RuntimeError;
use crate::gc::GarbageCollector;
use crate::heap::{Heap, ObjectId, ObjectKind, Value};
use crate::program::{binary_name, STRING_DESCRIPTOR};

pub type NativeResult = Result<Option<Value>, RuntimeError>;
pub type NativeHandler = Box<dyn FnMut(&mut NativeContext<'_>, &[Value]) -> NativeResult + Send>;
/// Sink `PrintStream` natives write to.
pub type Console = Arc<Mutex<dyn Write + Send>>;

static NATIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][\w$]*(?:/[A-Za-z_$][\w$]*)*\.(?:<init>|[A-Za-z_$][\w$]*)$")
        .expect("static regex")
});

/// Heap access for the duration of one native call.
pub struct NativeContext<'a> {
    heap: &'a mut Heap,
    gc: &'a mut GarbageCollector,
    // Live frames, the call's arguments and everything allocated so far.
    roots: Vec<ObjectId>,
}

impl<'a> NativeContext<'a> {
    pub fn new(heap: &'a mut Heap, gc: &'a mut GarbageCollector, roots: Vec<ObjectId>) -> Self {
        Self { heap, gc, roots }
    }

    pub fn heap(&self) -> &Heap {
        self.heap
    }

    /// Allocates, collecting first when the object would not fit.
    pub fn allocate(&mut self, class: &str, kind: ObjectKind) -> Result<ObjectId, RuntimeError> {
        if !self.heap.fits(kind.estimated_size()) {
            debug!(target: "gc", "native allocation of {} needs a collection", binary_name(class));
            self.gc.collect(self.heap, self.roots.iter().copied());
        }
        let id = self.heap.allocate(class, kind)?;
        self.roots.push(id);
        Ok(id)
    }

    pub fn allocate_string(&mut self, s: &str) -> Result<ObjectId, RuntimeError> {
        self.allocate(STRING_DESCRIPTOR, ObjectKind::Str(s.to_string()))
    }
}

#[derive(Default)]
pub struct NativeRegistry {
    handlers: HashMap<String, NativeHandler>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `name`, replacing any previous binding.
    pub fn register(&mut self, name: &str, handler: NativeHandler) -> Result<(), RuntimeError> {
        if !NATIVE_NAME.is_match(name) {
            return Err(RuntimeError::InvalidNativeName(name.to_string()));
        }
        debug!(target: "runtime", "registered native {}", name);
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NativeHandler> {
        self.handlers.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("NativeRegistry").field("handlers", &names).finish()
    }
}

/// Host rendering of a value, as `PrintStream.print` shows it.
pub fn render(heap: &Heap, value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Int(v) => v.to_string(),
        Value::Wide(v) => v.to_string(),
        Value::Object(id) => match heap.get(*id) {
            Some(object) => match &object.kind {
                ObjectKind::Str(s) => s.clone(),
                ObjectKind::Class(name) => format!("class {}", binary_name(name).replace('/', ".")),
                ObjectKind::Throwable { message } => {
                    format!("{}: {}", binary_name(&object.class).replace('/', "."), message)
                }
                _ => format!("{}{}", binary_name(&object.class).replace('/', "."), id),
            },
            None => format!("<freed {}>", id),
        },
    }
}

fn print_handler(console: Console, name: &'static str, newline: bool) -> NativeHandler {
    Box::new(move |ctx, args| {
        // args[0] is the stream itself.
        let text = args.get(1).map(|v| render(ctx.heap(), v)).unwrap_or_default();
        let mut out = console.lock().map_err(|_| RuntimeError::NativeFailure {
            name: name.to_string(),
            reason: "console lock poisoned".into(),
        })?;
        let written = if newline {
            writeln!(out, "{}", text)
        } else {
            write!(out, "{}", text)
        };
        written.map_err(|err| RuntimeError::NativeFailure {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
        Ok(None)
    })
}

fn string_handler(value: String) -> NativeHandler {
    Box::new(move |ctx, _| Ok(Some(Value::Object(ctx.allocate_string(&value)?))))
}

/// Installs the handlers every runtime starts with.
pub fn install_builtins(
    registry: &mut NativeRegistry,
    device: &DeviceInfo,
    console: Console,
) -> Result<(), RuntimeError> {
    registry.register("java/lang/Object.<init>", Box::new(|_, _| Ok(None)))?;
    registry.register(
        "java/io/PrintStream.println",
        print_handler(Arc::clone(&console), "java/io/PrintStream.println", true),
    )?;
    registry.register(
        "java/io/PrintStream.print",
        print_handler(console, "java/io/PrintStream.print", false),
    )?;
    registry.register(
        "java/lang/String.length",
        Box::new(|ctx, args| {
            let len = args
                .first()
                .and_then(Value::as_object)
                .and_then(|id| ctx.heap().string(id))
                .map(|s| s.encode_utf16().count() as i32)
                .ok_or_else(|| RuntimeError::NativeFailure {
                    name: "java/lang/String.length".into(),
                    reason: "receiver is not a string".into(),
                })?;
            Ok(Some(Value::Int(len)))
        }),
    )?;
    registry.register(
        "android/os/Build.getDevice",
        string_handler(device.device_name.clone()),
    )?;
    registry.register("android/os/Build.getModel", string_handler(device.model.clone()))?;
    registry.register(
        "android/content/Context.getFilesDir",
        string_handler(device.files_dir.clone()),
    )?;
    Ok(())
}
