//! Register-based interpreter for Dalvik bytecode.
//!
//! Calls never recurse on the host stack: an invocation pushes a `Frame`
//! onto an explicit stack and `step` always runs the topmost frame. A step
//! is either an exception check, when the frame has an exception pending,
//! or the fetch, decode and dispatch of one instruction. Dispatch produces
//! a `Flow` that advances or redirects the pc, pushes a callee, pops the
//! frame or records a new pending exception.
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::bytecode::{
    decode, ArithOp, CmpOp, Decoded, Dispatch, FieldKind, NumType, Op, RegKind, UnaryOp,
    FILL_ARRAY_DATA_PAYLOAD, PACKED_SWITCH_PAYLOAD, SPARSE_SWITCH_PAYLOAD,
};
use crate::classes::ClassTable;
use crate::config::VmConfig;
use crate::error::RuntimeError;
use crate::gc::{Collection, GarbageCollector};
use crate::heap::{Heap, ObjectId, ObjectKind, Value, OBJECT_HEADER_SIZE, SLOT_SIZE};
use crate::jit::{CompiledPlan, JitCache, Tier};
use crate::natives::{NativeContext, NativeRegistry};
use crate::program::{
    binary_name, CodeImage, CodeItem, MethodDef, MethodKey, Type, CLASS_DESCRIPTOR,
    STRING_DESCRIPTOR,
};
use crate::trace::{CallRecord, TraceRecorder};

type Result<T> = std::result::Result<T, RuntimeError>;

pub const ARITHMETIC_EXCEPTION: &str = "Ljava/lang/ArithmeticException;";
pub const CLASS_CAST_EXCEPTION: &str = "Ljava/lang/ClassCastException;";
pub const NULL_POINTER_EXCEPTION: &str = "Ljava/lang/NullPointerException;";
pub const ARRAY_INDEX_EXCEPTION: &str = "Ljava/lang/ArrayIndexOutOfBoundsException;";
pub const NEGATIVE_ARRAY_SIZE_EXCEPTION: &str = "Ljava/lang/NegativeArraySizeException;";
pub const NO_SUCH_FIELD_ERROR: &str = "Ljava/lang/NoSuchFieldError;";
pub const ILLEGAL_MONITOR_STATE_EXCEPTION: &str = "Ljava/lang/IllegalMonitorStateException;";
pub const STACK_OVERFLOW_ERROR: &str = "Ljava/lang/StackOverflowError;";

/// Activation record of one bytecode method.
#[derive(Debug)]
pub struct Frame {
    method: Arc<MethodDef>,
    image: Arc<CodeImage>,
    code: Arc<CodeItem>,
    plan: Option<Arc<CompiledPlan>>,
    registers: Vec<Value>,
    pc: usize,
    pending_exception: Option<ObjectId>,
    // Exception handed to the last handler entered, for `move-exception`.
    caught: Option<ObjectId>,
    // Width of the invoke the frame is suspended on.
    call_width: usize,
}

impl Frame {
    fn new(
        method: Arc<MethodDef>,
        image: Arc<CodeImage>,
        code: Arc<CodeItem>,
        plan: Option<Arc<CompiledPlan>>,
    ) -> Self {
        let registers = vec![Value::Null; code.registers_size as usize];
        Self {
            method,
            image,
            code,
            plan,
            registers,
            pc: 0,
            pending_exception: None,
            caught: None,
            call_width: 0,
        }
    }

    pub fn method(&self) -> &MethodDef {
        &self.method
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn registers(&self) -> &[Value] {
        &self.registers
    }

    pub fn pending_exception(&self) -> Option<ObjectId> {
        self.pending_exception
    }

    /// Whether the frame runs from a compiled plan.
    pub fn is_compiled(&self) -> bool {
        self.plan.is_some()
    }

    fn fetch(&self) -> Result<Decoded> {
        match self.plan.as_ref().and_then(|plan| plan.get(self.pc)) {
            Some(decoded) => Ok(decoded.clone()),
            None => decode(&self.code, self.pc),
        }
    }

    fn slot(&self, r: usize) -> Result<Value> {
        self.registers
            .get(r)
            .copied()
            .ok_or(RuntimeError::InvalidRegister {
                register: r,
                size: self.registers.len(),
            })
    }

    fn slot_mut(&mut self, r: usize) -> Result<&mut Value> {
        let size = self.registers.len();
        self.registers
            .get_mut(r)
            .ok_or(RuntimeError::InvalidRegister { register: r, size })
    }

    fn reg(&self, r: u16) -> Result<Value> {
        self.slot(r as usize)
    }

    fn set(&mut self, r: u16, value: Value) -> Result<()> {
        *self.slot_mut(r as usize)? = value;
        Ok(())
    }

    fn int(&self, r: u16, instruction: &'static str) -> Result<i32> {
        match self.reg(r)? {
            Value::Int(v) => Ok(v),
            Value::Null => Ok(0),
            _ => Err(mismatch(instruction, r, "an int")),
        }
    }

    fn wide(&self, r: u16, instruction: &'static str) -> Result<i64> {
        let lo = self.slot(r as usize)?;
        let hi = self.slot(r as usize + 1)?;
        join_wide(lo, hi).ok_or_else(|| mismatch(instruction, r, "a wide register pair"))
    }

    fn set_wide(&mut self, r: u16, value: i64) -> Result<()> {
        // Probe the high half first so a bad pair leaves both untouched.
        self.slot(r as usize + 1)?;
        *self.slot_mut(r as usize)? = Value::Int(value as i32);
        *self.slot_mut(r as usize + 1)? = Value::Int((value >> 32) as i32);
        Ok(())
    }

    fn object(&self, r: u16, instruction: &'static str) -> Result<Option<ObjectId>> {
        match self.reg(r)? {
            Value::Object(id) => Ok(Some(id)),
            Value::Null | Value::Int(0) => Ok(None),
            _ => Err(mismatch(instruction, r, "an object reference")),
        }
    }

    /// Register as a comparable word; references compare by identity.
    fn word(&self, r: u16) -> Result<i64> {
        Ok(match self.reg(r)? {
            Value::Int(v) => i64::from(v),
            Value::Null => 0,
            Value::Object(id) => (1 << 32) + i64::from(id.0),
            Value::Wide(v) => v,
        })
    }

    fn unit_at(&self, pc: usize) -> Result<u16> {
        self.code
            .unit(pc)
            .ok_or(RuntimeError::TruncatedInstruction { offset: pc })
    }

    fn u32_at(&self, pc: usize) -> Result<u32> {
        Ok(u32::from(self.unit_at(pc)?) | u32::from(self.unit_at(pc + 1)?) << 16)
    }

    /// Start of the payload table `offset` units away from the current
    /// instruction.
    fn payload(&self, offset: i32, ident: u16) -> Result<usize> {
        let target = self.pc as i64 + i64::from(offset);
        let invalid = RuntimeError::InvalidBranchTarget {
            from: self.pc,
            target,
        };
        if target < 0 || target as usize >= self.code.len() {
            return Err(invalid);
        }
        let base = target as usize;
        if self.unit_at(base)? != ident {
            return Err(invalid);
        }
        Ok(base)
    }
}

fn mismatch(instruction: &'static str, register: u16, expected: &'static str) -> RuntimeError {
    RuntimeError::TypeMismatch {
        instruction,
        register: register as usize,
        expected,
    }
}

fn half(value: Value) -> Option<u64> {
    match value {
        Value::Int(v) => Some(u64::from(v as u32)),
        Value::Null => Some(0),
        _ => None,
    }
}

fn join_wide(lo: Value, hi: Value) -> Option<i64> {
    Some((half(hi)? << 32 | half(lo)?) as i64)
}

fn reference(value: Value) -> Value {
    match value {
        Value::Int(0) => Value::Null,
        other => other,
    }
}

/// Writes a loaded field or element into the destination register(s).
fn store(frame: &mut Frame, kind: FieldKind, dst: u16, value: Value, instruction: &'static str) -> Result<()> {
    match (kind, value) {
        (FieldKind::Wide, Value::Wide(v)) => frame.set_wide(dst, v),
        (FieldKind::Wide, _) | (_, Value::Wide(_)) => {
            Err(mismatch(instruction, dst, "a value of the accessed width"))
        }
        (_, value) => frame.set(dst, value),
    }
}

/// Reads the source register(s) of a put, narrowed to the accessed type.
fn load(frame: &Frame, kind: FieldKind, src: u16, instruction: &'static str) -> Result<Value> {
    Ok(match kind {
        FieldKind::Wide => Value::Wide(frame.wide(src, instruction)?),
        FieldKind::Object => frame.object(src, instruction)?.map_or(Value::Null, Value::Object),
        FieldKind::Int => Value::Int(frame.int(src, instruction)?),
        FieldKind::Boolean => Value::Int(i32::from(frame.int(src, instruction)? & 1 != 0)),
        FieldKind::Byte => Value::Int(i32::from(frame.int(src, instruction)? as i8)),
        FieldKind::Char => Value::Int(i32::from(frame.int(src, instruction)? as u16)),
        FieldKind::Short => Value::Int(i32::from(frame.int(src, instruction)? as i16)),
    })
}

fn int_op(op: ArithOp, x: i32, y: i32) -> Option<i32> {
    Some(match op {
        ArithOp::Add => x.wrapping_add(y),
        ArithOp::Sub => x.wrapping_sub(y),
        ArithOp::Rsub => y.wrapping_sub(x),
        ArithOp::Mul => x.wrapping_mul(y),
        ArithOp::Div => x.checked_div(y).or_else(|| (y != 0).then(|| x.wrapping_div(y)))?,
        ArithOp::Rem => x.checked_rem(y).or_else(|| (y != 0).then_some(0))?,
        ArithOp::And => x & y,
        ArithOp::Or => x | y,
        ArithOp::Xor => x ^ y,
        ArithOp::Shl => x.wrapping_shl(y as u32 & 0x1f),
        ArithOp::Shr => x >> (y & 0x1f),
        ArithOp::Ushr => ((x as u32) >> (y & 0x1f)) as i32,
    })
}

fn long_op(op: ArithOp, x: i64, y: i64) -> Option<i64> {
    Some(match op {
        ArithOp::Add => x.wrapping_add(y),
        ArithOp::Sub => x.wrapping_sub(y),
        ArithOp::Rsub => y.wrapping_sub(x),
        ArithOp::Mul => x.wrapping_mul(y),
        ArithOp::Div => x.checked_div(y).or_else(|| (y != 0).then(|| x.wrapping_div(y)))?,
        ArithOp::Rem => x.checked_rem(y).or_else(|| (y != 0).then_some(0))?,
        ArithOp::And => x & y,
        ArithOp::Or => x | y,
        ArithOp::Xor => x ^ y,
        ArithOp::Shl => x.wrapping_shl(y as u32 & 0x3f),
        ArithOp::Shr => x >> (y & 0x3f),
        ArithOp::Ushr => ((x as u64) >> (y & 0x3f)) as i64,
    })
}

fn float_op(op: ArithOp, x: f64, y: f64) -> Option<f64> {
    Some(match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Rem => x % y,
        _ => return None,
    })
}

fn unary_op(op: UnaryOp, raw: i64) -> i64 {
    let int = raw as i32;
    let float = f32::from_bits(raw as u32);
    let double = f64::from_bits(raw as u64);
    let float_bits = |f: f32| i64::from(f.to_bits() as i32);
    let double_bits = |d: f64| d.to_bits() as i64;
    match op {
        UnaryOp::NegInt => i64::from(int.wrapping_neg()),
        UnaryOp::NotInt => i64::from(!int),
        UnaryOp::NegLong => raw.wrapping_neg(),
        UnaryOp::NotLong => !raw,
        UnaryOp::NegFloat => float_bits(-float),
        UnaryOp::NegDouble => double_bits(-double),
        UnaryOp::IntToLong => i64::from(int),
        UnaryOp::IntToFloat => float_bits(int as f32),
        UnaryOp::IntToDouble => double_bits(f64::from(int)),
        UnaryOp::LongToInt => i64::from(raw as i32),
        UnaryOp::LongToFloat => float_bits(raw as f32),
        UnaryOp::LongToDouble => double_bits(raw as f64),
        UnaryOp::FloatToInt => i64::from(float as i32),
        UnaryOp::FloatToLong => float as i64,
        UnaryOp::FloatToDouble => double_bits(f64::from(float)),
        UnaryOp::DoubleToInt => i64::from(double as i32),
        UnaryOp::DoubleToLong => double as i64,
        UnaryOp::DoubleToFloat => float_bits(double as f32),
        UnaryOp::IntToByte => i64::from(int as i8),
        UnaryOp::IntToChar => i64::from(int as u16),
        UnaryOp::IntToShort => i64::from(int as i16),
    }
}

/// Whether the source and destination of a unary op are register pairs.
fn unary_widths(op: UnaryOp) -> (bool, bool) {
    use UnaryOp::*;
    let src = matches!(
        op,
        NegLong | NotLong | NegDouble | LongToInt | LongToFloat | LongToDouble | DoubleToInt
            | DoubleToLong | DoubleToFloat
    );
    let dst = matches!(
        op,
        NegLong | NotLong | NegDouble | IntToLong | IntToDouble | LongToDouble | FloatToLong
            | FloatToDouble | DoubleToLong
    );
    (src, dst)
}

/// Sign or zero extends one element of a `fill-array-data` table.
fn array_element(bytes: &[u8], component: &str) -> Value {
    let mut raw = [0u8; 8];
    raw[..bytes.len()].copy_from_slice(bytes);
    let unsigned = u64::from_le_bytes(raw);
    match (bytes.len(), component) {
        (1, "Z") => Value::Int(i32::from(bytes[0])),
        (1, _) => Value::Int(i32::from(bytes[0] as i8)),
        (2, "C") => Value::Int(unsigned as i32),
        (2, _) => Value::Int(i32::from(unsigned as u16 as i16)),
        (4, _) => Value::Int(unsigned as u32 as i32),
        _ => Value::Wide(unsigned as i64),
    }
}

/// What an executed instruction does to control flow.
#[derive(Debug)]
enum Flow {
    Next,
    Branch(i32),
    Call(Frame),
    Return(Option<Value>),
    Throw(ObjectId),
}

/// Outcome of a single `step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Running,
    /// The entry frame returned, with its value if it had one.
    Finished(Option<Value>),
}

/// Everything an invocation needs besides the arguments.
struct CallSite<'a> {
    caller: Option<&'a Frame>,
    dispatch: Option<Dispatch>,
    referenced: MethodKey,
    lookup_class: String,
    has_receiver: bool,
    parameters: Vec<Type>,
}

/// VM state the interpreter runs against, borrowed from the runtime for
/// the duration of one run.
pub struct VmContext<'vm> {
    pub config: &'vm VmConfig,
    pub classes: &'vm mut ClassTable,
    pub heap: &'vm mut Heap,
    pub gc: &'vm mut GarbageCollector,
    pub jit: &'vm mut JitCache,
    pub natives: &'vm mut NativeRegistry,
    pub tracer: &'vm mut TraceRecorder,
}

pub struct Interpreter<'vm> {
    vm: VmContext<'vm>,
    frames: Vec<Frame>,
    // Values returned by the last call, consumed by `move-result*`.
    results: Vec<Value>,
    // Extra collector roots for objects not yet stored anywhere.
    pinned: Vec<ObjectId>,
    executed: u64,
}

impl<'vm> Interpreter<'vm> {
    pub fn new(vm: VmContext<'vm>) -> Self {
        Self {
            vm,
            frames: Vec::new(),
            results: Vec::new(),
            pinned: Vec::new(),
            executed: 0,
        }
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    /// Runs `method` to completion.
    pub fn execute(
        &mut self,
        method: Arc<MethodDef>,
        image: Arc<CodeImage>,
        args: &[Value],
    ) -> Result<Option<Value>> {
        self.start(method, image, args)?;
        self.run()
    }

    /// Enters `method` without executing any instruction. Native methods run
    /// immediately.
    pub fn start(&mut self, method: Arc<MethodDef>, image: Arc<CodeImage>, args: &[Value]) -> Result<()> {
        let mut words = Vec::with_capacity(args.len());
        for arg in args {
            match *arg {
                Value::Wide(v) => {
                    words.push(Value::Int(v as i32));
                    words.push(Value::Int((v >> 32) as i32));
                }
                other => words.push(other),
            }
        }
        let site = CallSite {
            caller: None,
            dispatch: None,
            referenced: method.key(),
            lookup_class: method.class.clone(),
            has_receiver: !method.is_static(),
            parameters: method.proto.parameter_types(),
        };
        let flow = self.call(site, Some((method, image)), words)?;
        self.pinned.clear();
        match flow {
            Flow::Call(frame) => {
                self.frames.push(frame);
                self.collect_if_needed();
                Ok(())
            }
            Flow::Throw(exception) => Err(self.uncaught(exception)),
            _ => Ok(()),
        }
    }

    pub fn run(&mut self) -> Result<Option<Value>> {
        loop {
            if let Status::Finished(value) = self.step()? {
                return Ok(value);
            }
        }
    }

    /// Builds a `String[]` from host strings.
    pub fn string_array(&mut self, items: &[&str]) -> Result<Value> {
        let mut elements = Vec::with_capacity(items.len());
        for item in items {
            let id = self.allocate(None, STRING_DESCRIPTOR, ObjectKind::Str(item.to_string()))?;
            self.pinned.push(id);
            elements.push(Value::Object(id));
        }
        let array = self.allocate(
            None,
            "[Ljava/lang/String;",
            ObjectKind::Array {
                component: STRING_DESCRIPTOR.to_string(),
                elements,
            },
        )?;
        self.pinned.push(array);
        Ok(Value::Object(array))
    }

    /// Executes one state transition of the topmost frame.
    pub fn step(&mut self) -> Result<Status> {
        let Some(mut frame) = self.frames.pop() else {
            return Ok(Status::Finished(self.results.pop()));
        };
        if let Some(exception) = frame.pending_exception {
            return self.exception_check(frame, exception);
        }

        let decoded = match frame.fetch() {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(target: "interp", "{} at {}: {}", frame.method.key(), frame.pc, err);
                return Err(err);
            }
        };
        if !matches!(decoded.op, Op::MoveResult { .. }) {
            self.results.clear();
        }
        trace!(target: "interp", "{}:{:04x} {:?}", frame.method.name, frame.pc, decoded.op);

        let flow = self.dispatch(&mut frame, &decoded.op)?;
        self.executed += 1;
        match flow {
            Flow::Next => {
                frame.pc += decoded.width;
                self.frames.push(frame);
            }
            Flow::Branch(offset) => {
                let target = frame.pc as i64 + i64::from(offset);
                if target < 0 || target as usize >= frame.code.len() {
                    return Err(RuntimeError::InvalidBranchTarget {
                        from: frame.pc,
                        target,
                    });
                }
                frame.pc = target as usize;
                self.frames.push(frame);
            }
            Flow::Call(callee) => {
                frame.call_width = decoded.width;
                self.frames.push(frame);
                self.frames.push(callee);
                self.collect_if_needed();
            }
            Flow::Return(value) => {
                if let Some(caller) = self.frames.last_mut() {
                    caller.pc += caller.call_width;
                }
                if let Some(value) = value {
                    self.results.push(value);
                }
            }
            Flow::Throw(exception) => {
                frame.pending_exception = Some(exception);
                self.frames.push(frame);
            }
        }
        if self.executed.checked_rem(self.vm.config.gc_interval) == Some(0) {
            self.collect_if_needed();
        }
        Ok(Status::Running)
    }

    fn exception_check(&mut self, mut frame: Frame, exception: ObjectId) -> Result<Status> {
        let handler = frame
            .code
            .find_handler(frame.pc)
            .map(|item| item.handler_off as usize);
        if let Some(handler) = handler {
            debug!(
                target: "interp",
                "{} caught {} at {}, resuming at {}",
                frame.method.key(),
                exception,
                frame.pc,
                handler
            );
            frame.pending_exception = None;
            frame.caught = Some(exception);
            frame.pc = handler;
            self.frames.push(frame);
            return Ok(Status::Running);
        }
        debug!(target: "interp", "unwinding {} with {}", frame.method.key(), exception);
        match self.frames.last_mut() {
            Some(caller) => {
                caller.pending_exception = Some(exception);
                Ok(Status::Running)
            }
            None => Err(self.uncaught(exception)),
        }
    }

    fn uncaught(&self, exception: ObjectId) -> RuntimeError {
        let (class, message) = match self.vm.heap.get(exception) {
            Some(object) => {
                let message = match &object.kind {
                    ObjectKind::Throwable { message } => message.clone(),
                    _ => String::new(),
                };
                (binary_name(&object.class).to_string(), message)
            }
            None => (exception.to_string(), String::new()),
        };
        error!(target: "interp", "uncaught exception {}: {}", class, message);
        RuntimeError::UncaughtException { class, message }
    }

    /// Collector roots: every register of every frame, pending and caught
    /// exceptions, undelivered results and pinned objects.
    fn roots(&self, extra: Option<&Frame>) -> Vec<ObjectId> {
        self.frames
            .iter()
            .chain(extra)
            .flat_map(|frame| {
                frame
                    .registers
                    .iter()
                    .filter_map(Value::as_object)
                    .chain(frame.pending_exception)
                    .chain(frame.caught)
            })
            .chain(self.results.iter().filter_map(Value::as_object))
            .chain(self.pinned.iter().copied())
            .collect()
    }

    /// Runs a collection regardless of occupancy.
    pub fn collect(&mut self) -> Collection {
        let roots = self.roots(None);
        self.vm.gc.collect(self.vm.heap, roots)
    }

    fn collect_if_needed(&mut self) {
        if self.vm.gc.should_collect(self.vm.heap) {
            self.collect();
        }
    }

    /// Allocates, collecting first when the object would not fit.
    fn allocate(&mut self, frame: Option<&Frame>, class: &str, kind: ObjectKind) -> Result<ObjectId> {
        if !self.vm.heap.fits(kind.estimated_size()) {
            let roots = self.roots(frame);
            self.vm.gc.collect(self.vm.heap, roots);
        }
        self.vm.heap.allocate(class, kind)
    }

    fn allocate_array(&mut self, frame: &Frame, descriptor: &str, count: usize) -> Result<ObjectId> {
        let needed = OBJECT_HEADER_SIZE.saturating_add(count.saturating_mul(SLOT_SIZE));
        if needed > self.vm.heap.capacity() {
            return Err(RuntimeError::OutOfMemory {
                requested: needed,
                used: self.vm.heap.used(),
                capacity: self.vm.heap.capacity(),
            });
        }
        let component = descriptor.strip_prefix('[').unwrap_or(descriptor).to_string();
        let elements = vec![Value::default_for(&component); count];
        self.allocate(Some(frame), descriptor, ObjectKind::Array { component, elements })
    }

    fn throw(&mut self, frame: &Frame, class: &str, message: String) -> Result<Flow> {
        debug!(target: "interp", "raising {}: {}", binary_name(class), message);
        let id = self.allocate(Some(frame), class, ObjectKind::Throwable { message })?;
        Ok(Flow::Throw(id))
    }

    fn class_of(&self, id: ObjectId) -> Result<String> {
        self.vm
            .heap
            .get(id)
            .map(|object| object.class.clone())
            .ok_or(RuntimeError::BadIndex {
                table: "heap",
                index: id.0,
            })
    }

    fn elements_mut(&mut self, id: ObjectId, instruction: &'static str, register: u16) -> Result<&mut Vec<Value>> {
        match self.vm.heap.get_mut(id).map(|object| &mut object.kind) {
            Some(ObjectKind::Array { elements, .. }) => Ok(elements),
            _ => Err(mismatch(instruction, register, "an array")),
        }
    }

    fn fields_mut(&mut self, id: ObjectId, instruction: &'static str, register: u16) -> Result<&mut Vec<Value>> {
        match self.vm.heap.get_mut(id).map(|object| &mut object.kind) {
            Some(ObjectKind::Instance { fields }) => Ok(fields),
            _ => Err(mismatch(instruction, register, "an instance")),
        }
    }

    fn component_of(&self, id: ObjectId) -> String {
        match self.vm.heap.get(id).map(|object| &object.kind) {
            Some(ObjectKind::Array { component, .. }) => component.clone(),
            _ => String::new(),
        }
    }

    fn dispatch(&mut self, frame: &mut Frame, op: &Op) -> Result<Flow> {
        match op {
            Op::Nop | Op::Payload => {}
            Op::Move { kind, dst, src } => match kind {
                RegKind::Wide => {
                    let value = frame.wide(*src, "move-wide")?;
                    frame.set_wide(*dst, value)?;
                }
                _ => {
                    let value = frame.reg(*src)?;
                    frame.set(*dst, value)?;
                }
            },
            Op::MoveResult { kind, dst } => {
                let value = self
                    .results
                    .pop()
                    .ok_or_else(|| mismatch("move-result", *dst, "a pending result"))?;
                match (kind, value) {
                    (RegKind::Wide, Value::Wide(v)) => frame.set_wide(*dst, v)?,
                    (RegKind::Wide, _) | (_, Value::Wide(_)) => {
                        return Err(mismatch("move-result", *dst, "a result of matching width"))
                    }
                    (_, value) => frame.set(*dst, value)?,
                }
            }
            Op::MoveException { dst } => {
                let value = frame.caught.take().map_or(Value::Null, Value::Object);
                frame.set(*dst, value)?;
            }
            Op::ReturnVoid => return Ok(Flow::Return(None)),
            Op::Return { kind, src } => {
                let value = match kind {
                    RegKind::Single => Value::Int(frame.int(*src, "return")?),
                    RegKind::Wide => Value::Wide(frame.wide(*src, "return-wide")?),
                    RegKind::Object => frame
                        .object(*src, "return-object")?
                        .map_or(Value::Null, Value::Object),
                };
                return Ok(Flow::Return(Some(value)));
            }
            Op::Const { dst, value } => frame.set(*dst, Value::Int(*value))?,
            Op::ConstWide { dst, value } => frame.set_wide(*dst, *value)?,
            Op::ConstString { dst, string_idx } => {
                let s = frame
                    .image
                    .string(*string_idx)
                    .ok_or(RuntimeError::BadIndex {
                        table: "string_ids",
                        index: *string_idx,
                    })?
                    .to_string();
                let id = self.allocate(Some(&*frame), STRING_DESCRIPTOR, ObjectKind::Str(s))?;
                frame.set(*dst, Value::Object(id))?;
            }
            Op::ConstClass { dst, type_idx } => {
                let name = type_name(&frame.image, *type_idx)?;
                let id = self.allocate(Some(&*frame), CLASS_DESCRIPTOR, ObjectKind::Class(name))?;
                frame.set(*dst, Value::Object(id))?;
            }
            Op::MonitorEnter { obj } => {
                let Some(id) = frame.object(*obj, "monitor-enter")? else {
                    return self.throw(frame, NULL_POINTER_EXCEPTION, "monitor-enter on null".into());
                };
                if let Some(object) = self.vm.heap.get_mut(id) {
                    object.monitor += 1;
                }
            }
            Op::MonitorExit { obj } => {
                let Some(id) = frame.object(*obj, "monitor-exit")? else {
                    return self.throw(frame, NULL_POINTER_EXCEPTION, "monitor-exit on null".into());
                };
                let released = match self.vm.heap.get_mut(id) {
                    Some(object) if object.monitor > 0 => {
                        object.monitor -= 1;
                        true
                    }
                    _ => false,
                };
                if !released {
                    return self.throw(
                        frame,
                        ILLEGAL_MONITOR_STATE_EXCEPTION,
                        format!("monitor of {} not held", id),
                    );
                }
            }
            Op::CheckCast { obj, type_idx } => {
                if let Some(id) = frame.object(*obj, "check-cast")? {
                    let target = type_name(&frame.image, *type_idx)?;
                    let class = self.class_of(id)?;
                    if class != target {
                        return self.throw(
                            frame,
                            CLASS_CAST_EXCEPTION,
                            format!("{} cannot be cast to {}", binary_name(&class), binary_name(&target)),
                        );
                    }
                }
            }
            Op::InstanceOf { dst, obj, type_idx } => {
                let result = match frame.object(*obj, "instance-of")? {
                    Some(id) => {
                        let target = type_name(&frame.image, *type_idx)?;
                        self.class_of(id)? == target
                    }
                    None => false,
                };
                frame.set(*dst, Value::Int(i32::from(result)))?;
            }
            Op::ArrayLength { dst, array } => {
                let Some(id) = frame.object(*array, "array-length")? else {
                    return self.throw(frame, NULL_POINTER_EXCEPTION, "array-length on null".into());
                };
                let len = self.elements_mut(id, "array-length", *array)?.len();
                frame.set(*dst, Value::Int(len as i32))?;
            }
            Op::NewInstance { dst, type_idx } => {
                let class = type_name(&frame.image, *type_idx)?;
                let fields = self
                    .vm
                    .classes
                    .layout(&class)
                    .iter()
                    .map(|slot| Value::default_for(&slot.field_type))
                    .collect();
                let id = self.allocate(Some(&*frame), &class, ObjectKind::Instance { fields })?;
                frame.set(*dst, Value::Object(id))?;
            }
            Op::NewArray { dst, size, type_idx } => {
                let count = frame.int(*size, "new-array")?;
                if count < 0 {
                    return self.throw(frame, NEGATIVE_ARRAY_SIZE_EXCEPTION, count.to_string());
                }
                let descriptor = type_name(&frame.image, *type_idx)?;
                let id = self.allocate_array(frame, &descriptor, count as usize)?;
                frame.set(*dst, Value::Object(id))?;
            }
            Op::FilledNewArray { type_idx, args } => {
                let descriptor = type_name(&frame.image, *type_idx)?;
                let id = self.allocate_array(frame, &descriptor, args.len())?;
                let values = args
                    .iter()
                    .map(|&r| frame.reg(r).map(reference))
                    .collect::<Result<Vec<_>>>()?;
                let elements = self.elements_mut(id, "filled-new-array", 0)?;
                elements.copy_from_slice(&values);
                self.results.push(Value::Object(id));
            }
            Op::FillArrayData { array, payload } => {
                let Some(id) = frame.object(*array, "fill-array-data")? else {
                    return self.throw(frame, NULL_POINTER_EXCEPTION, "fill-array-data on null".into());
                };
                let base = frame.payload(*payload, FILL_ARRAY_DATA_PAYLOAD)?;
                let width = frame.unit_at(base + 1)? as usize;
                let count = frame.u32_at(base + 2)? as usize;
                if !matches!(width, 1 | 2 | 4 | 8) {
                    return Err(mismatch("fill-array-data", *array, "a 1, 2, 4 or 8 byte element table"));
                }
                let len = self.elements_mut(id, "fill-array-data", *array)?.len();
                if count > len {
                    return self.throw(
                        frame,
                        ARRAY_INDEX_EXCEPTION,
                        format!("length={}; fill of {}", len, count),
                    );
                }
                let units = (count * width).div_ceil(2);
                let data = base + 4;
                if data + units > frame.code.len() {
                    return Err(RuntimeError::TruncatedInstruction { offset: base });
                }
                let mut bytes = Vec::with_capacity(units * 2);
                for i in 0..units {
                    bytes.extend_from_slice(&frame.unit_at(data + i)?.to_le_bytes());
                }
                let component = self.component_of(id);
                let values: Vec<Value> = bytes
                    .chunks_exact(width)
                    .take(count)
                    .map(|chunk| array_element(chunk, &component))
                    .collect();
                let elements = self.elements_mut(id, "fill-array-data", *array)?;
                elements[..values.len()].copy_from_slice(&values);
            }
            Op::Throw { exception } => {
                return match frame.object(*exception, "throw")? {
                    Some(id) => Ok(Flow::Throw(id)),
                    None => self.throw(frame, NULL_POINTER_EXCEPTION, "throw of null".into()),
                };
            }
            Op::Goto { offset } => return Ok(Flow::Branch(*offset)),
            Op::PackedSwitch { test, payload } => {
                let key = frame.int(*test, "packed-switch")?;
                let base = frame.payload(*payload, PACKED_SWITCH_PAYLOAD)?;
                let size = i64::from(frame.unit_at(base + 1)?);
                let first_key = frame.u32_at(base + 2)? as i32;
                let index = i64::from(key) - i64::from(first_key);
                if (0..size).contains(&index) {
                    let target = frame.u32_at(base + 4 + 2 * index as usize)? as i32;
                    return Ok(Flow::Branch(target));
                }
            }
            Op::SparseSwitch { test, payload } => {
                let key = frame.int(*test, "sparse-switch")?;
                let base = frame.payload(*payload, SPARSE_SWITCH_PAYLOAD)?;
                let size = frame.unit_at(base + 1)? as usize;
                for i in 0..size {
                    if frame.u32_at(base + 2 + 2 * i)? as i32 == key {
                        let target = frame.u32_at(base + 2 + 2 * size + 2 * i)? as i32;
                        return Ok(Flow::Branch(target));
                    }
                }
            }
            Op::Compare { op, dst, a, b } => {
                let result = match op {
                    CmpOp::CmpLong => frame.wide(*a, "cmp-long")?.cmp(&frame.wide(*b, "cmp-long")?) as i32,
                    CmpOp::CmplFloat | CmpOp::CmpgFloat => {
                        let x = f32::from_bits(frame.int(*a, "cmp-float")? as u32);
                        let y = f32::from_bits(frame.int(*b, "cmp-float")? as u32);
                        match x.partial_cmp(&y) {
                            Some(ordering) => ordering as i32,
                            None if *op == CmpOp::CmplFloat => -1,
                            None => 1,
                        }
                    }
                    CmpOp::CmplDouble | CmpOp::CmpgDouble => {
                        let x = f64::from_bits(frame.wide(*a, "cmp-double")? as u64);
                        let y = f64::from_bits(frame.wide(*b, "cmp-double")? as u64);
                        match x.partial_cmp(&y) {
                            Some(ordering) => ordering as i32,
                            None if *op == CmpOp::CmplDouble => -1,
                            None => 1,
                        }
                    }
                };
                frame.set(*dst, Value::Int(result))?;
            }
            Op::If { cond, a, b, offset } => {
                if cond.test(frame.word(*a)?, frame.word(*b)?) {
                    return Ok(Flow::Branch(*offset));
                }
            }
            Op::IfZero { cond, a, offset } => {
                if cond.test(frame.word(*a)?, 0) {
                    return Ok(Flow::Branch(*offset));
                }
            }
            Op::ArrayGet { kind, dst, array, index } => {
                let Some(id) = frame.object(*array, "aget")? else {
                    return self.throw(frame, NULL_POINTER_EXCEPTION, "aget on null".into());
                };
                let i = frame.int(*index, "aget")?;
                let elements = self.elements_mut(id, "aget", *array)?;
                let len = elements.len();
                let value = usize::try_from(i).ok().and_then(|i| elements.get(i)).copied();
                match value {
                    Some(value) => store(frame, *kind, *dst, value, "aget")?,
                    None => {
                        return self.throw(frame, ARRAY_INDEX_EXCEPTION, format!("length={len}; index={i}"))
                    }
                }
            }
            Op::ArrayPut { kind, src, array, index } => {
                let Some(id) = frame.object(*array, "aput")? else {
                    return self.throw(frame, NULL_POINTER_EXCEPTION, "aput on null".into());
                };
                let i = frame.int(*index, "aput")?;
                let value = load(frame, *kind, *src, "aput")?;
                let elements = self.elements_mut(id, "aput", *array)?;
                let len = elements.len();
                match usize::try_from(i).ok().and_then(|i| elements.get_mut(i)) {
                    Some(slot) => *slot = value,
                    None => {
                        return self.throw(frame, ARRAY_INDEX_EXCEPTION, format!("length={len}; index={i}"))
                    }
                }
            }
            Op::InstanceGet { kind, dst, obj, field_idx } => {
                let Some(id) = frame.object(*obj, "iget")? else {
                    let name = field_name(&frame.image, *field_idx);
                    return self.throw(frame, NULL_POINTER_EXCEPTION, format!("read of {name} on null"));
                };
                let slot = self.vm.classes.field_slot(&frame.image, *field_idx);
                let value = match slot {
                    Some(slot) => self.fields_mut(id, "iget", *obj)?.get(slot).copied(),
                    None => None,
                };
                match value {
                    Some(value) => store(frame, *kind, *dst, value, "iget")?,
                    None => {
                        let name = field_name(&frame.image, *field_idx);
                        return self.throw(frame, NO_SUCH_FIELD_ERROR, name);
                    }
                }
            }
            Op::InstancePut { kind, src, obj, field_idx } => {
                let Some(id) = frame.object(*obj, "iput")? else {
                    let name = field_name(&frame.image, *field_idx);
                    return self.throw(frame, NULL_POINTER_EXCEPTION, format!("write of {name} on null"));
                };
                let value = load(frame, *kind, *src, "iput")?;
                let slot = self.vm.classes.field_slot(&frame.image, *field_idx);
                let target = match slot {
                    Some(slot) => self.fields_mut(id, "iput", *obj)?.get_mut(slot),
                    None => None,
                };
                match target {
                    Some(target) => *target = value,
                    None => {
                        let name = field_name(&frame.image, *field_idx);
                        return self.throw(frame, NO_SUCH_FIELD_ERROR, name);
                    }
                }
            }
            Op::StaticGet { kind, dst, field_idx } => {
                let image = Arc::clone(&frame.image);
                let field = image.field(*field_idx).ok_or(RuntimeError::BadIndex {
                    table: "field_ids",
                    index: *field_idx,
                })?;
                let owner = self.vm.classes.static_owner(&field.class, &field.name);
                let value = self
                    .vm
                    .heap
                    .static_value(&owner, &field.name)
                    .unwrap_or_else(|| Value::default_for(&field.field_type));
                store(frame, *kind, *dst, value, "sget")?;
            }
            Op::StaticPut { kind, src, field_idx } => {
                let image = Arc::clone(&frame.image);
                let field = image.field(*field_idx).ok_or(RuntimeError::BadIndex {
                    table: "field_ids",
                    index: *field_idx,
                })?;
                let value = load(frame, *kind, *src, "sput")?;
                let owner = self.vm.classes.static_owner(&field.class, &field.name);
                self.vm.heap.set_static(&owner, &field.name, value);
            }
            Op::Invoke { dispatch, method_idx, args } => {
                return self.invoke(frame, *dispatch, *method_idx, args);
            }
            Op::Unary { op, dst, src } => {
                let (src_wide, dst_wide) = unary_widths(*op);
                let raw = if src_wide {
                    frame.wide(*src, "unary")?
                } else {
                    i64::from(frame.int(*src, "unary")?)
                };
                let result = unary_op(*op, raw);
                if dst_wide {
                    frame.set_wide(*dst, result)?;
                } else {
                    frame.set(*dst, Value::Int(result as i32))?;
                }
            }
            Op::Binary { op, ty, dst, a, b } => {
                let shift = matches!(op, ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr);
                match ty {
                    NumType::Int => {
                        let x = frame.int(*a, "binop")?;
                        let y = frame.int(*b, "binop")?;
                        match int_op(*op, x, y) {
                            Some(v) => frame.set(*dst, Value::Int(v))?,
                            None => return self.throw(frame, ARITHMETIC_EXCEPTION, "divide by zero".into()),
                        }
                    }
                    NumType::Long => {
                        let x = frame.wide(*a, "binop-long")?;
                        let y = if shift {
                            i64::from(frame.int(*b, "binop-long")?)
                        } else {
                            frame.wide(*b, "binop-long")?
                        };
                        match long_op(*op, x, y) {
                            Some(v) => frame.set_wide(*dst, v)?,
                            None => return self.throw(frame, ARITHMETIC_EXCEPTION, "divide by zero".into()),
                        }
                    }
                    NumType::Float => {
                        let x = f32::from_bits(frame.int(*a, "binop-float")? as u32);
                        let y = f32::from_bits(frame.int(*b, "binop-float")? as u32);
                        let v = float_op(*op, f64::from(x), f64::from(y))
                            .ok_or_else(|| mismatch("binop-float", *a, "an arithmetic operator"))?;
                        frame.set(*dst, Value::Int((v as f32).to_bits() as i32))?;
                    }
                    NumType::Double => {
                        let x = f64::from_bits(frame.wide(*a, "binop-double")? as u64);
                        let y = f64::from_bits(frame.wide(*b, "binop-double")? as u64);
                        let v = float_op(*op, x, y)
                            .ok_or_else(|| mismatch("binop-double", *a, "an arithmetic operator"))?;
                        frame.set_wide(*dst, v.to_bits() as i64)?;
                    }
                }
            }
            Op::BinaryLit { op, dst, src, literal } => {
                let x = frame.int(*src, "binop-lit")?;
                match int_op(*op, x, *literal) {
                    Some(v) => frame.set(*dst, Value::Int(v))?,
                    None => return self.throw(frame, ARITHMETIC_EXCEPTION, "divide by zero".into()),
                }
            }
        }
        Ok(Flow::Next)
    }

    fn invoke(&mut self, frame: &Frame, dispatch: Dispatch, method_idx: u32, args: &[u16]) -> Result<Flow> {
        let image = Arc::clone(&frame.image);
        let method_ref = image.method(method_idx).ok_or(RuntimeError::BadIndex {
            table: "method_ids",
            index: method_idx,
        })?;
        let proto = image.proto(method_ref.proto).ok_or(RuntimeError::BadIndex {
            table: "proto_ids",
            index: u32::from(method_ref.proto),
        })?;
        let referenced = MethodKey {
            class: method_ref.class.clone(),
            name: method_ref.name.clone(),
            signature: proto.signature(),
        };
        let words = args
            .iter()
            .map(|&r| frame.reg(r))
            .collect::<Result<Vec<_>>>()?;

        let receiver_class = if dispatch.has_receiver() {
            let Some(&receiver) = args.first() else {
                return Err(RuntimeError::ArgumentMismatch {
                    method: referenced.to_string(),
                    given: 0,
                    expected: proto.parameter_words() + 1,
                });
            };
            match frame.object(receiver, "invoke")? {
                Some(id) => Some(self.class_of(id)?),
                None => {
                    return self.throw(
                        frame,
                        NULL_POINTER_EXCEPTION,
                        format!("invoking {} on null", referenced),
                    )
                }
            }
        } else {
            None
        };
        let lookup_class = match dispatch {
            Dispatch::Static | Dispatch::Direct => referenced.class.clone(),
            Dispatch::Super => self
                .vm
                .classes
                .superclass(&frame.method.class)
                .unwrap_or(&referenced.class)
                .to_string(),
            Dispatch::VirtualByReceiverClass | Dispatch::InterfaceByReceiverClass => {
                receiver_class.unwrap_or_else(|| referenced.class.clone())
            }
        };
        let resolved = self
            .vm
            .classes
            .resolve_method(&lookup_class, &referenced.name, &referenced.signature)
            .or_else(|| {
                self.vm
                    .classes
                    .resolve_method(&referenced.class, &referenced.name, &referenced.signature)
            });
        let site = CallSite {
            caller: Some(frame),
            dispatch: Some(dispatch),
            referenced,
            lookup_class,
            has_receiver: dispatch.has_receiver(),
            parameters: proto.parameter_types(),
        };
        self.call(site, resolved, words)
    }

    fn call(
        &mut self,
        site: CallSite,
        resolved: Option<(Arc<MethodDef>, Arc<CodeImage>)>,
        words: Vec<Value>,
    ) -> Result<Flow> {
        let depth = self.frames.len() + usize::from(site.caller.is_some());
        let bytecode = resolved.as_ref().and_then(|(method, image)| {
            method
                .code
                .clone()
                .map(|code| (Arc::clone(method), Arc::clone(image), code))
        });
        if let Some((method, image, code)) = bytecode {
            return self.call_bytecode(site, method, image, code, words, depth);
        }
        let class = resolved
            .map(|(method, _)| method.class.clone())
            .unwrap_or_else(|| site.lookup_class.clone());
        self.call_native(site, &class, words, depth)
    }

    fn call_bytecode(
        &mut self,
        site: CallSite,
        method: Arc<MethodDef>,
        image: Arc<CodeImage>,
        code: Arc<CodeItem>,
        words: Vec<Value>,
        depth: usize,
    ) -> Result<Flow> {
        let key = method.key();
        let expected = code.ins_size as usize;
        if words.len() != expected {
            return Err(RuntimeError::ArgumentMismatch {
                method: key.to_string(),
                given: words.len(),
                expected,
            });
        }
        if depth >= self.vm.config.max_call_depth {
            let message = format!("call depth {} reached entering {}", depth, key);
            return match site.caller {
                Some(caller) => self.throw(caller, STACK_OVERFLOW_ERROR, message),
                None => {
                    let id = self.allocate(None, STACK_OVERFLOW_ERROR, ObjectKind::Throwable { message })?;
                    Ok(Flow::Throw(id))
                }
            };
        }

        let plan = self.vm.jit.enter(&key, &code);
        let tier = if plan.is_some() {
            Tier::Compiled
        } else {
            Tier::Interpreted
        };
        self.record(&site, &method.class, tier, depth);
        debug!(target: "interp", "{:depth$}-> {} ({:?})", "", key, tier);

        let mut callee = Frame::new(method, image, code, plan);
        let base = callee.registers.len() - expected;
        callee.registers[base..].copy_from_slice(&words);
        Ok(Flow::Call(callee))
    }

    fn call_native(&mut self, site: CallSite, class: &str, words: Vec<Value>, depth: usize) -> Result<Flow> {
        let mut names = vec![format!("{}.{}", binary_name(class), site.referenced.name)];
        let declared = format!("{}.{}", binary_name(&site.referenced.class), site.referenced.name);
        if !names.contains(&declared) {
            names.push(declared);
        }
        let Some(name) = names.iter().find(|name| self.vm.natives.contains(name)).cloned() else {
            warn!(target: "interp", "no native handler for {}", names[0]);
            return Err(RuntimeError::UnresolvedNative(names.swap_remove(0)));
        };

        let args = native_args(&site, &words)?;
        self.record(&site, class, Tier::Native, depth);
        debug!(target: "interp", "{:depth$}-> native {}", "", name);
        let mut roots = self.roots(site.caller);
        roots.extend(args.iter().filter_map(Value::as_object));
        let mut ctx = NativeContext::new(&mut *self.vm.heap, &mut *self.vm.gc, roots);
        let handler = self
            .vm
            .natives
            .get_mut(&name)
            .ok_or_else(|| RuntimeError::UnresolvedNative(name.clone()))?;
        if let Some(value) = (*handler)(&mut ctx, &args)? {
            self.results.push(value);
        }
        Ok(Flow::Next)
    }

    fn record(&mut self, site: &CallSite, resolved_class: &str, tier: Tier, depth: usize) {
        if self.vm.tracer.is_recording() {
            self.vm.tracer.record(CallRecord {
                depth,
                caller: site.caller.map(|frame| frame.method.key()),
                referenced: site.referenced.clone(),
                resolved_class: resolved_class.to_string(),
                dispatch: site.dispatch,
                tier,
            });
        }
    }
}

/// Regroups argument words into values, one per declared parameter.
fn native_args(site: &CallSite, words: &[Value]) -> Result<Vec<Value>> {
    let expected = site.parameters.iter().map(Type::size).sum::<usize>() + usize::from(site.has_receiver);
    let mismatch = || RuntimeError::ArgumentMismatch {
        method: site.referenced.to_string(),
        given: words.len(),
        expected,
    };
    if words.len() != expected {
        return Err(mismatch());
    }
    let mut values = Vec::with_capacity(site.parameters.len() + 1);
    let mut rest = words;
    if site.has_receiver {
        values.push(reference(rest[0]));
        rest = &rest[1..];
    }
    for parameter in &site.parameters {
        if parameter.is_wide() {
            let [lo, hi, tail @ ..] = rest else {
                return Err(mismatch());
            };
            values.push(Value::Wide(join_wide(*lo, *hi).ok_or_else(mismatch)?));
            rest = tail;
        } else {
            let [word, tail @ ..] = rest else {
                return Err(mismatch());
            };
            values.push(if parameter.is_reference() {
                reference(*word)
            } else {
                *word
            });
            rest = tail;
        }
    }
    Ok(values)
}

fn type_name(image: &CodeImage, idx: u32) -> Result<String> {
    image
        .type_name(idx)
        .map(str::to_string)
        .ok_or(RuntimeError::BadIndex {
            table: "type_ids",
            index: idx,
        })
}

fn field_name(image: &CodeImage, idx: u32) -> String {
    image
        .field(idx)
        .map(|f| format!("{}.{}", binary_name(&f.class), f.name))
        .unwrap_or_else(|| format!("field@{idx}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::natives::Console;
    use crate::runtime::Runtime;
    use crate::testing::{bytes, nibbles, unit, ClassSpec, CodeSpec, DexBuilder};

    fn runtime_with(config: VmConfig) -> Runtime {
        let console: Console = Arc::new(Mutex::new(Vec::new()));
        Runtime::with_console(config, console).unwrap()
    }

    fn runtime() -> Runtime {
        runtime_with(VmConfig::default())
    }

    /// `LMain;` with a static no-argument `run` method.
    fn main_class(b: &mut DexBuilder, ret: &str, code: CodeSpec) -> ClassSpec {
        let run = b.method("LMain;", "run", ret, &[]);
        ClassSpec::new("LMain;").direct(run, code)
    }

    fn load(rt: &mut Runtime, b: &DexBuilder) -> (Arc<MethodDef>, Arc<CodeImage>) {
        let image = rt.load_image(&b.build()).unwrap();
        let run = image
            .classes
            .iter()
            .flat_map(|c| c.methods())
            .find(|m| m.name == "run")
            .cloned()
            .unwrap();
        (run, image)
    }

    fn execute(rt: &mut Runtime, b: &DexBuilder) -> Result<Option<Value>> {
        let (method, image) = load(rt, b);
        rt.interpreter().execute(method, image, &[])
    }

    fn run_code(code: CodeSpec) -> Result<Option<Value>> {
        let mut b = DexBuilder::new();
        let class = main_class(&mut b, "I", code);
        b.class(class);
        execute(&mut runtime(), &b)
    }

    fn uncaught_class(result: Result<Option<Value>>) -> String {
        match result {
            Err(RuntimeError::UncaughtException { class, .. }) => class,
            other => panic!("expected an uncaught exception, got {:?}", other),
        }
    }

    fn divide_by_zero() -> Vec<u16> {
        vec![
            nibbles(0x12, 0, 1), // 0: const/4 v0, 1
            nibbles(0x12, 1, 0), // 1: const/4 v1, 0
            0x0000,              // 2: nop
            unit(0x93, 2),       // 3: div-int v2, v0, v1
            bytes(0, 1),
            unit(0x0f, 2), // 5: return v2
            0x0000,
            0x0000,
            unit(0x13, 2), // 8: const/16 v2, 99
            99,
            unit(0x0f, 2), // 10: return v2
        ]
    }

    #[test]
    fn exception_check_redirects_to_handler() {
        let mut rt = runtime();
        let mut b = DexBuilder::new();
        let class = main_class(&mut b, "I", CodeSpec::new(3, 0, divide_by_zero()).with_try(0, 8, 8));
        b.class(class);
        let (method, image) = load(&mut rt, &b);

        let mut interp = rt.interpreter();
        interp.start(method, image, &[]).unwrap();
        for _ in 0..4 {
            assert_eq!(interp.step().unwrap(), Status::Running);
        }
        let frame = interp.current_frame().unwrap();
        assert_eq!(frame.pc(), 3);
        assert!(frame.pending_exception().is_some());

        interp.step().unwrap();
        let frame = interp.current_frame().unwrap();
        assert_eq!(frame.pc(), 8);
        assert!(frame.pending_exception().is_none());
        assert_eq!(interp.run().unwrap(), Some(Value::Int(99)));
    }

    #[test]
    fn exception_without_handler_fails_the_run() {
        let result = run_code(CodeSpec::new(3, 0, divide_by_zero()));
        assert_eq!(uncaught_class(result), "java/lang/ArithmeticException");
    }

    #[test]
    fn exceptions_unwind_into_the_calling_frame() {
        let mut b = DexBuilder::new();
        let run = b.method("LMain;", "run", "I", &[]);
        let fail = b.method("LMain;", "fail", "I", &[]);
        let code = CodeSpec::new(
            1,
            0,
            vec![
                nibbles(0x71, 0, 0), // 0: invoke-static {}, fail
                fail as u16,
                0x0000,
                unit(0x0a, 0),       // 3: move-result v0
                unit(0x0f, 0),       // 4: return v0
                nibbles(0x12, 0, 4), // 5: const/4 v0, 4
                unit(0x0f, 0),
            ],
        )
        .with_try(0, 3, 5);
        b.class(
            ClassSpec::new("LMain;")
                .direct(run, code)
                .direct(fail, CodeSpec::new(3, 0, divide_by_zero())),
        );
        assert_eq!(execute(&mut runtime(), &b).unwrap(), Some(Value::Int(4)));
    }

    #[test]
    fn move_exception_yields_the_thrown_object() {
        let mut rt = runtime();
        let mut b = DexBuilder::new();
        let name = b.method("LBase;", "name", "I", &[]);
        let code = CodeSpec::new(
            2,
            0,
            vec![
                nibbles(0x12, 0, 0), // 0: const/4 v0, null
                nibbles(0x6e, 0, 1), // 1: invoke-virtual {v0}, Base.name
                name as u16,
                0x0000,
                unit(0x0d, 1), // 4: move-exception v1
                unit(0x11, 1), // 5: return-object v1
            ],
        )
        .with_try(0, 4, 4);
        let class = main_class(&mut b, "Ljava/lang/Object;", code);
        b.class(class);
        let value = execute(&mut rt, &b).unwrap().unwrap();
        let id = value.as_object().unwrap();
        assert_eq!(rt.heap().get(id).unwrap().class, NULL_POINTER_EXCEPTION);
    }

    #[test]
    fn wide_and_overflowing_arithmetic() {
        // const-wide/32 v0, 0x40000000; const-wide/16 v2, 4; mul-long v0, v0, v2;
        // return-wide v0
        let code = CodeSpec::new(
            4,
            0,
            vec![unit(0x17, 0), 0x0000, 0x4000, unit(0x16, 2), 4, unit(0x9d, 0), bytes(0, 2), unit(0x10, 0)],
        );
        assert_eq!(run_code(code).unwrap(), Some(Value::Wide(1 << 32)));

        // const/high16 v0, 0x8000; const/4 v1, -1; div-int v2, v0, v1; return v2
        let code = CodeSpec::new(
            3,
            0,
            vec![unit(0x15, 0), 0x8000, nibbles(0x12, 1, 0xf), unit(0x93, 2), bytes(0, 1), unit(0x0f, 2)],
        );
        assert_eq!(run_code(code).unwrap(), Some(Value::Int(i32::MIN)));
    }

    #[test]
    fn float_arithmetic_and_nan_comparison() {
        let code = CodeSpec::new(
            6,
            0,
            vec![
                unit(0x15, 0), // const/high16 v0, 1.5f
                0x3fc0,
                unit(0x15, 1), // const/high16 v1, 2.0f
                0x4000,
                unit(0xa8, 2), // mul-float v2, v0, v1
                bytes(0, 1),
                nibbles(0x87, 3, 2), // float-to-int v3, v2
                unit(0x15, 4),       // const/high16 v4, NaN
                0x7fc0,
                unit(0x2d, 5), // cmpl-float v5, v4, v0
                bytes(4, 0),
                nibbles(0xb0, 3, 5), // add-int/2addr v3, v5
                unit(0x0f, 3),
            ],
        );
        assert_eq!(run_code(code).unwrap(), Some(Value::Int(2)));
    }

    #[test]
    fn array_access_is_bounds_checked() {
        let mut b = DexBuilder::new();
        let int_array = b.type_id("[I");
        let code = CodeSpec::new(
            6,
            0,
            vec![
                nibbles(0x12, 0, 3), // 0: const/4 v0, 3
                nibbles(0x23, 1, 0), // 1: new-array v1, v0, [I
                int_array as u16,
                nibbles(0x12, 2, 7), // 3: const/4 v2, 7
                nibbles(0x12, 3, 2), // 4: const/4 v3, 2
                unit(0x4b, 2),       // 5: aput v2, v1, v3
                bytes(1, 3),
                unit(0x44, 4), // 7: aget v4, v1, v3
                bytes(1, 3),
                nibbles(0x12, 3, 3), // 9: const/4 v3, 3
                unit(0x44, 5),       // 10: aget v5, v1, v3
                bytes(1, 3),
                unit(0x0f, 5),       // 12: return v5
                nibbles(0x21, 5, 1), // 13: array-length v5, v1
                nibbles(0xb0, 5, 4), // 14: add-int/2addr v5, v4
                unit(0x0f, 5),
            ],
        )
        .with_try(0, 13, 13);
        let class = main_class(&mut b, "I", code);
        b.class(class);
        assert_eq!(execute(&mut runtime(), &b).unwrap(), Some(Value::Int(10)));
    }

    #[test]
    fn switches_branch_through_payload_tables() {
        let packed = CodeSpec::new(
            2,
            0,
            vec![
                nibbles(0x12, 0, 2), // 0: const/4 v0, 2
                unit(0x2b, 0),       // 1: packed-switch v0, +9
                9,
                0,
                nibbles(0x12, 1, 0), // 4: default
                unit(0x0f, 1),
                nibbles(0x12, 1, 5), // 6: case 1
                unit(0x0f, 1),
                nibbles(0x12, 1, 7), // 8: case 2
                unit(0x0f, 1),
                0x0100, // 10: payload, two keys from 1
                2,
                1,
                0,
                5,
                0,
                7,
                0,
            ],
        );
        assert_eq!(run_code(packed).unwrap(), Some(Value::Int(7)));

        let sparse = CodeSpec::new(
            2,
            0,
            vec![
                unit(0x13, 0), // 0: const/16 v0, 100
                100,
                unit(0x2c, 0), // 2: sparse-switch v0, +7
                7,
                0,
                nibbles(0x12, 1, 0), // 5: default
                unit(0x0f, 1),
                nibbles(0x12, 1, 3), // 7: case 100
                unit(0x0f, 1),
                0x0200, // 9: payload, keys -5 and 100
                2,
                0xfffb,
                0xffff,
                100,
                0,
                3,
                0,
                5,
                0,
            ],
        );
        assert_eq!(run_code(sparse).unwrap(), Some(Value::Int(3)));
    }

    #[test]
    fn fill_array_data_sign_extends_elements() {
        let mut b = DexBuilder::new();
        let shorts = b.type_id("[S");
        let code = CodeSpec::new(
            4,
            0,
            vec![
                nibbles(0x12, 0, 3), // 0: const/4 v0, 3
                nibbles(0x23, 1, 0), // 1: new-array v1, v0, [S
                shorts as u16,
                unit(0x26, 1), // 3: fill-array-data v1, +7
                7,
                0,
                nibbles(0x12, 2, 2), // 6: const/4 v2, 2
                unit(0x4a, 3),       // 7: aget-short v3, v1, v2
                bytes(1, 2),
                unit(0x0f, 3),
                0x0300, // 10: payload, three 2-byte elements
                2,
                3,
                0,
                1,
                2,
                0xfffe,
            ],
        );
        let class = main_class(&mut b, "I", code);
        b.class(class);
        assert_eq!(execute(&mut runtime(), &b).unwrap(), Some(Value::Int(-2)));
    }

    #[test]
    fn fill_array_data_checks_the_element_count_first() {
        // A count larger than the array raises before any element is read.
        let overlong = |count: u32| {
            let mut b = DexBuilder::new();
            let ints = b.type_id("[I");
            let code = CodeSpec::new(
                2,
                0,
                vec![
                    nibbles(0x12, 0, 2), // 0: const/4 v0, 2
                    nibbles(0x23, 1, 0), // 1: new-array v1, v0, [I
                    ints as u16,
                    unit(0x26, 1), // 3: fill-array-data v1, +4
                    4,
                    0,
                    0x000e, // 6: return-void
                    0x0000, // 7: padding
                    0x0300, // 8: payload, 4-byte elements
                    4,
                    count as u16,
                    (count >> 16) as u16,
                    1,
                    0,
                ],
            );
            let class = main_class(&mut b, "V", code);
            b.class(class);
            execute(&mut runtime(), &b)
        };
        assert_eq!(uncaught_class(overlong(u32::MAX)), "java/lang/ArrayIndexOutOfBoundsException");
        assert_eq!(uncaught_class(overlong(3)), "java/lang/ArrayIndexOutOfBoundsException");
        // Two elements fit the array but the table holds only one.
        assert!(matches!(
            overlong(2),
            Err(RuntimeError::TruncatedInstruction { offset: 8 })
        ));
        assert_eq!(overlong(1).unwrap(), None);
    }

    #[test]
    fn instance_and_static_fields() {
        let mut b = DexBuilder::new();
        let point = b.type_id("LPoint;");
        let x = b.field("LPoint;", "I", "x");
        let count = b.field("LMain;", "I", "count");
        let code = CodeSpec::new(
            4,
            0,
            vec![
                unit(0x22, 0), // new-instance v0, Point
                point as u16,
                nibbles(0x12, 1, 6), // const/4 v1, 6
                nibbles(0x59, 1, 0), // iput v1, v0, Point.x
                x as u16,
                nibbles(0x52, 2, 0), // iget v2, v0, Point.x
                x as u16,
                unit(0x67, 2), // sput v2, Main.count
                count as u16,
                unit(0x60, 3), // sget v3, Main.count
                count as u16,
                nibbles(0xb0, 3, 2), // add-int/2addr v3, v2
                unit(0x0f, 3),
            ],
        );
        let mut class = main_class(&mut b, "I", code);
        class.static_fields = vec![count];
        b.class(class);
        b.class(ClassSpec::new("LPoint;").instance_field(x));
        let mut rt = runtime();
        assert_eq!(execute(&mut rt, &b).unwrap(), Some(Value::Int(12)));
        assert_eq!(rt.heap().static_value("LMain;", "count"), Some(Value::Int(6)));
    }

    #[test]
    fn undeclared_field_raises_no_such_field() {
        let mut b = DexBuilder::new();
        let point = b.type_id("LPoint;");
        let z = b.field("LPoint;", "I", "z");
        let code = CodeSpec::new(
            2,
            0,
            vec![unit(0x22, 0), point as u16, nibbles(0x52, 1, 0), z as u16, unit(0x0f, 1)],
        );
        let class = main_class(&mut b, "I", code);
        b.class(class);
        b.class(ClassSpec::new("LPoint;"));
        assert_eq!(
            uncaught_class(execute(&mut runtime(), &b)),
            "java/lang/NoSuchFieldError"
        );
    }

    #[test]
    fn dispatch_follows_receiver_and_superclass() {
        let mut rt = runtime_with(VmConfig {
            trace_calls: true,
            ..Default::default()
        });
        let mut b = DexBuilder::new();
        let run = b.method("LMain;", "run", "I", &[]);
        let base_name = b.method("LBase;", "name", "I", &[]);
        let derived_name = b.method("LDerived;", "name", "I", &[]);
        let named_name = b.method("LNamed;", "name", "I", &[]);
        let via_super = b.method("LDerived;", "viaSuper", "I", &[]);
        let derived = b.type_id("LDerived;");
        let code = CodeSpec::new(
            3,
            0,
            vec![
                unit(0x22, 0), // new-instance v0, Derived
                derived as u16,
                nibbles(0x6e, 0, 1), // invoke-virtual {v0}, Base.name
                base_name as u16,
                0x0000,
                unit(0x0a, 1),
                nibbles(0x72, 0, 1), // invoke-interface {v0}, Named.name
                named_name as u16,
                0x0000,
                unit(0x0a, 2),
                nibbles(0xb0, 1, 2),
                nibbles(0x6e, 0, 1), // invoke-virtual {v0}, Derived.viaSuper
                via_super as u16,
                0x0000,
                unit(0x0a, 2),
                nibbles(0xb0, 1, 2),
                unit(0x0f, 1),
            ],
        );
        let constant = |v: u8| CodeSpec::new(2, 1, vec![nibbles(0x12, 0, v), unit(0x0f, 0)]);
        b.class(ClassSpec::new("LMain;").direct(run, code));
        b.class(ClassSpec::new("LBase;").virtual_method(base_name, constant(1)));
        b.class(
            ClassSpec::new("LDerived;")
                .extends("LBase;")
                .implements("LNamed;")
                .virtual_method(derived_name, constant(2))
                .virtual_method(
                    via_super,
                    // invoke-super {v1}, Base.name; move-result v0; return v0
                    CodeSpec::new(
                        2,
                        1,
                        vec![nibbles(0x6f, 0, 1), base_name as u16, 0x0001, unit(0x0a, 0), unit(0x0f, 0)],
                    ),
                ),
        );
        assert_eq!(execute(&mut rt, &b).unwrap(), Some(Value::Int(5)));

        let trace = rt.trace();
        assert_eq!(trace.len(), 5);
        assert_eq!(trace[1].referenced.class, "LBase;");
        assert_eq!(trace[1].resolved_class, "LDerived;");
        assert_eq!(trace[1].dispatch, Some(Dispatch::VirtualByReceiverClass));
        assert_eq!(trace[2].resolved_class, "LDerived;");
        assert_eq!(trace[2].dispatch, Some(Dispatch::InterfaceByReceiverClass));
        assert_eq!(trace[4].resolved_class, "LBase;");
        assert_eq!(trace[4].dispatch, Some(Dispatch::Super));
        assert_eq!(trace[4].depth, 2);
    }

    #[test]
    fn natives_receive_wide_arguments_whole() {
        let mut rt = runtime();
        rt.register_native("com/example/Clock.add", |_, args| match args {
            [Value::Wide(a), Value::Wide(b)] => Ok(Some(Value::Wide(a + b))),
            _ => Ok(None),
        })
        .unwrap();
        let mut b = DexBuilder::new();
        let add = b.method("Lcom/example/Clock;", "add", "J", &["J", "J"]);
        let code = CodeSpec::new(
            6,
            0,
            vec![
                unit(0x16, 0), // const-wide/16 v0, 5
                5,
                unit(0x16, 2), // const-wide/16 v2, 7
                7,
                nibbles(0x71, 0, 4), // invoke-static {v0, v1, v2, v3}, Clock.add
                add as u16,
                0x3210,
                unit(0x0b, 4), // move-result-wide v4
                unit(0x10, 4), // return-wide v4
            ],
        );
        let class = main_class(&mut b, "J", code);
        b.class(class);
        b.class(ClassSpec::new("Lcom/example/Clock;").native(add));
        assert_eq!(execute(&mut rt, &b).unwrap(), Some(Value::Wide(12)));
    }

    #[test]
    fn unknown_opcode_halts() {
        let code = CodeSpec::new(1, 0, vec![nibbles(0x12, 0, 1), 0x0073]);
        assert!(matches!(
            run_code(code),
            Err(RuntimeError::UnknownOpcode { opcode: 0x73, offset: 1 })
        ));
    }

    #[test]
    fn unbounded_recursion_overflows() {
        let mut rt = runtime_with(VmConfig {
            max_call_depth: 8,
            ..Default::default()
        });
        let mut b = DexBuilder::new();
        let run = b.method("LMain;", "run", "V", &[]);
        let code = CodeSpec::new(0, 0, vec![nibbles(0x71, 0, 0), run as u16, 0x0000, 0x000e]);
        b.class(ClassSpec::new("LMain;").direct(run, code));
        assert_eq!(uncaught_class(execute(&mut rt, &b)), "java/lang/StackOverflowError");
    }

    #[test]
    fn unbalanced_monitor_exit_raises() {
        let mut b = DexBuilder::new();
        let object = b.type_id("Ljava/lang/Object;");
        let code = CodeSpec::new(
            1,
            0,
            vec![
                unit(0x22, 0),
                object as u16,
                unit(0x1d, 0), // monitor-enter v0
                unit(0x1d, 0),
                unit(0x1e, 0), // monitor-exit v0
                unit(0x1e, 0),
                unit(0x1e, 0),
                0x000e,
            ],
        );
        let class = main_class(&mut b, "V", code);
        b.class(class);
        assert_eq!(
            uncaught_class(execute(&mut runtime(), &b)),
            "java/lang/IllegalMonitorStateException"
        );
    }

    /// Allocates `class`, tests it against `test` with instance-of and
    /// casts it to `cast`. Returns the instance-of result, or the
    /// exception when the cast raises.
    fn cast(class: &str, test: &str, cast: &str) -> (Runtime, Value) {
        let mut rt = runtime();
        let mut b = DexBuilder::new();
        let class_idx = b.type_id(class);
        let test_idx = b.type_id(test);
        let cast_idx = b.type_id(cast);
        let code = CodeSpec::new(
            3,
            0,
            vec![
                unit(0x22, 0), // 0: new-instance v0, class
                class_idx as u16,
                nibbles(0x20, 1, 0), // 2: instance-of v1, v0, test
                test_idx as u16,
                unit(0x1f, 0), // 4: check-cast v0, cast
                cast_idx as u16,
                unit(0x0f, 1), // 6: return v1
                unit(0x0d, 2), // 7: move-exception v2
                unit(0x11, 2), // 8: return-object v2
            ],
        )
        .with_try(4, 2, 7);
        let main = main_class(&mut b, "Ljava/lang/Object;", code);
        b.class(main);
        b.class(ClassSpec::new("LBase;"));
        b.class(ClassSpec::new("LDerived;").extends("LBase;"));
        let value = execute(&mut rt, &b).unwrap().unwrap();
        (rt, value)
    }

    fn cast_failure(rt: &Runtime, value: Value) -> String {
        let exception = rt.heap().get(value.as_object().unwrap()).unwrap();
        assert_eq!(exception.class, CLASS_CAST_EXCEPTION);
        match &exception.kind {
            ObjectKind::Throwable { message } => message.clone(),
            other => panic!("expected a throwable, got {:?}", other),
        }
    }

    #[test]
    fn check_cast_and_instance_of() {
        let (_, value) = cast("LBase;", "LBase;", "LBase;");
        assert_eq!(value, Value::Int(1));

        let (rt, value) = cast("LBase;", "LBase;", "LDerived;");
        assert_eq!(cast_failure(&rt, value), "Base cannot be cast to Derived");
    }

    #[test]
    fn casts_compare_the_recorded_class_exactly() {
        let (_, value) = cast("LDerived;", "LBase;", "LDerived;");
        assert_eq!(value, Value::Int(0));

        let (rt, value) = cast("LDerived;", "LDerived;", "LBase;");
        assert_eq!(cast_failure(&rt, value), "Derived cannot be cast to Base");
    }

    #[test]
    fn collection_keeps_objects_reachable_from_registers() {
        let mut rt = runtime();
        let mut b = DexBuilder::new();
        let node = b.type_id("LNode;");
        let next = b.field("LNode;", "LNode;", "next");
        let code = CodeSpec::new(
            3,
            0,
            vec![
                unit(0x22, 0), // 0: new-instance v0, Node
                node as u16,
                unit(0x22, 1), // 2: new-instance v1, Node
                node as u16,
                nibbles(0x5b, 1, 0), // 4: iput-object v1, v0, Node.next
                next as u16,
                nibbles(0x12, 1, 0), // 6: const/4 v1, 0
                unit(0x22, 2),       // 7: new-instance v2, Node
                node as u16,
                nibbles(0x12, 2, 0), // 9: const/4 v2, 0
                nibbles(0x12, 0, 0), // 10: const/4 v0, 0
                0x000e,
            ],
        );
        let class = main_class(&mut b, "V", code);
        b.class(class);
        b.class(ClassSpec::new("LNode;").instance_field(next));
        let (method, image) = load(&mut rt, &b);

        let mut interp = rt.interpreter();
        interp.start(method, image, &[]).unwrap();
        for _ in 0..6 {
            interp.step().unwrap();
        }
        assert_eq!(interp.current_frame().unwrap().pc(), 10);
        // Only the unreferenced third node goes.
        assert_eq!(interp.collect().objects_freed, 1);
        interp.step().unwrap();
        assert_eq!(interp.collect().objects_freed, 2);
        assert_eq!(interp.run().unwrap(), None);
        drop(interp);
        // System.out is all that is left.
        assert_eq!(rt.heap_stats().object_count, 1);
    }

    #[test]
    fn allocation_pressure_triggers_collection() {
        let mut rt = runtime_with(VmConfig {
            heap_capacity: 256,
            ..Default::default()
        });
        let mut b = DexBuilder::new();
        let object = b.type_id("Ljava/lang/Object;");
        // for (v1 = 0; v1 < 100; v1++) v0 = new Object();
        let code = CodeSpec::new(
            3,
            0,
            vec![
                nibbles(0x12, 1, 0),
                unit(0x13, 2),
                100,
                nibbles(0x35, 1, 2),
                7,
                unit(0x22, 0),
                object as u16,
                unit(0xd8, 1),
                bytes(1, 1),
                unit(0x28, (-6i8) as u8),
                0x000e,
            ],
        );
        let class = main_class(&mut b, "V", code);
        b.class(class);
        assert_eq!(execute(&mut rt, &b).unwrap(), None);
        assert!(rt.gc_stats().collections > 0);
        assert!(rt.heap_stats().used_bytes <= 256);
    }

    /// Three objects through v0 put System.out and the objects at 64 of
    /// 100 bytes, above a 0.5 threshold, with two of them garbage.
    fn fill_past_threshold(b: &mut DexBuilder) -> Vec<u16> {
        let object = b.type_id("Ljava/lang/Object;");
        let mut insns = Vec::new();
        for _ in 0..3 {
            insns.extend([unit(0x22, 0), object as u16]); // new-instance v0, Object
        }
        insns
    }

    fn collection_config(gc_interval: u64) -> VmConfig {
        VmConfig {
            heap_capacity: 100,
            gc_threshold: 0.5,
            gc_interval,
            ..Default::default()
        }
    }

    #[test]
    fn instruction_cadence_triggers_collection() {
        for (gc_interval, collections) in [(20, 1), (1000, 0)] {
            let mut rt = runtime_with(collection_config(gc_interval));
            let mut b = DexBuilder::new();
            let mut insns = fill_past_threshold(&mut b);
            // for (v1 = 0; v1 < 30; v1++) {}
            insns.extend([
                nibbles(0x12, 1, 0), // 6: const/4 v1, 0
                unit(0x13, 2),       // 7: const/16 v2, 30
                30,
                nibbles(0x35, 1, 2), // 9: if-ge v1, v2, +5
                5,
                unit(0xd8, 1), // 11: add-int/lit8 v1, v1, 1
                bytes(1, 1),
                unit(0x28, (-4i8) as u8), // 13: goto -4
                0x000e,                   // 14: return-void
            ]);
            let class = main_class(&mut b, "V", CodeSpec::new(3, 0, insns));
            b.class(class);
            assert_eq!(execute(&mut rt, &b).unwrap(), None);
            assert_eq!(rt.gc_stats().collections, collections);
            assert_eq!(rt.gc_stats().objects_freed, 2 * collections);
        }
    }

    #[test]
    fn method_entry_triggers_collection() {
        let mut rt = runtime_with(collection_config(1000));
        let mut b = DexBuilder::new();
        let mut insns = fill_past_threshold(&mut b);
        let helper = b.method("LMain;", "helper", "V", &[]);
        insns.extend([
            nibbles(0x71, 0, 0), // invoke-static {}, Main.helper
            helper as u16,
            0x0000,
            0x000e, // return-void
        ]);
        let class = main_class(&mut b, "V", CodeSpec::new(1, 0, insns))
            .direct(helper, CodeSpec::new(1, 0, vec![0x000e]));
        b.class(class);
        assert_eq!(execute(&mut rt, &b).unwrap(), None);
        assert_eq!(rt.gc_stats().collections, 1);
        assert_eq!(rt.gc_stats().objects_freed, 2);
        assert_eq!(rt.heap_stats().used_bytes, 32);
    }

    #[test]
    fn native_allocation_collects_before_failing() {
        let mut rt = runtime_with(VmConfig {
            heap_capacity: 128,
            ..Default::default()
        });
        let mut b = DexBuilder::new();
        let object = b.type_id("Ljava/lang/Object;");
        let device = b.method("Landroid/os/Build;", "getDevice", "Ljava/lang/String;", &[]);
        // System.out plus seven objects fill the heap; only the last one
        // stays reachable through v0.
        let mut insns = Vec::new();
        for _ in 0..7 {
            insns.extend([unit(0x22, 0), object as u16]); // new-instance v0, Object
        }
        insns.extend([
            nibbles(0x71, 0, 0), // invoke-static {}, Build.getDevice
            device as u16,
            0x0000,
            unit(0x0c, 1), // move-result-object v1
            unit(0x11, 1), // return-object v1
        ]);
        let class = main_class(&mut b, "Ljava/lang/String;", CodeSpec::new(2, 0, insns));
        b.class(class);
        let value = execute(&mut rt, &b).unwrap().unwrap();
        assert_eq!(rt.string_value(&value).as_deref(), Some("VirtualPhone"));
        assert_eq!(rt.gc_stats().collections, 1);
        assert_eq!(rt.gc_stats().objects_freed, 6);
        assert_eq!(rt.heap_stats().object_count, 3);
    }

    #[test]
    fn oversized_array_is_out_of_memory() {
        let mut rt = runtime_with(VmConfig {
            heap_capacity: 64,
            ..Default::default()
        });
        let mut b = DexBuilder::new();
        let ints = b.type_id("[I");
        let code = CodeSpec::new(
            2,
            0,
            vec![unit(0x13, 0), 100, nibbles(0x23, 1, 0), ints as u16, 0x000e],
        );
        let class = main_class(&mut b, "V", code);
        b.class(class);
        assert!(matches!(
            execute(&mut rt, &b),
            Err(RuntimeError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn compiled_plans_match_interpretation() {
        let build = || {
            let mut b = DexBuilder::new();
            let class = main_class(&mut b, "I", CodeSpec::new(3, 0, divide_by_zero()).with_try(0, 8, 8));
            b.class(class);
            b
        };
        let mut eager = runtime_with(VmConfig {
            jit_threshold: 1,
            ..Default::default()
        });
        let (method, image) = load(&mut eager, &build());
        let mut interp = eager.interpreter();
        interp.start(method, image, &[]).unwrap();
        assert!(interp.current_frame().unwrap().is_compiled());
        let compiled = interp.run().unwrap();

        let mut lazy = runtime_with(VmConfig {
            jit_enabled: false,
            ..Default::default()
        });
        let interpreted = execute(&mut lazy, &build()).unwrap();
        assert_eq!(compiled, interpreted);
        assert_eq!(compiled, Some(Value::Int(99)));
    }
}
