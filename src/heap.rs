//! Object heap: an arena of objects addressed by `ObjectId`, plus the
//! static field table.
//!
//! Objects are never referenced by pointer. Registers, fields and array
//! elements hold `Value::Object(id)` and every access goes through the
//! arena, which keeps the collector's mark pass a plain graph walk. Ids
//! increase monotonically and are never handed out twice, so an id held
//! across a collection either names its original object or nothing.
use std::collections::HashMap;
use std::fmt;

use log::trace;

use crate::error::RuntimeError;
use crate::program::{binary_name, STRING_DESCRIPTOR};

type Result<T> = std::result::Result<T, RuntimeError>;

/// Fixed charge for every object.
pub const OBJECT_HEADER_SIZE: usize = 16;
/// Charge per field or array element.
pub const SLOT_SIZE: usize = 8;

/// Identity of a heap object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Register, field and array element contents.
///
/// In a register file a wide value is split over two `Int` halves, low
/// word first. Everywhere else (fields, array elements, return values,
/// native arguments) it is a single `Wide`. Floats and doubles are carried
/// as their raw bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i32),
    Wide(i64),
    Object(ObjectId),
}

impl Value {
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    /// Zero value for a field or element of the given descriptor.
    pub fn default_for(descriptor: &str) -> Value {
        match descriptor.as_bytes().first() {
            Some(b'J') | Some(b'D') => Value::Wide(0),
            Some(b'L') | Some(b'[') => Value::Null,
            _ => Value::Int(0),
        }
    }
}

/// Payload of a heap object.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    /// Plain instance, one slot per field of its layout.
    Instance { fields: Vec<Value> },
    Array {
        component: String,
        elements: Vec<Value>,
    },
    Str(String),
    /// Class literal produced by `const-class`.
    Class(String),
    /// Exception raised by the VM itself.
    Throwable { message: String },
}

impl ObjectKind {
    /// Estimated footprint, charged once at allocation.
    pub fn estimated_size(&self) -> usize {
        OBJECT_HEADER_SIZE
            + match self {
                ObjectKind::Instance { fields } => fields.len() * SLOT_SIZE,
                ObjectKind::Array { elements, .. } => elements.len() * SLOT_SIZE,
                ObjectKind::Str(s) => s.len(),
                ObjectKind::Class(name) => name.len(),
                ObjectKind::Throwable { message } => message.len(),
            }
    }
}

#[derive(Debug, Clone)]
pub struct HeapObject {
    /// Type descriptor of the object, `Lpkg/Name;` or `[I`.
    pub class: String,
    pub kind: ObjectKind,
    /// Bytes charged to the heap for this object.
    pub size: usize,
    /// Collector mark bit, only meaningful during a collection.
    pub marked: bool,
    /// Monitor entry count.
    pub monitor: u32,
}

impl HeapObject {
    /// Object ids held by this object's fields or elements.
    pub fn references(&self) -> impl Iterator<Item = ObjectId> + '_ {
        let slots: &[Value] = match &self.kind {
            ObjectKind::Instance { fields } => fields,
            ObjectKind::Array { elements, .. } => elements,
            _ => &[],
        };
        slots.iter().filter_map(Value::as_object)
    }
}

/// Read-only heap numbers for host tooling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub used_bytes: usize,
    pub capacity_bytes: usize,
    pub object_count: usize,
}

#[derive(Debug)]
pub struct Heap {
    objects: HashMap<ObjectId, HeapObject>,
    next_id: u32,
    used: usize,
    capacity: usize,
    statics: HashMap<(String, String), Value>,
}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        Self {
            objects: HashMap::new(),
            next_id: 0,
            used: 0,
            capacity,
            statics: HashMap::new(),
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            used_bytes: self.used,
            capacity_bytes: self.capacity,
            object_count: self.objects.len(),
        }
    }

    /// Whether `size` more bytes fit without a collection.
    pub fn fits(&self, size: usize) -> bool {
        self.used + size <= self.capacity
    }

    /// Places a new object in the arena. Fails with `OutOfMemory` when the
    /// object does not fit; collecting and retrying is up to the caller.
    pub fn allocate(&mut self, class: &str, kind: ObjectKind) -> Result<ObjectId> {
        let size = kind.estimated_size();
        let next_id = match self.next_id.checked_add(1) {
            Some(next) if self.fits(size) => next,
            _ => {
                return Err(RuntimeError::OutOfMemory {
                    requested: size,
                    used: self.used,
                    capacity: self.capacity,
                })
            }
        };
        let object = HeapObject {
            class: class.to_string(),
            kind,
            size,
            marked: false,
            monitor: 0,
        };
        let id = ObjectId(self.next_id);
        self.next_id = next_id;
        self.objects.insert(id, object);
        self.used += size;
        trace!(target: "gc", "allocated {} {} ({} bytes)", id, binary_name(class), size);
        Ok(id)
    }

    pub fn allocate_string(&mut self, s: &str) -> Result<ObjectId> {
        self.allocate(STRING_DESCRIPTOR, ObjectKind::Str(s.to_string()))
    }

    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Contents of a string object.
    pub fn string(&self, id: ObjectId) -> Option<&str> {
        match &self.get(id)?.kind {
            ObjectKind::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Ids of every live object.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    /// Removes an object and returns the bytes it was charged.
    pub(crate) fn free(&mut self, id: ObjectId) -> usize {
        match self.objects.remove(&id) {
            Some(object) => {
                self.used -= object.size;
                object.size
            }
            None => 0,
        }
    }

    /// Static field value, `None` if it was never written.
    pub fn static_value(&self, class: &str, name: &str) -> Option<Value> {
        self.statics
            .get(&(class.to_string(), name.to_string()))
            .copied()
    }

    pub fn set_static(&mut self, class: &str, name: &str, value: Value) {
        self.statics
            .insert((class.to_string(), name.to_string()), value);
    }

    /// Objects held by static fields. These are collector roots.
    pub fn static_roots(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.statics.values().filter_map(Value::as_object)
    }
}
