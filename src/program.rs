//! Abstract representation of a parsed DEX code image.
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::FormatError;

/// Descriptor of the root class every class without a superclass extends.
pub const OBJECT_DESCRIPTOR: &str = "Ljava/lang/Object;";
pub const STRING_DESCRIPTOR: &str = "Ljava/lang/String;";
pub const CLASS_DESCRIPTOR: &str = "Ljava/lang/Class;";

pub const ACC_PUBLIC: u32 = 0x1;
pub const ACC_STATIC: u32 = 0x8;
pub const ACC_NATIVE: u32 = 0x100;

static TYPE_DESCRIPTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[*(?:[VZBSCIJFD]|L[^;\[.]+;)$").expect("static regex")
});

/// Primitive types and reference kinds a descriptor can name.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseTypeKind {
    Void,
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    Object,
    Array,
}

/// Value type decoded from a type descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub t: BaseTypeKind,
    pub sub_t: Option<Box<Type>>,
}

impl Type {
    /// Returns the size in registers of a value of this type.
    pub fn size(&self) -> usize {
        match self.t {
            BaseTypeKind::Void => 0,
            BaseTypeKind::Long | BaseTypeKind::Double => 2,
            _ => 1,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.size() == 2
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.t, BaseTypeKind::Object | BaseTypeKind::Array)
    }

    /// Decodes a type descriptor such as `I`, `[J` or `Ljava/lang/String;`.
    pub fn decode(descriptor: &str) -> Result<Type, FormatError> {
        if !TYPE_DESCRIPTOR.is_match(descriptor) {
            return Err(FormatError::InvalidDescriptor(descriptor.to_string()));
        }
        Ok(Self::decode_unchecked(descriptor))
    }

    fn decode_unchecked(descriptor: &str) -> Type {
        let t = match descriptor.as_bytes()[0] {
            b'V' => BaseTypeKind::Void,
            b'Z' => BaseTypeKind::Boolean,
            b'B' => BaseTypeKind::Byte,
            b'S' => BaseTypeKind::Short,
            b'C' => BaseTypeKind::Char,
            b'I' => BaseTypeKind::Int,
            b'J' => BaseTypeKind::Long,
            b'F' => BaseTypeKind::Float,
            b'D' => BaseTypeKind::Double,
            b'[' => {
                return Type {
                    t: BaseTypeKind::Array,
                    sub_t: Some(Box::new(Self::decode_unchecked(&descriptor[1..]))),
                }
            }
            _ => BaseTypeKind::Object,
        };
        Type { t, sub_t: None }
    }
}

/// Turns `Lfoo/Bar;` into `foo/Bar`. Array and primitive descriptors are
/// returned as they are.
pub fn binary_name(descriptor: &str) -> &str {
    descriptor
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
        .unwrap_or(descriptor)
}

/// Fixed-position fields of the image header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link: Section,
    pub map_off: u32,
    pub string_ids: Section,
    pub type_ids: Section,
    pub proto_ids: Section,
    pub field_ids: Section,
    pub method_ids: Section,
    pub class_defs: Section,
    pub data: Section,
}

impl Header {
    /// Format version encoded in the magic, e.g. `35` for `dex\n035\0`.
    pub fn version(&self) -> u32 {
        self.magic[4..7]
            .iter()
            .fold(0, |acc, digit| acc * 10 + u32::from(digit - b'0'))
    }
}

/// Size and offset of one id section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Section {
    pub size: u32,
    pub offset: u32,
}

/// Method prototype: return type and ordered parameter types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proto {
    pub shorty: String,
    pub return_type: String,
    pub parameters: Vec<String>,
}

impl Proto {
    /// Signature in descriptor form, `(I[Ljava/lang/String;)V`.
    pub fn signature(&self) -> String {
        format!("({}){}", self.parameters.concat(), self.return_type)
    }

    /// Register words taken by the declared parameters, receiver excluded.
    pub fn parameter_words(&self) -> usize {
        self.parameters
            .iter()
            .map(|p| Type::decode_unchecked(p).size())
            .sum()
    }

    pub fn parameter_types(&self) -> Vec<Type> {
        self.parameters
            .iter()
            .map(|p| Type::decode_unchecked(p))
            .collect()
    }
}

/// Entry of the field reference table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub class: String,
    pub field_type: String,
    pub name: String,
}

/// Entry of the method reference table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub class: String,
    pub proto: u16,
    pub name: String,
}

/// Field declared by a class, as listed in its class data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedField {
    pub field_idx: u32,
    pub access_flags: u32,
}

/// Method defined by a class of this image.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub method_idx: u32,
    pub class: String,
    pub name: String,
    pub proto: Proto,
    pub access_flags: u32,
    /// Absent for abstract and native methods.
    pub code: Option<Arc<CodeItem>>,
}

impl MethodDef {
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn key(&self) -> MethodKey {
        MethodKey {
            class: self.class.clone(),
            name: self.name.clone(),
            signature: self.proto.signature(),
        }
    }
}

/// Identity of a method across loads: class, name and signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey {
    pub class: String,
    pub name: String,
    pub signature: String,
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}{}", self.class, self.name, self.signature)
    }
}

/// Class definition with its decoded class data.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub access_flags: u32,
    pub superclass: String,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<Arc<MethodDef>>,
    pub virtual_methods: Vec<Arc<MethodDef>>,
}

impl ClassDef {
    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodDef>> {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    /// Finds a method declared by this class by name and signature.
    pub fn find_method(&self, name: &str, signature: &str) -> Option<&Arc<MethodDef>> {
        self.methods()
            .find(|m| m.name == name && m.proto.signature() == signature)
    }
}

/// Method body: register counts, instruction stream and try table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub debug_info_off: u32,
    pub insns: Vec<Instruction>,
    pub tries: Vec<TryItem>,
}

impl CodeItem {
    /// Raw 16-bit code unit at `pc`.
    pub fn unit(&self, pc: usize) -> Option<u16> {
        self.insns.get(pc).map(Instruction::unit)
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// First try range covering `pc`.
    pub fn find_handler(&self, pc: usize) -> Option<&TryItem> {
        self.tries.iter().find(|t| t.covers(pc))
    }
}

/// One 16-bit code unit. The opcode is the low byte, the high byte carries
/// packed operand registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub operand: u8,
    /// Byte offset of this unit in the image.
    pub offset: u32,
}

impl Instruction {
    pub fn unit(&self) -> u16 {
        u16::from(self.operand) << 8 | u16::from(self.opcode)
    }
}

/// Try range, in code units, and the address execution resumes at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    pub handler_off: u16,
}

impl TryItem {
    pub fn covers(&self, pc: usize) -> bool {
        let start = self.start_addr as usize;
        pc >= start && pc < start + self.insn_count as usize
    }
}

/// Representation of a loaded code image.
#[derive(Debug, Clone, Default)]
pub struct CodeImage {
    pub header: Header,
    pub strings: Vec<String>,
    pub types: Vec<String>,
    pub protos: Vec<Proto>,
    pub fields: Vec<FieldRef>,
    pub methods: Vec<MethodRef>,
    pub classes: Vec<ClassDef>,
}

impl CodeImage {
    pub fn string(&self, idx: u32) -> Option<&str> {
        self.strings.get(idx as usize).map(String::as_str)
    }

    pub fn type_name(&self, idx: u32) -> Option<&str> {
        self.types.get(idx as usize).map(String::as_str)
    }

    pub fn field(&self, idx: u32) -> Option<&FieldRef> {
        self.fields.get(idx as usize)
    }

    pub fn method(&self, idx: u32) -> Option<&MethodRef> {
        self.methods.get(idx as usize)
    }

    pub fn proto(&self, idx: u16) -> Option<&Proto> {
        self.protos.get(idx as usize)
    }

    /// Returns the program entry point: a method named `main` returning
    /// `void` and taking a single `String[]`.
    pub fn find_entry_method(&self) -> Option<Arc<MethodDef>> {
        self.classes
            .iter()
            .flat_map(ClassDef::methods)
            .find(|m| {
                m.name == "main"
                    && m.proto.return_type == "V"
                    && m.proto.parameters.len() == 1
                    && m.proto.parameters[0] == "[Ljava/lang/String;"
            })
            .cloned()
    }
}
