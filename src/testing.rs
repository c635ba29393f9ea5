//! Assembler for synthetic code images used by the tests.
use std::collections::HashMap;

use crate::dex::{checksum, write_uleb128, ENDIAN_CONSTANT, HEADER_SIZE, NO_INDEX};
use crate::program::{ACC_NATIVE, ACC_PUBLIC, ACC_STATIC};

/// Method body to emit.
#[derive(Debug, Clone)]
pub struct CodeSpec {
    pub registers: u16,
    pub ins: u16,
    pub outs: u16,
    pub insns: Vec<u16>,
    pub tries: Vec<(u32, u16, u16)>,
}

impl CodeSpec {
    pub fn new(registers: u16, ins: u16, insns: Vec<u16>) -> Self {
        Self {
            registers,
            ins,
            outs: 0,
            insns,
            tries: Vec::new(),
        }
    }

    pub fn with_try(mut self, start: u32, count: u16, handler: u16) -> Self {
        self.tries.push((start, count, handler));
        self
    }
}

/// Class to emit. Methods and fields are given by their table index.
#[derive(Debug, Clone)]
pub struct ClassSpec {
    pub name: String,
    pub access_flags: u32,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub static_fields: Vec<u32>,
    pub instance_fields: Vec<u32>,
    pub direct: Vec<(u32, u32, Option<CodeSpec>)>,
    pub virtuals: Vec<(u32, u32, Option<CodeSpec>)>,
}

impl ClassSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            access_flags: ACC_PUBLIC,
            superclass: None,
            interfaces: Vec::new(),
            source_file: None,
            static_fields: Vec::new(),
            instance_fields: Vec::new(),
            direct: Vec::new(),
            virtuals: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: &str) -> Self {
        self.superclass = Some(superclass.to_string());
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    /// Adds a public static method with a body.
    pub fn direct(mut self, method: u32, code: CodeSpec) -> Self {
        self.direct.push((method, ACC_PUBLIC | ACC_STATIC, Some(code)));
        self
    }

    /// Declares a static native method, one without a code item.
    pub fn native(mut self, method: u32) -> Self {
        self.direct
            .push((method, ACC_PUBLIC | ACC_STATIC | ACC_NATIVE, None));
        self
    }

    pub fn virtual_method(mut self, method: u32, code: CodeSpec) -> Self {
        self.virtuals.push((method, ACC_PUBLIC, Some(code)));
        self
    }

    pub fn instance_field(mut self, field: u32) -> Self {
        self.instance_fields.push(field);
        self
    }
}

struct ClassRecord {
    class_idx: u32,
    access_flags: u32,
    superclass_idx: u32,
    interfaces: Vec<u16>,
    source_file_idx: u32,
    spec: ClassSpec,
}

/// Builds DEX bytes from tables declared through its methods. Strings,
/// types and protos are interned.
#[derive(Default)]
pub struct DexBuilder {
    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    types: Vec<u32>,
    type_index: HashMap<String, u32>,
    protos: Vec<(u32, u32, Vec<u16>)>,
    proto_index: HashMap<String, u32>,
    fields: Vec<(u16, u16, u32)>,
    methods: Vec<(u16, u16, u32)>,
    method_index: HashMap<(u16, u16, u32), u32>,
    classes: Vec<ClassRecord>,
}

impl DexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), idx);
        idx
    }

    pub fn type_id(&mut self, descriptor: &str) -> u32 {
        if let Some(&idx) = self.type_index.get(descriptor) {
            return idx;
        }
        let string_idx = self.string(descriptor);
        let idx = self.types.len() as u32;
        self.types.push(string_idx);
        self.type_index.insert(descriptor.to_string(), idx);
        idx
    }

    pub fn proto(&mut self, ret: &str, params: &[&str]) -> u32 {
        let key = format!("({}){}", params.concat(), ret);
        if let Some(&idx) = self.proto_index.get(&key) {
            return idx;
        }
        let shorty: String = std::iter::once(ret)
            .chain(params.iter().copied())
            .map(|t| match t.as_bytes()[0] {
                b'L' | b'[' => 'L',
                c => c as char,
            })
            .collect();
        let shorty_idx = self.string(&shorty);
        let ret_idx = self.type_id(ret);
        let params = params.iter().map(|p| self.type_id(p) as u16).collect();
        let idx = self.protos.len() as u32;
        self.protos.push((shorty_idx, ret_idx, params));
        self.proto_index.insert(key, idx);
        idx
    }

    pub fn field(&mut self, class: &str, field_type: &str, name: &str) -> u32 {
        let class_idx = self.type_id(class) as u16;
        let type_idx = self.type_id(field_type) as u16;
        let name_idx = self.string(name);
        let idx = self.fields.len() as u32;
        self.fields.push((class_idx, type_idx, name_idx));
        idx
    }

    pub fn method(&mut self, class: &str, name: &str, ret: &str, params: &[&str]) -> u32 {
        let class_idx = self.type_id(class) as u16;
        let proto_idx = self.proto(ret, params) as u16;
        let name_idx = self.string(name);
        let key = (class_idx, proto_idx, name_idx);
        if let Some(&idx) = self.method_index.get(&key) {
            return idx;
        }
        let idx = self.methods.len() as u32;
        self.methods.push(key);
        self.method_index.insert(key, idx);
        idx
    }

    pub fn class(&mut self, spec: ClassSpec) {
        let class_idx = self.type_id(&spec.name);
        let superclass_idx = match &spec.superclass {
            Some(s) => self.type_id(s),
            None => NO_INDEX,
        };
        let interfaces = spec
            .interfaces
            .iter()
            .map(|i| self.type_id(i) as u16)
            .collect();
        let source_file_idx = match &spec.source_file {
            Some(s) => self.string(s),
            None => NO_INDEX,
        };
        self.classes.push(ClassRecord {
            class_idx,
            access_flags: spec.access_flags,
            superclass_idx,
            interfaces,
            source_file_idx,
            spec,
        });
    }

    pub fn build(&self) -> Vec<u8> {
        let string_ids_off = HEADER_SIZE;
        let type_ids_off = string_ids_off + 4 * self.strings.len();
        let proto_ids_off = type_ids_off + 4 * self.types.len();
        let field_ids_off = proto_ids_off + 12 * self.protos.len();
        let method_ids_off = field_ids_off + 8 * self.fields.len();
        let class_defs_off = method_ids_off + 8 * self.methods.len();
        let data_off = class_defs_off + 32 * self.classes.len();

        let mut data: Vec<u8> = Vec::new();
        let at = |data: &Vec<u8>| (data_off + data.len()) as u32;

        let mut string_offs = Vec::new();
        for s in &self.strings {
            string_offs.push(at(&data));
            let units: Vec<u16> = s.encode_utf16().collect();
            write_uleb128(&mut data, units.len() as u32);
            for unit in units {
                encode_mutf8_unit(&mut data, unit);
            }
            data.push(0);
        }

        let type_list = |data: &mut Vec<u8>, list: &[u16]| -> u32 {
            if list.is_empty() {
                return 0;
            }
            align4(data);
            let off = at(data);
            put_u32(data, list.len() as u32);
            for &t in list {
                put_u16(data, t);
            }
            off
        };
        let proto_params: Vec<u32> = self
            .protos
            .iter()
            .map(|(_, _, params)| type_list(&mut data, params))
            .collect();
        let interface_lists: Vec<u32> = self
            .classes
            .iter()
            .map(|c| type_list(&mut data, &c.interfaces))
            .collect();

        let mut code_offs: HashMap<(usize, bool, usize), u32> = HashMap::new();
        for (ci, class) in self.classes.iter().enumerate() {
            for (is_virtual, list) in [(false, &class.spec.direct), (true, &class.spec.virtuals)] {
                for (mi, (_, _, code)) in list.iter().enumerate() {
                    if let Some(code) = code {
                        align4(&mut data);
                        code_offs.insert((ci, is_virtual, mi), at(&data));
                        put_u16(&mut data, code.registers);
                        put_u16(&mut data, code.ins);
                        put_u16(&mut data, code.outs);
                        put_u16(&mut data, code.tries.len() as u16);
                        put_u32(&mut data, 0);
                        put_u32(&mut data, code.insns.len() as u32);
                        for &unit in &code.insns {
                            put_u16(&mut data, unit);
                        }
                        for &(start, count, handler) in &code.tries {
                            put_u32(&mut data, start);
                            put_u16(&mut data, count);
                            put_u16(&mut data, handler);
                        }
                    }
                }
            }
        }

        // Class data goes last so a truncated image cuts into it.
        let mut class_data_offs = Vec::new();
        for (ci, class) in self.classes.iter().enumerate() {
            let spec = &class.spec;
            if spec.static_fields.is_empty()
                && spec.instance_fields.is_empty()
                && spec.direct.is_empty()
                && spec.virtuals.is_empty()
            {
                class_data_offs.push(0);
                continue;
            }
            class_data_offs.push(at(&data));
            for count in [
                spec.static_fields.len(),
                spec.instance_fields.len(),
                spec.direct.len(),
                spec.virtuals.len(),
            ] {
                write_uleb128(&mut data, count as u32);
            }
            for fields in [&spec.static_fields, &spec.instance_fields] {
                let mut sorted = fields.clone();
                sorted.sort_unstable();
                let mut last = 0;
                for idx in sorted {
                    write_uleb128(&mut data, idx - last);
                    write_uleb128(&mut data, ACC_PUBLIC);
                    last = idx;
                }
            }
            for (is_virtual, list) in [(false, &spec.direct), (true, &spec.virtuals)] {
                let mut order: Vec<usize> = (0..list.len()).collect();
                order.sort_by_key(|&i| list[i].0);
                let mut last = 0;
                for mi in order {
                    let (idx, flags, _) = &list[mi];
                    write_uleb128(&mut data, idx - last);
                    write_uleb128(&mut data, *flags);
                    write_uleb128(
                        &mut data,
                        code_offs.get(&(ci, is_virtual, mi)).copied().unwrap_or(0),
                    );
                    last = *idx;
                }
            }
        }

        let mut out = Vec::with_capacity(data_off + data.len());
        out.extend_from_slice(b"dex\n035\0");
        put_u32(&mut out, 0);
        out.extend_from_slice(&[0u8; 20]);
        put_u32(&mut out, (data_off + data.len()) as u32);
        put_u32(&mut out, HEADER_SIZE as u32);
        put_u32(&mut out, ENDIAN_CONSTANT);
        put_u32(&mut out, 0);
        put_u32(&mut out, 0);
        put_u32(&mut out, 0);
        for (size, off) in [
            (self.strings.len(), string_ids_off),
            (self.types.len(), type_ids_off),
            (self.protos.len(), proto_ids_off),
            (self.fields.len(), field_ids_off),
            (self.methods.len(), method_ids_off),
            (self.classes.len(), class_defs_off),
            (data.len(), data_off),
        ] {
            put_u32(&mut out, size as u32);
            put_u32(&mut out, if size == 0 { 0 } else { off as u32 });
        }
        assert_eq!(out.len(), HEADER_SIZE);

        for off in string_offs {
            put_u32(&mut out, off);
        }
        for &string_idx in &self.types {
            put_u32(&mut out, string_idx);
        }
        for ((shorty, ret, _), params_off) in self.protos.iter().zip(proto_params) {
            put_u32(&mut out, *shorty);
            put_u32(&mut out, *ret);
            put_u32(&mut out, params_off);
        }
        for &(class, ty, name) in &self.fields {
            put_u16(&mut out, class);
            put_u16(&mut out, ty);
            put_u32(&mut out, name);
        }
        for &(class, proto, name) in &self.methods {
            put_u16(&mut out, class);
            put_u16(&mut out, proto);
            put_u32(&mut out, name);
        }
        for (ci, class) in self.classes.iter().enumerate() {
            put_u32(&mut out, class.class_idx);
            put_u32(&mut out, class.access_flags);
            put_u32(&mut out, class.superclass_idx);
            put_u32(&mut out, interface_lists[ci]);
            put_u32(&mut out, class.source_file_idx);
            put_u32(&mut out, 0);
            put_u32(&mut out, class_data_offs[ci]);
            put_u32(&mut out, 0);
        }
        assert_eq!(out.len(), data_off);
        out.extend_from_slice(&data);

        let sum = checksum(&out);
        out[8..12].copy_from_slice(&sum.to_le_bytes());
        out
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn align4(data: &mut Vec<u8>) {
    // data starts at a 4-aligned offset since every id record is a
    // multiple of four bytes.
    while data.len() % 4 != 0 {
        data.push(0);
    }
}

fn encode_mutf8_unit(out: &mut Vec<u8>, unit: u16) {
    match unit {
        0x01..=0x7f => out.push(unit as u8),
        0x00 | 0x80..=0x7ff => {
            out.push(0xc0 | (unit >> 6) as u8);
            out.push(0x80 | (unit & 0x3f) as u8);
        }
        _ => {
            out.push(0xe0 | (unit >> 12) as u8);
            out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
            out.push(0x80 | (unit & 0x3f) as u8);
        }
    }
}

/// Packs an opcode and its operand byte into one code unit.
pub fn unit(opcode: u8, operand: u8) -> u16 {
    u16::from(operand) << 8 | u16::from(opcode)
}

/// Packs a `B|A|op` code unit.
pub fn nibbles(opcode: u8, a: u8, b: u8) -> u16 {
    unit(opcode, b << 4 | (a & 0x0f))
}

/// Packs two bytes into a unit, low byte first.
pub fn bytes(lo: u8, hi: u8) -> u16 {
    u16::from(hi) << 8 | u16::from(lo)
}
