//! Parser and decoder for DEX code images.
//!
//! The parser walks the header, the five id tables and the class
//! definitions in dependency order: strings before types, types before
//! protos, protos before field and method references. Every index is
//! checked against the table it points into and every read is bounds
//! checked, so a malformed image fails with a [`FormatError`] and no
//! partial [`CodeImage`] ever escapes.
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use crate::error::FormatError;
use crate::program::{
    ClassDef, CodeImage, CodeItem, EncodedField, FieldRef, Header, Instruction, MethodDef,
    MethodRef, Proto, Section, TryItem, Type, OBJECT_DESCRIPTOR,
};

pub const HEADER_SIZE: usize = 0x70;
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;
pub const NO_INDEX: u32 = 0xffff_ffff;

const STRING_ID_SIZE: usize = 4;
const TYPE_ID_SIZE: usize = 4;
const PROTO_ID_SIZE: usize = 12;
const FIELD_ID_SIZE: usize = 8;
const METHOD_ID_SIZE: usize = 8;
const CLASS_DEF_SIZE: usize = 32;
const CODE_ITEM_HEADER_SIZE: usize = 16;
const TRY_ITEM_SIZE: usize = 8;

/// Reads a whole code image from disk.
pub fn read_dex_file(path: &Path) -> io::Result<Vec<u8>> {
    let mut f = File::open(path)?;
    let mut buffer = Vec::new();
    f.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Decodes an unsigned LEB128 value at `offset`. Returns the value and the
/// number of bytes consumed.
pub fn read_uleb128(data: &[u8], offset: usize) -> Result<(u32, usize), FormatError> {
    let mut result: u32 = 0;
    let mut shift = 0;
    let mut read = 0;
    loop {
        let byte = *data.get(offset + read).ok_or(FormatError::Truncated {
            offset: offset + read,
            needed: 1,
        })?;
        read += 1;
        // The fifth byte may only carry the top four bits of a u32.
        if shift == 28 && byte & 0xf0 != 0 {
            return Err(FormatError::Uleb128Overflow { offset });
        }
        result |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, read));
        }
        shift += 7;
    }
}

/// Appends `value` to `out` in unsigned LEB128 form.
pub fn write_uleb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Adler-32 of everything past the checksum field, as stored in the header.
pub fn checksum(bytes: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let (mut a, mut b) = (1u32, 0u32);
    for chunk in bytes.get(12..).unwrap_or_default().chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    b << 16 | a
}

/// Checks the header checksum against the data.
pub fn verify_checksum(bytes: &[u8]) -> Result<(), FormatError> {
    let expected = bytes
        .get(8..12)
        .map(LittleEndian::read_u32)
        .ok_or(FormatError::Truncated {
            offset: 8,
            needed: 4,
        })?;
    let actual = checksum(bytes);
    if expected != actual {
        return Err(FormatError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Method entry of a class data blob, index already reconstructed from
/// its delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedMethod {
    pub method_idx: u32,
    pub access_flags: u32,
    pub code_off: u32,
}

/// Decoded class data blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassData {
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

/// Decodes the class data blob at `offset`: four counts followed by the
/// field and method lists. Indices are stored as deltas from the previous
/// entry of the same list, so each list accumulates from zero.
pub fn decode_class_data(data: &[u8], offset: usize) -> Result<ClassData, FormatError> {
    let mut pos = offset;
    let next = |pos: &mut usize| -> Result<u32, FormatError> {
        let (value, read) = read_uleb128(data, *pos)?;
        *pos += read;
        Ok(value)
    };

    let static_fields_size = next(&mut pos)?;
    let instance_fields_size = next(&mut pos)?;
    let direct_methods_size = next(&mut pos)?;
    let virtual_methods_size = next(&mut pos)?;

    let fields = |count: u32, pos: &mut usize| -> Result<Vec<EncodedField>, FormatError> {
        let mut out = Vec::new();
        let mut field_idx: u32 = 0;
        for _ in 0..count {
            field_idx = field_idx.wrapping_add(next(pos)?);
            let access_flags = next(pos)?;
            out.push(EncodedField {
                field_idx,
                access_flags,
            });
        }
        Ok(out)
    };
    let static_fields = fields(static_fields_size, &mut pos)?;
    let instance_fields = fields(instance_fields_size, &mut pos)?;

    let methods = |count: u32, pos: &mut usize| -> Result<Vec<EncodedMethod>, FormatError> {
        let mut out = Vec::new();
        let mut method_idx: u32 = 0;
        for _ in 0..count {
            method_idx = method_idx.wrapping_add(next(pos)?);
            let access_flags = next(pos)?;
            let code_off = next(pos)?;
            out.push(EncodedMethod {
                method_idx,
                access_flags,
                code_off,
            });
        }
        Ok(out)
    };
    let direct_methods = methods(direct_methods_size, &mut pos)?;
    let virtual_methods = methods(virtual_methods_size, &mut pos)?;

    Ok(ClassData {
        static_fields,
        instance_fields,
        direct_methods,
        virtual_methods,
    })
}

fn check_index(table: &'static str, index: u32, size: usize) -> Result<usize, FormatError> {
    if (index as usize) < size {
        Ok(index as usize)
    } else {
        Err(FormatError::IndexOutOfRange { table, index, size })
    }
}

/// `DexParser` decodes a code image from raw bytes.
pub struct DexParser<'a> {
    data: &'a [u8],
    code_items: HashMap<u32, Arc<CodeItem>>,
}

impl<'a> DexParser<'a> {
    /// Parses `bytes` into a complete code image.
    pub fn parse(bytes: &'a [u8]) -> Result<CodeImage, FormatError> {
        let mut parser = DexParser {
            data: bytes,
            code_items: HashMap::new(),
        };
        let header = parser.parse_header()?;
        let strings = parser.parse_string_ids(&header.string_ids)?;
        let types = parser.parse_type_ids(&header.type_ids, &strings)?;
        let protos = parser.parse_proto_ids(&header.proto_ids, &strings, &types)?;
        let fields = parser.parse_field_ids(&header.field_ids, &strings, &types)?;
        let methods = parser.parse_method_ids(&header.method_ids, &strings, &types, &protos)?;

        let mut image = CodeImage {
            header,
            strings,
            types,
            protos,
            fields,
            methods,
            classes: Vec::new(),
        };
        let class_defs = image.header.class_defs;
        image.classes = parser.parse_class_defs(&class_defs, &image)?;

        info!(
            target: "dex",
            "parsed code image: {} classes, {} methods, {} code items",
            image.classes.len(),
            image.methods.len(),
            parser.code_items.len()
        );
        Ok(image)
    }

    fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], FormatError> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(FormatError::Truncated {
                offset,
                needed: len,
            })
    }

    fn u16_at(&self, offset: usize) -> Result<u16, FormatError> {
        self.bytes(offset, 2).map(LittleEndian::read_u16)
    }

    fn u32_at(&self, offset: usize) -> Result<u32, FormatError> {
        self.bytes(offset, 4).map(LittleEndian::read_u32)
    }

    /// Offset of record `index` in a section of `stride`-byte records.
    fn record(&self, section: &Section, index: u32, stride: usize) -> Result<usize, FormatError> {
        (index as usize)
            .checked_mul(stride)
            .and_then(|rel| rel.checked_add(section.offset as usize))
            .ok_or(FormatError::Truncated {
                offset: section.offset as usize,
                needed: stride,
            })
    }

    fn parse_header(&self) -> Result<Header, FormatError> {
        let mut magic = [0u8; 8];
        let prefix = &self.data[..self.data.len().min(8)];
        magic[..prefix.len()].copy_from_slice(prefix);
        let digits = &magic[4..7];
        let version = digits
            .iter()
            .fold(0u32, |acc, d| acc * 10 + u32::from(d.wrapping_sub(b'0')));
        let valid = prefix.len() == 8
            && &magic[..4] == b"dex\n"
            && magic[7] == 0
            && digits.iter().all(u8::is_ascii_digit)
            && (35..=39).contains(&version);
        if !valid {
            return Err(FormatError::BadMagic(magic));
        }
        // Reject a short header before reading any field.
        self.bytes(0, HEADER_SIZE)?;

        let endian_tag = self.u32_at(40)?;
        if endian_tag != ENDIAN_CONSTANT {
            return Err(FormatError::BadEndianTag(endian_tag));
        }
        let mut signature = [0u8; 20];
        signature.copy_from_slice(self.bytes(12, 20)?);
        let section = |at: usize| -> Result<Section, FormatError> {
            Ok(Section {
                size: self.u32_at(at)?,
                offset: self.u32_at(at + 4)?,
            })
        };

        let header = Header {
            magic,
            checksum: self.u32_at(8)?,
            signature,
            file_size: self.u32_at(32)?,
            header_size: self.u32_at(36)?,
            endian_tag,
            link: section(44)?,
            map_off: self.u32_at(52)?,
            string_ids: section(56)?,
            type_ids: section(64)?,
            proto_ids: section(72)?,
            field_ids: section(80)?,
            method_ids: section(88)?,
            class_defs: section(96)?,
            data: section(104)?,
        };
        if header.file_size as usize > self.data.len() {
            return Err(FormatError::FileSizeMismatch {
                declared: header.file_size,
                actual: self.data.len(),
            });
        }
        debug!(target: "dex", "header: version {}, {} bytes", header.version(), header.file_size);
        Ok(header)
    }

    fn parse_string_ids(&self, section: &Section) -> Result<Vec<String>, FormatError> {
        let mut strings = Vec::with_capacity(section.size as usize);
        for i in 0..section.size {
            let data_off = self.u32_at(self.record(section, i, STRING_ID_SIZE)?)?;
            strings.push(self.read_string(data_off as usize)?);
        }
        Ok(strings)
    }

    /// Reads a string data item: a uleb128 UTF-16 length, MUTF-8 bytes and a
    /// terminating zero.
    fn read_string(&self, offset: usize) -> Result<String, FormatError> {
        let (utf16_len, read) = read_uleb128(self.data, offset)?;
        let start = offset + read;
        let tail = self.data.get(start..).ok_or(FormatError::Truncated {
            offset: start,
            needed: 1,
        })?;
        let end = tail.iter().position(|&b| b == 0).ok_or(FormatError::Truncated {
            offset: start,
            needed: tail.len() + 1,
        })?;
        let units = decode_mutf8(&tail[..end]).ok_or(FormatError::InvalidString { offset })?;
        if units.len() != utf16_len as usize {
            return Err(FormatError::InvalidString { offset });
        }
        String::from_utf16(&units).map_err(|_| FormatError::InvalidString { offset })
    }

    fn parse_type_ids(
        &self,
        section: &Section,
        strings: &[String],
    ) -> Result<Vec<String>, FormatError> {
        let mut types = Vec::with_capacity(section.size as usize);
        for i in 0..section.size {
            let string_idx = self.u32_at(self.record(section, i, TYPE_ID_SIZE)?)?;
            let descriptor = &strings[check_index("string_ids", string_idx, strings.len())?];
            Type::decode(descriptor)?;
            types.push(descriptor.clone());
        }
        Ok(types)
    }

    fn parse_type_list(&self, offset: u32, types: &[String]) -> Result<Vec<String>, FormatError> {
        if offset == 0 {
            return Ok(Vec::new());
        }
        let offset = offset as usize;
        let size = self.u32_at(offset)?;
        let mut list = Vec::with_capacity(size as usize);
        for j in 0..size as usize {
            let type_idx = self.u16_at(offset + 4 + j * 2)?;
            list.push(types[check_index("type_ids", type_idx.into(), types.len())?].clone());
        }
        Ok(list)
    }

    fn parse_proto_ids(
        &self,
        section: &Section,
        strings: &[String],
        types: &[String],
    ) -> Result<Vec<Proto>, FormatError> {
        let mut protos = Vec::with_capacity(section.size as usize);
        for i in 0..section.size {
            let at = self.record(section, i, PROTO_ID_SIZE)?;
            let shorty_idx = self.u32_at(at)?;
            let return_type_idx = self.u32_at(at + 4)?;
            let parameters_off = self.u32_at(at + 8)?;
            protos.push(Proto {
                shorty: strings[check_index("string_ids", shorty_idx, strings.len())?].clone(),
                return_type: types[check_index("type_ids", return_type_idx, types.len())?]
                    .clone(),
                parameters: self.parse_type_list(parameters_off, types)?,
            });
        }
        Ok(protos)
    }

    fn parse_field_ids(
        &self,
        section: &Section,
        strings: &[String],
        types: &[String],
    ) -> Result<Vec<FieldRef>, FormatError> {
        let mut fields = Vec::with_capacity(section.size as usize);
        for i in 0..section.size {
            let at = self.record(section, i, FIELD_ID_SIZE)?;
            let class_idx = self.u16_at(at)?;
            let type_idx = self.u16_at(at + 2)?;
            let name_idx = self.u32_at(at + 4)?;
            fields.push(FieldRef {
                class: types[check_index("type_ids", class_idx.into(), types.len())?].clone(),
                field_type: types[check_index("type_ids", type_idx.into(), types.len())?].clone(),
                name: strings[check_index("string_ids", name_idx, strings.len())?].clone(),
            });
        }
        Ok(fields)
    }

    fn parse_method_ids(
        &self,
        section: &Section,
        strings: &[String],
        types: &[String],
        protos: &[Proto],
    ) -> Result<Vec<MethodRef>, FormatError> {
        let mut methods = Vec::with_capacity(section.size as usize);
        for i in 0..section.size {
            let at = self.record(section, i, METHOD_ID_SIZE)?;
            let class_idx = self.u16_at(at)?;
            let proto_idx = self.u16_at(at + 2)?;
            let name_idx = self.u32_at(at + 4)?;
            check_index("proto_ids", proto_idx.into(), protos.len())?;
            methods.push(MethodRef {
                class: types[check_index("type_ids", class_idx.into(), types.len())?].clone(),
                proto: proto_idx,
                name: strings[check_index("string_ids", name_idx, strings.len())?].clone(),
            });
        }
        Ok(methods)
    }

    fn parse_class_defs(
        &mut self,
        section: &Section,
        image: &CodeImage,
    ) -> Result<Vec<ClassDef>, FormatError> {
        let mut classes = Vec::with_capacity(section.size as usize);
        for i in 0..section.size {
            let at = self.record(section, i, CLASS_DEF_SIZE)?;
            let class_idx = self.u32_at(at)?;
            let access_flags = self.u32_at(at + 4)?;
            let superclass_idx = self.u32_at(at + 8)?;
            let interfaces_off = self.u32_at(at + 12)?;
            let source_file_idx = self.u32_at(at + 16)?;
            let class_data_off = self.u32_at(at + 24)?;

            let name = image.types[check_index("type_ids", class_idx, image.types.len())?].clone();
            let superclass = if superclass_idx == NO_INDEX {
                OBJECT_DESCRIPTOR.to_string()
            } else {
                image.types[check_index("type_ids", superclass_idx, image.types.len())?].clone()
            };
            let source_file = if source_file_idx == NO_INDEX {
                None
            } else {
                Some(
                    image.strings
                        [check_index("string_ids", source_file_idx, image.strings.len())?]
                    .clone(),
                )
            };
            let interfaces = self.parse_type_list(interfaces_off, &image.types)?;

            let class_data = if class_data_off == 0 {
                ClassData::default()
            } else {
                decode_class_data(self.data, class_data_off as usize)?
            };
            for field in class_data
                .static_fields
                .iter()
                .chain(class_data.instance_fields.iter())
            {
                check_index("field_ids", field.field_idx, image.fields.len())?;
            }
            let direct_methods = self.method_defs(&class_data.direct_methods, image)?;
            let virtual_methods = self.method_defs(&class_data.virtual_methods, image)?;

            debug!(
                target: "dex",
                "class {name}: {} direct, {} virtual methods",
                direct_methods.len(),
                virtual_methods.len()
            );
            classes.push(ClassDef {
                name,
                access_flags,
                superclass,
                interfaces,
                source_file,
                static_fields: class_data.static_fields,
                instance_fields: class_data.instance_fields,
                direct_methods,
                virtual_methods,
            });
        }
        Ok(classes)
    }

    fn method_defs(
        &mut self,
        encoded: &[EncodedMethod],
        image: &CodeImage,
    ) -> Result<Vec<Arc<MethodDef>>, FormatError> {
        let mut defs = Vec::with_capacity(encoded.len());
        for entry in encoded {
            let idx = check_index("method_ids", entry.method_idx, image.methods.len())?;
            let method_ref = &image.methods[idx];
            let code = if entry.code_off == 0 {
                None
            } else {
                Some(self.code_item(entry.code_off)?)
            };
            defs.push(Arc::new(MethodDef {
                method_idx: entry.method_idx,
                class: method_ref.class.clone(),
                name: method_ref.name.clone(),
                proto: image.protos[method_ref.proto as usize].clone(),
                access_flags: entry.access_flags,
                code,
            }));
        }
        Ok(defs)
    }

    fn code_item(&mut self, code_off: u32) -> Result<Arc<CodeItem>, FormatError> {
        if let Some(code) = self.code_items.get(&code_off) {
            return Ok(Arc::clone(code));
        }
        let code = Arc::new(self.parse_code_item(code_off as usize)?);
        self.code_items.insert(code_off, Arc::clone(&code));
        Ok(code)
    }

    fn parse_code_item(&self, offset: usize) -> Result<CodeItem, FormatError> {
        let registers_size = self.u16_at(offset)?;
        let ins_size = self.u16_at(offset + 2)?;
        let outs_size = self.u16_at(offset + 4)?;
        let tries_size = self.u16_at(offset + 6)?;
        let debug_info_off = self.u32_at(offset + 8)?;
        let insns_size = self.u32_at(offset + 12)? as usize;
        if ins_size > registers_size {
            return Err(FormatError::InvalidCodeItem {
                offset,
                reason: "more incoming arguments than registers",
            });
        }

        let insns_off = offset + CODE_ITEM_HEADER_SIZE;
        let raw = self.bytes(
            insns_off,
            insns_size.checked_mul(2).ok_or(FormatError::Truncated {
                offset: insns_off,
                needed: usize::MAX,
            })?,
        )?;
        let insns = raw
            .chunks_exact(2)
            .enumerate()
            .map(|(i, unit)| Instruction {
                opcode: unit[0],
                operand: unit[1],
                offset: (insns_off + i * 2) as u32,
            })
            .collect();

        let tries_off = insns_off + insns_size * 2;
        let mut tries = Vec::with_capacity(tries_size as usize);
        for i in 0..tries_size as usize {
            let at = tries_off + i * TRY_ITEM_SIZE;
            let item = TryItem {
                start_addr: self.u32_at(at)?,
                insn_count: self.u16_at(at + 4)?,
                handler_off: self.u16_at(at + 6)?,
            };
            let end = item.start_addr as usize + item.insn_count as usize;
            if end > insns_size || item.handler_off as usize >= insns_size {
                return Err(FormatError::InvalidCodeItem {
                    offset,
                    reason: "try range or handler outside the instruction stream",
                });
            }
            tries.push(item);
        }

        Ok(CodeItem {
            registers_size,
            ins_size,
            outs_size,
            debug_info_off,
            insns,
            tries,
        })
    }
}

/// Decodes modified UTF-8 into UTF-16 code units.
fn decode_mutf8(bytes: &[u8]) -> Option<Vec<u16>> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = u16::from(bytes[i]);
        if b0 & 0x80 == 0 {
            units.push(b0);
            i += 1;
        } else if b0 & 0xe0 == 0xc0 {
            let b1 = continuation(bytes.get(i + 1))?;
            units.push((b0 & 0x1f) << 6 | b1);
            i += 2;
        } else if b0 & 0xf0 == 0xe0 {
            let b1 = continuation(bytes.get(i + 1))?;
            let b2 = continuation(bytes.get(i + 2))?;
            units.push((b0 & 0x0f) << 12 | b1 << 6 | b2);
            i += 3;
        } else {
            return None;
        }
    }
    Some(units)
}

fn continuation(byte: Option<&u8>) -> Option<u16> {
    byte.filter(|b| *b & 0xc0 == 0x80).map(|b| u16::from(b & 0x3f))
}
