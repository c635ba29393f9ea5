//! Dalvik opcodes, instruction formats and the instruction decoder.
//!
//! An instruction is one or more 16-bit code units. The first unit holds
//! the opcode in its low byte; where the operands go depends on the
//! instruction format (`12x`, `21c`, `35c`, ...). [`decode`] turns the
//! units at a program counter into an [`Op`] with every operand unpacked,
//! so the interpreter never touches raw units.
use crate::error::RuntimeError;
use crate::program::CodeItem;

type Result<T> = std::result::Result<T, RuntimeError>;

/// Operand layouts, named after the Dalvik format ids. The first digit is
/// the width in code units.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F32x,
    F30t,
    F31t,
    F31i,
    F31c,
    F35c,
    F3rc,
    F51l,
}

impl Format {
    pub fn width(&self) -> usize {
        match self {
            Format::F10x
            | Format::F12x
            | Format::F11n
            | Format::F11x
            | Format::F10t => 1,
            Format::F20t
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21h
            | Format::F21c
            | Format::F23x
            | Format::F22b
            | Format::F22t
            | Format::F22s
            | Format::F22c => 2,
            Format::F32x
            | Format::F30t
            | Format::F31t
            | Format::F31i
            | Format::F31c
            | Format::F35c
            | Format::F3rc => 3,
            Format::F51l => 5,
        }
    }
}

macro_rules! opcodes {
    ($($name:ident = $code:literal, $mnemonic:literal, $format:ident;)*) => {
        /// Dalvik opcode byte.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum OPCode {
            $($name,)*
            /// Opcode byte with no assigned instruction.
            Unused(u8),
        }

        impl From<u8> for OPCode {
            fn from(byte: u8) -> Self {
                match byte {
                    $($code => OPCode::$name,)*
                    other => OPCode::Unused(other),
                }
            }
        }

        impl OPCode {
            pub fn code(&self) -> u8 {
                match self {
                    $(OPCode::$name => $code,)*
                    OPCode::Unused(byte) => *byte,
                }
            }

            pub fn mnemonic(&self) -> &'static str {
                match self {
                    $(OPCode::$name => $mnemonic,)*
                    OPCode::Unused(_) => "unused",
                }
            }

            /// Operand format, `None` for unassigned opcodes.
            pub fn format(&self) -> Option<Format> {
                match self {
                    $(OPCode::$name => Some(Format::$format),)*
                    OPCode::Unused(_) => None,
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", F10x;
    Move = 0x01, "move", F12x;
    MoveFrom16 = 0x02, "move/from16", F22x;
    Move16 = 0x03, "move/16", F32x;
    MoveWide = 0x04, "move-wide", F12x;
    MoveWideFrom16 = 0x05, "move-wide/from16", F22x;
    MoveWide16 = 0x06, "move-wide/16", F32x;
    MoveObject = 0x07, "move-object", F12x;
    MoveObjectFrom16 = 0x08, "move-object/from16", F22x;
    MoveObject16 = 0x09, "move-object/16", F32x;
    MoveResult = 0x0a, "move-result", F11x;
    MoveResultWide = 0x0b, "move-result-wide", F11x;
    MoveResultObject = 0x0c, "move-result-object", F11x;
    MoveException = 0x0d, "move-exception", F11x;
    ReturnVoid = 0x0e, "return-void", F10x;
    Return = 0x0f, "return", F11x;
    ReturnWide = 0x10, "return-wide", F11x;
    ReturnObject = 0x11, "return-object", F11x;
    Const4 = 0x12, "const/4", F11n;
    Const16 = 0x13, "const/16", F21s;
    Const = 0x14, "const", F31i;
    ConstHigh16 = 0x15, "const/high16", F21h;
    ConstWide16 = 0x16, "const-wide/16", F21s;
    ConstWide32 = 0x17, "const-wide/32", F31i;
    ConstWide = 0x18, "const-wide", F51l;
    ConstWideHigh16 = 0x19, "const-wide/high16", F21h;
    ConstString = 0x1a, "const-string", F21c;
    ConstStringJumbo = 0x1b, "const-string/jumbo", F31c;
    ConstClass = 0x1c, "const-class", F21c;
    MonitorEnter = 0x1d, "monitor-enter", F11x;
    MonitorExit = 0x1e, "monitor-exit", F11x;
    CheckCast = 0x1f, "check-cast", F21c;
    InstanceOf = 0x20, "instance-of", F22c;
    ArrayLength = 0x21, "array-length", F12x;
    NewInstance = 0x22, "new-instance", F21c;
    NewArray = 0x23, "new-array", F22c;
    FilledNewArray = 0x24, "filled-new-array", F35c;
    FilledNewArrayRange = 0x25, "filled-new-array/range", F3rc;
    FillArrayData = 0x26, "fill-array-data", F31t;
    Throw = 0x27, "throw", F11x;
    Goto = 0x28, "goto", F10t;
    Goto16 = 0x29, "goto/16", F20t;
    Goto32 = 0x2a, "goto/32", F30t;
    PackedSwitch = 0x2b, "packed-switch", F31t;
    SparseSwitch = 0x2c, "sparse-switch", F31t;
    CmplFloat = 0x2d, "cmpl-float", F23x;
    CmpgFloat = 0x2e, "cmpg-float", F23x;
    CmplDouble = 0x2f, "cmpl-double", F23x;
    CmpgDouble = 0x30, "cmpg-double", F23x;
    CmpLong = 0x31, "cmp-long", F23x;
    IfEq = 0x32, "if-eq", F22t;
    IfNe = 0x33, "if-ne", F22t;
    IfLt = 0x34, "if-lt", F22t;
    IfGe = 0x35, "if-ge", F22t;
    IfGt = 0x36, "if-gt", F22t;
    IfLe = 0x37, "if-le", F22t;
    IfEqz = 0x38, "if-eqz", F21t;
    IfNez = 0x39, "if-nez", F21t;
    IfLtz = 0x3a, "if-ltz", F21t;
    IfGez = 0x3b, "if-gez", F21t;
    IfGtz = 0x3c, "if-gtz", F21t;
    IfLez = 0x3d, "if-lez", F21t;
    Aget = 0x44, "aget", F23x;
    AgetWide = 0x45, "aget-wide", F23x;
    AgetObject = 0x46, "aget-object", F23x;
    AgetBoolean = 0x47, "aget-boolean", F23x;
    AgetByte = 0x48, "aget-byte", F23x;
    AgetChar = 0x49, "aget-char", F23x;
    AgetShort = 0x4a, "aget-short", F23x;
    Aput = 0x4b, "aput", F23x;
    AputWide = 0x4c, "aput-wide", F23x;
    AputObject = 0x4d, "aput-object", F23x;
    AputBoolean = 0x4e, "aput-boolean", F23x;
    AputByte = 0x4f, "aput-byte", F23x;
    AputChar = 0x50, "aput-char", F23x;
    AputShort = 0x51, "aput-short", F23x;
    Iget = 0x52, "iget", F22c;
    IgetWide = 0x53, "iget-wide", F22c;
    IgetObject = 0x54, "iget-object", F22c;
    IgetBoolean = 0x55, "iget-boolean", F22c;
    IgetByte = 0x56, "iget-byte", F22c;
    IgetChar = 0x57, "iget-char", F22c;
    IgetShort = 0x58, "iget-short", F22c;
    Iput = 0x59, "iput", F22c;
    IputWide = 0x5a, "iput-wide", F22c;
    IputObject = 0x5b, "iput-object", F22c;
    IputBoolean = 0x5c, "iput-boolean", F22c;
    IputByte = 0x5d, "iput-byte", F22c;
    IputChar = 0x5e, "iput-char", F22c;
    IputShort = 0x5f, "iput-short", F22c;
    Sget = 0x60, "sget", F21c;
    SgetWide = 0x61, "sget-wide", F21c;
    SgetObject = 0x62, "sget-object", F21c;
    SgetBoolean = 0x63, "sget-boolean", F21c;
    SgetByte = 0x64, "sget-byte", F21c;
    SgetChar = 0x65, "sget-char", F21c;
    SgetShort = 0x66, "sget-short", F21c;
    Sput = 0x67, "sput", F21c;
    SputWide = 0x68, "sput-wide", F21c;
    SputObject = 0x69, "sput-object", F21c;
    SputBoolean = 0x6a, "sput-boolean", F21c;
    SputByte = 0x6b, "sput-byte", F21c;
    SputChar = 0x6c, "sput-char", F21c;
    SputShort = 0x6d, "sput-short", F21c;
    InvokeVirtual = 0x6e, "invoke-virtual", F35c;
    InvokeSuper = 0x6f, "invoke-super", F35c;
    InvokeDirect = 0x70, "invoke-direct", F35c;
    InvokeStatic = 0x71, "invoke-static", F35c;
    InvokeInterface = 0x72, "invoke-interface", F35c;
    InvokeVirtualRange = 0x74, "invoke-virtual/range", F3rc;
    InvokeSuperRange = 0x75, "invoke-super/range", F3rc;
    InvokeDirectRange = 0x76, "invoke-direct/range", F3rc;
    InvokeStaticRange = 0x77, "invoke-static/range", F3rc;
    InvokeInterfaceRange = 0x78, "invoke-interface/range", F3rc;
    NegInt = 0x7b, "neg-int", F12x;
    NotInt = 0x7c, "not-int", F12x;
    NegLong = 0x7d, "neg-long", F12x;
    NotLong = 0x7e, "not-long", F12x;
    NegFloat = 0x7f, "neg-float", F12x;
    NegDouble = 0x80, "neg-double", F12x;
    IntToLong = 0x81, "int-to-long", F12x;
    IntToFloat = 0x82, "int-to-float", F12x;
    IntToDouble = 0x83, "int-to-double", F12x;
    LongToInt = 0x84, "long-to-int", F12x;
    LongToFloat = 0x85, "long-to-float", F12x;
    LongToDouble = 0x86, "long-to-double", F12x;
    FloatToInt = 0x87, "float-to-int", F12x;
    FloatToLong = 0x88, "float-to-long", F12x;
    FloatToDouble = 0x89, "float-to-double", F12x;
    DoubleToInt = 0x8a, "double-to-int", F12x;
    DoubleToLong = 0x8b, "double-to-long", F12x;
    DoubleToFloat = 0x8c, "double-to-float", F12x;
    IntToByte = 0x8d, "int-to-byte", F12x;
    IntToChar = 0x8e, "int-to-char", F12x;
    IntToShort = 0x8f, "int-to-short", F12x;
    AddInt = 0x90, "add-int", F23x;
    SubInt = 0x91, "sub-int", F23x;
    MulInt = 0x92, "mul-int", F23x;
    DivInt = 0x93, "div-int", F23x;
    RemInt = 0x94, "rem-int", F23x;
    AndInt = 0x95, "and-int", F23x;
    OrInt = 0x96, "or-int", F23x;
    XorInt = 0x97, "xor-int", F23x;
    ShlInt = 0x98, "shl-int", F23x;
    ShrInt = 0x99, "shr-int", F23x;
    UshrInt = 0x9a, "ushr-int", F23x;
    AddLong = 0x9b, "add-long", F23x;
    SubLong = 0x9c, "sub-long", F23x;
    MulLong = 0x9d, "mul-long", F23x;
    DivLong = 0x9e, "div-long", F23x;
    RemLong = 0x9f, "rem-long", F23x;
    AndLong = 0xa0, "and-long", F23x;
    OrLong = 0xa1, "or-long", F23x;
    XorLong = 0xa2, "xor-long", F23x;
    ShlLong = 0xa3, "shl-long", F23x;
    ShrLong = 0xa4, "shr-long", F23x;
    UshrLong = 0xa5, "ushr-long", F23x;
    AddFloat = 0xa6, "add-float", F23x;
    SubFloat = 0xa7, "sub-float", F23x;
    MulFloat = 0xa8, "mul-float", F23x;
    DivFloat = 0xa9, "div-float", F23x;
    RemFloat = 0xaa, "rem-float", F23x;
    AddDouble = 0xab, "add-double", F23x;
    SubDouble = 0xac, "sub-double", F23x;
    MulDouble = 0xad, "mul-double", F23x;
    DivDouble = 0xae, "div-double", F23x;
    RemDouble = 0xaf, "rem-double", F23x;
    AddInt2Addr = 0xb0, "add-int/2addr", F12x;
    SubInt2Addr = 0xb1, "sub-int/2addr", F12x;
    MulInt2Addr = 0xb2, "mul-int/2addr", F12x;
    DivInt2Addr = 0xb3, "div-int/2addr", F12x;
    RemInt2Addr = 0xb4, "rem-int/2addr", F12x;
    AndInt2Addr = 0xb5, "and-int/2addr", F12x;
    OrInt2Addr = 0xb6, "or-int/2addr", F12x;
    XorInt2Addr = 0xb7, "xor-int/2addr", F12x;
    ShlInt2Addr = 0xb8, "shl-int/2addr", F12x;
    ShrInt2Addr = 0xb9, "shr-int/2addr", F12x;
    UshrInt2Addr = 0xba, "ushr-int/2addr", F12x;
    AddLong2Addr = 0xbb, "add-long/2addr", F12x;
    SubLong2Addr = 0xbc, "sub-long/2addr", F12x;
    MulLong2Addr = 0xbd, "mul-long/2addr", F12x;
    DivLong2Addr = 0xbe, "div-long/2addr", F12x;
    RemLong2Addr = 0xbf, "rem-long/2addr", F12x;
    AndLong2Addr = 0xc0, "and-long/2addr", F12x;
    OrLong2Addr = 0xc1, "or-long/2addr", F12x;
    XorLong2Addr = 0xc2, "xor-long/2addr", F12x;
    ShlLong2Addr = 0xc3, "shl-long/2addr", F12x;
    ShrLong2Addr = 0xc4, "shr-long/2addr", F12x;
    UshrLong2Addr = 0xc5, "ushr-long/2addr", F12x;
    AddFloat2Addr = 0xc6, "add-float/2addr", F12x;
    SubFloat2Addr = 0xc7, "sub-float/2addr", F12x;
    MulFloat2Addr = 0xc8, "mul-float/2addr", F12x;
    DivFloat2Addr = 0xc9, "div-float/2addr", F12x;
    RemFloat2Addr = 0xca, "rem-float/2addr", F12x;
    AddDouble2Addr = 0xcb, "add-double/2addr", F12x;
    SubDouble2Addr = 0xcc, "sub-double/2addr", F12x;
    MulDouble2Addr = 0xcd, "mul-double/2addr", F12x;
    DivDouble2Addr = 0xce, "div-double/2addr", F12x;
    RemDouble2Addr = 0xcf, "rem-double/2addr", F12x;
    AddIntLit16 = 0xd0, "add-int/lit16", F22s;
    RsubInt = 0xd1, "rsub-int", F22s;
    MulIntLit16 = 0xd2, "mul-int/lit16", F22s;
    DivIntLit16 = 0xd3, "div-int/lit16", F22s;
    RemIntLit16 = 0xd4, "rem-int/lit16", F22s;
    AndIntLit16 = 0xd5, "and-int/lit16", F22s;
    OrIntLit16 = 0xd6, "or-int/lit16", F22s;
    XorIntLit16 = 0xd7, "xor-int/lit16", F22s;
    AddIntLit8 = 0xd8, "add-int/lit8", F22b;
    RsubIntLit8 = 0xd9, "rsub-int/lit8", F22b;
    MulIntLit8 = 0xda, "mul-int/lit8", F22b;
    DivIntLit8 = 0xdb, "div-int/lit8", F22b;
    RemIntLit8 = 0xdc, "rem-int/lit8", F22b;
    AndIntLit8 = 0xdd, "and-int/lit8", F22b;
    OrIntLit8 = 0xde, "or-int/lit8", F22b;
    XorIntLit8 = 0xdf, "xor-int/lit8", F22b;
    ShlIntLit8 = 0xe0, "shl-int/lit8", F22b;
    ShrIntLit8 = 0xe1, "shr-int/lit8", F22b;
    UshrIntLit8 = 0xe2, "ushr-int/lit8", F22b;
}

/// Identifiers of the data tables embedded in the instruction stream.
pub const PACKED_SWITCH_PAYLOAD: u16 = 0x0100;
pub const SPARSE_SWITCH_PAYLOAD: u16 = 0x0200;
pub const FILL_ARRAY_DATA_PAYLOAD: u16 = 0x0300;

/// How a move, return or move-result treats its registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegKind {
    Single,
    Wide,
    Object,
}

/// Element or field flavour of the get/put families.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Wide,
    Object,
    Boolean,
    Byte,
    Char,
    Short,
}

const FIELD_KINDS: [FieldKind; 7] = [
    FieldKind::Int,
    FieldKind::Wide,
    FieldKind::Object,
    FieldKind::Boolean,
    FieldKind::Byte,
    FieldKind::Char,
    FieldKind::Short,
];

/// How an invoke picks its target, fixed by the opcode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Dispatch {
    Static,
    Direct,
    VirtualByReceiverClass,
    InterfaceByReceiverClass,
    Super,
}

impl Dispatch {
    /// Whether the first argument register holds a receiver.
    pub fn has_receiver(&self) -> bool {
        !matches!(self, Dispatch::Static)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CmpOp {
    CmplFloat,
    CmpgFloat,
    CmplDouble,
    CmpgDouble,
    CmpLong,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cond {
    pub fn test<T: Ord>(&self, a: T, b: T) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => a < b,
            Cond::Ge => a >= b,
            Cond::Gt => a > b,
            Cond::Le => a <= b,
        }
    }
}

const CONDS: [Cond; 6] = [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Ge, Cond::Gt, Cond::Le];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
    /// Reverse subtract, `literal - src`. Literal forms only.
    Rsub,
}

const INT_OPS: [ArithOp; 11] = [
    ArithOp::Add,
    ArithOp::Sub,
    ArithOp::Mul,
    ArithOp::Div,
    ArithOp::Rem,
    ArithOp::And,
    ArithOp::Or,
    ArithOp::Xor,
    ArithOp::Shl,
    ArithOp::Shr,
    ArithOp::Ushr,
];

const LIT_OPS: [ArithOp; 11] = [
    ArithOp::Add,
    ArithOp::Rsub,
    ArithOp::Mul,
    ArithOp::Div,
    ArithOp::Rem,
    ArithOp::And,
    ArithOp::Or,
    ArithOp::Xor,
    ArithOp::Shl,
    ArithOp::Shr,
    ArithOp::Ushr,
];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NumType {
    Int,
    Long,
    Float,
    Double,
}

/// Maps the offset inside a 32-opcode binary block to its operation.
fn binary_op(index: u8) -> (ArithOp, NumType) {
    match index {
        0..=10 => (INT_OPS[index as usize], NumType::Int),
        11..=21 => (INT_OPS[(index - 11) as usize], NumType::Long),
        22..=26 => (INT_OPS[(index - 22) as usize], NumType::Float),
        _ => (INT_OPS[(index - 27) as usize], NumType::Double),
    }
}

/// Unary operations in opcode order, `neg-int` (0x7b) to `int-to-short` (0x8f).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnaryOp {
    NegInt,
    NotInt,
    NegLong,
    NotLong,
    NegFloat,
    NegDouble,
    IntToLong,
    IntToFloat,
    IntToDouble,
    LongToInt,
    LongToFloat,
    LongToDouble,
    FloatToInt,
    FloatToLong,
    FloatToDouble,
    DoubleToInt,
    DoubleToLong,
    DoubleToFloat,
    IntToByte,
    IntToChar,
    IntToShort,
}

const UNARY_OPS: [UnaryOp; 21] = [
    UnaryOp::NegInt,
    UnaryOp::NotInt,
    UnaryOp::NegLong,
    UnaryOp::NotLong,
    UnaryOp::NegFloat,
    UnaryOp::NegDouble,
    UnaryOp::IntToLong,
    UnaryOp::IntToFloat,
    UnaryOp::IntToDouble,
    UnaryOp::LongToInt,
    UnaryOp::LongToFloat,
    UnaryOp::LongToDouble,
    UnaryOp::FloatToInt,
    UnaryOp::FloatToLong,
    UnaryOp::FloatToDouble,
    UnaryOp::DoubleToInt,
    UnaryOp::DoubleToLong,
    UnaryOp::DoubleToFloat,
    UnaryOp::IntToByte,
    UnaryOp::IntToChar,
    UnaryOp::IntToShort,
];

/// Decoded instruction. Branch offsets are relative, in code units, to the
/// address of the instruction itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,
    /// Switch or array data table; skipped if execution runs into it.
    Payload,
    Move { kind: RegKind, dst: u16, src: u16 },
    MoveResult { kind: RegKind, dst: u16 },
    MoveException { dst: u16 },
    ReturnVoid,
    Return { kind: RegKind, src: u16 },
    Const { dst: u16, value: i32 },
    ConstWide { dst: u16, value: i64 },
    ConstString { dst: u16, string_idx: u32 },
    ConstClass { dst: u16, type_idx: u32 },
    MonitorEnter { obj: u16 },
    MonitorExit { obj: u16 },
    CheckCast { obj: u16, type_idx: u32 },
    InstanceOf { dst: u16, obj: u16, type_idx: u32 },
    ArrayLength { dst: u16, array: u16 },
    NewInstance { dst: u16, type_idx: u32 },
    NewArray { dst: u16, size: u16, type_idx: u32 },
    FilledNewArray { type_idx: u32, args: Vec<u16> },
    FillArrayData { array: u16, payload: i32 },
    Throw { exception: u16 },
    Goto { offset: i32 },
    PackedSwitch { test: u16, payload: i32 },
    SparseSwitch { test: u16, payload: i32 },
    Compare { op: CmpOp, dst: u16, a: u16, b: u16 },
    If { cond: Cond, a: u16, b: u16, offset: i32 },
    IfZero { cond: Cond, a: u16, offset: i32 },
    ArrayGet { kind: FieldKind, dst: u16, array: u16, index: u16 },
    ArrayPut { kind: FieldKind, src: u16, array: u16, index: u16 },
    InstanceGet { kind: FieldKind, dst: u16, obj: u16, field_idx: u32 },
    InstancePut { kind: FieldKind, src: u16, obj: u16, field_idx: u32 },
    StaticGet { kind: FieldKind, dst: u16, field_idx: u32 },
    StaticPut { kind: FieldKind, src: u16, field_idx: u32 },
    Invoke { dispatch: Dispatch, method_idx: u32, args: Vec<u16> },
    Unary { op: UnaryOp, dst: u16, src: u16 },
    Binary { op: ArithOp, ty: NumType, dst: u16, a: u16, b: u16 },
    BinaryLit { op: ArithOp, dst: u16, src: u16, literal: i32 },
}

/// An instruction and the number of code units it occupies.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub op: Op,
    pub width: usize,
}

/// Operands unpacked according to the instruction format.
#[derive(Debug, Default)]
struct Operands {
    a: u16,
    b: u16,
    c: u16,
    lit: i64,
    index: u32,
    args: Vec<u16>,
}

struct Units<'a> {
    code: &'a CodeItem,
    pc: usize,
}

impl Units<'_> {
    fn at(&self, i: usize) -> Result<u16> {
        self.code
            .unit(self.pc + i)
            .ok_or(RuntimeError::TruncatedInstruction { offset: self.pc })
    }

    fn u32_at(&self, i: usize) -> Result<u32> {
        Ok(u32::from(self.at(i)?) | u32::from(self.at(i + 1)?) << 16)
    }
}

fn operands(format: Format, units: &Units) -> Result<Operands> {
    let first = units.at(0)?;
    let hi = first >> 8;
    let (nib_a, nib_b) = (hi & 0x0f, hi >> 4);
    let mut o = Operands::default();
    match format {
        Format::F10x => {}
        Format::F12x => {
            o.a = nib_a;
            o.b = nib_b;
        }
        Format::F11n => {
            o.a = nib_a;
            o.lit = i64::from(((nib_b as u8) << 4) as i8 >> 4);
        }
        Format::F11x => o.a = hi,
        Format::F10t => o.lit = i64::from(hi as u8 as i8),
        Format::F20t => o.lit = i64::from(units.at(1)? as i16),
        Format::F22x => {
            o.a = hi;
            o.b = units.at(1)?;
        }
        Format::F21t | Format::F21s => {
            o.a = hi;
            o.lit = i64::from(units.at(1)? as i16);
        }
        Format::F21h => {
            o.a = hi;
            o.lit = i64::from(units.at(1)?);
        }
        Format::F21c => {
            o.a = hi;
            o.index = u32::from(units.at(1)?);
        }
        Format::F23x => {
            let next = units.at(1)?;
            o.a = hi;
            o.b = next & 0xff;
            o.c = next >> 8;
        }
        Format::F22b => {
            let next = units.at(1)?;
            o.a = hi;
            o.b = next & 0xff;
            o.lit = i64::from((next >> 8) as u8 as i8);
        }
        Format::F22t | Format::F22s => {
            o.a = nib_a;
            o.b = nib_b;
            o.lit = i64::from(units.at(1)? as i16);
        }
        Format::F22c => {
            o.a = nib_a;
            o.b = nib_b;
            o.index = u32::from(units.at(1)?);
        }
        Format::F32x => {
            o.a = units.at(1)?;
            o.b = units.at(2)?;
        }
        Format::F30t => o.lit = i64::from(units.u32_at(1)? as i32),
        Format::F31t | Format::F31i => {
            o.a = hi;
            o.lit = i64::from(units.u32_at(1)? as i32);
        }
        Format::F31c => {
            o.a = hi;
            o.index = units.u32_at(1)?;
        }
        Format::F35c => {
            // A|G|op BBBB F|E|D|C
            let count = nib_b as usize;
            let regs = units.at(2)?;
            let all = [regs & 0xf, (regs >> 4) & 0xf, (regs >> 8) & 0xf, regs >> 12, nib_a];
            o.index = u32::from(units.at(1)?);
            o.args = all[..count.min(5)].to_vec();
        }
        Format::F3rc => {
            let first_reg = units.at(2)?;
            o.index = u32::from(units.at(1)?);
            o.args = (0..hi).map(|i| first_reg.wrapping_add(i)).collect();
        }
        Format::F51l => {
            o.a = hi;
            let lo = u64::from(units.u32_at(1)?);
            let high = u64::from(units.u32_at(3)?);
            o.lit = (high << 32 | lo) as i64;
        }
    }
    Ok(o)
}

/// Number of code units a payload table occupies, identifier included.
fn payload_width(units: &Units, ident: u16) -> Result<usize> {
    let size = units.at(1)? as usize;
    Ok(match ident {
        PACKED_SWITCH_PAYLOAD => 4 + size * 2,
        SPARSE_SWITCH_PAYLOAD => 2 + size * 4,
        _ => {
            let count = units.u32_at(2)? as usize;
            4 + (size * count).div_ceil(2)
        }
    })
}

/// Decodes the instruction starting at `pc`.
pub fn decode(code: &CodeItem, pc: usize) -> Result<Decoded> {
    let units = Units { code, pc };
    let first = units.at(0)?;
    let byte = (first & 0xff) as u8;

    if byte == 0 && matches!(
        first,
        PACKED_SWITCH_PAYLOAD | SPARSE_SWITCH_PAYLOAD | FILL_ARRAY_DATA_PAYLOAD
    ) {
        return Ok(Decoded {
            op: Op::Payload,
            width: payload_width(&units, first)?,
        });
    }

    let opcode = OPCode::from(byte);
    let format = opcode
        .format()
        .ok_or(RuntimeError::UnknownOpcode { opcode: byte, offset: pc })?;
    let width = format.width();
    // Read the last unit up front so a short stream fails before decoding.
    units.at(width - 1)?;
    let o = operands(format, &units)?;

    let op = match byte {
        0x00 => Op::Nop,
        0x01..=0x09 => Op::Move {
            kind: match (byte - 1) / 3 {
                0 => RegKind::Single,
                1 => RegKind::Wide,
                _ => RegKind::Object,
            },
            dst: o.a,
            src: o.b,
        },
        0x0a => Op::MoveResult { kind: RegKind::Single, dst: o.a },
        0x0b => Op::MoveResult { kind: RegKind::Wide, dst: o.a },
        0x0c => Op::MoveResult { kind: RegKind::Object, dst: o.a },
        0x0d => Op::MoveException { dst: o.a },
        0x0e => Op::ReturnVoid,
        0x0f => Op::Return { kind: RegKind::Single, src: o.a },
        0x10 => Op::Return { kind: RegKind::Wide, src: o.a },
        0x11 => Op::Return { kind: RegKind::Object, src: o.a },
        0x12 | 0x13 | 0x14 => Op::Const { dst: o.a, value: o.lit as i32 },
        0x15 => Op::Const { dst: o.a, value: ((o.lit as u32) << 16) as i32 },
        0x16 | 0x17 | 0x18 => Op::ConstWide { dst: o.a, value: o.lit },
        0x19 => Op::ConstWide { dst: o.a, value: ((o.lit as u64) << 48) as i64 },
        0x1a | 0x1b => Op::ConstString { dst: o.a, string_idx: o.index },
        0x1c => Op::ConstClass { dst: o.a, type_idx: o.index },
        0x1d => Op::MonitorEnter { obj: o.a },
        0x1e => Op::MonitorExit { obj: o.a },
        0x1f => Op::CheckCast { obj: o.a, type_idx: o.index },
        0x20 => Op::InstanceOf { dst: o.a, obj: o.b, type_idx: o.index },
        0x21 => Op::ArrayLength { dst: o.a, array: o.b },
        0x22 => Op::NewInstance { dst: o.a, type_idx: o.index },
        0x23 => Op::NewArray { dst: o.a, size: o.b, type_idx: o.index },
        0x24 | 0x25 => Op::FilledNewArray { type_idx: o.index, args: o.args },
        0x26 => Op::FillArrayData { array: o.a, payload: o.lit as i32 },
        0x27 => Op::Throw { exception: o.a },
        0x28..=0x2a => Op::Goto { offset: o.lit as i32 },
        0x2b => Op::PackedSwitch { test: o.a, payload: o.lit as i32 },
        0x2c => Op::SparseSwitch { test: o.a, payload: o.lit as i32 },
        0x2d..=0x31 => Op::Compare {
            op: [
                CmpOp::CmplFloat,
                CmpOp::CmpgFloat,
                CmpOp::CmplDouble,
                CmpOp::CmpgDouble,
                CmpOp::CmpLong,
            ][(byte - 0x2d) as usize],
            dst: o.a,
            a: o.b,
            b: o.c,
        },
        0x32..=0x37 => Op::If {
            cond: CONDS[(byte - 0x32) as usize],
            a: o.a,
            b: o.b,
            offset: o.lit as i32,
        },
        0x38..=0x3d => Op::IfZero {
            cond: CONDS[(byte - 0x38) as usize],
            a: o.a,
            offset: o.lit as i32,
        },
        0x44..=0x4a => Op::ArrayGet {
            kind: FIELD_KINDS[(byte - 0x44) as usize],
            dst: o.a,
            array: o.b,
            index: o.c,
        },
        0x4b..=0x51 => Op::ArrayPut {
            kind: FIELD_KINDS[(byte - 0x4b) as usize],
            src: o.a,
            array: o.b,
            index: o.c,
        },
        0x52..=0x58 => Op::InstanceGet {
            kind: FIELD_KINDS[(byte - 0x52) as usize],
            dst: o.a,
            obj: o.b,
            field_idx: o.index,
        },
        0x59..=0x5f => Op::InstancePut {
            kind: FIELD_KINDS[(byte - 0x59) as usize],
            src: o.a,
            obj: o.b,
            field_idx: o.index,
        },
        0x60..=0x66 => Op::StaticGet {
            kind: FIELD_KINDS[(byte - 0x60) as usize],
            dst: o.a,
            field_idx: o.index,
        },
        0x67..=0x6d => Op::StaticPut {
            kind: FIELD_KINDS[(byte - 0x67) as usize],
            src: o.a,
            field_idx: o.index,
        },
        0x6e..=0x72 | 0x74..=0x78 => {
            let dispatch = match (byte - 0x6e) % 6 {
                0 => Dispatch::VirtualByReceiverClass,
                1 => Dispatch::Super,
                2 => Dispatch::Direct,
                3 => Dispatch::Static,
                _ => Dispatch::InterfaceByReceiverClass,
            };
            Op::Invoke {
                dispatch,
                method_idx: o.index,
                args: o.args,
            }
        }
        0x7b..=0x8f => Op::Unary {
            op: UNARY_OPS[(byte - 0x7b) as usize],
            dst: o.a,
            src: o.b,
        },
        0x90..=0xaf => {
            let (op, ty) = binary_op(byte - 0x90);
            Op::Binary { op, ty, dst: o.a, a: o.b, b: o.c }
        }
        0xb0..=0xcf => {
            let (op, ty) = binary_op(byte - 0xb0);
            Op::Binary { op, ty, dst: o.a, a: o.a, b: o.b }
        }
        0xd0..=0xd7 | 0xd8..=0xe2 => {
            let base = if byte >= 0xd8 { 0xd8 } else { 0xd0 };
            Op::BinaryLit {
                op: LIT_OPS[(byte - base) as usize],
                dst: o.a,
                src: o.b,
                literal: o.lit as i32,
            }
        }
        _ => return Err(RuntimeError::UnknownOpcode { opcode: byte, offset: pc }),
    };
    Ok(Decoded { op, width })
}

/// Decodes a whole method with a linear sweep. Each entry is the address of
/// an instruction and the instruction; the sweep stops at the first unit
/// that does not decode.
pub fn decode_all(code: &CodeItem) -> (Vec<(usize, Decoded)>, Option<RuntimeError>) {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        match decode(code, pc) {
            Ok(decoded) => {
                let width = decoded.width;
                out.push((pc, decoded));
                pc += width;
            }
            Err(err) => return (out, Some(err)),
        }
    }
    (out, None)
}

/// Renders a method body one instruction per line.
pub fn disassemble(code: &CodeItem) -> Vec<String> {
    let (decoded, err) = decode_all(code);
    let mut lines: Vec<String> = decoded
        .iter()
        .map(|(pc, d)| {
            let mnemonic = match d.op {
                Op::Payload => "payload",
                _ => code
                    .unit(*pc)
                    .map(|u| OPCode::from((u & 0xff) as u8).mnemonic())
                    .unwrap_or("?"),
            };
            format!("{pc:04x}: {mnemonic:<24} {:?}", d.op)
        })
        .collect();
    if let Some(err) = err {
        lines.push(format!("; {err}"));
    }
    lines
}
