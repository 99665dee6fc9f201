//! Instruction-level editing of method bodies.
//!
//! Bytecode is decoded into a list of instructions whose branch targets are
//! the *original* offsets of the instructions they point at. Edits insert new
//! instructions into that list; reassembly lays the list out again, recomputes
//! switch padding and `wide` prefixes, and yields a map from every original
//! instruction offset to its new position so the offset-bearing tables of the
//! `Code` attribute can be rewritten.
//!
//! A short branch pushed out of 16-bit range by an edit is widened:
//! `goto`/`jsr` become `goto_w`/`jsr_w`, and a conditional branch is inverted
//! to skip over a `goto_w` aimed at the original target.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::bytes::{ByteReader, ByteWriter};
use super::frames;
use super::opcodes::*;
use super::pool::ConstantPool;
use super::{Attribute, Code};
use crate::error::ClassFormatError;

/// Original bytecode offset of a branch target.
pub type Label = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// Any opcode without operands.
    Simple(u8),
    /// `bipush` or `sipush`.
    Push { opcode: u8, value: i16 },
    NewArray(u8),
    /// `xload`, `xstore` and `ret` with an explicit index.
    Local { opcode: u8, index: u16 },
    Iinc { index: u16, delta: i16 },
    Ldc { index: u16, wide: bool },
    Ldc2 { index: u16 },
    /// Field access, `invokevirtual`/`invokespecial`/`invokestatic`, `new`,
    /// `anewarray`, `checkcast` and `instanceof`.
    Member { opcode: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    MultiANewArray { index: u16, dimensions: u8 },
    Jump { opcode: u8, target: Label },
    TableSwitch {
        default: Label,
        low: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

impl Insn {
    pub fn is_return(&self) -> bool {
        matches!(self, Insn::Simple(op) if (IRETURN..=RETURN).contains(op))
    }

    fn size_at(&self, offset: u32) -> u32 {
        match self {
            Insn::Simple(_) => 1,
            Insn::Push { opcode, .. } => {
                if *opcode == BIPUSH {
                    2
                } else {
                    3
                }
            }
            Insn::NewArray(_) => 2,
            Insn::Local { index, .. } => {
                if *index <= u8::MAX as u16 {
                    2
                } else {
                    4
                }
            }
            Insn::Iinc { index, delta } => {
                if iinc_is_narrow(*index, *delta) {
                    3
                } else {
                    6
                }
            }
            Insn::Ldc { index, wide } => {
                if !*wide && *index <= u8::MAX as u16 {
                    2
                } else {
                    3
                }
            }
            Insn::Ldc2 { .. } | Insn::Member { .. } => 3,
            Insn::InvokeInterface { .. } | Insn::InvokeDynamic { .. } => 5,
            Insn::MultiANewArray { .. } => 4,
            Insn::Jump { opcode, .. } => {
                if is_wide_jump(*opcode) {
                    5
                } else {
                    3
                }
            }
            Insn::TableSwitch { targets, .. } => {
                1 + switch_padding(offset) + 12 + 4 * targets.len() as u32
            }
            Insn::LookupSwitch { pairs, .. } => {
                1 + switch_padding(offset) + 8 + 8 * pairs.len() as u32
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    /// Original offset, if this instruction (or the sequence it now heads)
    /// replaced one that existed before editing.
    pub origin: Option<u32>,
    pub insn: Insn,
}

#[derive(Debug, Clone)]
pub struct InsnList {
    pub nodes: Vec<Node>,
    code_length: u32,
}

/// Original offset → reassembled offset, including the end-of-code offset.
#[derive(Debug, Clone, Default)]
pub struct OffsetMap {
    map: HashMap<u32, u32>,
}

impl OffsetMap {
    pub fn get(&self, original: u32) -> Option<u32> {
        self.map.get(&original).copied()
    }

    pub(crate) fn require(&self, table: &'static str, original: u32) -> Result<u32, ClassFormatError> {
        self.get(original)
            .ok_or(ClassFormatError::InvalidTableOffset {
                table,
                offset: original,
            })
    }
}

pub struct Assembled {
    pub bytecode: Vec<u8>,
    pub offsets: OffsetMap,
    /// Reassembled offset of every node.
    pub positions: Vec<u32>,
    /// Nodes of conditional branches inverted around a `goto_w`, ascending.
    /// The instruction after each one has become a branch target.
    pub inverted: Vec<usize>,
}

/// The method whose body is being edited.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MethodContext<'a> {
    pub owner: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
    pub is_static: bool,
}

impl InsnList {
    /// Builds a list for freshly generated code that has no original offsets.
    pub fn from_insns(insns: Vec<Insn>) -> Self {
        Self {
            nodes: insns
                .into_iter()
                .map(|insn| Node { origin: None, insn })
                .collect(),
            code_length: 0,
        }
    }

    pub fn decode(bytecode: &[u8]) -> Result<Self, ClassFormatError> {
        let mut reader = ByteReader::new(bytecode);
        let mut nodes = Vec::new();

        while reader.remaining() > 0 {
            let offset = reader.position() as u32;
            let opcode = reader.read_u1()?;
            let insn = decode_one(&mut reader, opcode, offset)?;
            nodes.push(Node {
                origin: Some(offset),
                insn,
            });
        }

        let list = Self {
            nodes,
            code_length: bytecode.len() as u32,
        };
        list.check_targets()?;
        Ok(list)
    }

    fn check_targets(&self) -> Result<(), ClassFormatError> {
        let starts: HashSet<u32> = self.nodes.iter().filter_map(|n| n.origin).collect();
        for node in &self.nodes {
            let offset = node.origin.unwrap_or_default();
            for target in targets(&node.insn) {
                if !starts.contains(&target) {
                    return Err(ClassFormatError::InvalidBranchTarget {
                        offset,
                        target: target as i64,
                    });
                }
            }
        }
        Ok(())
    }

    /// Inserts `insns` before the node at `index`. The inserted sequence takes
    /// over the original offset so that branches, handlers and frames aimed at
    /// the old instruction now land on the start of the sequence.
    pub fn insert_before(&mut self, index: usize, insns: Vec<Insn>) {
        if insns.is_empty() {
            return;
        }
        let origin = self.nodes[index].origin.take();
        let mut inserted: Vec<Node> = insns
            .into_iter()
            .map(|insn| Node { origin: None, insn })
            .collect();
        inserted[0].origin = origin;
        self.nodes.splice(index..index, inserted);
    }

    /// Inserts the sequence produced by `make` before every return instruction.
    /// Returns how many return points were patched.
    pub fn insert_before_returns(&mut self, mut make: impl FnMut() -> Vec<Insn>) -> usize {
        let returns: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.insn.is_return())
            .map(|(i, _)| i)
            .collect();

        // Back to front so earlier indexes stay valid.
        for index in returns.iter().rev() {
            let insns = make();
            self.insert_before(*index, insns);
        }
        returns.len()
    }

    pub fn assemble(&self) -> Result<Assembled, ClassFormatError> {
        // Widening only ever grows the code, so each round either settles or
        // widens at least one more branch.
        let mut widened: HashSet<usize> = HashSet::new();
        loop {
            let (positions, offsets) = self.layout(&widened);
            let overflowing: Vec<usize> = self
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(i, node)| match &node.insn {
                    Insn::Jump { opcode, target }
                        if !is_wide_jump(*opcode) && !widened.contains(&i) =>
                    {
                        let to = offsets.get(*target)?;
                        i16::try_from(to as i64 - positions[i] as i64)
                            .is_err()
                            .then_some(i)
                    }
                    _ => None,
                })
                .collect();

            if !overflowing.is_empty() {
                widened.extend(overflowing);
                continue;
            }

            let mut w = ByteWriter::new();
            for (i, (node, &at)) in self.nodes.iter().zip(positions.iter()).enumerate() {
                if widened.contains(&i) {
                    encode_widened(&mut w, &node.insn, at, &offsets)?;
                } else {
                    encode_one(&mut w, &node.insn, at, &offsets)?;
                }
            }

            let mut inverted: Vec<usize> = widened
                .iter()
                .copied()
                .filter(|i| {
                    matches!(self.nodes[*i].insn, Insn::Jump { opcode, .. } if opcode != GOTO && opcode != JSR)
                })
                .collect();
            inverted.sort_unstable();
            if !widened.is_empty() {
                debug!(
                    widened = widened.len(),
                    inverted = inverted.len(),
                    "widened out-of-range branches"
                );
            }

            return Ok(Assembled {
                bytecode: w.into_inner(),
                offsets,
                positions,
                inverted,
            });
        }
    }

    fn layout(&self, widened: &HashSet<usize>) -> (Vec<u32>, OffsetMap) {
        let mut positions = Vec::with_capacity(self.nodes.len());
        let mut offsets = OffsetMap::default();
        let mut offset = 0u32;
        for (i, node) in self.nodes.iter().enumerate() {
            positions.push(offset);
            if let Some(origin) = node.origin {
                offsets.map.insert(origin, offset);
            }
            offset += if widened.contains(&i) {
                widened_size(&node.insn)
            } else {
                node.insn.size_at(offset)
            };
        }
        offsets.map.insert(self.code_length, offset);
        (positions, offsets)
    }
}

impl Code {
    /// Decodes the body, applies `edit`, reassembles and rewrites every
    /// offset-bearing table. Marks the code for `max_stack`/`max_locals`
    /// recomputation at encode time.
    pub(crate) fn edit<T>(
        &mut self,
        pool: &mut ConstantPool,
        method: &MethodContext<'_>,
        edit: impl FnOnce(&mut InsnList) -> T,
    ) -> Result<T, ClassFormatError> {
        let mut list = InsnList::decode(&self.bytecode)?;
        let result = edit(&mut list);
        let assembled = list.assemble()?;
        let map = &assembled.offsets;

        for handler in &mut self.exception_table {
            handler.start_pc = narrow(map.require("exception table", handler.start_pc as u32)?);
            handler.end_pc = narrow(map.require("exception table", handler.end_pc as u32)?);
            handler.handler_pc = narrow(map.require("exception table", handler.handler_pc as u32)?);
        }

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for attribute in self.attributes.drain(..) {
            let name = pool.utf8(attribute.name_index)?;
            let info = match name.as_str() {
                "StackMapTable" => {
                    frames::rewrite(&attribute.info, &list, &assembled, pool, method)?
                }
                "LineNumberTable" => remap_line_numbers(&attribute.info, map)?,
                "LocalVariableTable" | "LocalVariableTypeTable" => {
                    remap_local_variables(&attribute.info, map)?
                }
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    debug!(attribute = %name, "dropping type annotations of edited code");
                    continue;
                }
                _ => attribute.info,
            };
            attributes.push(Attribute {
                name_index: attribute.name_index,
                info,
            });
        }
        self.attributes = attributes;
        self.bytecode = assembled.bytecode;
        self.recompute_maxs = true;
        Ok(result)
    }
}

fn narrow(offset: u32) -> u16 {
    offset as u16
}

fn remap_line_numbers(info: &[u8], map: &OffsetMap) -> Result<Vec<u8>, ClassFormatError> {
    let mut reader = ByteReader::new(info);
    let mut w = ByteWriter::new();
    let count = reader.read_u2()?;
    w.u2(count);
    for _ in 0..count {
        let start = reader.read_u2()? as u32;
        let line = reader.read_u2()?;
        w.u2(narrow(map.require("LineNumberTable", start)?));
        w.u2(line);
    }
    Ok(w.into_inner())
}

fn remap_local_variables(info: &[u8], map: &OffsetMap) -> Result<Vec<u8>, ClassFormatError> {
    let mut reader = ByteReader::new(info);
    let mut w = ByteWriter::new();
    let count = reader.read_u2()?;
    w.u2(count);
    for _ in 0..count {
        let start = reader.read_u2()? as u32;
        let length = reader.read_u2()? as u32;
        let new_start = map.require("LocalVariableTable", start)?;
        let new_end = map.require("LocalVariableTable", start + length)?;
        w.u2(narrow(new_start));
        w.u2(narrow(new_end - new_start));
        w.bytes(reader.read_slice(6)?);
    }
    Ok(w.into_inner())
}

fn switch_padding(offset: u32) -> u32 {
    (4 - (offset + 1) % 4) % 4
}

fn is_wide_jump(opcode: u8) -> bool {
    opcode == GOTO_W || opcode == JSR_W
}

fn widened_size(insn: &Insn) -> u32 {
    match insn {
        Insn::Jump { opcode, .. } if *opcode == GOTO || *opcode == JSR => 5,
        // Inverted conditional (3) followed by goto_w (5).
        _ => 8,
    }
}

fn inverse_condition(opcode: u8) -> u8 {
    match opcode {
        IFNULL => IFNONNULL,
        IFNONNULL => IFNULL,
        _ if (opcode - IFEQ) % 2 == 0 => opcode + 1,
        _ => opcode - 1,
    }
}

fn iinc_is_narrow(index: u16, delta: i16) -> bool {
    index <= u8::MAX as u16 && (i8::MIN as i16..=i8::MAX as i16).contains(&delta)
}

pub(crate) fn targets(insn: &Insn) -> Vec<Label> {
    match insn {
        Insn::Jump { target, .. } => vec![*target],
        Insn::TableSwitch {
            default, targets, ..
        } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
        Insn::LookupSwitch { default, pairs } => std::iter::once(*default)
            .chain(pairs.iter().map(|(_, t)| *t))
            .collect(),
        _ => Vec::new(),
    }
}

fn relative(offset: u32, delta: i32) -> Label {
    // Negative targets can never match an instruction start.
    Label::try_from(offset as i64 + delta as i64).unwrap_or(Label::MAX)
}

fn decode_one(
    reader: &mut ByteReader<'_>,
    opcode: u8,
    offset: u32,
) -> Result<Insn, ClassFormatError> {
    let insn = match opcode {
        NOP..=DCONST_1
        | IALOAD..=SALOAD
        | IASTORE..=LXOR
        | I2L..=DCMPG
        | IRETURN..=RETURN
        | ARRAYLENGTH
        | ATHROW
        | MONITORENTER
        | MONITOREXIT => Insn::Simple(opcode),
        ILOAD_0..=ALOAD_3 | ISTORE_0..=ASTORE_3 => Insn::Simple(opcode),
        BIPUSH => Insn::Push {
            opcode,
            value: reader.read_i1()? as i16,
        },
        SIPUSH => Insn::Push {
            opcode,
            value: reader.read_i2()?,
        },
        LDC => Insn::Ldc {
            index: reader.read_u1()? as u16,
            wide: false,
        },
        LDC_W => Insn::Ldc {
            index: reader.read_u2()?,
            wide: true,
        },
        LDC2_W => Insn::Ldc2 {
            index: reader.read_u2()?,
        },
        ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Local {
            opcode,
            index: reader.read_u1()? as u16,
        },
        IINC => Insn::Iinc {
            index: reader.read_u1()? as u16,
            delta: reader.read_i1()? as i16,
        },
        IFEQ..=JSR | IFNULL | IFNONNULL => Insn::Jump {
            opcode,
            target: relative(offset, reader.read_i2()? as i32),
        },
        GOTO_W | JSR_W => Insn::Jump {
            opcode,
            target: relative(offset, reader.read_i4()?),
        },
        TABLESWITCH => {
            reader.skip(switch_padding(offset) as usize)?;
            let default = relative(offset, reader.read_i4()?);
            let low = reader.read_i4()?;
            let high = reader.read_i4()?;
            if high < low {
                return Err(ClassFormatError::InvalidOpcode { opcode, offset });
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            let mut targets = Vec::with_capacity(count.min(reader.remaining() / 4));
            for _ in 0..count {
                targets.push(relative(offset, reader.read_i4()?));
            }
            Insn::TableSwitch {
                default,
                low,
                targets,
            }
        }
        LOOKUPSWITCH => {
            reader.skip(switch_padding(offset) as usize)?;
            let default = relative(offset, reader.read_i4()?);
            let count = reader.read_i4()?;
            if count < 0 {
                return Err(ClassFormatError::InvalidOpcode { opcode, offset });
            }
            let mut pairs = Vec::with_capacity((count as usize).min(reader.remaining() / 8));
            for _ in 0..count {
                let key = reader.read_i4()?;
                pairs.push((key, relative(offset, reader.read_i4()?)));
            }
            Insn::LookupSwitch { default, pairs }
        }
        GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Insn::Member {
            opcode,
            index: reader.read_u2()?,
        },
        INVOKEINTERFACE => {
            let index = reader.read_u2()?;
            let count = reader.read_u1()?;
            reader.read_u1()?;
            Insn::InvokeInterface { index, count }
        }
        INVOKEDYNAMIC => {
            let index = reader.read_u2()?;
            reader.read_u2()?;
            Insn::InvokeDynamic { index }
        }
        NEWARRAY => Insn::NewArray(reader.read_u1()?),
        MULTIANEWARRAY => Insn::MultiANewArray {
            index: reader.read_u2()?,
            dimensions: reader.read_u1()?,
        },
        WIDE => {
            let inner = reader.read_u1()?;
            match inner {
                IINC => Insn::Iinc {
                    index: reader.read_u2()?,
                    delta: reader.read_i2()?,
                },
                ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Local {
                    opcode: inner,
                    index: reader.read_u2()?,
                },
                _ => {
                    return Err(ClassFormatError::InvalidOpcode {
                        opcode: inner,
                        offset,
                    });
                }
            }
        }
        _ => return Err(ClassFormatError::InvalidOpcode { opcode, offset }),
    };
    Ok(insn)
}

fn encode_one(
    w: &mut ByteWriter,
    insn: &Insn,
    at: u32,
    offsets: &OffsetMap,
) -> Result<(), ClassFormatError> {
    let resolve = |target: Label| -> Result<i64, ClassFormatError> {
        let new = offsets
            .get(target)
            .ok_or(ClassFormatError::InvalidBranchTarget {
                offset: at,
                target: target as i64,
            })?;
        Ok(new as i64 - at as i64)
    };

    match insn {
        Insn::Simple(op) => w.u1(*op),
        Insn::Push { opcode, value } => {
            w.u1(*opcode);
            if *opcode == BIPUSH {
                w.u1(*value as i8 as u8);
            } else {
                w.u2(*value as u16);
            }
        }
        Insn::NewArray(kind) => {
            w.u1(NEWARRAY);
            w.u1(*kind);
        }
        Insn::Local { opcode, index } => {
            if *index <= u8::MAX as u16 {
                w.u1(*opcode);
                w.u1(*index as u8);
            } else {
                w.u1(WIDE);
                w.u1(*opcode);
                w.u2(*index);
            }
        }
        Insn::Iinc { index, delta } => {
            if iinc_is_narrow(*index, *delta) {
                w.u1(IINC);
                w.u1(*index as u8);
                w.u1(*delta as i8 as u8);
            } else {
                w.u1(WIDE);
                w.u1(IINC);
                w.u2(*index);
                w.u2(*delta as u16);
            }
        }
        Insn::Ldc { index, wide } => {
            if !*wide && *index <= u8::MAX as u16 {
                w.u1(LDC);
                w.u1(*index as u8);
            } else {
                w.u1(LDC_W);
                w.u2(*index);
            }
        }
        Insn::Ldc2 { index } => {
            w.u1(LDC2_W);
            w.u2(*index);
        }
        Insn::Member { opcode, index } => {
            w.u1(*opcode);
            w.u2(*index);
        }
        Insn::InvokeInterface { index, count } => {
            w.u1(INVOKEINTERFACE);
            w.u2(*index);
            w.u1(*count);
            w.u1(0);
        }
        Insn::InvokeDynamic { index } => {
            w.u1(INVOKEDYNAMIC);
            w.u2(*index);
            w.u2(0);
        }
        Insn::MultiANewArray { index, dimensions } => {
            w.u1(MULTIANEWARRAY);
            w.u2(*index);
            w.u1(*dimensions);
        }
        Insn::Jump { opcode, target } => {
            let delta = resolve(*target)?;
            w.u1(*opcode);
            if is_wide_jump(*opcode) {
                w.u4(delta as i32 as u32);
            } else {
                let short = i16::try_from(delta).map_err(|_| ClassFormatError::BranchOutOfRange {
                    from: at,
                    to: (at as i64 + delta) as u32,
                })?;
                w.u2(short as u16);
            }
        }
        Insn::TableSwitch {
            default,
            low,
            targets,
        } => {
            w.u1(TABLESWITCH);
            for _ in 0..switch_padding(at) {
                w.u1(0);
            }
            w.u4(resolve(*default)? as i32 as u32);
            w.u4(*low as u32);
            w.u4((*low as i64 + targets.len() as i64 - 1) as i32 as u32);
            for target in targets {
                w.u4(resolve(*target)? as i32 as u32);
            }
        }
        Insn::LookupSwitch { default, pairs } => {
            w.u1(LOOKUPSWITCH);
            for _ in 0..switch_padding(at) {
                w.u1(0);
            }
            w.u4(resolve(*default)? as i32 as u32);
            w.u4(pairs.len() as u32);
            for (key, target) in pairs {
                w.u4(*key as u32);
                w.u4(resolve(*target)? as i32 as u32);
            }
        }
    }
    Ok(())
}

fn encode_widened(
    w: &mut ByteWriter,
    insn: &Insn,
    at: u32,
    offsets: &OffsetMap,
) -> Result<(), ClassFormatError> {
    let Insn::Jump { opcode, target } = insn else {
        return encode_one(w, insn, at, offsets);
    };
    let to = offsets
        .get(*target)
        .ok_or(ClassFormatError::InvalidBranchTarget {
            offset: at,
            target: *target as i64,
        })? as i64;

    match *opcode {
        GOTO | JSR => {
            w.u1(if *opcode == GOTO { GOTO_W } else { JSR_W });
            w.u4((to - at as i64) as i32 as u32);
        }
        _ => {
            w.u1(inverse_condition(*opcode));
            w.u2(8);
            w.u1(GOTO_W);
            w.u4((to - (at as i64 + 3)) as i32 as u32);
        }
    }
    Ok(())
}
