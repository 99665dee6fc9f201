//! `StackMapTable` decoding, encoding and rewriting for edited code.

use super::bytes::{ByteReader, ByteWriter};
use super::code::{Assembled, Insn, InsnList, MethodContext, OffsetMap};
use super::descriptor::{method_shape, split_method};
use super::opcodes::*;
use super::pool::{Constant, ConstantPool};
use crate::error::ClassFormatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerificationType {
    /// Top, Integer, Float, Double, Long, Null, UninitializedThis.
    Simple(u8),
    Object(u16),
    Uninitialized(u32),
}

const TOP: VerificationType = VerificationType::Simple(0);
const INTEGER: VerificationType = VerificationType::Simple(1);
const FLOAT: VerificationType = VerificationType::Simple(2);
const DOUBLE: VerificationType = VerificationType::Simple(3);
const LONG: VerificationType = VerificationType::Simple(4);
const NULL: VerificationType = VerificationType::Simple(5);
const UNINITIALIZED_THIS: VerificationType = VerificationType::Simple(6);

impl VerificationType {
    fn is_wide(self) -> bool {
        self == LONG || self == DOUBLE
    }

    fn slots(self) -> usize {
        if self.is_wide() { 2 } else { 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameKind {
    Same,
    SameLocals1(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    offset: u32,
    kind: FrameKind,
}

/// Locals and operand stack in slot form: a long or double takes its own
/// entry followed by `TOP`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct State {
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
}

/// Rewrites a `StackMapTable` for reassembled code. Every frame (and every
/// uninitialized `new` reference) follows its instruction. When a conditional
/// branch was inverted around a `goto_w`, the instruction after it gets a
/// frame of its own and the whole table is written as full frames.
pub(crate) fn rewrite(
    info: &[u8],
    list: &InsnList,
    assembled: &Assembled,
    pool: &mut ConstantPool,
    method: &MethodContext<'_>,
) -> Result<Vec<u8>, ClassFormatError> {
    let frames = remap_frames(info, &assembled.offsets)?;
    if assembled.inverted.is_empty() {
        return Ok(write(&frames));
    }

    let initial = initial_locals(pool, method)?;
    let mut states = materialize(&frames, &initial);
    for &branch in &assembled.inverted {
        if branch + 1 >= list.nodes.len() {
            continue;
        }
        let next = assembled.positions[branch + 1];
        if states.iter().any(|(offset, _)| *offset == next) {
            continue;
        }
        let state = state_after(list, &assembled.positions, &states, &initial, branch, pool, method)?;
        states.push((next, state));
    }
    states.sort_by_key(|(offset, _)| *offset);

    let full: Vec<Frame> = states
        .into_iter()
        .map(|(offset, state)| Frame {
            offset,
            kind: FrameKind::Full {
                locals: compact(&state.locals, true),
                stack: compact(&state.stack, false),
            },
        })
        .collect();
    Ok(write(&full))
}

#[cfg(test)]
fn remap(info: &[u8], map: &OffsetMap) -> Result<Vec<u8>, ClassFormatError> {
    Ok(write(&remap_frames(info, map)?))
}

fn remap_frames(info: &[u8], map: &OffsetMap) -> Result<Vec<Frame>, ClassFormatError> {
    let frames = parse(info)?;
    let mut remapped = Vec::with_capacity(frames.len());
    for frame in frames {
        let offset = map.require("StackMapTable", frame.offset)?;
        let kind = match frame.kind {
            FrameKind::SameLocals1(vt) => FrameKind::SameLocals1(remap_type(vt, map)?),
            FrameKind::Append(types) => FrameKind::Append(remap_types(types, map)?),
            FrameKind::Full { locals, stack } => FrameKind::Full {
                locals: remap_types(locals, map)?,
                stack: remap_types(stack, map)?,
            },
            other => other,
        };
        remapped.push(Frame { offset, kind });
    }
    Ok(remapped)
}

fn remap_types(
    types: Vec<VerificationType>,
    map: &OffsetMap,
) -> Result<Vec<VerificationType>, ClassFormatError> {
    types.into_iter().map(|vt| remap_type(vt, map)).collect()
}

fn remap_type(vt: VerificationType, map: &OffsetMap) -> Result<VerificationType, ClassFormatError> {
    match vt {
        VerificationType::Uninitialized(offset) => Ok(VerificationType::Uninitialized(
            map.require("StackMapTable", offset)?,
        )),
        other => Ok(other),
    }
}

fn parse(info: &[u8]) -> Result<Vec<Frame>, ClassFormatError> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u2()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<u32> = None;

    for _ in 0..count {
        let frame_type = reader.read_u1()?;
        let (delta, kind) = match frame_type {
            0..=63 => (frame_type as u32, FrameKind::Same),
            64..=127 => (
                (frame_type - 64) as u32,
                FrameKind::SameLocals1(read_type(&mut reader)?),
            ),
            247 => {
                let delta = reader.read_u2()? as u32;
                (delta, FrameKind::SameLocals1(read_type(&mut reader)?))
            }
            248..=250 => (reader.read_u2()? as u32, FrameKind::Chop(251 - frame_type)),
            251 => (reader.read_u2()? as u32, FrameKind::Same),
            252..=254 => {
                let delta = reader.read_u2()? as u32;
                let types = read_types(&mut reader, (frame_type - 251) as u16)?;
                (delta, FrameKind::Append(types))
            }
            255 => {
                let delta = reader.read_u2()? as u32;
                let locals_count = reader.read_u2()?;
                let locals = read_types(&mut reader, locals_count)?;
                let stack_count = reader.read_u2()?;
                let stack = read_types(&mut reader, stack_count)?;
                (delta, FrameKind::Full { locals, stack })
            }
            _ => return Err(ClassFormatError::InvalidFrameType { frame_type }),
        };

        let offset = match previous {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        previous = Some(offset);
        frames.push(Frame { offset, kind });
    }

    if reader.remaining() != 0 {
        return Err(ClassFormatError::AttributeLength {
            name: "StackMapTable".to_string(),
            declared: info.len(),
            actual: reader.position(),
        });
    }
    Ok(frames)
}

fn read_types(
    reader: &mut ByteReader<'_>,
    count: u16,
) -> Result<Vec<VerificationType>, ClassFormatError> {
    (0..count).map(|_| read_type(reader)).collect()
}

fn read_type(reader: &mut ByteReader<'_>) -> Result<VerificationType, ClassFormatError> {
    let tag = reader.read_u1()?;
    match tag {
        0..=6 => Ok(VerificationType::Simple(tag)),
        7 => Ok(VerificationType::Object(reader.read_u2()?)),
        8 => Ok(VerificationType::Uninitialized(reader.read_u2()? as u32)),
        _ => Err(ClassFormatError::InvalidFrameType { frame_type: tag }),
    }
}

fn write(frames: &[Frame]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.u2(frames.len() as u16);
    let mut previous: Option<u32> = None;

    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(prev) => frame.offset - prev - 1,
        };
        previous = Some(frame.offset);

        match &frame.kind {
            FrameKind::Same => {
                if delta < 64 {
                    w.u1(delta as u8);
                } else {
                    w.u1(251);
                    w.u2(delta as u16);
                }
            }
            FrameKind::SameLocals1(vt) => {
                if delta < 64 {
                    w.u1(64 + delta as u8);
                } else {
                    w.u1(247);
                    w.u2(delta as u16);
                }
                write_type(&mut w, vt);
            }
            FrameKind::Chop(k) => {
                w.u1(251 - k);
                w.u2(delta as u16);
            }
            FrameKind::Append(types) => {
                w.u1(251 + types.len() as u8);
                w.u2(delta as u16);
                for vt in types {
                    write_type(&mut w, vt);
                }
            }
            FrameKind::Full { locals, stack } => {
                w.u1(255);
                w.u2(delta as u16);
                w.u2(locals.len() as u16);
                for vt in locals {
                    write_type(&mut w, vt);
                }
                w.u2(stack.len() as u16);
                for vt in stack {
                    write_type(&mut w, vt);
                }
            }
        }
    }
    w.into_inner()
}

fn write_type(w: &mut ByteWriter, vt: &VerificationType) {
    match vt {
        VerificationType::Simple(tag) => w.u1(*tag),
        VerificationType::Object(index) => {
            w.u1(7);
            w.u2(*index);
        }
        VerificationType::Uninitialized(offset) => {
            w.u1(8);
            w.u2(*offset as u16);
        }
    }
}

/// Slot-form locals of the implicit frame at offset 0.
fn initial_locals(
    pool: &mut ConstantPool,
    method: &MethodContext<'_>,
) -> Result<Vec<VerificationType>, ClassFormatError> {
    let mut locals = Vec::new();
    if !method.is_static {
        if method.name == "<init>" && method.owner != "java/lang/Object" {
            locals.push(UNINITIALIZED_THIS);
        } else {
            locals.push(VerificationType::Object(pool.add_class(method.owner)?));
        }
    }
    let (parameters, _) = split_method(method.descriptor)?;
    for parameter in parameters {
        let vt = value_type(parameter, pool)?;
        locals.push(vt);
        if vt.is_wide() {
            locals.push(TOP);
        }
    }
    Ok(locals)
}

/// Expands the delta-encoded frames into full slot-form states.
fn materialize(frames: &[Frame], initial: &[VerificationType]) -> Vec<(u32, State)> {
    let mut locals = compact(initial, false);
    let mut states = Vec::with_capacity(frames.len());
    for frame in frames {
        let stack = match &frame.kind {
            FrameKind::Same => Vec::new(),
            FrameKind::SameLocals1(vt) => vec![*vt],
            FrameKind::Chop(k) => {
                locals.truncate(locals.len().saturating_sub(*k as usize));
                Vec::new()
            }
            FrameKind::Append(types) => {
                locals.extend_from_slice(types);
                Vec::new()
            }
            FrameKind::Full {
                locals: full,
                stack,
            } => {
                locals = full.clone();
                stack.clone()
            }
        };
        states.push((
            frame.offset,
            State {
                locals: expand(&locals),
                stack: expand(&stack),
            },
        ));
    }
    states
}

fn expand(types: &[VerificationType]) -> Vec<VerificationType> {
    let mut slots = Vec::with_capacity(types.len());
    for &vt in types {
        slots.push(vt);
        if vt.is_wide() {
            slots.push(TOP);
        }
    }
    slots
}

fn compact(slots: &[VerificationType], trim_top: bool) -> Vec<VerificationType> {
    let mut types = Vec::with_capacity(slots.len());
    let mut i = 0;
    while i < slots.len() {
        types.push(slots[i]);
        i += slots[i].slots();
    }
    if trim_top {
        while types.last() == Some(&TOP) {
            types.pop();
        }
    }
    types
}

/// State right after node `branch`, replayed from the closest preceding
/// frame (or the method entry).
fn state_after(
    list: &InsnList,
    positions: &[u32],
    states: &[(u32, State)],
    initial: &[VerificationType],
    branch: usize,
    pool: &mut ConstantPool,
    method: &MethodContext<'_>,
) -> Result<State, ClassFormatError> {
    let at = positions[branch];
    let closest = states
        .iter()
        .filter(|(offset, _)| *offset <= at)
        .max_by_key(|(offset, _)| *offset);
    let (start, mut state) = match closest {
        Some((offset, state)) => {
            let index = positions.binary_search(offset).map_err(|_| {
                ClassFormatError::InvalidTableOffset {
                    table: "StackMapTable",
                    offset: *offset,
                }
            })?;
            (index, state.clone())
        }
        None => (
            0,
            State {
                locals: initial.to_vec(),
                stack: Vec::new(),
            },
        ),
    };

    for index in start..=branch {
        step(&mut state, &list.nodes[index].insn, positions[index], pool, method)?;
    }
    Ok(state)
}

impl State {
    fn pop(&mut self, slots: usize, offset: u32) -> Result<Vec<VerificationType>, ClassFormatError> {
        if self.stack.len() < slots {
            return Err(ClassFormatError::StackUnderflow { offset });
        }
        Ok(self.stack.split_off(self.stack.len() - slots))
    }

    fn push(&mut self, vt: VerificationType) {
        self.stack.push(vt);
        if vt.is_wide() {
            self.stack.push(TOP);
        }
    }

    fn store(&mut self, index: usize, vt: VerificationType) {
        let end = index + vt.slots();
        if self.locals.len() < end {
            self.locals.resize(end, TOP);
        }
        // Overwriting the upper half of a long or double kills it.
        if index > 0 && self.locals[index - 1].is_wide() {
            self.locals[index - 1] = TOP;
        }
        self.locals[index] = vt;
        if vt.is_wide() {
            self.locals[index + 1] = TOP;
        }
    }

    fn replace(&mut self, from: VerificationType, to: VerificationType) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if *slot == from {
                *slot = to;
            }
        }
    }

    /// Copies the top `count` slots below the `below` slots under them.
    fn dup(&mut self, count: usize, below: usize, offset: u32) -> Result<(), ClassFormatError> {
        let top = self.pop(count, offset)?;
        let under = self.pop(below, offset)?;
        self.stack.extend_from_slice(&top);
        self.stack.extend(under);
        self.stack.extend(top);
        Ok(())
    }
}

fn step(
    state: &mut State,
    insn: &Insn,
    offset: u32,
    pool: &mut ConstantPool,
    method: &MethodContext<'_>,
) -> Result<(), ClassFormatError> {
    match insn {
        Insn::Simple(op) => step_simple(state, *op, offset, pool)?,
        Insn::Push { .. } => state.push(INTEGER),
        Insn::NewArray(kind) => {
            state.pop(1, offset)?;
            let descriptor = match kind {
                4 => "[Z",
                5 => "[C",
                6 => "[F",
                7 => "[D",
                8 => "[B",
                9 => "[S",
                10 => "[I",
                11 => "[J",
                _ => {
                    return Err(ClassFormatError::InvalidOpcode {
                        opcode: NEWARRAY,
                        offset,
                    });
                }
            };
            state.push(VerificationType::Object(pool.add_class(descriptor)?));
        }
        Insn::Local { opcode, index } => step_local(state, *opcode, *index as usize, offset)?,
        Insn::Iinc { .. } => {}
        Insn::Ldc { index, .. } | Insn::Ldc2 { index } => {
            let vt = loadable_type(pool, *index)?;
            state.push(vt);
        }
        Insn::Member { opcode, index } => step_member(state, *opcode, *index, offset, pool, method)?,
        Insn::InvokeInterface { index, .. } => {
            step_invoke(state, INVOKEINTERFACE, *index, offset, pool, method)?
        }
        Insn::InvokeDynamic { index } => {
            let descriptor = pool.dynamic_descriptor(*index)?;
            call(state, &descriptor, offset, pool)?;
        }
        Insn::MultiANewArray { index, dimensions } => {
            state.pop(*dimensions as usize, offset)?;
            state.push(VerificationType::Object(*index));
        }
        Insn::Jump { opcode, .. } => {
            let pops = match *opcode {
                IFEQ..=IFLE | IFNULL | IFNONNULL => 1,
                IF_ICMPEQ..=IF_ACMPNE => 2,
                _ => 0,
            };
            state.pop(pops, offset)?;
        }
        Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
            state.pop(1, offset)?;
        }
    }
    Ok(())
}

/// Integer, long, float and double, in the order typed opcodes cycle through.
const NUMERIC: [VerificationType; 4] = [INTEGER, LONG, FLOAT, DOUBLE];

/// Operand and result of `i2l` through `i2s`.
const CONVERSIONS: [(VerificationType, VerificationType); 15] = [
    (INTEGER, LONG),
    (INTEGER, FLOAT),
    (INTEGER, DOUBLE),
    (LONG, INTEGER),
    (LONG, FLOAT),
    (LONG, DOUBLE),
    (FLOAT, INTEGER),
    (FLOAT, LONG),
    (FLOAT, DOUBLE),
    (DOUBLE, INTEGER),
    (DOUBLE, LONG),
    (DOUBLE, FLOAT),
    (INTEGER, INTEGER),
    (INTEGER, INTEGER),
    (INTEGER, INTEGER),
];

fn step_simple(
    state: &mut State,
    op: u8,
    offset: u32,
    pool: &mut ConstantPool,
) -> Result<(), ClassFormatError> {
    match op {
        NOP => {}
        ACONST_NULL => state.push(NULL),
        ICONST_M1..=ICONST_5 => state.push(INTEGER),
        LCONST_0 | LCONST_1 => state.push(LONG),
        FCONST_0..=FCONST_2 => state.push(FLOAT),
        DCONST_0 | DCONST_1 => state.push(DOUBLE),
        ILOAD_0..=ALOAD_3 => {
            let n = op - ILOAD_0;
            step_local(state, ILOAD + n / 4, (n % 4) as usize, offset)?;
        }
        ISTORE_0..=ASTORE_3 => {
            let n = op - ISTORE_0;
            step_local(state, ISTORE + n / 4, (n % 4) as usize, offset)?;
        }
        IALOAD | BALOAD | CALOAD | SALOAD => {
            state.pop(2, offset)?;
            state.push(INTEGER);
        }
        LALOAD | FALOAD | DALOAD => {
            state.pop(2, offset)?;
            state.push(NUMERIC[(op - IALOAD) as usize]);
        }
        AALOAD => {
            let popped = state.pop(2, offset)?;
            let element = match popped[0] {
                VerificationType::Object(index) => {
                    let array = pool.class_name(index)?;
                    match array.strip_prefix('[') {
                        Some(element) => value_type(element, pool)?,
                        None => NULL,
                    }
                }
                _ => NULL,
            };
            state.push(element);
        }
        IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE => {
            state.pop(3, offset)?;
        }
        LASTORE | DASTORE => {
            state.pop(4, offset)?;
        }
        POP => {
            state.pop(1, offset)?;
        }
        POP2 => {
            state.pop(2, offset)?;
        }
        DUP => state.dup(1, 0, offset)?,
        DUP_X1 => state.dup(1, 1, offset)?,
        DUP_X2 => state.dup(1, 2, offset)?,
        DUP2 => state.dup(2, 0, offset)?,
        DUP2_X1 => state.dup(2, 1, offset)?,
        DUP2_X2 => state.dup(2, 2, offset)?,
        SWAP => {
            let popped = state.pop(2, offset)?;
            state.stack.push(popped[1]);
            state.stack.push(popped[0]);
        }
        IADD..=DREM => {
            let vt = NUMERIC[((op - IADD) % 4) as usize];
            state.pop(2 * vt.slots(), offset)?;
            state.push(vt);
        }
        INEG..=DNEG => {
            let vt = NUMERIC[((op - INEG) % 4) as usize];
            state.pop(vt.slots(), offset)?;
            state.push(vt);
        }
        ISHL..=LUSHR => {
            if (op - ISHL) % 2 == 0 {
                state.pop(2, offset)?;
                state.push(INTEGER);
            } else {
                state.pop(3, offset)?;
                state.push(LONG);
            }
        }
        IAND..=LXOR => {
            if (op - IAND) % 2 == 0 {
                state.pop(2, offset)?;
                state.push(INTEGER);
            } else {
                state.pop(4, offset)?;
                state.push(LONG);
            }
        }
        I2L..=I2S => {
            let (from, to) = CONVERSIONS[(op - I2L) as usize];
            state.pop(from.slots(), offset)?;
            state.push(to);
        }
        LCMP | DCMPL | DCMPG => {
            state.pop(4, offset)?;
            state.push(INTEGER);
        }
        FCMPL | FCMPG => {
            state.pop(2, offset)?;
            state.push(INTEGER);
        }
        IRETURN..=RETURN | ATHROW => state.stack.clear(),
        ARRAYLENGTH => {
            state.pop(1, offset)?;
            state.push(INTEGER);
        }
        MONITORENTER | MONITOREXIT => {
            state.pop(1, offset)?;
        }
        _ => return Err(ClassFormatError::InvalidOpcode { opcode: op, offset }),
    }
    Ok(())
}

fn step_local(
    state: &mut State,
    opcode: u8,
    index: usize,
    offset: u32,
) -> Result<(), ClassFormatError> {
    match opcode {
        ILOAD | LLOAD | FLOAD | DLOAD => state.push(NUMERIC[(opcode - ILOAD) as usize]),
        ALOAD => {
            let vt = state.locals.get(index).copied().unwrap_or(TOP);
            state.push(vt);
        }
        ISTORE | LSTORE | FSTORE | DSTORE => {
            let vt = NUMERIC[(opcode - ISTORE) as usize];
            state.pop(vt.slots(), offset)?;
            state.store(index, vt);
        }
        ASTORE => {
            let popped = state.pop(1, offset)?;
            state.store(index, popped[0]);
        }
        // ret leaves the frame as is.
        _ => {}
    }
    Ok(())
}

fn step_member(
    state: &mut State,
    opcode: u8,
    index: u16,
    offset: u32,
    pool: &mut ConstantPool,
    method: &MethodContext<'_>,
) -> Result<(), ClassFormatError> {
    match opcode {
        NEW => state.push(VerificationType::Uninitialized(offset)),
        ANEWARRAY => {
            state.pop(1, offset)?;
            let element = pool.class_name(index)?;
            let array = if element.starts_with('[') {
                format!("[{element}")
            } else {
                format!("[L{element};")
            };
            state.push(VerificationType::Object(pool.add_class(&array)?));
        }
        CHECKCAST => {
            state.pop(1, offset)?;
            state.push(VerificationType::Object(index));
        }
        INSTANCEOF => {
            state.pop(1, offset)?;
            state.push(INTEGER);
        }
        GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
            let field = pool.member_ref(index)?;
            let vt = value_type(&field.descriptor, pool)?;
            match opcode {
                GETSTATIC => state.push(vt),
                PUTSTATIC => {
                    state.pop(vt.slots(), offset)?;
                }
                GETFIELD => {
                    state.pop(1, offset)?;
                    state.push(vt);
                }
                _ => {
                    state.pop(vt.slots() + 1, offset)?;
                }
            }
        }
        _ => step_invoke(state, opcode, index, offset, pool, method)?,
    }
    Ok(())
}

fn step_invoke(
    state: &mut State,
    opcode: u8,
    index: u16,
    offset: u32,
    pool: &mut ConstantPool,
    method: &MethodContext<'_>,
) -> Result<(), ClassFormatError> {
    let target = pool.member_ref(index)?;
    if opcode == INVOKESTATIC {
        return call(state, &target.descriptor, offset, pool);
    }

    let shape = method_shape(&target.descriptor)?;
    state.pop(shape.argument_slots as usize, offset)?;
    let receiver = state.pop(1, offset)?[0];
    if opcode == INVOKESPECIAL && target.name == "<init>" {
        let initialized = match receiver {
            UNINITIALIZED_THIS => Some(pool.add_class(method.owner)?),
            VerificationType::Uninitialized(_) => Some(pool.add_class(&target.owner)?),
            _ => None,
        };
        if let Some(class) = initialized {
            state.replace(receiver, VerificationType::Object(class));
        }
    }
    if let Some(vt) = return_type(&target.descriptor, pool)? {
        state.push(vt);
    }
    Ok(())
}

/// Pops the arguments of a receiver-less call and pushes its result.
fn call(
    state: &mut State,
    descriptor: &str,
    offset: u32,
    pool: &mut ConstantPool,
) -> Result<(), ClassFormatError> {
    let shape = method_shape(descriptor)?;
    state.pop(shape.argument_slots as usize, offset)?;
    if let Some(vt) = return_type(descriptor, pool)? {
        state.push(vt);
    }
    Ok(())
}

fn return_type(
    descriptor: &str,
    pool: &mut ConstantPool,
) -> Result<Option<VerificationType>, ClassFormatError> {
    let (_, returns) = split_method(descriptor)?;
    if returns == "V" {
        return Ok(None);
    }
    value_type(returns, pool).map(Some)
}

fn value_type(descriptor: &str, pool: &mut ConstantPool) -> Result<VerificationType, ClassFormatError> {
    let vt = match descriptor.as_bytes().first() {
        Some(b'B' | b'C' | b'I' | b'S' | b'Z') => INTEGER,
        Some(b'F') => FLOAT,
        Some(b'J') => LONG,
        Some(b'D') => DOUBLE,
        Some(b'[') => VerificationType::Object(pool.add_class(descriptor)?),
        Some(b'L') => {
            let name = descriptor
                .strip_prefix('L')
                .and_then(|d| d.strip_suffix(';'))
                .ok_or_else(|| ClassFormatError::InvalidDescriptor(descriptor.to_string()))?;
            VerificationType::Object(pool.add_class(name)?)
        }
        _ => return Err(ClassFormatError::InvalidDescriptor(descriptor.to_string())),
    };
    Ok(vt)
}

fn loadable_type(pool: &mut ConstantPool, index: u16) -> Result<VerificationType, ClassFormatError> {
    let class = match pool.get(index)? {
        Constant::Integer(_) => return Ok(INTEGER),
        Constant::Float(_) => return Ok(FLOAT),
        Constant::Long(_) => return Ok(LONG),
        Constant::Double(_) => return Ok(DOUBLE),
        Constant::String(_) => "java/lang/String",
        Constant::Class(_) => "java/lang/Class",
        Constant::MethodType(_) => "java/lang/invoke/MethodType",
        Constant::MethodHandle { .. } => "java/lang/invoke/MethodHandle",
        Constant::Dynamic { .. } => {
            let descriptor = pool.dynamic_descriptor(index)?;
            return value_type(&descriptor, pool);
        }
        _ => {
            return Err(ClassFormatError::UnexpectedConstant {
                index,
                expected: "loadable constant",
            });
        }
    };
    Ok(VerificationType::Object(pool.add_class(class)?))
}
