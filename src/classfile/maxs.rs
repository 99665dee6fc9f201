//! `max_stack` / `max_locals` computation for code the weaver touched.

use std::collections::HashMap;

use super::code::{Insn, InsnList, targets};
use super::descriptor::{field_slots, method_shape};
use super::opcodes::*;
use super::pool::ConstantPool;
use super::ExceptionHandler;
use crate::error::ClassFormatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Maxs {
    pub max_stack: u16,
    pub max_locals: u16,
}

/// Walks every reachable path of `bytecode` tracking operand stack depth.
/// Exception handlers are entered with the thrown reference on the stack and
/// `jsr` targets with the return address.
pub fn compute(
    bytecode: &[u8],
    exception_table: &[ExceptionHandler],
    pool: &ConstantPool,
    descriptor: &str,
    is_static: bool,
) -> Result<Maxs, ClassFormatError> {
    let list = InsnList::decode(bytecode)?;
    let nodes = &list.nodes;
    let index_of: HashMap<u32, usize> = nodes
        .iter()
        .enumerate()
        .filter_map(|(i, n)| n.origin.map(|o| (o, i)))
        .collect();

    let mut depth: Vec<Option<u32>> = vec![None; nodes.len()];
    let mut work: Vec<(usize, u32)> = Vec::new();
    if !nodes.is_empty() {
        work.push((0, 0));
    }
    for handler in exception_table {
        if let Some(&i) = index_of.get(&(handler.handler_pc as u32)) {
            work.push((i, 1));
        }
    }

    let mut max_stack = 0u32;
    while let Some((i, before)) = work.pop() {
        if depth[i].is_some() {
            continue;
        }
        depth[i] = Some(before);
        let node = &nodes[i];
        let offset = node.origin.unwrap_or_default();
        let (pops, pushes) = stack_effect(&node.insn, pool)?;
        if before < pops {
            return Err(ClassFormatError::StackUnderflow { offset });
        }
        let after = before - pops + pushes;
        max_stack = max_stack.max(before).max(after);

        let resolve = |target: u32| -> Result<usize, ClassFormatError> {
            index_of
                .get(&target)
                .copied()
                .ok_or(ClassFormatError::InvalidBranchTarget {
                    offset,
                    target: target as i64,
                })
        };
        let falls_through = i + 1 < nodes.len();

        match &node.insn {
            Insn::Jump { opcode, target } if *opcode == JSR || *opcode == JSR_W => {
                max_stack = max_stack.max(after + 1);
                work.push((resolve(*target)?, after + 1));
                if falls_through {
                    work.push((i + 1, after));
                }
            }
            Insn::Jump { opcode, target } if *opcode == GOTO || *opcode == GOTO_W => {
                work.push((resolve(*target)?, after));
            }
            Insn::Jump { target, .. } => {
                work.push((resolve(*target)?, after));
                if falls_through {
                    work.push((i + 1, after));
                }
            }
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
                for target in targets(&node.insn) {
                    work.push((resolve(target)?, after));
                }
            }
            Insn::Simple(op) if (IRETURN..=RETURN).contains(op) || *op == ATHROW => {}
            Insn::Local { opcode: RET, .. } => {}
            _ => {
                if falls_through {
                    work.push((i + 1, after));
                }
            }
        }
    }

    let shape = method_shape(descriptor)?;
    let mut max_locals = shape.argument_slots + if is_static { 0 } else { 1 };
    for node in nodes {
        max_locals = max_locals.max(locals_needed(&node.insn));
    }

    Ok(Maxs {
        max_stack: clamp(max_stack),
        max_locals: clamp(max_locals),
    })
}

fn clamp(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

fn locals_needed(insn: &Insn) -> u32 {
    match insn {
        Insn::Local { opcode, index } => {
            let width = if matches!(*opcode, LLOAD | DLOAD | LSTORE | DSTORE) {
                2
            } else {
                1
            };
            *index as u32 + width
        }
        Insn::Iinc { index, .. } => *index as u32 + 1,
        Insn::Simple(op) => match *op {
            ILOAD_0..=ILOAD_3 => (op - ILOAD_0) as u32 + 1,
            LLOAD_0..=LLOAD_3 => (op - LLOAD_0) as u32 + 2,
            FLOAD_0..=FLOAD_3 => (op - FLOAD_0) as u32 + 1,
            DLOAD_0..=DLOAD_3 => (op - DLOAD_0) as u32 + 2,
            ALOAD_0..=ALOAD_3 => (op - ALOAD_0) as u32 + 1,
            ISTORE_0..=ISTORE_3 => (op - ISTORE_0) as u32 + 1,
            LSTORE_0..=LSTORE_3 => (op - LSTORE_0) as u32 + 2,
            FSTORE_0..=FSTORE_3 => (op - FSTORE_0) as u32 + 1,
            DSTORE_0..=DSTORE_3 => (op - DSTORE_0) as u32 + 2,
            ASTORE_0..=ASTORE_3 => (op - ASTORE_0) as u32 + 1,
            _ => 0,
        },
        _ => 0,
    }
}

/// (slots popped, slots pushed).
fn stack_effect(insn: &Insn, pool: &ConstantPool) -> Result<(u32, u32), ClassFormatError> {
    let effect = match insn {
        Insn::Simple(op) => simple_effect(*op),
        Insn::Push { .. } => (0, 1),
        Insn::NewArray(_) => (1, 1),
        Insn::Local { opcode, .. } => match *opcode {
            ILOAD | FLOAD | ALOAD => (0, 1),
            LLOAD | DLOAD => (0, 2),
            ISTORE | FSTORE | ASTORE => (1, 0),
            LSTORE | DSTORE => (2, 0),
            _ => (0, 0),
        },
        Insn::Iinc { .. } => (0, 0),
        Insn::Ldc { index, .. } | Insn::Ldc2 { index } => (0, pool.loadable_slots(*index)?),
        Insn::Member { opcode, index } => match *opcode {
            GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
                let member = pool.member_ref(*index)?;
                let size = field_slots(&member.descriptor)?;
                match *opcode {
                    GETSTATIC => (0, size),
                    PUTSTATIC => (size, 0),
                    GETFIELD => (1, size),
                    _ => (1 + size, 0),
                }
            }
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC => {
                let member = pool.member_ref(*index)?;
                let shape = method_shape(&member.descriptor)?;
                let receiver = if *opcode == INVOKESTATIC { 0 } else { 1 };
                (shape.argument_slots + receiver, shape.return_slots)
            }
            NEW => (0, 1),
            _ => (1, 1),
        },
        Insn::InvokeInterface { index, .. } => {
            let member = pool.member_ref(*index)?;
            let shape = method_shape(&member.descriptor)?;
            (shape.argument_slots + 1, shape.return_slots)
        }
        Insn::InvokeDynamic { index } => {
            let shape = method_shape(&pool.dynamic_descriptor(*index)?)?;
            (shape.argument_slots, shape.return_slots)
        }
        Insn::MultiANewArray { dimensions, .. } => (*dimensions as u32, 1),
        Insn::Jump { opcode, .. } => match *opcode {
            IFEQ..=IFLE | IFNULL | IFNONNULL => (1, 0),
            IF_ICMPEQ..=IF_ACMPNE => (2, 0),
            _ => (0, 0),
        },
        Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => (1, 0),
    };
    Ok(effect)
}

fn simple_effect(op: u8) -> (u32, u32) {
    match op {
        NOP => (0, 0),
        ACONST_NULL..=ICONST_5 | FCONST_0..=FCONST_2 => (0, 1),
        LCONST_0 | LCONST_1 | DCONST_0 | DCONST_1 => (0, 2),
        ILOAD_0..=ILOAD_3 | FLOAD_0..=FLOAD_3 | ALOAD_0..=ALOAD_3 => (0, 1),
        LLOAD_0..=LLOAD_3 | DLOAD_0..=DLOAD_3 => (0, 2),
        IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD => (2, 1),
        LALOAD | DALOAD => (2, 2),
        ISTORE_0..=ISTORE_3 | FSTORE_0..=FSTORE_3 | ASTORE_0..=ASTORE_3 => (1, 0),
        LSTORE_0..=LSTORE_3 | DSTORE_0..=DSTORE_3 => (2, 0),
        IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE => (3, 0),
        LASTORE | DASTORE => (4, 0),
        POP => (1, 0),
        POP2 => (2, 0),
        DUP => (1, 2),
        DUP_X1 => (2, 3),
        DUP_X2 => (3, 4),
        DUP2 => (2, 4),
        DUP2_X1 => (3, 5),
        DUP2_X2 => (4, 6),
        SWAP => (2, 2),
        IADD | ISUB | IMUL | IDIV | IREM | FADD | FSUB | FMUL | FDIV | FREM => (2, 1),
        LADD | LSUB | LMUL | LDIV | LREM | DADD | DSUB | DMUL | DDIV | DREM => (4, 2),
        INEG | FNEG => (1, 1),
        LNEG | DNEG => (2, 2),
        ISHL | ISHR | IUSHR => (2, 1),
        LSHL | LSHR | LUSHR => (3, 2),
        IAND | IOR | IXOR => (2, 1),
        LAND | LOR | LXOR => (4, 2),
        I2F | F2I | I2B | I2C | I2S => (1, 1),
        I2L | I2D | F2L | F2D => (1, 2),
        L2I | L2F | D2I | D2F => (2, 1),
        L2D | D2L => (2, 2),
        LCMP | DCMPL | DCMPG => (4, 1),
        FCMPL | FCMPG => (2, 1),
        IRETURN | FRETURN | ARETURN => (1, 0),
        LRETURN | DRETURN => (2, 0),
        RETURN => (0, 0),
        ARRAYLENGTH => (1, 1),
        ATHROW => (1, 0),
        MONITORENTER | MONITOREXIT => (1, 0),
        _ => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_call_arguments_and_long_values() {
        let mut pool = ConstantPool::new();
        let method = pool.add_method_ref("a/B", "take", "(JI)V").unwrap();
        let [hi, lo] = method.to_be_bytes();
        // aload_0; lconst_1; iconst_2; invokevirtual take(JI)V; return
        let bytecode = vec![0x2a, 0x0a, 0x05, 0xb6, hi, lo, 0xb1];
        let maxs = compute(&bytecode, &[], &pool, "()V", false).unwrap();
        assert_eq!(maxs.max_stack, 4);
        assert_eq!(maxs.max_locals, 1);
    }

    #[test]
    fn handlers_start_with_the_exception_on_the_stack() {
        let pool = ConstantPool::new();
        // 0: return; 1: astore_2; 2: return
        let bytecode = vec![0xb1, 0x4d, 0xb1];
        let handlers = [ExceptionHandler {
            start_pc: 0,
            end_pc: 1,
            handler_pc: 1,
            catch_type: 0,
        }];
        let maxs = compute(&bytecode, &handlers, &pool, "(I)V", true).unwrap();
        assert_eq!(maxs.max_stack, 1);
        assert_eq!(maxs.max_locals, 3);
    }

    #[test]
    fn underflow_is_reported() {
        let pool = ConstantPool::new();
        assert!(matches!(
            compute(&[0x57, 0xb1], &[], &pool, "()V", true),
            Err(ClassFormatError::StackUnderflow { offset: 0 })
        ));
    }
}
