use super::bytes::ByteWriter;
use super::maxs;
use super::{Attribute, Code, CompiledUnit, Method};
use crate::error::ClassFormatError;

const MAGIC: u32 = 0xCAFE_BABE;
const MAX_CODE_LENGTH: usize = u16::MAX as usize;

/// Serializes `unit`. Code marked as modified gets fresh `max_stack` and
/// `max_locals`; everything else is written as decoded.
pub fn encode(unit: &CompiledUnit) -> Result<Vec<u8>, ClassFormatError> {
    let mut w = ByteWriter::new();
    w.u4(MAGIC);
    w.u2(unit.minor_version);
    w.u2(unit.major_version);
    unit.pool.write(&mut w);
    w.u2(unit.access_flags);
    w.u2(unit.this_class);
    w.u2(unit.super_class);

    w.u2(unit.interface_indexes.len() as u16);
    for index in &unit.interface_indexes {
        w.u2(*index);
    }

    w.u2(unit.fields.len() as u16);
    for field in &unit.fields {
        w.u2(field.access_flags);
        w.u2(field.name_index);
        w.u2(field.descriptor_index);
        write_attributes(&mut w, &field.attributes);
    }

    w.u2(unit.methods.len() as u16);
    for method in &unit.methods {
        write_method(&mut w, unit, method)?;
    }

    write_attributes(&mut w, &unit.attributes);
    Ok(w.into_inner())
}

fn write_method(
    w: &mut ByteWriter,
    unit: &CompiledUnit,
    method: &Method,
) -> Result<(), ClassFormatError> {
    w.u2(method.access_flags);
    w.u2(method.name_index);
    w.u2(method.descriptor_index);

    let Some(code) = &method.code else {
        write_attributes(w, &method.attributes);
        return Ok(());
    };

    let code_attribute = Attribute {
        name_index: method.code_name_index,
        info: write_code(unit, method, code)?,
    };
    let position = method.code_position.min(method.attributes.len());
    w.u2(method.attributes.len() as u16 + 1);
    for (i, attribute) in method.attributes.iter().enumerate() {
        if i == position {
            write_attribute(w, &code_attribute);
        }
        write_attribute(w, attribute);
    }
    if position == method.attributes.len() {
        write_attribute(w, &code_attribute);
    }
    Ok(())
}

fn write_code(unit: &CompiledUnit, method: &Method, code: &Code) -> Result<Vec<u8>, ClassFormatError> {
    if code.bytecode.len() > MAX_CODE_LENGTH {
        return Err(ClassFormatError::CodeTooLarge {
            method: format!("{}.{}{}", unit.name(), method.name, method.descriptor),
        });
    }

    let (max_stack, max_locals) = if code.recompute_maxs {
        let computed = maxs::compute(
            &code.bytecode,
            &code.exception_table,
            &unit.pool,
            &method.descriptor,
            method.is_static(),
        )?;
        (computed.max_stack, computed.max_locals.max(code.max_locals))
    } else {
        (code.max_stack, code.max_locals)
    };

    let mut w = ByteWriter::new();
    w.u2(max_stack);
    w.u2(max_locals);
    w.u4(code.bytecode.len() as u32);
    w.bytes(&code.bytecode);
    w.u2(code.exception_table.len() as u16);
    for handler in &code.exception_table {
        w.u2(handler.start_pc);
        w.u2(handler.end_pc);
        w.u2(handler.handler_pc);
        w.u2(handler.catch_type);
    }
    write_attributes(&mut w, &code.attributes);
    Ok(w.into_inner())
}

fn write_attributes(w: &mut ByteWriter, attributes: &[Attribute]) {
    w.u2(attributes.len() as u16);
    for attribute in attributes {
        write_attribute(w, attribute);
    }
}

fn write_attribute(w: &mut ByteWriter, attribute: &Attribute) {
    w.u2(attribute.name_index);
    w.u4(attribute.info.len() as u32);
    w.bytes(&attribute.info);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::*;
    use crate::classfile::{ACC_PUBLIC, ACC_STATIC, Insn, decode};

    #[test]
    fn recomputed_maxs_keep_declared_locals_when_larger() {
        let mut unit = CompiledUnit::new(52, ACC_PUBLIC, "a/B", Some("java/lang/Object"), &[]).unwrap();
        let mut code = Code::generate(vec![Insn::Simple(ICONST_1), Insn::Simple(POP), Insn::Simple(RETURN)])
            .unwrap();
        code.max_locals = 5;
        unit.add_method(ACC_PUBLIC | ACC_STATIC, "f", "()V", Some(code))
            .unwrap();

        let decoded = decode(&encode(&unit).unwrap(), 69).unwrap();
        let code = decoded.methods[0].code.as_ref().unwrap();
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.max_locals, 5);
    }

    #[test]
    fn oversized_code_is_rejected() {
        let mut unit = CompiledUnit::new(52, ACC_PUBLIC, "a/B", Some("java/lang/Object"), &[]).unwrap();
        let mut code = Code::generate(vec![Insn::Simple(RETURN)]).unwrap();
        code.bytecode = vec![NOP; MAX_CODE_LENGTH + 1];
        unit.add_method(ACC_PUBLIC, "big", "()V", Some(code)).unwrap();
        assert!(matches!(
            encode(&unit),
            Err(ClassFormatError::CodeTooLarge { .. })
        ));
    }
}
