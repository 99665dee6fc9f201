use super::annotation::{RUNTIME_INVISIBLE_ANNOTATIONS, RUNTIME_VISIBLE_ANNOTATIONS, parse_annotations};
use super::bytes::ByteReader;
use super::pool::ConstantPool;
use super::{Attribute, Code, CODE, CompiledUnit, ExceptionHandler, Field, Method};
use crate::error::ClassFormatError;

const MAGIC: u32 = 0xCAFE_BABE;
const MIN_MAJOR: u16 = 45;

/// Decodes a class file. Majors outside `45..=max_major` are rejected.
pub fn decode(bytes: &[u8], max_major: u16) -> Result<CompiledUnit, ClassFormatError> {
    let mut reader = ByteReader::new(bytes);

    let magic = reader.read_u4()?;
    if magic != MAGIC {
        return Err(ClassFormatError::InvalidMagic(magic));
    }
    let minor_version = reader.read_u2()?;
    let major_version = reader.read_u2()?;
    if !(MIN_MAJOR..=max_major).contains(&major_version) {
        return Err(ClassFormatError::UnsupportedVersion {
            major: major_version,
            minor: minor_version,
            max_major,
        });
    }

    let pool = ConstantPool::parse(&mut reader)?;
    let access_flags = reader.read_u2()?;
    let this_class = reader.read_u2()?;
    let name = pool.class_name(this_class)?;
    let super_class = reader.read_u2()?;
    let super_name = match super_class {
        0 => None,
        index => Some(pool.class_name(index)?),
    };

    let interface_count = reader.read_u2()?;
    let mut interface_indexes = Vec::with_capacity(interface_count as usize);
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        let index = reader.read_u2()?;
        interfaces.push(pool.class_name(index)?);
        interface_indexes.push(index);
    }

    let field_count = reader.read_u2()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(read_field(&mut reader, &pool)?);
    }

    let method_count = reader.read_u2()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        methods.push(read_method(&mut reader, &pool)?);
    }

    let attributes = read_attributes(&mut reader)?;
    let mut annotations = Vec::new();
    for attribute in &attributes {
        match pool.utf8(attribute.name_index)?.as_str() {
            RUNTIME_VISIBLE_ANNOTATIONS => {
                annotations.extend(parse_annotations(&attribute.info, &pool, true)?)
            }
            RUNTIME_INVISIBLE_ANNOTATIONS => {
                annotations.extend(parse_annotations(&attribute.info, &pool, false)?)
            }
            _ => {}
        }
    }

    if reader.remaining() != 0 {
        return Err(ClassFormatError::TrailingBytes {
            count: reader.remaining(),
        });
    }

    Ok(CompiledUnit {
        minor_version,
        major_version,
        pool,
        access_flags,
        this_class,
        super_class,
        interface_indexes,
        name,
        super_name,
        interfaces,
        annotations,
        fields,
        methods,
        attributes,
    })
}

fn read_field(reader: &mut ByteReader<'_>, pool: &ConstantPool) -> Result<Field, ClassFormatError> {
    let access_flags = reader.read_u2()?;
    let name_index = reader.read_u2()?;
    let descriptor_index = reader.read_u2()?;
    Ok(Field {
        access_flags,
        name: pool.utf8(name_index)?,
        descriptor: pool.utf8(descriptor_index)?,
        name_index,
        descriptor_index,
        attributes: read_attributes(reader)?,
    })
}

fn read_method(reader: &mut ByteReader<'_>, pool: &ConstantPool) -> Result<Method, ClassFormatError> {
    let access_flags = reader.read_u2()?;
    let name_index = reader.read_u2()?;
    let descriptor_index = reader.read_u2()?;
    let mut attributes = read_attributes(reader)?;

    let mut code = None;
    let mut code_position = 0;
    let mut code_name_index = 0;
    for (position, attribute) in attributes.iter().enumerate() {
        if pool.utf8(attribute.name_index)? == CODE {
            code = Some(read_code(&attribute.info)?);
            code_position = position;
            code_name_index = attribute.name_index;
            break;
        }
    }
    if code.is_some() {
        attributes.remove(code_position);
    }

    Ok(Method {
        access_flags,
        name: pool.utf8(name_index)?,
        descriptor: pool.utf8(descriptor_index)?,
        name_index,
        descriptor_index,
        code,
        code_position,
        code_name_index,
        attributes,
    })
}

fn read_code(info: &[u8]) -> Result<Code, ClassFormatError> {
    let mut reader = ByteReader::new(info);
    let max_stack = reader.read_u2()?;
    let max_locals = reader.read_u2()?;
    let code_length = reader.read_u4()? as usize;
    let bytecode = reader.read_slice(code_length)?.to_vec();

    let handler_count = reader.read_u2()?;
    let mut exception_table = Vec::with_capacity(handler_count as usize);
    for _ in 0..handler_count {
        exception_table.push(ExceptionHandler {
            start_pc: reader.read_u2()?,
            end_pc: reader.read_u2()?,
            handler_pc: reader.read_u2()?,
            catch_type: reader.read_u2()?,
        });
    }
    let attributes = read_attributes(&mut reader)?;

    if reader.remaining() != 0 {
        return Err(ClassFormatError::AttributeLength {
            name: CODE.to_string(),
            declared: info.len(),
            actual: reader.position(),
        });
    }

    Ok(Code {
        max_stack,
        max_locals,
        bytecode,
        exception_table,
        attributes,
        recompute_maxs: false,
    })
}

fn read_attributes(reader: &mut ByteReader<'_>) -> Result<Vec<Attribute>, ClassFormatError> {
    let count = reader.read_u2()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = reader.read_u2()?;
        let length = reader.read_u4()? as usize;
        let info = reader.read_slice(length)?.to_vec();
        attributes.push(Attribute { name_index, info });
    }
    Ok(attributes)
}
