use serde::Serialize;

use super::bytes::{ByteReader, ByteWriter};
use super::pool::ConstantPool;
use crate::error::ClassFormatError;

pub const RUNTIME_VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
pub const RUNTIME_INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub descriptor: String,
    pub visible: bool,
    pub elements: Vec<(String, ElementValue)>,
}

/// Element values. Only `int` constants are interpreted; every other kind is
/// validated while parsing and otherwise kept opaque.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ElementValue {
    Int(i32),
    Nested(Box<Annotation>),
    Array(Vec<ElementValue>),
    Other(char),
}

impl Annotation {
    pub fn int_element(&self, name: &str) -> Option<i32> {
        self.elements.iter().find_map(|(n, value)| match value {
            ElementValue::Int(v) if n == name => Some(*v),
            _ => None,
        })
    }
}

pub(crate) fn parse_annotations(
    info: &[u8],
    pool: &ConstantPool,
    visible: bool,
) -> Result<Vec<Annotation>, ClassFormatError> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u2()?;
    let mut annotations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        annotations.push(parse_annotation(&mut reader, pool, visible)?);
    }
    if reader.remaining() != 0 {
        return Err(ClassFormatError::AttributeLength {
            name: if visible {
                RUNTIME_VISIBLE_ANNOTATIONS
            } else {
                RUNTIME_INVISIBLE_ANNOTATIONS
            }
            .to_string(),
            declared: info.len(),
            actual: reader.position(),
        });
    }
    Ok(annotations)
}

fn parse_annotation(
    reader: &mut ByteReader<'_>,
    pool: &ConstantPool,
    visible: bool,
) -> Result<Annotation, ClassFormatError> {
    let descriptor = pool.utf8(reader.read_u2()?)?;
    let pairs = reader.read_u2()?;
    let mut elements = Vec::with_capacity(pairs as usize);
    for _ in 0..pairs {
        let name = pool.utf8(reader.read_u2()?)?;
        let value = parse_element_value(reader, pool, visible)?;
        elements.push((name, value));
    }
    Ok(Annotation {
        descriptor,
        visible,
        elements,
    })
}

fn parse_element_value(
    reader: &mut ByteReader<'_>,
    pool: &ConstantPool,
    visible: bool,
) -> Result<ElementValue, ClassFormatError> {
    let tag = reader.read_u1()? as char;
    match tag {
        'I' => Ok(ElementValue::Int(pool.integer(reader.read_u2()?)?)),
        'B' | 'C' | 'D' | 'F' | 'J' | 'S' | 'Z' | 's' | 'c' => {
            let index = reader.read_u2()?;
            pool.get(index)?;
            Ok(ElementValue::Other(tag))
        }
        'e' => {
            pool.utf8(reader.read_u2()?)?;
            pool.utf8(reader.read_u2()?)?;
            Ok(ElementValue::Other(tag))
        }
        '@' => Ok(ElementValue::Nested(Box::new(parse_annotation(
            reader, pool, visible,
        )?))),
        '[' => {
            let count = reader.read_u2()?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(parse_element_value(reader, pool, visible)?);
            }
            Ok(ElementValue::Array(values))
        }
        other => Err(ClassFormatError::InvalidElementTag { tag: other }),
    }
}

/// Serializes annotations whose elements are all `int` constants.
pub(crate) fn encode_int_annotations(
    annotations: &[(&str, &[(&str, i32)])],
    pool: &mut ConstantPool,
) -> Result<Vec<u8>, ClassFormatError> {
    let mut w = ByteWriter::new();
    w.u2(annotations.len() as u16);
    for (descriptor, elements) in annotations {
        w.u2(pool.add_utf8(descriptor)?);
        w.u2(elements.len() as u16);
        for (name, value) in elements.iter() {
            w.u2(pool.add_utf8(name)?);
            w.u1(b'I');
            w.u2(pool.add_integer(*value)?);
        }
    }
    Ok(w.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_int_element_and_skips_others() {
        let mut pool = ConstantPool::new();
        let descriptor = pool.add_utf8("Lx/Marker;").unwrap();
        let priority = pool.add_utf8("priority").unwrap();
        let value = pool.add_integer(7).unwrap();
        let label = pool.add_utf8("label").unwrap();
        let text = pool.add_utf8("hello").unwrap();

        let mut w = ByteWriter::new();
        w.u2(1);
        w.u2(descriptor);
        w.u2(2);
        w.u2(label);
        w.u1(b's');
        w.u2(text);
        w.u2(priority);
        w.u1(b'I');
        w.u2(value);
        let info = w.into_inner();

        let parsed = parse_annotations(&info, &pool, false).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].descriptor, "Lx/Marker;");
        assert_eq!(parsed[0].int_element("priority"), Some(7));
        assert_eq!(parsed[0].int_element("label"), None);
    }

    #[test]
    fn unknown_tags_are_format_errors() {
        let mut pool = ConstantPool::new();
        let descriptor = pool.add_utf8("Lx/Marker;").unwrap();
        let name = pool.add_utf8("v").unwrap();
        let mut w = ByteWriter::new();
        w.u2(1);
        w.u2(descriptor);
        w.u2(1);
        w.u2(name);
        w.u1(b'?');
        w.u2(1);
        assert!(matches!(
            parse_annotations(&w.into_inner(), &pool, true),
            Err(ClassFormatError::InvalidElementTag { tag: '?' })
        ));
    }

    #[test]
    fn encoded_int_annotations_parse_back() {
        let mut pool = ConstantPool::new();
        let info =
            encode_int_annotations(&[("Lx/Marker;", &[("priority", 12)])], &mut pool).unwrap();
        let parsed = parse_annotations(&info, &pool, true).unwrap();
        assert_eq!(parsed[0].int_element("priority"), Some(12));
    }
}
