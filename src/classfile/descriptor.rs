use crate::error::ClassFormatError;

/// Stack/local slot sizes of a method descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodShape {
    pub argument_slots: u32,
    pub return_slots: u32,
}

pub fn method_shape(descriptor: &str) -> Result<MethodShape, ClassFormatError> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(invalid(descriptor));
    }
    let mut pos = 1;
    let mut argument_slots = 0;
    while bytes.get(pos) != Some(&b')') {
        if pos >= bytes.len() {
            return Err(invalid(descriptor));
        }
        let (slots, next) = field_type(bytes, pos).ok_or_else(|| invalid(descriptor))?;
        argument_slots += slots;
        pos = next;
    }
    pos += 1;

    let return_slots = if bytes.get(pos) == Some(&b'V') {
        pos += 1;
        0
    } else {
        let (slots, next) = field_type(bytes, pos).ok_or_else(|| invalid(descriptor))?;
        pos = next;
        slots
    };

    if pos != bytes.len() {
        return Err(invalid(descriptor));
    }

    Ok(MethodShape {
        argument_slots,
        return_slots,
    })
}

/// Splits a method descriptor into its parameter field descriptors and its
/// return descriptor (`V` for void).
pub fn split_method(descriptor: &str) -> Result<(Vec<&str>, &str), ClassFormatError> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(invalid(descriptor));
    }
    let mut pos = 1;
    let mut parameters = Vec::new();
    while bytes.get(pos) != Some(&b')') {
        let (_, next) = field_type(bytes, pos).ok_or_else(|| invalid(descriptor))?;
        parameters.push(&descriptor[pos..next]);
        pos = next;
    }
    let returns = &descriptor[pos + 1..];
    if returns != "V" {
        field_slots(returns)?;
    }
    Ok((parameters, returns))
}

pub fn field_slots(descriptor: &str) -> Result<u32, ClassFormatError> {
    match field_type(descriptor.as_bytes(), 0) {
        Some((slots, end)) if end == descriptor.len() => Ok(slots),
        _ => Err(invalid(descriptor)),
    }
}

fn field_type(bytes: &[u8], pos: usize) -> Option<(u32, usize)> {
    match *bytes.get(pos)? {
        b'B' | b'C' | b'F' | b'I' | b'S' | b'Z' => Some((1, pos + 1)),
        b'D' | b'J' => Some((2, pos + 1)),
        b'L' => {
            let end = bytes[pos..].iter().position(|b| *b == b';')?;
            if end <= 1 {
                return None;
            }
            Some((1, pos + end + 1))
        }
        b'[' => {
            let mut p = pos;
            while bytes.get(p) == Some(&b'[') {
                p += 1;
            }
            let (_, next) = field_type(bytes, p)?;
            Some((1, next))
        }
        _ => None,
    }
}

fn invalid(descriptor: &str) -> ClassFormatError {
    ClassFormatError::InvalidDescriptor(descriptor.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_shape_counts_wide_arguments() {
        let shape = method_shape("(IJLjava/lang/String;[D)D").unwrap();
        assert_eq!(shape.argument_slots, 1 + 2 + 1 + 1);
        assert_eq!(shape.return_slots, 2);
        assert_eq!(method_shape("()V").unwrap().return_slots, 0);
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        assert!(method_shape("(L;)V").is_err());
        assert!(method_shape("(I").is_err());
        assert!(method_shape("()VV").is_err());
        assert!(field_slots("Ljava/lang/Object").is_err());
        assert_eq!(field_slots("[[J").unwrap(), 1);
    }

    #[test]
    fn split_method_yields_each_parameter() {
        let (parameters, returns) = split_method("(IJLjava/lang/String;[[D)Z").unwrap();
        assert_eq!(parameters, vec!["I", "J", "Ljava/lang/String;", "[[D"]);
        assert_eq!(returns, "Z");
        assert_eq!(split_method("()V").unwrap(), (vec![], "V"));
        assert!(split_method("(I").is_err());
        assert!(split_method("()").is_err());
    }
}
