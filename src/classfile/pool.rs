//! Constant pool storage.
//!
//! Strings are kept as the raw modified UTF-8 bytes found in the class file so
//! that entries the weaver never looks at are written back bit for bit. Only
//! names and descriptors are decoded on demand.

use super::bytes::{ByteReader, ByteWriter};
use crate::error::ClassFormatError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Slot 0 and the slot following a long or double.
    Unusable,
}

impl Constant {
    fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// A resolved field or method reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    pub(crate) fn parse(reader: &mut ByteReader<'_>) -> Result<Self, ClassFormatError> {
        let count = reader.read_u2()? as usize;
        let mut entries = Vec::with_capacity(count.max(1));
        entries.push(Constant::Unusable);

        while entries.len() < count {
            let tag = reader.read_u1()?;
            let entry = match tag {
                1 => {
                    let length = reader.read_u2()? as usize;
                    Constant::Utf8(reader.read_slice(length)?.to_vec())
                }
                3 => Constant::Integer(reader.read_i4()?),
                4 => Constant::Float(reader.read_u4()?),
                5 => Constant::Long(reader.read_u8()? as i64),
                6 => Constant::Double(reader.read_u8()?),
                7 => Constant::Class(reader.read_u2()?),
                8 => Constant::String(reader.read_u2()?),
                9 => Constant::FieldRef {
                    class: reader.read_u2()?,
                    name_and_type: reader.read_u2()?,
                },
                10 => Constant::MethodRef {
                    class: reader.read_u2()?,
                    name_and_type: reader.read_u2()?,
                },
                11 => Constant::InterfaceMethodRef {
                    class: reader.read_u2()?,
                    name_and_type: reader.read_u2()?,
                },
                12 => Constant::NameAndType {
                    name: reader.read_u2()?,
                    descriptor: reader.read_u2()?,
                },
                15 => Constant::MethodHandle {
                    kind: reader.read_u1()?,
                    reference: reader.read_u2()?,
                },
                16 => Constant::MethodType(reader.read_u2()?),
                17 => Constant::Dynamic {
                    bootstrap: reader.read_u2()?,
                    name_and_type: reader.read_u2()?,
                },
                18 => Constant::InvokeDynamic {
                    bootstrap: reader.read_u2()?,
                    name_and_type: reader.read_u2()?,
                },
                19 => Constant::Module(reader.read_u2()?),
                20 => Constant::Package(reader.read_u2()?),
                other => return Err(ClassFormatError::UnsupportedConstant { tag: other }),
            };

            let wide = entry.is_wide();
            entries.push(entry);
            if wide {
                entries.push(Constant::Unusable);
            }
        }

        if entries.len() != count.max(1) {
            // A long or double occupied the final slot and spilled past the count.
            return Err(ClassFormatError::InvalidConstantIndex {
                index: (entries.len() - 1) as u16,
            });
        }

        Ok(Self { entries })
    }

    pub(crate) fn write(&self, w: &mut ByteWriter) {
        w.u2(self.entries.len() as u16);
        for entry in &self.entries {
            match entry {
                Constant::Unusable => {}
                Constant::Utf8(bytes) => {
                    w.u1(1);
                    w.u2(bytes.len() as u16);
                    w.bytes(bytes);
                }
                Constant::Integer(v) => {
                    w.u1(3);
                    w.u4(*v as u32);
                }
                Constant::Float(bits) => {
                    w.u1(4);
                    w.u4(*bits);
                }
                Constant::Long(v) => {
                    w.u1(5);
                    w.u8(*v as u64);
                }
                Constant::Double(bits) => {
                    w.u1(6);
                    w.u8(*bits);
                }
                Constant::Class(name) => {
                    w.u1(7);
                    w.u2(*name);
                }
                Constant::String(value) => {
                    w.u1(8);
                    w.u2(*value);
                }
                Constant::FieldRef {
                    class,
                    name_and_type,
                } => {
                    w.u1(9);
                    w.u2(*class);
                    w.u2(*name_and_type);
                }
                Constant::MethodRef {
                    class,
                    name_and_type,
                } => {
                    w.u1(10);
                    w.u2(*class);
                    w.u2(*name_and_type);
                }
                Constant::InterfaceMethodRef {
                    class,
                    name_and_type,
                } => {
                    w.u1(11);
                    w.u2(*class);
                    w.u2(*name_and_type);
                }
                Constant::NameAndType { name, descriptor } => {
                    w.u1(12);
                    w.u2(*name);
                    w.u2(*descriptor);
                }
                Constant::MethodHandle { kind, reference } => {
                    w.u1(15);
                    w.u1(*kind);
                    w.u2(*reference);
                }
                Constant::MethodType(descriptor) => {
                    w.u1(16);
                    w.u2(*descriptor);
                }
                Constant::Dynamic {
                    bootstrap,
                    name_and_type,
                } => {
                    w.u1(17);
                    w.u2(*bootstrap);
                    w.u2(*name_and_type);
                }
                Constant::InvokeDynamic {
                    bootstrap,
                    name_and_type,
                } => {
                    w.u1(18);
                    w.u2(*bootstrap);
                    w.u2(*name_and_type);
                }
                Constant::Module(name) => {
                    w.u1(19);
                    w.u2(*name);
                }
                Constant::Package(name) => {
                    w.u1(20);
                    w.u2(*name);
                }
            }
        }
    }

    /// Number of slots, including the unusable slot 0.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Result<&Constant, ClassFormatError> {
        match self.entries.get(index as usize) {
            None | Some(Constant::Unusable) => {
                Err(ClassFormatError::InvalidConstantIndex { index })
            }
            Some(entry) => Ok(entry),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<String, ClassFormatError> {
        match self.get(index)? {
            Constant::Utf8(bytes) => decode_modified_utf8(bytes),
            _ => Err(ClassFormatError::UnexpectedConstant {
                index,
                expected: "Utf8",
            }),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<String, ClassFormatError> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            _ => Err(ClassFormatError::UnexpectedConstant {
                index,
                expected: "Class",
            }),
        }
    }

    pub fn integer(&self, index: u16) -> Result<i32, ClassFormatError> {
        match self.get(index)? {
            Constant::Integer(value) => Ok(*value),
            _ => Err(ClassFormatError::UnexpectedConstant {
                index,
                expected: "Integer",
            }),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(String, String), ClassFormatError> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(ClassFormatError::UnexpectedConstant {
                index,
                expected: "NameAndType",
            }),
        }
    }

    pub fn member_ref(&self, index: u16) -> Result<MemberRef, ClassFormatError> {
        match self.get(index)? {
            Constant::FieldRef {
                class,
                name_and_type,
            }
            | Constant::MethodRef {
                class,
                name_and_type,
            }
            | Constant::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                let (name, descriptor) = self.name_and_type(*name_and_type)?;
                Ok(MemberRef {
                    owner: self.class_name(*class)?,
                    name,
                    descriptor,
                })
            }
            _ => Err(ClassFormatError::UnexpectedConstant {
                index,
                expected: "member reference",
            }),
        }
    }

    /// Descriptor of an `invokedynamic` call site or a dynamic constant.
    pub fn dynamic_descriptor(&self, index: u16) -> Result<String, ClassFormatError> {
        match self.get(index)? {
            Constant::Dynamic { name_and_type, .. }
            | Constant::InvokeDynamic { name_and_type, .. } => {
                Ok(self.name_and_type(*name_and_type)?.1)
            }
            _ => Err(ClassFormatError::UnexpectedConstant {
                index,
                expected: "dynamic constant",
            }),
        }
    }

    /// Operand stack slots pushed by `ldc`/`ldc_w`/`ldc2_w` of this entry.
    pub fn loadable_slots(&self, index: u16) -> Result<u32, ClassFormatError> {
        match self.get(index)? {
            Constant::Long(_) | Constant::Double(_) => Ok(2),
            Constant::Integer(_)
            | Constant::Float(_)
            | Constant::String(_)
            | Constant::Class(_)
            | Constant::MethodHandle { .. }
            | Constant::MethodType(_) => Ok(1),
            Constant::Dynamic { .. } => {
                let descriptor = self.dynamic_descriptor(index)?;
                Ok(if descriptor == "J" || descriptor == "D" { 2 } else { 1 })
            }
            _ => Err(ClassFormatError::UnexpectedConstant {
                index,
                expected: "loadable constant",
            }),
        }
    }

    /// Returns the index of an equal entry, appending one if none exists.
    pub fn add(&mut self, constant: Constant) -> Result<u16, ClassFormatError> {
        if let Some(pos) = self.entries.iter().position(|e| *e == constant) {
            return Ok(pos as u16);
        }
        let wide = constant.is_wide();
        let needed = if wide { 2 } else { 1 };
        if self.entries.len() + needed > u16::MAX as usize {
            return Err(ClassFormatError::ConstantPoolOverflow);
        }
        let index = self.entries.len() as u16;
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    pub fn add_utf8(&mut self, value: &str) -> Result<u16, ClassFormatError> {
        self.add(Constant::Utf8(encode_modified_utf8(value)))
    }

    pub fn add_class(&mut self, internal_name: &str) -> Result<u16, ClassFormatError> {
        let name = self.add_utf8(internal_name)?;
        self.add(Constant::Class(name))
    }

    pub fn add_integer(&mut self, value: i32) -> Result<u16, ClassFormatError> {
        self.add(Constant::Integer(value))
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFormatError> {
        let name = self.add_utf8(name)?;
        let descriptor = self.add_utf8(descriptor)?;
        self.add(Constant::NameAndType { name, descriptor })
    }

    pub fn add_field_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFormatError> {
        let class = self.add_class(owner)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::FieldRef {
            class,
            name_and_type,
        })
    }

    pub fn add_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFormatError> {
        let class = self.add_class(owner)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::MethodRef {
            class,
            name_and_type,
        })
    }

    pub fn add_interface_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFormatError> {
        let class = self.add_class(owner)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::InterfaceMethodRef {
            class,
            name_and_type,
        })
    }
}

pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassFormatError> {
    // Plain ASCII without NUL is by far the common case.
    if bytes.iter().all(|b| (0x01..0x80).contains(b)) {
        return String::from_utf8(bytes.to_vec()).map_err(|_| ClassFormatError::InvalidUtf8);
    }

    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i] as u16;
        if b0 & 0x80 == 0 {
            if b0 == 0 {
                return Err(ClassFormatError::InvalidUtf8);
            }
            units.push(b0);
            i += 1;
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = *bytes.get(i + 1).ok_or(ClassFormatError::InvalidUtf8)? as u16;
            if b1 & 0xC0 != 0x80 {
                return Err(ClassFormatError::InvalidUtf8);
            }
            units.push(((b0 & 0x1F) << 6) | (b1 & 0x3F));
            i += 2;
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = *bytes.get(i + 1).ok_or(ClassFormatError::InvalidUtf8)? as u16;
            let b2 = *bytes.get(i + 2).ok_or(ClassFormatError::InvalidUtf8)? as u16;
            if b1 & 0xC0 != 0x80 || b2 & 0xC0 != 0x80 {
                return Err(ClassFormatError::InvalidUtf8);
            }
            units.push(((b0 & 0x0F) << 12) | ((b1 & 0x3F) << 6) | (b2 & 0x3F));
            i += 3;
        } else {
            return Err(ClassFormatError::InvalidUtf8);
        }
    }

    String::from_utf16(&units).map_err(|_| ClassFormatError::InvalidUtf8)
}

pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}
