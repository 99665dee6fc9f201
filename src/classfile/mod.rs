//! Structural model of a JVM class file.
//!
//! [`decode`] turns bytes into a [`CompiledUnit`]; [`encode`] writes it back.
//! Everything the weaver does not touch is carried through as raw attribute
//! bytes, so an unmodified unit re-encodes to the bytes it was read from.

pub mod annotation;
mod bytes;
pub mod code;
pub mod descriptor;
mod frames;
pub mod maxs;
pub mod opcodes;
pub mod pool;
mod reader;
mod writer;

pub use annotation::{Annotation, ElementValue};
pub use code::{Insn, InsnList};
use code::MethodContext;
pub use pool::{Constant, ConstantPool};
pub use reader::decode;
pub use writer::encode;

use crate::error::ClassFormatError;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_ABSTRACT: u16 = 0x0400;

const CODE: &str = "Code";
const SIGNATURE: &str = "Signature";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytecode: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<Attribute>,
    pub(crate) recompute_maxs: bool,
}

impl Code {
    /// Assembles freshly generated instructions. Maxs are computed on encode.
    pub fn generate(insns: Vec<Insn>) -> Result<Self, ClassFormatError> {
        let assembled = InsnList::from_insns(insns).assemble()?;
        Ok(Self {
            max_stack: 0,
            max_locals: 0,
            bytecode: assembled.bytecode,
            exception_table: Vec::new(),
            attributes: Vec::new(),
            recompute_maxs: true,
        })
    }

    pub fn is_modified(&self) -> bool {
        self.recompute_maxs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub code: Option<Code>,
    /// Position of the `Code` attribute among the method attributes.
    pub(crate) code_position: usize,
    pub(crate) code_name_index: u16,
    pub attributes: Vec<Attribute>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub minor_version: u16,
    pub major_version: u16,
    pub pool: ConstantPool,
    pub access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interface_indexes: Vec<u16>,
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    annotations: Vec<Annotation>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl CompiledUnit {
    /// Starts an empty unit, as used for synthesized classes and fixtures.
    pub fn new(
        major_version: u16,
        access_flags: u16,
        name: &str,
        super_name: Option<&str>,
        interfaces: &[&str],
    ) -> Result<Self, ClassFormatError> {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class(name)?;
        let super_class = match super_name {
            Some(s) => pool.add_class(s)?,
            None => 0,
        };
        let interface_indexes = interfaces
            .iter()
            .map(|i| pool.add_class(i))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            minor_version: 0,
            major_version,
            pool,
            access_flags,
            this_class,
            super_class,
            interface_indexes,
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    /// Internal (`/`-separated) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn annotation(&self, descriptor: &str) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.descriptor == descriptor)
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    /// Applies `edit` to the body of `name descriptor` through `Code::edit`.
    /// Returns `None` when there is no such method or it has no body.
    pub fn edit_method_code<T>(
        &mut self,
        name: &str,
        descriptor: &str,
        edit: impl FnOnce(&mut InsnList) -> T,
    ) -> Result<Option<T>, ClassFormatError> {
        let Some(method) = self
            .methods
            .iter_mut()
            .find(|m| m.name == name && m.descriptor == descriptor)
        else {
            return Ok(None);
        };
        let is_static = method.is_static();
        let Some(code) = method.code.as_mut() else {
            return Ok(None);
        };
        let context = MethodContext {
            owner: &self.name,
            name: &method.name,
            descriptor: &method.descriptor,
            is_static,
        };
        code.edit(&mut self.pool, &context, edit).map(Some)
    }

    /// True when any method body was edited or generated since decoding.
    pub fn is_modified(&self) -> bool {
        self.methods
            .iter()
            .any(|m| m.code.as_ref().is_some_and(Code::is_modified))
    }

    pub fn add_field(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
    ) -> Result<(), ClassFormatError> {
        let name_index = self.pool.add_utf8(name)?;
        let descriptor_index = self.pool.add_utf8(descriptor)?;
        let attributes = self.signature_attribute(signature)?;
        self.fields.push(Field {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            name_index,
            descriptor_index,
            attributes,
        });
        Ok(())
    }

    pub fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Option<Code>,
    ) -> Result<&mut Method, ClassFormatError> {
        let name_index = self.pool.add_utf8(name)?;
        let descriptor_index = self.pool.add_utf8(descriptor)?;
        let code_name_index = match code {
            Some(_) => self.pool.add_utf8(CODE)?,
            None => 0,
        };
        self.methods.push(Method {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            name_index,
            descriptor_index,
            code,
            code_position: 0,
            code_name_index,
            attributes: Vec::new(),
        });
        let last = self.methods.len() - 1;
        Ok(&mut self.methods[last])
    }

    /// Attaches class-level annotations whose elements are all `int` values.
    pub fn add_annotations(
        &mut self,
        visible: bool,
        annotations: &[(&str, &[(&str, i32)])],
    ) -> Result<(), ClassFormatError> {
        let name = if visible {
            annotation::RUNTIME_VISIBLE_ANNOTATIONS
        } else {
            annotation::RUNTIME_INVISIBLE_ANNOTATIONS
        };
        let name_index = self.pool.add_utf8(name)?;
        let info = annotation::encode_int_annotations(annotations, &mut self.pool)?;
        let parsed = annotation::parse_annotations(&info, &self.pool, visible)?;
        self.annotations.extend(parsed);
        self.attributes.push(Attribute { name_index, info });
        Ok(())
    }

    fn signature_attribute(
        &mut self,
        signature: Option<&str>,
    ) -> Result<Vec<Attribute>, ClassFormatError> {
        let Some(signature) = signature else {
            return Ok(Vec::new());
        };
        let name_index = self.pool.add_utf8(SIGNATURE)?;
        let value = self.pool.add_utf8(signature)?;
        Ok(vec![Attribute {
            name_index,
            info: value.to_be_bytes().to_vec(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::opcodes::*;
    use super::*;

    fn sample() -> CompiledUnit {
        let mut unit = CompiledUnit::new(
            52,
            ACC_PUBLIC | ACC_SUPER,
            "com/example/Sample",
            Some("java/lang/Object"),
            &["java/lang/Runnable"],
        )
        .unwrap();
        unit.add_annotations(false, &[("Lcom/example/Marker;", &[("priority", 3)])])
            .unwrap();
        unit.add_field(ACC_PRIVATE, "count", "I", None).unwrap();
        let init = unit
            .pool
            .add_method_ref("java/lang/Object", "<init>", "()V")
            .unwrap();
        let code = Code::generate(vec![
            Insn::Simple(ALOAD_0),
            Insn::Member {
                opcode: INVOKESPECIAL,
                index: init,
            },
            Insn::Simple(RETURN),
        ])
        .unwrap();
        unit.add_method(ACC_PUBLIC, "<init>", "()V", Some(code)).unwrap();
        unit.add_method(ACC_PUBLIC | ACC_ABSTRACT, "run", "()V", None)
            .unwrap();
        unit
    }

    #[test]
    fn built_unit_decodes_back() {
        let bytes = encode(&sample()).unwrap();
        let decoded = decode(&bytes, 69).unwrap();

        assert_eq!(decoded.name(), "com/example/Sample");
        assert_eq!(decoded.super_name(), Some("java/lang/Object"));
        assert_eq!(decoded.interfaces(), &["java/lang/Runnable".to_string()]);
        assert_eq!(
            decoded
                .annotation("Lcom/example/Marker;")
                .and_then(|a| a.int_element("priority")),
            Some(3)
        );
        let init = decoded.find_method("<init>", "()V").unwrap();
        let code = init.code.as_ref().unwrap();
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.max_locals, 1);
        assert!(decoded.find_method("run", "()V").unwrap().code.is_none());
        assert!(!decoded.is_modified());
    }

    #[test]
    fn unmodified_units_reencode_identically() {
        let bytes = encode(&sample()).unwrap();
        let decoded = decode(&bytes, 69).unwrap();
        assert_eq!(encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn editing_marks_the_unit_modified() {
        let bytes = encode(&sample()).unwrap();
        let mut decoded = decode(&bytes, 69).unwrap();
        let patched = decoded
            .edit_method_code("<init>", "()V", |list| {
                list.insert_before_returns(|| vec![Insn::Simple(NOP)])
            })
            .unwrap();
        assert_eq!(patched, Some(1));
        assert!(decoded.is_modified());
    }

    #[test]
    fn bodyless_and_missing_methods_are_not_edited() {
        let mut unit = sample();
        let edited = unit
            .edit_method_code("run", "()V", |list| list.nodes.len())
            .unwrap();
        assert_eq!(edited, None);
        let edited = unit
            .edit_method_code("stop", "()V", |list| list.nodes.len())
            .unwrap();
        assert_eq!(edited, None);
        assert!(!unit.is_modified());
    }
}
