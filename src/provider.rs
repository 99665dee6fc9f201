//! Synthesis of the module list provider class.

use std::path::PathBuf;
use tracing::info;

use crate::classfile::opcodes::*;
use crate::classfile::{
    self, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC, ACC_SUPER, Code, CompiledUnit, Insn,
};
use crate::config::WeaverConfig;
use crate::error::{ClassFormatError, WeaveError};
use crate::invocation::{ContentType, Format, OutputProvider, Scope};
use crate::registry::ModuleEntry;

const OBJECT: &str = "java/lang/Object";
const LIST: &str = "java/util/List";
const ARRAY_LIST: &str = "java/util/ArrayList";
const LIST_FIELD: &str = "list";
const LIST_DESCRIPTOR: &str = "Ljava/util/List;";
const GETTER: &str = "getModuleList";
const GETTER_DESCRIPTOR: &str = "()Ljava/util/List;";

/// Builds the provider unit: a static list filled, in `entries` order, with
/// one new instance of every module entry type.
pub fn build(config: &WeaverConfig, entries: &[ModuleEntry]) -> Result<CompiledUnit, ClassFormatError> {
    let mut unit = CompiledUnit::new(
        config.provider_class_version,
        ACC_PUBLIC | ACC_SUPER,
        &config.provider_class,
        Some(OBJECT),
        &[config.provider_interface.as_str()],
    )?;

    let signature = format!("Ljava/util/List<L{};>;", config.module_interface);
    unit.add_field(ACC_PRIVATE | ACC_STATIC, LIST_FIELD, LIST_DESCRIPTOR, Some(&signature))?;
    let field = unit
        .pool
        .add_field_ref(&config.provider_class, LIST_FIELD, LIST_DESCRIPTOR)?;

    let object_init = unit.pool.add_method_ref(OBJECT, "<init>", "()V")?;
    let constructor = Code::generate(vec![
        Insn::Simple(ALOAD_0),
        Insn::Member {
            opcode: INVOKESPECIAL,
            index: object_init,
        },
        Insn::Simple(RETURN),
    ])?;
    unit.add_method(ACC_PUBLIC, "<init>", "()V", Some(constructor))?;

    let array_list = unit.pool.add_class(ARRAY_LIST)?;
    let array_list_init = unit.pool.add_method_ref(ARRAY_LIST, "<init>", "()V")?;
    let add = unit
        .pool
        .add_interface_method_ref(LIST, "add", "(Ljava/lang/Object;)Z")?;

    let mut init = vec![
        Insn::Member {
            opcode: NEW,
            index: array_list,
        },
        Insn::Simple(DUP),
        Insn::Member {
            opcode: INVOKESPECIAL,
            index: array_list_init,
        },
        Insn::Member {
            opcode: PUTSTATIC,
            index: field,
        },
    ];
    for entry in entries {
        let class = unit.pool.add_class(&entry.type_name)?;
        let constructor = unit.pool.add_method_ref(&entry.type_name, "<init>", "()V")?;
        init.extend([
            Insn::Member {
                opcode: GETSTATIC,
                index: field,
            },
            Insn::Member {
                opcode: NEW,
                index: class,
            },
            Insn::Simple(DUP),
            Insn::Member {
                opcode: INVOKESPECIAL,
                index: constructor,
            },
            Insn::InvokeInterface {
                index: add,
                count: 2,
            },
            Insn::Simple(POP),
        ]);
    }
    init.push(Insn::Simple(RETURN));
    unit.add_method(ACC_STATIC, "<clinit>", "()V", Some(Code::generate(init)?))?;

    let getter = Code::generate(vec![
        Insn::Member {
            opcode: GETSTATIC,
            index: field,
        },
        Insn::Simple(ARETURN),
    ])?;
    unit.add_method(ACC_PUBLIC, GETTER, GETTER_DESCRIPTOR, Some(getter))?;

    Ok(unit)
}

/// Encodes the provider and writes it below the reserved output location.
pub fn write(
    config: &WeaverConfig,
    entries: &[ModuleEntry],
    outputs: &dyn OutputProvider,
) -> Result<PathBuf, WeaveError> {
    let unit = build(config, entries)
        .map_err(|e| WeaveError::Synthesis(anyhow::Error::new(e).context("building provider")))?;
    let bytes = classfile::encode(&unit)
        .map_err(|e| WeaveError::Synthesis(anyhow::Error::new(e).context("encoding provider")))?;

    let root = outputs.content_location(
        &config.provider_output_name,
        &[ContentType::Classes],
        &[Scope::Project],
        Format::Directory,
    );
    let path = root.join(format!("{}.class", config.provider_class));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| WeaveError::io(parent, e))?;
    }
    std::fs::write(&path, bytes).map_err(|e| WeaveError::io(&path, e))?;

    info!(
        path = %path.display(),
        modules = entries.len(),
        "wrote module list provider"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::code::InsnList;
    use crate::classfile::decode;

    fn entry(priority: i32, name: &str) -> ModuleEntry {
        ModuleEntry {
            priority,
            type_name: name.to_string(),
        }
    }

    fn constructed(unit: &CompiledUnit) -> Vec<String> {
        let code = unit.find_method("<clinit>", "()V").unwrap().code.as_ref().unwrap();
        InsnList::decode(&code.bytecode)
            .unwrap()
            .nodes
            .iter()
            .filter_map(|n| match n.insn {
                Insn::Member { opcode: NEW, index } => Some(unit.pool.class_name(index).unwrap()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn provider_lists_entries_in_given_order() {
        let config = WeaverConfig::default();
        let entries = vec![entry(1, "m/A"), entry(5, "m/B"), entry(5, "m/C")];
        let bytes = classfile::encode(&build(&config, &entries).unwrap()).unwrap();
        let unit = decode(&bytes, 69).unwrap();

        assert_eq!(unit.name(), config.provider_class);
        assert_eq!(unit.major_version, 52);
        assert_eq!(unit.interfaces(), &[config.provider_interface.clone()]);
        assert_eq!(
            constructed(&unit),
            vec!["java/util/ArrayList", "m/A", "m/B", "m/C"]
        );

        let field = &unit.fields[0];
        assert_eq!(field.name, "list");
        assert_eq!(field.access_flags, ACC_PRIVATE | ACC_STATIC);
        assert_eq!(field.attributes.len(), 1);

        let clinit = unit.find_method("<clinit>", "()V").unwrap().code.as_ref().unwrap();
        assert_eq!(clinit.max_stack, 3);
        assert_eq!(clinit.max_locals, 0);
        let getter = unit.find_method("getModuleList", "()Ljava/util/List;").unwrap();
        assert_eq!(getter.access_flags, ACC_PUBLIC);
    }

    #[test]
    fn empty_registry_still_yields_a_provider() {
        let unit = build(&WeaverConfig::default(), &[]).unwrap();
        assert_eq!(constructed(&unit), vec!["java/util/ArrayList"]);
        assert_eq!(unit.methods.len(), 3);
    }
}
