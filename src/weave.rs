//! Marker recognition and host rewriting for one compiled unit.
//!
//! A unit carrying the module marker is only recorded. A unit carrying the
//! host marker has every lifecycle method patched to also call the runtime
//! dispatcher before each return, and gains the lifecycle methods it does
//! not declare.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classfile::opcodes::*;
use crate::classfile::{self, ACC_PUBLIC, Code, CompiledUnit, Insn};
use crate::config::WeaverConfig;
use crate::error::ClassFormatError;
use crate::registry::{Discovery, ModuleEntry, ModuleRegistry};

/// Which argument a lifecycle method hands on to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    None,
    Reference,
    Primitive,
}

impl Forward {
    fn load(self) -> Option<Insn> {
        match self {
            Forward::None => None,
            Forward::Reference => Some(Insn::Simple(ALOAD_1)),
            Forward::Primitive => Some(Insn::Simple(ILOAD_1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleHook {
    pub name: &'static str,
    pub descriptor: &'static str,
    pub forward: Forward,
}

pub const LIFECYCLE: [LifecycleHook; 6] = [
    LifecycleHook {
        name: "onCreate",
        descriptor: "()V",
        forward: Forward::None,
    },
    LifecycleHook {
        name: "attachBaseContext",
        descriptor: "(Landroid/content/Context;)V",
        forward: Forward::Reference,
    },
    LifecycleHook {
        name: "onConfigurationChanged",
        descriptor: "(Landroid/content/res/Configuration;)V",
        forward: Forward::Reference,
    },
    LifecycleHook {
        name: "onLowMemory",
        descriptor: "()V",
        forward: Forward::None,
    },
    LifecycleHook {
        name: "onTerminate",
        descriptor: "()V",
        forward: Forward::None,
    },
    LifecycleHook {
        name: "onTrimMemory",
        descriptor: "(I)V",
        forward: Forward::Primitive,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeaveOutcome {
    Untouched,
    Module {
        entry: ModuleEntry,
        registered: bool,
    },
    Host {
        patched_methods: usize,
        patched_returns: usize,
        synthesized: usize,
    },
}

/// Result of running one class entry through the weaver.
#[derive(Debug)]
pub struct Transformed {
    /// Re-encoded bytes, or `None` when the original bytes stand.
    pub bytes: Option<Vec<u8>>,
    pub outcome: WeaveOutcome,
}

/// Shares the marker configuration and the invocation's registry across
/// scanning tasks.
#[derive(Debug, Clone)]
pub struct Weaver {
    config: Arc<WeaverConfig>,
    registry: Arc<ModuleRegistry>,
}

impl Weaver {
    pub fn new(config: Arc<WeaverConfig>, registry: Arc<ModuleRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Decodes, visits and (when touched) re-encodes one class. A decode
    /// failure leaves the registry untouched.
    pub fn transform(
        &self,
        bytes: &[u8],
        discovery: Discovery,
        origin: &str,
    ) -> Result<Transformed, ClassFormatError> {
        let mut unit = classfile::decode(bytes, self.config.max_class_major_version)?;
        let outcome = self.visit(&mut unit)?;

        let outcome = match outcome {
            Visit::Module(entry) => {
                let registered = self.registry.register(entry.clone(), discovery, origin);
                if registered {
                    info!(
                        module = %entry.type_name,
                        priority = entry.priority,
                        origin,
                        "registered module entry"
                    );
                } else {
                    debug!(module = %entry.type_name, origin, "duplicate module entry dropped");
                }
                WeaveOutcome::Module { entry, registered }
            }
            Visit::Host(outcome) => outcome,
            Visit::Untouched => WeaveOutcome::Untouched,
        };

        let bytes = if unit.is_modified() {
            Some(classfile::encode(&unit)?)
        } else {
            None
        };
        Ok(Transformed { bytes, outcome })
    }

    /// Applies the marker rules to an already decoded unit. Module entries
    /// are returned, not registered.
    pub fn visit(&self, unit: &mut CompiledUnit) -> Result<Visit, ClassFormatError> {
        let is_host = unit.annotation(&self.config.host_marker).is_some();

        if let Some(marker) = unit.annotation(&self.config.module_marker) {
            let priority = marker
                .int_element(&self.config.priority_attribute)
                .unwrap_or(self.config.default_priority);
            return Ok(Visit::Module(ModuleEntry {
                priority,
                type_name: unit.name().to_string(),
            }));
        }

        if !is_host {
            return Ok(Visit::Untouched);
        }
        info!(host = %unit.name(), "rewriting host lifecycle");
        self.rewrite_host(unit).map(Visit::Host)
    }

    fn rewrite_host(&self, unit: &mut CompiledUnit) -> Result<WeaveOutcome, ClassFormatError> {
        let mut patched_methods = 0;
        let mut patched_returns = 0;
        let mut synthesized = 0;

        let accessor = unit.pool.add_method_ref(
            &self.config.dispatcher_class,
            &self.config.dispatcher_accessor,
            &self.config.dispatcher_descriptor(),
        )?;

        for hook in LIFECYCLE {
            let callback = unit.pool.add_method_ref(
                &self.config.dispatcher_class,
                hook.name,
                hook.descriptor,
            )?;
            let dispatch = dispatch_sequence(accessor, callback, hook.forward);

            if let Some(method) = unit.find_method(hook.name, hook.descriptor) {
                if method.is_static() || method.code.is_none() {
                    warn!(host = %unit.name(), method = hook.name, "lifecycle method has no instance body, left as is");
                    continue;
                }
                let returns = unit
                    .edit_method_code(hook.name, hook.descriptor, |list| {
                        list.insert_before_returns(|| dispatch.clone())
                    })?
                    .unwrap_or_default();
                debug!(host = %unit.name(), method = hook.name, returns, "patched lifecycle method");
                patched_methods += 1;
                patched_returns += returns;
                continue;
            }

            let Some(super_name) = unit.super_name().map(str::to_string) else {
                warn!(host = %unit.name(), method = hook.name, "host has no superclass, not synthesizing");
                continue;
            };
            let super_call = unit
                .pool
                .add_method_ref(&super_name, hook.name, hook.descriptor)?;

            let mut insns = vec![Insn::Simple(ALOAD_0)];
            insns.extend(hook.forward.load());
            insns.push(Insn::Member {
                opcode: INVOKESPECIAL,
                index: super_call,
            });
            insns.extend(dispatch);
            insns.push(Insn::Simple(RETURN));

            let code = Code::generate(insns)?;
            unit.add_method(ACC_PUBLIC, hook.name, hook.descriptor, Some(code))?;
            debug!(host = %unit.name(), method = hook.name, "synthesized lifecycle method");
            synthesized += 1;
        }

        Ok(WeaveOutcome::Host {
            patched_methods,
            patched_returns,
            synthesized,
        })
    }
}

/// What a visit found, before anything is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visit {
    Untouched,
    Module(ModuleEntry),
    Host(WeaveOutcome),
}

fn dispatch_sequence(accessor: u16, callback: u16, forward: Forward) -> Vec<Insn> {
    let mut insns = vec![Insn::Member {
        opcode: INVOKESTATIC,
        index: accessor,
    }];
    insns.extend(forward.load());
    insns.push(Insn::Member {
        opcode: INVOKEVIRTUAL,
        index: callback,
    });
    insns
}
