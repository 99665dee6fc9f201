use anyhow::{Context, Result};
use clap::Parser;
use creation::classfile::{self, Annotation};
use creation::cli::{Cli, Commands};
use creation::config::WeaverConfig;
use creation::invocation::{DirectoryOutputProvider, TransformInvocation};
use creation::logging::init_logging;
use creation::pipeline::Pipeline;
use creation::state::RegistryState;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command.clone() {
        Commands::Run {
            invocation,
            output,
            enable,
        } => {
            let mut config = WeaverConfig::load(cli.config.as_deref())?;
            if enable {
                config.enable = true;
            }
            let invocation = TransformInvocation::from_file(&invocation)?;
            let outputs = Arc::new(DirectoryOutputProvider::new(&output));
            let state = RegistryState::open_in(&output)?;
            let report = Pipeline::new(config, outputs)
                .with_state(state)
                .run(&invocation)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Inspect { class_file } => {
            let config = WeaverConfig::load(cli.config.as_deref())?;
            let summary = inspect(&class_file, config.max_class_major_version)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct ClassSummary<'a> {
    name: &'a str,
    version: String,
    super_name: Option<&'a str>,
    interfaces: &'a [String],
    annotations: &'a [Annotation],
    fields: Vec<String>,
    methods: Vec<MethodSummary<'a>>,
}

#[derive(Debug, Serialize)]
struct MethodSummary<'a> {
    name: &'a str,
    descriptor: &'a str,
    access_flags: u16,
    code_length: Option<usize>,
    max_stack: Option<u16>,
    max_locals: Option<u16>,
}

fn inspect(path: &Path, max_major: u16) -> Result<serde_json::Value> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read class: {}", path.display()))?;
    let unit = classfile::decode(&bytes, max_major)
        .with_context(|| format!("Failed to decode class: {}", path.display()))?;

    let summary = ClassSummary {
        name: unit.name(),
        version: format!("{}.{}", unit.major_version, unit.minor_version),
        super_name: unit.super_name(),
        interfaces: unit.interfaces(),
        annotations: unit.annotations(),
        fields: unit
            .fields
            .iter()
            .map(|f| format!("{} {}", f.name, f.descriptor))
            .collect(),
        methods: unit
            .methods
            .iter()
            .map(|m| MethodSummary {
                name: &m.name,
                descriptor: &m.descriptor,
                access_flags: m.access_flags,
                code_length: m.code.as_ref().map(|c| c.bytecode.len()),
                max_stack: m.code.as_ref().map(|c| c.max_stack),
                max_locals: m.code.as_ref().map(|c| c.max_locals),
            })
            .collect(),
    };
    Ok(serde_json::to_value(summary)?)
}
