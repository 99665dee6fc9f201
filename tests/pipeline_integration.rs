use creation::classfile::opcodes::NEW;
use creation::classfile::{
    self, ACC_PUBLIC, ACC_SUPER, Code, CompiledUnit, Insn, InsnList, opcodes::RETURN,
};
use creation::config::WeaverConfig;
use creation::error::WeaveError;
use creation::invocation::{
    ContentType, DirectoryInput, DirectoryOutputProvider, JarInput, Scope, Status,
    TransformInput, TransformInvocation,
};
use creation::pipeline::{Pipeline, PipelineReport};
use creation::state::RegistryState;
use creation::weave::LIFECYCLE;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const APPLICATION: &str = "android/app/Application";

fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "creation_it_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ))
}

fn config() -> WeaverConfig {
    WeaverConfig {
        enable: true,
        workers: Some(4),
        ..WeaverConfig::default()
    }
}

fn class(name: &str, marker: Option<(&str, &[(&str, i32)])>) -> Vec<u8> {
    let mut unit =
        CompiledUnit::new(52, ACC_PUBLIC | ACC_SUPER, name, Some(APPLICATION), &[]).unwrap();
    if let Some(marker) = marker {
        unit.add_annotations(false, &[marker]).unwrap();
    }
    classfile::encode(&unit).unwrap()
}

fn module(name: &str, priority: i32) -> Vec<u8> {
    let marker = WeaverConfig::default().module_marker;
    let elements: &[(&str, i32)] = &[("priority", priority)];
    class(name, Some((marker.as_str(), elements)))
}

fn host(name: &str) -> Vec<u8> {
    let marker = WeaverConfig::default().host_marker;
    let mut unit =
        CompiledUnit::new(52, ACC_PUBLIC | ACC_SUPER, name, Some(APPLICATION), &[]).unwrap();
    let none: &[(&str, i32)] = &[];
    unit.add_annotations(false, &[(marker.as_str(), none)]).unwrap();
    let code = Code::generate(vec![Insn::Simple(RETURN)]).unwrap();
    unit.add_method(ACC_PUBLIC, "onLowMemory", "()V", Some(code))
        .unwrap();
    classfile::encode(&unit).unwrap()
}

fn write_jar(path: &Path, entries: &[(&str, &[u8])]) {
    use zip::write::FileOptions;

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

fn jar_entry(path: &Path, name: &str) -> Vec<u8> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut data = Vec::new();
    entry.read_to_end(&mut data).unwrap();
    data
}

fn jar_input(file: &Path, status: Status) -> JarInput {
    JarInput {
        name: file.file_name().unwrap().to_string_lossy().to_string(),
        file: file.to_path_buf(),
        content_types: vec![ContentType::Classes],
        scopes: vec![Scope::ExternalLibraries],
        status,
    }
}

fn dir_input(file: &Path, changed_files: BTreeMap<PathBuf, Status>) -> DirectoryInput {
    DirectoryInput {
        name: "classes".to_string(),
        file: file.to_path_buf(),
        content_types: vec![ContentType::Classes],
        scopes: vec![Scope::Project],
        changed_files,
    }
}

fn invocation(
    build_dir: &Path,
    incremental: bool,
    jars: Vec<JarInput>,
    dirs: Vec<DirectoryInput>,
) -> TransformInvocation {
    TransformInvocation {
        incremental,
        build_dir: build_dir.to_path_buf(),
        applied_plugins: vec!["com.android.application".to_string()],
        inputs: vec![TransformInput {
            jar_inputs: jars,
            directory_inputs: dirs,
        }],
    }
}

/// Runs one invocation with state kept under `output`; the environment is
/// closed again before returning.
fn run(
    config: WeaverConfig,
    output: &Path,
    invocation: &TransformInvocation,
) -> Result<PipelineReport, WeaveError> {
    let outputs = Arc::new(DirectoryOutputProvider::new(output));
    let state = RegistryState::open_in(output).unwrap();
    Pipeline::new(config, outputs)
        .with_state(state)
        .run(invocation)
}

/// Module types instantiated by the provider's static initializer, in order.
fn provider_modules(path: &Path) -> Vec<String> {
    let bytes = std::fs::read(path).unwrap();
    let unit = classfile::decode(&bytes, 69).unwrap();
    let clinit = unit.find_method("<clinit>", "()V").unwrap();
    let code = clinit.code.as_ref().unwrap();
    InsnList::decode(&code.bytecode)
        .unwrap()
        .nodes
        .iter()
        .filter_map(|node| match node.insn {
            Insn::Member { opcode, index } if opcode == NEW => {
                Some(unit.pool.class_name(index).unwrap())
            }
            _ => None,
        })
        .filter(|name| name != "java/util/ArrayList")
        .collect()
}

fn output_jar(output: &Path, jar: &JarInput) -> PathBuf {
    use creation::invocation::{Format, OutputProvider};
    DirectoryOutputProvider::new(output).content_location(
        &jar.file.to_string_lossy(),
        &jar.content_types,
        &jar.scopes,
        Format::Jar,
    )
}

fn output_dir(output: &Path, dir: &DirectoryInput) -> PathBuf {
    use creation::invocation::{Format, OutputProvider};
    DirectoryOutputProvider::new(output).content_location(
        &dir.name,
        &dir.content_types,
        &dir.scopes,
        Format::Directory,
    )
}

#[test]
fn modules_are_listed_by_priority_with_stable_ties() {
    let root = temp_dir("priority");
    let jar = root.join("in/lib.jar");
    write_jar(
        &jar,
        &[
            ("m/X.class", module("m/X", 5).as_slice()),
            ("m/Y.class", module("m/Y", 1).as_slice()),
            ("m/Plain.class", class("m/Plain", None).as_slice()),
        ],
    );
    let classes = root.join("in/classes");
    std::fs::create_dir_all(classes.join("m")).unwrap();
    std::fs::write(classes.join("m/Z.class"), module("m/Z", 5)).unwrap();

    let invocation = invocation(
        &root.join("build"),
        false,
        vec![jar_input(&jar, Status::Added)],
        vec![dir_input(&classes, BTreeMap::new())],
    );

    for attempt in 0..3 {
        let output = root.join(format!("out{attempt}"));
        let report = run(config(), &output, &invocation).unwrap();
        assert_eq!(report.stats.modules, 3);
        assert!(report.task_failures.is_empty());
        let modules = provider_modules(report.provider.as_deref().unwrap());
        assert_eq!(modules, vec!["m/Y", "m/X", "m/Z"]);
    }

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn rewritten_archives_are_byte_identical_across_runs() {
    let root = temp_dir("deterministic");
    let jar = root.join("in/app.jar");
    write_jar(
        &jar,
        &[
            ("app/Host.class", host("app/Host").as_slice()),
            ("m/A.class", module("m/A", 3).as_slice()),
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".as_slice()),
        ],
    );
    let input = jar_input(&jar, Status::Added);
    let invocation = invocation(&root.join("build"), false, vec![input.clone()], Vec::new());

    let first = root.join("first");
    let second = root.join("second");
    run(config(), &first, &invocation).unwrap();
    run(config(), &second, &invocation).unwrap();

    assert_eq!(
        std::fs::read(output_jar(&first, &input)).unwrap(),
        std::fs::read(output_jar(&second, &input)).unwrap()
    );

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn host_in_directory_gains_every_lifecycle_method() {
    let root = temp_dir("host");
    let classes = root.join("in/classes");
    std::fs::create_dir_all(classes.join("app")).unwrap();
    std::fs::write(classes.join("app/Host.class"), host("app/Host")).unwrap();
    std::fs::write(classes.join("app/R.class"), b"not a class").unwrap();

    let output = root.join("out");
    let invocation = invocation(
        &root.join("build"),
        false,
        Vec::new(),
        vec![dir_input(&classes, BTreeMap::new())],
    );
    let report = run(config(), &output, &invocation).unwrap();
    assert_eq!(report.stats.hosts, 1);
    assert_eq!(report.stats.malformed, 0);

    assert!(report.provider.unwrap().starts_with(output.join("dirs")));

    let mut rewritten = None;
    for entry in std::fs::read_dir(output.join("dirs")).unwrap() {
        let candidate = entry.unwrap().path().join("app/Host.class");
        if candidate.exists() {
            rewritten = Some(candidate);
        }
    }
    let rewritten = rewritten.unwrap();
    let unit = classfile::decode(&std::fs::read(&rewritten).unwrap(), 69).unwrap();
    for hook in LIFECYCLE {
        let count = unit
            .methods
            .iter()
            .filter(|m| m.name == hook.name && m.descriptor == hook.descriptor)
            .count();
        assert_eq!(count, 1, "{}", hook.name);
    }
    assert_eq!(
        std::fs::read(rewritten.with_file_name("R.class")).unwrap(),
        b"not a class"
    );

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn duplicate_module_types_are_listed_once() {
    let root = temp_dir("duplicate");
    let first = root.join("in/first.jar");
    let second = root.join("in/second.jar");
    write_jar(&first, &[("m/Shared.class", module("m/Shared", 2).as_slice())]);
    write_jar(&second, &[("m/Shared.class", module("m/Shared", 2).as_slice())]);

    let invocation = invocation(
        &root.join("build"),
        false,
        vec![
            jar_input(&first, Status::Added),
            jar_input(&second, Status::Added),
        ],
        Vec::new(),
    );
    let report = run(config(), &root.join("out"), &invocation).unwrap();
    assert_eq!(report.stats.modules, 2);
    assert_eq!(report.modules.len(), 1);
    assert_eq!(
        provider_modules(report.provider.as_deref().unwrap()),
        vec!["m/Shared"]
    );

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn malformed_class_does_not_abort_its_siblings() {
    let root = temp_dir("malformed");
    let jar = root.join("in/lib.jar");
    let mut broken = module("m/Broken", 1);
    broken.truncate(broken.len() - 4);
    write_jar(
        &jar,
        &[
            ("m/Broken.class", broken.as_slice()),
            ("m/Good.class", module("m/Good", 1).as_slice()),
        ],
    );
    let input = jar_input(&jar, Status::Added);
    let output = root.join("out");
    let invocation = invocation(&root.join("build"), false, vec![input.clone()], Vec::new());

    let report = run(config(), &output, &invocation).unwrap();
    assert_eq!(report.stats.malformed, 1);
    assert!(report.task_failures.is_empty());
    assert_eq!(
        provider_modules(report.provider.as_deref().unwrap()),
        vec!["m/Good"]
    );
    assert_eq!(jar_entry(&output_jar(&output, &input), "m/Broken.class"), broken);

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn incremental_build_removes_outputs_and_carries_untouched_modules() {
    let root = temp_dir("incremental");
    let kept = root.join("in/kept.jar");
    let removed = root.join("in/removed.jar");
    write_jar(&kept, &[("m/Kept.class", module("m/Kept", 2).as_slice())]);
    write_jar(&removed, &[("m/Gone.class", module("m/Gone", 1).as_slice())]);
    let classes = root.join("in/classes");
    std::fs::create_dir_all(classes.join("m")).unwrap();
    std::fs::write(classes.join("m/Local.class"), module("m/Local", 3)).unwrap();

    let output = root.join("out");
    let full = invocation(
        &root.join("build"),
        false,
        vec![
            jar_input(&kept, Status::Added),
            jar_input(&removed, Status::Added),
        ],
        vec![dir_input(&classes, BTreeMap::new())],
    );
    let report = run(config(), &output, &full).unwrap();
    assert_eq!(
        provider_modules(report.provider.as_deref().unwrap()),
        vec!["m/Gone", "m/Kept", "m/Local"]
    );
    let removed_output = output_jar(&output, &jar_input(&removed, Status::Removed));
    assert!(removed_output.exists());

    std::fs::remove_file(&removed).unwrap();
    std::fs::write(classes.join("m/Extra.class"), module("m/Extra", 0)).unwrap();
    let changed = [(classes.join("m/Extra.class"), Status::Added)]
        .into_iter()
        .collect();
    let incremental = invocation(
        &root.join("build"),
        true,
        vec![
            jar_input(&kept, Status::NotChanged),
            jar_input(&removed, Status::Removed),
        ],
        vec![dir_input(&classes, changed)],
    );
    let report = run(config(), &output, &incremental).unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.carried_forward, 2);
    assert!(!removed_output.exists());
    assert_eq!(
        provider_modules(report.provider.as_deref().unwrap()),
        vec!["m/Extra", "m/Kept", "m/Local"]
    );

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn removed_directory_file_is_dropped_from_outputs_and_provider() {
    let root = temp_dir("removed-file");
    let classes = root.join("in/classes");
    std::fs::create_dir_all(classes.join("m")).unwrap();
    std::fs::write(classes.join("m/A.class"), module("m/A", 1)).unwrap();
    std::fs::write(classes.join("m/B.class"), module("m/B", 2)).unwrap();

    let output = root.join("out");
    let full = invocation(
        &root.join("build"),
        false,
        Vec::new(),
        vec![dir_input(&classes, BTreeMap::new())],
    );
    let report = run(config(), &output, &full).unwrap();
    assert_eq!(
        provider_modules(report.provider.as_deref().unwrap()),
        vec!["m/A", "m/B"]
    );
    let dest_root = output_dir(&output, &dir_input(&classes, BTreeMap::new()));
    assert!(dest_root.join("m/A.class").exists());

    std::fs::remove_file(classes.join("m/A.class")).unwrap();
    let changed = [(classes.join("m/A.class"), Status::Removed)]
        .into_iter()
        .collect();
    let incremental = invocation(
        &root.join("build"),
        true,
        Vec::new(),
        vec![dir_input(&classes, changed)],
    );
    let report = run(config(), &output, &incremental).unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.directory_files, 0);
    assert_eq!(report.carried_forward, 1);
    assert!(!dest_root.join("m/A.class").exists());
    assert!(dest_root.join("m/B.class").exists());
    assert_eq!(
        provider_modules(report.provider.as_deref().unwrap()),
        vec!["m/B"]
    );

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn failed_removal_waits_for_archives_already_scheduled() {
    let root = temp_dir("failed-removal");
    let added = root.join("in/added.jar");
    let blocked = root.join("in/blocked.jar");
    write_jar(&added, &[("m/A.class", module("m/A", 1).as_slice())]);

    let output = root.join("out");
    let added_input = jar_input(&added, Status::Added);
    let blocked_input = jar_input(&blocked, Status::Removed);
    // A directory where the removed archive's output should be cannot be
    // deleted as a file.
    let blocked_output = output_jar(&output, &blocked_input);
    std::fs::create_dir_all(blocked_output.join("nested")).unwrap();

    let incremental = invocation(
        &root.join("build"),
        true,
        vec![added_input.clone(), blocked_input],
        Vec::new(),
    );
    let result = run(config(), &output, &incremental);
    assert!(matches!(
        result,
        Err(WeaveError::Io { ref path, .. }) if *path == blocked_output
    ));
    // The archive scheduled before the failure was fully written.
    assert_eq!(
        jar_entry(&output_jar(&output, &added_input), "m/A.class"),
        module("m/A", 1)
    );

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn disabled_weaver_copies_inputs_verbatim() {
    let root = temp_dir("disabled");
    let jar = root.join("in/app.jar");
    write_jar(&jar, &[("app/Host.class", host("app/Host").as_slice())]);
    let input = jar_input(&jar, Status::Added);
    let output = root.join("out");
    let invocation = invocation(&root.join("build"), false, vec![input.clone()], Vec::new());

    let report = run(WeaverConfig::default(), &output, &invocation).unwrap();
    assert!(!report.enabled);
    assert!(report.provider.is_none());
    assert_eq!(
        std::fs::read(output_jar(&output, &input)).unwrap(),
        std::fs::read(&jar).unwrap()
    );

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn full_build_cleans_previous_outputs_and_dexer_cache() {
    let root = temp_dir("clean");
    let build = root.join("build");
    let dex_cache = build.join("intermediates/transforms/dexBuilder/debug/0.jar");
    std::fs::create_dir_all(dex_cache.parent().unwrap()).unwrap();
    std::fs::write(&dex_cache, b"stale").unwrap();
    let output = root.join("out");
    let stale = output.join("jars/stale.jar");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, b"stale").unwrap();

    let invocation = invocation(&build, false, Vec::new(), Vec::new());
    let report = run(config(), &output, &invocation).unwrap();
    assert!(report.modules.is_empty());
    assert!(!stale.exists());
    assert!(!dex_cache.exists());
    assert!(build.join("intermediates/transforms/dexBuilder").exists());

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn enabled_weaver_requires_the_application_plugin() {
    let root = temp_dir("plugin");
    let mut invocation = invocation(&root.join("build"), false, Vec::new(), Vec::new());
    invocation.applied_plugins.clear();

    match run(config(), &root.join("out"), &invocation) {
        Err(WeaveError::Configuration(message)) => {
            assert!(message.contains("com.android.application"))
        }
        other => panic!("unexpected {other:?}"),
    }

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn inspect_prints_class_structure() {
    let root = temp_dir("inspect");
    std::fs::create_dir_all(&root).unwrap();
    let path = root.join("Host.class");
    std::fs::write(&path, host("app/Host")).unwrap();

    let config = root.join("config.json");
    std::fs::write(&config, "{}").unwrap();

    let bin = env!("CARGO_BIN_EXE_creation");
    let out = Command::new(bin)
        .args(["inspect", path.to_str().unwrap()])
        .args(["--config", config.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["name"], "app/Host");
    assert_eq!(json["super_name"], APPLICATION);
    assert_eq!(json["methods"][0]["name"], "onLowMemory");

    let _ = std::fs::remove_dir_all(root);
}
