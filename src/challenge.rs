// src/challenge.rs
// Challenge documents: the on-disk schema, structural validation with
// per-field diagnostics, and the directory loader. A document either loads
// clean or is skipped with a non-empty list of reasons.

use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::errors::LabError;
use crate::validator::Probe;

const ALLOWED_KEYS: &[&str] = &[
    "id",
    "name",
    "description",
    "category",
    "difficulty",
    "score",
    "concepts",
    "setup",
    "user_action_simulation",
    "validation",
    "final_state_checks",
    "process_validation_checks",
    "hints",
    "flag",
    "objective_refs",
    "estimated_time_mins",
    "distro_compatibility",
    "solution_file",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Zypper,
}

impl PackageManager {
    pub fn label(self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Zypper => "zypper",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Environment preparation steps run before the user phase.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetupStep {
    RunCommand {
        command: String,
        user_context: Option<String>,
    },
    EnsurePackageInstalled {
        package: String,
        manager_type: Option<PackageManager>,
        #[serde(default = "default_true")]
        update_cache: bool,
    },
}

impl SetupStep {
    pub fn type_name(&self) -> &'static str {
        match self {
            SetupStep::RunCommand { .. } => "run_command",
            SetupStep::EnsurePackageInstalled { .. } => "ensure_package_installed",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hint {
    pub text: String,
    #[serde(default)]
    pub cost: u32,
}

/// A fully validated challenge document. `hints` and `flag` stay private to
/// the run until earned.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub difficulty: Option<String>,
    pub score: u32,
    pub concepts: Vec<String>,
    pub setup: Vec<SetupStep>,
    pub user_action_simulation: Option<String>,
    pub validation: Option<Vec<Probe>>,
    pub final_state_checks: Vec<Probe>,
    pub process_validation_checks: Vec<Probe>,
    pub hints: Vec<Hint>,
    pub flag: Option<String>,
    pub objective_refs: Vec<String>,
    pub estimated_time_mins: Option<u32>,
    pub distro_compatibility: Vec<String>,
    pub solution_file: Option<String>,
}

impl Challenge {
    /// The probe sequence for a run: the single `validation` list when
    /// present, otherwise final-state checks followed by process checks.
    pub fn probes(&self) -> Vec<&Probe> {
        match &self.validation {
            Some(steps) => steps.iter().collect(),
            None => self
                .final_state_checks
                .iter()
                .chain(self.process_validation_checks.iter())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawChallenge {
    id: String,
    name: String,
    description: String,
    category: Option<String>,
    difficulty: Option<String>,
    score: Option<u32>,
    concepts: Option<Vec<String>>,
    setup: Option<Vec<SetupStep>>,
    user_action_simulation: Option<String>,
    validation: Option<Vec<Probe>>,
    final_state_checks: Option<Vec<Probe>>,
    process_validation_checks: Option<Vec<Probe>>,
    hints: Option<Vec<Hint>>,
    flag: Option<String>,
    objective_refs: Option<Vec<String>>,
    estimated_time_mins: Option<u32>,
    distro_compatibility: Option<Vec<String>>,
    solution_file: Option<String>,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn string_field(doc: &Value, key: &str) -> Option<bool> {
    doc.get(key).map(|v| v.is_string())
}

fn check_string_list(doc: &Value, key: &str, filename: &str, errors: &mut Vec<String>) {
    if let Some(value) = doc.get(key) {
        match value.as_sequence() {
            Some(items) => {
                if !items.iter().all(Value::is_string) {
                    errors.push(format!(
                        "'{filename}': All items in '{key}' must be strings."
                    ));
                }
            }
            None => errors.push(format!("'{filename}': '{key}' must be a list of strings.")),
        }
    }
}

fn check_steps<T, F>(
    doc: &Value,
    key: &str,
    filename: &str,
    allow_empty: bool,
    extra: F,
    errors: &mut Vec<String>,
) where
    T: serde::de::DeserializeOwned,
    F: Fn(&T) -> Vec<String>,
{
    let Some(value) = doc.get(key) else {
        return;
    };
    let Some(items) = value.as_sequence() else {
        errors.push(format!("'{filename}': '{key}' field must be a list."));
        return;
    };
    if items.is_empty() && !allow_empty {
        errors.push(format!("'{filename}': '{key}' list cannot be empty."));
        return;
    }

    for (i, item) in items.iter().enumerate() {
        let label = format!("'{filename}' {key} step {}", i + 1);
        if !item.is_mapping() {
            errors.push(format!("{label}: Must be a mapping."));
            continue;
        }
        if item.get("type").and_then(Value::as_str).is_none() {
            errors.push(format!("{label}: Missing or non-string 'type' key."));
            continue;
        }
        match serde_yaml::from_value::<T>(item.clone()) {
            Ok(step) => {
                for problem in extra(&step) {
                    errors.push(format!("{label}: {problem}"));
                }
            }
            Err(e) => errors.push(format!("{label}: {e}")),
        }
    }
}

/// Structural validation of one parsed document. Empty result means the
/// document conforms; otherwise every problem found is reported.
pub fn validate_document(doc: &Value, filename: &str) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(mapping) = doc.as_mapping() else {
        return vec![format!(
            "'{filename}': Content is not a mapping (root object)."
        )];
    };

    for key in mapping.keys() {
        match key.as_str() {
            Some(key_str) => {
                if !ALLOWED_KEYS.contains(&key_str) {
                    errors.push(format!("'{filename}': Unknown top-level key: '{key_str}'"));
                }
            }
            None => errors.push(format!("'{filename}': Non-string top-level key.")),
        }
    }

    for key in ["id", "name", "description"] {
        match string_field(doc, key) {
            None => errors.push(format!("'{filename}': Missing required key: '{key}'")),
            Some(false) => errors.push(format!("'{filename}': '{key}' must be a string.")),
            Some(true) => {}
        }
    }

    if let Some(id) = doc.get("id").and_then(Value::as_str) {
        if !valid_id(id) {
            errors.push(format!(
                "'{filename}': 'id' field '{id}' contains invalid characters. \
                 Use only letters, numbers, hyphens, underscores, periods."
            ));
        }
    }

    for key in [
        "category",
        "difficulty",
        "user_action_simulation",
        "flag",
        "solution_file",
    ] {
        if string_field(doc, key) == Some(false) {
            errors.push(format!("'{filename}': '{key}' must be a string."));
        }
    }

    check_string_list(doc, "concepts", filename, &mut errors);
    check_string_list(doc, "objective_refs", filename, &mut errors);
    check_string_list(doc, "distro_compatibility", filename, &mut errors);

    if let Some(score) = doc.get("score") {
        match score.as_u64() {
            Some(_) => {}
            None => errors.push(format!(
                "'{filename}': 'score' must be a non-negative integer."
            )),
        }
    }

    if let Some(mins) = doc.get("estimated_time_mins") {
        match mins.as_u64() {
            Some(0) | None => errors.push(format!(
                "'{filename}': 'estimated_time_mins' must be a positive integer."
            )),
            Some(_) => {}
        }
    }

    if let Some(hints) = doc.get("hints") {
        match hints.as_sequence() {
            Some(items) => {
                for (i, hint) in items.iter().enumerate() {
                    let label = format!("'{filename}' Hint {}", i + 1);
                    if !hint.is_mapping() {
                        errors.push(format!("{label}: Must be a mapping."));
                        continue;
                    }
                    match hint.get("text") {
                        None => errors.push(format!("{label}: Missing 'text'.")),
                        Some(text) if !text.is_string() => {
                            errors.push(format!("{label}: 'text' must be a string."))
                        }
                        _ => {}
                    }
                    if let Some(cost) = hint.get("cost") {
                        if cost.as_u64().is_none() {
                            errors.push(format!(
                                "{label}: 'cost' must be a non-negative integer."
                            ));
                        }
                    }
                }
            }
            None => errors.push(format!("'{filename}': 'hints' field must be a list.")),
        }
    }

    // Validation structure: the single key or the split keys, never both.
    let has_validation = doc.get("validation").is_some();
    let has_final = doc.get("final_state_checks").is_some();
    let has_process = doc.get("process_validation_checks").is_some();

    if has_validation && (has_final || has_process) {
        errors.push(format!(
            "'{filename}': Cannot use 'validation' together with 'final_state_checks' or \
             'process_validation_checks'. Use one structure or the other."
        ));
    } else if !has_validation && !has_final {
        if has_process {
            errors.push(format!(
                "'{filename}': If using 'process_validation_checks', 'final_state_checks' \
                 is also required (or use the single 'validation' key)."
            ));
        } else {
            errors.push(format!(
                "'{filename}': Missing validation steps. Provide a 'validation' list OR a \
                 'final_state_checks' list."
            ));
        }
    }

    let probe_extra = |probe: &Probe| probe.validate();
    let setup_extra = |_step: &SetupStep| Vec::new();

    if has_validation {
        check_steps::<Probe, _>(doc, "validation", filename, false, probe_extra, &mut errors);
    } else {
        check_steps::<Probe, _>(
            doc,
            "final_state_checks",
            filename,
            false,
            probe_extra,
            &mut errors,
        );
        check_steps::<Probe, _>(
            doc,
            "process_validation_checks",
            filename,
            true,
            probe_extra,
            &mut errors,
        );
    }
    check_steps::<SetupStep, _>(doc, "setup", filename, true, setup_extra, &mut errors);

    errors
}

fn finish(raw: RawChallenge, default_score: u32) -> Challenge {
    Challenge {
        id: raw.id,
        name: raw.name,
        description: raw.description,
        category: raw.category,
        difficulty: raw.difficulty,
        score: raw.score.unwrap_or(default_score),
        concepts: raw.concepts.unwrap_or_default(),
        setup: raw.setup.unwrap_or_default(),
        user_action_simulation: raw.user_action_simulation,
        validation: raw.validation,
        final_state_checks: raw.final_state_checks.unwrap_or_default(),
        process_validation_checks: raw.process_validation_checks.unwrap_or_default(),
        hints: raw.hints.unwrap_or_default(),
        flag: raw.flag,
        objective_refs: raw.objective_refs.unwrap_or_default(),
        estimated_time_mins: raw.estimated_time_mins,
        distro_compatibility: raw
            .distro_compatibility
            .unwrap_or_else(|| vec!["Any".to_string()]),
        solution_file: raw.solution_file,
    }
}

/// Load every `*.yaml`/`*.yml` in a directory. Invalid files are skipped
/// with per-file diagnostics; duplicate ids overwrite with a warning.
pub fn load_challenges_from_dir(
    challenges_dir: &Path,
    default_score: u32,
) -> Result<BTreeMap<String, Challenge>, LabError> {
    if !challenges_dir.is_dir() {
        return Err(LabError::ChallengeLoad {
            message: format!(
                "Challenges directory not found: '{}'",
                challenges_dir.display()
            ),
        });
    }

    let mut yaml_files: Vec<std::path::PathBuf> = std::fs::read_dir(challenges_dir)
        .map_err(LabError::Io)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    yaml_files.sort();

    let mut challenges = BTreeMap::new();
    let mut loaded = 0usize;
    let mut skipped = 0usize;

    for path in &yaml_files {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %filename, "Could not read challenge file: {e}");
                skipped += 1;
                continue;
            }
        };

        let doc: Value = match serde_yaml::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(file = %filename, "Error parsing YAML: {e}");
                skipped += 1;
                continue;
            }
        };

        let problems = validate_document(&doc, &filename);
        if !problems.is_empty() {
            for problem in &problems {
                warn!(file = %filename, "{problem}");
            }
            skipped += 1;
            continue;
        }

        let raw: RawChallenge = match serde_yaml::from_value(doc) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(file = %filename, "Error deserializing challenge: {e}");
                skipped += 1;
                continue;
            }
        };
        let challenge = finish(raw, default_score);

        if challenges.contains_key(&challenge.id) {
            warn!(
                file = %filename,
                id = %challenge.id,
                "Duplicate challenge ID; overwriting previous definition"
            );
        }
        challenges.insert(challenge.id.clone(), challenge);
        loaded += 1;
    }

    info!(loaded, skipped, dir = %challenges_dir.display(), "Challenge load complete");
    Ok(challenges)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_DOC: &str = r#"
id: lvm-volume-01
name: Create an LVM data volume
description: |
  Create a 100 MB logical volume `data_lv` in `storage_vg` and mount it.
category: Storage
difficulty: Intermediate
score: 100
concepts: [lvm, filesystems]
setup:
  - type: run_command
    command: "sudo truncate -s 200M /tmp/lvm-disk.img"
  - type: ensure_package_installed
    package: lvm2
user_action_simulation: "sudo pvcreate /dev/sdx && sudo vgcreate storage_vg /dev/sdx"
final_state_checks:
  - type: check_lvm_state
    check_type: vg_exists
    vg_name: storage_vg
  - type: check_lvm_state
    check_type: lv_size
    vg_name: storage_vg
    lv_name: data_lv
    min_size_mb: 95
    max_size_mb: 105
process_validation_checks:
  - type: check_history
    command_pattern: 'lvcreate'
    expected_count: '>0'
hints:
  - text: "pvcreate comes first."
    cost: 10
  - text: "lvcreate -L 100M -n data_lv storage_vg"
    cost: 25
flag: "FLAG{lvm-done}"
"#;

    fn parse(doc: &str) -> Value {
        serde_yaml::from_str(doc).unwrap()
    }

    #[test]
    fn accepted_documents_validate_clean() {
        let doc = parse(GOOD_DOC);
        assert_eq!(validate_document(&doc, "good.yaml"), Vec::<String>::new());
    }

    #[test]
    fn loader_round_trip_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.yaml"), GOOD_DOC).unwrap();
        std::fs::write(
            dir.path().join("minimal.yml"),
            "id: min-01\nname: Minimal\ndescription: d\nvalidation:\n  - type: run_command\n    command: 'true'\n",
        )
        .unwrap();

        let challenges = load_challenges_from_dir(dir.path(), 100).unwrap();
        assert_eq!(challenges.len(), 2);

        let min = &challenges["min-01"];
        assert_eq!(min.score, 100);
        assert_eq!(min.distro_compatibility, vec!["Any"]);
        assert!(min.hints.is_empty());
        assert_eq!(min.probes().len(), 1);

        let lvm = &challenges["lvm-volume-01"];
        assert_eq!(lvm.hints.len(), 2);
        assert_eq!(lvm.hints[0].cost, 10);
        // Split keys: final-state first, then process checks.
        assert_eq!(lvm.probes().len(), 3);
        assert_eq!(lvm.probes()[2].type_name(), "check_history");
    }

    #[test]
    fn rejected_documents_yield_reasons_and_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.yaml"), GOOD_DOC).unwrap();
        std::fs::write(
            dir.path().join("broken.yaml"),
            "id: 'bad id!'\nname: n\ndescription: d\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notmap.yaml"), "- just\n- a\n- list\n").unwrap();

        let challenges = load_challenges_from_dir(dir.path(), 100).unwrap();
        assert_eq!(challenges.len(), 1);
        assert!(challenges.contains_key("lvm-volume-01"));
    }

    #[test]
    fn missing_required_keys_are_reported() {
        let doc = parse("name: n\ndescription: d\nvalidation:\n  - type: run_command\n    command: x\n");
        let errors = validate_document(&doc, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("Missing required key: 'id'")));
    }

    #[test]
    fn id_character_set_is_enforced() {
        let doc = parse(
            "id: 'has spaces'\nname: n\ndescription: d\nvalidation:\n  - type: run_command\n    command: x\n",
        );
        let errors = validate_document(&doc, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("invalid characters")));
    }

    #[test]
    fn validation_key_exclusivity() {
        let both = parse(
            "id: a\nname: n\ndescription: d\nvalidation:\n  - type: run_command\n    command: x\nfinal_state_checks:\n  - type: run_command\n    command: x\n",
        );
        let errors = validate_document(&both, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("Cannot use 'validation'")));

        let neither = parse("id: a\nname: n\ndescription: d\n");
        let errors = validate_document(&neither, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("Missing validation steps")));

        let process_only = parse(
            "id: a\nname: n\ndescription: d\nprocess_validation_checks:\n  - type: run_command\n    command: x\n",
        );
        let errors = validate_document(&process_only, "f.yaml");
        assert!(errors
            .iter()
            .any(|e| e.contains("'final_state_checks' is also required")));
    }

    #[test]
    fn empty_validation_list_is_rejected() {
        let doc = parse("id: a\nname: n\ndescription: d\nvalidation: []\n");
        let errors = validate_document(&doc, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("cannot be empty")));
    }

    #[test]
    fn negative_score_and_bad_hints_are_rejected() {
        let doc = parse(
            "id: a\nname: n\ndescription: d\nscore: -5\nvalidation:\n  - type: run_command\n    command: x\n",
        );
        let errors = validate_document(&doc, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("'score' must be a non-negative integer")));

        let doc = parse(
            "id: a\nname: n\ndescription: d\nhints:\n  - cost: 5\nvalidation:\n  - type: run_command\n    command: x\n",
        );
        let errors = validate_document(&doc, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("Missing 'text'")));

        let doc = parse(
            "id: a\nname: n\ndescription: d\nhints:\n  - text: t\n    cost: -1\nvalidation:\n  - type: run_command\n    command: x\n",
        );
        let errors = validate_document(&doc, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("'cost' must be a non-negative integer")));
    }

    #[test]
    fn unknown_top_level_key_is_reported() {
        let doc = parse(
            "id: a\nname: n\ndescription: d\ntitle: legacy\nvalidation:\n  - type: run_command\n    command: x\n",
        );
        let errors = validate_document(&doc, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("Unknown top-level key: 'title'")));
    }

    #[test]
    fn malformed_probes_are_reported_with_step_labels() {
        let doc = parse(
            "id: a\nname: n\ndescription: d\nvalidation:\n  - type: check_port_listening\n    port: 70000\n    expected_state: true\n  - type: bogus_probe\n",
        );
        let errors = validate_document(&doc, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("validation step 1") && e.contains("out of range")));
        assert!(errors.iter().any(|e| e.contains("validation step 2")));
    }

    #[test]
    fn setup_steps_are_validated() {
        let doc = parse(
            "id: a\nname: n\ndescription: d\nsetup:\n  - type: ensure_package_installed\n    manager_type: brew\n    package: nginx\nvalidation:\n  - type: run_command\n    command: x\n",
        );
        let errors = validate_document(&doc, "f.yaml");
        assert!(errors.iter().any(|e| e.contains("setup step 1")));
    }

    #[test]
    fn missing_directory_is_a_load_error() {
        let err = load_challenges_from_dir(Path::new("/no/such/dir"), 100).unwrap_err();
        assert!(matches!(err, LabError::ChallengeLoad { .. }));
    }

    #[test]
    fn duplicate_ids_overwrite_in_filename_order() {
        let dir = tempfile::tempdir().unwrap();
        let doc = |name: &str| {
            format!(
                "id: dup-01\nname: {name}\ndescription: d\nvalidation:\n  - type: run_command\n    command: 'true'\n"
            )
        };
        std::fs::write(dir.path().join("a.yaml"), doc("first")).unwrap();
        std::fs::write(dir.path().join("b.yaml"), doc("second")).unwrap();

        let challenges = load_challenges_from_dir(dir.path(), 100).unwrap();
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges["dup-01"].name, "second");
    }
}
