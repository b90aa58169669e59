use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::tempdir;

fn write_config(root: &Path, vault: &Path) -> PathBuf {
    let path = root.join("taskgate.yaml");
    fs::write(
        &path,
        format!(
            "vault_path: {}\nexecution:\n  auto_execute_simple: true\nscheduler:\n  max_parallel_tasks: 2\n",
            vault.display()
        ),
    )
    .expect("write config");
    path
}

fn run(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_taskgate"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("TASKGATE_CONFIG")
        .output()
        .expect("run taskgate")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn assert_ok(output: &Output) {
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        stdout(output),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn setup() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let dir = tempdir().expect("tempdir");
    let vault = dir.path().join("vault");
    fs::create_dir_all(&vault).expect("create vault");
    let config = write_config(dir.path(), &vault);
    (dir, vault, config)
}

#[test]
fn help_lists_every_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_taskgate"))
        .arg("--help")
        .output()
        .expect("run taskgate");
    assert_ok(&output);
    let text = stdout(&output);
    for command in ["run", "once", "classify", "status", "purge", "scan", "stop"] {
        assert!(text.contains(&format!("  {command}")), "missing {command}");
    }
}

#[test]
fn unknown_command_fails() {
    let (_dir, _vault, config) = setup();
    let output = run(&config, &["launch"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown command `launch`"));
}

#[test]
fn classify_reports_gate_results_without_executing() {
    let (_dir, vault, config) = setup();
    assert_ok(&run(&config, &["status"]));
    let task = vault.join("Needs_Action/TASK-cli.md");
    fs::write(
        &task,
        "---\ntype: notes\nsteps:\n  - id: s1\n    op: create_folder\n    path: Cli/out\n---\nFrom the command line.\n",
    )
    .expect("write task");

    let output = run(&config, &["classify", task.to_str().expect("utf8 path")]);
    assert_ok(&output);
    let text = stdout(&output);
    assert!(text.contains("classification=simple"), "{text}");
    assert!(text.contains("disposition=auto_eligible"), "{text}");
    assert!(text.contains("gate.gate_1_step_count=pass"), "{text}");
    assert!(!vault.join("Cli/out").exists());
}

#[test]
fn once_executes_eligible_tasks_and_status_counts_them() {
    let (_dir, vault, config) = setup();
    assert_ok(&run(&config, &["status"]));
    fs::write(
        vault.join("Needs_Action/TASK-once.md"),
        "---\ntype: notes\nsteps:\n  - id: s1\n    op: create_file\n    path: Once/result.md\n    content: done\n---\nOne pass.\n",
    )
    .expect("write task");

    let output = run(&config, &["once"]);
    assert_ok(&output);
    let text = stdout(&output);
    assert!(text.contains("dispatched=1"), "{text}");
    assert!(text.contains("task=TASK-once.md status=done"), "{text}");
    assert_eq!(
        fs::read_to_string(vault.join("Once/result.md")).expect("result"),
        "done"
    );

    let status = run(&config, &["status"]);
    assert_ok(&status);
    let text = stdout(&status);
    assert!(text.contains("tasks.done=1"), "{text}");
    assert!(text.contains("snapshots=1"), "{text}");
}

#[test]
fn scan_masks_credentials_found_in_task_folders() {
    let (_dir, vault, config) = setup();
    assert_ok(&run(&config, &["status"]));
    fs::write(
        vault.join("Needs_Action/TASK-leak.md"),
        "---\ntype: notes\nsteps:\n  - id: s1\n    op: create_folder\n    path: Leak\n---\npassword = hunter2hunter2\n",
    )
    .expect("write task");

    let output = run(&config, &["scan"]);
    assert_ok(&output);
    let text = stdout(&output);
    assert!(!text.contains("findings=0"), "{text}");
    assert!(!text.contains("hunter2hunter2"), "{text}");
}

#[test]
fn stop_writes_the_signal_file_and_purge_reports_counts() {
    let (_dir, _vault, config) = setup();
    let output = run(&config, &["stop"]);
    assert_ok(&output);
    assert!(stdout(&output).contains("stop requested"));

    let status = run(&config, &["status"]);
    assert_ok(&status);
    assert!(stdout(&status).contains("stop_requested=true"));

    let purge = run(&config, &["purge"]);
    assert_ok(&purge);
    let text = stdout(&purge);
    assert!(text.contains("retention_days=7"), "{text}");
    assert!(text.contains("snapshots_purged=0"), "{text}");
}
