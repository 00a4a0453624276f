//! Integration tests for the docflow CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper to create a docflow Command with a clean environment
fn docflow() -> Command {
    let mut cmd = cargo_bin_cmd!("docflow");
    cmd.env_remove("DOCFLOW_LOG")
        .env_remove("DOCFLOW_PER_MINUTE")
        .env_remove("DOCFLOW_MAX_CONCURRENCY")
        .env_remove("DOCFLOW_MAX_RETRIES");
    cmd
}

const DIAMOND: &str = r#"[
  {"id": "outline", "dependencies": []},
  {"id": "intro", "dependencies": ["outline"]},
  {"id": "body", "dependencies": ["outline"], "words": 1200},
  {"id": "summary", "dependencies": ["intro", "body"]}
]"#;

fn write_catalog(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

/// Fast retries so failing runs finish quickly.
fn write_fast_config(dir: &TempDir) {
    fs::write(
        dir.path().join("docflow.toml"),
        "[retry]\nmax_retries = 1\ninitial_delay_ms = 10\nmax_delay_ms = 20\njitter_ratio = 0.0\n",
    )
    .unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_docflow_help() {
        docflow()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("plan"))
            .stdout(predicate::str::contains("run"));
    }

    #[test]
    fn test_docflow_version() {
        docflow().arg("--version").assert().success();
    }

    #[test]
    fn test_invalid_ui_mode_rejected() {
        let dir = TempDir::new().unwrap();
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);
        docflow()
            .current_dir(dir.path())
            .args(["run", "--ui", "fancy"])
            .arg(&catalog)
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown ui mode"));
    }
}

// =============================================================================
// Plan
// =============================================================================

mod plan {
    use super::*;

    #[test]
    fn test_plan_prints_order_and_waves() {
        let dir = TempDir::new().unwrap();
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        docflow()
            .current_dir(dir.path())
            .arg("plan")
            .arg(&catalog)
            .arg("summary")
            .assert()
            .success()
            .stdout(predicate::str::contains("1. outline"))
            .stdout(predicate::str::contains("Wave 0: outline"))
            .stdout(predicate::str::contains("Wave 1: intro, body"))
            .stdout(predicate::str::contains("Wave 2: summary"));
    }

    #[test]
    fn test_plan_subset_excludes_unrelated_items() {
        let dir = TempDir::new().unwrap();
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        docflow()
            .current_dir(dir.path())
            .arg("plan")
            .arg(&catalog)
            .arg("intro")
            .assert()
            .success()
            .stdout(predicate::str::contains("Plan: 2 of 4"))
            .stdout(predicate::str::contains("summary").not());
    }

    #[test]
    fn test_plan_yaml_catalog() {
        let dir = TempDir::new().unwrap();
        let catalog = write_catalog(
            &dir,
            "catalog.yaml",
            "- id: a\n- id: b\n  dependencies: [a]\n",
        );

        docflow()
            .current_dir(dir.path())
            .arg("plan")
            .arg(&catalog)
            .assert()
            .success()
            .stdout(predicate::str::contains("Wave 1: b"));
    }

    #[test]
    fn test_plan_cycle_fails() {
        let dir = TempDir::new().unwrap();
        let catalog = write_catalog(
            &dir,
            "catalog.json",
            r#"[{"id": "a", "dependencies": ["b"]}, {"id": "b", "dependencies": ["a"]}]"#,
        );

        docflow()
            .current_dir(dir.path())
            .arg("plan")
            .arg(&catalog)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cycle detected"));
    }

    #[test]
    fn test_plan_unknown_id_lists_valid_ids() {
        let dir = TempDir::new().unwrap();
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        docflow()
            .current_dir(dir.path())
            .arg("plan")
            .arg(&catalog)
            .arg("conclusion")
            .assert()
            .failure()
            .stderr(predicate::str::contains("conclusion"))
            .stderr(predicate::str::contains("outline"));
    }

    #[test]
    fn test_plan_lenient_reports_skipped_dependency() {
        let dir = TempDir::new().unwrap();
        let catalog = write_catalog(
            &dir,
            "catalog.json",
            r#"[{"id": "a", "dependencies": ["ghost"]}]"#,
        );
        fs::write(
            dir.path().join("docflow.toml"),
            "[executor]\nstrict_dependencies = false\n",
        )
        .unwrap();

        docflow()
            .current_dir(dir.path())
            .arg("plan")
            .arg(&catalog)
            .assert()
            .success()
            .stdout(predicate::str::contains("a -> ghost"));
    }
}

// =============================================================================
// Run
// =============================================================================

mod run {
    use super::*;

    #[test]
    fn test_run_success_minimal_ui() {
        let dir = TempDir::new().unwrap();
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        docflow()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal", "--delay-ms", "10"])
            .arg(&catalog)
            .assert()
            .success()
            .stdout(predicate::str::contains("Done: complete (4/4)"))
            .stdout(predicate::str::contains("4/4 completed"));
    }

    #[test]
    fn test_run_failure_exits_nonzero_and_lists_cascade() {
        let dir = TempDir::new().unwrap();
        write_fast_config(&dir);
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        docflow()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal", "--delay-ms", "10", "--fail", "body"])
            .arg(&catalog)
            .assert()
            .code(1)
            .stdout(predicate::str::contains("failed"))
            .stdout(predicate::str::contains("summary: Skipped"));
    }

    #[test]
    fn test_run_flaky_item_recovers() {
        let dir = TempDir::new().unwrap();
        write_fast_config(&dir);
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        docflow()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal", "--delay-ms", "5", "--flaky", "intro"])
            .arg(&catalog)
            .assert()
            .success()
            .stdout(predicate::str::contains("1 retry"));
    }

    #[test]
    fn test_run_json_report() {
        let dir = TempDir::new().unwrap();
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        let output = docflow()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal", "--delay-ms", "5", "--report"])
            .arg(&catalog)
            .arg("intro")
            .output()
            .unwrap();
        assert!(output.status.success());

        let stdout = String::from_utf8(output.stdout).unwrap();
        let start = stdout.find("{\n").expect("report JSON in output");
        let report: serde_json::Value = serde_json::from_str(&stdout[start..]).unwrap();
        assert_eq!(report["state"], "completed");
        assert_eq!(report["success"], true);
        assert_eq!(report["summary"]["total_items"], 2);
    }

    #[test]
    fn test_run_daily_quota_exhaustion_fails_run() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("docflow.toml"),
            "[limits]\nper_day = 1\nsafety_margin = 1.0\n",
        )
        .unwrap();
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        docflow()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal", "--delay-ms", "5"])
            .arg(&catalog)
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Daily quota exhausted"));
    }

    #[test]
    fn test_run_rejects_nan_jitter() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("docflow.toml"), "[retry]\njitter_ratio = nan\n").unwrap();
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        docflow()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal", "--delay-ms", "5"])
            .arg(&catalog)
            .assert()
            .failure()
            .stderr(predicate::str::contains("retry.jitter_ratio"));
    }

    #[test]
    fn test_run_with_zero_batch_window_completes() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("docflow.toml"),
            "[notifications]\nbatch_window_ms = 0\n",
        )
        .unwrap();
        let catalog = write_catalog(&dir, "catalog.json", DIAMOND);

        docflow()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal", "--delay-ms", "5"])
            .arg(&catalog)
            .assert()
            .success()
            .stdout(predicate::str::contains("4/4 completed"));
    }
}

// =============================================================================
// Config
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_then_show() {
        let dir = TempDir::new().unwrap();

        docflow()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(dir.path().join("docflow.toml").exists());

        docflow()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("per_minute = 50"))
            .stdout(predicate::str::contains("max_concurrency = 4"));
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("docflow.toml"), "").unwrap();

        docflow()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("docflow.toml"), "[limits]\nper_minute = 20\n").unwrap();

        docflow()
            .current_dir(dir.path())
            .env("DOCFLOW_PER_MINUTE", "7")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("per_minute = 7"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("docflow.toml"),
            "[executor]\nmax_concurrency = 0\n",
        )
        .unwrap();

        docflow()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("max_concurrency = 0"));
    }

    #[test]
    fn test_bad_env_value_names_key() {
        let dir = TempDir::new().unwrap();

        docflow()
            .current_dir(dir.path())
            .env("DOCFLOW_MAX_CONCURRENCY", "lots")
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("DOCFLOW_MAX_CONCURRENCY"));
    }
}
