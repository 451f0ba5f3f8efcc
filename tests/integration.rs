use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn analyzer_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("code-analyzer");
    path
}

/// Prints one JSON object describing the call it received.
const TOOL_SCRIPT: &str = r#"#!/bin/sh
n=$(wc -c | tr -d ' ')
printf '{"task":"%s","unit":"%s","bytes":%s}\n' "$CODE_ANALYZER_TASK" "$CODE_ANALYZER_UNIT" "$n"
"#;

fn sample_250() -> String {
    "let value = compute(input);\n"
        .repeat(10)
        .chars()
        .take(250)
        .collect()
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files/src");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(files_dir.join("a.py"), "def a():\n    return 1\n").unwrap();
    fs::write(files_dir.join("b.rs"), sample_250()).unwrap();
    fs::write(root.join("tool.sh"), TOOL_SCRIPT).unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[input]
root = "{root}/files"

[chunking]
chunk_size = 100
chunk_overlap = 20

[pipeline]
backoff_base_ms = 0

[cache]
path = "{root}/data/cache.sqlite"

[output]
dir = "{root}/out"

[backends.tool]
type = "command"
tasks = ["static", "analysis", "summary"]
command = ["sh", "{root}/tool.sh"]
"#,
        root = root.display()
    );
    let config_path = config_dir.join("analyzer.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_analyzer(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = analyzer_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run code-analyzer binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_cache() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_analyzer(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Cache initialized"));
    assert!(tmp.path().join("data/cache.sqlite").exists());

    let (_, stderr, success) = run_analyzer(&config, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[cfg(unix)]
#[test]
fn test_run_writes_reports_then_hits_cache() {
    let (tmp, config) = setup_test_env();

    let (stdout, stderr, success) = run_analyzer(&config, &["run"]);
    assert!(success, "run failed: {}", stderr);
    assert!(stdout.contains("succeeded: 2"), "stdout: {}", stdout);

    let report_path = tmp.path().join("out/src/b.rs.json");
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["path"], "src/b.rs");
    assert_eq!(report["chunk_count"], 3);
    assert_eq!(report["status"], "complete");
    let kinds: Vec<&str> = report["sections"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["static", "analysis", "summary"]);
    let analysis = &report["sections"][1]["entries"];
    assert_eq!(analysis[0]["unit"]["start"], 0);
    assert_eq!(analysis[1]["unit"]["start"], 80);
    assert_eq!(analysis[2]["unit"]["end"], 250);
    assert_eq!(analysis[2]["payload"]["bytes"], 90);

    let (stdout, stderr, success) = run_analyzer(&config, &["run"]);
    assert!(success, "rerun failed: {}", stderr);
    assert!(stdout.contains("cached: 2"), "stdout: {}", stdout);
    assert!(stdout.contains("backend calls: 0"), "stdout: {}", stdout);
}

#[cfg(unix)]
#[test]
fn test_no_cache_forces_reanalysis() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_analyzer(&config, &["run"]);
    assert!(success, "run failed: {}", stderr);

    let (stdout, stderr, success) = run_analyzer(&config, &["run", "--no-cache"]);
    assert!(success, "run --no-cache failed: {}", stderr);
    assert!(stdout.contains("cached: 0"), "stdout: {}", stdout);
    assert!(stdout.contains("succeeded: 2"), "stdout: {}", stdout);
}

#[cfg(unix)]
#[test]
fn test_markdown_reports() {
    let (tmp, config) = setup_test_env();
    let config_text = fs::read_to_string(&config)
        .unwrap()
        .replace("[output]\n", "[output]\nformat = \"markdown\"\n");
    fs::write(&config, config_text).unwrap();

    let (_, stderr, success) = run_analyzer(&config, &["run"]);
    assert!(success, "run failed: {}", stderr);
    let md = fs::read_to_string(tmp.path().join("out/src/b.rs.md")).unwrap();
    assert!(md.starts_with("# src/b.rs"));
    assert!(md.contains("## Analysis"));
    assert!(md.contains("### Chunk 2 [160..250)"));
}

#[cfg(unix)]
#[test]
fn test_all_files_failing_exits_nonzero() {
    let (tmp, config) = setup_test_env();
    fs::write(tmp.path().join("tool.sh"), "#!/bin/sh\nexit 3\n").unwrap();

    let (stdout, stderr, success) = run_analyzer(&config, &["run"]);
    assert!(!success, "expected failure, stdout: {}", stdout);
    assert!(stdout.contains("failed: 2"), "stdout: {}", stdout);
    assert!(stderr.contains("all 2 files failed"), "stderr: {}", stderr);
}

#[cfg(unix)]
#[test]
fn test_cache_stats_and_clear() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_analyzer(&config, &["run"]);
    assert!(success, "run failed: {}", stderr);

    let (stdout, _, success) = run_analyzer(&config, &["cache", "stats"]);
    assert!(success);
    assert!(stdout.contains("Records:     2"), "stdout: {}", stdout);

    let (stdout, _, success) = run_analyzer(&config, &["cache", "clear"]);
    assert!(success);
    assert!(stdout.contains("removed: 2 records"));

    let (stdout, _, _) = run_analyzer(&config, &["run"]);
    assert!(stdout.contains("cached: 0"), "stdout: {}", stdout);
}

#[test]
fn test_chunks_dry_run() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("files/src/b.rs");
    let (stdout, stderr, success) = run_analyzer(&config, &["chunks", file.to_str().unwrap()]);
    assert!(success, "chunks failed: {}", stderr);
    assert!(stdout.contains("chunks: 3"));
    assert!(stdout.contains("[0..100)"));
    assert!(stdout.contains("[80..180)"));
    assert!(stdout.contains("[160..250)"));
}

#[test]
fn test_invalid_overlap_is_a_configuration_error() {
    let (_tmp, config) = setup_test_env();
    let config_text = fs::read_to_string(&config)
        .unwrap()
        .replace("chunk_size = 100\nchunk_overlap = 20", "chunk_size = 50\nchunk_overlap = 50");
    fs::write(&config, config_text).unwrap();

    let (_, stderr, success) = run_analyzer(&config, &["run"]);
    assert!(!success);
    assert!(stderr.contains("configuration error"), "stderr: {}", stderr);
}
