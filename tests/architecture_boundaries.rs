use std::fs;
use std::path::{Path, PathBuf};

/// Only the binary and the command line layer talk to the terminal
const ALLOWED_PRINTERS: &[&str] = &["src/main.rs", "src/cli/"];

const GLOBAL_STATE_MARKERS: &[&str] = &["static mut ", "lazy_static!", "OnceLock<", "OnceCell<", "thread_local!"];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

fn source_lines() -> Vec<(String, usize, String)> {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);

    let mut lines = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            lines.push((rel.clone(), idx + 1, line.trim().to_string()));
        }
    }
    lines
}

#[test]
fn components_hold_no_process_global_state() {
    let offenders: Vec<String> = source_lines()
        .into_iter()
        .filter(|(_, _, line)| !line.starts_with("//"))
        .filter(|(_, _, line)| GLOBAL_STATE_MARKERS.iter().any(|m| line.contains(m)))
        .map(|(rel, n, line)| format!("{rel}:{n}: {line}"))
        .collect();

    assert!(
        offenders.is_empty(),
        "global state detected, pass it through OrchestratorContext instead:\n{}",
        offenders.join("\n")
    );
}

#[test]
fn library_modules_log_instead_of_printing() {
    let offenders: Vec<String> = source_lines()
        .into_iter()
        .filter(|(rel, _, _)| !ALLOWED_PRINTERS.iter().any(|allowed| rel.starts_with(allowed)))
        .filter(|(_, _, line)| line.contains("println!(") || line.contains("print!("))
        .map(|(rel, n, line)| format!("{rel}:{n}: {line}"))
        .collect();

    assert!(
        offenders.is_empty(),
        "terminal output outside the command line layer:\n{}",
        offenders.join("\n")
    );
}
