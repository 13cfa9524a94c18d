//! E2E Integration tests for subfix
//!
//! Run with: cargo test --test integration
//! Verbose:  TEST_VERBOSE=1 cargo test --test integration -- --nocapture

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Test logging macro - prints when TEST_VERBOSE is set
macro_rules! test_log {
    ($level:expr, $($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            eprintln!("[{}] [integration:{}] {}",
                $level,
                line!(),
                format!($($arg)*)
            );
        }
    };
}

fn get_binary_path() -> PathBuf {
    if let Ok(bin_path) = std::env::var("CARGO_BIN_EXE_subfix") {
        let path = PathBuf::from(bin_path);
        if path.exists() {
            return path;
        }
    }

    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let release_path = PathBuf::from(manifest_dir).join("target/release/subfix");
    let debug_path = PathBuf::from(manifest_dir).join("target/debug/subfix");

    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        let custom_release = PathBuf::from(&target_dir).join("release/subfix");
        let custom_debug = PathBuf::from(&target_dir).join("debug/subfix");
        if custom_release.exists() {
            return custom_release;
        }
        if custom_debug.exists() {
            return custom_debug;
        }
    }

    if release_path.exists() {
        release_path
    } else if debug_path.exists() {
        debug_path
    } else {
        panic!(
            "subfix binary not found. Run 'cargo build' or 'cargo build --release' first.\n\
             Looked in:\n  - {}\n  - {}",
            release_path.display(),
            debug_path.display()
        );
    }
}

/// Run subfix with `--no-config --color never` so the user's own config
/// cannot leak into the test.
fn run_subfix(args: &[&str]) -> (String, String, i32) {
    test_log!("RUN", "subfix with args: {:?}", args);

    let binary = get_binary_path();
    let output = Command::new(&binary)
        .arg("--no-config")
        .args(["--color", "never"])
        .args(args)
        .output()
        .expect("Failed to run subfix");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    test_log!("OUTPUT", "Exit code: {}", code);
    if !stderr.is_empty() {
        test_log!("STDERR", "{}", stderr);
    }

    (stdout, stderr, code)
}

const MOVIE: &str = "1
00:00:01,000 --> 00:00:02,500
Teh cat sat down.

2
00:00:03,000 --> 00:00:04,500
Where is teh dog?

3
00:00:05,000 --> 00:00:06,500
Time: ten o'clock.

5
00:00:07,000 --> 00:00:08,500
I like too eat cake.
";

/// A scratch directory holding `movie.srt` and optional rule files
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(subtitles: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("movie.srt"), subtitles).unwrap();
        Self { dir }
    }

    fn with_corrections(self, content: &str) -> Self {
        fs::write(self.path().join("corrections.txt"), content).unwrap();
        self
    }

    fn with_known_words(self, content: &str) -> Self {
        fs::write(self.path().join("known_words.txt"), content).unwrap();
        self
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn target(&self) -> PathBuf {
        self.path().join("movie.srt")
    }

    fn target_arg(&self) -> String {
        self.target().to_str().unwrap().to_string()
    }

    fn contents(&self) -> String {
        fs::read_to_string(self.target()).unwrap()
    }

    fn backup(&self) -> PathBuf {
        self.path().join("movie.srt.bak")
    }
}

// ============================================================================
// Corrections Tests
// ============================================================================

#[test]
fn test_e2e_cue_scoped_correction() {
    test_log!("START", "Correction applied within its cue");

    let ws = Workspace::new(MOVIE).with_corrections("[note] 5:too eat:to eat - grammar\n");
    let (_stdout, stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0, "Should exit successfully");
    let expected = MOVIE.replace("I like too eat cake.", "I like to eat cake.");
    assert_eq!(ws.contents(), expected);
    assert!(stderr.contains("Applied 1 of 1 correction(s)"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_verbose_reports_cue() {
    test_log!("START", "Verbose output names the cue and line");

    let ws = Workspace::new(MOVIE).with_corrections("[note] 5:too eat:to eat - grammar\n");
    let (stdout, stderr, code) = run_subfix(&["-v", &ws.target_arg()]);

    assert_eq!(code, 0);
    let output = format!("{}{}", stdout, stderr);
    assert!(output.contains("cue 5 line 15"), "output was: {}", output);
    assert!(output.contains("Summary"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_embedded_colon_in_original() {
    test_log!("START", "Original text containing a colon");

    let ws = Workspace::new(MOVIE).with_corrections("[x] 3:Time: ten o'clock:Ten o'clock\n");
    let (_stdout, _stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0);
    assert!(ws.contents().contains("\nTen o'clock.\n"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_wrong_cue_falls_back_to_whole_file() {
    test_log!("START", "Drifted cue number falls back to whole-file search");

    let ws = Workspace::new(MOVIE).with_corrections("2:too eat:to eat\n42:cat sat:cat sits\n");
    let (_stdout, _stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0);
    let contents = ws.contents();
    assert!(contents.contains("I like to eat cake."));
    assert!(contents.contains("Teh cat sits down."));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_whole_file_flag() {
    test_log!("START", "--whole-file ignores cue numbers");

    let subtitles = "1\nsee you\n\n2\nsee you\n";
    let ws = Workspace::new(subtitles).with_corrections("2:see you:See you\n");

    let (_stdout, _stderr, code) = run_subfix(&["--whole-file", &ws.target_arg()]);
    assert_eq!(code, 0);
    assert_eq!(ws.contents(), "1\nSee you\n\n2\nsee you\n");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_unresolved_corrections_are_reported() {
    test_log!("START", "Unresolved corrections do not fail the run");

    let ws = Workspace::new(MOVIE).with_corrections(
        "# generated\n-\n1:pineapple:mango\nnot a directive\n5:too eat:to eat\n",
    );
    let (_stdout, stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0, "Unresolved entries are not fatal");
    assert!(ws.contents().contains("I like to eat cake."));
    assert!(stderr.contains("Could not apply 2 entries"));
    assert!(stderr.contains("1:pineapple:mango"));
    assert!(stderr.contains("not a directive"));

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Known-Word Tests
// ============================================================================

#[test]
fn test_e2e_known_words_case_insensitive() {
    test_log!("START", "Known-word rule without [case]");

    let ws = Workspace::new(MOVIE).with_known_words("teh > the\n");
    let (_stdout, _stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0);
    let contents = ws.contents();
    assert!(contents.contains("the cat sat down."));
    assert!(contents.contains("Where is the dog?"));
    assert!(!contents.to_lowercase().contains("teh"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_known_words_case_sensitive() {
    test_log!("START", "Known-word rule with [case]");

    let ws = Workspace::new(MOVIE).with_known_words("teh > the [case]\n");
    let (_stdout, _stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0);
    let contents = ws.contents();
    assert!(contents.contains("Teh cat sat down."));
    assert!(contents.contains("Where is the dog?"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_corrections_run_before_known_words() {
    test_log!("START", "Known words see the corrected text");

    let ws = Workspace::new(MOVIE)
        .with_corrections("5:too eat:to eat\n")
        .with_known_words("to eat > to taste\n");
    let (_stdout, _stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0);
    assert!(ws.contents().contains("I like to taste cake."));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_integrity_violation_aborts() {
    test_log!("START", "Line-count change aborts and leaves the file untouched");

    let ws = Workspace::new(MOVIE)
        .with_corrections("5:too eat:to eat\n")
        .with_known_words("teh > the\nsat down. > sat\\ndown.\ncake > pie\n");
    let (_stdout, stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 5, "Should return 5 (INTEGRITY)");
    assert!(stderr.contains("changed the line count"));
    assert_eq!(ws.contents(), MOVIE, "Target must be left as it was");
    assert_eq!(fs::read_to_string(ws.backup()).unwrap(), MOVIE);

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Backup, Dry-Run and Output Tests
// ============================================================================

#[test]
fn test_e2e_backup_created_next_to_rules() {
    test_log!("START", "Backup lands in the rules directory");

    let ws = Workspace::new(MOVIE);
    let rules = ws.path().join("rules");
    fs::create_dir(&rules).unwrap();
    fs::write(rules.join("known_words.txt"), "teh > the\n").unwrap();

    let rules_arg = rules.to_str().unwrap();
    let (_stdout, _stderr, code) = run_subfix(&["--rules-dir", rules_arg, &ws.target_arg()]);

    assert_eq!(code, 0);
    assert_eq!(fs::read_to_string(rules.join("movie.srt.bak")).unwrap(), MOVIE);
    assert!(!ws.backup().exists());

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_missing_rule_files() {
    test_log!("START", "No rule files is a fatal error before any write");

    let ws = Workspace::new(MOVIE);
    let (_stdout, stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 1);
    assert!(stderr.contains("No correction sources found"));
    assert!(!ws.backup().exists(), "No backup for a run that never started");
    assert_eq!(ws.contents(), MOVIE);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_missing_input_argument() {
    test_log!("START", "Missing subtitle argument");

    let (_stdout, _stderr, code) = run_subfix(&[]);
    assert_eq!(code, 2);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_nonexistent_subtitle_file() {
    test_log!("START", "Subtitle file does not exist");

    let ws = Workspace::new(MOVIE).with_known_words("teh > the\n");
    let missing = ws.path().join("other.srt");
    let (_stdout, _stderr, code) = run_subfix(&[missing.to_str().unwrap()]);
    assert_ne!(code, 0);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_dry_run_would_change() {
    test_log!("START", "Dry-run leaves files untouched and exits 3");

    let ws = Workspace::new(MOVIE).with_known_words("teh > the\n");
    let (_stdout, _stderr, code) = run_subfix(&["-n", &ws.target_arg()]);

    assert_eq!(code, 3, "Should return 3 (WOULD_CHANGE)");
    assert_eq!(ws.contents(), MOVIE);
    assert!(!ws.backup().exists());

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_dry_run_no_changes() {
    test_log!("START", "Dry-run exits 0 when nothing matches");

    let ws = Workspace::new(MOVIE).with_known_words("zebra > horse\n");
    let (_stdout, _stderr, code) = run_subfix(&["-n", &ws.target_arg()]);
    assert_eq!(code, 0);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_diff_output() {
    test_log!("START", "--diff prints a unified diff");

    let ws = Workspace::new(MOVIE).with_corrections("5:too eat:to eat\n");
    let (stdout, _stderr, code) = run_subfix(&["-n", "-d", &ws.target_arg()]);

    assert_eq!(code, 3);
    assert!(stdout.contains("(proposed)"));
    assert!(stdout.contains("-I like too eat cake."));
    assert!(stdout.contains("+I like to eat cake."));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_json_report() {
    test_log!("START", "--json emits a parseable report");

    let ws = Workspace::new(MOVIE)
        .with_corrections("5:too eat:to eat\n9:missing text:x\n")
        .with_known_words("teh > the\n");
    let (stdout, _stderr, code) = run_subfix(&["--json", &ws.target_arg()]);

    assert_eq!(code, 0);
    let report: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(report["status"], "success");
    assert_eq!(report["changed"], true);
    assert_eq!(report["corrections"]["total"], 2);
    assert_eq!(report["corrections"]["in_cue"], 1);
    assert_eq!(report["corrections"]["not_found"], 1);
    assert_eq!(report["known_words"]["replacements"], 2);
    assert_eq!(report["failures"][0]["entry"], "9:missing text:x");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_crlf_preserved() {
    test_log!("START", "CRLF line endings survive a correction");

    let subtitles = "1\r\n00:00:01,000 --> 00:00:02,000\r\nteh end\r\n";
    let ws = Workspace::new(subtitles).with_known_words("teh > the\n");
    let (_stdout, _stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0);
    assert_eq!(
        ws.contents(),
        "1\r\n00:00:01,000 --> 00:00:02,000\r\nthe end\r\n"
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_binary_subtitle_rejected() {
    test_log!("START", "Binary input exits with parse error");

    let ws = Workspace::new("").with_known_words("teh > the\n");
    fs::write(ws.target(), b"1\n\x00\x00\n").unwrap();
    let (_stdout, _stderr, code) = run_subfix(&[&ws.target_arg()]);
    assert_eq!(code, 4);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_mixed_line_endings_preserved() {
    test_log!("START", "Each line keeps its own terminator");

    let subtitles = "1\r\n00:00:01,000 --> 00:00:02,000\r\nHello\r\n\r\n2\n00:00:03,000 --> 00:00:04,000\nteh dog\n";
    let ws = Workspace::new(subtitles)
        .with_corrections("1:Hello:Hi\n")
        .with_known_words("teh > the\n");
    let (_stdout, _stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0);
    assert_eq!(
        ws.contents(),
        "1\r\n00:00:01,000 --> 00:00:02,000\r\nHi\r\n\r\n2\n00:00:03,000 --> 00:00:04,000\nthe dog\n"
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_no_trailing_newline_preserved() {
    test_log!("START", "A file without a final newline is written back without one");

    let subtitles = "1\n00:00:01,000 --> 00:00:02,000\nteh end";
    let ws = Workspace::new(subtitles).with_known_words("teh > the\n");
    let (_stdout, _stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 0);
    assert_eq!(ws.contents(), "1\n00:00:01,000 --> 00:00:02,000\nthe end");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_newline_added_at_end_of_file_aborts() {
    test_log!("START", "A rule that appends a final newline counts as a line-count change");

    let subtitles = "1\n00:00:01,000 --> 00:00:02,000\nthe end";
    let ws = Workspace::new(subtitles).with_known_words("end > end\\n\n");
    let (_stdout, stderr, code) = run_subfix(&[&ws.target_arg()]);

    assert_eq!(code, 5, "Should return 5 (INTEGRITY)");
    assert!(stderr.contains("changed the line count"));
    assert_eq!(ws.contents(), subtitles);

    test_log!("END", "Test PASSED");
}
