//! # Subtitle Fixer (subfix)
//!
//! A CLI tool that applies text corrections to SRT subtitle files.
//!
//! ## Overview
//!
//! `subfix` reads two line-oriented rule files and applies them, in order, to
//! a single subtitle file:
//!
//! - **Corrections** (`corrections.txt`): positional fixes produced by a
//!   reviewing tool, one per line, shaped `[label] cue:original:replacement`
//!   with an optional trailing ` - annotation`.
//! - **Known words** (`known_words.txt`): unconditional substitutions shaped
//!   `original > replacement`, case-insensitive unless marked `[case]`.
//!
//! ## Algorithm Flow
//!
//! ```text
//! Read target → Backup → Corrections pass → Known-words pass → Write
//!                              ↓                    ↓
//!                   For each directive:     For each rule:
//!                     - find cue block        - replace everywhere
//!                     - replace in body       - verify line count
//!                     - else whole file       - abort on mismatch
//! ```
//!
//! All edits happen on an in-memory copy. The target file is only written
//! once, after every pass has succeeded.
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success (unresolved corrections are reported, not fatal) |
//! | 1 | General error (rule files missing, permission denied, I/O error) |
//! | 2 | Invalid command-line arguments |
//! | 3 | Dry-run mode: changes would be made |
//! | 4 | Parse error (invalid UTF-8 or binary input) |
//! | 5 | Integrity violation: a known-word rule changed the line count |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use clap::ValueEnum;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use regex::{NoExpand, RegexBuilder};
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (missing inputs, permission denied, I/O error)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments
    pub const INVALID_ARGS: i32 = 2;
    /// Dry-run mode: changes would be made
    pub const WOULD_CHANGE: i32 = 3;
    /// Parse error (invalid UTF-8 or binary file detected)
    pub const PARSE_ERROR: i32 = 4;
    /// A global replacement broke the cue structure; run aborted
    pub const INTEGRITY: i32 = 5;
}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

#[derive(Debug)]
struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// Neither rule file exists, so there is nothing to apply.
#[derive(Debug)]
struct InputMissing {
    corrections: PathBuf,
    known_words: PathBuf,
}

impl fmt::Display for InputMissing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "No correction sources found (looked for {} and {})",
            self.corrections.display(),
            self.known_words.display()
        )
    }
}

impl std::error::Error for InputMissing {}

/// A known-word rule changed the number of lines in the document.
#[derive(Debug)]
struct IntegrityViolation {
    rule: String,
    line_no: usize,
    before: usize,
    after: usize,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Known-word rule on line {} ({}) changed the line count ({} line breaks before, {} after)",
            self.line_no, self.rule, self.before, self.after
        )
    }
}

impl std::error::Error for IntegrityViolation {}

#[derive(Debug)]
struct RunOutcome {
    dry_run: bool,
    would_change: bool,
}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else if error_chain_has::<ParseError>(err) {
        exit_codes::PARSE_ERROR
    } else if error_chain_has::<IntegrityViolation>(err) {
        exit_codes::INTEGRITY
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Auto-detect color support
    Auto,
    /// Always emit colors (even when not a TTY)
    Always,
    /// Never emit colors
    Never,
}

/// Subtitle Fixer: applies positional corrections and known-word rules to SRT files
#[derive(Parser, Debug)]
#[command(
    name = "subfix",
    version,
    about,
    long_about = None,
    after_help = "EXIT CODES:\n  0  Success\n  1  General error (rule files missing, permission denied, I/O error)\n  2  Invalid command-line arguments\n  3  Dry-run mode: changes would be made\n  4  Parse error (invalid UTF-8 or binary input)\n  5  Integrity violation: run aborted, subtitle file left untouched\n"
)]
struct Args {
    /// Subtitle file to correct in place
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Corrections file (default: <rules-dir>/corrections.txt)
    #[arg(short = 'c', long, value_name = "FILE")]
    corrections: Option<PathBuf>,

    /// Known-words file (default: <rules-dir>/known_words.txt)
    #[arg(short = 'k', long = "known-words", value_name = "FILE")]
    known_words: Option<PathBuf>,

    /// Directory holding the rule files and the backup (default: the subtitle's directory)
    #[arg(long = "rules-dir", value_name = "DIR")]
    rules_dir: Option<PathBuf>,

    /// Path to config file (default: search for .subfixrc)
    #[arg(long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config")]
    no_config: bool,

    /// Ignore cue numbers and match every correction against the whole file
    #[arg(short = 'W', long = "whole-file")]
    whole_file: bool,

    /// Verbose output showing each correction
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorMode,

    /// Show unified diff of the changes
    #[arg(short = 'd', long)]
    diff: bool,

    /// Preview changes without modifying files (exit 0=no changes, 3=would change)
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Extension appended to the backup copy
    #[arg(long, default_value = ".bak")]
    backup_ext: String,

    /// Output the run report as JSON for programmatic processing
    #[arg(long, conflicts_with_all = ["verbose", "diff"])]
    json: bool,

    /// Subcommand (config management)
    #[command(subcommand)]
    command: Option<Commands>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config management actions
#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Initialize a new .subfixrc config file
    Init {
        /// Create in home directory instead of current
        #[arg(long)]
        global: bool,
    },
    /// Show effective configuration (merged file + CLI)
    Show,
    /// Show path to active config file
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and Console
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_CORRECTIONS: &str = "corrections.txt";
const DEFAULT_KNOWN_WORDS: &str = "known_words.txt";
const DEFAULT_BACKUP_EXT: &str = ".bak";

/// Runtime configuration derived from CLI args and the config file
#[derive(Debug)]
struct Config {
    rules_dir: PathBuf,
    corrections: PathBuf,
    known_words: PathBuf,
    cue_targeting: bool,
    color: ColorMode,
    verbose: bool,
    diff: bool,
    dry_run: bool,
    backup_ext: String,
    json: bool,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        let rules_dir = args
            .rules_dir
            .clone()
            .unwrap_or_else(|| default_rules_dir(args.input.as_deref()));

        Self {
            corrections: args
                .corrections
                .clone()
                .unwrap_or_else(|| rules_dir.join(DEFAULT_CORRECTIONS)),
            known_words: args
                .known_words
                .clone()
                .unwrap_or_else(|| rules_dir.join(DEFAULT_KNOWN_WORDS)),
            rules_dir,
            cue_targeting: !args.whole_file,
            color: args.color,
            verbose: args.verbose,
            diff: args.diff,
            dry_run: args.dry_run,
            backup_ext: args.backup_ext.clone(),
            json: args.json,
        }
    }
}

/// Rule files live next to the subtitle unless told otherwise
fn default_rules_dir(input: Option<&Path>) -> PathBuf {
    input
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: impl fmt::Display) -> String {
        self.wrap("bold cyan", text)
    }

    fn cue(&self, text: impl fmt::Display) -> String {
        self.wrap("yellow", text)
    }

    fn success(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn failure(&self, text: impl fmt::Display) -> String {
        self.wrap("bold red", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn bold(&self, text: impl fmt::Display) -> String {
        self.wrap("bold", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

/// Escape console markup in user-supplied text.
///
/// Subtitle lines and labels routinely contain `[...]`, which the console
/// would otherwise read as style tags.
fn escape_markup(text: &str) -> String {
    text.replace('[', "\\[")
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    match color {
        ColorMode::Never => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Always => {
            let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
            let console = Console::builder()
                .force_terminal(true)
                .color_system(system)
                .build();
            (console, VerboseStyle::new(true))
        }
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                return (Console::new(), VerboseStyle::new(false));
            }

            if std::env::var("FORCE_COLOR").is_ok() {
                let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
                let console = Console::builder()
                    .force_terminal(true)
                    .color_system(system)
                    .build();
                return (console, VerboseStyle::new(true));
            }

            let console = Console::new();
            let use_color = console.is_color_enabled();
            (console, VerboseStyle::new(use_color))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File Support
// ─────────────────────────────────────────────────────────────────────────────

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".subfixrc", ".subfixrc.toml", "subfixrc.toml"];

/// Configuration loaded from a .subfixrc file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// Directory holding rule files and backups (relative to the config file)
    rules_dir: Option<PathBuf>,
    /// Corrections file name (relative to rules_dir)
    corrections: Option<PathBuf>,
    /// Known-words file name (relative to rules_dir)
    known_words: Option<PathBuf>,
    /// Disable cue targeting
    whole_file: Option<bool>,
    /// Show verbose output
    verbose: Option<bool>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Output as JSON
    json: Option<bool>,
    /// Backup file extension
    backup_ext: Option<String>,
}

/// Search for a config file starting from the given directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    // Search up the directory tree
    loop {
        for filename in CONFIG_FILENAMES {
            let config_path = current.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(home) = dirs::home_dir() {
        for filename in CONFIG_FILENAMES {
            let config_path = home.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }
    }

    None
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Directory the config search starts from
fn config_search_start(args: &Args) -> PathBuf {
    args.input
        .as_deref()
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);

    if args.no_config {
        return Ok(config);
    }

    let config_path = if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        Some(path.clone())
    } else {
        find_config_file(&config_search_start(args))
    };

    let Some(path) = config_path else {
        return Ok(config);
    };
    let file_config = load_config_file(&path)?;

    if args.rules_dir.is_none() {
        if let Some(dir) = file_config.rules_dir {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.rules_dir = base.join(dir);
        }
    }

    // Rule file paths follow rules_dir unless given on the command line
    if args.corrections.is_none() {
        let name = file_config
            .corrections
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CORRECTIONS));
        config.corrections = config.rules_dir.join(name);
    }

    if args.known_words.is_none() {
        let name = file_config
            .known_words
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KNOWN_WORDS));
        config.known_words = config.rules_dir.join(name);
    }

    if !args.whole_file {
        if let Some(w) = file_config.whole_file {
            config.cue_targeting = !w;
        }
    }

    if !args.verbose && !args.json {
        if let Some(v) = file_config.verbose {
            config.verbose = v;
        }
    }

    if args.color == ColorMode::Auto {
        if let Some(c) = file_config.color {
            config.color = c;
        }
    }

    if !args.json && !args.verbose && !args.diff {
        if let Some(j) = file_config.json {
            config.json = j;
        }
    }

    if args.backup_ext == DEFAULT_BACKUP_EXT {
        if let Some(ext) = file_config.backup_ext {
            config.backup_ext = ext;
        }
    }

    // An empty extension would put the backup on top of the subtitle
    if config.backup_ext.is_empty() {
        return Err(ArgError(format!("Empty backup_ext in {}", path.display())).into());
    }

    Ok(config)
}

/// Default config file content
const DEFAULT_CONFIG: &str = r#"# .subfixrc - subfix configuration file

# Directory holding the rule files and the backup copy.
# Relative paths are resolved against this file's directory.
# rules_dir = "subs"

# Rule file names, relative to rules_dir
corrections = "corrections.txt"
known_words = "known_words.txt"

# Ignore cue numbers and match corrections against the whole file
# whole_file = false

# Output options
# verbose = false
# color = "auto"
# json = false

# Extension appended to the backup copy
# backup_ext = ".bak"
"#;

/// Handle the config subcommand
fn run_config_command(action: &ConfigAction, args: &Args) -> Result<()> {
    match action {
        ConfigAction::Init { global } => {
            let path = if *global {
                dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
                    .join(".subfixrc")
            } else {
                PathBuf::from(".subfixrc")
            };

            if path.exists() {
                return Err(anyhow::anyhow!(
                    "Config file already exists: {}",
                    path.display()
                ));
            }

            fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to create config file: {}", path.display()))?;

            eprintln!("Created config file: {}", path.display());
            Ok(())
        }

        ConfigAction::Show => {
            let config = create_config(args)?;

            eprintln!("Effective configuration:");
            eprintln!("  rules_dir: {}", config.rules_dir.display());
            eprintln!("  corrections: {}", config.corrections.display());
            eprintln!("  known_words: {}", config.known_words.display());
            eprintln!("  whole_file: {}", !config.cue_targeting);
            eprintln!("  verbose: {}", config.verbose);
            eprintln!("  color: {:?}", config.color);
            eprintln!("  json: {}", config.json);
            eprintln!("  backup_ext: {}", config.backup_ext);

            let config_path = if args.no_config {
                None
            } else {
                args.config_file
                    .clone()
                    .or_else(|| find_config_file(&config_search_start(args)))
            };
            if let Some(path) = config_path {
                eprintln!();
                eprintln!("Config file: {}", path.display());
            }

            Ok(())
        }

        ConfigAction::Path => {
            let start_dir = std::env::current_dir().unwrap_or_default();
            if let Some(path) = find_config_file(&start_dir) {
                println!("{}", path.display());
                Ok(())
            } else {
                eprintln!("No config file found");
                std::process::exit(1);
            }
        }
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.input.is_none() {
        return Err(ArgError("A subtitle file is required".to_string()).into());
    }

    if args.backup_ext.is_empty() {
        return Err(ArgError("--backup-ext must not be empty".to_string()).into());
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Subtitle Document
// ─────────────────────────────────────────────────────────────────────────────

const BOM: char = '\u{feff}';

/// Terminator that followed a line in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineEnding {
    Lf,
    CrLf,
    /// Last line of a file without a final newline
    None,
}

impl LineEnding {
    fn as_str(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
            Self::None => "",
        }
    }
}

/// The subtitle file as an ordered list of lines.
///
/// Each line keeps its own terminator, so files mixing `\n` and `\r\n`
/// (or missing a final newline) render back byte for byte, and an edit to
/// one line leaves every other line as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SubtitleDocument {
    lines: Vec<String>,
    endings: Vec<LineEnding>,
}

impl SubtitleDocument {
    fn parse(text: &str) -> Self {
        let mut lines = Vec::new();
        let mut endings = Vec::new();

        for piece in text.split_inclusive('\n') {
            let (line, ending) = if let Some(line) = piece.strip_suffix("\r\n") {
                (line, LineEnding::CrLf)
            } else if let Some(line) = piece.strip_suffix('\n') {
                (line, LineEnding::Lf)
            } else {
                (piece, LineEnding::None)
            };
            lines.push(line.to_string());
            endings.push(ending);
        }

        Self { lines, endings }
    }

    fn render(&self) -> String {
        let mut output = String::new();
        for (line, ending) in self.lines.iter().zip(&self.endings) {
            output.push_str(line);
            output.push_str(ending.as_str());
        }
        output
    }

    fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Number of line breaks, including the one after the last line
    fn line_break_count(&self) -> usize {
        self.endings
            .iter()
            .filter(|ending| **ending != LineEnding::None)
            .count()
    }
}

/// The cue number on a line that consists only of digits, if any.
fn cue_token(line: &str) -> Option<&str> {
    let token = line.trim_start_matches(BOM).trim();
    if is_cue_number(token) {
        Some(token)
    } else {
        None
    }
}

fn is_cue_number(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

// ─────────────────────────────────────────────────────────────────────────────
// Correction Directives
// ─────────────────────────────────────────────────────────────────────────────

/// Marker emitted by the reviewing tool when it has nothing to suggest
const PLACEHOLDER: &str = "-";
const COMMENT_PREFIX: char = '#';
const FIELD_SEPARATOR: char = ':';
const ANNOTATION_SEPARATOR: &str = " - ";

/// One positional correction read from the corrections file
#[derive(Debug, Clone, PartialEq, Eq)]
struct CorrectionDirective {
    /// Cue number as written; not required to be numeric
    cue: String,
    original: String,
    replacement: String,
    annotation: Option<String>,
    /// Bracketed prefix, verbatim; empty when the line had none
    label: String,
    /// 1-based line in the corrections file
    line_no: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DirectiveError {
    /// Fewer than two `:` separators
    MissingFields,
    /// A field was blank after trimming
    EmptyField(&'static str),
}

impl fmt::Display for DirectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFields => write!(f, "expected cue:original:replacement"),
            Self::EmptyField(field) => write!(f, "empty {} field", field),
        }
    }
}

impl std::error::Error for DirectiveError {}

/// Split a leading `[label]` off a line
fn split_label(line: &str) -> (&str, &str) {
    if let Some(rest) = line.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return (&rest[..end], rest[end + 1..].trim());
        }
    }
    ("", line)
}

/// Parse one line of the corrections file.
///
/// Returns `Ok(None)` for blank lines, comments, and "no suggestion"
/// placeholders. Everything between the first and the last `:` belongs to
/// the original text, so colons inside dialogue survive.
fn parse_directive(
    line: &str,
    line_no: usize,
) -> Result<Option<CorrectionDirective>, DirectiveError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(COMMENT_PREFIX) || trimmed == PLACEHOLDER {
        return Ok(None);
    }

    let (label, payload) = split_label(trimmed);
    if payload.is_empty() || payload == PLACEHOLDER {
        return Ok(None);
    }

    let fields: Vec<&str> = payload.split(FIELD_SEPARATOR).collect();
    if fields.len() < 3 {
        return Err(DirectiveError::MissingFields);
    }

    let cue = fields[0].trim();
    let last = fields[fields.len() - 1];
    let original = fields[1..fields.len() - 1].join(":");

    // The annotation lives inside the last colon field, so an annotation
    // containing a colon splits early and its head lands in the original.
    let (replacement, annotation) = match last.rsplit_once(ANNOTATION_SEPARATOR) {
        Some((replacement, note)) => {
            let note = note.trim();
            (replacement, (!note.is_empty()).then(|| note.to_string()))
        }
        None => (last, None),
    };

    let original = original.trim();
    let replacement = replacement.trim();

    if cue.is_empty() {
        return Err(DirectiveError::EmptyField("cue"));
    }
    if original.is_empty() {
        return Err(DirectiveError::EmptyField("original"));
    }
    if replacement.is_empty() {
        return Err(DirectiveError::EmptyField("replacement"));
    }

    Ok(Some(CorrectionDirective {
        cue: cue.to_string(),
        original: original.to_string(),
        replacement: replacement.to_string(),
        annotation,
        label: label.to_string(),
        line_no,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Cue-Scoped Replacement
// ─────────────────────────────────────────────────────────────────────────────

/// Why a directive was matched against the whole file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FallbackReason {
    /// `--whole-file` was given
    CueTargetingDisabled,
    /// The cue field is not a number
    NonNumericCue,
    /// No block carries the cue number
    CueMissing,
    /// The block exists but none of its lines contain the text
    TextNotInCue,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::CueTargetingDisabled => "cue targeting disabled",
            Self::NonNumericCue => "cue is not a number",
            Self::CueMissing => "cue not found",
            Self::TextNotInCue => "text not in cue",
        };
        f.write_str(text)
    }
}

/// Result of applying one directive; line numbers are 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Cue { line_no: usize },
    Fallback { line_no: usize, reason: FallbackReason },
    NotFound { reason: FallbackReason },
}

enum CueSearch {
    Found(usize),
    TextNotInCue,
    CueMissing,
}

/// Find the first body line of the first block numbered `cue` that
/// contains `needle`.
fn locate_in_cue(lines: &[String], cue: &str, needle: &str) -> CueSearch {
    let mut in_target = false;

    for (idx, line) in lines.iter().enumerate() {
        if let Some(token) = cue_token(line) {
            if in_target {
                break;
            }
            in_target = token == cue;
            continue;
        }

        if in_target && line.contains(needle) {
            return CueSearch::Found(idx);
        }
    }

    if in_target {
        CueSearch::TextNotInCue
    } else {
        CueSearch::CueMissing
    }
}

/// Replace the first occurrence of `original` on the first line that has it.
///
/// Returns the 1-based line number that was changed.
fn replace_first_in_document(
    doc: &mut SubtitleDocument,
    original: &str,
    replacement: &str,
) -> Option<usize> {
    let idx = doc.lines.iter().position(|line| line.contains(original))?;
    doc.lines[idx] = doc.lines[idx].replacen(original, replacement, 1);
    Some(idx + 1)
}

fn apply_directive(
    doc: &mut SubtitleDocument,
    directive: &CorrectionDirective,
    cue_targeting: bool,
) -> Outcome {
    let reason = if !cue_targeting {
        FallbackReason::CueTargetingDisabled
    } else if !is_cue_number(&directive.cue) {
        FallbackReason::NonNumericCue
    } else {
        match locate_in_cue(&doc.lines, &directive.cue, &directive.original) {
            CueSearch::Found(idx) => {
                doc.lines[idx] =
                    doc.lines[idx].replacen(&directive.original, &directive.replacement, 1);
                return Outcome::Cue { line_no: idx + 1 };
            }
            CueSearch::TextNotInCue => FallbackReason::TextNotInCue,
            CueSearch::CueMissing => FallbackReason::CueMissing,
        }
    };

    match replace_first_in_document(doc, &directive.original, &directive.replacement) {
        Some(line_no) => Outcome::Fallback { line_no, reason },
        None => Outcome::NotFound { reason },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Known-Word Rules
// ─────────────────────────────────────────────────────────────────────────────

const RULE_SEPARATOR: char = '>';
const CASE_MARKER: &str = "[case]";

/// An unconditional substitution from the known-words file
#[derive(Debug, Clone, PartialEq, Eq)]
struct KnownWordRule {
    original: String,
    replacement: String,
    case_sensitive: bool,
    line_no: usize,
}

impl fmt::Display for KnownWordRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' > '{}'", self.original, self.replacement)?;
        if self.case_sensitive {
            write!(f, " {}", CASE_MARKER)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RuleError {
    MissingSeparator,
    EmptyOriginal,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSeparator => write!(f, "expected 'original > replacement'"),
            Self::EmptyOriginal => write!(f, "empty original text"),
        }
    }
}

impl std::error::Error for RuleError {}

/// Strip a trailing `[case]` marker, in any letter case
fn strip_case_marker(line: &str) -> (&str, bool) {
    let split = line.len().saturating_sub(CASE_MARKER.len());
    match (line.get(..split), line.get(split..)) {
        (Some(head), Some(tail)) if tail.eq_ignore_ascii_case(CASE_MARKER) => {
            (head.trim_end(), true)
        }
        _ => (line, false),
    }
}

/// Split at the first `>` not preceded by a backslash
fn split_unescaped(text: &str, separator: char) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == separator {
            return Some((&text[..idx], &text[idx + c.len_utf8()..]));
        }
    }
    None
}

/// Expand `\n`, `\t`, `\\` and `\>`; other escapes are kept as written.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('>') => out.push('>'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Parse one line of the known-words file.
///
/// Returns `Ok(None)` for blank lines and comments. An empty replacement is
/// allowed and deletes the matched text.
fn parse_rule(line: &str, line_no: usize) -> Result<Option<KnownWordRule>, RuleError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(COMMENT_PREFIX) {
        return Ok(None);
    }

    let (body, case_sensitive) = strip_case_marker(trimmed);
    let (original, replacement) =
        split_unescaped(body, RULE_SEPARATOR).ok_or(RuleError::MissingSeparator)?;

    let original = unescape(original.trim());
    if original.is_empty() {
        return Err(RuleError::EmptyOriginal);
    }

    Ok(Some(KnownWordRule {
        original,
        replacement: unescape(replacement.trim()),
        case_sensitive,
        line_no,
    }))
}

/// Replace every occurrence of the rule's text across the whole document.
///
/// Returns the number of occurrences replaced. Fails with
/// [`IntegrityViolation`] if the result has a different number of lines or
/// line breaks, in which case `doc` is left as it was.
fn apply_rule(doc: &mut SubtitleDocument, rule: &KnownWordRule) -> Result<usize> {
    let pattern = RegexBuilder::new(&regex::escape(&rule.original))
        .case_insensitive(!rule.case_sensitive)
        .build()
        .with_context(|| format!("Failed to compile known-word rule on line {}", rule.line_no))?;

    let text = doc.render();
    let count = pattern.find_iter(&text).count();
    if count == 0 {
        return Ok(0);
    }

    let replaced = pattern.replace_all(&text, NoExpand(&rule.replacement));
    let updated = SubtitleDocument::parse(&replaced);

    // A separator added or removed at end of file leaves the line count
    // alone but still changes the number of breaks.
    if updated.line_count() != doc.line_count()
        || updated.line_break_count() != doc.line_break_count()
    {
        return Err(IntegrityViolation {
            rule: rule.to_string(),
            line_no: rule.line_no,
            before: doc.line_break_count(),
            after: updated.line_break_count(),
        }
        .into());
    }

    *doc = updated;
    Ok(count)
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics and Reporting
// ─────────────────────────────────────────────────────────────────────────────

/// Which rule file an entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum FailureSource {
    Corrections,
    KnownWords,
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrections => f.write_str("corrections"),
            Self::KnownWords => f.write_str("known words"),
        }
    }
}

/// An entry that could not be applied, kept verbatim for the final report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Failure {
    source: FailureSource,
    line_no: usize,
    entry: String,
    reason: String,
}

/// Statistics collected during a run
#[derive(Debug, Default, Clone)]
struct Stats {
    /// Valid directives read from the corrections file
    directives: usize,
    /// Directives applied inside their cue
    applied_in_cue: usize,
    /// Directives applied by whole-file search
    applied_fallback: usize,
    /// Directives whose text was nowhere in the file
    not_found: usize,
    /// Valid rules read from the known-words file
    rules: usize,
    /// Rules that matched at least once
    rules_applied: usize,
    /// Total occurrences replaced by known-word rules
    replacements: usize,
    /// Lines in either rule file that failed to parse
    parse_failures: usize,
    /// Lines in the subtitle file
    total_lines: usize,
    /// Processing elapsed time
    elapsed: Duration,
}

impl Stats {
    fn corrections_applied(&self) -> usize {
        self.applied_in_cue + self.applied_fallback
    }

    fn rules_unmatched(&self) -> usize {
        self.rules.saturating_sub(self.rules_applied)
    }
}

/// Accumulated result of the correction passes
#[derive(Debug, Default)]
struct RunReport {
    stats: Stats,
    failures: Vec<Failure>,
}

impl RunReport {
    fn record_failure(
        &mut self,
        source: FailureSource,
        line_no: usize,
        entry: &str,
        reason: impl fmt::Display,
    ) {
        self.failures.push(Failure {
            source,
            line_no,
            entry: entry.trim().to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Print a statistics summary through the console
fn print_stats_summary(report: &RunReport, console: &Console, styles: &VerboseStyle) {
    let stats = &report.stats;

    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    console.print(&format!(
        "  {} {} read, {} in cue, {} by whole-file search, {} not found",
        styles.stat_label("Corrections:"),
        stats.directives,
        stats.applied_in_cue,
        stats.applied_fallback,
        stats.not_found
    ));

    console.print(&format!(
        "  {} {} read, {} applied ({} replacements), {} unmatched",
        styles.stat_label("Known words:"),
        stats.rules,
        stats.rules_applied,
        stats.replacements,
        stats.rules_unmatched()
    ));

    if stats.parse_failures > 0 {
        console.print(&format!(
            "  {} {} unparsable line(s)",
            styles.stat_label("Rule files:"),
            stats.parse_failures
        ));
    }

    let elapsed_ms = stats.elapsed.as_secs_f64() * 1000.0;
    console.print(&format!(
        "  {} {:.2}ms ({} lines)",
        styles.stat_label("Time:"),
        elapsed_ms,
        stats.total_lines
    ));

    if !report.failures.is_empty() {
        console.print(&format!(
            "  {} {}",
            styles.failure("Errors:"),
            report.failures.len()
        ));
        for failure in &report.failures {
            console.print(&styles.dim(format!(
                "    {}:{}: {} ({})",
                failure.source,
                failure.line_no,
                escape_markup(&failure.entry),
                escape_markup(&failure.reason)
            )));
        }
    }

    console.print("");
}

/// Plain summary on stderr for non-verbose runs
fn print_plain_summary(report: &RunReport) {
    let stats = &report.stats;
    eprintln!(
        "Applied {} of {} correction(s) and {} of {} known-word rule(s)",
        stats.corrections_applied(),
        stats.directives,
        stats.rules_applied,
        stats.rules
    );

    if !report.failures.is_empty() {
        eprintln!("Could not apply {} entries:", report.failures.len());
        for failure in &report.failures {
            eprintln!(
                "  {}:{}: {} ({})",
                failure.source, failure.line_no, failure.entry, failure.reason
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Output Structures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutput {
    version: &'static str,
    status: String,
    file: String,
    changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup: Option<String>,
    corrections: CorrectionStats,
    known_words: KnownWordStats,
    failures: Vec<Failure>,
}

#[derive(Serialize)]
struct CorrectionStats {
    total: usize,
    in_cue: usize,
    whole_file: usize,
    not_found: usize,
}

#[derive(Serialize)]
struct KnownWordStats {
    total: usize,
    applied: usize,
    replacements: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Correction Passes
// ─────────────────────────────────────────────────────────────────────────────

/// Contents of whichever rule files exist
#[derive(Debug, Default)]
struct RuleSources {
    corrections: Option<String>,
    known_words: Option<String>,
}

/// Read both rule files; fails only if neither exists
fn load_rule_sources(config: &Config) -> Result<RuleSources> {
    let read_optional = |path: &Path| -> Result<Option<String>> {
        if !path.is_file() {
            return Ok(None);
        }
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        decode_text(bytes, &path.display().to_string()).map(Some)
    };

    let sources = RuleSources {
        corrections: read_optional(&config.corrections)?,
        known_words: read_optional(&config.known_words)?,
    };

    if sources.corrections.is_none() && sources.known_words.is_none() {
        return Err(InputMissing {
            corrections: config.corrections.clone(),
            known_words: config.known_words.clone(),
        }
        .into());
    }

    Ok(sources)
}

fn apply_corrections(
    doc: &mut SubtitleDocument,
    source: &str,
    config: &Config,
    report: &mut RunReport,
    console: &Console,
    styles: &VerboseStyle,
) {
    for (idx, line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let directive = match parse_directive(line, line_no) {
            Ok(Some(directive)) => directive,
            Ok(None) => continue,
            Err(err) => {
                if config.verbose {
                    console.print(&styles.failure(format!(
                        "  line {}: unparsable: {}",
                        line_no,
                        escape_markup(line.trim())
                    )));
                }
                report.stats.parse_failures += 1;
                report.record_failure(FailureSource::Corrections, line_no, line, err);
                continue;
            }
        };

        report.stats.directives += 1;
        let outcome = apply_directive(doc, &directive, config.cue_targeting);

        match outcome {
            Outcome::Cue { .. } => report.stats.applied_in_cue += 1,
            Outcome::Fallback { .. } => report.stats.applied_fallback += 1,
            Outcome::NotFound { reason } => {
                report.stats.not_found += 1;
                report.record_failure(
                    FailureSource::Corrections,
                    directive.line_no,
                    line,
                    format!("text not found ({})", reason),
                );
            }
        }

        if config.verbose {
            print_outcome(&directive, outcome, console, styles);
        }
    }
}

fn print_outcome(
    directive: &CorrectionDirective,
    outcome: Outcome,
    console: &Console,
    styles: &VerboseStyle,
) {
    let change = format!(
        "'{}' → '{}'",
        escape_markup(&directive.original),
        escape_markup(&directive.replacement)
    );
    let note = match (&directive.label, &directive.annotation) {
        (label, Some(note)) if !label.is_empty() => {
            format!(" ({}: {})", escape_markup(label), escape_markup(note))
        }
        (_, Some(note)) => format!(" ({})", escape_markup(note)),
        (label, None) if !label.is_empty() => format!(" ({})", escape_markup(label)),
        _ => String::new(),
    };

    let message = match outcome {
        Outcome::Cue { line_no } => styles.success(format!(
            "  cue {} line {}: {}{}",
            escape_markup(&directive.cue),
            line_no,
            change,
            note
        )),
        Outcome::Fallback { line_no, reason } => styles.cue(format!(
            "  cue {} ({}), line {}: {}{}",
            escape_markup(&directive.cue),
            reason,
            line_no,
            change,
            note
        )),
        Outcome::NotFound { reason } => styles.failure(format!(
            "  cue {} ({}): not found: {}{}",
            escape_markup(&directive.cue),
            reason,
            change,
            note
        )),
    };
    console.print(&message);
}

fn apply_known_words(
    doc: &mut SubtitleDocument,
    source: &str,
    config: &Config,
    report: &mut RunReport,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<()> {
    for (idx, line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let rule = match parse_rule(line, line_no) {
            Ok(Some(rule)) => rule,
            Ok(None) => continue,
            Err(err) => {
                if config.verbose {
                    console.print(&styles.failure(format!(
                        "  line {}: unparsable: {}",
                        line_no,
                        escape_markup(line.trim())
                    )));
                }
                report.stats.parse_failures += 1;
                report.record_failure(FailureSource::KnownWords, line_no, line, err);
                continue;
            }
        };

        report.stats.rules += 1;
        let count = apply_rule(doc, &rule)?;
        if count > 0 {
            report.stats.rules_applied += 1;
            report.stats.replacements += count;
        }

        if config.verbose {
            let message = format!("  {}: {} replacement(s)", escape_markup(&rule.to_string()), count);
            if count > 0 {
                console.print(&styles.success(message));
            } else {
                console.print(&styles.dim(message));
            }
        }
    }

    Ok(())
}

/// Run both passes over the working copy and return what happened.
///
/// Corrections go first, in file order, then known-word rules. Each entry
/// sees the document as left by the previous ones.
fn correct_document(
    doc: &mut SubtitleDocument,
    sources: &RuleSources,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunReport> {
    let start_time = Instant::now();
    let mut report = RunReport::default();
    report.stats.total_lines = doc.line_count();

    if let Some(ref corrections) = sources.corrections {
        if config.verbose {
            console.print(&styles.header("Corrections"));
        }
        apply_corrections(doc, corrections, config, &mut report, console, styles);
    }

    if let Some(ref known_words) = sources.known_words {
        if config.verbose {
            console.print(&styles.header("Known words"));
        }
        apply_known_words(doc, known_words, config, &mut report, console, styles)?;
    }

    report.stats.elapsed = start_time.elapsed();
    Ok(report)
}

// ─────────────────────────────────────────────────────────────────────────────
// Backup and File I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum file size (100 MB) - reject larger files to prevent memory issues
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Backup location: the subtitle's file name plus `ext`, inside `rules_dir`.
/// For example: "movie.srt" with extension ".bak" becomes "<rules_dir>/movie.srt.bak"
fn backup_path_for(target: &Path, rules_dir: &Path, ext: &str) -> PathBuf {
    let mut backup_name = target
        .file_name()
        .map(|name| name.to_owned())
        .unwrap_or_default();
    backup_name.push(ext);
    rules_dir.join(backup_name)
}

/// Copy the target to its backup location
fn create_backup(target: &Path, backup_path: &Path) -> Result<()> {
    fs::copy(target, backup_path)
        .with_context(|| format!("Failed to create backup at {}", backup_path.display()))?;
    Ok(())
}

/// Read the subtitle file as text
fn read_file(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read file metadata: {}", path.display()))?;

    if metadata.len() > MAX_FILE_SIZE {
        return Err(ParseError(format!(
            "File too large: {} ({} MB). Maximum supported size is {} MB.",
            path.display(),
            metadata.len() / (1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024)
        ))
        .into());
    }

    let bytes =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;

    decode_text(bytes, &path.display().to_string())
}

/// Convert raw bytes to text, checking for binary content and valid UTF-8
fn decode_text(bytes: Vec<u8>, source_label: &str) -> Result<String> {
    if bytes.contains(&0) {
        return Err(ParseError(format!("Input appears to be binary: {}", source_label)).into());
    }

    String::from_utf8(bytes).map_err(|err| {
        let utf8_err = err.utf8_error();
        let valid_up_to = utf8_err.valid_up_to();
        let byte = err.as_bytes().get(valid_up_to).copied();
        let detail = match byte {
            Some(b) => format!(
                "Invalid UTF-8 at byte position {} (byte value: 0x{:02X}) in {}",
                valid_up_to, b, source_label
            ),
            None => format!("Invalid UTF-8 in {}", source_label),
        };
        ParseError(detail).into()
    })
}

/// Snapshot of the subtitle file taken before any edit.
///
/// The edits run on a working copy; `commit` is the only place the target
/// is written. `rollback` puts the backup back if the target no longer
/// matches the snapshot.
struct Transaction {
    target: PathBuf,
    snapshot: String,
    backup: Option<PathBuf>,
}

impl Transaction {
    /// Read the target and, unless `dry_run`, write the backup
    fn begin(target: &Path, config: &Config) -> Result<Self> {
        let snapshot = read_file(target)?;

        let backup = if config.dry_run {
            None
        } else {
            let path = backup_path_for(target, &config.rules_dir, &config.backup_ext);
            create_backup(target, &path)?;
            Some(path)
        };

        Ok(Self {
            target: target.to_path_buf(),
            snapshot,
            backup,
        })
    }

    fn working_copy(&self) -> SubtitleDocument {
        SubtitleDocument::parse(&self.snapshot)
    }

    /// Write `content` over the target if it differs from the snapshot.
    /// Returns whether the file was written.
    fn commit(&self, content: &str) -> Result<bool> {
        if content == self.snapshot {
            return Ok(false);
        }
        fs::write(&self.target, content)
            .with_context(|| format!("Failed to write to file: {}", self.target.display()))?;
        Ok(true)
    }

    fn rollback(&self) -> Result<()> {
        let Some(ref backup) = self.backup else {
            return Ok(());
        };

        let current = fs::read(&self.target).with_context(|| {
            format!("Failed to read {} before restoring it", self.target.display())
        })?;
        if current != self.snapshot.as_bytes() {
            fs::copy(backup, &self.target).with_context(|| {
                format!(
                    "Failed to restore {} from {}",
                    self.target.display(),
                    backup.display()
                )
            })?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Some(Commands::Config { action }) = &args.command {
        let exit_code = match run_config_command(action, &args) {
            Ok(()) => exit_codes::SUCCESS,
            Err(err) => {
                eprintln!("Error: {:#}", err);
                exit_code_for_error(&err)
            }
        };
        std::process::exit(exit_code);
    }

    let exit_code = match run(args) {
        Ok(outcome) => {
            if outcome.dry_run && outcome.would_change {
                exit_codes::WOULD_CHANGE
            } else {
                exit_codes::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

/// Output a unified diff between the original and corrected text
fn output_diff(filename: &str, original: &str, corrected: &str, proposed: bool) -> Result<()> {
    if original == corrected {
        return Ok(());
    }

    let diff = TextDiff::from_lines(original, corrected);
    let mut stdout = io::stdout().lock();

    writeln!(stdout, "--- a/{}", filename)?;
    if proposed {
        writeln!(stdout, "+++ b/{} (proposed)", filename)?;
    } else {
        writeln!(stdout, "+++ b/{}", filename)?;
    }

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        writeln!(stdout, "{}", hunk.header())?;
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            let line = change.value();
            if line.ends_with('\n') {
                write!(stdout, "{}{}", sign, line)?;
            } else {
                writeln!(stdout, "{}{}", sign, line)?;
            }
        }
    }

    Ok(())
}

/// Output the run report as JSON
fn output_json(
    config: &Config,
    filename: &str,
    changed: bool,
    backup: Option<&Path>,
    report: &RunReport,
) -> Result<()> {
    let stats = &report.stats;
    let json_output = JsonOutput {
        version: "1.0",
        status: if config.dry_run {
            "dry_run".to_string()
        } else {
            "success".to_string()
        },
        file: filename.to_string(),
        changed,
        backup: backup.map(|p| p.display().to_string()),
        corrections: CorrectionStats {
            total: stats.directives,
            in_cue: stats.applied_in_cue,
            whole_file: stats.applied_fallback,
            not_found: stats.not_found,
        },
        known_words: KnownWordStats {
            total: stats.rules,
            applied: stats.rules_applied,
            replacements: stats.replacements,
        },
        failures: report.failures.clone(),
    };

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &json_output)?;
    writeln!(stdout)?;
    Ok(())
}

fn run(args: Args) -> Result<RunOutcome> {
    validate_args(&args)?;
    let input = args
        .input
        .clone()
        .ok_or_else(|| ArgError("A subtitle file is required".to_string()))?;

    let config = create_config(&args)?;
    let (console, styles) = build_console(config.color);

    // Rule files are checked before the backup so a missing-input run
    // leaves no trace.
    let sources = load_rule_sources(&config)?;
    let transaction = Transaction::begin(&input, &config)?;
    let filename = input.display().to_string();
    let mut doc = transaction.working_copy();

    if config.verbose {
        console.print(&styles.bold(format!(
            "Processing {} ({} lines)...",
            escape_markup(&filename),
            doc.line_count()
        )));
        if let Some(ref backup) = transaction.backup {
            console.print(&styles.dim(format!(
                "Created backup: {}",
                escape_markup(&backup.display().to_string())
            )));
        }
        if !config.cue_targeting {
            console.print(&styles.dim("Cue targeting disabled: matching against the whole file"));
        }
    }

    let report = match correct_document(&mut doc, &sources, &config, &console, &styles) {
        Ok(report) => report,
        Err(err) => {
            if error_chain_has::<IntegrityViolation>(&err) {
                transaction.rollback()?;
                let kept = match transaction.backup {
                    Some(ref backup) => format!("backup kept at {}", backup.display()),
                    None => "dry run".to_string(),
                };
                return Err(err.context(format!(
                    "Aborted; {} left unchanged ({})",
                    filename, kept
                )));
            }
            return Err(err);
        }
    };

    let corrected = doc.render();
    let would_change = corrected != transaction.snapshot;

    if config.diff {
        output_diff(&filename, &transaction.snapshot, &corrected, config.dry_run)?;
    }

    if !config.dry_run {
        transaction.commit(&corrected)?;
    }

    if config.json {
        output_json(
            &config,
            &filename,
            would_change,
            transaction.backup.as_deref(),
            &report,
        )?;
    } else if config.verbose {
        if config.dry_run {
            let message = if would_change {
                styles.cue(format!("Would modify: {}", escape_markup(&filename)))
            } else {
                styles.success(format!("No changes needed: {}", escape_markup(&filename)))
            };
            console.print(&message);
        }
        print_stats_summary(&report, &console, &styles);
    } else {
        print_plain_summary(&report);
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
