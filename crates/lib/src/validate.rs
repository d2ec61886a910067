//! Request validation: an ordered rule pipeline deciding whether a request may run.
//!
//! Rules, first failure wins:
//! 1. command allowlist (base name, case-folded, executable suffix stripped, exact match);
//! 2. working-directory allowlist (literal prefixes, or `*` patterns matched against the
//!    whole path; a trailing `/**` also admits everything below a match);
//! 3. banned keywords (substring scan of the joined command line);
//! 4. per-argument `..` and restricted-path checks;
//! 5. optional per-command argument shape from `command_rules`.
//!
//! Rule 3 is a heuristic blacklist and is bypassable by construction: unrelated tokens that
//! embed a keyword are rejected, and the same destructive operation spelled differently is
//! not. It only backs up the allowlists; `command_rules` is the allow-only way to pin down
//! what a command may be asked to do.
//!
//! Only the command's base name is checked and the command is run as given, so
//! `/any/dir/go` passes wherever `go` is allowed. Pin binaries by directory on the host
//! (PATH) rather than relying on this check.
//!
//! The validator does no I/O. Invalid path patterns are logged once, at construction.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};

use crate::config::{CommandRule, Config};
use crate::gateway::RunRequest;

const EXECUTABLE_SUFFIXES: &[&str] = &[".exe", ".cmd", ".bat", ".com"];

#[cfg(windows)]
const RESTRICTED_DIRS: &[&str] = &[
    "C:\\Windows",
    "C:\\Program Files",
    "C:\\Program Files (x86)",
    "C:\\ProgramData",
    "C:\\System",
];

#[cfg(not(windows))]
const RESTRICTED_DIRS: &[&str] = &[
    "/etc", "/boot", "/bin", "/sbin", "/usr", "/lib", "/lib64", "/proc", "/sys", "/dev", "/root",
    "/System", "/Library",
];

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Why a request was rejected. Display is the text returned to the caller and written to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),
    #[error("path not allowed: {0}")]
    PathNotAllowed(String),
    #[error("banned keyword: {0}")]
    BannedKeyword(String),
    #[error("path traversal detected in arguments")]
    PathTraversal,
    #[error("restricted path: {0}")]
    RestrictedPath(String),
    #[error("arguments not allowed: {0}")]
    ArgumentsNotAllowed(String),
}

impl RejectReason {
    /// Stable rule name, e.g. `command-not-allowed`.
    pub fn rule(&self) -> &'static str {
        match self {
            RejectReason::CommandNotAllowed(_) => "command-not-allowed",
            RejectReason::PathNotAllowed(_) => "path-not-allowed",
            RejectReason::BannedKeyword(_) => "banned-keyword",
            RejectReason::PathTraversal => "path-traversal",
            RejectReason::RestrictedPath(_) => "restricted-path",
            RejectReason::ArgumentsNotAllowed(_) => "arguments-not-allowed",
        }
    }
}

/// Allowed, or rejected with the first failing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Allowed,
    Rejected(RejectReason),
}

impl ValidationOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ValidationOutcome::Allowed)
    }

    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            ValidationOutcome::Allowed => None,
            ValidationOutcome::Rejected(r) => Some(r),
        }
    }
}

impl From<Result<(), RejectReason>> for ValidationOutcome {
    fn from(r: Result<(), RejectReason>) -> Self {
        match r {
            Ok(()) => ValidationOutcome::Allowed,
            Err(reason) => ValidationOutcome::Rejected(reason),
        }
    }
}

/// One compiled `allowed_paths` entry.
#[derive(Debug, Clone)]
enum PathRule {
    /// Separator-normalized, case-folded prefix; matches at a segment boundary.
    Prefix(String),
    /// `*` pattern matched against the whole path. With `subtree` (written as a trailing
    /// `/**`) it is matched against the same number of leading segments instead.
    Wildcard {
        pattern: Pattern,
        segments: usize,
        subtree: bool,
    },
}

impl PathRule {
    fn compile(raw: &str) -> Option<Self> {
        let normalized = match_form(raw);
        if normalized.is_empty() {
            return None;
        }
        let (body, subtree) = match normalized.strip_suffix("/**") {
            Some("") => ("/", true),
            Some(body) => (body, true),
            None => (normalized.as_str(), false),
        };
        if !body.contains('*') {
            return Some(PathRule::Prefix(body.to_string()));
        }
        match Pattern::new(body) {
            Ok(pattern) => Some(PathRule::Wildcard {
                segments: body.split('/').count(),
                pattern,
                subtree,
            }),
            Err(e) => {
                log::warn!("ignoring invalid allowed_paths pattern {:?}: {}", raw, e);
                None
            }
        }
    }

    /// `path` must already be in match form (see [`match_form`]).
    fn matches(&self, path: &str) -> bool {
        match self {
            PathRule::Prefix(prefix) => has_segment_prefix(path, prefix),
            PathRule::Wildcard {
                pattern,
                subtree: false,
                ..
            } => pattern.matches_with(path, GLOB_OPTIONS),
            PathRule::Wildcard {
                pattern, segments, ..
            } => {
                let parts: Vec<&str> = path.split('/').collect();
                if parts.len() < *segments {
                    return false;
                }
                let head = parts[..*segments].join("/");
                pattern.matches_with(&head, GLOB_OPTIONS)
            }
        }
    }
}

/// Validates requests against the allowlists compiled from a [`Config`].
#[derive(Debug, Clone)]
pub struct RequestValidator {
    commands: HashSet<String>,
    paths: Vec<PathRule>,
    banned: Vec<String>,
    rules: HashMap<String, CommandRule>,
    restricted: Vec<String>,
}

impl RequestValidator {
    pub fn new(config: &Config) -> Self {
        let commands = config
            .allowed_commands
            .iter()
            .map(|c| normalize_command(c))
            .filter(|c| !c.is_empty())
            .collect();
        let paths = config
            .allowed_paths
            .iter()
            .filter_map(|p| PathRule::compile(p))
            .collect();
        let banned = config
            .banned_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .filter(|k| !k.trim().is_empty())
            .collect();
        let rules = config
            .command_rules
            .iter()
            .map(|(name, rule)| (normalize_command(name), rule.clone()))
            .collect();
        let restricted = RESTRICTED_DIRS.iter().map(|d| match_form(d)).collect();
        Self {
            commands,
            paths,
            banned,
            rules,
            restricted,
        }
    }

    /// Run every rule in order and stop at the first failure.
    pub fn validate(&self, req: &RunRequest) -> ValidationOutcome {
        self.check(req).into()
    }

    fn check(&self, req: &RunRequest) -> Result<(), RejectReason> {
        let command = normalize_command(&req.command);
        if command.is_empty() || !self.commands.contains(&command) {
            return Err(RejectReason::CommandNotAllowed(req.command.clone()));
        }

        if !self.cwd_allowed(&req.cwd) {
            return Err(RejectReason::PathNotAllowed(req.cwd.clone()));
        }

        let joined = std::iter::once(req.command.as_str())
            .chain(req.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if let Some(keyword) = self.banned.iter().find(|k| joined.contains(k.as_str())) {
            return Err(RejectReason::BannedKeyword(keyword.clone()));
        }

        for arg in &req.args {
            if arg.contains("..") {
                return Err(RejectReason::PathTraversal);
            }
            // Relative operands without `..` stay inside the allowed cwd.
            let Some(target) = path_operand(arg) else {
                continue;
            };
            let resolved = match_form(&absolutize(Path::new(target), Path::new("")).to_string_lossy());
            if self
                .restricted
                .iter()
                .any(|dir| has_segment_prefix(&resolved, dir))
            {
                return Err(RejectReason::RestrictedPath(arg.clone()));
            }
        }

        if let Some(rule) = self.rules.get(&command) {
            check_shape(rule, &req.args)?;
        }
        Ok(())
    }

    /// Resolve `cwd` and check it against the allowed patterns.
    fn cwd_allowed(&self, cwd: &str) -> bool {
        let Some(resolved) = resolve_dir(cwd) else {
            return false;
        };
        let form = match_form(&resolved.to_string_lossy());
        self.paths.iter().any(|rule| rule.matches(&form))
    }
}

/// The absolute path an argument names, either whole or as the value of `-flag=PATH`.
fn path_operand(arg: &str) -> Option<&str> {
    let candidate = match arg.split_once('=') {
        Some((flag, value)) if flag.starts_with('-') => value,
        _ => arg,
    };
    Path::new(candidate).is_absolute().then_some(candidate)
}

fn check_shape(rule: &CommandRule, args: &[String]) -> Result<(), RejectReason> {
    if let Some(ref subcommands) = rule.subcommands {
        match args.first() {
            None => {
                return Err(RejectReason::ArgumentsNotAllowed(
                    "a subcommand is required".to_string(),
                ))
            }
            Some(first) if !subcommands.iter().any(|s| s == first) => {
                return Err(RejectReason::ArgumentsNotAllowed(format!(
                    "subcommand {:?} is not allowed",
                    first
                )))
            }
            Some(_) => {}
        }
    }
    if let Some(max) = rule.max_args {
        if args.len() > max {
            return Err(RejectReason::ArgumentsNotAllowed(format!(
                "{} arguments given, at most {} allowed",
                args.len(),
                max
            )));
        }
    }
    Ok(())
}

/// Base name of a command, case-folded, with one executable suffix removed
/// (`C:\Go\bin\GO.EXE` -> `go`).
pub fn normalize_command(command: &str) -> String {
    let base = command
        .trim()
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .to_lowercase();
    for suffix in EXECUTABLE_SUFFIXES {
        if let Some(stem) = base.strip_suffix(suffix) {
            return stem.to_string();
        }
    }
    base
}

/// Absolute form of a requested working directory; relative paths are taken from the
/// gateway's current directory. `None` for an empty string.
pub fn resolve_dir(cwd: &str) -> Option<PathBuf> {
    if cwd.trim().is_empty() {
        return None;
    }
    let path = Path::new(cwd);
    if path.is_absolute() {
        Some(absolutize(path, Path::new("")))
    } else {
        Some(absolutize(path, &std::env::current_dir().ok()?))
    }
}

/// Lexically absolute path: relative paths are joined onto `base`, `.` is dropped and `..`
/// removes the previous segment. The filesystem is not consulted.
pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// `/` separators, lower case, no trailing separator (the root itself stays `/`).
fn match_form(path: &str) -> String {
    let unified = path.trim().replace('\\', "/").to_lowercase();
    let trimmed = unified.trim_end_matches('/');
    if trimmed.is_empty() && unified.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// True when `prefix` equals `path` or is followed in it by a separator.
fn has_segment_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            api_token: "t".into(),
            allowed_commands: vec!["go".into(), "Make".into(), "echo".into()],
            allowed_paths: vec!["/srv/dev".into(), "/home/*/projects".into()],
            banned_keywords: vec!["shutdown".into(), "format".into()],
            ..Config::default()
        }
    }

    fn req(command: &str, args: &[&str], cwd: &str) -> RunRequest {
        RunRequest {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: cwd.into(),
        }
    }

    fn rule_of(outcome: ValidationOutcome) -> Option<&'static str> {
        outcome.reason().map(RejectReason::rule)
    }

    #[test]
    fn allows_listed_command_in_listed_dir() {
        let v = RequestValidator::new(&config());
        assert!(v.validate(&req("go", &["build", "-o", "app"], "/srv/dev/app")).is_allowed());
        assert!(v.validate(&req("make", &[], "/srv/dev")).is_allowed());
    }

    #[test]
    fn command_must_match_exactly() {
        let v = RequestValidator::new(&config());
        let outcome = v.validate(&req("gofmt", &[], "/srv/dev"));
        assert_eq!(rule_of(outcome.clone()), Some("command-not-allowed"));
        assert_eq!(outcome.reason().unwrap().to_string(), "command not allowed: gofmt");
        assert_eq!(rule_of(v.validate(&req("g", &[], "/srv/dev"))), Some("command-not-allowed"));
        assert_eq!(rule_of(v.validate(&req("", &[], "/srv/dev"))), Some("command-not-allowed"));
    }

    #[test]
    fn command_case_and_suffix_are_normalized() {
        let v = RequestValidator::new(&config());
        assert!(v.validate(&req("GO.EXE", &[], "/srv/dev")).is_allowed());
        assert!(v.validate(&req("C:\\Go\\bin\\Go.exe", &[], "/srv/dev")).is_allowed());
        assert!(v.validate(&req("/usr/local/go/bin/go", &[], "/srv/dev")).is_allowed());
        assert!(v.validate(&req("MAKE", &[], "/srv/dev")).is_allowed());
    }

    #[test]
    fn normalize_command_strips_one_suffix() {
        assert_eq!(normalize_command("Tool.EXE"), "tool");
        assert_eq!(normalize_command("build.cmd"), "build");
        assert_eq!(normalize_command("a.exe.exe"), "a.exe");
        assert_eq!(normalize_command("g++"), "g++");
    }

    #[test]
    fn literal_prefix_is_case_insensitive_and_segment_aware() {
        let v = RequestValidator::new(&config());
        assert!(v.validate(&req("go", &[], "/SRV/Dev/x")).is_allowed());
        assert_eq!(rule_of(v.validate(&req("go", &[], "/srv/devil"))), Some("path-not-allowed"));
        assert_eq!(rule_of(v.validate(&req("go", &[], "/srv"))), Some("path-not-allowed"));
        assert_eq!(rule_of(v.validate(&req("go", &[], ""))), Some("path-not-allowed"));
    }

    #[test]
    fn cwd_is_resolved_before_matching() {
        let v = RequestValidator::new(&config());
        assert_eq!(
            rule_of(v.validate(&req("go", &[], "/srv/dev/../../etc"))),
            Some("path-not-allowed")
        );
        assert!(v.validate(&req("go", &[], "/srv/dev/./a/../b")).is_allowed());
    }

    #[test]
    fn wildcard_substitutes_exactly_one_segment() {
        let v = RequestValidator::new(&config());
        assert!(v.validate(&req("go", &[], "/home/alice/projects")).is_allowed());
        assert!(v.validate(&req("go", &[], "/home/Bob/Projects/")).is_allowed());
        assert_eq!(
            rule_of(v.validate(&req("go", &[], "/home/a/b/projects"))),
            Some("path-not-allowed")
        );
        assert_eq!(rule_of(v.validate(&req("go", &[], "/home/projects"))), Some("path-not-allowed"));
        assert_eq!(
            rule_of(v.validate(&req("go", &[], "/home/alice/other"))),
            Some("path-not-allowed")
        );
    }

    #[test]
    fn wildcard_matches_the_whole_path() {
        let v = RequestValidator::new(&config());
        for cwd in ["/home/alice/projects/app", "/home/alice/projects/deep/nested"] {
            assert_eq!(rule_of(v.validate(&req("go", &[], cwd))), Some("path-not-allowed"), "cwd {:?}", cwd);
        }
    }

    #[test]
    fn trailing_double_star_admits_the_subtree() {
        let mut c = config();
        c.allowed_paths = vec!["/home/*/src/**".into(), "/opt/build/**".into()];
        let v = RequestValidator::new(&c);
        assert!(v.validate(&req("go", &[], "/home/alice/src")).is_allowed());
        assert!(v.validate(&req("go", &[], "/home/alice/src/app/cmd")).is_allowed());
        assert!(v.validate(&req("go", &[], "/opt/build/x/y")).is_allowed());
        assert_eq!(rule_of(v.validate(&req("go", &[], "/home/alice/srcs"))), Some("path-not-allowed"));
        assert_eq!(rule_of(v.validate(&req("go", &[], "/home/a/b/src/x"))), Some("path-not-allowed"));
    }

    #[test]
    fn windows_patterns_normalize_separators() {
        let rule = PathRule::compile("C:\\Users\\*\\Projects").unwrap();
        assert!(rule.matches(&match_form("C:\\Users\\bob\\Projects")));
        assert!(rule.matches(&match_form("c:/users/BOB/projects/")));
        assert!(!rule.matches(&match_form("c:/users/BOB/projects/app")));
        assert!(!rule.matches(&match_form("C:\\Users\\a\\b\\Projects")));
        assert!(!rule.matches(&match_form("C:\\Users\\Projects")));

        let literal = PathRule::compile("C:\\Dev\\").unwrap();
        assert!(literal.matches(&match_form("c:\\dev\\tool")));
        assert!(!literal.matches(&match_form("c:\\devtools")));
    }

    #[test]
    fn banned_keyword_is_case_insensitive_substring() {
        let v = RequestValidator::new(&config());
        let outcome = v.validate(&req("go", &["run", "SHUTDOWN.go"], "/srv/dev"));
        assert_eq!(outcome.reason().unwrap().to_string(), "banned keyword: shutdown");
        assert_eq!(
            rule_of(v.validate(&req("go", &["run", "reformat"], "/srv/dev"))),
            Some("banned-keyword")
        );
    }

    #[test]
    fn banned_keyword_spans_command_and_argument() {
        let mut c = config();
        c.banned_keywords = vec!["go run".into()];
        let v = RequestValidator::new(&c);
        assert_eq!(rule_of(v.validate(&req("go", &["run", "x"], "/srv/dev"))), Some("banned-keyword"));
        assert!(v.validate(&req("go", &["build"], "/srv/dev")).is_allowed());
    }

    #[test]
    fn empty_banned_keywords_are_ignored() {
        let mut c = config();
        c.banned_keywords = vec!["".into(), "  ".into()];
        let v = RequestValidator::new(&c);
        assert!(v.validate(&req("go", &["version"], "/srv/dev")).is_allowed());
    }

    #[test]
    fn traversal_marker_anywhere_in_argument_is_rejected() {
        let v = RequestValidator::new(&config());
        for arg in ["../secret", "a/../b", "x..y", "--out=.."] {
            let outcome = v.validate(&req("go", &["build", arg], "/srv/dev"));
            assert_eq!(rule_of(outcome), Some("path-traversal"), "arg {:?}", arg);
        }
    }

    #[test]
    fn restricted_directories_in_arguments_are_rejected() {
        let v = RequestValidator::new(&config());
        let outcome = v.validate(&req("go", &["run", "/etc/passwd"], "/srv/dev"));
        assert_eq!(outcome.reason().unwrap().to_string(), "restricted path: /etc/passwd");
        assert_eq!(rule_of(v.validate(&req("go", &["/USR/bin"], "/srv/dev"))), Some("restricted-path"));
        assert!(v.validate(&req("go", &["/etcetera"], "/srv/dev")).is_allowed());
        assert!(v.validate(&req("go", &["build", "-o", "out/app"], "/srv/dev")).is_allowed());
        assert_eq!(
            rule_of(v.validate(&req("go", &["build", "--output=/etc/app"], "/srv/dev"))),
            Some("restricted-path")
        );
    }

    #[test]
    fn plain_words_pass_in_an_allowed_dir_under_a_restricted_prefix() {
        let mut c = config();
        c.allowed_paths = vec!["/usr/local/src".into()];
        let v = RequestValidator::new(&c);
        assert!(v.validate(&req("make", &["all", "-j4", "out/bin"], "/usr/local/src/app")).is_allowed());
        assert_eq!(
            rule_of(v.validate(&req("make", &["/usr/bin/ld"], "/usr/local/src/app"))),
            Some("restricted-path")
        );
    }

    #[test]
    fn command_is_matched_by_base_name_wherever_it_lives() {
        let v = RequestValidator::new(&config());
        assert!(v.validate(&req("/any/dir/go", &["build"], "/srv/dev")).is_allowed());
        assert_eq!(
            rule_of(v.validate(&req("/any/dir/gofmt", &[], "/srv/dev"))),
            Some("command-not-allowed")
        );
    }

    #[test]
    fn earlier_rule_wins() {
        let v = RequestValidator::new(&config());
        assert_eq!(
            rule_of(v.validate(&req("rm", &["../x"], "/nowhere"))),
            Some("command-not-allowed")
        );
        assert_eq!(
            rule_of(v.validate(&req("go", &["shutdown", "../x"], "/nowhere"))),
            Some("path-not-allowed")
        );
        assert_eq!(
            rule_of(v.validate(&req("go", &["shutdown", "../x"], "/srv/dev"))),
            Some("banned-keyword")
        );
    }

    #[test]
    fn command_rules_restrict_argument_shape() {
        let mut c = config();
        c.command_rules.insert(
            "GO.exe".into(),
            CommandRule {
                subcommands: Some(vec!["build".into(), "version".into()]),
                max_args: Some(3),
            },
        );
        let v = RequestValidator::new(&c);
        assert!(v.validate(&req("go", &["version"], "/srv/dev")).is_allowed());
        assert!(v.validate(&req("go", &["build", "-o", "app"], "/srv/dev")).is_allowed());
        assert_eq!(rule_of(v.validate(&req("go", &["get", "x"], "/srv/dev"))), Some("arguments-not-allowed"));
        assert_eq!(rule_of(v.validate(&req("go", &[], "/srv/dev"))), Some("arguments-not-allowed"));
        assert_eq!(
            rule_of(v.validate(&req("go", &["build", "-o", "app", "-v"], "/srv/dev"))),
            Some("arguments-not-allowed")
        );
        assert!(v.validate(&req("make", &["anything", "at", "all", "here"], "/srv/dev")).is_allowed());
    }

    #[test]
    fn absolutize_folds_dots() {
        assert_eq!(
            absolutize(Path::new("a/./b/../c"), Path::new("/base")),
            PathBuf::from("/base/a/c")
        );
        assert_eq!(absolutize(Path::new("/../x"), Path::new("/base")), PathBuf::from("/x"));
    }
}
