//! How the speed-test tool is invoked.
//!
//! `TestOptions` describes one requested run, `Invocation` is the resolved
//! program plus its full argument list. Locating the executable happens here
//! too, so a missing tool is reported before anything is spawned.

use std::path::{Path, PathBuf};

use crate::errors::TestError;

/// Name of the tool when looked up on `PATH` or next to our binary.
pub const DEFAULT_PROGRAM: &str = "speedtest";

const ACCEPT_FLAGS: [&str; 2] = ["--accept-license", "--accept-gdpr"];

/// Output mode requested from the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line, ending in a `result` document.
    #[default]
    Json,
    /// Human-readable progress text.
    #[value(alias = "text")]
    Human,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "human" | "text" => Some(OutputFormat::Human),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Human => "human",
        }
    }
}

/// Parameters of a single test run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestOptions {
    pub format: OutputFormat,
    /// Pin the test to one server instead of letting the tool pick.
    pub server_id: Option<u64>,
    /// Skip the upload phase (the launcher's "quick" test).
    pub no_upload: bool,
    /// Passed through verbatim after the generated flags.
    pub extra_args: Vec<String>,
}

impl TestOptions {
    pub fn quick(mut self) -> Self {
        self.no_upload = true;
        self
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.format == OutputFormat::Json {
            args.push("--format=json".to_string());
        }
        args.extend(ACCEPT_FLAGS.iter().map(|flag| flag.to_string()));
        args.push("--progress=yes".to_string());
        if let Some(id) = self.server_id {
            args.push(format!("--server-id={}", id));
        }
        if self.no_upload {
            args.push("--no-upload".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Arguments for listing nearby servers.
pub fn servers_args() -> Vec<String> {
    let mut args = vec!["--servers".to_string(), "--format=json".to_string()];
    args.extend(ACCEPT_FLAGS.iter().map(|flag| flag.to_string()));
    args
}

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub format: OutputFormat,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, format: OutputFormat) -> Self {
        Self {
            program: program.into(),
            args,
            format,
        }
    }

    pub fn for_test(program: impl Into<PathBuf>, options: &TestOptions) -> Self {
        Self::new(program, options.build_args(), options.format)
    }

    /// Shell-style rendering for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Finds the tool to run.
///
/// An explicit path (anything containing a separator) must exist. A bare name
/// is looked for next to the current executable first, then on `PATH`.
pub fn resolve_executable(program: Option<&str>) -> Result<PathBuf, TestError> {
    let program = program
        .map(str::trim)
        .filter(|program| !program.is_empty())
        .unwrap_or(DEFAULT_PROGRAM);
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(TestError::not_found(program));
    }

    if let Some(bundled) = bundled_path(program) {
        return Ok(bundled);
    }
    search_path(program, std::env::var_os("PATH").as_deref())
        .ok_or_else(|| TestError::not_found(program))
}

fn bundled_path(program: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    candidates(program)
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn search_path(program: &str, path_var: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(path_var).find_map(|dir| {
        candidates(program)
            .into_iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    })
}

fn candidates(program: &str) -> Vec<String> {
    let mut names = vec![program.to_string()];
    if cfg!(windows) && !program.to_ascii_lowercase().ends_with(".exe") {
        names.insert(0, format!("{}.exe", program));
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_args_include_format_and_acceptance() {
        let args = TestOptions::default().build_args();
        assert_eq!(
            args,
            vec![
                "--format=json",
                "--accept-license",
                "--accept-gdpr",
                "--progress=yes"
            ]
        );
    }

    #[test]
    fn quick_test_with_server_and_extras() {
        let options = TestOptions {
            format: OutputFormat::Human,
            server_id: Some(2445),
            extra_args: vec!["--interface=eth0".to_string()],
            ..TestOptions::default()
        }
        .quick();
        let args = options.build_args();
        assert!(!args.iter().any(|arg| arg.starts_with("--format")));
        assert!(args.contains(&"--server-id=2445".to_string()));
        assert!(args.contains(&"--no-upload".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--interface=eth0"));
    }

    #[test]
    fn servers_args_request_json() {
        assert_eq!(
            servers_args(),
            vec!["--servers", "--format=json", "--accept-license", "--accept-gdpr"]
        );
    }

    #[test]
    fn format_parses_aliases() {
        assert_eq!(OutputFormat::parse("JSON"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::parse("text"), Some(OutputFormat::Human));
        assert_eq!(OutputFormat::parse("xml"), None);
    }

    #[test]
    fn explicit_missing_path_is_not_found() {
        let err = resolve_executable(Some("/definitely/not/here/speedtest")).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::ProcessNotFound);
    }

    #[test]
    fn unknown_bare_name_is_not_found() {
        let err = resolve_executable(Some("speedrack-no-such-tool-4821")).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::ProcessNotFound);
    }

    #[cfg(unix)]
    #[test]
    fn path_search_finds_sh() {
        let found = search_path("sh", Some(std::ffi::OsStr::new("/nonexistent:/bin:/usr/bin")));
        assert!(found.is_some());
    }

    #[test]
    fn invocation_display_quotes_arguments() {
        let invocation = Invocation::new(
            "speedtest",
            vec!["--format=json".into(), "two words".into()],
            OutputFormat::Json,
        );
        let shown = invocation.display();
        assert!(shown.starts_with("speedtest "));
        assert!(shown.ends_with(" 'two words'"));
    }
}
