use anyhow::{bail, ensure, Result};
use itertools::Itertools;
use shell_escape::escape;
use std::ffi::OsStr;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Convert an io::error to a string and strip "(os error 4)" from the end.
fn io_error_to_string(err: &std::io::Error) -> String {
    let s = err.to_string();
    s.strip_suffix(&format!(" (os error {})", err.raw_os_error().unwrap_or(0)))
        .unwrap_or(&s)
        .to_string()
}

/// Print an error chain.
pub fn print_error_chain(err: &anyhow::Error) {
    let error_chain = err.chain().join("\n\tCaused by: ");
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        let io_err_str = io_error_to_string(io_err);
        match err.chain().len() {
            1 => println!("ERROR: {io_err_str}"),
            2 => println!("ERROR: {io_err_str}: {err}"),
            _ => println!("ERROR: {error_chain}"),
        };
    } else {
        println!("ERROR: {error_chain}");
    };
}

/// Quote each argument for a POSIX shell and join them with spaces.
pub fn shell_join<I, S>(argv: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    argv.into_iter()
        .map(|arg| escape(arg.as_ref().to_string_lossy()).into_owned())
        .join(" ")
}

/// An input path canonicalized at parse time, so that jobs running in
/// another working directory still find it.
#[derive(Clone)]
pub struct CliPath {
    path: PathBuf,
}

impl FromStr for CliPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<CliPath> {
        match Path::new(s).canonicalize() {
            Ok(path) => Ok(CliPath { path }),
            Err(e) => bail!(io_error_to_string(&e)),
        }
    }
}

impl Debug for CliPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.path, f)
    }
}

impl From<CliPath> for PathBuf {
    fn from(obj: CliPath) -> PathBuf {
        obj.path
    }
}

impl Deref for CliPath {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

/// Parse and validate an identifier, for use with Clap's value_parser.
/// A valid indentifier contains only letters, digits, underscores, and dashes.
pub fn validate_ascii_identifier(id: &str) -> Result<String> {
    ensure!(
        id.chars()
            .all(|c| matches!(c, '0'..='9' | 'A'..='Z' | 'a'..='z' | '_' | '-')),
        "must contain only letters, digits, underscores, and dashes."
    );
    Ok(String::from(id))
}

/// Max allowed length of the --job-name argument
const MAX_ID_LEN: usize = 64;

/// Parse and validate the --job-name argument, for use with Clap's value_parser.
pub fn validate_id(id: &str) -> Result<String> {
    ensure!(
        id.len() <= MAX_ID_LEN,
        "The --job-name parameter must be {MAX_ID_LEN} characters or less, please use a shorter string.",
    );
    validate_ascii_identifier(id)
}
