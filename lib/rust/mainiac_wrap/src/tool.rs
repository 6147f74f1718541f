//! Launching the external aligner and post-processors.
//!
//! Every tool runs as a filter with an explicit working directory, so that
//! the relative file names the tools read and write resolve inside the
//! caller's workspace. The process-wide current directory is never touched.

use crate::utils::shell_join;
use log::debug;
use std::ffi::{OsStr, OsString};
use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Destination of a tool's standard output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    /// Share the standard output of this process.
    Inherit,
    /// Throw the output away.
    Discard,
    /// Write the output to a file. Relative paths resolve against the
    /// working directory of the call.
    File(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unable to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("unable to create {path:?} for the output of {program}")]
    Redirect {
        program: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed with {status}")]
    Exit { program: String, status: ExitStatus },

    #[error("{program} exited successfully but did not write {path:?}")]
    MissingOutput { program: String, path: PathBuf },
}

impl ToolError {
    /// The exit status of the tool, if it ran to completion.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            ToolError::Exit { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One invocation of an external program.
#[derive(Debug, Clone)]
pub struct ToolCall {
    program: PathBuf,
    args: Vec<OsString>,
    stdout: ToolOutput,
    outputs: Vec<PathBuf>,
}

impl ToolCall {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ToolCall {
            program: program.into(),
            args: Vec::new(),
            stdout: ToolOutput::Inherit,
            outputs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn stdout(mut self, stdout: ToolOutput) -> Self {
        self.stdout = stdout;
        self
    }

    /// Declare a file the tool must leave behind in the working directory.
    /// A zero exit status without this file is reported as a failure.
    pub fn produces(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Short name of the program, used in messages.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// The program followed by its arguments.
    pub fn argv(&self) -> Vec<OsString> {
        std::iter::once(self.program.as_os_str().to_os_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Run the program inside `working_dir` and wait for it to exit.
    pub fn invoke(&self, working_dir: &Path) -> Result<(), ToolError> {
        let program = self.program_name();
        let stdout = match &self.stdout {
            ToolOutput::Inherit => Stdio::inherit(),
            ToolOutput::Discard => Stdio::null(),
            ToolOutput::File(path) => {
                let path = working_dir.join(path);
                let file = File::create(&path).map_err(|source| ToolError::Redirect {
                    program: program.clone(),
                    path,
                    source,
                })?;
                Stdio::from(file)
            }
        };

        debug!("running `{self}` in {}", working_dir.display());
        let status = Command::new(&self.program)
            .args(&self.args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .status()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(ToolError::Exit { program, status });
        }
        for output in &self.outputs {
            let path = working_dir.join(output);
            if !path.exists() {
                return Err(ToolError::MissingOutput { program, path });
            }
        }
        Ok(())
    }
}

impl Display for ToolCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_join(self.argv()))?;
        if let ToolOutput::File(path) = &self.stdout {
            write!(f, " > {}", shell_join([path]))?;
        }
        Ok(())
    }
}
