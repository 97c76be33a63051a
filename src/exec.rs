// src/exec.rs

//! External tool invocation
//!
//! Filesystem-image codecs, the integrity tool, loop/device-mapper setup and
//! mounts are external collaborators. They are reached through the
//! `CommandRunner` trait so the same compositor code runs against the local
//! machine or any other transport, and against a fake in tests.

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Runs external commands and reports their outcome
pub trait CommandRunner {
    /// Run a command to completion and return its standard output
    ///
    /// A non-zero exit status is reported as `Error::ToolFailed`.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;

    /// Run a check command and report whether it exited successfully
    fn succeeds(&self, program: &str, args: &[&str]) -> bool;

    /// Check whether a regular file exists where the commands execute
    fn file_exists(&self, path: &Path) -> bool {
        self.succeeds("test", &["-f", &path.to_string_lossy()])
    }

    /// Read a text file where the commands execute
    fn read_file(&self, path: &Path) -> Result<String>;

    /// Write a file where the commands execute, creating parent directories
    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;
}

/// Runs commands on the local machine
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRunner;

impl CommandRunner for LocalRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("{} {}", program, args.join(" "));

        let output = Command::new(program).args(args).output().map_err(|e| {
            Error::ToolFailed {
                program: program.to_string(),
                status: "not started".to_string(),
                stderr: e.to_string(),
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!("{} exited with {}: {}", program, output.status, stderr);
            return Err(Error::ToolFailed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr,
            });
        }

        debug!("{}", stdout.trim());
        Ok(stdout)
    }

    fn succeeds(&self, program: &str, args: &[&str]) -> bool {
        debug!("{} {}", program, args.join(" "));
        Command::new(program)
            .args(args)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_file(&self, path: &Path) -> Result<String> {
        Ok(fs::read_to_string(path)?)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;

    /// Records every command and answers from canned responses
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        pub(crate) calls: RefCell<Vec<String>>,
        pub(crate) outputs: HashMap<String, String>,
        pub(crate) succeeding: RefCell<HashSet<String>>,
        pub(crate) files: HashMap<PathBuf, String>,
        pub(crate) written: RefCell<HashMap<PathBuf, Vec<u8>>>,
    }

    impl FakeRunner {
        /// Commands whose program name matches, in call order
        pub(crate) fn calls_to(&self, program: &str) -> Vec<String> {
            self.calls
                .borrow()
                .iter()
                .filter(|call| call.split(' ').next() == Some(program))
                .cloned()
                .collect()
        }

        /// Make `path` exist with `contents` on the fake target
        pub(crate) fn with_file(mut self, path: &str, contents: &str) -> Self {
            self.files.insert(PathBuf::from(path), contents.to_string());
            self
        }

        /// Make a check command line succeed
        pub(crate) fn succeed(&self, line: &str) {
            self.succeeding.borrow_mut().insert(line.to_string());
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<String> {
            let line = format!("{} {}", program, args.join(" "));
            self.calls.borrow_mut().push(line);
            Ok(self.outputs.get(program).cloned().unwrap_or_default())
        }

        fn succeeds(&self, program: &str, args: &[&str]) -> bool {
            let line = format!("{} {}", program, args.join(" "));
            self.calls.borrow_mut().push(line.clone());
            self.succeeding.borrow().contains(&line)
        }

        fn file_exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }

        fn read_file(&self, path: &Path) -> Result<String> {
            self.files.get(path).cloned().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string())
                    .into()
            })
        }

        fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
            self.written
                .borrow_mut()
                .insert(path.to_path_buf(), contents.to_vec());
            Ok(())
        }
    }
}
