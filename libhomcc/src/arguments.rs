// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parsing and manipulation of compiler command lines shared between the
//! client and the server.

use std::collections::HashMap;
use std::process::Command;

use anyhow::Context;
use tracing::debug;

const NO_ASSEMBLY_ARG: &str = "-S";
const NO_LINKING_ARG: &str = "-c";
const OUTPUT_ARG: &str = "-o";
const INCLUDE_ARGS: &[&str] = &["-I", "-isysroot", "-isystem"];
const PREPROCESSOR_ARGS: &[&str] = &["-E", "-M", "-MM"];
pub const PREPROCESSOR_TARGET: &str = "$(homcc)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arguments {
    args: Vec<String>,
}

#[derive(Debug)]
pub struct ExecutionResult {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Arguments {
    pub fn new(compiler: impl Into<String>, args: impl IntoIterator<Item = String>) -> Arguments {
        let mut all = vec![compiler.into()];
        all.extend(args);
        Arguments { args: all }
    }

    pub fn from_vec(args: Vec<String>) -> Arguments {
        Arguments { args }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn compiler(&self) -> &str {
        &self.args[0]
    }

    pub fn set_compiler(&mut self, compiler: impl Into<String>) {
        self.args[0] = compiler.into();
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    pub fn add_arg(mut self, arg: impl Into<String>) -> Arguments {
        self.args.push(arg.into());
        self
    }

    pub fn remove_arg(mut self, arg: &str) -> Arguments {
        self.args.retain(|a| a != arg);
        self
    }

    /// Determines if compiling these arguments remotely would produce a
    /// meaningful result: preprocessor-only or assembly-only invocations
    /// have nothing for the server to usefully do.
    pub fn is_sendable(&self) -> bool {
        !self.args[1..]
            .iter()
            .any(|a| a == NO_ASSEMBLY_ARG || PREPROCESSOR_ARGS.contains(&a.as_str()))
    }

    pub fn is_linking(&self) -> bool {
        !self.has_arg(NO_LINKING_ARG)
    }

    /// Arguments that ask the compiler to emit dependency information
    /// instead of compiling, used for client-side dependency discovery.
    pub fn dependency_finding(&self) -> Arguments {
        self.clone()
            .remove_arg(NO_LINKING_ARG)
            .remove_output_args()
            .add_arg("-MM")
            .add_arg("-MT")
            .add_arg(PREPROCESSOR_TARGET)
    }

    pub fn no_linking(&self) -> Arguments {
        self.clone().remove_output_args().add_arg(NO_LINKING_ARG)
    }

    pub fn output(&self) -> Option<String> {
        let mut it = self.args[1..].iter();
        let mut output = None;
        while let Some(arg) = it.next() {
            if let Some(rest) = arg.strip_prefix(OUTPUT_ARG) {
                if rest.is_empty() {
                    output = it.next().cloned();
                } else {
                    output = Some(rest.to_string());
                }
            }
        }
        output
    }

    pub fn set_output(self, output: impl Into<String>) -> Arguments {
        self.remove_output_args().add_arg(format!("-o{}", output.into()))
    }

    pub fn remove_output_args(&self) -> Arguments {
        let mut args = vec![self.args[0].clone()];
        let mut it = self.args[1..].iter();
        while let Some(arg) = it.next() {
            if arg.starts_with(OUTPUT_ARG) {
                if arg == OUTPUT_ARG {
                    it.next();
                }
            } else {
                args.push(arg.clone());
            }
        }
        Arguments { args }
    }

    /// Extracts the paths of the files passed for compilation.
    pub fn source_files(&self) -> Vec<String> {
        let mut sources = Vec::new();
        let mut skip_next = false;

        for arg in &self.args[1..] {
            if skip_next {
                skip_next = false;
                continue;
            }
            if arg.starts_with('-') {
                if arg == OUTPUT_ARG || INCLUDE_ARGS.contains(&arg.as_str()) {
                    skip_next = true;
                }
                continue;
            }
            if !is_source_file(arg) {
                debug!("suspicious source file added: {arg}");
            }
            sources.push(arg.clone());
        }

        sources
    }

    pub fn replace_source_files_with_object_files(
        &self,
        source_to_object: &HashMap<String, String>,
    ) -> Arguments {
        let args = self
            .args
            .iter()
            .map(|arg| source_to_object.get(arg).cloned().unwrap_or_else(|| arg.clone()))
            .collect();
        Arguments { args }
    }

    pub fn execute(&self, cwd: Option<&str>) -> anyhow::Result<ExecutionResult> {
        let mut command = Command::new(&self.args[0]);
        command.args(&self.args[1..]);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command.output().context("failed to spawn compiler process")?;
        Ok(ExecutionResult {
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl std::fmt::Display for Arguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.args.join(" "))
    }
}

fn is_source_file(arg: &str) -> bool {
    let lower = arg.to_lowercase();
    ["c", "cc", "cp", "cpp", "cxx", "c++"]
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(v: &[&str]) -> Arguments {
        Arguments::new(v[0], v[1..].iter().map(|s| s.to_string()))
    }

    #[test]
    fn is_sendable_rejects_assembly_only() {
        assert!(!args(&["g++", "-S", "main.cpp"]).is_sendable());
    }

    #[test]
    fn is_sendable_rejects_preprocessor_only() {
        assert!(!args(&["gcc", "-E", "main.c"]).is_sendable());
    }

    #[test]
    fn is_sendable_accepts_normal_compile() {
        assert!(args(&["gcc", "-c", "main.c"]).is_sendable());
    }

    #[test]
    fn is_linking_false_with_no_linking_flag() {
        assert!(!args(&["gcc", "-c", "main.c"]).is_linking());
        assert!(args(&["gcc", "main.c"]).is_linking());
    }

    #[test]
    fn output_compact_and_separate_forms() {
        assert_eq!(args(&["gcc", "-c", "main.c", "-oout.o"]).output(), Some("out.o".into()));
        assert_eq!(args(&["gcc", "-c", "main.c", "-o", "out.o"]).output(), Some("out.o".into()));
        assert_eq!(args(&["gcc", "-c", "main.c"]).output(), None);
    }

    #[test]
    fn source_files_skips_flag_values() {
        let a = args(&["gcc", "-I", "/usr/include", "-c", "main.c", "helper.cpp"]);
        assert_eq!(a.source_files(), vec!["main.c".to_string(), "helper.cpp".to_string()]);
    }

    #[test]
    fn dependency_finding_swaps_to_mm() {
        let a = args(&["gcc", "-c", "main.c", "-o", "main.o"]).dependency_finding();
        assert!(a.has_arg("-MM"));
        assert!(!a.has_arg("-c"));
        assert!(!a.has_arg("-o"));
    }
}
