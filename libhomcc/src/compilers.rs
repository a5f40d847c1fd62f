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

//! Compiler abstraction so the dispatcher can ask "what target triple does
//! this compiler produce" and "how do I cross-compile for target X" without
//! caring whether it is talking to clang or gcc.

use tracing::error;

use crate::arguments::Arguments;
use crate::error::RecoverableClientError;

pub trait Compiler {
    fn supports_target(&self, target: &str) -> bool;
    fn target_triple(&self) -> Result<String, RecoverableClientError>;
    fn with_target(&self, arguments: &Arguments, target: &str) -> Arguments;
}

pub struct Clang {
    compiler_str: String,
}

pub struct Gcc {
    compiler_str: String,
}

/// Resolves the `Compiler` implementation matching a compiler invocation
/// string (e.g. `"gcc"`, `"clang++"`).
pub fn from_str(compiler_str: &str) -> Option<Box<dyn Compiler>> {
    if compiler_str.starts_with("clang") {
        Some(Box::new(Clang { compiler_str: compiler_str.to_string() }))
    } else if compiler_str.starts_with("gcc") || compiler_str.starts_with("g++") {
        Some(Box::new(Gcc { compiler_str: compiler_str.to_string() }))
    } else {
        None
    }
}

impl Compiler for Clang {
    fn supports_target(&self, _target: &str) -> bool {
        // clang --version does not report triples in the same format as
        // -print-targets, so we can't check support up front; assume yes and
        // let the actual cross compile fail loudly if it doesn't.
        true
    }

    fn target_triple(&self) -> Result<String, RecoverableClientError> {
        let result = Arguments::new(self.compiler_str.clone(), ["--version".to_string()])
            .execute(None)
            .map_err(|err| {
                error!("could not get target triple for compiler '{}': {err}", self.compiler_str);
                RecoverableClientError::TargetInferation(self.compiler_str.clone())
            })?;

        result
            .stdout
            .lines()
            .find_map(|line| line.split_once("Target:").map(|(_, rest)| rest.trim().to_string()))
            .ok_or_else(|| RecoverableClientError::TargetInferation(self.compiler_str.clone()))
    }

    fn with_target(&self, arguments: &Arguments, target: &str) -> Arguments {
        arguments.clone().add_arg(format!("--target={target}"))
    }
}

impl Compiler for Gcc {
    fn supports_target(&self, target: &str) -> bool {
        which::which(format!("{target}-{}", self.compiler_str)).is_ok()
    }

    fn target_triple(&self) -> Result<String, RecoverableClientError> {
        let result = Arguments::new(self.compiler_str.clone(), ["-dumpmachine".to_string()])
            .execute(None)
            .map_err(|err| {
                error!("could not get target triple for compiler '{}': {err}", self.compiler_str);
                RecoverableClientError::TargetInferation(self.compiler_str.clone())
            })?;

        Ok(result.stdout.trim().to_string())
    }

    fn with_target(&self, arguments: &Arguments, target: &str) -> Arguments {
        let mut copied = arguments.clone();
        copied.set_compiler(format!("{target}-{}", self.compiler_str));
        copied
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dispatches_clang() {
        assert!(from_str("clang++").is_some());
    }

    #[test]
    fn dispatches_gcc_and_gpp() {
        assert!(from_str("gcc").is_some());
        assert!(from_str("g++").is_some());
    }

    #[test]
    fn rejects_unknown_compiler() {
        assert!(from_str("tcc").is_none());
    }
}
