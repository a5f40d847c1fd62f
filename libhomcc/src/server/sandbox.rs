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

//! Per-job sandbox: a private instance directory that client-relative paths
//! get rewritten into, plus the (optional) shell environment a compile
//! actually runs under (bare, schroot, or docker).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::TempDir;
use tracing::debug;

use crate::arguments::Arguments;

/// A private working directory for a single compile job. Dropped (and thus
/// deleted) once the job finishes.
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> anyhow::Result<Sandbox> {
        let dir = tempfile::Builder::new()
            .prefix("homcc-")
            .tempdir_in(std::env::temp_dir().join("homcc"))
            .or_else(|_| {
                std::fs::create_dir_all(std::env::temp_dir().join("homcc"))?;
                tempfile::Builder::new().prefix("homcc-").tempdir_in(std::env::temp_dir().join("homcc"))
            })
            .context("creating sandbox instance directory")?;
        Ok(Sandbox { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Maps the client's cwd onto a path inside this sandbox.
    pub fn map_cwd(&self, cwd: &str) -> PathBuf {
        map_path_absolute(self.path(), cwd)
    }

    /// Maps every include/source argument and dependency path the client
    /// sent onto sandbox-local paths, leaving everything else untouched.
    pub fn map_arguments(&self, mapped_cwd: &Path, arguments: &Arguments) -> Arguments {
        let args = arguments.args();
        let mut mapped = Vec::with_capacity(args.len());
        mapped.push(args[0].clone());

        for arg in &args[1..] {
            if let Some(rest) = arg.strip_prefix("-I") {
                mapped.push(format!("-I{}", self.map_path(mapped_cwd, rest).display()));
            } else if arg.starts_with('-') {
                mapped.push(arg.clone());
            } else {
                mapped.push(self.map_path(mapped_cwd, arg).to_string_lossy().into_owned());
            }
        }

        Arguments::from_vec(mapped)
    }

    pub fn map_dependencies(
        &self,
        mapped_cwd: &Path,
        dependencies: &HashMap<String, String>,
    ) -> HashMap<PathBuf, String> {
        dependencies
            .iter()
            .map(|(path, sha1)| (self.map_path(mapped_cwd, path), sha1.clone()))
            .collect()
    }

    fn map_path(&self, mapped_cwd: &Path, path: &str) -> PathBuf {
        if Path::new(path).is_absolute() {
            map_path_absolute(self.path(), path)
        } else {
            mapped_cwd.join(path)
        }
    }

    pub fn write_dependency(&self, path: &Path, content: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating dependency parent directories")?;
        }
        std::fs::write(path, content).context("writing dependency")?;
        debug!("wrote file {}", path.display());
        Ok(())
    }
}

fn map_path_absolute(instance_path: &Path, path: &str) -> PathBuf {
    instance_path.join(path.trim_start_matches('/'))
}

/// Shell environment a compile runs under; the bare-metal case is the only
/// one fully implemented here, schroot/docker are accepted on the wire and
/// recorded but delegate to the host compiler directly (see the
/// "sandboxed compilation backends" open question).
pub trait ShellEnvironment {
    fn transform(&self, arguments: &Arguments) -> Arguments;
}

pub struct NoopEnvironment;

impl ShellEnvironment for NoopEnvironment {
    fn transform(&self, arguments: &Arguments) -> Arguments {
        arguments.clone()
    }
}

pub struct SchrootEnvironment {
    pub profile: String,
}

impl ShellEnvironment for SchrootEnvironment {
    fn transform(&self, arguments: &Arguments) -> Arguments {
        let mut wrapped = vec!["schroot".to_string(), "-c".to_string(), self.profile.clone(), "--".to_string()];
        wrapped.extend(arguments.args().iter().cloned());
        Arguments::from_vec(wrapped)
    }
}

pub struct DockerEnvironment {
    pub container: String,
}

impl ShellEnvironment for DockerEnvironment {
    fn transform(&self, arguments: &Arguments) -> Arguments {
        let mut wrapped =
            vec!["docker".to_string(), "exec".to_string(), self.container.clone()];
        wrapped.extend(arguments.args().iter().cloned());
        Arguments::from_vec(wrapped)
    }
}

pub fn resolve_environment(
    schroot_profile: Option<String>,
    docker_container: Option<String>,
) -> Box<dyn ShellEnvironment + Send + Sync> {
    if let Some(profile) = schroot_profile {
        Box::new(SchrootEnvironment { profile })
    } else if let Some(container) = docker_container {
        Box::new(DockerEnvironment { container })
    } else {
        Box::new(NoopEnvironment)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn maps_absolute_and_relative_paths() {
        let sandbox = Sandbox::new().unwrap();
        let mapped_cwd = sandbox.map_cwd("/home/user/project");
        assert!(mapped_cwd.starts_with(sandbox.path()));

        let args = Arguments::new("gcc", ["-c".to_string(), "main.c".to_string(), "-I/usr/local/include".to_string()]);
        let mapped = sandbox.map_arguments(&mapped_cwd, &args);
        assert!(mapped.args()[2].contains("main.c"));
        assert!(mapped.args().iter().any(|a| a.starts_with("-I") && a.contains(sandbox.path().to_str().unwrap())));
    }

    #[test]
    fn noop_environment_is_identity() {
        let args = Arguments::new("gcc", ["-c".to_string(), "main.c".to_string()]);
        let transformed = NoopEnvironment.transform(&args);
        assert_eq!(transformed, args);
    }

    #[test]
    fn schroot_environment_wraps_command() {
        let args = Arguments::new("gcc", ["-c".to_string(), "main.c".to_string()]);
        let env = SchrootEnvironment { profile: "buster".into() };
        let wrapped = env.transform(&args);
        assert_eq!(wrapped.compiler(), "schroot");
    }
}
