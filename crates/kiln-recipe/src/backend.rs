//! The external build backend.
//!
//! Kiln never compiles anything itself. A [`BuildBackend`] takes the
//! generated artifacts and drives an external build system through
//! configure, build and install. [`CMakeBackend`] runs `cmake`.

use crate::cancel::{CancelReason, CancellationToken};
use crate::generate::{parse_cache_variables, GenerateError, GeneratedArtifactSet, GeneratorKind};
use crate::settings::SettingsAxis;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// How often a running backend process is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors reported by a build backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend ran and failed. `diagnostics` is its own error output,
    /// unmodified.
    #[error("{step} failed ({}):\n{diagnostics}", .status.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}")))]
    Failed {
        step: String,
        status: Option<i32>,
        diagnostics: String,
    },

    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{step} timed out")]
    TimedOut { step: String },

    #[error("{step} was cancelled")]
    Cancelled { step: String },

    #[error(transparent)]
    Artifacts(#[from] GenerateError),
}

/// State carried from configure to build and install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildHandle {
    pub source_root: PathBuf,
    pub build_dir: PathBuf,
    pub build_type: Option<String>,
}

/// An external build system.
pub trait BuildBackend {
    /// Configure a build tree for `source_root` in `build_dir` from the
    /// generated artifacts.
    fn configure(
        &self,
        artifacts: &GeneratedArtifactSet,
        source_root: &Path,
        build_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<BuildHandle, BackendError>;

    /// Build a configured tree.
    fn build(&self, handle: &BuildHandle, cancel: &CancellationToken) -> Result<(), BackendError>;

    /// Install the build results into `install_root`.
    fn install(
        &self,
        handle: &BuildHandle,
        install_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError>;
}

/// Runs the `cmake` command line tool.
#[derive(Debug, Clone)]
pub struct CMakeBackend {
    program: PathBuf,
    generator: Option<String>,
    jobs: Option<usize>,
}

impl Default for CMakeBackend {
    fn default() -> Self {
        Self {
            program: PathBuf::from("cmake"),
            generator: None,
            jobs: None,
        }
    }
}

impl CMakeBackend {
    /// Use `cmake` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `cmake` executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Pass `-G <generator>` at configure time.
    #[must_use]
    pub fn with_generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = Some(generator.into());
        self
    }

    /// Limit build parallelism.
    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// The configure command line for an artifact set whose files were
    /// written to `artifact_dir`.
    fn configure_args(
        &self,
        artifacts: &GeneratedArtifactSet,
        artifact_dir: &Path,
        source_root: &Path,
        build_dir: &Path,
    ) -> Result<Vec<String>, BackendError> {
        let mut args = vec![
            "-S".to_string(),
            source_root.display().to_string(),
            "-B".to_string(),
            build_dir.display().to_string(),
        ];
        if let Some(generator) = &self.generator {
            args.push("-G".to_string());
            args.push(generator.clone());
        }
        if let Some(toolchain) = artifacts.of_kind(GeneratorKind::Toolchain) {
            args.push(format!(
                "-DCMAKE_TOOLCHAIN_FILE={}",
                artifact_dir.join(&toolchain.file_name).display()
            ));
        }
        if let Some(cache) = artifacts.of_kind(GeneratorKind::CacheVariables) {
            for (name, value) in parse_cache_variables(&cache.contents)? {
                args.push(format!("-D{name}={value}"));
            }
        }
        if let Some(paths) = artifacts.of_kind(GeneratorKind::FindPackage) {
            args.push(format!(
                "-DCMAKE_PROJECT_INCLUDE_BEFORE={}",
                artifact_dir.join(&paths.file_name).display()
            ));
        }
        Ok(args)
    }

    fn run(&self, step: &str, args: &[String], cancel: &CancellationToken) -> Result<(), BackendError> {
        debug!("Running {} {}", self.program.display(), args.join(" "));
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        // Drain both pipes so a chatty build cannot block on a full buffer
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status: ExitStatus = loop {
            match child.wait_timeout(POLL_INTERVAL) {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(reason) = cancel.reason() {
                        warn!("{} interrupted ({}), killing backend", step, reason);
                        let _ = child.kill();
                        let _ = child.wait();
                        let step = step.to_string();
                        return Err(match reason {
                            CancelReason::TimedOut => BackendError::TimedOut { step },
                            CancelReason::Cancelled => BackendError::Cancelled { step },
                        });
                    }
                }
                Err(source) => {
                    let _ = child.kill();
                    return Err(BackendError::Spawn {
                        program: self.program.display().to_string(),
                        source,
                    });
                }
            }
        };

        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
        for line in stdout.lines() {
            debug!("[{}] {}", step, line);
        }

        if status.success() {
            info!("{} finished", step);
            Ok(())
        } else {
            Err(BackendError::Failed {
                step: step.to_string(),
                status: status.code(),
                diagnostics: stderr,
            })
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

impl BuildBackend for CMakeBackend {
    fn configure(
        &self,
        artifacts: &GeneratedArtifactSet,
        source_root: &Path,
        build_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<BuildHandle, BackendError> {
        let artifact_dir = build_dir.join("kiln");
        artifacts.write_to(&artifact_dir)?;
        let args = self.configure_args(artifacts, &artifact_dir, source_root, build_dir)?;
        self.run("cmake configure", &args, cancel)?;

        let build_type = artifacts
            .of_kind(GeneratorKind::CacheVariables)
            .and_then(|cache| parse_cache_variables(&cache.contents).ok())
            .and_then(|vars| vars.get("CMAKE_BUILD_TYPE").map(ToString::to_string))
            .or_else(|| {
                artifacts
                    .of_kind(GeneratorKind::Toolchain)
                    .and_then(|t| build_type_from_toolchain(&t.contents))
            });

        Ok(BuildHandle {
            source_root: source_root.to_path_buf(),
            build_dir: build_dir.to_path_buf(),
            build_type,
        })
    }

    fn build(&self, handle: &BuildHandle, cancel: &CancellationToken) -> Result<(), BackendError> {
        let mut args = vec!["--build".to_string(), handle.build_dir.display().to_string()];
        if let Some(build_type) = &handle.build_type {
            args.push("--config".to_string());
            args.push(build_type.clone());
        }
        if let Some(jobs) = self.jobs {
            args.push("--parallel".to_string());
            args.push(jobs.to_string());
        }
        self.run("cmake build", &args, cancel)
    }

    fn install(
        &self,
        handle: &BuildHandle,
        install_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let mut args = vec![
            "--install".to_string(),
            handle.build_dir.display().to_string(),
            "--prefix".to_string(),
            install_root.display().to_string(),
        ];
        if let Some(build_type) = &handle.build_type {
            args.push("--config".to_string());
            args.push(build_type.clone());
        }
        self.run("cmake install", &args, cancel)
    }
}

/// Read `CMAKE_BUILD_TYPE` back out of a generated toolchain file.
fn build_type_from_toolchain(contents: &str) -> Option<String> {
    let prefix = "set(CMAKE_BUILD_TYPE \"";
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix(prefix)?;
        let value = rest.split('"').next()?;
        SettingsAxis::BuildType.normalize(value).ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::GeneratedArtifact;

    fn artifacts() -> GeneratedArtifactSet {
        let mut set = GeneratedArtifactSet::default();
        set.push(GeneratedArtifact {
            kind: GeneratorKind::Toolchain,
            file_name: "kiln_toolchain.cmake".to_string(),
            contents: "set(CMAKE_BUILD_TYPE \"Release\" CACHE STRING \"\" FORCE)\n".to_string(),
        });
        set.push(GeneratedArtifact {
            kind: GeneratorKind::CacheVariables,
            file_name: "kiln_cache.txt".to_string(),
            contents: "BUILD_tests=False\nCMAKE_PROJECT_2d_INCLUDE=/src/custom.cmake\n".to_string(),
        });
        set.push(GeneratedArtifact {
            kind: GeneratorKind::FindPackage,
            file_name: "kiln_paths.cmake".to_string(),
            contents: String::new(),
        });
        set
    }

    #[test]
    fn configure_command_line() {
        let backend = CMakeBackend::new().with_generator("Ninja");
        let args = backend
            .configure_args(
                &artifacts(),
                Path::new("/b/kiln"),
                Path::new("/src"),
                Path::new("/b"),
            )
            .unwrap();
        assert_eq!(&args[..6], ["-S", "/src", "-B", "/b", "-G", "Ninja"]);
        assert!(args.contains(&"-DCMAKE_TOOLCHAIN_FILE=/b/kiln/kiln_toolchain.cmake".to_string()));
        assert!(args.contains(&"-DBUILD_tests=False".to_string()));
        assert!(args.contains(&"-DCMAKE_PROJECT_2d_INCLUDE=/src/custom.cmake".to_string()));
        assert!(args.contains(&"-DCMAKE_PROJECT_INCLUDE_BEFORE=/b/kiln/kiln_paths.cmake".to_string()));
    }

    #[test]
    fn build_type_is_read_from_toolchain() {
        assert_eq!(
            build_type_from_toolchain(&artifacts().iter().next().unwrap().contents),
            Some("Release".to_string())
        );
        assert_eq!(build_type_from_toolchain("# nothing\n"), None);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let backend = CMakeBackend::new().with_program("/nonexistent/kiln-test-cmake");
        let err = backend
            .run("cmake configure", &[], &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn failure_carries_stderr_verbatim() {
        let backend = CMakeBackend::new().with_program("sh");
        let args = vec![
            "-c".to_string(),
            "echo 'CMake Error at CMakeLists.txt:3' >&2; exit 3".to_string(),
        ];
        match backend
            .run("cmake configure", &args, &CancellationToken::new())
            .unwrap_err()
        {
            BackendError::Failed {
                status,
                diagnostics,
                ..
            } => {
                assert_eq!(status, Some(3));
                assert_eq!(diagnostics, "CMake Error at CMakeLists.txt:3\n");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_backend() {
        let backend = CMakeBackend::new().with_program("sh");
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let token = CancellationToken::with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = backend.run("cmake build", &args, &token).unwrap_err();
        assert!(matches!(err, BackendError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
