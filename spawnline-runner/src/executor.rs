use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spawnline_core::{
    BufferedExecutionResult, CancellationToken, CommandConfiguration, ExecutionResult, PipeSink,
    Result, ResultValidation, SpawnlineError, TextEncoding,
};
use std::ffi::OsString;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipes::{buffer_output, capture_output, pipe_input, pipe_output};
use crate::policy;
use crate::process::{ProcessCreator, RedirectRequest};
use crate::resolve::resolve_target;

/// Runs command configurations to completion
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run the command, streaming any redirected output to the configured sinks.
    async fn execute(
        &self,
        configuration: &CommandConfiguration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult>;

    /// Run the command and capture stdout and stderr as text.
    async fn execute_buffered(
        &self,
        configuration: &CommandConfiguration,
        cancel: &CancellationToken,
    ) -> Result<BufferedExecutionResult>;
}

/// Launches one child process per call.
///
/// Nothing is shared between calls, so concurrent executions are
/// independent. Cancelling the token abandons the wait but leaves the child
/// running.
#[derive(Debug, Clone, Default)]
pub struct CommandInvoker {
    search_path: Option<OsString>,
}

/// What happened to one output stream
enum Drained {
    Streamed,
    Captured(String),
}

struct Completion {
    exit_code: i32,
    start_time: DateTime<Utc>,
    exit_time: DateTime<Utc>,
    stdout: Option<String>,
    stderr: Option<String>,
}

impl CommandInvoker {
    pub fn new() -> Self {
        Self { search_path: None }
    }

    /// Search these directories instead of `PATH` when resolving bare names.
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    async fn run(
        &self,
        configuration: &CommandConfiguration,
        buffered: bool,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let execution_id = Uuid::new_v4();

        if configuration.target_path.trim().is_empty() {
            return Err(SpawnlineError::InvalidConfiguration(
                "target path must not be empty".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(SpawnlineError::Cancelled);
        }

        let file_name = resolve_target(
            &configuration.target_path,
            self.search_path.as_deref(),
            &configuration.working_directory,
        )?;
        policy::ensure_supported(&configuration.resource_policy)?;

        let redirect = if buffered {
            RedirectRequest::BUFFERED
        } else {
            RedirectRequest::NONE
        };
        let start_info = ProcessCreator::describe(configuration, file_name, redirect)?;

        let mut child = ProcessCreator::spawn(&start_info)?;
        let start_time = Utc::now();
        let pid = child.id();

        info!(
            execution_id = %execution_id,
            target = %start_info.file_name.display(),
            pid = ?pid,
            buffered = buffered,
            "Process started"
        );

        if let Some(pid) = pid {
            if let Err(e) = policy::apply(pid, &configuration.resource_policy) {
                warn!(
                    execution_id = %execution_id,
                    pid = pid,
                    error = %e,
                    "Resource policy could not be applied, terminating process"
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e);
            }
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let input = async {
            match (configuration.standard_input.as_redirect(), stdin) {
                (Some(source), Some(stdin)) => {
                    pipe_input(source, stdin, configuration.encodings.stdin, cancel).await?;
                }
                _ => {}
            }
            Ok::<(), SpawnlineError>(())
        };
        let output = drain(
            stdout,
            configuration.standard_output.as_redirect(),
            buffered.then_some(configuration.encodings.stdout),
            cancel,
        );
        let error = drain(
            stderr,
            configuration.standard_error.as_redirect(),
            buffered.then_some(configuration.encodings.stderr),
            cancel,
        );
        let wait = child.wait();

        // Output is drained while waiting; a child blocked on a full pipe would never exit.
        let work = async { tokio::try_join!(wait, input, output, error) };
        let (exit_code, (), stdout, stderr) = tokio::select! {
            result = work => result?,
            _ = cancel.cancelled() => {
                warn!(
                    execution_id = %execution_id,
                    pid = ?pid,
                    "Execution cancelled; the child process is left running"
                );
                return Err(SpawnlineError::Cancelled);
            }
        };

        let exit_time = Utc::now();

        info!(
            execution_id = %execution_id,
            pid = ?pid,
            exit_code = exit_code,
            "Process exited"
        );

        let stdout = captured(stdout);
        let stderr = captured(stderr);

        if configuration.result_validation == ResultValidation::ExitCodeZero && exit_code != 0 {
            if let Some(stderr) = stderr.as_deref().filter(|s| !s.trim().is_empty()) {
                warn!(
                    execution_id = %execution_id,
                    exit_code = exit_code,
                    stderr = %stderr.trim_end(),
                    "Command failed"
                );
            }
            return Err(SpawnlineError::CommandNotSuccessful {
                exit_code,
                target_path: configuration.target_path.clone(),
            });
        }

        Ok(Completion {
            exit_code,
            start_time,
            exit_time,
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl CommandExecutor for CommandInvoker {
    async fn execute(
        &self,
        configuration: &CommandConfiguration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let completion = self.run(configuration, false, cancel).await?;
        Ok(ExecutionResult {
            exit_code: completion.exit_code,
            start_time: completion.start_time,
            exit_time: completion.exit_time,
        })
    }

    async fn execute_buffered(
        &self,
        configuration: &CommandConfiguration,
        cancel: &CancellationToken,
    ) -> Result<BufferedExecutionResult> {
        let completion = self.run(configuration, true, cancel).await?;
        Ok(BufferedExecutionResult {
            exit_code: completion.exit_code,
            start_time: completion.start_time,
            exit_time: completion.exit_time,
            stdout: completion.stdout.unwrap_or_default(),
            stderr: completion.stderr.unwrap_or_default(),
        })
    }
}

/// Empty the child's output stream: capture it when `capture` names an
/// encoding, otherwise stream it into the sink.
async fn drain<R>(
    stream: Option<R>,
    sink: Option<&PipeSink>,
    capture: Option<TextEncoding>,
    cancel: &CancellationToken,
) -> Result<Drained>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return Ok(Drained::Streamed);
    };

    match (capture, sink) {
        (Some(encoding), None) => Ok(Drained::Captured(
            buffer_output(stream, encoding, cancel).await?,
        )),
        (Some(encoding), Some(sink)) => {
            let bytes = capture_output(stream, cancel).await?;
            pipe_output(&bytes[..], sink, cancel).await?;
            Ok(Drained::Captured(encoding.decode(&bytes)))
        }
        (None, Some(sink)) => {
            let copied = pipe_output(stream, sink, cancel).await?;
            debug!(bytes = copied, "Output piped to sink");
            Ok(Drained::Streamed)
        }
        (None, None) => {
            let mut stream = stream;
            tokio::io::copy(&mut stream, &mut tokio::io::sink()).await?;
            Ok(Drained::Streamed)
        }
    }
}

fn captured(drained: Drained) -> Option<String> {
    match drained {
        Drained::Captured(text) => Some(text),
        Drained::Streamed => None,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use spawnline_core::{
        wrap_for_intermediary, ConfigurationBuilder, PipeSource, PipeTarget, ResourcePolicy,
    };
    use std::path::Path;
    use std::time::Duration;

    fn shell(script: &str) -> CommandConfiguration {
        let inner = CommandConfiguration::new(script);
        let sh = CommandConfiguration::new("sh").with_arguments(["-c"], false);
        wrap_for_intermediary(&inner, &sh)
    }

    #[tokio::test]
    async fn test_buffered_echo() {
        let config = ConfigurationBuilder::new("echo")
            .with_arguments(["hello"], false)
            .build();

        let result = CommandInvoker::new()
            .execute_buffered(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert!(result.was_successful());
        assert!(result.exit_time >= result.start_time);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_validation() {
        let config = shell("exit 1");

        let err = CommandInvoker::new()
            .execute(&config, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            SpawnlineError::CommandNotSuccessful { exit_code, target_path } => {
                assert_eq!(exit_code, 1);
                assert_eq!(target_path, "sh");
            }
            other => panic!("expected CommandNotSuccessful, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_zero_exit_without_validation_returns_result() {
        let config = shell("exit 1").with_validation(ResultValidation::None);

        let result = CommandInvoker::new()
            .execute(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 1);
        assert!(!result.was_successful());
    }

    #[tokio::test]
    async fn test_buffered_captures_stderr_and_exit_code() {
        let config = shell("echo out; echo err >&2; exit 4").with_validation(ResultValidation::None);

        let result = CommandInvoker::new()
            .execute_buffered(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 4);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_missing_target_is_file_not_found() {
        let config = CommandConfiguration::new("spawnline-definitely-missing-binary");

        let err = CommandInvoker::new()
            .execute(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnlineError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_target_is_invalid() {
        let config = CommandConfiguration::new("  ");
        let err = CommandInvoker::new()
            .execute(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnlineError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_stdin_and_stdout_pipes() {
        let (sink, memory) = PipeSink::memory();
        let config = ConfigurationBuilder::new("cat")
            .with_standard_input_pipe(PipeSource::from_text("piped through cat\n"))
            .unwrap()
            .with_standard_output_pipe(sink)
            .unwrap()
            .build();

        let result = CommandInvoker::new()
            .execute(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(memory.to_string_lossy(), "piped through cat\n");
    }

    #[tokio::test]
    async fn test_buffered_output_is_also_copied_to_sink() {
        let (sink, memory) = PipeSink::memory();
        let config = ConfigurationBuilder::new("echo")
            .with_arguments(["tee"], false)
            .with_standard_output_pipe(sink)
            .unwrap()
            .build();

        let result = CommandInvoker::new()
            .execute_buffered(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stdout, "tee\n");
        assert_eq!(memory.to_string_lossy(), "tee\n");
    }

    #[tokio::test]
    async fn test_large_output_does_not_deadlock() {
        let (sink, memory) = PipeSink::memory();
        let config = shell("head -c 1048576 /dev/zero")
            .with_standard_output_pipe(PipeTarget::Redirect(sink))
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(30),
            CommandInvoker::new().execute(&config, &CancellationToken::new()),
        )
        .await
        .expect("execution deadlocked")
        .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(memory.len(), 1_048_576);
    }

    #[tokio::test]
    async fn test_environment_overlay_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell("printf '%s:' \"$SPAWNLINE_TEST\"; pwd")
            .with_environment([("SPAWNLINE_TEST", "overlay")])
            .with_working_directory(dir.path());

        let result = CommandInvoker::new()
            .execute_buffered(&config, &CancellationToken::new())
            .await
            .unwrap();

        let (value, cwd) = result.stdout.trim_end().split_once(':').unwrap();
        assert_eq!(value, "overlay");
        assert_eq!(
            Path::new(cwd).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_shell_execution_runs_through_interpreter() {
        let config = CommandConfiguration::new("echo")
            .with_arguments_line("hi && exit 3")
            .with_shell_execution(true)
            .unwrap()
            .with_validation(ResultValidation::None);

        let result = CommandInvoker::new()
            .execute(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_unescaped_arguments_reach_the_child() {
        let config = ConfigurationBuilder::new("echo")
            .with_arguments(["a\\.b", "5\"", "C:\\Users\\x"], false)
            .build();

        let result = CommandInvoker::new()
            .execute_buffered(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stdout, "a\\.b 5\" C:\\Users\\x\n");
    }

    #[tokio::test]
    async fn test_buffered_shell_execution_is_rejected() {
        let config = CommandConfiguration::new("echo")
            .with_arguments_line("hi")
            .with_shell_execution(true)
            .unwrap();

        let err = CommandInvoker::new()
            .execute_buffered(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnlineError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_wait() {
        let config = CommandConfiguration::new("sleep").with_arguments(["3"], false);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = CommandInvoker::new()
            .execute(&config, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SpawnlineError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_already_cancelled_token_starts_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = CommandInvoker::new()
            .execute(&CommandConfiguration::new("true"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnlineError::Cancelled));
    }

    #[tokio::test]
    async fn test_concurrent_executions_are_independent() {
        let invoker = CommandInvoker::new();
        let cancel = CancellationToken::new();
        let first = shell("echo first");
        let second = shell("echo second");

        let (a, b) = tokio::join!(
            invoker.execute_buffered(&first, &cancel),
            invoker.execute_buffered(&second, &cancel)
        );
        assert_eq!(a.unwrap().stdout, "first\n");
        assert_eq!(b.unwrap().stdout, "second\n");
    }

    #[tokio::test]
    async fn test_custom_search_path() {
        let bin = tempfile::tempdir().unwrap();
        let script = bin.path().join("spawnline-hello");
        std::fs::write(&script, "#!/bin/sh\necho from-search-path\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let result = CommandInvoker::new()
            .with_search_path(bin.path().as_os_str())
            .execute_buffered(
                &CommandConfiguration::new("spawnline-hello"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout, "from-search-path\n");
    }

    #[tokio::test]
    async fn test_unsupported_policy_fails_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started");
        let config = shell(&format!("touch '{}'", marker.display()))
            .with_process_resource_policy(ResourcePolicy {
                priority_boost: Some(true),
                ..ResourcePolicy::default()
            });

        let err = CommandInvoker::new()
            .execute(&config, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SpawnlineError::PlatformNotSupported(_)));
        assert!(!marker.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_process_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let config = shell(&format!("echo $$ > '{}'; exit 2", pid_file.display()));

        let err = CommandInvoker::new()
            .execute(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnlineError::CommandNotSuccessful { exit_code: 2, .. }));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let proc_entry = format!("/proc/{}", pid.trim());
        assert!(!Path::new(&proc_entry).exists());
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let config = shell("kill -9 $$").with_validation(ResultValidation::None);
        let result = CommandInvoker::new()
            .execute(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 128 + 9);
    }
}
