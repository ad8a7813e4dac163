use std::path::PathBuf;

use crate::error::{Result, SpawnlineError};
use crate::escape::{escape_argument, join_arguments};
use crate::models::{
    CommandConfiguration, Credential, ResourcePolicy, ResultValidation, StreamEncodings,
    TextEncoding,
};
use crate::streams::{InputPipe, OutputPipe};

const SHELL_REDIRECT_CONFLICT: &str =
    "shell execution cannot be combined with standard stream redirection";

// Copy-on-write setters: each one clones the receiver and changes one field.
impl CommandConfiguration {
    pub fn with_target_path(&self, target_path: impl Into<String>) -> Self {
        Self {
            target_path: target_path.into(),
            ..self.clone()
        }
    }

    pub fn with_arguments<I, S>(&self, arguments: I, escape: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.with_arguments_line(join_arguments(arguments, escape))
    }

    pub fn with_arguments_line(&self, arguments: impl Into<String>) -> Self {
        Self {
            arguments: arguments.into(),
            ..self.clone()
        }
    }

    pub fn with_working_directory(&self, directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: directory.into(),
            ..self.clone()
        }
    }

    /// Replace the environment overlay with the given variables.
    pub fn with_environment<I, K, V>(&self, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            environment: variables
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
            ..self.clone()
        }
    }

    /// Add or replace a single overlay entry. A `None` value is skipped at spawn time.
    pub fn with_environment_variable(
        &self,
        key: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        let mut environment = self.environment.clone();
        environment.insert(key.into(), value);
        Self {
            environment,
            ..self.clone()
        }
    }

    pub fn with_inherit_environment(&self, inherit: bool) -> Self {
        Self {
            inherit_environment: inherit,
            ..self.clone()
        }
    }

    pub fn with_user_credential(&self, credential: Option<Credential>) -> Self {
        Self {
            credential,
            ..self.clone()
        }
    }

    pub fn with_validation(&self, validation: ResultValidation) -> Self {
        Self {
            result_validation: validation,
            ..self.clone()
        }
    }

    pub fn with_encoding(&self, encodings: StreamEncodings) -> Self {
        Self {
            encodings,
            ..self.clone()
        }
    }

    pub fn with_standard_input_encoding(&self, encoding: TextEncoding) -> Self {
        self.with_encoding(StreamEncodings {
            stdin: encoding,
            ..self.encodings
        })
    }

    pub fn with_standard_output_encoding(&self, encoding: TextEncoding) -> Self {
        self.with_encoding(StreamEncodings {
            stdout: encoding,
            ..self.encodings
        })
    }

    pub fn with_standard_error_encoding(&self, encoding: TextEncoding) -> Self {
        self.with_encoding(StreamEncodings {
            stderr: encoding,
            ..self.encodings
        })
    }

    pub fn with_process_resource_policy(&self, policy: ResourcePolicy) -> Self {
        Self {
            resource_policy: policy,
            ..self.clone()
        }
    }

    pub fn with_standard_input_pipe(&self, pipe: InputPipe) -> Result<Self> {
        self.ensure_pipe_allowed(pipe.is_redirected())?;
        Ok(Self {
            standard_input: pipe,
            ..self.clone()
        })
    }

    pub fn with_standard_output_pipe(&self, pipe: OutputPipe) -> Result<Self> {
        self.ensure_pipe_allowed(pipe.is_redirected())?;
        Ok(Self {
            standard_output: pipe,
            ..self.clone()
        })
    }

    pub fn with_standard_error_pipe(&self, pipe: OutputPipe) -> Result<Self> {
        self.ensure_pipe_allowed(pipe.is_redirected())?;
        Ok(Self {
            standard_error: pipe,
            ..self.clone()
        })
    }

    pub fn with_shell_execution(&self, use_shell_execution: bool) -> Result<Self> {
        if use_shell_execution && self.has_redirection() {
            return Err(SpawnlineError::InvalidConfiguration(
                SHELL_REDIRECT_CONFLICT.to_string(),
            ));
        }
        Ok(Self {
            use_shell_execution,
            ..self.clone()
        })
    }

    pub fn with_window_creation(&self, create_window: bool) -> Self {
        Self {
            create_window,
            ..self.clone()
        }
    }

    pub fn with_elevation(&self, requires_elevation: bool) -> Self {
        Self {
            requires_elevation,
            ..self.clone()
        }
    }

    fn ensure_pipe_allowed(&self, redirects: bool) -> Result<()> {
        if redirects && self.use_shell_execution {
            return Err(SpawnlineError::InvalidConfiguration(
                SHELL_REDIRECT_CONFLICT.to_string(),
            ));
        }
        Ok(())
    }
}

/// Fluent front end over the copy-on-write setters.
///
/// `build` hands out an independent clone, so later calls on the builder
/// never reach a configuration that was already returned.
#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    current: CommandConfiguration,
}

impl ConfigurationBuilder {
    pub fn new(target_path: impl Into<String>) -> Self {
        Self {
            current: CommandConfiguration::new(target_path),
        }
    }

    pub fn from_configuration(configuration: CommandConfiguration) -> Self {
        Self {
            current: configuration,
        }
    }

    pub fn with_target_path(mut self, target_path: impl Into<String>) -> Self {
        self.current = self.current.with_target_path(target_path);
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I, escape: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.current = self.current.with_arguments(arguments, escape);
        self
    }

    pub fn with_arguments_line(mut self, arguments: impl Into<String>) -> Self {
        self.current = self.current.with_arguments_line(arguments);
        self
    }

    pub fn with_working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.current = self.current.with_working_directory(directory);
        self
    }

    pub fn with_environment<I, K, V>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.current = self.current.with_environment(variables);
        self
    }

    pub fn with_environment_variable(
        mut self,
        key: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        self.current = self.current.with_environment_variable(key, value);
        self
    }

    pub fn with_inherit_environment(mut self, inherit: bool) -> Self {
        self.current = self.current.with_inherit_environment(inherit);
        self
    }

    pub fn with_user_credential(mut self, credential: Option<Credential>) -> Self {
        self.current = self.current.with_user_credential(credential);
        self
    }

    pub fn with_validation(mut self, validation: ResultValidation) -> Self {
        self.current = self.current.with_validation(validation);
        self
    }

    pub fn with_encoding(mut self, encodings: StreamEncodings) -> Self {
        self.current = self.current.with_encoding(encodings);
        self
    }

    pub fn with_standard_input_encoding(mut self, encoding: TextEncoding) -> Self {
        self.current = self.current.with_standard_input_encoding(encoding);
        self
    }

    pub fn with_standard_output_encoding(mut self, encoding: TextEncoding) -> Self {
        self.current = self.current.with_standard_output_encoding(encoding);
        self
    }

    pub fn with_standard_error_encoding(mut self, encoding: TextEncoding) -> Self {
        self.current = self.current.with_standard_error_encoding(encoding);
        self
    }

    pub fn with_process_resource_policy(mut self, policy: ResourcePolicy) -> Self {
        self.current = self.current.with_process_resource_policy(policy);
        self
    }

    /// Accepts a bare source or an [`InputPipe`]; `InputPipe::NoRedirect`
    /// clears an earlier redirection.
    pub fn with_standard_input_pipe(mut self, pipe: impl Into<InputPipe>) -> Result<Self> {
        self.current = self.current.with_standard_input_pipe(pipe.into())?;
        Ok(self)
    }

    pub fn with_standard_output_pipe(mut self, pipe: impl Into<OutputPipe>) -> Result<Self> {
        self.current = self.current.with_standard_output_pipe(pipe.into())?;
        Ok(self)
    }

    pub fn with_standard_error_pipe(mut self, pipe: impl Into<OutputPipe>) -> Result<Self> {
        self.current = self.current.with_standard_error_pipe(pipe.into())?;
        Ok(self)
    }

    pub fn with_shell_execution(mut self, use_shell_execution: bool) -> Result<Self> {
        self.current = self.current.with_shell_execution(use_shell_execution)?;
        Ok(self)
    }

    pub fn with_window_creation(mut self, create_window: bool) -> Self {
        self.current = self.current.with_window_creation(create_window);
        self
    }

    pub fn with_elevation(mut self, requires_elevation: bool) -> Self {
        self.current = self.current.with_elevation(requires_elevation);
        self
    }

    pub fn build(&self) -> CommandConfiguration {
        self.current.clone()
    }
}

/// Run `inner` through an intermediary such as a shell.
///
/// The result is `shell` with one extra quoted argument holding the inner
/// command line; every other setting is taken from `shell`.
pub fn wrap_for_intermediary(
    inner: &CommandConfiguration,
    shell: &CommandConfiguration,
) -> CommandConfiguration {
    let wrapped = format!("\"{}\"", escape_argument(&inner.command_line()));
    let arguments = if shell.arguments.is_empty() {
        wrapped
    } else {
        format!("{} {}", shell.arguments, wrapped)
    };
    shell.with_arguments_line(arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PriorityClass, Secret};
    use crate::streams::{PipeSink, PipeSource, PipeTarget};

    #[test]
    fn test_with_call_leaves_original_untouched() {
        let original = CommandConfiguration::new("git");
        let changed = original.with_arguments(["status", "--short"], false);

        assert_eq!(original.arguments, "");
        assert_eq!(changed.arguments, "status --short");
        assert_eq!(
            changed,
            CommandConfiguration {
                arguments: "status --short".to_string(),
                ..original.clone()
            }
        );
    }

    #[test]
    fn test_every_setter_changes_only_its_field() {
        let base = CommandConfiguration::new("tool");
        let policy = ResourcePolicy {
            priority_class: Some(PriorityClass::BelowNormal),
            ..ResourcePolicy::default()
        };
        let credential = Credential::new("svc", Secret::new("pw"));

        let cases = vec![
            (
                base.with_working_directory("/tmp"),
                CommandConfiguration { working_directory: "/tmp".into(), ..base.clone() },
            ),
            (
                base.with_validation(ResultValidation::None),
                CommandConfiguration { result_validation: ResultValidation::None, ..base.clone() },
            ),
            (
                base.with_process_resource_policy(policy),
                CommandConfiguration { resource_policy: policy, ..base.clone() },
            ),
            (
                base.with_user_credential(Some(credential.clone())),
                CommandConfiguration { credential: Some(credential), ..base.clone() },
            ),
            (
                base.with_window_creation(true),
                CommandConfiguration { create_window: true, ..base.clone() },
            ),
            (
                base.with_elevation(true),
                CommandConfiguration { requires_elevation: true, ..base.clone() },
            ),
            (
                base.with_standard_error_encoding(TextEncoding::Latin1),
                CommandConfiguration {
                    encodings: StreamEncodings { stderr: TextEncoding::Latin1, ..Default::default() },
                    ..base.clone()
                },
            ),
        ];

        for (actual, expected) in cases {
            assert_eq!(actual, expected);
        }
        assert_eq!(base, CommandConfiguration::new("tool"));
    }

    #[test]
    fn test_environment_variable_overlay() {
        let config = CommandConfiguration::new("env")
            .with_environment([("A", "1")])
            .with_environment_variable("B", None);
        assert_eq!(config.environment.get("A"), Some(&Some("1".to_string())));
        assert_eq!(config.environment.get("B"), Some(&None));
    }

    #[test]
    fn test_shell_then_pipe_fails() {
        let (sink, _) = PipeSink::memory();
        let config = CommandConfiguration::new("open")
            .with_shell_execution(true)
            .unwrap();

        let err = config
            .with_standard_output_pipe(PipeTarget::Redirect(sink))
            .unwrap_err();
        assert!(matches!(err, SpawnlineError::InvalidConfiguration(_)));
        assert!(matches!(
            config.with_standard_input_pipe(PipeTarget::Redirect(PipeSource::from_text("x"))),
            Err(SpawnlineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_pipe_then_shell_fails() {
        let (sink, _) = PipeSink::memory();
        let result = ConfigurationBuilder::new("open")
            .with_standard_error_pipe(sink)
            .unwrap()
            .with_shell_execution(true);
        assert!(matches!(result, Err(SpawnlineError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_shell_with_no_redirect_pipe_is_allowed() {
        let config = CommandConfiguration::new("open")
            .with_shell_execution(true)
            .unwrap()
            .with_standard_output_pipe(PipeTarget::NoRedirect)
            .unwrap();
        assert!(config.use_shell_execution);
        assert!(!config.has_redirection());
    }

    #[test]
    fn test_builder_can_clear_redirection_before_shell() {
        let (sink, _) = PipeSink::memory();
        let config = ConfigurationBuilder::new("open")
            .with_standard_input_pipe(PipeSource::from_text("x"))
            .unwrap()
            .with_standard_output_pipe(sink)
            .unwrap()
            .with_standard_input_pipe(InputPipe::NoRedirect)
            .unwrap()
            .with_standard_output_pipe(OutputPipe::NoRedirect)
            .unwrap()
            .with_shell_execution(true)
            .unwrap()
            .build();

        assert!(config.use_shell_execution);
        assert!(!config.has_redirection());
    }

    #[test]
    fn test_builder_per_stream_encodings() {
        let config = ConfigurationBuilder::new("iconv")
            .with_standard_input_encoding(TextEncoding::Latin1)
            .with_standard_error_encoding(TextEncoding::Utf16Le)
            .build();

        assert_eq!(config.encodings.stdin, TextEncoding::Latin1);
        assert_eq!(config.encodings.stdout, StreamEncodings::default().stdout);
        assert_eq!(config.encodings.stderr, TextEncoding::Utf16Le);
    }

    #[test]
    fn test_build_is_not_affected_by_later_calls() {
        let builder = ConfigurationBuilder::new("echo").with_arguments(["one"], false);
        let first = builder.build();
        let second = builder.with_arguments(["two"], false).build();

        assert_eq!(first.arguments, "one");
        assert_eq!(second.arguments, "two");
    }

    #[test]
    fn test_wrap_for_intermediary() {
        let inner = CommandConfiguration::new("echo").with_arguments(["say \"hi\""], false);
        let shell = CommandConfiguration::new("sh")
            .with_arguments(["-c"], false)
            .with_working_directory("/srv");

        let wrapped = wrap_for_intermediary(&inner, &shell);
        assert_eq!(wrapped.target_path, "sh");
        assert_eq!(wrapped.arguments, "-c \"echo say \\\"hi\\\"\"");
        assert_eq!(wrapped.working_directory, PathBuf::from("/srv"));
    }
}
