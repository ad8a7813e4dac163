// Translation of a CommandConfiguration into a native process start descriptor

use spawnline_core::{
    CommandConfiguration, Credential, Result, SpawnlineError, TextEncoding,
};
use spawnline_parser::parse_argument_line;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command as StdCommand, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::child::RunningProcess;

/// Elevation verb for the current platform
pub const ELEVATION_VERB: &str = if cfg!(windows) { "runas" } else { "sudo" };

/// Streams the caller wants redirected regardless of the configured pipes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedirectRequest {
    pub force_output: bool,
    pub force_error: bool,
}

impl RedirectRequest {
    pub const NONE: RedirectRequest = RedirectRequest {
        force_output: false,
        force_error: false,
    };

    /// Buffered execution always captures both output streams.
    pub const BUFFERED: RedirectRequest = RedirectRequest {
        force_output: true,
        force_error: true,
    };
}

/// Everything needed to start one process, with no behavior attached
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessStartInfo {
    pub file_name: PathBuf,
    pub arguments: String,
    pub argv: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub inherit_environment: bool,
    pub use_shell_execute: bool,
    pub create_no_window: bool,
    pub redirect_standard_input: bool,
    pub redirect_standard_output: bool,
    pub redirect_standard_error: bool,
    pub standard_input_encoding: Option<TextEncoding>,
    pub standard_output_encoding: Option<TextEncoding>,
    pub standard_error_encoding: Option<TextEncoding>,
    pub verb: Option<&'static str>,
    pub credential: Option<Credential>,
}

pub struct ProcessCreator;

impl ProcessCreator {
    /// Map a configuration onto a start descriptor.
    ///
    /// `file_name` is the already resolved executable. Fails for shell
    /// execution combined with any redirected stream, including the streams
    /// `redirect` forces, and for a credential this platform cannot attach.
    pub fn describe(
        configuration: &CommandConfiguration,
        file_name: PathBuf,
        redirect: RedirectRequest,
    ) -> Result<ProcessStartInfo> {
        let argv = parse_argument_line(&configuration.arguments)?;

        if configuration.credential.is_some() && !cfg!(any(unix, windows)) {
            return Err(SpawnlineError::PlatformNotSupported(
                "running as another user is only available on Unix and Windows".to_string(),
            ));
        }

        let redirect_standard_input = configuration.standard_input.is_redirected();
        let redirect_standard_output =
            redirect.force_output || configuration.standard_output.is_redirected();
        let redirect_standard_error =
            redirect.force_error || configuration.standard_error.is_redirected();

        if configuration.use_shell_execution
            && (redirect_standard_input || redirect_standard_output || redirect_standard_error)
        {
            return Err(SpawnlineError::InvalidConfiguration(
                "shell execution cannot be combined with redirected streams".to_string(),
            ));
        }

        let environment = configuration
            .environment
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|v| (key.clone(), v.clone())))
            .collect();

        Ok(ProcessStartInfo {
            file_name,
            arguments: configuration.arguments.clone(),
            argv,
            working_directory: configuration.working_directory.clone(),
            environment,
            inherit_environment: configuration.inherit_environment,
            use_shell_execute: configuration.use_shell_execution,
            create_no_window: !configuration.create_window,
            redirect_standard_input,
            redirect_standard_output,
            redirect_standard_error,
            standard_input_encoding: redirect_standard_input
                .then_some(configuration.encodings.stdin),
            standard_output_encoding: redirect_standard_output
                .then_some(configuration.encodings.stdout),
            standard_error_encoding: redirect_standard_error
                .then_some(configuration.encodings.stderr),
            verb: configuration.requires_elevation.then_some(ELEVATION_VERB),
            credential: configuration.credential.clone(),
        })
    }

    /// Build the std command for a descriptor without starting it.
    ///
    /// On Windows a credential is not attached here; `spawn` starts such a
    /// descriptor through a logon instead.
    pub fn create(info: &ProcessStartInfo) -> Result<StdCommand> {
        let (program, args) = command_line_for(info);

        let mut command = StdCommand::new(program);
        command.args(args).current_dir(&info.working_directory);

        if !info.inherit_environment {
            command.env_clear();
        }
        command.envs(&info.environment);

        command.stdin(stdio_for(info.redirect_standard_input));
        command.stdout(stdio_for(info.redirect_standard_output));
        command.stderr(stdio_for(info.redirect_standard_error));

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            if info.create_no_window {
                command.creation_flags(windows_sys::Win32::System::Threading::CREATE_NO_WINDOW);
            }
        }

        if let Some(credential) = &info.credential {
            attach_credential(&mut command, credential)?;
        }

        Ok(command)
    }

    /// Start the process. Dropping the returned handle does not kill the child.
    pub fn spawn(info: &ProcessStartInfo) -> Result<RunningProcess> {
        #[cfg(windows)]
        {
            if let Some(credential) = &info.credential {
                let (program, args) = command_line_for(info);
                return crate::logon::spawn_with_logon(info, credential, program, args);
            }
        }

        let mut command = Command::from(Self::create(info)?);
        command.kill_on_drop(false);

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SpawnlineError::FileNotFound {
                    path: info.file_name.display().to_string(),
                }
            } else {
                SpawnlineError::ExecutionError(format!(
                    "Failed to start '{}': {}",
                    info.file_name.display(),
                    e
                ))
            }
        })?;
        Ok(RunningProcess::from_child(child))
    }
}

fn stdio_for(redirect: bool) -> Stdio {
    if redirect {
        Stdio::piped()
    } else {
        Stdio::inherit()
    }
}

/// Program and argv actually handed to the OS, after shell and elevation wrapping
fn command_line_for(info: &ProcessStartInfo) -> (OsString, Vec<OsString>) {
    let file_name = info.file_name.clone().into_os_string();

    let (program, args) = if info.use_shell_execute {
        shell_command_line(info)
    } else {
        (
            file_name,
            info.argv.iter().map(OsString::from).collect::<Vec<_>>(),
        )
    };

    match info.verb {
        Some("sudo") => {
            let mut elevated = vec![program];
            elevated.extend(args);
            (OsString::from("sudo"), elevated)
        }
        Some("runas") if info.use_shell_execute => runas_command_line(info),
        Some(verb) => {
            warn!(verb = %verb, "Elevation verb ignored without shell execution");
            (program, args)
        }
        None => (program, args),
    }
}

#[cfg(not(windows))]
fn shell_command_line(info: &ProcessStartInfo) -> (OsString, Vec<OsString>) {
    let quoted = format!("'{}'", info.file_name.display().to_string().replace('\'', "'\\''"));
    let script = if info.arguments.is_empty() {
        quoted
    } else {
        format!("{} {}", quoted, info.arguments)
    };
    (OsString::from("sh"), vec![OsString::from("-c"), OsString::from(script)])
}

#[cfg(windows)]
fn shell_command_line(info: &ProcessStartInfo) -> (OsString, Vec<OsString>) {
    let mut args = vec![OsString::from("/C"), info.file_name.clone().into_os_string()];
    args.extend(info.argv.iter().map(OsString::from));
    (OsString::from("cmd"), args)
}

fn runas_command_line(info: &ProcessStartInfo) -> (OsString, Vec<OsString>) {
    let mut script = format!(
        "$p = Start-Process -FilePath '{}' -Verb RunAs -Wait -PassThru",
        info.file_name.display().to_string().replace('\'', "''")
    );
    if !info.arguments.is_empty() {
        script.push_str(&format!(
            " -ArgumentList '{}'",
            info.arguments.replace('\'', "''")
        ));
    }
    script.push_str("; exit $p.ExitCode");
    (
        OsString::from("powershell"),
        vec![
            OsString::from("-NoProfile"),
            OsString::from("-Command"),
            OsString::from(script),
        ],
    )
}

#[cfg(unix)]
fn attach_credential(command: &mut StdCommand, credential: &Credential) -> Result<()> {
    use nix::unistd::User;
    use std::os::unix::process::CommandExt;

    let user = User::from_name(&credential.username)
        .map_err(|e| SpawnlineError::IoError(e.into()))?
        .ok_or_else(|| {
            SpawnlineError::InvalidConfiguration(format!(
                "unknown user '{}'",
                credential.username
            ))
        })?;

    debug!(user = %user.name, uid = user.uid.as_raw(), "Running child as another user");
    command.uid(user.uid.as_raw()).gid(user.gid.as_raw());

    if credential.load_user_profile {
        command
            .env("HOME", &user.dir)
            .env("USER", &user.name)
            .env("LOGNAME", &user.name)
            .env("SHELL", &user.shell);
    }

    Ok(())
}

#[cfg(windows)]
fn attach_credential(_command: &mut StdCommand, _credential: &Credential) -> Result<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn attach_credential(_command: &mut StdCommand, _credential: &Credential) -> Result<()> {
    Err(SpawnlineError::PlatformNotSupported(
        "running as another user is only available on Unix and Windows".to_string(),
    ))
}
