// Starting a process under another Windows account with CreateProcessWithLogonW

/// Quote one argument the way the Microsoft C runtime splits command lines.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn quote_windows_argument(argument: &str) -> String {
    if !argument.is_empty() && !argument.contains([' ', '\t', '\n', '\x0B', '"']) {
        return argument.to_string();
    }

    let mut quoted = String::with_capacity(argument.len() + 2);
    quoted.push('"');
    let mut backslashes = 0usize;
    for c in argument.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            other => {
                quoted.extend(std::iter::repeat('\\').take(backslashes));
                quoted.push(other);
                backslashes = 0;
            }
        }
    }
    // Backslashes before the closing quote must not escape it.
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}

#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn windows_command_line(program: &str, arguments: &[String]) -> String {
    std::iter::once(program)
        .chain(arguments.iter().map(String::as_str))
        .map(quote_windows_argument)
        .collect::<Vec<_>>()
        .join(" ")
}

/// UTF-16 environment block: `KEY=VALUE` entries sorted case-insensitively,
/// each NUL-terminated, followed by a final NUL.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn environment_block<I>(variables: I) -> Vec<u16>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut entries: Vec<(String, String)> = Vec::new();
    for (key, value) in variables {
        // Windows variable names are case-insensitive; the last value wins.
        entries.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&key));
        entries.push((key, value));
    }
    entries.sort_by_key(|(key, _)| key.to_ascii_uppercase());

    let mut block: Vec<u16> = Vec::new();
    for (key, value) in &entries {
        block.extend(format!("{}={}", key, value).encode_utf16());
        block.push(0);
    }
    if entries.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

#[cfg(windows)]
mod platform {
    use super::{environment_block, windows_command_line};
    use crate::child::{ChildInput, ChildOutput, RunningProcess};
    use crate::process::ProcessStartInfo;
    use spawnline_core::{Credential, Result, SpawnlineError};
    use std::ffi::{OsStr, OsString};
    use std::os::windows::ffi::OsStrExt;
    use std::os::windows::io::FromRawHandle;
    use std::ptr;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::debug;
    use windows_sys::Win32::Foundation::{
        CloseHandle, SetHandleInformation, HANDLE, HANDLE_FLAG_INHERIT, WAIT_FAILED,
        WAIT_OBJECT_0,
    };
    use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
    use windows_sys::Win32::System::Console::{
        GetStdHandle, STD_ERROR_HANDLE, STD_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
    };
    use windows_sys::Win32::System::Pipes::CreatePipe;
    use windows_sys::Win32::System::Threading::{
        CreateProcessWithLogonW, GetExitCodeProcess, TerminateProcess, WaitForSingleObject,
        CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, LOGON_WITH_PROFILE, PROCESS_INFORMATION,
        STARTF_USESTDHANDLES, STARTUPINFOW,
    };

    const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

    struct OwnedHandle(HANDLE);

    // Process and pipe handles may be used from any thread.
    unsafe impl Send for OwnedHandle {}
    unsafe impl Sync for OwnedHandle {}

    impl OwnedHandle {
        /// Give up ownership without closing.
        fn into_raw(self) -> HANDLE {
            let raw = self.0;
            std::mem::forget(self);
            raw
        }
    }

    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    pub struct LogonProcess {
        handle: Arc<OwnedHandle>,
        pid: u32,
    }

    impl LogonProcess {
        pub fn id(&self) -> u32 {
            self.pid
        }

        pub async fn wait(&self) -> Result<i32> {
            loop {
                match unsafe { WaitForSingleObject(self.handle.0, 0) } {
                    WAIT_OBJECT_0 => break,
                    WAIT_FAILED => return Err(std::io::Error::last_os_error().into()),
                    _ => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                }
            }

            let mut code = 0u32;
            if unsafe { GetExitCodeProcess(self.handle.0, &mut code) } == 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(code as i32)
        }

        pub fn start_kill(&self) -> Result<()> {
            if unsafe { TerminateProcess(self.handle.0, 1) } == 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        }
    }

    /// One end of a child stream: the handle given to the child and, for a
    /// pipe, the end the parent keeps.
    struct StreamEnds {
        child: HANDLE,
        parent: Option<OwnedHandle>,
        // Keeps the child's pipe end open until the process has been created.
        _child_owned: Option<OwnedHandle>,
    }

    fn stream_ends(redirect: bool, std_handle: STD_HANDLE, child_reads: bool) -> Result<StreamEnds> {
        if !redirect {
            return Ok(StreamEnds {
                child: unsafe { GetStdHandle(std_handle) },
                parent: None,
                _child_owned: None,
            });
        }

        let attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: ptr::null_mut(),
            bInheritHandle: 1,
        };
        let (mut read, mut write): (HANDLE, HANDLE) = (ptr::null_mut(), ptr::null_mut());
        if unsafe { CreatePipe(&mut read, &mut write, &attributes, 0) } == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let (read, write) = (OwnedHandle(read), OwnedHandle(write));
        let (child, parent) = if child_reads { (read, write) } else { (write, read) };

        if unsafe { SetHandleInformation(parent.0, HANDLE_FLAG_INHERIT, 0) } == 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(StreamEnds {
            child: child.0,
            parent: Some(parent),
            _child_owned: Some(child),
        })
    }

    fn parent_file(handle: OwnedHandle) -> tokio::fs::File {
        let file = unsafe { std::fs::File::from_raw_handle(handle.into_raw() as _) };
        tokio::fs::File::from_std(file)
    }

    fn wide(value: &OsStr) -> Vec<u16> {
        value.encode_wide().chain(std::iter::once(0)).collect()
    }

    fn clear(buffer: &mut [u16]) {
        for unit in buffer.iter_mut() {
            unsafe { ptr::write_volatile(unit, 0) };
        }
    }

    pub fn spawn_with_logon(
        info: &ProcessStartInfo,
        credential: &Credential,
        program: OsString,
        arguments: Vec<OsString>,
    ) -> Result<RunningProcess> {
        let arguments: Vec<String> = arguments
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let mut command_line: Vec<u16> =
            wide(OsStr::new(&windows_command_line(&program.to_string_lossy(), &arguments)));

        let environment = if info.inherit_environment && info.environment.is_empty() {
            None
        } else {
            let inherited = info
                .inherit_environment
                .then(|| std::env::vars().collect::<Vec<_>>())
                .unwrap_or_default();
            let overlay = info.environment.iter().map(|(k, v)| (k.clone(), v.clone()));
            Some(environment_block(inherited.into_iter().chain(overlay)))
        };

        let username = wide(OsStr::new(&credential.username));
        let domain = credential.domain.as_deref().map(|d| wide(OsStr::new(d)));
        let mut password: Vec<u16> = String::from_utf8_lossy(credential.secret.expose())
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let directory = wide(info.working_directory.as_os_str());

        let stdin = stream_ends(info.redirect_standard_input, STD_INPUT_HANDLE, true)?;
        let stdout = stream_ends(info.redirect_standard_output, STD_OUTPUT_HANDLE, false)?;
        let stderr = stream_ends(info.redirect_standard_error, STD_ERROR_HANDLE, false)?;

        let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        startup.dwFlags = STARTF_USESTDHANDLES;
        startup.hStdInput = stdin.child;
        startup.hStdOutput = stdout.child;
        startup.hStdError = stderr.child;

        let mut creation_flags = CREATE_UNICODE_ENVIRONMENT;
        if info.create_no_window {
            creation_flags |= CREATE_NO_WINDOW;
        }
        let logon_flags = if credential.load_user_profile {
            LOGON_WITH_PROFILE
        } else {
            0
        };

        let mut process: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
        let created = unsafe {
            CreateProcessWithLogonW(
                username.as_ptr(),
                domain.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
                password.as_ptr(),
                logon_flags,
                ptr::null(),
                command_line.as_mut_ptr(),
                creation_flags,
                environment
                    .as_ref()
                    .map_or(ptr::null(), |block| block.as_ptr() as *const _),
                directory.as_ptr(),
                &startup,
                &mut process,
            )
        };
        let error = std::io::Error::last_os_error();
        clear(&mut password);

        if created == 0 {
            return Err(if error.kind() == std::io::ErrorKind::NotFound {
                SpawnlineError::FileNotFound {
                    path: info.file_name.display().to_string(),
                }
            } else {
                SpawnlineError::ExecutionError(format!(
                    "Failed to start '{}' as {}: {}",
                    info.file_name.display(),
                    credential.username,
                    error
                ))
            });
        }

        drop(OwnedHandle(process.hThread));
        debug!(
            user = %credential.username,
            pid = process.dwProcessId,
            "Started child under another account"
        );

        let logon = LogonProcess {
            handle: Arc::new(OwnedHandle(process.hProcess)),
            pid: process.dwProcessId,
        };
        Ok(RunningProcess::from_logon(
            logon,
            stdin.parent.map(|h| Box::new(parent_file(h)) as ChildInput),
            stdout.parent.map(|h| Box::new(parent_file(h)) as ChildOutput),
            stderr.parent.map(|h| Box::new(parent_file(h)) as ChildOutput),
        ))
    }
}

#[cfg(windows)]
pub(crate) use platform::{spawn_with_logon, LogonProcess};
