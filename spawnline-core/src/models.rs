use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{compiler_fence, Ordering};
use std::sync::Arc;

use crate::error::SpawnlineError;
use crate::streams::{InputPipe, OutputPipe, PipeTarget};

/// Whether a non-zero exit code is reported as a failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultValidation {
    None,
    #[default]
    ExitCodeZero,
}

/// Text codec used for one standard stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(try_from = "String", into = "String")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
    Latin1,
}

impl TextEncoding {
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            TextEncoding::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    /// Decodes lossily; malformed input becomes U+FFFD.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Utf16Le => decode_utf16(bytes, u16::from_le_bytes),
            TextEncoding::Utf16Be => decode_utf16(bytes, u16::from_be_bytes),
            TextEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes
        .chunks(2)
        .map(|pair| match pair {
            [a, b] => unit([*a, *b]),
            _ => 0xFFFD,
        })
        .collect();
    String::from_utf16_lossy(&units)
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Utf16Be => "utf-16be",
            TextEncoding::Latin1 => "latin1",
        };
        f.write_str(name)
    }
}

impl FromStr for TextEncoding {
    type Err = SpawnlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "utf-16le" | "utf16le" | "utf-16" => Ok(TextEncoding::Utf16Le),
            "utf-16be" | "utf16be" => Ok(TextEncoding::Utf16Be),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            other => Err(SpawnlineError::InvalidConfiguration(format!(
                "unknown text encoding '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for TextEncoding {
    type Error = SpawnlineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TextEncoding> for String {
    fn from(encoding: TextEncoding) -> Self {
        encoding.to_string()
    }
}

/// Per-stream encodings; only applied to streams that are redirected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StreamEncodings {
    #[serde(default)]
    pub stdin: TextEncoding,
    #[serde(default)]
    pub stdout: TextEncoding,
    #[serde(default)]
    pub stderr: TextEncoding,
}

/// Scheduling priority class of the child process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    RealTime,
}

impl PriorityClass {
    /// POSIX nice value used for this class.
    pub fn nice_value(&self) -> i32 {
        match self {
            PriorityClass::Idle => 19,
            PriorityClass::BelowNormal => 10,
            PriorityClass::Normal => 0,
            PriorityClass::AboveNormal => -6,
            PriorityClass::High => -11,
            PriorityClass::RealTime => -19,
        }
    }
}

impl FromStr for PriorityClass {
    type Err = SpawnlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "idle" => Ok(PriorityClass::Idle),
            "belownormal" => Ok(PriorityClass::BelowNormal),
            "normal" => Ok(PriorityClass::Normal),
            "abovenormal" => Ok(PriorityClass::AboveNormal),
            "high" => Ok(PriorityClass::High),
            "realtime" => Ok(PriorityClass::RealTime),
            other => Err(SpawnlineError::InvalidConfiguration(format!(
                "unknown priority class '{}'",
                other
            ))),
        }
    }
}

/// OS-level tunables applied after the process starts.
///
/// Unset fields leave the operating system default untouched, so a policy
/// naming only a priority class never resets the affinity mask.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourcePolicy {
    #[serde(default)]
    pub processor_affinity: Option<u64>,
    #[serde(default)]
    pub min_working_set: Option<usize>,
    #[serde(default)]
    pub max_working_set: Option<usize>,
    #[serde(default)]
    pub priority_class: Option<PriorityClass>,
    #[serde(default)]
    pub priority_boost: Option<bool>,
}

impl ResourcePolicy {
    pub fn is_default(&self) -> bool {
        *self == ResourcePolicy::default()
    }
}

struct SecretBytes(Vec<u8>);

impl Drop for SecretBytes {
    fn drop(&mut self) {
        for byte in self.0.iter_mut() {
            // SAFETY: `byte` is a valid, exclusive reference into the vector.
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
        compiler_fence(Ordering::SeqCst);
    }
}

/// Password held by shared reference; zeroed when the last clone is dropped.
#[derive(Clone)]
pub struct Secret(Arc<SecretBytes>);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Secret(Arc::new(SecretBytes(secret.into().into_bytes())))
    }

    pub fn expose(&self) -> &[u8] {
        &self.0 .0
    }

    pub fn is_empty(&self) -> bool {
        self.0 .0.is_empty()
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for Secret {}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Account the child process should run as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub domain: Option<String>,
    pub username: String,
    pub secret: Secret,
    pub load_user_profile: bool,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: Secret) -> Self {
        Self {
            domain: None,
            username: username.into(),
            secret,
            load_user_profile: false,
        }
    }
}

/// Immutable description of one process invocation.
///
/// Built through the `with_*` methods (see `builder.rs`), each of which
/// returns a fresh value and leaves the receiver untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandConfiguration {
    pub target_path: String,
    pub arguments: String,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, Option<String>>,
    pub inherit_environment: bool,
    pub credential: Option<Credential>,
    pub result_validation: ResultValidation,
    pub standard_input: InputPipe,
    pub standard_output: OutputPipe,
    pub standard_error: OutputPipe,
    pub encodings: StreamEncodings,
    pub resource_policy: ResourcePolicy,
    pub use_shell_execution: bool,
    pub create_window: bool,
    pub requires_elevation: bool,
}

impl CommandConfiguration {
    pub fn new(target_path: impl Into<String>) -> Self {
        Self {
            target_path: target_path.into(),
            arguments: String::new(),
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            environment: BTreeMap::new(),
            inherit_environment: true,
            credential: None,
            result_validation: ResultValidation::default(),
            standard_input: PipeTarget::NoRedirect,
            standard_output: PipeTarget::NoRedirect,
            standard_error: PipeTarget::NoRedirect,
            encodings: StreamEncodings::default(),
            resource_policy: ResourcePolicy::default(),
            use_shell_execution: false,
            create_window: false,
            requires_elevation: false,
        }
    }

    pub fn has_redirection(&self) -> bool {
        self.standard_input.is_redirected()
            || self.standard_output.is_redirected()
            || self.standard_error.is_redirected()
    }

    /// Target and argument line as a single display string.
    pub fn command_line(&self) -> String {
        if self.arguments.is_empty() {
            self.target_path.clone()
        } else {
            format!("{} {}", self.target_path, self.arguments)
        }
    }
}

/// Outcome of a streamed execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub start_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
}

impl ExecutionResult {
    /// True for exit code 0, independent of the configured validation.
    pub fn was_successful(&self) -> bool {
        self.exit_code == 0
    }

    pub fn run_time(&self) -> Duration {
        self.exit_time.signed_duration_since(self.start_time)
    }
}

/// Outcome of a buffered execution, including captured output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BufferedExecutionResult {
    pub exit_code: i32,
    pub start_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub stdout: String,
    pub stderr: String,
}

impl BufferedExecutionResult {
    pub fn was_successful(&self) -> bool {
        self.exit_code == 0
    }

    pub fn run_time(&self) -> Duration {
        self.exit_time.signed_duration_since(self.start_time)
    }
}

impl From<BufferedExecutionResult> for ExecutionResult {
    fn from(result: BufferedExecutionResult) -> Self {
        Self {
            exit_code: result.exit_code,
            start_time: result.start_time,
            exit_time: result.exit_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_invariants() {
        let config = CommandConfiguration::new("echo");
        assert_eq!(config.target_path, "echo");
        assert_eq!(config.arguments, "");
        assert_eq!(config.working_directory, std::env::current_dir().unwrap());
        assert!(config.environment.is_empty());
        assert!(config.credential.is_none());
        assert_eq!(config.result_validation, ResultValidation::ExitCodeZero);
        assert!(config.resource_policy.is_default());
        assert!(!config.create_window);
        assert!(!config.use_shell_execution);
        assert!(!config.requires_elevation);
        assert!(!config.has_redirection());
    }

    #[test]
    fn test_was_successful_ignores_validation_mode() {
        let now = Utc::now();
        let ok = ExecutionResult { exit_code: 0, start_time: now, exit_time: now };
        let failed = ExecutionResult { exit_code: 1, start_time: now, exit_time: now };
        assert!(ok.was_successful());
        assert!(!failed.was_successful());
    }

    #[test]
    fn test_utf16_round_trip() {
        let text = "héllo ✓";
        for encoding in [TextEncoding::Utf16Le, TextEncoding::Utf16Be, TextEncoding::Utf8] {
            let bytes = encoding.encode(text);
            assert_eq!(encoding.decode(&bytes), text);
        }
    }

    #[test]
    fn test_latin1_replaces_unrepresentable() {
        assert_eq!(TextEncoding::Latin1.encode("aé✓"), vec![b'a', 0xE9, b'?']);
        assert_eq!(TextEncoding::Latin1.decode(&[b'a', 0xE9]), "aé");
    }

    #[test]
    fn test_odd_utf16_input_is_lossy_not_fatal() {
        let decoded = TextEncoding::Utf16Le.decode(&[b'a', 0, b'b']);
        assert!(decoded.starts_with('a'));
        assert!(decoded.ends_with('\u{FFFD}'));
    }

    #[test]
    fn test_encoding_names_parse() {
        assert_eq!("UTF-8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("iso-8859-1".parse::<TextEncoding>().unwrap(), TextEncoding::Latin1);
        assert!("ebcdic".parse::<TextEncoding>().is_err());
    }

    #[test]
    fn test_priority_class_parse() {
        assert_eq!("below_normal".parse::<PriorityClass>().unwrap(), PriorityClass::BelowNormal);
        assert_eq!("RealTime".parse::<PriorityClass>().unwrap(), PriorityClass::RealTime);
        assert!("urgent".parse::<PriorityClass>().is_err());
    }

    #[test]
    fn test_partial_policy_is_not_default() {
        let policy = ResourcePolicy {
            priority_class: Some(PriorityClass::Idle),
            ..ResourcePolicy::default()
        };
        assert!(!policy.is_default());
        assert!(policy.processor_affinity.is_none());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let credential = Credential::new("svc", Secret::new("hunter2"));
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("hunter2"));
        assert_eq!(credential.secret.expose(), b"hunter2");
    }

    #[test]
    fn test_result_serializes_to_json() {
        let now = Utc::now();
        let result = BufferedExecutionResult {
            exit_code: 0,
            start_time: now,
            exit_time: now,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["stdout"], "hi\n");
    }
}
