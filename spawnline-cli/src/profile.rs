use anyhow::{anyhow, Context};
use serde::Deserialize;
use spawnline_core::{
    escape_argument, ConfigurationBuilder, Credential, ResourcePolicy, ResultValidation, Secret,
    StreamEncodings,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A saved invocation, loaded from a TOML file
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CommandProfile {
    pub target: Option<String>,
    pub args: Vec<String>,
    pub escape: bool,
    pub working_directory: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub inherit_env: Option<bool>,
    pub validation: Option<ResultValidation>,
    pub shell: bool,
    pub create_window: bool,
    pub elevate: bool,
    pub encodings: Option<StreamEncodings>,
    pub policy: Option<ResourcePolicy>,
    pub run_as: Option<RunAsProfile>,
}

/// Account section of a profile. The password is never stored in the file,
/// only the name of the environment variable holding it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunAsProfile {
    pub username: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub load_user_profile: bool,
}

impl CommandProfile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile at {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse profile at {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Turn the profile into a builder. `target` replaces the profile's own
    /// target when given.
    pub fn to_builder(&self, target: Option<&str>) -> anyhow::Result<ConfigurationBuilder> {
        let target = target
            .or(self.target.as_deref())
            .ok_or_else(|| anyhow!("No target given on the command line or in the profile"))?;

        let mut builder = ConfigurationBuilder::new(target)
            .with_arguments_line(argument_line(&self.args, self.escape))
            .with_environment(&self.env)
            .with_window_creation(self.create_window)
            .with_elevation(self.elevate);

        if let Some(dir) = &self.working_directory {
            builder = builder.with_working_directory(dir);
        }
        if let Some(inherit) = self.inherit_env {
            builder = builder.with_inherit_environment(inherit);
        }
        if let Some(validation) = self.validation {
            builder = builder.with_validation(validation);
        }
        if let Some(encodings) = self.encodings {
            builder = builder.with_encoding(encodings);
        }
        if let Some(policy) = self.policy {
            builder = builder.with_process_resource_policy(policy);
        }
        if let Some(run_as) = &self.run_as {
            builder = builder.with_user_credential(Some(run_as.credential()?));
        }
        if self.shell {
            builder = builder.with_shell_execution(true)?;
        }

        Ok(builder)
    }
}

/// Join command-line tokens into one argument line.
///
/// Tokens containing blanks (or empty ones) are escaped and quoted so they
/// come back as a single argument; the rest are escaped only when asked.
pub fn argument_line<S: AsRef<str>>(tokens: &[S], escape: bool) -> String {
    tokens
        .iter()
        .map(|token| {
            let token = token.as_ref();
            if token.is_empty() || token.contains([' ', '\t']) {
                format!("\"{}\"", escape_argument(token))
            } else if escape {
                escape_argument(token).into_owned()
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl RunAsProfile {
    fn credential(&self) -> anyhow::Result<Credential> {
        let secret = match &self.password_env {
            Some(var) => Secret::new(
                std::env::var(var)
                    .with_context(|| format!("Password variable {} is not set", var))?,
            ),
            None => Secret::new(""),
        };

        Ok(Credential {
            domain: self.domain.clone(),
            username: self.username.clone(),
            secret,
            load_user_profile: self.load_user_profile,
        })
    }
}
