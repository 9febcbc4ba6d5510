//! Out-of-process plugin protocol.
//!
//! One call launches one fresh process. The request is a single JSON object
//! on stdin; the process must exit 0 and print exactly one JSON object on
//! stdout. Anything else (non-zero exit, timeout, garbage, an unsupported
//! schema version) is a hard invocation failure, never a silent success.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::Semaphore;
use tracing::debug;
use vouch_core::{
    is_supported_version, ArtifactReference, Error, InvocationFailure, PluginConfig,
    PluginRunnerConfig, Result, SUPPORTED_VERSIONS,
};

/// Environment variable carrying the command name.
pub const COMMAND_ENV: &str = "VOUCH_COMMAND";
/// Environment variable carrying the negotiated schema version.
pub const VERSION_ENV: &str = "VOUCH_VERSION";
/// Stdout beyond this is treated as malformed.
pub const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;
const MAX_STDERR_CHARS: usize = 2_000;
const MAX_STDERR_BYTES: u64 = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginCommand {
    ListReferrers,
    GetManifest,
    GetBlobContent,
    Verify,
    Evaluate,
}

impl PluginCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListReferrers => "listReferrers",
            Self::GetManifest => "getManifest",
            Self::GetBlobContent => "getBlobContent",
            Self::Verify => "verify",
            Self::Evaluate => "evaluate",
        }
    }
}

/// Reject names that could escape the plugin directories.
pub fn validate_plugin_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::factory(format!("invalid plugin name '{}'", name)));
    }
    if name.contains('/') || name.chars().any(std::path::is_separator) {
        return Err(Error::factory(format!(
            "invalid plugin name '{}': path separators are not allowed",
            name
        )));
    }
    Ok(())
}

/// A plugin executable found in one of the search directories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginBinary {
    pub name: String,
    pub path: PathBuf,
}

impl PluginBinary {
    /// First executable file named `name` across `dirs`, in order.
    pub fn locate(name: &str, dirs: &[PathBuf]) -> Result<Self> {
        validate_plugin_name(name)?;
        for dir in dirs {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Ok(Self {
                    name: name.to_string(),
                    path: candidate,
                });
            }
        }
        Err(Error::factory(format!(
            "plugin '{}' not found in [{}]",
            name,
            dirs.iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Shared limits for plugin processes: per-call timeout and a cap on
/// how many run at once. Clones share the same permit pool.
#[derive(Clone, Debug)]
pub struct PluginRunner {
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl Default for PluginRunner {
    fn default() -> Self {
        Self::new(&PluginRunnerConfig::default())
    }
}

impl PluginRunner {
    pub fn new(config: &PluginRunnerConfig) -> Self {
        Self {
            timeout: config.timeout(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_invocations.max(1))),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the binary once with `input` on stdin and return its stdout.
    /// Waiting for a permit counts against the timeout.
    async fn run(
        &self,
        binary: &PluginBinary,
        command: PluginCommand,
        version: &str,
        input: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, InvocationFailure> {
        match tokio::time::timeout(self.timeout, self.run_once(binary, command, version, input)).await {
            Ok(result) => result,
            Err(_) => Err(InvocationFailure::Timeout(self.timeout)),
        }
    }

    async fn run_once(
        &self,
        binary: &PluginBinary,
        command: PluginCommand,
        version: &str,
        input: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, InvocationFailure> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| InvocationFailure::Spawn(e.to_string()))?;

        let mut child = Command::new(&binary.path)
            .env(COMMAND_ENV, command.as_str())
            .env(VERSION_ENV, version)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvocationFailure::Spawn(e.to_string()))?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A plugin may exit without reading its input; its exit status decides.
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("plugin stdin closed early: {}", e);
                }
                let _ = stdin.shutdown().await;
            }
            Ok::<(), InvocationFailure>(())
        };

        // An oversized stdout returns early; dropping `child` kills it.
        let (_, stdout, stderr) = tokio::try_join!(
            feed,
            read_stdout(child.stdout.take()),
            read_stderr(child.stderr.take()),
        )?;
        let status = child
            .wait()
            .await
            .map_err(|e| InvocationFailure::Spawn(e.to_string()))?;

        if !status.success() {
            return Err(InvocationFailure::NonZeroExit {
                code: status.code(),
                stderr,
            });
        }
        Ok(stdout)
    }
}

/// Read stdout up to `MAX_OUTPUT_BYTES`, failing as soon as it runs past.
async fn read_stdout(
    stdout: Option<ChildStdout>,
) -> std::result::Result<Vec<u8>, InvocationFailure> {
    let mut out = Vec::new();
    if let Some(stdout) = stdout {
        stdout
            .take(MAX_OUTPUT_BYTES as u64 + 1)
            .read_to_end(&mut out)
            .await
            .map_err(|e| InvocationFailure::Spawn(e.to_string()))?;
    }
    if out.len() > MAX_OUTPUT_BYTES {
        return Err(InvocationFailure::MalformedOutput(format!(
            "output exceeds {} bytes",
            MAX_OUTPUT_BYTES
        )));
    }
    Ok(out)
}

/// Keep the head of stderr for error messages and discard the rest.
async fn read_stderr(stderr: Option<ChildStderr>) -> std::result::Result<String, InvocationFailure> {
    let Some(stderr) = stderr else {
        return Ok(String::new());
    };
    let mut head = Vec::new();
    let mut limited = stderr.take(MAX_STDERR_BYTES);
    limited
        .read_to_end(&mut head)
        .await
        .map_err(|e| InvocationFailure::Spawn(e.to_string()))?;
    // Drain so a chatty plugin never blocks on a full pipe.
    let mut rest = limited.into_inner();
    tokio::io::copy(&mut rest, &mut tokio::io::sink())
        .await
        .map_err(|e| InvocationFailure::Spawn(e.to_string()))?;
    Ok(String::from_utf8_lossy(&head)
        .trim()
        .chars()
        .take(MAX_STDERR_CHARS)
        .collect())
}

#[derive(Serialize)]
struct Envelope<'a> {
    version: &'a str,
    command: PluginCommand,
    config: &'a PluginConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a ArtifactReference>,
    #[serde(flatten)]
    payload: &'a Map<String, Value>,
}

/// The single result object a plugin prints.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PluginResponse {
    pub version: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Command-specific fields.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl PluginResponse {
    /// Decode one extension field, `None` when absent.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<Option<T>, String> {
        match self.extensions.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| format!("field '{}': {}", key, e)),
        }
    }
}

/// Decode stdout into exactly one response, checking the declared version.
pub fn parse_output(stdout: &[u8]) -> std::result::Result<PluginResponse, InvocationFailure> {
    if stdout.len() > MAX_OUTPUT_BYTES {
        return Err(InvocationFailure::MalformedOutput(format!(
            "output exceeds {} bytes",
            MAX_OUTPUT_BYTES
        )));
    }

    let mut documents = serde_json::Deserializer::from_slice(stdout).into_iter::<Value>();
    let value = match documents.next() {
        None => return Err(InvocationFailure::MalformedOutput("no output".into())),
        Some(Err(e)) => return Err(InvocationFailure::MalformedOutput(e.to_string())),
        Some(Ok(v)) => v,
    };
    if documents.next().is_some() {
        return Err(InvocationFailure::MalformedOutput(
            "more than one result on stdout".into(),
        ));
    }

    let declared = value
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| InvocationFailure::MalformedOutput("result has no version".into()))?;
    if !is_supported_version(declared) {
        return Err(InvocationFailure::VersionMismatch {
            declared: declared.to_string(),
            supported: SUPPORTED_VERSIONS.join(", "),
        });
    }

    serde_json::from_value(value).map_err(|e| InvocationFailure::MalformedOutput(e.to_string()))
}

/// A located plugin bound to its configuration and negotiated version.
#[derive(Clone, Debug)]
pub struct ExternalPlugin {
    binary: PluginBinary,
    version: String,
    config: PluginConfig,
    runner: PluginRunner,
}

impl ExternalPlugin {
    pub fn new(binary: PluginBinary, version: &str, config: PluginConfig, runner: PluginRunner) -> Self {
        Self {
            binary,
            version: version.to_string(),
            config,
            runner,
        }
    }

    pub fn name(&self) -> &str {
        &self.binary.name
    }

    pub fn path(&self) -> &Path {
        &self.binary.path
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Launch the plugin once for `command`. `payload` fields sit beside
    /// `version`, `command`, `config` and `subject` in the request object.
    pub async fn invoke(
        &self,
        command: PluginCommand,
        subject: Option<&ArtifactReference>,
        payload: Map<String, Value>,
    ) -> Result<PluginResponse> {
        let input = serde_json::to_vec(&Envelope {
            version: &self.version,
            command,
            config: &self.config,
            subject,
            payload: &payload,
        })?;

        debug!(plugin = %self.binary.name, command = command.as_str(), "invoking plugin");
        let stdout = self
            .runner
            .run(&self.binary, command, &self.version, input)
            .await
            .map_err(|f| Error::invocation(&self.binary.name, f))?;
        parse_output(&stdout).map_err(|f| Error::invocation(&self.binary.name, f))
    }
}
