use crate::error::FleetError;
use crate::model::AuthConfig;
use anyhow::{Context, anyhow};
use directories::BaseDirs;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use url::Url;

const SSH_KEY_DIR: &str = "fleet-ssh-keys";
const DEFAULT_SSH_PORT: u16 = 22;

/// Rewritten clone URL plus the environment a git subprocess needs to authenticate.
#[derive(Debug, Default)]
pub struct AuthResult {
    pub url: String,
    pub env: Vec<(String, String)>,
    pub warning: Option<String>,
    temp_key: Option<TempKey>,
}

impl AuthResult {
    fn passthrough(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    /// Path of an inline key written to disk for this result.
    ///
    /// The file lives exactly as long as the `AuthResult`; keep the result alive
    /// until the subprocess that uses it has exited.
    pub fn temp_key_path(&self) -> Option<&Path> {
        self.temp_key.as_ref().map(TempKey::path)
    }
}

/// Owner-only temp file holding inline SSH key material, removed on drop.
#[derive(Debug)]
pub struct TempKey {
    file: NamedTempFile,
}

impl TempKey {
    fn write(content: &str) -> anyhow::Result<Self> {
        let dir = std::env::temp_dir().join(SSH_KEY_DIR);
        fs::create_dir_all(&dir).context("create ssh key temp dir")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
                .context("restrict ssh key temp dir")?;
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("key-");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(fs::Permissions::from_mode(0o600));
        }
        let mut file = builder
            .tempfile_in(&dir)
            .context("create ssh key temp file")?;
        file.write_all(content.as_bytes())
            .context("write ssh key temp file")?;
        if !content.ends_with('\n') {
            file.write_all(b"\n").context("write ssh key temp file")?;
        }
        file.flush().context("flush ssh key temp file")?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub fn prepare_auth(clone_url: &str, auth: Option<&AuthConfig>) -> anyhow::Result<AuthResult> {
    let Some(auth) = auth else {
        return Ok(AuthResult::passthrough(clone_url));
    };

    if is_ssh_url(clone_url) {
        return prepare_ssh(clone_url, auth);
    }

    match auth.token.as_deref().filter(|token| !token.is_empty()) {
        Some(token) => {
            let provider = auth.provider.as_deref().unwrap_or("");
            let url = inject_token_to_url(clone_url, token, provider)?;
            debug!(url = %mask_token_in_url(&url), provider, "injected token into clone url");
            Ok(AuthResult {
                url,
                ..AuthResult::default()
            })
        }
        None => Ok(AuthResult::passthrough(clone_url)),
    }
}

fn prepare_ssh(clone_url: &str, auth: &AuthConfig) -> anyhow::Result<AuthResult> {
    let mut result = AuthResult::passthrough(clone_url);
    let key_path = if let Some(path) = auth.ssh_key_path.as_deref() {
        let expanded = expand_home(path);
        if !expanded.is_file() {
            return Err(FleetError::SshKeyNotFound(expanded).into());
        }
        expanded
    } else if let Some(content) = auth
        .ssh_key_content
        .as_deref()
        .filter(|content| !content.trim().is_empty())
    {
        let key = TempKey::write(content)?;
        let path = key.path().to_path_buf();
        warn!(path = %path.display(), "wrote inline ssh key to temp file");
        result.warning = Some(format!(
            "inline ssh key written to {}; it is removed when the operation finishes",
            path.display()
        ));
        result.temp_key = Some(key);
        path
    } else {
        return Ok(result);
    };

    result.env.push((
        "GIT_SSH_COMMAND".to_string(),
        ssh_command(&key_path, auth.ssh_port),
    ));
    Ok(result)
}

fn ssh_command(key_path: &Path, port: Option<u16>) -> String {
    let mut command = format!(
        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
        shell_quote(&key_path.display().to_string())
    );
    if let Some(port) = port.filter(|port| *port != DEFAULT_SSH_PORT) {
        command.push_str(&format!(" -p {port}"));
    }
    command
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "/._-~+:@".contains(ch))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}

pub fn is_ssh_url(url: &str) -> bool {
    if url.starts_with("ssh://") {
        return true;
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return false;
    }
    url.contains('@') && url.contains(':')
}

/// Username a provider expects alongside a token; `None` means the token is the bare user-info.
fn token_username(provider: &str) -> Option<&'static str> {
    match provider.trim().to_ascii_lowercase().as_str() {
        "github" | "github-enterprise" | "ghe" => Some("x-access-token"),
        "bitbucket" => Some("x-token-auth"),
        "gitea" | "forgejo" | "codeberg" => None,
        _ => Some("oauth2"),
    }
}

pub fn inject_token_to_url(url: &str, token: &str, provider: &str) -> anyhow::Result<String> {
    if is_ssh_url(url) {
        return Ok(url.to_string());
    }
    let mut parsed = Url::parse(url).with_context(|| format!("parse clone url {url}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Ok(url.to_string());
    }
    match token_username(provider) {
        Some(username) => {
            parsed
                .set_username(username)
                .map_err(|()| anyhow!("clone url cannot carry credentials"))?;
            parsed
                .set_password(Some(token))
                .map_err(|()| anyhow!("clone url cannot carry credentials"))?;
        }
        None => {
            parsed
                .set_username(token)
                .map_err(|()| anyhow!("clone url cannot carry credentials"))?;
            parsed
                .set_password(None)
                .map_err(|()| anyhow!("clone url cannot carry credentials"))?;
        }
    }
    Ok(parsed.to_string())
}

/// Redacts credentials from an http(s) URL for logging.
pub fn mask_token_in_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return url.to_string();
    }
    let masked = if parsed.password().is_some() {
        parsed.set_password(Some("***"))
    } else if !parsed.username().is_empty() {
        parsed.set_username("***")
    } else {
        return url.to_string();
    };
    match masked {
        Ok(()) => parsed.to_string(),
        Err(()) => url.to_string(),
    }
}
