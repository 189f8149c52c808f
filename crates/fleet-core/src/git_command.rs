use crate::auth::mask_token_in_url;
use crate::cancel::CancelToken;
use anyhow::{Context, bail};
use std::ffi::OsString;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// One `git` subprocess invocation.
///
/// The child never prompts (`GIT_TERMINAL_PROMPT=0`), runs with extra env
/// overrides only, and is killed together with its helpers (`git-remote-https`,
/// `ssh`) when the token is cancelled or its deadline passes.
#[derive(Clone, Debug, Default)]
pub struct GitCommand {
    program: Option<OsString>,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(path: &Path) -> Self {
        Self::new().arg("-C").arg(path)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[cfg(test)]
    fn program(mut self, program: impl Into<OsString>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn envs(mut self, env: &[(String, String)]) -> Self {
        self.env.extend(env.iter().cloned());
        self
    }

    /// Command line with credentials masked, safe for logs and errors.
    pub fn describe(&self) -> String {
        let mut parts = vec!["git".to_string()];
        parts.extend(
            self.args
                .iter()
                .map(|arg| mask_token_in_url(&arg.to_string_lossy())),
        );
        parts.join(" ")
    }

    fn scrub(&self, text: &str) -> String {
        let mut scrubbed = text.to_string();
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            let masked = mask_token_in_url(&arg);
            if masked != arg {
                scrubbed = scrubbed.replace(arg.as_ref(), &masked);
            }
        }
        scrubbed
    }

    /// Runs to completion, forwarding each stderr line (split on `\r` and `\n`) to `on_line`.
    ///
    /// A non-zero exit is not an error here; see [`GitCommand::run`].
    pub fn output(
        &self,
        ctx: &CancelToken,
        mut on_line: impl FnMut(&str),
    ) -> anyhow::Result<GitOutput> {
        ctx.check()?;
        let mut command = Command::new(self.program.as_deref().unwrap_or("git".as_ref()));
        command
            .args(&self.args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn {}", self.describe()))?;
        let stdout = child.stdout.take().context("capture git stdout")?;
        let stderr = child.stderr.take().context("capture git stderr")?;
        let (tx, rx) = mpsc::channel();
        let stdout_reader = spawn_reader(stdout, None);
        let stderr_reader = spawn_reader(stderr, Some(tx));

        let status = loop {
            for line in rx.try_iter() {
                on_line(&self.scrub(&line));
            }
            // Readers are detached on this path: helpers outliving the kill
            // would keep the pipes open and block a join.
            if let Err(err) = ctx.check() {
                kill_group(&mut child);
                return Err(anyhow::Error::new(err)
                    .context(format!("{} interrupted", self.describe())));
            }
            let wait = ctx
                .remaining()
                .map_or(POLL_INTERVAL, |remaining| remaining.min(POLL_INTERVAL));
            if let Some(status) = child
                .wait_timeout(wait)
                .with_context(|| format!("wait for {}", self.describe()))?
            {
                break status;
            }
        };

        while !(stdout_reader.is_finished() && stderr_reader.is_finished()) {
            for line in rx.try_iter() {
                on_line(&self.scrub(&line));
            }
            if let Err(err) = ctx.check() {
                kill_group(&mut child);
                return Err(anyhow::Error::new(err)
                    .context(format!("{} output still open", self.describe())));
            }
            thread::sleep(DRAIN_INTERVAL);
        }
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        for line in rx.try_iter() {
            on_line(&self.scrub(&line));
        }

        Ok(GitOutput {
            success: status.success(),
            code: status.code(),
            stdout: self.scrub(&stdout),
            stderr: self.scrub(&stderr),
        })
    }

    /// Like [`GitCommand::output`] but a non-zero exit becomes an error carrying stderr.
    pub fn run(&self, ctx: &CancelToken, on_line: impl FnMut(&str)) -> anyhow::Result<GitOutput> {
        let output = self.output(ctx, on_line)?;
        if !output.success {
            let code = output
                .code
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            bail!(
                "{} failed (exit {code}): {}",
                self.describe(),
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

/// Kills the child's whole process group, then reaps the child itself.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_reader(
    mut stream: impl Read + Send + 'static,
    lines: Option<Sender<String>>,
) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut collected = Vec::new();
        let mut pending = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let read = match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            collected.extend_from_slice(&buf[..read]);
            let Some(tx) = &lines else { continue };
            for &byte in &buf[..read] {
                if byte == b'\r' || byte == b'\n' {
                    if !pending.is_empty() {
                        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                        pending.clear();
                    }
                } else {
                    pending.push(byte);
                }
            }
        }
        if let Some(tx) = &lines
            && !pending.is_empty()
        {
            let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
        }
        String::from_utf8_lossy(&collected).into_owned()
    })
}

/// Parses a git `--progress` line such as `Receiving objects:  45% (450/1000)`.
pub fn parse_progress(line: &str) -> Option<(String, f32)> {
    let line = line.trim_start_matches("remote:").trim();
    let (stage, rest) = line.split_once(':')?;
    let percent_end = rest.find('%')?;
    let digits = rest[..percent_end].trim();
    let percent: f32 = digits.rsplit(' ').next()?.parse().ok()?;
    Some((stage.trim().to_string(), (percent / 100.0).clamp(0.0, 1.0)))
}
