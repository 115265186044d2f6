//! The parts of a breakglass session shared by management clusters and
//! hosted control planes: where the kubeconfig goes and what runs with it.

use anyhow::{bail, ensure, Context, Result};
use sessiongate_core::Credential;
use sessiongate_k8s_credentials::kubeconfig;
use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};
use tempfile::TempPath;
use tokio::{io::AsyncWriteExt, process::Command};

const DNS1123_LABEL_MAX: usize = 63;

#[derive(Clone, Debug, Default, clap::Args)]
pub struct SessionArgs {
    /// Where to write the kubeconfig. Defaults to a new temporary file.
    #[clap(long, short = 'o')]
    output: Option<PathBuf>,

    /// Write the kubeconfig and exit without starting a shell.
    #[clap(long, conflicts_with = "exec")]
    no_shell: bool,

    /// Run a command with the kubeconfig instead of an interactive shell.
    #[clap(long, value_name = "CMD")]
    exec: Option<String>,
}

/// What to run once the kubeconfig is written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Then {
    Shell,
    Exec(String),
    Exit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub output: Option<PathBuf>,
    pub then: Then,
}

/// A written kubeconfig. Temporary files are removed on drop unless the
/// session ends without running anything.
#[derive(Debug)]
pub struct Kubeconfig {
    path: PathBuf,
    _temp: Option<TempPath>,
}

// === impl SessionArgs ===

impl SessionArgs {
    pub fn validate(self) -> Result<SessionOptions> {
        let Self {
            output,
            no_shell,
            exec,
        } = self;
        let then = match (no_shell, exec) {
            (true, Some(_)) => bail!("--exec and --no-shell are mutually exclusive"),
            (true, None) => Then::Exit,
            (false, Some(cmd)) => {
                ensure!(!cmd.trim().is_empty(), "--exec must not be empty");
                Then::Exec(cmd)
            }
            (false, None) => Then::Shell,
        };
        if let Some(path) = &output {
            ensure!(!path.as_os_str().is_empty(), "--output must not be empty");
        }
        Ok(SessionOptions { output, then })
    }
}

// === impl SessionOptions ===

impl SessionOptions {
    /// Writes `credential` as a kubeconfig and runs the follow-up action.
    pub async fn start(&self, credential: &Credential, name: &str, prefix: &str) -> Result<()> {
        let yaml = kubeconfig::to_yaml(credential, name)?;
        let kubeconfig = match &self.output {
            Some(path) => Kubeconfig::write(path, &yaml).await?,
            None => Kubeconfig::temporary(prefix, &yaml, self.then != Then::Exit).await?,
        };
        tracing::info!(path = %kubeconfig.path().display(), not_after = %credential.not_after, "Wrote kubeconfig");

        match &self.then {
            Then::Exit => {
                println!("{}", kubeconfig.path().display());
                Ok(())
            }
            Then::Shell => {
                eprintln!(
                    "Starting a shell with KUBECONFIG={}; access expires at {}.",
                    kubeconfig.path().display(),
                    credential.not_after
                );
                let status = run(shell_command(), kubeconfig.path(), false).await?;
                tracing::debug!(?status, "Shell exited");
                Ok(())
            }
            Then::Exec(cmd) => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(cmd);
                let status = run(command, kubeconfig.path(), true).await?;
                ensure!(status.success(), "{cmd:?} failed: {status}");
                Ok(())
            }
        }
    }
}

// === impl Kubeconfig ===

impl Kubeconfig {
    async fn write(path: &Path, contents: &str) -> Result<Self> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        // The mode only applies to newly created files.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .with_context(|| format!("restricting {}", path.display()))?;
        }
        file.write_all(contents.as_bytes())
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        file.flush().await?;
        Ok(Self {
            path: path.to_path_buf(),
            _temp: None,
        })
    }

    /// Temporary files are created readable only by their owner.
    async fn temporary(prefix: &str, contents: &str, remove_on_drop: bool) -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .suffix(".kubeconfig")
            .tempfile()
            .context("creating kubeconfig file")?
            .into_temp_path();
        let mut kubeconfig = Self::write(&temp, contents).await?;
        if remove_on_drop {
            kubeconfig._temp = Some(temp);
        } else {
            temp.keep().context("keeping kubeconfig file")?;
        }
        Ok(kubeconfig)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn shell_command() -> Command {
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string());
    Command::new(shell)
}

/// Runs `command` with `KUBECONFIG` pointing at `kubeconfig`.
///
/// With `interruptible`, Ctrl-C kills the child and fails the session.
/// Otherwise Ctrl-C is left to the child; an interactive shell handles its
/// own interrupts.
async fn run(mut command: Command, kubeconfig: &Path, interruptible: bool) -> Result<ExitStatus> {
    let mut child = command
        .env("KUBECONFIG", kubeconfig)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .context("starting command")?;

    loop {
        tokio::select! {
            status = child.wait() => return status.context("waiting for command"),
            res = tokio::signal::ctrl_c() => {
                res.context("listening for Ctrl-C")?;
                if interruptible {
                    child.kill().await.context("stopping command")?;
                    bail!("Interrupted");
                }
            }
        }
    }
}

/// Converts an identity into a DNS-1123 label: lowercase alphanumerics and
/// `-`, no leading or trailing `-`, at most 63 characters.
pub fn sanitize_username(username: &str) -> Result<String> {
    ensure!(!username.is_empty(), "username must not be empty");
    let lowered = username
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>();
    let mut sanitized = lowered.trim_matches('-').to_string();
    ensure!(
        !sanitized.is_empty(),
        "username {username:?} contains no valid characters"
    );
    if sanitized.len() > DNS1123_LABEL_MAX {
        sanitized.truncate(DNS1123_LABEL_MAX);
        sanitized = sanitized.trim_end_matches('-').to_string();
    }
    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use sessiongate_core::AuthMaterial;

    #[rstest]
    #[case::plain("alice", "alice")]
    #[case::email("Alice.Smith@example.com", "alice-smith-example-com")]
    #[case::service_account("system:serviceaccount:ns:sa", "system-serviceaccount-ns-sa")]
    #[case::edges("__bob__", "bob")]
    #[case::digits("123", "123")]
    #[case::non_ascii("zoë", "zo")]
    fn sanitizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_username(input).unwrap(), expected);
    }

    #[test]
    fn truncates_to_label_length() {
        let long = format!("{}.{}", "a".repeat(62), "b".repeat(10));
        assert_eq!(sanitize_username(&long).unwrap(), "a".repeat(62));

        let exact = "c".repeat(70);
        assert_eq!(sanitize_username(&exact).unwrap(), "c".repeat(63));
    }

    #[rstest]
    #[case::empty("")]
    #[case::symbols("@@@")]
    #[case::dashes("---")]
    fn rejects_unusable_names(#[case] input: &str) {
        assert!(sanitize_username(input).is_err(), "{input:?}");
    }

    #[derive(Debug, clap::Parser)]
    struct Cmd {
        #[clap(flatten)]
        session: SessionArgs,
    }

    fn parse(args: &[&str]) -> Result<SessionOptions> {
        use clap::Parser;
        let cmd = Cmd::try_parse_from(std::iter::once("hcpctl").chain(args.iter().copied()))?;
        cmd.session.validate()
    }

    #[test]
    fn chooses_follow_up() {
        assert_eq!(parse(&[]).unwrap().then, Then::Shell);
        assert_eq!(parse(&["--no-shell"]).unwrap().then, Then::Exit);
        assert_eq!(
            parse(&["--exec", "kubectl get nodes"]).unwrap().then,
            Then::Exec("kubectl get nodes".to_string())
        );
        assert!(parse(&["--exec", "ls", "--no-shell"]).is_err());
        assert!(parse(&["--exec", " "]).is_err());
        assert!(SessionArgs {
            output: None,
            no_shell: true,
            exec: Some("ls".to_string()),
        }
        .validate()
        .is_err());
    }

    fn credential() -> Credential {
        Credential {
            endpoint: "https://mc-1:443".to_string(),
            ca_data: None,
            auth: AuthMaterial::Bearer("token".to_string()),
            not_before: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            not_after: Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn writes_owner_only_kubeconfig() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mc-1.kubeconfig");
        std::fs::write(&path, "stale").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let options = SessionOptions {
            output: Some(path.clone()),
            then: Then::Exit,
        };
        options.start(&credential(), "mc-1", "mc-1").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("server: https://mc-1:443"), "{written}");
        assert!(!written.contains("stale"), "{written}");
    }

    #[tokio::test]
    async fn temporary_kubeconfig_lives_with_the_session() {
        let kubeconfig = Kubeconfig::temporary("hcp-breakglass", "kind: Config\n", true)
            .await
            .unwrap();
        let path = kubeconfig.path().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("hcp-breakglass-"), "{name}");
        assert!(name.ends_with(".kubeconfig"), "{name}");
        assert!(path.exists());
        drop(kubeconfig);
        assert!(!path.exists());

        let kept = Kubeconfig::temporary("mc-1", "kind: Config\n", false)
            .await
            .unwrap();
        assert!(kept.path().exists());
        std::fs::remove_file(kept.path()).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_sees_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.kubeconfig");
        let options = SessionOptions {
            output: Some(path.clone()),
            then: Then::Exec(r#"test "$KUBECONFIG" = "$EXPECTED""#.to_string()),
        };
        std::env::set_var("EXPECTED", &path);
        options.start(&credential(), "mc-1", "mc-1").await.unwrap();

        let failing = SessionOptions {
            output: Some(path),
            then: Then::Exec("exit 3".to_string()),
        };
        assert!(failing.start(&credential(), "mc-1", "mc-1").await.is_err());
    }
}
