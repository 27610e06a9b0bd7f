use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use kssh_agent::{AgentServer, AgentSocket, Identity, KeyRing, ServerLimits};
use kssh_cli::{Cli, Command};
use kssh_config::{AppConfig, AppConfigLayer, AppPaths, ConfigManager, KeyConfigLayer};
use kssh_signer::{
    authorized_key, fingerprint, load_signer, BackendOptions, KeySelector, KmsOptions,
    RemoteSigner,
};
use kssh_ssh::{HostKeyPolicy, SshClient, SshConnectConfig, SshShell, Target};
use std::io::{IsTerminal, Read, Write};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const DEFAULT_TERM: &str = "xterm-256color";

enum Action {
    PrintKey,
    Agent(Vec<String>),
    Connect {
        target: Target,
        login: Option<String>,
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let paths = AppPaths::new().unwrap_or_else(|_| AppPaths::under(std::env::temp_dir().join("kssh")));
    let config_manager = ConfigManager::new(paths.clone());

    let overrides = cli.key.clone().map(|selector| AppConfigLayer {
        key: Some(KeyConfigLayer {
            selector: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    });
    let config = match config_manager.load(cli.config.as_deref(), AppConfigLayer::from_env(), overrides)
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("kssh: {err}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let action = match cli.command {
        Some(Command::Config { init }) => return init_config(&config_manager, init),
        Some(Command::Agent { command }) => Action::Agent(command),
        Some(Command::Connect {
            target,
            login,
            port,
        }) => match Target::parse(&target) {
            Ok(target) => Action::Connect {
                target,
                login,
                port,
            },
            Err(err) => {
                eprintln!("kssh: {target}: {err}");
                return ExitCode::from(EXIT_USAGE);
            }
        },
        None if cli.authorized_key => Action::PrintKey,
        None => {
            let _ = Cli::command().print_help();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let interactive = matches!(action, Action::Connect { .. });
    let _log_guard = match init_logging(&config, &paths, config.logging.stderr && !interactive) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("kssh: logging disabled: {err:#}");
            None
        }
    };

    let Some(raw_selector) = config.key.selector.clone() else {
        eprintln!("kssh: no key configured; pass -i KEY or set KSSH_KEY_PATH");
        return ExitCode::from(EXIT_USAGE);
    };
    let selector: KeySelector = match raw_selector.parse() {
        Ok(selector) => selector,
        Err(err) => {
            eprintln!("kssh: {err}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match run(action, cli.authorized_key, &selector, &config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "kssh failed");
            eprintln!("kssh: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_config(config_manager: &ConfigManager, init: bool) -> ExitCode {
    if !init {
        println!("{}", config_manager.paths.config_file.display());
        return ExitCode::SUCCESS;
    }
    match config_manager.save_default() {
        Ok(()) => {
            println!(
                "config initialized at {}",
                config_manager.paths.config_file.display()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("kssh: {err}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(
    action: Action,
    print_key: bool,
    selector: &KeySelector,
    config: &AppConfig,
) -> Result<ExitCode> {
    let signer = load_signer(selector, &backend_options(config))
        .await
        .with_context(|| format!("loading key {selector}"))?;
    info!(
        key = %selector,
        algorithm = %signer.algorithm(),
        fingerprint = %fingerprint(signer.public_key()),
        "signing key ready"
    );

    if print_key {
        let line = authorized_key(signer.public_key(), &config.key.comment)?;
        println!("{line}");
    }

    match action {
        Action::PrintKey => Ok(ExitCode::SUCCESS),
        Action::Agent(command) => run_agent(signer, config, command).await,
        Action::Connect {
            target,
            login,
            port,
        } => run_connect(signer, config, target, login, port).await,
    }
}

fn backend_options(config: &AppConfig) -> BackendOptions {
    BackendOptions {
        kms: KmsOptions {
            endpoint: config.key.kms_endpoint.clone(),
            timeout: config.agent.sign_timeout(),
        },
        access_token: config.key.access_token.clone(),
        credentials_file: config.key.credentials_file.clone(),
    }
}

fn server_limits(config: &AppConfig) -> ServerLimits {
    ServerLimits {
        max_connections: config.agent.max_connections,
        sign_timeout: config.agent.sign_timeout(),
        shutdown_grace: config.agent.shutdown_grace(),
        ..ServerLimits::default()
    }
}

struct RunningAgent {
    socket: AgentSocket,
    shutdown: CancellationToken,
    serving: JoinHandle<Result<(), kssh_agent::AgentError>>,
}

impl RunningAgent {
    fn start(signer: Arc<dyn RemoteSigner>, config: &AppConfig) -> Result<Self> {
        let keyring = Arc::new(KeyRing::new());
        keyring.add(Identity::new(signer, config.key.comment.clone()))?;

        let mut socket =
            AgentSocket::bind(&config.agent.socket_prefix).context("binding agent socket")?;
        let listener = socket
            .take_listener()
            .context("agent socket has no listener")?;
        let shutdown = CancellationToken::new();
        let server = AgentServer::new(keyring, server_limits(config));
        let token = shutdown.clone();
        let serving = tokio::spawn(async move { server.serve(listener, token).await });

        Ok(Self {
            socket,
            shutdown,
            serving,
        })
    }

    async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        let result = self.serving.await.context("agent task failed")?;
        drop(self.socket);
        result.context("agent server failed")
    }
}

async fn run_agent(
    signer: Arc<dyn RemoteSigner>,
    config: &AppConfig,
    command: Vec<String>,
) -> Result<ExitCode> {
    let mut agent = RunningAgent::start(signer, config)?;

    let code = if command.is_empty() {
        let mut stdout = std::io::stdout();
        stdout.write_all(agent.socket.env_script().as_bytes())?;
        stdout.flush()?;
        tokio::select! {
            _ = shutdown_signal() => info!("shutdown signal received"),
            joined = &mut agent.serving => {
                joined.context("agent task failed")??;
                anyhow::bail!("agent stopped unexpectedly");
            }
        }
        ExitCode::SUCCESS
    } else {
        let outcome = run_child(&agent.socket, &command).await;
        agent.stop().await?;
        return outcome.map(ExitCode::from);
    };

    agent.stop().await?;
    Ok(code)
}

async fn run_child(socket: &AgentSocket, command: &[String]) -> Result<u8> {
    let (program, args) = command
        .split_first()
        .context("no command given")?;
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .envs(socket.env_vars())
        .spawn()
        .with_context(|| format!("starting {program}"))?;
    info!(program = %program, pid = child.id(), "child started");

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = shutdown_signal() => {
            warn!(program = %program, "shutdown signal received, stopping child");
            child.start_kill()?;
            child.wait().await?
        }
    };
    info!(program = %program, status = %status, "child exited");
    Ok(exit_code_of(status))
}

fn exit_code_of(status: std::process::ExitStatus) -> u8 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u8,
        (None, Some(signal)) => (128 + signal) as u8,
        (None, None) => EXIT_FAILURE,
    }
}

async fn run_connect(
    signer: Arc<dyn RemoteSigner>,
    config: &AppConfig,
    target: Target,
    login: Option<String>,
    port: Option<u16>,
) -> Result<ExitCode> {
    let agent = RunningAgent::start(signer, config)?;
    let outcome = open_session(&agent, config, &target, login, port).await;
    agent.stop().await?;

    let status = outcome?;
    info!(status = ?status, "remote shell exited");
    Ok(ExitCode::from(remote_exit_code(status)))
}

async fn open_session(
    agent: &RunningAgent,
    config: &AppConfig,
    target: &Target,
    login: Option<String>,
    port: Option<u16>,
) -> Result<Option<u32>> {
    let username = login
        .or(target.user.clone())
        .or(config.ssh.username.clone())
        .unwrap_or_else(whoami::username);
    let (width, height) = crossterm::terminal::size().unwrap_or((80, 24));
    let cfg = SshConnectConfig {
        host: target.host.clone(),
        port: port.or(target.port).unwrap_or(config.ssh.port),
        username,
        agent_socket: agent.socket.path().to_path_buf(),
        host_key_policy: match &config.ssh.host_key_fingerprint {
            Some(fp) => HostKeyPolicy::Pinned(fp.clone()),
            None => HostKeyPolicy::LogFingerprint,
        },
        keepalive_interval_secs: config.ssh.keepalive_interval_secs,
        connect_timeout_ms: config.ssh.connect_timeout_ms,
        term: std::env::var("TERM")
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TERM.to_string()),
        term_width: u32::from(width),
        term_height: u32::from(height),
    };

    let session = SshClient::connect(cfg)
        .await
        .with_context(|| format!("connecting to {target}"))?;
    let relayed = match session.open_shell().await {
        Ok(mut shell) => {
            let _raw = RawMode::enable();
            relay(&mut shell, shutdown_signal()).await
        }
        Err(err) => Err(err),
    };
    if let Err(err) = session.disconnect().await {
        warn!(error = %format!("{err:#}"), "disconnect failed");
    }
    relayed
}

/// Local exit code for a remote exit status. 130 (remote ^C) and a missing
/// status count as success; anything a process exit code cannot hold is a
/// plain failure.
fn remote_exit_code(status: Option<u32>) -> u8 {
    match status {
        None | Some(0) | Some(130) => 0,
        Some(code) => u8::try_from(code).unwrap_or(EXIT_FAILURE),
    }
}

/// Puts the local terminal in raw mode for the lifetime of the value.
struct RawMode(bool);

impl RawMode {
    fn enable() -> Self {
        let enabled = std::io::stdin().is_terminal() && crossterm::terminal::enable_raw_mode().is_ok();
        Self(enabled)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if self.0 {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

/// Pumps stdin to the remote shell and its output to stdout until the shell
/// closes or `shutdown` resolves. An interrupted session has no exit status.
async fn relay(
    shell: &mut SshShell,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<Option<u32>> {
    tokio::pin!(shutdown);
    let mut input = spawn_stdin_reader();
    let mut input_open = true;
    let mut stdout = tokio::io::stdout();
    let mut winch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    loop {
        tokio::select! {
            data = input.recv(), if input_open => match data {
                Some(data) => shell.write(&data).await?,
                None => {
                    input_open = false;
                    shell.send_eof().await?;
                }
            },
            out = shell.read() => match out {
                Some(data) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
            _ = winch.recv() => {
                if let Ok((width, height)) = crossterm::terminal::size() {
                    shell.resize(u32::from(width), u32::from(height)).await?;
                }
            }
            _ = &mut shutdown => {
                warn!("shutdown signal received, closing session");
                return Ok(None);
            }
        }
    }

    Ok(shell.wait_exit().await)
}

// A plain thread: a blocked stdin read must not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to register SIGTERM handler, falling back to SIGINT only");
            ctrl_c.await.ok();
        }
    }
}

fn init_logging(
    config: &AppConfig,
    paths: &AppPaths,
    enable_stderr: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let (file_layer, guard) = if config.logging.file {
        std::fs::create_dir_all(&paths.log_dir)?;
        let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "kssh.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = if config.logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let stderr_layer = if !enable_stderr {
        None
    } else if config.logging.json {
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
        )
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .boxed(),
        )
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kssh_signer::LocalSigner;
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;

    fn test_signer() -> Arc<dyn RemoteSigner> {
        let key = p256::ecdsa::SigningKey::from_slice(&[1u8; 32]).unwrap();
        Arc::new(LocalSigner::from_p256(key).unwrap())
    }

    fn leftover_dirs(prefix: &str) -> usize {
        std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
            .count()
    }

    #[test]
    fn child_status_maps_to_exit_code() {
        assert_eq!(exit_code_of(std::process::ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code_of(std::process::ExitStatus::from_raw(3 << 8)), 3);
        // Terminated by SIGTERM.
        assert_eq!(exit_code_of(std::process::ExitStatus::from_raw(15)), 143);
    }

    #[test]
    fn remote_status_maps_to_exit_code() {
        assert_eq!(remote_exit_code(None), 0);
        assert_eq!(remote_exit_code(Some(0)), 0);
        assert_eq!(remote_exit_code(Some(130)), 0);
        assert_eq!(remote_exit_code(Some(2)), 2);
        assert_eq!(remote_exit_code(Some(255)), 255);
        assert_eq!(remote_exit_code(Some(256)), EXIT_FAILURE);
        assert_eq!(remote_exit_code(Some(u32::MAX)), EXIT_FAILURE);
    }

    #[test]
    fn limits_follow_config() {
        let mut config = AppConfig::default();
        config.agent.max_connections = 4;
        config.agent.sign_timeout_ms = 1500;
        let limits = server_limits(&config);
        assert_eq!(limits.max_connections, 4);
        assert_eq!(limits.sign_timeout, std::time::Duration::from_millis(1500));
        assert_eq!(limits.max_frame_len, kssh_agent::proto::MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn child_sees_agent_environment() {
        let socket = AgentSocket::bind("kssh-test-").unwrap();
        let expected = socket.path().display().to_string();
        let script = format!("test \"$SSH_AUTH_SOCK\" = \"{expected}\" && test -n \"$SSH_AGENT_PID\"");
        let code = run_child(&socket, &["sh".to_string(), "-c".to_string(), script])
            .await
            .unwrap();
        assert_eq!(code, 0);

        let code = run_child(&socket, &["sh".to_string(), "-c".to_string(), "exit 7".to_string()])
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn stopping_the_agent_removes_its_socket() {
        let mut config = AppConfig::default();
        config.agent.socket_prefix = format!("kssh-stop-test-{}-", std::process::id());
        let agent = RunningAgent::start(test_signer(), &config).unwrap();
        let path = agent.socket.path().to_path_buf();
        let dir = agent.socket.dir().to_path_buf();
        let _idle = tokio::net::UnixStream::connect(&path).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), agent.stop())
            .await
            .expect("agent did not stop")
            .unwrap();
        assert!(!path.exists());
        assert!(!dir.exists());
        assert!(tokio::net::UnixStream::connect(&path).await.is_err());
    }

    #[tokio::test]
    async fn failed_session_still_tears_down_the_agent() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let prefix = format!("kssh-session-test-{}-", std::process::id());
        let mut config = AppConfig::default();
        config.agent.socket_prefix = prefix.clone();
        config.ssh.connect_timeout_ms = 2_000;
        let target = Target::parse("tester@127.0.0.1").unwrap();

        let result = run_connect(test_signer(), &config, target, None, Some(port)).await;
        assert!(result.is_err());
        assert_eq!(leftover_dirs(&prefix), 0);
    }
}
