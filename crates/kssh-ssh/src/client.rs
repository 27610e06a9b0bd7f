use crate::config::{HostKeyPolicy, SshConnectConfig};
use anyhow::{bail, Result};
use russh::client::{Config as ClientConfig, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::{Algorithm, HashAlg};
use russh::{client, ChannelMsg, ChannelWriteHalf, Disconnect};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct SshClient;

pub struct SshSession {
    handle: Handle<ClientHandler>,
    config: SshConnectConfig,
}

pub struct SshShell {
    writer: ChannelWriteHalf<russh::client::Msg>,
    output: mpsc::Receiver<Vec<u8>>,
    exit_status: Option<tokio::sync::oneshot::Receiver<Option<u32>>>,
}

impl SshClient {
    /// Connects and authenticates with the identities behind
    /// `cfg.agent_socket`.
    pub async fn connect(cfg: SshConnectConfig) -> Result<SshSession> {
        let config = Arc::new(build_client_config(&cfg));
        let handler = ClientHandler {
            host: cfg.host.clone(),
            port: cfg.port,
            policy: cfg.host_key_policy.clone(),
        };

        let sock = connect_socket(&cfg.host, cfg.port, cfg.connect_timeout_ms).await?;
        let mut handle = client::connect_stream(config, sock, handler).await?;

        if !authenticate_with_agent(&mut handle, &cfg.username, &cfg.agent_socket).await? {
            bail!(
                "no agent identity was accepted for {}@{}",
                cfg.username,
                cfg.host
            );
        }
        info!(host = %cfg.host, port = cfg.port, user = %cfg.username, "ssh session established");

        Ok(SshSession {
            handle,
            config: cfg,
        })
    }
}

impl SshSession {
    pub async fn open_shell(&self) -> Result<SshShell> {
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(
                true,
                &self.config.term,
                self.config.term_width,
                self.config.term_height,
                0,
                0,
                &[],
            )
            .await?;
        channel.request_shell(true).await?;

        let (mut reader, writer) = channel.split();
        let (tx, rx) = mpsc::channel(1024);
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let mut exit_status: Option<u32> = None;
            while let Some(msg) = reader.wait().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        let _ = tx.send(data.to_vec()).await;
                    }
                    ChannelMsg::ExtendedData { data, .. } => {
                        let _ = tx.send(data.to_vec()).await;
                    }
                    ChannelMsg::ExitStatus {
                        exit_status: status,
                    } => {
                        exit_status = Some(status);
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
            let _ = exit_tx.send(exit_status);
        });

        Ok(SshShell {
            writer,
            output: rx,
            exit_status: Some(exit_rx),
        })
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

impl SshShell {
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.make_writer();
        writer.write_all(data).await?;
        Ok(())
    }

    pub async fn send_eof(&mut self) -> Result<()> {
        self.writer.eof().await?;
        Ok(())
    }

    pub async fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.writer.window_change(width, height, 0, 0).await?;
        Ok(())
    }

    /// Next chunk of remote output; `None` once the channel has closed.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }

    pub async fn wait_exit(&mut self) -> Option<u32> {
        if let Some(rx) = self.exit_status.take() {
            rx.await.ok().flatten()
        } else {
            None
        }
    }
}

#[derive(Clone)]
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let accepted = host_key_accepted(&self.policy, &fingerprint);
        if accepted {
            info!(host = %self.host, port = self.port, fingerprint = %fingerprint, "server host key");
        } else {
            warn!(
                host = %self.host,
                port = self.port,
                fingerprint = %fingerprint,
                "server host key does not match the pinned fingerprint"
            );
        }
        async move { Ok(accepted) }
    }
}

fn host_key_accepted(policy: &HostKeyPolicy, fingerprint: &str) -> bool {
    match policy {
        HostKeyPolicy::LogFingerprint => true,
        HostKeyPolicy::Pinned(expected) => expected == fingerprint,
    }
}

fn build_client_config(cfg: &SshConnectConfig) -> ClientConfig {
    ClientConfig {
        keepalive_interval: Some(Duration::from_secs(cfg.keepalive_interval_secs)),
        keepalive_max: 3,
        ..Default::default()
    }
}

async fn connect_socket(host: &str, port: u16, timeout_ms: u64) -> Result<TcpStream> {
    let connect = TcpStream::connect((host, port));
    match tokio::time::timeout(Duration::from_millis(timeout_ms), connect).await {
        Ok(stream) => Ok(stream?),
        Err(_) => bail!("connection to {}:{} timed out after {} ms", host, port, timeout_ms),
    }
}

async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    agent_socket: &Path,
) -> Result<bool> {
    let stream = UnixStream::connect(agent_socket).await?;
    let mut client = AgentClient::connect(stream);

    let keys = client.request_identities().await?;
    debug!(count = keys.len(), "agent identities offered");
    for key in keys {
        let hash = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
            handle.best_supported_rsa_hash().await?.flatten()
        } else {
            None
        };
        let res = handle
            .authenticate_publickey_with(user.to_string(), key, hash, &mut client)
            .await?;
        if matches!(res, russh::client::AuthResult::Success) {
            return Ok(true);
        }
    }
    Ok(false)
}
