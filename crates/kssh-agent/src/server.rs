//! Agent protocol server over a Unix domain socket.
//!
//! One task per connection, each tracked in a `JoinSet`. Requests on one
//! connection are handled strictly in order; connections are independent of
//! each other and only meet at the shared [`KeyRing`].

use crate::error::{AgentError, ProtocolError};
use crate::keyring::{Identity, KeyRing, KeyRingError};
use crate::proto::{AddedKey, AgentCodec, Constraint, Request, Response, MAX_FRAME_LEN};
use futures::{SinkExt, StreamExt};
use kssh_signer::{fingerprint, LocalSigner, SignFlags};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct ServerLimits {
    pub max_connections: usize,
    pub sign_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_frame_len: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 64,
            sign_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

pub struct AgentServer {
    keyring: Arc<KeyRing>,
    limits: ServerLimits,
}

impl AgentServer {
    pub fn new(keyring: Arc<KeyRing>, limits: ServerLimits) -> Self {
        Self { keyring, limits }
    }

    /// Accepts connections until `shutdown` fires, then drains in-flight
    /// handlers for at most `shutdown_grace` before aborting them.
    pub async fn serve(
        &self,
        listener: UnixListener,
        shutdown: CancellationToken,
    ) -> Result<(), AgentError> {
        let permits = Arc::new(Semaphore::new(self.limits.max_connections));
        let mut tasks = JoinSet::new();
        let mut next_id: u64 = 0;
        info!(
            max_connections = self.limits.max_connections,
            "agent accepting connections"
        );

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => report_join(joined),
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) if is_transient(&err) => {
                            warn!(error = %err, "accept interrupted");
                            continue;
                        }
                        Err(err) => break Err(AgentError::Accept(err)),
                    };
                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        warn!(
                            limit = self.limits.max_connections,
                            "connection limit reached, dropping client"
                        );
                        drop(stream);
                        continue;
                    };
                    next_id += 1;
                    let conn = Connection {
                        id: next_id,
                        keyring: Arc::clone(&self.keyring),
                        limits: self.limits.clone(),
                        shutdown: shutdown.child_token(),
                    };
                    tasks.spawn(async move {
                        let _permit = permit;
                        conn.run(stream).await;
                    });
                }
            }
        };

        drain(&mut tasks, self.limits.shutdown_grace).await;
        info!("agent stopped");
        result
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

fn report_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "connection handler panicked");
        } else if !err.is_cancelled() {
            warn!(error = %err, "connection handler failed");
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>, grace: Duration) {
    if tasks.is_empty() {
        return;
    }
    debug!(in_flight = tasks.len(), "waiting for connections to finish");
    let finished = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            report_join(joined);
        }
    })
    .await;
    if finished.is_err() {
        warn!(remaining = tasks.len(), "shutdown grace elapsed, aborting connections");
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            report_join(joined);
        }
    }
}

struct Connection {
    id: u64,
    keyring: Arc<KeyRing>,
    limits: ServerLimits,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(self, stream: UnixStream) {
        debug!(conn = self.id, "client connected");
        let mut framed = Framed::new(stream, AgentCodec::new(self.limits.max_frame_len));
        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = framed.next() => match next {
                    Some(Ok(request)) => request,
                    Some(Err(err)) => {
                        self.report_protocol_error(&err);
                        break;
                    }
                    None => break,
                },
            };
            let response = self.dispatch(request).await;
            if let Err(err) = framed.send(response).await {
                debug!(conn = self.id, error = %err, "failed to write response");
                break;
            }
        }
        debug!(conn = self.id, "client disconnected");
    }

    fn report_protocol_error(&self, err: &ProtocolError) {
        match err {
            ProtocolError::Io(io) if io.kind() == io::ErrorKind::ConnectionReset => {
                debug!(conn = self.id, "connection reset by client");
            }
            other => warn!(conn = self.id, error = %other, "closing connection"),
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::RequestIdentities => {
                let identities = self.keyring.list();
                debug!(conn = self.id, count = identities.len(), "listing identities");
                Response::IdentitiesAnswer(identities)
            }
            Request::SignRequest {
                public_key,
                data,
                flags,
            } => self.sign(&public_key, &data, flags).await,
            Request::AddIdentity { key, constraints } => self.add(key, constraints),
            Request::RemoveIdentity { public_key } => {
                self.ack("remove identity", self.keyring.remove(&public_key))
            }
            Request::RemoveAllIdentities => {
                self.ack("remove all identities", self.keyring.remove_all().map(|_| ()))
            }
            Request::Lock { passphrase } => self.ack("lock", self.keyring.lock(&passphrase)),
            Request::Unlock { passphrase } => {
                self.ack("unlock", self.keyring.unlock(&passphrase))
            }
            Request::RequestRsaIdentitiesV1 => Response::RsaIdentitiesAnswerV1,
            Request::RemoveAllRsaIdentitiesV1 => Response::Success,
            Request::Smartcard => {
                debug!(conn = self.id, "smartcard keys are not supported");
                Response::Failure
            }
            Request::Extension { name } => {
                debug!(conn = self.id, extension = %name, "extension not supported");
                Response::Failure
            }
        }
    }

    async fn sign(&self, public_key: &[u8], data: &[u8], flags: SignFlags) -> Response {
        let fp = fingerprint(public_key);
        let signing = tokio::time::timeout(
            self.limits.sign_timeout,
            self.keyring.sign_with(public_key, data, flags),
        );
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => {
                warn!(conn = self.id, fingerprint = %fp, "sign request abandoned at shutdown");
                return Response::Failure;
            }
            outcome = signing => outcome,
        };
        match outcome {
            Ok(Ok(signature)) => {
                info!(
                    conn = self.id,
                    fingerprint = %fp,
                    format = %signature.format,
                    "signed request"
                );
                Response::SignResponse(signature)
            }
            Ok(Err(KeyRingError::IdentityNotFound)) => {
                debug!(conn = self.id, fingerprint = %fp, "sign request for unknown key");
                Response::Failure
            }
            Ok(Err(err)) => {
                warn!(conn = self.id, fingerprint = %fp, error = %err, "sign request failed");
                Response::Failure
            }
            Err(_) => {
                warn!(
                    conn = self.id,
                    fingerprint = %fp,
                    timeout_ms = self.limits.sign_timeout.as_millis() as u64,
                    "sign request timed out"
                );
                Response::Failure
            }
        }
    }

    fn add(&self, key: AddedKey, constraints: Vec<Constraint>) -> Response {
        let (material, comment) = match key {
            AddedKey::Supported { material, comment } => (material, comment),
            AddedKey::Unsupported { key_type } => {
                debug!(conn = self.id, key_type = %key_type, "refusing unsupported key type");
                return Response::Failure;
            }
        };

        let mut lifetime = None;
        for constraint in constraints {
            match constraint {
                Constraint::Lifetime(secs) => lifetime = Some(Duration::from_secs(secs.into())),
                other => {
                    debug!(conn = self.id, constraint = ?other, "refusing unsupported constraint");
                    return Response::Failure;
                }
            }
        }

        let signer = match LocalSigner::from_material(material) {
            Ok(signer) => signer,
            Err(err) => {
                warn!(conn = self.id, error = %err, "rejecting added key");
                return Response::Failure;
            }
        };
        let mut identity = Identity::new(Arc::new(signer), comment);
        if let Some(lifetime) = lifetime {
            identity = identity.with_lifetime(lifetime);
        }
        self.ack("add identity", self.keyring.add(identity))
    }

    fn ack(&self, op: &'static str, result: Result<(), KeyRingError>) -> Response {
        match result {
            Ok(()) => Response::Success,
            Err(err) => {
                debug!(conn = self.id, op, error = %err, "request refused");
                Response::Failure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::*;
    use crate::testing::{p256_identity, p256_signer, StubSigner};
    use bytes::{BufMut, Bytes, BytesMut};
    use kssh_signer::wire::{decode_mpint, encode_mpint, Decode, Encode, Reader};
    use kssh_signer::RemoteSigner;
    use p256::ecdsa::signature::Verifier;
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    struct Harness {
        _dir: TempDir,
        path: PathBuf,
        keyring: Arc<KeyRing>,
        shutdown: CancellationToken,
        handle: JoinHandle<Result<(), AgentError>>,
    }

    fn start(keyring: KeyRing, limits: ServerLimits) -> Harness {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let keyring = Arc::new(keyring);
        let shutdown = CancellationToken::new();
        let server = AgentServer::new(Arc::clone(&keyring), limits);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { server.serve(listener, token).await });
        Harness {
            _dir: dir,
            path,
            keyring,
            shutdown,
            handle,
        }
    }

    async fn connect(path: &Path) -> UnixStream {
        UnixStream::connect(path).await.unwrap()
    }

    // The agent may already have dropped the connection; `recv` reports that.
    async fn send(stream: &mut UnixStream, body: &[u8]) {
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        let _ = stream.write_all(&buf).await;
    }

    async fn recv(stream: &mut UnixStream) -> Option<Bytes> {
        let len = stream.read_u32().await.ok()?;
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await.ok()?;
        Some(Bytes::from(body))
    }

    async fn roundtrip(stream: &mut UnixStream, body: &[u8]) -> Bytes {
        send(stream, body).await;
        recv(stream).await.expect("agent closed the connection")
    }

    fn message(code: u8, strings: &[&[u8]]) -> Vec<u8> {
        let mut body = vec![code];
        for value in strings {
            value.encode(&mut body).unwrap();
        }
        body
    }

    fn sign_request(public_key: &[u8], data: &[u8], flags: u32) -> Vec<u8> {
        let mut body = message(SSH_AGENTC_SIGN_REQUEST, &[public_key, data]);
        flags.encode(&mut body).unwrap();
        body
    }

    fn identities(reply: Bytes) -> Vec<(Bytes, String)> {
        let mut r: &[u8] = &reply;
        assert_eq!(u8::decode(&mut r).unwrap(), SSH_AGENT_IDENTITIES_ANSWER);
        let count = u32::decode(&mut r).unwrap();
        let out = (0..count)
            .map(|_| (Bytes::decode(&mut r).unwrap(), String::decode(&mut r).unwrap()))
            .collect();
        assert!(r.is_finished());
        out
    }

    /// Checks a SIGN_RESPONSE against the P-256 key derived from `seed`.
    fn verify_p256_reply(reply: &[u8], seed: u8, data: &[u8]) {
        let mut r = reply;
        assert_eq!(u8::decode(&mut r).unwrap(), SSH_AGENT_SIGN_RESPONSE);
        let signature = Vec::<u8>::decode(&mut r).unwrap();
        assert!(r.is_finished());

        let mut sig: &[u8] = &signature;
        assert_eq!(String::decode(&mut sig).unwrap(), "ecdsa-sha2-nistp256");
        let blob = Vec::<u8>::decode(&mut sig).unwrap();
        let mut blob: &[u8] = &blob;
        let r_bytes = kssh_signer::ecdsa::left_pad(&decode_mpint(&mut blob).unwrap(), 32).unwrap();
        let s_bytes = kssh_signer::ecdsa::left_pad(&decode_mpint(&mut blob).unwrap(), 32).unwrap();
        assert!(blob.is_finished());
        let parsed = p256::ecdsa::Signature::from_scalars(
            *p256::FieldBytes::from_slice(&r_bytes),
            *p256::FieldBytes::from_slice(&s_bytes),
        )
        .unwrap();
        let key = p256::ecdsa::SigningKey::from_slice(&[seed; 32]).unwrap();
        key.verifying_key().verify(data, &parsed).unwrap();
    }

    fn add_p256_request(seed: u8, comment: &str, lifetime: Option<u32>) -> Vec<u8> {
        let key = p256::ecdsa::SigningKey::from_slice(&[seed; 32]).unwrap();
        let point = p256::PublicKey::from(key.verifying_key()).to_encoded_point(false);
        let code = if lifetime.is_some() {
            SSH_AGENTC_ADD_ID_CONSTRAINED
        } else {
            SSH_AGENTC_ADD_IDENTITY
        };
        let mut body = message(code, &[b"ecdsa-sha2-nistp256", b"nistp256", point.as_bytes()]);
        encode_mpint(&key.to_bytes(), &mut body).unwrap();
        comment.encode(&mut body).unwrap();
        if let Some(secs) = lifetime {
            body.push(1);
            secs.encode(&mut body).unwrap();
        }
        body
    }

    async fn stop(harness: Harness) {
        harness.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), harness.handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn lists_and_signs_with_loaded_identity() {
        let keyring = KeyRing::new();
        keyring.add(p256_identity(1, "kssh")).unwrap();
        let harness = start(keyring, ServerLimits::default());
        let signer = p256_signer(1);
        let mut client = connect(&harness.path).await;

        let listed = identities(roundtrip(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES]).await);
        assert_eq!(listed.len(), 1);
        assert_eq!(&listed[0].0[..], signer.public_key());
        assert_eq!(listed[0].1, "kssh");

        let reply = roundtrip(&mut client, &sign_request(signer.public_key(), b"hello", 0)).await;
        verify_p256_reply(&reply, 1, b"hello");

        let other = p256_signer(2);
        let reply = roundtrip(&mut client, &sign_request(other.public_key(), b"hello", 0)).await;
        assert_eq!(&reply[..], &[SSH_AGENT_FAILURE]);

        let listed = identities(roundtrip(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES]).await);
        assert_eq!(listed.len(), 1);
        stop(harness).await;
    }

    #[tokio::test]
    async fn malformed_frame_closes_only_that_connection() {
        let keyring = KeyRing::new();
        keyring.add(p256_identity(1, "kssh")).unwrap();
        let harness = start(keyring, ServerLimits::default());

        let mut bad = connect(&harness.path).await;
        let mut good = connect(&harness.path).await;
        send(&mut bad, &[200, 1, 2, 3]).await;
        assert!(recv(&mut bad).await.is_none());

        let mut oversized = connect(&harness.path).await;
        oversized
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(recv(&mut oversized).await.is_none());

        let listed = identities(roundtrip(&mut good, &[SSH_AGENTC_REQUEST_IDENTITIES]).await);
        assert_eq!(listed.len(), 1);
        stop(harness).await;
    }

    #[tokio::test]
    async fn concurrent_clients_are_served_independently() {
        let keyring = KeyRing::new();
        keyring.add(p256_identity(1, "kssh")).unwrap();
        let harness = start(keyring, ServerLimits::default());
        let public_key = Bytes::copy_from_slice(p256_signer(1).public_key());

        let mut clients = JoinSet::new();
        for i in 0..8u8 {
            let path = harness.path.clone();
            let public_key = public_key.clone();
            clients.spawn(async move {
                let mut stream = connect(&path).await;
                for j in 0..5u8 {
                    let listed = identities(
                        roundtrip(&mut stream, &[SSH_AGENTC_REQUEST_IDENTITIES]).await,
                    );
                    assert_eq!(listed.len(), 1);
                    assert_eq!(listed[0].0, public_key);

                    let reply =
                        roundtrip(&mut stream, &sign_request(&listed[0].0, &[i, j], 0)).await;
                    verify_p256_reply(&reply, 1, &[i, j]);
                }
            });
        }
        while let Some(joined) = clients.join_next().await {
            joined.unwrap();
        }
        stop(harness).await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_agent() {
        let keyring = KeyRing::new();
        keyring
            .add(Identity::new(
                Arc::new(StubSigner::panicking(b"boom")),
                "boom",
            ))
            .unwrap();
        let harness = start(keyring, ServerLimits::default());

        let mut victim = connect(&harness.path).await;
        send(&mut victim, &sign_request(b"boom", b"data", 0)).await;
        assert!(recv(&mut victim).await.is_none());

        let mut next = connect(&harness.path).await;
        let listed = identities(roundtrip(&mut next, &[SSH_AGENTC_REQUEST_IDENTITIES]).await);
        assert_eq!(listed.len(), 1);
        stop(harness).await;
    }

    #[tokio::test]
    async fn connections_over_the_limit_are_dropped() {
        let limits = ServerLimits {
            max_connections: 1,
            ..ServerLimits::default()
        };
        let harness = start(KeyRing::new(), limits);

        let mut first = connect(&harness.path).await;
        roundtrip(&mut first, &[SSH_AGENTC_REQUEST_IDENTITIES]).await;

        let mut second = connect(&harness.path).await;
        send(&mut second, &[SSH_AGENTC_REQUEST_IDENTITIES]).await;
        assert!(recv(&mut second).await.is_none());

        drop(first);
        let mut admitted = false;
        for _ in 0..50 {
            let mut retry = connect(&harness.path).await;
            send(&mut retry, &[SSH_AGENTC_REQUEST_IDENTITIES]).await;
            if recv(&mut retry).await.is_some() {
                admitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(admitted);
        stop(harness).await;
    }

    #[tokio::test]
    async fn slow_signer_times_out_as_failure() {
        let keyring = KeyRing::new();
        let gate = Arc::new(Notify::new());
        keyring
            .add(Identity::new(
                Arc::new(StubSigner::gated(b"slow", gate)),
                "slow",
            ))
            .unwrap();
        let limits = ServerLimits {
            sign_timeout: Duration::from_millis(50),
            ..ServerLimits::default()
        };
        let harness = start(keyring, limits);

        let mut client = connect(&harness.path).await;
        let reply = roundtrip(&mut client, &sign_request(b"slow", b"data", 0)).await;
        assert_eq!(&reply[..], &[SSH_AGENT_FAILURE]);
        stop(harness).await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_signature() {
        let keyring = KeyRing::new();
        let gate = Arc::new(Notify::new());
        keyring
            .add(Identity::new(
                Arc::new(StubSigner::gated(b"slow", gate)),
                "slow",
            ))
            .unwrap();
        let harness = start(keyring, ServerLimits::default());

        let mut client = connect(&harness.path).await;
        send(&mut client, &sign_request(b"slow", b"data", 0)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.shutdown.cancel();

        let reply = recv(&mut client).await;
        assert!(reply.is_none() || reply.as_deref() == Some(&[SSH_AGENT_FAILURE][..]));
        stop(harness).await;
    }

    #[tokio::test]
    async fn legacy_and_unsupported_messages() {
        let harness = start(KeyRing::new(), ServerLimits::default());
        let mut client = connect(&harness.path).await;

        let reply = roundtrip(&mut client, &[SSH_AGENTC_REQUEST_RSA_IDENTITIES]).await;
        assert_eq!(&reply[..], &[SSH_AGENT_RSA_IDENTITIES_ANSWER, 0, 0, 0, 0]);
        let reply = roundtrip(&mut client, &[SSH_AGENTC_REMOVE_ALL_RSA_IDENTITIES]).await;
        assert_eq!(&reply[..], &[SSH_AGENT_SUCCESS]);

        let mut ext = message(SSH_AGENTC_EXTENSION, &[b"session-bind@openssh.com"]);
        ext.extend_from_slice(b"opaque");
        let reply = roundtrip(&mut client, &ext).await;
        assert_eq!(&reply[..], &[SSH_AGENT_FAILURE]);

        let smartcard = message(
            SSH_AGENTC_ADD_SMARTCARD_KEY,
            &[b"/usr/lib/pkcs11.so", b"1234"],
        );
        let reply = roundtrip(&mut client, &smartcard).await;
        assert_eq!(&reply[..], &[SSH_AGENT_FAILURE]);
        stop(harness).await;
    }

    #[tokio::test]
    async fn identities_can_be_managed_over_the_socket() {
        let harness = start(KeyRing::new(), ServerLimits::default());
        let mut client = connect(&harness.path).await;

        let reply = roundtrip(&mut client, &add_p256_request(3, "added", None)).await;
        assert_eq!(&reply[..], &[SSH_AGENT_SUCCESS]);
        let reply = roundtrip(&mut client, &add_p256_request(3, "again", None)).await;
        assert_eq!(&reply[..], &[SSH_AGENT_FAILURE]);
        let reply = roundtrip(&mut client, &add_p256_request(4, "timed", Some(3600))).await;
        assert_eq!(&reply[..], &[SSH_AGENT_SUCCESS]);

        let listed = identities(roundtrip(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES]).await);
        let comments: Vec<&str> = listed.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(comments, ["added", "timed"]);

        let lock = message(SSH_AGENTC_LOCK, &[b"pw"]);
        assert_eq!(&roundtrip(&mut client, &lock).await[..], &[SSH_AGENT_SUCCESS]);
        assert!(harness.keyring.is_locked());
        let listed = identities(roundtrip(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES]).await);
        assert!(listed.is_empty());

        let wrong = message(SSH_AGENTC_UNLOCK, &[b"pq"]);
        assert_eq!(&roundtrip(&mut client, &wrong).await[..], &[SSH_AGENT_FAILURE]);
        assert!(harness.keyring.is_locked());
        let unlock = message(SSH_AGENTC_UNLOCK, &[b"pw"]);
        assert_eq!(&roundtrip(&mut client, &unlock).await[..], &[SSH_AGENT_SUCCESS]);

        let remove = message(SSH_AGENTC_REMOVE_IDENTITY, &[&listed_key(&harness, 0)]);
        assert_eq!(&roundtrip(&mut client, &remove).await[..], &[SSH_AGENT_SUCCESS]);
        assert_eq!(&roundtrip(&mut client, &remove).await[..], &[SSH_AGENT_FAILURE]);

        let reply = roundtrip(&mut client, &[SSH_AGENTC_REMOVE_ALL_IDENTITIES]).await;
        assert_eq!(&reply[..], &[SSH_AGENT_SUCCESS]);
        assert!(harness.keyring.is_empty());
        stop(harness).await;
    }

    fn listed_key(harness: &Harness, index: usize) -> Bytes {
        harness.keyring.list()[index].public_key.clone()
    }

    #[tokio::test]
    async fn russh_agent_client_understands_the_agent() {
        let keyring = KeyRing::new();
        keyring.add(p256_identity(1, "kssh")).unwrap();
        let harness = start(keyring, ServerLimits::default());

        let stream = connect(&harness.path).await;
        let mut client = russh::keys::agent::client::AgentClient::connect(stream);
        let keys = client.request_identities().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(
            keys[0].fingerprint(russh::keys::HashAlg::Sha256).to_string(),
            fingerprint(p256_signer(1).public_key())
        );

        client.remove_all_identities().await.unwrap();
        assert!(harness.keyring.is_empty());
        stop(harness).await;
    }

    #[tokio::test]
    async fn accept_loop_stops_on_cancel_with_idle_clients() {
        let harness = start(KeyRing::new(), ServerLimits::default());
        let mut idle = connect(&harness.path).await;
        roundtrip(&mut idle, &[SSH_AGENTC_REQUEST_IDENTITIES]).await;
        stop(harness).await;
        assert!(recv(&mut idle).await.is_none());
    }
}
