use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

use crate::channel::transport::{boxed, BoxedStream};
use crate::channel::wire::{FrameReader, FrameWriter};
use crate::error::{ExceptionType, TgError, TgResult};
use crate::pdu::factory::DefaultMessageFactory;
use crate::pdu::message::ProtocolMessage;
use crate::pdu::payloads::{accept_challenge, AuthenticateRequest, AuthenticateResponse, ExceptionPayload, HandshakeRequestType, HandshakeResponse, HandshakeStatus, Payload};
use crate::pdu::sequence::SequenceGenerator;
use crate::pdu::verb_id::VerbId;

pub const CHALLENGE: i64 = 1_234_567;

const MAX_FRAME_LEN: usize = 1024*1024;

/// What the server does with a newly accepted connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AcceptMode {
    /// handshake, authenticate, then serve requests
    Serve,
    /// close the connection right after accepting it
    Drop,
    /// answer the handshake with a failed challenge
    FailChallenge,
    RejectAuthentication,
    /// send a session termination frame right after accepting the connection
    Terminate(String),
}

/// The server's reaction to a request
#[derive(Debug, Clone)]
pub enum ServerAction {
    Reply(VerbId, Payload),
    ReplyAfter(Duration, VerbId, Payload),
    Exception(ExceptionType, String),
    Ignore,
    /// close the connection without replying
    Drop,
    Terminate(String),
}

/// Maps a request and the number of the connection it arrived on to the server's reaction
pub type RequestHandler = Arc<dyn Fn(&ProtocolMessage, usize) -> ServerAction + Send + Sync>;

/// The default reaction: a query response that echoes the request's payload
pub fn echo(msg: &ProtocolMessage, _connection: usize) -> ServerAction {
    ServerAction::Reply(VerbId::QueryResponse, msg.payload().clone())
}

struct Shared {
    tls: Option<TlsAcceptor>,
    accept_mode: std::sync::Mutex<AcceptMode>,
    handler: std::sync::Mutex<RequestHandler>,
    sequence: SequenceGenerator,
    accepts: AtomicUsize,
    pings: AtomicUsize,
    disconnect_requests: AtomicUsize,
    initiations: std::sync::Mutex<Vec<bool>>,
    handshakes: std::sync::Mutex<Vec<bool>>,
    authentications: std::sync::Mutex<Vec<AuthenticateRequest>>,
    received: std::sync::Mutex<Vec<ProtocolMessage>>,
    kill: watch::Sender<u64>,
}

impl Shared {
    fn accept_mode(&self) -> AcceptMode {
        self.accept_mode.lock().unwrap().clone()
    }

    fn handler(&self) -> RequestHandler {
        self.handler.lock().unwrap().clone()
    }

    fn message(&self, verb_id: VerbId, payload: Payload, request_id: i64) -> ProtocolMessage {
        let mut msg = ProtocolMessage::new(verb_id, payload, &self.sequence);
        msg.set_request_id(request_id);
        msg
    }
}

/// An in-process TGDB server for end-to-end channel tests. It speaks the wire protocol including
///  handshake and authentication, records what it receives, and reacts to requests as scripted
///  by a [RequestHandler].
pub struct MockServer {
    addr: SocketAddr,
    certificate: Option<CertificateDer<'static>>,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.shared.kill.send_modify(|generation| *generation += 1);
    }
}

impl MockServer {
    pub async fn start() -> MockServer {
        MockServer::start_with(None, None).await
    }

    /// A server speaking TLS with a freshly generated self signed certificate for 'localhost'
    pub async fn start_tls() -> MockServer {
        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let certificate = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![certificate.clone()], key)
            .unwrap();
        MockServer::start_with(Some(TlsAcceptor::from(Arc::new(tls_config))), Some(certificate)).await
    }

    async fn start_with(tls: Option<TlsAcceptor>, certificate: Option<CertificateDer<'static>>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler: RequestHandler = Arc::new(echo);

        let shared = Arc::new(Shared {
            tls,
            accept_mode: std::sync::Mutex::new(AcceptMode::Serve),
            handler: std::sync::Mutex::new(handler),
            sequence: SequenceGenerator::new(),
            accepts: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            disconnect_requests: AtomicUsize::new(0),
            initiations: Default::default(),
            handshakes: Default::default(),
            authentications: Default::default(),
            received: Default::default(),
            kill: watch::Sender::new(0),
        });

        let handle = tokio::spawn(accept_loop(listener, shared.clone()));
        MockServer {
            addr,
            certificate,
            shared,
            handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// 'host:port' for use in a failover host list
    pub fn host_and_port(&self) -> String {
        format!("127.0.0.1:{}", self.port())
    }

    pub fn url(&self) -> String {
        match self.shared.tls {
            Some(_) => format!("ssl://localhost:{}", self.port()),
            None => format!("tcp://127.0.0.1:{}", self.port()),
        }
    }

    pub fn certificate(&self) -> Option<CertificateDer<'static>> {
        self.certificate.clone()
    }

    pub fn set_accept_mode(&self, mode: AcceptMode) {
        *self.shared.accept_mode.lock().unwrap() = mode;
    }

    pub fn set_handler(&self, handler: impl Fn(&ProtocolMessage, usize) -> ServerAction + Send + Sync + 'static) {
        let handler: RequestHandler = Arc::new(handler);
        *self.shared.handler.lock().unwrap() = handler;
    }

    /// Close all currently open connections, simulating a network failure
    pub fn drop_connections(&self) {
        self.shared.kill.send_modify(|generation| *generation += 1);
    }

    pub fn num_accepts(&self) -> usize {
        self.shared.accepts.load(Ordering::SeqCst)
    }

    pub fn num_pings(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    pub fn num_disconnect_requests(&self) -> usize {
        self.shared.disconnect_requests.load(Ordering::SeqCst)
    }

    /// the 'ssl mode' flag of every handshake initiation
    pub fn initiations(&self) -> Vec<bool> {
        self.shared.initiations.lock().unwrap().clone()
    }

    /// the 'ssl mode' flag of every completed handshake
    pub fn handshakes(&self) -> Vec<bool> {
        self.shared.handshakes.lock().unwrap().clone()
    }

    pub fn authentications(&self) -> Vec<AuthenticateRequest> {
        self.shared.authentications.lock().unwrap().clone()
    }

    /// all requests received after authentication, except pings and disconnect requests
    pub fn received(&self) -> Vec<ProtocolMessage> {
        self.shared.received.lock().unwrap().clone()
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let socket = match listener.accept().await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!("mock server: error accepting connection: {}", e);
                return;
            }
        };

        let connection = shared.accepts.fetch_add(1, Ordering::SeqCst) + 1;
        if shared.accept_mode() == AcceptMode::Drop {
            debug!("mock server: dropping connection {}", connection);
            continue;
        }

        let shared = shared.clone();
        tokio::spawn(async move {
            let stream = match wrap(socket, &shared).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("mock server: TLS accept failed on connection {}: {}", connection, e);
                    return;
                }
            };
            if let Err(e) = serve(stream, connection, &shared).await {
                debug!("mock server: connection {} ended: {}", connection, e);
            }
        });
    }
}

async fn wrap(socket: TcpStream, shared: &Shared) -> TgResult<BoxedStream> {
    match &shared.tls {
        Some(acceptor) => Ok(boxed(acceptor.accept(socket).await?)),
        None => Ok(boxed(socket)),
    }
}

async fn serve(stream: BoxedStream, connection: usize, shared: &Arc<Shared>) -> TgResult<()> {
    let factory = DefaultMessageFactory::default();
    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read, MAX_FRAME_LEN);
    let writer = Arc::new(Mutex::new(FrameWriter::new(write)));
    let mut kill = shared.kill.subscribe();
    kill.borrow_and_update();

    let accept_mode = shared.accept_mode();
    if let AcceptMode::Terminate(reason) = &accept_mode {
        return terminate(&writer, &mut reader, shared, reason).await;
    }

    // handshake
    let initiate = reader.read_message(&factory).await?;
    match initiate.payload() {
        Payload::HandshakeRequest(r) if r.request_type == HandshakeRequestType::Initiate => {
            shared.initiations.lock().unwrap().push(r.ssl_mode);
        }
        other => return Err(TgError::General(format!("expected handshake initiation, got {:?}", other))),
    }
    let challenge = HandshakeResponse {
        status: HandshakeStatus::AcceptChallenge,
        challenge: CHALLENGE,
        error_message: None,
    };
    writer.lock().await
        .write_message(&shared.message(VerbId::HandshakeResponse, Payload::HandshakeResponse(challenge), initiate.request_id()))
        .await?;

    let accepted = reader.read_message(&factory).await?;
    let (status, error_message) = match accepted.payload() {
        Payload::HandshakeRequest(r) if accept_mode != AcceptMode::FailChallenge
            && r.request_type == HandshakeRequestType::ChallengeAccepted
            && r.challenge == accept_challenge(CHALLENGE) =>
        {
            shared.handshakes.lock().unwrap().push(r.ssl_mode);
            (HandshakeStatus::ProceedWithAuthentication, None)
        }
        _ => (HandshakeStatus::ChallengeFailed, Some("challenge response mismatch".to_string())),
    };
    let response = HandshakeResponse {
        status,
        challenge: 0,
        error_message,
    };
    writer.lock().await
        .write_message(&shared.message(VerbId::HandshakeResponse, Payload::HandshakeResponse(response), accepted.request_id()))
        .await?;
    if status != HandshakeStatus::ProceedWithAuthentication {
        return Ok(());
    }

    // authentication
    let authenticate = reader.read_message(&factory).await?;
    match authenticate.payload() {
        Payload::AuthenticateRequest(r) => shared.authentications.lock().unwrap().push(r.clone()),
        other => return Err(TgError::General(format!("expected authentication request, got {:?}", other))),
    }
    let response = if accept_mode == AcceptMode::RejectAuthentication {
        AuthenticateResponse::Failure { error_status: 1 }
    }
    else {
        AuthenticateResponse::Success {
            auth_token: 1000 + connection as i64,
            session_id: 2000 + connection as i64,
            server_certificate: Bytes::new(),
        }
    };
    writer.lock().await
        .write_message(&shared.message(VerbId::AuthenticateResponse, Payload::AuthenticateResponse(response), authenticate.request_id()))
        .await?;

    loop {
        let request = select! {
            _ = kill.changed() => {
                debug!("mock server: dropping connection {}", connection);
                return writer.lock().await.shutdown().await;
            }
            r = reader.read_message(&factory) => r?,
        };

        match request.verb_id() {
            VerbId::Ping => {
                shared.pings.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            VerbId::DisconnectChannelRequest => {
                shared.disconnect_requests.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            _ => {}
        }

        trace!("mock server: received {:?}", request.header());
        shared.received.lock().unwrap().push(request.clone());

        let request_id = request.request_id();
        match (shared.handler())(&request, connection) {
            ServerAction::Reply(verb_id, payload) => {
                writer.lock().await.write_message(&shared.message(verb_id, payload, request_id)).await?;
            }
            ServerAction::ReplyAfter(delay, verb_id, payload) => {
                let reply = shared.message(verb_id, payload, request_id);
                let writer = writer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = writer.lock().await.write_message(&reply).await {
                        debug!("mock server: delayed reply failed: {}", e);
                    }
                });
            }
            ServerAction::Exception(exception_type, message) => {
                let payload = Payload::Exception(ExceptionPayload::new(exception_type, message));
                writer.lock().await.write_message(&shared.message(VerbId::ExceptionMessage, payload, request_id)).await?;
            }
            ServerAction::Ignore => {}
            ServerAction::Drop => {
                debug!("mock server: dropping connection {} on request", connection);
                return writer.lock().await.shutdown().await;
            }
            ServerAction::Terminate(reason) => {
                return terminate(&writer, &mut reader, shared, &reason).await;
            }
        }
    }
}

/// Send a termination frame, then consume whatever the client still sends until it closes the
///  connection. Closing with unread data would reset the connection and could discard the frame.
async fn terminate(writer: &Mutex<FrameWriter>, reader: &mut FrameReader, shared: &Shared, reason: &str) -> TgResult<()> {
    let payload = Payload::SessionForcefullyTerminated(ExceptionPayload::new(ExceptionType::DisconnectedException, reason));
    {
        let mut writer = writer.lock().await;
        writer.write_message(&shared.message(VerbId::SessionForcefullyTerminated, payload, 0)).await?;
        writer.shutdown().await?;
    }

    let drain = async {
        while reader.read_frame().await.is_ok() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        debug!("mock server: client did not close the terminated connection");
    }
    Ok(())
}
