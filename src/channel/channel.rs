use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::channel::config::ChannelConfig;
use crate::channel::environment::ChannelEnvironment;
use crate::channel::link_state::{LinkState, LinkStateCell, LinkStatus};
use crate::channel::link_url::{LinkUrl, Protocol};
use crate::channel::pinger::Pingable;
use crate::channel::reader::{ChannelReader, ReaderEvents};
use crate::channel::response::{ChannelResponse, ResponseStatus, ResponseTable};
use crate::channel::transport::{TcpTransport, TlsTransport, Transport};
use crate::channel::wire::{request_reply, FrameReader, FrameWriter};
use crate::error::{ExceptionType, TgError, TgResult};
use crate::pdu::factory::decode_frame;
use crate::pdu::message::ProtocolMessage;
use crate::pdu::payloads::{accept_challenge, AuthenticateRequest, AuthenticateResponse, ExceptionPayload, HandshakeRequest, HandshakeRequestType, HandshakeResponse, HandshakeStatus, Payload};
use crate::pdu::verb_id::VerbId;

/// How an operation that failed on a channel's connection should continue
#[derive(Debug)]
pub enum ExceptionHandleResult {
    /// the channel is connected again, the operation should be repeated
    RetryOperation,
    Disconnected,
    /// the failure can not be healed by reconnecting
    RethrowException(TgError),
}

/// The result of a single attempt to send a message
#[derive(Debug)]
pub enum SendOutcome {
    /// `None` if no reply is awaited
    Delivered(Option<ProtocolMessage>),
    Retry,
    Fatal(TgError),
}

impl From<ExceptionHandleResult> for SendOutcome {
    fn from(value: ExceptionHandleResult) -> Self {
        match value {
            ExceptionHandleResult::RetryOperation => SendOutcome::Retry,
            ExceptionHandleResult::Disconnected => SendOutcome::Fatal(TgError::Disconnected("channel is disconnected".to_string())),
            ExceptionHandleResult::RethrowException(e) => SendOutcome::Fatal(e),
        }
    }
}

/// The transport for a URL's protocol
pub fn transport_for(url: &LinkUrl, config: &ChannelConfig) -> TgResult<Arc<dyn Transport>> {
    match url.protocol() {
        Protocol::Tcp => Ok(Arc::new(TcpTransport::new(config)?)),
        Protocol::Ssl => Ok(Arc::new(TlsTransport::new(config, Vec::new())?)),
        Protocol::Http | Protocol::Https => Err(TgError::General(format!("protocol {} is not supported for channels", url.protocol().as_str()))),
    }
}

fn config_error(e: anyhow::Error) -> TgError {
    TgError::General(format!("{:#}", e))
}

/// A client's connection to a TGDB server, including failover to alternative endpoints and
///  transparent reconnects.
///
/// Requests are correlated with their replies by request id, so any number of tasks can send
///  concurrently. Frame writes are serialized, and a single reader task per connection dispatches
///  replies.
///
/// Lock order: `exception_lock` before `state_lock` before `writer`.
pub struct Channel {
    id: u64,
    myself: Weak<Channel>,
    env: ChannelEnvironment,
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    urls: Vec<LinkUrl>,
    /// index of the endpoint that was connected last
    url_index: AtomicUsize,
    link_state: LinkStateCell,
    num_refs: AtomicUsize,
    responses: ResponseTable,
    /// serializes connect, reconnect, stop and termination
    state_lock: Mutex<()>,
    /// held by the task that drives a reconnect, other failing tasks wait for its outcome
    exception_lock: Mutex<()>,
    writer: Mutex<Option<FrameWriter>>,
    reader: std::sync::Mutex<Option<ChannelReader>>,
    auth_token: AtomicI64,
    session_id: AtomicI64,
    needs_ping: AtomicBool,
    ping_suspended: AtomicBool,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel{{id:{},url:{},state:{}}}", self.id, self.current_url(), self.link_state.get())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let pinger = self.env.pinger.clone();
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                pinger.deregister(id).await;
            });
        }
    }
}

impl Channel {
    /// A channel for a URL of the form `protocol://[user@]host:port[/{name=value;...}]`, configured
    ///  by the URL's properties
    pub fn new(url: &str, env: ChannelEnvironment) -> TgResult<Arc<Channel>> {
        let url = LinkUrl::parse(url).map_err(config_error)?;
        let config = ChannelConfig::from_properties(url.properties()).map_err(config_error)?;
        let transport = transport_for(&url, &config)?;
        Channel::with_transport(url, config, transport, env)
    }

    pub fn with_transport(url: LinkUrl, config: ChannelConfig, transport: Arc<dyn Transport>, env: ChannelEnvironment) -> TgResult<Arc<Channel>> {
        config.validate().map_err(config_error)?;
        if matches!(url.protocol(), Protocol::Http | Protocol::Https) {
            return Err(TgError::General(format!("protocol {} is not supported for channels", url.protocol().as_str())));
        }
        let urls = url.failover_urls().map_err(config_error)?;
        let id = env.next_channel_id();
        debug!("creating channel {} for {} with {} endpoint(s) using {:?}", id, url, urls.len(), transport);

        Ok(Arc::new_cyclic(|myself| Channel {
            id,
            myself: myself.clone(),
            env,
            config,
            transport,
            urls,
            url_index: AtomicUsize::new(0),
            link_state: Default::default(),
            num_refs: AtomicUsize::new(0),
            responses: Default::default(),
            state_lock: Mutex::new(()),
            exception_lock: Mutex::new(()),
            writer: Mutex::new(None),
            reader: std::sync::Mutex::new(None),
            auth_token: AtomicI64::new(0),
            session_id: AtomicI64::new(0),
            needs_ping: AtomicBool::new(false),
            ping_suspended: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state.get()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link_state.status()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state.get() == LinkState::Connected
    }

    /// the number of logical connections sharing this channel
    pub fn num_refs(&self) -> usize {
        self.num_refs.load(Ordering::Acquire)
    }

    pub fn auth_token(&self) -> i64 {
        self.auth_token.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> i64 {
        self.session_id.load(Ordering::Acquire)
    }

    /// the endpoint this channel is (or was last) connected to
    pub fn current_url(&self) -> &LinkUrl {
        &self.urls[self.url_index.load(Ordering::Acquire) % self.urls.len()]
    }

    pub fn num_pending_requests(&self) -> usize {
        self.responses.len()
    }

    /// A new message with the next sequence number of this channel's environment
    pub fn new_message(&self, verb_id: VerbId, payload: Payload) -> ProtocolMessage {
        ProtocolMessage::new(verb_id, payload, &self.env.sequence)
    }

    /// Connect to the server. If the channel is connected already, this just adds a logical
    ///  connection.
    #[tracing::instrument(name = "connect", skip(self), fields(channel = self.id))]
    pub async fn connect(&self) -> TgResult<()> {
        let _state_guard = self.state_lock.lock().await;
        match self.link_state.get() {
            LinkState::Connected => {
                let num_refs = self.num_refs.fetch_add(1, Ordering::AcqRel) + 1;
                debug!("already connected, now {} logical connections", num_refs);
                return Ok(());
            }
            LinkState::NotConnected | LinkState::Closed => {}
            other => return Err(TgError::Disconnected(format!("connect called in link state {}", other))),
        }

        let (frames, writer) = self.try_repeat_connect(false).await?;
        self.install_connection(frames, writer).await?;
        self.num_refs.store(1, Ordering::Release);
        info!("connected to {}", self.current_url());
        Ok(())
    }

    /// Release one logical connection. This does not close the underlying connection, see
    ///  [Channel::stop].
    pub async fn disconnect(&self) {
        let _state_guard = self.state_lock.lock().await;
        if !self.is_connected() {
            return;
        }

        let prev = self.num_refs.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(prev) => debug!("released a logical connection, {} left", prev - 1),
            Err(_) => error!("disconnect called more often than connect"),
        }
    }

    /// Close the connection if there are no logical connections left, or regardless of them if
    ///  `force` is set
    pub async fn stop(&self, force: bool) -> TgResult<()> {
        let _state_guard = self.state_lock.lock().await;
        if !self.is_connected() {
            return Ok(());
        }
        if !force && self.num_refs() > 0 {
            debug!("not stopping channel with {} logical connections", self.num_refs());
            return Ok(());
        }

        info!("stopping channel {}", self.id);
        // held from the disconnect notice until the stream is closed, senders that get the lock
        //  afterwards find the channel closing
        let mut writer = self.writer.lock().await;
        self.link_state.transition(LinkState::Closing)?;
        if let Some(writer) = writer.as_mut() {
            let mut msg = self.new_message(VerbId::DisconnectChannelRequest, Payload::DisconnectChannel);
            self.stamp_session(&mut msg);
            if let Err(e) = writer.write_message(&msg).await {
                debug!("disconnect notice could not be sent: {}", e);
            }
        }
        self.close_connection_locked(&mut writer).await;
        drop(writer);
        self.link_state.transition(LinkState::Closed)?;

        self.env.pinger.deregister(self.id).await;
        self.responses.fail_all(ExceptionType::DisconnectedException, "channel was stopped");
        Ok(())
    }

    /// Send a message without waiting for a reply. The message is resent if the channel reconnects
    ///  while it is sent.
    pub async fn send_message(&self, msg: &mut ProtocolMessage) -> TgResult<()> {
        loop {
            match self.try_send_message(msg).await {
                SendOutcome::Delivered(_) => return Ok(()),
                SendOutcome::Retry => {
                    debug!("resending {:?} after reconnect", msg.verb_id());
                    msg.update_sequence_and_timestamp(&self.env.sequence);
                }
                SendOutcome::Fatal(e) => return Err(e),
            }
        }
    }

    /// Send a request and wait for its reply if `response` is a blocking response. For a callback
    ///  response, this returns `None` once the request is sent.
    ///
    /// A request that is lost to a reconnect, or that the server answers with a 'retry' exception,
    ///  is sent again if `resend` is set. Otherwise this fails with [TgError::RetryIo].
    pub async fn send_request(&self, msg: &mut ProtocolMessage, response: &Arc<ChannelResponse>, resend: bool) -> TgResult<Option<ProtocolMessage>> {
        loop {
            match self.try_send_request(msg, response).await {
                SendOutcome::Delivered(reply) => return Ok(reply),
                SendOutcome::Retry => {
                    if !resend {
                        return Err(TgError::RetryIo(format!("request {} was not resent", msg.request_id())));
                    }
                    debug!("resending request {} ({:?})", msg.request_id(), msg.verb_id());
                    response.reset();
                    msg.update_sequence_and_timestamp(&self.env.sequence);
                }
                SendOutcome::Fatal(e) => return Err(e),
            }
        }
    }

    /// Send a request and wait for its reply, using the configured response timeout
    pub async fn request(&self, mut msg: ProtocolMessage) -> TgResult<ProtocolMessage> {
        let response = ChannelResponse::blocking(self.config.response_timeout);
        self.send_request(&mut msg, &response, true).await?
            .ok_or_else(|| TgError::General(format!("no reply for request {}", msg.request_id())))
    }

    fn stamp_session(&self, msg: &mut ProtocolMessage) {
        msg.set_auth_token(self.auth_token());
        msg.set_session_id(self.session_id());
    }

    /// The epoch of the current connection, or the outcome of a send attempt if there is no usable
    ///  connection. A channel that is reconnecting is waited for.
    async fn connected_epoch(&self) -> Result<u64, SendOutcome> {
        let status = self.link_state.status();
        match status.state {
            LinkState::Connected => Ok(status.epoch),
            LinkState::Reconnecting => Err(self.wait_for_reconnect(status.epoch).await.into()),
            other => Err(SendOutcome::Fatal(TgError::Disconnected(format!("channel is {}", other)))),
        }
    }

    async fn try_send_message(&self, msg: &mut ProtocolMessage) -> SendOutcome {
        let epoch = match self.connected_epoch().await {
            Ok(epoch) => epoch,
            Err(outcome) => return outcome,
        };

        self.stamp_session(msg);
        match self.write_once(msg).await {
            Ok(()) => SendOutcome::Delivered(None),
            Err(e) => self.handle_exception(e, epoch).await.into(),
        }
    }

    async fn try_send_request(&self, msg: &mut ProtocolMessage, response: &Arc<ChannelResponse>) -> SendOutcome {
        let epoch = match self.connected_epoch().await {
            Ok(epoch) => epoch,
            Err(outcome) => return outcome,
        };

        // registered before sending so the reply can not overtake the registration
        let request_id = self.responses.register(response);
        msg.set_request_id(request_id);
        self.stamp_session(msg);

        if let Err(e) = self.write_once(msg).await {
            self.responses.remove(request_id);
            return self.handle_exception(e, epoch).await.into();
        }

        if !response.is_blocking() {
            return SendOutcome::Delivered(None);
        }

        let status = response.wait().await;
        self.responses.remove(request_id);
        match status {
            ResponseStatus::Ok => {
                let reply = match response.take_reply() {
                    Some(reply) => reply,
                    None => return SendOutcome::Fatal(TgError::General(format!("reply for request {} was consumed already", request_id))),
                };
                match reply.exception() {
                    Some(e) if e.exception_type == ExceptionType::RetryIOException => {
                        debug!("request {} must be retried: {}", request_id, e.message);
                        SendOutcome::Retry
                    }
                    Some(e) => SendOutcome::Fatal(TgError::from_exception(e.exception_type, e.message.clone())),
                    None => SendOutcome::Delivered(Some(reply)),
                }
            }
            ResponseStatus::TimedOut => {
                warn!("no reply for request {} within {:?}", request_id, response.timeout());
                SendOutcome::Fatal(TgError::ResponseTimeout(response.timeout().unwrap_or_default()))
            }
            ResponseStatus::Waiting => SendOutcome::Fatal(TgError::General(format!("stopped waiting for request {} without a reply", request_id))),
        }
    }

    /// Write a single frame under the send lock
    async fn write_once(&self, msg: &ProtocolMessage) -> TgResult<()> {
        let frame = msg.to_bytes()?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => {
                trace!(verb = ?msg.verb_id(), len = frame.len(), "sending message");
                writer.write_frame(&frame).await?;
                self.needs_ping.store(false, Ordering::Release);
                Ok(())
            }
            None => Err(TgError::RetryIo("channel has no open connection".to_string())),
        }
    }

    /// Decide how to continue after an operation failed on the connection of the given epoch.
    ///
    /// Only I/O failures are healed, by reconnecting. The first task that fails drives the reconnect,
    ///  tasks failing concurrently wait for its outcome.
    async fn handle_exception(&self, err: TgError, epoch: u64) -> ExceptionHandleResult {
        if !err.is_io() {
            return ExceptionHandleResult::RethrowException(err);
        }

        let status = self.link_state.status();
        if status.state.is_closed() {
            return ExceptionHandleResult::Disconnected;
        }
        if status.state == LinkState::Connected && status.epoch != epoch {
            trace!("channel was reconnected since the failure: {}", err);
            return ExceptionHandleResult::RetryOperation;
        }

        match self.exception_lock.try_lock() {
            Ok(_exception_guard) => {
                warn!("I/O failure on channel {}, reconnecting: {}", self.id, err);
                self.reconnect(epoch).await
            }
            Err(_) => {
                debug!("reconnect in progress, waiting for it: {}", err);
                self.wait_for_reconnect(epoch).await
            }
        }
    }

    async fn wait_for_reconnect(&self, failed_epoch: u64) -> ExceptionHandleResult {
        let mut status = self.link_state.subscribe();
        let done = status.wait_for(|s| s.state.is_closed() || (s.state == LinkState::Connected && s.epoch != failed_epoch));

        // bound to a local so the borrow of `status` ends before `status` is dropped
        let result = match tokio::time::timeout(self.config.operation_timeout, done).await {
            Ok(Ok(s)) if s.state == LinkState::Connected => ExceptionHandleResult::RetryOperation,
            Ok(_) => ExceptionHandleResult::Disconnected,
            Err(_) => ExceptionHandleResult::RethrowException(TgError::ConnectionTimeout(format!("reconnect did not finish within {:?}", self.config.operation_timeout))),
        };
        result
    }

    /// Called with the exception lock held
    #[tracing::instrument(skip(self), fields(channel = self.id))]
    async fn reconnect(&self, failed_epoch: u64) -> ExceptionHandleResult {
        let _state_guard = self.state_lock.lock().await;

        let status = self.link_state.status();
        if status.state != LinkState::Connected {
            return ExceptionHandleResult::Disconnected;
        }
        if status.epoch != failed_epoch {
            return ExceptionHandleResult::RetryOperation;
        }

        if let Err(e) = self.link_state.transition(LinkState::Reconnecting) {
            return ExceptionHandleResult::RethrowException(e);
        }
        self.ping_suspended.store(true, Ordering::Release);
        self.close_connection().await;

        match self.try_repeat_connect(true).await {
            Ok((frames, writer)) => {
                // replies to requests on the old connection are lost
                self.responses.fail_all(ExceptionType::RetryIOException, "channel was reconnected");
                if let Err(e) = self.install_connection(frames, writer).await {
                    return ExceptionHandleResult::RethrowException(e);
                }
                info!("reconnected to {}", self.current_url());
                ExceptionHandleResult::RetryOperation
            }
            Err(e) => {
                error!("reconnect failed, closing channel: {}", e);
                if let Err(e) = self.link_state.transition(LinkState::Closed) {
                    warn!("{}", e);
                }
                self.responses.fail_all(ExceptionType::DisconnectedException, &e.to_string());
                self.env.pinger.deregister(self.id).await;
                ExceptionHandleResult::Disconnected
            }
        }
    }

    /// Handles failures that are detected outside of a sender's call: reading, and pinging. A
    ///  failure that can not be healed closes the channel.
    async fn on_connection_failure(&self, err: TgError, epoch: u64) -> ExceptionHandleResult {
        if err.is_io() {
            return self.handle_exception(err, epoch).await;
        }

        let _state_guard = self.state_lock.lock().await;
        if self.is_connected() && self.link_state.status().epoch == epoch {
            error!("closing channel {} after unrecoverable error: {}", self.id, err);
            let _ = self.link_state.transition(LinkState::Closing);
            self.close_connection().await;
            let _ = self.link_state.transition(LinkState::Closed);
            self.responses.fail_all(ExceptionType::DisconnectedException, &format!("channel closed after error: {}", err));
            self.env.pinger.deregister(self.id).await;
        }
        ExceptionHandleResult::RethrowException(err)
    }

    async fn terminate(&self, reason: ExceptionPayload) {
        let _state_guard = self.state_lock.lock().await;
        if self.link_state.get().is_closed() {
            return;
        }

        warn!("channel {} terminated by the server: {}", self.id, reason.message);
        if let Err(e) = self.link_state.transition(LinkState::Terminated) {
            warn!("{}", e);
        }
        self.close_connection().await;
        self.responses.fail_all(ExceptionType::DisconnectedException, &reason.message);
        self.env.pinger.deregister(self.id).await;
    }

    fn lock_reader(&self) -> std::sync::MutexGuard<'_, Option<ChannelReader>> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make a freshly established connection the channel's current connection
    async fn install_connection(&self, frames: FrameReader, writer: FrameWriter) -> TgResult<()> {
        *self.writer.lock().await = Some(writer);
        self.needs_ping.store(false, Ordering::Release);
        self.ping_suspended.store(false, Ordering::Release);
        self.link_state.transition(LinkState::Connected)?;

        let epoch = self.link_state.status().epoch;
        let events: Weak<dyn ReaderEvents> = self.myself.clone();
        let reader = ChannelReader::start(frames, self.env.message_factory.clone(), events, epoch);
        *self.lock_reader() = Some(reader);

        let pingable: Weak<dyn Pingable> = self.myself.clone();
        self.env.pinger.register(self.id, pingable, self.config.ping_interval).await;
        Ok(())
    }

    async fn close_connection(&self) {
        let mut writer = self.writer.lock().await;
        self.close_connection_locked(&mut writer).await;
    }

    /// Close the current connection, with the send lock already held by the caller
    async fn close_connection_locked(&self, writer: &mut Option<FrameWriter>) {
        if let Some(reader) = self.lock_reader().take() {
            reader.stop();
        }
        if let Some(mut writer) = writer.take() {
            if let Err(e) = self.transport.close_stream(&mut writer).await {
                debug!("error closing connection: {}", e);
            }
        }
    }

    /// Walk the failover set until an endpoint accepts a connection. Each endpoint is tried up to
    ///  the configured retry count. A reconnect starts with the endpoint after the one that failed.
    async fn try_repeat_connect(&self, reconnect: bool) -> TgResult<(FrameReader, FrameWriter)> {
        let num_urls = self.urls.len();
        let first = if reconnect {
            (self.url_index.load(Ordering::Acquire) + 1) % num_urls
        }
        else {
            self.url_index.load(Ordering::Acquire) % num_urls
        };
        let retry_count = self.config.ft_retry_count.max(1);

        let mut num_attempts = 0;
        let mut last_err = None;
        for offset in 0..num_urls {
            let index = (first + offset) % num_urls;
            let url = &self.urls[index];

            for attempt in 1..=retry_count {
                if attempt > 1 {
                    tokio::time::sleep(self.config.ft_retry_interval).await;
                }
                num_attempts += 1;

                match self.connect_once(url).await {
                    Ok(connection) => {
                        self.url_index.store(index, Ordering::Release);
                        return Ok(connection);
                    }
                    Err(e) if e.is_terminal_for_connect() => {
                        warn!("connecting to {} failed, not retrying: {}", url, e);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!("attempt {} of {} to connect to {} failed: {}", attempt, retry_count, url, e);
                        last_err = Some(e);
                    }
                }
            }
        }

        let last_err = last_err.map(|e| e.to_string()).unwrap_or_default();
        error!("failed {} attempts to connect to {} endpoint(s)", num_attempts, num_urls);
        Err(TgError::ConnectionTimeout(format!("failed {} attempts to connect to {} endpoint(s), last error: {}", num_attempts, num_urls, last_err)))
    }

    /// Open a connection to a single endpoint and establish a session on it
    #[tracing::instrument(skip(self, url), fields(channel = self.id, url = %url))]
    async fn connect_once(&self, url: &LinkUrl) -> TgResult<(FrameReader, FrameWriter)> {
        let (stream, inbox_addr) = self.transport.create_stream(url).await?;
        let (read, write) = tokio::io::split(stream);
        let mut frames = FrameReader::new(read, self.config.max_frame_len);
        let mut writer = FrameWriter::new(write);

        let result = async {
            self.check_early_termination(&mut frames).await?;
            self.handshake(&mut frames, &mut writer).await?;
            self.authenticate(&mut frames, &mut writer, inbox_addr).await
        }.await;

        match result {
            Ok(()) => Ok((frames, writer)),
            Err(e) => {
                if let Err(close_err) = self.transport.close_stream(&mut writer).await {
                    trace!("error closing failed connection: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// A server that refuses the session sends a termination frame right away
    async fn check_early_termination(&self, frames: &mut FrameReader) -> TgResult<()> {
        if let Some(frame) = frames.try_read_frame().await? {
            let msg = decode_frame(self.env.message_factory.as_ref(), frame)?;
            return match msg.into_payload() {
                Payload::SessionForcefullyTerminated(reason) => Err(TgError::Disconnected(reason.message)),
                other => Err(TgError::General(format!("unexpected message before handshake: {:?}", other))),
            };
        }
        Ok(())
    }

    /// Send a message during connection setup and read the reply, turning exception and termination
    ///  replies into errors
    async fn exchange(&self, frames: &mut FrameReader, writer: &mut FrameWriter, msg: &ProtocolMessage) -> TgResult<Payload> {
        let reply = request_reply(frames, writer, self.env.message_factory.as_ref(), msg).await?;
        match reply.into_payload() {
            Payload::SessionForcefullyTerminated(reason) => Err(TgError::Disconnected(reason.message)),
            Payload::Exception(e) => Err(TgError::from_exception(e.exception_type, e.message)),
            payload => Ok(payload),
        }
    }

    async fn handshake(&self, frames: &mut FrameReader, writer: &mut FrameWriter) -> TgResult<()> {
        let mut request = self.new_message(VerbId::HandshakeRequest, Payload::HandshakeRequest(HandshakeRequest {
            request_type: HandshakeRequestType::Initiate,
            ssl_mode: false,
            challenge: 0,
        }));

        let response = handshake_response(self.exchange(frames, writer, &request).await?)?;
        if response.status != HandshakeStatus::AcceptChallenge {
            return Err(TgError::General(format!("handshake initiation answered with {:?}", response.status)));
        }

        request.set_payload(Payload::HandshakeRequest(HandshakeRequest {
            request_type: HandshakeRequestType::ChallengeAccepted,
            ssl_mode: self.transport.ssl_mode(),
            challenge: accept_challenge(response.challenge),
        }));
        request.update_sequence_and_timestamp(&self.env.sequence);

        let response = handshake_response(self.exchange(frames, writer, &request).await?)?;
        if response.status != HandshakeStatus::ProceedWithAuthentication {
            return Err(TgError::General(format!("challenge answered with {:?}", response.status)));
        }
        trace!("handshake complete");
        Ok(())
    }

    async fn authenticate(&self, frames: &mut FrameReader, writer: &mut FrameWriter, inbox_addr: String) -> TgResult<()> {
        let request = self.new_message(VerbId::AuthenticateRequest, Payload::AuthenticateRequest(AuthenticateRequest {
            client_id: Some(self.config.client_id.clone()),
            inbox_addr: Some(inbox_addr),
            user_name: self.config.user_id.clone(),
            password: Bytes::from(self.config.password.clone()),
        }));

        match self.exchange(frames, writer, &request).await? {
            Payload::AuthenticateResponse(AuthenticateResponse::Success { auth_token, session_id, .. }) => {
                debug!("authenticated, session id {}", session_id);
                self.auth_token.store(auth_token, Ordering::Release);
                self.session_id.store(session_id, Ordering::Release);
                Ok(())
            }
            Payload::AuthenticateResponse(AuthenticateResponse::Failure { error_status }) => {
                Err(TgError::Authentication(format!("server rejected user {:?} with status {}", self.config.user_id, error_status)))
            }
            other => Err(TgError::General(format!("expected authentication response, got {:?}", other))),
        }
    }
}

/// A failed challenge is an authentication failure, anything else that is not a handshake
///  response is a protocol error
fn handshake_response(payload: Payload) -> TgResult<HandshakeResponse> {
    match payload {
        Payload::HandshakeResponse(r) if r.status == HandshakeStatus::ChallengeFailed => {
            Err(TgError::Authentication(r.error_message.unwrap_or_else(|| "challenge failed".to_string())))
        }
        Payload::HandshakeResponse(r) => Ok(r),
        other => Err(TgError::General(format!("expected handshake response, got {:?}", other))),
    }
}

#[async_trait]
impl ReaderEvents for Channel {
    fn on_message(&self, msg: ProtocolMessage) {
        self.responses.dispatch(msg);
    }

    async fn on_terminated(&self, reason: ExceptionPayload) {
        self.terminate(reason).await;
    }

    async fn on_read_error(&self, err: TgError, epoch: u64) -> ExceptionHandleResult {
        self.on_connection_failure(err, epoch).await
    }
}

#[async_trait]
impl Pingable for Channel {
    fn needs_ping(&self) -> bool {
        self.needs_ping.load(Ordering::Acquire)
    }

    fn enable_ping(&self) {
        self.needs_ping.store(true, Ordering::Release);
    }

    fn is_ping_suspended(&self) -> bool {
        self.ping_suspended.load(Ordering::Acquire)
    }

    async fn send_ping(&self) {
        let status = self.link_state.status();
        if status.state != LinkState::Connected {
            return;
        }

        let mut ping = self.new_message(VerbId::Ping, Payload::Ping);
        self.stamp_session(&mut ping);
        if let Err(e) = self.write_once(&ping).await {
            warn!("ping on channel {} failed: {}", self.id, e);
            self.ping_suspended.store(true, Ordering::Release);

            // the pinger serves all channels, so it must not wait for a reconnect
            if let Some(channel) = self.myself.upgrade() {
                tokio::spawn(async move {
                    channel.on_connection_failure(e, status.epoch).await;
                });
            }
        }
    }
}
