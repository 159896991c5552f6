use std::sync::{Arc, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::channel::channel::ExceptionHandleResult;
use crate::channel::wire::FrameReader;
use crate::error::TgError;
use crate::pdu::factory::MessageFactory;
use crate::pdu::message::ProtocolMessage;
use crate::pdu::payloads::{ExceptionPayload, Payload};
use crate::pdu::verb_id::VerbId;

/// What a channel reader reports to its channel
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReaderEvents: Send + Sync + 'static {
    /// a regular reply, to be dispatched by request id
    fn on_message(&self, msg: ProtocolMessage);

    /// the server killed the session
    async fn on_terminated(&self, reason: ExceptionPayload);

    /// Reading from the connection of the given epoch failed
    async fn on_read_error(&self, err: TgError, epoch: u64) -> ExceptionHandleResult;
}

/// The background task that reads frames from a channel's connection. There is exactly one per
///  connection: a reconnect stops the old reader and starts a new one on the new connection.
pub struct ChannelReader {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ChannelReader {
    pub fn start(frames: FrameReader, factory: Arc<dyn MessageFactory>, events: Weak<dyn ReaderEvents>, epoch: u64) -> ChannelReader {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(read_loop(frames, factory, events, stop_rx, epoch));
        ChannelReader {
            stop,
            handle,
        }
    }

    /// Signal the reader to stop. This does not wait for the task to finish, so it is safe to call
    ///  from code that runs on the reader task itself.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[tracing::instrument(name = "channel_reader", skip_all, fields(epoch = epoch))]
async fn read_loop(mut frames: FrameReader, factory: Arc<dyn MessageFactory>, events: Weak<dyn ReaderEvents>, mut stop: watch::Receiver<bool>, epoch: u64) {
    debug!("starting channel reader");

    loop {
        let result = select! {
            _ = stop.wait_for(|s| *s) => {
                debug!("channel reader stopped");
                return;
            }
            r = frames.read_message(factory.as_ref()) => r,
        };

        let events = match events.upgrade() {
            Some(events) => events,
            None => {
                debug!("channel is gone, shutting down reader");
                return;
            }
        };

        match result {
            Ok(msg) => {
                match msg.verb_id() {
                    VerbId::Ping => {
                        trace!("discarding ping from server");
                    }
                    VerbId::SessionForcefullyTerminated => {
                        let reason = match msg.into_payload() {
                            Payload::SessionForcefullyTerminated(reason) => reason,
                            other => {
                                error!("session termination with unexpected payload {:?}", other);
                                return;
                            }
                        };
                        warn!("server terminated the session: {}", reason.message);
                        events.on_terminated(reason).await;
                        return;
                    }
                    _ => events.on_message(msg),
                }
            }
            Err(e) => {
                if *stop.borrow() {
                    debug!("read error after stop signal, ignoring: {}", e);
                    return;
                }

                debug!("read error: {}", e);
                match events.on_read_error(e, epoch).await {
                    ExceptionHandleResult::RetryOperation => {
                        debug!("channel reconnected, the new connection has its own reader");
                    }
                    ExceptionHandleResult::Disconnected => {
                        debug!("channel disconnected, shutting down reader");
                    }
                    ExceptionHandleResult::RethrowException(e) => {
                        error!("unrecoverable read error, shutting down reader: {}", e);
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::channel::transport::boxed;
    use crate::error::ExceptionType;
    use crate::pdu::factory::DefaultMessageFactory;
    use crate::pdu::sequence::SequenceGenerator;

    fn frame(verb_id: VerbId, payload: Payload, request_id: i64) -> Bytes {
        let mut msg = ProtocolMessage::new(verb_id, payload, &SequenceGenerator::new());
        msg.set_request_id(request_id);
        msg.to_bytes().unwrap()
    }

    fn start(events: MockReaderEvents) -> (ChannelReader, DuplexStream, Arc<dyn ReaderEvents>) {
        let (client, server) = duplex(4096);
        let (read, _) = tokio::io::split(boxed(client));
        let events: Arc<dyn ReaderEvents> = Arc::new(events);
        let reader = ChannelReader::start(FrameReader::new(read, 4096), Arc::new(DefaultMessageFactory::default()), Arc::downgrade(&events), 1);
        (reader, server, events)
    }

    async fn wait_finished(reader: &ChannelReader) {
        for _ in 0..100 {
            if reader.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("reader did not finish");
    }

    #[tokio::test]
    async fn test_dispatch_and_discard_pings() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut events = MockReaderEvents::new();
        events.expect_on_message()
            .times(2)
            .returning(move |msg| tx.send(msg.request_id()).unwrap());
        events.expect_on_read_error().never();

        let (reader, mut server, _events) = start(events);
        server.write_all(&frame(VerbId::QueryResponse, Payload::Opaque(Bytes::new()), 2)).await.unwrap();
        server.write_all(&frame(VerbId::Ping, Payload::Ping, 0)).await.unwrap();
        server.write_all(&frame(VerbId::QueryResponse, Payload::Opaque(Bytes::new()), 1)).await.unwrap();

        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(1));

        reader.stop();
        reader.stop();
        wait_finished(&reader).await;
    }

    #[tokio::test]
    async fn test_termination() {
        let mut events = MockReaderEvents::new();
        events.expect_on_terminated()
            .withf(|reason| reason.message == "killed by admin")
            .times(1)
            .returning(|_| ());
        events.expect_on_message().never();

        let (reader, mut server, _events) = start(events);
        let payload = Payload::SessionForcefullyTerminated(ExceptionPayload::new(ExceptionType::DisconnectedException, "killed by admin"));
        server.write_all(&frame(VerbId::SessionForcefullyTerminated, payload, 0)).await.unwrap();
        wait_finished(&reader).await;
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let mut events = MockReaderEvents::new();
        events.expect_on_read_error()
            .withf(|e, epoch| e.is_io() && *epoch == 1)
            .times(1)
            .returning(|_, _| ExceptionHandleResult::Disconnected);

        let (reader, server, _events) = start(events);
        drop(server);
        wait_finished(&reader).await;
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_reported() {
        let mut events = MockReaderEvents::new();
        events.expect_on_read_error()
            .withf(|e, _| matches!(e, TgError::BadMagic(_)))
            .times(1)
            .returning(|e, _| ExceptionHandleResult::RethrowException(e));

        let (reader, mut server, _events) = start(events);
        let mut buf = frame(VerbId::QueryResponse, Payload::Opaque(Bytes::new()), 1).to_vec();
        buf[4] = 0;
        server.write_all(&buf).await.unwrap();
        wait_finished(&reader).await;
    }

    #[tokio::test]
    async fn test_stop_while_idle() {
        let mut events = MockReaderEvents::new();
        events.expect_on_read_error().never();

        let (reader, _server, _events) = start(events);
        reader.stop();
        wait_finished(&reader).await;
    }

    #[tokio::test]
    async fn test_stops_when_channel_is_dropped() {
        let (reader, mut server, events) = start(MockReaderEvents::new());
        drop(events);
        server.write_all(&frame(VerbId::QueryResponse, Payload::Opaque(Bytes::new()), 1)).await.unwrap();
        wait_finished(&reader).await;
    }
}
