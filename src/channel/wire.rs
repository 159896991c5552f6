use std::future::poll_fn;
use std::pin::Pin;
use std::task::Poll;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::trace;

use crate::channel::transport::BoxedStream;
use crate::error::{TgError, TgResult};
use crate::pdu::factory::{decode_frame, MessageFactory};
use crate::pdu::message::ProtocolMessage;
use crate::pdu::HEADER_LEN;
use crate::util::safe_converter::PrecheckedCast;

/// Reads length prefixed frames off a stream
pub struct FrameReader {
    inner: BufReader<ReadHalf<BoxedStream>>,
    max_frame_len: usize,
}

impl FrameReader {
    pub fn new(read: ReadHalf<BoxedStream>, max_frame_len: usize) -> FrameReader {
        FrameReader {
            inner: BufReader::new(read),
            max_frame_len,
        }
    }

    /// Read one complete frame, including its length prefix.
    ///
    /// NB: This is not cancel safe - a frame that is partially read when the future is dropped
    ///  leaves the stream in an undefined position
    pub async fn read_frame(&mut self) -> TgResult<Bytes> {
        let len = self.inner.read_i32().await?;
        if len < HEADER_LEN as i32 || len as i64 > self.max_frame_len as i64 {
            return Err(TgError::InvalidMessageLength { declared: len as i64, actual: 4 });
        }
        let len = len as usize;

        let mut buf = BytesMut::with_capacity(len);
        buf.put_i32(len.prechecked_cast());
        buf.resize(len, 0);
        self.inner.read_exact(&mut buf[4..]).await?;

        trace!(len, "received frame");
        Ok(buf.freeze())
    }

    /// Read a frame only if data is available without waiting for it
    pub async fn try_read_frame(&mut self) -> TgResult<Option<Bytes>> {
        let has_data = poll_fn(|cx| {
            match Pin::new(&mut self.inner).poll_fill_buf(cx) {
                Poll::Ready(Ok(buf)) => Poll::Ready(Ok(!buf.is_empty())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Ready(Ok(false)),
            }
        }).await?;

        if has_data {
            Ok(Some(self.read_frame().await?))
        }
        else {
            Ok(None)
        }
    }

    pub async fn read_message(&mut self, factory: &dyn MessageFactory) -> TgResult<ProtocolMessage> {
        let frame = self.read_frame().await?;
        decode_frame(factory, frame)
    }
}

/// Writes complete frames to a stream
pub struct FrameWriter {
    inner: WriteHalf<BoxedStream>,
}

impl FrameWriter {
    pub fn new(write: WriteHalf<BoxedStream>) -> FrameWriter {
        FrameWriter {
            inner: write,
        }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> TgResult<()> {
        trace!(len = frame.len(), "sending frame");
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_message(&mut self, msg: &ProtocolMessage) -> TgResult<()> {
        let frame = msg.to_bytes()?;
        self.write_frame(&frame).await
    }

    pub async fn shutdown(&mut self) -> TgResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Send a message and read the next frame as its reply. This bypasses request correlation, and it
///  is only used while a connection is set up, before a channel reader owns the read side.
pub async fn request_reply(reader: &mut FrameReader, writer: &mut FrameWriter, factory: &dyn MessageFactory, msg: &ProtocolMessage) -> TgResult<ProtocolMessage> {
    writer.write_message(msg).await?;
    reader.read_message(factory).await
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;
    use crate::channel::transport::boxed;
    use crate::pdu::factory::DefaultMessageFactory;
    use crate::pdu::payloads::Payload;
    use crate::pdu::sequence::SequenceGenerator;
    use crate::pdu::verb_id::VerbId;

    fn frame(verb_id: VerbId, payload: Payload) -> Bytes {
        ProtocolMessage::new(verb_id, payload, &SequenceGenerator::new())
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_frames() {
        let (client, mut server) = duplex(1024);
        let (read, _write) = tokio::io::split(boxed(client));
        let mut reader = FrameReader::new(read, 1024);

        let f1 = frame(VerbId::Ping, Payload::Ping);
        let f2 = frame(VerbId::QueryResponse, Payload::Opaque(Bytes::from_static(b"result")));
        let mut both = f1.to_vec();
        both.extend_from_slice(&f2);
        // split in the middle of the second frame
        server.write_all(&both[..f1.len() + 10]).await.unwrap();
        let rest = both[f1.len() + 10..].to_vec();
        tokio::spawn(async move {
            server.write_all(&rest).await.unwrap();
        });

        assert_eq!(reader.read_frame().await.unwrap(), f1);
        let msg = reader.read_message(&DefaultMessageFactory::default()).await.unwrap();
        assert_eq!(msg.payload(), &Payload::Opaque(Bytes::from_static(b"result")));
    }

    #[tokio::test]
    async fn test_frame_length_bounds() {
        for len in [0i32, -1, HEADER_LEN as i32 - 1, 1025] {
            let (client, mut server) = duplex(1024);
            let (read, _write) = tokio::io::split(boxed(client));
            let mut reader = FrameReader::new(read, 1024);

            server.write_all(&len.to_be_bytes()).await.unwrap();
            match reader.read_frame().await {
                Err(TgError::InvalidMessageLength { declared, .. }) => assert_eq!(declared, len as i64),
                other => panic!("unexpected result {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let (client, server) = duplex(1024);
        let (read, _write) = tokio::io::split(boxed(client));
        let mut reader = FrameReader::new(read, 1024);
        drop(server);

        let err = reader.read_frame().await.unwrap_err();
        assert!(err.is_io());
    }

    #[tokio::test]
    async fn test_try_read_frame() {
        let (client, mut server) = duplex(1024);
        let (read, _write) = tokio::io::split(boxed(client));
        let mut reader = FrameReader::new(read, 1024);

        assert!(reader.try_read_frame().await.unwrap().is_none());

        let f = frame(VerbId::Ping, Payload::Ping);
        server.write_all(&f).await.unwrap();
        assert_eq!(reader.try_read_frame().await.unwrap(), Some(f));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (client, server) = duplex(1024);
        let (read, write) = tokio::io::split(boxed(client));
        let mut reader = FrameReader::new(read, 1024);
        let mut writer = FrameWriter::new(write);

        let (server_read, server_write) = tokio::io::split(boxed(server));
        tokio::spawn(async move {
            let mut server_reader = FrameReader::new(server_read, 1024);
            let mut server_writer = FrameWriter::new(server_write);
            let request = server_reader.read_message(&DefaultMessageFactory::default()).await.unwrap();
            let mut reply = ProtocolMessage::new(VerbId::QueryResponse, Payload::Opaque(Bytes::from_static(b"pong")), &SequenceGenerator::new());
            reply.set_request_id(request.request_id());
            server_writer.write_message(&reply).await.unwrap();
        });

        let mut request = ProtocolMessage::new(VerbId::QueryRequest, Payload::Opaque(Bytes::from_static(b"ping")), &SequenceGenerator::new());
        request.set_request_id(3);
        let reply = request_reply(&mut reader, &mut writer, &DefaultMessageFactory::default(), &request).await.unwrap();
        assert_eq!(reply.request_id(), 3);
        assert_eq!(reply.payload(), &Payload::Opaque(Bytes::from_static(b"pong")));
    }
}
