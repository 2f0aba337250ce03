//! Framed async transport for one batch exchange.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use crate::{
    DeliveryBatch, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, Status, WireError, WireResult,
    decode_batch, encode_batch,
};

/// Length-prefixed framing over any async byte stream.
///
/// The sender calls [`send_batch`](Self::send_batch) then
/// [`recv_status`](Self::recv_status); the receiver mirrors it with
/// [`recv_batch`](Self::recv_batch) and [`send_status`](Self::send_status).
pub struct WireTransport<S> {
    stream: BufStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WireTransport<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    /// Write one batch frame and flush it.
    ///
    /// # Errors
    ///
    /// Returns an encoding error or `WriteFailed`.
    pub async fn send_batch(&mut self, batch: &DeliveryBatch) -> WireResult<()> {
        let body = encode_batch(batch)?;
        self.write_frame(&body).await
    }

    /// Read one batch frame.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLength` for empty or oversized frames, `UnexpectedEof`
    /// if the peer hangs up mid-frame, or a decoding error.
    pub async fn recv_batch(&mut self) -> WireResult<DeliveryBatch> {
        let body = self.read_frame().await?;
        decode_batch(&body)
    }

    /// Write the status reply and flush it.
    ///
    /// # Errors
    ///
    /// Returns `WriteFailed` if the stream rejects the write.
    pub async fn send_status(&mut self, status: Status) -> WireResult<()> {
        self.stream
            .write_u8(status.to_byte())
            .await
            .map_err(|e| WireError::write_failed(&e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| WireError::write_failed(&e))
    }

    /// Read the status reply.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` if the peer closed without replying, or
    /// `UnknownStatus` for an unrecognised byte.
    pub async fn recv_status(&mut self) -> WireResult<Status> {
        let byte = self
            .stream
            .read_u8()
            .await
            .map_err(|e| WireError::read_failed(&e, 0, 1))?;
        Status::from_byte(byte)
    }

    /// Shut down the write half.
    ///
    /// # Errors
    ///
    /// Returns `WriteFailed` if the shutdown fails.
    pub async fn shutdown(&mut self) -> WireResult<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| WireError::write_failed(&e))
    }

    /// Unwrap the underlying stream, discarding buffered data.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    async fn write_frame(&mut self, body: &[u8]) -> WireResult<()> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(WireError::message_too_large(body.len(), MAX_FRAME_SIZE));
        }
        let length = u32::try_from(body.len())
            .map_err(|_| WireError::message_too_large(body.len(), MAX_FRAME_SIZE))?;

        self.stream
            .write_all(&length.to_be_bytes())
            .await
            .map_err(|e| WireError::write_failed(&e))?;
        self.stream
            .write_all(body)
            .await
            .map_err(|e| WireError::write_failed(&e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| WireError::write_failed(&e))
    }

    async fn read_frame(&mut self) -> WireResult<Vec<u8>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.stream
            .read_exact(&mut prefix)
            .await
            .map_err(|e| WireError::read_failed(&e, 0, LENGTH_PREFIX_SIZE))?;

        let length = u32::from_be_bytes(prefix);
        if length == 0 {
            return Err(WireError::invalid_length(0, "zero-length frame"));
        }
        let size = length as usize;
        if size > MAX_FRAME_SIZE {
            return Err(WireError::invalid_length(
                length,
                format!("exceeds maximum of {MAX_FRAME_SIZE} bytes"),
            ));
        }

        let mut body = vec![0u8; size];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| WireError::read_failed(&e, LENGTH_PREFIX_SIZE, LENGTH_PREFIX_SIZE + size))?;
        Ok(body)
    }
}
