use crate::error::Result;
use crate::handle::ContentHandle;
use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio_util::sync::CancellationToken;

/// Sequential reader over a [`ContentHandle`].
///
/// Each stream owns a cancellation token; dropping or closing the stream
/// interrupts a read it has in progress.
pub struct ReadStream {
    handle: ContentHandle,
    position: u64,
    eof: bool,
    cancel: CancellationToken,
}

impl ReadStream {
    pub(crate) fn new(handle: ContentHandle, offset: u64, cancel: CancellationToken) -> Self {
        Self {
            handle,
            position: offset,
            eof: false,
            cancel,
        }
    }

    /// Fills up to `buf.len()` bytes from the current position.
    ///
    /// A short read marks end of content; every read after it returns 0.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.eof || buf.is_empty() {
            return Ok(0);
        }
        let data = self.handle.read(&self.cancel, self.position, buf.len()).await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.position += n as u64;
        if n < buf.len() {
            self.eof = true;
        }
        Ok(n)
    }

    /// Reads the next chunk of at most `max` bytes. An empty chunk means end of content.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        if self.eof || max == 0 {
            return Ok(Bytes::new());
        }
        let data = self.handle.read(&self.cancel, self.position, max).await?;
        self.position += data.len() as u64;
        if data.len() < max {
            self.eof = true;
        }
        Ok(data)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn handle(&self) -> &ContentHandle {
        &self.handle
    }

    /// Token that interrupts this stream's reads when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn close(self) {}

    /// Turns the reader into a stream of chunks ending at end of content.
    pub fn into_byte_stream(self, chunk: usize) -> impl Stream<Item = Result<Bytes>> {
        stream::unfold(Some(self), move |state| async move {
            let mut reader = state?;
            match reader.read_chunk(chunk).await {
                Ok(data) if data.is_empty() => None,
                Ok(data) => Some((Ok(data), Some(reader))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
