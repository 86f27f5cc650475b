//! Bidirectional byte link between an inbound and an outbound.
//!
//! The reader carries uplink bytes (client to destination), the writer
//! carries downlink bytes back to the client.

use std::io;

use async_trait::async_trait;

/// Uplink half of a link.
#[async_trait]
pub trait LinkReader: Send {
    /// Reads the next buffer. `Ok(None)` signals end of stream.
    async fn read_buffer(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Unblocks any pending read and makes further reads fail.
    fn interrupt(&mut self);
}

/// Downlink half of a link.
#[async_trait]
pub trait LinkWriter: Send {
    async fn write_buffer(&mut self, buf: Vec<u8>) -> io::Result<()>;

    /// Closes the writer. Further writes fail.
    async fn close(&mut self) -> io::Result<()>;
}

/// A connection's link as handed to outbound dispatch.
pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

impl Link {
    pub fn new(reader: Box<dyn LinkReader>, writer: Box<dyn LinkWriter>) -> Self {
        Self { reader, writer }
    }

    /// Terminates the link without delivering anything: closes the writer
    /// and interrupts the reader.
    pub async fn abort(&mut self) {
        if let Err(e) = self.writer.close().await {
            tracing::debug!(error = %e, "closing link writer failed");
        }
        self.reader.interrupt();
    }
}
