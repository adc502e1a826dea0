use std::path::Path;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// A serial device as a byte stream. Anything tokio can read from and write to qualifies, e.g.
///  a tty opened as a file or an in-memory pipe.
pub trait SerialDevice: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> SerialDevice for T {}

/// Opens the serial device, once per connection attempt
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceOpener: Send + Sync + 'static {
    async fn open(&self, path: &Path) -> anyhow::Result<Box<dyn SerialDevice>>;
}

/// Opens a device node for reading and writing. Line settings (baud rate, raw mode) are expected
///  to be configured on the device beforehand.
pub struct FileDeviceOpener;

#[async_trait]
impl DeviceOpener for FileDeviceOpener {
    async fn open(&self, path: &Path) -> anyhow::Result<Box<dyn SerialDevice>> {
        debug!("opening serial device {:?}", path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await?;
        Ok(Box::new(file))
    }
}
