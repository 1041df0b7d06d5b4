//! The bulk endpoint transport of an accessory mode device.
//!
//! rusb transfers are blocking, so each endpoint gets a worker thread and
//! the async side talks to them over bounded channels. The read and write
//! halves implement the tokio traits so the rest of the stack does not know
//! it is running on usb.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures::channel::mpsc;
use futures::executor::block_on;
use futures::{SinkExt, Stream, StreamExt};
use rusb::{Context, DeviceHandle};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Size of one bulk read, a whole frame fits in it
const READ_BUFFER_SIZE: usize = 16 * 1024;
/// Timeout of one bulk read, bounds how fast a stop request is noticed
const READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Timeout of one bulk write
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// How many buffers may sit between a worker and the async side
const CHANNEL_DEPTH: usize = 16;

/// An opened accessory mode device with its claimed interface and endpoints
pub struct AoapDeviceHandle {
    /// The shared device state, released when the last owner drops
    shared: Arc<DeviceShared>,
}

/// The device handle and endpoint addresses shared with the worker threads
struct DeviceShared {
    /// The open usb handle
    handle: DeviceHandle<Context>,
    /// The claimed interface number
    interface: u8,
    /// The bulk in endpoint address
    ep_in: u8,
    /// The bulk out endpoint address
    ep_out: u8,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            log::debug!("Could not release interface {}: {}", self.interface, e);
        }
        if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
            log::debug!("Could not reattach kernel driver: {}", e);
        }
    }
}

impl AoapDeviceHandle {
    /// Wrap an opened, claimed device
    pub fn new(handle: DeviceHandle<Context>, interface: u8, ep_in: u8, ep_out: u8) -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                handle,
                interface,
                ep_in,
                ep_out,
            }),
        }
    }
}

/// The bulk endpoint transport of one session
pub struct UsbTransport;

impl UsbTransport {
    /// Start the endpoint workers for a device and return the async halves
    /// plus the handle used to stop them.
    pub fn start(device: AoapDeviceHandle) -> (UsbReadHalf, UsbWriteHalf, UsbTransportHandle) {
        let stop = Arc::new(AtomicBool::new(false));
        let (read_tx, read_rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(CHANNEL_DEPTH);
        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);

        {
            let shared = device.shared.clone();
            let stop = stop.clone();
            let mut tx = read_tx;
            std::thread::Builder::new()
                .name("aoap-read".into())
                .spawn(move || read_worker(&shared, &stop, &mut tx))
                .expect("failed to spawn usb read worker");
        }
        {
            let shared = device.shared.clone();
            let stop = stop.clone();
            let mut rx = write_rx;
            std::thread::Builder::new()
                .name("aoap-write".into())
                .spawn(move || write_worker(&shared, &stop, &mut rx))
                .expect("failed to spawn usb write worker");
        }

        (
            UsbReadHalf {
                rx: read_rx,
                pending: Vec::new(),
                pos: 0,
            },
            UsbWriteHalf { tx: write_tx },
            UsbTransportHandle { stop },
        )
    }
}

/// Stops the endpoint workers of a transport
pub struct UsbTransportHandle {
    /// Set to ask both workers to wind down
    stop: Arc<AtomicBool>,
}

impl UsbTransportHandle {
    /// Ask both workers to stop. Outstanding transfers finish within their
    /// own timeouts; the async halves then observe end of stream.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// The blocking loop reading the bulk in endpoint
fn read_worker(
    shared: &DeviceShared,
    stop: &AtomicBool,
    tx: &mut mpsc::Sender<std::io::Result<Vec<u8>>>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match shared.handle.read_bulk(shared.ep_in, &mut buf, READ_TIMEOUT) {
            Ok(0) => continue,
            Ok(n) => {
                if block_on(tx.send(Ok(buf[..n].to_vec()))).is_err() {
                    break;
                }
            }
            Err(rusb::Error::Timeout) => continue,
            Err(e) => {
                log::error!("Bulk read failed: {}", e);
                let _ = block_on(tx.send(Err(std::io::Error::other(e))));
                break;
            }
        }
    }
    log::debug!("Usb read worker finished");
}

/// The blocking loop writing the bulk out endpoint
fn write_worker(shared: &DeviceShared, stop: &AtomicBool, rx: &mut mpsc::Receiver<Vec<u8>>) {
    'outer: while let Some(data) = block_on(rx.next()) {
        let mut offset = 0;
        while offset < data.len() {
            if stop.load(Ordering::Relaxed) {
                break 'outer;
            }
            match shared
                .handle
                .write_bulk(shared.ep_out, &data[offset..], WRITE_TIMEOUT)
            {
                Ok(n) => offset += n,
                Err(rusb::Error::Timeout) => continue,
                Err(e) => {
                    log::error!("Bulk write failed: {}", e);
                    stop.store(true, Ordering::Relaxed);
                    break 'outer;
                }
            }
        }
    }
    log::debug!("Usb write worker finished");
}

/// The async read half of a usb transport
pub struct UsbReadHalf {
    /// Buffers delivered by the read worker
    rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    /// The buffer currently being drained
    pending: Vec<u8>,
    /// How much of the pending buffer has been consumed
    pos: usize,
}

impl AsyncRead for UsbReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        if me.pos >= me.pending.len() {
            match Pin::new(&mut me.rx).poll_next(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    me.pending = data;
                    me.pos = 0;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = std::cmp::min(buf.remaining(), me.pending.len() - me.pos);
        buf.put_slice(&me.pending[me.pos..me.pos + n]);
        me.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// The async write half of a usb transport
pub struct UsbWriteHalf {
    /// The queue feeding the write worker
    tx: mpsc::Sender<Vec<u8>>,
}

impl AsyncWrite for UsbWriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        match me.tx.poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                me.tx
                    .start_send(buf.to_vec())
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.get_mut().tx.close_channel();
        Poll::Ready(Ok(()))
    }
}
