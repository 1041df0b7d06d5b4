//! The messenger that multiplexes every protocol channel over one transport.
//!
//! One [`StreamMux`] owns the read half, the write half and the cryptor of a
//! session. Inbound frames are decrypted and reassembled into complete
//! packets; outbound packets are encrypted, fragmented and written with the
//! writer lock held so frames of different channels never interleave within
//! a message and tls records go out in the order they were sealed.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::cryptor::Cryptor;
use crate::error::AutoError;
use crate::frame::{AndroidAutoFrame, AndroidAutoFrameReceiver};

/// The per-session multiplexer over a bidirectional byte transport
pub struct StreamMux<U, V> {
    /// The read half of the transport plus reassembly state
    reader: Mutex<ReadState<U>>,
    /// The write half of the transport
    writer: Mutex<V>,
    /// The tls engine shared by the inbound and outbound paths
    cryptor: Mutex<Cryptor>,
}

/// Everything the inbound loop needs under one lock
struct ReadState<U> {
    /// The read half of the transport
    stream: U,
    /// The frame receiver holding per-channel reassembly buffers
    receiver: AndroidAutoFrameReceiver,
}

impl<U, V> StreamMux<U, V>
where
    U: AsyncRead + Unpin,
    V: AsyncWrite + Unpin,
{
    /// Construct a new multiplexer over the given transport halves
    pub fn new(read: U, write: V, cryptor: Cryptor) -> Self {
        Self {
            reader: Mutex::new(ReadState {
                stream: read,
                receiver: AndroidAutoFrameReceiver::new(),
            }),
            writer: Mutex::new(write),
            cryptor: Mutex::new(cryptor),
        }
    }

    /// Read frames until one complete packet is available. The cryptor is
    /// only locked between reads, never while waiting for bytes.
    pub async fn read_frame(&self) -> Result<AndroidAutoFrame, AutoError> {
        let mut r = self.reader.lock().await;
        loop {
            let (header, data) = AndroidAutoFrameReceiver::read_raw(&mut r.stream).await?;
            let mut cryptor = self.cryptor.lock().await;
            if let Some(frame) = r.receiver.process(header, data, &mut cryptor)? {
                return Ok(frame);
            }
        }
    }

    /// Encrypt, fragment and write one packet. The writer lock is taken
    /// before sealing so record order always matches write order.
    pub async fn write_frame(&self, frame: AndroidAutoFrame) -> Result<(), AutoError> {
        let mut writer = self.writer.lock().await;
        let wire = {
            let mut cryptor = self.cryptor.lock().await;
            frame.to_wire(&mut cryptor)?
        };
        writer.write_all(&wire).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Run a closure against the cryptor. Used by the control channel to
    /// pump the handshake without giving anything else access to the engine.
    pub async fn with_cryptor<R>(&self, f: impl FnOnce(&mut Cryptor) -> R) -> R {
        let mut cryptor = self.cryptor.lock().await;
        f(&mut cryptor)
    }

    /// True once the tls handshake has completed for this session
    pub async fn established(&self) -> bool {
        self.cryptor.lock().await.is_established()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, FrameHeaderContents, FrameHeaderType};
    use crate::ChannelId;

    fn plain_frame(channel: ChannelId, data: Vec<u8>) -> AndroidAutoFrame {
        AndroidAutoFrame {
            header: FrameHeader {
                channel_id: channel,
                frame: FrameHeaderContents::new(false, FrameHeaderType::Single, false),
            },
            data,
        }
    }

    #[tokio::test]
    async fn frames_round_trip_through_a_pair_of_muxes() {
        let (a, b) = tokio::io::duplex(0x10000);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let left = StreamMux::new(ar, aw, Cryptor::new().unwrap());
        let right = StreamMux::new(br, bw, Cryptor::new().unwrap());

        left.write_frame(plain_frame(ChannelId::Sensor, vec![9, 8, 7]))
            .await
            .unwrap();
        let got = right.read_frame().await.unwrap();
        assert_eq!(got.header.channel_id, ChannelId::Sensor);
        assert_eq!(got.data, vec![9, 8, 7]);
    }

    #[tokio::test]
    async fn sequential_sends_on_one_channel_arrive_in_order() {
        let (a, b) = tokio::io::duplex(0x100000);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let left = StreamMux::new(ar, aw, Cryptor::new().unwrap());
        let right = StreamMux::new(br, bw, Cryptor::new().unwrap());

        for i in 0..16u8 {
            left.write_frame(plain_frame(ChannelId::Input, vec![i; 3]))
                .await
                .unwrap();
        }
        for i in 0..16u8 {
            let got = right.read_frame().await.unwrap();
            assert_eq!(got.data, vec![i; 3]);
        }
    }

    #[tokio::test]
    async fn fragmented_packet_crosses_the_mux_intact() {
        let (a, b) = tokio::io::duplex(0x100000);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let left = StreamMux::new(ar, aw, Cryptor::new().unwrap());
        let right = StreamMux::new(br, bw, Cryptor::new().unwrap());

        let payload: Vec<u8> = (0..0x9000u32).map(|v| (v % 251) as u8).collect();
        left.write_frame(plain_frame(ChannelId::Video, payload.clone()))
            .await
            .unwrap();
        let got = right.read_frame().await.unwrap();
        assert_eq!(got.data, payload);
    }
}
