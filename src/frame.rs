//! Wire framing for the android auto protocol.
//!
//! Every unit on the wire is a frame: a four byte header of channel id,
//! flag byte and big-endian payload length, followed by the payload.
//! Messages larger than [`AndroidAutoFrame::MAX_FRAME_DATA_SIZE`] are split
//! across several frames and reassembled per channel on receive.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cryptor::Cryptor;
use crate::error::{AutoError, ProtocolViolation};
use crate::ChannelId;

/// Specifies the type of frame header, whether the data of a packet is contained in a single frame, or if it was too large and broken up into multiple frames for transmission.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameHeaderType {
    /// This frame is neither the first or the last of a multi-frame packet
    Middle = 0,
    /// This is the first frame of a multi-frame packet
    First = 1,
    /// This is the last frame of a multi-frame packet
    Last = 2,
    /// The packet is contained in a single frame
    Single = 3,
}

impl From<u8> for FrameHeaderType {
    fn from(value: u8) -> Self {
        match value & 3 {
            0 => FrameHeaderType::Middle,
            1 => FrameHeaderType::First,
            2 => FrameHeaderType::Last,
            _ => FrameHeaderType::Single,
        }
    }
}

impl From<FrameHeaderType> for u8 {
    fn from(value: FrameHeaderType) -> Self {
        value as u8
    }
}

#[allow(missing_docs)]
/// The frame header module, because bitfield new does not make documentation yet.
mod frame_header {
    bitfield::bitfield! {
        #[derive(Copy, Clone, PartialEq, Eq)]
        pub struct FrameHeaderContents(u8);
        impl Debug;
        impl new;
        u8;
        /// True indicates the frame is encrypted
        pub get_encryption, set_encryption: 3;
        /// The frame header type
        pub from into super::FrameHeaderType, get_frame_type, set_frame_type: 1, 0;
        /// True when the frame belongs to the control flow, false when channel specific
        pub get_control, set_control: 2;
    }
}
pub use frame_header::FrameHeaderContents;

/// Represents the header of a frame exchanged with the android auto device
#[derive(Copy, Clone, Debug)]
pub struct FrameHeader {
    /// The channel this frame is intended for
    pub channel_id: ChannelId,
    /// The flag byte of the frame header
    pub frame: FrameHeaderContents,
}

impl FrameHeader {
    /// Add self to the given buffer to build part of a complete frame
    pub fn add_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.channel_id.into());
        buf.push(self.frame.0);
    }
}

/// A frame of data in the android auto protocol. Frames received as a
/// multi-frame sequence are handed out as one combined frame.
#[derive(Debug)]
pub struct AndroidAutoFrame {
    /// The header of the frame
    pub header: FrameHeader,
    /// The data relayed in the frame
    pub data: Vec<u8>,
}

impl AndroidAutoFrame {
    /// The largest payload for a single frame
    pub const MAX_FRAME_DATA_SIZE: usize = 0x4000;

    /// Build a frame for a message, prefixing the payload with the big-endian
    /// message id.
    pub fn from_message(
        channel_id: ChannelId,
        message_id: u16,
        payload: &[u8],
        contents: FrameHeaderContents,
    ) -> Self {
        let mut data = Vec::with_capacity(2 + payload.len());
        data.extend_from_slice(&message_id.to_be_bytes());
        data.extend_from_slice(payload);
        AndroidAutoFrame {
            header: FrameHeader {
                channel_id,
                frame: contents,
            },
            data,
        }
    }

    /// The message id carried in the first two bytes of the payload
    pub fn message_id(&self) -> Option<u16> {
        if self.data.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.data[0], self.data[1]]))
    }

    /// Serialize self into wire bytes, splitting into several frames when the
    /// payload exceeds the frame size limit. Each fragment is encrypted
    /// separately when the header asks for encryption.
    pub fn to_wire(&self, cryptor: &mut Cryptor) -> Result<Vec<u8>, AutoError> {
        let mut buf = Vec::new();
        if self.data.len() <= Self::MAX_FRAME_DATA_SIZE {
            self.emit_fragment(&mut buf, self.header.frame.get_frame_type(), &self.data, cryptor)?;
        } else {
            let chunks = self.data.chunks(Self::MAX_FRAME_DATA_SIZE);
            let max = chunks.len();
            for (i, chunk) in chunks.enumerate() {
                let ty = if i == 0 {
                    FrameHeaderType::First
                } else if i == (max - 1) {
                    FrameHeaderType::Last
                } else {
                    FrameHeaderType::Middle
                };
                self.emit_fragment(&mut buf, ty, chunk, cryptor)?;
            }
        }
        Ok(buf)
    }

    /// Append one fragment, header and payload, to the output buffer
    fn emit_fragment(
        &self,
        buf: &mut Vec<u8>,
        ty: FrameHeaderType,
        chunk: &[u8],
        cryptor: &mut Cryptor,
    ) -> Result<(), AutoError> {
        let mut header = self.header;
        header.frame.set_frame_type(ty);
        header.add_to(buf);
        if header.frame.get_encryption() {
            let sealed = cryptor.encrypt(chunk)?;
            buf.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
            buf.extend_from_slice(&sealed);
        } else {
            buf.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            buf.extend_from_slice(chunk);
        }
        Ok(())
    }
}

/// Responsible for receiving frames from the android auto device and
/// reassembling multi-frame packets, one partial buffer per channel.
pub struct AndroidAutoFrameReceiver {
    /// The data received so far for multi-frame packets, keyed by channel
    rx_sofar: HashMap<ChannelId, Vec<u8>>,
}

impl AndroidAutoFrameReceiver {
    /// Construct a new frame receiver
    pub fn new() -> Self {
        Self {
            rx_sofar: HashMap::new(),
        }
    }

    /// Read the header and payload of one frame from the stream. No
    /// decryption or reassembly happens here, so the caller does not need to
    /// hold the cryptor while waiting for bytes.
    pub async fn read_raw<U: AsyncRead + Unpin>(
        stream: &mut U,
    ) -> Result<(FrameHeader, Vec<u8>), AutoError> {
        let mut raw = [0u8; 4];
        stream.read_exact(&mut raw).await?;
        let channel_id = ChannelId::try_from(raw[0])
            .map_err(|_| AutoError::Protocol(ProtocolViolation::UnknownChannel(raw[0])))?;
        let mut contents = FrameHeaderContents::new(false, FrameHeaderType::Single, false);
        contents.0 = raw[1];
        let header = FrameHeader {
            channel_id,
            frame: contents,
        };
        let len = u16::from_be_bytes([raw[2], raw[3]]);
        let mut data_frame = vec![0u8; len as usize];
        stream.read_exact(&mut data_frame).await?;
        Ok((header, data_frame))
    }

    /// Decrypt and reassemble one received frame. Returns a complete packet
    /// when this frame finishes one, otherwise the payload is buffered for
    /// its channel and None is returned.
    pub fn process(
        &mut self,
        header: FrameHeader,
        data_frame: Vec<u8>,
        cryptor: &mut Cryptor,
    ) -> Result<Option<AndroidAutoFrame>, AutoError> {
        let channel_id = header.channel_id;
        if cryptor.is_established() && !header.frame.get_encryption() && !header.frame.get_control()
        {
            return Err(AutoError::Protocol(ProtocolViolation::MissingEncryption(
                channel_id,
            )));
        }
        let data = if header.frame.get_encryption() {
            cryptor.decrypt(&data_frame)?
        } else {
            data_frame
        };

        match header.frame.get_frame_type() {
            FrameHeaderType::Single => {
                if self.rx_sofar.contains_key(&channel_id) {
                    return Err(AutoError::Protocol(ProtocolViolation::ReassemblyClash(
                        channel_id,
                    )));
                }
                Ok(Some(AndroidAutoFrame { header, data }))
            }
            FrameHeaderType::First => {
                if self.rx_sofar.contains_key(&channel_id) {
                    return Err(AutoError::Protocol(ProtocolViolation::ReassemblyClash(
                        channel_id,
                    )));
                }
                self.rx_sofar.insert(channel_id, data);
                Ok(None)
            }
            FrameHeaderType::Middle => {
                match self.rx_sofar.get_mut(&channel_id) {
                    Some(sofar) => sofar.extend_from_slice(&data),
                    None => {
                        return Err(AutoError::Framing(format!(
                            "continuation frame without a first frame on channel {:?}",
                            channel_id
                        )))
                    }
                }
                Ok(None)
            }
            FrameHeaderType::Last => {
                let mut sofar = self.rx_sofar.remove(&channel_id).ok_or_else(|| {
                    AutoError::Framing(format!(
                        "final frame without a first frame on channel {:?}",
                        channel_id
                    ))
                })?;
                sofar.extend_from_slice(&data);
                let mut header = header;
                header.frame.set_frame_type(FrameHeaderType::Single);
                Ok(Some(AndroidAutoFrame {
                    header,
                    data: sofar,
                }))
            }
        }
    }

    /// Read one frame and run it through decryption and reassembly
    pub async fn read<U: AsyncRead + Unpin>(
        &mut self,
        stream: &mut U,
        cryptor: &mut Cryptor,
    ) -> Result<Option<AndroidAutoFrame>, AutoError> {
        let (header, data) = Self::read_raw(stream).await?;
        self.process(header, data, cryptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_frame(channel: ChannelId, data: Vec<u8>) -> AndroidAutoFrame {
        AndroidAutoFrame {
            header: FrameHeader {
                channel_id: channel,
                frame: FrameHeaderContents::new(false, FrameHeaderType::Single, false),
            },
            data,
        }
    }

    async fn collect_frames(wire: &[u8], count: usize) -> Vec<AndroidAutoFrame> {
        let mut cryptor = Cryptor::new().unwrap();
        let mut rx = AndroidAutoFrameReceiver::new();
        let mut stream = wire;
        let mut out = Vec::new();
        while out.len() < count {
            if let Some(f) = rx.read(&mut stream, &mut cryptor).await.unwrap() {
                out.push(f);
            }
        }
        out
    }

    #[tokio::test]
    async fn round_trip_single_frame() {
        let mut cryptor = Cryptor::new().unwrap();
        let frame = plain_frame(ChannelId::Video, vec![1, 2, 3, 4, 5]);
        let wire = frame.to_wire(&mut cryptor).unwrap();
        assert_eq!(wire.len(), 4 + 5);
        assert_eq!(wire[0], u8::from(ChannelId::Video));
        assert_eq!(&wire[4..], &[1, 2, 3, 4, 5]);
        let got = collect_frames(&wire, 1).await;
        assert_eq!(got[0].data, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn large_payload_fragments_and_reassembles() {
        let mut cryptor = Cryptor::new().unwrap();
        let payload: Vec<u8> = (0..0x6000u32).map(|v| v as u8).collect();
        let frame = plain_frame(ChannelId::Video, payload.clone());
        let wire = frame.to_wire(&mut cryptor).unwrap();
        // two fragments of 0x4000 and 0x2000 payload bytes, 4 byte headers each
        assert_eq!(wire.len(), 4 + 0x4000 + 4 + 0x2000);
        let first_len = u16::from_be_bytes([wire[2], wire[3]]);
        assert_eq!(first_len, 0x4000);
        let second_header = 4 + 0x4000;
        assert_eq!(
            FrameHeaderType::from(wire[second_header + 1]),
            FrameHeaderType::Last
        );
        assert_eq!(FrameHeaderType::from(wire[1]), FrameHeaderType::First);
        let got = collect_frames(&wire, 1).await;
        assert_eq!(got[0].data, payload);
    }

    #[tokio::test]
    async fn fragment_count_matches_payload_size() {
        let mut cryptor = Cryptor::new().unwrap();
        let payload = vec![0u8; 3 * 0x4000 + 1];
        let frame = plain_frame(ChannelId::MediaAudio, payload);
        let wire = frame.to_wire(&mut cryptor).unwrap();
        let mut offset = 0;
        let mut types = Vec::new();
        while offset < wire.len() {
            types.push(FrameHeaderType::from(wire[offset + 1]));
            let len = u16::from_be_bytes([wire[offset + 2], wire[offset + 3]]) as usize;
            offset += 4 + len;
        }
        assert_eq!(
            types,
            vec![
                FrameHeaderType::First,
                FrameHeaderType::Middle,
                FrameHeaderType::Middle,
                FrameHeaderType::Last
            ]
        );
    }

    #[tokio::test]
    async fn interleaved_channels_reassemble_independently() {
        let mut cryptor = Cryptor::new().unwrap();
        let video: Vec<u8> = vec![0xAA; 0x4001];
        let audio: Vec<u8> = vec![0xBB; 0x4001];
        let video_wire = plain_frame(ChannelId::Video, video.clone())
            .to_wire(&mut cryptor)
            .unwrap();
        let audio_wire = plain_frame(ChannelId::MediaAudio, audio.clone())
            .to_wire(&mut cryptor)
            .unwrap();
        // interleave: video first fragment, audio first fragment, video last, audio last
        let v_split = 4 + 0x4000;
        let a_split = 4 + 0x4000;
        let mut wire = Vec::new();
        wire.extend_from_slice(&video_wire[..v_split]);
        wire.extend_from_slice(&audio_wire[..a_split]);
        wire.extend_from_slice(&video_wire[v_split..]);
        wire.extend_from_slice(&audio_wire[a_split..]);
        let got = collect_frames(&wire, 2).await;
        assert_eq!(got[0].header.channel_id, ChannelId::Video);
        assert_eq!(got[0].data, video);
        assert_eq!(got[1].header.channel_id, ChannelId::MediaAudio);
        assert_eq!(got[1].data, audio);
    }

    #[tokio::test]
    async fn first_frame_with_pending_reassembly_is_rejected() {
        let mut cryptor = Cryptor::new().unwrap();
        let mut frame = plain_frame(ChannelId::Video, vec![0u8; 8]);
        frame.header.frame.set_frame_type(FrameHeaderType::First);
        let mut wire = frame.to_wire(&mut cryptor).unwrap();
        let again = wire.clone();
        wire.extend_from_slice(&again);
        let mut rx = AndroidAutoFrameReceiver::new();
        let mut stream = &wire[..];
        assert!(rx.read(&mut stream, &mut cryptor).await.unwrap().is_none());
        let err = rx.read(&mut stream, &mut cryptor).await.unwrap_err();
        assert!(matches!(
            err,
            AutoError::Protocol(ProtocolViolation::ReassemblyClash(ChannelId::Video))
        ));
    }

    #[tokio::test]
    async fn continuation_without_first_is_rejected() {
        let mut cryptor = Cryptor::new().unwrap();
        let mut frame = plain_frame(ChannelId::Sensor, vec![0u8; 8]);
        frame.header.frame.set_frame_type(FrameHeaderType::Last);
        let wire = frame.to_wire(&mut cryptor).unwrap();
        let mut rx = AndroidAutoFrameReceiver::new();
        let mut stream = &wire[..];
        let err = rx.read(&mut stream, &mut cryptor).await.unwrap_err();
        assert!(matches!(err, AutoError::Framing(_)));
    }

    #[test]
    fn flag_bits_match_the_wire_layout() {
        let contents = FrameHeaderContents::new(true, FrameHeaderType::Single, true);
        // FIRST|LAST = 0x03, CONTROL = 0x04, ENCRYPTED = 0x08
        assert_eq!(contents.0, 0x0F);
        let contents = FrameHeaderContents::new(false, FrameHeaderType::First, false);
        assert_eq!(contents.0, 0x01);
    }
}
