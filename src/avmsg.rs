//! Messages exchanged on the audio/video service channels

use protobuf::{Enum, Message};

use crate::frame::{AndroidAutoFrame, FrameHeaderContents, FrameHeaderType};
use crate::{ChannelId, Usb};

/// A message on an av service channel
pub enum AvChannelMessage {
    /// A message to start setup of the av channel
    SetupRequest(ChannelId, Usb::AVChannelSetupRequest),
    /// A message that responds to a setup request
    SetupResponse(ChannelId, Usb::AVChannelSetupResponse),
    /// Message requesting the focus of the video channel to be set
    VideoFocusRequest(ChannelId, Usb::VideoFocusRequest),
    /// Message indicating the focus status of the video stream on the head unit
    VideoFocusIndication(ChannelId, Usb::VideoFocusIndication),
    /// The stream is about to start
    StartIndication(ChannelId, Usb::AVChannelStartIndication),
    /// The stream has stopped
    StopIndication(ChannelId),
    /// A media indication message, optionally carrying a timestamp
    MediaIndication(ChannelId, Option<u64>, Vec<u8>),
    /// An acknowledgement of a received media indication
    MediaIndicationAck(ChannelId, Usb::AVMediaAckIndication),
    /// A request to open the microphone on the av input channel
    InputOpenRequest(ChannelId, Usb::AVInputOpenRequest),
    /// The response to a microphone open request
    InputOpenResponse(ChannelId, Usb::AVInputOpenResponse),
}

impl From<AvChannelMessage> for AndroidAutoFrame {
    fn from(value: AvChannelMessage) -> Self {
        let encrypted = FrameHeaderContents::new(true, FrameHeaderType::Single, false);
        match value {
            AvChannelMessage::SetupResponse(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::avchannel_message::Enum::SETUP_RESPONSE as u16,
                    &data,
                    encrypted,
                )
            }
            AvChannelMessage::VideoFocusIndication(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::avchannel_message::Enum::VIDEO_FOCUS_INDICATION as u16,
                    &data,
                    encrypted,
                )
            }
            AvChannelMessage::MediaIndicationAck(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::avchannel_message::Enum::AV_MEDIA_ACK_INDICATION as u16,
                    &data,
                    encrypted,
                )
            }
            AvChannelMessage::InputOpenResponse(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::avchannel_message::Enum::AV_INPUT_OPEN_RESPONSE as u16,
                    &data,
                    encrypted,
                )
            }
            AvChannelMessage::SetupRequest(_, _) => unimplemented!(),
            AvChannelMessage::VideoFocusRequest(_, _) => unimplemented!(),
            AvChannelMessage::StartIndication(_, _) => unimplemented!(),
            AvChannelMessage::StopIndication(_) => unimplemented!(),
            AvChannelMessage::MediaIndication(_, _, _) => unimplemented!(),
            AvChannelMessage::InputOpenRequest(_, _) => unimplemented!(),
        }
    }
}

impl TryFrom<&AndroidAutoFrame> for AvChannelMessage {
    type Error = String;
    fn try_from(value: &AndroidAutoFrame) -> Result<Self, Self::Error> {
        let ty = value
            .message_id()
            .ok_or_else(|| "Short message".to_string())?;
        if let Some(sys) = Usb::avchannel_message::Enum::from_i32(ty as i32) {
            match sys {
                Usb::avchannel_message::Enum::AV_MEDIA_WITH_TIMESTAMP_INDICATION => {
                    if value.data.len() < 10 {
                        return Err("Short media indication".to_string());
                    }
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&value.data[2..10]);
                    let ts = u64::from_be_bytes(b);
                    Ok(Self::MediaIndication(
                        value.header.channel_id,
                        Some(ts),
                        value.data[10..].to_vec(),
                    ))
                }
                Usb::avchannel_message::Enum::AV_MEDIA_INDICATION => Ok(Self::MediaIndication(
                    value.header.channel_id,
                    None,
                    value.data[2..].to_vec(),
                )),
                Usb::avchannel_message::Enum::SETUP_REQUEST => {
                    let m = Usb::AVChannelSetupRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::SetupRequest(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid av setup request: {}", e)),
                    }
                }
                Usb::avchannel_message::Enum::START_INDICATION => {
                    let m = Usb::AVChannelStartIndication::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::StartIndication(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid av start indication: {}", e)),
                    }
                }
                Usb::avchannel_message::Enum::STOP_INDICATION => {
                    match Usb::AVChannelStopIndication::parse_from_bytes(&value.data[2..]) {
                        Ok(_) => Ok(Self::StopIndication(value.header.channel_id)),
                        Err(e) => Err(format!("Invalid av stop indication: {}", e)),
                    }
                }
                Usb::avchannel_message::Enum::VIDEO_FOCUS_REQUEST => {
                    let m = Usb::VideoFocusRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::VideoFocusRequest(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid video focus request: {}", e)),
                    }
                }
                Usb::avchannel_message::Enum::SETUP_RESPONSE
                | Usb::avchannel_message::Enum::AV_MEDIA_ACK_INDICATION
                | Usb::avchannel_message::Enum::VIDEO_FOCUS_INDICATION => {
                    Err(format!("Unexpected head unit message 0x{:x}", ty))
                }
                Usb::avchannel_message::Enum::AV_INPUT_OPEN_REQUEST => {
                    let m = Usb::AVInputOpenRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::InputOpenRequest(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid av input open request: {}", e)),
                    }
                }
                Usb::avchannel_message::Enum::AV_INPUT_OPEN_RESPONSE => {
                    Err(format!("Unexpected head unit message 0x{:x}", ty))
                }
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}
