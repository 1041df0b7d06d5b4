//! Channel management messages shared by every service channel

use protobuf::{Enum, Message};

use crate::frame::{AndroidAutoFrame, FrameHeaderContents, FrameHeaderType};
use crate::{ChannelId, Usb};

/// A channel management message valid on any service channel
#[derive(Debug)]
pub enum AndroidAutoCommonMessage {
    /// A request from the device to open a service channel
    ChannelOpenRequest(Usb::ChannelOpenRequest),
    /// The response indicating success or failure of a channel open request
    ChannelOpenResponse(ChannelId, Usb::ChannelOpenResponse),
}

impl TryFrom<&AndroidAutoFrame> for AndroidAutoCommonMessage {
    type Error = String;
    fn try_from(value: &AndroidAutoFrame) -> Result<Self, Self::Error> {
        let ty = value
            .message_id()
            .ok_or_else(|| "Short message".to_string())?;
        if let Some(m) = Usb::CommonMessage::from_i32(ty as i32) {
            match m {
                Usb::CommonMessage::CHANNEL_OPEN_REQUEST => {
                    let m = Usb::ChannelOpenRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(AndroidAutoCommonMessage::ChannelOpenRequest(m)),
                        Err(e) => Err(format!("Invalid channel open request: {}", e)),
                    }
                }
                Usb::CommonMessage::CHANNEL_OPEN_RESPONSE => {
                    Err(format!("Unexpected head unit message 0x{:x}", ty))
                }
            }
        } else {
            Err(format!("Unknown packet type 0x{:x}", ty))
        }
    }
}

impl From<AndroidAutoCommonMessage> for AndroidAutoFrame {
    fn from(value: AndroidAutoCommonMessage) -> Self {
        match value {
            AndroidAutoCommonMessage::ChannelOpenResponse(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::CommonMessage::CHANNEL_OPEN_RESPONSE as u16,
                    &data,
                    FrameHeaderContents::new(true, FrameHeaderType::Single, false),
                )
            }
            AndroidAutoCommonMessage::ChannelOpenRequest(_) => unimplemented!(),
        }
    }
}

/// Build the standard OK response to a channel open request
pub fn channel_open_ok(channel: ChannelId) -> AndroidAutoFrame {
    let mut m = Usb::ChannelOpenResponse::new();
    m.set_status(Usb::status::Enum::OK);
    AndroidAutoCommonMessage::ChannelOpenResponse(channel, m).into()
}
