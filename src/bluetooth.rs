//! Contains bluetooth channel code

use protobuf::{Enum, EnumOrUnknown, Message};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::{channel_open_ok, AndroidAutoCommonMessage};
use crate::error::{AutoError, ProtocolViolation};
use crate::frame::{AndroidAutoFrame, FrameHeaderContents, FrameHeaderType};
use crate::mux::StreamMux;
use crate::{AndroidAutoConfiguration, AndroidAutoMainTrait, ChannelHandlerTrait, ChannelId, Usb};

/// A message about bluetooth operations
#[derive(Debug)]
pub enum BluetoothMessage {
    /// A request to pair with a specified bluetooth device
    PairingRequest(ChannelId, Usb::BluetoothPairingRequest),
    /// A response to a pairing request
    PairingResponse(ChannelId, Usb::BluetoothPairingResponse),
}

impl From<BluetoothMessage> for AndroidAutoFrame {
    fn from(value: BluetoothMessage) -> Self {
        match value {
            BluetoothMessage::PairingRequest(_, _) => unimplemented!(),
            BluetoothMessage::PairingResponse(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::bluetooth_channel_message::Enum::PAIRING_RESPONSE as u16,
                    &data,
                    FrameHeaderContents::new(true, FrameHeaderType::Single, false),
                )
            }
        }
    }
}

impl TryFrom<&AndroidAutoFrame> for BluetoothMessage {
    type Error = String;
    fn try_from(value: &AndroidAutoFrame) -> Result<Self, Self::Error> {
        let ty = value
            .message_id()
            .ok_or_else(|| "Short message".to_string())?;
        if let Some(sys) = Usb::bluetooth_channel_message::Enum::from_i32(ty as i32) {
            match sys {
                Usb::bluetooth_channel_message::Enum::PAIRING_REQUEST => {
                    let m = Usb::BluetoothPairingRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::PairingRequest(value.header.channel_id, m)),
                        Err(e) => Err(e.to_string()),
                    }
                }
                Usb::bluetooth_channel_message::Enum::PAIRING_RESPONSE => {
                    Err(format!("Unexpected head unit message 0x{:x}", ty))
                }
                Usb::bluetooth_channel_message::Enum::AUTH_DATA => {
                    Err("Bluetooth auth data is not handled".to_string())
                }
                Usb::bluetooth_channel_message::Enum::NONE => {
                    Err("Null bluetooth message".to_string())
                }
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}

/// The handler for the bluetooth service channel in the android auto protocol
pub struct BluetoothChannelHandler {}

impl ChannelHandlerTrait for BluetoothChannelHandler {
    fn build_channel<T: AndroidAutoMainTrait + ?Sized>(
        &self,
        config: &AndroidAutoConfiguration,
        chanid: ChannelId,
        _main: &T,
    ) -> Option<Usb::ChannelDescriptor> {
        let mut chan = Usb::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut bchan = Usb::BluetoothChannel::new();
        bchan.set_adapter_address(config.bluetooth.address.clone());
        bchan
            .supported_pairing_methods
            .push(EnumOrUnknown::new(Usb::bluetooth_pairing_method::Enum::HFP));
        chan.bluetooth_channel.0.replace(Box::new(bchan));
        Some(chan)
    }

    async fn receive_data<T, U, V>(
        &self,
        msg: AndroidAutoFrame,
        stream: &StreamMux<U, V>,
        _config: &AndroidAutoConfiguration,
        _main: &T,
    ) -> Result<(), AutoError>
    where
        T: AndroidAutoMainTrait + ?Sized,
        U: AsyncRead + Unpin,
        V: AsyncWrite + Unpin,
    {
        let channel = msg.header.channel_id;
        let msg2: Result<BluetoothMessage, String> = (&msg).try_into();
        if let Ok(msg2) = msg2 {
            match msg2 {
                BluetoothMessage::PairingRequest(_chan, m) => {
                    log::info!("Bluetooth pairing request from {}", m.phone_address());
                    let mut m2 = Usb::BluetoothPairingResponse::new();
                    m2.set_already_paired(true);
                    m2.set_status(Usb::bluetooth_pairing_status::Enum::OK);
                    stream
                        .write_frame(BluetoothMessage::PairingResponse(channel, m2).into())
                        .await?;
                }
                BluetoothMessage::PairingResponse(_, _) => unimplemented!(),
            }
            return Ok(());
        }
        let msg2: Result<AndroidAutoCommonMessage, String> = (&msg).try_into();
        if let Ok(msg2) = msg2 {
            match msg2 {
                AndroidAutoCommonMessage::ChannelOpenResponse(_, _) => unimplemented!(),
                AndroidAutoCommonMessage::ChannelOpenRequest(_m) => {
                    stream.write_frame(channel_open_ok(channel)).await?;
                }
            }
            return Ok(());
        }
        Err(AutoError::Protocol(ProtocolViolation::Decode(format!(
            "Unhandled bluetooth channel message {:x?}",
            msg.message_id()
        ))))
    }
}
