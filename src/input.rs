//! This is for the input channel handler code

use protobuf::{Enum, Message};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::{channel_open_ok, AndroidAutoCommonMessage};
use crate::error::{AutoError, ProtocolViolation};
use crate::frame::{AndroidAutoFrame, FrameHeaderContents, FrameHeaderType};
use crate::mux::StreamMux;
use crate::{
    AndroidAutoConfiguration, AndroidAutoMainTrait, ChannelHandlerTrait, ChannelId, TouchAction,
    Usb,
};

/// A message about input handling on the android auto head unit
#[derive(Debug)]
pub enum InputMessage {
    /// A message requesting input buttons to be bound
    BindingRequest(ChannelId, Usb::BindingRequest),
    /// A message that responds to a binding request, indicating success or failure of the request
    BindingResponse(ChannelId, Usb::BindingResponse),
    /// A message that conveys input data from the user
    InputEvent(ChannelId, Usb::InputEventIndication),
}

impl From<InputMessage> for AndroidAutoFrame {
    fn from(value: InputMessage) -> Self {
        let encrypted = FrameHeaderContents::new(true, FrameHeaderType::Single, false);
        match value {
            InputMessage::BindingRequest(_, _) => unimplemented!(),
            InputMessage::BindingResponse(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::input_channel_message::Enum::BINDING_RESPONSE as u16,
                    &data,
                    encrypted,
                )
            }
            InputMessage::InputEvent(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::input_channel_message::Enum::INPUT_EVENT_INDICATION as u16,
                    &data,
                    encrypted,
                )
            }
        }
    }
}

impl TryFrom<&AndroidAutoFrame> for InputMessage {
    type Error = String;
    fn try_from(value: &AndroidAutoFrame) -> Result<Self, Self::Error> {
        let ty = value
            .message_id()
            .ok_or_else(|| "Short message".to_string())?;
        if let Some(sys) = Usb::input_channel_message::Enum::from_i32(ty as i32) {
            match sys {
                Usb::input_channel_message::Enum::BINDING_REQUEST => {
                    let m = Usb::BindingRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::BindingRequest(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid input bind request: {}", e)),
                    }
                }
                Usb::input_channel_message::Enum::BINDING_RESPONSE
                | Usb::input_channel_message::Enum::INPUT_EVENT_INDICATION => {
                    Err(format!("Unexpected head unit message 0x{:x}", ty))
                }
                Usb::input_channel_message::Enum::NONE => Err("Null input message".to_string()),
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}

/// Build the frame conveying one touch event to the android auto device
pub fn touch_event_frame(
    channel: ChannelId,
    timestamp_us: u64,
    x: u32,
    y: u32,
    action: TouchAction,
) -> AndroidAutoFrame {
    let mut ev = Usb::InputEventIndication::new();
    ev.set_timestamp(timestamp_us);
    let mut te = Usb::TouchEvent::new();
    te.set_touch_action(match action {
        TouchAction::Press => Usb::touch_action::Enum::PRESS,
        TouchAction::Release => Usb::touch_action::Enum::RELEASE,
        TouchAction::Drag => Usb::touch_action::Enum::DRAG,
    });
    te.set_action_index(0);
    let mut loc = Usb::TouchLocation::new();
    loc.set_x(x);
    loc.set_y(y);
    loc.set_pointer_id(0);
    te.touch_location.push(loc);
    ev.touch_event.0.replace(Box::new(te));
    InputMessage::InputEvent(channel, ev).into()
}

/// Build the frame conveying one button event to the android auto device
pub fn button_event_frame(
    channel: ChannelId,
    timestamp_us: u64,
    scan_code: u32,
    pressed: bool,
) -> AndroidAutoFrame {
    let mut ev = Usb::InputEventIndication::new();
    ev.set_timestamp(timestamp_us);
    let mut list = Usb::ButtonEventList::new();
    let mut be = Usb::ButtonEvent::new();
    be.set_scan_code(scan_code);
    be.set_is_pressed(pressed);
    list.button_events.push(be);
    ev.button_event.0.replace(Box::new(list));
    InputMessage::InputEvent(channel, ev).into()
}

/// The handler for the input channel for the android auto protocol
pub struct InputChannelHandler {}

impl ChannelHandlerTrait for InputChannelHandler {
    fn build_channel<T: AndroidAutoMainTrait + ?Sized>(
        &self,
        config: &AndroidAutoConfiguration,
        chanid: ChannelId,
        _main: &T,
    ) -> Option<Usb::ChannelDescriptor> {
        let mut chan = Usb::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut ichan = Usb::InputChannel::new();
        for code in &config.input.keycodes {
            ichan.supported_keycodes.push(*code);
        }
        let mut tc = Usb::TouchConfig::new();
        tc.set_width(config.input.touchscreen_width);
        tc.set_height(config.input.touchscreen_height);
        ichan.touch_screen_config.0.replace(Box::new(tc));
        chan.input_channel.0.replace(Box::new(ichan));
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
        let msg2: Result<InputMessage, String> = (&msg).try_into();
        if let Ok(msg2) = msg2 {
            match msg2 {
                InputMessage::BindingRequest(chan, m) => {
                    log::info!("Input binding request for {} codes", m.scan_codes.len());
                    let mut m2 = Usb::BindingResponse::new();
                    m2.set_status(Usb::status::Enum::OK);
                    stream
                        .write_frame(InputMessage::BindingResponse(chan, m2).into())
                        .await?;
                }
                InputMessage::BindingResponse(_, _) | InputMessage::InputEvent(_, _) => {
                    unimplemented!()
                }
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
            "Unhandled input channel message {:x?}",
            msg.message_id()
        ))))
    }
}
