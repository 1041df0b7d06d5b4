//! This is for the av input channel handler code

use tokio::io::{AsyncRead, AsyncWrite};

use crate::avmsg::AvChannelMessage;
use crate::common::{channel_open_ok, AndroidAutoCommonMessage};
use crate::error::{AutoError, ProtocolViolation};
use crate::frame::AndroidAutoFrame;
use crate::mux::StreamMux;
use crate::{AndroidAutoConfiguration, AndroidAutoMainTrait, ChannelHandlerTrait, ChannelId, Usb};

/// Handles the av input channel of the android auto protocol. The channel is
/// declared during service discovery with a fixed 16 kHz mono descriptor;
/// no media flows on it here, the microphone open request is answered and
/// declined.
pub struct AvInputChannelHandler {}

impl ChannelHandlerTrait for AvInputChannelHandler {
    fn build_channel<T: AndroidAutoMainTrait + ?Sized>(
        &self,
        _config: &AndroidAutoConfiguration,
        chanid: ChannelId,
        _main: &T,
    ) -> Option<Usb::ChannelDescriptor> {
        let mut chan = Usb::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut avchan = Usb::AVInputChannel::new();
        avchan.set_stream_type(Usb::avstream_type::Enum::AUDIO);
        let mut ac = Usb::AudioConfig::new();
        ac.set_bit_depth(16);
        ac.set_channel_count(1);
        ac.set_sample_rate(16000);
        avchan.audio_config.0.replace(Box::new(ac));
        chan.av_input_channel.0.replace(Box::new(avchan));
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
        let msg2: Result<AvChannelMessage, String> = (&msg).try_into();
        if let Ok(msg2) = msg2 {
            match msg2 {
                AvChannelMessage::SetupRequest(_chan, m) => {
                    let mut m2 = Usb::AVChannelSetupResponse::new();
                    m2.set_max_unacked(10);
                    m2.set_media_status(Usb::avchannel_setup_status::Enum::OK);
                    m2.configs.push(m.config_index());
                    stream
                        .write_frame(AvChannelMessage::SetupResponse(channel, m2).into())
                        .await?;
                }
                AvChannelMessage::InputOpenRequest(_chan, m) => {
                    log::info!("Microphone open request: open={}", m.open());
                    let mut m2 = Usb::AVInputOpenResponse::new();
                    m2.set_session(m.session());
                    m2.set_value(0);
                    stream
                        .write_frame(AvChannelMessage::InputOpenResponse(channel, m2).into())
                        .await?;
                }
                AvChannelMessage::StartIndication(_, _) | AvChannelMessage::StopIndication(_) => {}
                AvChannelMessage::MediaIndication(_, _, _) => {
                    log::warn!("Media data on the av input channel, ignoring");
                }
                AvChannelMessage::SetupResponse(_, _)
                | AvChannelMessage::VideoFocusRequest(_, _)
                | AvChannelMessage::VideoFocusIndication(_, _)
                | AvChannelMessage::MediaIndicationAck(_, _)
                | AvChannelMessage::InputOpenResponse(_, _) => {
                    return Err(AutoError::Protocol(ProtocolViolation::UnexpectedMessage {
                        message_id: msg.message_id().unwrap_or(0),
                        state: "Serving",
                    }));
                }
            }
            return Ok(());
        }
        Err(AutoError::Protocol(ProtocolViolation::Decode(format!(
            "Unhandled av input channel message {:x?}",
            msg.message_id()
        ))))
    }
}
