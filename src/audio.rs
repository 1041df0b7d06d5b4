//! The audio output channels of the android auto protocol.
//!
//! Media, speech and system audio share one handler; they differ only in
//! their audio type and pcm format, which the device learns from the channel
//! descriptor and the embedder learns from the callbacks.

use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::avmsg::AvChannelMessage;
use crate::common::AndroidAutoCommonMessage;
use crate::error::{AutoError, ProtocolViolation};
use crate::frame::AndroidAutoFrame;
use crate::mux::StreamMux;
use crate::{
    AndroidAutoConfiguration, AndroidAutoMainTrait, AudioChannelType, ChannelHandlerTrait,
    ChannelId, Usb,
};

/// The handler for one audio output channel
pub struct AudioChannelHandler {
    /// Which of the audio output channels this handler serves
    ty: AudioChannelType,
    /// The session id given in the start indication, present while streaming
    session: Mutex<Option<i32>>,
}

impl AudioChannelHandler {
    /// Construct a handler for the given audio channel type
    pub fn new(ty: AudioChannelType) -> Self {
        Self {
            ty,
            session: Mutex::new(None),
        }
    }
}

impl ChannelHandlerTrait for AudioChannelHandler {
    fn build_channel<T: AndroidAutoMainTrait + ?Sized>(
        &self,
        _config: &AndroidAutoConfiguration,
        chanid: ChannelId,
        _main: &T,
    ) -> Option<Usb::ChannelDescriptor> {
        let mut chan = Usb::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut avchan = Usb::AVChannel::new();
        avchan.set_audio_type(match self.ty {
            AudioChannelType::Media => Usb::audio_type::Enum::MEDIA,
            AudioChannelType::Speech => Usb::audio_type::Enum::SPEECH,
            AudioChannelType::System => Usb::audio_type::Enum::SYSTEM,
        });
        avchan.set_available_while_in_call(true);
        avchan.set_stream_type(Usb::avstream_type::Enum::AUDIO);
        let format = self.ty.format();
        let mut ac = Usb::AudioConfig::new();
        ac.set_bit_depth(format.bit_depth);
        ac.set_channel_count(format.channel_count);
        ac.set_sample_rate(format.sample_rate);
        avchan.audio_configs.push(ac);
        chan.av_channel.0.replace(Box::new(avchan));
        Some(chan)
    }

    async fn receive_data<T, U, V>(
        &self,
        msg: AndroidAutoFrame,
        stream: &StreamMux<U, V>,
        _config: &AndroidAutoConfiguration,
        main: &T,
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
                    let mut m2 = Usb::ChannelOpenResponse::new();
                    let mut status = Usb::status::Enum::FAIL;
                    if let Some(a) = main.supports_audio_output() {
                        if a.open_channel(self.ty, self.ty.format()).await.is_ok() {
                            status = Usb::status::Enum::OK;
                        }
                    }
                    m2.set_status(status);
                    stream
                        .write_frame(
                            AndroidAutoCommonMessage::ChannelOpenResponse(channel, m2).into(),
                        )
                        .await?;
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
                AvChannelMessage::StartIndication(_chan, m) => {
                    *self.session.lock().unwrap() = Some(m.session());
                }
                AvChannelMessage::StopIndication(_chan) => {
                    *self.session.lock().unwrap() = None;
                    if let Some(a) = main.supports_audio_output() {
                        a.close_channel(self.ty).await;
                    }
                }
                AvChannelMessage::MediaIndication(_chan, time, data) => {
                    let session = *self.session.lock().unwrap();
                    let Some(session) = session else {
                        log::warn!("{:?} audio data before start indication, dropping", self.ty);
                        return Ok(());
                    };
                    if let Some(a) = main.supports_audio_output() {
                        a.receive_audio(self.ty, self.ty.format(), data, time).await;
                    }
                    let mut m2 = Usb::AVMediaAckIndication::new();
                    m2.set_session(session);
                    m2.set_value(1);
                    stream
                        .write_frame(AvChannelMessage::MediaIndicationAck(channel, m2).into())
                        .await?;
                }
                AvChannelMessage::VideoFocusRequest(_, _) => {
                    log::warn!("Video focus request on {:?} audio channel, ignoring", self.ty);
                }
                AvChannelMessage::SetupResponse(_, _)
                | AvChannelMessage::VideoFocusIndication(_, _)
                | AvChannelMessage::MediaIndicationAck(_, _)
                | AvChannelMessage::InputOpenRequest(_, _)
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
            "Unhandled audio channel message {:x?}",
            msg.message_id()
        ))))
    }
}
