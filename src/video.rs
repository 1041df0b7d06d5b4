//! Contains code for the video channel

use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::avmsg::AvChannelMessage;
use crate::common::AndroidAutoCommonMessage;
use crate::error::{AutoError, ProtocolViolation};
use crate::frame::AndroidAutoFrame;
use crate::mux::StreamMux;
use crate::{
    AndroidAutoConfiguration, AndroidAutoMainTrait, ChannelHandlerTrait, ChannelId, Usb,
    VideoResolutionConfig,
};

/// The inner protected data for a video stream
struct InnerChannelHandler {
    /// The session id given in the start indication, present while streaming
    session: Option<i32>,
    /// The video configuration accepted during channel setup
    accepted: Option<VideoResolutionConfig>,
}

/// The handler for the video channel on android auto
pub struct VideoChannelHandler {
    /// The protected contents of a video stream
    inner: Mutex<InnerChannelHandler>,
}

impl VideoChannelHandler {
    /// Construct a new self
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(InnerChannelHandler {
                session: None,
                accepted: None,
            }),
        }
    }
}

impl ChannelHandlerTrait for VideoChannelHandler {
    fn build_channel<T: AndroidAutoMainTrait + ?Sized>(
        &self,
        config: &AndroidAutoConfiguration,
        chanid: ChannelId,
        _main: &T,
    ) -> Option<Usb::ChannelDescriptor> {
        let mut chan = Usb::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut avchan = Usb::AVChannel::new();
        avchan.set_stream_type(Usb::avstream_type::Enum::VIDEO);
        avchan.set_available_while_in_call(true);
        for vc in &config.display.video_configs {
            avchan.video_configs.push(vc.to_descriptor());
        }
        chan.av_channel.0.replace(Box::new(avchan));
        Some(chan)
    }

    async fn receive_data<T, U, V>(
        &self,
        msg: AndroidAutoFrame,
        stream: &StreamMux<U, V>,
        config: &AndroidAutoConfiguration,
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
                AndroidAutoCommonMessage::ChannelOpenRequest(m) => {
                    log::info!("Channel open request for video: {:?}", m);
                    let mut m2 = Usb::ChannelOpenResponse::new();
                    m2.set_status(if main.supports_video().is_some() {
                        Usb::status::Enum::OK
                    } else {
                        Usb::status::Enum::FAIL
                    });
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
                    let index = m.config_index() as usize;
                    let accepted = config
                        .display
                        .video_configs
                        .get(index)
                        .or_else(|| config.display.video_configs.first())
                        .copied();
                    let ok = if let (Some(v), Some(cfg)) = (main.supports_video(), accepted) {
                        v.setup_video(cfg).await
                    } else {
                        false
                    };
                    if ok {
                        self.inner.lock().unwrap().accepted = accepted;
                    }
                    let mut m2 = Usb::AVChannelSetupResponse::new();
                    m2.set_max_unacked(1);
                    m2.set_media_status(if ok {
                        Usb::avchannel_setup_status::Enum::OK
                    } else {
                        Usb::avchannel_setup_status::Enum::FAIL
                    });
                    m2.configs.push(m.config_index());
                    stream
                        .write_frame(AvChannelMessage::SetupResponse(channel, m2).into())
                        .await?;
                }
                AvChannelMessage::StartIndication(_chan, m) => {
                    self.inner.lock().unwrap().session = Some(m.session());
                }
                AvChannelMessage::StopIndication(_chan) => {
                    self.inner.lock().unwrap().session = None;
                }
                AvChannelMessage::MediaIndication(_chan, time, data) => {
                    let session = self.inner.lock().unwrap().session;
                    let Some(session) = session else {
                        log::warn!("Video data before start indication, dropping");
                        return Ok(());
                    };
                    if let Some(v) = main.supports_video() {
                        v.receive_video(data, time).await;
                    }
                    let mut m2 = Usb::AVMediaAckIndication::new();
                    m2.set_session(session);
                    m2.set_value(1);
                    stream
                        .write_frame(AvChannelMessage::MediaIndicationAck(channel, m2).into())
                        .await?;
                }
                AvChannelMessage::VideoFocusRequest(_chan, m) => {
                    let mode = m.focus_mode();
                    if let Some(v) = main.supports_video() {
                        v.set_focus(mode == Usb::video_focus_mode::Enum::FOCUSED).await;
                    }
                    let mut m2 = Usb::VideoFocusIndication::new();
                    m2.set_focus_mode(mode);
                    m2.set_unrequested(false);
                    stream
                        .write_frame(AvChannelMessage::VideoFocusIndication(channel, m2).into())
                        .await?;
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
            "Unhandled video channel message {:x?}",
            msg.message_id()
        ))))
    }
}
