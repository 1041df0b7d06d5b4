//! Code for the control channel.
//!
//! The control channel drives the session lifecycle: version negotiation,
//! the ssl handshake carried in control messages, service discovery and the
//! focus and shutdown exchanges. Its handler is the only stateful part of
//! the channel layer; every transition below follows the fixed lifecycle
//! version -> handshake -> auth -> discovery -> serving.

use std::sync::Mutex;

use protobuf::{Enum, Message};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cryptor::HandshakeStatus;
use crate::error::{AutoError, ProtocolViolation};
use crate::frame::{AndroidAutoFrame, FrameHeaderContents, FrameHeaderType};
use crate::mux::StreamMux;
use crate::{
    AndroidAutoConfiguration, AndroidAutoMainTrait, ChannelHandlerTrait, ChannelId, Usb, VERSION,
};

/// A control message on the android auto protocol
#[derive(Debug)]
pub enum AndroidAutoControlMessage {
    /// A message requesting version information
    VersionRequest,
    /// A message containing the version of the android auto device and compatibility status
    VersionResponse {
        /// The major version
        major: u16,
        /// The minor version
        minor: u16,
        /// The status of the version compatibility, 0xffff indicates incompatibility
        status: u16,
    },
    /// A message containing ssl handshake data
    SslHandshake(Vec<u8>),
    /// A message indicating that the ssl authentication is complete
    SslAuthComplete(bool),
    /// A request to discover all services in operation on the head unit
    ServiceDiscoveryRequest(Usb::ServiceDiscoveryRequest),
    /// The response to a service discovery request
    ServiceDiscoveryResponse(Usb::ServiceDiscoveryResponse),
    /// A request to set the audio focus
    AudioFocusRequest(Usb::AudioFocusRequest),
    /// A response to an audio focus request
    AudioFocusResponse(Usb::AudioFocusResponse),
    /// A request to set the navigation focus
    NavigationFocusRequest(Usb::NavigationFocusRequest),
    /// A response to a navigation focus request
    NavigationFocusResponse(Usb::NavigationFocusResponse),
    /// A request for ping
    PingRequest(Usb::PingRequest),
    /// A response to a ping request
    PingResponse(Usb::PingResponse),
    /// A request for an orderly shutdown of the session
    ShutdownRequest(Usb::ShutdownRequest),
    /// The acknowledgement of a shutdown request
    ShutdownResponse(Usb::ShutdownResponse),
    /// A request to start a voice session
    VoiceSessionRequest(Usb::VoiceSessionRequest),
}

impl TryFrom<&AndroidAutoFrame> for AndroidAutoControlMessage {
    type Error = String;
    fn try_from(value: &AndroidAutoFrame) -> Result<Self, Self::Error> {
        let ty = value
            .message_id()
            .ok_or_else(|| "Short message".to_string())?;
        let w = Usb::ControlMessage::from_i32(ty as i32);
        if let Some(m) = w {
            match m {
                Usb::ControlMessage::MESSAGE_NONE => Err("Null control message".to_string()),
                Usb::ControlMessage::VERSION_REQUEST => Ok(Self::VersionRequest),
                Usb::ControlMessage::VERSION_RESPONSE => {
                    if value.data.len() == 8 {
                        let major = u16::from_be_bytes([value.data[2], value.data[3]]);
                        let minor = u16::from_be_bytes([value.data[4], value.data[5]]);
                        let status = u16::from_be_bytes([value.data[6], value.data[7]]);
                        Ok(Self::VersionResponse {
                            major,
                            minor,
                            status,
                        })
                    } else {
                        Err("Invalid version response packet".to_string())
                    }
                }
                Usb::ControlMessage::SSL_HANDSHAKE => {
                    Ok(Self::SslHandshake(value.data[2..].to_vec()))
                }
                Usb::ControlMessage::AUTH_COMPLETE => {
                    let m = Usb::AuthCompleteIndication::parse_from_bytes(&value.data[2..])
                        .map_err(|e| format!("Invalid auth complete: {}", e))?;
                    Ok(Self::SslAuthComplete(
                        m.status() == Usb::AuthCompleteIndicationStatus::OK,
                    ))
                }
                Usb::ControlMessage::SERVICE_DISCOVERY_REQUEST => {
                    let m = Usb::ServiceDiscoveryRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::ServiceDiscoveryRequest(m)),
                        Err(e) => Err(format!("Invalid service discovery request: {}", e)),
                    }
                }
                Usb::ControlMessage::SERVICE_DISCOVERY_RESPONSE => {
                    Err("Service discovery response from peer".to_string())
                }
                Usb::ControlMessage::AUDIO_FOCUS_REQUEST => {
                    let m = Usb::AudioFocusRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::AudioFocusRequest(m)),
                        Err(e) => Err(format!("Invalid audio focus request: {}", e)),
                    }
                }
                Usb::ControlMessage::AUDIO_FOCUS_RESPONSE => {
                    Err("Audio focus response from peer".to_string())
                }
                Usb::ControlMessage::NAVIGATION_FOCUS_REQUEST => {
                    let m = Usb::NavigationFocusRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::NavigationFocusRequest(m)),
                        Err(e) => Err(format!("Invalid navigation focus request: {}", e)),
                    }
                }
                Usb::ControlMessage::NAVIGATION_FOCUS_RESPONSE => {
                    Err("Navigation focus response from peer".to_string())
                }
                Usb::ControlMessage::PING_REQUEST => {
                    let m = Usb::PingRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::PingRequest(m)),
                        Err(e) => Err(format!("Invalid ping request: {}", e)),
                    }
                }
                Usb::ControlMessage::PING_RESPONSE => {
                    let m = Usb::PingResponse::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::PingResponse(m)),
                        Err(e) => Err(format!("Invalid ping response: {}", e)),
                    }
                }
                Usb::ControlMessage::SHUTDOWN_REQUEST => {
                    let m = Usb::ShutdownRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::ShutdownRequest(m)),
                        Err(e) => Err(format!("Invalid shutdown request: {}", e)),
                    }
                }
                Usb::ControlMessage::SHUTDOWN_RESPONSE => {
                    let m = Usb::ShutdownResponse::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::ShutdownResponse(m)),
                        Err(e) => Err(format!("Invalid shutdown response: {}", e)),
                    }
                }
                Usb::ControlMessage::VOICE_SESSION_REQUEST => {
                    let m = Usb::VoiceSessionRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::VoiceSessionRequest(m)),
                        Err(e) => Err(format!("Invalid voice session request: {}", e)),
                    }
                }
            }
        } else {
            Err(format!("Unknown packet type 0x{:x}", ty))
        }
    }
}

impl From<AndroidAutoControlMessage> for AndroidAutoFrame {
    fn from(value: AndroidAutoControlMessage) -> Self {
        // version negotiation and the handshake ride outside the tls session,
        // flagged as control flow; everything later is encrypted
        let plain_control = FrameHeaderContents::new(false, FrameHeaderType::Single, true);
        let encrypted = FrameHeaderContents::new(true, FrameHeaderType::Single, false);
        match value {
            AndroidAutoControlMessage::VersionRequest => {
                let mut payload = Vec::with_capacity(4);
                payload.extend_from_slice(&VERSION.0.to_be_bytes());
                payload.extend_from_slice(&VERSION.1.to_be_bytes());
                AndroidAutoFrame::from_message(
                    ChannelId::Control,
                    Usb::ControlMessage::VERSION_REQUEST as u16,
                    &payload,
                    plain_control,
                )
            }
            AndroidAutoControlMessage::SslHandshake(data) => AndroidAutoFrame::from_message(
                ChannelId::Control,
                Usb::ControlMessage::SSL_HANDSHAKE as u16,
                &data,
                plain_control,
            ),
            AndroidAutoControlMessage::SslAuthComplete(status) => {
                let mut m = Usb::AuthCompleteIndication::new();
                m.set_status(if status {
                    Usb::AuthCompleteIndicationStatus::OK
                } else {
                    Usb::AuthCompleteIndicationStatus::FAIL
                });
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    ChannelId::Control,
                    Usb::ControlMessage::AUTH_COMPLETE as u16,
                    &data,
                    plain_control,
                )
            }
            AndroidAutoControlMessage::ServiceDiscoveryResponse(m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    ChannelId::Control,
                    Usb::ControlMessage::SERVICE_DISCOVERY_RESPONSE as u16,
                    &data,
                    encrypted,
                )
            }
            AndroidAutoControlMessage::AudioFocusResponse(m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    ChannelId::Control,
                    Usb::ControlMessage::AUDIO_FOCUS_RESPONSE as u16,
                    &data,
                    encrypted,
                )
            }
            AndroidAutoControlMessage::NavigationFocusResponse(m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    ChannelId::Control,
                    Usb::ControlMessage::NAVIGATION_FOCUS_RESPONSE as u16,
                    &data,
                    encrypted,
                )
            }
            AndroidAutoControlMessage::PingRequest(m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    ChannelId::Control,
                    Usb::ControlMessage::PING_REQUEST as u16,
                    &data,
                    encrypted,
                )
            }
            AndroidAutoControlMessage::PingResponse(m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    ChannelId::Control,
                    Usb::ControlMessage::PING_RESPONSE as u16,
                    &data,
                    encrypted,
                )
            }
            AndroidAutoControlMessage::ShutdownResponse(m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    ChannelId::Control,
                    Usb::ControlMessage::SHUTDOWN_RESPONSE as u16,
                    &data,
                    encrypted,
                )
            }
            AndroidAutoControlMessage::VersionResponse { .. }
            | AndroidAutoControlMessage::ServiceDiscoveryRequest(_)
            | AndroidAutoControlMessage::AudioFocusRequest(_)
            | AndroidAutoControlMessage::NavigationFocusRequest(_)
            | AndroidAutoControlMessage::ShutdownRequest(_)
            | AndroidAutoControlMessage::VoiceSessionRequest(_) => unimplemented!(),
        }
    }
}

/// The lifecycle states of the control channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlState {
    /// The version request has been sent, waiting on the response
    VersionPending,
    /// The ssl handshake is being pumped through control messages
    TlsHandshaking,
    /// Authentication finished, waiting for service discovery
    Authed,
    /// Service discovery answered, channels operating
    Serving,
    /// The peer asked for shutdown, the session is winding down
    Closing,
    /// A fatal error ended the session
    Failed,
}

impl ControlState {
    /// The state name used in protocol violation reports
    fn name(self) -> &'static str {
        match self {
            ControlState::VersionPending => "VersionPending",
            ControlState::TlsHandshaking => "TlsHandshaking",
            ControlState::Authed => "Authed",
            ControlState::Serving => "Serving",
            ControlState::Closing => "Closing",
            ControlState::Failed => "Failed",
        }
    }
}

/// Handles the control channel of the android auto protocol
pub struct ControlChannelHandler {
    /// The descriptors of all service channels, filled in before the session starts
    channels: Mutex<Vec<Usb::ChannelDescriptor>>,
    /// Where the session currently is in its lifecycle
    state: Mutex<ControlState>,
}

impl ControlChannelHandler {
    /// Construct a new self
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
            state: Mutex::new(ControlState::VersionPending),
        }
    }

    /// The current lifecycle state
    pub fn state(&self) -> ControlState {
        *self.state.lock().unwrap()
    }

    /// True once service discovery has been answered and channels may open
    pub fn is_serving(&self) -> bool {
        self.state() == ControlState::Serving
    }

    /// Record that a fatal error ended the session
    pub fn fail(&self) {
        *self.state.lock().unwrap() = ControlState::Failed;
    }

    /// Verify the current state and report a protocol violation otherwise
    fn expect_state(&self, wanted: ControlState, message_id: u16) -> Result<(), AutoError> {
        let state = self.state();
        if state != wanted {
            return Err(AutoError::Protocol(ProtocolViolation::UnexpectedMessage {
                message_id,
                state: state.name(),
            }));
        }
        Ok(())
    }

    /// Move to a new lifecycle state
    fn transition(&self, next: ControlState) {
        let mut state = self.state.lock().unwrap();
        log::debug!("Control state {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Send the version request that opens the conversation with the device
    pub async fn send_version_request<U, V>(
        &self,
        stream: &StreamMux<U, V>,
    ) -> Result<(), AutoError>
    where
        U: AsyncRead + Unpin,
        V: AsyncWrite + Unpin,
    {
        let d: AndroidAutoFrame = AndroidAutoControlMessage::VersionRequest.into();
        stream.write_frame(d).await
    }

    /// Build the service discovery response for the current configuration
    fn build_discovery_response(
        &self,
        config: &AndroidAutoConfiguration,
    ) -> Usb::ServiceDiscoveryResponse {
        let mut m = Usb::ServiceDiscoveryResponse::new();
        m.set_head_unit_name(config.unit.name.clone());
        m.set_car_model(config.unit.car_model.clone());
        m.set_car_year(config.unit.car_year.clone());
        m.set_car_serial(config.unit.car_serial.clone());
        m.set_left_hand_drive_vehicle(config.unit.left_hand);
        m.set_headunit_manufacturer(config.unit.head_manufacturer.clone());
        m.set_headunit_model(config.unit.head_model.clone());
        m.set_sw_build(config.unit.sw_build.clone());
        m.set_sw_version(config.unit.sw_version.clone());
        m.set_can_play_native_media_during_vr(config.unit.native_media);
        if let Some(hide) = config.unit.hide_clock {
            m.set_hide_clock(hide);
        }
        for s in self.channels.lock().unwrap().iter() {
            m.channels.push(s.clone());
        }
        m
    }
}

impl ChannelHandlerTrait for ControlChannelHandler {
    fn set_channels(&self, chans: Vec<Usb::ChannelDescriptor>) {
        *self.channels.lock().unwrap() = chans;
    }

    fn build_channel<T: AndroidAutoMainTrait + ?Sized>(
        &self,
        _config: &AndroidAutoConfiguration,
        _chanid: ChannelId,
        _main: &T,
    ) -> Option<Usb::ChannelDescriptor> {
        None
    }

    async fn receive_data<T, U, V>(
        &self,
        msg: AndroidAutoFrame,
        stream: &StreamMux<U, V>,
        config: &AndroidAutoConfiguration,
        _main: &T,
    ) -> Result<(), AutoError>
    where
        T: AndroidAutoMainTrait + ?Sized,
        U: AsyncRead + Unpin,
        V: AsyncWrite + Unpin,
    {
        let message_id = msg.message_id().unwrap_or(0);
        let msg2: AndroidAutoControlMessage = (&msg)
            .try_into()
            .map_err(|e: String| AutoError::Protocol(ProtocolViolation::Decode(e)))?;
        match msg2 {
            AndroidAutoControlMessage::VersionResponse {
                major,
                minor,
                status,
            } => {
                self.expect_state(ControlState::VersionPending, message_id)?;
                if status == 0xFFFF {
                    log::error!("Version mismatch, peer is {}.{}", major, minor);
                    self.transition(ControlState::Failed);
                    return Err(AutoError::Protocol(ProtocolViolation::VersionMismatch {
                        major,
                        minor,
                    }));
                }
                log::info!("Android auto device version: {}.{}", major, minor);
                self.transition(ControlState::TlsHandshaking);
                let first = stream
                    .with_cryptor(|c| {
                        c.do_handshake()?;
                        c.read_handshake()
                    })
                    .await?;
                let d: AndroidAutoFrame = AndroidAutoControlMessage::SslHandshake(first).into();
                stream.write_frame(d).await?;
            }
            AndroidAutoControlMessage::SslHandshake(data) => {
                self.expect_state(ControlState::TlsHandshaking, message_id)?;
                let (status, out) = stream
                    .with_cryptor(|c| {
                        c.write_handshake(&data)?;
                        let status = c.do_handshake()?;
                        let out = c.read_handshake()?;
                        Ok::<_, AutoError>((status, out))
                    })
                    .await?;
                if !out.is_empty() {
                    let d: AndroidAutoFrame = AndroidAutoControlMessage::SslHandshake(out).into();
                    stream.write_frame(d).await?;
                }
                if status == HandshakeStatus::Done {
                    log::info!("Ssl handshake complete");
                    let d: AndroidAutoFrame =
                        AndroidAutoControlMessage::SslAuthComplete(true).into();
                    stream.write_frame(d).await?;
                    self.transition(ControlState::Authed);
                }
            }
            AndroidAutoControlMessage::ServiceDiscoveryRequest(m) => {
                self.expect_state(ControlState::Authed, message_id)?;
                log::info!(
                    "Service discovery request from {} {}",
                    m.device_brand(),
                    m.device_name()
                );
                let response = self.build_discovery_response(config);
                let d: AndroidAutoFrame =
                    AndroidAutoControlMessage::ServiceDiscoveryResponse(response).into();
                stream.write_frame(d).await?;
                self.transition(ControlState::Serving);
            }
            AndroidAutoControlMessage::AudioFocusRequest(m) => {
                self.expect_state(ControlState::Serving, message_id)?;
                let mut m2 = Usb::AudioFocusResponse::new();
                let s = if m.has_audio_focus_type() {
                    match m.audio_focus_type() {
                        Usb::audio_focus_type::Enum::NONE => Usb::audio_focus_state::Enum::NONE,
                        Usb::audio_focus_type::Enum::GAIN => Usb::audio_focus_state::Enum::GAIN,
                        Usb::audio_focus_type::Enum::GAIN_TRANSIENT => {
                            Usb::audio_focus_state::Enum::GAIN_TRANSIENT
                        }
                        Usb::audio_focus_type::Enum::GAIN_NAVI => {
                            Usb::audio_focus_state::Enum::GAIN
                        }
                        Usb::audio_focus_type::Enum::RELEASE => Usb::audio_focus_state::Enum::LOSS,
                    }
                } else {
                    Usb::audio_focus_state::Enum::NONE
                };
                m2.set_audio_focus_state(s);
                let d: AndroidAutoFrame = AndroidAutoControlMessage::AudioFocusResponse(m2).into();
                stream.write_frame(d).await?;
            }
            AndroidAutoControlMessage::NavigationFocusRequest(m) => {
                self.expect_state(ControlState::Serving, message_id)?;
                let mut m2 = Usb::NavigationFocusResponse::new();
                m2.set_type(m.type_());
                let d: AndroidAutoFrame =
                    AndroidAutoControlMessage::NavigationFocusResponse(m2).into();
                stream.write_frame(d).await?;
            }
            AndroidAutoControlMessage::PingRequest(m) => {
                let state = self.state();
                if !matches!(state, ControlState::Authed | ControlState::Serving) {
                    return Err(AutoError::Protocol(ProtocolViolation::UnexpectedMessage {
                        message_id,
                        state: state.name(),
                    }));
                }
                let mut m2 = Usb::PingResponse::new();
                m2.set_timestamp(m.timestamp());
                let d: AndroidAutoFrame = AndroidAutoControlMessage::PingResponse(m2).into();
                stream.write_frame(d).await?;
            }
            AndroidAutoControlMessage::PingResponse(_) => {
                log::debug!("Ping response from device");
            }
            AndroidAutoControlMessage::ShutdownRequest(_) => {
                log::info!("Device requested shutdown");
                let d: AndroidAutoFrame =
                    AndroidAutoControlMessage::ShutdownResponse(Usb::ShutdownResponse::new())
                        .into();
                stream.write_frame(d).await?;
                self.transition(ControlState::Closing);
                return Err(AutoError::Shutdown);
            }
            AndroidAutoControlMessage::ShutdownResponse(_) => {
                log::debug!("Shutdown response from device");
            }
            AndroidAutoControlMessage::VoiceSessionRequest(_) => {
                self.expect_state(ControlState::Serving, message_id)?;
                log::info!("Voice session request");
            }
            AndroidAutoControlMessage::VersionRequest
            | AndroidAutoControlMessage::SslAuthComplete(_)
            | AndroidAutoControlMessage::ServiceDiscoveryResponse(_)
            | AndroidAutoControlMessage::AudioFocusResponse(_)
            | AndroidAutoControlMessage::NavigationFocusResponse(_) => {
                let state = self.state();
                return Err(AutoError::Protocol(ProtocolViolation::UnexpectedMessage {
                    message_id,
                    state: state.name(),
                }));
            }
        }
        Ok(())
    }
}
