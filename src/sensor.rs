//! Contains sensor channel code

use protobuf::{Enum, Message};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::{channel_open_ok, AndroidAutoCommonMessage};
use crate::error::{AutoError, ProtocolViolation};
use crate::frame::{AndroidAutoFrame, FrameHeaderContents, FrameHeaderType};
use crate::mux::StreamMux;
use crate::{AndroidAutoConfiguration, AndroidAutoMainTrait, ChannelHandlerTrait, ChannelId, Usb};

/// A message about sensors in android auto
#[derive(Debug)]
pub enum SensorMessage {
    /// A request to start a specific sensor
    SensorStartRequest(ChannelId, Usb::SensorStartRequestMessage),
    /// A response to the sensor start request
    SensorStartResponse(ChannelId, Usb::SensorStartResponseMessage),
    /// A message containing sensor data
    Event(ChannelId, Usb::SensorEventIndication),
}

impl From<SensorMessage> for AndroidAutoFrame {
    fn from(value: SensorMessage) -> Self {
        let encrypted = FrameHeaderContents::new(true, FrameHeaderType::Single, false);
        match value {
            SensorMessage::SensorStartRequest(_, _) => unimplemented!(),
            SensorMessage::SensorStartResponse(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::sensor_channel_message::Enum::SENSOR_START_RESPONSE as u16,
                    &data,
                    encrypted,
                )
            }
            SensorMessage::Event(chan, m) => {
                let data = m.write_to_bytes().unwrap();
                AndroidAutoFrame::from_message(
                    chan,
                    Usb::sensor_channel_message::Enum::SENSOR_EVENT_INDICATION as u16,
                    &data,
                    encrypted,
                )
            }
        }
    }
}

impl TryFrom<&AndroidAutoFrame> for SensorMessage {
    type Error = String;
    fn try_from(value: &AndroidAutoFrame) -> Result<Self, Self::Error> {
        let ty = value
            .message_id()
            .ok_or_else(|| "Short message".to_string())?;
        if let Some(sys) = Usb::sensor_channel_message::Enum::from_i32(ty as i32) {
            match sys {
                Usb::sensor_channel_message::Enum::SENSOR_START_REQUEST => {
                    let m = Usb::SensorStartRequestMessage::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::SensorStartRequest(value.header.channel_id, m)),
                        Err(e) => Err(e.to_string()),
                    }
                }
                Usb::sensor_channel_message::Enum::SENSOR_START_RESPONSE
                | Usb::sensor_channel_message::Enum::SENSOR_EVENT_INDICATION => {
                    Err(format!("Unexpected head unit message 0x{:x}", ty))
                }
                Usb::sensor_channel_message::Enum::NONE => Err("Null sensor message".to_string()),
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}

/// The handler for the sensor channel in the android auto protocol.
pub struct SensorChannelHandler {}

impl ChannelHandlerTrait for SensorChannelHandler {
    fn build_channel<T: AndroidAutoMainTrait + ?Sized>(
        &self,
        _config: &AndroidAutoConfiguration,
        chanid: ChannelId,
        _main: &T,
    ) -> Option<Usb::ChannelDescriptor> {
        let mut chan = Usb::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut sensor = Usb::SensorChannel::new();
        for ty in [
            Usb::sensor_type::Enum::DRIVING_STATUS,
            Usb::sensor_type::Enum::NIGHT_DATA,
        ] {
            let mut s = Usb::Sensor::new();
            s.set_type(ty);
            sensor.sensors.push(s);
        }
        chan.sensor_channel.0.replace(Box::new(sensor));
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
        let msg2: Result<SensorMessage, String> = (&msg).try_into();
        if let Ok(msg2) = msg2 {
            match msg2 {
                SensorMessage::SensorStartRequest(_chan, m) => {
                    let mut m2 = Usb::SensorStartResponseMessage::new();
                    m2.set_status(Usb::status::Enum::OK);
                    stream
                        .write_frame(SensorMessage::SensorStartResponse(channel, m2).into())
                        .await?;

                    // the device expects an initial reading right after the start response
                    let mut m3 = Usb::SensorEventIndication::new();
                    match m.sensor_type() {
                        Usb::sensor_type::Enum::DRIVING_STATUS => {
                            let mut ds = Usb::DrivingStatus::new();
                            ds.set_status(Usb::DrivingStatusEnum::UNRESTRICTED as i32);
                            m3.driving_status.push(ds);
                        }
                        Usb::sensor_type::Enum::NIGHT_DATA => {
                            let mut nm = Usb::NightMode::new();
                            nm.set_is_night(false);
                            m3.night_mode.push(nm);
                        }
                        other => {
                            log::warn!("Start request for unsupported sensor {:?}", other);
                            return Ok(());
                        }
                    }
                    stream
                        .write_frame(SensorMessage::Event(channel, m3).into())
                        .await?;
                }
                SensorMessage::SensorStartResponse(_, _) | SensorMessage::Event(_, _) => {
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
            "Unhandled sensor channel message {:x?}",
            msg.message_id()
        ))))
    }
}
