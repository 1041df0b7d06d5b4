//! This crate implements the head unit side of an android auto projection
//! session over usb. It discovers an android device, switches it into
//! accessory mode, negotiates a mutually authenticated encrypted session and
//! operates the multiplexed channels carrying video, audio, input and
//! control messages. Rendering and decoding stay outside; assembled media
//! payloads are handed to the embedder through callback traits.

#![deny(missing_docs)]

mod cert;

pub mod audio;
pub mod avinput;
pub mod avmsg;
pub mod bluetooth;
pub mod common;
pub mod control;
pub mod cryptor;
pub mod error;
pub mod frame;
pub mod input;
pub mod mux;
pub mod sensor;
pub mod session;
pub mod usb;
pub mod video;

use tokio::io::{AsyncRead, AsyncWrite};

pub use error::{AutoError, ProtocolViolation};
pub use session::{run_session, AndroidAutoUsb};

#[allow(missing_docs)]
#[allow(non_snake_case)]
#[allow(clippy::missing_docs_in_private_items)]
mod protobufmod {
    include!(concat!(env!("OUT_DIR"), "/protobuf/mod.rs"));
}
pub use protobufmod::*;

/// The android auto protocol version supported
pub const VERSION: (u16, u16) = (1, 1);

/// The fixed table of logical channels multiplexed over one transport
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelId {
    /// The control channel driving the session lifecycle
    Control = 0,
    /// The input channel carrying touch and button events
    Input = 1,
    /// The sensor channel
    Sensor = 2,
    /// The video channel
    Video = 3,
    /// The media audio channel
    MediaAudio = 4,
    /// The speech audio channel
    SpeechAudio = 5,
    /// The system audio channel
    SystemAudio = 6,
    /// The av input channel, the microphone path
    AvInput = 7,
    /// The bluetooth service channel
    Bluetooth = 8,
}

impl TryFrom<u8> for ChannelId {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelId::Control),
            1 => Ok(ChannelId::Input),
            2 => Ok(ChannelId::Sensor),
            3 => Ok(ChannelId::Video),
            4 => Ok(ChannelId::MediaAudio),
            5 => Ok(ChannelId::SpeechAudio),
            6 => Ok(ChannelId::SystemAudio),
            7 => Ok(ChannelId::AvInput),
            8 => Ok(ChannelId::Bluetooth),
            other => Err(other),
        }
    }
}

impl From<ChannelId> for u8 {
    fn from(value: ChannelId) -> Self {
        value as u8
    }
}

/// The touch actions the embedder can report
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TouchAction {
    /// A finger went down
    Press,
    /// A finger went up
    Release,
    /// A finger moved while down
    Drag,
}

/// The audio output channels offered to the android auto device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AudioChannelType {
    /// Music and other media playback
    Media,
    /// Voice guidance and assistant speech
    Speech,
    /// Short system sounds
    System,
}

/// The pcm format of one audio channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate: u32,
    /// Bits per sample
    pub bit_depth: u32,
    /// Number of interleaved channels
    pub channel_count: u32,
}

impl AudioChannelType {
    /// The pcm format this channel is declared with during service discovery
    pub fn format(self) -> AudioFormat {
        match self {
            AudioChannelType::Media => AudioFormat {
                sample_rate: 48000,
                bit_depth: 16,
                channel_count: 2,
            },
            AudioChannelType::Speech | AudioChannelType::System => AudioFormat {
                sample_rate: 16000,
                bit_depth: 16,
                channel_count: 1,
            },
        }
    }
}

/// The resolutions a video configuration can offer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VideoResolution {
    /// 800 by 480
    P480,
    /// 1280 by 720
    P720,
    /// 1920 by 1080
    P1080,
}

/// The frame rates a video configuration can offer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VideoFps {
    /// 30 frames per second
    F30,
    /// 60 frames per second
    F60,
}

/// One video mode offered during service discovery. The mode the device
/// selects at channel setup is reported back to the embedder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VideoResolutionConfig {
    /// The resolution of this mode
    pub resolution: VideoResolution,
    /// The frame rate of this mode
    pub fps: VideoFps,
    /// The dots per inch reported for this mode
    pub dpi: u32,
    /// Horizontal margin in pixels
    pub margin_width: u32,
    /// Vertical margin in pixels
    pub margin_height: u32,
}

impl VideoResolutionConfig {
    /// The width in pixels of this mode
    pub fn width(&self) -> u32 {
        match self.resolution {
            VideoResolution::P480 => 800,
            VideoResolution::P720 => 1280,
            VideoResolution::P1080 => 1920,
        }
    }

    /// The height in pixels of this mode
    pub fn height(&self) -> u32 {
        match self.resolution {
            VideoResolution::P480 => 480,
            VideoResolution::P720 => 720,
            VideoResolution::P1080 => 1080,
        }
    }

    /// Build the protobuf descriptor declared in service discovery
    pub fn to_descriptor(&self) -> Usb::VideoConfig {
        let mut vc = Usb::VideoConfig::new();
        vc.set_video_resolution(match self.resolution {
            VideoResolution::P480 => Usb::video_resolution::Enum::_480p,
            VideoResolution::P720 => Usb::video_resolution::Enum::_720p,
            VideoResolution::P1080 => Usb::video_resolution::Enum::_1080p,
        });
        vc.set_video_fps(match self.fps {
            VideoFps::F30 => Usb::video_fps::Enum::_30,
            VideoFps::F60 => Usb::video_fps::Enum::_60,
        });
        vc.set_dpi(self.dpi);
        vc.set_margin_width(self.margin_width);
        vc.set_margin_height(self.margin_height);
        vc
    }
}

impl Default for VideoResolutionConfig {
    fn default() -> Self {
        Self {
            resolution: VideoResolution::P480,
            fps: VideoFps::F60,
            dpi: 111,
            margin_width: 0,
            margin_height: 0,
        }
    }
}

/// Information about the head unit that will be providing android auto services for compatible devices
#[derive(Clone)]
pub struct HeadUnitInfo {
    /// The name of the head unit
    pub name: String,
    /// The model of the vehicle
    pub car_model: String,
    /// The year of the vehicle
    pub car_year: String,
    /// The serial number of the vehicle
    pub car_serial: String,
    /// True when the vehicle is a left hand drive, false when a right hand drive
    pub left_hand: bool,
    /// The manufacturer of the head unit
    pub head_manufacturer: String,
    /// The model of the head unit
    pub head_model: String,
    /// The software build for the head unit
    pub sw_build: String,
    /// The software version for the head unit
    pub sw_version: String,
    /// Does the head unit support native media during vr
    pub native_media: bool,
    /// Should the clock be hidden?
    pub hide_clock: Option<bool>,
}

impl Default for HeadUnitInfo {
    fn default() -> Self {
        Self {
            name: "Head Unit".to_string(),
            car_model: "Universal".to_string(),
            car_year: "2025".to_string(),
            car_serial: "20180301".to_string(),
            left_hand: true,
            head_manufacturer: "Generic".to_string(),
            head_model: "Head Unit".to_string(),
            sw_build: "1".to_string(),
            sw_version: "1.0".to_string(),
            native_media: false,
            hide_clock: None,
        }
    }
}

/// The configurable parts of the identity string table sent during the
/// accessory mode query chain. Manufacturer, model, description and version
/// are fixed by the protocol and live in [`usb::aoap`].
#[derive(Clone)]
pub struct UsbIdentity {
    /// The uri presented to the device
    pub uri: String,
    /// The serial presented to the device
    pub serial: String,
}

impl Default for UsbIdentity {
    fn default() -> Self {
        Self {
            uri: "https://f1xstudio.com".to_string(),
            serial: "HU-AAAAAA001".to_string(),
        }
    }
}

/// The video modes the head unit offers during service discovery
#[derive(Clone)]
pub struct DisplayConfig {
    /// The offered modes; the device picks one by index at channel setup
    pub video_configs: Vec<VideoResolutionConfig>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            video_configs: vec![VideoResolutionConfig::default()],
        }
    }
}

/// The input hardware declared to the android auto device
#[derive(Clone)]
pub struct InputConfig {
    /// The width of the touchscreen in pixels
    pub touchscreen_width: u32,
    /// The height of the touchscreen in pixels
    pub touchscreen_height: u32,
    /// The key codes of any physical buttons
    pub keycodes: Vec<u32>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            touchscreen_width: 800,
            touchscreen_height: 480,
            keycodes: Vec::new(),
        }
    }
}

/// The required bluetooth information
#[derive(Clone, Default)]
pub struct BluetoothInformation {
    /// The mac address of the bluetooth adapter
    pub address: String,
}

/// Provides basic configuration elements for setting up an android auto head unit
#[derive(Clone, Default)]
pub struct AndroidAutoConfiguration {
    /// The head unit information
    pub unit: HeadUnitInfo,
    /// The identity strings for the accessory query chain
    pub identity: UsbIdentity,
    /// The display modes offered to the device
    pub display: DisplayConfig,
    /// The input hardware offered to the device
    pub input: InputConfig,
    /// The bluetooth information
    pub bluetooth: BluetoothInformation,
}

/// The base trait for crate users to implement
pub trait AndroidAutoMainTrait: Send + Sync {
    /// This allows the incoming video stream to be processed
    #[inline(always)]
    fn supports_video(&self) -> Option<&dyn AndroidAutoVideoChannelTrait> {
        None
    }

    /// This allows the incoming audio streams to be processed
    #[inline(always)]
    fn supports_audio_output(&self) -> Option<&dyn AndroidAutoAudioOutputTrait> {
        None
    }

    /// Called with true when a device is wired up and false when the session
    /// ends. Fired exactly once each per session, the true before
    /// authentication has completed.
    fn connection_status(&self, _connected: bool) {}
}

/// This trait is implemented by users wishing to display the video stream
/// from an android auto device.
#[async_trait::async_trait]
pub trait AndroidAutoVideoChannelTrait: Send + Sync {
    /// Set up the video pipeline for the mode the device selected. Return
    /// false if the mode cannot be displayed.
    async fn setup_video(&self, config: VideoResolutionConfig) -> bool;
    /// Process a chunk of h264 video data
    async fn receive_video(&self, data: Vec<u8>, timestamp: Option<u64>);
    /// Tear down the video receiver, may be called without the setup having been called
    async fn teardown_video(&self);
    /// The device gained or lost video focus
    async fn set_focus(&self, focused: bool);
}

/// This trait is implemented by users wishing to play the audio streams from
/// an android auto device.
#[async_trait::async_trait]
pub trait AndroidAutoAudioOutputTrait: Send + Sync {
    /// Prepare an output for the given channel and format
    async fn open_channel(
        &self,
        ty: AudioChannelType,
        format: AudioFormat,
    ) -> Result<(), AutoError>;
    /// Process a chunk of pcm samples for the given channel
    async fn receive_audio(
        &self,
        ty: AudioChannelType,
        format: AudioFormat,
        data: Vec<u8>,
        timestamp: Option<u64>,
    );
    /// The given channel stopped streaming
    async fn close_channel(&self, ty: AudioChannelType);
}

/// The trait every channel handler implements. Receive registrations are
/// re-armed by the session loop after each dispatched message; handlers only
/// look at the message in front of them.
pub(crate) trait ChannelHandlerTrait {
    /// Set the list of all channel descriptors. Only meaningful for the
    /// control channel, which reports them during service discovery.
    fn set_channels(&self, _chans: Vec<Usb::ChannelDescriptor>) {}

    /// Construct the descriptor this channel contributes to service
    /// discovery, or None when the channel stays undeclared.
    fn build_channel<T: AndroidAutoMainTrait + ?Sized>(
        &self,
        config: &AndroidAutoConfiguration,
        chanid: ChannelId,
        main: &T,
    ) -> Option<Usb::ChannelDescriptor>;

    /// Process one complete message addressed to this channel
    async fn receive_data<T, U, V>(
        &self,
        msg: frame::AndroidAutoFrame,
        stream: &mux::StreamMux<U, V>,
        config: &AndroidAutoConfiguration,
        main: &T,
    ) -> Result<(), AutoError>
    where
        T: AndroidAutoMainTrait + ?Sized,
        U: AsyncRead + Unpin,
        V: AsyncWrite + Unpin;
}
