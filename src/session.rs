//! The session supervisor.
//!
//! A session owns the wiring between the usb transport, the multiplexer and
//! the channel handlers. The supervisor loops over usb discovery, runs one
//! session per accessory device and reports exactly one connected and one
//! disconnected event for each.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::audio::AudioChannelHandler;
use crate::avinput::AvInputChannelHandler;
use crate::bluetooth::BluetoothChannelHandler;
use crate::control::ControlChannelHandler;
use crate::cryptor::Cryptor;
use crate::error::{AutoError, ProtocolViolation};
use crate::frame::AndroidAutoFrame;
use crate::input::{button_event_frame, touch_event_frame, InputChannelHandler};
use crate::mux::StreamMux;
use crate::sensor::SensorChannelHandler;
use crate::usb::hub::UsbHub;
use crate::usb::transport::{UsbReadHalf, UsbTransport, UsbWriteHalf};
use crate::video::VideoChannelHandler;
use crate::{
    AndroidAutoConfiguration, AndroidAutoMainTrait, AudioChannelType, ChannelHandlerTrait,
    ChannelId, TouchAction, Usb,
};

/// The order channels are declared in the service discovery response
const CHANNEL_DECLARATION_ORDER: [ChannelId; 8] = [
    ChannelId::AvInput,
    ChannelId::MediaAudio,
    ChannelId::SpeechAudio,
    ChannelId::SystemAudio,
    ChannelId::Sensor,
    ChannelId::Video,
    ChannelId::Bluetooth,
    ChannelId::Input,
];

/// The channel handler type that covers all possible channel handlers
pub enum ChannelHandler {
    /// The control channel
    Control(ControlChannelHandler),
    /// The input channel
    Input(InputChannelHandler),
    /// The sensor channel
    Sensor(SensorChannelHandler),
    /// The video channel
    Video(VideoChannelHandler),
    /// One of the audio output channels
    Audio(AudioChannelHandler),
    /// The av input channel
    AvInput(AvInputChannelHandler),
    /// The bluetooth channel
    Bluetooth(BluetoothChannelHandler),
}

impl ChannelHandlerTrait for ChannelHandler {
    fn set_channels(&self, chans: Vec<Usb::ChannelDescriptor>) {
        if let ChannelHandler::Control(c) = self {
            c.set_channels(chans);
        }
    }

    fn build_channel<T: AndroidAutoMainTrait + ?Sized>(
        &self,
        config: &AndroidAutoConfiguration,
        chanid: ChannelId,
        main: &T,
    ) -> Option<Usb::ChannelDescriptor> {
        match self {
            ChannelHandler::Control(c) => c.build_channel(config, chanid, main),
            ChannelHandler::Input(c) => c.build_channel(config, chanid, main),
            ChannelHandler::Sensor(c) => c.build_channel(config, chanid, main),
            ChannelHandler::Video(c) => c.build_channel(config, chanid, main),
            ChannelHandler::Audio(c) => c.build_channel(config, chanid, main),
            ChannelHandler::AvInput(c) => c.build_channel(config, chanid, main),
            ChannelHandler::Bluetooth(c) => c.build_channel(config, chanid, main),
        }
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
        match self {
            ChannelHandler::Control(c) => c.receive_data(msg, stream, config, main).await,
            ChannelHandler::Input(c) => c.receive_data(msg, stream, config, main).await,
            ChannelHandler::Sensor(c) => c.receive_data(msg, stream, config, main).await,
            ChannelHandler::Video(c) => c.receive_data(msg, stream, config, main).await,
            ChannelHandler::Audio(c) => c.receive_data(msg, stream, config, main).await,
            ChannelHandler::AvInput(c) => c.receive_data(msg, stream, config, main).await,
            ChannelHandler::Bluetooth(c) => c.receive_data(msg, stream, config, main).await,
        }
    }
}

/// Build the fixed table of channel handlers, indexed by channel id
fn build_handlers() -> Vec<ChannelHandler> {
    vec![
        ChannelHandler::Control(ControlChannelHandler::new()),
        ChannelHandler::Input(InputChannelHandler {}),
        ChannelHandler::Sensor(SensorChannelHandler {}),
        ChannelHandler::Video(VideoChannelHandler::new()),
        ChannelHandler::Audio(AudioChannelHandler::new(AudioChannelType::Media)),
        ChannelHandler::Audio(AudioChannelHandler::new(AudioChannelType::Speech)),
        ChannelHandler::Audio(AudioChannelHandler::new(AudioChannelType::System)),
        ChannelHandler::AvInput(AvInputChannelHandler {}),
        ChannelHandler::Bluetooth(BluetoothChannelHandler {}),
    ]
}

/// Tracks protocol errors per channel so a noisy media channel can be
/// tolerated briefly and shut down when it keeps failing.
struct ErrorTracker {
    /// Consecutive errors and when the streak started, per channel
    streaks: [Option<(u8, Instant)>; 9],
}

impl ErrorTracker {
    /// How many consecutive errors escalate to a fatal session error
    const LIMIT: u8 = 3;
    /// The window the consecutive errors must fall into
    const WINDOW: Duration = Duration::from_secs(1);

    /// A tracker with no errors recorded
    fn new() -> Self {
        Self {
            streaks: [None; 9],
        }
    }

    /// Record a successful dispatch, ending any error streak
    fn note_ok(&mut self, channel: ChannelId) {
        self.streaks[channel as usize] = None;
    }

    /// Record an error; returns true when the channel must be torn down
    fn note_error(&mut self, channel: ChannelId) -> bool {
        let now = Instant::now();
        let slot = &mut self.streaks[channel as usize];
        match slot {
            Some((count, first)) if now.duration_since(*first) <= Self::WINDOW => {
                *count += 1;
                *count >= Self::LIMIT
            }
            _ => {
                *slot = Some((1, now));
                false
            }
        }
    }
}

/// Run one android auto session over an established transport. Returns Ok
/// on an orderly shutdown and an error when the session died. The caller
/// reports connection status around this call.
pub async fn run_session<T, U, V>(
    stream: &StreamMux<U, V>,
    config: &AndroidAutoConfiguration,
    main: &T,
) -> Result<(), AutoError>
where
    T: AndroidAutoMainTrait + ?Sized,
    U: AsyncRead + Unpin,
    V: AsyncWrite + Unpin,
{
    let handlers = build_handlers();
    let mut chans = Vec::new();
    for id in CHANNEL_DECLARATION_ORDER {
        if let Some(chan) = handlers[id as usize].build_channel(config, id, main) {
            chans.push(chan);
        }
    }
    handlers[ChannelId::Control as usize].set_channels(chans);
    let control = match &handlers[ChannelId::Control as usize] {
        ChannelHandler::Control(c) => c,
        _ => unreachable!(),
    };

    control.send_version_request(stream).await?;

    let mut errors = ErrorTracker::new();
    let result = loop {
        let frame = match stream.read_frame().await {
            Ok(f) => f,
            Err(e) => break Err(e),
        };
        let channel = frame.header.channel_id;

        let outcome = if channel != ChannelId::Control && !control.is_serving() {
            Err(AutoError::Protocol(ProtocolViolation::UnexpectedMessage {
                message_id: frame.message_id().unwrap_or(0),
                state: "pre-serving",
            }))
        } else {
            handlers[channel as usize]
                .receive_data(frame, stream, config, main)
                .await
        };

        match outcome {
            Ok(()) => errors.note_ok(channel),
            Err(AutoError::Shutdown) => break Ok(()),
            Err(e @ AutoError::Protocol(_)) if channel != ChannelId::Control => {
                log::warn!("Protocol error on channel {:?}: {}", channel, e);
                if errors.note_error(channel) {
                    log::error!("Channel {:?} keeps failing, ending session", channel);
                    break Err(e);
                }
            }
            Err(e) => break Err(e),
        }
    };

    if result.is_err() {
        control.fail();
    }
    if let Some(v) = main.supports_video() {
        v.teardown_video().await;
    }
    result
}

/// The state the supervisor shares with the embedder facing api
struct SessionShared {
    /// Set when the embedder asked the supervisor to stop
    stop: AtomicBool,
    /// The transport of the active session, present while one is running
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

/// A running session as seen by the input api
struct ActiveSession {
    /// The multiplexer of the session
    mux: Arc<StreamMux<UsbReadHalf, UsbWriteHalf>>,
    /// When the session started, the epoch for input timestamps
    started: Instant,
    /// Stops the usb workers, which in turn ends the session loop
    transport: crate::usb::transport::UsbTransportHandle,
}

/// The android auto head unit supervisor. Owns usb discovery and the
/// lifecycle of one session at a time.
pub struct AndroidAutoUsb {
    /// State shared with the discovery task
    shared: Arc<SessionShared>,
    /// The discovery task itself
    task: tokio::task::JoinHandle<()>,
}

impl AndroidAutoUsb {
    /// Start usb discovery and session handling. Events and media are
    /// delivered through the callbacks on `main`.
    pub fn start<T>(config: AndroidAutoConfiguration, main: Arc<T>) -> Result<Self, AutoError>
    where
        T: AndroidAutoMainTrait + 'static,
    {
        let hub = UsbHub::new(config.identity.clone())?;
        let shared = Arc::new(SessionShared {
            stop: AtomicBool::new(false),
            active: tokio::sync::Mutex::new(None),
        });
        let task = tokio::spawn(discovery_loop(hub, config, main, shared.clone()));
        Ok(Self { shared, task })
    }

    /// Stop discovery and tear down any active session. The discovery task
    /// winds down on its own so the disconnected event still fires exactly
    /// once for a session in flight.
    pub async fn stop(self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(active) = self.shared.active.lock().await.as_ref() {
            active.transport.stop();
        }
        let _ = self.task.await;
    }

    /// Send a touch event to the connected device
    pub async fn send_touch(&self, x: u32, y: u32, action: TouchAction) -> Result<(), AutoError> {
        let guard = self.shared.active.lock().await;
        let session = guard.as_ref().ok_or(AutoError::NotConnected)?;
        let ts = session.started.elapsed().as_micros() as u64;
        session
            .mux
            .write_frame(touch_event_frame(ChannelId::Input, ts, x, y, action))
            .await
    }

    /// Send a button event to the connected device
    pub async fn send_button(&self, scan_code: u32, pressed: bool) -> Result<(), AutoError> {
        let guard = self.shared.active.lock().await;
        let session = guard.as_ref().ok_or(AutoError::NotConnected)?;
        let ts = session.started.elapsed().as_micros() as u64;
        session
            .mux
            .write_frame(button_event_frame(ChannelId::Input, ts, scan_code, pressed))
            .await
    }
}

/// How long to wait between scans of the usb bus
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// The discovery loop: scan, connect, run the session, report, repeat
async fn discovery_loop<T>(
    hub: UsbHub,
    config: AndroidAutoConfiguration,
    main: Arc<T>,
    shared: Arc<SessionShared>,
) where
    T: AndroidAutoMainTrait + 'static,
{
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        match hub.scan_once().await {
            Ok(Some(device)) => {
                let (read, write, transport) = UsbTransport::start(device);
                let cryptor = match Cryptor::new() {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("Could not construct the tls engine: {}", e);
                        transport.stop();
                        tokio::time::sleep(SCAN_INTERVAL).await;
                        continue;
                    }
                };
                let mux = Arc::new(StreamMux::new(read, write, cryptor));
                *shared.active.lock().await = Some(ActiveSession {
                    mux: mux.clone(),
                    started: Instant::now(),
                    transport,
                });
                main.connection_status(true);
                match run_session(mux.as_ref(), &config, main.as_ref()).await {
                    Ok(()) => log::info!("Session ended normally"),
                    Err(e) => log::error!("Session ended: {}", e),
                }
                if let Some(active) = shared.active.lock().await.take() {
                    active.transport.stop();
                }
                main.connection_status(false);
            }
            Ok(None) => tokio::time::sleep(SCAN_INTERVAL).await,
            Err(e) => {
                log::error!("Usb discovery failed: {}", e);
                tokio::time::sleep(SCAN_INTERVAL).await;
            }
        }
    }
}
