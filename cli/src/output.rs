//! Frame outputs of the command line wall

use std::{
    io::{self, Write as _},
    net::{SocketAddr, TcpStream},
};

use stranger_wall::{FrameSink, Rgb, math8::scale_rgb};

/// Open Pixel Control "set pixel colors" command
const OPC_SET_PIXELS: u8 = 0;

/// Length of the OPC message header
const OPC_HEADER_LEN: usize = 4;

/// Selected output device
pub enum Output {
    Log(LogSink),
    Opc(OpcSink),
}

impl FrameSink for Output {
    type Error = io::Error;

    fn init(&mut self, led_count: usize) -> io::Result<()> {
        match self {
            Self::Log(sink) => sink.init(led_count),
            Self::Opc(sink) => sink.init(led_count),
        }
    }

    fn render(&mut self, frame: &[Rgb]) -> io::Result<()> {
        match self {
            Self::Log(sink) => sink.render(frame),
            Self::Opc(sink) => sink.render(frame),
        }
    }

    fn set_brightness(&mut self, brightness: u8) -> io::Result<()> {
        match self {
            Self::Log(sink) => sink.set_brightness(brightness),
            Self::Opc(sink) => sink.set_brightness(brightness),
        }
    }

    fn reset(&mut self) -> io::Result<()> {
        match self {
            Self::Log(sink) => sink.reset(),
            Self::Opc(sink) => sink.reset(),
        }
    }
}

/// Dry run output, writes frames to the log
#[derive(Debug, Default)]
pub struct LogSink {
    led_count: usize,
    brightness: u8,
}

impl FrameSink for LogSink {
    type Error = io::Error;

    fn init(&mut self, led_count: usize) -> io::Result<()> {
        log::debug!("dry run output with {} LEDs", led_count);
        self.led_count = led_count;
        Ok(())
    }

    fn render(&mut self, frame: &[Rgb]) -> io::Result<()> {
        if log::log_enabled!(log::Level::Trace) {
            let lit = frame
                .iter()
                .enumerate()
                .filter(|(_, pixel)| **pixel != Rgb::default())
                .map(|(index, pixel)| format!("{index}:#{:02x}{:02x}{:02x}", pixel.r, pixel.g, pixel.b))
                .collect::<Vec<_>>();
            log::trace!("frame @{} [{}]", self.brightness, lit.join(" "));
        }
        Ok(())
    }

    fn set_brightness(&mut self, brightness: u8) -> io::Result<()> {
        self.brightness = brightness;
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        log::debug!("dry run output of {} LEDs released", self.led_count);
        self.led_count = 0;
        Ok(())
    }
}

/// Open Pixel Control client
///
/// Streams frames over TCP to an OPC server (fadecandy, gl_server and
/// friends). Brightness is applied before sending.
#[derive(Debug)]
pub struct OpcSink {
    address: SocketAddr,
    channel: u8,
    brightness: u8,
    led_count: usize,
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
}

impl OpcSink {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            channel: 0,
            brightness: u8::MAX,
            led_count: 0,
            stream: None,
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    fn send(&mut self, frame: &[Rgb]) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "OPC output is not initialized",
            ));
        };
        encode_frame(self.channel, frame, self.brightness, &mut self.buffer)?;
        stream.write_all(&self.buffer)
    }
}

impl FrameSink for OpcSink {
    type Error = io::Error;

    fn init(&mut self, led_count: usize) -> io::Result<()> {
        let stream = TcpStream::connect(self.address)?;
        stream.set_nodelay(true)?;
        log::debug!("connected to OPC server {} for {} LEDs", self.address, led_count);

        self.buffer = Vec::with_capacity(OPC_HEADER_LEN + led_count * 3);
        self.brightness = u8::MAX;
        self.led_count = led_count;
        self.stream = Some(stream);
        Ok(())
    }

    fn render(&mut self, frame: &[Rgb]) -> io::Result<()> {
        self.send(frame)
    }

    fn set_brightness(&mut self, brightness: u8) -> io::Result<()> {
        self.brightness = brightness;
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        let blank = vec![Rgb::default(); self.led_count];
        let result = self.send(&blank);
        self.stream = None;
        log::debug!("disconnected from OPC server {}", self.address);
        result
    }
}

/// Encode a frame as an OPC "set pixel colors" message
pub fn encode_frame(channel: u8, frame: &[Rgb], brightness: u8, out: &mut Vec<u8>) -> io::Result<()> {
    let len = u16::try_from(frame.len() * 3)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame is too long for OPC"))?;

    out.clear();
    out.extend_from_slice(&[channel, OPC_SET_PIXELS]);
    out.extend_from_slice(&len.to_be_bytes());
    for pixel in frame {
        let pixel = scale_rgb(*pixel, brightness);
        out.extend_from_slice(&[pixel.r, pixel.g, pixel.b]);
    }
    Ok(())
}
