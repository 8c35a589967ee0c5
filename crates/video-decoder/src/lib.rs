//! Video decoder module
//!
//! Streams decoded frames out of a container through FFmpeg (`ffmpeg-next`),
//! converting each selected frame to packed RGB24.
//!
//! Two entry points:
//! 1. [`for_each_frame`]: streaming, the visitor can stop decoding early
//! 2. [`decode_video`]: collects every selected frame into memory

use drivecheck_common::{ProcessingError, Result, VideoInfo};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

/// `AV_TIME_BASE`: container durations are expressed in microseconds
const AV_TIME_BASE: f64 = 1_000_000.0;

/// Frame filtering options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFilter {
    /// Select the n-th, 2n-th, 3n-th ... decoded frame (counting from 1)
    EveryNth(u32),
    /// Select only I-frames (keyframes)
    IFramesOnly,
}

impl FrameFilter {
    /// Whether the frame at 0-based decode position `index` is selected
    #[must_use]
    pub fn selects(&self, index: u64, is_keyframe: bool) -> bool {
        match self {
            FrameFilter::EveryNth(0) => false,
            FrameFilter::EveryNth(n) => (index + 1) % u64::from(*n) == 0,
            FrameFilter::IFramesOnly => is_keyframe,
        }
    }

    fn validate(&self) -> Result<()> {
        if *self == FrameFilter::EveryNth(0) {
            return Err(ProcessingError::InvalidConfig(
                "frame sampling interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decoded video frame in packed RGB24
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame timestamp in seconds
    pub timestamp: f64,
    /// Decode position (0-indexed)
    pub frame_number: u64,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// RGB24 pixel data (row-major, no padding)
    pub data: Vec<u8>,
    /// Whether this is a keyframe (I-frame)
    pub is_keyframe: bool,
}

impl Frame {
    /// Wrap the pixel buffer as an [`RgbImage`] without copying
    pub fn into_rgb_image(self) -> Result<RgbImage> {
        let (width, height) = (self.width, self.height);
        RgbImage::from_raw(width, height, self.data).ok_or_else(|| {
            ProcessingError::CorruptedFile(format!(
                "frame {} buffer does not match {}x{}",
                self.frame_number, width, height
            ))
        })
    }
}

/// Video decoder configuration
#[derive(Debug, Clone, Default)]
pub struct DecoderConfig {
    /// Frame filter (None = all frames)
    pub frame_filter: Option<FrameFilter>,
}

impl DecoderConfig {
    /// Decode every `n`-th frame
    #[must_use]
    pub fn every_nth(n: u32) -> Self {
        Self {
            frame_filter: Some(FrameFilter::EveryNth(n)),
        }
    }
}

/// Counters reported once streaming ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    /// Frames decoded, including those the filter skipped
    pub frames_decoded: u64,
    /// Frames handed to the visitor
    pub frames_delivered: u64,
    /// The visitor asked to stop before the end of the stream
    pub stopped_early: bool,
}

/// Initialize `FFmpeg` library
fn init_ffmpeg() -> Result<()> {
    static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| {
        ffmpeg::init().map_err(|e| e.to_string())?;
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
        Ok(())
    })
    .clone()
    .map_err(|e| ProcessingError::FFmpegError(format!("Failed to initialize FFmpeg: {e}")))
}

fn rational_to_f64(value: ffmpeg::Rational) -> f64 {
    if value.denominator() == 0 {
        0.0
    } else {
        f64::from(value.numerator()) / f64::from(value.denominator())
    }
}

fn open_input(input_path: &Path) -> Result<ffmpeg::format::context::Input> {
    init_ffmpeg()?;
    ffmpeg::format::input(&input_path)
        .map_err(|e| ProcessingError::FFmpegError(format!("Failed to open input file: {e}")))
}

/// Read the properties of the best video stream without decoding
///
/// # Errors
///
/// Returns an error if the file cannot be opened or has no video stream.
#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
pub fn probe_video(input_path: &Path) -> Result<VideoInfo> {
    let ictx = open_input(input_path)?;

    let stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or(ProcessingError::NoVideoStream)?;

    let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| ProcessingError::FFmpegError(format!("Failed to create context: {e}")))?
        .decoder()
        .video()
        .map_err(|e| ProcessingError::FFmpegError(format!("Failed to create decoder: {e}")))?;

    let fps = rational_to_f64(stream.avg_frame_rate());
    let duration = if ictx.duration() > 0 {
        ictx.duration() as f64 / AV_TIME_BASE
    } else {
        0.0
    };
    let estimated_frames = if stream.frames() > 0 {
        stream.frames() as u64
    } else {
        (duration * fps).round() as u64
    };

    Ok(VideoInfo {
        format: ictx.format().name().to_string(),
        codec: stream.parameters().id().name().to_string(),
        width: decoder.width(),
        height: decoder.height(),
        fps,
        duration,
        estimated_frames,
    })
}

/// Decoder, scaler and counters for one pass over a stream
struct FrameStream<F> {
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    time_base: f64,
    filter: Option<FrameFilter>,
    decoded: ffmpeg::util::frame::video::Video,
    converted: ffmpeg::util::frame::video::Video,
    summary: DecodeSummary,
    visit: F,
}

impl<F> FrameStream<F>
where
    F: FnMut(Frame) -> ControlFlow<()>,
{
    /// Pull every frame the decoder has ready and hand selected ones to the visitor
    #[allow(clippy::cast_precision_loss)]
    fn drain(&mut self) -> Result<ControlFlow<()>> {
        while self.decoder.receive_frame(&mut self.decoded).is_ok() {
            let index = self.summary.frames_decoded;
            self.summary.frames_decoded += 1;

            let is_keyframe = self.decoded.is_key();
            let selected = self
                .filter
                .as_ref()
                .map_or(true, |f| f.selects(index, is_keyframe));
            if !selected {
                continue;
            }

            self.scaler
                .run(&self.decoded, &mut self.converted)
                .map_err(|e| ProcessingError::FFmpegError(format!("Failed to convert frame: {e}")))?;

            let frame = Frame {
                timestamp: self.decoded.timestamp().unwrap_or(0) as f64 * self.time_base,
                frame_number: index,
                width: self.converted.width(),
                height: self.converted.height(),
                data: copy_rgb_plane(&self.converted),
                is_keyframe,
            };

            self.summary.frames_delivered += 1;
            if (self.visit)(frame).is_break() {
                self.summary.stopped_early = true;
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

/// Stream selected frames to `visit` until the video ends or `visit` breaks
///
/// # Errors
///
/// Returns an error if:
/// - The input file cannot be opened
/// - No video stream is found
/// - The decoder or scaler cannot be created
/// - Frame conversion fails
pub fn for_each_frame<F>(input_path: &Path, config: &DecoderConfig, visit: F) -> Result<DecodeSummary>
where
    F: FnMut(Frame) -> ControlFlow<()>,
{
    if let Some(filter) = &config.frame_filter {
        filter.validate()?;
    }

    let mut ictx = open_input(input_path)?;

    let video_stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or(ProcessingError::NoVideoStream)?;
    let stream_index = video_stream.index();
    let time_base = rational_to_f64(video_stream.time_base());

    let decoder = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
        .map_err(|e| ProcessingError::FFmpegError(format!("Failed to create context: {e}")))?
        .decoder()
        .video()
        .map_err(|e| ProcessingError::FFmpegError(format!("Failed to create decoder: {e}")))?;

    let (width, height) = (decoder.width(), decoder.height());
    let scaler = ffmpeg::software::scaling::Context::get(
        decoder.format(),
        width,
        height,
        ffmpeg::format::Pixel::RGB24,
        width,
        height,
        ffmpeg::software::scaling::Flags::BILINEAR,
    )
    .map_err(|e| ProcessingError::FFmpegError(format!("Failed to create scaler: {e}")))?;

    debug!(
        "Decoding {} ({}x{}, filter: {:?})",
        input_path.display(),
        width,
        height,
        config.frame_filter
    );

    let mut stream = FrameStream {
        decoder,
        scaler,
        time_base,
        filter: config.frame_filter,
        decoded: ffmpeg::util::frame::video::Video::empty(),
        converted: ffmpeg::util::frame::video::Video::empty(),
        summary: DecodeSummary::default(),
        visit,
    };

    for (stream_ref, packet) in ictx.packets() {
        if stream_ref.index() != stream_index {
            continue;
        }
        // Corrupt packets are skipped; the decoder resyncs on the next keyframe
        if stream.decoder.send_packet(&packet).is_err() {
            continue;
        }
        if stream.drain()?.is_break() {
            info!(
                "Stopped decoding {} after {} frames",
                input_path.display(),
                stream.summary.frames_decoded
            );
            return Ok(stream.summary);
        }
    }

    // Flush decoder
    stream.decoder.send_eof().ok();
    stream.drain()?;

    debug!(
        "Decoded {} frames, delivered {}",
        stream.summary.frames_decoded, stream.summary.frames_delivered
    );

    Ok(stream.summary)
}

/// Decode every selected frame into memory
///
/// # Errors
///
/// See [`for_each_frame`].
pub fn decode_video(input_path: &Path, config: &DecoderConfig) -> Result<Vec<Frame>> {
    let mut frames = Vec::with_capacity(100);
    for_each_frame(input_path, config, |frame| {
        frames.push(frame);
        ControlFlow::Continue(())
    })?;
    Ok(frames)
}

/// Copy an RGB24 frame into a contiguous buffer, dropping row padding
fn copy_rgb_plane(frame: &ffmpeg::util::frame::video::Video) -> Vec<u8> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let plane_data = frame.data(0);

    let mut data = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row_start = y * stride;
        data.extend_from_slice(&plane_data[row_start..row_start + width * 3]);
    }
    data
}
