//! Network camera capture using FFmpeg.
//!
//! Handles any input FFmpeg can open, including the raw `tcp://host:port`
//! H.264/MPEG-TS feeds served by the coop camera. Demuxer buffering is turned
//! off so each read returns the newest decodable frame.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::time::Instant;

use super::{parse_camera_url, CameraCapture, CameraConfig};

pub(crate) struct FfmpegCamera {
    config: CameraConfig,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
    opened_at: Instant,
}

impl FfmpegCamera {
    pub(crate) fn open(config: CameraConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let (scheme, _) = parse_camera_url(&config.url)?;

        let mut options = ffmpeg::Dictionary::new();
        options.set("fflags", "nobuffer");
        options.set("flags", "low_delay");
        options.set(
            "max_delay",
            &(config.buffer_depth.max(1) as u64 * 100_000).to_string(),
        );
        let timeout_us = config.read_timeout().as_micros().to_string();
        if scheme == "rtsp" {
            options.set("rtsp_transport", "tcp");
            options.set("stimeout", &timeout_us);
        } else {
            options.set("rw_timeout", &timeout_us);
        }

        let input = ffmpeg::format::input_with_dictionary(&config.url, options)
            .with_context(|| format!("failed to open camera '{}' with ffmpeg", config.url))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("camera '{}' has no video stream", config.url))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!("camera: connected to {} (ffmpeg)", config.url);
        Ok(Self {
            config,
            input,
            stream_index,
            decoder,
            scaler,
            frame_count: 0,
            opened_at: Instant::now(),
        })
    }
}

impl CameraCapture for FfmpegCamera {
    fn read(&mut self) -> Result<RgbImage> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }

            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;

            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                self.frame_count += 1;
                return frame_to_image(&rgb_frame);
            }
        }

        Err(anyhow!(
            "camera stream {} ended after {} frames ({}s)",
            self.config.url,
            self.frame_count,
            self.opened_at.elapsed().as_secs()
        ))
    }

    fn describe(&self) -> String {
        format!("{} (ffmpeg)", self.config.url)
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(
                data.get(start..end)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("ffmpeg frame has inconsistent size {}x{}", width, height))
}
