//! Network camera capture using GStreamer.
//!
//! `rtsp://` URLs go through `rtspsrc`, `tcp://host:port` through
//! `tcpclientsrc`. The appsink keeps at most `buffer_depth` samples and drops
//! older ones, so a read never returns a stale queued frame.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use super::{parse_camera_url, CameraCapture, CameraConfig};

pub(crate) struct GstreamerCamera {
    config: CameraConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
}

impl GstreamerCamera {
    pub(crate) fn open(config: CameraConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = pipeline_description(&config)?;
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build camera pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("camera pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(config.buffer_depth.max(1));
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set camera pipeline to Playing")?;
        log::info!("camera: connected to {} (gstreamer)", config.url);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
        })
    }

    fn poll_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("gstreamer reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl CameraCapture for GstreamerCamera {
    fn read(&mut self) -> Result<RgbImage> {
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(
            self.config.read_timeout().as_millis() as u64,
        );
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("camera stream {} stalled", self.config.url))?;

        let image = sample_to_image(&sample)?;
        self.frame_count += 1;
        Ok(image)
    }

    fn describe(&self) -> String {
        format!("{} (gstreamer, {} frames)", self.config.url, self.frame_count)
    }
}

impl Drop for GstreamerCamera {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("camera: failed to stop pipeline for {}: {}", self.config.url, err);
        }
    }
}

fn pipeline_description(config: &CameraConfig) -> Result<String> {
    let (scheme, rest) = parse_camera_url(&config.url)?;
    let source = match scheme {
        "rtsp" => format!("rtspsrc location={} latency=0", config.url),
        "tcp" => {
            let authority = rest.split('/').next().unwrap_or(rest);
            let (host, port) = authority
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("tcp camera url '{}' needs a port", config.url))?;
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in camera url '{}'", config.url))?;
            format!("tcpclientsrc host={} port={}", host, port)
        }
        other => {
            return Err(anyhow!(
                "gstreamer capture supports rtsp:// and tcp://, got {}://",
                other
            ))
        }
    };
    Ok(format!(
        "{} ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
         appsink name=appsink sync=false max-buffers={} drop=true",
        source,
        config.buffer_depth.max(1)
    ))
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("camera sample missing buffer")?;
    let caps = sample.caps().context("camera sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse camera caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map camera buffer")?;
    let data = map.as_slice();

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("camera buffer row is out of bounds")?,
        );
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("camera sample has inconsistent size {}x{}", width, height))
}
