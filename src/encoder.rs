//! H.264 encoder
//!
//! Frame-in / packet-out transform between the pool and the stream socket.
//! Each call consumes one raw YUV420 frame, tags it with the next
//! presentation counter, and forwards whatever the codec emits to the
//! caller's sink synchronously. The counter is never reset: a STOP/restart
//! cycle continues numbering where it left off, so the server-side frameset
//! assembly sees one strictly monotonic sequence per node.

use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVSlices;
use openh264::OpenH264API;
use thiserror::Error;

use crate::config::Config;
use crate::connection::NetError;

const BITRATE_BPS: u32 = 2_000_000;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("codec error: {0}")]
    Codec(#[from] openh264::Error),

    #[error("frame is {got} bytes, expected {expected}")]
    FrameSize { got: usize, expected: usize },

    #[error("stream sink failed: {0}")]
    Sink(#[from] NetError),
}

pub struct VideoEncoder {
    encoder: Encoder,
    width: usize,
    height: usize,
    frame_bytes: usize,
    pts: u64,
}

impl VideoEncoder {
    pub fn new(config: &Config) -> Result<Self, EncoderError> {
        let api = OpenH264API::from_source();
        let encoder_config = EncoderConfig::new()
            .max_frame_rate(config.fps as f32)
            .set_bitrate_bps(BITRATE_BPS);
        let encoder = Encoder::with_api_config(api, encoder_config)?;

        Ok(VideoEncoder {
            encoder,
            width: config.frame_width as usize,
            height: config.frame_height as usize,
            frame_bytes: config.frame_bytes(),
            pts: 0,
        })
    }

    /// Encodes one YUV420 frame and hands every emitted packet to `sink`.
    ///
    /// The frame is borrowed only for the duration of the call. A sink
    /// error aborts the frame and propagates.
    pub fn encode_frame<F>(&mut self, yuv: &[u8], sink: &mut F) -> Result<(), EncoderError>
    where
        F: FnMut(&[u8]) -> Result<(), NetError>,
    {
        if yuv.len() != self.frame_bytes {
            return Err(EncoderError::FrameSize {
                got: yuv.len(),
                expected: self.frame_bytes,
            });
        }

        let y_bytes = self.width * self.height;
        let chroma_bytes = y_bytes / 4;
        let (y_plane, rest) = yuv.split_at(y_bytes);
        let (u_plane, v_plane) = rest.split_at(chroma_bytes);

        let slices = YUVSlices::new(
            (y_plane, u_plane, v_plane),
            (self.width, self.height),
            (self.width, self.width / 2, self.width / 2),
        );

        let bitstream = self.encoder.encode(&slices)?;
        self.pts += 1;

        let packet = bitstream.to_vec();
        if !packet.is_empty() {
            sink(&packet)?;
        }

        Ok(())
    }

    /// Drains the codec at shutdown. The WELS encoder emits every access
    /// unit synchronously from `encode`, so there is never anything left to
    /// drain; this exists so the pipeline's shutdown sequence does not
    /// depend on that property of the particular codec.
    pub fn flush<F>(&mut self, _sink: &mut F) -> Result<(), EncoderError>
    where
        F: FnMut(&[u8]) -> Result<(), NetError>,
    {
        Ok(())
    }

    /// Presentation counter of the next frame.
    pub fn pts(&self) -> u64 {
        self.pts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_str(
            "FRAME_WIDTH=64\nFRAME_HEIGHT=48\nFPS=30\n\
             FRAME_DURATION_MIN=16666666\nFRAME_DURATION_MAX=33333333\n\
             FRAME_BUFFERS=4\nDMA_BUFFERS=3\nRECORDING_CPU=0\n\
             SERVER_IP=127.0.0.1\nTCP_PORT=5000\nUDP_PORT=5001\n",
        )
        .unwrap()
    }

    fn gray_frame(config: &Config, luma: u8) -> Vec<u8> {
        let y = config.frame_width as usize * config.frame_height as usize;
        let mut frame = vec![luma; y];
        frame.resize(config.frame_bytes(), 0x80);
        frame
    }

    #[test]
    fn test_encode_emits_bytes() {
        let config = test_config();
        let mut encoder = VideoEncoder::new(&config).unwrap();

        let mut emitted = Vec::new();
        let mut sink = |pkt: &[u8]| {
            emitted.extend_from_slice(pkt);
            Ok(())
        };

        encoder
            .encode_frame(&gray_frame(&config, 0x10), &mut sink)
            .unwrap();
        // First frame carries SPS/PPS plus an IDR; never empty.
        assert!(!emitted.is_empty());
    }

    #[test]
    fn test_pts_monotonic_from_zero() {
        let config = test_config();
        let mut encoder = VideoEncoder::new(&config).unwrap();
        assert_eq!(encoder.pts(), 0);

        let mut sink = |_: &[u8]| Ok(());
        for expected in 1..=5 {
            encoder
                .encode_frame(&gray_frame(&config, expected as u8), &mut sink)
                .unwrap();
            assert_eq!(encoder.pts(), expected);
        }
    }

    #[test]
    fn test_wrong_frame_size_rejected() {
        let config = test_config();
        let mut encoder = VideoEncoder::new(&config).unwrap();

        let mut sink = |_: &[u8]| Ok(());
        let result = encoder.encode_frame(&[0u8; 16], &mut sink);
        assert!(matches!(result, Err(EncoderError::FrameSize { .. })));
        // A rejected frame does not consume a presentation slot.
        assert_eq!(encoder.pts(), 0);
    }

    #[test]
    fn test_sink_error_propagates() {
        let config = test_config();
        let mut encoder = VideoEncoder::new(&config).unwrap();

        let mut sink = |_: &[u8]| {
            Err(NetError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer gone",
            )))
        };
        let result = encoder.encode_frame(&gray_frame(&config, 0x10), &mut sink);
        assert!(matches!(result, Err(EncoderError::Sink(_))));
    }

    #[test]
    fn test_flush_is_clean_after_frames() {
        let config = test_config();
        let mut encoder = VideoEncoder::new(&config).unwrap();

        let mut sink = |_: &[u8]| Ok(());
        encoder
            .encode_frame(&gray_frame(&config, 0x10), &mut sink)
            .unwrap();
        encoder.flush(&mut sink).unwrap();
        assert_eq!(encoder.pts(), 1);
    }
}
