//! Per-client JPEG encoding for the multipart streams.
//!
//! Each streaming client owns a [`StreamEncoder`] that polls a [`FrameStore`]
//! at its own cadence. Encoding happens on the blocking pool, so a slow client
//! only slows itself and never the capture loop.

use std::time::Duration;

use actix_web::{Error, rt, web::Bytes};
use async_stream::stream;
use futures_util::Stream;
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};
use tracing::{Instrument, debug, warn};
use video_ingest::{Frame, FrameFormat};

use crate::{
    data::{FrameStore, PublishedFrame},
    error::{BridgeError, EncodeError},
};

pub const MULTIPART_BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wait used while the store has never received a frame.
const EMPTY_STORE_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub sequence: u64,
    pub content_type: &'static str,
    pub bytes: Bytes,
}

impl EncodedFrame {
    /// Frame the image as one part of a `multipart/x-mixed-replace` body.
    pub fn to_multipart_part(&self) -> Bytes {
        let header = format!(
            "--{MULTIPART_BOUNDARY}\r\nContent-Type: {}\r\nContent-Length: {}\r\nX-Sequence: {}\r\n\r\n",
            self.content_type,
            self.bytes.len(),
            self.sequence
        );
        let mut payload = Vec::with_capacity(header.len() + self.bytes.len() + 2);
        payload.extend_from_slice(header.as_bytes());
        payload.extend_from_slice(&self.bytes);
        payload.extend_from_slice(b"\r\n");
        Bytes::from(payload)
    }
}

/// Encode a BGR frame as JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let malformed = || EncodeError::Malformed {
        width: frame.width,
        height: frame.height,
        len: frame.data.len(),
    };
    if !matches!(frame.format, FrameFormat::Bgr8) || !frame.is_well_formed() {
        return Err(malformed());
    }
    let rgb: Vec<u8> = frame
        .data
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    let (width, height) = (frame.width as u32, frame.height as u32);
    let image =
        ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(width, height, rgb).ok_or_else(malformed)?;
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(&image)?;
    Ok(buffer)
}

/// Encode a published frame, tagging failures with its sequence.
pub fn encode(frame: &PublishedFrame, quality: u8) -> Result<EncodedFrame, BridgeError> {
    let bytes = encode_jpeg(&frame.frame, quality).map_err(|source| {
        BridgeError::EncodeTransient {
            sequence: frame.sequence,
            source,
        }
    })?;
    Ok(EncodedFrame {
        sequence: frame.sequence,
        content_type: "image/jpeg",
        bytes: Bytes::from(bytes),
    })
}

pub struct StreamEncoder {
    store: FrameStore,
    interval: Duration,
    quality: u8,
    label: &'static str,
    last_sent: Option<u64>,
}

impl StreamEncoder {
    pub fn new(store: FrameStore, interval: Duration, quality: u8, label: &'static str) -> Self {
        Self {
            store,
            interval,
            quality,
            label,
            last_sent: None,
        }
    }

    pub fn last_sent(&self) -> Option<u64> {
        self.last_sent
    }

    /// Wait for a frame newer than the last one handed out and encode it.
    ///
    /// Frames that fail to encode are skipped; the encoder then waits for the
    /// next sequence.
    pub async fn next_part(&mut self) -> EncodedFrame {
        loop {
            let Some(frame) = self.store.read() else {
                rt::time::sleep(EMPTY_STORE_WAIT).await;
                continue;
            };
            if self.last_sent.is_some_and(|last| frame.sequence <= last) {
                rt::time::sleep(self.interval).await;
                continue;
            }
            // Marked before encoding so a frame that fails is not retried.
            self.last_sent = Some(frame.sequence);

            let sequence = frame.sequence;
            let quality = self.quality;
            let result = rt::task::spawn_blocking(move || encode(&frame, quality))
                .await
                .unwrap_or_else(|err| {
                    Err(BridgeError::EncodeTransient {
                        sequence,
                        source: err.into(),
                    })
                });
            match result {
                Ok(encoded) => {
                    metrics::counter!("vision_stream_frames_total", "stream" => self.label)
                        .increment(1);
                    return encoded;
                }
                Err(err) => {
                    err.record();
                    warn!(stream = self.label, "{err}");
                }
            }
        }
    }

    /// Sleep for the client's cadence.
    pub async fn pace(&self) {
        rt::time::sleep(self.interval).await;
    }

    /// Endless multipart body. Dropping the stream (client disconnect) ends it.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Error>> {
        let span = tracing::info_span!("stream.client", stream = self.label);
        let client = ClientGauge::new(self.label);
        let mut encoder = self;
        stream! {
            let _client = client;
            loop {
                let part = encoder.next_part().instrument(span.clone()).await;
                debug!(stream = encoder.label, sequence = part.sequence, "sending part");
                yield Ok::<Bytes, Error>(part.to_multipart_part());
                encoder.pace().await;
            }
        }
    }
}

/// Tracks connected clients in `vision_stream_clients`.
struct ClientGauge {
    label: &'static str,
}

impl ClientGauge {
    fn new(label: &'static str) -> Self {
        metrics::gauge!("vision_stream_clients", "stream" => label).increment(1.0);
        debug!(stream = label, "stream client connected");
        Self { label }
    }
}

impl Drop for ClientGauge {
    fn drop(&mut self) {
        metrics::gauge!("vision_stream_clients", "stream" => self.label).decrement(1.0);
        debug!(stream = self.label, "stream client disconnected");
    }
}
