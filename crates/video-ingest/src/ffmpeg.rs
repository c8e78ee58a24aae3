//! ffmpeg subprocess readers producing raw BGR24 frames.
//!
//! ffmpeg performs the cover-scale and centre crop to the target size, so every
//! frame read from its stdout already has the target geometry.

use std::{
    fmt::Write,
    io::{Read, Write as IoWrite},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Sender, bounded};
use tracing::{debug, warn};

use crate::{
    ChannelSource, parse_device_index,
    types::{CaptureError, Frame, FrameFormat},
};

/// Capture from a local V4L device (`0`, `/dev/video0`) or a file path.
pub fn spawn_device_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<ChannelSource, CaptureError> {
    let (is_v4l, ffmpeg_uri) = if let Some(index) = parse_device_index(uri) {
        (true, format!("/dev/video{index}"))
    } else {
        (uri.starts_with("/dev/video"), uri.to_string())
    };

    let mut cmd = base_command();
    if is_v4l {
        cmd.arg("-f").arg("video4linux2");
    } else {
        cmd.arg("-re");
    }
    cmd.arg("-i").arg(&ffmpeg_uri);
    push_output_args(&mut cmd, target_size);

    spawn_ffmpeg_reader(ffmpeg_uri, cmd, target_size, 2, None)
}

pub fn spawn_rtsp_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<ChannelSource, CaptureError> {
    let mut cmd = base_command();
    cmd.arg("-rtsp_transport")
        .arg("tcp")
        .arg("-fflags")
        .arg("nobuffer")
        .arg("-flags")
        .arg("low_delay")
        .arg("-max_delay")
        .arg("0")
        .arg("-i")
        .arg(uri);
    push_output_args(&mut cmd, target_size);

    spawn_ffmpeg_reader(uri.to_string(), cmd, target_size, 4, None)
}

/// RTP/H.264 over UDP. The URI carries the port and optional SDP hints, e.g.
/// `udp://0.0.0.0:5000?payload=96&sprop=Z0IA...`.
pub fn spawn_udp_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<ChannelSource, CaptureError> {
    let mut cmd = base_command();
    cmd.arg("-protocol_whitelist")
        .arg("file,udp,rtp,fd,pipe")
        .arg("-fflags")
        .arg("+genpts+discardcorrupt")
        .arg("-flags")
        .arg("low_delay")
        .arg("-f")
        .arg("sdp")
        .arg("-i")
        .arg("-")
        .arg("-an");
    push_output_args(&mut cmd, target_size);

    let sdp = build_udp_sdp(uri)?;
    spawn_ffmpeg_reader(uri.to_string(), cmd, target_size, 4, Some(sdp))
}

fn base_command() -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");
    cmd
}

fn push_output_args(cmd: &mut Command, (width, height): (i32, i32)) {
    let filter = format!(
        "scale={width}:{height}:force_original_aspect_ratio=increase,crop={width}:{height}"
    );
    cmd.arg("-vf")
        .arg(filter)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
}

fn build_udp_sdp(uri: &str) -> Result<String, CaptureError> {
    let without_scheme = uri.strip_prefix("udp://").unwrap_or(uri);
    let mut parts = without_scheme.splitn(2, '?');
    let endpoint = parts.next().unwrap_or("");
    let query = parts.next();

    if endpoint.is_empty() {
        return Err(CaptureError::Other(anyhow!(
            "udp source must include host:port, e.g. udp://127.0.0.1:5000"
        )));
    }

    let (host, port_str) = match endpoint.rsplit_once(':') {
        Some((h, p)) if !h.is_empty() => (h, p),
        Some((_, p)) => ("0.0.0.0", p),
        None => ("0.0.0.0", endpoint),
    };
    let port: u16 = port_str
        .parse()
        .map_err(|_| CaptureError::Other(anyhow!("invalid UDP port in source URI")))?;

    let mut sprop: Option<&str> = None;
    let mut payload = "96";
    for pair in query.unwrap_or("").split('&') {
        let mut kv = pair.splitn(2, '=');
        match (kv.next().unwrap_or(""), kv.next().unwrap_or("")) {
            ("sprop" | "sprop-parameter-sets", value) => sprop = Some(value),
            ("payload" | "pt", value) if !value.is_empty() => payload = value,
            _ => {}
        }
    }

    let mut sdp = String::new();
    writeln!(&mut sdp, "v=0").ok();
    writeln!(&mut sdp, "o=- 0 0 IN IP4 {host}").ok();
    writeln!(&mut sdp, "s=caralert-udp").ok();
    writeln!(&mut sdp, "c=IN IP4 {host}").ok();
    writeln!(&mut sdp, "t=0 0").ok();
    writeln!(&mut sdp, "m=video {port} RTP/AVP {payload}").ok();
    writeln!(&mut sdp, "a=rtpmap:{payload} H264/90000").ok();
    match sprop {
        Some(sprop) => writeln!(
            &mut sdp,
            "a=fmtp:{payload} packetization-mode=1; sprop-parameter-sets={sprop}"
        )
        .ok(),
        None => writeln!(&mut sdp, "a=fmtp:{payload} packetization-mode=1").ok(),
    };

    Ok(sdp)
}

fn spawn_ffmpeg_reader(
    label: String,
    mut cmd: Command,
    target_size: (i32, i32),
    queue_size: usize,
    stdin_payload: Option<String>,
) -> Result<ChannelSource, CaptureError> {
    let (tx, rx) = bounded(queue_size);
    if stdin_payload.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());

    debug!(source = %label, "spawning ffmpeg reader");
    let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    if let Some(payload) = stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(payload.as_bytes()) {
                let _ = child.kill();
                return Err(CaptureError::Other(err.into()));
            }
        }
    }

    thread::Builder::new()
        .name("ffmpeg-reader".into())
        .spawn(move || {
            if let Err(err) = ffmpeg_loop(stdout, child, target_size, tx.clone()) {
                warn!("ffmpeg reader stopped: {err}");
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(ChannelSource::new(format!("ffmpeg:{label}"), rx))
}

fn ffmpeg_loop(
    mut stdout: impl Read,
    mut child: Child,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];
    let mut result = Ok(());

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let frame = Frame {
                    data: buffer.clone(),
                    width: target_size.0,
                    height: target_size.1,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Bgr8,
                };
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                result = Err(CaptureError::EndOfStream);
                break;
            }
            Err(err) => {
                result = Err(CaptureError::Other(err.into()));
                break;
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdp_uses_payload_and_sprop_hints() {
        let sdp = build_udp_sdp("udp://127.0.0.1:5004?payload=97&sprop=Z0IA,aM4").unwrap();
        assert!(sdp.contains("c=IN IP4 127.0.0.1"));
        assert!(sdp.contains("m=video 5004 RTP/AVP 97"));
        assert!(sdp.contains("sprop-parameter-sets=Z0IA,aM4"));
    }

    #[test]
    fn sdp_defaults_host_and_payload() {
        let sdp = build_udp_sdp("udp://:6000").unwrap();
        assert!(sdp.contains("c=IN IP4 0.0.0.0"));
        assert!(sdp.contains("m=video 6000 RTP/AVP 96"));
    }

    #[test]
    fn sdp_rejects_bad_port() {
        assert!(build_udp_sdp("udp://host:notaport").is_err());
        assert!(build_udp_sdp("udp://").is_err());
    }
}
