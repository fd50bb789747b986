//! The description handed back to whoever asked for a session: where the
//! consumer connects and how a generic media tool should read it.

use serde::{Deserialize, Serialize};

use crate::config::TransportMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecHint {
    pub codec: String,
}

impl CodecHint {
    fn new(codec: &str) -> CodecHint {
        CodecHint {
            codec: codec.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStreamOptions {
    pub id: String,
    pub name: String,
    pub container: String,
    pub video: CodecHint,
    pub audio: CodecHint,
    /// Which RTSP client should read the stream, when it matters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

impl MediaStreamOptions {
    pub fn new(id: &str, name: &str, mode: TransportMode) -> MediaStreamOptions {
        let container = match mode {
            TransportMode::Udp => "sdp",
            TransportMode::TcpInterleaved => "rtsp",
        };
        MediaStreamOptions {
            id: id.to_string(),
            name: name.to_string(),
            container: container.to_string(),
            video: CodecHint::new("h264"),
            audio: CodecHint::new("opus"),
            tool: match mode {
                TransportMode::Udp => None,
                TransportMode::TcpInterleaved => Some("scrypted".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub url: String,
    pub media_stream_options: MediaStreamOptions,
    /// ffmpeg-style arguments that read `url`.
    pub input_arguments: Vec<String>,
}

impl SessionDescriptor {
    pub fn new(mode: TransportMode, port: u16, id: &str, name: &str) -> SessionDescriptor {
        let url = format!("{}://127.0.0.1:{port}", mode.url_scheme());

        // No -max_delay here: jitter handling belongs to the rendering side.
        let args: &[&str] = match mode {
            TransportMode::Udp => &[
                "-protocol_whitelist",
                "pipe,udp,rtp,file,crypto,tcp",
                "-acodec",
                "libopus",
                "-f",
                "sdp",
                "-i",
            ],
            TransportMode::TcpInterleaved => &["-rtsp_transport", "tcp", "-i"],
        };
        let mut input_arguments: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        input_arguments.push(url.clone());

        SessionDescriptor {
            url,
            media_stream_options: MediaStreamOptions::new(id, name, mode),
            input_arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_descriptor_reads_sdp_over_tcp() {
        let d = SessionDescriptor::new(TransportMode::Udp, 41234, "cam", "Front door");
        assert_eq!(d.url, "tcp://127.0.0.1:41234");
        assert_eq!(d.media_stream_options.container, "sdp");
        assert_eq!(
            d.input_arguments,
            vec![
                "-protocol_whitelist",
                "pipe,udp,rtp,file,crypto,tcp",
                "-acodec",
                "libopus",
                "-f",
                "sdp",
                "-i",
                "tcp://127.0.0.1:41234",
            ]
        );
    }

    #[test]
    fn interleaved_descriptor_uses_rtsp() {
        let d = SessionDescriptor::new(TransportMode::TcpInterleaved, 5554, "cam", "Yard");
        assert_eq!(d.url, "rtsp://127.0.0.1:5554");
        assert_eq!(d.media_stream_options.container, "rtsp");
        assert_eq!(d.media_stream_options.tool.as_deref(), Some("scrypted"));
        assert_eq!(
            d.input_arguments,
            vec!["-rtsp_transport", "tcp", "-i", "rtsp://127.0.0.1:5554"]
        );
    }

    #[test]
    fn serializes_camel_case() {
        let d = SessionDescriptor::new(TransportMode::Udp, 1, "a", "b");
        let json = serde_json::to_value(&d).unwrap();
        assert!(json.get("mediaStreamOptions").is_some());
        assert!(json.get("inputArguments").is_some());
        assert_eq!(json["mediaStreamOptions"]["video"]["codec"], "h264");
        assert!(json["mediaStreamOptions"].get("tool").is_none());
    }
}
