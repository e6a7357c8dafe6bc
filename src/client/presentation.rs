// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The media-session model: a [`Presentation`] of ordered [`Stream`]s,
//! produced from a `DESCRIBE` body by the `sdp-types` parser and thereafter
//! mutated by `SETUP`/`PLAY` response handling.

use std::net::IpAddr;
use std::num::NonZeroU16;

use sdp_types::Media;
use url::Url;

use crate::urls::join_control;
use crate::UdpPair;

/// A static payload type in the [RTP parameters
/// registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1),
/// as `(payload type, media, encoding, clock rate, channels)`.
/// The registry is officially closed, so this list should never change.
#[rustfmt::skip]
static STATIC_PAYLOAD_TYPES: &[(u8, &str, &str, u32, Option<NonZeroU16>)] = &[
    (0,  "audio", "pcmu",  8_000,   NonZeroU16::new(1)),
    (3,  "audio", "gsm",   8_000,   NonZeroU16::new(1)),
    (4,  "audio", "g723",  8_000,   NonZeroU16::new(1)),
    (5,  "audio", "dvi4",  8_000,   NonZeroU16::new(1)),
    (6,  "audio", "dvi4",  16_000,  NonZeroU16::new(1)),
    (7,  "audio", "lpc",   8_000,   NonZeroU16::new(1)),
    (8,  "audio", "pcma",  8_000,   NonZeroU16::new(1)),
    (9,  "audio", "g722",  8_000,   NonZeroU16::new(1)),
    (10, "audio", "l16",   44_100,  NonZeroU16::new(2)),
    (11, "audio", "l16",   44_100,  NonZeroU16::new(1)),
    (12, "audio", "qcelp", 8_000,   NonZeroU16::new(1)),
    (13, "audio", "cn",    8_000,   NonZeroU16::new(1)),
    (14, "audio", "mpa",   90_000,  None),
    (15, "audio", "g728",  8_000,   NonZeroU16::new(1)),
    (16, "audio", "dvi4",  11_025,  NonZeroU16::new(1)),
    (17, "audio", "dvi4",  22_050,  NonZeroU16::new(1)),
    (18, "audio", "g729",  8_000,   NonZeroU16::new(1)),
    (25, "video", "celb",  90_000,  None),
    (26, "video", "jpeg",  90_000,  None),
    (28, "video", "nv",    90_000,  None),
    (31, "video", "h261",  90_000,  None),
    (32, "video", "mpv",   90_000,  None),
    // The RTP parameters registry says mp2t is type AV (audio and video);
    // the MIME registration says "video".
    (33, "video", "mp2t",  90_000,  None),
    (34, "video", "h263",  90_000,  None),
];

/// A normal-play-time range, as carried in `Range: npt=...` headers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NptRange {
    /// Seconds since the start of the stream. `Range: npt=now-` maps to 0.
    pub start: f64,

    /// End position in seconds; `None` is an open range.
    pub end: Option<f64>,
}

impl NptRange {
    pub(crate) fn parse(value: &str) -> Result<Self, String> {
        let rest = value
            .trim()
            .strip_prefix("npt=")
            .ok_or_else(|| format!("unsupported Range {value:?}"))?;
        let (start, end) = rest
            .split_once('-')
            .ok_or_else(|| format!("Range {value:?} has no '-'"))?;
        let start = match start.trim() {
            "" | "now" => 0.0,
            s => s
                .parse::<f64>()
                .map_err(|_| format!("bad Range start {s:?}"))?,
        };
        let end = match end.trim() {
            "" => None,
            e => Some(e.parse::<f64>().map_err(|_| format!("bad Range end {e:?}"))?),
        };
        Ok(Self { start, end })
    }
}

impl std::fmt::Display for NptRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            None => write!(f, "npt={:.3}-", self.start),
            Some(end) => write!(f, "npt={:.3}-{:.3}", self.start, end),
        }
    }
}

/// How a stream's RTP/RTCP flows after `SETUP`.
#[derive(Debug)]
pub enum StreamTransport {
    /// No successful `SETUP` yet.
    Unset,

    /// Packets arrive on local UDP ports.
    Udp {
        client_rtp_port: u16,
        server_port: Option<(u16, u16)>,
    },

    /// Packets arrive interleaved on the control connection.
    Tcp {
        rtp_channel_id: u8,
        rtcp_channel_id: u8,
    },
}

/// A presentation: what a `DESCRIBE` response's SDP advertises.
#[derive(Debug)]
pub struct Presentation {
    pub streams: Vec<Stream>,

    /// The aggregate control URL used for session-level `PLAY`/`PAUSE`/etc.
    pub control: Url,

    base_url: Url,
    tool: Option<Box<str>>,

    /// Session-level playback state from `PLAY` responses.
    scale: f32,
    range: Option<NptRange>,
}

impl Presentation {
    /// Parses an SDP description, as returned by a successful `DESCRIBE`.
    ///
    /// `base_url` is the request URL as amended by any
    /// `Content-Base`/`Content-Location` header; stream control URLs join
    /// against it.
    pub fn parse(base_url: Url, sdp: &[u8]) -> Result<Self, String> {
        let sdp = sdp_types::Session::parse(sdp).map_err(|e| format!("unable to parse SDP: {e}"))?;

        let mut control = None;
        let mut tool = None;
        for a in &sdp.attributes {
            if a.attribute == "control" {
                control = a
                    .value
                    .as_deref()
                    .map(|c| join_control(&base_url, c))
                    .transpose()?;
                break;
            } else if a.attribute == "tool" {
                tool = a.value.as_deref().map(Into::into);
            }
        }
        let control = control.unwrap_or_else(|| base_url.clone());

        let streams = sdp
            .medias
            .iter()
            .enumerate()
            .map(|(i, m)| {
                parse_media(&base_url, m)
                    .map_err(|e| format!("unable to parse stream {i}: {e}\n\n{m:#?}"))
            })
            .collect::<Result<Vec<Stream>, String>>()?;

        Ok(Presentation {
            streams,
            control,
            base_url,
            tool,
            scale: 1.0,
            range: None,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The server's advertised `a=tool:` value, if any.
    pub fn tool(&self) -> Option<&str> {
        self.tool.as_deref()
    }

    /// The current session-level playback scale, per `PLAY` responses.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub(crate) fn set_scale(&mut self, scale: f32) {
        self.scale = scale;
    }

    /// The session-level playback range, per `PLAY` responses.
    pub fn range(&self) -> Option<NptRange> {
        self.range
    }

    pub(crate) fn set_range(&mut self, range: NptRange) {
        self.range = Some(range);
    }

    /// The control URL for stream `i`: its own, or the aggregate when the
    /// server didn't give it one.
    pub fn stream_url(&self, i: usize) -> &Url {
        self.streams[i].control.as_ref().unwrap_or(&self.control)
    }
}

/// One media stream (audio, video, application metadata, ...) within a
/// presentation.
#[derive(Debug)]
pub struct Stream {
    /// Media type, as specified in the [IANA SDP parameters media
    /// registry](https://www.iana.org/assignments/sdp-parameters/sdp-parameters.xhtml#sdp-parameters-1).
    pub media: String,

    /// An encoding name, as specified in the [IANA media type
    /// registry](https://www.iana.org/assignments/media-types/media-types.xhtml), with
    /// ASCII characters in lowercase.
    pub encoding_name: String,

    /// RTP payload type.
    /// See the [registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1).
    /// It's common to use one of the dynamically assigned values, 96–127.
    pub rtp_payload_type: u8,

    /// RTP clock rate, in Hz.
    pub clock_rate: u32,

    /// Number of audio channels, if applicable (`media` is `audio`) and known.
    pub channels: Option<NonZeroU16>,

    /// The specified control URL.
    /// This is needed with multiple streams to send `SETUP` requests and
    /// interpret the `PLAY` response's `RTP-Info` header.
    /// [RFC 2326 section C.3](https://datatracker.ietf.org/doc/html/rfc2326#appendix-C.3)
    /// says the server is allowed to omit it when there is only a single stream.
    pub control: Option<Url>,

    pub(crate) transport: StreamTransport,

    /// The local RTP port to advertise in `SETUP`'s `client_port`.
    /// Seeded from the SDP `m=` line when nonzero; otherwise allocated.
    client_port: Option<u16>,
    sockets: Option<UdpPair>,

    /// `source=`/`destination=` from the `SETUP` response's `Transport`.
    connection_endpoint: Option<IpAddr>,

    /// The RTP synchronization source, if the server supplied one in the
    /// `SETUP` response's `Transport` header or the `PLAY` response's
    /// `RTP-Info` header.
    ssrc: Option<u32>,

    /// Per-stream playback state from `PLAY` responses.
    scale: f32,
    range: Option<NptRange>,
    initial_seq: Option<u16>,
    initial_rtptime: Option<u32>,
}

impl Stream {
    pub fn transport(&self) -> &StreamTransport {
        &self.transport
    }

    /// The local RTP port `SETUP` will advertise (RTCP is one higher), if
    /// configured or previously allocated.
    pub fn client_port(&self) -> Option<u16> {
        self.client_port
    }

    /// Pins the local RTP port to advertise in `client_port`. Must be even;
    /// the RTCP port is implicitly one higher.
    pub fn set_client_port(&mut self, rtp_port: u16) {
        self.client_port = Some(rtp_port & !0b1);
    }

    /// Returns the configured client RTP port, binding a fresh even/odd
    /// [`UdpPair`] if none was set.
    pub(crate) fn ensure_client_port(&mut self) -> Result<u16, std::io::Error> {
        if let Some(p) = self.client_port {
            return Ok(p);
        }
        let pair = UdpPair::for_ip(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))?;
        self.client_port = Some(pair.rtp_port);
        self.sockets = Some(pair);
        Ok(self.client_port.expect("just set"))
    }

    /// Hands off the UDP socket pair bound for this stream, if any.
    /// Packet ingestion is the caller's business.
    pub fn take_sockets(&mut self) -> Option<UdpPair> {
        self.sockets.take()
    }

    /// The server's RTP/RTCP ports from the `SETUP` response, UDP mode only.
    pub fn server_port(&self) -> Option<(u16, u16)> {
        match self.transport {
            StreamTransport::Udp { server_port, .. } => server_port,
            _ => None,
        }
    }

    /// The packet source/destination address from the `SETUP` response's
    /// `Transport` header, if the server specified one.
    pub fn connection_endpoint(&self) -> Option<IpAddr> {
        self.connection_endpoint
    }

    pub(crate) fn set_connection_endpoint(&mut self, addr: Option<IpAddr>) {
        if addr.is_some() {
            self.connection_endpoint = addr;
        }
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    pub(crate) fn set_ssrc(&mut self, ssrc: Option<u32>) {
        if ssrc.is_some() {
            self.ssrc = ssrc;
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub(crate) fn set_scale(&mut self, scale: f32) {
        self.scale = scale;
    }

    pub fn range(&self) -> Option<NptRange> {
        self.range
    }

    pub(crate) fn set_range(&mut self, range: NptRange) {
        self.range = Some(range);
    }

    /// The initial RTP sequence number from the `PLAY` response's `RTP-Info`.
    pub fn initial_seq(&self) -> Option<u16> {
        self.initial_seq
    }

    pub(crate) fn set_initial_seq(&mut self, seq: u16) {
        self.initial_seq = Some(seq);
    }

    /// The initial RTP timestamp from the `PLAY` response's `RTP-Info`.
    pub fn initial_rtptime(&self) -> Option<u32> {
        self.initial_rtptime
    }

    pub(crate) fn set_initial_rtptime(&mut self, rtptime: u32) {
        self.initial_rtptime = Some(rtptime);
    }
}

/// Parses a [Media] to a [Stream].
/// On failure, returns an error which is expected to be supplemented with
/// the [Media] debug string by the caller.
fn parse_media(base_url: &Url, media_description: &Media) -> Result<Stream, String> {
    let media = media_description.media.clone();

    // https://tools.ietf.org/html/rfc8866#section-5.14 says "If the <proto>
    // sub-field is "RTP/AVP" or "RTP/SAVP" the <fmt> sub-fields contain RTP
    // payload type numbers."
    // https://www.iana.org/assignments/sdp-parameters/sdp-parameters.xhtml#sdp-parameters-2
    // shows several other variants, such as "TCP/RTP/AVP". Looking for a "RTP" component
    // seems appropriate.
    if !media_description.proto.starts_with("RTP/") && !media_description.proto.contains("/RTP/") {
        return Err("expected RTP-based proto".into());
    }

    // RFC 8866 continues: "When a list of payload type numbers is given,
    // this implies that all of these payload formats MAY be used in the
    // session, but the first of these formats SHOULD be used as the default
    // format for the session." Just use the first until we find a stream
    // where this isn't the right thing to do.
    let rtp_payload_type_str = media_description
        .fmt
        .split_ascii_whitespace()
        .next()
        .unwrap();
    let rtp_payload_type = u8::from_str_radix(rtp_payload_type_str, 10)
        .map_err(|_| format!("invalid RTP payload type {rtp_payload_type_str:?}"))?;
    if (rtp_payload_type & 0x80) != 0 {
        return Err(format!("invalid RTP payload type {rtp_payload_type}"));
    }

    let mut rtpmap = None;
    let mut control = None;
    for a in &media_description.attributes {
        if a.attribute == "rtpmap" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "rtpmap attribute with no value".to_string())?;
            // https://tools.ietf.org/html/rfc8866#section-6.6
            // rtpmap-value = payload-type SP encoding-name
            //   "/" clock-rate [ "/" encoding-params ]
            let (rtpmap_payload_type, v) = v
                .split_once(' ')
                .ok_or_else(|| "invalid rtpmap attribute".to_string())?;
            if rtpmap_payload_type == rtp_payload_type_str {
                rtpmap = Some(v);
            }
        } else if a.attribute == "control" {
            control = a
                .value
                .as_deref()
                .map(|c| join_control(base_url, c))
                .transpose()?;
        }
    }

    let encoding_name;
    let clock_rate;
    let channels;
    match rtpmap {
        Some(rtpmap) => {
            let (e, rtpmap) = rtpmap
                .split_once('/')
                .ok_or_else(|| "invalid rtpmap attribute".to_string())?;
            encoding_name = e.to_ascii_lowercase();
            let (clock_rate_str, channels_str) = match rtpmap.find('/') {
                None => (rtpmap, None),
                Some(i) => (&rtpmap[..i], Some(&rtpmap[i + 1..])),
            };
            clock_rate = u32::from_str_radix(clock_rate_str, 10)
                .map_err(|_| "bad clockrate in rtpmap".to_string())?;
            channels = channels_str
                .map(|c| {
                    u16::from_str_radix(c, 10)
                        .ok()
                        .and_then(NonZeroU16::new)
                        .ok_or_else(|| format!("invalid channels specification {c:?}"))
                })
                .transpose()?;
        }
        None => {
            let &(_, m, e, c, ch) = STATIC_PAYLOAD_TYPES
                .iter()
                .find(|&&(pt, ..)| pt == rtp_payload_type)
                .ok_or_else(|| {
                    format!(
                        "expected rtpmap parameter or assigned static payload type (got {rtp_payload_type})"
                    )
                })?;
            encoding_name = e.to_owned();
            clock_rate = c;
            channels = ch;
            if m != media {
                return Err(format!(
                    "SDP media type {media} must match static RTP payload type {rtp_payload_type}'s {m}"
                ));
            }
        }
    }

    Ok(Stream {
        media,
        encoding_name,
        clock_rate,
        rtp_payload_type,
        channels,
        control,
        transport: StreamTransport::Unset,
        client_port: match media_description.port {
            0 => None,
            p => Some(p & !0b1),
        },
        sockets: None,
        connection_endpoint: None,
        ssrc: None,
        scale: 1.0,
        range: None,
        initial_seq: None,
        initial_rtptime: None,
    })
}
