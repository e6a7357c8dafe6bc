// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-command response parsing: status/`CSeq` extraction and the
//! `Transport`/`Session`/`Range`/`Scale`/`RTP-Info` headers.

use bytes::Bytes;
use log::{debug, warn};
use std::net::IpAddr;
use url::Url;

use super::presentation::{NptRange, Presentation};
use super::Target;
use crate::urls::join_control;

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str(), 10).ok())
}

/// Handles a `DESCRIBE` response: returns the new base URL (per
/// `Content-Base`/`Content-Location`, else the request URL) and the SDP body.
pub(crate) fn parse_describe(
    request_url: &Url,
    response: &rtsp_types::Response<Bytes>,
) -> Result<(Url, String), String> {
    if !matches!(response.header(&rtsp_types::headers::CONTENT_TYPE), Some(v) if v.as_str() == "application/sdp")
    {
        return Err(format!(
            "DESCRIBE response not of expected application/sdp content type: {:#?}",
            &response
        ));
    }

    // https://tools.ietf.org/html/rfc2326#appendix-C.1.1
    let base_url = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .map(|v| (rtsp_types::headers::CONTENT_BASE, v))
        .or_else(|| {
            response
                .header(&rtsp_types::headers::CONTENT_LOCATION)
                .map(|v| (rtsp_types::headers::CONTENT_LOCATION, v))
        })
        .map(|(h, v)| {
            let url = Url::parse(v.as_str()).map_err(|e| format!("bad {h:?} {v:?}: {e}"))?;
            if url.host_str().is_none() {
                return Err(format!("{h:?} {v:?} has no host"));
            }
            Ok(url)
        })
        .unwrap_or_else(|| Ok(request_url.clone()))?;

    let sdp = String::from_utf8(response.body().to_vec())
        .map_err(|_| "DESCRIBE response body is not UTF-8".to_string())?;
    Ok((base_url, sdp))
}

/// Handles an `OPTIONS` response: the supported-methods list from `Public`,
/// or `Allow` when the server uses that instead.
pub(crate) fn parse_options(response: &rtsp_types::Response<Bytes>) -> Option<String> {
    response
        .header(&rtsp_types::headers::PUBLIC)
        .or_else(|| response.header(&rtsp_types::headers::ALLOW))
        .map(|v| v.as_str().to_owned())
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: u32,
}

/// Parses a `Session` header value of the form `<id>[;timeout=N]`.
pub(crate) fn parse_session_header(value: &str) -> Result<SessionHeader, String> {
    // https://datatracker.ietf.org/doc/html/rfc2326#section-12.37
    match value.split_once(';') {
        None => Ok(SessionHeader {
            id: value.into(),
            timeout_sec: 60, // default
        }),
        Some((id, timeout_str)) => {
            let v = timeout_str
                .trim()
                .strip_prefix("timeout=")
                .ok_or_else(|| format!("unparseable Session header {value:?}"))?;
            let timeout_sec =
                u32::from_str_radix(v, 10).map_err(|_| format!("unparseable timeout {v}"))?;
            Ok(SessionHeader {
                id: id.into(),
                timeout_sec,
            })
        }
    }
}

#[derive(Debug)]
pub(crate) struct SetupResponse {
    pub(crate) session: SessionHeader,
    pub(crate) ssrc: Option<u32>,
    pub(crate) channel_id: Option<u8>,
    pub(crate) source: Option<IpAddr>,
    pub(crate) destination: Option<IpAddr>,
    pub(crate) server_port: Option<(u16, u16)>,
}

/// Parses a `SETUP` response's `Session` and `Transport` headers.
pub(crate) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse, String> {
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| "missing Session header".to_string())?;
    let session = parse_session_header(session.as_str())?;
    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or_else(|| "missing Transport header".to_string())?;
    let mut channel_id = None;
    let mut ssrc = None;
    let mut source = None;
    let mut destination = None;
    let mut server_port = None;
    for part in transport.as_str().split(';') {
        if let Some(v) = part.strip_prefix("ssrc=") {
            // Per https://datatracker.ietf.org/doc/html/rfc2326#section-12.39,
            // the ssrc is hex.
            let v = u32::from_str_radix(v, 16).map_err(|_| format!("unparseable ssrc {v}"))?;
            ssrc = Some(v);
        } else if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let mut channels = interleaved.splitn(2, '-');
            let n = channels.next().expect("splitn returns at least one part");
            let n = u8::from_str_radix(n, 10).map_err(|_| format!("bad channel number {n}"))?;
            if let Some(m) = channels.next() {
                let m = u8::from_str_radix(m, 10)
                    .map_err(|_| format!("bad second channel number {m}"))?;
                if n.checked_add(1) != Some(m) {
                    return Err(format!("expected adjacent channels; got {n}-{m}"));
                }
            }
            channel_id = Some(n);
        } else if let Some(s) = part.strip_prefix("source=") {
            source = Some(
                s.parse()
                    .map_err(|_| format!("Transport header has unparseable source {s:?}"))?,
            );
        } else if let Some(s) = part.strip_prefix("destination=") {
            // Only an address form is useful here; live555-style hostnames
            // don't appear in responses in practice.
            destination = s.parse().ok();
        } else if let Some(s) = part.strip_prefix("server_port=") {
            let mut ports = s.splitn(2, '-');
            let n = ports.next().expect("splitn returns at least one part");
            let n = u16::from_str_radix(n, 10)
                .map_err(|_| format!("bad port in Transport: {}", transport.as_str()))?;
            if let Some(m) = ports.next() {
                let m = u16::from_str_radix(m, 10).map_err(|_| format!("bad second port {m}"))?;
                server_port = Some((n, m))
            } else {
                // RFC 2326's grammar allows a single port, but it's unclear
                // whether RTCP then shares it or uses the successor.
                return Err("Transport header specifies a single server_port".to_owned());
            }
        }
    }
    Ok(SetupResponse {
        session,
        ssrc,
        channel_id,
        source,
        destination,
        server_port,
    })
}

/// Parses a `Scale` header value.
pub(crate) fn parse_scale(value: &str) -> Result<f32, String> {
    value
        .trim()
        .parse::<f32>()
        .map_err(|_| format!("bad Scale {value:?}"))
}

/// Handles a `PLAY` response: applies `Range`, `Scale`, and `RTP-Info` to
/// the presentation (session-level target) or a single stream.
pub(crate) fn parse_play(
    response: &rtsp_types::Response<Bytes>,
    presentation: &mut Presentation,
    target: Target,
) -> Result<(), String> {
    if let Some(scale) = response.header(&rtsp_types::headers::SCALE) {
        let scale = parse_scale(scale.as_str())?;
        match target {
            Target::Session => presentation.set_scale(scale),
            Target::Stream(i) => presentation.streams[i].set_scale(scale),
        }
    }
    if let Some(range) = response.header(&rtsp_types::headers::RANGE) {
        let range = NptRange::parse(range.as_str())?;
        match target {
            Target::Session => presentation.set_range(range),
            Target::Stream(i) => presentation.streams[i].set_range(range),
        }
    }

    // https://tools.ietf.org/html/rfc2326#section-12.33
    let rtp_info = match response.header(&rtsp_types::headers::RTP_INFO) {
        Some(rtsp_info) => rtsp_info.as_str().to_owned(),
        None => return Ok(()),
    };
    for s in rtp_info.split(',') {
        let s = s.trim();
        let mut parts = s.split(';');
        let url = parts
            .next()
            .expect("split always returns at least one part")
            .strip_prefix("url=")
            .ok_or_else(|| "RTP-Info missing stream URL".to_string())?;
        let url = join_control(presentation.base_url(), url)?;
        let stream_i = if presentation.streams.len() == 1 {
            // The server is allowed to not specify a stream control URL for
            // single-stream presentations, and some buggy cameras use an
            // incorrect URL. When there is a single stream, there's no
            // ambiguity; be "forgiving" as RFC 2326 section 14.3 asks.
            Some(0)
        } else {
            presentation
                .streams
                .iter()
                .position(|s| matches!(&s.control, Some(u) if u == &url))
        };
        let stream = match stream_i {
            Some(i) => &mut presentation.streams[i],
            None => {
                warn!("RTP-Info contains unknown stream {url}");
                continue;
            }
        };
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| "RTP-Info param has no =".to_string())?;
            match key {
                "seq" => {
                    let seq =
                        u16::from_str_radix(value, 10).map_err(|_| format!("bad seq {value:?}"))?;
                    stream.set_initial_seq(seq);
                }
                "rtptime" => {
                    let rtptime = u32::from_str_radix(value, 10)
                        .map_err(|_| format!("bad rtptime {value:?}"))?;
                    stream.set_initial_rtptime(rtptime);
                }
                "ssrc" => {
                    let ssrc = u32::from_str_radix(value, 16)
                        .map_err(|_| format!("unparseable ssrc {value}"))?;
                    stream.set_ssrc(Some(ssrc));
                }
                _ => debug!("ignoring RTP-Info param {key}"),
            }
        }
    }
    Ok(())
}
