// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based [`Connection`]: framing, direct connect, and the
//! RTSP-over-HTTP tunnel handshake.
//!
//! In direct mode the input and output framers sit on the two halves of one
//! TCP stream. In tunneled mode the input framer reads raw RTSP from the HTTP
//! `GET` leg while the output framer base64-encodes each message onto the
//! `POST` leg, per Apple's QuickTime RTSP-over-HTTP scheme.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::debug;
use rtsp_types::{Data, Message};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use url::{Host, Url};

use crate::{Error, ErrorInt, RtspMessageContext};

use super::{ConnectionContext, ReceivedMessage, WallTime};

/// An established RTSP control connection which implements `Stream` + `Sink`.
pub(crate) struct Connection {
    read: FramedRead<OwnedReadHalf, MessageDecoder>,
    write: FramedWrite<OwnedWriteHalf, MessageEncoder>,
    ctx: ConnectionContext,

    // In tunneled mode, the halves not used for RTSP are parked here so
    // neither socket sends an early FIN.
    _tunnel: Option<TunnelHalves>,
}

struct TunnelHalves {
    _get_write: OwnedWriteHalf,
    _post_read: OwnedReadHalf,
}

impl Connection {
    /// Opens the TCP connection commands wait on in `awaiting_connection`
    /// state: the lone socket in direct mode, the `GET` leg when tunneling.
    pub(crate) async fn connect_tcp(url: Url, port_override: Option<u16>) -> Result<TcpStream, std::io::Error> {
        let (host, port) = crate::urls::host_port(&url);
        connect_tcp(host, port_override.unwrap_or(port)).await
    }

    pub(crate) fn from_stream(
        stream: TcpStream,
        response_buffer_size: usize,
    ) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            read: FramedRead::new(read, MessageDecoder::new(response_buffer_size)),
            write: FramedWrite::new(write, MessageEncoder { tunneled: false }),
            ctx: ConnectionContext {
                local_addr,
                peer_addr,
                established_wall,
            },
            _tunnel: None,
        })
    }

    /// Turns an established `GET`-leg socket into a tunneled connection:
    /// performs the HTTP handshake on it, then opens and primes the `POST`
    /// leg. Bound together by `cookie` via the `x-sessioncookie` header.
    ///
    /// The `GET` leg must answer `200` before the `POST` leg is opened; no
    /// response is ever awaited on `POST`. RTSP bytes the server sends after
    /// the `GET` response head are preserved in the input framer.
    pub(crate) async fn finish_tunneled(
        mut get_stream: TcpStream,
        url: Url,
        http_port: u16,
        cookie: String,
        user_agent: Option<String>,
        response_buffer_size: usize,
    ) -> Result<Self, Error> {
        let (host, _) = crate::urls::host_port(&url);
        let suffix = match url.query() {
            None => url.path().to_owned(),
            Some(q) => format!("{}?{}", url.path(), q),
        };
        let user_agent_line = match user_agent {
            None => String::new(),
            Some(ua) => format!("User-Agent: {ua}\r\n"),
        };

        let established_wall = WallTime::now();
        let local_addr = get_stream.local_addr().map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let peer_addr = get_stream.peer_addr().map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let get_req = format!(
            "GET {suffix} HTTP/1.0\r\n\
             {user_agent_line}\
             x-sessioncookie: {cookie}\r\n\
             Accept: application/x-rtsp-tunnelled\r\n\
             Pragma: no-cache\r\n\
             Cache-Control: no-cache\r\n\
             \r\n"
        );
        get_stream
            .write_all(get_req.as_bytes())
            .await
            .map_err(|e| tunnel_err(format!("error sending GET: {e}"), None))?;
        let leftover = read_http_head(&mut get_stream).await?;
        debug!("HTTP tunnel GET leg established with cookie {cookie}");

        let mut post_stream = connect_tcp(host, http_port)
            .await
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let post_req = format!(
            "POST {suffix} HTTP/1.0\r\n\
             {user_agent_line}\
             x-sessioncookie: {cookie}\r\n\
             Content-Type: application/x-rtsp-tunnelled\r\n\
             Pragma: no-cache\r\n\
             Cache-Control: no-cache\r\n\
             Content-Length: 32767\r\n\
             \r\n"
        );
        post_stream
            .write_all(post_req.as_bytes())
            .await
            .map_err(|e| tunnel_err(format!("error sending POST: {e}"), None))?;

        let (get_read, get_write) = get_stream.into_split();
        let (post_read, post_write) = post_stream.into_split();
        let mut read = FramedRead::new(get_read, MessageDecoder::new(response_buffer_size));
        read.read_buffer_mut().extend_from_slice(&leftover);
        Ok(Self {
            read,
            write: FramedWrite::new(post_write, MessageEncoder { tunneled: true }),
            ctx: ConnectionContext {
                local_addr,
                peer_addr,
                established_wall,
            },
            _tunnel: Some(TunnelHalves {
                _get_write: get_write,
                _post_read: post_read,
            }),
        })
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.read.decoder().read_pos + crate::to_u64(self.read.read_buffer().remaining()),
            received_wall: WallTime::now(),
            received: Instant::now(),
        }
    }

    fn wrap_write_err(&self, e: CodecError) -> ErrorInt {
        match e {
            CodecError::IoError(source) => ErrorInt::WriteError {
                conn_ctx: self.ctx,
                source,
            },
            CodecError::ParseError { .. } | CodecError::BufferExceeded { .. } => unreachable!(),
        }
    }
}

async fn connect_tcp(host: Host<&str>, port: u16) -> Result<TcpStream, std::io::Error> {
    match host {
        Host::Domain(h) => TcpStream::connect((h, port)).await,
        Host::Ipv4(h) => TcpStream::connect((h, port)).await,
        Host::Ipv6(h) => TcpStream::connect((h, port)).await,
    }
}

fn tunnel_err(description: String, status: Option<u16>) -> Error {
    wrap!(ErrorInt::TunnelHandshakeError {
        description,
        status,
    })
}

/// Reads the `GET` leg's HTTP response head, requiring `HTTP/1.x 200`.
/// Returns bytes the server sent beyond the head (already RTSP).
async fn read_http_head(stream: &mut TcpStream) -> Result<Bytes, Error> {
    const MAX_HEAD: usize = 8_192;
    let mut buf = BytesMut::with_capacity(2_048);
    let head_end = loop {
        if let Some(i) = buf
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            break i + 4;
        }
        if buf.len() > MAX_HEAD {
            return Err(tunnel_err(
                format!("no end of HTTP response head in {MAX_HEAD} bytes"),
                None,
            ));
        }
        if stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| tunnel_err(format!("error reading GET response: {e}"), None))?
            == 0
        {
            return Err(tunnel_err(
                "EOF before HTTP response head".to_owned(),
                None,
            ));
        }
    };
    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| tunnel_err("HTTP response head is not UTF-8".to_owned(), None))?;
    let status_line = head.split("\r\n").next().unwrap_or("");
    let mut parts = status_line.split_ascii_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(tunnel_err(
            format!("bad status line {status_line:?} on GET leg"),
            None,
        ));
    }
    let status = parts
        .next()
        .and_then(|c| u16::from_str_radix(c, 10).ok())
        .ok_or_else(|| tunnel_err(format!("bad status line {status_line:?} on GET leg"), None))?;
    if status != 200 {
        return Err(tunnel_err(
            format!("GET leg refused: {status_line:?}"),
            Some(status),
        ));
    }
    buf.advance(head_end);
    Ok(buf.freeze())
}

impl Stream for Connection {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.read.poll_next_unpin(cx).map_err(|e| {
            wrap!(match e {
                CodecError::IoError(error) => ErrorInt::RtspReadError {
                    conn_ctx: self.ctx,
                    msg_ctx: self.eof_ctx(),
                    source: error,
                },
                CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                    conn_ctx: self.ctx,
                    msg_ctx: RtspMessageContext {
                        pos,
                        received_wall: WallTime::now(),
                        received: Instant::now(),
                    },
                    description,
                },
                CodecError::BufferExceeded { capacity, pos } => ErrorInt::ResponseBufferExceeded {
                    conn_ctx: self.ctx,
                    msg_ctx: RtspMessageContext {
                        pos,
                        received_wall: WallTime::now(),
                        received: Instant::now(),
                    },
                    capacity,
                },
            })
        })
    }
}

impl Sink<Message<Bytes>> for Connection {
    type Error = ErrorInt;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.write
            .poll_ready_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: Message<Bytes>,
    ) -> Result<(), Self::Error> {
        self.write
            .start_send_unpin(item)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.write
            .poll_flush_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.write
            .poll_close_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }
}

/// Locates `subset` within `buf`, returning its index range, or `None` for
/// an empty subset. Panics if `subset` wasn't actually borrowed from `buf`.
fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let off = (subset.as_ptr() as usize)
        .checked_sub(buf.as_ptr() as usize)
        .expect("subset starts within buf");
    let end = off + subset.len();
    assert!(end <= buf.len(), "subset ends within buf");
    Some(off..end)
}

/// An intermediate error type that exists because [`FramedRead`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
    BufferExceeded { capacity: usize, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

/// Decodes RTSP messages, with a `$`-interleaved-data fast path.
struct MessageDecoder {
    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,

    /// Reassembly-buffer cap. A single response or interleaved frame must
    /// complete within this many buffered bytes.
    max_buffered: usize,
}

impl MessageDecoder {
    fn new(max_buffered: usize) -> Self {
        Self {
            read_pos: 0,
            max_buffered,
        }
    }

    fn exceeded(&self) -> CodecError {
        CodecError::BufferExceeded {
            capacity: self.max_buffered,
            pos: self.read_pos,
        }
    }

    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        // Some servers pad between messages with stray CRLF pairs. Drop them
        // up front so the `$` test below always sees the first byte of a
        // frame; a padded data frame must not fall through to
        // `Message::parse` and come back as a `Message::Data` the slow path
        // doesn't expect.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        if !src.is_empty() && src[0] == b'$' {
            // Interleaved data: `$`, a channel id, and a big-endian length
            // prefixing the payload. Decoded by hand both because it's the
            // hot path once a stream is playing and because the payload can
            // be sliced straight out of the read buffer without copying.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            // The cap bounds frame reassembly just as it bounds responses;
            // a frame that can never fit is rejected now rather than after
            // the buffer has grown to the limit.
            if len > self.max_buffered {
                return Err(self.exceeded());
            }
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut frame = src.split_to(len);
            frame.advance(4);
            return Ok(Some((
                len,
                Message::Data(Data::new(channel_id, frame.freeze())),
            )));
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::ParseError {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        crate::hex::LimitedHex::new(&src[..], 128),
                    ),
                    pos: self.read_pos,
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => {
                // A message must complete within the configured buffer
                // size. Checking on the incomplete path keeps arbitrarily
                // long headers from growing the buffer without bound.
                if src.len() >= self.max_buffered {
                    return Err(self.exceeded());
                }
                return Ok(None);
            }
        };

        // `msg` still borrows `src`, which now has to be advanced past the
        // parsed bytes. Detach the borrowed body first (noting where it
        // sat), split the consumed bytes off the buffer, and hand the
        // message an owned slice of that same allocation.
        let (msg, body_range) = match msg {
            Message::Request(r) => {
                let range = as_range(src, r.body());
                (Message::Request(r.replace_body(rtsp_types::Empty)), range)
            }
            Message::Response(r) => {
                let range = as_range(src, r.body());
                (Message::Response(r.replace_body(rtsp_types::Empty)), range)
            }
            Message::Data(_) => unreachable!("data frames take the fast path"),
        };
        let mut raw = src.split_to(len);
        let body = match body_range {
            None => Bytes::new(),
            Some(range) => {
                raw.advance(range.start);
                raw.truncate(range.len());
                raw.freeze()
            }
        };
        let msg = match msg {
            Message::Request(r) => Message::Request(r.replace_body(body)),
            Message::Response(r) => Message::Response(r.replace_body(body)),
            Message::Data(_) => unreachable!(),
        };
        Ok(Some((len, msg)))
    }
}

impl tokio_util::codec::Decoder for MessageDecoder {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src) {
            Err(e) => return Err(e),
            Ok(None) => return Ok(None),
            Ok(Some((len, msg))) => (len, msg),
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
                received: Instant::now(),
            },
        };
        self.read_pos += crate::to_u64(len);
        Ok(Some(msg))
    }
}

/// Encodes RTSP messages, base64ing each one in tunneled mode.
struct MessageEncoder {
    tunneled: bool,
}

impl tokio_util::codec::Encoder<Message<Bytes>> for MessageEncoder {
    type Error = CodecError;

    fn encode(&mut self, item: Message<Bytes>, mut dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.tunneled {
            let mut raw = Vec::new();
            item.write(&mut raw).expect("Vec write is infallible");
            dst.extend_from_slice(BASE64.encode(&raw).as_bytes());
        } else {
            item.write(&mut (&mut dst).writer())
                .expect("BufMut Writer is infallible");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    #[test]
    fn crlf_data() {
        let mut codec = MessageDecoder::new(20_000);
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x04asdfrest"[..]);
        codec.decode(&mut buf).unwrap();
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn interleaved_across_reads() {
        let mut codec = MessageDecoder::new(20_000);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"$");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x02\x00\x04DE");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"AD$\x02\x00\x02BE");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 2);
                assert_eq!(&d.into_body()[..], b"DEAD");
            }
            o => panic!("unexpected {o:?}"),
        }
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 2);
                assert_eq!(&d.into_body()[..], b"BE");
            }
            o => panic!("unexpected {o:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn buffer_exceeded() {
        let mut codec = MessageDecoder::new(32);
        let mut buf = BytesMut::from(&b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: OPTIONS, DE"[..]);
        match codec.decode(&mut buf) {
            Err(CodecError::BufferExceeded { capacity: 32, .. }) => {}
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn tunneled_encode_is_base64() {
        let req = rtsp_types::Request::builder(rtsp_types::Method::Options, rtsp_types::Version::V1_0)
            .request_uri(url::Url::parse("rtsp://example.com/s").unwrap())
            .header(rtsp_types::headers::CSEQ, "1")
            .build(Bytes::new());

        let mut plain = BytesMut::new();
        MessageEncoder { tunneled: false }
            .encode(Message::Request(req.clone()), &mut plain)
            .unwrap();
        let mut tunneled = BytesMut::new();
        MessageEncoder { tunneled: true }
            .encode(Message::Request(req), &mut tunneled)
            .unwrap();
        assert_eq!(BASE64.decode(&tunneled[..]).unwrap(), &plain[..]);
    }
}
