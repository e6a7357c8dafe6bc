// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, RtspMessageContext};
use bytes::Bytes;
use thiserror::Error;

// Classic errno values used when a local failure has no OS error to report.
// Command outcomes carry local failures as negated errno (see
// `client::CommandOutcome`), matching the convention of older RTSP client
// libraries.
pub(crate) const EIO: i32 = 5;
pub(crate) const EINVAL: i32 = 22;
pub(crate) const EPIPE: i32 = 32;
pub(crate) const EPROTO: i32 = 71;
pub(crate) const ECONNABORTED: i32 = 103;
pub(crate) const ENOBUFS: i32 = 105;
pub(crate) const ENOTCONN: i32 = 107;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// Currently the focus is on providing detailed human-readable error messages.
/// In most cases they have enough information to find the offending packet
/// in Wireshark.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the status code, if the error was generated from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::RtspResponseError { status, .. } => Some((*status).into()),
            ErrorInt::TunnelHandshakeError {
                status: Some(status),
                ..
            } => Some(*status),
            _ => None,
        }
    }

    /// Returns this error as a command result code.
    ///
    /// Positive values are RTSP (or, for the tunneling handshake, HTTP)
    /// status codes; negative values are negated `errno`-style local codes.
    pub fn result_code(&self) -> i32 {
        if let Some(status) = self.status_code() {
            return i32::from(status);
        }
        let errno = |e: &std::io::Error| e.raw_os_error().unwrap_or(EIO);
        -match self.0.as_ref() {
            ErrorInt::InvalidArgument(_) => EINVAL,
            ErrorInt::ConnectError(e) => errno(e),
            ErrorInt::RtspReadError { source, .. } => errno(source),
            ErrorInt::WriteError { source, .. } => errno(source),
            ErrorInt::ServerClosed { .. } => EPIPE,
            ErrorInt::RtspFramingError { .. } => EPROTO,
            ErrorInt::ResponseBufferExceeded { .. } => ENOBUFS,
            ErrorInt::TunnelHandshakeError { .. } => EPROTO,
            ErrorInt::RtspUnassignedChannelError { .. } => EPROTO,
            ErrorInt::FailedPrecondition(_) => ENOTCONN,
            ErrorInt::Aborted => ECONNABORTED,
            ErrorInt::RtspResponseError { .. } => unreachable!("handled via status_code"),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP framing error: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    /// A complete response (or interleaved frame) didn't fit within the
    /// configured response buffer size.
    #[error(
        "Response exceeded the {capacity}-byte response buffer\n\n\
         conn: {conn_ctx}\nmsg: {msg_ctx}"
    )]
    ResponseBufferExceeded {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        capacity: usize,
    },

    #[error("{status} response to {} CSeq={cseq}: {description}\n\n\
             conn: {conn_ctx}\nmsg: {msg_ctx}", Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    #[error(
        "Received interleaved data on unassigned channel {channel_id}: \n\
         {:?}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}",
        crate::hex::LimitedHex::new(data, 64)
    )]
    RtspUnassignedChannelError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        data: Bytes,
    },

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    /// Failure establishing the HTTP `GET`/`POST` tunnel pair.
    #[error("RTSP-over-HTTP tunnel handshake failed: {description}")]
    TunnelHandshakeError {
        description: String,
        status: Option<u16>,
    },

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    /// The peer cleanly closed the control connection.
    #[error("RTSP peer closed the connection\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    ServerClosed {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// The client was reset or dropped with the request still outstanding.
    #[error("Request aborted locally")]
    Aborted,
}
