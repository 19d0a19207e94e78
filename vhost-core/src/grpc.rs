//! Sniffs a gRPC (HTTP/2 cleartext) client's connection preface far
//! enough to learn its `:authority` without fully speaking HTTP/2, then
//! hands the raw, still-unconsumed bytes back so the connection can be
//! spliced straight through to a pod.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::GrpcPrefaceError;
use crate::http2frame::{self, Frame};

/// The `:authority` a gRPC client asked for, plus every byte read off
/// the wire while getting there — replayed verbatim onto the backend's
/// data stream so it sees an unmodified client preface.
pub struct GrpcPreface {
    pub authority: String,
    pub client_preface: Vec<u8>,
}

/// Walks a client's HTTP/2 connection preface: the trailing magic
/// suffix, an initial SETTINGS frame (acknowledged and matched with our
/// own), the client's SETTINGS ACK, and finally its HEADERS (plus any
/// CONTINUATION frames) to recover `:authority`.
///
/// Assumes the caller has already consumed `"PRI * HTTP/2.0\r\n\r\n"` while
/// sniffing which protocol the connection speaks.
pub async fn sniff_preface<S>(stream: &mut S) -> Result<GrpcPreface, GrpcPrefaceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_preface = http2frame::CLIENT_PREFACE.to_vec();

    let mut suffix = [0u8; 6];
    stream.read_exact(&mut suffix).await?;
    if suffix != *http2frame::CLIENT_PREFACE_SUFFIX {
        return Err(GrpcPrefaceError::InvalidPreface);
    }

    let settings = read_frame(stream, &mut client_preface).await?;
    if settings.frame_type != http2frame::FRAME_TYPE_SETTINGS
        || settings.flags & http2frame::FLAG_SETTINGS_ACK != 0
    {
        return Err(GrpcPrefaceError::UnexpectedFrame { expected: "SETTINGS" });
    }

    stream
        .write_all(&http2frame::build_settings_frame(&[(
            http2frame::SETTINGS_MAX_FRAME_SIZE,
            http2frame::MAX_FRAME_LEN,
        )]))
        .await?;
    stream
        .write_all(&http2frame::build_settings_ack_frame())
        .await?;
    stream.flush().await?;

    let settings_ack = read_frame(stream, &mut client_preface).await?;
    if settings_ack.frame_type != http2frame::FRAME_TYPE_SETTINGS
        || settings_ack.flags & http2frame::FLAG_SETTINGS_ACK == 0
    {
        return Err(GrpcPrefaceError::UnexpectedFrame { expected: "SETTINGS ACK" });
    }

    let headers = read_frame(stream, &mut client_preface).await?;
    if headers.frame_type != http2frame::FRAME_TYPE_HEADERS {
        return Err(GrpcPrefaceError::UnexpectedFrame { expected: "HEADERS" });
    }
    let mut header_block = headers.payload.clone();
    let mut end_headers = headers.flags & http2frame::FLAG_END_HEADERS != 0;
    while !end_headers {
        let continuation = read_frame(stream, &mut client_preface).await?;
        if continuation.frame_type != http2frame::FRAME_TYPE_CONTINUATION {
            return Err(GrpcPrefaceError::UnexpectedFrame { expected: "CONTINUATION" });
        }
        header_block.extend_from_slice(&continuation.payload);
        end_headers = continuation.flags & http2frame::FLAG_END_HEADERS != 0;
    }

    let authority = decode_authority(&header_block)?;

    Ok(GrpcPreface { authority, client_preface })
}

async fn read_frame<S>(stream: &mut S, recording: &mut Vec<u8>) -> Result<Frame, GrpcPrefaceError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; http2frame::FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (length, frame_type, flags, stream_id) = http2frame::parse_header(&header);

    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await?;

    recording.extend_from_slice(&header);
    recording.extend_from_slice(&payload);

    Ok(Frame { frame_type, flags, stream_id, payload })
}

fn decode_authority(header_block: &[u8]) -> Result<String, GrpcPrefaceError> {
    let mut decoder = fluke_hpack::Decoder::new();
    let fields = decoder
        .decode(header_block)
        .map_err(|_| GrpcPrefaceError::InvalidPreface)?;

    fields
        .into_iter()
        .find(|(name, _)| name == b":authority")
        .map(|(_, value)| String::from_utf8_lossy(&value).into_owned())
        .ok_or(GrpcPrefaceError::MissingAuthority)
}
