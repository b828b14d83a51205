use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::headers::{is_token_char, HeaderError, HeaderTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: Self = Self(200);
    pub const BAD_REQUEST: Self = Self(400);
    pub const NOT_FOUND: Self = Self(404);
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);

    pub fn from_u16(code: u16) -> Self {
        Self(code)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Reason phrase sent on the status line, empty for codes without one.
    pub fn reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            500 => "Internal Server Error",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    StatusLine,
    Headers,
    Body,
    Trailers,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Fixed,
    Chunked,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("cannot {operation} while in state {state:?}")]
    OutOfPhase {
        operation: &'static str,
        state: WriterState,
    },
    #[error("cannot mix fixed-length and chunked body writes")]
    MixedFraming,
    #[error("trailer {0:?} was not declared in the Trailer header")]
    UndeclaredTrailer(String),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("failed to write response: {0}")]
    Io(#[from] io::Error),
}

/// Writes one response to `dest`, enforcing the order
/// status line, headers, body, trailers.
///
/// Every method checks the phase before touching the sink, so a call out of
/// order returns [`WriteError::OutOfPhase`] and writes nothing.
pub struct ResponseWriter<W> {
    dest: W,
    state: WriterState,
    framing: Option<BodyFraming>,
    declared_trailers: Vec<String>,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(dest: W) -> Self {
        Self {
            dest,
            state: WriterState::StatusLine,
            framing: None,
            declared_trailers: Vec::new(),
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Whether a well-formed response has been written.
    ///
    /// A fixed-length body has no terminator, so the body phase counts as
    /// complete unless chunks were started.
    pub fn is_complete(&self) -> bool {
        match self.state {
            WriterState::Done => true,
            WriterState::Body => self.framing != Some(BodyFraming::Chunked),
            _ => false,
        }
    }

    pub fn into_inner(self) -> W {
        self.dest
    }

    pub async fn write_status_line(&mut self, status: StatusCode) -> Result<(), WriteError> {
        self.check_phase(WriterState::StatusLine, "write status line")?;
        let line = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.reason());
        self.send(line.as_bytes()).await?;
        self.state = WriterState::Headers;
        Ok(())
    }

    pub async fn write_headers(&mut self, headers: &HeaderTable) -> Result<(), WriteError> {
        self.check_phase(WriterState::Headers, "write headers")?;
        let block = serialize_fields(headers)?;
        self.declared_trailers = headers
            .get("trailer")
            .map(|names| {
                names
                    .split(',')
                    .map(|n| n.trim().to_ascii_lowercase())
                    .filter(|n| !n.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        self.send(&block).await?;
        self.state = WriterState::Body;
        Ok(())
    }

    /// Writes raw body bytes for a fixed-length response. May be called
    /// repeatedly to stream a body whose length was declared up front.
    pub async fn write_body(&mut self, body: &[u8]) -> Result<usize, WriteError> {
        self.check_phase(WriterState::Body, "write body")?;
        self.set_framing(BodyFraming::Fixed)?;
        self.send(body).await?;
        Ok(body.len())
    }

    /// Sends `data` as one chunk and returns the number of bytes put on the
    /// wire, framing included.
    pub async fn write_chunked_body(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.check_phase(WriterState::Body, "write chunked body")?;
        self.set_framing(BodyFraming::Chunked)?;
        // a zero-size chunk would end the body
        if data.is_empty() {
            return Ok(0);
        }
        let mut frame = format!("{:X}\r\n", data.len()).into_bytes();
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n");
        self.send(&frame).await?;
        Ok(frame.len())
    }

    /// Ends a chunked body.
    ///
    /// Without declared trailers this writes `0\r\n\r\n` and the response is
    /// done. When the headers named trailer fields, only the last-chunk line
    /// is written and [`ResponseWriter::write_trailers`] must follow.
    pub async fn write_chunked_body_done(&mut self) -> Result<usize, WriteError> {
        self.check_phase(WriterState::Body, "finish chunked body")?;
        self.set_framing(BodyFraming::Chunked)?;
        let terminator: &[u8] = if self.declared_trailers.is_empty() {
            b"0\r\n\r\n"
        } else {
            b"0\r\n"
        };
        self.send(terminator).await?;
        self.state = if self.declared_trailers.is_empty() {
            WriterState::Done
        } else {
            WriterState::Trailers
        };
        Ok(terminator.len())
    }

    pub async fn write_trailers(&mut self, trailers: &HeaderTable) -> Result<(), WriteError> {
        self.check_phase(WriterState::Trailers, "write trailers")?;
        if let Some((name, _)) = trailers
            .iter()
            .find(|(name, _)| !self.declared_trailers.iter().any(|d| name.matches(d)))
        {
            return Err(WriteError::UndeclaredTrailer(name.to_string()));
        }
        let block = serialize_fields(trailers)?;
        self.send(&block).await?;
        self.state = WriterState::Done;
        Ok(())
    }

    /// Writes a complete fixed-length response in one go.
    pub async fn respond(
        &mut self,
        status: StatusCode,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), WriteError> {
        let mut headers = default_headers(body.len());
        headers.set("Content-Type", content_type);
        self.write_status_line(status).await?;
        self.write_headers(&headers).await?;
        self.write_body(body).await?;
        Ok(())
    }

    fn check_phase(&self, state: WriterState, operation: &'static str) -> Result<(), WriteError> {
        if self.state != state {
            return Err(WriteError::OutOfPhase {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn set_framing(&mut self, framing: BodyFraming) -> Result<(), WriteError> {
        match self.framing {
            Some(current) if current != framing => Err(WriteError::MixedFraming),
            _ => {
                self.framing = Some(framing);
                Ok(())
            }
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.dest.write_all(bytes).await?;
        self.dest.flush().await
    }
}

/// Headers every generated response starts from. Connections are never
/// reused, so `Connection: close` is always set.
pub fn default_headers(content_length: usize) -> HeaderTable {
    let mut headers = HeaderTable::new();
    headers.set("Content-Length", &content_length.to_string());
    headers.set("Connection", "close");
    headers.set("Content-Type", "text/plain");
    headers
}

/// `Name: Value\r\n` per field followed by the blank line.
fn serialize_fields(fields: &HeaderTable) -> Result<Vec<u8>, HeaderError> {
    let mut block = Vec::new();
    for (name, value) in fields.iter() {
        if let Some(c) = name.as_str().chars().find(|&c| !is_token_char(c)) {
            return Err(HeaderError::InvalidNameChar(c));
        }
        if value.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0)) {
            return Err(HeaderError::InvalidValue(name.to_string()));
        }
        block.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    block.extend_from_slice(b"\r\n");
    Ok(block)
}
