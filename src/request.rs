use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::headers::{find_crlf, HeaderError, HeaderTable};

/// Initial size of the read buffer used by [`Request::from_reader`].
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestLine {
    method: String,
    target: String,
    version: String,
}

impl RequestLine {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The protocol version without the `HTTP/` prefix, always `1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    #[default]
    Initialized,
    ParsingHeaders,
    ParsingBody,
    Done,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request line: {0}")]
    InvalidRequestLine(&'static str),
    #[error("invalid method {0:?}: expected uppercase letters")]
    InvalidMethod(String),
    #[error("unsupported http version {0:?}")]
    UnsupportedVersion(String),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("body is longer than content-length: declared {declared}, received {received}")]
    BodyTooLong { declared: usize, received: usize },
    #[error("no further input expected, request is already parsed")]
    AlreadyDone,
    #[error("incomplete request: stream ended while {state}")]
    Incomplete { state: ParserState },
    #[error("failed to read request: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Whether the peer sent bytes that are not a valid request, as opposed
    /// to the stream failing or ending early.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequestLine(_)
                | Self::InvalidMethod(_)
                | Self::UnsupportedVersion(_)
                | Self::Header(_)
                | Self::BodyTooLong { .. }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    request_line: RequestLine,
    headers: HeaderTable,
    body: Vec<u8>,
    state: ParserState,
}

impl Request {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reads and parses a single request from `src`.
    ///
    /// Reading stops as soon as the request is complete, any bytes the peer
    /// sent after it are left unread.
    pub async fn from_reader<R: AsyncRead + Unpin>(src: R) -> Result<Self, ParseError> {
        Self::from_reader_with_capacity(src, DEFAULT_BUFFER_SIZE).await
    }

    pub async fn from_reader_with_capacity<R: AsyncRead + Unpin>(
        mut src: R,
        capacity: usize,
    ) -> Result<Self, ParseError> {
        let mut buf = ReadBuffer::with_capacity(capacity);
        let mut req = Self::new();

        while req.state != ParserState::Done {
            if buf.fill_from(&mut src).await? == 0 {
                return Err(ParseError::Incomplete { state: req.state });
            }
            let consumed = req.parse(buf.filled())?;
            buf.consume(consumed);
        }
        Ok(req)
    }

    /// Feeds `data` through the state machine until it completes or needs
    /// more input. Returns the number of bytes consumed; the caller must keep
    /// the rest and present it again, followed by new input.
    pub fn parse(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        let mut total = 0;
        while self.state != ParserState::Done {
            let n = self.advance(&data[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Runs one step of the state machine against `data`.
    pub fn advance(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        match self.state {
            ParserState::Initialized => match parse_request_line(data)? {
                Some((line, n)) => {
                    self.request_line = line;
                    self.state = ParserState::ParsingHeaders;
                    Ok(n)
                }
                None => Ok(0),
            },
            ParserState::ParsingHeaders => {
                let (n, done) = self.headers.parse(data)?;
                if done {
                    self.state = ParserState::ParsingBody;
                }
                Ok(n)
            }
            ParserState::ParsingBody => {
                let declared = match self.headers.content_length()? {
                    Some(declared) => declared,
                    None => {
                        self.state = ParserState::Done;
                        return Ok(0);
                    }
                };
                let received = self.body.len() + data.len();
                if received > declared {
                    return Err(ParseError::BodyTooLong { declared, received });
                }
                self.body.extend_from_slice(data);
                if received == declared {
                    self.state = ParserState::Done;
                }
                Ok(data.len())
            }
            ParserState::Done => Err(ParseError::AlreadyDone),
        }
    }

    pub fn request_line(&self) -> &RequestLine {
        &self.request_line
    }

    pub fn method(&self) -> &str {
        self.request_line.method()
    }

    pub fn target(&self) -> &str {
        self.request_line.target()
    }

    pub fn version(&self) -> &str {
        self.request_line.version()
    }

    pub fn headers(&self) -> &HeaderTable {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn state(&self) -> ParserState {
        self.state
    }
}

/// Parses `METHOD SP TARGET SP HTTP/1.1 CRLF`.
///
/// `Ok(None)` means the line is not complete yet.
pub fn parse_request_line(data: &[u8]) -> Result<Option<(RequestLine, usize)>, ParseError> {
    let end = match find_crlf(data) {
        Some(end) => end,
        None => return Ok(None),
    };
    let line = std::str::from_utf8(&data[..end])
        .map_err(|_| ParseError::InvalidRequestLine("not valid utf-8"))?;

    let parts: Vec<&str> = line.split(' ').collect();
    let (method, target, version) = match parts[..] {
        [method, target, version] => (method, target, version),
        _ => return Err(ParseError::InvalidRequestLine("expected exactly three parts")),
    };

    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ParseError::InvalidMethod(method.to_owned()));
    }
    if target.is_empty() {
        return Err(ParseError::InvalidRequestLine("expected request target"));
    }
    let version = match version.split_once('/') {
        Some(("HTTP", "1.1")) => "1.1",
        _ => return Err(ParseError::UnsupportedVersion(version.to_owned())),
    };

    let line = RequestLine {
        method: method.to_owned(),
        target: target.to_owned(),
        version: version.to_owned(),
    };
    Ok(Some((line, end + 2)))
}

/// Read buffer that doubles when full and keeps unconsumed bytes at the
/// front between reads.
struct ReadBuffer {
    data: Vec<u8>,
    filled: usize,
}

impl ReadBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(1)],
            filled: 0,
        }
    }

    async fn fill_from<R: AsyncRead + Unpin>(&mut self, src: &mut R) -> std::io::Result<usize> {
        if self.filled == self.data.len() {
            let size = self.data.len() * 2;
            trace!(size, "growing request buffer.");
            self.data.resize(size, 0);
        }
        let n = src.read(&mut self.data[self.filled..]).await?;
        self.filled += n;
        Ok(n)
    }

    fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    fn consume(&mut self, n: usize) {
        self.data.copy_within(n..self.filled, 0);
        self.filled -= n;
    }
}

impl fmt::Display for ParserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Initialized => write!(f, "waiting for request line"),
            Self::ParsingHeaders => write!(f, "parsing headers"),
            Self::ParsingBody => write!(f, "parsing body"),
            Self::Done => write!(f, "done"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use rand::Rng;
    use tokio::io::ReadBuf;

    use super::*;

    /// Hands out the data a few bytes per read.
    struct ChunkReader {
        data: Vec<u8>,
        pos: usize,
        sizes: Vec<usize>,
        reads: usize,
    }

    impl ChunkReader {
        fn new(data: impl Into<Vec<u8>>, chunk: usize) -> Self {
            Self::with_sizes(data, vec![chunk])
        }

        fn with_sizes(data: impl Into<Vec<u8>>, sizes: Vec<usize>) -> Self {
            Self {
                data: data.into(),
                pos: 0,
                sizes,
                reads: 0,
            }
        }
    }

    impl AsyncRead for ChunkReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = &mut *self;
            let chunk = this.sizes[this.reads % this.sizes.len()];
            let end = (this.pos + chunk)
                .min(this.pos + buf.remaining())
                .min(this.data.len());
            buf.put_slice(&this.data[this.pos..end]);
            this.pos = end;
            this.reads += 1;
            Poll::Ready(Ok(()))
        }
    }

    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    async fn parse_chunked(data: &str, chunk: usize) -> Result<Request, ParseError> {
        Request::from_reader_with_capacity(ChunkReader::new(data, chunk), 8).await
    }

    #[tokio::test]
    async fn good_get_request_line() {
        let req = parse_chunked(
            "GET / HTTP/1.1\r\nHost: localhost:42069\r\nUser-Agent: curl/7.81.0\r\nAccept: */*\r\n\r\n",
            3,
        )
        .await
        .unwrap();
        assert_eq!(req.method(), "GET");
        assert_eq!(req.target(), "/");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.state(), ParserState::Done);
    }

    #[tokio::test]
    async fn good_get_request_line_with_path() {
        let req = parse_chunked(
            "GET /coffee?cream=yes HTTP/1.1\r\nHost: localhost:42069\r\n\r\n",
            1,
        )
        .await
        .unwrap();
        assert_eq!(req.method(), "GET");
        assert_eq!(req.target(), "/coffee?cream=yes");
    }

    #[tokio::test]
    async fn byte_by_byte_matches_single_read() {
        let raw = "GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        let whole = parse_chunked(raw, raw.len()).await.unwrap();
        let split = parse_chunked(raw, 1).await.unwrap();
        assert_eq!(whole, split);
        assert_eq!(split.headers().get("host"), Some("x"));
        assert!(split.body().is_empty());
    }

    #[tokio::test]
    async fn random_splits_match_single_read() {
        let raw = "POST /submit HTTP/1.1\r\nHost: localhost\r\nSet: a\r\nSet: b\r\n\
                   Content-Length: 26\r\n\r\nabcdefghijklmnopqrstuvwxyz";
        let whole = parse_chunked(raw, raw.len()).await.unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let sizes = (0..8).map(|_| rng.gen_range(1..=16)).collect();
            let capacity = rng.gen_range(1..=32);
            let reader = ChunkReader::with_sizes(raw, sizes);
            let req = Request::from_reader_with_capacity(reader, capacity)
                .await
                .unwrap();
            assert_eq!(req, whole);
        }
        assert_eq!(whole.headers().get("set"), Some("a, b"));
        assert_eq!(whole.body(), b"abcdefghijklmnopqrstuvwxyz");
    }

    #[tokio::test]
    async fn standard_headers() {
        let req = parse_chunked(
            "GET / HTTP/1.1\r\nHost: localhost:42069\r\nUser-Agent: curl/7.81.0\r\nAccept: */*\r\n\r\n",
            3,
        )
        .await
        .unwrap();
        assert_eq!(req.headers().get("host"), Some("localhost:42069"));
        assert_eq!(req.headers().get("user-agent"), Some("curl/7.81.0"));
        assert_eq!(req.headers().get("accept"), Some("*/*"));
    }

    #[tokio::test]
    async fn empty_headers() {
        let req = parse_chunked("GET / HTTP/1.1\r\n\r\n", 2).await.unwrap();
        assert!(req.headers().is_empty());
        assert_eq!(req.state(), ParserState::Done);
    }

    #[tokio::test]
    async fn malformed_header() {
        let err = parse_chunked("GET / HTTP/1.1\r\nHost localhost:42069\r\n\r\n", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Header(HeaderError::MissingColon)));
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn latin1_header_value() {
        let raw = b"GET / HTTP/1.1\r\nX-Name: caf\xe9\r\nHost: x\r\n\r\n";
        let req = Request::from_reader(ChunkReader::new(&raw[..], 4))
            .await
            .unwrap();
        assert_eq!(req.headers().get("x-name"), Some("caf\u{e9}"));
        assert_eq!(req.headers().get("host"), Some("x"));
        assert_eq!(req.state(), ParserState::Done);
    }

    #[tokio::test]
    async fn body_matches_content_length() {
        let req = parse_chunked(
            "POST /submit HTTP/1.1\r\nHost: localhost:42069\r\nContent-Length: 13\r\n\r\nhello world!\n",
            3,
        )
        .await
        .unwrap();
        assert_eq!(req.body(), b"hello world!\n");
    }

    #[tokio::test]
    async fn zero_content_length() {
        let req = parse_chunked(
            "POST /submit HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
            5,
        )
        .await
        .unwrap();
        assert!(req.body().is_empty());
    }

    #[tokio::test]
    async fn body_longer_than_content_length() {
        let err = parse_chunked(
            "POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello!",
            64,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ParseError::BodyTooLong {
                declared: 5,
                received: 6
            }
        ));
    }

    #[tokio::test]
    async fn body_shorter_than_content_length() {
        let err = parse_chunked(
            "POST /submit HTTP/1.1\r\nHost: localhost:42069\r\nContent-Length: 20\r\n\r\npartial content",
            3,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ParseError::Incomplete {
                state: ParserState::ParsingBody
            }
        ));
        assert!(!err.is_malformed());
    }

    #[tokio::test]
    async fn missing_content_length_ignores_body() {
        let req = parse_chunked("POST / HTTP/1.1\r\nHost: x\r\n\r\nignored", 4)
            .await
            .unwrap();
        assert!(req.body().is_empty());
    }

    #[tokio::test]
    async fn invalid_content_length() {
        let err = parse_chunked("POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n", 4)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ParseError::Header(HeaderError::InvalidContentLength(_))
        ));
    }

    #[tokio::test]
    async fn invalid_number_of_parts() {
        let err = parse_chunked("/coffee HTTP/1.1\r\nHost: localhost\r\n\r\n", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidRequestLine(_)));

        let err = parse_chunked("GET /  HTTP/1.1\r\n\r\n", 3).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidRequestLine(_)));
    }

    #[tokio::test]
    async fn invalid_method() {
        let err = parse_chunked("get / HTTP/1.1\r\n\r\n", 3).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidMethod(m) if m == "get"));

        let err = parse_chunked("G3T / HTTP/1.1\r\n\r\n", 3).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidMethod(_)));
    }

    #[test]
    fn unsupported_version_rejected_before_headers() {
        let mut req = Request::new();
        let err = req
            .parse(b"GET / HTTP/2.0\r\nBad Header\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedVersion(v) if v == "HTTP/2.0"));
        assert!(req.headers().is_empty());
        assert_eq!(req.state(), ParserState::Initialized);

        let mut req = Request::new();
        let err = req.parse(b"GET / HTTP/1.0\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedVersion(_)));
    }

    #[test]
    fn partial_input_consumes_nothing() {
        let mut req = Request::new();
        assert_eq!(req.parse(b"GET / HTT").unwrap(), 0);
        assert_eq!(req.state(), ParserState::Initialized);

        let n = req.parse(b"GET / HTTP/1.1\r\nHost: lo").unwrap();
        assert_eq!(n, 16);
        assert_eq!(req.state(), ParserState::ParsingHeaders);

        let n = req.parse(b"Host: localhost\r\n\r\n").unwrap();
        assert_eq!(n, 19);
        assert_eq!(req.state(), ParserState::Done);
    }

    #[test]
    fn advance_after_done() {
        let mut req = Request::new();
        req.parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(matches!(req.advance(b"more"), Err(ParseError::AlreadyDone)));
    }

    #[tokio::test]
    async fn stream_closed_before_request_line() {
        let err = parse_chunked("GET / HTTP/1.1", 4).await.unwrap_err();
        assert!(matches!(
            err,
            ParseError::Incomplete {
                state: ParserState::Initialized
            }
        ));
    }

    #[tokio::test]
    async fn read_error_is_fatal() {
        let err = Request::from_reader(BrokenReader).await.unwrap_err();
        assert!(matches!(err, ParseError::Io(_)));
        assert!(!err.is_malformed());
    }
}
