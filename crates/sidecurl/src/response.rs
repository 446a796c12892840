//! Incremental HTTP/1.1 response parsing.
//!
//! Fed whatever the socket returned; body bytes come out as they are
//! decoded. Framing follows the usual precedence: chunked, then
//! Content-Length, then read until the server closes.

use sidecurl_core::EngineError;

/// Largest response head accepted.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Most header fields accepted in one response head.
const MAX_HEADERS: usize = 64;

/// Largest chunk-size line accepted (hex digits plus extensions).
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parse a head from the start of `buf`. Returns the head and its length
    /// in bytes, or None if the head is not all there yet.
    fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, EngineError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let len = match response.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(EngineError::Protocol(format!("bad response head: {}", e))),
        };

        let status = response
            .code
            .ok_or_else(|| EngineError::Protocol("response head has no status".into()))?;
        let headers = response
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).trim().to_string()))
            .collect();

        let head = Self {
            status,
            reason: response.reason.unwrap_or_default().to_string(),
            headers,
        };
        Ok(Some((head, len)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Chunk {
    Size(Vec<u8>),
    Data(u64),
    DataEnd,
    Trailer(Vec<u8>),
}

/// Chunked transfer-coding decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: Chunk,
    done: bool,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: Chunk::Size(Vec::new()),
            done: false,
        }
    }
}

impl ChunkedDecoder {
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode `input`, appending body bytes to `out`. Returns bytes consumed;
    /// anything after the final chunk is left alone.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, EngineError> {
        let mut pos = 0;
        while pos < input.len() && !self.done {
            match &mut self.state {
                Chunk::Size(line) => {
                    let byte = input[pos];
                    pos += 1;
                    if byte != b'\n' {
                        line.push(byte);
                        if line.len() > MAX_CHUNK_LINE {
                            return Err(EngineError::Protocol("chunk size line too long".into()));
                        }
                        continue;
                    }
                    let size = parse_chunk_size(line)?;
                    self.state = if size == 0 {
                        Chunk::Trailer(Vec::new())
                    } else {
                        Chunk::Data(size)
                    };
                }
                Chunk::Data(remaining) => {
                    let available = (input.len() - pos) as u64;
                    let take = (*remaining).min(available) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = Chunk::DataEnd;
                    }
                }
                Chunk::DataEnd => {
                    let byte = input[pos];
                    pos += 1;
                    match byte {
                        b'\r' => {}
                        b'\n' => self.state = Chunk::Size(Vec::new()),
                        _ => return Err(EngineError::Protocol("missing CRLF after chunk".into())),
                    }
                }
                Chunk::Trailer(line) => {
                    let byte = input[pos];
                    pos += 1;
                    if byte != b'\n' {
                        line.push(byte);
                        if line.len() > MAX_CHUNK_LINE {
                            return Err(EngineError::Protocol("trailer line too long".into()));
                        }
                        continue;
                    }
                    // Empty line ends the trailer section.
                    if line.iter().all(|b| *b == b'\r') {
                        self.done = true;
                    } else {
                        line.clear();
                    }
                }
            }
        }
        Ok(pos)
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, EngineError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| EngineError::Protocol("chunk size is not UTF-8".into()))?;
    let digits = text.trim_end_matches('\r').split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| EngineError::Protocol(format!("bad chunk size '{}'", digits)))
}

/// What a call to [`ResponseParser::feed`] produced.
#[derive(Debug, Default)]
pub struct Progress {
    pub body: Vec<u8>,
    pub complete: bool,
}

#[derive(Debug, Default)]
pub struct ResponseParser {
    head_buf: Vec<u8>,
    head: Option<ResponseHead>,
    framing: Option<Framing>,
    chunked: ChunkedDecoder,
    body_bytes: u64,
    complete: bool,
}

impl ResponseParser {
    pub fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<Progress, EngineError> {
        let mut progress = Progress::default();

        if self.head.is_none() {
            self.head_buf.extend_from_slice(input);
            let Some((head, len)) = ResponseHead::parse(&self.head_buf)? else {
                if self.head_buf.len() > MAX_HEAD_LEN {
                    return Err(EngineError::Protocol("response head too large".into()));
                }
                return Ok(progress);
            };
            self.framing = Some(framing_for(&head)?);
            self.head = Some(head);

            let rest = self.head_buf.split_off(len);
            self.head_buf.clear();
            self.feed_body(&rest, &mut progress)?;
        } else if !self.complete {
            self.feed_body(input, &mut progress)?;
        }

        progress.complete = self.complete;
        Ok(progress)
    }

    fn feed_body(&mut self, input: &[u8], progress: &mut Progress) -> Result<(), EngineError> {
        match self.framing {
            Some(Framing::Length(remaining)) => {
                let take = (remaining.min(input.len() as u64)) as usize;
                progress.body.extend_from_slice(&input[..take]);
                let remaining = remaining - take as u64;
                self.framing = Some(Framing::Length(remaining));
                self.complete = remaining == 0;
            }
            Some(Framing::Chunked) => {
                self.chunked.feed(input, &mut progress.body)?;
                self.complete = self.chunked.is_done();
            }
            Some(Framing::UntilClose) => progress.body.extend_from_slice(input),
            None => {}
        }
        self.body_bytes += progress.body.len() as u64;
        Ok(())
    }

    /// The server closed the connection. Only valid where the framing allows it.
    pub fn finish(&mut self) -> Result<(), EngineError> {
        match (self.head.is_some(), self.framing) {
            (false, _) => Err(EngineError::Protocol("connection closed before response head".into())),
            (true, Some(Framing::UntilClose)) => {
                self.complete = true;
                Ok(())
            }
            _ if self.complete => Ok(()),
            _ => Err(EngineError::Protocol(format!(
                "connection closed after {} body bytes, response incomplete",
                self.body_bytes
            ))),
        }
    }
}

fn framing_for(head: &ResponseHead) -> Result<Framing, EngineError> {
    // No body, whatever the headers say.
    if head.status == 204 || head.status == 304 || (100..200).contains(&head.status) {
        return Ok(Framing::Length(0));
    }
    if let Some(te) = head.header("transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(Framing::Chunked);
        }
    }
    match head.header("content-length") {
        Some(len) => len
            .trim()
            .parse()
            .map(Framing::Length)
            .map_err(|_| EngineError::Protocol(format!("bad Content-Length '{}'", len))),
        None => Ok(Framing::UntilClose),
    }
}
