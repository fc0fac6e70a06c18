use std::io::{self, BufRead};

/// Prefix of the first movetext line of every game.
const MOVETEXT_START: &str = "1.";

/// Movetext lines of one game, in file order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGameBlock {
    lines: Vec<String>,
}

impl RawGameBlock {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Line-driven game boundary detector.
///
/// A line starting with `1.` opens a new game (flushing the previous one).
/// While inside movetext, further lines are kept only when they start with
/// an ASCII digit; headers, blank lines and wrapped text without a leading
/// move number are dropped without leaving movetext.
#[derive(Debug, Default)]
pub struct Segmenter {
    in_movetext: bool,
    current_game: Vec<String>,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the state machine by one raw line. Returns the previous game
    /// when `line` starts a new one.
    pub fn feed(&mut self, line: &str) -> Option<RawGameBlock> {
        let line = line.trim();

        if line.starts_with(MOVETEXT_START) {
            let finished = self.take_block();
            self.in_movetext = true;
            self.current_game.push(line.to_string());
            return finished;
        }

        if self.in_movetext && line.starts_with(|c: char| c.is_ascii_digit()) {
            self.current_game.push(line.to_string());
        }

        None
    }

    /// Flush the game still being accumulated at end of input.
    pub fn finish(&mut self) -> Option<RawGameBlock> {
        self.take_block()
    }

    fn take_block(&mut self) -> Option<RawGameBlock> {
        if self.current_game.is_empty() {
            None
        } else {
            Some(RawGameBlock {
                lines: std::mem::take(&mut self.current_game),
            })
        }
    }
}

/// Streaming iterator over the games of one PGN byte stream.
///
/// Reads one line at a time, so memory is bounded by the longest game rather
/// than the file. Lines may end in `\n`, `\r\n` or a lone `\r`. Invalid UTF-8
/// is skipped byte-wise. A read error is
/// yielded once and ends the iteration; the partial game is discarded.
pub struct Games<R> {
    reader: R,
    segmenter: Segmenter,
    buf: Vec<u8>,
    /// The last line ended in `\r`; a `\n` right after it belongs to it.
    skip_lf: bool,
    done: bool,
}

impl<R: BufRead> Games<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            segmenter: Segmenter::new(),
            buf: Vec::with_capacity(256),
            skip_lf: false,
            done: false,
        }
    }

    /// Read the next line into `buf` without its terminator. Returns false
    /// at end of input when nothing was read.
    fn read_line(&mut self) -> io::Result<bool> {
        self.buf.clear();
        let mut read_any = false;
        loop {
            let available = match self.reader.fill_buf() {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(read_any);
            }
            let mut start = 0;
            if self.skip_lf {
                self.skip_lf = false;
                if available[0] == b'\n' {
                    start = 1;
                }
            }
            match available[start..].iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(i) => {
                    let end = start + i;
                    self.buf.extend_from_slice(&available[start..end]);
                    self.skip_lf = available[end] == b'\r';
                    self.reader.consume(end + 1);
                    return Ok(true);
                }
                None => {
                    let len = available.len();
                    self.buf.extend_from_slice(&available[start..]);
                    read_any |= len > start;
                    self.reader.consume(len);
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for Games<R> {
    type Item = io::Result<RawGameBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.read_line() {
                Ok(false) => {
                    self.done = true;
                    return self.segmenter.finish().map(Ok);
                }
                Ok(true) => {
                    let line = decode_lossy(&self.buf);
                    if let Some(block) = self.segmenter.feed(&line) {
                        return Some(Ok(block));
                    }
                }
                Err(e) => {
                    self.done = true;
                    self.segmenter = Segmenter::new();
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Decode bytes as UTF-8, dropping invalid sequences instead of replacing them.
pub(crate) fn decode_lossy(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.utf8_chunks().map(|chunk| chunk.valid()).collect(),
    }
}
