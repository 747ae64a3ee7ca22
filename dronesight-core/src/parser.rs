//! Capture log grammar: header/body lines to [`FrameRecord`], record grouping, file error codes.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::frame::{merge_separated, FrameRecord};
use crate::mac::MacAddr;

const MAC_PATTERN: &str = "([0-9a-fA-F]+:[0-9a-fA-F]+:[0-9a-fA-F]+:[0-9a-fA-F]+:[0-9a-fA-F]+:[0-9a-fA-F]+)";

/// How lines of a capture log group into one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Header line, hex line (`Frame=`/`Bits=`), decoded body line.
    Interleaved,
    /// Header line (hex inline), decoded body line.
    Paired,
    /// Physical-layer header only (`*_phy.log`).
    HeaderOnly,
    /// Decoded body only (`*_parser.log`).
    BodyOnly,
}

impl Layout {
    pub fn lines_per_record(self) -> usize {
        match self {
            Layout::Interleaved => 3,
            Layout::Paired => 2,
            Layout::HeaderOnly | Layout::BodyOnly => 1,
        }
    }

    fn has_header(self) -> bool {
        !matches!(self, Layout::BodyOnly)
    }

    fn has_body(self) -> bool {
        !matches!(self, Layout::HeaderOnly)
    }

    fn body_line(self) -> usize {
        match self {
            Layout::Interleaved => 2,
            Layout::Paired => 1,
            _ => 0,
        }
    }

    /// Separated-file layout from the file name; `None` for combined logs.
    pub fn from_path(path: &Path) -> Option<Layout> {
        let name = path.file_name()?.to_string_lossy();
        if name.contains("_phy.log") {
            Some(Layout::HeaderOnly)
        } else if name.contains("_parser.log") {
            Some(Layout::BodyOnly)
        } else {
            None
        }
    }
}

/// File-level read failure. [`ReadError::code`] gives the numeric status callers report.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("input ended mid-record ({got} of {expected} lines)")]
    Truncated { got: usize, expected: usize },
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("worker pool: {0}")]
    Pool(#[from] crate::pool::PoolError),
}

impl ReadError {
    /// -1 open/read failure, -2 truncated trailing record.
    pub fn code(&self) -> i32 {
        match self {
            ReadError::Truncated { .. } => -2,
            _ => -1,
        }
    }
}

/// Compiled line grammar.
pub struct FrameParser {
    index: Regex,
    offset: Regex,
    bandwidth: Regex,
    mcs: Regex,
    size: Regex,
    fcs_fail: Regex,
    frame_type: Regex,
    more_frags: Regex,
    ssid: Regex,
    ta: Regex,
    ra: Regex,
    seq_num: Regex,
    frag_num: Regex,
}

impl FrameParser {
    pub fn new() -> Result<Self, ReadError> {
        Ok(Self {
            index: Regex::new(r"^\s*(\d+)")?,
            offset: Regex::new(r"Offset=([0-9]+(\.[0-9]+)?)")?,
            bandwidth: Regex::new(r"BW=([^,]+)")?,
            mcs: Regex::new(r"MCS=([^,]+)")?,
            size: Regex::new(r"Size=([0-9]+)")?,
            fcs_fail: Regex::new(r"FCS=Fail")?,
            frame_type: Regex::new(r"Type=([^,]+),")?,
            more_frags: Regex::new(r"More Fragments=([0-9]+)")?,
            ssid: Regex::new(r"[^B]SSID='(.*?)'(?:,|\s*$)")?,
            ta: Regex::new(&format!("TA.*?={MAC_PATTERN}"))?,
            ra: Regex::new(&format!("RA.*?={MAC_PATTERN}"))?,
            seq_num: Regex::new(r"Seqnum=([0-9]+)")?,
            frag_num: Regex::new(r"Fragnum=([0-9]+)")?,
        })
    }

    fn capture<'t>(re: &Regex, line: &'t str) -> Option<&'t str> {
        re.captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    fn number<T: std::str::FromStr>(re: &Regex, line: &str) -> Option<T> {
        Self::capture(re, line).and_then(|s| s.parse().ok())
    }

    /// Parse one record's lines. Missing fields stay absent; a failed FCS suppresses body fields.
    pub fn parse_record<S: AsRef<str>>(&self, lines: &[S], layout: Layout) -> FrameRecord {
        let mut frame = FrameRecord {
            index: 1,
            ..Default::default()
        };
        let first = lines.first().map(|l| l.as_ref()).unwrap_or("");
        if let Some(ind) = Self::number(&self.index, first) {
            frame.index = ind;
        }
        if layout.has_header() {
            frame.offset = Self::number(&self.offset, first).unwrap_or(0.0);
            frame.size = Self::number(&self.size, first).unwrap_or(0);
            frame.bandwidth = Self::capture(&self.bandwidth, first).map(str::to_string);
            frame.mcs = Self::capture(&self.mcs, first).map(str::to_string);
        }
        if layout.has_body() {
            let body = lines
                .get(layout.body_line())
                .map(|l| l.as_ref())
                .unwrap_or("");
            frame.correct = !self.fcs_fail.is_match(body);
            if frame.correct {
                self.parse_body(body, &mut frame);
            }
        }
        frame
    }

    fn parse_body(&self, body: &str, frame: &mut FrameRecord) {
        frame.frame_type = Self::capture(&self.frame_type, body).map(str::to_string);
        frame.ssid = Self::capture(&self.ssid, body).map(str::to_string);
        frame.transmitter = Self::capture(&self.ta, body).and_then(|s| s.parse::<MacAddr>().ok());
        frame.receiver = Self::capture(&self.ra, body).and_then(|s| s.parse::<MacAddr>().ok());
        frame.more_fragments = Self::number::<u32>(&self.more_frags, body).map(|v| v > 0);
        frame.seq_num = Self::number(&self.seq_num, body);
        frame.frag_num = Self::number(&self.frag_num, body);
    }

    /// Parse every record from `reader`.
    pub fn read_frames<R: BufRead>(
        &self,
        reader: R,
        layout: Layout,
    ) -> Result<Vec<FrameRecord>, ReadError> {
        let mut out = Vec::new();
        for record in RecordLines::new(reader, layout) {
            out.push(self.parse_record(&record?, layout));
        }
        Ok(out)
    }

    pub fn read_file(&self, path: &Path, layout: Layout) -> Result<Vec<FrameRecord>, ReadError> {
        let reader = open(path)?;
        let frames = self.read_frames(reader, layout)?;
        tracing::info!(path = %path.display(), frames = frames.len(), "parsed capture");
        Ok(frames)
    }

    /// Read a `*_phy.log` / `*_parser.log` pair and merge them by index.
    pub fn read_separated(
        &self,
        header_path: &Path,
        body_path: &Path,
    ) -> Result<Vec<FrameRecord>, ReadError> {
        let headers = self.read_file(header_path, Layout::HeaderOnly)?;
        let bodies = self.read_file(body_path, Layout::BodyOnly)?;
        Ok(merge_separated(&headers, bodies))
    }
}

/// Open a capture file for buffered reading.
pub fn open(path: &Path) -> Result<BufReader<File>, ReadError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ReadError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Groups non-blank lines into records of `layout.lines_per_record()` lines.
/// Yields `Truncated` once if input ends mid-record.
pub struct RecordLines<R> {
    lines: std::io::Lines<R>,
    expected: usize,
    done: bool,
}

impl<R: BufRead> RecordLines<R> {
    pub fn new(reader: R, layout: Layout) -> Self {
        Self {
            lines: reader.lines(),
            expected: layout.lines_per_record(),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for RecordLines<R> {
    type Item = Result<Vec<String>, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut record = Vec::with_capacity(self.expected);
        loop {
            match self.lines.next() {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    record.push(line);
                    if record.len() == self.expected {
                        return Some(Ok(record));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(ReadError::Io(e)));
                }
                None => {
                    self.done = true;
                    if record.is_empty() {
                        return None;
                    }
                    return Some(Err(ReadError::Truncated {
                        got: record.len(),
                        expected: self.expected,
                    }));
                }
            }
        }
    }
}
