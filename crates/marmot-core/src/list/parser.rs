use std::collections::BTreeMap;

use super::ListEntry;

/// Byte-at-a-time state machine decoding one listing entry at a time.
///
/// The wire format is line-oriented:
///
/// ```text
/// f"<escaped name>" <size> <mtime>[#k=v&k2=v2]\n
/// d"<escaped name>" 0 <mtime>[#k=v&k2=v2]\n
/// ```
///
/// Names escape `\` as `\\` and `"` as `\"`; all other bytes are literal,
/// so names may contain spaces, `#` and even newlines. Bytes before a
/// valid type byte are skipped, which lets the parser resynchronize on a
/// fresh line after garbage.
#[derive(Debug, Default)]
pub struct ListParser {
    state: State,
    is_dir: bool,
    name: Vec<u8>,
    num: Vec<u8>,
    size: i64,
    mtime: i64,
    key: Vec<u8>,
    value: Vec<u8>,
    extras: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Type,
    Quote,
    Name,
    NameEscape,
    Size,
    Mtime,
    ExtraKey,
    ExtraValue,
}

impl ListParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially decoded entry and wait for the next type byte.
    pub fn reset(&mut self) {
        *self = ListParser::default();
    }

    fn take_num(&mut self) -> i64 {
        let v = std::str::from_utf8(&self.num)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        self.num.clear();
        v
    }

    fn take_extra(&mut self) {
        if !self.key.is_empty() {
            let key = String::from_utf8_lossy(&self.key).into_owned();
            let value = String::from_utf8_lossy(&self.value).into_owned();
            self.extras.insert(key, value);
        }
        self.key.clear();
        self.value.clear();
    }

    fn emit(&mut self) -> ListEntry {
        let entry = ListEntry {
            is_dir: self.is_dir,
            name: String::from_utf8_lossy(&self.name).into_owned(),
            size: self.size,
            last_modified: self.mtime,
            extras: std::mem::take(&mut self.extras),
        };
        self.name.clear();
        self.size = 0;
        self.mtime = 0;
        self.state = State::Type;
        entry
    }

    /// Feed one byte; returns a complete entry when the terminating
    /// newline arrives. After an entry is returned the parser is ready
    /// for the next one.
    pub fn feed(&mut self, b: u8) -> Option<ListEntry> {
        match self.state {
            State::Type => {
                match b {
                    b'f' => {
                        self.is_dir = false;
                        self.state = State::Quote;
                    }
                    b'd' => {
                        self.is_dir = true;
                        self.state = State::Quote;
                    }
                    // Skip until something that looks like an entry.
                    _ => {}
                }
                None
            }
            State::Quote => {
                if b == b'"' {
                    self.name.clear();
                    self.state = State::Name;
                } else {
                    self.state = State::Type;
                }
                None
            }
            State::Name => {
                match b {
                    b'\\' => self.state = State::NameEscape,
                    b'"' => {
                        self.num.clear();
                        self.state = State::Size;
                    }
                    _ => self.name.push(b),
                }
                None
            }
            State::NameEscape => {
                self.name.push(b);
                self.state = State::Name;
                None
            }
            State::Size => {
                if b == b' ' {
                    // The space right after the closing quote has no
                    // digits accumulated yet; the next one ends the field.
                    if !self.num.is_empty() {
                        self.size = self.take_num();
                        self.state = State::Mtime;
                    }
                } else {
                    self.num.push(b);
                }
                None
            }
            State::Mtime => match b {
                b'#' => {
                    self.mtime = self.take_num();
                    self.key.clear();
                    self.value.clear();
                    self.state = State::ExtraKey;
                    None
                }
                b'\n' => {
                    self.mtime = self.take_num();
                    Some(self.emit())
                }
                _ => {
                    self.num.push(b);
                    None
                }
            },
            State::ExtraKey => match b {
                b'=' => {
                    self.state = State::ExtraValue;
                    None
                }
                b'&' => {
                    self.take_extra();
                    None
                }
                b'\n' => {
                    self.take_extra();
                    Some(self.emit())
                }
                _ => {
                    self.key.push(b);
                    None
                }
            },
            State::ExtraValue => match b {
                b'&' => {
                    self.take_extra();
                    self.state = State::ExtraKey;
                    None
                }
                b'\n' => {
                    self.take_extra();
                    Some(self.emit())
                }
                _ => {
                    self.value.push(b);
                    None
                }
            },
        }
    }
}

/// Feed a whole buffer, collecting every completed entry.
pub fn parse_all(parser: &mut ListParser, bytes: &[u8]) -> Vec<ListEntry> {
    bytes.iter().filter_map(|&b| parser.feed(b)).collect()
}
