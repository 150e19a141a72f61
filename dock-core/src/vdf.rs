//! Binary VDF codec for the game library's shortcut database.
//!
//! The format is a nested key/typed-value map with single-byte type markers
//! and no length prefixes: 0x00 opens a nested object, 0x01 is a
//! NUL-terminated UTF-8 string, 0x02 a little-endian u32, 0x08 ends the
//! current object. Every value's end is discovered by scanning, so parsing
//! is a recursive-descent reader over a byte slice with an explicit cursor
//! and a bounds check before every read.

use sha2::{Digest, Sha256};

const TYPE_OBJECT: u8 = 0x00;
const TYPE_STRING: u8 = 0x01;
const TYPE_INT: u8 = 0x02;
const TYPE_END: u8 = 0x08;

const ROOT_KEY: &str = "shortcuts";

/// One shortcut entry. Fields the codec does not model are retained in
/// `extra` in original order and re-emitted on write, so foreign fields
/// survive a round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Shortcut {
    pub app_id: u32,
    pub app_name: String,
    pub exe: String,
    pub start_dir: String,
    pub launch_options: String,
    pub last_play_time: u32,
    pub tags: Vec<String>,
    pub extra: Vec<(String, VdfValue)>,
}

/// A raw value for fields outside the modeled set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VdfValue {
    Int(u32),
    Str(String),
    Obj(Vec<(String, VdfValue)>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VdfError {
    #[error("truncated input at byte {at}")]
    Truncated { at: usize },
    #[error("string missing NUL terminator at byte {at}")]
    UnterminatedString { at: usize },
    #[error("invalid UTF-8 in string at byte {at}")]
    InvalidUtf8 { at: usize },
    #[error("unknown type marker 0x{marker:02x} at byte {at}")]
    UnknownType { marker: u8, at: usize },
    #[error("root object is not \"{ROOT_KEY}\"")]
    BadRoot,
}

/// Derive the numeric app id for a created shortcut: a pure function of
/// (executable path, display name), with the high bit set to mark the entry
/// as non-native. Identical inputs always reproduce the identical id, which
/// is what duplicate detection relies on.
pub fn derive_app_id(exe: &str, app_name: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(exe.as_bytes());
    hasher.update(app_name.as_bytes());
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) | 0x8000_0000
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, VdfError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(VdfError::Truncated { at: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn string(&mut self) -> Result<String, VdfError> {
        let start = self.pos;
        let nul = self.buf[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(VdfError::UnterminatedString { at: start })?;
        let s = std::str::from_utf8(&self.buf[start..start + nul])
            .map_err(|_| VdfError::InvalidUtf8 { at: start })?
            .to_string();
        self.pos = start + nul + 1;
        Ok(s)
    }

    fn u32_le(&mut self) -> Result<u32, VdfError> {
        if self.pos + 4 > self.buf.len() {
            return Err(VdfError::Truncated { at: self.pos });
        }
        let v = u32::from_le_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    /// Parse one value of the given type, recursing into nested objects.
    fn value(&mut self, marker: u8) -> Result<VdfValue, VdfError> {
        match marker {
            TYPE_STRING => Ok(VdfValue::Str(self.string()?)),
            TYPE_INT => Ok(VdfValue::Int(self.u32_le()?)),
            TYPE_OBJECT => {
                let mut entries = Vec::new();
                loop {
                    let t = self.byte()?;
                    if t == TYPE_END {
                        return Ok(VdfValue::Obj(entries));
                    }
                    let key = self.string()?;
                    entries.push((key, self.value(t)?));
                }
            }
            other => Err(VdfError::UnknownType {
                marker: other,
                at: self.pos - 1,
            }),
        }
    }
}

/// Parse a shortcut database. Unrecognized fields are consumed type-driven
/// and retained raw; unknown or future fields never abort parsing.
pub fn parse_shortcuts(bytes: &[u8]) -> Result<Vec<Shortcut>, VdfError> {
    let mut r = Reader::new(bytes);
    if r.byte()? != TYPE_OBJECT {
        return Err(VdfError::BadRoot);
    }
    if !r.string()?.eq_ignore_ascii_case(ROOT_KEY) {
        return Err(VdfError::BadRoot);
    }
    let mut shortcuts = Vec::new();
    loop {
        let t = r.byte()?;
        if t == TYPE_END {
            break;
        }
        if t != TYPE_OBJECT {
            return Err(VdfError::UnknownType {
                marker: t,
                at: r.pos - 1,
            });
        }
        // Positional index key; the position itself is what orders entries.
        let _index = r.string()?;
        shortcuts.push(parse_entry(&mut r)?);
    }
    // Trailing end-of-root marker; tolerated if absent.
    if r.peek() == Some(TYPE_END) {
        r.pos += 1;
    }
    Ok(shortcuts)
}

fn parse_entry(r: &mut Reader<'_>) -> Result<Shortcut, VdfError> {
    let mut sc = Shortcut::default();
    loop {
        let t = r.byte()?;
        if t == TYPE_END {
            return Ok(sc);
        }
        let key = r.string()?;
        match (key.to_ascii_lowercase().as_str(), t) {
            ("appid", TYPE_INT) => sc.app_id = r.u32_le()?,
            ("appname", TYPE_STRING) => sc.app_name = r.string()?,
            ("exe", TYPE_STRING) => sc.exe = r.string()?,
            ("startdir", TYPE_STRING) => sc.start_dir = r.string()?,
            ("launchoptions", TYPE_STRING) => sc.launch_options = r.string()?,
            ("lastplaytime", TYPE_INT) => sc.last_play_time = r.u32_le()?,
            ("tags", TYPE_OBJECT) => {
                // Positionally keyed object of strings, flattened to an
                // ordered list.
                match r.value(TYPE_OBJECT)? {
                    VdfValue::Obj(entries) => {
                        for (_k, v) in entries {
                            if let VdfValue::Str(s) = v {
                                sc.tags.push(s);
                            }
                        }
                    }
                    _ => unreachable!("TYPE_OBJECT parses to Obj"),
                }
            }
            _ => sc.extra.push((key, r.value(t)?)),
        }
    }
}

/// Serialize shortcuts back to the binary format. Entry and tag keys are
/// renumbered positionally ("0", "1", ...). Note: a hand-edited database
/// with sparse tag keys gets renumbered here; order is preserved, keys are
/// not, which other consumers of the file may not expect.
pub fn write_shortcuts(shortcuts: &[Shortcut]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(TYPE_OBJECT);
    push_string(&mut out, ROOT_KEY);
    for (i, sc) in shortcuts.iter().enumerate() {
        out.push(TYPE_OBJECT);
        push_string(&mut out, &i.to_string());
        push_int_field(&mut out, "appid", sc.app_id);
        push_str_field(&mut out, "AppName", &sc.app_name);
        push_str_field(&mut out, "Exe", &sc.exe);
        push_str_field(&mut out, "StartDir", &sc.start_dir);
        push_str_field(&mut out, "LaunchOptions", &sc.launch_options);
        push_int_field(&mut out, "LastPlayTime", sc.last_play_time);
        for (key, value) in &sc.extra {
            push_value(&mut out, key, value);
        }
        out.push(TYPE_OBJECT);
        push_string(&mut out, "tags");
        for (j, tag) in sc.tags.iter().enumerate() {
            push_str_field(&mut out, &j.to_string(), tag);
        }
        out.push(TYPE_END); // tags
        out.push(TYPE_END); // entry
    }
    out.push(TYPE_END); // shortcuts
    out.push(TYPE_END); // root
    out
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn push_str_field(out: &mut Vec<u8>, key: &str, value: &str) {
    out.push(TYPE_STRING);
    push_string(out, key);
    push_string(out, value);
}

fn push_int_field(out: &mut Vec<u8>, key: &str, value: u32) {
    out.push(TYPE_INT);
    push_string(out, key);
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_value(out: &mut Vec<u8>, key: &str, value: &VdfValue) {
    match value {
        VdfValue::Str(s) => push_str_field(out, key, s),
        VdfValue::Int(v) => push_int_field(out, key, *v),
        VdfValue::Obj(entries) => {
            out.push(TYPE_OBJECT);
            push_string(out, key);
            for (k, v) in entries {
                push_value(out, k, v);
            }
            out.push(TYPE_END);
        }
    }
}
