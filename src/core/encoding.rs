/// Text encodings the bot can emit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Latin1,
}

impl Encoding {
    /// Maps a rule recode hint to an encoding, `None` for unknown names.
    pub fn from_hint(hint: &str) -> Option<Encoding> {
        match hint.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Encoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Some(Encoding::Latin1),
            _ => None,
        }
    }

    /// Characters outside of the target encoding are replaced with '?'.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match *self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| if (c as u32) < 0x100 { c as u32 as u8 } else { b'?' })
                .collect(),
        }
    }
}

/// Decodes a line received from a server: UTF-8 when valid, Latin-1
/// otherwise.
pub fn decode_line(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
