use anyhow::{Context, Result};

/// How byte strings cross the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteMode {
    #[default]
    Text,
    Hex,
}

impl ByteMode {
    pub fn from_flag(hex: bool) -> Self {
        if hex {
            ByteMode::Hex
        } else {
            ByteMode::Text
        }
    }

    pub fn parse(self, input: &str) -> Result<Vec<u8>> {
        match self {
            ByteMode::Text => Ok(input.as_bytes().to_vec()),
            ByteMode::Hex => decode_hex(input),
        }
    }

    /// Text mode falls back to escaped output for non-UTF-8 bytes.
    pub fn render(self, bytes: &[u8]) -> String {
        match self {
            ByteMode::Hex => encode_hex(bytes),
            ByteMode::Text => match std::str::from_utf8(bytes) {
                Ok(s) => s.to_string(),
                Err(_) => bytes.escape_ascii().to_string(),
            },
        }
    }
}

pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn decode_hex(input: &str) -> Result<Vec<u8>> {
    let input = input.trim();
    hex::decode(input).with_context(|| format!("invalid hex string: {}", input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        assert_eq!(encode_hex(&[0, 0xAB, 0x10]), "00ab10");
        assert_eq!(decode_hex("00AB10").unwrap(), vec![0, 0xAB, 0x10]);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn test_non_ascii_hex_input_is_an_error() {
        assert!(decode_hex("aéb").is_err());
        assert!(decode_hex("éé").is_err());
        assert!(ByteMode::Hex.parse("ünï").is_err());
    }

    #[test]
    fn test_text_render_escapes_binary() {
        assert_eq!(ByteMode::Text.render(b"plain"), "plain");
        assert_eq!(ByteMode::Text.render(&[0xFF, b'a']), "\\xffa");
        assert_eq!(ByteMode::Hex.render(b"a"), "61");
    }
}
