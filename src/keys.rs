//! Key names to the bytes a terminal would send.

/// Bytes for a named key, or the token itself when it names no key.
///
/// Names are case-insensitive: `up`, `down`, `left`, `right`, `home`,
/// `end`, `pgup`/`pageup`, `pgdn`/`pagedown`, `enter`/`return`, `tab`,
/// `esc`/`escape`, `backspace`, `delete`, `insert`, `space`, `f1`..`f12`
/// and `ctrl-a`..`ctrl-z`.
pub fn parse_key(token: &str) -> Vec<u8> {
    let lower = token.to_ascii_lowercase();
    if let Some(bytes) = named_key(&lower) {
        return bytes.to_vec();
    }
    if let Some(byte) = ctrl_key(&lower) {
        return vec![byte];
    }
    token.as_bytes().to_vec()
}

/// Split a space-separated key specification into tokens
pub fn split_keys(spec: &str) -> impl Iterator<Item = &str> {
    spec.split(' ').filter(|token| !token.is_empty())
}

fn named_key(name: &str) -> Option<&'static [u8]> {
    let bytes: &'static [u8] = match name {
        "up" => b"\x1b[A",
        "down" => b"\x1b[B",
        "right" => b"\x1b[C",
        "left" => b"\x1b[D",
        "home" => b"\x1b[H",
        "end" => b"\x1b[F",
        "pgup" | "pageup" => b"\x1b[5~",
        "pgdn" | "pagedown" => b"\x1b[6~",
        "insert" => b"\x1b[2~",
        "delete" => b"\x1b[3~",
        "enter" | "return" => b"\r",
        "tab" => b"\t",
        "esc" | "escape" => b"\x1b",
        "backspace" => b"\x7f",
        "space" => b" ",
        "f1" => b"\x1bOP",
        "f2" => b"\x1bOQ",
        "f3" => b"\x1bOR",
        "f4" => b"\x1bOS",
        "f5" => b"\x1b[15~",
        "f6" => b"\x1b[17~",
        "f7" => b"\x1b[18~",
        "f8" => b"\x1b[19~",
        "f9" => b"\x1b[20~",
        "f10" => b"\x1b[21~",
        "f11" => b"\x1b[23~",
        "f12" => b"\x1b[24~",
        _ => return None,
    };
    Some(bytes)
}

/// `ctrl-a` .. `ctrl-z` to 0x01 .. 0x1a
fn ctrl_key(name: &str) -> Option<u8> {
    let rest = name.strip_prefix("ctrl-")?;
    match rest.as_bytes() {
        [letter @ b'a'..=b'z'] => Some(letter - b'a' + 1),
        _ => None,
    }
}
