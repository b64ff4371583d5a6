//! Lossless string encoding for filesystem paths.
//!
//! `Path::to_string_lossy` replaces invalid UTF-8 byte sequences with
//! U+FFFD, which is lossy by definition: two distinct non-UTF-8 paths can
//! collide on the same replacement string. Since `MetaData.path` is
//! specified as a UTF-8 string but must never drop a path for encoding
//! reasons (spec.md §4.C), invalid bytes are instead percent-encoded
//! (`%XX`), and any literal `%` already present is escaped the same way so
//! the encoding stays unambiguous and reversible.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Encode `path` as a UTF-8 `String`, percent-encoding any byte that is not
/// part of a valid UTF-8 sequence (and any literal `%`) so the original
/// bytes can always be recovered with [`decode_path_lossless`].
pub fn encode_path_lossless(path: &Path) -> String {
    let mut rest = path.as_os_str().as_bytes();
    let mut out = String::with_capacity(rest.len());

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                escape_percent(valid, &mut out);
                break;
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                // `from_utf8` already validated this prefix.
                let valid = std::str::from_utf8(&rest[..valid_up_to]).unwrap();
                escape_percent(valid, &mut out);

                let bad_len = e.error_len().unwrap_or(rest.len() - valid_up_to).max(1);
                for b in &rest[valid_up_to..valid_up_to + bad_len] {
                    out.push_str(&format!("%{b:02X}"));
                }
                rest = &rest[valid_up_to + bad_len..];
            }
        }
    }

    out
}

fn escape_percent(s: &str, out: &mut String) {
    for c in s.chars() {
        if c == '%' {
            out.push_str("%25");
        } else {
            out.push(c);
        }
    }
}

/// Inverse of [`encode_path_lossless`]: recovers the original `PathBuf` from
/// its percent-encoded string form.
pub fn decode_path_lossless(encoded: &str) -> PathBuf {
    let input = encoded.as_bytes();
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' && i + 2 < input.len() {
            if let Some(byte) = std::str::from_utf8(&input[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(out))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn valid_utf8_path_round_trips_unchanged() {
        let path = Path::new("/tmp/carve/plain-name.txt");
        let encoded = encode_path_lossless(path);
        assert_eq!(encoded, "/tmp/carve/plain-name.txt");
        assert_eq!(decode_path_lossless(&encoded), path);
    }

    #[test]
    fn literal_percent_sign_is_escaped_and_recovered() {
        let path = Path::new("/tmp/100%done.txt");
        let encoded = encode_path_lossless(path);
        assert!(!encoded.contains("%done"), "bare % must be escaped");
        assert_eq!(decode_path_lossless(&encoded), path);
    }

    #[test]
    fn invalid_utf8_bytes_round_trip_and_do_not_collide() {
        let mut bytes_a = b"/tmp/bad-".to_vec();
        bytes_a.push(0xFF);
        bytes_a.extend_from_slice(b"-a");
        let path_a = PathBuf::from(std::ffi::OsStr::from_bytes(&bytes_a));

        let mut bytes_b = b"/tmp/bad-".to_vec();
        bytes_b.push(0xFE);
        bytes_b.extend_from_slice(b"-a");
        let path_b = PathBuf::from(std::ffi::OsStr::from_bytes(&bytes_b));

        let encoded_a = encode_path_lossless(&path_a);
        let encoded_b = encode_path_lossless(&path_b);
        assert_ne!(encoded_a, encoded_b, "distinct non-UTF-8 paths must not collide");
        assert_eq!(decode_path_lossless(&encoded_a), path_a);
        assert_eq!(decode_path_lossless(&encoded_b), path_b);
    }
}
