//! Line reading for the text inputs. Lines that are not valid UTF-8 are logged and passed
//! over instead of failing the whole file.

use crate::error::Result;
use std::io::BufRead;
use tracing::warn;

/// Calls `visit` with the 1-based number and text of each decodable line, trailing `\n` or
/// `\r\n` removed. Returns how many lines were passed over.
pub(crate) fn for_each_line<R: BufRead>(
    mut reader: R,
    source: &str,
    mut visit: impl FnMut(usize, &str),
) -> Result<usize> {
    let mut buf = Vec::new();
    let mut lineno = 0;
    let mut undecodable = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        lineno += 1;
        let raw: &[u8] = &buf;
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        match std::str::from_utf8(raw) {
            Ok(line) => visit(lineno, line),
            Err(err) => {
                warn!(source, line = lineno, %err, "skipping line that is not valid UTF-8");
                undecodable += 1;
            }
        }
    }
    Ok(undecodable)
}
