//! Response body decoding.
//!
//! The transport disables automatic decompression, so every body arrives
//! exactly as the server sent it. This module owns content-encoding:
//! gzip, deflate, and brotli are inflated here, and any decode failure
//! degrades to the raw bytes rather than erroring the whole request.

use std::io::Read;

/// Decode a response body according to its `Content-Encoding` header and
/// return it as text. Unknown encodings and decode failures fall back to
/// interpreting the raw bytes directly.
pub fn decode_body(raw: &[u8], content_encoding: Option<&str>) -> String {
    let encoding = content_encoding.unwrap_or("").trim().to_ascii_lowercase();

    let inflated = match encoding.as_str() {
        "" | "identity" => return bytes_to_text(raw),
        "gzip" => inflate(flate2::read::GzDecoder::new(raw)),
        "deflate" => inflate(flate2::read::ZlibDecoder::new(raw)),
        "br" => inflate(brotli::Decompressor::new(raw, 4096)),
        other => {
            log::debug!("unhandled content-encoding {other:?}, passing body through");
            return bytes_to_text(raw);
        }
    };

    match inflated {
        Ok(bytes) => bytes_to_text(&bytes),
        Err(error) => {
            log::warn!("failed to decode {encoding} body: {error}");
            bytes_to_text(raw)
        }
    }
}

fn inflate<R: Read>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// UTF-8 when valid, otherwise a latin-1 reinterpretation so no byte is
/// ever lost.
fn bytes_to_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&byte| byte as char).collect(),
    }
}
