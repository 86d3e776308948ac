use anyhow::Context;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// What gets persisted for a payload after the compression decision.
#[derive(Debug, Clone)]
pub struct CompressedPayload {
    pub bytes: Vec<u8>,
    pub size_original: i64,
    pub size_compressed: Option<i64>,
    pub compression_ratio: Option<f64>,
}

/// Compress `bytes` with deflate (zlib framing) when the original exceeds
/// `threshold`. Small payloads are stored as-is; compression is skipped when
/// it would not shrink the payload.
pub fn compress_payload(bytes: &[u8], threshold: usize) -> CompressedPayload {
    let size_original = bytes.len() as i64;

    if bytes.len() <= threshold {
        return CompressedPayload {
            bytes: bytes.to_vec(),
            size_original,
            size_compressed: None,
            compression_ratio: None,
        };
    }

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    let compressed = encoder
        .write_all(bytes)
        .and_then(|()| encoder.finish())
        .ok();

    match compressed {
        Some(out) if out.len() < bytes.len() => {
            let size_compressed = out.len() as i64;
            CompressedPayload {
                bytes: out,
                size_original,
                size_compressed: Some(size_compressed),
                compression_ratio: Some(size_compressed as f64 / size_original as f64),
            }
        }
        _ => CompressedPayload {
            bytes: bytes.to_vec(),
            size_original,
            size_compressed: None,
            compression_ratio: None,
        },
    }
}

/// Inverse of [`compress_payload`] for rows stored with a compressed size.
pub fn decompress_payload(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("decompress trace payload")?;
    Ok(out)
}

// ─── Content heuristics ─────────────────────────────────────────────────────

/// Media detection: any `*_url` field naming media, or a media-ish mime tag.
pub fn detect_media(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => map.iter().any(|(key, v)| {
            (key.ends_with("_url") && media_key(key)) || detect_media(v)
        }),
        serde_json::Value::Array(items) => items.iter().any(detect_media),
        _ => false,
    }
}

fn media_key(key: &str) -> bool {
    const MEDIA_PREFIXES: &[&str] = &["media", "image", "video", "audio", "thumbnail", "sticker", "document"];
    MEDIA_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// Base64 detection: a `data:` URI scheme anywhere in the serialized payload.
pub fn detect_base64(bytes: &[u8]) -> bool {
    // `data:<mime>;base64,`: scanning the raw bytes covers nested strings.
    bytes
        .windows(5)
        .any(|w| w == b"data:")
}
