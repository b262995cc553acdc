//! Recover the embedded generation-parameter text from an image file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{GencatError, MetadataError, Result};

const PARAMETERS_KEYWORD: &str = "parameters";

/// Read the generation-parameter text embedded in `path`.
///
/// PNG files carry it in a `parameters` text chunk, JPEG and WebP files in
/// the EXIF `UserComment` tag. Returns `MetadataError::MissingText` when
/// the file has neither.
pub fn read_embedded_text(path: &Path) -> Result<String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let text = match extension.as_str() {
        "png" => match png_parameters(path)? {
            Some(text) => Some(text),
            // Some tools store the comment in an eXIf chunk instead
            None => exif_user_comment(path)?,
        },
        _ => exif_user_comment(path)?,
    };

    text.filter(|t| !t.trim().is_empty())
        .ok_or(GencatError::Metadata(MetadataError::MissingText))
}

fn png_parameters(path: &Path) -> Result<Option<String>> {
    let file = File::open(path)?;
    let decoder = png::Decoder::new(BufReader::new(file));
    let reader = decoder
        .read_info()
        .map_err(|e| MetadataError::format(format!("png: {}", e)))?;
    let info = reader.info();

    let matches = |keyword: &str| keyword.eq_ignore_ascii_case(PARAMETERS_KEYWORD);

    if let Some(chunk) = info.uncompressed_latin1_text.iter().find(|c| matches(&c.keyword)) {
        return Ok(Some(chunk.text.clone()));
    }
    if let Some(chunk) = info.compressed_latin1_text.iter().find(|c| matches(&c.keyword)) {
        let text = chunk
            .get_text()
            .map_err(|e| MetadataError::format(format!("png zTXt: {}", e)))?;
        return Ok(Some(text));
    }
    if let Some(chunk) = info.utf8_text.iter().find(|c| matches(&c.keyword)) {
        let text = chunk
            .get_text()
            .map_err(|e| MetadataError::format(format!("png iTXt: {}", e)))?;
        return Ok(Some(text));
    }
    Ok(None)
}

fn exif_user_comment(path: &Path) -> Result<Option<String>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(exif::Error::Io(e)) => return Err(e.into()),
        Err(e) => {
            log::debug!("no EXIF in {}: {}", path.display(), e);
            return Ok(None);
        }
    };

    let field = match exif.get_field(exif::Tag::UserComment, exif::In::PRIMARY) {
        Some(field) => field,
        None => return Ok(None),
    };
    match &field.value {
        exif::Value::Undefined(bytes, _) => Ok(decode_user_comment(bytes)),
        exif::Value::Ascii(parts) => Ok(parts
            .first()
            .map(|p| String::from_utf8_lossy(p).trim_end_matches('\0').to_string())),
        other => {
            log::debug!("unexpected UserComment value in {}: {:?}", path.display(), other);
            Ok(None)
        }
    }
}

/// Decode an EXIF `UserComment`: an 8-byte character-code prefix followed by the text.
pub fn decode_user_comment(bytes: &[u8]) -> Option<String> {
    let (prefix, body) = if bytes.len() >= 8 { bytes.split_at(8) } else { (bytes, &[][..]) };

    let text = match prefix {
        b"ASCII\0\0\0" | b"\0\0\0\0\0\0\0\0" => String::from_utf8_lossy(body).into_owned(),
        b"UNICODE\0" => decode_utf16(body),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    };

    let text = text.trim_end_matches('\0').to_string();
    (!text.is_empty()).then_some(text)
}

/// UTF-16 with byte order from a BOM, otherwise guessed from where the zero bytes sit.
fn decode_utf16(body: &[u8]) -> String {
    let (big_endian, body) = match body {
        [0xFE, 0xFF, rest @ ..] => (true, rest),
        [0xFF, 0xFE, rest @ ..] => (false, rest),
        _ => {
            let even_zeros = body.iter().step_by(2).filter(|&&b| b == 0).count();
            let odd_zeros = body.iter().skip(1).step_by(2).filter(|&&b| b == 0).count();
            (even_zeros > odd_zeros, body)
        }
    };

    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::BufWriter;
    use tempfile::TempDir;

    /// Write a tiny RGB PNG, optionally carrying a `parameters` tEXt chunk.
    pub(crate) fn write_png(path: &Path, parameters: Option<&str>) {
        let file = File::create(path).unwrap();
        let mut encoder = png::Encoder::new(BufWriter::new(file), 4, 3);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        if let Some(text) = parameters {
            encoder
                .add_text_chunk("parameters".to_string(), text.to_string())
                .unwrap();
        }
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(&[128u8; 4 * 3 * 3]).unwrap();
    }

    #[test]
    fn test_png_parameters_chunk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.png");
        write_png(&path, Some("a cat\nSteps: 20, Seed: 1"));

        let text = read_embedded_text(&path).unwrap();
        assert_eq!(text, "a cat\nSteps: 20, Seed: 1");
    }

    #[test]
    fn test_png_itxt_chunk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("b.png");
        let file = File::create(&path).unwrap();
        let mut encoder = png::Encoder::new(BufWriter::new(file), 1, 1);
        encoder.set_color(png::ColorType::Grayscale);
        encoder
            .add_itxt_chunk("Parameters".to_string(), "ünïcode prompt".to_string())
            .unwrap();
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(&[0u8]).unwrap();
        drop(writer);

        assert_eq!(read_embedded_text(&path).unwrap(), "ünïcode prompt");
    }

    #[test]
    fn test_png_without_text_is_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plain.png");
        write_png(&path, None);

        let err = read_embedded_text(&path).unwrap_err();
        assert!(matches!(err, GencatError::Metadata(MetadataError::MissingText)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = read_embedded_text(Path::new("/nonexistent/x.png")).unwrap_err();
        assert!(matches!(err, GencatError::Io(_)));
    }

    #[test]
    fn test_decode_user_comment_ascii() {
        let mut bytes = b"ASCII\0\0\0".to_vec();
        bytes.extend_from_slice(b"a dog\0\0");
        assert_eq!(decode_user_comment(&bytes).as_deref(), Some("a dog"));
    }

    #[test]
    fn test_decode_user_comment_unicode() {
        let mut be = b"UNICODE\0".to_vec();
        be.extend("hi".encode_utf16().flat_map(|u| u.to_be_bytes()));
        assert_eq!(decode_user_comment(&be).as_deref(), Some("hi"));

        let mut le = b"UNICODE\0".to_vec();
        le.extend("hey".encode_utf16().flat_map(|u| u.to_le_bytes()));
        assert_eq!(decode_user_comment(&le).as_deref(), Some("hey"));

        let mut bom = b"UNICODE\0".to_vec();
        bom.extend_from_slice(&[0xFF, 0xFE]);
        bom.extend("x".encode_utf16().flat_map(|u| u.to_le_bytes()));
        assert_eq!(decode_user_comment(&bom).as_deref(), Some("x"));
    }

    #[test]
    fn test_decode_user_comment_undefined_and_empty() {
        let mut bytes = vec![0u8; 8];
        bytes.extend_from_slice("Steps: 1".as_bytes());
        assert_eq!(decode_user_comment(&bytes).as_deref(), Some("Steps: 1"));
        assert_eq!(decode_user_comment(b"ASCII\0\0\0"), None);
    }
}
