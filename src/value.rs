//! A single attribute value as returned by the directory.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Image container recognized from a value's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Tiff,
    WebP,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Tiff => "image/tiff",
            ImageFormat::WebP => "image/webp",
        }
    }
}

/// What sniffing found out about an image value. Dimensions are filled in for
/// formats that store them in a fixed header position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

fn sniff_image(data: &[u8]) -> Option<ImageInfo> {
    let be32 = |at: usize| -> Option<u32> {
        data.get(at..at + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    };
    let le16 = |at: usize| -> Option<u32> {
        data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]) as u32)
    };
    let le32 = |at: usize| -> Option<u32> {
        data.get(at..at + 4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]).unsigned_abs())
    };

    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        // IHDR is always the first chunk.
        let has_ihdr = data.get(12..16) == Some(b"IHDR");
        return Some(ImageInfo {
            format: ImageFormat::Png,
            width: be32(16).filter(|_| has_ihdr),
            height: be32(20).filter(|_| has_ihdr),
        });
    }
    if data.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some(ImageInfo {
            format: ImageFormat::Jpeg,
            width: None,
            height: None,
        });
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some(ImageInfo {
            format: ImageFormat::Gif,
            width: le16(6),
            height: le16(8),
        });
    }
    if data.starts_with(b"BM") && data.len() >= 26 {
        return Some(ImageInfo {
            format: ImageFormat::Bmp,
            width: le32(18),
            height: le32(22),
        });
    }
    if data.starts_with(b"II*\0") || data.starts_with(b"MM\0*") {
        return Some(ImageInfo {
            format: ImageFormat::Tiff,
            width: None,
            height: None,
        });
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some(ImageInfo {
            format: ImageFormat::WebP,
            width: None,
            height: None,
        });
    }
    None
}

/// One raw attribute value.
///
/// The bytes are owned and independent of the connection that produced them.
/// String, base64 and image interpretations are derived on first use and
/// cached, including a negative answer.
#[derive(Clone, Default)]
pub struct BerValue {
    data: Vec<u8>,
    string: OnceLock<Option<String>>,
    base64: OnceLock<String>,
    image: OnceLock<Option<ImageInfo>>,
}

impl BerValue {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The value as text, if it is well-formed UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.string
            .get_or_init(|| std::str::from_utf8(&self.data).ok().map(str::to_string))
            .as_deref()
    }

    pub fn is_string(&self) -> bool {
        self.as_str().is_some()
    }

    pub fn as_base64(&self) -> &str {
        self.base64.get_or_init(|| STANDARD.encode(&self.data))
    }

    /// Image container information, if the value looks like a picture.
    pub fn as_image(&self) -> Option<ImageInfo> {
        *self.image.get_or_init(|| sniff_image(&self.data))
    }

    pub fn is_image(&self) -> bool {
        self.as_image().is_some()
    }
}

impl PartialEq for BerValue {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for BerValue {}

impl Hash for BerValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

impl fmt::Debug for BerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.debug_tuple("BerValue").field(&s).finish(),
            None => f
                .debug_struct("BerValue")
                .field("len", &self.data.len())
                .field("base64", &self.as_base64())
                .finish(),
        }
    }
}

/// Text when printable as UTF-8, base64 otherwise.
impl fmt::Display for BerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.write_str(s),
            None => f.write_str(self.as_base64()),
        }
    }
}

impl From<Vec<u8>> for BerValue {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for BerValue {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl From<&str> for BerValue {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

impl From<String> for BerValue {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&[8, 6, 0, 0, 0]);
        data
    }

    #[test]
    fn test_string_value() {
        let v = BerValue::from("cn=Barbara Jensen");
        assert_eq!(v.as_str(), Some("cn=Barbara Jensen"));
        assert!(v.is_string());
        assert!(!v.is_image());
        assert_eq!(v.to_string(), "cn=Barbara Jensen");
    }

    #[test]
    fn test_binary_value_has_no_string() {
        let v = BerValue::new(vec![0xff, 0x00, 0xfe]);
        assert_eq!(v.as_str(), None);
        assert_eq!(v.as_base64(), "/wD+");
        assert_eq!(v.to_string(), "/wD+");
    }

    #[test]
    fn test_base64_cached() {
        let v = BerValue::from("hello");
        let first = v.as_base64() as *const str;
        let second = v.as_base64() as *const str;
        assert_eq!(first, second);
        assert_eq!(v.as_base64(), "aGVsbG8=");
    }

    #[test]
    fn test_png_sniffing() {
        let v = BerValue::new(png_header(48, 32));
        let info = v.as_image().unwrap();
        assert_eq!(info.format, ImageFormat::Png);
        assert_eq!(info.width, Some(48));
        assert_eq!(info.height, Some(32));
        assert_eq!(info.format.mime_type(), "image/png");
        assert!(!v.is_string());
    }

    #[test]
    fn test_other_image_formats() {
        let jpeg = BerValue::new(vec![0xff, 0xd8, 0xff, 0xe0, 0, 16]);
        assert_eq!(jpeg.as_image().unwrap().format, ImageFormat::Jpeg);

        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[10, 0, 20, 0]);
        let gif = BerValue::new(gif);
        let info = gif.as_image().unwrap();
        assert_eq!((info.format, info.width, info.height), (ImageFormat::Gif, Some(10), Some(20)));

        let webp = BerValue::new(b"RIFF\x10\0\0\0WEBPVP8 ".to_vec());
        assert_eq!(webp.as_image().unwrap().format, ImageFormat::WebP);
    }

    #[test]
    fn test_not_an_image() {
        let v = BerValue::from("GIF");
        assert_eq!(v.as_image(), None);
        assert_eq!(v.as_image(), None);
        assert_eq!(BerValue::default().as_image(), None);
    }

    #[test]
    fn test_equality_by_bytes_and_independent_copy() {
        let a = BerValue::from("value");
        let _ = a.as_base64();
        let b = BerValue::new(b"value".to_vec());
        assert_eq!(a, b);
        let c = a.clone();
        assert_eq!(c, a);
        assert_ne!(c.as_bytes().as_ptr(), a.as_bytes().as_ptr());
        assert_ne!(a, BerValue::from("other"));
    }
}
