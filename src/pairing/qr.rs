//! QR rendering for session payloads.

use crate::{Result, StationError};
use base64::Engine;
use qrcode::render::{svg, unicode};
use qrcode::QrCode;

/// Turns a QR payload into image bytes.
pub trait QrEncoder: Send + Sync {
    /// MIME type of the bytes produced by [`QrEncoder::encode`].
    fn content_type(&self) -> &'static str;

    fn encode(&self, payload: &str) -> Result<Vec<u8>>;

    /// `data:` URI suitable for an `<img src=...>` on the station screen.
    fn data_uri(&self, payload: &str) -> Result<String> {
        let bytes = self.encode(payload)?;
        Ok(format!(
            "data:{};base64,{}",
            self.content_type(),
            base64::engine::general_purpose::STANDARD.encode(bytes)
        ))
    }
}

/// SVG encoder.
#[derive(Debug, Clone)]
pub struct SvgQrEncoder {
    min_size: u32,
}

impl SvgQrEncoder {
    pub fn new(min_size: u32) -> Self {
        Self { min_size }
    }
}

impl Default for SvgQrEncoder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl QrEncoder for SvgQrEncoder {
    fn content_type(&self) -> &'static str {
        "image/svg+xml"
    }

    fn encode(&self, payload: &str) -> Result<Vec<u8>> {
        let code = QrCode::new(payload.as_bytes()).map_err(|e| StationError::Qr(e.to_string()))?;
        let image = code
            .render::<svg::Color>()
            .min_dimensions(self.min_size, self.min_size)
            .build();
        Ok(image.into_bytes())
    }
}

/// Render a payload as half-block characters for a terminal.
pub fn render_terminal(payload: &str) -> Result<String> {
    let code = QrCode::new(payload.as_bytes()).map_err(|e| StationError::Qr(e.to_string()))?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}
