//! QR rendering for the login flow: text → PNG data URL.

use base64::Engine;
use image::{ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use std::io::Cursor;

/// Minimum rendered edge length in pixels.
const QR_MIN_SIZE_PX: u32 = 300;

const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Render `text` as a QR code and return it as a `data:image/png` URL.
pub fn render_data_url(text: &str) -> anyhow::Result<String> {
    let code = QrCode::with_error_correction_level(text.as_bytes(), EcLevel::M)
        .map_err(|e| anyhow::anyhow!("QR encoding failed: {e}"))?;

    let image = code
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(QR_MIN_SIZE_PX, QR_MIN_SIZE_PX)
        .build();

    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

    let mut url = String::with_capacity(DATA_URL_PREFIX.len() + png.len() * 4 / 3 + 4);
    url.push_str(DATA_URL_PREFIX);
    base64::engine::general_purpose::STANDARD.encode_string(&png, &mut url);
    Ok(url)
}
