//! Burns a capture timestamp into a frame.

use chrono::{DateTime, TimeZone};

use crate::frame::RawFrame;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
/// Gap between the bottom of the text and the bottom of the frame.
const BOTTOM_MARGIN: u32 = 5;
const WHITE: [u8; 3] = [255, 255, 255];

/// 5x7 glyphs, one byte per row, bit 4 is the leftmost column.
fn glyph(c: char) -> Option<[u8; 7]> {
    let rows = match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        _ => return None,
    };
    Some(rows)
}

/// Glyph scale for a frame of the given height (2 at 480 rows).
pub fn scale_for_height(height: u32) -> u32 {
    (height / 240).max(1)
}

/// Draw `text` in white with its top-left corner at (`x`, `y`). Pixels
/// outside the frame are skipped. Characters without a glyph leave a gap.
pub fn draw_text(frame: &mut RawFrame, text: &str, x: u32, y: u32, scale: u32) {
    let advance = (GLYPH_WIDTH + 1) * scale;
    for (i, c) in text.chars().enumerate() {
        let Some(rows) = glyph(c) else { continue };
        let left = x + i as u32 * advance;
        if left >= frame.width {
            break;
        }
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                fill_block(
                    frame,
                    left + col * scale,
                    y + row as u32 * scale,
                    scale,
                );
            }
        }
    }
}

fn fill_block(frame: &mut RawFrame, x: u32, y: u32, size: u32) {
    for dy in 0..size {
        for dx in 0..size {
            if let Some(i) = frame.pixel_offset(x + dx, y + dy) {
                frame.data[i..i + 3].copy_from_slice(&WHITE);
            }
        }
    }
}

/// Stamp `at` into the bottom-left corner and record it on the frame.
pub fn stamp_timestamp<Tz>(frame: &mut RawFrame, at: &DateTime<Tz>)
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    frame.captured_at_ms = Some(at.timestamp_millis());
    if frame.is_empty() {
        return;
    }
    let scale = scale_for_height(frame.height);
    let text_height = GLYPH_HEIGHT * scale;
    let top = frame
        .height
        .saturating_sub(BOTTOM_MARGIN)
        .saturating_sub(text_height);
    let text = at.format(TIMESTAMP_FORMAT).to_string();
    draw_text(frame, &text, 0, top, scale);
}
