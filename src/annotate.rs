//! Overlay rendering for annotated streams.
//!
//! Boxes are drawn as 2px outlines coloured by class, with a small label bar
//! above each box showing the class id and confidence. Labels use a built-in
//! 5x7 bitmap font so no font files are needed at runtime.

use image::{Rgb, RgbImage};

use crate::detect::Detection;
use crate::frame::Frame;

const PALETTE: [Rgb<u8>; 6] = [
    Rgb([0, 255, 0]),
    Rgb([255, 64, 64]),
    Rgb([64, 160, 255]),
    Rgb([255, 200, 0]),
    Rgb([200, 64, 255]),
    Rgb([0, 220, 220]),
];
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const GLYPH_ADVANCE: i32 = 6;
const LABEL_HEIGHT: i32 = 9;

pub fn class_color(class_id: u32) -> Rgb<u8> {
    PALETTE[class_id as usize % PALETTE.len()]
}

/// Draw every detection onto a copy of the frame.
pub fn annotate_frame(frame: &Frame, detections: &[Detection]) -> RgbImage {
    let mut image = frame.to_image();
    if image.width() == 0 || image.height() == 0 {
        return image;
    }
    let max_x = (image.width() - 1) as f32;
    let max_y = (image.height() - 1) as f32;

    for detection in detections {
        let color = class_color(detection.class_id);
        let left = detection.bbox.x1.clamp(0.0, max_x).round() as i32;
        let top = detection.bbox.y1.clamp(0.0, max_y).round() as i32;
        let right = detection.bbox.x2.clamp(0.0, max_x).round() as i32;
        let bottom = detection.bbox.y2.clamp(0.0, max_y).round() as i32;
        draw_rectangle(&mut image, left, top, right, bottom, color);
        draw_rectangle(&mut image, left + 1, top + 1, right - 1, bottom - 1, color);

        let label = format!(
            "{} {:.0}%",
            detection.class_id,
            detection.confidence.clamp(0.0, 1.0) * 100.0
        );
        let label_y = (top - LABEL_HEIGHT).max(0);
        let label_width = label.chars().count() as i32 * GLYPH_ADVANCE + 2;
        fill_rect(
            &mut image,
            left,
            label_y,
            left + label_width,
            label_y + LABEL_HEIGHT - 1,
            LABEL_BACKGROUND,
        );
        draw_label(&mut image, left + 1, label_y + 1, &label, color);
    }

    image
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if right < left || bottom < top {
        return;
    }
    for x in left..=right {
        put(image, x, top, color);
        put(image, x, bottom, color);
    }
    for y in top..=bottom {
        put(image, left, y, color);
        put(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    for y in top..=bottom {
        for x in left..=right {
            put(image, x, y, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars() {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put(image, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        '%' => Some([0b11000, 0b11001, 0b00010, 0b00100, 0b01000, 0b10011, 0b00011]),
        '.' => Some([0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::BoundingBox;

    fn black_frame(width: u32, height: u32) -> Frame {
        Frame::from_rgb(vec![0u8; (width * height * 3) as usize], width, height, 1).unwrap()
    }

    #[test]
    fn draws_box_outline_without_touching_source() {
        let frame = black_frame(100, 100);
        let detections = vec![Detection {
            class_id: 0,
            confidence: 0.87,
            bbox: BoundingBox::new(20.0, 30.0, 60.0, 80.0),
        }];

        let annotated = annotate_frame(&frame, &detections);

        assert_eq!(*annotated.get_pixel(40, 80), class_color(0));
        assert_eq!(*annotated.get_pixel(20, 50), class_color(0));
        assert_eq!(*annotated.get_pixel(40, 55), Rgb([0, 0, 0]));
        assert!(frame.pixels().iter().all(|&p| p == 0));
    }

    #[test]
    fn clamps_boxes_outside_the_frame() {
        let frame = black_frame(10, 10);
        let detections = vec![Detection {
            class_id: 1,
            confidence: 2.0,
            bbox: BoundingBox::new(-50.0, -50.0, 500.0, 500.0),
        }];
        let annotated = annotate_frame(&frame, &detections);
        assert_eq!(*annotated.get_pixel(9, 9), class_color(1));
    }

    #[test]
    fn no_detections_leaves_pixels_unchanged() {
        let frame = black_frame(8, 8);
        let annotated = annotate_frame(&frame, &[]);
        assert_eq!(annotated.as_raw(), frame.pixels());
    }
}
