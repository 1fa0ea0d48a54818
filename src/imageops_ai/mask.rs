use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::map::map_colors;

/// Paint `color` wherever the 0/1 mask is set, black elsewhere.
pub fn colorize(mask: &GrayImage, color: Rgb<u8>) -> RgbImage {
    map_colors(mask, |Luma([value])| {
        if value > 0 {
            color
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// Scale a 0/1 mask to 0/255 and replicate it over three channels.
pub fn to_rgb(mask: &GrayImage) -> RgbImage {
    map_colors(mask, |Luma([value])| {
        let v = if value > 0 { u8::MAX } else { 0 };
        Rgb([v, v, v])
    })
}
