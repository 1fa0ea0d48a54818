use anyhow::{anyhow, ensure, Result};
use image::{ImageBuffer, Pixel, Primitive, Rgb};
use num_traits::AsPrimitive;

/// Pixel-wise weighted sum `first * alpha + second * beta`.
///
/// Integer channels are rounded to the nearest value and saturated to the
/// channel range; float channels are only clamped to `[0, 1]`.
pub fn add_weighted<S>(
    first: &ImageBuffer<Rgb<S>, Vec<S>>,
    alpha: f32,
    second: &ImageBuffer<Rgb<S>, Vec<S>>,
    beta: f32,
) -> Result<ImageBuffer<Rgb<S>, Vec<S>>>
where
    Rgb<S>: Pixel<Subpixel = S>,
    S: Primitive + AsPrimitive<f32> + 'static,
    f32: AsPrimitive<S>,
{
    ensure!(
        first.dimensions() == second.dimensions(),
        "Images to blend have different dimensions: {:?} and {:?}",
        first.dimensions(),
        second.dimensions()
    );

    // 1.0 for float channels, the type maximum for integer ones
    let max: f32 = S::DEFAULT_MAX_VALUE.as_();
    let round = max > 1.0;

    let blended = first
        .as_raw()
        .iter()
        .zip(second.as_raw())
        .map(|(&a, &b)| {
            let value = a.as_() * alpha + b.as_() * beta;
            let value = if round { value.round() } else { value };
            let out: S = value.clamp(0.0, max).as_();
            out
        })
        .collect::<Vec<S>>();

    ImageBuffer::from_raw(first.width(), first.height(), blended)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from blended pixels"))
}
