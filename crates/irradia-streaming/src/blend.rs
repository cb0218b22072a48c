//! Scenario blending arithmetic.
//!
//! Blending interpolates two resident scenario payloads texel by texel.
//! Half floats are decoded and re-encoded by hand; the channel formats are
//! a baked data contract, not a runtime choice.

/// Decode an IEEE 754 binary16 value.
#[must_use]
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exponent = (bits >> 10) & 0x1F;
    let mantissa = u32::from(bits & 0x3FF);

    let bits32 = match exponent {
        0 => {
            if mantissa == 0 {
                sign
            } else {
                // Subnormal: renormalize into the f32 exponent range.
                let mut exponent32: u32 = 127 - 15 + 1;
                let mut m = mantissa;
                while m & 0x400 == 0 {
                    m <<= 1;
                    exponent32 -= 1;
                }
                sign | (exponent32 << 23) | ((m & 0x3FF) << 13)
            }
        }
        0x1F => sign | 0x7F80_0000 | (mantissa << 13),
        _ => sign | ((u32::from(exponent) + 112) << 23) | (mantissa << 13),
    };
    f32::from_bits(bits32)
}

/// Encode an IEEE 754 binary16 value, rounding to nearest.
#[must_use]
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xFF) as i32;
    let mantissa = bits & 0x7F_FFFF;

    if exponent == 0xFF {
        let nan = if mantissa != 0 { 0x200 } else { 0 };
        return sign | 0x7C00 | nan;
    }

    let unbiased = exponent - 127;
    if unbiased > 15 {
        return sign | 0x7C00;
    }
    if unbiased >= -14 {
        let half = ((unbiased + 15) as u32) << 10 | (mantissa >> 13);
        let round = (mantissa >> 12) & 1;
        return sign | (half + round) as u16;
    }
    if unbiased >= -24 {
        let full = mantissa | 0x80_0000;
        let shift = (-unbiased - 1) as u32;
        let half = (full >> shift) as u16;
        let round = ((full >> (shift - 1)) & 1) as u16;
        return sign | (half + round);
    }
    sign
}

/// Lerp two half-float channel runs into `out`. Lengths must match and be
/// even.
pub fn blend_rgba16f(state0: &[u8], state1: &[u8], factor: f32, out: &mut [u8]) {
    debug_assert_eq!(state0.len(), state1.len());
    debug_assert_eq!(state0.len(), out.len());
    for ((a, b), dst) in state0
        .chunks_exact(2)
        .zip(state1.chunks_exact(2))
        .zip(out.chunks_exact_mut(2))
    {
        let v0 = f16_to_f32(u16::from_le_bytes([a[0], a[1]]));
        let v1 = f16_to_f32(u16::from_le_bytes([b[0], b[1]]));
        let blended = f32_to_f16(v0 + (v1 - v0) * factor);
        dst.copy_from_slice(&blended.to_le_bytes());
    }
}

/// Lerp two unsigned normalized byte runs into `out`.
pub fn blend_unorm8(state0: &[u8], state1: &[u8], factor: f32, out: &mut [u8]) {
    debug_assert_eq!(state0.len(), state1.len());
    debug_assert_eq!(state0.len(), out.len());
    for ((&a, &b), dst) in state0.iter().zip(state1).zip(out) {
        let blended = f32::from(a) + (f32::from(b) - f32::from(a)) * factor;
        *dst = blended.round().clamp(0.0, 255.0) as u8;
    }
}
