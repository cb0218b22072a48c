//! CPU-mirrored 3D channel textures.
//!
//! The renderer owns the actual GPU objects; this mirror is the upload
//! source and the authoritative content for tests. Region writes use the
//! same texel addressing the shader-side decoder assumes.

use glam::UVec3;

/// Texel format of one pool channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexelFormat {
    /// Four half floats (L0 + L1rx, sky occlusion).
    Rgba16F,
    /// Four unorm bytes (L1, L2, probe occlusion).
    Rgba8,
    /// One unorm byte (validity, sky shading direction indices).
    R8,
}

impl TexelFormat {
    /// Bytes per texel.
    #[must_use]
    pub const fn texel_size(self) -> usize {
        match self {
            Self::Rgba16F => 8,
            Self::Rgba8 => 4,
            Self::R8 => 1,
        }
    }
}

/// One 3D atlas channel with a CPU-side mirror of its texels.
#[derive(Debug, Clone)]
pub struct ChannelTexture {
    format: TexelFormat,
    width: u32,
    height: u32,
    depth: u32,
    data: Vec<u8>,
}

impl ChannelTexture {
    /// Allocate a zeroed texture of the given texel dimensions.
    #[must_use]
    pub fn new(format: TexelFormat, width: u32, height: u32, depth: u32) -> Self {
        let bytes = (width * height * depth) as usize * format.texel_size();
        Self {
            format,
            width,
            height,
            depth,
            data: vec![0; bytes],
        }
    }

    #[must_use]
    pub fn format(&self) -> TexelFormat {
        self.format
    }

    #[must_use]
    pub fn dimensions(&self) -> UVec3 {
        UVec3::new(self.width, self.height, self.depth)
    }

    /// Estimated memory cost of the GPU resource in bytes.
    #[must_use]
    pub fn byte_cost(&self) -> usize {
        self.data.len()
    }

    /// Raw texel bytes, row-major (x fastest, then y, then z).
    #[must_use]
    pub fn texels(&self) -> &[u8] {
        &self.data
    }

    fn texel_byte_offset(&self, x: u32, y: u32, z: u32) -> usize {
        let index = z * (self.width * self.height) + y * self.width + x;
        index as usize * self.format.texel_size()
    }

    /// Copy a tightly packed region of texels into the texture.
    ///
    /// `src` holds `size.x * size.y * size.z` texels in row-major order.
    ///
    /// # Panics
    ///
    /// Panics if the region exceeds the texture bounds or `src` is sized
    /// incorrectly; both indicate allocator/layout bugs, not runtime input.
    pub fn write_region(&mut self, origin: UVec3, size: UVec3, src: &[u8]) {
        let texel = self.format.texel_size();
        assert!(origin.x + size.x <= self.width);
        assert!(origin.y + size.y <= self.height);
        assert!(origin.z + size.z <= self.depth);
        assert_eq!(src.len(), (size.x * size.y * size.z) as usize * texel);

        let row_bytes = size.x as usize * texel;
        for dz in 0..size.z {
            for dy in 0..size.y {
                let src_start = ((dz * size.y + dy) * size.x) as usize * texel;
                let dst_start =
                    self.texel_byte_offset(origin.x, origin.y + dy, origin.z + dz);
                self.data[dst_start..dst_start + row_bytes]
                    .copy_from_slice(&src[src_start..src_start + row_bytes]);
            }
        }
    }

    /// Read a region back into a tightly packed buffer.
    #[must_use]
    pub fn read_region(&self, origin: UVec3, size: UVec3) -> Vec<u8> {
        let texel = self.format.texel_size();
        let mut out = vec![0; (size.x * size.y * size.z) as usize * texel];
        let row_bytes = size.x as usize * texel;
        for dz in 0..size.z {
            for dy in 0..size.y {
                let dst_start = ((dz * size.y + dy) * size.x) as usize * texel;
                let src_start =
                    self.texel_byte_offset(origin.x, origin.y + dy, origin.z + dz);
                out[dst_start..dst_start + row_bytes]
                    .copy_from_slice(&self.data[src_start..src_start + row_bytes]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_round_trip() {
        let mut tex = ChannelTexture::new(TexelFormat::R8, 8, 4, 4);
        let origin = UVec3::new(2, 1, 1);
        let size = UVec3::new(3, 2, 2);
        let src: Vec<u8> = (0..12).collect();

        tex.write_region(origin, size, &src);

        assert_eq!(tex.read_region(origin, size), src);
        // Outside the region stays zero.
        assert_eq!(tex.read_region(UVec3::ZERO, UVec3::new(2, 1, 1)), vec![0, 0]);
    }

    #[test]
    fn writes_land_at_row_major_offsets() {
        let mut tex = ChannelTexture::new(TexelFormat::R8, 4, 2, 2);
        tex.write_region(UVec3::new(1, 1, 1), UVec3::ONE, &[7]);
        // index = z*(w*h) + y*w + x = 8 + 4 + 1
        assert_eq!(tex.texels()[13], 7);
    }

    #[test]
    fn byte_cost_accounts_for_format() {
        let tex = ChannelTexture::new(TexelFormat::Rgba16F, 4, 4, 4);
        assert_eq!(tex.byte_cost(), 4 * 4 * 4 * 8);
    }
}
