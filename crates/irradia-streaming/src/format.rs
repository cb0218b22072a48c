//! On-disk record layouts of the baked cell assets.
//!
//! Every asset stores little-endian fixed-size records. Per-cell ranges
//! hold whole chunks per channel, channels back to back, so a single
//! sequential read per file covers a cell.

use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Vec3};
use irradia_core::constants::CHUNK_PROBE_COUNT;
use irradia_core::{Brick, ChannelSet, Error, Result, ShBands, SupportData};
use irradia_pool::TexelFormat;

/// One brick record in the bricks asset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BrickRecord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub subdivision_level: u32,
}

/// One probe record in the support asset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SupportRecord {
    pub position: [f32; 3],
    pub validity: f32,
    pub offset: [f32; 3],
}

pub const BRICK_RECORD_SIZE: usize = std::mem::size_of::<BrickRecord>();
pub const SUPPORT_RECORD_SIZE: usize = std::mem::size_of::<SupportRecord>();

fn chunk_bytes(format: TexelFormat) -> usize {
    CHUNK_PROBE_COUNT as usize * format.texel_size()
}

/// Bytes of one chunk in the per-scenario data asset (L0 and L1 channels).
#[must_use]
pub fn scenario_data_chunk_bytes() -> usize {
    chunk_bytes(TexelFormat::Rgba16F) + 2 * chunk_bytes(TexelFormat::Rgba8)
}

/// Bytes of one chunk in the per-scenario optional asset, or zero when the
/// set carries neither L2 nor probe occlusion.
#[must_use]
pub fn scenario_optional_chunk_bytes(bands: ShBands, channels: ChannelSet) -> usize {
    let mut bytes = 0;
    if bands == ShBands::L2 {
        bytes += 4 * chunk_bytes(TexelFormat::Rgba8);
    }
    if channels.probe_occlusion {
        bytes += chunk_bytes(TexelFormat::Rgba8);
    }
    bytes
}

/// Bytes of one chunk in the shared asset (validity and sky channels).
#[must_use]
pub fn shared_chunk_bytes(channels: ChannelSet) -> usize {
    let mut bytes = 0;
    if channels.validity {
        bytes += chunk_bytes(TexelFormat::R8);
    }
    if channels.sky_occlusion {
        bytes += chunk_bytes(TexelFormat::Rgba16F);
    }
    if channels.sky_shading_direction {
        bytes += chunk_bytes(TexelFormat::R8);
    }
    bytes
}

/// Parse a cell's brick list from its bricks asset range.
pub fn parse_bricks(bytes: &[u8]) -> Result<Vec<Brick>> {
    if bytes.len() % BRICK_RECORD_SIZE != 0 {
        return Err(Error::CorruptAsset(format!(
            "brick data length {} is not a record multiple",
            bytes.len()
        )));
    }
    bytes
        .chunks_exact(BRICK_RECORD_SIZE)
        .map(|raw| {
            let record: BrickRecord = bytemuck::pod_read_unaligned(raw);
            let level = u8::try_from(record.subdivision_level).map_err(|_| {
                Error::CorruptAsset(format!(
                    "brick subdivision level {} out of range",
                    record.subdivision_level
                ))
            })?;
            Ok(Brick {
                position: IVec3::new(record.x, record.y, record.z),
                subdivision_level: level,
            })
        })
        .collect()
}

/// Parse a cell's support arrays from its support asset range.
pub fn parse_support(bytes: &[u8]) -> Result<SupportData> {
    if bytes.len() % SUPPORT_RECORD_SIZE != 0 {
        return Err(Error::CorruptAsset(format!(
            "support data length {} is not a record multiple",
            bytes.len()
        )));
    }
    let mut support = SupportData::default();
    for raw in bytes.chunks_exact(SUPPORT_RECORD_SIZE) {
        let record: SupportRecord = bytemuck::pod_read_unaligned(raw);
        support.probe_positions.push(Vec3::from_array(record.position));
        support.validity.push(record.validity);
        support.offset_vectors.push(Vec3::from_array(record.offset));
    }
    Ok(support)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brick_records_round_trip() {
        let records = [
            BrickRecord { x: -3, y: 0, z: 9, subdivision_level: 2 },
            BrickRecord { x: 1, y: 1, z: 1, subdivision_level: 0 },
        ];
        let bytes: &[u8] = bytemuck::cast_slice(&records);

        let bricks = parse_bricks(bytes).unwrap();
        assert_eq!(bricks.len(), 2);
        assert_eq!(bricks[0].position, IVec3::new(-3, 0, 9));
        assert_eq!(bricks[0].subdivision_level, 2);
        assert_eq!(bricks[1].subdivision_level, 0);
    }

    #[test]
    fn truncated_brick_data_is_corrupt() {
        assert!(parse_bricks(&[0u8; BRICK_RECORD_SIZE - 1]).is_err());
    }

    #[test]
    fn oversized_subdivision_is_corrupt() {
        let record = BrickRecord { x: 0, y: 0, z: 0, subdivision_level: 300 };
        assert!(parse_bricks(bytemuck::bytes_of(&record)).is_err());
    }

    #[test]
    fn support_records_parse() {
        let record = SupportRecord {
            position: [1.0, 2.0, 3.0],
            validity: 0.5,
            offset: [0.0, -1.0, 0.0],
        };
        let support = parse_support(bytemuck::bytes_of(&record)).unwrap();
        assert_eq!(support.probe_positions, vec![Vec3::new(1.0, 2.0, 3.0)]);
        assert_eq!(support.validity, vec![0.5]);
        assert_eq!(support.offset_vectors, vec![Vec3::new(0.0, -1.0, 0.0)]);
    }

    #[test]
    fn chunk_byte_sizes_follow_channels() {
        // 8192 probes per chunk: 8 bytes L0 + 4 + 4 bytes L1.
        assert_eq!(scenario_data_chunk_bytes(), 8192 * 16);

        let channels = ChannelSet {
            validity: true,
            sky_occlusion: true,
            ..ChannelSet::default()
        };
        assert_eq!(shared_chunk_bytes(channels), 8192 * 9);
        assert_eq!(scenario_optional_chunk_bytes(ShBands::L1, channels), 0);
        assert_eq!(
            scenario_optional_chunk_bytes(ShBands::L2, channels),
            8192 * 16
        );
    }
}
