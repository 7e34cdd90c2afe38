//! Block planner
//!
//! Rewrites a point set so that adjacent points on the same device and
//! register category are served by one contiguous block read. Small
//! address gaps are bridged (the read covers unmapped registers, which
//! target servers tolerate); oversized runs split at the 125-register
//! transaction cap.

use std::collections::BTreeMap;

use tracing::debug;

use crate::point::{tag_keys, Point, RegisterCategory};

/// Maximum registers per planned block (Modbus read transaction cap).
pub const MAX_BLOCK_REGISTERS: u16 = 125;

/// Largest bridgeable address gap between register-category points.
pub const MAX_GAP_REGISTERS: u16 = 5;

/// Largest bridgeable address gap between bit-category points.
pub const MAX_GAP_BITS: u16 = 3;

/// Rewrite `points` into an equivalent, possibly smaller set where runs
/// of compatible points become synthetic block points.
///
/// Every input point is covered by exactly one output entry; singleton
/// runs pass through unchanged.
pub fn plan_blocks(points: &[Point]) -> Vec<Point> {
    // Partition by device and register category. BTreeMap keeps the
    // output order deterministic across runs.
    let mut partitions: BTreeMap<(String, u16, u8, RegisterCategory), Vec<&Point>> =
        BTreeMap::new();
    for point in points {
        partitions
            .entry((
                point.host.clone(),
                point.port,
                point.unit_id,
                point.data_type.register_category(),
            ))
            .or_default()
            .push(point);
    }

    let mut planned = Vec::with_capacity(points.len());

    for ((_, _, _, category), mut members) in partitions {
        members.sort_by_key(|p| p.address);

        let max_gap = if category.is_bit() {
            MAX_GAP_BITS
        } else {
            MAX_GAP_REGISTERS
        };

        let mut i = 0;
        while i < members.len() {
            let start = members[i].address;
            let mut end = start + members[i].data_type.width() - 1;

            // Extend the run while the next point stays within the gap
            // and size budget.
            let mut j = i + 1;
            while j < members.len() {
                let next = members[j];
                let next_end = next.address + next.data_type.width() - 1;
                let gap = next.address.saturating_sub(end + 1);
                let new_size = next_end.max(end) - start + 1;

                if gap <= max_gap && new_size <= MAX_BLOCK_REGISTERS {
                    end = end.max(next_end);
                    j += 1;
                } else {
                    break;
                }
            }

            if j > i + 1 {
                planned.push(build_block_point(&members[i..j], category, start, end));
            } else {
                planned.push(members[i].clone());
            }
            i = j;
        }
    }

    debug!(
        "Block planning: {} points -> {} planned entries",
        points.len(),
        planned.len()
    );
    planned
}

fn build_block_point(members: &[&Point], category: RegisterCategory, start: u16, end: u16) -> Point {
    let first = members[0];
    let block_size = end - start + 1;

    let mut block = first.clone();
    block.name = format!("{}_BLOCK_{}_{}", first.device_name(), start, end);
    block.address = start;

    let join = |f: &dyn Fn(&Point) -> String| -> String {
        members.iter().map(|p| f(p)).collect::<Vec<_>>().join(",")
    };

    block.tags.insert(
        tag_keys::BLOCK_TYPE.into(),
        tag_keys::BLOCK_TYPE_OPTIMIZED.into(),
    );
    block
        .tags
        .insert(tag_keys::BLOCK_START.into(), start.to_string());
    block
        .tags
        .insert(tag_keys::BLOCK_SIZE.into(), block_size.to_string());
    block.tags.insert(
        tag_keys::REGISTER_CATEGORY.into(),
        category.as_str().into(),
    );
    block.tags.insert(
        tag_keys::ORIGINAL_ADDRESSES.into(),
        join(&|p| p.address.to_string()),
    );
    block
        .tags
        .insert(tag_keys::ORIGINAL_NAMES.into(), join(&|p| p.name.clone()));
    block.tags.insert(
        tag_keys::ORIGINAL_DATA_TYPES.into(),
        join(&|p| p.data_type.as_str().to_string()),
    );
    block.tags.insert(
        tag_keys::ORIGINAL_MEASUREMENTS.into(),
        join(&|p| p.measurement.clone()),
    );
    block.tags.insert(
        tag_keys::ORIGINAL_DESCRIPTIONS.into(),
        join(&|p| {
            p.tags
                .get(tag_keys::DESCRIPTION)
                .cloned()
                .unwrap_or_else(|| format!("{}_{}", p.measurement, p.address))
        }),
    );

    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::DataType;
    use std::collections::BTreeMap;

    fn point(name: &str, address: u16, data_type: DataType) -> Point {
        Point {
            name: name.into(),
            host: "10.0.0.1".into(),
            port: 502,
            unit_id: 1,
            address,
            data_type,
            poll_interval_ms: 1000,
            measurement: "m".into(),
            tags: BTreeMap::new(),
            enabled: true,
        }
    }

    #[test]
    fn test_adjacent_points_form_one_block() {
        let points = vec![
            point("a", 101, DataType::Reg16),
            point("b", 102, DataType::Reg16),
            point("c", 103, DataType::Reg16),
        ];
        let planned = plan_blocks(&points);

        assert_eq!(planned.len(), 1);
        let block = &planned[0];
        assert!(block.is_block());
        assert_eq!(block.block_start(), Some(101));
        assert_eq!(block.block_size(), Some(3));
        assert_eq!(block.name, "10.0.0.1_502_BLOCK_101_103");

        let originals = block.original_points().unwrap();
        assert_eq!(
            originals.iter().map(|o| o.address).collect::<Vec<_>>(),
            vec![101, 102, 103]
        );
    }

    #[test]
    fn test_singleton_passes_through() {
        let points = vec![point("only", 40, DataType::Float32)];
        let planned = plan_blocks(&points);
        assert_eq!(planned.len(), 1);
        assert!(!planned[0].is_block());
        assert_eq!(planned[0], points[0]);
    }

    #[test]
    fn test_gap_within_limit_merges() {
        // Gap of 5 registers between the two points: still one block.
        let points = vec![
            point("a", 100, DataType::Reg16),
            point("b", 106, DataType::Reg16),
        ];
        let planned = plan_blocks(&points);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].block_size(), Some(7));
    }

    #[test]
    fn test_gap_beyond_limit_splits() {
        let points = vec![
            point("a", 100, DataType::Reg16),
            point("b", 107, DataType::Reg16),
        ];
        let planned = plan_blocks(&points);
        assert_eq!(planned.len(), 2);
        assert!(planned.iter().all(|p| !p.is_block()));
    }

    #[test]
    fn test_bit_partition_uses_smaller_gap() {
        // Gap of 4 exceeds the bit limit of 3.
        let points = vec![
            point("a", 10, DataType::Coil),
            point("b", 15, DataType::Coil),
        ];
        let planned = plan_blocks(&points);
        assert_eq!(planned.len(), 2);

        // Gap of 3 merges.
        let points = vec![
            point("a", 10, DataType::Coil),
            point("b", 14, DataType::Coil),
        ];
        let planned = plan_blocks(&points);
        assert_eq!(planned.len(), 1);
    }

    #[test]
    fn test_mixed_widths_within_holding() {
        let points = vec![
            point("a", 100, DataType::Reg16),
            point("b", 101, DataType::Float32),
            point("c", 103, DataType::Double64),
        ];
        let planned = plan_blocks(&points);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].block_size(), Some(7));

        let originals = planned[0].original_points().unwrap();
        assert_eq!(originals[1].data_type, DataType::Float32);
        assert_eq!(originals[2].data_type, DataType::Double64);
    }

    #[test]
    fn test_categories_never_mix() {
        let points = vec![
            point("holding", 100, DataType::Reg16),
            point("input", 101, DataType::InputReg16),
        ];
        let planned = plan_blocks(&points);
        assert_eq!(planned.len(), 2);
    }

    #[test]
    fn test_devices_never_mix() {
        let mut other = point("other", 101, DataType::Reg16);
        other.unit_id = 2;
        let points = vec![point("a", 100, DataType::Reg16), other];
        let planned = plan_blocks(&points);
        assert_eq!(planned.len(), 2);
    }

    #[test]
    fn test_block_size_bound() {
        // 200 contiguous registers must split into blocks of <= 125.
        let points: Vec<Point> = (0..200)
            .map(|i| point(&format!("p{i}"), i, DataType::Reg16))
            .collect();
        let planned = plan_blocks(&points);

        assert!(planned.len() >= 2);
        for p in &planned {
            assert!(p.width() <= MAX_BLOCK_REGISTERS);
        }
    }

    #[test]
    fn test_full_coverage() {
        let points = vec![
            point("a", 100, DataType::Reg16),
            point("b", 102, DataType::Float32),
            point("c", 300, DataType::Reg16),
            point("d", 10, DataType::Coil),
            point("e", 11, DataType::Coil),
        ];
        let planned = plan_blocks(&points);

        let mut covered: Vec<(u16, String)> = Vec::new();
        for p in &planned {
            if p.is_block() {
                for original in p.original_points().unwrap() {
                    covered.push((original.address, original.name));
                }
            } else {
                covered.push((p.address, p.name.clone()));
            }
        }
        covered.sort();

        let mut expected: Vec<(u16, String)> =
            points.iter().map(|p| (p.address, p.name.clone())).collect();
        expected.sort();

        assert_eq!(covered, expected);
    }

    #[test]
    fn test_address_order_preserved_within_block() {
        let points = vec![
            point("late", 103, DataType::Reg16),
            point("early", 101, DataType::Reg16),
            point("mid", 102, DataType::Reg16),
        ];
        let planned = plan_blocks(&points);
        assert_eq!(planned.len(), 1);

        let originals = planned[0].original_points().unwrap();
        let addresses: Vec<u16> = originals.iter().map(|o| o.address).collect();
        assert_eq!(addresses, vec![101, 102, 103]);
    }

    #[test]
    fn test_device_name_tag_used_in_block_name() {
        let mut a = point("a", 101, DataType::Reg16);
        a.tags.insert(tag_keys::DEVICE_NAME.into(), "rtu_7".into());
        let mut b = point("b", 102, DataType::Reg16);
        b.tags.insert(tag_keys::DEVICE_NAME.into(), "rtu_7".into());

        let planned = plan_blocks(&[a, b]);
        assert_eq!(planned[0].name, "rtu_7_BLOCK_101_102");
    }
}
