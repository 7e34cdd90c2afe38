//! Response router
//!
//! Splits a completed block read into per-point samples and decorates
//! each with the acquisition tags downstream consumers expect. Samples
//! within a block are emitted in increasing address order.

use std::collections::BTreeMap;

use tracing::warn;

use crate::error::Result;
use crate::point::{tag_keys, DataType, Point, ReadResult, Sample, Value};
use crate::protocols::modbus::codec::ModbusCodec;
use crate::utils::now_ms;

/// Decode a read result for `point` into samples.
///
/// A failed result yields no samples; the caller accounts the failure.
pub fn route_read_result(result: &ReadResult, point: &Point) -> Result<Vec<Sample>> {
    if !result.success {
        return Ok(Vec::new());
    }

    if point.is_block() {
        route_block(result, point)
    } else {
        Ok(vec![decode_single(result, point)])
    }
}

fn decode_single(result: &ReadResult, point: &Point) -> Sample {
    match ModbusCodec::decode_value(&result.raw, 0, point.data_type) {
        Ok((value, _)) => build_sample(
            &point.name,
            value,
            result.timestamp_ms,
            &point.measurement,
            point,
            point.address,
            point.data_type,
            point.tags.get(tag_keys::DESCRIPTION).cloned(),
        ),
        Err(e) => {
            warn!("Failed to decode point '{}': {}", point.name, e);
            Sample {
                point_name: point.name.clone(),
                value: Value::U16(0),
                timestamp_ms: result.timestamp_ms,
                measurement: point.measurement.clone(),
                tags: point.tags.clone(),
                valid: false,
                error: Some(e.to_string()),
            }
        },
    }
}

fn route_block(result: &ReadResult, block: &Point) -> Result<Vec<Sample>> {
    let block_start = block.block_start().unwrap_or(block.address);
    let originals = block.original_points()?;

    let mut samples = Vec::with_capacity(originals.len());
    for original in &originals {
        let offset = usize::from(original.address - block_start);
        match ModbusCodec::decode_value(&result.raw, offset, original.data_type) {
            Ok((value, _)) => {
                let measurement = if original.measurement.is_empty() {
                    block.measurement.clone()
                } else {
                    original.measurement.clone()
                };
                let description = if original.description.is_empty() {
                    None
                } else {
                    Some(original.description.clone())
                };
                samples.push(build_sample(
                    &original.name,
                    value,
                    result.timestamp_ms,
                    &measurement,
                    block,
                    original.address,
                    original.data_type,
                    description,
                ));
            },
            Err(e) => {
                warn!(
                    "Block '{}': failed to decode member '{}' at offset {}: {}",
                    block.name, original.name, offset, e
                );
                samples.push(Sample {
                    point_name: original.name.clone(),
                    value: Value::U16(0),
                    timestamp_ms: result.timestamp_ms,
                    measurement: original.measurement.clone(),
                    tags: BTreeMap::new(),
                    valid: false,
                    error: Some(e.to_string()),
                });
            },
        }
    }
    Ok(samples)
}

#[allow(clippy::too_many_arguments)]
fn build_sample(
    name: &str,
    value: Value,
    timestamp_ms: i64,
    measurement: &str,
    source: &Point,
    address: u16,
    data_type: DataType,
    description: Option<String>,
) -> Sample {
    let mut tags = BTreeMap::new();
    tags.insert(
        tag_keys::DEVICE_NAME.to_string(),
        source.device_name(),
    );
    tags.insert(tag_keys::ADDRESS.to_string(), address.to_string());
    tags.insert(
        tag_keys::READ_MODE.to_string(),
        data_type.read_mode().to_string(),
    );
    tags.insert(
        tag_keys::DATA_TYPE.to_string(),
        data_type.as_str().to_string(),
    );
    if let Some(description) = description {
        tags.insert(tag_keys::DESCRIPTION.to_string(), description);
    }

    // Processing timestamp; the sample keeps the acquisition timestamp.
    tags.insert("processed_at".to_string(), now_ms().to_string());

    Sample {
        point_name: name.to_string(),
        value,
        timestamp_ms,
        measurement: measurement.to_string(),
        tags,
        valid: true,
        error: None,
    }
}
