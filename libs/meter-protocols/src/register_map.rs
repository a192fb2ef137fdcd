//! Register Map Compiler
//!
//! Turns a device model's declarative register schema into the list of
//! contiguous [`RegisterBlock`]s read on every poll cycle.
//!
//! Schema files are CSV with the header
//! `address,size,type,byte_order,word_order,function,attribute,group,active`.
//! `byte_order`, `word_order` and `active` may be omitted.

use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bytes::Endian;
use crate::error::{ProtocolError, Result};
use crate::types::{DataGroup, ReadFunction, RegisterBlock, RegisterDescriptor, ValueType};

/// Protocol ceiling on registers per read request
pub const MAX_BLOCK_SIZE: u16 = 125;

/// A raw schema row exactly as supplied by the schema source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaRow {
    pub address: String,
    pub size: String,
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub byte_order: String,
    #[serde(default)]
    pub word_order: String,
    pub function: String,
    pub attribute: String,
    pub group: String,
    #[serde(default)]
    pub active: String,
    /// Source line, filled in by the CSV loader for error messages
    #[serde(skip)]
    pub line: Option<u64>,
}

impl SchemaRow {
    fn location(&self) -> String {
        match self.line {
            Some(line) => format!("line {line} ({})", self.attribute),
            None => format!("attribute '{}'", self.attribute),
        }
    }

    fn schema_err(&self, msg: impl std::fmt::Display) -> ProtocolError {
        ProtocolError::schema(format!("{}: {}", self.location(), msg))
    }

    fn is_active(&self) -> Result<bool> {
        match self.active.trim().to_ascii_lowercase().as_str() {
            "" | "1" | "true" | "yes" | "y" => Ok(true),
            "0" | "false" | "no" | "n" => Ok(false),
            other => Err(self.schema_err(format!("invalid active flag '{other}'"))),
        }
    }

    fn group(&self) -> Result<DataGroup> {
        self.group.parse().map_err(|e| self.schema_err(schema_message(e)))
    }

    /// Validate every field and produce an immutable descriptor
    pub fn to_descriptor(&self) -> Result<RegisterDescriptor> {
        let address: u16 = self
            .address
            .trim()
            .parse()
            .map_err(|_| self.schema_err(format!("invalid address '{}'", self.address)))?;
        let size: u16 = self
            .size
            .trim()
            .parse()
            .map_err(|_| self.schema_err(format!("invalid size '{}'", self.size)))?;
        let value_type: ValueType = self
            .value_type
            .parse()
            .map_err(|e| self.schema_err(schema_message(e)))?;
        let function: ReadFunction = self
            .function
            .parse()
            .map_err(|e| self.schema_err(schema_message(e)))?;
        let group = self.group()?;

        if self.attribute.trim().is_empty() {
            return Err(self.schema_err("missing attribute name"));
        }
        if size != value_type.word_count() {
            return Err(self.schema_err(format!(
                "size {size} does not match {value_type} ({} registers)",
                value_type.word_count()
            )));
        }
        if u32::from(address) + u32::from(size) > u32::from(u16::MAX) + 1 {
            return Err(self.schema_err(format!("address {address} + size {size} overflows")));
        }

        Ok(RegisterDescriptor {
            address,
            size,
            value_type,
            byte_order: Endian::from_hint(&self.byte_order),
            word_order: Endian::from_hint(&self.word_order),
            function,
            attribute: self.attribute.trim().to_string(),
            group,
        })
    }
}

fn schema_message(err: ProtocolError) -> String {
    match err {
        ProtocolError::Schema(msg) => msg,
        other => other.to_string(),
    }
}

/// Active descriptors of `group`, in schema order
pub fn descriptors_for(rows: &[SchemaRow], group: DataGroup) -> Result<Vec<RegisterDescriptor>> {
    let mut descriptors = Vec::new();
    for row in rows {
        if !row.is_active()? || row.group()? != group {
            continue;
        }
        descriptors.push(row.to_descriptor()?);
    }
    Ok(descriptors)
}

/// Compile schema rows of `group` into contiguous read blocks.
///
/// Rows are scanned in schema order; the current block is extended while the
/// next register starts exactly where the block ends, shares its type, byte
/// order, word order and read function, and the block stays within
/// `max_block_size` registers.
pub fn compile_blocks(
    rows: &[SchemaRow],
    group: DataGroup,
    max_block_size: u16,
) -> Result<Vec<RegisterBlock>> {
    if max_block_size == 0 || max_block_size > MAX_BLOCK_SIZE {
        return Err(ProtocolError::schema(format!(
            "max block size {max_block_size} outside 1..={MAX_BLOCK_SIZE}"
        )));
    }

    let descriptors = descriptors_for(rows, group)?;
    let mut blocks: Vec<RegisterBlock> = Vec::new();

    for desc in descriptors {
        if desc.size > max_block_size {
            return Err(ProtocolError::schema(format!(
                "attribute '{}' needs {} registers, max block size is {}",
                desc.attribute, desc.size, max_block_size
            )));
        }

        if let Some(block) = blocks.last_mut() {
            let extends = block.end_address() == u32::from(desc.address)
                && block.value_type == desc.value_type
                && block.byte_order == desc.byte_order
                && block.word_order == desc.word_order
                && block.function == desc.function
                && block.size + desc.size <= max_block_size;

            if extends {
                block.size += desc.size;
                block.attributes.push(desc.attribute);
                continue;
            }
        }

        blocks.push(RegisterBlock {
            start_address: desc.address,
            size: desc.size,
            value_type: desc.value_type,
            byte_order: desc.byte_order,
            word_order: desc.word_order,
            function: desc.function,
            attributes: vec![desc.attribute],
        });
    }

    debug!(
        "Compiled {} {} blocks ({} registers)",
        blocks.len(),
        group,
        blocks.iter().map(|b| u32::from(b.size)).sum::<u32>()
    );
    Ok(blocks)
}

/// Both compiled groups of one device model
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegisterMap {
    pub instant: Vec<RegisterBlock>,
    pub cumulative: Vec<RegisterBlock>,
}

impl RegisterMap {
    pub fn compile(rows: &[SchemaRow], max_block_size: u16) -> Result<Self> {
        Ok(Self {
            instant: compile_blocks(rows, DataGroup::Instant, max_block_size)?,
            cumulative: compile_blocks(rows, DataGroup::Cumulative, max_block_size)?,
        })
    }
}

/// Parse schema rows from CSV text
pub fn parse_schema_csv<R: Read>(source: R) -> Result<Vec<SchemaRow>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(source);

    let headers = reader
        .headers()
        .map_err(|e| ProtocolError::schema(format!("invalid schema header: {e}")))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ProtocolError::schema(format!("invalid schema row: {e}")))?;
        let line = record.position().map(|p| p.line());
        let mut row: SchemaRow = record.deserialize(Some(&headers)).map_err(|e| {
            ProtocolError::schema(format!("line {}: {e}", line.unwrap_or_default()))
        })?;
        row.line = line;
        rows.push(row);
    }
    Ok(rows)
}

/// Load a schema CSV file
pub fn load_schema_csv(path: impl AsRef<Path>) -> Result<Vec<SchemaRow>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|e| {
        ProtocolError::schema(format!("cannot open schema {}: {e}", path.display()))
    })?;
    parse_schema_csv(file)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn row(address: u16, ty: &str, attribute: &str, group: &str) -> SchemaRow {
        let size = ty.parse::<ValueType>().map(|t| t.word_count()).unwrap_or(1);
        SchemaRow {
            address: address.to_string(),
            size: size.to_string(),
            value_type: ty.to_string(),
            function: "holding".to_string(),
            attribute: attribute.to_string(),
            group: group.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_contiguous_same_type_rows_merge() {
        let rows = vec![
            row(0, "float32", "voltage_l1", "instant"),
            row(2, "float32", "voltage_l2", "instant"),
            row(4, "float32", "voltage_l3", "instant"),
        ];
        let blocks = compile_blocks(&rows, DataGroup::Instant, 125).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start_address, 0);
        assert_eq!(blocks[0].size, 6);
        assert_eq!(
            blocks[0].attributes,
            vec!["voltage_l1", "voltage_l2", "voltage_l3"]
        );
    }

    #[test]
    fn test_gap_type_change_and_function_change_split() {
        let mut input_row = row(8, "float32", "frequency", "instant");
        input_row.function = "input".to_string();
        let rows = vec![
            row(0, "float32", "a", "instant"),
            row(4, "float32", "b", "instant"), // gap
            row(6, "int16", "c", "instant"),   // type change
            row(7, "int16", "d", "instant"),
            input_row, // function change
        ];
        let blocks = compile_blocks(&rows, DataGroup::Instant, 125).unwrap();
        let starts: Vec<u16> = blocks.iter().map(|b| b.start_address).collect();
        assert_eq!(starts, vec![0, 4, 6, 8]);
        assert_eq!(blocks[2].attributes, vec!["c", "d"]);
        assert_eq!(blocks[3].function, ReadFunction::Input);
    }

    #[test]
    fn test_order_change_splits() {
        let mut swapped = row(2, "uint32", "b", "cumulative");
        swapped.word_order = "msb".to_string();
        let rows = vec![row(0, "uint32", "a", "cumulative"), swapped];
        let blocks = compile_blocks(&rows, DataGroup::Cumulative, 125).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].word_order, Endian::Little);
    }

    #[test]
    fn test_max_block_size_respected() {
        let rows: Vec<SchemaRow> = (0..10)
            .map(|i| row(i * 2, "uint32", &format!("e{i}"), "cumulative"))
            .collect();
        let blocks = compile_blocks(&rows, DataGroup::Cumulative, 6).unwrap();
        assert_eq!(blocks.len(), 4);
        assert!(blocks.iter().all(|b| b.size <= 6));
        assert_eq!(blocks.iter().map(|b| b.size).sum::<u16>(), 20);
        assert_eq!(blocks[3].attributes, vec!["e9"]);
    }

    /// Mixed-type schema with gaps, word-order and function changes, driven
    /// by a small LCG so every seed is reproducible
    fn mixed_schema(seed: u64, len: usize) -> Vec<SchemaRow> {
        const TYPES: [&str; 8] = [
            "int16", "uint16", "int32", "uint32", "int64", "uint64", "float32", "float64",
        ];
        let mut state = seed;
        let mut next = move |bound: u64| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) % bound
        };

        let mut address = 0u16;
        (0..len)
            .map(|i| {
                // Runs of the same type are common in real maps
                let ty = if next(3) == 0 {
                    TYPES[next(8) as usize]
                } else {
                    TYPES[i / 6 % 8]
                };
                let group = if next(4) == 0 { "cumulative" } else { "instant" };
                let mut r = row(address, ty, &format!("a{i}"), group);
                if next(5) == 0 {
                    r.word_order = "msb".to_string();
                }
                if next(7) == 0 {
                    r.function = "input".to_string();
                }
                let gap = if next(6) == 0 { next(3) as u16 + 1 } else { 0 };
                address += r.size.parse::<u16>().unwrap() + gap;
                r
            })
            .collect()
    }

    #[test]
    fn test_compile_is_deterministic_and_blocks_contiguous() {
        for seed in 1..=40u64 {
            let rows = mixed_schema(seed, 60);
            let addresses: std::collections::HashMap<&str, (u16, u16)> = rows
                .iter()
                .map(|r| {
                    let location = (r.address.parse::<u16>().unwrap(), r.size.parse::<u16>().unwrap());
                    (r.attribute.as_str(), location)
                })
                .collect();

            for max in [4, 9, 125] {
                for group in [DataGroup::Instant, DataGroup::Cumulative] {
                    let blocks = compile_blocks(&rows, group, max).unwrap();
                    assert_eq!(blocks, compile_blocks(&rows, group, max).unwrap(), "seed {seed}");

                    let mut compiled_attrs = Vec::new();
                    for block in &blocks {
                        assert!(block.size <= max);
                        let width = block.value_type.word_count();
                        let sizes: Vec<u16> = block
                            .attributes
                            .iter()
                            .map(|a| addresses[a.as_str()].1)
                            .collect();
                        assert_eq!(block.size, sizes.iter().sum::<u16>(), "seed {seed}");
                        assert!(sizes.iter().all(|&s| s == width));

                        let mut offset = block.start_address;
                        for (attribute, size) in block.attributes.iter().zip(&sizes) {
                            assert_eq!(
                                addresses[attribute.as_str()].0,
                                offset,
                                "seed {seed} {attribute}"
                            );
                            offset += size;
                        }
                        compiled_attrs.extend(block.attributes.iter().cloned());
                    }

                    // Every row of the group lands in exactly one block, in schema order
                    let expected: Vec<String> = rows
                        .iter()
                        .filter(|r| r.group.parse::<DataGroup>().unwrap() == group)
                        .map(|r| r.attribute.clone())
                        .collect();
                    assert_eq!(compiled_attrs, expected, "seed {seed}");
                }
            }
        }
    }

    #[test]
    fn test_filters_group_and_inactive_rows() {
        let mut inactive = row(2, "float32", "skipped", "instant");
        inactive.active = "0".to_string();
        let rows = vec![
            row(0, "float32", "voltage", "instant"),
            inactive,
            row(100, "uint32", "energy", "cumulative"),
        ];
        let instant = compile_blocks(&rows, DataGroup::Instant, 125).unwrap();
        assert_eq!(instant.len(), 1);
        assert_eq!(instant[0].attributes, vec!["voltage"]);

        let cumulative = compile_blocks(&rows, DataGroup::Cumulative, 125).unwrap();
        assert_eq!(cumulative.len(), 1);
        assert_eq!(cumulative[0].start_address, 100);
    }

    #[test]
    fn test_no_resorting() {
        let rows = vec![
            row(2, "float32", "b", "instant"),
            row(0, "float32", "a", "instant"),
        ];
        let blocks = compile_blocks(&rows, DataGroup::Instant, 125).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].start_address, 2);
        assert_eq!(blocks[1].start_address, 0);
    }

    #[test]
    fn test_schema_errors() {
        let mut bad_address = row(0, "float32", "a", "instant");
        bad_address.address = "4x0001".to_string();
        let err = compile_blocks(&[bad_address], DataGroup::Instant, 125).unwrap_err();
        assert!(matches!(err, ProtocolError::Schema(_)));

        let mut bad_size = row(0, "float32", "a", "instant");
        bad_size.size = "1".to_string();
        assert!(compile_blocks(&[bad_size], DataGroup::Instant, 125).is_err());

        let mut bad_type = row(0, "float32", "a", "instant");
        bad_type.value_type = "decimal".to_string();
        assert!(compile_blocks(&[bad_type], DataGroup::Instant, 125).is_err());

        assert!(compile_blocks(&[], DataGroup::Instant, 0).is_err());
        assert!(compile_blocks(&[], DataGroup::Instant, 126).is_err());
    }

    #[test]
    fn test_parse_schema_csv() {
        let csv = "\
address,size,type,byte_order,word_order,function,attribute,group,active
0,2,float32,,msb,holding,voltage_l1,instant,1
2,2,float32,,msb,holding,voltage_l2,instant,1
100,2,uint32,,,input,active_energy,cumulative,
";
        let rows = parse_schema_csv(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].line, Some(2));

        let map = RegisterMap::compile(&rows, 125).unwrap();
        assert_eq!(map.instant.len(), 1);
        assert_eq!(map.instant[0].word_order, Endian::Little);
        assert_eq!(map.cumulative[0].function, ReadFunction::Input);
    }

    #[test]
    fn test_schema_error_mentions_line() {
        let csv = "\
address,size,type,function,attribute,group
0,2,float32,holding,voltage,instant
x,2,float32,holding,current,instant
";
        let rows = parse_schema_csv(csv.as_bytes()).unwrap();
        let err = compile_blocks(&rows, DataGroup::Instant, 125).unwrap_err();
        assert!(err.to_string().contains("line 3"), "{err}");
    }
}
