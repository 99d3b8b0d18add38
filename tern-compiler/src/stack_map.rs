//! Stack maps: per-safepoint records translating a native PC into a dex PC,
//! the reference-holding registers and stack slots, and the dex register
//! values of every (inlined) frame.
//!
//! `StackMapStream` collects rows during code generation and encodes them
//! once into a bit-packed `CodeInfo` blob. Register masks, stack masks and
//! dex register locations are deduplicated into side tables; every table
//! stores each column with the minimal bit width for its values.

use std::collections::HashMap;
use std::io;

use fixedbitset::FixedBitSet;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Thumb instructions are halfword aligned; native PCs are stored halved.
const PC_ALIGNMENT: u32 = 2;
const NO_VALUE: u32 = 0;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StackMapKind {
    Default,
    Catch,
    Osr,
    Debug,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DexRegisterLocation {
    None,
    Constant(i32),
    InStack(i32),
    InRegister(u8),
    InRegisterHigh(u8),
    InFpuRegister(u8),
    InFpuRegisterHigh(u8),
}

impl DexRegisterLocation {
    fn pack(self) -> (u32, u32) {
        match self {
            DexRegisterLocation::None => (0, 0),
            DexRegisterLocation::Constant(value) => (1, value as u32),
            DexRegisterLocation::InStack(offset) => (2, offset as u32),
            DexRegisterLocation::InRegister(reg) => (3, reg as u32),
            DexRegisterLocation::InRegisterHigh(reg) => (4, reg as u32),
            DexRegisterLocation::InFpuRegister(reg) => (5, reg as u32),
            DexRegisterLocation::InFpuRegisterHigh(reg) => (6, reg as u32),
        }
    }

    fn unpack(kind: u32, value: u32) -> io::Result<DexRegisterLocation> {
        Ok(match kind {
            0 => DexRegisterLocation::None,
            1 => DexRegisterLocation::Constant(value as i32),
            2 => DexRegisterLocation::InStack(value as i32),
            3 => DexRegisterLocation::InRegister(value as u8),
            4 => DexRegisterLocation::InRegisterHigh(value as u8),
            5 => DexRegisterLocation::InFpuRegister(value as u8),
            6 => DexRegisterLocation::InFpuRegisterHigh(value as u8),
            _ => return Err(invalid("dex register location kind")),
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InlineInfo {
    pub method_index: u32,
    pub dex_pc: u32,
    pub number_of_dex_registers: u32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StackMap {
    pub native_pc: u32,
    pub dex_pc: u32,
    pub kind: StackMapKind,
    pub register_mask: u32,
    pub stack_mask: FixedBitSet,
    /// Innermost frame last.
    pub inline_infos: Vec<InlineInfo>,
    /// Dex registers of the outer frame followed by each inlined frame.
    pub dex_registers: Vec<DexRegisterLocation>,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FrameInfo {
    pub frame_size: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub code_size: u32,
    pub number_of_dex_registers: u32,
}

pub struct StackMapStream {
    frame: FrameInfo,
    stack_maps: Vec<StackMap>,
    current: Option<StackMap>,
    in_method: bool,
}

impl StackMapStream {
    pub fn new() -> StackMapStream {
        StackMapStream {
            frame: FrameInfo::default(),
            stack_maps: Vec::new(),
            current: None,
            in_method: false,
        }
    }

    pub fn begin_method(&mut self, frame_size: u32, core_spill_mask: u32, fp_spill_mask: u32, number_of_dex_registers: u32) {
        assert!(!self.in_method, "begin_method called twice");
        self.in_method = true;
        self.frame.frame_size = frame_size;
        self.frame.core_spill_mask = core_spill_mask;
        self.frame.fp_spill_mask = fp_spill_mask;
        self.frame.number_of_dex_registers = number_of_dex_registers;
    }

    pub fn end_method(&mut self, code_size: u32) {
        assert!(self.in_method && self.current.is_none());
        self.frame.code_size = code_size;
        self.in_method = false;
    }

    pub fn begin_stack_map_entry(
        &mut self,
        dex_pc: u32,
        native_pc: u32,
        register_mask: u32,
        stack_mask: FixedBitSet,
        kind: StackMapKind,
    ) {
        assert!(self.in_method, "stack map outside of method");
        assert!(self.current.is_none(), "nested stack map entry");
        assert_eq!(native_pc % PC_ALIGNMENT, 0);
        if let Some(last) = self.stack_maps.last() {
            assert!(last.native_pc <= native_pc, "stack maps must be recorded in code order");
        }

        self.current = Some(StackMap {
            native_pc,
            dex_pc,
            kind,
            register_mask,
            stack_mask,
            inline_infos: Vec::new(),
            dex_registers: Vec::new(),
        });
    }

    pub fn add_dex_register_entry(&mut self, location: DexRegisterLocation) {
        self.current
            .as_mut()
            .expect("no current stack map")
            .dex_registers
            .push(location);
    }

    pub fn add_inline_info(&mut self, method_index: u32, dex_pc: u32, number_of_dex_registers: u32) {
        self.current
            .as_mut()
            .expect("no current stack map")
            .inline_infos
            .push(InlineInfo {
                method_index,
                dex_pc,
                number_of_dex_registers,
            });
    }

    pub fn end_stack_map_entry(&mut self) {
        let entry = self.current.take().expect("no current stack map");
        if !entry.dex_registers.is_empty() {
            let expected = self.frame.number_of_dex_registers
                + entry
                    .inline_infos
                    .iter()
                    .map(|i| i.number_of_dex_registers)
                    .sum::<u32>();
            assert_eq!(entry.dex_registers.len() as u32, expected, "dex register count mismatch");
        }
        self.stack_maps.push(entry);
    }

    pub fn number_of_stack_maps(&self) -> usize {
        self.stack_maps.len()
    }

    pub fn stack_map(&self, idx: usize) -> &StackMap {
        &self.stack_maps[idx]
    }

    /// Updates native PCs after code was moved.
    pub fn shift_native_pcs(&mut self, from: u32, delta: u32) {
        for entry in &mut self.stack_maps {
            if entry.native_pc >= from {
                entry.native_pc += delta;
            }
        }
    }

    pub fn encode(self) -> Vec<u8> {
        assert!(!self.in_method, "encode before end_method");
        let mut writer = BitWriter::new();

        writer.write_varint(self.frame.frame_size / 16);
        writer.write_varint(self.frame.core_spill_mask);
        writer.write_varint(self.frame.fp_spill_mask);
        writer.write_varint(self.frame.code_size);
        writer.write_varint(self.frame.number_of_dex_registers);

        let mut register_masks = Dedup::new();
        let mut stack_masks: Dedup<Vec<u32>> = Dedup::new();
        let mut locations = Dedup::new();
        let mut inline_rows = Vec::new();
        let mut dex_register_rows = Vec::new();
        let mut rows = Vec::with_capacity(self.stack_maps.len());

        let mut last_pc = 0;
        for entry in &self.stack_maps {
            let register_mask = if entry.register_mask == 0 {
                NO_VALUE
            } else {
                register_masks.insert(entry.register_mask) + 1
            };
            let stack_mask = if entry.stack_mask.count_ones(..) == 0 {
                NO_VALUE
            } else {
                stack_masks.insert(entry.stack_mask.ones().map(|b| b as u32).collect()) + 1
            };
            let inline_info = if entry.inline_infos.is_empty() {
                NO_VALUE
            } else {
                let first = inline_rows.len() as u32;
                let last = entry.inline_infos.len() - 1;
                for (i, info) in entry.inline_infos.iter().enumerate() {
                    inline_rows.push(vec![
                        (i == last) as u32,
                        info.method_index,
                        info.dex_pc,
                        info.number_of_dex_registers,
                    ]);
                }
                first + 1
            };
            let dex_registers = if entry.dex_registers.is_empty() {
                NO_VALUE
            } else {
                let first = dex_register_rows.len() as u32;
                for location in &entry.dex_registers {
                    let (kind, value) = location.pack();
                    dex_register_rows.push(vec![locations.insert((kind, value))]);
                }
                first + 1
            };

            rows.push(vec![
                u8::from(entry.kind) as u32,
                (entry.native_pc - last_pc) / PC_ALIGNMENT,
                entry.dex_pc,
                register_mask,
                stack_mask,
                inline_info,
                dex_registers,
            ]);
            last_pc = entry.native_pc;
        }

        write_table(&mut writer, 7, &rows);

        let mask_rows: Vec<Vec<u32>> = register_masks.values.iter().map(|&m| vec![m]).collect();
        write_table(&mut writer, 1, &mask_rows);

        writer.write_varint(stack_masks.values.len() as u32);
        for bits in &stack_masks.values {
            let len = bits.last().map(|&b| b + 1).unwrap_or(0);
            writer.write_varint(len);
            let mut set = FixedBitSet::with_capacity(len as usize);
            for &b in bits {
                set.insert(b as usize);
            }
            for bit in 0..len as usize {
                writer.write_bits(set.contains(bit) as u32, 1);
            }
        }

        write_table(&mut writer, 4, &inline_rows);

        let location_rows: Vec<Vec<u32>> = locations.values.iter().map(|&(k, v)| vec![k, v]).collect();
        write_table(&mut writer, 2, &location_rows);
        write_table(&mut writer, 1, &dex_register_rows);

        writer.finish()
    }
}

impl Default for StackMapStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded form of an encoded stack map blob.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CodeInfo {
    pub frame: FrameInfo,
    pub stack_maps: Vec<StackMap>,
}

impl CodeInfo {
    pub fn decode(data: &[u8]) -> io::Result<CodeInfo> {
        let mut reader = BitReader::new(data);

        let frame = FrameInfo {
            frame_size: reader.read_varint()? * 16,
            core_spill_mask: reader.read_varint()?,
            fp_spill_mask: reader.read_varint()?,
            code_size: reader.read_varint()?,
            number_of_dex_registers: reader.read_varint()?,
        };

        let rows = read_table(&mut reader, 7)?;
        let register_masks = read_table(&mut reader, 1)?;

        let number_of_stack_masks = reader.read_varint()?;
        let mut stack_masks = Vec::with_capacity(number_of_stack_masks as usize);
        for _ in 0..number_of_stack_masks {
            let len = reader.read_varint()? as usize;
            let mut set = FixedBitSet::with_capacity(len);
            for bit in 0..len {
                if reader.read_bits(1)? != 0 {
                    set.insert(bit);
                }
            }
            stack_masks.push(set);
        }

        let inline_rows = read_table(&mut reader, 4)?;
        let locations = read_table(&mut reader, 2)?;
        let dex_register_rows = read_table(&mut reader, 1)?;

        let mut stack_maps = Vec::with_capacity(rows.len());
        let mut native_pc = 0;
        for row in rows {
            native_pc += row[1] * PC_ALIGNMENT;
            let kind = StackMapKind::try_from(row[0] as u8).map_err(|_| invalid("stack map kind"))?;

            let register_mask = match row[3] {
                NO_VALUE => 0,
                idx => lookup(&register_masks, idx - 1)?[0],
            };
            let stack_mask = match row[4] {
                NO_VALUE => FixedBitSet::new(),
                idx => stack_masks
                    .get(idx as usize - 1)
                    .cloned()
                    .ok_or_else(|| invalid("stack mask index"))?,
            };

            let mut inline_infos = Vec::new();
            if row[5] != NO_VALUE {
                let mut idx = row[5] - 1;
                loop {
                    let info = lookup(&inline_rows, idx)?;
                    inline_infos.push(InlineInfo {
                        method_index: info[1],
                        dex_pc: info[2],
                        number_of_dex_registers: info[3],
                    });
                    if info[0] != 0 {
                        break;
                    }
                    idx += 1;
                }
            }

            let mut dex_registers = Vec::new();
            if row[6] != NO_VALUE {
                let count = frame.number_of_dex_registers
                    + inline_infos.iter().map(|i| i.number_of_dex_registers).sum::<u32>();
                let first = row[6] - 1;
                for idx in first..first + count {
                    let catalog = lookup(&dex_register_rows, idx)?[0];
                    let location = lookup(&locations, catalog)?;
                    dex_registers.push(DexRegisterLocation::unpack(location[0], location[1])?);
                }
            }

            stack_maps.push(StackMap {
                native_pc,
                dex_pc: row[2],
                kind,
                register_mask,
                stack_mask,
                inline_infos,
                dex_registers,
            });
        }

        Ok(CodeInfo { frame, stack_maps })
    }

    /// Reads only the frame description at the start of the blob.
    pub fn decode_frame_info(data: &[u8]) -> io::Result<FrameInfo> {
        let mut reader = BitReader::new(data);
        Ok(FrameInfo {
            frame_size: reader.read_varint()? * 16,
            core_spill_mask: reader.read_varint()?,
            fp_spill_mask: reader.read_varint()?,
            code_size: reader.read_varint()?,
            number_of_dex_registers: reader.read_varint()?,
        })
    }

    pub fn stack_map_for_native_pc(&self, native_pc: u32) -> Option<&StackMap> {
        let idx = self
            .stack_maps
            .binary_search_by_key(&native_pc, |m| m.native_pc)
            .ok()?;
        // Several rows may share a PC; prefer the default one.
        let mut first = idx;
        while first > 0 && self.stack_maps[first - 1].native_pc == native_pc {
            first -= 1;
        }
        self.stack_maps[first..]
            .iter()
            .take_while(|m| m.native_pc == native_pc)
            .find(|m| m.kind == StackMapKind::Default)
            .or(Some(&self.stack_maps[first]))
    }

    pub fn stack_map_for_dex_pc(&self, dex_pc: u32, kind: StackMapKind) -> Option<&StackMap> {
        self.stack_maps
            .iter()
            .find(|m| m.dex_pc == dex_pc && m.kind == kind)
    }
}

fn lookup(table: &[Vec<u32>], idx: u32) -> io::Result<&Vec<u32>> {
    table.get(idx as usize).ok_or_else(|| invalid("table index"))
}

fn invalid(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("invalid {}", what))
}

struct Dedup<T: std::hash::Hash + Eq + Clone> {
    values: Vec<T>,
    index: HashMap<T, u32>,
}

impl<T: std::hash::Hash + Eq + Clone> Dedup<T> {
    fn new() -> Dedup<T> {
        Dedup {
            values: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn insert(&mut self, value: T) -> u32 {
        if let Some(&idx) = self.index.get(&value) {
            return idx;
        }
        let idx = self.values.len() as u32;
        self.index.insert(value.clone(), idx);
        self.values.push(value);
        idx
    }
}

fn bits_needed(value: u32) -> u32 {
    32 - value.leading_zeros()
}

fn write_table(writer: &mut BitWriter, columns: usize, rows: &[Vec<u32>]) {
    writer.write_varint(rows.len() as u32);
    if rows.is_empty() {
        return;
    }
    let widths: Vec<u32> = (0..columns)
        .map(|c| rows.iter().map(|r| bits_needed(r[c])).max().unwrap_or(0))
        .collect();
    for &width in &widths {
        writer.write_varint(width);
    }
    for row in rows {
        for (c, &width) in widths.iter().enumerate() {
            writer.write_bits(row[c], width);
        }
    }
}

fn read_table(reader: &mut BitReader, columns: usize) -> io::Result<Vec<Vec<u32>>> {
    let count = reader.read_varint()? as usize;
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut widths = Vec::with_capacity(columns);
    for _ in 0..columns {
        let width = reader.read_varint()?;
        if width > 32 {
            return Err(invalid("column width"));
        }
        widths.push(width);
    }
    let mut rows = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let mut row = Vec::with_capacity(columns);
        for &width in &widths {
            row.push(reader.read_bits(width)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Values below this fit into the 4-bit varint header.
const VARINT_MAX_SMALL: u32 = 11;

struct BitWriter {
    data: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    fn new() -> BitWriter {
        BitWriter {
            data: Vec::new(),
            bit_len: 0,
        }
    }

    fn write_bits(&mut self, value: u32, width: u32) {
        for bit in 0..width {
            let byte = self.bit_len / 8;
            if byte == self.data.len() {
                self.data.push(0);
            }
            if (value >> bit) & 1 != 0 {
                self.data[byte] |= 1 << (self.bit_len % 8);
            }
            self.bit_len += 1;
        }
    }

    fn write_varint(&mut self, value: u32) {
        if value <= VARINT_MAX_SMALL {
            self.write_bits(value, 4);
        } else {
            let bytes = bits_needed(value).div_ceil(8);
            self.write_bits(VARINT_MAX_SMALL + bytes, 4);
            self.write_bits(value, bytes * 8);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.data
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader { data, bit_pos: 0 }
    }

    fn read_bits(&mut self, width: u32) -> io::Result<u32> {
        let mut value = 0u32;
        for bit in 0..width {
            let byte = self
                .data
                .get(self.bit_pos / 8)
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            if (byte >> (self.bit_pos % 8)) & 1 != 0 {
                value |= 1 << bit;
            }
            self.bit_pos += 1;
        }
        Ok(value)
    }

    fn read_varint(&mut self) -> io::Result<u32> {
        let header = self.read_bits(4)?;
        if header <= VARINT_MAX_SMALL {
            Ok(header)
        } else {
            self.read_bits((header - VARINT_MAX_SMALL) * 8)
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn mask(bits: &[usize]) -> FixedBitSet {
        let mut set = FixedBitSet::with_capacity(bits.iter().max().map(|b| b + 1).unwrap_or(0));
        for &b in bits {
            set.insert(b);
        }
        set
    }

    #[test]
    fn test_varint() {
        let mut writer = BitWriter::new();
        for value in [0, 11, 12, 255, 256, 0xffff_ffff] {
            writer.write_varint(value);
        }
        writer.write_bits(0b101, 3);
        let data = writer.finish();

        let mut reader = BitReader::new(&data);
        for value in [0, 11, 12, 255, 256, 0xffff_ffff] {
            assert_eq!(reader.read_varint().unwrap(), value);
        }
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
    }

    #[test]
    fn test_encode_decode() {
        let mut stream = StackMapStream::new();
        stream.begin_method(64, 0x40e0, 0, 2);

        stream.begin_stack_map_entry(3, 10, 0b10, mask(&[1, 3]), StackMapKind::Default);
        stream.add_dex_register_entry(DexRegisterLocation::InRegister(1));
        stream.add_dex_register_entry(DexRegisterLocation::Constant(-7));
        stream.end_stack_map_entry();

        stream.begin_stack_map_entry(9, 24, 0, FixedBitSet::new(), StackMapKind::Default);
        stream.add_inline_info(42, 1, 1);
        stream.add_dex_register_entry(DexRegisterLocation::InStack(8));
        stream.add_dex_register_entry(DexRegisterLocation::None);
        stream.add_dex_register_entry(DexRegisterLocation::InRegister(1));
        stream.end_stack_map_entry();

        stream.end_method(100);
        let data = stream.encode();

        let info = CodeInfo::decode(&data).unwrap();
        assert_eq!(info.frame.frame_size, 64);
        assert_eq!(info.frame.core_spill_mask, 0x40e0);
        assert_eq!(info.frame.code_size, 100);
        assert_eq!(info.stack_maps.len(), 2);

        let map = info.stack_map_for_native_pc(24).unwrap();
        assert_eq!(map.dex_pc, 9);
        assert_eq!(map.inline_infos[0].method_index, 42);
        assert_eq!(map.dex_registers[2], DexRegisterLocation::InRegister(1));

        let map = info.stack_map_for_native_pc(10).unwrap();
        assert_eq!(map.register_mask, 0b10);
        assert!(map.stack_mask.contains(3));
        assert!(info.stack_map_for_native_pc(12).is_none());

        assert_eq!(CodeInfo::decode_frame_info(&data).unwrap(), info.frame);
    }

    #[test]
    #[should_panic(expected = "code order")]
    fn test_out_of_order_pc() {
        let mut stream = StackMapStream::new();
        stream.begin_method(0, 0, 0, 0);
        stream.begin_stack_map_entry(0, 8, 0, FixedBitSet::new(), StackMapKind::Default);
        stream.end_stack_map_entry();
        stream.begin_stack_map_entry(0, 4, 0, FixedBitSet::new(), StackMapKind::Default);
    }

    #[test]
    fn test_truncated_blob() {
        let mut stream = StackMapStream::new();
        stream.begin_method(16, 0x4000, 0, 0);
        stream.begin_stack_map_entry(1, 2, 0xff, mask(&[5]), StackMapKind::Osr);
        stream.end_stack_map_entry();
        stream.end_method(4);
        let data = stream.encode();
        assert!(CodeInfo::decode(&data[..data.len() - 1]).is_err());
    }

    fn location_strategy() -> impl Strategy<Value = DexRegisterLocation> {
        prop_oneof![
            Just(DexRegisterLocation::None),
            any::<i32>().prop_map(DexRegisterLocation::Constant),
            (0i32..1024).prop_map(|o| DexRegisterLocation::InStack(o * 4)),
            (0u8..16).prop_map(DexRegisterLocation::InRegister),
            (0u8..16).prop_map(DexRegisterLocation::InRegisterHigh),
            (0u8..32).prop_map(DexRegisterLocation::InFpuRegister),
            (0u8..32).prop_map(DexRegisterLocation::InFpuRegisterHigh),
        ]
    }

    fn entry_strategy() -> impl Strategy<Value = (u32, u32, u32, Vec<usize>, u8, Vec<(u32, u32)>, bool)> {
        (
            0u32..64,
            any::<u32>(),
            any::<u32>(),
            proptest::collection::vec(0usize..40, 0..6),
            0u8..4,
            proptest::collection::vec((0u32..1000, 0u32..1000), 0..3),
            any::<bool>(),
        )
    }

    proptest! {
        #[test]
        fn prop_stack_map_round_trip(
            dex_registers in 0usize..4,
            entries in proptest::collection::vec(entry_strategy(), 0..12),
            locations in proptest::collection::vec(location_strategy(), 64),
        ) {
            let mut stream = StackMapStream::new();
            stream.begin_method(32, 0x4020, 0x30000, dex_registers as u32);

            let mut expected = Vec::new();
            let mut pc = 0;
            let mut next_location = 0;
            for (pc_delta, dex_pc, register_mask, bits, kind, inlines, with_registers) in entries {
                pc += pc_delta * 2;
                let kind = StackMapKind::try_from(kind).unwrap();
                stream.begin_stack_map_entry(dex_pc, pc, register_mask, mask(&bits), kind);

                let mut inline_infos = Vec::new();
                for (method_index, inline_pc) in inlines {
                    stream.add_inline_info(method_index, inline_pc, 1);
                    inline_infos.push(InlineInfo { method_index, dex_pc: inline_pc, number_of_dex_registers: 1 });
                }

                let mut dex_locations = Vec::new();
                if with_registers {
                    for _ in 0..dex_registers + inline_infos.len() {
                        let location = locations[next_location % locations.len()];
                        next_location += 1;
                        stream.add_dex_register_entry(location);
                        dex_locations.push(location);
                    }
                }
                stream.end_stack_map_entry();

                expected.push(StackMap {
                    native_pc: pc,
                    dex_pc,
                    kind,
                    register_mask,
                    stack_mask: mask(&bits),
                    inline_infos,
                    dex_registers: dex_locations,
                });
            }
            stream.end_method(pc + 2);

            let info = CodeInfo::decode(&stream.encode()).unwrap();
            prop_assert_eq!(info.stack_maps.len(), expected.len());
            for (actual, expected) in info.stack_maps.iter().zip(&expected) {
                prop_assert_eq!(actual.native_pc, expected.native_pc);
                prop_assert_eq!(actual.dex_pc, expected.dex_pc);
                prop_assert_eq!(actual.kind, expected.kind);
                prop_assert_eq!(actual.register_mask, expected.register_mask);
                prop_assert_eq!(
                    actual.stack_mask.ones().collect::<Vec<_>>(),
                    expected.stack_mask.ones().collect::<Vec<_>>()
                );
                prop_assert_eq!(&actual.inline_infos, &expected.inline_infos);
                prop_assert_eq!(&actual.dex_registers, &expected.dex_registers);
            }
        }
    }
}
