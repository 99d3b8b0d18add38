use std::fmt;
use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fixedbitset::FixedBitSet;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::hir::{DataType, InstId};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Policy {
    RequiresRegister,
    RequiresFpuRegister,
    SameAsFirstInput,
}

/// Where a value lives. FP registers are numbered by their single-precision
/// index, so `FpuRegisterPair(2, 3)` is `d1`.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    NoLocation,
    Constant(InstId),
    Register(u8),
    RegisterPair(u8, u8),
    FpuRegister(u8),
    FpuRegisterPair(u8, u8),
    StackSlot(i32),
    DoubleStackSlot(i32),
    Unallocated(Policy),
    Any,
}

impl Location {
    pub fn register_pair(low: u8, high: u8) -> Location {
        assert!(low & 1 == 0 && high == low + 1, "misaligned register pair");
        Location::RegisterPair(low, high)
    }

    pub fn fpu_register_pair(low: u8, high: u8) -> Location {
        assert!(low & 1 == 0 && high == low + 1, "misaligned fpu register pair");
        Location::FpuRegisterPair(low, high)
    }

    pub fn requires_register() -> Location {
        Location::Unallocated(Policy::RequiresRegister)
    }

    pub fn requires_fpu_register() -> Location {
        Location::Unallocated(Policy::RequiresFpuRegister)
    }

    pub fn same_as_first_input() -> Location {
        Location::Unallocated(Policy::SameAsFirstInput)
    }

    pub fn is_valid(&self) -> bool {
        *self != Location::NoLocation
    }

    pub fn is_invalid(&self) -> bool {
        *self == Location::NoLocation
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Location::Constant(_))
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Location::Register(_))
    }

    pub fn is_register_pair(&self) -> bool {
        matches!(self, Location::RegisterPair(..))
    }

    pub fn is_fpu_register(&self) -> bool {
        matches!(self, Location::FpuRegister(_))
    }

    pub fn is_fpu_register_pair(&self) -> bool {
        matches!(self, Location::FpuRegisterPair(..))
    }

    pub fn is_stack_slot(&self) -> bool {
        matches!(self, Location::StackSlot(_))
    }

    pub fn is_double_stack_slot(&self) -> bool {
        matches!(self, Location::DoubleStackSlot(_))
    }

    pub fn is_memory(&self) -> bool {
        self.is_stack_slot() || self.is_double_stack_slot()
    }

    pub fn is_unallocated(&self) -> bool {
        matches!(self, Location::Unallocated(_) | Location::Any)
    }

    pub fn is_register_kind(&self) -> bool {
        matches!(
            self,
            Location::Register(_)
                | Location::RegisterPair(..)
                | Location::FpuRegister(_)
                | Location::FpuRegisterPair(..)
        )
    }

    pub fn constant(&self) -> InstId {
        match *self {
            Location::Constant(id) => id,
            _ => panic!("not a constant: {:?}", self),
        }
    }

    /// Core register number, or single-precision index for FP registers.
    pub fn reg(&self) -> u8 {
        match *self {
            Location::Register(r) | Location::FpuRegister(r) => r,
            _ => panic!("not a single register: {:?}", self),
        }
    }

    pub fn low(&self) -> u8 {
        match *self {
            Location::RegisterPair(lo, _) | Location::FpuRegisterPair(lo, _) => lo,
            _ => panic!("not a register pair: {:?}", self),
        }
    }

    pub fn high(&self) -> u8 {
        match *self {
            Location::RegisterPair(_, hi) | Location::FpuRegisterPair(_, hi) => hi,
            _ => panic!("not a register pair: {:?}", self),
        }
    }

    pub fn stack_index(&self) -> i32 {
        match *self {
            Location::StackSlot(offset) | Location::DoubleStackSlot(offset) => offset,
            _ => panic!("not a stack slot: {:?}", self),
        }
    }

    pub fn high_stack_index(&self) -> i32 {
        match *self {
            Location::DoubleStackSlot(offset) => offset + 4,
            _ => panic!("not a double stack slot: {:?}", self),
        }
    }

    pub fn to_low(&self) -> Location {
        match *self {
            Location::RegisterPair(lo, _) => Location::Register(lo),
            Location::FpuRegisterPair(lo, _) => Location::FpuRegister(lo),
            Location::DoubleStackSlot(offset) => Location::StackSlot(offset),
            _ => panic!("no low half: {:?}", self),
        }
    }

    pub fn to_high(&self) -> Location {
        match *self {
            Location::RegisterPair(_, hi) => Location::Register(hi),
            Location::FpuRegisterPair(_, hi) => Location::FpuRegister(hi),
            Location::DoubleStackSlot(offset) => Location::StackSlot(offset + 4),
            _ => panic!("no high half: {:?}", self),
        }
    }

    pub fn core_mask(&self) -> u32 {
        match *self {
            Location::Register(r) => 1 << r,
            Location::RegisterPair(lo, hi) => (1 << lo) | (1 << hi),
            _ => 0,
        }
    }

    pub fn fp_mask(&self) -> u32 {
        match *self {
            Location::FpuRegister(r) => 1 << r,
            Location::FpuRegisterPair(lo, hi) => (1 << lo) | (1 << hi),
            _ => 0,
        }
    }

    fn stack_range(&self) -> Option<(i32, i32)> {
        match *self {
            Location::StackSlot(offset) => Some((offset, offset + 4)),
            Location::DoubleStackSlot(offset) => Some((offset, offset + 8)),
            _ => None,
        }
    }

    pub fn overlaps(&self, other: &Location) -> bool {
        if self == other && self.is_valid() && !self.is_constant() {
            return true;
        }
        if self.core_mask() & other.core_mask() != 0 || self.fp_mask() & other.fp_mask() != 0 {
            return true;
        }
        match (self.stack_range(), other.stack_range()) {
            (Some((a0, a1)), Some((b0, b1))) => a0 < b1 && b0 < a1,
            _ => false,
        }
    }

    pub fn equals_or_contains(&self, other: &Location) -> bool {
        if self == other {
            return true;
        }
        match *self {
            Location::RegisterPair(..) | Location::FpuRegisterPair(..) | Location::DoubleStackSlot(_) => {
                self.to_low() == *other || self.to_high() == *other
            }
            _ => false,
        }
    }

    /// Stack slot sized for `ty`.
    pub fn stack_slot_for(ty: DataType, offset: i32) -> Location {
        if ty.is_64bit() {
            Location::DoubleStackSlot(offset)
        } else {
            Location::StackSlot(offset)
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let (tag, a, b): (u8, u32, u32) = match *self {
            Location::NoLocation => (0, 0, 0),
            Location::Constant(id) => (1, id.0, 0),
            Location::Register(r) => (2, r as u32, 0),
            Location::RegisterPair(lo, hi) => (3, lo as u32, hi as u32),
            Location::FpuRegister(r) => (4, r as u32, 0),
            Location::FpuRegisterPair(lo, hi) => (5, lo as u32, hi as u32),
            Location::StackSlot(offset) => (6, offset as u32, 0),
            Location::DoubleStackSlot(offset) => (7, offset as u32, 0),
            Location::Unallocated(policy) => (8, u8::from(policy) as u32, 0),
            Location::Any => (9, 0, 0),
        };
        out.push(tag);
        out.write_u32::<LittleEndian>(a).expect("write to vec");
        out.write_u32::<LittleEndian>(b).expect("write to vec");
    }

    fn decode(data: &mut &[u8]) -> io::Result<Location> {
        let tag = data.read_u8()?;
        let a = data.read_u32::<LittleEndian>()?;
        let b = data.read_u32::<LittleEndian>()?;
        let location = match tag {
            0 => Location::NoLocation,
            1 => Location::Constant(InstId(a)),
            2 => Location::Register(a as u8),
            3 => Location::RegisterPair(a as u8, b as u8),
            4 => Location::FpuRegister(a as u8),
            5 => Location::FpuRegisterPair(a as u8, b as u8),
            6 => Location::StackSlot(a as i32),
            7 => Location::DoubleStackSlot(a as i32),
            8 => Location::Unallocated(Policy::try_from(a as u8).map_err(invalid_data)?),
            9 => Location::Any,
            _ => return Err(invalid_data(tag)),
        };
        Ok(location)
    }
}

fn invalid_data<T: fmt::Debug>(value: T) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("invalid location data {:?}", value))
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Location::NoLocation => write!(f, "-"),
            Location::Constant(id) => write!(f, "#{:?}", id),
            Location::Register(r) => write!(f, "r{}", r),
            Location::RegisterPair(lo, hi) => write!(f, "r{}:r{}", lo, hi),
            Location::FpuRegister(r) => write!(f, "s{}", r),
            Location::FpuRegisterPair(lo, _) => write!(f, "d{}", lo / 2),
            Location::StackSlot(offset) => write!(f, "[sp+{}]", offset),
            Location::DoubleStackSlot(offset) => write!(f, "[sp+{}]:8", offset),
            Location::Unallocated(policy) => write!(f, "?{:?}", policy),
            Location::Any => write!(f, "?any"),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CallKind {
    NoCall,
    CallOnSlowPath,
    CallOnMainOnly,
    CallOnMainAndSlowPath,
}

#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct RegisterSet {
    pub core: u32,
    pub fp: u32,
}

impl RegisterSet {
    pub fn empty() -> RegisterSet {
        RegisterSet { core: 0, fp: 0 }
    }

    pub fn new(core: u32, fp: u32) -> RegisterSet {
        RegisterSet { core, fp }
    }

    pub fn add(&mut self, location: Location) {
        self.core |= location.core_mask();
        self.fp |= location.fp_mask();
    }

    pub fn remove(&mut self, location: Location) {
        self.core &= !location.core_mask();
        self.fp &= !location.fp_mask();
    }

    pub fn contains_core(&self, reg: u8) -> bool {
        self.core & (1 << reg) != 0
    }

    pub fn contains_fp(&self, reg: u8) -> bool {
        self.fp & (1 << reg) != 0
    }

    pub fn intersect(&self, other: RegisterSet) -> RegisterSet {
        RegisterSet {
            core: self.core & other.core,
            fp: self.fp & other.fp,
        }
    }

    pub fn union(&self, other: RegisterSet) -> RegisterSet {
        RegisterSet {
            core: self.core | other.core,
            fp: self.fp | other.fp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.core == 0 && self.fp == 0
    }

    pub fn core_count(&self) -> u32 {
        self.core.count_ones()
    }

    pub fn fp_count(&self) -> u32 {
        self.fp.count_ones()
    }
}

/// Location constraints and results for one instruction.
#[derive(Clone, PartialEq, Debug)]
pub struct LocationSummary {
    pub inputs: Vec<Location>,
    pub temps: Vec<Location>,
    pub output: Location,
    pub output_overlaps: bool,
    pub call_kind: CallKind,
    pub intrinsified: bool,
    pub custom_slow_path_caller_saves: Option<RegisterSet>,
    pub live_registers: RegisterSet,
    pub register_mask: u32,
    pub stack_mask: FixedBitSet,
}

impl LocationSummary {
    pub fn new(input_count: usize, call_kind: CallKind) -> LocationSummary {
        LocationSummary {
            inputs: vec![Location::NoLocation; input_count],
            temps: Vec::new(),
            output: Location::NoLocation,
            output_overlaps: true,
            call_kind,
            intrinsified: false,
            custom_slow_path_caller_saves: None,
            live_registers: RegisterSet::empty(),
            register_mask: 0,
            stack_mask: FixedBitSet::new(),
        }
    }

    pub fn in_at(&self, idx: usize) -> Location {
        self.inputs[idx]
    }

    pub fn set_in_at(&mut self, idx: usize, location: Location) {
        self.inputs[idx] = location;
    }

    pub fn out(&self) -> Location {
        self.output
    }

    pub fn set_out(&mut self, location: Location) {
        self.set_out_overlap(location, true);
    }

    pub fn set_out_overlap(&mut self, location: Location, overlaps: bool) {
        assert!(self.output.is_invalid(), "output set twice");
        self.output = location;
        self.output_overlaps = overlaps;
    }

    pub fn update_out(&mut self, location: Location) {
        self.output = location;
    }

    pub fn add_temp(&mut self, location: Location) {
        self.temps.push(location);
    }

    pub fn add_register_temps(&mut self, count: usize) {
        for _ in 0..count {
            self.add_temp(Location::requires_register());
        }
    }

    pub fn temp(&self, idx: usize) -> Location {
        self.temps[idx]
    }

    pub fn will_call(&self) -> bool {
        self.call_kind == CallKind::CallOnMainOnly || self.call_kind == CallKind::CallOnMainAndSlowPath
    }

    pub fn can_call(&self) -> bool {
        self.call_kind != CallKind::NoCall
    }

    pub fn only_calls_on_slow_path(&self) -> bool {
        self.call_kind == CallKind::CallOnSlowPath
    }

    pub fn calls_on_main_and_slow_path(&self) -> bool {
        self.call_kind == CallKind::CallOnMainAndSlowPath
    }

    pub fn needs_safepoint(&self) -> bool {
        self.can_call()
    }

    /// Overrides which live registers a slow path must preserve.
    pub fn set_custom_slow_path_caller_saves(&mut self, saves: RegisterSet) {
        assert!(self.only_calls_on_slow_path());
        self.custom_slow_path_caller_saves = Some(saves);
    }

    pub fn has_custom_slow_path_calling_convention(&self) -> bool {
        self.custom_slow_path_caller_saves.is_some()
    }

    pub fn add_live_register(&mut self, location: Location) {
        self.live_registers.add(location);
    }

    pub fn set_register_bit(&mut self, reg: u8) {
        self.register_mask |= 1 << reg;
    }

    pub fn set_stack_bit(&mut self, slot: usize) {
        if slot >= self.stack_mask.len() {
            self.stack_mask.grow(slot + 1);
        }
        self.stack_mask.insert(slot);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.inputs.len() as u32).expect("write to vec");
        for input in &self.inputs {
            input.encode(&mut out);
        }
        out.write_u32::<LittleEndian>(self.temps.len() as u32).expect("write to vec");
        for temp in &self.temps {
            temp.encode(&mut out);
        }
        self.output.encode(&mut out);
        out.push(self.output_overlaps as u8);
        out.push(self.call_kind.into());
        out.push(self.intrinsified as u8);
        match self.custom_slow_path_caller_saves {
            Some(saves) => {
                out.push(1);
                out.write_u32::<LittleEndian>(saves.core).expect("write to vec");
                out.write_u32::<LittleEndian>(saves.fp).expect("write to vec");
            }
            None => out.push(0),
        }
        out.write_u32::<LittleEndian>(self.live_registers.core).expect("write to vec");
        out.write_u32::<LittleEndian>(self.live_registers.fp).expect("write to vec");
        out.write_u32::<LittleEndian>(self.register_mask).expect("write to vec");
        out.write_u32::<LittleEndian>(self.stack_mask.len() as u32).expect("write to vec");
        let mut bytes = vec![0u8; self.stack_mask.len().div_ceil(8)];
        for bit in self.stack_mask.ones() {
            bytes[bit / 8] |= 1 << (bit % 8);
        }
        out.extend_from_slice(&bytes);
        out
    }

    pub fn decode(mut data: &[u8]) -> io::Result<LocationSummary> {
        let data = &mut data;
        let input_count = data.read_u32::<LittleEndian>()? as usize;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(Location::decode(data)?);
        }
        let temp_count = data.read_u32::<LittleEndian>()? as usize;
        let mut temps = Vec::with_capacity(temp_count);
        for _ in 0..temp_count {
            temps.push(Location::decode(data)?);
        }
        let output = Location::decode(data)?;
        let output_overlaps = data.read_u8()? != 0;
        let call_kind = CallKind::try_from(data.read_u8()?).map_err(invalid_data)?;
        let intrinsified = data.read_u8()? != 0;
        let custom_slow_path_caller_saves = if data.read_u8()? != 0 {
            let core = data.read_u32::<LittleEndian>()?;
            let fp = data.read_u32::<LittleEndian>()?;
            Some(RegisterSet::new(core, fp))
        } else {
            None
        };
        let live_core = data.read_u32::<LittleEndian>()?;
        let live_fp = data.read_u32::<LittleEndian>()?;
        let register_mask = data.read_u32::<LittleEndian>()?;
        let bits = data.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; bits.div_ceil(8)];
        data.read_exact(&mut bytes)?;
        let mut stack_mask = FixedBitSet::with_capacity(bits);
        for bit in 0..bits {
            if bytes[bit / 8] & (1 << (bit % 8)) != 0 {
                stack_mask.insert(bit);
            }
        }

        Ok(LocationSummary {
            inputs,
            temps,
            output,
            output_overlaps,
            call_kind,
            intrinsified,
            custom_slow_path_caller_saves,
            live_registers: RegisterSet::new(live_core, live_fp),
            register_mask,
            stack_mask,
        })
    }
}

/// One move of a parallel move. A move with an invalid destination has
/// been performed or eliminated.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct MoveOperands {
    pub source: Location,
    pub destination: Location,
    pub ty: DataType,
    pub value: Option<InstId>,
}

impl MoveOperands {
    pub fn new(source: Location, destination: Location, ty: DataType, value: Option<InstId>) -> MoveOperands {
        MoveOperands {
            source,
            destination,
            ty,
            value,
        }
    }

    pub fn is_redundant(&self) -> bool {
        self.destination.is_invalid() || self.source == self.destination
    }

    pub fn is_eliminated(&self) -> bool {
        self.source.is_invalid()
    }

    pub fn eliminate(&mut self) {
        self.source = Location::NoLocation;
        self.destination = Location::NoLocation;
    }

    pub fn blocks(&self, location: &Location) -> bool {
        !self.is_eliminated() && self.source.overlaps(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_halves() {
        let pair = Location::register_pair(2, 3);
        assert_eq!(pair.to_low(), Location::Register(2));
        assert_eq!(pair.to_high(), Location::Register(3));
        assert!(pair.overlaps(&Location::Register(3)));
        assert!(!pair.overlaps(&Location::Register(4)));

        let slot = Location::DoubleStackSlot(8);
        assert_eq!(slot.to_high(), Location::StackSlot(12));
        assert!(slot.overlaps(&Location::StackSlot(12)));
        assert!(!slot.overlaps(&Location::StackSlot(16)));
    }

    #[test]
    #[should_panic]
    fn test_misaligned_pair() {
        Location::register_pair(1, 2);
    }

    #[test]
    fn test_fpu_pair_overlaps_single() {
        let d1 = Location::fpu_register_pair(2, 3);
        assert!(d1.overlaps(&Location::FpuRegister(3)));
        assert!(!d1.overlaps(&Location::Register(3)));
    }

    #[test]
    fn test_summary_round_trip() {
        let mut summary = LocationSummary::new(3, CallKind::CallOnSlowPath);
        summary.set_in_at(0, Location::Register(1));
        summary.set_in_at(1, Location::Constant(InstId(7)));
        summary.set_in_at(2, Location::fpu_register_pair(4, 5));
        summary.add_temp(Location::DoubleStackSlot(16));
        summary.add_temp(Location::requires_fpu_register());
        summary.set_out_overlap(Location::register_pair(2, 3), false);
        summary.intrinsified = true;
        summary.set_custom_slow_path_caller_saves(RegisterSet::new(0b1010, 0x3));
        summary.add_live_register(Location::Register(4));
        summary.add_live_register(Location::FpuRegister(17));
        summary.set_register_bit(4);
        summary.set_stack_bit(3);
        summary.set_stack_bit(9);

        let decoded = LocationSummary::decode(&summary.encode()).unwrap();
        assert_eq!(decoded, summary);
    }

    #[test]
    fn test_summary_decode_truncated() {
        let summary = LocationSummary::new(1, CallKind::NoCall);
        let bytes = summary.encode();
        assert!(LocationSummary::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
