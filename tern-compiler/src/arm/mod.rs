//! Thumb-2 backend: location constraints, the macro assembler and the code
//! generator turning an allocated graph into a `CompiledMethod`.

use tern_asm::thumb2::{DRegister, Register, SRegister, LR, R0, R1, R2, R3, R8, R9};

use crate::hir::DataType;
use crate::locations::{Location, RegisterSet};
use crate::options::CompilerOptions;
use crate::register_allocator::RegisterConfig;

pub mod codegen;
pub mod locations_builder;
pub mod masm;
pub mod read_barrier;
pub mod slow_paths;

mod lower_arith;
mod lower_control;
mod lower_invoke;
mod lower_memory;
mod lower_types;
#[cfg(test)]
pub(crate) mod test_util;

pub use self::codegen::CodeGeneratorArm;
pub use self::locations_builder::build_locations;

/// Register holding the current thread.
pub const TR: Register = R9;
/// Register holding the "GC is marking" flag when read barriers are on.
pub const MR: Register = R8;
/// Register holding the callee method on entry.
pub const METHOD_REGISTER: Register = R0;

/// S30/S31 (D15) are kept free as FP scratch registers.
pub const FP_SCRATCH: DRegister = DRegister::new(15);

const CORE_ALLOCATABLE: u32 = 0b0000_1100_1111_1111;
const CORE_CALLER_SAVES: u32 = 0b0001_0000_0001_1111;
const CORE_CALLEE_SAVES: u32 = 0b0100_1101_1110_0000;
const FP_ALLOCATABLE: u32 = 0x3fff_ffff;
const FP_CALLER_SAVES: u32 = 0x0000_ffff;
const FP_CALLEE_SAVES: u32 = 0xffff_0000;

pub fn register_config(options: &CompilerOptions) -> RegisterConfig {
    let mut core = CORE_ALLOCATABLE;
    if !options.emit_read_barrier {
        core |= MR.mask();
    }

    RegisterConfig {
        core,
        core_pairs: vec![(0, 1), (2, 3), (4, 5), (6, 7), (10, 11)],
        fp: FP_ALLOCATABLE,
        caller_save_core: CORE_CALLER_SAVES,
        caller_save_fp: FP_CALLER_SAVES,
        callee_save_core: CORE_CALLEE_SAVES,
        callee_save_fp: FP_CALLEE_SAVES,
        return_address: LR.code() as u8,
    }
}

pub fn caller_save_set() -> RegisterSet {
    RegisterSet::new(CORE_CALLER_SAVES, FP_CALLER_SAVES)
}

/// Argument registers of managed (dex) calls; R0 carries the method.
pub const DEX_CORE_ARGS: [Register; 3] = [R1, R2, R3];
pub const DEX_FP_ARG_COUNT: u32 = 16;

/// Argument registers of runtime entrypoint calls.
pub const RUNTIME_CORE_ARGS: [Register; 4] = [R0, R1, R2, R3];

/// Offset of outgoing stack argument `index` from SP at the call.
pub fn stack_arg_offset(index: u32) -> i32 {
    4 + 4 * index as i32
}

/// Assigns locations to the arguments of a managed call in order.
#[derive(Default)]
pub struct DexCallingConvention {
    gp_index: u32,
    float_index: u32,
    double_index: u32,
    stack_index: u32,
}

impl DexCallingConvention {
    pub fn new() -> DexCallingConvention {
        DexCallingConvention::default()
    }

    pub fn next(&mut self, ty: DataType) -> Location {
        match ty.kind() {
            DataType::Int64 => {
                // A long never starts in R1: it takes the R2/R3 pair instead.
                if self.gp_index == 0 {
                    self.gp_index += 1;
                }
                let index = self.gp_index;
                let stack_index = self.stack_index;
                self.gp_index += 2;
                self.stack_index += 2;
                if index + 1 < DEX_CORE_ARGS.len() as u32 {
                    let low = DEX_CORE_ARGS[index as usize].code() as u8;
                    Location::register_pair(low, low + 1)
                } else {
                    Location::DoubleStackSlot(stack_arg_offset(stack_index))
                }
            }
            DataType::Float32 => {
                let stack_index = self.stack_index;
                self.stack_index += 1;
                if self.float_index % 2 == 0 {
                    self.float_index = self.float_index.max(self.double_index);
                }
                if self.float_index < DEX_FP_ARG_COUNT {
                    let reg = self.float_index;
                    self.float_index += 1;
                    Location::FpuRegister(reg as u8)
                } else {
                    Location::StackSlot(stack_arg_offset(stack_index))
                }
            }
            DataType::Float64 => {
                self.double_index = self.double_index.max(round_up_even(self.float_index));
                let stack_index = self.stack_index;
                self.stack_index += 2;
                if self.double_index + 1 < DEX_FP_ARG_COUNT {
                    let reg = self.double_index as u8;
                    self.double_index += 2;
                    Location::fpu_register_pair(reg, reg + 1)
                } else {
                    Location::DoubleStackSlot(stack_arg_offset(stack_index))
                }
            }
            _ => {
                let index = self.gp_index;
                let stack_index = self.stack_index;
                self.gp_index += 1;
                self.stack_index += 1;
                if index < DEX_CORE_ARGS.len() as u32 {
                    Location::Register(DEX_CORE_ARGS[index as usize].code() as u8)
                } else {
                    Location::StackSlot(stack_arg_offset(stack_index))
                }
            }
        }
    }

    /// Words of outgoing stack space used so far.
    pub fn stack_words(&self) -> u32 {
        self.stack_index
    }
}

fn round_up_even(value: u32) -> u32 {
    (value + 1) & !1
}

/// Where a value of `ty` is returned.
pub fn return_location(ty: DataType) -> Location {
    match ty.kind() {
        DataType::Void => Location::NoLocation,
        DataType::Int64 => Location::register_pair(0, 1),
        DataType::Float32 => Location::FpuRegister(0),
        DataType::Float64 => Location::fpu_register_pair(0, 1),
        _ => Location::Register(0),
    }
}

/// Location of runtime call argument `index` of type `ty`.
pub fn runtime_arg_location(index: usize, ty: DataType) -> Location {
    match ty.kind() {
        DataType::Int64 => {
            let low = RUNTIME_CORE_ARGS[index].code() as u8;
            Location::register_pair(low, low + 1)
        }
        DataType::Float32 => Location::FpuRegister(index as u8),
        DataType::Float64 => Location::fpu_register_pair(2 * index as u8, 2 * index as u8 + 1),
        _ => Location::Register(RUNTIME_CORE_ARGS[index].code() as u8),
    }
}

pub fn reg(location: Location) -> Register {
    Register::new(location.reg())
}

pub fn low_reg(location: Location) -> Register {
    Register::new(location.low())
}

pub fn high_reg(location: Location) -> Register {
    Register::new(location.high())
}

pub fn sreg(location: Location) -> SRegister {
    SRegister::new(location.reg())
}

/// D register of an FP register pair; the pair is always even aligned.
pub fn dreg(location: Location) -> DRegister {
    let low = location.low();
    assert!(low % 2 == 0, "unaligned FP register pair {:?}", location);
    DRegister::from_low(SRegister::new(low))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(types: &[DataType]) -> Vec<Location> {
        let mut cc = DexCallingConvention::new();
        types.iter().map(|ty| cc.next(*ty)).collect()
    }

    #[test]
    fn test_long_skips_r1() {
        assert_eq!(
            params(&[DataType::Int64, DataType::Int32]),
            vec![Location::register_pair(2, 3), Location::StackSlot(12)]
        );
        assert_eq!(
            params(&[DataType::Int32, DataType::Int64]),
            vec![Location::Register(1), Location::register_pair(2, 3)]
        );
    }

    #[test]
    fn test_stack_arguments() {
        let locations = params(&[DataType::Reference, DataType::Int32, DataType::Int32, DataType::Int32, DataType::Int64]);
        assert_eq!(locations[2], Location::Register(3));
        assert_eq!(locations[3], Location::StackSlot(16));
        assert_eq!(locations[4], Location::DoubleStackSlot(20));
    }

    #[test]
    fn test_fp_back_filling() {
        assert_eq!(
            params(&[DataType::Float32, DataType::Float64, DataType::Float32]),
            vec![
                Location::FpuRegister(0),
                Location::fpu_register_pair(2, 3),
                Location::FpuRegister(1),
            ]
        );
    }

    #[test]
    fn test_register_config() {
        let mut options = CompilerOptions::default();
        assert_eq!(register_config(&options).core & MR.mask(), 0);
        options.emit_read_barrier = false;
        let config = register_config(&options);
        assert_ne!(config.core & MR.mask(), 0);
        assert_eq!(config.core & TR.mask(), 0);
        assert_eq!(config.fp & FP_SCRATCH.low().mask(), 0);
    }
}
