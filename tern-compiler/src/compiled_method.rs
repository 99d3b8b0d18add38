use crate::linker_patch::LinkerPatch;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InstructionSet {
    Thumb2,
}

impl InstructionSet {
    /// Added to a code address to form a callable entrypoint.
    pub fn entry_point_delta(self) -> usize {
        match self {
            InstructionSet::Thumb2 => 1,
        }
    }

    pub fn code_alignment(self) -> usize {
        match self {
            InstructionSet::Thumb2 => 8,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum JitRootKind {
    Class { dex_file: u32, type_index: u32 },
    String { dex_file: u32, string_index: u32 },
}

/// A GC root embedded in JIT code. The literal at `literal_offset` is
/// patched with the address of the root's slot in the roots table.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct JitRootPatch {
    pub root: JitRootKind,
    pub literal_offset: u32,
}

/// Output of compiling one method.
#[derive(Clone, Debug)]
pub struct CompiledMethod {
    pub isa: InstructionSet,
    pub code: Vec<u8>,
    pub stack_map: Vec<u8>,
    pub cfi: Vec<u8>,
    pub patches: Vec<LinkerPatch>,
    pub jit_roots: Vec<JitRootPatch>,
    pub frame_size: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub is_intrinsic: bool,
    pub is_osr: bool,
    pub is_baseline: bool,
    /// Disassembly, when requested by the options.
    pub asm_listing: Option<String>,
}

impl CompiledMethod {
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Distinct roots in the order their table slots are assigned.
    pub fn unique_roots(&self) -> Vec<JitRootKind> {
        let mut roots: Vec<JitRootKind> = Vec::new();
        for patch in &self.jit_roots {
            if !roots.contains(&patch.root) {
                roots.push(patch.root);
            }
        }
        roots
    }

    /// Writes `table_address + 4 * slot` into each root literal of `code`,
    /// a copy of `self.code` placed at its final address.
    pub fn emit_jit_root_patches(&self, code: &mut [u8], table_address: u32) {
        let roots = self.unique_roots();
        for patch in &self.jit_roots {
            let slot = roots
                .iter()
                .position(|r| *r == patch.root)
                .expect("root missing from table") as u32;
            let offset = patch.literal_offset as usize;
            code[offset..offset + 4].copy_from_slice(&(table_address + slot * 4).to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_patches_share_slots() {
        let class = JitRootKind::Class {
            dex_file: 0,
            type_index: 3,
        };
        let string = JitRootKind::String {
            dex_file: 0,
            string_index: 1,
        };
        let method = CompiledMethod {
            isa: InstructionSet::Thumb2,
            code: vec![0; 12],
            stack_map: Vec::new(),
            cfi: Vec::new(),
            patches: Vec::new(),
            jit_roots: vec![
                JitRootPatch { root: class, literal_offset: 0 },
                JitRootPatch { root: string, literal_offset: 4 },
                JitRootPatch { root: class, literal_offset: 8 },
            ],
            frame_size: 0,
            core_spill_mask: 0,
            fp_spill_mask: 0,
            is_intrinsic: false,
            is_osr: false,
            is_baseline: false,
            asm_listing: None,
        };
        assert_eq!(method.unique_roots(), vec![class, string]);

        let mut code = method.code.clone();
        method.emit_jit_root_patches(&mut code, 0x1000);
        assert_eq!(&code[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(&code[4..8], &0x1004u32.to_le_bytes());
        assert_eq!(&code[8..12], &0x1000u32.to_le_bytes());
    }
}
