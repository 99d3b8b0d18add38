//! Records of code locations a linker (or the JIT) has to fix up.

use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tern_asm::Label;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LinkerPatchKind {
    IntrinsicReference,
    BootImageRelRo,
    RelativeMethod,
    MethodAppImageRelRo,
    MethodBssEntry,
    CallRelative,
    CallEntrypoint,
    RelativeType,
    TypeAppImageRelRo,
    TypeBssEntry,
    PublicTypeBssEntry,
    PackageTypeBssEntry,
    RelativeString,
    StringBssEntry,
    BakerReadBarrierBranch,
}

impl LinkerPatchKind {
    /// PC-relative patches come in MOVW/MOVT pairs anchored at an `ADD rd, pc`.
    pub fn is_pc_relative(self) -> bool {
        !matches!(
            self,
            LinkerPatchKind::CallRelative
                | LinkerPatchKind::CallEntrypoint
                | LinkerPatchKind::BakerReadBarrierBranch
        )
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LinkerPatch {
    pub literal_offset: u32,
    pub kind: LinkerPatchKind,
    pub dex_file: u32,
    /// Method, type or string index; boot image offset; entrypoint offset
    /// or the encoded read barrier thunk, depending on `kind`.
    pub target: u32,
    /// Offset of the `ADD rd, pc` anchoring a PC-relative pair.
    pub pc_insn_offset: u32,
}

const RECORD_SIZE: usize = 16;

impl LinkerPatch {
    pub fn encode_all(patches: &[LinkerPatch]) -> Vec<u8> {
        let mut data = Vec::with_capacity(patches.len() * RECORD_SIZE);
        for patch in patches {
            data.write_u32::<LittleEndian>(patch.literal_offset).unwrap();
            data.write_u8(patch.kind.into()).unwrap();
            data.write_u8(0).unwrap();
            data.write_u16::<LittleEndian>(patch.dex_file as u16).unwrap();
            data.write_u32::<LittleEndian>(patch.target).unwrap();
            data.write_u32::<LittleEndian>(patch.pc_insn_offset).unwrap();
        }
        data
    }

    pub fn decode_all(mut data: &[u8]) -> io::Result<Vec<LinkerPatch>> {
        if data.len() % RECORD_SIZE != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated patch record"));
        }
        let mut patches = Vec::with_capacity(data.len() / RECORD_SIZE);
        while !data.is_empty() {
            let literal_offset = data.read_u32::<LittleEndian>()?;
            let kind = LinkerPatchKind::try_from(data.read_u8()?)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unknown patch kind"))?;
            data.read_u8()?;
            let dex_file = data.read_u16::<LittleEndian>()? as u32;
            let target = data.read_u32::<LittleEndian>()?;
            let pc_insn_offset = data.read_u32::<LittleEndian>()?;
            patches.push(LinkerPatch {
                literal_offset,
                kind,
                dex_file,
                target,
                pc_insn_offset,
            });
        }
        Ok(patches)
    }
}

/// Labels of a `MOVW rd, #0; MOVT rd, #0; ADD rd, pc` sequence.
#[derive(Copy, Clone, Debug)]
pub struct PcRelativePatchInfo {
    pub kind: LinkerPatchKind,
    pub dex_file: u32,
    pub target: u32,
    pub movw_label: Label,
    pub movt_label: Label,
    pub add_pc_label: Label,
}

/// Code generator side bookkeeping of patch sites, resolved into
/// `LinkerPatch` records once all labels are bound.
#[derive(Default)]
pub struct PatchLog {
    pc_relative: Vec<PcRelativePatchInfo>,
    calls: Vec<(Label, LinkerPatchKind, u32, u32)>,
    baker_read_barriers: Vec<(Label, u32)>,
}

impl PatchLog {
    pub fn new() -> PatchLog {
        PatchLog::default()
    }

    pub fn add_pc_relative(&mut self, info: PcRelativePatchInfo) {
        assert!(info.kind.is_pc_relative());
        self.pc_relative.push(info);
    }

    /// A `BL` to `method_index` resolved by the linker.
    pub fn add_call_relative(&mut self, label: Label, dex_file: u32, method_index: u32) {
        self.calls
            .push((label, LinkerPatchKind::CallRelative, dex_file, method_index));
    }

    pub fn add_call_entrypoint(&mut self, label: Label, entrypoint_offset: u32) {
        self.calls
            .push((label, LinkerPatchKind::CallEntrypoint, 0, entrypoint_offset));
    }

    /// A branch to the read barrier thunk identified by `custom_data`.
    pub fn add_baker_read_barrier(&mut self, label: Label, custom_data: u32) {
        self.baker_read_barriers.push((label, custom_data));
    }

    pub fn is_empty(&self) -> bool {
        self.pc_relative.is_empty() && self.calls.is_empty() && self.baker_read_barriers.is_empty()
    }

    /// Resolves labels to offsets; the result is sorted by `literal_offset`.
    pub fn emit(&self, offset: impl Fn(Label) -> u32) -> Vec<LinkerPatch> {
        let mut patches = Vec::new();

        for info in &self.pc_relative {
            let pc_insn_offset = offset(info.add_pc_label);
            for label in [info.movw_label, info.movt_label] {
                patches.push(LinkerPatch {
                    literal_offset: offset(label),
                    kind: info.kind,
                    dex_file: info.dex_file,
                    target: info.target,
                    pc_insn_offset,
                });
            }
        }

        for &(label, kind, dex_file, target) in &self.calls {
            patches.push(LinkerPatch {
                literal_offset: offset(label),
                kind,
                dex_file,
                target,
                pc_insn_offset: 0,
            });
        }

        for &(label, custom_data) in &self.baker_read_barriers {
            patches.push(LinkerPatch {
                literal_offset: offset(label),
                kind: LinkerPatchKind::BakerReadBarrierBranch,
                dex_file: 0,
                target: custom_data,
                pc_insn_offset: 0,
            });
        }

        patches.sort_by_key(|p| p.literal_offset);
        patches
    }
}

#[cfg(test)]
mod tests {
    use tern_asm::Assembler;
    use tern_asm::thumb2::{PC, R0};

    use super::*;

    #[test]
    fn test_pc_relative_pair() {
        let mut asm = Assembler::new();
        let movw_label = asm.create_and_bind_label();
        asm.movw(R0, 0);
        let movt_label = asm.create_and_bind_label();
        asm.movt(R0, 0);
        let add_pc_label = asm.create_and_bind_label();
        asm.add_reg16(R0, PC);

        let call = asm.create_and_bind_label();
        asm.bl_placeholder();

        let mut log = PatchLog::new();
        log.add_call_relative(call, 0, 9);
        log.add_pc_relative(PcRelativePatchInfo {
            kind: LinkerPatchKind::TypeBssEntry,
            dex_file: 1,
            target: 77,
            movw_label,
            movt_label,
            add_pc_label,
        });

        let patches = log.emit(|l| asm.offset(l).unwrap());
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[0].literal_offset, 0);
        assert_eq!(patches[1].literal_offset, 4);
        assert_eq!(patches[0].pc_insn_offset, 8);
        assert_eq!(patches[2].kind, LinkerPatchKind::CallRelative);
        assert_eq!(patches[2].literal_offset, 10);

        let decoded = LinkerPatch::decode_all(&LinkerPatch::encode_all(&patches)).unwrap();
        assert_eq!(decoded, patches);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut data = LinkerPatch::encode_all(&[LinkerPatch {
            literal_offset: 4,
            kind: LinkerPatchKind::StringBssEntry,
            dex_file: 0,
            target: 1,
            pc_insn_offset: 8,
        }]);
        data[4] = 0xff;
        assert!(LinkerPatch::decode_all(&data).is_err());
        assert!(LinkerPatch::decode_all(&data[..10]).is_err());
    }
}
