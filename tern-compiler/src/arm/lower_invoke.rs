//! Method invocation.
//!
//! Arguments are already in place per the dex calling convention when an
//! invoke is reached. The callee `ArtMethod*` goes to R0 and the call goes
//! through its quick entry point, with a stack map at the return address.

use tern_asm::thumb2::{LoadKind, Register, LR, SP};

use crate::arm::codegen::CodeGeneratorArm;
use crate::arm::masm::ScopeSize;
use crate::arm::{reg, METHOD_REGISTER, TR};
use crate::hir::{CodePtrLocation, InstId, InstructionKind, InvokeInfo, InvokeType, MethodLoadKind};
use crate::linker_patch::LinkerPatchKind;
use crate::runtime::{class, imt, method, object, thread, QuickEntrypoint};

impl<'a> CodeGeneratorArm<'a> {
    pub(crate) fn visit_invoke_static_or_direct(
        &mut self,
        inst: InstId,
        info: InvokeInfo,
        load_kind: MethodLoadKind,
        code_ptr: CodePtrLocation,
    ) {
        let callee = METHOD_REGISTER;
        match load_kind {
            MethodLoadKind::StringInit => {
                self.masm.load_from_offset(
                    LoadKind::Word,
                    callee,
                    TR,
                    thread::string_init_entrypoint_offset(info.method_index),
                );
            }
            // The caller's own method sits at the bottom of the frame.
            MethodLoadKind::Recursive => self.masm.load_from_offset(LoadKind::Word, callee, SP, 0),
            MethodLoadKind::BootImageLinkTimePcRelative => {
                self.emit_pc_relative_address(LinkerPatchKind::RelativeMethod, info.dex_file, info.method_index, callee);
            }
            MethodLoadKind::BootImageRelRo(boot_image_offset) => {
                self.emit_pc_relative_address(LinkerPatchKind::BootImageRelRo, 0, boot_image_offset, callee);
                self.masm.load_from_offset(LoadKind::Word, callee, callee, 0);
            }
            MethodLoadKind::BssEntry => {
                self.emit_pc_relative_address(LinkerPatchKind::MethodBssEntry, info.dex_file, info.method_index, callee);
                self.masm.load_from_offset(LoadKind::Word, callee, callee, 0);
            }
            MethodLoadKind::AppImageRelRo => {
                self.emit_pc_relative_address(
                    LinkerPatchKind::MethodAppImageRelRo,
                    info.dex_file,
                    info.method_index,
                    callee,
                );
                self.masm.load_from_offset(LoadKind::Word, callee, callee, 0);
            }
            MethodLoadKind::JitDirectAddress(address) => self.masm.load_const(callee, address as i32),
            MethodLoadKind::RuntimeCall => {
                let entrypoint = if self.has_null_checked_receiver(inst) {
                    QuickEntrypoint::InvokeDirectTrampolineWithAccessCheck
                } else {
                    QuickEntrypoint::InvokeStaticTrampolineWithAccessCheck
                };
                self.masm.load_const(callee, info.method_index as i32);
                self.invoke_runtime(entrypoint, Some(inst), None);
                return;
            }
        }

        match code_ptr {
            CodePtrLocation::CallSelf => {
                let entry = self.frame_entry_label;
                let pc = {
                    let mut scope = self.masm.exact_scope(4, ScopeSize::Exact);
                    scope.bl(entry);
                    scope.position() as u32
                };
                self.record_pc_info(Some(inst), pc, None);
            }
            CodePtrLocation::CallArtMethod => self.call_quick_entry_point(inst, callee),
        }
    }

    /// Direct invokes receive a receiver that went through a null check.
    fn has_null_checked_receiver(&self, inst: InstId) -> bool {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        !instruction.inputs.is_empty() && matches!(graph.kind(instruction.input(0)), InstructionKind::NullCheck)
    }

    /// `LR = callee->entry_point_from_quick_compiled_code; BLX LR`
    fn call_quick_entry_point(&mut self, inst: InstId, callee: Register) {
        self.masm
            .load_from_offset(LoadKind::Word, LR, callee, method::ENTRY_POINT_FROM_QUICK_OFFSET);
        let pc = {
            let mut scope = self.masm.exact_scope(2, ScopeSize::Exact);
            scope.blx(LR);
            scope.position() as u32
        };
        self.record_pc_info(Some(inst), pc, None);
    }

    /// Loads the receiver's class into `temp`; the load doubles as the null
    /// check of the receiver.
    fn load_receiver_class(&mut self, temp: Register, receiver: Register) {
        let pc = {
            let mut scope = self.masm.exact_scope(4, ScopeSize::Maximum);
            let pc = scope.position() as u32;
            scope.ldr_imm(LoadKind::Word, temp, receiver, object::CLASS_OFFSET);
            pc
        };
        self.record_implicit_null_check(pc);
        self.maybe_unpoison(temp);
    }

    pub(crate) fn visit_invoke_virtual(&mut self, inst: InstId, vtable_index: u32) {
        let receiver = reg(self.locations_of(inst).in_at(0));
        let temp = METHOD_REGISTER;
        self.load_receiver_class(temp, receiver);
        self.masm
            .load_from_offset(LoadKind::Word, temp, temp, class::embedded_vtable_entry_offset(vtable_index));
        self.call_quick_entry_point(inst, temp);
    }

    /// The interface method index travels in IP as the hidden argument the
    /// IMT conflict trampoline dispatches on.
    pub(crate) fn visit_invoke_interface(&mut self, inst: InstId, info: InvokeInfo, imt_index: u32) {
        let receiver = reg(self.locations_of(inst).in_at(0));
        let temp = METHOD_REGISTER;
        self.load_receiver_class(temp, receiver);
        self.masm
            .load_from_offset(LoadKind::Word, temp, temp, class::IMT_PTR_OFFSET);
        self.masm
            .load_from_offset(LoadKind::Word, temp, temp, imt::entry_offset(imt_index));
        self.masm
            .load_from_offset(LoadKind::Word, LR, temp, method::ENTRY_POINT_FROM_QUICK_OFFSET);
        // Set last, nothing may use the scratch register before the call.
        let hidden = self.masm.scratch();
        self.masm.load_const(*hidden, info.method_index as i32);
        let pc = {
            let mut scope = self.masm.exact_scope(2, ScopeSize::Exact);
            scope.blx(LR);
            scope.position() as u32
        };
        drop(hidden);
        self.record_pc_info(Some(inst), pc, None);
    }

    pub(crate) fn visit_invoke_polymorphic(&mut self, inst: InstId) {
        let method_index = self.invoke_info(inst).method_index;
        self.masm.load_const(METHOD_REGISTER, method_index as i32);
        self.invoke_runtime(QuickEntrypoint::InvokePolymorphic, Some(inst), None);
    }

    pub(crate) fn visit_invoke_custom(&mut self, inst: InstId, call_site: u32) {
        self.masm.load_const(METHOD_REGISTER, call_site as i32);
        self.invoke_runtime(QuickEntrypoint::InvokeCustom, Some(inst), None);
    }

    pub(crate) fn visit_invoke_unresolved(&mut self, inst: InstId, info: InvokeInfo, invoke_type: InvokeType) {
        let entrypoint = match invoke_type {
            InvokeType::Static => QuickEntrypoint::InvokeStaticTrampolineWithAccessCheck,
            InvokeType::Direct => QuickEntrypoint::InvokeDirectTrampolineWithAccessCheck,
            InvokeType::Virtual => QuickEntrypoint::InvokeVirtualTrampolineWithAccessCheck,
            InvokeType::Super => QuickEntrypoint::InvokeSuperTrampolineWithAccessCheck,
            InvokeType::Interface => QuickEntrypoint::InvokeInterfaceTrampolineWithAccessCheck,
            InvokeType::Polymorphic => QuickEntrypoint::InvokePolymorphic,
            InvokeType::Custom => QuickEntrypoint::InvokeCustom,
        };
        self.masm.load_const(METHOD_REGISTER, info.method_index as i32);
        self.invoke_runtime(entrypoint, Some(inst), None);
    }

    fn invoke_info(&self, inst: InstId) -> InvokeInfo {
        *self
            .graph
            .kind(inst)
            .invoke_info()
            .expect("invoke without invoke info")
    }
}
