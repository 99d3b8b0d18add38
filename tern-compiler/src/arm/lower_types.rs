//! Class and string loads, class initialization, type checks and
//! allocations.

use tern_asm::thumb2::{Cond, LoadKind, Register, Shift, PC, R0};

use crate::arm::codegen::CodeGeneratorArm;
use crate::arm::locations_builder::type_check_slow_path_is_fatal;
use crate::arm::masm::ScopeSize;
use crate::arm::reg;
use crate::arm::slow_paths::SlowPathKind;
use crate::compiled_method::JitRootKind;
use crate::hir::{InstId, InstructionKind, LoadClassInfo, LoadClassKind, LoadStringInfo, LoadStringKind, TypeCheckInfo, TypeCheckKind};
use crate::linker_patch::{LinkerPatchKind, PcRelativePatchInfo};
use crate::runtime::{class, iftable, method, object, QuickEntrypoint, HEAP_REFERENCE_SIZE};

impl<'a> CodeGeneratorArm<'a> {
    /// `MOVW out, #0; MOVT out, #0; ADD out, pc` with the immediates left to
    /// the linker.
    pub(crate) fn emit_pc_relative_address(&mut self, kind: LinkerPatchKind, dex_file: u32, target: u32, out: Register) {
        let movw_label = self.masm.create_label();
        let movt_label = self.masm.create_label();
        let add_pc_label = self.masm.create_label();
        {
            let mut scope = self.masm.exact_scope(10, ScopeSize::Exact);
            scope.bind_label(movw_label);
            scope.movw(out, 0);
            scope.bind_label(movt_label);
            scope.movt(out, 0);
            scope.bind_label(add_pc_label);
            scope.add_reg16(out, PC);
        }
        self.patches.add_pc_relative(PcRelativePatchInfo {
            kind,
            dex_file,
            target,
            movw_label,
            movt_label,
            add_pc_label,
        });
    }

    // Classes.

    pub(crate) fn visit_load_class(&mut self, inst: InstId, info: LoadClassInfo) {
        let locations = self.locations_of(inst);
        if info.load_kind == LoadClassKind::RuntimeCall {
            self.masm.load_const(R0, info.type_index as i32);
            let entrypoint = if info.needs_access_check {
                QuickEntrypoint::ResolveTypeAndVerifyAccess
            } else {
                QuickEntrypoint::ResolveType
            };
            self.invoke_runtime(entrypoint, Some(inst), None);
            return;
        }

        let out = reg(locations.out());
        let mut generate_null_check = false;
        match info.load_kind {
            LoadClassKind::ReferrersClass => {
                let current_method = reg(locations.in_at(0));
                self.generate_gc_root_field_load(inst, out, current_method, method::DECLARING_CLASS_OFFSET, true);
            }
            LoadClassKind::BootImageLinkTimePcRelative => {
                self.emit_pc_relative_address(LinkerPatchKind::RelativeType, info.dex_file, info.type_index, out);
            }
            LoadClassKind::BootImageRelRo => {
                self.emit_pc_relative_address(LinkerPatchKind::BootImageRelRo, 0, info.boot_image_offset, out);
                self.masm.load_from_offset(LoadKind::Word, out, out, 0);
            }
            LoadClassKind::BssEntry | LoadClassKind::BssEntryPublic | LoadClassKind::BssEntryPackage => {
                let kind = match info.load_kind {
                    LoadClassKind::BssEntry => LinkerPatchKind::TypeBssEntry,
                    LoadClassKind::BssEntryPublic => LinkerPatchKind::PublicTypeBssEntry,
                    _ => LinkerPatchKind::PackageTypeBssEntry,
                };
                self.emit_pc_relative_address(kind, info.dex_file, info.type_index, out);
                self.generate_gc_root_field_load(inst, out, out, 0, true);
                generate_null_check = true;
            }
            LoadClassKind::JitBootImageAddress(address) => self.masm.load_const(out, address as i32),
            LoadClassKind::JitTableAddress => {
                let literal = self.add_jit_root_literal(JitRootKind::Class {
                    dex_file: info.dex_file,
                    type_index: info.type_index,
                });
                self.masm.ldr_literal(out, literal);
                self.generate_gc_root_field_load(inst, out, out, 0, true);
            }
            LoadClassKind::RuntimeCall => unreachable!(),
        }

        if generate_null_check || info.must_generate_clinit_check {
            let idx = self.add_slow_path(
                SlowPathKind::LoadClass {
                    cls: inst,
                    must_resolve: generate_null_check,
                    do_clinit: info.must_generate_clinit_check,
                },
                Some(inst),
            );
            if generate_null_check {
                let entry = self.slow_path_entry(idx);
                self.masm.compare_and_branch(out, false, entry, true);
            }
            if info.must_generate_clinit_check {
                self.generate_class_initialization_check(idx, out);
            } else {
                let exit = self.slow_path_exit(idx);
                self.masm.bind_label(exit);
            }
        }
    }

    pub(crate) fn visit_clinit_check(&mut self, inst: InstId) {
        let cls = self.graph.inst(inst).input(0);
        let class_reg = reg(self.locations_of(inst).in_at(0));
        let idx = self.add_slow_path(
            SlowPathKind::LoadClass {
                cls,
                must_resolve: false,
                do_clinit: true,
            },
            Some(inst),
        );
        self.generate_class_initialization_check(idx, class_reg);
    }

    /// Enters the slow path unless the class is visibly initialized.
    fn generate_class_initialization_check(&mut self, slow_path: usize, class_reg: Register) {
        let entry = self.slow_path_entry(slow_path);
        let exit = self.slow_path_exit(slow_path);
        let visibly_initialized = class::VISIBLY_INITIALIZED << (class::STATUS_LSB_POSITION % 8);
        let temp = self.masm.scratch();
        self.masm
            .load_from_offset(LoadKind::UnsignedByte, *temp, class_reg, class::STATUS_BYTE_OFFSET);
        self.masm.cmp_const(*temp, visibly_initialized as i32);
        self.masm.b_cond(Cond::LO, entry);
        self.masm.bind_label(exit);
    }

    // Strings.

    pub(crate) fn visit_load_string(&mut self, inst: InstId, info: LoadStringInfo) {
        let locations = self.locations_of(inst);
        if info.load_kind == LoadStringKind::RuntimeCall {
            self.masm.load_const(R0, info.string_index as i32);
            self.invoke_runtime(QuickEntrypoint::ResolveString, Some(inst), None);
            return;
        }

        let out = reg(locations.out());
        match info.load_kind {
            LoadStringKind::BootImageLinkTimePcRelative => {
                self.emit_pc_relative_address(LinkerPatchKind::RelativeString, info.dex_file, info.string_index, out);
            }
            LoadStringKind::BootImageRelRo => {
                self.emit_pc_relative_address(LinkerPatchKind::BootImageRelRo, 0, info.boot_image_offset, out);
                self.masm.load_from_offset(LoadKind::Word, out, out, 0);
            }
            LoadStringKind::BssEntry => {
                self.emit_pc_relative_address(LinkerPatchKind::StringBssEntry, info.dex_file, info.string_index, out);
                self.generate_gc_root_field_load(inst, out, out, 0, true);
                let idx = self.add_slow_path(SlowPathKind::LoadString, Some(inst));
                let entry = self.slow_path_entry(idx);
                let exit = self.slow_path_exit(idx);
                self.masm.compare_and_branch(out, false, entry, true);
                self.masm.bind_label(exit);
            }
            LoadStringKind::JitBootImageAddress(address) => self.masm.load_const(out, address as i32),
            LoadStringKind::JitTableAddress => {
                let literal = self.add_jit_root_literal(JitRootKind::String {
                    dex_file: info.dex_file,
                    string_index: info.string_index,
                });
                self.masm.ldr_literal(out, literal);
                self.generate_gc_root_field_load(inst, out, out, 0, true);
            }
            LoadStringKind::RuntimeCall => unreachable!(),
        }
    }

    // Type checks.

    /// Loads a class reference of a type check, through the read barrier
    /// when `read_barrier` is set.
    fn load_type_check_reference(&mut self, out: Register, obj: Register, offset: i32, read_barrier: bool) {
        if read_barrier {
            self.generate_field_load_with_baker_read_barrier(out, obj, offset);
        } else {
            self.masm.load_from_offset(LoadKind::Word, out, obj, offset);
            self.maybe_unpoison(out);
        }
    }

    /// Compares the bitstring of the class in `temp` against the expected
    /// path to root, leaving `temp` zero on a match. With `set_flags` the
    /// comparison also leaves EQ on a match.
    fn generate_bitstring_compare(&mut self, info: &TypeCheckInfo, temp: Register, set_flags: bool) {
        let mask_bits = 32 - info.mask.leading_zeros();
        debug_assert_eq!(info.mask.wrapping_add(1) & info.mask, 0, "bitstring mask is not 2^n - 1");
        let shift = 32 - mask_bits;
        self.masm
            .load_from_offset(LoadKind::Word, temp, temp, class::BITSTRING_STATUS_OFFSET);
        if shift != 0 {
            self.masm.shift_imm_w(Shift::LSL, false, temp, temp, shift);
        }
        let expected = (info.path_to_root << shift) as i32;
        if set_flags {
            self.masm.cmp_const(temp, expected);
        } else {
            self.masm.add_constant(temp, temp, expected.wrapping_neg());
        }
    }

    /// `out = 1` when the flags say EQ, keeping the zero already in `out`
    /// otherwise.
    fn set_out_if_equal(&mut self, out: Register) {
        let mut scope = self.masm.exact_scope(4, ScopeSize::Exact);
        scope.it(Cond::EQ);
        scope.movs_imm8(out, 1);
    }

    pub(crate) fn visit_instance_of(&mut self, inst: InstId, info: TypeCheckInfo) {
        let locations = self.locations_of(inst);
        let obj = reg(locations.in_at(0));
        let cls = reg(locations.in_at(1));
        let out = reg(locations.out());

        let read_barrier = self.options.emit_read_barrier && !info.target_class_in_boot_image;
        let baker = read_barrier && self.options.use_baker_read_barrier;
        let final_label = self.masm.create_label();
        let mut slow_path = None;

        if info.must_do_null_check {
            debug_assert_ne!(out, obj);
            self.masm.load_const_flags_dead(out, 0);
            self.masm.compare_and_branch(obj, false, final_label, false);
        }

        let always_slow =
            matches!(info.kind, TypeCheckKind::Unresolved | TypeCheckKind::Interface) || (read_barrier && !baker);
        if always_slow {
            let idx = self.add_slow_path(SlowPathKind::TypeCheck { fatal: false }, Some(inst));
            let entry = self.slow_path_entry(idx);
            self.masm.b(entry);
            slow_path = Some(idx);
        } else {
            match info.kind {
                TypeCheckKind::Exact => {
                    self.load_type_check_reference(out, obj, object::CLASS_OFFSET, baker);
                    self.masm.cmp_reg16(out, cls);
                    self.masm.mov_w_imm(false, out, 0);
                    if out.is_low() {
                        self.set_out_if_equal(out);
                    } else {
                        self.masm.b_cond_near(Cond::NE, final_label);
                        self.masm.load_const(out, 1);
                    }
                }
                TypeCheckKind::AbstractClass => {
                    self.load_type_check_reference(out, obj, object::CLASS_OFFSET, baker);
                    let lp = self.masm.create_and_bind_label();
                    self.load_type_check_reference(out, out, class::SUPER_CLASS_OFFSET, baker);
                    // A null super class is the false result.
                    self.masm.compare_and_branch(out, false, final_label, false);
                    self.masm.cmp_reg16(out, cls);
                    self.masm.b_cond(Cond::NE, lp);
                    self.masm.load_const_flags_dead(out, 1);
                }
                TypeCheckKind::ClassHierarchy => {
                    self.load_type_check_reference(out, obj, object::CLASS_OFFSET, baker);
                    let success = self.masm.create_label();
                    let lp = self.masm.create_and_bind_label();
                    self.masm.cmp_reg16(out, cls);
                    self.masm.b_cond_near(Cond::EQ, success);
                    self.load_type_check_reference(out, out, class::SUPER_CLASS_OFFSET, baker);
                    // Null check leaving NE behind for the exit.
                    self.masm.cmp_const(out, 1);
                    self.masm.b_cond(Cond::HS, lp);
                    if out.is_low() {
                        self.masm.bind_label(success);
                        self.set_out_if_equal(out);
                    } else {
                        self.masm.b_near(final_label);
                        self.masm.bind_label(success);
                        self.masm.load_const(out, 1);
                    }
                }
                TypeCheckKind::ArrayObject => {
                    self.load_type_check_reference(out, obj, object::CLASS_OFFSET, baker);
                    let exact_check = self.masm.create_label();
                    self.masm.cmp_reg16(out, cls);
                    self.masm.b_cond_near(Cond::EQ, exact_check);
                    self.load_type_check_reference(out, out, class::COMPONENT_TYPE_OFFSET, baker);
                    self.masm.compare_and_branch(out, false, final_label, false);
                    self.masm
                        .load_from_offset(LoadKind::UnsignedHalf, out, out, class::PRIMITIVE_TYPE_OFFSET);
                    self.masm.cmp_const(out, class::PRIMITIVE_NOT as i32);
                    self.masm.mov_w_imm(false, out, 0);
                    if out.is_low() {
                        self.masm.bind_label(exact_check);
                        self.set_out_if_equal(out);
                    } else {
                        self.masm.b_cond_near(Cond::NE, final_label);
                        self.masm.bind_label(exact_check);
                        self.masm.load_const(out, 1);
                    }
                }
                TypeCheckKind::ArrayCheck => {
                    // The slow path retries, so no read barrier here.
                    self.load_type_check_reference(out, obj, object::CLASS_OFFSET, false);
                    self.masm.cmp_reg16(out, cls);
                    let idx = self.add_slow_path(SlowPathKind::TypeCheck { fatal: false }, Some(inst));
                    let entry = self.slow_path_entry(idx);
                    self.masm.b_cond(Cond::NE, entry);
                    self.masm.load_const_flags_dead(out, 1);
                    slow_path = Some(idx);
                }
                TypeCheckKind::Bitstring => {
                    self.load_type_check_reference(out, obj, object::CLASS_OFFSET, false);
                    self.generate_bitstring_compare(&info, out, false);
                    // out = (out == 0)
                    self.masm.clz(out, out);
                    self.masm.shift_imm_w(Shift::LSR, false, out, out, 5);
                }
                TypeCheckKind::Unresolved | TypeCheckKind::Interface => unreachable!(),
            }
        }

        self.masm.bind_label(final_label);
        if let Some(idx) = slow_path {
            let exit = self.slow_path_exit(idx);
            self.masm.bind_label(exit);
        }
    }

    /// Class loads of a cast skip the read barrier: a stale class can only
    /// fail the fast path, and the slow path checks again.
    pub(crate) fn visit_check_cast(&mut self, inst: InstId, info: TypeCheckInfo) {
        let locations = self.locations_of(inst);
        let obj = reg(locations.in_at(0));
        let cls = reg(locations.in_at(1));
        let temp = reg(locations.temp(0));

        let fatal = type_check_slow_path_is_fatal(self.graph, info.kind);
        let idx = if fatal {
            self.add_shared_slow_path(SlowPathKind::TypeCheck { fatal: true }, inst)
        } else {
            self.add_slow_path(SlowPathKind::TypeCheck { fatal: false }, Some(inst))
        };
        let entry = self.slow_path_entry(idx);
        let done = self.masm.create_label();

        if info.must_do_null_check {
            self.masm.compare_and_branch(obj, false, done, false);
        }

        match info.kind {
            TypeCheckKind::Exact | TypeCheckKind::ArrayCheck => {
                self.load_type_check_reference(temp, obj, object::CLASS_OFFSET, false);
                self.masm.cmp_reg16(temp, cls);
                self.masm.b_cond(Cond::NE, entry);
            }
            TypeCheckKind::AbstractClass => {
                self.load_type_check_reference(temp, obj, object::CLASS_OFFSET, false);
                let lp = self.masm.create_and_bind_label();
                self.load_type_check_reference(temp, temp, class::SUPER_CLASS_OFFSET, false);
                self.masm.compare_and_branch(temp, false, entry, true);
                self.masm.cmp_reg16(temp, cls);
                self.masm.b_cond(Cond::NE, lp);
            }
            TypeCheckKind::ClassHierarchy => {
                self.load_type_check_reference(temp, obj, object::CLASS_OFFSET, false);
                let lp = self.masm.create_and_bind_label();
                self.masm.cmp_reg16(temp, cls);
                self.masm.b_cond_near(Cond::EQ, done);
                self.load_type_check_reference(temp, temp, class::SUPER_CLASS_OFFSET, false);
                self.masm.compare_and_branch(temp, false, entry, true);
                self.masm.b(lp);
            }
            TypeCheckKind::ArrayObject => {
                self.load_type_check_reference(temp, obj, object::CLASS_OFFSET, false);
                self.masm.cmp_reg16(temp, cls);
                self.masm.b_cond_near(Cond::EQ, done);
                self.load_type_check_reference(temp, temp, class::COMPONENT_TYPE_OFFSET, false);
                self.masm.compare_and_branch(temp, false, entry, true);
                self.masm
                    .load_from_offset(LoadKind::UnsignedHalf, temp, temp, class::PRIMITIVE_TYPE_OFFSET);
                self.masm.compare_and_branch(temp, true, entry, true);
            }
            TypeCheckKind::Unresolved => self.masm.b(entry),
            TypeCheckKind::Interface => {
                let length = reg(locations.temp(1));
                let interface = reg(locations.temp(2));
                self.load_type_check_reference(temp, obj, object::CLASS_OFFSET, false);
                self.load_type_check_reference(temp, temp, class::IFTABLE_OFFSET, false);
                self.masm
                    .load_from_offset(LoadKind::Word, length, temp, object::ARRAY_LENGTH_OFFSET);
                let lp = self.masm.create_and_bind_label();
                self.masm.compare_and_branch(length, false, entry, true);
                self.load_type_check_reference(interface, temp, object::array_data_offset(2), false);
                self.masm.add_constant(temp, temp, iftable::ENTRY_SIZE);
                self.masm
                    .add_constant(length, length, -(iftable::ENTRY_SIZE / HEAP_REFERENCE_SIZE as i32));
                self.masm.cmp_reg16(cls, interface);
                self.masm.b_cond(Cond::NE, lp);
            }
            TypeCheckKind::Bitstring => {
                self.load_type_check_reference(temp, obj, object::CLASS_OFFSET, false);
                self.generate_bitstring_compare(&info, temp, true);
                self.masm.b_cond(Cond::NE, entry);
            }
        }

        self.masm.bind_label(done);
        if !fatal {
            let exit = self.slow_path_exit(idx);
            self.masm.bind_label(exit);
        }
    }

    // Allocation and throwing.

    pub(crate) fn visit_new_instance(&mut self, inst: InstId) {
        let graph = self.graph;
        let cls = graph.inst(inst).input(0);
        let entrypoint = match graph.kind(cls) {
            InstructionKind::ClinitCheck => QuickEntrypoint::AllocObjectInitialized,
            InstructionKind::LoadClass(info) if info.needs_access_check => QuickEntrypoint::AllocObjectWithChecks,
            _ => QuickEntrypoint::AllocObjectResolved,
        };
        self.invoke_runtime(entrypoint, Some(inst), None);
    }

    pub(crate) fn visit_new_array(&mut self, inst: InstId, component_size_shift: u32) {
        let entrypoint = match component_size_shift {
            0 => QuickEntrypoint::AllocArrayResolved8,
            1 => QuickEntrypoint::AllocArrayResolved16,
            2 => QuickEntrypoint::AllocArrayResolved32,
            3 => QuickEntrypoint::AllocArrayResolved64,
            _ => QuickEntrypoint::AllocArrayResolved,
        };
        self.invoke_runtime(entrypoint, Some(inst), None);
    }

    pub(crate) fn visit_throw(&mut self, inst: InstId) {
        self.invoke_runtime(QuickEntrypoint::DeliverException, Some(inst), None);
    }
}
