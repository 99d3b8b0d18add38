//! The SSA graph consumed by the backend.
//!
//! Blocks hold ordered instruction lists; every value is an instruction
//! identified by an `InstId` into the graph's arena. Front ends build graphs
//! through the methods on `Graph`.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::locations::{LocationSummary, MoveOperands};

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl InstId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for InstId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DataType {
    Bool,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Reference,
    Void,
}

impl DataType {
    pub fn is_64bit(self) -> bool {
        matches!(self, DataType::Int64 | DataType::Uint64 | DataType::Float64)
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    pub fn is_reference(self) -> bool {
        self == DataType::Reference
    }

    pub fn is_int_or_long(self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            DataType::Bool | DataType::Uint8 | DataType::Uint16 | DataType::Uint32 | DataType::Uint64
        )
    }

    pub fn size_shift(self) -> u32 {
        match self {
            DataType::Bool | DataType::Uint8 | DataType::Int8 => 0,
            DataType::Uint16 | DataType::Int16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 | DataType::Reference => 2,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 3,
            DataType::Void => 0,
        }
    }

    pub fn size(self) -> u32 {
        if self == DataType::Void {
            0
        } else {
            1 << self.size_shift()
        }
    }

    /// Type the value has once it lives in a register.
    pub fn kind(self) -> DataType {
        match self {
            DataType::Bool
            | DataType::Uint8
            | DataType::Int8
            | DataType::Uint16
            | DataType::Int16
            | DataType::Uint32 => DataType::Int32,
            DataType::Uint64 => DataType::Int64,
            other => other,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
    Ror,
    Rol,
}

impl BinaryOp {
    pub fn is_shift(self) -> bool {
        matches!(
            self,
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr | BinaryOp::Ror | BinaryOp::Rol
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor)
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor
        )
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UnaryOp {
    Neg,
    Not,
    BooleanNot,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IfCondition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    B,
    Be,
    A,
    Ae,
}

impl IfCondition {
    pub fn opposite(self) -> IfCondition {
        match self {
            IfCondition::Eq => IfCondition::Ne,
            IfCondition::Ne => IfCondition::Eq,
            IfCondition::Lt => IfCondition::Ge,
            IfCondition::Le => IfCondition::Gt,
            IfCondition::Gt => IfCondition::Le,
            IfCondition::Ge => IfCondition::Lt,
            IfCondition::B => IfCondition::Ae,
            IfCondition::Be => IfCondition::A,
            IfCondition::A => IfCondition::Be,
            IfCondition::Ae => IfCondition::B,
        }
    }

    /// The condition that holds with the operands exchanged.
    pub fn swapped(self) -> IfCondition {
        match self {
            IfCondition::Eq => IfCondition::Eq,
            IfCondition::Ne => IfCondition::Ne,
            IfCondition::Lt => IfCondition::Gt,
            IfCondition::Le => IfCondition::Ge,
            IfCondition::Gt => IfCondition::Lt,
            IfCondition::Ge => IfCondition::Le,
            IfCondition::B => IfCondition::A,
            IfCondition::Be => IfCondition::Ae,
            IfCondition::A => IfCondition::B,
            IfCondition::Ae => IfCondition::Be,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            IfCondition::B | IfCondition::Be | IfCondition::A | IfCondition::Ae
        )
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ComparisonBias {
    NoBias,
    GtBias,
    LtBias,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OpShift {
    Lsl,
    Lsr,
    Asr,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TypeCheckKind {
    Unresolved,
    Exact,
    AbstractClass,
    ClassHierarchy,
    ArrayObject,
    ArrayCheck,
    Interface,
    Bitstring,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TypeCheckInfo {
    pub kind: TypeCheckKind,
    pub must_do_null_check: bool,
    /// Boot image classes never move, so comparisons against them need no
    /// read barrier on the loaded class.
    pub target_class_in_boot_image: bool,
    /// For `Bitstring` checks: expected path-to-root and the mask covering it.
    pub path_to_root: u32,
    pub mask: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FieldInfo {
    pub offset: u32,
    pub field_type: DataType,
    pub is_volatile: bool,
    pub field_index: u32,
    pub value_can_be_null: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LoadClassKind {
    ReferrersClass,
    BootImageLinkTimePcRelative,
    BootImageRelRo,
    BssEntry,
    BssEntryPublic,
    BssEntryPackage,
    JitBootImageAddress(u32),
    JitTableAddress,
    RuntimeCall,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LoadClassInfo {
    pub type_index: u32,
    pub dex_file: u32,
    pub load_kind: LoadClassKind,
    pub must_resolve_type_on_slow_path: bool,
    pub must_generate_clinit_check: bool,
    pub needs_access_check: bool,
    /// Boot image offset for `BootImageRelRo`.
    pub boot_image_offset: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LoadStringKind {
    BootImageLinkTimePcRelative,
    BootImageRelRo,
    BssEntry,
    JitBootImageAddress(u32),
    JitTableAddress,
    RuntimeCall,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LoadStringInfo {
    pub string_index: u32,
    pub dex_file: u32,
    pub load_kind: LoadStringKind,
    pub boot_image_offset: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MethodLoadKind {
    StringInit,
    Recursive,
    BootImageLinkTimePcRelative,
    BootImageRelRo(u32),
    BssEntry,
    AppImageRelRo,
    JitDirectAddress(u32),
    RuntimeCall,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CodePtrLocation {
    CallSelf,
    CallArtMethod,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InvokeType {
    Static,
    Direct,
    Virtual,
    Super,
    Interface,
    Polymorphic,
    Custom,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct InvokeInfo {
    pub method_index: u32,
    pub dex_file: u32,
    pub number_of_arguments: u32,
    pub intrinsified: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeoptimizationKind {
    ArraySet,
    Bce,
    Cha,
    Inline,
    Debuggable,
    FullFrame,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemBarrierKind {
    AnyStore,
    LoadAny,
    StoreStore,
    AnyAny,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TryBoundaryKind {
    Entry,
    Exit,
}

#[derive(Clone, PartialEq, Debug)]
pub enum InstructionKind {
    IntConstant(i32),
    LongConstant(i64),
    FloatConstant(f32),
    DoubleConstant(f64),
    NullConstant,
    ParameterValue { index: u32 },
    CurrentMethod,
    Phi,

    Binary(BinaryOp),
    Unary(UnaryOp),
    /// `lhs op ~rhs` for And, Or and Xor.
    BitwiseNegatedRight(BinaryOp),
    DataProcWithShifterOp { op: BinaryOp, shift: OpShift, amount: u32 },
    Condition { cond: IfCondition, bias: ComparisonBias },
    Compare { bias: ComparisonBias },
    TypeConversion,

    InstanceFieldGet(FieldInfo),
    InstanceFieldSet(FieldInfo),
    StaticFieldGet(FieldInfo),
    StaticFieldSet(FieldInfo),
    ArrayGet,
    ArraySet { needs_type_check: bool, value_can_be_null: bool, static_type_of_array_is_object_array: bool },
    ArrayLength,
    /// Base address `input0 + offset + input1` used by array accesses.
    IntermediateAddress { offset: u32 },
    NullCheck,
    DivZeroCheck,
    BoundsCheck,

    LoadClass(LoadClassInfo),
    LoadString(LoadStringInfo),
    ClinitCheck,
    InstanceOf(TypeCheckInfo),
    CheckCast(TypeCheckInfo),
    NewInstance { type_index: u32 },
    NewArray { component_size_shift: u32 },
    Throw,

    InvokeStaticOrDirect(InvokeInfo, MethodLoadKind, CodePtrLocation),
    InvokeVirtual(InvokeInfo, u32),
    InvokeInterface(InvokeInfo, u32),
    InvokePolymorphic(InvokeInfo),
    InvokeCustom(InvokeInfo, u32),
    InvokeUnresolved(InvokeInfo, InvokeType),

    Goto,
    If,
    TryBoundary(TryBoundaryKind),
    Deoptimize(DeoptimizationKind),
    ShouldDeoptimizeFlag,
    PackedSwitch { start_value: i32, num_entries: u32 },
    Return,
    ReturnVoid,
    Exit,
    SuspendCheck,

    Select,
    ParallelMove(Vec<MoveOperands>),
    ConstructorFence,
    MemoryBarrier(MemBarrierKind),
    BoundType,
    Nop,
    MethodEntryHook,
    MethodExitHook,
}

impl InstructionKind {
    pub fn name(&self) -> &'static str {
        use InstructionKind::*;
        match self {
            IntConstant(_) => "IntConstant",
            LongConstant(_) => "LongConstant",
            FloatConstant(_) => "FloatConstant",
            DoubleConstant(_) => "DoubleConstant",
            NullConstant => "NullConstant",
            ParameterValue { .. } => "ParameterValue",
            CurrentMethod => "CurrentMethod",
            Phi => "Phi",
            Binary(BinaryOp::Add) => "Add",
            Binary(BinaryOp::Sub) => "Sub",
            Binary(BinaryOp::Mul) => "Mul",
            Binary(BinaryOp::Div) => "Div",
            Binary(BinaryOp::Rem) => "Rem",
            Binary(BinaryOp::And) => "And",
            Binary(BinaryOp::Or) => "Or",
            Binary(BinaryOp::Xor) => "Xor",
            Binary(BinaryOp::Shl) => "Shl",
            Binary(BinaryOp::Shr) => "Shr",
            Binary(BinaryOp::UShr) => "UShr",
            Binary(BinaryOp::Ror) => "Ror",
            Binary(BinaryOp::Rol) => "Rol",
            Unary(UnaryOp::Neg) => "Neg",
            Unary(UnaryOp::Not) => "Not",
            Unary(UnaryOp::BooleanNot) => "BooleanNot",
            BitwiseNegatedRight(_) => "BitwiseNegatedRight",
            DataProcWithShifterOp { .. } => "DataProcWithShifterOp",
            Condition { .. } => "Condition",
            Compare { .. } => "Compare",
            TypeConversion => "TypeConversion",
            InstanceFieldGet(_) => "InstanceFieldGet",
            InstanceFieldSet(_) => "InstanceFieldSet",
            StaticFieldGet(_) => "StaticFieldGet",
            StaticFieldSet(_) => "StaticFieldSet",
            ArrayGet => "ArrayGet",
            ArraySet { .. } => "ArraySet",
            ArrayLength => "ArrayLength",
            IntermediateAddress { .. } => "IntermediateAddress",
            NullCheck => "NullCheck",
            DivZeroCheck => "DivZeroCheck",
            BoundsCheck => "BoundsCheck",
            LoadClass(_) => "LoadClass",
            LoadString(_) => "LoadString",
            ClinitCheck => "ClinitCheck",
            InstanceOf(_) => "InstanceOf",
            CheckCast(_) => "CheckCast",
            NewInstance { .. } => "NewInstance",
            NewArray { .. } => "NewArray",
            Throw => "Throw",
            InvokeStaticOrDirect(..) => "InvokeStaticOrDirect",
            InvokeVirtual(..) => "InvokeVirtual",
            InvokeInterface(..) => "InvokeInterface",
            InvokePolymorphic(_) => "InvokePolymorphic",
            InvokeCustom(..) => "InvokeCustom",
            InvokeUnresolved(..) => "InvokeUnresolved",
            Goto => "Goto",
            If => "If",
            TryBoundary(_) => "TryBoundary",
            Deoptimize(_) => "Deoptimize",
            ShouldDeoptimizeFlag => "ShouldDeoptimizeFlag",
            PackedSwitch { .. } => "PackedSwitch",
            Return => "Return",
            ReturnVoid => "ReturnVoid",
            Exit => "Exit",
            SuspendCheck => "SuspendCheck",
            Select => "Select",
            ParallelMove(_) => "ParallelMove",
            ConstructorFence => "ConstructorFence",
            MemoryBarrier(_) => "MemoryBarrier",
            BoundType => "BoundType",
            Nop => "Nop",
            MethodEntryHook => "MethodEntryHook",
            MethodExitHook => "MethodExitHook",
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            InstructionKind::IntConstant(_)
                | InstructionKind::LongConstant(_)
                | InstructionKind::FloatConstant(_)
                | InstructionKind::DoubleConstant(_)
                | InstructionKind::NullConstant
        )
    }

    pub fn is_invoke(&self) -> bool {
        matches!(
            self,
            InstructionKind::InvokeStaticOrDirect(..)
                | InstructionKind::InvokeVirtual(..)
                | InstructionKind::InvokeInterface(..)
                | InstructionKind::InvokePolymorphic(_)
                | InstructionKind::InvokeCustom(..)
                | InstructionKind::InvokeUnresolved(..)
        )
    }

    pub fn invoke_info(&self) -> Option<&InvokeInfo> {
        match self {
            InstructionKind::InvokeStaticOrDirect(info, ..)
            | InstructionKind::InvokeVirtual(info, _)
            | InstructionKind::InvokeInterface(info, _)
            | InstructionKind::InvokePolymorphic(info)
            | InstructionKind::InvokeCustom(info, _)
            | InstructionKind::InvokeUnresolved(info, _) => Some(info),
            _ => None,
        }
    }

    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            InstructionKind::Goto
                | InstructionKind::If
                | InstructionKind::TryBoundary(_)
                | InstructionKind::PackedSwitch { .. }
                | InstructionKind::Return
                | InstructionKind::ReturnVoid
                | InstructionKind::Throw
                | InstructionKind::Exit
        )
    }

    pub fn can_throw(&self) -> bool {
        use InstructionKind::*;
        match self {
            NullCheck | DivZeroCheck | BoundsCheck | ClinitCheck | CheckCast(_) | NewInstance { .. }
            | NewArray { .. } | Throw | LoadString(_) => true,
            LoadClass(info) => info.load_kind != LoadClassKind::ReferrersClass,
            ArraySet {
                needs_type_check, ..
            } => *needs_type_check,
            Binary(BinaryOp::Div) | Binary(BinaryOp::Rem) => false,
            _ => self.is_invoke(),
        }
    }

    pub fn needs_environment(&self) -> bool {
        self.can_throw()
            || matches!(
                self,
                InstructionKind::SuspendCheck
                    | InstructionKind::Deoptimize(_)
                    | InstructionKind::InstanceOf(_)
                    | InstructionKind::MethodEntryHook
                    | InstructionKind::MethodExitHook
            )
    }
}

/// Interpreter state at a safepoint: the value held by each dex register
/// plus the inlined caller chain.
#[derive(Clone, PartialEq, Debug)]
pub struct Environment {
    pub vregs: Vec<Option<InstId>>,
    pub method_index: u32,
    pub dex_pc: u32,
    pub parent: Option<Box<Environment>>,
}

impl Environment {
    pub fn new(vregs: Vec<Option<InstId>>, method_index: u32, dex_pc: u32) -> Environment {
        Environment {
            vregs,
            method_index,
            dex_pc,
            parent: None,
        }
    }

    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map(|p| p.depth()).unwrap_or(0)
    }

    pub fn for_each_value(&self, f: &mut dyn FnMut(InstId)) {
        for value in self.vregs.iter().flatten() {
            f(*value);
        }
        if let Some(parent) = &self.parent {
            parent.for_each_value(f);
        }
    }

    fn replace_value(&mut self, old: InstId, new: InstId) {
        for value in self.vregs.iter_mut().flatten() {
            if *value == old {
                *value = new;
            }
        }
        if let Some(parent) = &mut self.parent {
            parent.replace_value(old, new);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub id: InstId,
    pub block: BlockId,
    pub kind: InstructionKind,
    pub inputs: Vec<InstId>,
    pub ty: DataType,
    pub dex_pc: u32,
    pub locations: Option<LocationSummary>,
    pub environment: Option<Environment>,
    pub uses: Vec<InstId>,
    pub env_uses: Vec<InstId>,
    pub emitted_at_use_site: bool,
    pub can_be_null: bool,
    pub lifetime_position: u32,
    pub removed: bool,
}

impl Instruction {
    pub fn is_phi(&self) -> bool {
        self.kind == InstructionKind::Phi
    }

    pub fn input(&self, idx: usize) -> InstId {
        self.inputs[idx]
    }

    pub fn has_output(&self) -> bool {
        self.ty != DataType::Void
    }

    pub fn locations(&self) -> &LocationSummary {
        self.locations
            .as_ref()
            .unwrap_or_else(|| panic!("no locations for {:?} {}", self.id, self.kind.name()))
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
    pub phis: Vec<InstId>,
    pub instructions: Vec<InstId>,
    pub is_loop_header: bool,
    pub is_catch_block: bool,
    /// Suspend check of a loop, emitted at the back edges.
    pub loop_suspend_check: Option<InstId>,
    pub back_edges: Vec<BlockId>,
    pub dex_pc: u32,
    pub lifetime_start: u32,
    pub lifetime_end: u32,
}

impl Block {
    pub fn last_instruction(&self) -> Option<InstId> {
        self.instructions.last().copied()
    }

    pub fn single_successor(&self) -> BlockId {
        assert_eq!(self.successors.len(), 1);
        self.successors[0]
    }
}

#[derive(Clone, Debug)]
pub struct MethodInfo {
    pub method_index: u32,
    pub dex_file: u32,
    pub is_static: bool,
    /// Return type first, then parameter types in declaration order
    /// (without the receiver).
    pub shorty: Vec<DataType>,
    pub number_of_vregs: u32,
    pub name: String,
    pub requires_clinit_check: bool,
}

impl MethodInfo {
    pub fn new(name: &str, is_static: bool, shorty: Vec<DataType>) -> MethodInfo {
        MethodInfo {
            method_index: 0,
            dex_file: 0,
            is_static,
            shorty,
            number_of_vregs: 0,
            name: name.into(),
            requires_clinit_check: false,
        }
    }

    pub fn return_type(&self) -> DataType {
        self.shorty[0]
    }
}

#[derive(Clone, Debug)]
pub struct Graph {
    pub insts: Vec<Instruction>,
    pub blocks: Vec<Block>,
    pub entry_block: BlockId,
    pub exit_block: Option<BlockId>,
    pub linear_order: Vec<BlockId>,
    pub method: MethodInfo,
    pub is_osr: bool,
    pub has_should_deoptimize_flag: bool,
    pub current_method: Option<InstId>,
    /// Address of the method's profiling info when compiling baseline code.
    pub profiling_info: Option<u32>,
}

impl Graph {
    pub fn new(method: MethodInfo) -> Graph {
        let mut graph = Graph {
            insts: Vec::new(),
            blocks: Vec::new(),
            entry_block: BlockId(0),
            exit_block: None,
            linear_order: Vec::new(),
            method,
            is_osr: false,
            has_should_deoptimize_flag: false,
            current_method: None,
            profiling_info: None,
        };
        graph.entry_block = graph.add_block();
        graph
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            predecessors: Vec::new(),
            successors: Vec::new(),
            phis: Vec::new(),
            instructions: Vec::new(),
            is_loop_header: false,
            is_catch_block: false,
            loop_suspend_check: None,
            back_edges: Vec::new(),
            dex_pc: 0,
            lifetime_start: 0,
            lifetime_end: 0,
        });
        id
    }

    pub fn set_exit_block(&mut self, block: BlockId) {
        self.exit_block = Some(block);
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.idx()].successors.push(to);
        self.blocks[to.idx()].predecessors.push(from);
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.idx()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.idx()]
    }

    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.idx()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id.idx()]
    }

    pub fn kind(&self, id: InstId) -> &InstructionKind {
        &self.insts[id.idx()].kind
    }

    fn create(&mut self, block: BlockId, kind: InstructionKind, ty: DataType, inputs: &[InstId]) -> InstId {
        let id = InstId(self.insts.len() as u32);
        let can_be_null = ty == DataType::Reference
            && !matches!(
                kind,
                InstructionKind::NewInstance { .. }
                    | InstructionKind::NewArray { .. }
                    | InstructionKind::LoadClass(_)
                    | InstructionKind::LoadString(_)
                    | InstructionKind::CurrentMethod
            );
        self.insts.push(Instruction {
            id,
            block,
            kind,
            inputs: inputs.to_vec(),
            ty,
            dex_pc: 0,
            locations: None,
            environment: None,
            uses: Vec::new(),
            env_uses: Vec::new(),
            emitted_at_use_site: false,
            can_be_null,
            lifetime_position: 0,
            removed: false,
        });
        for &input in inputs {
            self.insts[input.idx()].uses.push(id);
        }
        id
    }

    /// Appends an instruction to the end of `block`.
    pub fn add(&mut self, block: BlockId, kind: InstructionKind, ty: DataType, inputs: &[InstId]) -> InstId {
        assert!(kind != InstructionKind::Phi);
        let is_current_method = kind == InstructionKind::CurrentMethod;
        let id = self.create(block, kind, ty, inputs);
        self.blocks[block.idx()].instructions.push(id);
        if is_current_method {
            self.current_method = Some(id);
        }
        id
    }

    pub fn add_phi(&mut self, block: BlockId, ty: DataType, inputs: &[InstId]) -> InstId {
        let id = self.create(block, InstructionKind::Phi, ty, inputs);
        self.blocks[block.idx()].phis.push(id);
        id
    }

    pub fn set_phi_inputs(&mut self, phi: InstId, inputs: &[InstId]) {
        for &old in &self.insts[phi.idx()].inputs.clone() {
            self.remove_use(old, phi);
        }
        self.insts[phi.idx()].inputs = inputs.to_vec();
        for &input in inputs {
            self.insts[input.idx()].uses.push(phi);
        }
    }

    /// Inserts a new instruction right before `before` in its block.
    pub fn insert_before(
        &mut self,
        before: InstId,
        kind: InstructionKind,
        ty: DataType,
        inputs: &[InstId],
    ) -> InstId {
        let block = self.insts[before.idx()].block;
        let id = self.create(block, kind, ty, inputs);
        let list = &mut self.blocks[block.idx()].instructions;
        let pos = list
            .iter()
            .position(|&i| i == before)
            .expect("instruction not in its block");
        list.insert(pos, id);
        id
    }

    /// Inserts a new instruction right after `after` in its block.
    pub fn insert_after(
        &mut self,
        after: InstId,
        kind: InstructionKind,
        ty: DataType,
        inputs: &[InstId],
    ) -> InstId {
        let block = self.insts[after.idx()].block;
        let id = self.create(block, kind, ty, inputs);
        let list = &mut self.blocks[block.idx()].instructions;
        let pos = list
            .iter()
            .position(|&i| i == after)
            .expect("instruction not in its block");
        list.insert(pos + 1, id);
        id
    }

    /// Inserts a new instruction at the start of `block`, after its phis.
    pub fn insert_at_block_start(
        &mut self,
        block: BlockId,
        kind: InstructionKind,
        ty: DataType,
        inputs: &[InstId],
    ) -> InstId {
        let id = self.create(block, kind, ty, inputs);
        self.blocks[block.idx()].instructions.insert(0, id);
        id
    }

    pub fn set_environment(&mut self, inst: InstId, env: Environment) {
        if let Some(old) = self.insts[inst.idx()].environment.take() {
            old.for_each_value(&mut |value| self.remove_env_use(value, inst));
        }
        env.for_each_value(&mut |value| self.insts[value.idx()].env_uses.push(inst));
        self.insts[inst.idx()].environment = Some(env);
    }

    pub fn set_dex_pc(&mut self, inst: InstId, dex_pc: u32) {
        self.insts[inst.idx()].dex_pc = dex_pc;
    }

    fn remove_use(&mut self, value: InstId, user: InstId) {
        let uses = &mut self.insts[value.idx()].uses;
        if let Some(pos) = uses.iter().position(|&u| u == user) {
            uses.remove(pos);
        }
    }

    fn remove_env_use(&mut self, value: InstId, user: InstId) {
        let uses = &mut self.insts[value.idx()].env_uses;
        if let Some(pos) = uses.iter().position(|&u| u == user) {
            uses.remove(pos);
        }
    }

    /// Redirects every use of `old`, including environment uses, to `new`.
    pub fn replace_uses(&mut self, old: InstId, new: InstId) {
        let users = std::mem::take(&mut self.insts[old.idx()].uses);
        for &user in &users {
            for input in self.insts[user.idx()].inputs.iter_mut() {
                if *input == old {
                    *input = new;
                }
            }
        }
        self.insts[new.idx()].uses.extend(users);

        let env_users = std::mem::take(&mut self.insts[old.idx()].env_uses);
        for &user in &env_users {
            if let Some(env) = self.insts[user.idx()].environment.as_mut() {
                env.replace_value(old, new);
            }
        }
        self.insts[new.idx()].env_uses.extend(env_users);
    }

    pub fn remove_instruction(&mut self, id: InstId) {
        assert!(self.insts[id.idx()].uses.is_empty(), "removing used instruction");
        let block = self.insts[id.idx()].block;
        for input in self.insts[id.idx()].inputs.clone() {
            self.remove_use(input, id);
        }
        if let Some(env) = self.insts[id.idx()].environment.take() {
            env.for_each_value(&mut |value| self.remove_env_use(value, id));
        }
        let b = &mut self.blocks[block.idx()];
        b.instructions.retain(|&i| i != id);
        b.phis.retain(|&i| i != id);
        self.insts[id.idx()].removed = true;
    }

    pub fn next_instruction(&self, id: InstId) -> Option<InstId> {
        let block = &self.blocks[self.insts[id.idx()].block.idx()];
        let pos = block.instructions.iter().position(|&i| i == id)?;
        block.instructions.get(pos + 1).copied()
    }

    pub fn previous_instruction(&self, id: InstId) -> Option<InstId> {
        let block = &self.blocks[self.insts[id.idx()].block.idx()];
        let pos = block.instructions.iter().position(|&i| i == id)?;
        if pos == 0 {
            None
        } else {
            Some(block.instructions[pos - 1])
        }
    }

    pub fn has_try_catch(&self) -> bool {
        self.blocks.iter().any(|b| b.is_catch_block)
    }

    pub fn is_entry_block(&self, block: BlockId) -> bool {
        block == self.entry_block
    }

    /// Number of live instructions, phis included.
    pub fn instruction_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.phis.len() + b.instructions.len())
            .sum()
    }

    pub fn int_constant(&self, id: InstId) -> Option<i32> {
        match self.kind(id) {
            InstructionKind::IntConstant(value) => Some(*value),
            InstructionKind::NullConstant => Some(0),
            _ => None,
        }
    }

    /// Value of an integral constant widened to 64 bits.
    pub fn constant_as_i64(&self, id: InstId) -> Option<i64> {
        match self.kind(id) {
            InstructionKind::IntConstant(value) => Some(*value as i64),
            InstructionKind::LongConstant(value) => Some(*value),
            InstructionKind::NullConstant => Some(0),
            _ => None,
        }
    }

    pub fn is_constant(&self, id: InstId) -> bool {
        self.kind(id).is_constant()
    }

    /// Computes reverse post order, loop headers and back edges.
    pub fn compute_linear_order(&mut self) {
        let n = self.blocks.len();
        let mut visited = vec![false; n];
        let mut on_stack = vec![false; n];
        let mut post_order = Vec::with_capacity(n);
        let mut back_edges = Vec::new();

        // Iterative DFS: (block, next successor index).
        let mut stack = vec![(self.entry_block, 0usize)];
        visited[self.entry_block.idx()] = true;
        on_stack[self.entry_block.idx()] = true;

        while let Some(&mut (block, ref mut next)) = stack.last_mut() {
            let successors = &self.blocks[block.idx()].successors;
            if *next < successors.len() {
                let succ = successors[*next];
                *next += 1;
                if !visited[succ.idx()] {
                    visited[succ.idx()] = true;
                    on_stack[succ.idx()] = true;
                    stack.push((succ, 0));
                } else if on_stack[succ.idx()] {
                    back_edges.push((block, succ));
                }
            } else {
                on_stack[block.idx()] = false;
                post_order.push(block);
                stack.pop();
            }
        }

        for block in &mut self.blocks {
            block.is_loop_header = false;
            block.back_edges.clear();
        }
        for (from, header) in back_edges {
            let h = &mut self.blocks[header.idx()];
            h.is_loop_header = true;
            h.back_edges.push(from);
        }

        post_order.reverse();
        self.linear_order = post_order;
    }

    pub fn is_back_edge(&self, from: BlockId, to: BlockId) -> bool {
        self.blocks[to.idx()].back_edges.contains(&from)
    }

    /// Index of the predecessor `pred` in the predecessor list of `block`.
    pub fn predecessor_index(&self, block: BlockId, pred: BlockId) -> usize {
        self.blocks[block.idx()]
            .predecessors
            .iter()
            .position(|&p| p == pred)
            .expect("not a predecessor")
    }

    pub fn has_critical_edges(&self) -> bool {
        self.blocks.iter().any(|b| {
            b.successors.len() > 1
                && b
                    .successors
                    .iter()
                    .any(|&s| self.blocks[s.idx()].predecessors.len() > 1)
        })
    }

    /// Splits every edge from a block with several successors to a block
    /// with several predecessors.
    pub fn split_critical_edges(&mut self) {
        let mut edges = Vec::new();
        for b in &self.blocks {
            if b.successors.len() > 1 {
                for &s in &b.successors {
                    if self.blocks[s.idx()].predecessors.len() > 1 {
                        edges.push((b.id, s));
                    }
                }
            }
        }
        for (from, to) in edges {
            let split = self.add_block();
            self.add(split, InstructionKind::Goto, DataType::Void, &[]);
            for s in self.blocks[from.idx()].successors.iter_mut() {
                if *s == to {
                    *s = split;
                }
            }
            for p in self.blocks[to.idx()].predecessors.iter_mut() {
                if *p == from {
                    *p = split;
                }
            }
            self.blocks[split.idx()].predecessors.push(from);
            self.blocks[split.idx()].successors.push(to);
            if self.blocks[to.idx()].back_edges.contains(&from) {
                for e in self.blocks[to.idx()].back_edges.iter_mut() {
                    if *e == from {
                        *e = split;
                    }
                }
            }
        }
    }
}
