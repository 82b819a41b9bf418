//! Instruction and name tables for shader model 4 and 5 bytecode.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// How the control bits (11 to 23) of an opcode token are shown in text.
#[derive(Clone, Copy, Debug)]
pub enum Controls {
    /// Only as a `#0x..` suffix.
    Plain,

    /// Bit 13 is the `_sat` suffix.
    Saturate,

    /// Bit 18 selects `_nz` (set) or `_z` (clear).
    Test,

    /// The low five bits are a resource dimension suffix, e.g. `_texture2d`.
    ResourceDim,

    /// The low `width` bits pick a keyword from `names`. Empty names are not valid choices.
    Choice {
        width: u32,
        names: &'static [&'static str],
    },

    /// The low `width` bits are a count shown as a trailing number.
    Count { width: u32 },

    /// Each bit is a named flag, shown as `a | b`.
    Flags(&'static [&'static str]),
}

/// What follows the operands of an instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tail {
    None,

    /// Any number of plain dwords.
    Numbers,

    /// One system value name.
    SysValue,

    /// One packed resource return type.
    ReturnType,
}

#[derive(Debug)]
pub struct OpcodeInfo {
    pub opcode: u32,
    pub mnemonic: &'static str,

    /// Operands shown with a write mask.
    pub dests: u8,

    /// Operands shown with a swizzle or component selector.
    pub srcs: u8,

    pub controls: Controls,
    pub tail: Tail,
}

impl OpcodeInfo {
    pub fn operand_count(&self) -> usize {
        (self.dests + self.srcs) as usize
    }
}

/// The opcode of the custom-data block, which has its own length encoding.
pub const CUSTOM_DATA: u32 = 53;

/// Custom-data class of an immediate constant buffer.
pub const IMMEDIATE_CONSTANT_BUFFER: u32 = 3;

const fn alu(opcode: u32, mnemonic: &'static str, dests: u8, srcs: u8) -> OpcodeInfo {
    OpcodeInfo {
        opcode,
        mnemonic,
        dests,
        srcs,
        controls: Controls::Saturate,
        tail: Tail::None,
    }
}

const fn op(opcode: u32, mnemonic: &'static str, dests: u8, srcs: u8) -> OpcodeInfo {
    OpcodeInfo {
        opcode,
        mnemonic,
        dests,
        srcs,
        controls: Controls::Plain,
        tail: Tail::None,
    }
}

const fn test(opcode: u32, mnemonic: &'static str, srcs: u8) -> OpcodeInfo {
    OpcodeInfo {
        opcode,
        mnemonic,
        dests: 0,
        srcs,
        controls: Controls::Test,
        tail: Tail::None,
    }
}

const fn decl(opcode: u32, mnemonic: &'static str, dests: u8, srcs: u8, controls: Controls, tail: Tail) -> OpcodeInfo {
    OpcodeInfo {
        opcode,
        mnemonic,
        dests,
        srcs,
        controls,
        tail,
    }
}

const PLAIN: Controls = Controls::Plain;

const CB_ACCESS: Controls = Controls::Choice {
    width: 1,
    names: &["immediateIndexed", "dynamicIndexed"],
};

const SAMPLER_MODE: Controls = Controls::Choice {
    width: 4,
    names: &["mode_default", "mode_comparison", "mode_mono"],
};

const INTERPOLATION: Controls = Controls::Choice {
    width: 4,
    names: &[
        "",
        "constant",
        "linear",
        "linearCentroid",
        "linearNoperspective",
        "linearNoperspectiveCentroid",
        "linearSample",
        "linearNoperspectiveSample",
    ],
};

const OUTPUT_TOPOLOGY: Controls = Controls::Choice {
    width: 6,
    names: &["", "pointlist", "", "linestrip", "", "trianglestrip"],
};

const INPUT_PRIMITIVE: Controls = Controls::Choice {
    width: 6,
    names: &["", "point", "line", "triangle", "", "", "lineadj", "triangleadj"],
};

const TESS_DOMAIN: Controls = Controls::Choice {
    width: 2,
    names: &["", "domain_isoline", "domain_tri", "domain_quad"],
};

const TESS_PARTITIONING: Controls = Controls::Choice {
    width: 3,
    names: &[
        "",
        "partitioning_integer",
        "partitioning_pow2",
        "partitioning_fractional_odd",
        "partitioning_fractional_even",
    ],
};

const TESS_OUTPUT: Controls = Controls::Choice {
    width: 3,
    names: &[
        "",
        "output_point",
        "output_line",
        "output_triangle_cw",
        "output_triangle_ccw",
    ],
};

const GLOBAL_FLAGS: Controls = Controls::Flags(&[
    "refactoringAllowed",
    "enableDoublePrecisionFloatOps",
    "forceEarlyDepthStencil",
    "enableRawAndStructuredBuffers",
    "skipOptimization",
    "enableMinimumPrecision",
    "enable11_1DoubleExtensions",
    "enable11_1ShaderExtensions",
]);

static OPCODES: &[OpcodeInfo] = &[
    alu(0, "add", 1, 2),
    alu(1, "and", 1, 2),
    op(2, "break", 0, 0),
    test(3, "breakc", 1),
    op(4, "call", 0, 1),
    test(5, "callc", 2),
    op(6, "case", 0, 1),
    op(7, "continue", 0, 0),
    test(8, "continuec", 1),
    op(9, "cut", 0, 0),
    op(10, "default", 0, 0),
    alu(11, "deriv_rtx", 1, 1),
    alu(12, "deriv_rty", 1, 1),
    test(13, "discard", 1),
    alu(14, "div", 1, 2),
    alu(15, "dp2", 1, 2),
    alu(16, "dp3", 1, 2),
    alu(17, "dp4", 1, 2),
    op(18, "else", 0, 0),
    op(19, "emit", 0, 0),
    op(20, "emitthencut", 0, 0),
    op(21, "endif", 0, 0),
    op(22, "endloop", 0, 0),
    op(23, "endswitch", 0, 0),
    alu(24, "eq", 1, 2),
    alu(25, "exp", 1, 1),
    alu(26, "frc", 1, 1),
    alu(27, "ftoi", 1, 1),
    alu(28, "ftou", 1, 1),
    alu(29, "ge", 1, 2),
    alu(30, "iadd", 1, 2),
    test(31, "if", 1),
    alu(32, "ieq", 1, 2),
    alu(33, "ige", 1, 2),
    alu(34, "ilt", 1, 2),
    alu(35, "imad", 1, 3),
    alu(36, "imax", 1, 2),
    alu(37, "imin", 1, 2),
    alu(38, "imul", 2, 2),
    alu(39, "ine", 1, 2),
    alu(40, "ineg", 1, 1),
    alu(41, "ishl", 1, 2),
    alu(42, "ishr", 1, 2),
    alu(43, "itof", 1, 1),
    op(44, "label", 0, 1),
    alu(45, "ld", 1, 2),
    alu(46, "ld_ms", 1, 3),
    alu(47, "log", 1, 1),
    op(48, "loop", 0, 0),
    alu(49, "lt", 1, 2),
    alu(50, "mad", 1, 3),
    alu(51, "min", 1, 2),
    alu(52, "max", 1, 2),
    alu(54, "mov", 1, 1),
    alu(55, "movc", 1, 3),
    alu(56, "mul", 1, 2),
    alu(57, "ne", 1, 2),
    op(58, "nop", 0, 0),
    alu(59, "not", 1, 1),
    alu(60, "or", 1, 2),
    op(61, "resinfo", 1, 2),
    op(62, "ret", 0, 0),
    test(63, "retc", 1),
    alu(64, "round_ne", 1, 1),
    alu(65, "round_ni", 1, 1),
    alu(66, "round_pi", 1, 1),
    alu(67, "round_z", 1, 1),
    alu(68, "rsq", 1, 1),
    alu(69, "sample", 1, 3),
    alu(70, "sample_c", 1, 4),
    alu(71, "sample_c_lz", 1, 4),
    alu(72, "sample_l", 1, 4),
    alu(73, "sample_d", 1, 5),
    alu(74, "sample_b", 1, 4),
    alu(75, "sqrt", 1, 1),
    op(76, "switch", 0, 1),
    alu(77, "sincos", 2, 1),
    alu(78, "udiv", 2, 2),
    alu(79, "ult", 1, 2),
    alu(80, "uge", 1, 2),
    alu(81, "umul", 2, 2),
    alu(82, "umad", 1, 3),
    alu(83, "umax", 1, 2),
    alu(84, "umin", 1, 2),
    alu(85, "ushr", 1, 2),
    alu(86, "utof", 1, 1),
    alu(87, "xor", 1, 2),
    decl(88, "dcl_resource", 0, 1, Controls::ResourceDim, Tail::ReturnType),
    decl(89, "dcl_constantbuffer", 0, 1, CB_ACCESS, Tail::None),
    decl(90, "dcl_sampler", 0, 1, SAMPLER_MODE, Tail::None),
    decl(91, "dcl_indexRange", 1, 0, PLAIN, Tail::Numbers),
    decl(92, "dcl_outputtopology", 0, 0, OUTPUT_TOPOLOGY, Tail::None),
    decl(93, "dcl_inputprimitive", 0, 0, INPUT_PRIMITIVE, Tail::None),
    decl(94, "dcl_maxout", 0, 0, PLAIN, Tail::Numbers),
    decl(95, "dcl_input", 1, 0, PLAIN, Tail::None),
    decl(96, "dcl_input_sgv", 1, 0, PLAIN, Tail::SysValue),
    decl(97, "dcl_input_siv", 1, 0, PLAIN, Tail::SysValue),
    decl(98, "dcl_input_ps", 1, 0, INTERPOLATION, Tail::None),
    decl(99, "dcl_input_ps_sgv", 1, 0, INTERPOLATION, Tail::SysValue),
    decl(100, "dcl_input_ps_siv", 1, 0, INTERPOLATION, Tail::SysValue),
    decl(101, "dcl_output", 1, 0, PLAIN, Tail::None),
    decl(102, "dcl_output_sgv", 1, 0, PLAIN, Tail::SysValue),
    decl(103, "dcl_output_siv", 1, 0, PLAIN, Tail::SysValue),
    decl(104, "dcl_temps", 0, 0, PLAIN, Tail::Numbers),
    decl(105, "dcl_indexableTemp", 0, 0, PLAIN, Tail::Numbers),
    decl(106, "dcl_globalFlags", 0, 0, GLOBAL_FLAGS, Tail::None),
    alu(108, "lod", 1, 3),
    alu(109, "gather4", 1, 3),
    alu(110, "samplepos", 1, 2),
    alu(111, "sampleinfo", 1, 1),
    op(113, "hs_decls", 0, 0),
    op(114, "hs_control_point_phase", 0, 0),
    op(115, "hs_fork_phase", 0, 0),
    op(116, "hs_join_phase", 0, 0),
    op(117, "emit_stream", 0, 1),
    op(118, "cut_stream", 0, 1),
    op(119, "emitthencut_stream", 0, 1),
    alu(121, "bufinfo", 1, 1),
    alu(122, "deriv_rtx_coarse", 1, 1),
    alu(123, "deriv_rtx_fine", 1, 1),
    alu(124, "deriv_rty_coarse", 1, 1),
    alu(125, "deriv_rty_fine", 1, 1),
    alu(126, "gather4_c", 1, 4),
    alu(127, "gather4_po", 1, 4),
    alu(128, "gather4_po_c", 1, 5),
    alu(129, "rcp", 1, 1),
    alu(130, "f32tof16", 1, 1),
    alu(131, "f16tof32", 1, 1),
    alu(132, "uaddc", 2, 2),
    alu(133, "usubb", 2, 2),
    alu(134, "countbits", 1, 1),
    alu(135, "firstbit_hi", 1, 1),
    alu(136, "firstbit_lo", 1, 1),
    alu(137, "firstbit_shi", 1, 1),
    alu(138, "ubfe", 1, 3),
    alu(139, "ibfe", 1, 3),
    alu(140, "bfi", 1, 4),
    alu(141, "bfrev", 1, 1),
    alu(142, "swapc", 2, 3),
    decl(143, "dcl_stream", 0, 1, PLAIN, Tail::None),
    decl(144, "dcl_function_body", 0, 1, PLAIN, Tail::None),
    decl(145, "dcl_function_table", 0, 0, PLAIN, Tail::Numbers),
    decl(146, "dcl_interface", 0, 0, PLAIN, Tail::Numbers),
    decl(147, "dcl_input_control_point_count", 0, 0, Controls::Count { width: 6 }, Tail::None),
    decl(148, "dcl_output_control_point_count", 0, 0, Controls::Count { width: 6 }, Tail::None),
    decl(149, "dcl_tessellator_domain", 0, 0, TESS_DOMAIN, Tail::None),
    decl(150, "dcl_tessellator_partitioning", 0, 0, TESS_PARTITIONING, Tail::None),
    decl(151, "dcl_tessellator_output_primitive", 0, 0, TESS_OUTPUT, Tail::None),
    decl(152, "dcl_hs_max_tessfactor", 0, 1, PLAIN, Tail::None),
    decl(153, "dcl_hs_fork_phase_instance_count", 0, 0, PLAIN, Tail::Numbers),
    decl(154, "dcl_hs_join_phase_instance_count", 0, 0, PLAIN, Tail::Numbers),
    decl(155, "dcl_thread_group", 0, 0, PLAIN, Tail::Numbers),
    decl(156, "dcl_uav_typed", 0, 1, Controls::ResourceDim, Tail::ReturnType),
    decl(157, "dcl_uav_raw", 0, 1, PLAIN, Tail::None),
    decl(158, "dcl_uav_structured", 0, 1, PLAIN, Tail::Numbers),
    decl(159, "dcl_tgsm_raw", 0, 1, PLAIN, Tail::Numbers),
    decl(160, "dcl_tgsm_structured", 0, 1, PLAIN, Tail::Numbers),
    decl(161, "dcl_resource_raw", 0, 1, PLAIN, Tail::None),
    decl(162, "dcl_resource_structured", 0, 1, PLAIN, Tail::Numbers),
    alu(163, "ld_uav_typed", 1, 2),
    op(164, "store_uav_typed", 1, 2),
    alu(165, "ld_raw", 1, 2),
    op(166, "store_raw", 1, 2),
    alu(167, "ld_structured", 1, 3),
    op(168, "store_structured", 1, 3),
    op(169, "atomic_and", 1, 2),
    op(170, "atomic_or", 1, 2),
    op(171, "atomic_xor", 1, 2),
    op(172, "atomic_cmp_store", 1, 3),
    op(173, "atomic_iadd", 1, 2),
    op(174, "atomic_imax", 1, 2),
    op(175, "atomic_imin", 1, 2),
    op(176, "atomic_umax", 1, 2),
    op(177, "atomic_umin", 1, 2),
    op(178, "imm_atomic_alloc", 1, 1),
    op(179, "imm_atomic_consume", 1, 1),
    op(180, "imm_atomic_iadd", 2, 2),
    op(181, "imm_atomic_and", 2, 2),
    op(182, "imm_atomic_or", 2, 2),
    op(183, "imm_atomic_xor", 2, 2),
    op(184, "imm_atomic_exch", 2, 2),
    op(185, "imm_atomic_cmp_exch", 2, 3),
    op(186, "imm_atomic_imax", 2, 2),
    op(187, "imm_atomic_imin", 2, 2),
    op(188, "imm_atomic_umax", 2, 2),
    op(189, "imm_atomic_umin", 2, 2),
    op(190, "sync", 0, 0),
    alu(191, "dadd", 1, 2),
    alu(192, "dmax", 1, 2),
    alu(193, "dmin", 1, 2),
    alu(194, "dmul", 1, 2),
    alu(195, "deq", 1, 2),
    alu(196, "dge", 1, 2),
    alu(197, "dlt", 1, 2),
    alu(198, "dne", 1, 2),
    alu(199, "dmov", 1, 1),
    alu(200, "dmovc", 1, 3),
    alu(201, "dtof", 1, 1),
    alu(202, "ftod", 1, 1),
    alu(203, "eval_snapped", 1, 2),
    alu(204, "eval_sample_index", 1, 2),
    alu(205, "eval_centroid", 1, 1),
    decl(206, "dcl_gsinstances", 0, 0, PLAIN, Tail::Numbers),
    op(207, "abort", 0, 0),
    op(208, "debugbreak", 0, 0),
    alu(210, "ddiv", 1, 2),
    alu(211, "dfma", 1, 3),
    alu(212, "drcp", 1, 1),
    alu(213, "msad", 1, 3),
    alu(214, "dtoi", 1, 1),
    alu(215, "dtou", 1, 1),
    alu(216, "itod", 1, 1),
    alu(217, "utod", 1, 1),
];

lazy_static! {
    static ref BY_OPCODE: HashMap<u32, &'static OpcodeInfo> = OPCODES.iter().map(|info| (info.opcode, info)).collect();
}

/// Returns the table entry for an opcode, or `None` for opcodes that are only shown as raw dwords.
pub fn info(opcode: u32) -> Option<&'static OpcodeInfo> {
    BY_OPCODE.get(&opcode).copied()
}

/// Finds the longest mnemonic that `token` starts with, where the mnemonic must be followed
/// by the end of the token or a suffix separator.
pub fn longest_prefix(token: &str) -> Option<&'static OpcodeInfo> {
    OPCODES
        .iter()
        .filter(|info| {
            token.starts_with(info.mnemonic)
                && matches!(token[info.mnemonic.len()..].chars().next(), None | Some('_' | '#' | '(' | '{'))
        })
        .max_by_key(|info| info.mnemonic.len())
}

/// Register file names, indexed by operand type.
pub static OPERAND_NAMES: &[&str] = &[
    "r",
    "v",
    "o",
    "x",
    "l",
    "d",
    "s",
    "t",
    "cb",
    "icb",
    "label",
    "vPrim",
    "oDepth",
    "null",
    "rasterizer",
    "oMask",
    "m",
    "fb",
    "ft",
    "fp",
    "fi",
    "fo",
    "vOutputControlPointID",
    "vForkInstanceID",
    "vJoinInstanceID",
    "vicp",
    "vocp",
    "vpc",
    "vDomain",
    "this",
    "u",
    "g",
    "vThreadID",
    "vThreadGroupID",
    "vThreadIDInGroup",
    "vCoverage",
    "vThreadIDInGroupFlattened",
    "vGSInstanceID",
    "oDepthGE",
    "oDepthLE",
    "vCycleCounter",
];

pub const OPERAND_IMMEDIATE32: u32 = 4;
pub const OPERAND_IMMEDIATE64: u32 = 5;
pub const OPERAND_SAMPLER: u32 = 6;
pub const OPERAND_RESOURCE: u32 = 7;
pub const OPERAND_CONSTANT_BUFFER: u32 = 8;
pub const OPERAND_UAV: u32 = 30;
pub const OPERAND_TGSM: u32 = 31;

/// Operand types that carry a single component and are written without a suffix.
pub static SCALAR_OPERANDS: &[u32] = &[11, 12, 15, 22, 23, 24, 35, 36, 37, 38, 39, 40];

pub fn operand_type(name: &str) -> Option<u32> {
    OPERAND_NAMES.iter().position(|&candidate| candidate == name).map(|index| index as u32)
}

pub static RESOURCE_DIMENSIONS: &[&str] = &[
    "unknown",
    "buffer",
    "texture1d",
    "texture2d",
    "texture2dms",
    "texture3d",
    "texturecube",
    "texture1darray",
    "texture2darray",
    "texture2dmsarray",
    "texturecubearray",
    "rawbuffer",
    "structuredbuffer",
];

pub static RETURN_TYPES: &[&str] = &[
    "", "unorm", "snorm", "sint", "uint", "float", "mixed", "double", "continued", "unused",
];

pub static SYSTEM_VALUES: &[&str] = &[
    "undefined",
    "position",
    "clip_distance",
    "cull_distance",
    "rendertarget_array_index",
    "viewport_array_index",
    "vertex_id",
    "primitive_id",
    "instance_id",
    "is_front_face",
    "sampleIndex",
    "finalQuadUeq0EdgeTessFactor",
    "finalQuadVeq0EdgeTessFactor",
    "finalQuadUeq1EdgeTessFactor",
    "finalQuadVeq1EdgeTessFactor",
    "finalQuadUInsideTessFactor",
    "finalQuadVInsideTessFactor",
    "finalTriUeq0EdgeTessFactor",
    "finalTriVeq0EdgeTessFactor",
    "finalTriWeq0EdgeTessFactor",
    "finalTriInsideTessFactor",
    "finalLineDetailTessFactor",
    "finalLineDensityTessFactor",
];

/// Finds `name` in a name table, ignoring empty (unnameable) entries.
pub fn position_of(table: &[&str], name: &str) -> Option<u32> {
    if name.is_empty() {
        return None;
    }

    table.iter().position(|&candidate| candidate == name).map(|index| index as u32)
}

/// Looks up a name for a value, returning `None` for unnamed values.
pub fn name_of(table: &'static [&'static str], value: u32) -> Option<&'static str> {
    table.get(value as usize).copied().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn opcodes_and_mnemonics_are_unique() {
        let opcodes: HashSet<u32> = OPCODES.iter().map(|info| info.opcode).collect();
        let mnemonics: HashSet<&str> = OPCODES.iter().map(|info| info.mnemonic).collect();

        assert_eq!(opcodes.len(), OPCODES.len());
        assert_eq!(mnemonics.len(), OPCODES.len());
        assert_eq!(info(54).unwrap().mnemonic, "mov");
        assert!(info(CUSTOM_DATA).is_none());
    }

    #[test]
    fn prefix_matching_prefers_longest_mnemonic() {
        assert_eq!(longest_prefix("mul_sat").unwrap().mnemonic, "mul");
        assert_eq!(longest_prefix("sample_c_lz").unwrap().mnemonic, "sample_c_lz");
        assert_eq!(longest_prefix("sample_l_sat").unwrap().mnemonic, "sample_l");
        assert_eq!(longest_prefix("dcl_resource_texture2d").unwrap().mnemonic, "dcl_resource");
        assert_eq!(longest_prefix("dmovc").unwrap().mnemonic, "dmovc");
        assert_eq!(longest_prefix("if_nz").unwrap().mnemonic, "if");
        assert!(longest_prefix("movx").is_none());
        assert!(longest_prefix("bogus").is_none());
    }

    #[test]
    fn name_tables() {
        assert_eq!(operand_type("cb"), Some(OPERAND_CONSTANT_BUFFER));
        assert_eq!(operand_type("vCycleCounter"), Some(40));
        assert_eq!(name_of(RETURN_TYPES, 5), Some("float"));
        assert_eq!(name_of(RETURN_TYPES, 0), None);
        assert_eq!(position_of(RETURN_TYPES, ""), None);
        assert_eq!(position_of(SYSTEM_VALUES, "position"), Some(1));
    }
}
