//! Declared constant and resource bindings, read from the declarations of a program.

use std::fmt::Write;

use super::opcodes::{self, IMMEDIATE_CONSTANT_BUFFER};
use super::tokens::{Index, Instruction, Item};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Binding {
    /// Register class: `cb`, `icb`, `t`, `s`, `u` or `g`.
    pub class: &'static str,
    pub index: u32,
    pub elements: u32,
    /// Widened, since declared counts come straight from the game's bytecode.
    pub bytes: u64,
}

fn first_index(instruction: &Instruction) -> Option<u32> {
    match instruction.operands.first()?.indices.first()? {
        Index::Imm32(index) => Some(*index),
        _ => None,
    }
}

fn binding(instruction: &Instruction) -> Option<Binding> {
    let index = first_index(instruction);
    let tail = |i: usize| instruction.tail.get(i).copied().unwrap_or(0);
    let wide = |i: usize| u64::from(tail(i));

    let (class, elements, bytes) = match opcodes::info(instruction.opcode)?.mnemonic {
        "dcl_constantbuffer" => {
            let count = match instruction.operands.first()?.indices.get(1)? {
                Index::Imm32(count) => *count,
                _ => 0,
            };

            ("cb", count, u64::from(count) * 16)
        }
        "dcl_sampler" => ("s", 1, 0),
        "dcl_resource" | "dcl_resource_raw" => ("t", 1, 0),
        "dcl_resource_structured" => ("t", 1, wide(0)),
        "dcl_uav_typed" | "dcl_uav_raw" => ("u", 1, 0),
        "dcl_uav_structured" => ("u", 1, wide(0)),
        "dcl_tgsm_raw" => ("g", 1, wide(0)),
        "dcl_tgsm_structured" => ("g", tail(1), wide(0) * wide(1)),
        _ => return None,
    };

    Some(Binding {
        class,
        index: index?,
        elements,
        bytes,
    })
}

/// Collects every binding declared in `items`, in declaration order.
pub fn collect(items: &[Item]) -> Vec<Binding> {
    items
        .iter()
        .filter_map(|item| match item {
            Item::Instruction(instruction) => binding(instruction),
            Item::CustomData { class, values } if *class == IMMEDIATE_CONSTANT_BUFFER => Some(Binding {
                class: "icb",
                index: 0,
                elements: values.len() as u32 / 4,
                bytes: values.len() as u64 * 4,
            }),
            _ => None,
        })
        .collect()
}

/// Renders bindings as the text stored in `-consts.txt` files.
pub fn render(bindings: &[Binding]) -> String {
    let mut text = String::from("// class  index  elements  bytes\n");

    for binding in bindings {
        let _ = writeln!(
            text,
            "{:<6} {:>6} {:>9} {:>6}",
            binding.class, binding.index, binding.elements, binding.bytes
        );
    }

    text
}

#[cfg(test)]
mod tests {
    use super::super::text;
    use super::super::tokens::decode_stream;
    use super::*;

    #[test]
    fn collects_declarations() {
        let source = "ps_5_0
dcl_constantbuffer cb0[4].xyzw, immediateIndexed
dcl_constantbuffer cb2[1].xyzw, dynamicIndexed
dcl_sampler s1, mode_default
dcl_resource_texture2d t3, (float,float,float,float)
dcl_immediateConstantBuffer { 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0 }
dcl_temps 2
ret
";

        let (_, words) = text::parse_program(source).unwrap();
        let bindings = collect(&decode_stream(&words));

        assert_eq!(
            bindings,
            vec![
                Binding { class: "cb", index: 0, elements: 4, bytes: 64 },
                Binding { class: "cb", index: 2, elements: 1, bytes: 16 },
                Binding { class: "s", index: 1, elements: 1, bytes: 0 },
                Binding { class: "t", index: 3, elements: 1, bytes: 0 },
                Binding { class: "icb", index: 0, elements: 2, bytes: 32 },
            ]
        );

        let rendered = render(&bindings);
        assert_eq!(rendered.lines().count(), 6);
        assert!(rendered.lines().nth(1).unwrap().starts_with("cb"));
    }

    #[test]
    fn huge_declarations_do_not_overflow() {
        let source = "ps_5_0
dcl_constantbuffer cb0[300000000].xyzw, immediateIndexed
ret
";

        let (_, words) = text::parse_program(source).unwrap();
        let bindings = collect(&decode_stream(&words));

        assert_eq!(bindings[0].elements, 300_000_000);
        assert_eq!(bindings[0].bytes, 4_800_000_000);
        assert!(render(&bindings).contains("4800000000"));
    }
}
