//! The assembly text form.
//!
//! One instruction per line:
//!
//! ```text
//! ps_5_0
//! dcl_globalFlags refactoringAllowed
//! dcl_constantbuffer cb0[2].xyzw, immediateIndexed
//! dcl_input_ps v1.xy, linear
//! dcl_output o0.xyzw
//! sample_aoffimmi(1,0,0) r0.xyzw, v1.xyxx, t0.xyzw, s0
//! mul_sat o0.xyzw, r0.xyzw, cb0[1].xyzw
//! raw 0x0100006b
//! ```
//!
//! Destination operands are written with a write mask, sources with a four-letter swizzle, a
//! single selected component, or a two or three letter mask. Anything that does not come
//! back to the same dwords through this form is written as a `raw` line.

use eyre::{bail, ensure, format_err, Result, WrapErr};
use itertools::Itertools;

use super::container::ShaderVersion;
use super::opcodes::{
    self, Controls, OpcodeInfo, Tail, IMMEDIATE_CONSTANT_BUFFER, OPERAND_IMMEDIATE32, OPERAND_IMMEDIATE64,
    RESOURCE_DIMENSIONS, RETURN_TYPES, SCALAR_OPERANDS, SYSTEM_VALUES,
};
use super::tokens::{Components, Extended, Index, Instruction, Item, Modifier, Operand, Selection};

const COMPONENTS: [char; 4] = ['x', 'y', 'z', 'w'];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Role {
    Dest,
    Source,
}

/// Formats a dword the way a reader most likely wants to see it: as a float when it looks
/// like one, otherwise as a small signed integer or in hex.
pub fn format_value(value: u32) -> String {
    let float = f32::from_bits(value);

    if float.is_normal() && (1e-5..=1e7).contains(&float.abs()) {
        return format!("{:?}", float);
    }

    let int = value as i32;

    if (-65536..=65536).contains(&int) {
        int.to_string()
    } else {
        format!("0x{:08x}", value)
    }
}

pub fn parse_value(text: &str) -> Result<u32> {
    let text = text.trim();

    if let Some(hex) = text.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).map_err(|_| format_err!("bad hex value '{}'", text));
    }

    if text.contains(&['.', 'e', 'E'][..]) {
        let float: f32 = text.parse().map_err(|_| format_err!("bad float value '{}'", text))?;
        return Ok(float.to_bits());
    }

    let int: i64 = text.parse().map_err(|_| format_err!("bad value '{}'", text))?;
    ensure!(
        (i32::MIN as i64..=u32::MAX as i64).contains(&int),
        "value '{}' does not fit in 32 bits",
        text
    );

    Ok(int as u32)
}

fn parse_number(text: &str) -> Result<u32> {
    let text = text.trim();
    text.parse().map_err(|_| format_err!("expected a number, found '{}'", text))
}

fn low_mask(width: u32) -> u32 {
    (1 << width) - 1
}

fn format_components(components: Components) -> String {
    let letters = |indices: &mut dyn Iterator<Item = u8>| -> String {
        indices.map(|i| COMPONENTS[i as usize & 3]).collect()
    };

    match components {
        Components::Zero | Components::One => String::new(),
        Components::Four(Selection::Mask(0)) => String::new(),
        Components::Four(Selection::Mask(mask)) => {
            format!(".{}", letters(&mut (0..4u8).filter(|i| mask & (1 << i) != 0)))
        }
        Components::Four(Selection::Swizzle(swizzle)) => format!(".{}", letters(&mut swizzle.into_iter())),
        Components::Four(Selection::Select1(c)) => format!(".{}", COMPONENTS[c as usize & 3]),
    }
}

fn format_index(index: &Index) -> Option<String> {
    Some(match index {
        Index::Imm32(value) => value.to_string(),
        Index::Relative(operand) => format_operand(operand)?,
        Index::Imm32Relative(value, operand) => format!("{} + {}", format_operand(operand)?, value),
    })
}

fn format_operand(operand: &Operand) -> Option<String> {
    let body = match operand.kind {
        OPERAND_IMMEDIATE32 => format!("l({})", operand.values.iter().map(|&v| format_value(v)).join(", ")),
        OPERAND_IMMEDIATE64 => format!(
            "d({})",
            operand
                .values
                .chunks(2)
                .map(|pair| {
                    let wide = pair[0] as u64 | (pair.get(1).copied().unwrap_or(0) as u64) << 32;
                    format!("0x{:016x}", wide)
                })
                .join(", ")
        ),
        kind => {
            let mut body = opcodes::OPERAND_NAMES.get(kind as usize)?.to_string();

            for (i, index) in operand.indices.iter().enumerate() {
                match (i, index) {
                    (0, Index::Imm32(value)) => body.push_str(&value.to_string()),
                    _ => body.push_str(&format!("[{}]", format_index(index)?)),
                }
            }

            body.push_str(&format_components(operand.components));
            body
        }
    };

    Some(match operand.modifier {
        Modifier::None => body,
        Modifier::Neg => format!("-{}", body),
        Modifier::Abs => format!("|{}|", body),
        Modifier::AbsNeg => format!("-|{}|", body),
    })
}

fn parse_components(letters: &str, role: Role) -> Result<Selection> {
    let indices: Vec<u8> = letters
        .chars()
        .map(|c| match c {
            'x' => Ok(0),
            'y' => Ok(1),
            'z' => Ok(2),
            'w' => Ok(3),
            other => Err(format_err!("bad component '{}'", other)),
        })
        .collect::<Result<_>>()?;

    ensure!((1..=4).contains(&indices.len()), "bad component list '.{}'", letters);

    let mask = || indices.iter().fold(0u8, |mask, &i| mask | 1 << i);

    Ok(match (role, indices.len()) {
        (Role::Dest, _) => Selection::Mask(mask()),
        (Role::Source, 4) => Selection::Swizzle([indices[0], indices[1], indices[2], indices[3]]),
        (Role::Source, 1) => Selection::Select1(indices[0]),
        (Role::Source, _) => Selection::Mask(mask()),
    })
}

/// Finds the index of the bracket that closes the one at the start of `text`.
fn closing_bracket(text: &str) -> Result<usize> {
    let mut depth = 0;

    for (i, c) in text.char_indices() {
        match c {
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => {
                depth -= 1;

                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => (),
        }
    }

    bail!("unbalanced brackets in '{}'", text)
}

fn parse_index(text: &str) -> Result<Index> {
    let text = text.trim();

    if let Some((operand, offset)) = text.rsplit_once('+') {
        if let Ok(offset) = offset.trim().parse::<u32>() {
            return Ok(Index::Imm32Relative(offset, Box::new(parse_operand(operand, Role::Source)?)));
        }
    }

    if let Ok(value) = text.parse::<u32>() {
        return Ok(Index::Imm32(value));
    }

    Ok(Index::Relative(Box::new(parse_operand(text, Role::Source)?)))
}

fn parse_operand(text: &str, role: Role) -> Result<Operand> {
    let mut text = text.trim();
    let mut negate = false;
    let mut absolute = false;

    if let Some(rest) = text.strip_prefix('-') {
        negate = true;
        text = rest.trim_start();
    }

    if text.len() >= 2 && text.starts_with('|') && text.ends_with('|') {
        absolute = true;
        text = &text[1..text.len() - 1];
    }

    let modifier = match (negate, absolute) {
        (false, false) => Modifier::None,
        (true, false) => Modifier::Neg,
        (false, true) => Modifier::Abs,
        (true, true) => Modifier::AbsNeg,
    };

    if let Some(values) = text.strip_prefix("l(").and_then(|rest| rest.strip_suffix(')')) {
        let values: Vec<u32> = split_items(values)?.iter().map(|v| parse_value(v)).collect::<Result<_>>()?;

        let components = match values.len() {
            1 => Components::One,
            4 => Components::Four(Selection::Mask(0)),
            n => bail!("immediate must have 1 or 4 values, found {}", n),
        };

        return Ok(Operand {
            kind: OPERAND_IMMEDIATE32,
            components,
            modifier,
            indices: vec![],
            values,
        });
    }

    if let Some(values) = text.strip_prefix("d(").and_then(|rest| rest.strip_suffix(')')) {
        let wide: Vec<u64> = split_items(values)?
            .iter()
            .map(|v| {
                let v = v.trim();
                let parsed = match v.strip_prefix("0x") {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => v.parse(),
                };

                parsed.map_err(|_| format_err!("bad 64-bit value '{}'", v))
            })
            .collect::<Result<_>>()?;

        let components = match wide.len() {
            1 => Components::One,
            2 => Components::Four(Selection::Mask(0)),
            n => bail!("64-bit immediate must have 1 or 2 values, found {}", n),
        };

        return Ok(Operand {
            kind: OPERAND_IMMEDIATE64,
            components,
            modifier,
            indices: vec![],
            values: wide.iter().flat_map(|&v| [v as u32, (v >> 32) as u32]).collect(),
        });
    }

    let name_end = text.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(text.len());
    let name = &text[..name_end];
    let kind = opcodes::operand_type(name).ok_or_else(|| format_err!("unknown register '{}'", name))?;

    let mut rest = &text[name_end..];
    let mut indices = vec![];

    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());

    if digits_end > 0 {
        indices.push(Index::Imm32(parse_number(&rest[..digits_end])?));
        rest = &rest[digits_end..];
    }

    while rest.starts_with('[') {
        let close = closing_bracket(rest)?;
        indices.push(parse_index(&rest[1..close])?);
        rest = &rest[close + 1..];
    }

    ensure!(indices.len() <= 3, "too many indices on '{}'", text);

    let components = if let Some(letters) = rest.strip_prefix('.') {
        Components::Four(parse_components(letters, role)?)
    } else if rest.is_empty() {
        if SCALAR_OPERANDS.contains(&kind) {
            Components::One
        } else {
            Components::Zero
        }
    } else {
        bail!("unexpected '{}' after operand", rest);
    };

    Ok(Operand {
        kind,
        components,
        modifier,
        indices,
        values: vec![],
    })
}

/// Splits on commas that are not inside brackets.
fn split_items(text: &str) -> Result<Vec<&str>> {
    let mut items = vec![];
    let mut depth = 0i32;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        match c {
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth -= 1,
            ',' if depth == 0 => {
                items.push(text[start..i].trim());
                start = i + 1;
            }
            _ => (),
        }

        ensure!(depth >= 0, "unbalanced brackets in '{}'", text);
    }

    ensure!(depth == 0, "unbalanced brackets in '{}'", text);

    let last = text[start..].trim();

    if !last.is_empty() || !items.is_empty() {
        items.push(last);
    }

    Ok(items)
}

fn format_extended(extended: &Extended) -> String {
    let raw = || format!("{{0x{:x}}}", extended.encode());

    match *extended {
        Extended::SampleOffsets([u, v, w]) => format!("_aoffimmi({},{},{})", u, v, w),
        Extended::ResourceDim { dim, stride } => match opcodes::name_of(RESOURCE_DIMENSIONS, dim) {
            Some(name) if stride == 0 => format!("({})", name),
            Some(name) => format!("({},{})", name, stride),
            None => raw(),
        },
        Extended::ReturnType(types) => {
            let names: Option<Vec<&str>> = types
                .iter()
                .map(|&ty| opcodes::name_of(RETURN_TYPES, ty as u32))
                .collect();

            match names {
                Some(names) => format!("({})", names.join(",")),
                None => raw(),
            }
        }
        Extended::Raw(_) => raw(),
    }
}

fn format_return_type(word: u32) -> Option<String> {
    if word >> 16 != 0 {
        return None;
    }

    let names: Option<Vec<&str>> = (0..4)
        .map(|i| opcodes::name_of(RETURN_TYPES, (word >> (4 * i)) & 0xf))
        .collect();

    Some(format!("({})", names?.join(",")))
}

fn parse_return_type(text: &str) -> Result<u32> {
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| format_err!("expected a return type list, found '{}'", text))?;

    let types: Vec<u32> = inner
        .split(',')
        .map(|name| {
            opcodes::position_of(RETURN_TYPES, name.trim()).ok_or_else(|| format_err!("unknown return type '{}'", name))
        })
        .collect::<Result<_>>()?;

    ensure!(types.len() == 4, "return type list needs four entries");

    Ok(types.iter().enumerate().fold(0, |word, (i, ty)| word | ty << (4 * i)))
}

fn format_instruction(instruction: &Instruction) -> Option<String> {
    let info = opcodes::info(instruction.opcode)?;

    let mut head = info.mnemonic.to_string();
    let mut leftover = instruction.controls;
    let mut control_item = None;

    match info.controls {
        Controls::Plain => (),
        Controls::Saturate => {
            if leftover & (1 << 2) != 0 {
                head.push_str("_sat");
                leftover &= !(1 << 2);
            }
        }
        Controls::Test => {
            head.push_str(if leftover & (1 << 7) != 0 { "_nz" } else { "_z" });
            leftover &= !(1 << 7);
        }
        Controls::ResourceDim => {
            let dim = leftover & 0x1f;

            if let Some(name) = opcodes::name_of(RESOURCE_DIMENSIONS, dim).filter(|_| dim != 0) {
                head.push('_');
                head.push_str(name);
                leftover &= !0x1f;
            }
        }
        Controls::Choice { width, names } => {
            if let Some(name) = opcodes::name_of(names, leftover & low_mask(width)) {
                control_item = Some(name.to_string());
                leftover &= !low_mask(width);
            }
        }
        Controls::Count { width } => {
            control_item = Some((leftover & low_mask(width)).to_string());
            leftover &= !low_mask(width);
        }
        Controls::Flags(names) => {
            let set: Vec<&str> = names
                .iter()
                .enumerate()
                .filter(|(i, _)| leftover & (1 << i) != 0)
                .map(|(_, name)| *name)
                .collect();

            leftover &= !low_mask(names.len() as u32);

            if !set.is_empty() {
                control_item = Some(set.join(" | "));
            }
        }
    }

    if leftover != 0 {
        head.push_str(&format!("#0x{:x}", leftover));
    }

    for extended in &instruction.extended {
        head.push_str(&format_extended(extended));
    }

    let mut items = vec![];

    for operand in &instruction.operands {
        items.push(format_operand(operand)?);
    }

    items.extend(control_item);

    match info.tail {
        Tail::None => (),
        Tail::Numbers => items.extend(instruction.tail.iter().map(|n| n.to_string())),
        Tail::SysValue => {
            let value = *instruction.tail.first()?;
            items.push(match opcodes::name_of(SYSTEM_VALUES, value) {
                Some(name) => name.to_string(),
                None => value.to_string(),
            });
        }
        Tail::ReturnType => items.push(format_return_type(*instruction.tail.first()?)?),
    }

    if items.is_empty() {
        Some(head)
    } else {
        Some(format!("{} {}", head, items.join(", ")))
    }
}

fn parse_suffixes(info: &OpcodeInfo, mut rest: &str) -> Result<(u32, Vec<Extended>)> {
    let mut controls = 0u32;
    let mut extended = vec![];

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("_aoffimmi(") {
            let (inside, after) = after
                .split_once(')')
                .ok_or_else(|| format_err!("unterminated _aoffimmi"))?;

            let offsets: Vec<i8> = inside
                .split(',')
                .map(|n| {
                    n.trim()
                        .parse::<i8>()
                        .ok()
                        .filter(|n| (-8..=7).contains(n))
                        .ok_or_else(|| format_err!("bad texel offset '{}'", n))
                })
                .collect::<Result<_>>()?;

            ensure!(offsets.len() == 3, "_aoffimmi takes three offsets");
            extended.push(Extended::SampleOffsets([offsets[0], offsets[1], offsets[2]]));
            rest = after;
        } else if let Some(after) = rest.strip_prefix('_') {
            let end = after.find(&['_', '#', '(', '{'][..]).unwrap_or(after.len());
            let word = &after[..end];

            match (info.controls, word) {
                (Controls::Saturate, "sat") => controls |= 1 << 2,
                (Controls::Test, "nz") => controls |= 1 << 7,
                (Controls::Test, "z") => (),
                (Controls::ResourceDim, dim) => {
                    let dim = opcodes::position_of(RESOURCE_DIMENSIONS, dim)
                        .ok_or_else(|| format_err!("unknown suffix '_{}' on {}", word, info.mnemonic))?;
                    controls |= dim;
                }
                _ => bail!("unknown suffix '_{}' on {}", word, info.mnemonic),
            }

            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix("#0x") {
            let end = after.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(after.len());
            let value = u32::from_str_radix(&after[..end], 16).map_err(|_| format_err!("bad control bits"))?;

            ensure!(value < 0x2000, "control bits {:#x} out of range", value);
            controls |= value;
            rest = &after[end..];
        } else if rest.starts_with('(') {
            let close = closing_bracket(rest)?;
            let inside: Vec<&str> = rest[1..close].split(',').map(str::trim).collect();

            if let Some(dim) = opcodes::position_of(RESOURCE_DIMENSIONS, inside[0]) {
                let stride = match inside.get(1) {
                    Some(stride) => parse_number(stride)?,
                    None => 0,
                };

                extended.push(Extended::ResourceDim { dim, stride });
            } else {
                let word = parse_return_type(&rest[..=close])?;
                extended.push(Extended::ReturnType([
                    (word & 0xf) as u8,
                    ((word >> 4) & 0xf) as u8,
                    ((word >> 8) & 0xf) as u8,
                    ((word >> 12) & 0xf) as u8,
                ]));
            }

            rest = &rest[close + 1..];
        } else if rest.starts_with('{') {
            let close = closing_bracket(rest)?;
            extended.push(Extended::Raw(parse_value(&rest[1..close])? & 0x7fff_ffff));
            rest = &rest[close + 1..];
        } else {
            bail!("unexpected '{}' after {}", rest, info.mnemonic);
        }
    }

    Ok((controls, extended))
}

fn parse_instruction(line: &str) -> Result<Instruction> {
    let (head, rest) = match line.find(char::is_whitespace) {
        Some(split) => (&line[..split], line[split..].trim()),
        None => (line, ""),
    };

    let info = opcodes::longest_prefix(head).ok_or_else(|| format_err!("unknown instruction '{}'", head))?;
    let (mut controls, extended) = parse_suffixes(info, &head[info.mnemonic.len()..])?;

    let items = split_items(rest)?;
    let operand_count = info.operand_count();

    ensure!(
        items.len() >= operand_count,
        "{} takes {} operands, found {}",
        info.mnemonic,
        operand_count,
        items.len()
    );

    let mut operands = vec![];

    for (i, item) in items[..operand_count].iter().enumerate() {
        let role = if i < info.dests as usize { Role::Dest } else { Role::Source };
        operands.push(parse_operand(item, role).wrap_err_with(|| format!("operand {}", i + 1))?);
    }

    let mut remaining = &items[operand_count..];

    match info.controls {
        Controls::Choice { names, .. } => {
            if let Some(value) = remaining.first().and_then(|item| opcodes::position_of(names, item)) {
                controls |= value;
                remaining = &remaining[1..];
            }
        }
        Controls::Count { width } => {
            let item = remaining
                .first()
                .ok_or_else(|| format_err!("{} needs a count", info.mnemonic))?;

            let count = parse_number(item)?;
            ensure!(count <= low_mask(width), "count {} out of range", count);

            controls |= count;
            remaining = &remaining[1..];
        }
        Controls::Flags(names) => {
            if let Some(item) = remaining.first() {
                for flag in item.split('|') {
                    let bit = opcodes::position_of(names, flag.trim())
                        .ok_or_else(|| format_err!("unknown flag '{}'", flag.trim()))?;
                    controls |= 1 << bit;
                }

                remaining = &remaining[1..];
            }
        }
        _ => (),
    }

    let tail = match info.tail {
        Tail::None => vec![],
        Tail::Numbers => remaining.iter().map(|item| parse_number(item)).collect::<Result<_>>()?,
        Tail::SysValue => {
            let item = remaining
                .first()
                .ok_or_else(|| format_err!("{} needs a system value", info.mnemonic))?;

            vec![match opcodes::position_of(SYSTEM_VALUES, item) {
                Some(value) => value,
                None => parse_number(item)?,
            }]
        }
        Tail::ReturnType => {
            let item = remaining
                .first()
                .ok_or_else(|| format_err!("{} needs a return type", info.mnemonic))?;

            vec![parse_return_type(item)?]
        }
    };

    let consumed = match info.tail {
        Tail::None => 0,
        Tail::Numbers => remaining.len(),
        Tail::SysValue | Tail::ReturnType => 1,
    };

    ensure!(
        remaining.len() == consumed,
        "{} takes {} operands, found {}",
        info.mnemonic,
        operand_count,
        operand_count + remaining.len() - consumed
    );

    Ok(Instruction {
        opcode: info.opcode,
        controls,
        extended,
        operands,
        tail,
    })
}

fn parse_braced_values(text: &str) -> Result<Vec<u32>> {
    let inner = text
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| format_err!("expected '{{ ... }}'"))?;

    split_items(inner)?.iter().map(|v| parse_value(v)).collect()
}

fn format_custom_data(class: u32, values: &[u32]) -> String {
    let values = values.iter().map(|&v| format_value(v)).join(", ");

    if class == IMMEDIATE_CONSTANT_BUFFER {
        format!("dcl_immediateConstantBuffer {{ {} }}", values)
    } else {
        format!("customdata#0x{:x} {{ {} }}", class, values)
    }
}

fn format_raw(words: &[u32]) -> String {
    format!("raw {}", words.iter().map(|w| format!("0x{:08x}", w)).join(", "))
}

/// Parses one instruction line.
pub fn parse_line(line: &str) -> Result<Item> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("raw") {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            let words = split_items(rest)?.iter().map(|w| parse_value(w)).collect::<Result<_>>()?;
            return Ok(Item::Raw(words));
        }
    }

    if let Some(rest) = line.strip_prefix("dcl_immediateConstantBuffer") {
        return Ok(Item::CustomData {
            class: IMMEDIATE_CONSTANT_BUFFER,
            values: parse_braced_values(rest)?,
        });
    }

    if let Some(rest) = line.strip_prefix("customdata#0x") {
        let end = rest.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(rest.len());
        let class = u32::from_str_radix(&rest[..end], 16).map_err(|_| format_err!("bad custom data class"))?;

        ensure!(class < 1 << 21, "custom data class {:#x} out of range", class);

        return Ok(Item::CustomData {
            class,
            values: parse_braced_values(&rest[end..])?,
        });
    }

    Ok(Item::Instruction(parse_instruction(line)?))
}

/// Formats one item, falling back to a raw line unless the text reads back to the same dwords.
pub fn format_item(item: &Item) -> Result<String> {
    let words = item.encoded()?;

    let line = match item {
        Item::Instruction(instruction) => format_instruction(instruction),
        Item::CustomData { class, values } => Some(format_custom_data(*class, values)),
        Item::Raw(_) => None,
    };

    if let Some(line) = line {
        let reads_back = parse_line(&line)
            .and_then(|parsed| parsed.encoded())
            .map(|encoded| encoded == words)
            .unwrap_or(false);

        if reads_back {
            return Ok(line);
        }
    }

    Ok(format_raw(&words))
}

/// Formats a whole program, starting with its version line.
pub fn format_program(version: ShaderVersion, items: &[Item]) -> Result<String> {
    let mut text = format!("{}\n", version);

    for item in items {
        text.push_str(&format_item(item)?);
        text.push('\n');
    }

    Ok(text)
}

/// Parses a whole program into its version and instruction dwords.
pub fn parse_program(text: &str) -> Result<(ShaderVersion, Vec<u32>)> {
    let mut version = None;
    let mut words = vec![];

    for (number, line) in text.lines().enumerate() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }

        match version {
            None => {
                version = Some(ShaderVersion::parse(trimmed).wrap_err_with(|| format!("line {}", number + 1))?);
            }
            Some(_) => {
                parse_line(trimmed)
                    .and_then(|item| item.encode(&mut words))
                    .wrap_err_with(|| format!("line {}: {}", number + 1, trimmed))?;
            }
        }
    }

    let version = version.ok_or_else(|| format_err!("program has no version line"))?;
    Ok((version, words))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_words(line: &str) -> Vec<u32> {
        parse_line(line).unwrap().encoded().unwrap()
    }

    #[test]
    fn values() {
        assert_eq!(format_value(1.0f32.to_bits()), "1.0");
        assert_eq!(format_value(0.5f32.to_bits()), "0.5");
        assert_eq!(format_value(3), "3");
        assert_eq!(format_value(-2i32 as u32), "-2");
        assert_eq!(format_value(0x8000_0000), "0x80000000");

        for value in [0u32, 1, 3, 0xffff_fffe, 0x3f80_0000, 0x7f80_0000, 0x0001_0001, 0x4b00_0000] {
            assert_eq!(parse_value(&format_value(value)).unwrap(), value, "{:#x}", value);
        }
    }

    #[test]
    fn encodes_mov() {
        assert_eq!(line_words("mov r0.xyzw, v1.xyzw"), vec![0x05000036, 0x001000f2, 0, 0x00101e46, 1]);
    }

    #[test]
    fn operands_read_back() {
        for text in [
            "r0.xyzw",
            "-r1.x",
            "|v2.xxyy|",
            "-|cb0[3].wzyx|",
            "cb1[r0.x + 2].xyzw",
            "icb[r1.w + 0].xy",
            "x0[r2.y].z",
            "l(1.0, 2, 0x80000000, -3)",
            "l(0.25)",
            "t0.xyzw",
            "s0",
            "vPrim",
            "null",
        ] {
            let operand = parse_operand(text, Role::Source).unwrap();
            assert_eq!(format_operand(&operand).unwrap(), text);
        }
    }

    #[test]
    fn destinations_use_write_masks() {
        let operand = parse_operand("o0.x", Role::Dest).unwrap();
        assert_eq!(operand.components, Components::Four(Selection::Mask(1)));

        let operand = parse_operand("r0.x", Role::Source).unwrap();
        assert_eq!(operand.components, Components::Four(Selection::Select1(0)));
    }

    #[test]
    fn suffixes_and_declarations() {
        let words = line_words("mul_sat r0.xyzw, r1.xyzw, l(2.0, 2.0, 2.0, 2.0)");
        assert_eq!(words[0] & 0x7ff, 56);
        assert_eq!((words[0] >> 11) & 0x1fff, 1 << 2);

        let words = line_words("if_nz r0.x");
        assert_eq!((words[0] >> 11) & 0x1fff, 1 << 7);

        let words = line_words("dcl_resource_texture2d t0, (float,float,float,float)");
        assert_eq!((words[0] >> 11) & 0x1f, 3);
        assert_eq!(*words.last().unwrap(), 0x5555);

        let words = line_words("dcl_globalFlags refactoringAllowed | enableRawAndStructuredBuffers");
        assert_eq!((words[0] >> 11) & 0x1fff, 0b1001);

        let words = line_words("sample_aoffimmi(1,-1,0) r0.xyzw, v1.xyxx, t0.xyzw, s0");
        assert_eq!(words[0] >> 31, 1);
        assert_eq!(words[1] & 0x3f, 1);
    }

    #[test]
    fn errors() {
        assert!(parse_line("frobnicate r0.x, r1.x").is_err());
        assert!(parse_line("mov r0.x").is_err());
        assert!(parse_line("mov r0.x, r1.x, r2.x").is_err());
        assert!(parse_line("mov_bogus r0.x, r1.x").is_err());
        assert!(parse_line("mov r0.q, r1.x").is_err());
        assert!(parse_program("mov r0.x, r1.x").is_err());
    }

    #[test]
    fn unreadable_instructions_become_raw() {
        let item = Item::Raw(vec![0x0100006b]);
        assert_eq!(format_item(&item).unwrap(), "raw 0x0100006b");
        assert_eq!(line_words("raw 0x0100006b, 7"), vec![0x0100006b, 7]);
    }
}
