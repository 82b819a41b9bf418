//! The binary instruction model: decoding dwords into instructions and encoding them back.
//!
//! Decoding is strict about round-tripping. Anything that does not encode back to exactly the
//! same dwords is kept as [`Item::Raw`], so the disassembly is always lossless.

use eyre::{bail, ensure, Result};

use super::opcodes::{self, Tail, CUSTOM_DATA, OPERAND_IMMEDIATE32, OPERAND_IMMEDIATE64};

/// Component selection of a four-component operand.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Selection {
    Mask(u8),
    Swizzle([u8; 4]),
    Select1(u8),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Components {
    Zero,
    One,
    Four(Selection),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Modifier {
    None,
    Neg,
    Abs,
    AbsNeg,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Index {
    Imm32(u32),
    Relative(Box<Operand>),
    Imm32Relative(u32, Box<Operand>),
}

impl Index {
    fn representation(&self) -> u32 {
        match self {
            Index::Imm32(_) => 0,
            Index::Relative(_) => 2,
            Index::Imm32Relative(..) => 3,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Operand {
    pub kind: u32,
    pub components: Components,
    pub modifier: Modifier,
    pub indices: Vec<Index>,

    /// Inline values of immediate operands.
    pub values: Vec<u32>,
}

impl Operand {
    pub fn is_immediate(&self) -> bool {
        self.kind == OPERAND_IMMEDIATE32 || self.kind == OPERAND_IMMEDIATE64
    }

    /// The number of inline values an immediate operand of this shape carries.
    pub fn immediate_len(kind: u32, components: Components) -> Option<usize> {
        let count = match components {
            Components::Zero => return None,
            Components::One => 1,
            Components::Four(_) => 4,
        };

        match kind {
            OPERAND_IMMEDIATE32 => Some(count),
            OPERAND_IMMEDIATE64 => Some(if count == 1 { 2 } else { 4 }),
            _ => None,
        }
    }

    pub fn encode(&self, out: &mut Vec<u32>) {
        let mut token = match self.components {
            Components::Zero => 0,
            Components::One => 1,
            Components::Four(Selection::Mask(mask)) => 2 | (mask as u32 & 0xf) << 4,
            Components::Four(Selection::Swizzle(swizzle)) => {
                let packed = swizzle
                    .iter()
                    .enumerate()
                    .fold(0, |acc, (i, &c)| acc | (c as u32 & 3) << (2 * i));

                2 | 1 << 2 | packed << 4
            }
            Components::Four(Selection::Select1(component)) => 2 | 2 << 2 | (component as u32 & 3) << 4,
        };

        token |= (self.kind & 0xff) << 12;
        token |= (self.indices.len() as u32 & 3) << 20;

        for (i, index) in self.indices.iter().enumerate() {
            token |= index.representation() << (22 + 3 * i);
        }

        let modifier = match self.modifier {
            Modifier::None => None,
            Modifier::Neg => Some(1),
            Modifier::Abs => Some(2),
            Modifier::AbsNeg => Some(3),
        };

        if modifier.is_some() {
            token |= 1 << 31;
        }

        out.push(token);

        if let Some(modifier) = modifier {
            out.push(1 | modifier << 6);
        }

        out.extend_from_slice(&self.values);

        for index in &self.indices {
            match index {
                Index::Imm32(value) => out.push(*value),
                Index::Relative(operand) => operand.encode(out),
                Index::Imm32Relative(value, operand) => {
                    out.push(*value);
                    operand.encode(out);
                }
            }
        }
    }

    /// Decodes one operand, advancing `pos`. Shapes that cannot be represented are errors.
    pub fn decode(words: &[u32], pos: &mut usize) -> Result<Operand> {
        let token = next(words, pos)?;

        let components = match token & 3 {
            0 => Components::Zero,
            1 => Components::One,
            2 => Components::Four(match (token >> 2) & 3 {
                0 => Selection::Mask(((token >> 4) & 0xf) as u8),
                1 => Selection::Swizzle([
                    ((token >> 4) & 3) as u8,
                    ((token >> 6) & 3) as u8,
                    ((token >> 8) & 3) as u8,
                    ((token >> 10) & 3) as u8,
                ]),
                2 => Selection::Select1(((token >> 4) & 3) as u8),
                mode => bail!("unknown component selection mode {}", mode),
            }),
            _ => bail!("operand with N components is not supported"),
        };

        let kind = (token >> 12) & 0xff;
        let dimension = (token >> 20) & 3;
        ensure!(dimension < 3, "operand index dimension {} is not supported", dimension);

        let mut modifier = Modifier::None;

        if token & (1 << 31) != 0 {
            let extended = next(words, pos)?;

            modifier = match extended {
                0x41 => Modifier::Neg,
                0x81 => Modifier::Abs,
                0xc1 => Modifier::AbsNeg,
                other => bail!("unsupported extended operand token {:#010x}", other),
            };
        }

        let mut values = vec![];

        if let Some(count) = Operand::immediate_len(kind, components) {
            for _ in 0..count {
                values.push(next(words, pos)?);
            }
        } else if kind == OPERAND_IMMEDIATE32 || kind == OPERAND_IMMEDIATE64 {
            bail!("immediate operand without components");
        }

        let mut indices = vec![];

        for i in 0..dimension {
            let representation = (token >> (22 + 3 * i)) & 7;

            indices.push(match representation {
                0 => Index::Imm32(next(words, pos)?),
                2 => Index::Relative(Box::new(Operand::decode(words, pos)?)),
                3 => {
                    let value = next(words, pos)?;
                    Index::Imm32Relative(value, Box::new(Operand::decode(words, pos)?))
                }
                other => bail!("index representation {} is not supported", other),
            });
        }

        Ok(Operand {
            kind,
            components,
            modifier,
            indices,
            values,
        })
    }
}

/// An extended opcode token.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Extended {
    SampleOffsets([i8; 3]),
    ResourceDim { dim: u32, stride: u32 },
    ReturnType([u8; 4]),

    /// Any other extended token, without its continuation bit.
    Raw(u32),
}

impl Extended {
    pub fn encode(self) -> u32 {
        match self {
            Extended::SampleOffsets(offsets) => {
                offsets
                    .iter()
                    .enumerate()
                    .fold(1, |acc, (i, &offset)| acc | ((offset as u32) & 0xf) << (9 + 4 * i))
            }
            Extended::ResourceDim { dim, stride } => 2 | (dim & 0x1f) << 6 | (stride & 0xfff) << 11,
            Extended::ReturnType(types) => types
                .iter()
                .enumerate()
                .fold(3, |acc, (i, &ty)| acc | (ty as u32 & 0xf) << (6 + 4 * i)),
            Extended::Raw(token) => token & 0x7fff_ffff,
        }
    }

    fn decode(token: u32) -> Extended {
        let token = token & 0x7fff_ffff;

        let decoded = match token & 0x3f {
            1 => {
                let offset = |shift: u32| (((token >> shift) & 0xf) as i8) << 4 >> 4;
                Extended::SampleOffsets([offset(9), offset(13), offset(17)])
            }
            2 => Extended::ResourceDim {
                dim: (token >> 6) & 0x1f,
                stride: (token >> 11) & 0xfff,
            },
            3 => Extended::ReturnType([
                ((token >> 6) & 0xf) as u8,
                ((token >> 10) & 0xf) as u8,
                ((token >> 14) & 0xf) as u8,
                ((token >> 18) & 0xf) as u8,
            ]),
            _ => Extended::Raw(token),
        };

        if decoded.encode() == token {
            decoded
        } else {
            Extended::Raw(token)
        }
    }
}

/// One decoded instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Instruction {
    pub opcode: u32,

    /// Bits 11 to 23 of the opcode token, shifted down.
    pub controls: u32,

    pub extended: Vec<Extended>,
    pub operands: Vec<Operand>,
    pub tail: Vec<u32>,
}

impl Instruction {
    pub fn encode(&self, out: &mut Vec<u32>) -> Result<()> {
        let mut body = vec![];

        for (i, extended) in self.extended.iter().enumerate() {
            let mut token = extended.encode();

            if i + 1 < self.extended.len() {
                token |= 1 << 31;
            }

            body.push(token);
        }

        for operand in &self.operands {
            operand.encode(&mut body);
        }

        body.extend_from_slice(&self.tail);

        let length = body.len() + 1;
        ensure!(length < 128, "instruction is {} dwords long, the limit is 127", length);

        let mut token = (self.opcode & 0x7ff) | (self.controls & 0x1fff) << 11 | (length as u32) << 24;

        if !self.extended.is_empty() {
            token |= 1 << 31;
        }

        out.push(token);
        out.extend(body);

        Ok(())
    }

    /// Decodes an instruction occupying exactly `words`, using the opcode table.
    fn decode(words: &[u32]) -> Result<Instruction> {
        let token = words[0];
        let opcode = token & 0x7ff;

        let info = match opcodes::info(opcode) {
            Some(info) => info,
            None => bail!("opcode {} has no text form", opcode),
        };

        let mut pos = 1;
        let mut extended = vec![];
        let mut more = token & (1 << 31) != 0;

        while more {
            let word = next(words, &mut pos)?;
            extended.push(Extended::decode(word));
            more = word & (1 << 31) != 0;
        }

        let mut operands = vec![];

        for _ in 0..info.operand_count() {
            operands.push(Operand::decode(words, &mut pos)?);
        }

        let tail = words[pos..].to_vec();

        match info.tail {
            Tail::None => ensure!(tail.is_empty(), "unexpected trailing dwords"),
            Tail::SysValue | Tail::ReturnType => ensure!(tail.len() == 1, "expected one trailing dword"),
            Tail::Numbers => (),
        }

        Ok(Instruction {
            opcode,
            controls: (token >> 11) & 0x1fff,
            extended,
            operands,
            tail,
        })
    }
}

/// One element of an instruction stream.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Item {
    Instruction(Instruction),
    CustomData { class: u32, values: Vec<u32> },
    Raw(Vec<u32>),
}

impl Item {
    pub fn encode(&self, out: &mut Vec<u32>) -> Result<()> {
        match self {
            Item::Instruction(instruction) => instruction.encode(out)?,
            Item::CustomData { class, values } => {
                out.push(CUSTOM_DATA | class << 11);
                out.push(values.len() as u32 + 2);
                out.extend_from_slice(values);
            }
            Item::Raw(words) => out.extend_from_slice(words),
        }

        Ok(())
    }

    pub fn encoded(&self) -> Result<Vec<u32>> {
        let mut out = vec![];
        self.encode(&mut out)?;
        Ok(out)
    }
}

fn next(words: &[u32], pos: &mut usize) -> Result<u32> {
    match words.get(*pos) {
        Some(&word) => {
            *pos += 1;
            Ok(word)
        }
        None => bail!("instruction ends in the middle of an operand"),
    }
}

/// Splits an instruction stream into items. Every item encodes back to the dwords it came
/// from; instructions that would not are kept raw.
pub fn decode_stream(words: &[u32]) -> Vec<Item> {
    let mut items = vec![];
    let mut pos = 0;

    while pos < words.len() {
        let token = words[pos];
        let opcode = token & 0x7ff;

        let length = if opcode == CUSTOM_DATA {
            words.get(pos + 1).copied().unwrap_or(0) as usize
        } else {
            ((token >> 24) & 0x7f) as usize
        };

        if length == 0 || pos + length > words.len() || (opcode == CUSTOM_DATA && length < 2) {
            // Nothing sensible follows, so keep the rest as it is.
            items.push(Item::Raw(words[pos..].to_vec()));
            break;
        }

        let slice = &words[pos..pos + length];

        let item = if opcode == CUSTOM_DATA {
            Item::CustomData {
                class: token >> 11,
                values: slice[2..].to_vec(),
            }
        } else {
            match Instruction::decode(slice) {
                Ok(instruction) => Item::Instruction(instruction),
                Err(_) => Item::Raw(slice.to_vec()),
            }
        };

        let item = match item.encoded() {
            Ok(encoded) if encoded == slice => item,
            _ => Item::Raw(slice.to_vec()),
        };

        items.push(item);
        pos += length;
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_mov() {
        let words = [0x05000036, 0x001000f2, 0, 0x00101e46, 1];
        let items = decode_stream(&words);

        assert_eq!(items.len(), 1);

        let instruction = match &items[0] {
            Item::Instruction(instruction) => instruction,
            other => panic!("expected an instruction, got {:?}", other),
        };

        assert_eq!(instruction.opcode, 54);
        assert_eq!(instruction.operands[0].components, Components::Four(Selection::Mask(0xf)));
        assert_eq!(
            instruction.operands[1].components,
            Components::Four(Selection::Swizzle([0, 1, 2, 3]))
        );
        assert_eq!(instruction.operands[1].indices, vec![Index::Imm32(1)]);
        assert_eq!(items[0].encoded().unwrap(), words);
    }

    #[test]
    fn relative_indices_and_modifiers() {
        let relative = Operand {
            kind: 0,
            components: Components::Four(Selection::Select1(0)),
            modifier: Modifier::None,
            indices: vec![Index::Imm32(2)],
            values: vec![],
        };

        let operand = Operand {
            kind: 8,
            components: Components::Four(Selection::Swizzle([0, 0, 1, 1])),
            modifier: Modifier::AbsNeg,
            indices: vec![Index::Imm32(1), Index::Imm32Relative(4, Box::new(relative))],
            values: vec![],
        };

        let mut words = vec![];
        operand.encode(&mut words);

        let mut pos = 0;
        assert_eq!(Operand::decode(&words, &mut pos).unwrap(), operand);
        assert_eq!(pos, words.len());
    }

    #[test]
    fn unknown_and_truncated_instructions_stay_raw() {
        // Opcode 107 is reserved; the next token claims more dwords than remain.
        let words = [0x02000000 | 107, 0xdead_beef, 0x0500_0036, 0x001000f2];
        let items = decode_stream(&words);

        assert_eq!(items[0], Item::Raw(vec![0x02000000 | 107, 0xdead_beef]));
        assert_eq!(items[1], Item::Raw(vec![0x0500_0036, 0x001000f2]));
    }

    #[test]
    fn extended_tokens_round_trip() {
        for token in [0x0001_3201u32, 0x0000_00c2, 0x0015_5543, 0x0000_0007] {
            assert_eq!(Extended::decode(token).encode(), token);
        }

        assert_eq!(Extended::decode(0x0000_1e01), Extended::SampleOffsets([-1, 0, 0]));
    }
}
