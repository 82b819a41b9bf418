//! Provides assembly, disassembly and validation of compiled shader bytecode.

pub mod bindings;
pub mod checksum;
pub mod container;
mod opcodes;
mod text;
mod tokens;

use eyre::{ensure, format_err, Result, WrapErr};

pub use bindings::Binding;
pub use container::ShaderVersion;

use container::Container;

fn code_of(container: &Container) -> Result<(ShaderVersion, Vec<u32>)> {
    let code = container
        .code_chunk()
        .ok_or_else(|| format_err!("container has no code chunk"))?;

    container::split_code(&code.data)
}

/// Disassembles a compiled container into the line-oriented text form.
pub fn disassemble(bytecode: &[u8]) -> Result<String> {
    let container = Container::parse(bytecode)?;
    let (version, words) = code_of(&container)?;

    text::format_program(version, &tokens::decode_stream(&words))
}

/// Assembles text into a new container holding just the code chunk.
pub fn assemble(source: &str) -> Result<Vec<u8>> {
    let (version, words) = text::parse_program(source).wrap_err("failed to assemble shader")?;

    Container::with_code(version.fourcc(), container::join_code(version, &words)).to_bytes()
}

/// Assembles text into a copy of `original`, replacing only its code chunk. Signature and
/// statistics chunks are kept as they are.
pub fn assemble_into(source: &str, original: &[u8]) -> Result<Vec<u8>> {
    let (version, words) = text::parse_program(source).wrap_err("failed to assemble shader")?;

    let mut container = Container::parse(original).wrap_err("original bytecode is not a valid container")?;
    let (original_version, _) = code_of(&container)?;

    ensure!(
        original_version.stage == version.stage,
        "assembly is for {} but the original shader is {}",
        version,
        original_version
    );

    container.replace_code(container::join_code(version, &words))?;
    container.to_bytes()
}

/// Checks the container structure and checksum.
pub fn validate(bytecode: &[u8]) -> Result<()> {
    let container = Container::parse(bytecode)?;
    ensure!(checksum::validate(bytecode), "container checksum does not match its contents");

    code_of(&container)?;
    Ok(())
}

/// Reads the shader version, if the container is readable.
pub fn shader_version(bytecode: &[u8]) -> Option<ShaderVersion> {
    container::container_version(bytecode)
}

/// Lists the constant buffers, samplers and resources a shader declares.
pub fn declared_bindings(bytecode: &[u8]) -> Result<Vec<Binding>> {
    let container = Container::parse(bytecode)?;
    let (_, words) = code_of(&container)?;

    Ok(bindings::collect(&tokens::decode_stream(&words)))
}
